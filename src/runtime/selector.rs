//! Readiness selector.
//!
//! The dispatch table never talks to the OS directly. It goes through a
//! [`Selector`], which registers handles and reports which tokens became
//! ready. `MioSelector` is the production backend (epoll on Linux, kqueue
//! on macOS). Tests script readiness with a fake.

use mio::event::Source;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Token reserved for the shutdown waker. Slab keys never reach it.
pub const WAKER_TOKEN: Token = Token(usize::MAX);

/// OS readiness primitive used by the dispatch table.
pub trait Selector<H> {
    /// Start watching `handle` for `interest`, reporting it as `token`.
    fn register(&mut self, handle: &mut H, token: Token, interest: Interest) -> io::Result<()>;

    /// Replace the interest of an already registered handle.
    fn reregister(&mut self, handle: &mut H, token: Token, interest: Interest) -> io::Result<()>;

    /// Stop watching `handle`.
    fn deregister(&mut self, handle: &mut H) -> io::Result<()>;

    /// Block until something is ready or `timeout` elapses, appending the
    /// ready tokens to `ready`.
    fn select(&mut self, ready: &mut Vec<Token>, timeout: Option<Duration>) -> io::Result<()>;

    /// Handle that interrupts a blocked `select` from another thread.
    fn waker(&self) -> Option<Arc<Waker>> {
        None
    }
}

/// mio-backed selector.
pub struct MioSelector {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
}

impl MioSelector {
    /// Create a selector fetching at most `events_capacity` events per poll.
    pub fn new(events_capacity: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        Ok(Self {
            poll,
            events: Events::with_capacity(events_capacity),
            waker,
        })
    }
}

impl<H: Source> Selector<H> for MioSelector {
    fn register(&mut self, handle: &mut H, token: Token, interest: Interest) -> io::Result<()> {
        self.poll.registry().register(handle, token, interest)
    }

    fn reregister(&mut self, handle: &mut H, token: Token, interest: Interest) -> io::Result<()> {
        self.poll.registry().reregister(handle, token, interest)
    }

    fn deregister(&mut self, handle: &mut H) -> io::Result<()> {
        self.poll.registry().deregister(handle)
    }

    fn select(&mut self, ready: &mut Vec<Token>, timeout: Option<Duration>) -> io::Result<()> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            // A signal landed mid-poll; the caller just polls again
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        ready.extend(
            self.events
                .iter()
                .map(|event| event.token())
                .filter(|&token| token != WAKER_TOKEN),
        );
        Ok(())
    }

    fn waker(&self) -> Option<Arc<Waker>> {
        Some(Arc::clone(&self.waker))
    }
}
