//! Single-threaded readiness event loop.
//!
//! Each iteration polls the dispatch table once and calls `on_ready` for
//! every ready token, in the order the selector reported them. Handlers do
//! not touch the table directly. They queue register/reregister/unregister
//! operations on a [`Context`], which the loop applies right after the
//! handler returns and before the next ready token is dispatched.
//!
//! ## Lifecycle
//!
//! ```text
//! Running --stop()--> StopRequested --drain--> Stopped
//! ```
//!
//! The stop flag is checked once per iteration. `StopHandle::stop` also
//! wakes a blocked poll when the selector supports it, and the poll timeout
//! bounds the latency when it does not.

use super::dispatch::{DispatchError, DispatchTable};
use super::selector::Selector;
use mio::{Interest, Token, Waker};
use std::collections::HashSet;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Something the loop can dispatch readiness to.
pub trait Handler: Sized {
    fn on_ready(&mut self, token: Token, ctx: &mut Context<Self>) -> Result<(), HandlerError>;
}

/// Error returned by a handler.
#[derive(Debug)]
pub enum HandlerError {
    /// Accepting on the listener failed. There is no connection to
    /// isolate this to, so it stops the loop.
    Accept(io::Error),
    /// Reading from a connection failed.
    Read(io::Error),
    /// Writing to a connection failed.
    Write(io::Error),
}

impl HandlerError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, HandlerError::Accept(_))
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerError::Accept(e) => write!(f, "accept failed: {}", e),
            HandlerError::Read(e) => write!(f, "read failed: {}", e),
            HandlerError::Write(e) => write!(f, "write failed: {}", e),
        }
    }
}

impl std::error::Error for HandlerError {}

/// Error that ends [`EventLoop::run`].
#[derive(Debug)]
pub enum LoopError {
    Poll(io::Error),
    Handler(HandlerError),
}

impl fmt::Display for LoopError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopError::Poll(e) => write!(f, "poll failed: {}", e),
            LoopError::Handler(e) => write!(f, "handler failed: {}", e),
        }
    }
}

impl std::error::Error for LoopError {}

/// Table operation queued by a handler.
enum Op<H> {
    Register(H, Interest),
    Reregister(Token, Interest),
    Unregister(Token),
}

/// Operations a handler wants applied to the dispatch table.
pub struct Context<H> {
    ops: Vec<Op<H>>,
}

impl<H> Context<H> {
    fn new() -> Self {
        Self { ops: Vec::new() }
    }

    /// Register a new handle.
    pub fn register(&mut self, handle: H, interest: Interest) {
        self.ops.push(Op::Register(handle, interest));
    }

    /// Replace the interest of a registered handle.
    pub fn reregister(&mut self, token: Token, interest: Interest) {
        self.ops.push(Op::Reregister(token, interest));
    }

    /// Unregister and close a handle.
    pub fn unregister(&mut self, token: Token) {
        self.ops.push(Op::Unregister(token));
    }
}

/// Loop lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    StopRequested,
    Stopped,
}

/// Cloneable, thread-safe stop signal for a loop.
#[derive(Clone)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
    waker: Option<Arc<Waker>>,
}

impl StopHandle {
    fn new(waker: Option<Arc<Waker>>) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            waker,
        }
    }

    /// Ask the loop to stop after the current iteration.
    ///
    /// Returns whether a stop had already been requested.
    pub fn stop(&self) -> bool {
        let already = self.flag.swap(true, Ordering::SeqCst);
        if let Some(waker) = &self.waker {
            if let Err(e) = waker.wake() {
                warn!(error = %e, "Failed to wake event loop");
            }
        }
        already
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Readiness event loop over a dispatch table.
pub struct EventLoop<H, S> {
    table: DispatchTable<H, S>,
    ctx: Context<H>,
    ready: Vec<Token>,
    /// Tokens unregistered during the current batch.
    retired: HashSet<Token>,
    poll_timeout: Option<Duration>,
    stop: StopHandle,
    state: LoopState,
}

impl<H: Handler, S: Selector<H>> EventLoop<H, S> {
    /// Create a loop. `poll_timeout` of `None` blocks until readiness.
    pub fn new(selector: S, poll_timeout: Option<Duration>) -> Self {
        let table = DispatchTable::new(selector);
        let stop = StopHandle::new(table.selector().waker());
        Self {
            table,
            ctx: Context::new(),
            ready: Vec::new(),
            retired: HashSet::new(),
            poll_timeout,
            stop,
            state: LoopState::Running,
        }
    }

    /// Register a handle from outside any handler (e.g. the listener).
    pub fn register(&mut self, handle: H, interest: Interest) -> Result<Token, DispatchError> {
        self.table.register(handle, interest)
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn table(&self) -> &DispatchTable<H, S> {
        &self.table
    }

    /// Run until a stop is requested or a fatal error occurs.
    ///
    /// Either way, every remaining registration is closed before returning.
    pub fn run(&mut self) -> Result<(), LoopError> {
        if self.state == LoopState::Stopped {
            return Ok(());
        }

        debug!(registrations = self.table.len(), "Event loop running");

        loop {
            if self.stop.is_stopped() {
                self.state = LoopState::StopRequested;
                break;
            }

            if let Err(e) = self.run_iteration() {
                error!(error = %e, "Event loop failed");
                self.shutdown();
                return Err(e);
            }
        }

        self.shutdown();
        Ok(())
    }

    /// Poll once and dispatch every ready token.
    ///
    /// Returns how many handlers were invoked.
    pub fn run_iteration(&mut self) -> Result<usize, LoopError> {
        let mut ready = std::mem::take(&mut self.ready);
        if let Err(e) = self.table.poll(&mut ready, self.poll_timeout) {
            self.ready = ready;
            return Err(LoopError::Poll(e));
        }

        self.retired.clear();
        let mut dispatched = 0;
        let mut outcome = Ok(());

        for &token in &ready {
            // Closed earlier in this batch, possibly with its slot reused
            if self.retired.contains(&token) {
                continue;
            }
            let Some(handle) = self.table.get_mut(token) else {
                continue;
            };

            let result = handle.on_ready(token, &mut self.ctx);
            dispatched += 1;
            self.apply_context();

            if let Err(e) = result {
                if e.is_fatal() {
                    outcome = Err(LoopError::Handler(e));
                    break;
                }
                warn!(token = token.0, error = %e, "Handler failed, closing");
                self.close(token);
            }
        }

        self.ready = ready;
        outcome.map(|()| dispatched)
    }

    fn apply_context(&mut self) {
        let mut ops = std::mem::take(&mut self.ctx.ops);
        for op in ops.drain(..) {
            match op {
                Op::Register(handle, interest) => match self.table.register(handle, interest) {
                    Ok(token) => trace!(token = token.0, "Registered"),
                    Err(e) => warn!(error = %e, "Failed to register handle"),
                },
                Op::Reregister(token, interest) => match self.table.reregister(token, interest) {
                    Ok(()) => {}
                    Err(DispatchError::NotRegistered(_)) => {
                        debug!(token = token.0, "Reregister of closed handle ignored")
                    }
                    Err(e) => {
                        warn!(token = token.0, error = %e, "Reregister failed, closing");
                        self.close(token);
                    }
                },
                Op::Unregister(token) => self.close(token),
            }
        }
        // Keep the allocation
        self.ctx.ops = ops;
    }

    /// Unregister and drop a handle. Closing twice is harmless.
    fn close(&mut self, token: Token) {
        self.retired.insert(token);
        match self.table.unregister(token) {
            Ok(handle) => {
                drop(handle);
                trace!(token = token.0, "Unregistered");
            }
            Err(e) => debug!(token = token.0, error = %e, "Unregister ignored"),
        }
    }

    fn shutdown(&mut self) {
        let closed = self.table.drain().len();
        self.state = LoopState::Stopped;
        info!(closed, "Event loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::selector::fake::FakeSelector;
    use std::cell::RefCell;
    use std::rc::Rc;

    type Calls = Rc<RefCell<Vec<(&'static str, Token)>>>;

    enum Action {
        Nothing,
        CloseSelf,
        Close(Token),
        Spawn(&'static str),
        Reregister(Interest),
        Fail,
        FailFatal,
        Stop(StopHandle),
    }

    struct Scripted {
        name: &'static str,
        calls: Calls,
        action: Action,
    }

    impl Scripted {
        fn new(name: &'static str, calls: &Calls, action: Action) -> Self {
            Self {
                name,
                calls: Rc::clone(calls),
                action,
            }
        }
    }

    impl Handler for Scripted {
        fn on_ready(&mut self, token: Token, ctx: &mut Context<Self>) -> Result<(), HandlerError> {
            self.calls.borrow_mut().push((self.name, token));
            match &self.action {
                Action::Nothing => {}
                Action::CloseSelf => ctx.unregister(token),
                Action::Close(other) => ctx.unregister(*other),
                Action::Spawn(name) => {
                    let child = Scripted::new(*name, &self.calls, Action::Nothing);
                    ctx.register(child, Interest::READABLE)
                }
                Action::Reregister(interest) => ctx.reregister(token, *interest),
                Action::Fail => {
                    return Err(HandlerError::Read(io::Error::new(
                        io::ErrorKind::ConnectionReset,
                        "reset",
                    )))
                }
                Action::FailFatal => {
                    return Err(HandlerError::Accept(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "bad listener",
                    )))
                }
                Action::Stop(stop) => {
                    stop.stop();
                }
            }
            Ok(())
        }
    }

    type TestLoop = EventLoop<Scripted, FakeSelector>;

    fn add(el: &mut TestLoop, name: &'static str, calls: &Calls, action: Action) -> Token {
        el.register(Scripted::new(name, calls, action), Interest::READABLE)
            .unwrap()
    }

    fn event_loop() -> (TestLoop, FakeSelector, Calls) {
        let selector = FakeSelector::new();
        let event_loop = EventLoop::new(selector.clone(), Some(Duration::from_millis(1)));
        (event_loop, selector, Calls::default())
    }

    #[test]
    fn test_dispatches_every_ready_token() {
        let (mut el, selector, calls) = event_loop();
        let a = add(&mut el, "a", &calls, Action::Nothing);
        let b = add(&mut el, "b", &calls, Action::Nothing);

        selector.push_ready(&[b, a]);
        assert_eq!(el.run_iteration().unwrap(), 2);
        assert_eq!(*calls.borrow(), vec![("b", b), ("a", a)]);

        // Nothing ready, nothing dispatched
        assert_eq!(el.run_iteration().unwrap(), 0);
    }

    #[test]
    fn test_closed_handle_never_invoked_again() {
        let (mut el, selector, calls) = event_loop();
        let a = add(&mut el, "a", &calls, Action::CloseSelf);

        selector.push_ready(&[a]);
        el.run_iteration().unwrap();
        assert!(!el.table().contains(a));

        selector.push_ready(&[a]);
        selector.push_ready(&[a]);
        el.run_iteration().unwrap();
        el.run_iteration().unwrap();
        assert_eq!(calls.borrow().len(), 1);
    }

    #[test]
    fn test_unregister_later_in_same_batch() {
        let (mut el, selector, calls) = event_loop();
        // b is registered second, so it gets token 1
        let a = add(&mut el, "a", &calls, Action::Close(Token(1)));
        let b = add(&mut el, "b", &calls, Action::Nothing);
        assert_eq!(b, Token(1));

        selector.push_ready(&[a, b]);
        assert_eq!(el.run_iteration().unwrap(), 1);
        assert_eq!(*calls.borrow(), vec![("a", a)]);
        assert_eq!(el.table().len(), 1);
    }

    #[test]
    fn test_reused_slot_skipped_in_same_batch() {
        let (mut el, selector, calls) = event_loop();

        // a closes b, then spawner registers c, which lands in b's old slot
        let a = add(&mut el, "a", &calls, Action::Close(Token(1)));
        let b = add(&mut el, "b", &calls, Action::Nothing);

        let spawner = add(&mut el, "spawner", &calls, Action::Spawn("c"));

        selector.push_ready(&[a, spawner, b]);
        el.run_iteration().unwrap();

        // c took slot 1 but must not see b's stale readiness
        assert!(el.table().contains(b));
        assert_eq!(*calls.borrow(), vec![("a", a), ("spawner", spawner)]);

        selector.push_ready(&[b]);
        el.run_iteration().unwrap();
        assert_eq!(calls.borrow().last(), Some(&("c", b)));
    }

    #[test]
    fn test_spawned_handle_is_registered() {
        let (mut el, selector, calls) = event_loop();
        let a = add(&mut el, "a", &calls, Action::Spawn("child"));

        selector.push_ready(&[a]);
        el.run_iteration().unwrap();
        assert_eq!(el.table().len(), 2);
        assert_eq!(selector.state().registrations, 2);
    }

    #[test]
    fn test_reregister_through_context() {
        let (mut el, selector, calls) = event_loop();
        let both = Interest::READABLE | Interest::WRITABLE;
        let a = add(&mut el, "a", &calls, Action::Reregister(both));

        selector.push_ready(&[a]);
        el.run_iteration().unwrap();
        assert_eq!(el.table().interest(a), Some(both));
    }

    #[test]
    fn test_handler_error_closes_only_that_handle() {
        let (mut el, selector, calls) = event_loop();
        let bad = add(&mut el, "bad", &calls, Action::Fail);
        let good = add(&mut el, "good", &calls, Action::Nothing);

        selector.push_ready(&[bad, good]);
        assert_eq!(el.run_iteration().unwrap(), 2);
        assert!(!el.table().contains(bad));
        assert!(el.table().contains(good));
        assert_eq!(el.state(), LoopState::Running);
    }

    #[test]
    fn test_fatal_error_propagates() {
        let (mut el, selector, calls) = event_loop();
        let a = add(&mut el, "acceptor", &calls, Action::FailFatal);

        selector.push_ready(&[a]);
        match el.run() {
            Err(LoopError::Handler(e)) => assert!(e.is_fatal()),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(el.state(), LoopState::Stopped);
        assert!(el.table().is_empty());
    }

    #[test]
    fn test_stop_from_handler() {
        let (mut el, selector, calls) = event_loop();
        let stop = el.stop_handle();
        let a = add(&mut el, "a", &calls, Action::Stop(stop));
        add(&mut el, "b", &calls, Action::Nothing);

        selector.push_ready(&[a]);
        el.run().unwrap();

        assert_eq!(el.state(), LoopState::Stopped);
        assert!(el.table().is_empty());
        assert_eq!(selector.state().deregistrations, 2);
        assert_eq!(calls.borrow().len(), 1);
    }

    #[test]
    fn test_stop_reports_previous_request() {
        let (el, _selector, _calls) = event_loop();
        let stop = el.stop_handle();
        assert!(!stop.is_stopped());
        assert!(!stop.stop());
        assert!(stop.is_stopped());

        // Clones share the flag
        assert!(el.stop_handle().stop());
    }

    #[test]
    fn test_stop_before_run() {
        let (mut el, selector, _calls) = event_loop();
        el.stop_handle().stop();
        el.run().unwrap();
        assert_eq!(el.state(), LoopState::Stopped);
        assert_eq!(selector.state().selects, 0);

        // Running a stopped loop is a no-op
        el.run().unwrap();
        assert_eq!(selector.state().selects, 0);
    }
}
