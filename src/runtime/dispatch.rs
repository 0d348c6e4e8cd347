//! Dispatch table mapping tokens to registered handles.
//!
//! Each registered handle gets a stable [`Token`] (its slab key) that the
//! selector reports back on readiness. The table owns the handle for as
//! long as it is registered; unregistering hands it back, and dropping it
//! closes the underlying socket.

use super::selector::Selector;
use mio::{Interest, Token};
use slab::Slab;
use std::collections::HashSet;
use std::fmt;
use std::io;
use std::time::Duration;
use tracing::debug;

/// A single registration.
struct Registration<H> {
    handle: H,
    interest: Interest,
}

/// Errors from table operations.
#[derive(Debug)]
pub enum DispatchError {
    /// The token has no live registration. Safe to ignore on unregister.
    NotRegistered(Token),
    /// The selector rejected the operation.
    Io(io::Error),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::NotRegistered(token) => {
                write!(f, "token {} is not registered", token.0)
            }
            DispatchError::Io(e) => write!(f, "selector error: {}", e),
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<DispatchError> for io::Error {
    fn from(e: DispatchError) -> io::Error {
        match e {
            DispatchError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::NotFound, other.to_string()),
        }
    }
}

/// Registered handles plus the selector watching them.
///
/// Provides O(1) register, lookup, and unregister.
pub struct DispatchTable<H, S> {
    selector: S,
    entries: Slab<Registration<H>>,
}

impl<H, S: Selector<H>> DispatchTable<H, S> {
    /// Create an empty table on top of `selector`.
    pub fn new(selector: S) -> Self {
        Self {
            selector,
            entries: Slab::new(),
        }
    }

    /// Register a handle and return the token it will be reported under.
    ///
    /// The table takes ownership, so the same socket can never hold two
    /// entries. If the selector refuses the handle it is dropped.
    pub fn register(&mut self, mut handle: H, interest: Interest) -> Result<Token, DispatchError> {
        let entry = self.entries.vacant_entry();
        let token = Token(entry.key());
        self.selector
            .register(&mut handle, token, interest)
            .map_err(DispatchError::Io)?;
        entry.insert(Registration { handle, interest });
        Ok(token)
    }

    /// Replace the interest of an existing entry. Last registration wins.
    pub fn reregister(&mut self, token: Token, interest: Interest) -> Result<(), DispatchError> {
        let registration = self
            .entries
            .get_mut(token.0)
            .ok_or(DispatchError::NotRegistered(token))?;
        self.selector
            .reregister(&mut registration.handle, token, interest)
            .map_err(DispatchError::Io)?;
        registration.interest = interest;
        Ok(())
    }

    /// Remove an entry and return its handle.
    ///
    /// The entry is gone even if the selector fails to deregister; the
    /// OS drops the watch anyway once the socket closes.
    pub fn unregister(&mut self, token: Token) -> Result<H, DispatchError> {
        let mut registration = self
            .entries
            .try_remove(token.0)
            .ok_or(DispatchError::NotRegistered(token))?;
        if let Err(e) = self.selector.deregister(&mut registration.handle) {
            debug!(token = token.0, error = %e, "Deregister failed");
        }
        Ok(registration.handle)
    }

    /// Wait for readiness and fill `ready` with the ready tokens.
    ///
    /// Tokens the selector reports but the table no longer holds are
    /// dropped, as are duplicates. Order is otherwise the selector's.
    pub fn poll(&mut self, ready: &mut Vec<Token>, timeout: Option<Duration>) -> io::Result<()> {
        ready.clear();
        self.selector.select(ready, timeout)?;

        let entries = &self.entries;
        let mut seen = HashSet::with_capacity(ready.len());
        ready.retain(|token| entries.contains(token.0) && seen.insert(*token));
        Ok(())
    }

    /// Get a mutable reference to a registered handle.
    pub fn get_mut(&mut self, token: Token) -> Option<&mut H> {
        self.entries.get_mut(token.0).map(|r| &mut r.handle)
    }

    /// Interest currently registered for `token`.
    pub fn interest(&self, token: Token) -> Option<Interest> {
        self.entries.get(token.0).map(|r| r.interest)
    }

    /// Every registration with its current interest.
    pub fn interests(&self) -> impl Iterator<Item = (Token, Interest)> + '_ {
        self.entries.iter().map(|(key, r)| (Token(key), r.interest))
    }

    pub fn contains(&self, token: Token) -> bool {
        self.entries.contains(token.0)
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Unregister everything, returning the handles.
    pub fn drain(&mut self) -> Vec<(Token, H)> {
        let tokens: Vec<Token> = self.entries.iter().map(|(key, _)| Token(key)).collect();
        tokens
            .into_iter()
            .filter_map(|token| self.unregister(token).ok().map(|handle| (token, handle)))
            .collect()
    }

    pub fn selector(&self) -> &S {
        &self.selector
    }
}
