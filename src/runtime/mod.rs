//! Readiness-based runtime.
//!
//! Layers, leaves first:
//! - `Selector`: OS readiness primitive (mio: epoll on Linux, kqueue on macOS)
//! - `DispatchTable`: token -> registered handle, on top of a selector
//! - `EventLoop`: polls the table and dispatches to `Handler`s
//! - `Endpoint`: the server's handlers (listener acceptor, connection reader)

mod dispatch;
mod event_loop;
mod handler;
mod selector;

pub use dispatch::{DispatchError, DispatchTable};
pub use event_loop::{Context, EventLoop, Handler, HandlerError, LoopError, LoopState, StopHandle};
pub use handler::{Acceptor, ConnectionReader, Endpoint, DECODE_ERROR, MAX_READS_PER_EVENT};
pub use selector::{MioSelector, Selector, WAKER_TOKEN};
