//! Text command protocol.
//!
//! A client sends one command per read and gets exactly one response back,
//! with no framing on either side:
//!
//! ```text
//! Request:  time
//! Response: Current UTC time: 2024-05-01 12:00:00.000000
//!
//! Request:  find sample.txt ./testdata
//! Response: File: sample.txt, Created: 2024-05-01 11:59:00.000000, Size: 42 bytes
//! ```
//!
//! `quit` only answers with a closing message. The connection stays open
//! until the client closes its side.

pub mod handler;
pub mod parser;

pub use handler::handle;
