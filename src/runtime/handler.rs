//! Connection handlers for the mio backend.
//!
//! Readiness-based model: poll tells us when sockets are ready, then we
//! perform non-blocking accept/read/write syscalls. mio is edge-triggered,
//! so every handler drains its socket until `WouldBlock`.
//!
//! Each read of up to `read_chunk_size` bytes is one command and gets one
//! response. There is no buffering across reads, so commands sent
//! back-to-back may arrive in the same chunk and be treated as one.

use super::event_loop::{Context, Handler, HandlerError};
use crate::commands;
use bytes::{Buf, BytesMut};
use mio::event::Source;
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Registry, Token};
use socket2::SockRef;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use tracing::{debug, error, info, warn};

/// Response sent when a request is not valid UTF-8.
pub const DECODE_ERROR: &str = "Invalid request: not valid UTF-8";

/// Reads served per readiness event before the connection yields to others.
pub const MAX_READS_PER_EVENT: usize = 32;

/// Anything the server registers with the event loop.
pub enum Endpoint {
    Acceptor(Acceptor),
    Reader(ConnectionReader),
}

impl Handler for Endpoint {
    fn on_ready(&mut self, token: Token, ctx: &mut Context<Self>) -> Result<(), HandlerError> {
        match self {
            Endpoint::Acceptor(acceptor) => acceptor.on_ready(ctx),
            Endpoint::Reader(reader) => reader.on_ready(token, ctx),
        }
    }
}

impl Source for Endpoint {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        match self {
            Endpoint::Acceptor(a) => a.listener.register(registry, token, interest),
            Endpoint::Reader(r) => r.stream.register(registry, token, interest),
        }
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        match self {
            Endpoint::Acceptor(a) => a.listener.reregister(registry, token, interest),
            Endpoint::Reader(r) => r.stream.reregister(registry, token, interest),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Endpoint::Acceptor(a) => a.listener.deregister(registry),
            Endpoint::Reader(r) => r.stream.deregister(registry),
        }
    }
}

/// Accepts connections on the listening socket.
pub struct Acceptor {
    listener: TcpListener,
    read_chunk_size: usize,
    send_buffer_size: Option<usize>,
}

impl Acceptor {
    pub fn new(listener: TcpListener, read_chunk_size: usize) -> Self {
        Self {
            listener,
            read_chunk_size,
            send_buffer_size: None,
        }
    }

    /// Set SO_SNDBUF on every accepted connection.
    pub fn with_send_buffer_size(mut self, size: Option<usize>) -> Self {
        self.send_buffer_size = size;
        self
    }

    fn on_ready(&mut self, ctx: &mut Context<Endpoint>) -> Result<(), HandlerError> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    info!(peer = %peer, "Accepted connection");
                    if let Some(size) = self.send_buffer_size {
                        if let Err(e) = SockRef::from(&stream).set_send_buffer_size(size) {
                            warn!(peer = %peer, error = %e, "Failed to set send buffer size");
                        }
                    }
                    let reader = ConnectionReader::new(stream, peer, self.read_chunk_size);
                    ctx.register(Endpoint::Reader(reader), Interest::READABLE);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if is_retryable_accept_error(e) => {
                    debug!(error = %e, "Accept interrupted, retrying");
                }
                Err(ref e) if is_resource_exhaustion(e) => {
                    // Leave the backlog alone; the next connection re-triggers us
                    error!(error = %e, "Accept error");
                    return Ok(());
                }
                Err(e) => return Err(HandlerError::Accept(e)),
            }
        }
    }
}

/// The peer gave up before we accepted, or a signal interrupted us.
fn is_retryable_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
    )
}

fn is_resource_exhaustion(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS) | Some(libc::ENOMEM)
    )
}

/// Services one accepted client.
pub struct ConnectionReader {
    stream: TcpStream,
    peer: SocketAddr,
    read_buf: Vec<u8>,
    /// Response bytes the socket has not taken yet.
    pending: BytesMut,
}

impl ConnectionReader {
    pub fn new(stream: TcpStream, peer: SocketAddr, read_chunk_size: usize) -> Self {
        Self {
            stream,
            peer,
            read_buf: vec![0; read_chunk_size],
            pending: BytesMut::new(),
        }
    }

    fn on_ready(&mut self, token: Token, ctx: &mut Context<Endpoint>) -> Result<(), HandlerError> {
        if !self.pending.is_empty() {
            self.flush()?;
            if !self.pending.is_empty() {
                // Still blocked on the peer; wait for the next writable event
                return Ok(());
            }
            ctx.reregister(token, Interest::READABLE);
        }

        let mut reads = 0;
        loop {
            if reads == MAX_READS_PER_EVENT {
                // Edge-triggered: re-arm so the rest is reported next poll
                ctx.reregister(token, Interest::READABLE);
                return Ok(());
            }
            reads += 1;

            let n = match self.stream.read(&mut self.read_buf) {
                Ok(0) => {
                    info!(token = token.0, peer = %self.peer, "Closing connection");
                    ctx.unregister(token);
                    return Ok(());
                }
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(HandlerError::Read(e)),
            };

            let response = self.respond(n);
            self.pending.extend_from_slice(response.as_bytes());
            self.flush()?;

            if !self.pending.is_empty() {
                // Stop reading until the peer drains what we owe it
                ctx.reregister(token, Interest::READABLE | Interest::WRITABLE);
                return Ok(());
            }
        }
    }

    /// Build the response for the first `n` bytes of the read buffer.
    fn respond(&self, n: usize) -> String {
        match std::str::from_utf8(&self.read_buf[..n]) {
            Ok(text) => {
                let command = strip_line_ending(text);
                debug!(peer = %self.peer, command, "Handling command");
                commands::handle(command)
            }
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "Request is not valid UTF-8");
                DECODE_ERROR.to_string()
            }
        }
    }

    /// Write as much of `pending` as the socket accepts.
    fn flush(&mut self) -> Result<(), HandlerError> {
        while !self.pending.is_empty() {
            match self.stream.write(&self.pending) {
                Ok(0) => {
                    return Err(HandlerError::Write(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "write returned 0",
                    )));
                }
                Ok(n) => self.pending.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(HandlerError::Write(e)),
            }
        }
        Ok(())
    }
}

/// Drop a single trailing `\n` or `\r\n`, as sent by line-oriented clients.
fn strip_line_ending(text: &str) -> &str {
    match text.strip_suffix('\n') {
        Some(line) => line.strip_suffix('\r').unwrap_or(line),
        None => text,
    }
}
