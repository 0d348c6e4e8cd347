//! TCP command server.
//!
//! Binds the listening socket, registers it with a mio-backed event loop,
//! and runs the loop until stopped.

use crate::config::Config;
use crate::runtime::{Acceptor, Endpoint, EventLoop, LoopError, LoopState, MioSelector, StopHandle};
use mio::net::TcpListener;
use mio::{Interest, Token};
use std::io;
use std::net::SocketAddr;
use tracing::info;

/// Server instance
pub struct Server {
    event_loop: EventLoop<Endpoint, MioSelector>,
    listener_token: Token,
    local_addr: SocketAddr,
}

impl Server {
    /// Bind the listener and set up the event loop.
    pub fn bind(config: &Config) -> io::Result<Self> {
        let listener = TcpListener::from_std(create_listener(config.listen, config.backlog)?);
        let local_addr = listener.local_addr()?;

        let selector = MioSelector::new(config.events_capacity)?;
        let mut event_loop = EventLoop::new(selector, Some(config.poll_timeout));

        let acceptor = Acceptor::new(listener, config.read_chunk_size)
            .with_send_buffer_size(config.send_buffer_size);
        let listener_token = event_loop.register(Endpoint::Acceptor(acceptor), Interest::READABLE)?;

        info!(
            address = %local_addr,
            port = local_addr.port(),
            backlog = config.backlog,
            "Server started"
        );

        Ok(Server {
            event_loop,
            listener_token,
            local_addr,
        })
    }

    /// Address the listener is bound to (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.event_loop.stop_handle()
    }

    pub fn state(&self) -> LoopState {
        self.event_loop.state()
    }

    /// Number of open client connections.
    pub fn connection_count(&self) -> usize {
        let table = self.event_loop.table();
        table.len() - usize::from(table.contains(self.listener_token))
    }

    /// Current interest of every client connection.
    pub fn connection_interests(&self) -> Vec<Interest> {
        self.event_loop
            .table()
            .interests()
            .filter(|(token, _)| *token != self.listener_token)
            .map(|(_, interest)| interest)
            .collect()
    }

    /// Poll once and dispatch whatever is ready.
    pub fn run_iteration(&mut self) -> Result<usize, LoopError> {
        self.event_loop.run_iteration()
    }

    /// Run until the stop handle fires or accepting fails.
    pub fn run(&mut self) -> Result<(), LoopError> {
        let result = self.event_loop.run();
        info!(address = %self.local_addr, "Server stopped");
        result
    }
}

/// Create a non-blocking TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_listener_is_nonblocking() {
        let listener = create_listener("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let err = listener.accept().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_reuse_address_allows_rebind() {
        let first = create_listener("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let addr = first.local_addr().unwrap();

        // Leave a connection in TIME_WAIT on the port, then rebind
        let client = std::net::TcpStream::connect(addr).unwrap();
        drop(client);
        drop(first);

        create_listener(addr, 16).unwrap();
    }
}
