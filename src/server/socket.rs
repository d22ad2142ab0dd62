//! TCP listener setup

use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::NetworkError;

const LISTEN_BACKLOG: i32 = 1024;

/// Bind a non-blocking TCP listener for the relay.
///
/// Address reuse allows a quick restart, TCP keepalive catches peers that
/// vanished without closing and Nagle is disabled for small audio frames.
pub fn bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener, NetworkError> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(30))
        .with_interval(Duration::from_secs(10));

    socket
        .set_reuse_address(true)
        .and_then(|_| socket.set_nodelay(true))
        .and_then(|_| socket.set_tcp_keepalive(&keepalive))
        .and_then(|_| socket.set_nonblocking(true))
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    socket
        .bind(&addr.into())
        .and_then(|_| socket.listen(LISTEN_BACKLOG))
        .map_err(|e| NetworkError::BindFailed(format!("{}: {}", addr, e)))?;

    let std_listener: std::net::TcpListener = socket.into();
    tokio::net::TcpListener::from_std(std_listener)
        .map_err(|e| NetworkError::BindFailed(e.to_string()))
}
