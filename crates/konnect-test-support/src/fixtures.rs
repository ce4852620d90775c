//! Test fixtures and environment helpers.

use std::net::{Ipv4Addr, SocketAddr, TcpListener};

/// Returns `true` if a loopback TCP listener can be bound for integration tests.
#[must_use]
pub fn loopback_available() -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).is_ok()
}

/// Address on the loopback interface that nothing is listening on.
///
/// The port is reserved by binding and immediately released, so connecting to it is
/// refused unless another process grabs it in between.
///
/// # Errors
///
/// Returns an error if no loopback port can be reserved.
pub fn closed_port() -> std::io::Result<SocketAddr> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    listener.local_addr()
}
