use std::io;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;

const KEEPALIVE_IDLE: Duration = Duration::from_secs(2);

/// Options applied to both ends of a proxied connection: RDP traffic is
/// latency-sensitive, and half-dead peers must not pin sessions forever.
pub fn apply_socket_options(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;

    let sock = SockRef::from(stream);
    sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(KEEPALIVE_IDLE))
}

/// Checks if an error represents a benign client disconnect.
///
/// Walks the error chain and returns true if any cause is a `std::io::Error`
/// with kind `BrokenPipe`, `ConnectionReset`, or `UnexpectedEof`.
pub fn is_benign_disconnect(err: &anyhow::Error) -> bool {
    use std::io::ErrorKind::{BrokenPipe, ConnectionReset, UnexpectedEof};

    err.chain().any(|cause| {
        if let Some(ioe) = cause.downcast_ref::<io::Error>() {
            return matches!(ioe.kind(), BrokenPipe | ConnectionReset | UnexpectedEof);
        }
        false
    })
}
