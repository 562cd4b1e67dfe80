use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::TcpStream;

/// Collaborator taking over connections that did not ask for redirection.
///
/// The socket is handed over with the connection request still unconsumed in
/// its receive buffer; after the handoff the proxy makes no further guarantee
/// about it.
#[async_trait]
pub trait RdpEngine: Send + Sync {
    async fn take_over(&self, stream: TcpStream, peer_addr: SocketAddr) -> anyhow::Result<()>;
}

/// Stand-in used when no engine is linked into the build: this proxy serves
/// redirected sessions only, everything else is dropped.
pub struct NoEngine;

#[async_trait]
impl RdpEngine for NoEngine {
    async fn take_over(&self, stream: TcpStream, peer_addr: SocketAddr) -> anyhow::Result<()> {
        info!(peer = %peer_addr, "no RDP engine available, dropping non-redirected connection");
        drop(stream);
        Ok(())
    }
}
