use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::Instrument as _;

use crate::ProxyState;
use crate::client::RdpClient;
use crate::task::ChildTask;
use crate::utils;

pub struct ProxyListener {
    addr: SocketAddr,
    listener: TcpListener,
    state: ProxyState,
}

impl ProxyListener {
    pub fn init_and_bind(state: ProxyState) -> anyhow::Result<Self> {
        let bind_addr = state.conf.listen;

        let socket = if bind_addr.is_ipv4() {
            TcpSocket::new_v4().context("failed to create IPv4 TCP socket")?
        } else {
            TcpSocket::new_v6().context("failed to create IPv6 TCP socket")?
        };
        socket.bind(bind_addr).context("failed to bind TCP socket")?;

        let listener = socket
            .listen(64)
            .context("failed to listen with the bound TCP socket")?;

        // Not necessarily `bind_addr`: the port may have been ephemeral.
        let addr = listener.local_addr().context("failed to read bound address")?;

        info!("Listening on tcp://{addr}");

        Ok(Self { addr, listener, state })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[instrument("listener", skip(self), fields(port = self.addr.port()))]
    pub async fn run(self) -> anyhow::Result<()> {
        loop {
            match self.listener.accept().await.context("failed to accept connection") {
                Ok((stream, peer_addr)) => {
                    let state = self.state.clone();

                    let fut = async move {
                        if let Err(e) = handle_tcp_peer(stream, state, peer_addr).await {
                            if utils::is_benign_disconnect(&e) {
                                debug!(error = format!("{e:#}"), "Peer went away");
                            } else {
                                warn!(error = format!("{e:#}"), "Connection failure");
                            }
                        }
                    }
                    .instrument(info_span!("rdp", client = %peer_addr));

                    ChildTask::spawn(fut).detach();
                }
                Err(e) => error!(error = format!("{e:#}"), "TCP listener failure"),
            }
        }
    }
}

async fn handle_tcp_peer(stream: TcpStream, state: ProxyState, peer_addr: SocketAddr) -> anyhow::Result<()> {
    if let Err(e) = utils::apply_socket_options(&stream) {
        error!("socket options on accepted TcpStream failed: {e}");
    }

    RdpClient::builder()
        .conf(Arc::clone(&state.conf))
        .client_stream(stream)
        .client_addr(peer_addr)
        .authorization(Arc::clone(&state.authorization))
        .engine(Arc::clone(&state.engine))
        .build()
        .serve()
        .await
}
