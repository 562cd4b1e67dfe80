//! Per-connection orchestration, from the accepted socket to either the
//! relay or the engine handoff.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::TcpStream;
use typed_builder::TypedBuilder;

use crate::authorization::AuthorizationClient;
use crate::config::Conf;
use crate::engine::RdpEngine;
use crate::handshake::{self, Classification};
use crate::relay::{self, RelaySession};
use crate::utils;

#[derive(TypedBuilder)]
pub struct RdpClient {
    conf: Arc<Conf>,
    client_stream: TcpStream,
    client_addr: SocketAddr,
    authorization: Arc<AuthorizationClient>,
    engine: Arc<dyn RdpEngine>,
}

impl RdpClient {
    /// Drives one connection to completion.
    ///
    /// Any error along the way tears the whole connection down: the sockets
    /// owned here are dropped on the early return, and nothing is ever
    /// written back to an unclassified peer.
    pub async fn serve(self) -> anyhow::Result<()> {
        let Self {
            conf,
            mut client_stream,
            client_addr,
            authorization,
            engine,
        } = self;

        let classification = handshake::classify(&client_stream, conf.max_connection_request_size)
            .await
            .context("classification")?;

        let (token, pdu_len, post_cookie_offset) = match classification {
            Classification::Engine { .. } => {
                debug!("no redirection requested, handing the connection over");
                return engine
                    .take_over(client_stream, client_addr)
                    .await
                    .context("engine handoff");
            }
            Classification::Redirect {
                token,
                pdu_len,
                post_cookie_offset,
            } => (token, pdu_len, post_cookie_offset),
        };

        let target = authorization
            .resolve(&token)
            .await
            .context("redirection token resolution")?;

        info!(
            ip = %target.ip,
            port = target.port,
            username = target.username.as_deref().unwrap_or_default(),
            "redirection token resolved",
        );

        let mut upstream = TcpStream::connect((target.ip, target.port))
            .await
            .context("upstream connect")?;

        if let Err(e) = utils::apply_socket_options(&upstream) {
            error!("socket options on upstream TcpStream failed: {e}");
        }

        if conf.strip_cookie_on_forward {
            // Consume the peeked connection request and forward the
            // cookie-less rewrite; the relay takes over from the first
            // negotiation byte.
            let mut pdu = vec![0u8; pdu_len];
            client_stream
                .read_exact(&mut pdu)
                .await
                .context("consume connection request")?;

            let rewritten = x224_proto::strip_cookie(&pdu, post_cookie_offset)
                .context("strip redirection cookie")?;

            upstream
                .write_all(&rewritten)
                .await
                .context("forward rewritten connection request")?;
        }

        debug!("relaying");

        let session = RelaySession::new();
        relay::run_pumps(Arc::clone(&session), client_stream, upstream).await;

        info!("relay ended");

        Ok(())
    }
}
