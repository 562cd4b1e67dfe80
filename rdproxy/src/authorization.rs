//! Client for the external authorization service resolving redirection
//! tokens into upstream targets.

use std::net::IpAddr;

use anyhow::Context as _;
use serde::Deserialize;
use url::Url;

/// Where a redirected session must be spliced to.
///
/// Produced at most once per connection; immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectTarget {
    pub ip: IpAddr,
    pub port: u16,
    pub username: Option<String>,
}

#[derive(Deserialize)]
struct AuthorizationResponse {
    status: String,
    ip: Option<String>,
    port: Option<u16>,
    username: Option<String>,
}

pub struct AuthorizationClient {
    endpoint: Url,
    client: reqwest::Client,
}

impl AuthorizationClient {
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            client: reqwest::Client::new(),
        }
    }

    /// Resolves a redirection token with a single request/response round
    /// trip. Every failure cause collapses into one `Err`: name resolution,
    /// connect, transport, a non-JSON body, a denied token or a nominally-ok
    /// response missing `ip`/`port`. Never retried at this layer.
    pub async fn resolve(&self, token: &str) -> anyhow::Result<RedirectTarget> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&serde_json::json!({ "token": token }))
            .send()
            .await
            .context("authorization request failed")?;

        let body: AuthorizationResponse = response
            .json()
            .await
            .context("malformed authorization response")?;

        if body.status != "ok" {
            anyhow::bail!("authorization denied (status: {})", body.status);
        }

        let ip = body
            .ip
            .context("authorization response is missing `ip`")?
            .parse::<IpAddr>()
            .context("authorization response carries an invalid `ip`")?;

        let port = body.port.context("authorization response is missing `port`")?;

        Ok(RedirectTarget {
            ip,
            port,
            username: body.username,
        })
    }
}
