#[macro_use]
extern crate tracing;

pub mod authorization;
pub mod client;
pub mod config;
pub mod engine;
pub mod handshake;
pub mod listener;
pub mod log;
pub mod relay;
pub mod task;
pub mod utils;

use std::sync::Arc;

use crate::authorization::AuthorizationClient;
use crate::config::Conf;
use crate::engine::RdpEngine;

/// Read-only state shared by every connection.
#[derive(Clone)]
pub struct ProxyState {
    pub conf: Arc<Conf>,
    pub authorization: Arc<AuthorizationClient>,
    pub engine: Arc<dyn RdpEngine>,
}

impl ProxyState {
    pub fn new(conf: Arc<Conf>, engine: Arc<dyn RdpEngine>) -> Self {
        let authorization = Arc::new(AuthorizationClient::new(conf.authorization_url.clone()));

        Self {
            conf,
            authorization,
            engine,
        }
    }
}
