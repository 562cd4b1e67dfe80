use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use url::Url;

/// Generous cap for a connection request plus routing cookie.
pub const DEFAULT_MAX_CONNECTION_REQUEST_SIZE: usize = 8 * 1024;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerbosityProfile {
    /// The default profile, mostly info records.
    #[default]
    Default,
    /// Recommended profile for troubleshooting.
    Debug,
    /// Only show warnings and errors.
    Quiet,
    /// Show all traces.
    All,
}

impl VerbosityProfile {
    pub fn to_directives(self) -> &'static str {
        match self {
            VerbosityProfile::Default => "info",
            VerbosityProfile::Debug => "info,rdproxy=debug",
            VerbosityProfile::Quiet => "warn",
            VerbosityProfile::All => "trace",
        }
    }
}

/// Source-of-truth for the on-disk JSON configuration format.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "PascalCase")]
pub struct ConfFile {
    /// Address the proxy listens on, `<host>:<port>`.
    pub listen: String,
    /// Authorization service endpoint resolving redirection tokens.
    pub authorization_url: String,
    /// Biggest connection request accepted during classification, in bytes.
    pub max_connection_request_size: Option<usize>,
    /// Forward the cookie-stripped connection request to the upstream
    /// instead of the bytes originally transmitted by the client.
    pub strip_cookie_on_forward: Option<bool>,
    /// Worker threads for the async runtime. Defaults to one per core.
    pub worker_threads: Option<usize>,
    /// Path to a log file, or a directory to put rotated log files in.
    pub log_file: Option<Utf8PathBuf>,
    /// Verbosity profile used to generate log filtering directives.
    pub verbosity_profile: Option<VerbosityProfile>,
    /// Raw log filtering directives, overriding the verbosity profile.
    pub log_directive: Option<String>,
}

/// Runtime configuration, validated once at startup and shared by reference.
#[derive(Debug, Clone)]
pub struct Conf {
    pub listen: SocketAddr,
    pub authorization_url: Url,
    pub max_connection_request_size: usize,
    pub strip_cookie_on_forward: bool,
    pub worker_threads: Option<usize>,
    pub log_file: Option<Utf8PathBuf>,
    pub verbosity_profile: VerbosityProfile,
    pub log_directive: Option<String>,
}

impl Conf {
    pub fn from_file(path: &Utf8Path) -> anyhow::Result<Arc<Self>> {
        let file = File::open(path).with_context(|| format!("couldn't open {path}"))?;
        let conf_file: ConfFile =
            serde_json::from_reader(BufReader::new(file)).with_context(|| format!("invalid config file {path}"))?;
        Self::from_conf_file(&conf_file)
    }

    pub fn from_conf_file(conf_file: &ConfFile) -> anyhow::Result<Arc<Self>> {
        let listen = conf_file
            .listen
            .parse::<SocketAddr>()
            .context("invalid `Listen` address")?;

        let authorization_url = conf_file
            .authorization_url
            .parse::<Url>()
            .context("invalid `AuthorizationUrl`")?;

        if !matches!(authorization_url.scheme(), "http" | "https") {
            anyhow::bail!(
                "unsupported `AuthorizationUrl` scheme: {}",
                authorization_url.scheme()
            );
        }

        if !authorization_url.has_host() {
            anyhow::bail!("`AuthorizationUrl` has no host");
        }

        Ok(Arc::new(Self {
            listen,
            authorization_url,
            max_connection_request_size: conf_file
                .max_connection_request_size
                .unwrap_or(DEFAULT_MAX_CONNECTION_REQUEST_SIZE),
            strip_cookie_on_forward: conf_file.strip_cookie_on_forward.unwrap_or(false),
            worker_threads: conf_file.worker_threads,
            log_file: conf_file.log_file.clone(),
            verbosity_profile: conf_file.verbosity_profile.unwrap_or_default(),
            log_directive: conf_file.log_directive.clone(),
        }))
    }
}
