#[macro_use]
extern crate tracing;

use std::sync::Arc;

use anyhow::Context as _;
use camino::Utf8PathBuf;
use rdproxy::ProxyState;
use rdproxy::config::Conf;
use rdproxy::engine::NoEngine;
use rdproxy::listener::ProxyListener;
use rdproxy::task::{ChildTask, ShutdownHandle};
use tap::prelude::*;

fn main() -> anyhow::Result<()> {
    let mut args = std::env::args();

    let executable = args.next().context("executable name is missing from the environment")?;

    let conf_path = match args.next().as_deref() {
        Some("--help" | "-h") | None => {
            println!("Usage: {executable} <config.json>");
            return Ok(());
        }
        Some(path) => Utf8PathBuf::from(path),
    };

    let conf = Conf::from_file(&conf_path).context("unable to load configuration")?;

    let _logger_guard = rdproxy::log::init(
        conf.verbosity_profile,
        conf.log_directive.as_deref(),
        conf.log_file.as_deref(),
    )
    .context("failed to setup logger")?;

    info!(version = env!("CARGO_PKG_VERSION"));

    let mut runtime_builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(count) = conf.worker_threads {
        runtime_builder.worker_threads(count);
    }
    let runtime = runtime_builder
        .enable_all()
        .build()
        .context("failed to build the async runtime")?;

    runtime
        .block_on(run(conf))
        .tap_err(|error| error!(error = format!("{error:#}"), "Failed to run"))?;

    runtime.shutdown_timeout(std::time::Duration::from_millis(100)); // just to be safe

    Ok(())
}

async fn run(conf: Arc<Conf>) -> anyhow::Result<()> {
    let state = ProxyState::new(conf, Arc::new(NoEngine));

    let listener = ProxyListener::init_and_bind(state).context("failed to initialize listener")?;

    let (shutdown_handle, mut shutdown_signal) = ShutdownHandle::new();

    let listener_task = ChildTask::spawn(async move {
        tokio::select! {
            result = listener.run() => result,
            _ = shutdown_signal.wait() => Ok(()),
        }
    });

    build_signals_fut().await?;

    info!("Received shutdown signal");

    shutdown_handle.signal();

    listener_task
        .join()
        .await
        .context("listener task join failed")?
        .context("listener failure")?;

    Ok(())
}

#[cfg(unix)]
async fn build_signals_fut() -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate_signal = signal(SignalKind::terminate()).context("failed to create terminate signal stream")?;
    let mut quit_signal = signal(SignalKind::quit()).context("failed to create quit signal stream")?;
    let mut interrupt_signal = signal(SignalKind::interrupt()).context("failed to create interrupt signal stream")?;

    futures::future::select_all(vec![
        Box::pin(terminate_signal.recv()),
        Box::pin(quit_signal.recv()),
        Box::pin(interrupt_signal.recv()),
    ])
    .await;

    Ok(())
}

#[cfg(not(unix))]
async fn build_signals_fut() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await.context("CTRL_C signal failed")
}
