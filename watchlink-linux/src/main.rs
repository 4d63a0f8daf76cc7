// watchlink: keeps the watch link up and bridges it to JSON lines on stdio.

mod config;
mod control;
mod transport;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("watchlink-linux {}", VERSION);
            return Ok(());
        }
    }

    let cfg = config::load();
    init_tracing(&cfg.log_level);
    tracing::info!(version = VERSION, platform = cfg.platform.name(), "starting");

    let rt = tokio::runtime::Runtime::new().context("building tokio runtime")?;
    rt.block_on(async {
        let (req_tx, req_rx) = mpsc::channel(64);
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        tokio::spawn(control::write_outputs(out_rx));
        tokio::spawn(control::read_commands(req_tx.clone()));
        let link = tokio::spawn(transport::run_link(cfg, req_rx, out_tx));

        shutdown_signal().await?;
        tracing::info!("shutting down");
        // The link task tears the connection down once, then returns.
        let _ = req_tx.send(transport::Request::Shutdown).await;
        link.await.context("link task")?;
        Ok::<(), anyhow::Error>(())
    })
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
