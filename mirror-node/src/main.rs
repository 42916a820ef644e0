// Mirror daemon: mirrors the configured state with trusted peers until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use mirror_node::adapter::{Adapters, AlwaysPresent};
use mirror_node::{config, host, Node};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const DEFAULT_FILTER: &str = "mirror_node=info,mirror_core=info";

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("mirror-node {}", VERSION);
        return Ok(());
    }
    let config_path = config_arg(&args)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
        )
        .init();

    let cfg = config::load(config_path.as_deref())?;
    let adapters = Adapters::from_static(&cfg.state);
    let (host, queue) = host::host_queue();
    // Standalone there is no host update tick, so adapter calls get their own thread.
    let _host_thread = queue.spawn_thread().context("starting host thread")?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let node = Node::start(cfg, host, adapters, Arc::new(AlwaysPresent)).await?;
        tracing::info!(addr = %node.local_addr(), fingerprint = node.fingerprint().short(), "mirroring");
        shutdown_signal().await?;
        node.shutdown().await;
        anyhow::Ok(())
    })
}

/// `--config <path>`, if given.
fn config_arg(args: &[String]) -> anyhow::Result<Option<PathBuf>> {
    match args.iter().position(|a| a == "--config") {
        None => Ok(None),
        Some(i) => args
            .get(i + 1)
            .map(|p| Some(PathBuf::from(p)))
            .ok_or_else(|| anyhow::anyhow!("--config needs a path")),
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
