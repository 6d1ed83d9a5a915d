//! Daemon entry point: load configuration, verify TLS material, boot
//! the backends and the JSON-RPC dispatch table, then serve until a
//! termination signal arrives (spec.md §4.10).
//!
//! Grounded on `ctld-agent/src/main.rs` (clap `Args` +
//! `tracing_subscriber::fmt::init()` + `#[tokio::main]`) for the
//! overall shape, and on
//! `examples/original_source/targetd/main.py::main()` for the
//! load-config → verify-TLS → initialize-backends → bind →
//! run-until-signal sequence. The original's 500ms
//! `BaseHTTPServer.serve_forever()` poll loop is an artifact of
//! blocking I/O in Python; a real async HTTP server has no need for
//! one, so shutdown here is instead `tokio::select!`-driven: a signal
//! future races the server future and triggers a graceful drain.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use targetd::auth::Tarpit;
use targetd::block::BlockManager;
use targetd::config::{self, Config};
use targetd::fs::FsManager;
use targetd::lio::LioStore;
use targetd::rpc::Dispatcher;
use targetd::{server, tls};

/// The path the LIO configuration store is persisted to after every
/// mutating orchestration-layer call, standing in for rtslib's
/// `saveconfig.json`.
const LIO_SAVE_PATH: &str = "/etc/target/saveconfig.json";

#[derive(Parser, Debug)]
#[command(name = "targetd")]
#[command(about = "JSON-RPC storage orchestration daemon for LVM/ZFS/btrfs block and filesystem provisioning over iSCSI and NFS")]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            // Tracing isn't installed yet; a config load failure is
            // fatal before the daemon can log anything useful anyway.
            eprintln!("fatal: {e}");
            std::process::exit(1);
        }
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(config = %args.config.display(), "loaded configuration");

    if let Err(e) = run(config).await {
        error!(error = %e, "targetd exiting after fatal error");
        std::process::exit(1);
    }
    Ok(())
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    if config.ssl {
        let cert = config.ssl_cert.as_deref().ok_or("ssl=true requires ssl_cert")?;
        let key = config.ssl_key.as_deref().ok_or("ssl=true requires ssl_key")?;
        tls::verify_ssl_file(Path::new(cert))?;
        tls::verify_ssl_file(Path::new(key))?;
        info!("TLS material verified");
    } else {
        tracing::warn!("ssl disabled in configuration; traffic to /targetrpc will be plaintext");
    }

    let lio = Arc::new(LioStore::new(Some(PathBuf::from(LIO_SAVE_PATH))));

    let block = Arc::new(BlockManager::new(&config, lio.clone()).await?);
    let fs = Arc::new(FsManager::new(&config).await?);
    info!(
        block_pools = config.block_pools.len() + config.zfs_block_pools.len(),
        fs_pools = config.fs_pools.len() + config.zfs_fs_pools.len(),
        "initialized storage backends"
    );

    let dispatcher = Arc::new(Dispatcher::new(block, fs));
    let tarpit = Arc::new(Tarpit::default());
    let config = Arc::new(config);

    if let Some(metrics_addr) = &config.metrics_listen {
        let addr: SocketAddr = metrics_addr
            .parse()
            .map_err(|e| format!("invalid metrics_listen address '{metrics_addr}': {e}"))?;
        targetd::metrics::init_metrics(addr)?;
    }

    info!(port = config.port, ssl = config.ssl, "starting JSON-RPC service");
    server::serve(config, dispatcher, tarpit, wait_for_shutdown_signal()).await?;
    info!("targetd shut down cleanly");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM, whichever arrives first.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
