mod backup;
mod control;
mod device_link;
mod listener;
mod slip;

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use hsm_mux_core::{DeviceHandle, KeyCache, MuxSettings, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::{net::TcpListener, signal};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use backup::BackupScheduler;
use device_link::TcpDeviceLink;

#[derive(Parser, Debug)]
#[command(
    name = "hsm-mux",
    version,
    about = "Presents a pool of HSM devices to RPC clients as a single HSM"
)]
struct Args {
    /// Bind address for untrusted (network) clients.
    #[arg(long, default_value = "0.0.0.0:8080")]
    bind: SocketAddr,

    /// Unix socket for trusted local clients.
    #[arg(long, env = "HSM_MUX_SOCKET")]
    unix_socket: Option<PathBuf>,

    /// Device endpoint as host:port (repeat flag or comma-delimited list).
    /// Device indices follow the order given.
    #[arg(long = "device", value_delimiter = ',', num_args = 1.., required = true)]
    devices: Vec<String>,

    /// Seconds to wait for each device connection.
    #[arg(long, default_value_t = 10)]
    device_connect_timeout_secs: u64,

    /// Directory holding cache backups.
    #[arg(long, default_value = "data/cache")]
    cache_dir: PathBuf,

    /// Operator settings file (YAML or JSON).
    #[arg(long, env = "HSM_MUX_SETTINGS")]
    settings: Option<PathBuf>,

    /// Interval in seconds between cache backups.
    #[arg(long, default_value_t = 300)]
    backup_interval_secs: u64,

    /// Device pinned on every new session.
    #[arg(long)]
    default_device: Option<usize>,

    /// Bind address for the Prometheus exporter.
    #[arg(long)]
    metrics_bind: Option<SocketAddr>,

    /// Start locked; untrusted clients are refused until SIGUSR1 unlocks.
    #[arg(long, default_value_t = false)]
    locked: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let args = Args::parse();
    if let Some(addr) = args.metrics_bind {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .map_err(|err| anyhow::anyhow!("failed to install metrics exporter: {err}"))?;
        info!(%addr, "metrics exporter listening");
    }

    let settings = match &args.settings {
        Some(path) => MuxSettings::from_path(path)
            .with_context(|| format!("failed to load settings from {path:?}"))?,
        None => MuxSettings::default(),
    };

    let connect_timeout = Duration::from_secs(args.device_connect_timeout_secs.max(1));
    let mut devices = Vec::with_capacity(args.devices.len());
    for (index, addr) in args.devices.iter().enumerate() {
        let link = TcpDeviceLink::connect(addr, connect_timeout).await?;
        devices.push(DeviceHandle::spawn(index, Arc::new(link)));
    }

    let cache = Arc::new(KeyCache::new(devices.len()));
    let restored = backup::restore_or_start_empty(&cache, &args.cache_dir)?;
    info!(devices = devices.len(), keys = restored, "key cache ready");

    let router = Arc::new(Router::new(devices, Arc::clone(&cache), settings)?);
    if args.default_device.is_some() {
        router.set_default_device(args.default_device)?;
    }
    if args.locked {
        router.lock();
    }
    let controls = Arc::clone(&router);
    tokio::spawn(async move {
        if let Err(err) = control::listen(controls).await {
            error!("operator controls unavailable: {err:#}");
        }
    });

    let scheduler = BackupScheduler::new(
        Arc::clone(&cache),
        args.cache_dir.clone(),
        Duration::from_secs(args.backup_interval_secs.max(10)),
    );
    tokio::spawn(scheduler.clone().run());

    let tcp = TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    info!("hsm-mux listening on {}", args.bind);
    tokio::spawn(listener::serve_tcp(tcp, Arc::clone(&router)));

    if let Some(path) = &args.unix_socket {
        serve_local(path, &router)?;
    }

    shutdown_signal().await;

    let final_backup = tokio::task::spawn_blocking(move || scheduler.run_once())
        .await
        .context("final cache backup task join")?;
    if let Err(err) = final_backup {
        error!("final cache backup failed: {err:#}");
    }
    if let Some(path) = &args.unix_socket
        && let Err(err) = std::fs::remove_file(path)
    {
        warn!(socket = %path.display(), "failed to remove socket: {err}");
    }
    Ok(())
}

#[cfg(unix)]
fn serve_local(path: &std::path::Path, router: &Arc<Router>) -> anyhow::Result<()> {
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("failed to remove stale socket {path:?}"))?;
    }
    let unix = tokio::net::UnixListener::bind(path)
        .with_context(|| format!("failed to bind {path:?}"))?;
    info!(socket = %path.display(), "trusted clients on unix socket");
    tokio::spawn(listener::serve_unix(unix, Arc::clone(router)));
    Ok(())
}

#[cfg(not(unix))]
fn serve_local(path: &std::path::Path, _router: &Arc<Router>) -> anyhow::Result<()> {
    anyhow::bail!("unix socket {path:?} requested but not supported on this platform")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("failed to listen for Ctrl+C: {err}");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!("failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn devices_accept_repeats_and_lists() {
        let args = Args::try_parse_from([
            "hsm-mux",
            "--device",
            "10.0.0.1:2000,10.0.0.2:2000",
            "--device",
            "10.0.0.3:2000",
        ])
        .expect("parse");
        assert_eq!(args.devices.len(), 3);
        assert_eq!(args.devices[2], "10.0.0.3:2000");
        assert_eq!(args.backup_interval_secs, 300);
        assert!(!args.locked);
    }

    #[test]
    fn at_least_one_device_is_required() {
        assert!(Args::try_parse_from(["hsm-mux"]).is_err());
    }
}
