use crate::balancer::Balancer;
use crate::config::Config;
use crate::discovery::EtcdDiscovery;
use crate::metrics::Metrics;
use crate::controller;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
}

/// Process lifecycle: init → load → serve → wait for signal → drain.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    let config = Config::load(&args.config_path)?;
    let metrics = Metrics::install();

    let balancer = Arc::new(Balancer::new(&config.virtual_server)?);
    let shutdown = Arc::new(Notify::new());

    if let Some(controller_cfg) = config.controller.clone() {
        let balancer = balancer.clone();
        let metrics = metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = controller::run(controller_cfg, balancer, metrics).await {
                error!("controller: failed, error={}", e);
            }
        });
    } else {
        info!("controller: not configured, control API disabled");
    }

    start_discovery_loop(&config, &balancer, &shutdown)?;

    balancer.run().await?;
    info!(
        "server: all virtual servers running, count={}",
        balancer.len()
    );

    wait_for_shutdown().await;
    shutdown.notify_waiters();

    if let Err(e) = balancer.stop().await {
        error!("server: stop error, error={}", e);
    }
    info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(_guard);
}

/// Sleep for `duration`, returning `true` immediately if shutdown fires.
async fn sleep_or_shutdown(duration: Duration, shutdown: &Notify) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = shutdown.notified() => true,
    }
}

/// Own the discovery poll loop: one reconcile pass per interval, error
/// cycles logged and backed off without touching the data plane.
fn start_discovery_loop(
    config: &Config,
    balancer: &Arc<Balancer>,
    shutdown: &Arc<Notify>,
) -> Result<()> {
    let Some(sd) = config.service_discovery.clone() else {
        info!("discovery: not configured");
        return Ok(());
    };

    let driver = Arc::new(EtcdDiscovery::new(&sd)?);
    let balancer = balancer.clone();
    let shutdown = shutdown.clone();
    let poll_interval = Duration::from_secs(sd.poll_interval.max(1));

    tokio::spawn(async move {
        loop {
            match driver.poll_once(&balancer).await {
                Ok(()) => {
                    metrics::counter!("lb_discovery_poll_total", "result" => "success")
                        .increment(1);
                }
                Err(e) => {
                    metrics::counter!("lb_discovery_poll_total", "result" => "error")
                        .increment(1);
                    error!("discovery: poll failed, error={}", e);
                }
            }
            if sleep_or_shutdown(poll_interval, &shutdown).await {
                return;
            }
        }
    });

    info!(
        "discovery: etcd poll loop started, interval={}s",
        poll_interval.as_secs()
    );
    Ok(())
}

async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("server: received SIGINT, shutting down"),
        _ = terminate => info!("server: received SIGTERM, shutting down"),
    }
}
