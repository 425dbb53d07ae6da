use crate::balancer::health::HealthTracker;
use crate::balancer::stats::Stats;
use crate::config::{VirtualServerConfig, PROTO_HTTP, PROTO_HTTPS};
use crate::error::BalancerError;
use crate::pool::{LbMethod, Pool};
use crate::proxy::{self, ProxyCache};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Running,
    Stopped,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Running => "running",
            Status::Stopped => "stopped",
        }
    }
}

#[derive(Debug)]
struct Lifecycle {
    status: Status,
    shutdown: Arc<Notify>,
    task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

/// One listening endpoint with its own pool, policy, health, stats, and
/// reverse-proxy cache. Identity fields are immutable after construction;
/// the pool and the trackers mutate under their own locks.
#[derive(Debug)]
pub struct VirtualServer {
    name: String,
    address: String,
    server_name: String,
    protocol: String,
    lb_method: LbMethod,
    retry: bool,
    tls: Option<Arc<rustls::ServerConfig>>,
    pool: Pool,
    health: HealthTracker,
    stats: Arc<Stats>,
    proxies: ProxyCache,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
}

impl VirtualServer {
    pub fn new(cfg: &VirtualServerConfig) -> Result<Self, BalancerError> {
        if cfg.name.is_empty() {
            return Err(BalancerError::NameEmpty);
        }
        if cfg.address.is_empty() {
            return Err(BalancerError::AddressEmpty);
        }

        let lb_method = LbMethod::parse(&cfg.lb_method)
            .ok_or_else(|| BalancerError::UnsupportedMethod(cfg.lb_method.clone()))?;

        let tls = match cfg.protocol.as_str() {
            "" | PROTO_HTTP => None,
            PROTO_HTTPS => {
                let cert_file = cfg
                    .cert_file
                    .as_deref()
                    .ok_or_else(|| BalancerError::Tls("cert_file is required for https".into()))?;
                let key_file = cfg
                    .key_file
                    .as_deref()
                    .ok_or_else(|| BalancerError::Tls("key_file is required for https".into()))?;
                Some(Arc::new(load_tls_config(cert_file, key_file)?))
            }
            other => return Err(BalancerError::UnsupportedProtocol(other.to_string())),
        };

        let server_name = if cfg.server_name.is_empty() {
            crate::config::default_server_name()
        } else {
            cfg.server_name.clone()
        };

        let pool = Pool::new(
            lb_method,
            cfg.pool.iter().map(|p| (p.address.clone(), p.weight)),
        );

        let max_fails = cfg.max_fails.max(1);
        let fail_timeout = Duration::from_secs(cfg.fail_timeout);

        Ok(Self {
            name: cfg.name.clone(),
            address: cfg.address.clone(),
            server_name,
            protocol: if cfg.protocol.is_empty() {
                PROTO_HTTP.to_string()
            } else {
                cfg.protocol.clone()
            },
            lb_method,
            retry: cfg.retry,
            tls,
            pool,
            health: HealthTracker::new(&cfg.name, max_fails, fail_timeout),
            stats: Arc::new(Stats::new(&cfg.name)),
            proxies: ProxyCache::new(),
            lifecycle: tokio::sync::Mutex::new(Lifecycle {
                status: Status::Stopped,
                shutdown: Arc::new(Notify::new()),
                task: None,
                local_addr: None,
            }),
        })
    }

    // ---- Identity accessors ----

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn lb_method(&self) -> LbMethod {
        self.lb_method
    }

    pub fn retry_enabled(&self) -> bool {
        self.retry
    }

    // ---- Subsystems ----

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn health(&self) -> &HealthTracker {
        &self.health
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn stats_handle(&self) -> Arc<Stats> {
        self.stats.clone()
    }

    pub fn proxies(&self) -> &ProxyCache {
        &self.proxies
    }

    pub fn render_stats(&self) -> String {
        self.stats.render()
    }

    // ---- Pool mutation (control plane & discovery) ----

    /// Idempotent: duplicates and empty addresses are no-ops.
    pub fn add_peer(&self, addr: &str, weight: u32) {
        self.pool.add(addr, weight);
        info!(
            "vs: peer added, vs={}, peer={}, weight={}, pool_size={}",
            self.name,
            addr,
            weight,
            self.pool.size()
        );
    }

    /// Removing a peer purges its health record, cached proxy, and stats
    /// entry along with the pool membership.
    pub fn remove_peer(&self, addr: &str) {
        self.pool.remove(addr);
        self.health.forget(addr);
        self.proxies.remove(addr);
        self.stats.remove(addr);
        info!(
            "vs: peer removed, vs={}, peer={}, pool_size={}",
            self.name,
            addr,
            self.pool.size()
        );
    }

    // ---- Lifecycle ----

    pub async fn status(&self) -> Status {
        self.lifecycle.lock().await.status
    }

    /// The actual bound address while running. Differs from `address` when
    /// the config asked for port 0.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.lifecycle.lock().await.local_addr
    }

    /// Bind the listener and start serving. Fails with `AlreadyEnabled` when
    /// the virtual server is running.
    pub async fn run(self: &Arc<Self>) -> Result<(), BalancerError> {
        let mut lc = self.lifecycle.lock().await;
        if lc.status == Status::Running {
            return Err(BalancerError::AlreadyEnabled);
        }

        let listener = TcpListener::bind(&self.address).await.map_err(|e| {
            BalancerError::Internal(format!("bind {}: {}", self.address, e))
        })?;

        lc.local_addr = listener.local_addr().ok();
        let shutdown = Arc::new(Notify::new());
        lc.shutdown = shutdown.clone();
        lc.task = Some(tokio::spawn(serve_loop(self.clone(), listener, shutdown)));
        lc.status = Status::Running;

        metrics::gauge!("lb_virtual_servers_running").increment(1.0);
        info!(
            "vs: listening, vs={}, addr={}, proto={}, method={}, pool={}",
            self.name,
            self.address,
            self.protocol,
            self.lb_method.as_str(),
            self.pool
        );
        Ok(())
    }

    /// Stop accepting connections and drain in-flight ones. Fails with
    /// `AlreadyDisabled` when the virtual server is stopped.
    pub async fn stop(&self) -> Result<(), BalancerError> {
        let task = {
            let mut lc = self.lifecycle.lock().await;
            if lc.status == Status::Stopped {
                return Err(BalancerError::AlreadyDisabled);
            }
            lc.shutdown.notify_one();
            lc.status = Status::Stopped;
            lc.task.take()
        };

        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("vs: serve task join failed, vs={}, error={}", self.name, e);
            }
        }
        metrics::gauge!("lb_virtual_servers_running").decrement(1.0);
        info!("vs: stopped, vs={}", self.name);
        Ok(())
    }
}

fn load_tls_config(cert_file: &str, key_file: &str) -> Result<rustls::ServerConfig, BalancerError> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_file).map_err(
        |e| BalancerError::Tls(format!("open cert file '{}': {}", cert_file, e)),
    )?))
    .collect::<Result<Vec<_>, _>>()
    .map_err(|e| BalancerError::Tls(format!("parse cert file '{}': {}", cert_file, e)))?;

    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_file).map_err(
        |e| BalancerError::Tls(format!("open key file '{}': {}", key_file, e)),
    )?))
    .map_err(|e| BalancerError::Tls(format!("parse key file '{}': {}", key_file, e)))?
    .ok_or_else(|| BalancerError::Tls(format!("no private key in '{}'", key_file)))?;

    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| BalancerError::Tls(e.to_string()))
}

/// Accept loop with graceful shutdown: on notify, stop accepting and wait up
/// to [`DRAIN_TIMEOUT`] for in-flight connections to finish.
async fn serve_loop(vs: Arc<VirtualServer>, listener: TcpListener, shutdown: Arc<Notify>) {
    let active_conns = Arc::new(AtomicI64::new(0));
    let tls_acceptor = vs.tls.clone().map(TlsAcceptor::from);

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.notified() => {
                info!("vs: stop accepting, draining, vs={}", vs.name);
                break;
            }
        };

        let (stream, client_addr) = match accepted {
            Ok(v) => {
                metrics::counter!(
                    "lb_connections_total",
                    "vs" => vs.name.clone(), "status" => "accepted",
                )
                .increment(1);
                v
            }
            Err(e) => {
                error!("vs: accept failed, vs={}, error={}", vs.name, e);
                metrics::counter!(
                    "lb_connections_total",
                    "vs" => vs.name.clone(), "status" => "error",
                )
                .increment(1);
                continue;
            }
        };

        metrics::gauge!("lb_connections_active", "vs" => vs.name.clone()).increment(1.0);
        active_conns.fetch_add(1, Ordering::Relaxed);

        let vs = vs.clone();
        let active_conns = active_conns.clone();
        let tls_acceptor = tls_acceptor.clone();

        tokio::spawn(async move {
            match tls_acceptor {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        serve_connection(vs.clone(), TokioIo::new(tls_stream), client_addr).await
                    }
                    Err(e) => {
                        error!(
                            "vs: tls handshake failed, vs={}, peer={}, error={}",
                            vs.name, client_addr, e
                        );
                    }
                },
                None => serve_connection(vs.clone(), TokioIo::new(stream), client_addr).await,
            }

            metrics::gauge!("lb_connections_active", "vs" => vs.name.clone()).decrement(1.0);
            active_conns.fetch_sub(1, Ordering::Relaxed);
        });
    }

    // Drain phase.
    let active = active_conns.load(Ordering::Relaxed);
    if active > 0 {
        info!(
            "vs: waiting for {} active connections to drain, vs={}",
            active, vs.name
        );
        let drain = async {
            while active_conns.load(Ordering::Relaxed) > 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        };
        match tokio::time::timeout(DRAIN_TIMEOUT, drain).await {
            Ok(_) => info!("vs: all connections drained, vs={}", vs.name),
            Err(_) => info!(
                "vs: drain timeout, {} connections still active, vs={}",
                active_conns.load(Ordering::Relaxed),
                vs.name
            ),
        }
    }
}

async fn serve_connection<I>(vs: Arc<VirtualServer>, io: I, client_addr: SocketAddr)
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let vs_inner = vs.clone();
    let svc = service_fn(move |req: Request<Incoming>| {
        let vs = vs_inner.clone();
        async move { proxy::handle(&vs, req, client_addr).await }
    });

    if let Err(e) = auto::Builder::new(TokioExecutor::new())
        .http1()
        .keep_alive(true)
        .http2()
        .keep_alive_interval(Some(Duration::from_secs(20)))
        .serve_connection_with_upgrades(io, svc)
        .await
    {
        if !e.to_string().contains("connection closed") {
            error!(
                "vs: connection error, vs={}, peer={}, error={}",
                vs.name, client_addr, e
            );
        }
    }
}
