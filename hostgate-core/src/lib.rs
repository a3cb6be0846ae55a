pub mod filter;
pub mod http;
pub mod invalidator;
pub mod peek;
pub mod registry;
pub mod relay;
pub mod sni;
pub mod tls;

pub use filter::AdmissionFilter;
pub use peek::{PEEK_CAPACITY, PeekedStream, peek_client_hello};
pub use registry::{ConnMeta, ConnectionRegistry, Protocol, ProxyMetrics};
pub use sni::{SniError, extract_sni, parse_sni};

use hostgate_config::Config;
use std::io;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, lookup_host};
use tokio::signal;
use tokio::sync::broadcast;
use tokio::time::{Duration, timeout};
use tracing::info;

/// Shared state every front door task needs: configuration, the connection
/// registry, and the admission filter.
#[derive(Clone)]
pub struct ProxyContext {
    pub config: Arc<Config>,
    pub registry: Arc<ConnectionRegistry>,
    pub filter: Arc<AdmissionFilter>,
}

impl ProxyContext {
    pub(crate) fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeouts.connect)
    }
}

/// Resolves and dials an upstream under the connect timeout.
pub(crate) async fn dial_upstream(target: &str, connect_timeout: Duration) -> io::Result<TcpStream> {
    let addr = lookup_host(target)
        .await?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "failed to resolve target"))?;
    timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "upstream connect timed out"))?
}

/// Runs the proxy with the given configuration.
///
/// Binds the HTTP and TLS front doors (plus the optional extra HTTP
/// listener), spawns their accept loops and the invalidation task, then
/// waits for Ctrl+C or a shutdown signal. A listener that cannot bind is
/// fatal and surfaces as an error from this function.
///
/// # Arguments
///
/// * `config` - Listen addresses, timeouts, and termination mode
/// * `filter` - Admission filter handle; the caller keeps a reference so an
///   external trigger can reload it while the proxy runs
/// * `metrics_registry` - Optional Prometheus registry to expose the five
///   connection gauges on
/// * `shutdown_rx` - Broadcast receiver for coordinated shutdown
/// * `invalidate_rx` - Broadcast receiver whose events force-close every
///   registered connection
///
/// # Examples
///
/// ```no_run
/// use hostgate_config::Config;
/// use hostgate_core::{AdmissionFilter, run_proxy};
/// use std::sync::Arc;
/// use tokio::sync::broadcast;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::default();
/// let filter = Arc::new(AdmissionFilter::new(
///     vec!["example.com".to_string()],
///     vec!["example.com".to_string()],
/// ));
/// let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
/// let (_invalidate_tx, invalidate_rx) = broadcast::channel(1);
/// run_proxy(config, filter, None, shutdown_rx, invalidate_rx).await?;
/// # Ok(())
/// # }
/// ```
pub async fn run_proxy(
    config: Config,
    filter: Arc<AdmissionFilter>,
    metrics_registry: Option<prometheus::Registry>,
    mut shutdown_rx: broadcast::Receiver<()>,
    invalidate_rx: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error>> {
    let metrics = Arc::new(ProxyMetrics::new());
    if let Some(ref registry) = metrics_registry {
        metrics.register(registry)?;
    }

    let registry = Arc::new(ConnectionRegistry::new(metrics));
    let ctx = ProxyContext {
        config: Arc::new(config),
        registry: registry.clone(),
        filter,
    };

    let http_listener = TcpListener::bind(&ctx.config.listeners.http).await?;
    info!(addr = %ctx.config.listeners.http, "HTTP front door listening");
    let tls_listener = TcpListener::bind(&ctx.config.listeners.https).await?;
    info!(
        addr = %ctx.config.listeners.https,
        termination = ctx.config.termination.is_some(),
        "TLS front door listening"
    );

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(http::serve(http_listener, ctx.clone())));
    tasks.push(tokio::spawn(tls::serve(tls_listener, ctx.clone())));

    if let Some(ref extra) = ctx.config.listeners.extra_http {
        let extra_listener = TcpListener::bind(extra).await?;
        info!(addr = %extra, "Extra HTTP front door listening");
        tasks.push(tokio::spawn(http::serve(extra_listener, ctx.clone())));
    }

    tasks.push(tokio::spawn(invalidator::run(registry, invalidate_rx)));

    info!("Proxy started, waiting for connections...");

    tokio::select! {
        _ = shutdown_rx.recv() => {
            info!("Received shutdown signal from coordinator");
        }
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    for task in tasks {
        task.abort();
    }

    info!("Proxy shutdown complete");
    Ok(())
}
