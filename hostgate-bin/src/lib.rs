use std::error::Error;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use notify::{Event, RecursiveMode, Watcher};
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use hostgate_config::Config;
use hostgate_core::{AdmissionFilter, run_proxy};

pub async fn run(config_path: &Path) -> Result<(), Box<dyn Error>> {
    // Initialize logging
    fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into())
                .add_directive("hostgate=debug".parse()?),
        )
        .with_target(false)
        .json()
        .init();

    // Load configuration
    let config = Config::from_file(config_path)?;

    let filter = Arc::new(AdmissionFilter::new(
        config.allowlist.hosts.clone(),
        config.allowlist.snis.clone(),
    ));

    // Set up the metrics endpoint
    let registry = if config.metrics.enabled {
        let registry = Registry::new();
        let metrics_addr: SocketAddr = config.metrics.address.parse()?;
        let metrics_listener = TcpListener::bind(metrics_addr).await?;
        info!(addr = %metrics_addr, "Metrics endpoint listening");

        let registry_clone = registry.clone();
        tokio::spawn(async move {
            loop {
                if let Ok((stream, _)) = metrics_listener.accept().await {
                    let registry = registry_clone.clone();
                    let io = TokioIo::new(stream);

                    tokio::spawn(async move {
                        let service = hyper::service::service_fn(
                            move |_req: Request<hyper::body::Incoming>| {
                                let registry = registry.clone();
                                async move {
                                    let encoder = TextEncoder::new();
                                    let metric_families = registry.gather();
                                    let mut buffer = vec![];
                                    encoder
                                        .encode(&metric_families, &mut buffer)
                                        .map_err(|e| format!("Metrics encoding error: {}", e))?;
                                    Ok::<_, String>(Response::new(Full::new(
                                        bytes::Bytes::from(buffer),
                                    )))
                                }
                            },
                        );

                        if let Err(err) = http1::Builder::new().serve_connection(io, service).await
                        {
                            warn!(error = %err, "Metrics server error");
                        }
                    });
                }
            }
        });

        Some(registry)
    } else {
        None
    };

    let (_shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
    let (invalidate_tx, invalidate_rx) = broadcast::channel::<()>(8);

    // The watched file drives both allowlist reloads and connection
    // invalidation sweeps
    if let Some(ref watch_path) = config.watch {
        spawn_reload_watcher(
            watch_path.clone(),
            config_path.to_path_buf(),
            filter.clone(),
            invalidate_tx,
        )?;
    }

    // Run the proxy
    run_proxy(config, filter, registry, shutdown_rx, invalidate_rx).await
}

/// Watches a file for modifications; each change re-reads the configuration,
/// reloads the allowlist, and fires an invalidation sweep.
fn spawn_reload_watcher(
    watch_path: PathBuf,
    config_path: PathBuf,
    filter: Arc<AdmissionFilter>,
    invalidate_tx: broadcast::Sender<()>,
) -> Result<(), Box<dyn Error>> {
    let (event_tx, mut event_rx) = tokio::sync::mpsc::channel::<()>(16);

    // The notify callback runs on the watcher's own thread
    let mut watcher =
        notify::recommended_watcher(move |res: Result<Event, notify::Error>| match res {
            Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                let _ = event_tx.blocking_send(());
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "File watch error"),
        })?;
    watcher.watch(&watch_path, RecursiveMode::NonRecursive)?;
    info!(path = %watch_path.display(), "Started reload watcher");

    tokio::spawn(async move {
        // Keep the watcher alive for the lifetime of the task
        let _watcher = watcher;
        while event_rx.recv().await.is_some() {
            info!("Reload trigger received");
            match Config::from_file(&config_path) {
                Ok(config) => {
                    filter.reload(config.allowlist.hosts, config.allowlist.snis);
                }
                Err(e) => {
                    warn!(error = %e, "Config reload failed, keeping previous allowlist");
                }
            }
            let _ = invalidate_tx.send(());
        }
    });

    Ok(())
}
