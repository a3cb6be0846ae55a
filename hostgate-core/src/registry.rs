//! Live connection registry and gauge accounting.
//!
//! The registry owns every client/upstream stream pair from registration
//! until removal. The byte pump borrows the halves for the duration of its
//! copy loops; forced close reaches the same halves through the entry and
//! is the only path that terminates a connection early.

use dashmap::DashMap;
use prometheus::{IntGauge, Registry};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, broadcast};
use tokio::time::{Duration, timeout};
use tracing::{debug, info};

/// Byte stream a front door can register: readable, writable, boxable.
pub trait ProxyStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ProxyStream for T {}

/// Owned stream handle as stored and split by the registry.
pub type BoxedStream = Box<dyn ProxyStream>;

/// Write half shared between the byte pump and forced close.
pub type SharedWriter = Arc<Mutex<WriteHalf<BoxedStream>>>;

/// Preamble written to both sides of a force-closed pair. Meaningful to an
/// HTTP peer; ignored noise to a TLS one, emitted unconditionally either
/// way.
pub(crate) const CLOSE_PREAMBLE: &[u8] = b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n";

/// Best-effort write deadline for the close preamble.
const CLOSE_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// How a registered pair reaches its upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Cleartext HTTP/1.1 tunneled to origin port 80
    Http,
    /// TLS tunneled unchanged to the origin, which handshakes itself
    HttpsPassthrough,
    /// TLS forwarded to the local terminating back end
    HttpsTerminated,
}

impl Protocol {
    /// Stable label for logs and snapshots.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::HttpsPassthrough => "https_passthrough",
            Protocol::HttpsTerminated => "https_terminated",
        }
    }

    fn is_https(&self) -> bool {
        matches!(self, Protocol::HttpsPassthrough | Protocol::HttpsTerminated)
    }
}

/// Metadata describing one tracked connection pair.
#[derive(Debug, Clone)]
pub struct ConnMeta {
    /// Registry-assigned id, unique for the process lifetime
    pub id: String,
    /// Remote address of the client socket
    pub client_addr: String,
    /// Remote address of the upstream socket
    pub upstream_addr: String,
    /// HTTP Host header when applicable, else empty
    pub hostname: String,
    /// Extracted SNI when applicable, else empty
    pub sni: String,
    /// Upstream path taken by this pair
    pub protocol: Protocol,
    /// Terminating back end address; non-empty only for terminated TLS
    pub termination_addr: String,
    /// Wall-clock registration time
    pub created_at: SystemTime,
}

impl ConnMeta {
    /// Metadata template for an HTTP pair; the registry fills in the id.
    pub fn http(client_addr: String, upstream_addr: String, hostname: String) -> Self {
        Self {
            id: String::new(),
            client_addr,
            upstream_addr,
            hostname,
            sni: String::new(),
            protocol: Protocol::Http,
            termination_addr: String::new(),
            created_at: SystemTime::now(),
        }
    }

    /// Metadata template for a passthrough TLS pair.
    pub fn passthrough(client_addr: String, upstream_addr: String, sni: String) -> Self {
        Self {
            id: String::new(),
            client_addr,
            upstream_addr,
            hostname: String::new(),
            sni,
            protocol: Protocol::HttpsPassthrough,
            termination_addr: String::new(),
            created_at: SystemTime::now(),
        }
    }

    /// Metadata template for a terminated TLS pair.
    pub fn terminated(
        client_addr: String,
        upstream_addr: String,
        sni: String,
        termination_addr: String,
    ) -> Self {
        Self {
            id: String::new(),
            client_addr,
            upstream_addr,
            hostname: String::new(),
            sni,
            protocol: Protocol::HttpsTerminated,
            termination_addr,
            created_at: SystemTime::now(),
        }
    }
}

/// The five connection gauges exported to the metrics endpoint. Deltas are
/// applied by the registry in lockstep with insert and delete, so each gauge
/// equals the count of registered pairs matching its predicate.
pub struct ProxyMetrics {
    pub client_proxy_connections: IntGauge,
    pub proxy_server_connections: IntGauge,
    pub proxy_haproxy_connections: IntGauge,
    pub http_connections: IntGauge,
    pub https_connections: IntGauge,
}

impl ProxyMetrics {
    pub fn new() -> Self {
        Self {
            client_proxy_connections: IntGauge::new(
                "client_proxy_connections",
                "Number of active client-to-proxy TCP connections",
            )
            .unwrap(),
            proxy_server_connections: IntGauge::new(
                "proxy_server_connections",
                "Number of active proxy-to-upstream TCP connections",
            )
            .unwrap(),
            proxy_haproxy_connections: IntGauge::new(
                "proxy_haproxy_connections",
                "Number of active connections via the TLS terminating back end",
            )
            .unwrap(),
            http_connections: IntGauge::new(
                "http_connections",
                "Number of active HTTP connections",
            )
            .unwrap(),
            https_connections: IntGauge::new(
                "https_connections",
                "Number of active HTTPS connections",
            )
            .unwrap(),
        }
    }

    /// Registers all five gauges with a Prometheus registry.
    pub fn register(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        registry.register(Box::new(self.client_proxy_connections.clone()))?;
        registry.register(Box::new(self.proxy_server_connections.clone()))?;
        registry.register(Box::new(self.proxy_haproxy_connections.clone()))?;
        registry.register(Box::new(self.http_connections.clone()))?;
        registry.register(Box::new(self.https_connections.clone()))?;
        Ok(())
    }
}

impl Default for ProxyMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// One registered pair as held by the registry.
struct Entry {
    meta: ConnMeta,
    client_tx: SharedWriter,
    upstream_tx: SharedWriter,
    closer: broadcast::Sender<()>,
}

/// Stream halves handed back to the caller for the byte pump. The close
/// receivers are subscribed before the entry becomes visible, so a forced
/// close can never race past them.
pub struct RegisteredPair {
    pub id: String,
    pub(crate) client_rx: ReadHalf<BoxedStream>,
    pub(crate) client_tx: SharedWriter,
    pub(crate) upstream_rx: ReadHalf<BoxedStream>,
    pub(crate) upstream_tx: SharedWriter,
    pub(crate) stop_c2u: broadcast::Receiver<()>,
    pub(crate) stop_u2c: broadcast::Receiver<()>,
}

impl RegisteredPair {
    /// Clones of the two shared write halves, for closing the pair after
    /// the pump finishes.
    pub fn writers(&self) -> (SharedWriter, SharedWriter) {
        (self.client_tx.clone(), self.upstream_tx.clone())
    }
}

/// In-memory map of live connection pairs keyed by generated id.
pub struct ConnectionRegistry {
    conns: DashMap<String, Entry>,
    id_seq: AtomicU64,
    metrics: Arc<ProxyMetrics>,
}

impl ConnectionRegistry {
    pub fn new(metrics: Arc<ProxyMetrics>) -> Self {
        Self {
            conns: DashMap::new(),
            id_seq: AtomicU64::new(0),
            metrics,
        }
    }

    /// Generates the next connection id. Ids are strictly monotonic and
    /// never reused within a process.
    pub fn next_id(&self) -> String {
        let id = self.id_seq.fetch_add(1, Ordering::Relaxed) + 1;
        format!("conn-{}", id)
    }

    pub fn metrics(&self) -> &ProxyMetrics {
        &self.metrics
    }

    /// Number of currently registered pairs.
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Registers a client/upstream pair and applies the gauge deltas.
    ///
    /// Both streams are split; the write halves stay reachable through the
    /// entry for forced close, while the returned [`RegisteredPair`] carries
    /// everything the byte pump needs. Does not await.
    pub fn add(
        &self,
        client: BoxedStream,
        upstream: BoxedStream,
        mut meta: ConnMeta,
    ) -> RegisteredPair {
        meta.id = self.next_id();

        let (client_rx, client_tx) = tokio::io::split(client);
        let (upstream_rx, upstream_tx) = tokio::io::split(upstream);
        let client_tx = Arc::new(Mutex::new(client_tx));
        let upstream_tx = Arc::new(Mutex::new(upstream_tx));

        let (closer, stop_c2u) = broadcast::channel(1);
        let stop_u2c = closer.subscribe();

        self.conns.insert(
            meta.id.clone(),
            Entry {
                meta: meta.clone(),
                client_tx: client_tx.clone(),
                upstream_tx: upstream_tx.clone(),
                closer,
            },
        );
        self.apply_deltas(&meta, 1);

        info!(
            id = %meta.id,
            client = %meta.client_addr,
            upstream = %meta.upstream_addr,
            protocol = meta.protocol.as_str(),
            "Registered connection"
        );

        RegisteredPair {
            id: meta.id,
            client_rx,
            client_tx,
            upstream_rx,
            upstream_tx,
            stop_c2u,
            stop_u2c,
        }
    }

    /// Unregisters a pair and reverses its gauge deltas. Unknown ids are a
    /// no-op: the pump and a forced close may race to remove the same entry,
    /// and whichever loses simply finds it gone.
    ///
    /// The streams are not closed here; that is the caller's job, because
    /// removal is usually initiated after the pump has already drained both
    /// directions.
    pub fn remove(&self, id: &str) {
        let Some((_, entry)) = self.conns.remove(id) else {
            return;
        };
        self.apply_deltas(&entry.meta, -1);
        info!(
            id,
            client = %entry.meta.client_addr,
            upstream = %entry.meta.upstream_addr,
            "Removed connection"
        );
    }

    /// Force-closes every registered pair whose metadata satisfies the
    /// predicate and returns how many were closed.
    ///
    /// Each hit is atomically taken from the map (winning any race with the
    /// pump), told to stop, sent the close preamble on both sides under a
    /// short write deadline, shut down, and has its gauge deltas reversed.
    pub async fn close_where<F>(&self, pred: F) -> usize
    where
        F: Fn(&ConnMeta) -> bool,
    {
        let matched: Vec<String> = self
            .conns
            .iter()
            .filter(|entry| pred(&entry.value().meta))
            .map(|entry| entry.key().clone())
            .collect();

        let mut closed = 0;
        for id in matched {
            let Some((_, entry)) = self.conns.remove(&id) else {
                continue;
            };

            info!(
                id = %entry.meta.id,
                client = %entry.meta.client_addr,
                upstream = %entry.meta.upstream_addr,
                "Force closing connection"
            );

            // Stop the pump first so it releases the write locks
            let _ = entry.closer.send(());

            send_close_preamble(&entry.client_tx).await;
            send_close_preamble(&entry.upstream_tx).await;

            self.apply_deltas(&entry.meta, -1);
            closed += 1;
        }
        closed
    }

    /// Point-in-time copy of all registered metadata, in no particular
    /// order.
    pub fn snapshot(&self) -> Vec<ConnMeta> {
        self.conns
            .iter()
            .map(|entry| entry.value().meta.clone())
            .collect()
    }

    fn apply_deltas(&self, meta: &ConnMeta, delta: i64) {
        self.metrics.client_proxy_connections.add(delta);
        self.metrics.proxy_server_connections.add(delta);
        if meta.protocol.is_https() {
            self.metrics.https_connections.add(delta);
        } else {
            self.metrics.http_connections.add(delta);
        }
        if !meta.termination_addr.is_empty() {
            self.metrics.proxy_haproxy_connections.add(delta);
        }
    }
}

/// Writes the close preamble and shuts the half down, best effort. Writing
/// to a stream whose peer is gone, or that is already shut, is expected
/// here and only logged.
async fn send_close_preamble(writer: &SharedWriter) {
    let write = async {
        let mut w = writer.lock().await;
        w.write_all(CLOSE_PREAMBLE).await
    };
    match timeout(CLOSE_WRITE_TIMEOUT, write).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "Close preamble write failed"),
        Err(_) => debug!("Close preamble write timed out"),
    }

    let shutdown = async {
        let _: Result<(), io::Error> = writer.lock().await.shutdown().await;
    };
    let _ = timeout(CLOSE_WRITE_TIMEOUT, shutdown).await;
}
