//! HTTP/1.1 front door.
//!
//! Reads just enough of each connection to extract the Host header, asks
//! the admission filter, then takes the raw socket over: everything read so
//! far, header bytes and any body prefix alike, is forwarded verbatim to
//! the origin before the byte pump starts.

use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::ProxyContext;
use crate::filter::strip_port;
use crate::registry::ConnMeta;
use crate::relay;

const READ_CHUNK: usize = 8192;
const MAX_HEADER_BYTES: usize = 16384;

const RESPONSE_BAD_REQUEST: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
const RESPONSE_FORBIDDEN: &[u8] = b"HTTP/1.1 403 Forbidden\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: 23\r\nConnection: close\r\n\r\nBlocked by proxy filter";
const RESPONSE_BAD_GATEWAY: &[u8] =
    b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

#[derive(Debug)]
pub enum HttpError {
    Io(io::Error),
    NoHostHeader,
    InvalidRequest,
}

impl std::fmt::Display for HttpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HttpError::Io(e) => write!(f, "IO error: {}", e),
            HttpError::NoHostHeader => write!(f, "No Host header found"),
            HttpError::InvalidRequest => write!(f, "Invalid HTTP request"),
        }
    }
}

impl std::error::Error for HttpError {}

impl From<io::Error> for HttpError {
    fn from(err: io::Error) -> Self {
        HttpError::Io(err)
    }
}

/// Accept loop for an HTTP listener. Each connection runs on its own task;
/// accept errors are logged and the loop continues.
pub async fn serve(listener: TcpListener, ctx: ProxyContext) {
    loop {
        match listener.accept().await {
            Ok((socket, addr)) => {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    handle_connection(socket, addr, ctx).await;
                });
            }
            Err(e) => error!(error = %e, "Accept error"),
        }
    }
}

async fn handle_connection(mut client: TcpStream, addr: SocketAddr, ctx: ProxyContext) {
    let peer = addr.to_string();
    debug!(peer, "New HTTP connection");

    let mut buffer = Vec::with_capacity(READ_CHUNK);
    let host = match read_request_head(&mut client, &mut buffer).await {
        Ok(host) => host,
        Err(HttpError::Io(e)) => {
            debug!(peer, error = %e, "HTTP request read failed");
            return;
        }
        Err(e) => {
            debug!(peer, error = %e, "Rejecting HTTP request");
            respond(&mut client, RESPONSE_BAD_REQUEST).await;
            return;
        }
    };

    if !ctx.filter.allow_http(&host) {
        warn!(peer, host, "Host blocked by proxy filter");
        respond(&mut client, RESPONSE_FORBIDDEN).await;
        return;
    }

    // The Host header may carry a port; origin dials always go to port 80
    let target = format!("{}:80", strip_port(&host));
    let mut upstream = match crate::dial_upstream(&target, ctx.connect_timeout()).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(peer, host, target, error = %e, "Upstream dial failed");
            respond(&mut client, RESPONSE_BAD_GATEWAY).await;
            return;
        }
    };

    // Replay the original request bytes, body prefix included, before any
    // pumping starts
    if let Err(e) = upstream.write_all(&buffer).await {
        warn!(peer, host, error = %e, "Failed to forward request to upstream");
        return;
    }

    let upstream_addr = upstream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| target.clone());
    let meta = ConnMeta::http(peer.clone(), upstream_addr, host.clone());

    let pair = ctx.registry.add(Box::new(client), Box::new(upstream), meta);
    let id = pair.id.clone();
    let (client_tx, upstream_tx) = pair.writers();

    relay::run(pair).await;

    ctx.registry.remove(&id);
    let _ = client_tx.lock().await.shutdown().await;
    let _ = upstream_tx.lock().await.shutdown().await;
    info!(id, peer, host, "HTTP connection closed");
}

/// Reads from the stream until the end of the header section, accumulating
/// everything into `buffer`, and returns the Host header value.
///
/// Bytes past the header boundary stay in `buffer` so the caller can replay
/// them upstream; nothing is consumed twice and nothing is lost.
pub(crate) async fn read_request_head<S>(
    stream: &mut S,
    buffer: &mut Vec<u8>,
) -> Result<String, HttpError>
where
    S: AsyncRead + Unpin,
{
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(HttpError::InvalidRequest);
        }
        buffer.extend_from_slice(&chunk[..n]);

        if let Some(headers_end) = find_headers_end(buffer) {
            return extract_host_header(&buffer[..headers_end]).ok_or(HttpError::NoHostHeader);
        }

        if buffer.len() > MAX_HEADER_BYTES {
            return Err(HttpError::InvalidRequest);
        }
    }
}

fn find_headers_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

fn extract_host_header(headers: &[u8]) -> Option<String> {
    let headers_str = std::str::from_utf8(headers).ok()?;
    for line in headers_str.lines() {
        if let Some(value) = line
            .split_once(':')
            .filter(|(name, _)| name.eq_ignore_ascii_case("host"))
            .map(|(_, value)| value.trim())
        {
            if value.is_empty() {
                return None;
            }
            return Some(value.to_string());
        }
    }
    None
}

async fn respond<S>(client: &mut S, response: &[u8])
where
    S: AsyncWrite + Unpin,
{
    if let Err(e) = client.write_all(response).await {
        debug!(error = %e, "Failed to write HTTP response");
    }
}
