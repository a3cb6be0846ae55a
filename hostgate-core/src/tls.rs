//! TLS front door.
//!
//! Peeks the ClientHello for the SNI without consuming it, applies the
//! admission filter, and tunnels the intact TLS stream either straight to
//! the origin (passthrough) or to the local terminating back end. The proxy
//! never touches certificate material; in termination mode it is SNI-aware
//! but TLS-unaware.

use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Duration, timeout};
use tracing::{debug, error, info, warn};

use crate::ProxyContext;
use crate::peek::peek_client_hello;
use crate::registry::ConnMeta;
use crate::relay;

/// Accept loop for the TLS listener.
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

/// No response channel exists before the handshake completes, so every
/// failure up to registration is a silent close of the client socket.
async fn handle_connection(client: TcpStream, addr: SocketAddr, ctx: ProxyContext) {
    let peer = addr.to_string();
    debug!(peer, "New TLS connection");

    let hello_timeout = Duration::from_secs(ctx.config.timeouts.client_hello);
    let (sni, wrapped) = match timeout(hello_timeout, peek_client_hello(client)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            debug!(peer, error = %e, "ClientHello rejected");
            return;
        }
        Err(_) => {
            debug!(peer, "Timed out waiting for ClientHello");
            return;
        }
    };

    if !ctx.filter.allow_sni(&sni) {
        warn!(peer, sni, "SNI blocked by proxy filter");
        return;
    }

    let target = match ctx.config.termination {
        Some(ref termination) => termination.address.clone(),
        None => format!("{}:443", sni),
    };

    let upstream = match crate::dial_upstream(&target, ctx.connect_timeout()).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(peer, sni, target, error = %e, "Upstream dial failed");
            return;
        }
    };

    let upstream_addr = upstream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| target.clone());
    let meta = match ctx.config.termination {
        Some(ref termination) => ConnMeta::terminated(
            peer.clone(),
            upstream_addr,
            sni.clone(),
            termination.address.clone(),
        ),
        None => ConnMeta::passthrough(peer.clone(), upstream_addr, sni.clone()),
    };

    // Register the wrapped stream, not the raw socket: the pump's first
    // client-side reads must replay the peeked ClientHello bytes
    let pair = ctx.registry.add(Box::new(wrapped), Box::new(upstream), meta);
    let id = pair.id.clone();
    let (client_tx, upstream_tx) = pair.writers();

    relay::run(pair).await;

    ctx.registry.remove(&id);
    let _ = client_tx.lock().await.shutdown().await;
    let _ = upstream_tx.lock().await.shutdown().await;
    info!(id, peer, sni, "TLS connection closed");
}
