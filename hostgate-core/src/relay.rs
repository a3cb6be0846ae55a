//! Bidirectional byte pump between a registered client/upstream pair.

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf};
use tokio::sync::broadcast;
use tracing::debug;

use crate::registry::{BoxedStream, RegisteredPair, SharedWriter};

const COPY_BUF_SIZE: usize = 8192;

/// Copies bytes in both directions until each direction ends, then returns
/// the per-direction byte counts `(client_to_upstream, upstream_to_client)`.
///
/// Each direction runs on its own task and ends on EOF, on an I/O error, or
/// when the registry fires the pair's close signal. A failure in one
/// direction never aborts the other; the peer notices through its own read.
/// The pump interprets nothing and closes nothing; stream shutdown belongs
/// to the front door (after removal) or to a forced close.
pub async fn run(pair: RegisteredPair) -> (u64, u64) {
    let RegisteredPair {
        id,
        client_rx,
        client_tx,
        upstream_rx,
        upstream_tx,
        stop_c2u,
        stop_u2c,
    } = pair;

    let c2u = tokio::spawn(copy_direction(client_rx, upstream_tx, stop_c2u));
    let u2c = tokio::spawn(copy_direction(upstream_rx, client_tx, stop_u2c));

    let client_to_upstream = c2u.await.unwrap_or(0);
    let upstream_to_client = u2c.await.unwrap_or(0);

    debug!(
        id = %id,
        client_to_upstream,
        upstream_to_client,
        "Byte pump finished"
    );
    (client_to_upstream, upstream_to_client)
}

/// One direction of the pump. Returns the number of bytes delivered.
async fn copy_direction(
    mut rx: ReadHalf<BoxedStream>,
    tx: SharedWriter,
    mut stop: broadcast::Receiver<()>,
) -> u64 {
    let mut buf = [0u8; COPY_BUF_SIZE];
    let mut total = 0u64;

    loop {
        let n = tokio::select! {
            _ = stop.recv() => break,
            res = rx.read(&mut buf) => match res {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!(error = %e, "Relay read ended");
                    break;
                }
            },
        };

        let write = async {
            let mut w = tx.lock().await;
            w.write_all(&buf[..n]).await
        };
        tokio::select! {
            _ = stop.recv() => break,
            res = write => {
                if let Err(e) = res {
                    debug!(error = %e, "Relay write ended");
                    break;
                }
            }
        }

        total += n as u64;
    }

    total
}
