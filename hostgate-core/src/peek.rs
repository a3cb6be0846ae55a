//! Non-destructive ClientHello peeking.
//!
//! [`peek_client_hello`] reads just enough of a fresh connection to extract
//! the SNI, then hands back a [`PeekedStream`] that replays the consumed
//! bytes ahead of the socket. The upstream performs its own TLS handshake
//! and must observe the exact byte sequence from offset zero.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::BytesMut;
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

use crate::sni::{SniError, parse_sni};

/// Peek window for the ClientHello. A hello whose server_name extension
/// sits beyond this bound is rejected rather than buffered further.
pub const PEEK_CAPACITY: usize = 4096;

/// A stream wrapper that serves previously peeked bytes before falling
/// through to the inner stream.
///
/// Reads drain the internal buffer first, in order, then continue from the
/// socket, so a reader sees the identical byte sequence the bare socket
/// would have produced. Writes pass straight through.
pub struct PeekedStream<S> {
    buf: BytesMut,
    inner: S,
}

impl<S> PeekedStream<S> {
    fn new(buf: BytesMut, inner: S) -> Self {
        Self { buf, inner }
    }

    /// Bytes peeked but not yet served to a reader.
    pub fn buffered(&self) -> &[u8] {
        &self.buf[..]
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.buf.is_empty() {
            return Pin::new(&mut self.inner).poll_read(cx, out);
        }
        let n = self.buf.len().min(out.remaining());
        if n == 0 {
            return Poll::Ready(Ok(()));
        }
        let chunk = self.buf.split_to(n);
        out.put_slice(&chunk);
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Reads the start of `stream` until the SNI can be extracted, without
/// losing any bytes.
///
/// On success, returns the lowercased server name together with the wrapped
/// stream; subsequent reads on the wrapper deliver the full ClientHello
/// followed by the rest of the socket data. On failure the peeked bytes are
/// discarded along with the connection.
///
/// Outcomes map onto [`SniError`]: a non-TLS or non-ClientHello prefix is
/// rejected as soon as it is recognized, EOF inside the hello is
/// [`SniError::MalformedHello`], and a hello that exceeds [`PEEK_CAPACITY`]
/// without presenting a server_name extension is [`SniError::SniNotFound`].
pub async fn peek_client_hello<S>(mut stream: S) -> Result<(String, PeekedStream<S>), SniError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(PEEK_CAPACITY);

    loop {
        let max = (PEEK_CAPACITY - buf.len()) as u64;
        let n = (&mut stream).take(max).read_buf(&mut buf).await?;
        if n == 0 {
            return Err(SniError::MalformedHello);
        }

        match parse_sni(&buf)? {
            Some(sni) => return Ok((sni, PeekedStream::new(buf, stream))),
            None if buf.len() >= PEEK_CAPACITY => return Err(SniError::SniNotFound),
            None => {}
        }
    }
}
