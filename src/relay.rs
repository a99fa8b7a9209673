//! Bidirectional relay between one client socket and one upstream WebSocket.
//!
//! # Overview
//!
//! - [`relay_connection`]: copy bytes both ways until either side ends
//! - [`BufferPool`]: reusable read buffers shared by every relay
//!
//! Client bytes are forwarded as one binary WebSocket message per read.
//! Binary messages from upstream are written to the client unchanged; any
//! text or raw frame ends the relay. Ping/Pong are answered by tungstenite.
//!
//! # Shutdown
//!
//! The two directions share a [`CancellationToken`]. The first direction to
//! finish cancels it, which stops the other one. Errors observed after
//! cancellation are the expected fallout of the close and are not logged.
//! Once both directions have returned, the upstream session is closed with a
//! Close frame and the client write half is shut down.

use crate::error::TunnelError;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

/// Size of one pooled read buffer (256 KiB).
pub const BUFFER_SIZE: usize = 256 * 1024;

/// Number of idle buffers kept around.
const MAX_RETAINED: usize = 64;

/// Bound on the closing handshake of a finished relay.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// A free list of equally sized byte buffers.
///
/// Relays take a buffer for the client read side and give it back on drop,
/// so a steady connection churn does not allocate a fresh buffer per
/// connection.
#[derive(Debug)]
pub struct BufferPool {
    buf_size: usize,
    max_retained: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    /// Creates a pool of [`BUFFER_SIZE`] buffers.
    pub fn new() -> Self {
        Self::with_buffer_size(BUFFER_SIZE, MAX_RETAINED)
    }

    pub fn with_buffer_size(buf_size: usize, max_retained: usize) -> Self {
        Self {
            buf_size,
            max_retained,
            free: Mutex::new(Vec::new()),
        }
    }

    /// Takes a buffer from the pool, allocating one if the pool is empty.
    pub fn get(self: &Arc<Self>) -> PooledBuffer {
        let buf = self
            .free
            .lock()
            .ok()
            .and_then(|mut free| free.pop())
            .unwrap_or_else(|| vec![0u8; self.buf_size]);
        PooledBuffer {
            buf: Some(buf),
            pool: Arc::clone(self),
        }
    }

    /// Number of idle buffers currently held.
    pub fn idle(&self) -> usize {
        self.free.lock().map(|free| free.len()).unwrap_or(0)
    }

    fn put(&self, buf: Vec<u8>) {
        if buf.len() != self.buf_size {
            return;
        }
        if let Ok(mut free) = self.free.lock() {
            if free.len() < self.max_retained {
                free.push(buf);
            }
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// A buffer borrowed from a [`BufferPool`]; returned to it on drop.
pub struct PooledBuffer {
    buf: Option<Vec<u8>>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or_default()
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or_default()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put(buf);
        }
    }
}

/// Byte counts of a finished relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Bytes read from the client and sent upstream
    pub bytes_upstream: u64,
    /// Bytes received from upstream and written to the client
    pub bytes_downstream: u64,
}

/// Relays between `client` and `upstream` until either side ends.
///
/// Returns once both directions have stopped and both connections have been
/// closed.
pub async fn relay_connection<S>(
    client: TcpStream,
    upstream: WebSocketStream<S>,
    pool: Arc<BufferPool>,
) -> RelayStats
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (client_read, client_write) = client.into_split();
    let (ws_tx, ws_rx) = upstream.split();
    let done = CancellationToken::new();

    // client -> upstream
    let up_handle = tokio::spawn(client_to_upstream(client_read, ws_tx, pool.get(), done.clone()));

    // upstream -> client
    let down_handle = tokio::spawn(upstream_to_client(ws_rx, client_write, done.clone()));

    let (up_result, down_result) = tokio::join!(up_handle, down_handle);

    let mut stats = RelayStats::default();
    match up_result {
        Ok((bytes, mut ws_tx)) => {
            stats.bytes_upstream = bytes;
            // Sends a Close frame; fails harmlessly if upstream already closed.
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, ws_tx.close()).await;
        }
        Err(e) => tracing::warn!(error = %e, "Client to upstream task panicked"),
    }
    match down_result {
        Ok((bytes, mut client_write)) => {
            stats.bytes_downstream = bytes;
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, client_write.shutdown()).await;
        }
        Err(e) => tracing::warn!(error = %e, "Upstream to client task panicked"),
    }
    stats
}

/// Copies client bytes upstream, one binary message per read.
async fn client_to_upstream<R, S>(
    mut client: R,
    mut upstream: SplitSink<WebSocketStream<S>, Message>,
    mut buf: PooledBuffer,
    done: CancellationToken,
) -> (u64, SplitSink<WebSocketStream<S>, Message>)
where
    R: AsyncRead + Unpin,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut total_bytes = 0u64;

    loop {
        let n = tokio::select! {
            _ = done.cancelled() => break,
            result = client.read(&mut buf) => match result {
                Ok(0) => {
                    tracing::debug!("EOF from client");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    if !done.is_cancelled() {
                        tracing::warn!(error = %e, "Copy from client failed");
                    }
                    break;
                }
            },
        };
        let frame = Message::Binary(Bytes::copy_from_slice(&buf[..n]));
        tokio::select! {
            _ = done.cancelled() => break,
            result = upstream.send(frame) => {
                if let Err(e) = result {
                    if !done.is_cancelled() {
                        tracing::warn!(error = %e, "Copy from client failed");
                    }
                    break;
                }
            }
        }
        total_bytes += n as u64;
    }

    done.cancel();
    (total_bytes, upstream)
}

/// Writes upstream binary payloads to the client.
async fn upstream_to_client<W, S>(
    mut upstream: SplitStream<WebSocketStream<S>>,
    mut client: W,
    done: CancellationToken,
) -> (u64, W)
where
    W: AsyncWrite + Unpin,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut total_bytes = 0u64;

    loop {
        let next = tokio::select! {
            _ = done.cancelled() => break,
            next = upstream.next() => next,
        };
        let data = match next {
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(Message::Close(frame))) => {
                tracing::debug!(frame = ?frame, "Upstream closed the session");
                break;
            }
            Some(Ok(other)) => {
                let kind = match other {
                    Message::Text(_) => "text",
                    _ => "raw frame",
                };
                let e = TunnelError::UnexpectedFrame(Arc::from(kind));
                tracing::warn!(error = %e, "Copy from upstream failed");
                break;
            }
            Some(Err(e)) => {
                if !done.is_cancelled() {
                    tracing::warn!(error = %e, "Copy from upstream failed");
                }
                break;
            }
            None => {
                tracing::debug!("Upstream stream ended");
                break;
            }
        };
        tokio::select! {
            _ = done.cancelled() => break,
            result = client.write_all(&data) => {
                if let Err(e) = result {
                    if !done.is_cancelled() {
                        tracing::warn!(error = %e, "Copy from upstream failed");
                    }
                    break;
                }
            }
        }
        total_bytes += data.len() as u64;
    }

    done.cancel();
    (total_bytes, client)
}
