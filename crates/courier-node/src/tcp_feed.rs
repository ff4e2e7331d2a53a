//! JSON-lines push feed over TCP.
//!
//! One connection per subscription. The client writes a single
//! [`SubscribeRequest`] line, then reads [`FeedEvent`] lines until EOF. EOF,
//! an I/O error or an oversized line closes the stream, which the
//! subscription manager treats as a lost transport. Dropping the stream
//! closes the connection.

use async_trait::async_trait;
use courier_proto::FeedEvent;
use courier_realtime::{FeedStream, FeedTransport, RealtimeError, SubscribeRequest};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, warn};

/// Longest accepted line, in bytes.
pub const MAX_JSON_LINE_BYTES: usize = 256 * 1024;

pub struct TcpFeedTransport {
    addr: String,
    buffer: usize,
}

impl TcpFeedTransport {
    pub fn new(addr: impl Into<String>, buffer: usize) -> Self {
        Self {
            addr: addr.into(),
            buffer: buffer.max(1),
        }
    }
}

#[async_trait]
impl FeedTransport for TcpFeedTransport {
    async fn subscribe(&self, request: SubscribeRequest) -> courier_realtime::error::Result<FeedStream> {
        let stream = request.stream;
        let fail = |reason: String| RealtimeError::transport(stream, reason);

        let socket = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| fail(format!("connect {}: {}", self.addr, e)))?;
        let (read_half, write_half) = socket.into_split();

        let line = serde_json::to_string(&request).map_err(|e| fail(e.to_string()))?;
        let mut writer =
            FramedWrite::new(write_half, LinesCodec::new_with_max_length(MAX_JSON_LINE_BYTES));
        writer
            .send(line)
            .await
            .map_err(|e| fail(format!("send subscribe: {}", e)))?;

        let mut reader =
            FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_JSON_LINE_BYTES));
        let (tx, rx) = mpsc::channel(self.buffer);
        tokio::spawn(async move {
            // Keep the write half open for the lifetime of the subscription.
            let _writer = writer;
            loop {
                let next = tokio::select! {
                    _ = tx.closed() => {
                        debug!(%stream, "subscription dropped, closing feed connection");
                        break;
                    }
                    next = reader.next() => next,
                };
                let line = match next {
                    Some(Ok(line)) => line,
                    Some(Err(e)) => {
                        warn!(%stream, error = %e, "feed read failed");
                        break;
                    }
                    None => {
                        debug!(%stream, "feed closed by peer");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                let event: FeedEvent = match serde_json::from_str(&line) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(%stream, error = %e, "skipping malformed feed line");
                        continue;
                    }
                };
                if tx.send(event).await.is_err() {
                    debug!(%stream, "subscription dropped, closing feed connection");
                    break;
                }
            }
        });

        debug!(%stream, addr = %self.addr, "feed subscription opened");
        Ok(rx)
    }
}
