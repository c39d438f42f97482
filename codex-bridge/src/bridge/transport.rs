//! Line-delimited message transport over the app-server's stdin/stdout.
//!
//! Writes are serialized behind a mutex so concurrent senders never interleave
//! bytes. Reads happen either line-by-line (`read_line`, used by the handshake
//! before the pump exists) or through the single-pass `messages()` stream that
//! the protocol engine's pump consumes.

use futures::stream::{self, BoxStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::JsonLinesCodec;
use super::protocol::Envelope;
use crate::error::BridgeError;

pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

type LineWriter = FramedWrite<BoxedWriter, JsonLinesCodec<Envelope>>;
type LineReader = FramedRead<BoxedReader, JsonLinesCodec<Envelope>>;

/// Outcome of reading one line.
#[derive(Debug)]
pub enum Inbound {
    Message(Envelope),
    /// Blank or malformed line (already logged).
    Skipped,
    /// Stream closed, read failed, or the reader was handed to `messages()`.
    Closed,
}

pub struct MessageTransport {
    writer: Mutex<Option<LineWriter>>,
    reader: Mutex<Option<LineReader>>,
}

impl MessageTransport {
    pub fn new(
        writer: impl AsyncWrite + Send + Unpin + 'static,
        reader: impl AsyncRead + Send + Unpin + 'static,
    ) -> Self {
        let writer: BoxedWriter = Box::new(writer);
        let reader: BoxedReader = Box::new(reader);
        Self {
            writer: Mutex::new(Some(FramedWrite::new(writer, JsonLinesCodec::new()))),
            reader: Mutex::new(Some(FramedRead::new(reader, JsonLinesCodec::new()))),
        }
    }

    /// Write one envelope as a single line. Fails with `NotRunning` once closed.
    pub async fn send(&self, envelope: Envelope) -> Result<(), BridgeError> {
        let method = envelope.method().map(str::to_owned);
        let id = envelope.id();

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(BridgeError::NotRunning)?;
        writer.send(envelope).await?;

        tracing::debug!(?method, ?id, "Sent message");
        Ok(())
    }

    /// Read and parse one line.
    pub async fn read_line(&self) -> Inbound {
        let mut guard = self.reader.lock().await;
        let Some(reader) = guard.as_mut() else {
            return Inbound::Closed;
        };
        match reader.next().await {
            Some(Ok(Some(envelope))) => {
                log_received(&envelope);
                Inbound::Message(envelope)
            }
            Some(Ok(None)) => Inbound::Skipped,
            Some(Err(e)) => {
                tracing::error!(error = %e, "Failed to read from app-server stdout");
                Inbound::Closed
            }
            None => Inbound::Closed,
        }
    }

    /// Take the reader as a lazy stream of parsed envelopes.
    ///
    /// Single-pass: the stream owns the reader, so a second call yields an
    /// empty stream. It ends when stdout closes or a read fails.
    pub async fn messages(&self) -> BoxStream<'static, Envelope> {
        let Some(reader) = self.reader.lock().await.take() else {
            tracing::warn!("Message stream already taken");
            return stream::empty().boxed();
        };

        stream::unfold(reader, |mut reader| async move {
            loop {
                match reader.next().await {
                    Some(Ok(Some(envelope))) => {
                        log_received(&envelope);
                        return Some((envelope, reader));
                    }
                    Some(Ok(None)) => continue,
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "Failed to read from app-server stdout");
                        return None;
                    }
                    None => return None,
                }
            }
        })
        .boxed()
    }

    /// Drop the writer, closing the child's stdin. Later sends fail with `NotRunning`.
    pub async fn close(&self) {
        if let Some(mut writer) = self.writer.lock().await.take()
            && let Err(e) = writer.close().await
        {
            tracing::debug!(error = %e, "Error closing app-server stdin");
        }
    }
}

fn log_received(envelope: &Envelope) {
    match envelope {
        Envelope::Response(r) => {
            tracing::debug!(id = r.id, has_error = r.outcome.is_err(), "Received response")
        }
        Envelope::Notification(n) => tracing::debug!(method = %n.method, "Received notification"),
        Envelope::Request(r) => tracing::debug!(method = %r.method, id = r.id, "Received request"),
    }
}
