//! Newline-delimited JSON codec for the app-server pipes.
//!
//! Wraps `AnyDelimiterCodec` for framing and serde_json for serialization.
//! A line that fails to parse, or that exceeds the length limit, is logged and
//! surfaces as `None` instead of an error: a decode error would terminate the
//! `FramedRead` stream, and one bad line must never stop the reader.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, Decoder, Encoder};

/// Longest line accepted from the app-server. Longer lines are discarded.
pub const MAX_LINE_BYTES: usize = 64 * 1024 * 1024;

/// Longest prefix of a malformed line included in the warning.
const MALFORMED_PREVIEW_BYTES: usize = 256;

/// Codec that frames messages by `\n` and serializes with JSON.
pub struct JsonLinesCodec<T> {
    inner: AnyDelimiterCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonLinesCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonLinesCodec<T> {
    pub fn new() -> Self {
        Self::with_max_line_length(MAX_LINE_BYTES)
    }

    pub fn with_max_line_length(max_length: usize) -> Self {
        Self {
            inner: AnyDelimiterCodec::new_with_max_length(
                b"\n".to_vec(),
                b"\n".to_vec(),
                max_length,
            ),
            _phantom: PhantomData,
        }
    }

    pub fn max_line_length(&self) -> usize {
        self.inner.max_length()
    }
}

fn parse_line<T: DeserializeOwned>(line: &[u8]) -> Option<T> {
    let line = line.trim_ascii();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_slice(line) {
        Ok(item) => Some(item),
        Err(e) => {
            let preview = &line[..line.len().min(MALFORMED_PREVIEW_BYTES)];
            tracing::warn!(
                error = %e,
                line = %String::from_utf8_lossy(preview),
                "Failed to parse JSON line, dropping"
            );
            None
        }
    }
}

impl<T: DeserializeOwned> JsonLinesCodec<T> {
    fn frame(
        &self,
        chunk: Result<Option<Bytes>, AnyDelimiterCodecError>,
    ) -> Result<Option<Option<T>>, io::Error> {
        match chunk {
            Ok(Some(line)) => Ok(Some(parse_line(&line))),
            Ok(None) => Ok(None),
            Err(AnyDelimiterCodecError::MaxChunkLengthExceeded) => {
                tracing::warn!(
                    max_line_bytes = self.inner.max_length(),
                    "Line exceeds maximum length, discarding"
                );
                Ok(Some(None))
            }
            Err(AnyDelimiterCodecError::Io(e)) => Err(e),
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonLinesCodec<T> {
    /// `None` marks a blank, malformed or over-long line that was skipped.
    type Item = Option<T>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let chunk = self.inner.decode(src);
        self.frame(chunk)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let chunk = self.inner.decode_eof(src);
        self.frame(chunk)
    }
}

impl<T: Serialize> Encoder<T> for JsonLinesCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_string(&item)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let json_len = json.len();
        tracing::trace!(json_size_bytes = json_len, "Encoding line");
        if json_len > 100_000 {
            tracing::info!(
                json_size_bytes = json_len,
                json_size_kb = json_len / 1024,
                "Large line being encoded"
            );
        }
        self.inner.encode(json, dst).map_err(|e| match e {
            AnyDelimiterCodecError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        })
    }
}
