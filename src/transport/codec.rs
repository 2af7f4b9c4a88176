//! Pluggable payload codecs for the structured channel
//!
//! `PreservesCodec` frames each payload as a little-endian `u32` length
//! followed by its packed Preserves encoding. `JsonLinesCodec` writes one JSON
//! document per line.

use serde::{Deserialize, Serialize};
use std::io::{self, BufRead};
use std::sync::Arc;

use crate::engine::error::{CodecError, CodecResult};
use crate::engine::protocol::Payload;

/// Largest frame accepted from the worker
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Encodes and decodes protocol payloads
pub trait PayloadCodec: Send + Sync {
    /// Codec name for logs.
    fn name(&self) -> &'static str;

    /// Encode one payload into a self-delimiting frame.
    fn encode(&self, payload: &Payload) -> CodecResult<Vec<u8>>;

    /// Read one frame. Returns `None` on a clean end of stream.
    fn decode(&self, reader: &mut dyn BufRead) -> CodecResult<Option<Payload>>;
}

/// Available codec implementations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodecKind {
    /// Length-prefixed packed Preserves
    #[default]
    Preserves,
    /// Newline-delimited JSON
    JsonLines,
}

impl CodecKind {
    /// Instantiate the codec.
    pub fn build(self) -> Arc<dyn PayloadCodec> {
        match self {
            CodecKind::Preserves => Arc::new(PreservesCodec),
            CodecKind::JsonLines => Arc::new(JsonLinesCodec),
        }
    }
}

/// Length-prefixed packed Preserves codec
#[derive(Debug, Clone, Copy, Default)]
pub struct PreservesCodec;

impl PayloadCodec for PreservesCodec {
    fn name(&self) -> &'static str {
        "preserves"
    }

    fn encode(&self, payload: &Payload) -> CodecResult<Vec<u8>> {
        use preserves::PackedWriter;

        let mut data_buf = Vec::new();
        {
            let mut writer = PackedWriter::new(&mut data_buf);
            preserves::serde::to_writer(&mut writer, payload)
                .map_err(|e| CodecError::Encode(e.to_string()))?;
        }

        if data_buf.len() > MAX_FRAME_BYTES {
            return Err(CodecError::FrameTooLarge(data_buf.len()));
        }

        // Prepend length
        let len = data_buf.len() as u32;
        let mut result = Vec::with_capacity(4 + data_buf.len());
        result.extend_from_slice(&len.to_le_bytes());
        result.extend_from_slice(&data_buf);
        Ok(result)
    }

    fn decode(&self, reader: &mut dyn BufRead) -> CodecResult<Option<Payload>> {
        let mut header = [0u8; 4];
        if !read_header(reader, &mut header)? {
            return Ok(None);
        }

        let len = u32::from_le_bytes(header) as usize;
        if len > MAX_FRAME_BYTES {
            return Err(CodecError::FrameTooLarge(len));
        }

        let mut data = vec![0u8; len];
        reader.read_exact(&mut data)?;
        preserves::serde::from_bytes(&data)
            .map(Some)
            .map_err(|e| CodecError::Decode(e.to_string()))
    }
}

/// Fill `header`, distinguishing a clean EOF before the first byte from a
/// truncated frame.
fn read_header(reader: &mut dyn BufRead, header: &mut [u8; 4]) -> CodecResult<bool> {
    let mut filled = 0;
    while filled < header.len() {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(CodecError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated frame header",
                )));
            }
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(true)
}

/// Newline-delimited JSON codec
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLinesCodec;

impl PayloadCodec for JsonLinesCodec {
    fn name(&self) -> &'static str {
        "json_lines"
    }

    fn encode(&self, payload: &Payload) -> CodecResult<Vec<u8>> {
        let mut line = serde_json::to_vec(payload).map_err(|e| CodecError::Encode(e.to_string()))?;
        line.push(b'\n');
        Ok(line)
    }

    fn decode(&self, reader: &mut dyn BufRead) -> CodecResult<Option<Payload>> {
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                return Ok(None);
            }
            if line.len() > MAX_FRAME_BYTES {
                return Err(CodecError::FrameTooLarge(line.len()));
            }
            if line.trim().is_empty() {
                continue;
            }
            return serde_json::from_str(&line)
                .map(Some)
                .map_err(|e| CodecError::Decode(e.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::protocol::{CallbackRequestPayload, GoalId, ResultPayload, Target};
    use crate::engine::term::{ObjectId, Term};

    fn sample_stream() -> Vec<Payload> {
        vec![
            Payload::Result(ResultPayload {
                id: GoalId(3),
                succeeded: true,
                bindings: vec![Term::compound("f", vec![Term::Int(1), Term::Float(2.5)])],
                undefined: false,
                error: None,
            }),
            Payload::CallbackRequest(CallbackRequestPayload {
                id: 9,
                target: Target::Object(ObjectId(4)),
                operation: "size".to_string(),
                args: vec![Term::List(vec![Term::atom("x")]), Term::Nil],
                want_echo: true,
            }),
        ]
    }

    fn decode_all(codec: &dyn PayloadCodec, bytes: &[u8]) -> Vec<Payload> {
        let mut reader = bytes;
        let mut out = Vec::new();
        while let Some(payload) = codec.decode(&mut reader).expect("decode") {
            out.push(payload);
        }
        out
    }

    #[test]
    fn test_preserves_frames_back_to_back() {
        let codec = PreservesCodec;
        let mut bytes = Vec::new();
        for payload in sample_stream() {
            bytes.extend(codec.encode(&payload).expect("encode"));
        }

        assert_eq!(decode_all(&codec, &bytes), sample_stream());
    }

    #[test]
    fn test_json_lines_skips_blank_lines() {
        let codec = JsonLinesCodec;
        let mut bytes = b"\n".to_vec();
        for payload in sample_stream() {
            bytes.extend(codec.encode(&payload).expect("encode"));
        }

        assert_eq!(decode_all(&codec, &bytes), sample_stream());
    }

    #[test]
    fn test_truncated_frame_is_an_error() {
        let codec = PreservesCodec;
        let frame = codec.encode(&sample_stream()[0]).expect("encode");
        let mut reader = &frame[..frame.len() - 1];
        assert!(codec.decode(&mut reader).is_err());

        let mut header_only = &frame[..2];
        assert!(codec.decode(&mut header_only).is_err());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let header = (MAX_FRAME_BYTES as u32 + 1).to_le_bytes();
        let mut reader = &header[..];
        assert!(matches!(
            PreservesCodec.decode(&mut reader),
            Err(CodecError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn test_malformed_json_reports_decode_error() {
        let mut reader = &b"{not json}\n"[..];
        assert!(matches!(
            JsonLinesCodec.decode(&mut reader),
            Err(CodecError::Decode(_))
        ));
    }
}
