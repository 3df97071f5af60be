//! Stream framing for both wire transports.
//!
//! Two codecs share one delimiter-based decoder:
//!
//! ```text
//! Lines (TCP):   <envelope JSON>\n
//! Ipc (local):   {"type":"message","data":<envelope JSON>}\f
//! ```
//!
//! The `Ipc` form is the node-ipc peer framing, so a Rust process can sit on
//! either end of a local channel whose other end uses that library.
//!
//! A read may carry half a frame or several frames; [`FrameDecoder`] buffers
//! the trailing fragment until its delimiter arrives.

use serde_json::Value;

use crate::constants::MAX_FRAME_SIZE;

/// Frame-level decode failures. None of them poison the decoder.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// A frame exceeded the size limit and was skipped up to its delimiter.
    #[error("frame exceeds {limit} bytes; discarded")]
    TooLarge {
        /// Limit in bytes.
        limit: usize,
    },
    /// A frame was not valid UTF-8.
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,
    /// An ipc frame lacked the `{"type":"message","data":...}` wrapper.
    #[error("invalid ipc wrapper: {0}")]
    InvalidWrapper(String),
}

/// Which framing a connection uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireCodec {
    /// Newline-delimited JSON.
    Lines,
    /// node-ipc style form-feed-delimited wrapper.
    Ipc,
}

impl WireCodec {
    /// Frame terminator byte.
    pub fn delimiter(self) -> u8 {
        match self {
            Self::Lines => b'\n',
            Self::Ipc => 0x0c,
        }
    }

    /// A fresh decoder for this codec.
    pub fn decoder(self) -> FrameDecoder {
        FrameDecoder::new(self.delimiter())
    }

    /// Frames one serialized envelope for the wire.
    ///
    /// `json` must be a complete JSON document.
    pub fn encode(self, json: &str) -> Vec<u8> {
        let mut out = match self {
            Self::Lines => {
                let mut out = Vec::with_capacity(json.len() + 1);
                out.extend_from_slice(json.as_bytes());
                out
            }
            Self::Ipc => format!("{{\"type\":\"message\",\"data\":{json}}}").into_bytes(),
        };
        out.push(self.delimiter());
        out
    }

    /// Extracts the envelope text from one decoded frame.
    pub fn unwrap_frame(self, frame: String) -> Result<String, FrameError> {
        match self {
            Self::Lines => Ok(frame),
            Self::Ipc => {
                let wrapper: Value = serde_json::from_str(&frame)
                    .map_err(|e| FrameError::InvalidWrapper(e.to_string()))?;
                match wrapper.get("type").and_then(Value::as_str) {
                    Some("message") => {}
                    Some(other) => {
                        return Err(FrameError::InvalidWrapper(format!(
                            "unsupported ipc event {other:?}"
                        )))
                    }
                    None => return Err(FrameError::InvalidWrapper("missing type".to_string())),
                }
                wrapper
                    .get("data")
                    .map(Value::to_string)
                    .ok_or_else(|| FrameError::InvalidWrapper("missing data".to_string()))
            }
        }
    }

    /// Feeds bytes through `decoder` and unwraps every complete frame.
    pub fn decode(self, decoder: &mut FrameDecoder, bytes: &[u8]) -> Vec<Result<String, FrameError>> {
        decoder
            .feed(bytes)
            .into_iter()
            .map(|frame| frame.and_then(|f| self.unwrap_frame(f)))
            .collect()
    }
}

/// Stateful delimiter-based decoder.
///
/// Feed it bytes as they arrive; it returns every frame completed by those
/// bytes, in order. Empty and whitespace-only frames are skipped.
#[derive(Debug)]
pub struct FrameDecoder {
    delimiter: u8,
    buf: Vec<u8>,
    max_frame_size: usize,
    discarding: bool,
}

impl FrameDecoder {
    /// Creates a decoder splitting on `delimiter`.
    pub fn new(delimiter: u8) -> Self {
        Self {
            delimiter,
            buf: Vec::new(),
            max_frame_size: MAX_FRAME_SIZE,
            discarding: false,
        }
    }

    /// Overrides the frame size limit.
    pub fn with_max_frame_size(mut self, limit: usize) -> Self {
        self.max_frame_size = limit;
        self
    }

    /// Appends `bytes` and returns every frame they complete.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Result<String, FrameError>> {
        let mut frames = Vec::new();
        let mut rest = bytes;

        while let Some(pos) = rest.iter().position(|&b| b == self.delimiter) {
            let chunk = &rest[..pos];
            rest = &rest[pos + 1..];

            if self.discarding {
                // Tail of an oversized frame, already reported.
                self.discarding = false;
                self.buf.clear();
                continue;
            }
            if self.buf.len() + chunk.len() > self.max_frame_size {
                self.buf.clear();
                frames.push(Err(FrameError::TooLarge {
                    limit: self.max_frame_size,
                }));
                continue;
            }

            self.buf.extend_from_slice(chunk);
            let frame = std::mem::take(&mut self.buf);
            match String::from_utf8(frame) {
                Ok(text) if text.trim().is_empty() => {}
                Ok(text) => frames.push(Ok(text.trim_end_matches('\r').to_string())),
                Err(_) => frames.push(Err(FrameError::InvalidUtf8)),
            }
        }

        if !rest.is_empty() && !self.discarding {
            if self.buf.len() + rest.len() > self.max_frame_size {
                self.buf.clear();
                self.discarding = true;
                frames.push(Err(FrameError::TooLarge {
                    limit: self.max_frame_size,
                }));
            } else {
                self.buf.extend_from_slice(rest);
            }
        }

        frames
    }

    /// Returns true if a partial frame is buffered.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}
