//! Transport codec for the worker pipe.
//!
//! The pipe carries JSON Lines: every record is one compact JSON object
//! terminated by a single LF byte.
//!
//! - Call: `{"method": "align", "args": [...]}`
//! - Reply: `{"ok": true, "payload": ...}` or `{"ok": false, "error": "..."}`
//!
//! JSON string escaping keeps raw LF bytes out of a record, so the delimiter
//! never needs escaping. Pixel buffers travel as standard padded base64 text
//! followed by their `rows`, `cols` and `depth` as three positional integers.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Record delimiter shared by both ends of the pipe.
pub const FRAME_DELIMITER: u8 = b'\n';

/// Method name that asks the worker to exit its dispatch loop.
pub const QUIT_METHOD: &str = "quit";

/// Errors produced while encoding or decoding frames and payloads.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid base64 pixel buffer: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Buffer holds {actual} bytes but shape {rows}x{cols}x{depth} needs {expected}")]
    ShapeMismatch {
        rows: usize,
        cols: usize,
        depth: usize,
        expected: usize,
        actual: usize,
    },

    #[error("Unexpected payload: {0}")]
    UnexpectedPayload(String),

    #[error("Frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("Record contains a raw delimiter byte")]
    EmbeddedDelimiter,
}

/// An 8-bit image laid out as `[row][col][channel]`, stored flat in row-major order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageTensor {
    rows: usize,
    cols: usize,
    depth: usize,
    data: Vec<u8>,
}

impl ImageTensor {
    /// Wrap a flat row-major buffer. The buffer length must equal `rows * cols * depth`.
    pub fn new(rows: usize, cols: usize, depth: usize, data: Vec<u8>) -> Result<Self, CodecError> {
        let expected = Self::byte_len(rows, cols, depth)?;

        if data.len() != expected {
            return Err(CodecError::ShapeMismatch {
                rows,
                cols,
                depth,
                expected,
                actual: data.len(),
            });
        }

        Ok(Self {
            rows,
            cols,
            depth,
            data,
        })
    }

    /// Number of bytes in a `rows x cols x depth` buffer.
    pub fn byte_len(rows: usize, cols: usize, depth: usize) -> Result<usize, CodecError> {
        rows.checked_mul(cols)
            .and_then(|n| n.checked_mul(depth))
            .ok_or_else(|| CodecError::UnexpectedPayload(format!("shape {rows}x{cols}x{depth} overflows")))
    }

    /// Build a tensor from a nested `[row][col][channel]` array.
    ///
    /// Every row must have the same number of columns and every pixel the
    /// same number of channels.
    pub fn from_nested(nested: &[Vec<Vec<u8>>]) -> Result<Self, CodecError> {
        let rows = nested.len();
        let cols = nested.first().map_or(0, Vec::len);
        let depth = nested
            .first()
            .and_then(|row| row.first())
            .map_or(0, Vec::len);

        let mut data = Vec::with_capacity(rows * cols * depth);
        for (r, row) in nested.iter().enumerate() {
            if row.len() != cols {
                return Err(CodecError::UnexpectedPayload(format!(
                    "row {r} has {} columns, expected {cols}",
                    row.len()
                )));
            }
            for (c, pixel) in row.iter().enumerate() {
                if pixel.len() != depth {
                    return Err(CodecError::UnexpectedPayload(format!(
                        "pixel ({r}, {c}) has {} channels, expected {depth}",
                        pixel.len()
                    )));
                }
                data.extend_from_slice(pixel);
            }
        }

        Self::new(rows, cols, depth, data)
    }

    /// Decode a base64 pixel buffer and regroup it into the given shape.
    pub fn from_base64(text: &str, rows: usize, cols: usize, depth: usize) -> Result<Self, CodecError> {
        let data = STANDARD.decode(text.trim())?;
        Self::new(rows, cols, depth, data)
    }

    /// Encode the flat pixel buffer as standard padded base64.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.data)
    }

    /// Expand into a nested `[row][col][channel]` array.
    pub fn to_nested(&self) -> Vec<Vec<Vec<u8>>> {
        if self.depth == 0 || self.cols == 0 {
            return vec![vec![Vec::new(); self.cols]; self.rows];
        }
        self.data
            .chunks(self.cols * self.depth)
            .map(|row| row.chunks(self.depth).map(<[u8]>::to_vec).collect())
            .collect()
    }

    /// `(rows, cols, depth)`.
    pub const fn shape(&self) -> (usize, usize, usize) {
        (self.rows, self.cols, self.depth)
    }

    pub const fn rows(&self) -> usize {
        self.rows
    }

    pub const fn cols(&self) -> usize {
        self.cols
    }

    pub const fn depth(&self) -> usize {
        self.depth
    }

    /// The flat row-major buffer.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Channels of the pixel at `(row, col)`, if inside the image.
    pub fn pixel(&self, row: usize, col: usize) -> Option<&[u8]> {
        if row >= self.rows || col >= self.cols {
            return None;
        }
        let start = (row * self.cols + col) * self.depth;
        self.data.get(start..start + self.depth)
    }

    /// Encode as a base64 buffer argument.
    pub fn to_buffer(&self) -> EncodedBuffer {
        EncodedBuffer {
            base64: self.to_base64(),
            rows: self.rows,
            cols: self.cols,
            depth: self.depth,
        }
    }
}

/// A base64 pixel buffer plus the shape needed to regroup it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedBuffer {
    pub base64: String,
    pub rows: usize,
    pub cols: usize,
    pub depth: usize,
}

impl EncodedBuffer {
    /// Read a buffer from four positional call arguments: text, rows, cols, depth.
    pub fn from_args(args: &[Value]) -> Result<Self, CodecError> {
        let [text, rows, cols, depth] = args else {
            return Err(CodecError::UnexpectedPayload(format!(
                "expected 4 buffer arguments, got {}",
                args.len()
            )));
        };

        let base64 = text
            .as_str()
            .ok_or_else(|| CodecError::UnexpectedPayload("buffer text is not a string".into()))?
            .to_string();

        Ok(Self {
            base64,
            rows: dimension(rows, "rows")?,
            cols: dimension(cols, "cols")?,
            depth: dimension(depth, "depth")?,
        })
    }

    /// Decode into an image tensor.
    pub fn decode(&self) -> Result<ImageTensor, CodecError> {
        ImageTensor::from_base64(&self.base64, self.rows, self.cols, self.depth)
    }
}

fn dimension(value: &Value, name: &str) -> Result<usize, CodecError> {
    value
        .as_u64()
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| CodecError::UnexpectedPayload(format!("{name} is not a non-negative integer")))
}

/// One positional argument of a bridge call.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeArg {
    /// A primitive or nested structure sent as plain JSON.
    Json(Value),
    /// A pixel buffer; expands to four positional values on the wire.
    Buffer(EncodedBuffer),
}

/// A method name plus its ordered arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeCall {
    method: String,
    args: Vec<BridgeArg>,
}

impl BridgeCall {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            args: Vec::new(),
        }
    }

    /// Append a JSON argument.
    #[must_use]
    pub fn with_value(mut self, value: impl Into<Value>) -> Self {
        self.args.push(BridgeArg::Json(value.into()));
        self
    }

    /// Append a base64 buffer argument.
    #[must_use]
    pub fn with_buffer(mut self, buffer: EncodedBuffer) -> Self {
        self.args.push(BridgeArg::Buffer(buffer));
        self
    }

    /// Append an image as a base64 buffer argument.
    #[must_use]
    pub fn with_image(self, image: &ImageTensor) -> Self {
        self.with_buffer(image.to_buffer())
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn args(&self) -> &[BridgeArg] {
        &self.args
    }

    /// Lower to the wire record, expanding buffers into positional values.
    pub fn to_frame(&self) -> CallFrame {
        let mut args = Vec::with_capacity(self.args.len());
        for arg in &self.args {
            match arg {
                BridgeArg::Json(value) => args.push(value.clone()),
                BridgeArg::Buffer(buffer) => {
                    args.push(Value::String(buffer.base64.clone()));
                    args.push(buffer.rows.into());
                    args.push(buffer.cols.into());
                    args.push(buffer.depth.into());
                }
            }
        }
        CallFrame {
            method: self.method.clone(),
            args,
        }
    }
}

/// Call record as it appears on the wire.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CallFrame {
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

/// Outcome reported by the worker for one call.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeReply {
    Ok(Value),
    Failed(String),
}

#[derive(Serialize, Deserialize, Debug)]
struct ReplyFrame {
    ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Encode a call as one delimited record.
pub fn encode_call(call: &BridgeCall) -> Result<Vec<u8>, CodecError> {
    finish_record(serde_json::to_vec(&call.to_frame())?)
}

/// Decode one call record. Used by worker implementations.
pub fn decode_call(record: &[u8]) -> Result<CallFrame, CodecError> {
    Ok(serde_json::from_slice(trim_record(record))?)
}

/// Encode a reply as one delimited record.
pub fn encode_reply(reply: &BridgeReply) -> Result<Vec<u8>, CodecError> {
    let frame = match reply {
        BridgeReply::Ok(payload) => ReplyFrame {
            ok: true,
            payload: Some(payload.clone()),
            error: None,
        },
        BridgeReply::Failed(message) => ReplyFrame {
            ok: false,
            payload: None,
            error: Some(message.clone()),
        },
    };
    finish_record(serde_json::to_vec(&frame)?)
}

/// Decode one reply record.
pub fn decode_reply(record: &[u8]) -> Result<BridgeReply, CodecError> {
    let frame: ReplyFrame = serde_json::from_slice(trim_record(record))?;
    if frame.ok {
        Ok(BridgeReply::Ok(frame.payload.unwrap_or(Value::Null)))
    } else {
        Ok(BridgeReply::Failed(frame.error.unwrap_or_else(|| {
            "worker reported a failure without a message".to_string()
        })))
    }
}

/// Strip the delimiter and an optional CR before it.
pub fn trim_record(record: &[u8]) -> &[u8] {
    let record = record.strip_suffix(&[FRAME_DELIMITER]).unwrap_or(record);
    record.strip_suffix(b"\r").unwrap_or(record)
}

fn finish_record(mut bytes: Vec<u8>) -> Result<Vec<u8>, CodecError> {
    if bytes.contains(&FRAME_DELIMITER) {
        return Err(CodecError::EmbeddedDelimiter);
    }
    bytes.push(FRAME_DELIMITER);
    Ok(bytes)
}
