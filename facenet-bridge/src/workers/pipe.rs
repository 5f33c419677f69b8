//! Framed duplex pipe to a worker.
//!
//! Calls and replies are paired purely by order: the Nth reply frame read
//! belongs to the Nth call written. Keeping that pairing intact requires
//! that every call frame is followed by exactly one consumed reply frame,
//! including replies that fail to decode or exceed the size limit.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::codec::{self, BridgeReply, CodecError, FRAME_DELIMITER};
use crate::error::{BridgeError, Result};

/// Writer/reader pair that exchanges delimited records.
#[derive(Debug)]
pub struct FramedPipe<W, R> {
    writer: W,
    reader: R,
    max_frame_bytes: usize,
    record: Vec<u8>,
}

impl<W, R> FramedPipe<W, R>
where
    W: AsyncWrite + Unpin,
    R: AsyncBufRead + Unpin,
{
    pub fn new(writer: W, reader: R, max_frame_bytes: usize) -> Self {
        Self {
            writer,
            reader,
            max_frame_bytes,
            record: Vec::new(),
        }
    }

    /// Write one encoded record and flush it.
    pub async fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.writer
            .write_all(frame)
            .await
            .map_err(|e| BridgeError::WorkerCrashed(format!("failed to write call: {e}")))?;
        self.writer
            .flush()
            .await
            .map_err(|e| BridgeError::WorkerCrashed(format!("failed to flush call: {e}")))
    }

    /// Read and decode the next reply record, skipping blank lines.
    pub async fn recv_reply(&mut self) -> Result<BridgeReply> {
        loop {
            self.read_record().await?;
            let record = codec::trim_record(&self.record);
            if record.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return codec::decode_reply(record).map_err(|e| {
                warn!(error = %e, "Discarding malformed reply frame");
                BridgeError::from(e)
            });
        }
    }

    /// Send one call frame and read its reply.
    pub async fn round_trip(&mut self, frame: &[u8]) -> Result<BridgeReply> {
        self.send_frame(frame).await?;
        debug!(frame_len = frame.len(), "Call sent, awaiting reply");
        self.recv_reply().await
    }

    /// Fill `self.record` with the next record including its delimiter.
    ///
    /// An oversized record is drained up to its delimiter before the error
    /// is returned, so the following read starts on a record boundary.
    async fn read_record(&mut self) -> Result<()> {
        self.record.clear();
        let mut size = 0usize;
        let mut oversized = false;

        loop {
            let available = self
                .reader
                .fill_buf()
                .await
                .map_err(|e| BridgeError::WorkerCrashed(format!("failed to read reply: {e}")))?;

            if available.is_empty() {
                return Err(BridgeError::WorkerCrashed(if size == 0 {
                    "worker closed its output".to_string()
                } else {
                    format!("worker output ended inside a {size} byte frame")
                }));
            }

            let (chunk, complete) = match available.iter().position(|b| *b == FRAME_DELIMITER) {
                Some(pos) => (&available[..=pos], true),
                None => (available, false),
            };
            let consumed = chunk.len();
            size += consumed;

            if !oversized && size > self.max_frame_bytes {
                oversized = true;
                self.record.clear();
            }
            if !oversized {
                self.record.extend_from_slice(chunk);
            }
            self.reader.consume(consumed);

            if complete {
                if oversized {
                    return Err(CodecError::FrameTooLarge {
                        size,
                        limit: self.max_frame_bytes,
                    }
                    .into());
                }
                return Ok(());
            }
        }
    }
}
