//! JSON-line codec over any async byte stream.
//!
//! Framing is one JSON object per line; the trailing `\n` is the delimiter.
//! [`FrameReader`] yields one decoded [`Frame`] per line and survives
//! malformed lines (logged and dropped). [`FrameWriter`] serializes every
//! write through a per-connection mutex spanning encode + newline, so
//! concurrent producers never interleave partial lines on the wire.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use crate::constants::MAX_LINE_BYTES;

use super::Frame;

/// Incremental frame decoder over a buffered read half.
///
/// Partial lines are reassembled internally by the `BufReader`; callers only
/// ever see complete frames.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: BufReader<R>,
    line: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap a read half.
    pub fn new(reader: R) -> Self {
        Self {
            inner: BufReader::new(reader),
            line: Vec::with_capacity(256),
        }
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` on clean end-of-stream. Malformed lines are logged
    /// and skipped without closing the connection; only transport errors and
    /// oversized lines are fatal.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            match self.next_line().await? {
                None => return Ok(None),
                Some(line) => {
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_slice::<Frame>(&line) {
                        Ok(frame) => return Ok(Some(frame)),
                        Err(e) => {
                            log::warn!(
                                "[frame] Dropping malformed line ({} bytes): {e}",
                                line.len()
                            );
                        }
                    }
                }
            }
        }
    }

    /// Read the next raw line, or any deserializable JSON value.
    ///
    /// Used by the server's client leg, where a line may be a control
    /// request rather than a frame.
    pub async fn next_message<T: serde::de::DeserializeOwned>(&mut self) -> Result<Option<T>> {
        loop {
            match self.next_line().await? {
                None => return Ok(None),
                Some(line) => {
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_slice::<T>(&line) {
                        Ok(msg) => return Ok(Some(msg)),
                        Err(e) => {
                            log::warn!(
                                "[frame] Dropping unparseable line ({} bytes): {e}",
                                line.len()
                            );
                        }
                    }
                }
            }
        }
    }

    /// Read one newline-delimited line, trimmed of the delimiter.
    ///
    /// Returns `Ok(None)` at EOF. A line that exceeds [`MAX_LINE_BYTES`]
    /// aborts the connection; that is a protocol violation, not noise.
    ///
    /// Cancel-safe: a partial line survives in the accumulator when the
    /// future is dropped mid-read (callers race this against tickers in
    /// `select!`), and the next call resumes where it left off.
    async fn next_line(&mut self) -> Result<Option<Vec<u8>>> {
        let n = self
            .inner
            .read_until(b'\n', &mut self.line)
            .await
            .context("frame read failed")?;
        if n == 0 && self.line.is_empty() {
            return Ok(None);
        }
        if self.line.len() > MAX_LINE_BYTES {
            bail!("frame line exceeds {MAX_LINE_BYTES} bytes");
        }
        // n == 0 with buffered bytes is EOF on an unterminated final line;
        // hand it out as-is.
        let mut line = std::mem::take(&mut self.line);
        while matches!(line.last(), Some(b'\n' | b'\r')) {
            line.pop();
        }
        Ok(Some(line))
    }
}

/// Shared, clonable write half with a per-connection mutex.
///
/// The mutex spans serialization and the newline so that two tasks writing
/// to the same connection can never interleave bytes within a line.
pub struct FrameWriter<W> {
    inner: Arc<Mutex<W>>,
}

impl<W> std::fmt::Debug for FrameWriter<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameWriter").finish_non_exhaustive()
    }
}

impl<W> Clone for FrameWriter<W> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Wrap a write half.
    pub fn new(writer: W) -> Self {
        Self {
            inner: Arc::new(Mutex::new(writer)),
        }
    }

    /// Encode and send one frame.
    pub async fn send(&self, frame: &Frame) -> Result<()> {
        self.send_value(frame).await
    }

    /// Encode and send any serializable message as one line.
    ///
    /// Used for control requests and the `status` reply, which share the
    /// connection with frames.
    pub async fn send_value<T: serde::Serialize>(&self, value: &T) -> Result<()> {
        let mut buf = serde_json::to_vec(value).context("frame encode failed")?;
        buf.push(b'\n');
        let mut writer = self.inner.lock().await;
        writer.write_all(&buf).await.context("frame write failed")?;
        writer.flush().await.context("frame flush failed")?;
        Ok(())
    }
}
