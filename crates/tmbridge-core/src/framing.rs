//! Newline framing for the worker's output stream.
//!
//! The worker writes one message per line, but the pipe delivers bytes at
//! whatever granularity the OS chooses. [`LineFramer`] reassembles those
//! chunks into complete lines; [`FramedReader`] drives it from any
//! `AsyncRead`.

use bytes::BytesMut;
use std::collections::VecDeque;
use tokio::io::{AsyncRead, AsyncReadExt};

const READ_CHUNK: usize = 8 * 1024;

/// Incremental line splitter that keeps an incomplete trailing fragment.
#[derive(Debug, Default)]
pub struct LineFramer {
    buffer: BytesMut,
    /// Bytes at the front of `buffer` already known to hold no `\n`.
    scanned: usize,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes and return every line it completes, in order.
    ///
    /// Returned lines carry no terminator; a `\r` before the `\n` is also
    /// stripped. Bytes after the last `\n` stay buffered for the next call.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();

        while let Some(offset) = self.buffer[self.scanned..].iter().position(|&b| b == b'\n') {
            let end = self.scanned + offset;
            let mut line = self.buffer.split_to(end + 1);
            line.truncate(end);
            if line.last() == Some(&b'\r') {
                line.truncate(end - 1);
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
            self.scanned = 0;
        }
        self.scanned = self.buffer.len();

        lines
    }

    /// Number of buffered bytes belonging to an incomplete line.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Take the unterminated trailing fragment, if any. Used at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        self.scanned = 0;
        if self.buffer.is_empty() {
            return None;
        }
        let rest = self.buffer.split();
        let rest = rest.strip_suffix(b"\r").unwrap_or(&rest[..]);
        Some(String::from_utf8_lossy(rest).into_owned())
    }
}

/// Lazy sequence of lines read from an async byte stream.
pub struct FramedReader<R> {
    inner: R,
    framer: LineFramer,
    ready: VecDeque<String>,
    chunk: Box<[u8]>,
    eof: bool,
}

impl<R: AsyncRead + Unpin> FramedReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            framer: LineFramer::new(),
            ready: VecDeque::new(),
            chunk: vec![0u8; READ_CHUNK].into_boxed_slice(),
            eof: false,
        }
    }

    /// Next complete line, or `None` once the stream is exhausted.
    ///
    /// A final line without a trailing newline is still delivered at EOF.
    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        loop {
            if let Some(line) = self.ready.pop_front() {
                return Ok(Some(line));
            }
            if self.eof {
                return Ok(None);
            }
            let n = self.inner.read(&mut self.chunk).await?;
            if n == 0 {
                self.eof = true;
                let pending = self.framer.pending_len();
                if pending > 0 {
                    tracing::trace!(pending, "Stream ended without a final newline");
                }
                if let Some(rest) = self.framer.finish() {
                    self.ready.push_back(rest);
                }
                continue;
            }
            self.ready.extend(self.framer.feed(&self.chunk[..n]));
        }
    }
}
