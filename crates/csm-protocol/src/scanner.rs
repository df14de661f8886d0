//! Newline framing over the agent's stdout.
//!
//! Tool results (whole files, long command output) arrive as single lines,
//! so the per-line ceiling is large. Each returned line is an owned copy;
//! the scanner's buffer is reused for the next read.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

/// Default maximum length of one line (32 MiB).
pub const DEFAULT_MAX_LINE_BYTES: usize = 32 * 1024 * 1024;

/// Initial capacity of the line buffer.
const INITIAL_LINE_CAPACITY: usize = 64 * 1024;

/// Errors that end scanning.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("I/O error reading stream: {0}")]
    Io(#[from] std::io::Error),

    #[error("line {line} exceeds maximum length of {max} bytes")]
    LineTooLong { max: usize, line: u64 },
}

/// Splits an async byte stream into lines.
pub struct LineScanner<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
    max_line_bytes: usize,
    lines_read: u64,
}

impl<R: AsyncRead + Unpin> LineScanner<R> {
    pub fn new(reader: R) -> Self {
        Self::with_max_line_bytes(reader, DEFAULT_MAX_LINE_BYTES)
    }

    pub fn with_max_line_bytes(reader: R, max_line_bytes: usize) -> Self {
        Self {
            reader: BufReader::new(reader),
            buf: Vec::with_capacity(INITIAL_LINE_CAPACITY.min(max_line_bytes)),
            max_line_bytes,
            lines_read: 0,
        }
    }

    /// Number of lines returned so far.
    pub fn lines_read(&self) -> u64 {
        self.lines_read
    }

    /// Reads the next line, without its `\n` (or `\r\n`).
    ///
    /// Returns `Ok(None)` at end of stream. A final line without a trailing
    /// newline is still returned. A line longer than the limit is an error;
    /// the stream is left mid-line and should not be read further.
    pub async fn next_line(&mut self) -> Result<Option<Vec<u8>>, ScanError> {
        self.buf.clear();

        let limit = self.max_line_bytes as u64 + 1;
        let n = (&mut self.reader)
            .take(limit)
            .read_until(b'\n', &mut self.buf)
            .await?;
        if n == 0 {
            return Ok(None);
        }

        let terminated = self.buf.last() == Some(&b'\n');
        if !terminated && self.buf.len() > self.max_line_bytes {
            return Err(ScanError::LineTooLong {
                max: self.max_line_bytes,
                line: self.lines_read + 1,
            });
        }

        if terminated {
            self.buf.pop();
            if self.buf.last() == Some(&b'\r') {
                self.buf.pop();
            }
        }

        self.lines_read += 1;
        Ok(Some(self.buf.clone()))
    }
}
