//! Newline-delimited line reassembly over an async byte stream.
//!
//! The reader never blocks longer than its poll timeout, so the caller can
//! interleave flush deadlines and shutdown checks with reads.

use bytes::{Buf, BytesMut};
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, trace};

const READ_CHUNK: usize = 256;

/// Faults on a single line. None of these end the stream.
#[derive(Debug, Error)]
pub enum LineReaderError {
    #[error("Line is not valid UTF-8 ({len} bytes dropped)")]
    InvalidEncoding { len: usize },

    #[error("Line exceeded {limit} bytes without a terminator ({len} bytes dropped)")]
    Oversized { len: usize, limit: usize },

    #[error("Stream read failed: {0}")]
    Io(#[from] io::Error),
}

/// Result of one `next_line` call.
#[derive(Debug)]
pub enum ReadOutcome {
    /// A complete line with terminators trimmed.
    Line(String),
    /// The poll timeout elapsed without a complete line.
    Idle,
    /// The stream reported end of file.
    EndOfStream,
    /// A single line or read was lost; the stream is still usable.
    TransientError(LineReaderError),
}

/// Reassembles text lines from a byte stream.
pub struct LineReader<R> {
    stream: R,
    buffer: BytesMut,
    poll_timeout: Duration,
    max_line_bytes: usize,
    /// Set after an oversized partial line; bytes are skipped through the
    /// next terminator.
    discarding: bool,
    eof: bool,
}

impl<R> LineReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(stream: R, poll_timeout: Duration, max_line_bytes: usize) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(max_line_bytes.min(8192)),
            poll_timeout,
            max_line_bytes,
            discarding: false,
            eof: false,
        }
    }

    /// Wait for the next complete line, at most one poll timeout.
    ///
    /// Cancel safe: bytes are only moved into the internal buffer after a
    /// read completes, so dropping the future loses nothing.
    pub async fn next_line(&mut self) -> ReadOutcome {
        let deadline = tokio::time::Instant::now() + self.poll_timeout;

        loop {
            if let Some(outcome) = self.take_buffered_line() {
                return outcome;
            }

            if self.eof {
                return ReadOutcome::EndOfStream;
            }

            let mut chunk = [0u8; READ_CHUNK];
            let read = tokio::time::timeout_at(deadline, self.stream.read(&mut chunk)).await;

            match read {
                Err(_elapsed) => return ReadOutcome::Idle,
                Ok(Ok(0)) => {
                    self.eof = true;
                    if !self.buffer.is_empty() {
                        debug!(
                            bytes = self.buffer.len(),
                            "Stream ended with an unterminated line"
                        );
                    }
                }
                Ok(Ok(n)) => {
                    trace!(bytes = n, "Read from stream");
                    self.buffer.extend_from_slice(&chunk[..n]);
                }
                Ok(Err(e))
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
                    ) =>
                {
                    continue;
                }
                Ok(Err(e)) if e.kind() == io::ErrorKind::TimedOut => return ReadOutcome::Idle,
                Ok(Err(e)) => return ReadOutcome::TransientError(LineReaderError::Io(e)),
            }
        }
    }

    /// Drop any unterminated bytes, returning how many were discarded.
    pub fn discard_partial(&mut self) -> usize {
        let len = self.buffer.len();
        self.buffer.clear();
        self.discarding = false;
        len
    }

    /// Bytes buffered without a terminator yet.
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    fn take_buffered_line(&mut self) -> Option<ReadOutcome> {
        let newline = self.buffer.iter().position(|&b| b == b'\n');

        if self.discarding {
            match newline {
                Some(pos) => {
                    self.buffer.advance(pos + 1);
                    self.discarding = false;
                    trace!(bytes = pos + 1, "Skipped rest of oversized line");
                }
                None => {
                    let len = self.buffer.len();
                    self.buffer.advance(len);
                    return None;
                }
            }
            return self.take_buffered_line();
        }

        match newline {
            Some(pos) => {
                let frame = self.buffer.split_to(pos + 1);
                let len = trim_terminators(&frame).len();
                if len > self.max_line_bytes {
                    return Some(ReadOutcome::TransientError(LineReaderError::Oversized {
                        len,
                        limit: self.max_line_bytes,
                    }));
                }
                Some(decode_line(&frame))
            }
            // A trailing '\r' may still be followed by its '\n'
            None if trim_terminators(&self.buffer).len() > self.max_line_bytes => {
                let len = self.buffer.len();
                self.buffer.advance(len);
                self.discarding = true;
                Some(ReadOutcome::TransientError(LineReaderError::Oversized {
                    len,
                    limit: self.max_line_bytes,
                }))
            }
            None => None,
        }
    }
}

fn decode_line(frame: &[u8]) -> ReadOutcome {
    let trimmed = trim_terminators(frame);
    match std::str::from_utf8(trimmed) {
        Ok(text) => ReadOutcome::Line(text.to_string()),
        Err(_) => ReadOutcome::TransientError(LineReaderError::InvalidEncoding { len: frame.len() }),
    }
}

fn trim_terminators(mut frame: &[u8]) -> &[u8] {
    while let [rest @ .., b'\n' | b'\r'] = frame {
        frame = rest;
    }
    frame
}
