//! Line-wise draining of a child's output stream.
//!
//! Each redirected stream gets its own task running [`collect_lines`] from the moment the
//! process starts, so a child blocked on a full stderr pipe can never wait on us reading
//! stdout first.

use std::fmt;
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{trace, warn};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Stdout => f.write_str("stdout"),
            StreamKind::Stderr => f.write_str("stderr"),
        }
    }
}

/// Append-only text accumulated from one stream.
#[derive(Debug, Default)]
pub struct TextBuffer {
    text: Mutex<String>,
}

impl TextBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, chunk: &str) {
        self.text.lock().push_str(chunk);
    }

    pub fn snapshot(&self) -> String {
        self.text.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.text.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Read `reader` until end-of-stream.
///
/// Raw text is appended to `buffer` exactly as received; every non-blank line (split on
/// `\n` or `\r`) is handed to `on_line` in order. An error from `on_line` stops the read
/// and is returned. A read error ends the stream.
pub async fn collect_lines<R, F>(
    reader: R,
    buffer: Arc<TextBuffer>,
    stream: StreamKind,
    mut on_line: F,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    F: FnMut(&str) -> Result<()>,
{
    let mut reader = BufReader::new(reader);
    let mut segment = Vec::with_capacity(256);
    let mut lines = 0usize;

    loop {
        segment.clear();
        match read_segment(&mut reader, &mut segment).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(%stream, error = %e, "Read failed, treating stream as closed");
                break;
            }
        }

        let text = String::from_utf8_lossy(&segment);
        buffer.append(&text);

        let line = text.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            continue;
        }
        lines += 1;
        on_line(line)?;
    }

    trace!(%stream, lines, "End of stream");
    Ok(())
}

/// Read up to and including the next `\n` or `\r`. Returns 0 at end-of-stream.
async fn read_segment<R>(reader: &mut R, segment: &mut Vec<u8>) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut total = 0;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(total);
        }
        match available.iter().position(|b| *b == b'\n' || *b == b'\r') {
            Some(end) => {
                segment.extend_from_slice(&available[..=end]);
                reader.consume(end + 1);
                return Ok(total + end + 1);
            }
            None => {
                let len = available.len();
                segment.extend_from_slice(available);
                reader.consume(len);
                total += len;
            }
        }
    }
}
