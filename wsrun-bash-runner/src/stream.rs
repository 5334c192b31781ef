use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Result of a bounded line read.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadLineResult {
    Line(Vec<u8>),
    /// The line was longer than the limit; only the first `max_len` bytes
    /// are kept and the rest of the line was consumed.
    Truncated(Vec<u8>),
    Eof,
}

/// Read one line (including its `\n`, when present) with a size cap so a
/// process that never prints a newline cannot grow memory without bound.
///
/// A final line without a trailing newline is returned before `Eof`.
pub async fn read_line_with_limit<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max_len: usize,
) -> io::Result<ReadLineResult> {
    buf.clear();
    let mut consumed_any = false;
    let mut truncated = false;

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            if !consumed_any {
                return Ok(ReadLineResult::Eof);
            }
            return Ok(finish(buf, truncated));
        }
        consumed_any = true;

        let (chunk_len, found_newline) = match available.iter().position(|&b| b == b'\n') {
            Some(pos) => (pos + 1, true),
            None => (available.len(), false),
        };

        let room = max_len.saturating_sub(buf.len());
        if chunk_len > room {
            truncated = true;
        }
        buf.extend_from_slice(&available[..chunk_len.min(room)]);
        reader.consume(chunk_len);

        if found_newline {
            return Ok(finish(buf, truncated));
        }
    }
}

fn finish(buf: &mut Vec<u8>, truncated: bool) -> ReadLineResult {
    let line = std::mem::take(buf);
    if truncated {
        ReadLineResult::Truncated(line)
    } else {
        ReadLineResult::Line(line)
    }
}

/// Lossily decode a line and strip the trailing `\n` / `\r\n`.
pub fn decode_line(bytes: &[u8]) -> String {
    let mut end = bytes.len();
    if end > 0 && bytes[end - 1] == b'\n' {
        end -= 1;
        if end > 0 && bytes[end - 1] == b'\r' {
            end -= 1;
        }
    }
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}
