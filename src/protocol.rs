//! Chat wire protocol: prompts, echo formatting and line framing.
//!
//! Plaintext, newline-delimited, no length prefix:
//!
//! ```text
//! S: Hello user. Choose a username:
//! C: <username>\n
//! S: Hello <username>!\n
//! loop:
//!   S: Send:
//!   C: <message>\n
//!   S: \x1b[4mLinus\x1b[0m: <message>\n
//! ```
//!
//! The sender label in the echo is a fixed persona, not the session's
//! username.

use bytes::BytesMut;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::warn;

/// First thing every client sees
pub const USERNAME_PROMPT: &str = "Hello user. Choose a username: ";

/// Sent before every message read
pub const SEND_PROMPT: &str = "Send: ";

/// Name shown on every echoed message
pub const SENDER_LABEL: &str = "Linus";

const UNDERLINE: &str = "\x1b[4m";
const RESET: &str = "\x1b[0m";

/// Initial read buffer size
const READ_BUFFER_SIZE: usize = 4 * 1024;

/// Personalized greeting sent once the username is known
pub fn greeting(username: &str) -> String {
    format!("Hello {username}!\n")
}

/// Echo line sent back to the author of `message`
pub fn echo(message: &str) -> String {
    format!("{UNDERLINE}{SENDER_LABEL}{RESET}: {message}\n")
}

/// Remove one trailing `\n` and then one trailing `\r`, if present.
pub fn strip_line_ending(text: &str) -> &str {
    match text.strip_suffix('\n') {
        Some(rest) => rest.strip_suffix('\r').unwrap_or(rest),
        None => text,
    }
}

/// One logical line read from a client, terminator included
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub text: String,
    /// Content past `max_line_len` was discarded
    pub truncated: bool,
}

/// Reassembles newline-terminated lines from any number of partial reads.
///
/// Lines whose content exceeds `max_line_len` bytes are cut to at most that
/// length, backed off to a UTF-8 character boundary, and the rest, up to and
/// including the next `\n`, is dropped.
pub struct LineReader<R> {
    inner: R,
    buffer: BytesMut,
    max_line_len: usize,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(inner: R, max_line_len: usize) -> Self {
        let initial = READ_BUFFER_SIZE.min(max_line_len.saturating_add(1));
        Self {
            inner,
            buffer: BytesMut::with_capacity(initial),
            max_line_len,
        }
    }

    /// Read the next line.
    ///
    /// Returns `Ok(None)` once the peer has closed and nothing is buffered.
    /// Bytes left over at EOF without a terminator form a final line.
    pub async fn read_line(&mut self) -> io::Result<Option<Line>> {
        let mut line = BytesMut::new();
        let mut truncated = false;

        loop {
            let newline = self.buffer.iter().position(|&b| b == b'\n');
            let take = newline.map_or(self.buffer.len(), |pos| pos + 1);
            let chunk = self.buffer.split_to(take);

            let content_len = if newline.is_some() {
                chunk.len() - 1
            } else {
                chunk.len()
            };
            let room = self.max_line_len.saturating_sub(line.len());

            if content_len > room {
                line.extend_from_slice(&chunk[..room]);
                truncated = true;
            } else {
                line.extend_from_slice(&chunk);
            }

            if newline.is_some() {
                return Ok(Some(self.finish(line, truncated)));
            }

            if self.inner.read_buf(&mut self.buffer).await? == 0 {
                if line.is_empty() && !truncated {
                    return Ok(None);
                }
                return Ok(Some(self.finish(line, truncated)));
            }
        }
    }

    fn finish(&self, mut line: BytesMut, truncated: bool) -> Line {
        if truncated {
            line.truncate(utf8_prefix_len(&line));
            warn!(max_line_len = self.max_line_len, "Inbound line too long, truncated");
        }
        Line {
            text: String::from_utf8_lossy(&line).into_owned(),
            truncated,
        }
    }
}

/// Length of `bytes` without a multi-byte sequence left incomplete at the end.
fn utf8_prefix_len(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for back in 1..=len.min(4) {
        let byte = bytes[len - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let width = match byte {
            0xF0..=0xFF => 4,
            0xE0..=0xEF => 3,
            0xC0..=0xDF => 2,
            _ => 1,
        };
        return if width > back { len - back } else { len };
    }
    len
}
