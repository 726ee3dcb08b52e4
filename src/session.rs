//! Per-connection chat session.
//!
//! Each accepted connection runs one [`Session`], which walks the state
//! machine below until the peer disconnects or an I/O call fails:
//!
//! ```text
//! Greeting -> AwaitUsername -> Ready
//!     -> { SendPrompt -> AwaitMessage -> AppendHistory -> Echo } loop
//!     -> Closed
//! ```

use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, trace};

use crate::config::Config;
use crate::history::{History, Message};
use crate::protocol::{self, LineReader};

/// Session-level settings derived from the server configuration
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Buffer size for usernames and messages, terminator slot included
    pub message_capacity: usize,
    /// Longest inbound line in bytes
    pub max_line_len: usize,
}

impl From<&Config> for SessionConfig {
    fn from(config: &Config) -> Self {
        Self {
            message_capacity: config.message_capacity,
            max_line_len: config.max_line_len,
        }
    }
}

/// Protocol state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Greeting,
    AwaitUsername,
    Ready,
    SendPrompt,
    AwaitMessage,
    AppendHistory,
    Echo,
    Closed,
}

/// One client's protocol state and line buffers.
pub struct Session<R, W> {
    reader: LineReader<R>,
    writer: W,
    history: Arc<History>,
    message_capacity: usize,
    state: SessionState,
    username: Option<Message>,
    /// Message travelling from AwaitMessage through Echo
    message: Option<String>,
}

impl<R, W> Session<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W, history: Arc<History>, config: SessionConfig) -> Self {
        Self {
            reader: LineReader::new(reader, config.max_line_len),
            writer,
            history,
            message_capacity: config.message_capacity,
            state: SessionState::Greeting,
            username: None,
            message: None,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_ref().map(Message::as_str)
    }

    /// Drive the session until it closes.
    ///
    /// Returns `Ok(())` when the peer disconnects and the I/O error
    /// otherwise. Either way the session ends in [`SessionState::Closed`].
    pub async fn run(&mut self) -> io::Result<()> {
        while self.state != SessionState::Closed {
            match self.step().await {
                Ok(next) => {
                    trace!(from = ?self.state, to = ?next, "Session transition");
                    self.state = next;
                }
                Err(e) => {
                    self.state = SessionState::Closed;
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Perform the work of the current state and return the next one.
    async fn step(&mut self) -> io::Result<SessionState> {
        let next = match self.state {
            SessionState::Greeting => {
                self.send(protocol::USERNAME_PROMPT).await?;
                SessionState::AwaitUsername
            }

            SessionState::AwaitUsername => match self.reader.read_line().await? {
                Some(line) => {
                    let (username, _) =
                        Message::new(protocol::strip_line_ending(&line.text), self.message_capacity);
                    info!(username = %username, "New user");
                    self.username = Some(username);
                    SessionState::Ready
                }
                None => SessionState::Closed,
            },

            SessionState::Ready => {
                let greeting = protocol::greeting(self.username().unwrap_or_default());
                self.send(&greeting).await?;
                SessionState::SendPrompt
            }

            SessionState::SendPrompt => {
                self.send(protocol::SEND_PROMPT).await?;
                SessionState::AwaitMessage
            }

            SessionState::AwaitMessage => match self.reader.read_line().await? {
                Some(line) => {
                    self.message = Some(protocol::strip_line_ending(&line.text).to_string());
                    SessionState::AppendHistory
                }
                None => SessionState::Closed,
            },

            SessionState::AppendHistory => {
                let text = self.message.take().unwrap_or_default();
                let (stored, _) = self.history.record(&text);
                self.message = Some(stored.into_string());
                SessionState::Echo
            }

            SessionState::Echo => {
                let text = self.message.take().unwrap_or_default();
                self.send(&protocol::echo(&text)).await?;
                SessionState::SendPrompt
            }

            SessionState::Closed => SessionState::Closed,
        };

        Ok(next)
    }

    async fn send(&mut self, text: &str) -> io::Result<()> {
        self.writer.write_all(text.as_bytes()).await
    }
}

/// Run the chat protocol on an accepted TCP connection.
///
/// The connection is closed when this returns.
pub async fn handle_connection(
    stream: TcpStream,
    history: Arc<History>,
    config: SessionConfig,
) -> io::Result<()> {
    let (reader, writer) = stream.into_split();
    let mut session = Session::new(reader, writer, history, config);

    let result = session.run().await;
    debug!(username = session.username().unwrap_or("-"), "Session ended");
    result
}
