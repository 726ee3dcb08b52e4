//! TCP listener and acceptor for chat sessions.
//!
//! Binds the listening socket (stepping to the next port on conflict),
//! accepts connections and spawns one session task per connection until a
//! termination condition arrives.

use crate::config::{Config, ConfigError};
use crate::errno::io_errno_name;
use crate::history::History;
use crate::registry::SessionRegistry;
use crate::session::{self, SessionConfig};
use crate::shutdown::{ShutdownSignal, TerminationSignal};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Server instance
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    history: Arc<History>,
    registry: Arc<SessionRegistry>,
    connection_limit: Arc<Semaphore>,
    max_sessions: usize,
    session_config: SessionConfig,
}

impl Server {
    /// Bind the listening socket and prepare shared state.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(config: &Config) -> Result<Self, ServerError> {
        config.validate().map_err(ServerError::Config)?;

        let std_listener = bind_listener(
            &config.host,
            config.port,
            config.backlog,
            config.max_port_attempts,
        )?;
        let listener = TcpListener::from_std(std_listener).map_err(ServerError::Listen)?;
        let local_addr = listener.local_addr().map_err(ServerError::Listen)?;

        debug!(address = %local_addr, backlog = config.backlog, "Listening socket ready");

        Ok(Server {
            listener,
            local_addr,
            history: History::new(config.history_capacity, config.message_capacity),
            registry: SessionRegistry::new(),
            connection_limit: Arc::new(Semaphore::new(config.max_sessions)),
            max_sessions: config.max_sessions,
            session_config: SessionConfig::from(config),
        })
    }

    /// Address actually bound, which may differ from the configured port.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[cfg(test)]
    pub fn history(&self) -> &Arc<History> {
        &self.history
    }

    #[cfg(test)]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Accept connections until `shutdown` resolves.
    ///
    /// On shutdown the listening socket is closed, every live session is
    /// asked to stop, and the triggering condition is returned.
    pub async fn run(self, mut shutdown: ShutdownSignal) -> TerminationSignal {
        let signal = loop {
            tokio::select! {
                signal = shutdown.recv() => break signal,

                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_session(stream, peer),
                    Err(e) => {
                        error!(error = %e, errno = io_errno_name(&e), "Failed to accept connection");
                    }
                },
            }
        };

        let Server {
            listener,
            local_addr,
            history,
            registry,
            ..
        } = self;

        drop(listener);
        info!(address = %local_addr, signal = %signal, "Listening socket closed");

        debug!(count = registry.len(), peers = ?registry.peers(), "Open sessions at shutdown");
        debug!(count = history.len(), entries = ?history.dump(), "Message history at shutdown");

        let stopped = registry.stop_all();
        if stopped > 0 {
            info!(sessions = stopped, "Asked open sessions to stop");
        }

        signal
    }

    /// Start a session task for an accepted connection.
    ///
    /// Over the session limit the connection is closed right away.
    fn spawn_session(&self, stream: TcpStream, peer: SocketAddr) {
        let permit = match Arc::clone(&self.connection_limit).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(
                    peer = %peer,
                    max_sessions = self.max_sessions,
                    "Session limit reached, closing connection"
                );
                drop(stream);
                return;
            }
        };

        let (id, stop) = self.registry.register(peer);
        info!(peer = %peer, session = id, "Incoming connection");

        let history = Arc::clone(&self.history);
        let registry = Arc::clone(&self.registry);
        let config = self.session_config;

        tokio::spawn(async move {
            tokio::select! {
                result = session::handle_connection(stream, history, config) => match result {
                    Ok(()) => debug!(peer = %peer, session = id, "Connection closed by client"),
                    Err(e) => warn!(
                        peer = %peer,
                        session = id,
                        error = %e,
                        errno = io_errno_name(&e),
                        "Session I/O error"
                    ),
                },
                _ = stop => debug!(peer = %peer, session = id, "Session stopped for shutdown"),
            }

            registry.deregister(id);
            drop(permit);
        });
    }
}

/// Create the listening socket on `host`, starting at `port`.
///
/// When a port is taken the next one is tried, up to `max_attempts` ports
/// in total. The returned listener is non-blocking.
pub fn bind_listener(
    host: &str,
    port: u16,
    backlog: i32,
    max_attempts: u16,
) -> Result<std::net::TcpListener, ServerError> {
    let ip: Ipv4Addr = host
        .parse()
        .map_err(|_| ServerError::InvalidAddress(host.to_string()))?;

    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .map_err(ServerError::SocketCreate)?;
    debug!(address = %ip, "Created socket");

    let first = port;
    let mut port = port;
    let mut attempts = 1;

    loop {
        let addr = SocketAddr::V4(SocketAddrV4::new(ip, port));
        match socket.bind(&addr.into()) {
            Ok(()) => break,
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                if attempts >= max_attempts.max(1) || port == u16::MAX {
                    return Err(ServerError::PortsExhausted { first, last: port });
                }
                debug!(port, "Port in use, trying next");
                attempts += 1;
                port += 1;
            }
            Err(e) => return Err(ServerError::Bind { port, source: e }),
        }
    }

    if port != first {
        warn!(requested = first, port, "Requested port in use, bound next free port");
    }

    socket.listen(backlog).map_err(ServerError::Listen)?;
    socket.set_nonblocking(true).map_err(ServerError::Listen)?;

    Ok(socket.into())
}

/// Listener setup errors
#[derive(Debug)]
pub enum ServerError {
    Config(ConfigError),
    InvalidAddress(String),
    SocketCreate(io::Error),
    Bind { port: u16, source: io::Error },
    PortsExhausted { first: u16, last: u16 },
    Listen(io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Config(e) => write!(f, "{e}"),
            ServerError::InvalidAddress(host) => write!(f, "Invalid IPv4 address '{host}'"),
            ServerError::SocketCreate(e) => write!(f, "Failed to create socket: {e}"),
            ServerError::Bind { port, source } => {
                write!(f, "Failed to bind port {port}: {source}")
            }
            ServerError::PortsExhausted { first, last } => {
                write!(f, "No free port between {first} and {last}")
            }
            ServerError::Listen(e) => write!(f, "Failed to listen on socket: {e}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Config(e) => Some(e),
            ServerError::SocketCreate(e)
            | ServerError::Bind { source: e, .. }
            | ServerError::Listen(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::ShutdownController;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const USERNAME_PROMPT: &[u8] = b"Hello user. Choose a username: ";

    fn test_config() -> Config {
        Config {
            port: 0,
            ..Config::default()
        }
    }

    async fn expect(stream: &mut TcpStream, expected: &[u8]) {
        let mut buf = vec![0u8; expected.len()];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, expected, "got {:?}", String::from_utf8_lossy(&buf));
    }

    async fn wait_until_empty(registry: &SessionRegistry) {
        for _ in 0..100 {
            if registry.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("sessions still registered: {:?}", registry.peers());
    }

    #[test]
    fn test_bind_falls_back_to_next_port() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let taken_port = taken.local_addr().unwrap().port();

        let listener = bind_listener("127.0.0.1", taken_port, 16, 100).unwrap();
        let bound = listener.local_addr().unwrap().port();

        assert!(bound > taken_port);
        assert!(bound < taken_port.saturating_add(100));
    }

    #[test]
    fn test_bind_gives_up_after_max_attempts() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let taken_port = taken.local_addr().unwrap().port();

        match bind_listener("127.0.0.1", taken_port, 16, 1) {
            Err(ServerError::PortsExhausted { first, last }) => {
                assert_eq!(first, taken_port);
                assert_eq!(last, taken_port);
            }
            other => panic!("unexpected: {:?}", other.map(|l| l.local_addr())),
        }
    }

    #[test]
    fn test_bind_rejects_invalid_address() {
        assert!(matches!(
            bind_listener("not-an-ip", 0, 16, 1),
            Err(ServerError::InvalidAddress(_))
        ));
    }

    #[tokio::test]
    async fn test_bind_rejects_zero_history_capacity() {
        let config = Config {
            history_capacity: 0,
            ..test_config()
        };
        assert!(matches!(
            Server::bind(&config),
            Err(ServerError::Config(ConfigError::Invalid(_)))
        ));
    }

    #[tokio::test]
    async fn test_end_to_end_session() {
        let server = Server::bind(&test_config()).unwrap();
        let addr = server.local_addr();
        let history = Arc::clone(server.history());
        let (controller, shutdown) = ShutdownController::new();
        let handle = tokio::spawn(server.run(shutdown));

        let mut client = TcpStream::connect(addr).await.unwrap();
        expect(&mut client, USERNAME_PROMPT).await;

        client.write_all(b"alice\n").await.unwrap();
        expect(&mut client, b"Hello alice!\n").await;
        expect(&mut client, b"Send: ").await;

        client.write_all(b"hi\n").await.unwrap();
        expect(&mut client, b"\x1b[4mLinus\x1b[0m: hi\n").await;
        expect(&mut client, b"Send: ").await;

        assert_eq!(history.dump(), vec!["hi".to_string()]);

        controller.trigger(TerminationSignal::Terminate);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_sessions_share_history() {
        let server = Server::bind(&test_config()).unwrap();
        let addr = server.local_addr();
        let history = Arc::clone(server.history());
        let (controller, shutdown) = ShutdownController::new();
        let handle = tokio::spawn(server.run(shutdown));

        let mut first = TcpStream::connect(addr).await.unwrap();
        let mut second = TcpStream::connect(addr).await.unwrap();

        for (client, name) in [(&mut first, "a"), (&mut second, "b")] {
            expect(client, USERNAME_PROMPT).await;
            client.write_all(format!("{name}\n").as_bytes()).await.unwrap();
            expect(client, format!("Hello {name}!\nSend: ").as_bytes()).await;
        }

        first.write_all(b"from-a\n").await.unwrap();
        expect(&mut first, b"\x1b[4mLinus\x1b[0m: from-a\nSend: ").await;
        second.write_all(b"from-b\n").await.unwrap();
        expect(&mut second, b"\x1b[4mLinus\x1b[0m: from-b\nSend: ").await;

        assert_eq!(
            history.dump(),
            vec!["from-a".to_string(), "from-b".to_string()]
        );

        controller.trigger(TerminationSignal::Terminate);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_deregisters_session() {
        let server = Server::bind(&test_config()).unwrap();
        let addr = server.local_addr();
        let registry = Arc::clone(server.registry());
        let (controller, shutdown) = ShutdownController::new();
        let handle = tokio::spawn(server.run(shutdown));

        let mut client = TcpStream::connect(addr).await.unwrap();
        expect(&mut client, USERNAME_PROMPT).await;
        assert_eq!(registry.len(), 1);

        drop(client);
        wait_until_empty(&registry).await;

        controller.trigger(TerminationSignal::Interrupt);
        assert_eq!(handle.await.unwrap(), TerminationSignal::Interrupt);
    }

    #[tokio::test]
    async fn test_reset_connection_deregisters_session() {
        let server = Server::bind(&test_config()).unwrap();
        let addr = server.local_addr();
        let registry = Arc::clone(server.registry());
        let (controller, shutdown) = ShutdownController::new();
        let handle = tokio::spawn(server.run(shutdown));

        let mut client = TcpStream::connect(addr).await.unwrap();
        expect(&mut client, USERNAME_PROMPT).await;
        client.write_all(b"gina\n").await.unwrap();
        expect(&mut client, b"Hello gina!\nSend: ").await;

        // Zero linger turns the close into an RST, so the session read fails.
        socket2::SockRef::from(&client)
            .set_linger(Some(Duration::ZERO))
            .unwrap();
        drop(client);
        wait_until_empty(&registry).await;

        controller.trigger(TerminationSignal::Terminate);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_session_limit_rejects_extra_connection() {
        let config = Config {
            max_sessions: 1,
            ..test_config()
        };
        let server = Server::bind(&config).unwrap();
        let addr = server.local_addr();
        let (controller, shutdown) = ShutdownController::new();
        let handle = tokio::spawn(server.run(shutdown));

        let mut admitted = TcpStream::connect(addr).await.unwrap();
        expect(&mut admitted, USERNAME_PROMPT).await;

        let mut rejected = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 16];
        let n = rejected.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);

        controller.trigger(TerminationSignal::Terminate);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_listener_and_sessions() {
        let server = Server::bind(&test_config()).unwrap();
        let addr = server.local_addr();
        let registry = Arc::clone(server.registry());
        let (controller, shutdown) = ShutdownController::new();
        let handle = tokio::spawn(server.run(shutdown));

        let mut client = TcpStream::connect(addr).await.unwrap();
        expect(&mut client, USERNAME_PROMPT).await;

        controller.trigger(TerminationSignal::Quit);
        let signal = handle.await.unwrap();
        assert_eq!(signal, TerminationSignal::Quit);
        assert_eq!(signal.number(), 3);

        // The open session is dropped, so the client sees EOF.
        let mut buf = [0u8; 16];
        let n = client.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
        wait_until_empty(&registry).await;

        assert!(TcpStream::connect(addr).await.is_err());
    }
}
