//! Client side of the protocol.
//!
//! A [`Client`] owns one session driven by its own [`SessionManager`] tick.
//! The [`ClientHandler`] answers the handshake; every other packet from the
//! server is surfaced through [`Client::next_event`].
//!
//! ```rust,no_run
//! use procmux::client::Client;
//! use procmux::config::SessionConfig;
//! use procmux::core::packet::Packet;
//! use std::time::Duration;
//!
//! # async fn demo() -> procmux::error::Result<()> {
//! let mut client = Client::connect("127.0.0.1:8123", SessionConfig::default()).await?;
//! client.wait_connected(Duration::from_secs(5)).await?;
//! client.send(&Packet::RequestProgramList).await?;
//! let reply = client.next_event().await;
//! # let _ = reply;
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::config::{SessionConfig, MAX_FRAME_SIZE, PROTOCOL_VERSION};
use crate::core::packet::Packet;
use crate::error::{Error, Result};
use crate::protocol::handler::{ClientHandler, PacketHandler};
use crate::protocol::state::ConnectionState;
use crate::session::{Session, SessionManager};

/// Server packets buffered for the application.
const EVENT_CAPACITY: usize = 64;

/// A connection to a procmux server.
#[derive(Debug)]
pub struct Client {
    session: Arc<Session>,
    events: mpsc::Receiver<Packet>,
    cancel: CancellationToken,
    tick: Option<JoinHandle<()>>,
}

impl Client {
    /// Connect over TCP speaking the current protocol version.
    pub async fn connect<A: ToSocketAddrs>(addr: A, config: SessionConfig) -> Result<Self> {
        Self::open(addr, config, PROTOCOL_VERSION, None).await
    }

    /// Connect over TCP presenting the server's access token.
    pub async fn connect_with_token<A: ToSocketAddrs>(
        addr: A,
        config: SessionConfig,
        token: impl Into<String>,
    ) -> Result<Self> {
        Self::open(addr, config, PROTOCOL_VERSION, Some(token.into())).await
    }

    /// Connect over TCP announcing `protocol` in the handshake.
    pub async fn connect_with_protocol<A: ToSocketAddrs>(
        addr: A,
        config: SessionConfig,
        protocol: u8,
    ) -> Result<Self> {
        Self::open(addr, config, protocol, None).await
    }

    #[instrument(skip(addr, config, token))]
    async fn open<A: ToSocketAddrs>(
        addr: A,
        config: SessionConfig,
        protocol: u8,
        token: Option<String>,
    ) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr().ok();
        Ok(Self::over(stream, peer, config, protocol, token))
    }

    /// Run the client protocol over an arbitrary transport.
    pub fn over<T>(
        transport: T,
        addr: Option<SocketAddr>,
        config: SessionConfig,
        protocol: u8,
        token: Option<String>,
    ) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let id = Uuid::new_v4();
        let (event_tx, events) = mpsc::channel(EVENT_CAPACITY);
        let handler = Arc::new(ClientHandler::new(id, protocol, token, event_tx));

        let manager = Arc::new(SessionManager::new(
            config,
            MAX_FRAME_SIZE,
            vec![handler as Arc<dyn PacketHandler>],
        ));
        let session = manager.attach(id, transport, addr);

        let cancel = CancellationToken::new();
        let tick = {
            let cancel = cancel.clone();
            tokio::spawn(async move { manager.run(cancel).await })
        };

        debug!(client = %id, ?addr, "Client session started");
        Self {
            session,
            events,
            cancel,
            tick: Some(tick),
        }
    }

    /// Our identity as announced to the server.
    pub fn id(&self) -> Uuid {
        self.session.id()
    }

    /// The server's identity, once it greeted us.
    pub fn server_id(&self) -> Option<Uuid> {
        self.session.peer_id()
    }

    pub fn state(&self) -> ConnectionState {
        self.session.state()
    }

    /// Wait until the handshake completes.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<()> {
        let wait = async {
            loop {
                match self.session.state() {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Disconnected => return Err(Error::SessionClosed),
                    ConnectionState::Connecting => {
                        tokio::time::sleep(Duration::from_millis(10)).await
                    }
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::ProtocolViolation("handshake timed out".into()))?
    }

    pub async fn send(&self, packet: &Packet) -> Result<()> {
        self.session.send_packet(packet).await
    }

    /// Next packet from the server, or `None` once the session closed and
    /// every buffered packet was taken.
    pub async fn next_event(&mut self) -> Option<Packet> {
        let closed = self.session.closed();
        tokio::select! {
            biased;
            event = self.events.recv() => event,
            _ = closed.cancelled() => self.events.try_recv().ok(),
        }
    }

    /// Disconnect and stop the tick.
    pub async fn close(mut self) {
        self.session.close();
        self.cancel.cancel();
        if let Some(tick) = self.tick.take() {
            let _ = tick.await;
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
