//! Registry of live sessions and the tick loop that drives them.

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::core::packet::Packet;
use crate::error::{Error, Result};
use crate::protocol::handler::PacketHandler;
use crate::session::Session;
use crate::utils::metrics::global_metrics;
use crate::utils::time::unix_now;

/// Owns every session and ticks them sequentially.
pub struct SessionManager {
    sessions: DashMap<Uuid, Arc<Session>>,
    handlers: Vec<Arc<dyn PacketHandler>>,
    config: SessionConfig,
    max_frame_size: usize,
}

impl SessionManager {
    pub fn new(
        config: SessionConfig,
        max_frame_size: usize,
        handlers: Vec<Arc<dyn PacketHandler>>,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            handlers,
            config,
            max_frame_size,
        }
    }

    /// Register an accepted connection and greet it with `ConnectionOne`.
    #[instrument(skip(self, transport))]
    pub async fn open_session<T>(&self, transport: T, addr: Option<SocketAddr>) -> Result<Arc<Session>>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let session = self.attach(Uuid::new_v4(), transport, addr);
        session
            .send_packet(&Packet::ConnectionOne {
                server_id: session.id(),
                time: unix_now(),
            })
            .await?;
        Ok(session)
    }

    /// Register a connection under `id` without sending anything.
    pub fn attach<T>(&self, id: Uuid, transport: T, addr: Option<SocketAddr>) -> Arc<Session>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let session = Session::start(id, transport, addr, &self.config, self.max_frame_size);
        self.sessions.insert(id, Arc::clone(&session));
        global_metrics().session_opened();
        debug!(session = %id, ?addr, "Session registered");
        session
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Update every session once, then tear down the ones that closed.
    pub async fn tick(&self) {
        for session in self.snapshot() {
            session.update(&self.handlers, self.config.batch_size).await;
            if session.handshake_expired(self.config.handshake_timeout) && session.close() {
                global_metrics().handshake_rejected();
                info!(session = %session.id(), addr = ?session.addr(), "Handshake timed out");
            }
            if session.is_closed() {
                self.teardown(&session).await;
            }
        }
    }

    async fn teardown(&self, session: &Arc<Session>) {
        for handler in &self.handlers {
            handler.on_close(session).await;
        }
        if self.sessions.remove(&session.id()).is_some() {
            global_metrics().session_removed();
            debug!(session = %session.id(), "Session removed");
        }
    }

    /// Tick every `tick_interval` until `cancel` fires, then shut down.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => self.tick().await,
            }
        }

        self.shutdown().await;
    }

    /// Send to one session.
    pub async fn send_to(&self, id: &Uuid, packet: &Packet) -> Result<()> {
        let session = self.get(id).ok_or(Error::SessionNotFound(*id))?;
        session.send_packet(packet).await
    }

    /// Send to every session, stopping at the first failure.
    pub async fn broadcast(&self, packet: &Packet) -> Result<()> {
        for session in self.snapshot() {
            session.send_packet(packet).await?;
        }
        Ok(())
    }

    /// Send to every session, continuing past failures.
    pub async fn broadcast_all(&self, packet: &Packet) -> Result<()> {
        let sessions = self.snapshot();
        let total = sessions.len();
        let mut failed = 0;

        for session in sessions {
            if let Err(e) = session.send_packet(packet).await {
                debug!(session = %session.id(), error = %e, "Broadcast send failed");
                failed += 1;
            }
        }

        if failed > 0 {
            return Err(Error::BroadcastFailed { failed, total });
        }
        Ok(())
    }

    /// Close and tear down every session.
    pub async fn shutdown(&self) {
        let sessions = self.snapshot();
        info!(sessions = sessions.len(), "Closing sessions");

        for session in sessions {
            session.close();
            self.teardown(&session).await;
        }
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.sessions.len())
            .field("handlers", &self.handlers.len())
            .field("config", &self.config)
            .finish()
    }
}
