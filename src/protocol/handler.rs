//! Packet handlers run on every session tick.
//!
//! All registered handlers see every decoded packet, in registration order.
//! Handlers are cumulative: one handling a packet does not stop the next
//! from seeing it.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::core::packet::{Direction, Packet};
use crate::error::Result;
use crate::protocol::state::ConnectionState;
use crate::session::Session;

/// Reacts to packets arriving on a session.
///
/// A returned error that is connection-fatal closes the session; any other
/// error is reported to the peer as an `ErrorMessage`.
#[async_trait]
pub trait PacketHandler: Send + Sync {
    async fn handle_packet(&self, session: &Arc<Session>, packet: &Packet) -> Result<()>;

    /// Called once per tick after the batch of packets was dispatched.
    async fn on_update(&self, _session: &Arc<Session>) -> Result<()> {
        Ok(())
    }

    /// Called when the manager tears a closed session down.
    async fn on_close(&self, _session: &Session) {}
}

/// Client half of the handshake.
///
/// Answers `ConnectionOne`, completes on `ConnectionResponse` and forwards
/// every other server packet to an event channel.
#[derive(Debug)]
pub struct ClientHandler {
    client_id: Uuid,
    protocol: u8,
    token: Option<String>,
    events: mpsc::Sender<Packet>,
}

impl ClientHandler {
    pub fn new(
        client_id: Uuid,
        protocol: u8,
        token: Option<String>,
        events: mpsc::Sender<Packet>,
    ) -> Self {
        Self {
            client_id,
            protocol,
            token,
            events,
        }
    }

    fn forward(&self, packet: &Packet) {
        if self.events.try_send(packet.clone()).is_err() {
            warn!(kind = %packet.kind(), "Client event queue full, dropping packet");
        }
    }
}

#[async_trait]
impl PacketHandler for ClientHandler {
    #[instrument(skip_all, fields(session = %session.id(), kind = %packet.kind()))]
    async fn handle_packet(&self, session: &Arc<Session>, packet: &Packet) -> Result<()> {
        if packet.kind().direction() == Direction::ClientToServer {
            debug!("Dropping client-bound packet of server-bound kind");
            return Ok(());
        }

        match packet {
            Packet::ConnectionOne { server_id, time } => {
                if session.state() != ConnectionState::Connecting {
                    debug!("Ignoring ConnectionOne outside of handshake");
                    return Ok(());
                }
                debug!(server = %server_id, time, "Server greeted us");
                session.set_peer_id(*server_id);
                session
                    .send_packet(&Packet::ConnectionRequest {
                        protocol: self.protocol,
                        client_id: self.client_id,
                        token: self.token.clone().unwrap_or_default(),
                    })
                    .await
            }
            Packet::ConnectionResponse { time } => {
                if session.mark_connected() {
                    info!(server = ?session.peer_id(), time, "Connected");
                } else {
                    debug!("Ignoring ConnectionResponse outside of handshake");
                }
                Ok(())
            }
            Packet::DisconnectionNotification => {
                session.close();
                Ok(())
            }
            packet if packet.kind().is_terminal() => {
                warn!(?packet, "Server refused the connection");
                self.forward(packet);
                Ok(())
            }
            packet if session.is_connected() => {
                self.forward(packet);
                Ok(())
            }
            _ => {
                debug!("Dropping packet received before the handshake completed");
                Ok(())
            }
        }
    }
}
