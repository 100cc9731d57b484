//! Server half of the protocol.
//!
//! [`ServerHandler`] completes the handshake for incoming sessions and
//! serves program and console commands once a session is connected. A
//! session can be attached to at most one console at a time; while attached,
//! every tick forwards the console lines it has not seen yet.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::{ServerConfig, PROTOCOL_VERSION};
use crate::console::{Console, ConsoleManager, TrackerId};
use crate::core::packet::{Direction, Packet, MAX_LIST_LEN};
use crate::error::{constants, Error, Result};
use crate::program::ProgramRegistry;
use crate::protocol::handler::PacketHandler;
use crate::protocol::state::ConnectionState;
use crate::session::Session;
use crate::utils::metrics::global_metrics;
use crate::utils::time::unix_now;

/// Payload bytes of console lines packed into one `ConsoleMessages`.
const MESSAGE_BYTE_BUDGET: usize = 256 * 1024;

/// A session's view of the console it joined.
#[derive(Debug, Clone)]
struct Attachment {
    console: Arc<Console>,
    tracker: TrackerId,
}

impl Attachment {
    fn release(&self) {
        self.console.remove_tracker(self.tracker);
    }
}

/// Handles every client request on the server side.
#[derive(Debug)]
pub struct ServerHandler {
    programs: Arc<ProgramRegistry>,
    consoles: Arc<ConsoleManager>,
    attachments: DashMap<Uuid, Attachment>,
    strict_protocol: bool,
    token: Option<String>,
    join_backlog: usize,
}

impl ServerHandler {
    pub fn new(
        programs: Arc<ProgramRegistry>,
        consoles: Arc<ConsoleManager>,
        config: &ServerConfig,
    ) -> Self {
        let join_backlog = consoles.config().join_backlog;
        Self {
            programs,
            consoles,
            attachments: DashMap::new(),
            strict_protocol: config.strict_protocol,
            token: config.token.clone(),
            join_backlog,
        }
    }

    /// Console the session is attached to, if any.
    pub fn attached_console(&self, session: Uuid) -> Option<Uuid> {
        self.attachments
            .get(&session)
            .map(|attachment| attachment.console.id())
    }

    fn attachment(&self, session: Uuid) -> Option<Attachment> {
        self.attachments.get(&session).map(|entry| entry.value().clone())
    }

    fn detach(&self, session: Uuid) -> Option<Attachment> {
        let (_, attachment) = self.attachments.remove(&session)?;
        attachment.release();
        Some(attachment)
    }

    #[instrument(skip(self, session, token), fields(session = %session.id()))]
    async fn connection_request(
        &self,
        session: &Arc<Session>,
        protocol: u8,
        client_id: Uuid,
        token: &str,
    ) -> Result<()> {
        if session.state() != ConnectionState::Connecting {
            debug!("Ignoring repeated ConnectionRequest");
            return Ok(());
        }

        if protocol != PROTOCOL_VERSION && self.strict_protocol {
            global_metrics().handshake_rejected();
            let error = Error::IncompatibleProtocol {
                required: PROTOCOL_VERSION,
                peer: protocol,
            };
            info!(peer = %client_id, %error, "Rejecting handshake");
            session.reject(Packet::IncompatibleProtocol {
                required: PROTOCOL_VERSION,
            });
            return Ok(());
        }

        if let Some(expected) = &self.token {
            if !token_matches(expected, token) {
                global_metrics().handshake_rejected();
                warn!(peer = %client_id, addr = ?session.addr(), "Rejecting handshake with bad token");
                session.reject(Packet::BadRequest {
                    message: constants::ERR_BAD_TOKEN.to_string(),
                });
                return Ok(());
            }
        }

        session.set_peer_id(client_id);
        if !session.mark_connected() {
            return Ok(());
        }
        global_metrics().handshake_completed();
        info!(peer = %client_id, addr = ?session.addr(), "Session connected");

        session
            .send_packet(&Packet::ConnectionResponse { time: unix_now() })
            .await
    }

    async fn start_program(&self, session: &Session, name: &str) -> Result<()> {
        let program = self
            .programs
            .get(name)
            .ok_or_else(|| Error::ProgramNotFound(name.to_string()))?;

        let console = self.consoles.start(Arc::clone(&program))?;
        info!(program = %program.name(), console = %console.id(), "Program started");

        session
            .send_packet(&Packet::ProgramStatus {
                program: program.name().to_string(),
                console_id: console.id(),
                running: true,
            })
            .await
    }

    async fn stop_program(&self, session: &Session, name: &str) -> Result<()> {
        let program = self
            .programs
            .get(name)
            .ok_or_else(|| Error::ProgramNotFound(name.to_string()))?;

        let console = self
            .consoles
            .find_running(program.name())
            .ok_or(Error::ConsoleNotFound(Uuid::nil()))?;

        console.terminate();
        info!(program = %program.name(), console = %console.id(), "Program stopped");

        session
            .send_packet(&Packet::ProgramStatus {
                program: program.name().to_string(),
                console_id: console.id(),
                running: false,
            })
            .await
    }

    async fn join_console(&self, session: &Session, console_id: Uuid) -> Result<()> {
        let console = self
            .consoles
            .get(&console_id)
            .ok_or(Error::ConsoleNotFound(console_id))?;
        if console.is_closed() {
            return Err(Error::ConsoleAlreadyClosed(console_id));
        }

        if let Some(previous) = self.detach(session.id()) {
            debug!(session = %session.id(), console = %previous.console.id(), "Leaving previous console");
        }

        let (tracker, backlog) = console.join(self.join_backlog);
        self.attachments.insert(
            session.id(),
            Attachment {
                console: Arc::clone(&console),
                tracker,
            },
        );
        info!(session = %session.id(), console = %console_id, "Session joined console");

        send_lines(session, backlog).await
    }

    async fn quit_console(&self, session: &Session, console_id: Uuid) -> Result<()> {
        match self.attachment(session.id()) {
            Some(attachment) if attachment.console.id() == console_id => {
                self.detach(session.id());
                info!(session = %session.id(), console = %console_id, "Session left console");
                Ok(())
            }
            _ => Err(Error::SessionNotJoinedConsole),
        }
    }

    async fn send_commands(&self, session: &Session, commands: &[String]) -> Result<()> {
        let attachment = self
            .attachment(session.id())
            .ok_or(Error::SessionNotJoinedConsole)?;
        let console = attachment.console;
        if console.is_closed() {
            return Err(Error::ConsoleAlreadyClosed(console.id()));
        }

        for command in commands {
            debug!(console = %console.id(), %command, "Forwarding command");
            console.send_command(command.clone()).await?;
        }
        Ok(())
    }
}

/// Compare tokens without returning early on the first differing byte.
fn token_matches(expected: &str, given: &str) -> bool {
    expected.len() == given.len()
        && expected
            .bytes()
            .zip(given.bytes())
            .fold(0u8, |diff, (a, b)| diff | (a ^ b))
            == 0
}

#[async_trait]
impl PacketHandler for ServerHandler {
    async fn handle_packet(&self, session: &Arc<Session>, packet: &Packet) -> Result<()> {
        let kind = packet.kind();
        if kind.direction() == Direction::ServerToClient {
            debug!(session = %session.id(), %kind, "Dropping server-bound packet of client-bound kind");
            return Ok(());
        }

        match packet {
            Packet::ConnectionRequest {
                protocol,
                client_id,
                token,
            } => {
                self.connection_request(session, *protocol, *client_id, token)
                    .await
            }
            Packet::DisconnectionNotification => {
                session.close();
                Ok(())
            }
            _ if !session.is_connected() => {
                debug!(session = %session.id(), %kind, "Dropping packet before handshake");
                Ok(())
            }
            Packet::RequestProgramList => {
                let mut programs = self.programs.list();
                if programs.len() > MAX_LIST_LEN {
                    warn!(count = programs.len(), "Program list truncated");
                    programs.truncate(MAX_LIST_LEN);
                }
                session
                    .send_packet(&Packet::ResponseProgramList { programs })
                    .await
            }
            Packet::StartProgram { program } => self.start_program(session, program).await,
            Packet::StopProgram { program } => self.stop_program(session, program).await,
            Packet::RequestConsoleList => {
                let mut consoles = self.consoles.list();
                if consoles.len() > MAX_LIST_LEN {
                    warn!(count = consoles.len(), "Console list truncated");
                    consoles.truncate(MAX_LIST_LEN);
                }
                session
                    .send_packet(&Packet::ResponseConsoleList { consoles })
                    .await
            }
            Packet::JoinConsole { console_id } => self.join_console(session, *console_id).await,
            Packet::QuitConsole { console_id } => self.quit_console(session, *console_id).await,
            Packet::SendCommands { commands } => self.send_commands(session, commands).await,
            other => {
                debug!(session = %session.id(), kind = %other.kind(), "Unhandled packet");
                Ok(())
            }
        }
    }

    async fn on_update(&self, session: &Arc<Session>) -> Result<()> {
        if !session.is_connected() {
            return Ok(());
        }
        let Some(attachment) = self.attachment(session.id()) else {
            return Ok(());
        };

        let lines = attachment.console.read_changes(attachment.tracker);
        send_lines(session, lines).await
    }

    async fn on_close(&self, session: &Session) {
        if let Some(attachment) = self.detach(session.id()) {
            debug!(session = %session.id(), console = %attachment.console.id(), "Released console tracker");
        }
    }
}

/// Send console lines oldest-first, split into packets that stay within the
/// list limit and a modest byte budget.
async fn send_lines(session: &Session, lines: Vec<String>) -> Result<()> {
    for chunk in chunk_lines(lines) {
        session
            .send_packet(&Packet::ConsoleMessages { lines: chunk })
            .await?;
    }
    Ok(())
}

fn chunk_lines(lines: Vec<String>) -> Vec<Vec<String>> {
    let mut chunks = Vec::new();
    let mut current = Vec::new();
    let mut bytes = 0;

    for line in lines {
        let size = line.len() + 2;
        if !current.is_empty() && (current.len() == MAX_LIST_LEN || bytes + size > MESSAGE_BYTE_BUDGET)
        {
            chunks.push(std::mem::take(&mut current));
            bytes = 0;
        }
        bytes += size;
        current.push(line);
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_output_sends_nothing() {
        assert!(chunk_lines(Vec::new()).is_empty());
    }

    #[test]
    fn chunks_respect_list_limit_and_keep_order() {
        let lines: Vec<String> = (0..600).map(|i| i.to_string()).collect();
        let chunks = chunk_lines(lines.clone());

        assert_eq!(
            chunks.iter().map(Vec::len).collect::<Vec<_>>(),
            vec![255, 255, 90]
        );
        assert_eq!(chunks.concat(), lines);
    }

    #[test]
    fn chunks_respect_byte_budget() {
        let line = "x".repeat(100 * 1024);
        let chunks = chunk_lines(vec![line.clone(), line.clone(), line.clone()]);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 2);
    }

    #[test]
    fn token_must_match_exactly() {
        assert!(token_matches("secret", "secret"));
        assert!(!token_matches("secret", "secreT"));
        assert!(!token_matches("secret", "secret2"));
        assert!(!token_matches("secret", ""));
    }
}
