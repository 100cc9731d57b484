//! # Protocol
//!
//! Connection state machine and the packet handlers driving it.
//!
//! ## Handshake
//! 1. The server greets every new session with `ConnectionOne`.
//! 2. The client answers with `ConnectionRequest` carrying its protocol
//!    version, identity and access token.
//! 3. The server either rejects an incompatible version with
//!    `IncompatibleProtocol`, rejects a wrong token with `BadRequest`, or
//!    marks the session Connected and replies `ConnectionResponse`.
//! 4. The client marks itself Connected on `ConnectionResponse`.
//!
//! Packets arriving in a state that does not expect them are dropped. A
//! session that has not finished the handshake within `handshake_timeout`
//! is closed.

pub mod handler;
pub mod server;
pub mod state;

pub use handler::{ClientHandler, PacketHandler};
pub use server::ServerHandler;
pub use state::ConnectionState;
