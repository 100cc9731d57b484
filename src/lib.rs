//! # procmux
//!
//! Supervises long-running server processes and multiplexes their consoles
//! to remote clients over a compact binary protocol.
//!
//! ## Layout
//! - [`core`]: packet registry, packet codec and transport framing
//! - [`protocol`]: connection state machine and packet handlers
//! - [`session`]: per-connection I/O pumps and the session manager tick
//! - [`console`]: process supervision and the shared console log
//! - [`program`]: program definitions and their loaders
//! - [`server`] / [`client`]: the two ends of a connection
//! - [`utils`]: rate limiting, metrics, logging setup
//!
//! ## Example
//! ```rust
//! use procmux::core::packet::Packet;
//!
//! let bytes = Packet::StartProgram { program: "lobby".into() }.encode().unwrap();
//! assert_eq!(
//!     Packet::decode(&bytes).unwrap(),
//!     Packet::StartProgram { program: "lobby".into() }
//! );
//! ```

#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

pub mod client;
pub mod config;
pub mod console;
pub mod core;
pub mod error;
pub mod program;
pub mod protocol;
pub mod server;
pub mod session;
pub mod utils;

pub use client::Client;
pub use config::ServerSettings;
pub use error::{Error, ErrorCode, Result};
pub use server::Server;
