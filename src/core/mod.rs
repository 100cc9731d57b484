//! # Core Protocol Components
//!
//! Packet definitions, the binary wire format, and transport framing.
//!
//! ## Components
//! - **Packet**: closed set of protocol messages with pure encode/decode
//! - **Codec**: Tokio codec framing packets over byte streams
//!
//! ## Wire Format
//! ```text
//! frame:  [Opcode(1)] [Length(4)] [Payload(N)]
//! packet: [Kind(1)] [Fields...]
//! ```
//!
//! ## Safety
//! - Frame length is validated before any payload is buffered
//! - Every field read is bounds-checked; malformed input yields a typed error

pub mod codec;
pub mod packet;
