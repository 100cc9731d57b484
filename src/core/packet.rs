//! Packet definitions and the binary wire format.
//!
//! ```text
//! [Kind(1)] [Payload(N)]
//! ```
//!
//! Field encodings (all integers big-endian):
//! - string: `u16` byte length followed by UTF-8 bytes
//! - identifier: 16 raw UUID bytes
//! - time: `i64` unix seconds
//! - list: `u8` element count followed by the elements
//!
//! Encoding is pure and allocation-bounded; decoding returns a typed
//! [`CodecError`] for any malformed buffer and never panics.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::error::{CodecError, ErrorCode};

/// Longest string a single field can carry.
pub const MAX_STRING_LEN: usize = u16::MAX as usize;

/// Most elements a single list field can carry.
pub const MAX_LIST_LEN: usize = u8::MAX as usize;

/// Which side is allowed to send a packet kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ServerToClient,
    ClientToServer,
    Both,
}

/// Registry of packet kinds and their wire tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    ConnectionOne = 0,
    ConnectionRequest = 1,
    ConnectionResponse = 2,
    IncompatibleProtocol = 3,
    BadRequest = 4,
    DisconnectionNotification = 5,
    ErrorMessage = 6,
    RequestProgramList = 7,
    ResponseProgramList = 8,
    StartProgram = 9,
    StopProgram = 10,
    ProgramStatus = 11,
    RequestConsoleList = 12,
    ResponseConsoleList = 13,
    JoinConsole = 14,
    QuitConsole = 15,
    ConsoleMessages = 16,
    SendCommands = 17,
}

impl PacketKind {
    /// Every registered kind, in tag order.
    pub const ALL: [PacketKind; 18] = [
        PacketKind::ConnectionOne,
        PacketKind::ConnectionRequest,
        PacketKind::ConnectionResponse,
        PacketKind::IncompatibleProtocol,
        PacketKind::BadRequest,
        PacketKind::DisconnectionNotification,
        PacketKind::ErrorMessage,
        PacketKind::RequestProgramList,
        PacketKind::ResponseProgramList,
        PacketKind::StartProgram,
        PacketKind::StopProgram,
        PacketKind::ProgramStatus,
        PacketKind::RequestConsoleList,
        PacketKind::ResponseConsoleList,
        PacketKind::JoinConsole,
        PacketKind::QuitConsole,
        PacketKind::ConsoleMessages,
        PacketKind::SendCommands,
    ];

    /// Look up a kind by its wire tag.
    pub fn from_byte(byte: u8) -> Option<Self> {
        Self::ALL.get(byte as usize).copied()
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            PacketKind::ConnectionOne => "ConnectionOne",
            PacketKind::ConnectionRequest => "ConnectionRequest",
            PacketKind::ConnectionResponse => "ConnectionResponse",
            PacketKind::IncompatibleProtocol => "IncompatibleProtocol",
            PacketKind::BadRequest => "BadRequest",
            PacketKind::DisconnectionNotification => "DisconnectionNotification",
            PacketKind::ErrorMessage => "ErrorMessage",
            PacketKind::RequestProgramList => "RequestProgramList",
            PacketKind::ResponseProgramList => "ResponseProgramList",
            PacketKind::StartProgram => "StartProgram",
            PacketKind::StopProgram => "StopProgram",
            PacketKind::ProgramStatus => "ProgramStatus",
            PacketKind::RequestConsoleList => "RequestConsoleList",
            PacketKind::ResponseConsoleList => "ResponseConsoleList",
            PacketKind::JoinConsole => "JoinConsole",
            PacketKind::QuitConsole => "QuitConsole",
            PacketKind::ConsoleMessages => "ConsoleMessages",
            PacketKind::SendCommands => "SendCommands",
        }
    }

    pub fn direction(self) -> Direction {
        match self {
            PacketKind::ConnectionRequest
            | PacketKind::RequestProgramList
            | PacketKind::StartProgram
            | PacketKind::StopProgram
            | PacketKind::RequestConsoleList
            | PacketKind::JoinConsole
            | PacketKind::QuitConsole
            | PacketKind::SendCommands => Direction::ClientToServer,
            PacketKind::DisconnectionNotification => Direction::Both,
            _ => Direction::ServerToClient,
        }
    }

    /// Terminal packets announce that the sender is closing the connection.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PacketKind::IncompatibleProtocol | PacketKind::BadRequest
        )
    }
}

impl std::fmt::Display for PacketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A launchable program as advertised to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramEntry {
    pub name: String,
    pub loader: String,
}

/// A registered console as advertised to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleEntry {
    pub console_id: Uuid,
    pub program: String,
    pub loader: String,
    pub running: bool,
}

/// Every message of the wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    ConnectionOne { server_id: Uuid, time: i64 },
    /// `token` is empty when the client has none.
    ConnectionRequest {
        protocol: u8,
        client_id: Uuid,
        token: String,
    },
    ConnectionResponse { time: i64 },
    IncompatibleProtocol { required: u8 },
    BadRequest { message: String },
    DisconnectionNotification,
    ErrorMessage { code: ErrorCode },
    RequestProgramList,
    ResponseProgramList { programs: Vec<ProgramEntry> },
    StartProgram { program: String },
    StopProgram { program: String },
    ProgramStatus {
        program: String,
        console_id: Uuid,
        running: bool,
    },
    RequestConsoleList,
    ResponseConsoleList { consoles: Vec<ConsoleEntry> },
    JoinConsole { console_id: Uuid },
    QuitConsole { console_id: Uuid },
    /// Console output, oldest line first.
    ConsoleMessages { lines: Vec<String> },
    SendCommands { commands: Vec<String> },
}

impl Packet {
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::ConnectionOne { .. } => PacketKind::ConnectionOne,
            Packet::ConnectionRequest { .. } => PacketKind::ConnectionRequest,
            Packet::ConnectionResponse { .. } => PacketKind::ConnectionResponse,
            Packet::IncompatibleProtocol { .. } => PacketKind::IncompatibleProtocol,
            Packet::BadRequest { .. } => PacketKind::BadRequest,
            Packet::DisconnectionNotification => PacketKind::DisconnectionNotification,
            Packet::ErrorMessage { .. } => PacketKind::ErrorMessage,
            Packet::RequestProgramList => PacketKind::RequestProgramList,
            Packet::ResponseProgramList { .. } => PacketKind::ResponseProgramList,
            Packet::StartProgram { .. } => PacketKind::StartProgram,
            Packet::StopProgram { .. } => PacketKind::StopProgram,
            Packet::ProgramStatus { .. } => PacketKind::ProgramStatus,
            Packet::RequestConsoleList => PacketKind::RequestConsoleList,
            Packet::ResponseConsoleList { .. } => PacketKind::ResponseConsoleList,
            Packet::JoinConsole { .. } => PacketKind::JoinConsole,
            Packet::QuitConsole { .. } => PacketKind::QuitConsole,
            Packet::ConsoleMessages { .. } => PacketKind::ConsoleMessages,
            Packet::SendCommands { .. } => PacketKind::SendCommands,
        }
    }

    /// Serialize the packet into its wire form.
    ///
    /// Fails only when a string or list exceeds what the length prefixes can
    /// express.
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let mut w = Writer::with_capacity(self.size_hint());
        w.put_u8(self.kind().as_byte());

        match self {
            Packet::ConnectionOne { server_id, time } => {
                w.put_uuid(server_id);
                w.put_i64(*time);
            }
            Packet::ConnectionRequest {
                protocol,
                client_id,
                token,
            } => {
                w.put_u8(*protocol);
                w.put_uuid(client_id);
                w.put_string(token)?;
            }
            Packet::ConnectionResponse { time } => w.put_i64(*time),
            Packet::IncompatibleProtocol { required } => w.put_u8(*required),
            Packet::BadRequest { message } => w.put_string(message)?,
            Packet::ErrorMessage { code } => w.put_u32(code.as_u32()),
            Packet::ResponseProgramList { programs } => {
                w.put_list(programs, |w, p| {
                    w.put_string(&p.name)?;
                    w.put_string(&p.loader)
                })?;
            }
            Packet::StartProgram { program } | Packet::StopProgram { program } => {
                w.put_string(program)?
            }
            Packet::ProgramStatus {
                program,
                console_id,
                running,
            } => {
                w.put_string(program)?;
                w.put_uuid(console_id);
                w.put_bool(*running);
            }
            Packet::ResponseConsoleList { consoles } => {
                w.put_list(consoles, |w, c| {
                    w.put_uuid(&c.console_id);
                    w.put_string(&c.program)?;
                    w.put_string(&c.loader)?;
                    w.put_bool(c.running);
                    Ok(())
                })?;
            }
            Packet::JoinConsole { console_id } | Packet::QuitConsole { console_id } => {
                w.put_uuid(console_id)
            }
            Packet::ConsoleMessages { lines } => {
                w.put_list(lines, |w, line| w.put_string(line))?
            }
            Packet::SendCommands { commands } => {
                w.put_list(commands, |w, cmd| w.put_string(cmd))?
            }
            Packet::DisconnectionNotification
            | Packet::RequestProgramList
            | Packet::RequestConsoleList => {}
        }

        Ok(w.finish())
    }

    /// Parse a packet from its wire form.
    pub fn decode(bytes: &[u8]) -> Result<Packet, CodecError> {
        let (&tag, payload) = bytes.split_first().ok_or(CodecError::Empty)?;
        let kind = PacketKind::from_byte(tag).ok_or(CodecError::UnknownKind(tag))?;
        let mut r = Reader::new(payload);

        let packet = match kind {
            PacketKind::ConnectionOne => Packet::ConnectionOne {
                server_id: r.uuid()?,
                time: r.i64()?,
            },
            PacketKind::ConnectionRequest => Packet::ConnectionRequest {
                protocol: r.u8()?,
                client_id: r.uuid()?,
                token: r.string()?,
            },
            PacketKind::ConnectionResponse => Packet::ConnectionResponse { time: r.i64()? },
            PacketKind::IncompatibleProtocol => Packet::IncompatibleProtocol { required: r.u8()? },
            PacketKind::BadRequest => Packet::BadRequest {
                message: r.string()?,
            },
            PacketKind::DisconnectionNotification => Packet::DisconnectionNotification,
            PacketKind::ErrorMessage => Packet::ErrorMessage {
                code: ErrorCode::try_from(r.u32()?)?,
            },
            PacketKind::RequestProgramList => Packet::RequestProgramList,
            PacketKind::ResponseProgramList => Packet::ResponseProgramList {
                programs: r.list(|r| {
                    Ok(ProgramEntry {
                        name: r.string()?,
                        loader: r.string()?,
                    })
                })?,
            },
            PacketKind::StartProgram => Packet::StartProgram {
                program: r.string()?,
            },
            PacketKind::StopProgram => Packet::StopProgram {
                program: r.string()?,
            },
            PacketKind::ProgramStatus => Packet::ProgramStatus {
                program: r.string()?,
                console_id: r.uuid()?,
                running: r.bool()?,
            },
            PacketKind::RequestConsoleList => Packet::RequestConsoleList,
            PacketKind::ResponseConsoleList => Packet::ResponseConsoleList {
                consoles: r.list(|r| {
                    Ok(ConsoleEntry {
                        console_id: r.uuid()?,
                        program: r.string()?,
                        loader: r.string()?,
                        running: r.bool()?,
                    })
                })?,
            },
            PacketKind::JoinConsole => Packet::JoinConsole {
                console_id: r.uuid()?,
            },
            PacketKind::QuitConsole => Packet::QuitConsole {
                console_id: r.uuid()?,
            },
            PacketKind::ConsoleMessages => Packet::ConsoleMessages {
                lines: r.list(Reader::string)?,
            },
            PacketKind::SendCommands => Packet::SendCommands {
                commands: r.list(Reader::string)?,
            },
        };

        Ok(packet)
    }

    fn size_hint(&self) -> usize {
        let strings = |items: &[String]| items.iter().map(|s| s.len() + 2).sum::<usize>();
        1 + match self {
            Packet::ConsoleMessages { lines } => 1 + strings(lines),
            Packet::SendCommands { commands } => 1 + strings(commands),
            Packet::BadRequest { message } => 2 + message.len(),
            Packet::ConnectionRequest { token, .. } => 19 + token.len(),
            _ => 32,
        }
    }
}

/// Append-only field writer.
struct Writer {
    buf: BytesMut,
}

impl Writer {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    fn put_bool(&mut self, v: bool) {
        self.buf.put_u8(u8::from(v));
    }

    fn put_u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    fn put_i64(&mut self, v: i64) {
        self.buf.put_i64(v);
    }

    fn put_uuid(&mut self, id: &Uuid) {
        self.buf.put_slice(id.as_bytes());
    }

    fn put_string(&mut self, s: &str) -> Result<(), CodecError> {
        let len = u16::try_from(s.len()).map_err(|_| CodecError::StringTooLong(s.len()))?;
        self.buf.put_u16(len);
        self.buf.put_slice(s.as_bytes());
        Ok(())
    }

    fn put_list<T, F>(&mut self, items: &[T], mut put: F) -> Result<(), CodecError>
    where
        F: FnMut(&mut Self, &T) -> Result<(), CodecError>,
    {
        let count = u8::try_from(items.len()).map_err(|_| CodecError::ListTooLong(items.len()))?;
        self.buf.put_u8(count);
        for item in items {
            put(self, item)?;
        }
        Ok(())
    }

    fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Bounds-checked field reader over a packet payload.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn need(&self, needed: usize) -> Result<(), CodecError> {
        if self.buf.remaining() < needed {
            return Err(CodecError::Truncated {
                needed,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn bool(&mut self) -> Result<bool, CodecError> {
        Ok(self.u8()? != 0)
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    fn i64(&mut self) -> Result<i64, CodecError> {
        self.need(8)?;
        Ok(self.buf.get_i64())
    }

    fn uuid(&mut self) -> Result<Uuid, CodecError> {
        self.need(16)?;
        let mut raw = [0u8; 16];
        self.buf.copy_to_slice(&mut raw);
        Ok(Uuid::from_bytes(raw))
    }

    fn string(&mut self) -> Result<String, CodecError> {
        let len = self.u16()? as usize;
        self.need(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        std::str::from_utf8(head)
            .map(str::to_owned)
            .map_err(|_| CodecError::InvalidUtf8)
    }

    fn list<T, F>(&mut self, mut read: F) -> Result<Vec<T>, CodecError>
    where
        F: FnMut(&mut Self) -> Result<T, CodecError>,
    {
        let count = self.u8()? as usize;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(read(self)?);
        }
        Ok(items)
    }
}
