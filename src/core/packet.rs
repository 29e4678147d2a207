//! # Packets
//!
//! Every message on the wire is one length-prefixed, id-tagged frame:
//!
//! ```text
//! [Length: i32 BE] [Id: u8] [Payload: Length - 1 bytes]
//! ```
//!
//! `Length` counts the id byte plus the payload. Ids `0..=5` are reserved for the
//! built-in packets below; any other id belongs to a packet kind registered in a
//! [`PacketRegistry`].
//!
//! | Id | Kind            | Payload                                         |
//! |----|-----------------|-------------------------------------------------|
//! | 0  | Disconnect      | UTF-8 reason                                    |
//! | 1  | Auth            | UTF-8 token                                     |
//! | 2  | AuthSuccess     | empty                                           |
//! | 3  | Ping            | i64 BE id                                       |
//! | 4  | Command         | str name, i32 BE argument count, str arguments  |
//! | 5  | CommandResponse | opaque bytes                                    |
//!
//! `str` inside a Command is a u16 BE byte length followed by UTF-8 bytes.
//! Decoding is strict: trailing bytes, truncated fields and invalid UTF-8 are
//! protocol violations, so every accepted payload re-encodes to the same bytes.

use std::any::{Any, TypeId};
use std::fmt;
use std::ops::RangeInclusive;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};

use crate::config::MAX_PAYLOAD_SIZE;
use crate::core::registry::PacketRegistry;
use crate::error::{constants, ProtocolError, Result};

pub const DISCONNECT_ID: u8 = 0;
pub const AUTH_ID: u8 = 1;
pub const AUTH_SUCCESS_ID: u8 = 2;
pub const PING_ID: u8 = 3;
pub const COMMAND_ID: u8 = 4;
pub const COMMAND_RESPONSE_ID: u8 = 5;

/// Ids permanently owned by the built-in packets
pub const RESERVED_IDS: RangeInclusive<u8> = DISCONNECT_ID..=COMMAND_RESPONSE_ID;

/// Size of the length prefix in front of every frame
pub const LENGTH_PREFIX_LEN: usize = 4;

/// A packet body that knows how to write and read its own payload.
///
/// Implement this for application-defined packets and register the type in a
/// [`PacketRegistry`] before constructing or receiving it.
pub trait PacketBody: fmt::Debug + Send + Sync + 'static {
    /// Append the payload bytes (no length, no id) to `buf`
    fn encode(&self, buf: &mut BytesMut) -> Result<()>;

    /// Rebuild a body from its payload bytes
    fn decode(payload: &[u8]) -> Result<Self>
    where
        Self: Sized;
}

/// The fixed packet kinds defining the base protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinKind {
    Disconnect,
    Auth,
    AuthSuccess,
    Ping,
    Command,
    CommandResponse,
}

impl BuiltinKind {
    pub const ALL: [BuiltinKind; 6] = [
        BuiltinKind::Disconnect,
        BuiltinKind::Auth,
        BuiltinKind::AuthSuccess,
        BuiltinKind::Ping,
        BuiltinKind::Command,
        BuiltinKind::CommandResponse,
    ];

    /// Wire id of this kind
    pub fn id(self) -> u8 {
        match self {
            BuiltinKind::Disconnect => DISCONNECT_ID,
            BuiltinKind::Auth => AUTH_ID,
            BuiltinKind::AuthSuccess => AUTH_SUCCESS_ID,
            BuiltinKind::Ping => PING_ID,
            BuiltinKind::Command => COMMAND_ID,
            BuiltinKind::CommandResponse => COMMAND_RESPONSE_ID,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.id() == id)
    }

    pub fn name(self) -> &'static str {
        match self {
            BuiltinKind::Disconnect => "Disconnect",
            BuiltinKind::Auth => "Auth",
            BuiltinKind::AuthSuccess => "AuthSuccess",
            BuiltinKind::Ping => "Ping",
            BuiltinKind::Command => "Command",
            BuiltinKind::CommandResponse => "CommandResponse",
        }
    }

    /// Type identity of the body struct backing this kind
    pub fn body_type(self) -> TypeId {
        match self {
            BuiltinKind::Disconnect => TypeId::of::<Disconnect>(),
            BuiltinKind::Auth => TypeId::of::<Auth>(),
            BuiltinKind::AuthSuccess => TypeId::of::<AuthSuccess>(),
            BuiltinKind::Ping => TypeId::of::<Ping>(),
            BuiltinKind::Command => TypeId::of::<Command>(),
            BuiltinKind::CommandResponse => TypeId::of::<CommandResponse>(),
        }
    }
}

/// Sent by either side right before it closes the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    pub reason: String,
}

/// First packet of every session, carrying the client's token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Auth {
    pub token: String,
}

/// Server acknowledgement of a valid [`Auth`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AuthSuccess;

/// Keep-alive probe; the receiver echoes the id unchanged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ping {
    pub id: i64,
}

/// A named command with string arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub name: String,
    pub args: Vec<String>,
}

/// Opaque response data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResponse {
    pub data: Bytes,
}

impl PacketBody for Disconnect {
    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_slice(self.reason.as_bytes());
        Ok(())
    }

    fn decode(payload: &[u8]) -> Result<Self> {
        Ok(Self {
            reason: utf8(payload)?,
        })
    }
}

impl PacketBody for Auth {
    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_slice(self.token.as_bytes());
        Ok(())
    }

    fn decode(payload: &[u8]) -> Result<Self> {
        Ok(Self {
            token: utf8(payload)?,
        })
    }
}

impl PacketBody for AuthSuccess {
    fn encode(&self, _buf: &mut BytesMut) -> Result<()> {
        Ok(())
    }

    fn decode(payload: &[u8]) -> Result<Self> {
        PayloadReader::new(payload).finish()?;
        Ok(AuthSuccess)
    }
}

impl PacketBody for Ping {
    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_i64(self.id);
        Ok(())
    }

    fn decode(payload: &[u8]) -> Result<Self> {
        let mut reader = PayloadReader::new(payload);
        let id = reader.read_i64()?;
        reader.finish()?;
        Ok(Self { id })
    }
}

impl PacketBody for Command {
    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        put_str(buf, &self.name)?;
        let count = i32::try_from(self.args.len())
            .map_err(|_| ProtocolError::Encode("Too many command arguments".into()))?;
        buf.put_i32(count);
        for arg in &self.args {
            put_str(buf, arg)?;
        }
        Ok(())
    }

    fn decode(payload: &[u8]) -> Result<Self> {
        let mut reader = PayloadReader::new(payload);
        let name = reader.read_str()?;
        let count = reader.read_i32()?;
        let count = usize::try_from(count).map_err(|_| {
            ProtocolError::violation(format!("Negative command argument count: {count}"))
        })?;

        // Every argument costs at least its two length bytes
        if count > reader.remaining() / 2 {
            return Err(ProtocolError::violation(constants::ERR_TRUNCATED_PAYLOAD));
        }

        let mut args = Vec::with_capacity(count);
        for _ in 0..count {
            args.push(reader.read_str()?);
        }
        reader.finish()?;
        Ok(Self { name, args })
    }
}

impl PacketBody for CommandResponse {
    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_slice(&self.data);
        Ok(())
    }

    fn decode(payload: &[u8]) -> Result<Self> {
        Ok(Self {
            data: Bytes::copy_from_slice(payload),
        })
    }
}

/// Object-safe view of a [`PacketBody`]
trait ErasedBody: fmt::Debug + Send + Sync {
    fn encode_erased(&self, buf: &mut BytesMut) -> Result<()>;
    fn as_any(&self) -> &dyn Any;
}

impl<T: PacketBody> ErasedBody for T {
    fn encode_erased(&self, buf: &mut BytesMut) -> Result<()> {
        self.encode(buf)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A packet of an application-registered kind.
///
/// The id is resolved once, when the packet is built, and never changes even if
/// the registry is modified afterwards.
#[derive(Clone)]
pub struct CustomPacket {
    id: u8,
    kind: TypeId,
    name: &'static str,
    body: Arc<dyn ErasedBody>,
}

impl CustomPacket {
    pub(crate) fn new<T: PacketBody>(id: u8, body: T) -> Self {
        Self {
            id,
            kind: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
            body: Arc::new(body),
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    /// Type name of the body
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is<T: PacketBody>(&self) -> bool {
        self.kind == TypeId::of::<T>()
    }

    /// Borrow the body as its concrete type
    pub fn downcast_ref<T: PacketBody>(&self) -> Option<&T> {
        self.body.as_any().downcast_ref::<T>()
    }

    pub fn encode_payload(&self, buf: &mut BytesMut) -> Result<()> {
        self.body.encode_erased(buf)
    }
}

impl fmt::Debug for CustomPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomPacket")
            .field("id", &self.id)
            .field("body", &self.body)
            .finish()
    }
}

impl PartialEq for CustomPacket {
    fn eq(&self, other: &Self) -> bool {
        if self.id != other.id || self.kind != other.kind {
            return false;
        }
        let mut left = BytesMut::new();
        let mut right = BytesMut::new();
        match (self.encode_payload(&mut left), other.encode_payload(&mut right)) {
            (Ok(()), Ok(())) => left == right,
            _ => false,
        }
    }
}

/// One decoded or to-be-encoded protocol message
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Disconnect(Disconnect),
    Auth(Auth),
    AuthSuccess(AuthSuccess),
    Ping(Ping),
    Command(Command),
    CommandResponse(CommandResponse),
    Custom(CustomPacket),
}

impl Packet {
    pub fn disconnect(reason: impl Into<String>) -> Self {
        Packet::Disconnect(Disconnect {
            reason: reason.into(),
        })
    }

    pub fn auth(token: impl Into<String>) -> Self {
        Packet::Auth(Auth {
            token: token.into(),
        })
    }

    pub fn auth_success() -> Self {
        Packet::AuthSuccess(AuthSuccess)
    }

    pub fn ping(id: i64) -> Self {
        Packet::Ping(Ping { id })
    }

    pub fn command<I, S>(name: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Packet::Command(Command {
            name: name.into(),
            args: args.into_iter().map(Into::into).collect(),
        })
    }

    pub fn response(data: impl Into<Bytes>) -> Self {
        Packet::CommandResponse(CommandResponse { data: data.into() })
    }

    /// Build a packet of a registered application kind.
    ///
    /// Fails with [`ProtocolError::ConfigError`] if `T` is not registered.
    pub fn custom<T: PacketBody>(registry: &PacketRegistry, body: T) -> Result<Self> {
        let id = registry.id_of::<T>().ok_or_else(|| {
            ProtocolError::ConfigError(format!(
                "Packet {} not registered",
                std::any::type_name::<T>()
            ))
        })?;
        Ok(Packet::Custom(CustomPacket::new(id, body)))
    }

    /// Wire id of this packet
    pub fn id(&self) -> u8 {
        match self {
            Packet::Custom(custom) => custom.id(),
            builtin => builtin.kind().map(BuiltinKind::id).unwrap_or_default(),
        }
    }

    /// Built-in kind, or `None` for custom packets
    pub fn kind(&self) -> Option<BuiltinKind> {
        match self {
            Packet::Disconnect(_) => Some(BuiltinKind::Disconnect),
            Packet::Auth(_) => Some(BuiltinKind::Auth),
            Packet::AuthSuccess(_) => Some(BuiltinKind::AuthSuccess),
            Packet::Ping(_) => Some(BuiltinKind::Ping),
            Packet::Command(_) => Some(BuiltinKind::Command),
            Packet::CommandResponse(_) => Some(BuiltinKind::CommandResponse),
            Packet::Custom(_) => None,
        }
    }

    pub fn is_builtin(&self) -> bool {
        self.kind().is_some()
    }

    /// Human readable kind name, used for tracing
    pub fn name(&self) -> &'static str {
        match self {
            Packet::Custom(custom) => custom.name(),
            builtin => builtin.kind().map(BuiltinKind::name).unwrap_or("Unknown"),
        }
    }

    /// Append only the payload bytes to `buf`
    pub fn encode_payload(&self, buf: &mut BytesMut) -> Result<()> {
        match self {
            Packet::Disconnect(body) => body.encode(buf),
            Packet::Auth(body) => body.encode(buf),
            Packet::AuthSuccess(body) => body.encode(buf),
            Packet::Ping(body) => body.encode(buf),
            Packet::Command(body) => body.encode(buf),
            Packet::CommandResponse(body) => body.encode(buf),
            Packet::Custom(custom) => custom.encode_payload(buf),
        }
    }

    /// Append a full frame (length, id, payload) to `dst`.
    ///
    /// On failure `dst` is left exactly as it was.
    pub fn encode_frame(&self, dst: &mut BytesMut, max_payload_size: usize) -> Result<()> {
        let start = dst.len();
        dst.reserve(LENGTH_PREFIX_LEN + 1);
        dst.put_i32(0);
        dst.put_u8(self.id());

        if let Err(e) = self.encode_payload(dst) {
            dst.truncate(start);
            return Err(e);
        }

        let payload_len = dst.len() - start - LENGTH_PREFIX_LEN - 1;
        if payload_len > max_payload_size {
            dst.truncate(start);
            return Err(ProtocolError::OversizedPacket(payload_len));
        }

        let total = i32::try_from(payload_len + 1).map_err(|_| {
            dst.truncate(start);
            ProtocolError::OversizedPacket(payload_len)
        })?;
        dst[start..start + LENGTH_PREFIX_LEN].copy_from_slice(&total.to_be_bytes());
        Ok(())
    }

    /// Serialize into a standalone frame
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = BytesMut::new();
        self.encode_frame(&mut buf, MAX_PAYLOAD_SIZE)?;
        Ok(buf.to_vec())
    }

    /// Parse exactly one complete frame
    pub fn from_bytes(registry: &PacketRegistry, bytes: &[u8]) -> Result<Self> {
        let total = frame_length(bytes, MAX_PAYLOAD_SIZE)?
            .ok_or_else(|| ProtocolError::violation(constants::ERR_TRUNCATED_PAYLOAD))?;

        let frame = &bytes[LENGTH_PREFIX_LEN..];
        if frame.len() < total {
            return Err(ProtocolError::violation(constants::ERR_TRUNCATED_PAYLOAD));
        }
        if frame.len() > total {
            return Err(ProtocolError::violation(constants::ERR_TRAILING_BYTES));
        }

        registry.decode(frame[0], &frame[1..])
    }
}

/// Read and validate the length prefix at the start of `buf`.
///
/// Returns `Ok(None)` until all four prefix bytes are available, otherwise the
/// number of bytes (id + payload) the frame occupies after the prefix.
pub(crate) fn frame_length(buf: &[u8], max_payload_size: usize) -> Result<Option<usize>> {
    let Some(prefix) = buf.get(..LENGTH_PREFIX_LEN) else {
        return Ok(None);
    };

    let mut raw = [0u8; LENGTH_PREFIX_LEN];
    raw.copy_from_slice(prefix);
    let total = i32::from_be_bytes(raw);

    if total < 1 {
        return Err(ProtocolError::violation(format!(
            "{}: {total}",
            constants::ERR_INVALID_FRAME_LENGTH
        )));
    }

    let total = total as usize;
    if total - 1 > max_payload_size {
        return Err(ProtocolError::OversizedPacket(total - 1));
    }

    Ok(Some(total))
}

fn utf8(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| ProtocolError::violation(constants::ERR_INVALID_UTF8))
}

fn put_str(buf: &mut BytesMut, value: &str) -> Result<()> {
    let len = u16::try_from(value.len())
        .map_err(|_| ProtocolError::Encode(constants::ERR_STRING_TOO_LONG.into()))?;
    buf.put_u16(len);
    buf.put_slice(value.as_bytes());
    Ok(())
}

/// Strict cursor over a payload
struct PayloadReader<'a> {
    buf: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() < n {
            return Err(ProtocolError::violation(constants::ERR_TRUNCATED_PAYLOAD));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn read_i32(&mut self) -> Result<i32> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(i32::from_be_bytes(raw))
    }

    fn read_i64(&mut self) -> Result<i64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(i64::from_be_bytes(raw))
    }

    fn read_str(&mut self) -> Result<String> {
        let mut raw = [0u8; 2];
        raw.copy_from_slice(self.take(2)?);
        let len = u16::from_be_bytes(raw) as usize;
        utf8(self.take(len)?)
    }

    fn finish(self) -> Result<()> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::violation(constants::ERR_TRAILING_BYTES))
        }
    }
}
