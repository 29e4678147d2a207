//! # Packet Registry
//!
//! Maps wire ids to packet kinds. The six built-in kinds are pinned to ids
//! `0..=5` and can never be removed or shadowed, neither by id nor by
//! registering their body type under another id.
//!
//! Applications extend the protocol by registering their own [`PacketBody`]
//! types. Both registering and unregistering can be switched off for good with
//! [`PacketRegistry::lock_registering`] / [`PacketRegistry::lock_unregistering`],
//! typically right after start-up.
//!
//! ```rust
//! use bytes::{BufMut, BytesMut};
//! use command_protocol::core::packet::{Packet, PacketBody};
//! use command_protocol::core::registry::PacketRegistry;
//! use command_protocol::error::Result;
//!
//! #[derive(Debug)]
//! struct Shout(u8);
//!
//! impl PacketBody for Shout {
//!     fn encode(&self, buf: &mut BytesMut) -> Result<()> {
//!         buf.put_u8(self.0);
//!         Ok(())
//!     }
//!
//!     fn decode(payload: &[u8]) -> Result<Self> {
//!         Ok(Shout(payload.first().copied().unwrap_or_default()))
//!     }
//! }
//!
//! let registry = PacketRegistry::new();
//! registry.register::<Shout>(6).unwrap();
//! registry.lock_registering();
//!
//! let packet = Packet::custom(&registry, Shout(7)).unwrap();
//! assert_eq!(packet.id(), 6);
//! ```

use std::any::{type_name, TypeId};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use tracing::debug;

use crate::core::packet::{
    Auth, AuthSuccess, BuiltinKind, Command, CommandResponse, CustomPacket, Disconnect, Packet,
    PacketBody, Ping, RESERVED_IDS,
};
use crate::error::{constants, ProtocolError, Result};

/// Decode function stored for every id: `(id, payload) -> packet`
pub type DecodeFn = fn(u8, &[u8]) -> Result<Packet>;

/// One registered packet kind.
///
/// Encoding goes through the body's own [`PacketBody::encode`], so an entry only
/// needs the kind identity and the decode path.
#[derive(Clone, Copy)]
pub struct RegistryEntry {
    kind: TypeId,
    name: &'static str,
    decode: DecodeFn,
}

impl RegistryEntry {
    /// Entry for an application packet body
    pub fn of<T: PacketBody>() -> Self {
        Self {
            kind: TypeId::of::<T>(),
            name: type_name::<T>(),
            decode: decode_custom::<T>,
        }
    }

    fn builtin(kind: BuiltinKind) -> Self {
        let decode: DecodeFn = match kind {
            BuiltinKind::Disconnect => |_, p| Disconnect::decode(p).map(Packet::Disconnect),
            BuiltinKind::Auth => |_, p| Auth::decode(p).map(Packet::Auth),
            BuiltinKind::AuthSuccess => |_, p| AuthSuccess::decode(p).map(Packet::AuthSuccess),
            BuiltinKind::Ping => |_, p| Ping::decode(p).map(Packet::Ping),
            BuiltinKind::Command => |_, p| Command::decode(p).map(Packet::Command),
            BuiltinKind::CommandResponse => {
                |_, p| CommandResponse::decode(p).map(Packet::CommandResponse)
            }
        };

        Self {
            kind: kind.body_type(),
            name: kind.name(),
            decode,
        }
    }

    /// Type identity of the packet body
    pub fn kind(&self) -> TypeId {
        self.kind
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn decode(&self, id: u8, payload: &[u8]) -> Result<Packet> {
        (self.decode)(id, payload)
    }

    fn is_builtin(&self) -> bool {
        BuiltinKind::ALL
            .iter()
            .any(|kind| kind.body_type() == self.kind)
    }
}

impl fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("name", &self.name)
            .finish()
    }
}

fn decode_custom<T: PacketBody>(id: u8, payload: &[u8]) -> Result<Packet> {
    T::decode(payload).map(|body| Packet::Custom(CustomPacket::new(id, body)))
}

/// Id to packet kind mapping shared by clients and servers
pub struct PacketRegistry {
    entries: RwLock<BTreeMap<u8, RegistryEntry>>,
    registering_locked: AtomicBool,
    unregistering_locked: AtomicBool,
}

impl Default for PacketRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PacketRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketRegistry")
            .field("ids", &self.ids())
            .field("registering_locked", &self.is_registering_locked())
            .field("unregistering_locked", &self.is_unregistering_locked())
            .finish()
    }
}

impl PacketRegistry {
    /// Create a registry holding only the built-in packets
    pub fn new() -> Self {
        let entries = BuiltinKind::ALL
            .into_iter()
            .map(|kind| (kind.id(), RegistryEntry::builtin(kind)))
            .collect();

        Self {
            entries: RwLock::new(entries),
            registering_locked: AtomicBool::new(false),
            unregistering_locked: AtomicBool::new(false),
        }
    }

    /// Permanently disable registering new packets
    pub fn lock_registering(&self) {
        self.registering_locked.store(true, Ordering::SeqCst);
        debug!("Packet registering locked");
    }

    /// Permanently disable unregistering packets
    pub fn lock_unregistering(&self) {
        self.unregistering_locked.store(true, Ordering::SeqCst);
        debug!("Packet unregistering locked");
    }

    pub fn is_registering_locked(&self) -> bool {
        self.registering_locked.load(Ordering::SeqCst)
    }

    pub fn is_unregistering_locked(&self) -> bool {
        self.unregistering_locked.load(Ordering::SeqCst)
    }

    /// Whether `id` belongs to a built-in packet
    pub fn is_builtin_id(id: u8) -> bool {
        RESERVED_IDS.contains(&id)
    }

    /// Register body type `T` under `id`
    pub fn register<T: PacketBody>(&self, id: u8) -> Result<()> {
        self.register_entry(id, RegistryEntry::of::<T>())
    }

    /// Register a prepared entry under `id`
    pub fn register_entry(&self, id: u8, entry: RegistryEntry) -> Result<()> {
        if self.is_registering_locked() {
            return Err(ProtocolError::RegistrationLocked);
        }

        let mut entries = self
            .entries
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_REGISTRY_WRITE_LOCK.to_string()))?;

        if entries.contains_key(&id) {
            return Err(ProtocolError::PacketIdInUse(id));
        }
        if entry.is_builtin() {
            return Err(ProtocolError::BuiltinPacket(entry.name.to_string()));
        }

        entries.insert(id, entry);
        debug!(id, packet = entry.name, "Packet registered");
        Ok(())
    }

    /// Register `T` under the first free id and return that id
    pub fn register_next<T: PacketBody>(&self) -> Result<u8> {
        if self.is_registering_locked() {
            return Err(ProtocolError::RegistrationLocked);
        }

        let entry = RegistryEntry::of::<T>();
        if entry.is_builtin() {
            return Err(ProtocolError::BuiltinPacket(entry.name.to_string()));
        }

        let mut entries = self
            .entries
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_REGISTRY_WRITE_LOCK.to_string()))?;

        let id = (0..=u8::MAX)
            .find(|id| !entries.contains_key(id))
            .ok_or(ProtocolError::RegistryFull)?;

        entries.insert(id, entry);
        debug!(id, packet = entry.name, "Packet registered");
        Ok(id)
    }

    /// Remove the entry under `id`, returning whether one existed
    pub fn unregister(&self, id: u8) -> Result<bool> {
        if self.is_unregistering_locked() {
            return Err(ProtocolError::UnregistrationLocked);
        }
        if let Some(kind) = BuiltinKind::from_id(id) {
            return Err(ProtocolError::BuiltinPacket(kind.name().to_string()));
        }

        let mut entries = self
            .entries
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_REGISTRY_WRITE_LOCK.to_string()))?;

        let removed = entries.remove(&id).is_some();
        debug!(id, removed, "Packet unregistered");
        Ok(removed)
    }

    /// Entry registered under `id`, if any
    pub fn lookup(&self, id: u8) -> Option<RegistryEntry> {
        self.read().get(&id).copied()
    }

    /// Lowest id registered for body type `T`
    pub fn id_of<T: PacketBody>(&self) -> Option<u8> {
        let kind = TypeId::of::<T>();
        self.read()
            .iter()
            .find(|(_, entry)| entry.kind == kind)
            .map(|(id, _)| *id)
    }

    /// All registered ids in ascending order
    pub fn ids(&self) -> Vec<u8> {
        self.read().keys().copied().collect()
    }

    /// Decode a payload received under `id`
    pub fn decode(&self, id: u8, payload: &[u8]) -> Result<Packet> {
        let entry = self
            .lookup(id)
            .ok_or_else(|| ProtocolError::violation(format!("Unknown packet id {id}")))?;
        entry.decode(id, payload)
    }

    // Every write is a single map operation, so a poisoned map is still consistent
    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<u8, RegistryEntry>> {
        self.entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
