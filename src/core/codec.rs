//! # Packet Codec
//!
//! `tokio_util` framing for [`Packet`]s. The decoder waits until a whole frame is
//! buffered, then splits it off in one step; a partial frame is never consumed.
//!
//! The codec holds the [`PacketRegistry`] used to resolve ids, so both ends of a
//! connection must be built from registries with the same id table.

use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::MAX_PAYLOAD_SIZE;
use crate::core::packet::{frame_length, Packet, LENGTH_PREFIX_LEN};
use crate::core::registry::PacketRegistry;
use crate::error::{ProtocolError, Result};

#[derive(Debug, Clone)]
pub struct PacketCodec {
    registry: Arc<PacketRegistry>,
    max_payload_size: usize,
}

impl PacketCodec {
    pub fn new(registry: Arc<PacketRegistry>) -> Self {
        Self {
            registry,
            max_payload_size: MAX_PAYLOAD_SIZE,
        }
    }

    /// Override the largest accepted payload in bytes
    pub fn with_max_payload_size(mut self, max_payload_size: usize) -> Self {
        self.max_payload_size = max_payload_size;
        self
    }

    pub fn registry(&self) -> &Arc<PacketRegistry> {
        &self.registry
    }

    pub fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let Some(total) = frame_length(src, self.max_payload_size)? else {
            return Ok(None);
        };

        if src.len() < LENGTH_PREFIX_LEN + total {
            // Reserve the rest of the frame so the next read can fill it
            src.reserve(LENGTH_PREFIX_LEN + total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_LEN);
        let frame = src.split_to(total).freeze();
        let id = frame[0];
        self.registry.decode(id, &frame[1..]).map(Some)
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<()> {
        item.encode_frame(dst, self.max_payload_size)
    }
}
