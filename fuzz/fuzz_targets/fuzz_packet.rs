#![no_main]

use std::sync::Arc;

use bytes::BytesMut;
use command_protocol::core::codec::PacketCodec;
use command_protocol::{Packet, PacketRegistry};
use libfuzzer_sys::fuzz_target;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // Whole-frame parsing must reject bad input without panicking
    let registry = PacketRegistry::new();
    let _ = Packet::from_bytes(&registry, data);

    // Same bytes through the stream decoder, small payload limit
    let mut codec = PacketCodec::new(Arc::new(registry)).with_max_payload_size(4096);
    let mut buf = BytesMut::from(data);
    while let Ok(Some(_)) = codec.decode(&mut buf) {}
});
