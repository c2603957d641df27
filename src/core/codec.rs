//! # Stream Codec
//!
//! [`tokio_util::codec`] adapter framing packets over byte-stream transports
//! (TCP, relay sockets, in-memory duplex pipes).
//!
//! The decoder is strict about framing: a magic mismatch or an impossible
//! declared payload length is a [`BridgeError::Framing`] and terminates the
//! connection; a short buffer is simply "need more bytes". Checksum
//! validation is deliberately absent here — it is negotiated policy, applied
//! by the protocol layer.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::MAX_PAYLOAD_LIMIT;
use crate::core::packet::{Command, Packet, PacketHeader, HEADER_LEN};
use crate::error::{constants, BridgeError};

/// Codec framing bridge packets over a byte stream.
#[derive(Debug, Default)]
pub struct PacketCodec {
    /// Validated header awaiting its payload bytes.
    pending: Option<(PacketHeader, Command)>,
}

impl PacketCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = BridgeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, BridgeError> {
        let (header, command) = match self.pending {
            Some(pending) => pending,
            None => {
                if src.len() < HEADER_LEN {
                    return Ok(None);
                }
                let mut raw = [0u8; HEADER_LEN];
                raw.copy_from_slice(&src[..HEADER_LEN]);
                let header = PacketHeader::decode(&raw);
                let command = header.validate()?;
                if header.payload_len as usize > MAX_PAYLOAD_LIMIT {
                    return Err(BridgeError::Framing(constants::ERR_OVERSIZED_PAYLOAD));
                }
                src.advance(HEADER_LEN);
                src.reserve(header.payload_len as usize);
                self.pending = Some((header, command));
                (header, command)
            }
        };

        let len = header.payload_len as usize;
        if src.len() < len {
            return Ok(None);
        }

        let payload = src.split_to(len).freeze();
        self.pending = None;

        Ok(Some(Packet {
            command,
            arg0: header.arg0,
            arg1: header.arg1,
            payload,
            declared_checksum: header.checksum,
        }))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = BridgeError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), BridgeError> {
        packet.encode_contiguous(dst);
        Ok(())
    }
}
