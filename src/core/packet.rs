//! # Packet Framing
//!
//! The unit of framing on a bridge connection: a fixed 24-byte little-endian
//! header followed by a variable payload.
//!
//! ## Wire Format
//! `command:u32, arg0:u32, arg1:u32, payload_len:u32, checksum:u32, magic:u32`
//! followed by exactly `payload_len` payload bytes. `magic` is the bitwise
//! complement of `command` and validates framing independent of the checksum.
//!
//! On transports that preserve write boundaries (USB bulk transfers) the
//! header and payload must stay two distinct writes; combining them corrupts
//! framing there. [`PacketHeader::encode`] therefore yields the header bytes
//! alone, and the stream codec only coalesces for byte-stream transports.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{constants, BridgeError, Result};

/// Size of the fixed packet header in bytes.
pub const HEADER_LEN: usize = 24;

/// `arg0` value of an authentication challenge from the remote.
pub const AUTH_TOKEN: u32 = 1;

/// `arg0` value of a signed challenge sent by this side.
pub const AUTH_SIGNATURE: u32 = 2;

/// `arg0` value accompanying a public key offered for bootstrap trust.
pub const AUTH_RSA_PUBLIC_KEY: u32 = 3;

/// The closed set of packet commands.
///
/// Each wire value is the little-endian interpretation of the command's
/// 4-character ASCII mnemonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Command {
    /// `CNXN` — connection banner exchange.
    Connect = 0x4e58_4e43,
    /// `AUTH` — authentication challenge/response.
    Auth = 0x4854_5541,
    /// `OPEN` — open a logical stream for a service string.
    Open = 0x4e45_504f,
    /// `OKAY` — stream acknowledgment / flow-control credit.
    Okay = 0x5941_4b4f,
    /// `WRTE` — stream payload data.
    Write = 0x4554_5257,
    /// `CLSE` — stream teardown.
    Close = 0x4553_4c43,
}

impl Command {
    /// Decode a wire value into a known command.
    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            0x4e58_4e43 => Some(Command::Connect),
            0x4854_5541 => Some(Command::Auth),
            0x4e45_504f => Some(Command::Open),
            0x5941_4b4f => Some(Command::Okay),
            0x4554_5257 => Some(Command::Write),
            0x4553_4c43 => Some(Command::Close),
            _ => None,
        }
    }

    /// The 4-character ASCII mnemonic, for logging.
    pub fn mnemonic(self) -> &'static str {
        match self {
            Command::Connect => "CNXN",
            Command::Auth => "AUTH",
            Command::Open => "OPEN",
            Command::Okay => "OKAY",
            Command::Write => "WRTE",
            Command::Close => "CLSE",
        }
    }
}

/// Legacy payload checksum: sum of all payload bytes mod 2^32.
pub fn checksum(payload: &[u8]) -> u32 {
    payload
        .iter()
        .fold(0u32, |acc, &b| acc.wrapping_add(u32::from(b)))
}

/// A decoded 24-byte header, before command/magic validation.
///
/// Decoding structurally valid input never fails; [`PacketHeader::validate`]
/// separately rejects headers whose magic does not complement the command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub command: u32,
    pub arg0: u32,
    pub arg1: u32,
    pub payload_len: u32,
    pub checksum: u32,
    pub magic: u32,
}

impl PacketHeader {
    /// Decode a header from exactly [`HEADER_LEN`] bytes.
    pub fn decode(buf: &[u8; HEADER_LEN]) -> Self {
        let word = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        Self {
            command: word(0),
            arg0: word(4),
            arg1: word(8),
            payload_len: word(12),
            checksum: word(16),
            magic: word(20),
        }
    }

    /// Encode the header into its wire form.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&self.command.to_le_bytes());
        buf[4..8].copy_from_slice(&self.arg0.to_le_bytes());
        buf[8..12].copy_from_slice(&self.arg1.to_le_bytes());
        buf[12..16].copy_from_slice(&self.payload_len.to_le_bytes());
        buf[16..20].copy_from_slice(&self.checksum.to_le_bytes());
        buf[20..24].copy_from_slice(&self.magic.to_le_bytes());
        buf
    }

    /// Validate framing: the magic field must be the bitwise complement of
    /// the command. Checksum validation is policy-gated and happens in the
    /// protocol layer, not here.
    pub fn validate(&self) -> Result<Command> {
        if self.magic != !self.command {
            return Err(BridgeError::Framing(constants::ERR_BAD_MAGIC));
        }
        Command::from_wire(self.command).ok_or(BridgeError::Framing(constants::ERR_BAD_MAGIC))
    }
}

/// A complete packet: validated command, arguments, and payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub command: Command,
    pub arg0: u32,
    pub arg1: u32,
    pub payload: Bytes,
    /// The checksum as declared on the wire. Locally constructed packets
    /// always compute it; for received packets this is the sender's value,
    /// validated (or not) by negotiated policy in the protocol layer.
    pub declared_checksum: u32,
}

impl Packet {
    /// Construct a packet with a payload.
    pub fn new(command: Command, arg0: u32, arg1: u32, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        let declared_checksum = checksum(&payload);
        Self {
            command,
            arg0,
            arg1,
            payload,
            declared_checksum,
        }
    }

    /// Construct a payload-free packet.
    pub fn bare(command: Command, arg0: u32, arg1: u32) -> Self {
        Self::new(command, arg0, arg1, Bytes::new())
    }

    /// Whether the declared checksum matches the payload.
    pub fn checksum_matches(&self) -> bool {
        self.declared_checksum == checksum(&self.payload)
    }

    /// Build the header for this packet. The checksum is always computed;
    /// whether the receiver validates it is negotiated.
    pub fn header(&self) -> PacketHeader {
        let command = self.command as u32;
        PacketHeader {
            command,
            arg0: self.arg0,
            arg1: self.arg1,
            payload_len: self.payload.len() as u32,
            checksum: self.declared_checksum,
            magic: !command,
        }
    }

    /// The two wire units of this packet: header bytes and payload. Boundary
    /// preserving transports must issue these as separate writes.
    pub fn to_wire_parts(&self) -> ([u8; HEADER_LEN], Bytes) {
        (self.header().encode(), self.payload.clone())
    }

    /// Encode header and payload into one contiguous buffer, for byte-stream
    /// transports where write boundaries carry no meaning.
    pub fn encode_contiguous(&self, buf: &mut BytesMut) {
        buf.reserve(HEADER_LEN + self.payload.len());
        buf.put_slice(&self.header().encode());
        buf.put_slice(&self.payload);
    }
}
