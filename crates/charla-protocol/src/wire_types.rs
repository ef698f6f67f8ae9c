//! Low-level wire types and constants.
//!
//! This module defines:
//! - Packet type IDs carried in the first header byte.
//! - The fixed packet header and its exact byte layout.
//! - Limits enforced by the codec.
//!
//! The actual send/receive logic lives in `packet_codec`.

use std::fmt;

/// Size of the fixed header on the wire, in bytes.
///
/// ```text
/// [0]    : packet type (u8)
/// [1..5] : msgid (u32 BE)
/// [5..9] : payload_length (u32 BE)
/// ```
pub const HEADER_LEN: usize = 9;

/// Largest payload the codec is willing to buffer for a single packet.
///
/// A peer announcing more than this is treated like an allocation
/// failure: the packet is refused and the connection should be dropped.
pub const MAX_PAYLOAD_LEN: u32 = 1 << 20;

/// Packet types understood by the server core.
///
/// The header carries the type as a raw `u8`, so types outside this set
/// still travel through the codec untouched.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// Log in under the handle carried in the payload.
    Login = 1,

    /// Log out of the current handle.
    Logout = 2,

    /// List the handles currently logged in.
    Users = 3,

    /// Send a message: payload is `recipient\r\nbody`.
    Send = 4,

    /// Positive acknowledgement of a request, correlated by msgid.
    Ack = 5,

    /// Negative acknowledgement of a request, correlated by msgid.
    Nack = 6,

    /// Message delivered from another user.
    Mesg = 7,

    /// Receipt: a message we sent was delivered.
    Rcvd = 8,

    /// Bounce: a message we sent could not be delivered.
    Bounce = 9,
}

impl PacketType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(PacketType::Login),
            2 => Some(PacketType::Logout),
            3 => Some(PacketType::Users),
            4 => Some(PacketType::Send),
            5 => Some(PacketType::Ack),
            6 => Some(PacketType::Nack),
            7 => Some(PacketType::Mesg),
            8 => Some(PacketType::Rcvd),
            9 => Some(PacketType::Bounce),
            _ => None,
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PacketType::Login => "LOGIN",
            PacketType::Logout => "LOGOUT",
            PacketType::Users => "USERS",
            PacketType::Send => "SEND",
            PacketType::Ack => "ACK",
            PacketType::Nack => "NACK",
            PacketType::Mesg => "MESG",
            PacketType::Rcvd => "RCVD",
            PacketType::Bounce => "BOUNCE",
        };
        f.write_str(name)
    }
}

/// Fixed-size packet header.
///
/// Fields hold host-order values; conversion to and from network byte
/// order happens only in [`PacketHeader::to_bytes`] and
/// [`PacketHeader::from_bytes`], so a received header can be re-encoded
/// and forwarded byte-for-byte.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    /// Raw packet type byte (see [`PacketType`]).
    pub packet_type: u8,

    /// Correlation id chosen by the sender.
    pub msgid: u32,

    /// Number of payload bytes following the header.
    pub payload_length: u32,
}

impl PacketHeader {
    /// Header for a known packet type.
    pub fn new(packet_type: PacketType, msgid: u32, payload_length: u32) -> Self {
        PacketHeader {
            packet_type: packet_type as u8,
            msgid,
            payload_length,
        }
    }

    /// Header with the given type/msgid and no payload.
    pub fn empty(packet_type: PacketType, msgid: u32) -> Self {
        PacketHeader::new(packet_type, msgid, 0)
    }

    /// The recognised packet type, if any.
    pub fn kind(&self) -> Option<PacketType> {
        PacketType::from_u8(self.packet_type)
    }

    /// Encode into the exact wire representation.
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = self.packet_type;
        buf[1..5].copy_from_slice(&self.msgid.to_be_bytes());
        buf[5..9].copy_from_slice(&self.payload_length.to_be_bytes());
        buf
    }

    /// Decode from the exact wire representation.
    pub fn from_bytes(buf: &[u8; HEADER_LEN]) -> Self {
        PacketHeader {
            packet_type: buf[0],
            msgid: read_u32_be(&buf[1..5]),
            payload_length: read_u32_be(&buf[5..9]),
        }
    }
}

fn read_u32_be(bytes: &[u8]) -> u32 {
    let mut arr = [0u8; 4];
    arr.copy_from_slice(&bytes[..4]);
    u32::from_be_bytes(arr)
}
