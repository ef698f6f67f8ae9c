//! charla-protocol
//!
//! Wire-level framing for the Charla chat server.
//!
//! Every packet is a fixed 9-byte header followed by an optional payload
//! whose length the header carries. This crate only moves bytes; what a
//! payload means is up to the server's command layer.
//!
//! - [`wire_types`]   : packet types, header layout, limits
//! - [`packet_codec`] : `send_packet` / `recv_packet` over async streams

pub mod wire_types;
pub mod packet_codec;

pub use packet_codec::{recv_packet, send_packet, ProtocolError, Stage};
pub use wire_types::{PacketHeader, PacketType, HEADER_LEN, MAX_PAYLOAD_LEN};
