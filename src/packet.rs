//! The packet record kept in the send/receive reorder buffers (§3 "Packet",
//! §4.D "Packet pool").

use std::time::Instant;

use crate::header::PacketType;

/// A packet owned by a reorder buffer: either outstanding data we might
/// have to resend, or out-of-order data waiting for its predecessor.
pub struct Packet {
    pub seq_nr: u16,
    /// Bytes of header + extension chain that precede the payload.
    pub header_size: usize,
    /// Application payload. Capacity reflects which pool slab this came
    /// from (§4.D); empty for header-only ST_STATE/ST_RESET packets.
    pub payload: Vec<u8>,
    pub send_time: Instant,
    /// Capped at the retransmit limit; 6 bits on the wire reference
    /// implementation, plenty of headroom as a `u8` here.
    pub num_transmissions: u8,
    pub need_resend: bool,
    pub mtu_probe: bool,
    /// The wire type this packet was sent as. Resends must preserve it
    /// rather than re-deriving it from `payload.is_empty()` — an ST_SYN
    /// and an ST_FIN are both header-only but carry different resend
    /// limits (§4.E "Resend").
    pub packet_type: PacketType,
}

impl Packet {
    pub fn new(seq_nr: u16, header_size: usize, payload: Vec<u8>, now: Instant) -> Self {
        Packet {
            seq_nr,
            header_size,
            payload,
            send_time: now,
            num_transmissions: 0,
            need_resend: false,
            mtu_probe: false,
            packet_type: PacketType::Data,
        }
    }

    /// Total wire size: header + payload (invariant 1 in §3 uses this).
    pub fn size(&self) -> usize {
        self.header_size + self.payload.len()
    }
}
