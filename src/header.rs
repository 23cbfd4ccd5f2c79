//! uTP wire header (§6.1) and the selective-ack extension.
//!
//! The header is always 20 bytes, network byte order. We decode/encode
//! explicitly rather than transmuting a `#[repr(C)]` struct so the wire
//! layout is correct regardless of host endianness.

use std::fmt;

pub const HEADER_SIZE: usize = 20;
pub const UTP_VERSION: u8 = 1;

/// Extension id for the selective-ack bitmap (§3, §6.1).
pub const EXT_SELECTIVE_ACK: u8 = 1;

/// Largest SACK bitmap we'll ever emit (§4.E "Sending a packet" step 2).
pub const SACK_MAX_BYTES: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Data = 0,
    Fin = 1,
    State = 2,
    Reset = 3,
    Syn = 4,
}

impl PacketType {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Data),
            1 => Some(Self::Fin),
            2 => Some(Self::State),
            3 => Some(Self::Reset),
            4 => Some(Self::Syn),
            _ => None,
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Data => "ST_DATA",
            Self::Fin => "ST_FIN",
            Self::State => "ST_STATE",
            Self::Reset => "ST_RESET",
            Self::Syn => "ST_SYN",
        };
        f.write_str(s)
    }
}

/// A parsed/to-be-serialised uTP header (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub packet_type: PacketType,
    /// 0 when no extension follows.
    pub extension: u8,
    pub connection_id: u16,
    pub timestamp_microseconds: u32,
    pub timestamp_difference_microseconds: u32,
    pub wnd_size: u32,
    pub seq_nr: u16,
    pub ack_nr: u16,
}

impl Header {
    pub fn encode(&self, out: &mut Vec<u8>) {
        let type_ver = ((self.packet_type as u8) << 4) | UTP_VERSION;
        out.push(type_ver);
        out.push(self.extension);
        out.extend_from_slice(&self.connection_id.to_be_bytes());
        out.extend_from_slice(&self.timestamp_microseconds.to_be_bytes());
        out.extend_from_slice(&self.timestamp_difference_microseconds.to_be_bytes());
        out.extend_from_slice(&self.wnd_size.to_be_bytes());
        out.extend_from_slice(&self.seq_nr.to_be_bytes());
        out.extend_from_slice(&self.ack_nr.to_be_bytes());
    }

    /// Decode the fixed header. Does not validate `connection_id`
    /// against a specific connection — that's the manager's job.
    pub fn decode(buf: &[u8]) -> Result<(Header, u8), HeaderError> {
        if buf.len() < HEADER_SIZE {
            return Err(HeaderError::Truncated);
        }
        let type_ver = buf[0];
        let version = type_ver & 0x0f;
        if version != UTP_VERSION {
            return Err(HeaderError::BadVersion(version));
        }
        let packet_type =
            PacketType::from_u8(type_ver >> 4).ok_or(HeaderError::BadType(type_ver >> 4))?;
        let extension = buf[1];
        let connection_id = u16::from_be_bytes([buf[2], buf[3]]);
        let timestamp_microseconds = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let timestamp_difference_microseconds =
            u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let wnd_size = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);
        let seq_nr = u16::from_be_bytes([buf[16], buf[17]]);
        let ack_nr = u16::from_be_bytes([buf[18], buf[19]]);
        Ok((
            Header {
                packet_type,
                extension,
                connection_id,
                timestamp_microseconds,
                timestamp_difference_microseconds,
                wnd_size,
                seq_nr,
                ack_nr,
            },
            extension,
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
    #[error("packet shorter than the 20-byte utp header")]
    Truncated,
    #[error("unsupported utp version {0}")]
    BadVersion(u8),
    #[error("unknown packet type {0}")]
    BadType(u8),
    #[error("malformed extension chain")]
    BadExtension,
}

/// A single parsed extension: its own id plus the id of the next one.
pub struct ParsedExtension<'a> {
    pub id: u8,
    pub data: &'a [u8],
}

/// Walk the extension chain starting right after the fixed header.
/// `first_ext` is `header.extension`; returns the offset where the
/// payload begins.
pub fn parse_extensions<'a>(
    first_ext: u8,
    buf: &'a [u8],
) -> Result<(Vec<ParsedExtension<'a>>, usize), HeaderError> {
    let mut exts = Vec::new();
    let mut next = first_ext;
    let mut cursor = 0usize;
    while next != 0 {
        if cursor + 2 > buf.len() {
            return Err(HeaderError::BadExtension);
        }
        let this_next = buf[cursor];
        let len = buf[cursor + 1] as usize;
        if cursor + 2 + len > buf.len() {
            return Err(HeaderError::BadExtension);
        }
        exts.push(ParsedExtension {
            id: next,
            data: &buf[cursor + 2..cursor + 2 + len],
        });
        cursor += 2 + len;
        next = this_next;
    }
    Ok((exts, cursor))
}

/// Build the selective-ack bitmap bytes for the extension chain.
/// Bit `i` (LSB-first within each byte) covers `ack_nr + 2 + i` (§6.1).
pub fn encode_sack_extension(out: &mut Vec<u8>, next_ext: u8, bitmap: &[u8]) {
    out.push(next_ext);
    out.push(bitmap.len() as u8);
    out.extend_from_slice(bitmap);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Header {
        Header {
            packet_type: PacketType::Data,
            extension: 0,
            connection_id: 17,
            timestamp_microseconds: 123_456,
            timestamp_difference_microseconds: 789,
            wnd_size: 350_000,
            seq_nr: 1001,
            ack_nr: 5000,
        }
    }

    #[test]
    fn round_trip() {
        let h = sample();
        let mut buf = Vec::new();
        h.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_SIZE);
        let (decoded, ext) = Header::decode(&buf).unwrap();
        assert_eq!(decoded, h);
        assert_eq!(ext, 0);
    }

    #[test]
    fn rejects_short_buffer() {
        let buf = [0u8; 10];
        assert!(matches!(Header::decode(&buf), Err(HeaderError::Truncated)));
    }

    #[test]
    fn rejects_bad_version() {
        let mut h = sample();
        h.extension = 0;
        let mut buf = Vec::new();
        h.encode(&mut buf);
        buf[0] = (buf[0] & 0xf0) | 0x2; // version 2
        assert!(matches!(
            Header::decode(&buf),
            Err(HeaderError::BadVersion(2))
        ));
    }

    #[test]
    fn sack_extension_round_trip() {
        let bitmap = [0b0000_0001u8, 0, 0, 0];
        let mut buf = Vec::new();
        encode_sack_extension(&mut buf, 0, &bitmap);
        let (exts, consumed) = parse_extensions(EXT_SELECTIVE_ACK, &buf).unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(exts.len(), 1);
        assert_eq!(exts[0].id, EXT_SELECTIVE_ACK);
        assert_eq!(exts[0].data, &bitmap);
    }
}
