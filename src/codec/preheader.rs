// 10 ascii-hex chars opening every non-keepalive frame, 5 bytes before
// hex-encoding:
// byte 0: mid (1..255, 0 = sender just booted)
// byte 1: hlen, length of the user header in bytes
// byte 2: body length low byte
// byte 3: body length high byte
// byte 4: flags, see Flags

use crate::error::{LinkError, Result};

pub const PREHEADER_BYTES: usize = 5;
pub const PREHEADER_HEX_LEN: usize = PREHEADER_BYTES * 2;

// exhaustively enumerated rather than a bare bitmask so an unrecognized
// value is a decode error instead of silently wrong behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flags {
    Data,
    DataAckRequested,
    Ack,
    Handshake,
}

impl Flags {
    const DATA: u8 = 0x00;
    const DATA_ACK_REQUESTED: u8 = 0x01;
    const ACK: u8 = 0x2C;
    const HANDSHAKE: u8 = 0xFF;

    fn to_byte(self) -> u8 {
        match self {
            Flags::Data => Self::DATA,
            Flags::DataAckRequested => Self::DATA_ACK_REQUESTED,
            Flags::Ack => Self::ACK,
            Flags::Handshake => Self::HANDSHAKE,
        }
    }

    fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            Self::DATA => Ok(Flags::Data),
            Self::DATA_ACK_REQUESTED => Ok(Flags::DataAckRequested),
            Self::ACK => Ok(Flags::Ack),
            Self::HANDSHAKE => Ok(Flags::Handshake),
            _ => Err(LinkError::MalformedFrame("unrecognised flags byte")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preheader {
    pub mid: u8,
    pub hlen: u8,
    pub body_len: u16,
    pub flags: Flags,
}

impl Preheader {
    pub fn encode(&self) -> Result<String> {
        if self.body_len as usize > u16::MAX as usize {
            return Err(LinkError::FrameTooLarge);
        }
        let [lo, hi] = self.body_len.to_le_bytes();
        let bytes = [self.mid, self.hlen, lo, hi, self.flags.to_byte()];
        Ok(hex_encode(&bytes))
    }

    pub fn decode(hex: &str) -> Result<Self> {
        if hex.len() != PREHEADER_HEX_LEN {
            return Err(LinkError::MalformedFrame("short preheader"));
        }
        let bytes = hex_decode(hex)?;
        Ok(Preheader {
            mid: bytes[0],
            hlen: bytes[1],
            body_len: u16::from_le_bytes([bytes[2], bytes[3]]),
            flags: Flags::from_byte(bytes[4])?,
        })
    }
}

pub fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

pub fn hex_decode(hex: &str) -> Result<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return Err(LinkError::MalformedFrame("odd-length hex"));
    }
    let mut out = Vec::with_capacity(hex.len() / 2);
    let bytes = hex.as_bytes();
    for chunk in bytes.chunks(2) {
        let hi = hex_nibble(chunk[0])?;
        let lo = hex_nibble(chunk[1])?;
        out.push((hi << 4) | lo);
    }
    Ok(out)
}

fn hex_nibble(c: u8) -> Result<u8> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(LinkError::MalformedFrame("non-hex digit in preheader")),
    }
}
