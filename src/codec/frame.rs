use super::preheader::{hex_decode, hex_encode, Flags, Preheader, PREHEADER_HEX_LEN};
use crate::error::{LinkError, Result};

pub const MAX_BODY_LEN: usize = u16::MAX as usize;
pub const MAX_HEADER_LEN: usize = u8::MAX as usize;

// shares its value with the ack marker; byte 4's flags tell them apart
pub const HANDSHAKE_MID: u8 = 0x2C;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Data { ack_requested: bool },
    Ack,
    Handshake,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub mid: u8,
    pub kind: FrameKind,
    pub header: Option<Vec<u8>>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    Keepalive,
    Frame(Frame),
}

impl Frame {
    pub fn data(mid: u8, ack_requested: bool, header: Option<Vec<u8>>, body: Vec<u8>) -> Result<Self> {
        if body.len() > MAX_BODY_LEN || header.as_ref().is_some_and(|h| h.len() > MAX_HEADER_LEN) {
            return Err(LinkError::ValueTooLarge);
        }
        Ok(Frame {
            mid,
            kind: FrameKind::Data { ack_requested },
            header,
            body,
        })
    }

    pub fn ack(mid: u8) -> Self {
        Frame {
            mid,
            kind: FrameKind::Ack,
            header: None,
            body: Vec::new(),
        }
    }

    pub fn handshake(client_id: &[u8]) -> Self {
        let mut body = client_id.to_vec();
        if !body.ends_with(b"\n") {
            body.push(b'\n');
        }
        Frame {
            mid: HANDSHAKE_MID,
            kind: FrameKind::Handshake,
            header: None,
            body,
        }
    }

    pub fn is_ack_requested(&self) -> bool {
        matches!(self.kind, FrameKind::Data { ack_requested: true })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let hlen = self.header.as_ref().map_or(0, |h| h.len());
        if self.body.len() > MAX_BODY_LEN || hlen > MAX_HEADER_LEN {
            return Err(LinkError::FrameTooLarge);
        }
        let flags = match self.kind {
            FrameKind::Data { ack_requested: false } => Flags::Data,
            FrameKind::Data { ack_requested: true } => Flags::DataAckRequested,
            FrameKind::Ack => Flags::Ack,
            FrameKind::Handshake => Flags::Handshake,
        };
        let preheader = Preheader {
            mid: self.mid,
            hlen: hlen as u8,
            body_len: self.body.len() as u16,
            flags,
        };
        let mut out = preheader.encode()?.into_bytes();
        if let Some(header) = &self.header {
            out.extend(hex_encode(header).into_bytes());
        }
        out.extend(&self.body);
        out.push(b'\n');
        Ok(out)
    }

    // trailing \n already stripped; callers recognise a bare \n as Keepalive
    // before reaching here, so an empty line never shows up.
    pub fn decode(line: &[u8]) -> Result<Self> {
        if line.len() < PREHEADER_HEX_LEN {
            return Err(LinkError::MalformedFrame("line shorter than preheader"));
        }
        let preheader_hex = std::str::from_utf8(&line[..PREHEADER_HEX_LEN])
            .map_err(|_| LinkError::MalformedFrame("non-utf8 preheader"))?;
        let preheader = Preheader::decode(preheader_hex)?;
        let rest = &line[PREHEADER_HEX_LEN..];
        let hlen_hex = preheader.hlen as usize * 2;
        if rest.len() < hlen_hex {
            return Err(LinkError::MalformedFrame("truncated header"));
        }
        let header = if preheader.hlen > 0 {
            let header_hex = std::str::from_utf8(&rest[..hlen_hex])
                .map_err(|_| LinkError::MalformedFrame("non-utf8 header"))?;
            Some(hex_decode(header_hex)?)
        } else {
            None
        };
        let body = rest[hlen_hex..].to_vec();
        if body.len() != preheader.body_len as usize {
            return Err(LinkError::MalformedFrame("body length mismatch"));
        }
        let kind = match preheader.flags {
            Flags::Data => FrameKind::Data { ack_requested: false },
            Flags::DataAckRequested => FrameKind::Data { ack_requested: true },
            Flags::Ack => FrameKind::Ack,
            Flags::Handshake => FrameKind::Handshake,
        };
        Ok(Frame {
            mid: preheader.mid,
            kind,
            header,
            body,
        })
    }

    pub fn wire_len(&self) -> usize {
        PREHEADER_HEX_LEN + self.header.as_ref().map_or(0, |h| h.len() * 2) + self.body.len() + 1
    }
}
