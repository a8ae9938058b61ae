pub mod frame;
pub mod preheader;

pub use frame::{Frame, FrameKind, Line, HANDSHAKE_MID, MAX_BODY_LEN, MAX_HEADER_LEN};
pub use preheader::{Flags, Preheader, PREHEADER_HEX_LEN};

use crate::error::{LinkError, Result};
use tokio::io::{AsyncRead, AsyncReadExt};

// a bare \n is a keepalive; anything else opens with a preheader, then
// exactly the declared header and body bytes, then a terminating \n. does
// not scan for \n inside the body: the preheader's declared lengths decide.
pub async fn read_line<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Line> {
    let first = reader.read_u8().await.map_err(|e| map_eof(e))?;
    if first == b'\n' {
        return Ok(Line::Keepalive);
    }

    let mut preheader_bytes = vec![0u8; PREHEADER_HEX_LEN];
    preheader_bytes[0] = first;
    reader
        .read_exact(&mut preheader_bytes[1..])
        .await
        .map_err(map_eof)?;
    let preheader_hex = std::str::from_utf8(&preheader_bytes)
        .map_err(|_| LinkError::MalformedFrame("non-utf8 preheader"))?;
    let preheader = match Preheader::decode(preheader_hex) {
        Ok(p) => p,
        Err(e) => {
            resync(reader).await?;
            return Err(e);
        }
    };

    let body_start = PREHEADER_HEX_LEN + preheader.hlen as usize * 2;
    let total = body_start + preheader.body_len as usize;
    let mut rest = vec![0u8; total - PREHEADER_HEX_LEN];
    reader.read_exact(&mut rest).await.map_err(map_eof)?;

    let terminator = reader.read_u8().await.map_err(map_eof)?;
    if terminator != b'\n' {
        resync(reader).await?;
        return Err(LinkError::MalformedFrame("frame not newline-terminated"));
    }

    let mut line = preheader_bytes;
    line.extend(rest);
    Ok(Line::Frame(Frame::decode(&line)?))
}

// desynced stream recovery: skip to the next newline so the following
// read_line starts at a line boundary, dropping the bad frame instead of
// tearing down the connection.
async fn resync<R: AsyncRead + Unpin>(reader: &mut R) -> Result<()> {
    loop {
        let b = reader.read_u8().await.map_err(map_eof)?;
        if b == b'\n' {
            return Ok(());
        }
    }
}

fn map_eof(err: std::io::Error) -> LinkError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        LinkError::PeerDisconnect
    } else {
        LinkError::Io(err)
    }
}
