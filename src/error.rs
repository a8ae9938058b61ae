// PeerDisconnect/Timeout/QueueOverflow are recovered locally by a connection
// and never escape to application code. Only ValueTooLarge and
// MalformedFrame ever cross the public API.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, LinkError>;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    #[error("frame body/header exceeds the wire length limit")]
    FrameTooLarge,

    #[error("write body exceeds 65535 bytes")]
    ValueTooLarge,

    #[error("peer disconnected")]
    PeerDisconnect,

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("inbox queue overflowed")]
    QueueOverflow,

    #[error("no initial wifi connection")]
    NoInitialWifi,

    #[error("no initial server connection")]
    NoInitialServer,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
