use std::io;

use thiserror::Error;

/// A STUN message could not be parsed or processed.
#[derive(Debug, Error)]
pub enum StunError {
    /// A STUN message could not be parsed.
    #[error("STUN parse error: {0}")]
    Parse(String),

    /// An IO error occurred while handling a STUN message.
    #[error("STUN io: {0}")]
    Io(#[from] io::Error),
}

/// Errors from a transport session.
#[derive(Debug, Error)]
pub enum NetError {
    /// The session is closed or closing.
    #[error("session closed")]
    Closed,

    /// Some STUN protocol error.
    #[error("{0}")]
    Stun(#[from] StunError),

    /// A wrapped IO error.
    #[error("{0}")]
    Io(#[from] io::Error),
}
