use thiserror::Error;

use crate::io::{NetError, StunError, TransId};

use super::StreamId;

/// Errors from the ICE agent.
#[derive(Debug, Error)]
pub enum IceError {
    /// Some problem with a local or remote candidate.
    #[error("ICE bad candidate: {0}")]
    BadCandidate(String),

    /// Checks can't be formed or sent before the remote ufrag/pwd are known.
    #[error("remote ICE credentials not set")]
    NoRemoteCredentials,

    /// Connectivity checks were already started.
    #[error("connectivity checks already started")]
    AlreadyStarted,

    /// No media stream with the given id.
    #[error("unknown stream: {0}")]
    UnknownStream(StreamId),

    /// Checks are tasks and need a tokio runtime.
    #[error("no tokio runtime available")]
    NoRuntime,

    /// A connectivity check could not be carried out.
    #[error("{0}")]
    Check(#[from] CheckError),

    /// An incoming STUN message was broken.
    #[error("{0}")]
    Stun(#[from] StunError),
}

/// Errors from a single connectivity check.
#[derive(Debug, Error)]
pub enum CheckError {
    /// A checker only runs one transaction at a time.
    #[error("check already in progress")]
    Reentrant,

    /// The transaction id is already awaiting a response.
    #[error("duplicate transaction id: {0}")]
    DuplicateTransaction(TransId),

    /// The request could not be written to the session.
    #[error("{0}")]
    Net(#[from] NetError),
}
