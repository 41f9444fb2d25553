use std::net::SocketAddr;
use std::sync::Arc;

use super::Candidate;
use crate::io::{NetError, StunMessage};

/// A transport session between a local and a remote candidate.
///
/// The session owns the socket (or TCP connection) and does the framing.
/// The agent only ever writes STUN messages through it. Incoming traffic is
/// handed to [`IceAgent::handle_receive`][crate::IceAgent::handle_receive] by
/// whoever reads the socket.
pub trait Session: Send + Sync {
    /// Address we send from.
    fn local_addr(&self) -> SocketAddr;

    /// Address we send to.
    fn remote_addr(&self) -> SocketAddr;

    /// Whether the session is shutting down. Checks over a closing session
    /// are canceled before they are sent.
    fn is_closing(&self) -> bool;

    /// Serialize and send a STUN message, signed with `password`.
    fn write(&self, message: &StunMessage, password: &str) -> Result<(), NetError>;
}

/// Sets up sessions for candidate pairs.
pub trait SessionProvider: Send + Sync {
    /// The session for a local/remote pair, or `None` if it can't be created.
    ///
    /// Called from the tasks performing checks and from the request handler,
    /// so it must not block for long.
    fn session(&self, local: &Candidate, remote: &Candidate) -> Option<Arc<dyn Session>>;
}

/// Finds local candidates.
///
/// Interface enumeration and STUN/TURN lookups happen behind this trait.
pub trait Gatherer {
    /// Local host, server reflexive and relayed candidates. TCP candidates
    /// only when `include_tcp` is set.
    fn gather(&self, include_tcp: bool) -> Vec<Candidate>;
}
