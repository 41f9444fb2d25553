#![allow(clippy::new_without_default)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

mod stun;
pub use stun::{stun_resend_delay, StunMessage, TransId};
pub use stun::{ROLE_CONFLICT, STUN_INITIAL_RTO, STUN_MAX_RETRANS, STUN_MAX_RTO};

mod id;
// this is only exported from this crate to avoid needing
// a "util" crate or similar.
pub(crate) use id::Id;

mod error;
pub use self::error::{NetError, StunError};

mod sha1;
pub(crate) use self::sha1::Sha1;

/// Type of protocol a candidate is reachable over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    /// UDP
    Udp,
    /// TCP (See RFC 4571 for framing)
    Tcp,
    /// TCP with fixed SSL Hello Exchange
    SslTcp,
    /// TLS (only used via relay)
    Tls,
}

impl Protocol {
    /// The transport family, which decides pairing, foundations and the
    /// type preference column.
    pub fn family(&self) -> TransportFamily {
        match self {
            Protocol::Udp => TransportFamily::Udp,
            Protocol::Tcp | Protocol::SslTcp | Protocol::Tls => TransportFamily::Tcp,
        }
    }
}

/// Datagram or stream transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TransportFamily {
    /// Unreliable datagrams.
    Udp,
    /// Reliable, framed stream.
    Tcp,
}

/// TCP connection role as defined by the `tcptype` SDP attribute.
///
/// This enum corresponds to the TCP connection setup modes defined in
/// [RFC 6544 §4.5](https://datatracker.ietf.org/doc/html/rfc6544#section-4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TcpType {
    /// The endpoint actively initiates the TCP connection.
    Active,

    /// The endpoint passively waits for an incoming TCP connection.
    Passive,

    /// Simultaneous open.
    ///
    /// Both endpoints attempt to actively open a TCP connection to each other
    /// at the same time.
    So,
}

impl fmt::Display for TcpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let str = match self {
            Self::Active => "active",
            Self::Passive => "passive",
            Self::So => "so",
        };
        f.write_str(str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseTcpTypeError;

impl fmt::Display for ParseTcpTypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid TCP type (expected: active, passive, or so)")
    }
}

impl std::error::Error for ParseTcpTypeError {}

impl FromStr for TcpType {
    type Err = ParseTcpTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            _ if s.eq_ignore_ascii_case("active") => Ok(Self::Active),
            _ if s.eq_ignore_ascii_case("passive") => Ok(Self::Passive),
            _ if s.eq_ignore_ascii_case("so") => Ok(Self::So),
            _ => Err(ParseTcpTypeError),
        }
    }
}

impl TryFrom<&str> for Protocol {
    type Error = ();

    fn try_from(proto: &str) -> Result<Self, Self::Error> {
        let proto = proto.to_lowercase();
        match proto.as_str() {
            "udp" => Ok(Protocol::Udp),
            "tcp" => Ok(Protocol::Tcp),
            "ssltcp" => Ok(Protocol::SslTcp),
            "tls" => Ok(Protocol::Tls),
            _ => Err(()),
        }
    }
}

impl From<Protocol> for &str {
    fn from(proto: Protocol) -> Self {
        match proto {
            Protocol::Udp => "udp",
            Protocol::Tcp => "tcp",
            Protocol::SslTcp => "ssltcp",
            Protocol::Tls => "tls",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let x: &str = (*self).into();
        write!(f, "{}", x)
    }
}

impl fmt::Display for TransportFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportFamily::Udp => write!(f, "udp"),
            TransportFamily::Tcp => write!(f, "tcp"),
        }
    }
}
