use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};

use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};

use super::preference::{compute_priority, TypePreferences};
use super::IceError;
use crate::io::{Protocol, TcpType, TransportFamily};
use crate::sdp::parse_candidate;

/// ICE candidates are network addresses used to connect to a peer.
///
/// There are different kinds of ICE candidates. The simplest kind is a
/// host candidate which is a socket address on a local (host) network interface.
///
/// Once handed to the agent a candidate is never mutated. It is shared between
/// the agent and the check lists as an `Arc<Candidate>`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Candidate {
    /// Groups similar candidates for the freezing algorithm.
    ///
    /// It is the same for two candidates that have the same type, base address,
    /// transport family and STUN or TURN server. If any of these are different,
    /// then the foundation will be different.
    ///
    /// For remote, this is communicated, and locally it's assigned by the agent.
    foundation: Option<u32>,

    /// A component is a piece of a data stream.
    ///
    /// A data stream may require multiple components, each of which has to
    /// work in order for the data stream as a whole to work.  For RTP/RTCP
    /// data streams, unless RTP and RTCP are multiplexed in the same port,
    /// there are two components per data stream -- one for RTP, and one
    /// for RTCP.
    component_id: u16,

    /// Protocol for the candidate.
    proto: Protocol,

    /// The TCP role (RFC 6544). Only set for TCP candidates.
    tcptype: Option<TcpType>,

    /// Priority.
    ///
    /// For remote, this is communicated, and locally it's (mostly) calculated.
    /// For local peer reflexive it is set.
    prio: Option<u32>,

    /// The actual address to use. This might be a host address, server reflex, relay etc.
    addr: SocketAddr,

    /// The base address
    ///
    /// "Base" refers to the address an agent sends from for a
    /// particular candidate.
    ///
    /// * host - same as `addr`, i.e the local interface address
    /// * peer/server reflexive - the local interface address
    /// * relay - the local socket the allocation was made from
    base: Option<SocketAddr>,

    /// Type of candidate.
    kind: CandidateKind,

    /// Related address.
    ///
    /// For server-reflexive candidates, this is the internal IP/port the candidate corresponds to
    /// (the one behind the NAT, usually). For relay candidates, this is the mapped address selected
    /// by the TURN server.
    raddr: Option<SocketAddr>,

    /// The STUN or TURN server used to obtain the candidate.
    server: Option<SocketAddr>,

    /// Ufrag.
    ///
    /// Ties an ice candidate to a specific ICE session. Set on local candidates when
    /// the agent adopts them, and on remote candidates that carry one.
    ufrag: Option<String>,

    /// The ice agent assigns a local preference if we have multiple candidates
    /// that are the same type.
    local_preference: Option<u32>,
}

impl fmt::Debug for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Candidate({}={}/{}", self.kind, self.addr, self.proto)?;
        if let Some(tcptype) = self.tcptype {
            write!(f, "/{tcptype}")?;
        }
        if let Some(base) = self.base {
            if base != self.addr {
                write!(f, " base={base}")?;
            }
        }
        if let Some(raddr) = self.raddr {
            write!(f, " raddr={raddr}")?;
        }
        write!(f, " prio={})", self.prio())
    }
}

impl Candidate {
    fn new(
        proto: Protocol,
        addr: SocketAddr,
        base: Option<SocketAddr>,
        kind: CandidateKind,
    ) -> Self {
        Candidate {
            foundation: None,
            component_id: 1,
            proto,
            tcptype: None,
            prio: None,
            addr,
            base,
            kind,
            raddr: None,
            server: None,
            ufrag: None,
            local_preference: None,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn parsed(
        foundation: u32,
        component_id: u16,
        proto: Protocol,
        prio: u32,
        addr: SocketAddr,
        kind: CandidateKind,
        raddr: Option<SocketAddr>,
        tcptype: Option<TcpType>,
        ufrag: Option<String>,
    ) -> Self {
        Candidate {
            foundation: Some(foundation),
            component_id,
            tcptype,
            prio: Some(prio),
            raddr,
            ufrag,
            ..Candidate::new(proto, addr, None, kind)
        }
    }

    /// Creates a host ICE candidate.
    ///
    /// Host candidates are local sockets directly on the host.
    pub fn host(addr: SocketAddr, proto: impl TryInto<Protocol>) -> Result<Self, IceError> {
        if !is_valid_ip(addr.ip()) {
            return Err(IceError::BadCandidate(format!("invalid ip {}", addr.ip())));
        }

        Ok(Candidate::new(
            parse_proto(proto)?,
            addr,
            Some(addr),
            CandidateKind::Host,
        ))
    }

    /// Creates a server reflexive ICE candidate.
    ///
    /// Server reflexive candidates are local sockets mapped to external ip discovered
    /// via a STUN binding request.
    /// The `base` is the local interface that this address corresponds to.
    pub fn server_reflexive(
        addr: SocketAddr,
        base: SocketAddr,
        proto: impl TryInto<Protocol>,
    ) -> Result<Self, IceError> {
        if !is_valid_ip(addr.ip()) {
            return Err(IceError::BadCandidate(format!("invalid ip {}", addr.ip())));
        }

        if addr.is_ipv4() != base.is_ipv4() {
            return Err(IceError::BadCandidate(
                "addr and base are different IP versions".to_owned(),
            ));
        }

        Ok(Candidate {
            raddr: Some(base),
            ..Candidate::new(
                parse_proto(proto)?,
                addr,
                Some(base),
                CandidateKind::ServerReflexive,
            )
        })
    }

    /// Creates a relayed ICE candidate.
    ///
    /// Relayed candidates are server sockets relaying traffic to a local socket.
    ///
    /// * `addr` - The TURN server's allocated address that will be used for relaying traffic.
    /// * `local` - The local socket the allocation was requested from. This is the base.
    /// * `proto` - The transport protocol to use (UDP, TCP, etc.).
    pub fn relayed(
        addr: SocketAddr,
        local: SocketAddr,
        proto: impl TryInto<Protocol>,
    ) -> Result<Self, IceError> {
        if !is_valid_ip(addr.ip()) {
            return Err(IceError::BadCandidate(format!("invalid ip {}", addr.ip())));
        }

        Ok(Candidate::new(
            parse_proto(proto)?,
            addr,
            Some(local),
            CandidateKind::Relayed,
        ))
    }

    /// Creates a new ICE candidate from a string.
    pub fn from_sdp_string(s: &str) -> Result<Self, IceError> {
        parse_candidate(s).map_err(|e| IceError::BadCandidate(format!("{}: {}", s, e)))
    }

    /// Creates a peer reflexive ICE candidate.
    ///
    /// Peer reflexive candidates are NAT:ed addresses discovered via STUN
    /// binding requests and responses. `addr` is the discovered address. `base` is the
    /// local address we used to get this response.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn peer_reflexive(
        proto: Protocol,
        tcptype: Option<TcpType>,
        addr: SocketAddr,
        base: SocketAddr,
        prio: u32,
        foundation: u32,
        component_id: u16,
        local_preference: Option<u32>,
    ) -> Self {
        Candidate {
            foundation: Some(foundation),
            component_id,
            tcptype,
            prio: Some(prio),
            local_preference,
            ..Candidate::new(proto, addr, Some(base), CandidateKind::PeerReflexive)
        }
    }

    /// Sets the TCP role of a TCP candidate.
    pub fn with_tcptype(mut self, tcptype: TcpType) -> Self {
        self.tcptype = Some(tcptype);
        self
    }

    /// Sets the component this candidate belongs to (default 1).
    pub fn with_component(mut self, component_id: u16) -> Result<Self, IceError> {
        if component_id < 1 {
            return Err(IceError::BadCandidate(
                "component id must be at least 1".into(),
            ));
        }
        self.component_id = component_id;
        Ok(self)
    }

    /// Sets the STUN/TURN server the candidate was obtained from.
    pub fn with_server(mut self, server: SocketAddr) -> Self {
        self.server = Some(server);
        self
    }

    /// Sets the related address (for relayed candidates, the mapped address
    /// seen by the TURN server).
    pub fn with_related(mut self, raddr: SocketAddr) -> Self {
        self.raddr = Some(raddr);
        self
    }

    /// Fixes the values the agent derives when a local candidate is adopted.
    pub(crate) fn adopt(mut self, foundation: u32, local_preference: u32, prio: u32) -> Self {
        self.foundation = Some(foundation);
        self.local_preference = Some(local_preference);
        self.prio = Some(prio);
        self
    }

    /// Candidate foundation.
    ///
    /// Local candidates get theirs from the agent. A candidate that never went
    /// through the agent falls back on a hash of the same properties.
    pub fn foundation(&self) -> u32 {
        if let Some(v) = self.foundation {
            return v;
        }

        let mut hasher = DefaultHasher::new();
        self.kind.hash(&mut hasher);
        self.proto.family().hash(&mut hasher);
        self.base().hash(&mut hasher);
        self.server.hash(&mut hasher);

        let hash = hasher.finish();
        (hash >> 32) as u32 ^ hash as u32
    }

    /// Returns the priority value for the specified ICE candidate.
    ///
    /// The priority is a positive integer between 1 and 2^31 - 1 (inclusive), calculated
    /// according to the ICE specification defined in RFC 8445, Section 5.1.2.
    pub fn prio(&self) -> u32 {
        // Remote candidates have their prio calculated on their side.
        if let Some(prio) = self.prio {
            return prio;
        }
        self.prio_as(self.kind, &TypePreferences::default())
    }

    /// The priority this candidate would have as peer reflexive. Sent in the
    /// PRIORITY attribute of the checks from this candidate.
    pub(crate) fn prio_prflx(&self, table: &TypePreferences) -> u32 {
        self.prio_as(CandidateKind::PeerReflexive, table)
    }

    fn prio_as(&self, kind: CandidateKind, table: &TypePreferences) -> u32 {
        compute_priority(
            table.get(kind, self.proto.family()),
            self.local_preference(),
            self.component_id,
        )
    }

    pub(crate) fn local_preference(&self) -> u32 {
        self.local_preference
            .unwrap_or_else(|| if self.addr.is_ipv6() { 65_535 } else { 65_534 })
    }

    /// The component this candidate belongs to.
    pub fn component_id(&self) -> u16 {
        self.component_id
    }

    /// Returns the address for the specified ICE candidate.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The transport protocol of the ICE candidate. For example tcp/udp/..
    pub fn proto(&self) -> Protocol {
        self.proto
    }

    /// The TCP role, if any.
    pub fn tcptype(&self) -> Option<TcpType> {
        self.tcptype
    }

    /// Address the candidate sends from.
    pub fn base(&self) -> SocketAddr {
        self.base.unwrap_or(self.addr)
    }

    /// Related address.
    pub fn raddr(&self) -> Option<SocketAddr> {
        self.raddr
    }

    /// STUN/TURN server the candidate was obtained from.
    pub fn server(&self) -> Option<SocketAddr> {
        self.server
    }

    /// Returns the kind of this candidate.
    pub fn kind(&self) -> CandidateKind {
        self.kind
    }

    /// Datagram or stream.
    pub fn family(&self) -> TransportFamily {
        self.proto.family()
    }

    /// Classification of the candidate by transport and TCP role.
    pub fn transport_kind(&self) -> TransportKind {
        match (self.proto, self.tcptype) {
            (Protocol::Udp, None) => TransportKind::Udp,
            (Protocol::Tcp, Some(TcpType::Active)) => TransportKind::TcpActive,
            (Protocol::Tcp, Some(TcpType::Passive)) => TransportKind::TcpPassive,
            (Protocol::Tcp, Some(TcpType::So)) => TransportKind::TcpSimultaneousOpen,
            _ => TransportKind::Unsupported,
        }
    }

    pub(crate) fn set_ufrag(&mut self, ufrag: &str) {
        self.ufrag = Some(ufrag.into());
    }

    /// The username fragment tying this candidate to an ICE session.
    pub fn ufrag(&self) -> Option<&str> {
        self.ufrag.as_deref()
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_sdp_string())
    }
}

fn parse_proto(proto: impl TryInto<Protocol>) -> Result<Protocol, IceError> {
    proto
        .try_into()
        .map_err(|_| IceError::BadCandidate("invalid protocol".into()))
}

/// Type of candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateKind {
    /// Host (local network interface)
    Host,
    /// Prflx (Peer reflexive)
    PeerReflexive,
    /// Srflx (STUN)
    ServerReflexive,
    /// Relay (TURN)
    Relayed,
}

impl fmt::Display for CandidateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let x = match self {
            CandidateKind::Host => "host",
            CandidateKind::PeerReflexive => "prflx",
            CandidateKind::ServerReflexive => "srflx",
            CandidateKind::Relayed => "relay",
        };
        write!(f, "{x}")
    }
}

/// Transport of a candidate, including the TCP role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Plain UDP.
    Udp,
    /// TCP, connects out.
    TcpActive,
    /// TCP, accepts.
    TcpPassive,
    /// TCP simultaneous open.
    TcpSimultaneousOpen,
    /// Anything else, never paired.
    Unsupported,
}

impl TransportKind {
    /// Whether a local candidate of this kind can be paired with a remote of `other`.
    ///
    /// RFC 6544, Section 6.2: active connects to passive, S-O to S-O.
    pub fn pairs_with(self, other: TransportKind) -> bool {
        use TransportKind::*;
        matches!(
            (self, other),
            (Udp, Udp)
                | (TcpActive, TcpPassive)
                | (TcpPassive, TcpActive)
                | (TcpSimultaneousOpen, TcpSimultaneousOpen)
        )
    }
}

fn is_valid_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v) => {
            !v.is_link_local() && !v.is_broadcast() && !v.is_multicast() && !v.is_unspecified()
        }
        IpAddr::V6(v) => !v.is_multicast() && !v.is_unspecified(),
    }
}

/// Serialize [Candidate] into candidate info.
///
/// Always set `sdpMid` to null and `sdpMLineIndex` to 0.
///
/// e.g. serde_json would produce:
/// ```json
/// {
///  "candidate": "candidate:1 1 udp 2113929471 1.2.3.4 1234 typ host",
///  "sdpMid": null,
///  "sdpMLineIndex": 0
///  "usernameFragment": "ufrag"
/// }
/// ```
impl Serialize for Candidate {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut o = serializer.serialize_struct("CandidateInfo", 4)?;
        o.serialize_field("candidate", &self.to_sdp_string())?;
        o.serialize_field("sdpMid", &None::<()>)?;
        o.serialize_field("sdpMLineIndex", &0)?;
        o.serialize_field("usernameFragment", &self.ufrag())?;
        o.end()
    }
}

/// Deserialize [Candidate] from a candidate info.
///
/// Similar to [Candidate::serialize], we drop `sdpMid` and `sdpMLineIndex` when parsing.
impl<'de> Deserialize<'de> for Candidate {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct CandidateInfo {
            candidate: String,
            username_fragment: Option<String>,
        }

        let CandidateInfo {
            candidate,
            username_fragment,
        } = CandidateInfo::deserialize(deserializer)?;

        let mut candidate =
            Candidate::from_sdp_string(&candidate).map_err(serde::de::Error::custom)?;

        if let Some(ufrag) = username_fragment {
            candidate.set_ufrag(&ufrag);
        }

        Ok(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn basic_serialize_deserialize() {
        let c1 = Candidate::host(addr("1.2.3.4:9876"), Protocol::Udp).unwrap();
        let json = serde_json::to_string(&c1).unwrap();
        let c2: Candidate = serde_json::from_str(&json).unwrap();
        assert_eq!(c1.to_string(), c2.to_string());
        assert_eq!(c1.foundation(), c2.foundation());
    }

    #[test]
    fn serialize() {
        let mut candidate = Candidate::host(addr("1.2.3.4:9876"), Protocol::Udp)
            .unwrap()
            .adopt(7, 65534, 2130706175);
        assert_eq!(
            serde_json::to_string(&candidate).unwrap(),
            r#"{"candidate":"candidate:7 1 udp 2130706175 1.2.3.4 9876 typ host","sdpMid":null,"sdpMLineIndex":0,"usernameFragment":null}"#
        );

        candidate.set_ufrag("ufrag");
        assert_eq!(
            serde_json::to_string(&candidate).unwrap(),
            r#"{"candidate":"candidate:7 1 udp 2130706175 1.2.3.4 9876 typ host ufrag ufrag","sdpMid":null,"sdpMLineIndex":0,"usernameFragment":"ufrag"}"#
        );
    }

    #[test]
    fn deserialize() {
        let json = r#"{"candidate":"candidate:1204404974 1 udp 2130706175 1.2.3.4 9876 typ host ufrag ufrag","sdpMid":"ignored","sdpMLineIndex":123,"usernameFragment":"ufrag"}"#;
        let candidate: Candidate = serde_json::from_str(json).unwrap();
        assert_eq!(candidate.ufrag(), Some("ufrag"));
        assert_eq!(candidate.addr(), addr("1.2.3.4:9876"));
        assert_eq!(candidate.base(), addr("1.2.3.4:9876"));
        assert_eq!(candidate.kind(), CandidateKind::Host);
        assert_eq!(candidate.proto(), Protocol::Udp);
        assert_eq!(candidate.prio(), 2130706175);
        assert_eq!(candidate.foundation(), 1204404974);
        assert_eq!(candidate.component_id(), 1);
        assert_eq!(candidate.raddr(), None);
    }

    #[test]
    fn relayed_base_is_local_socket() {
        let relay = Candidate::relayed(addr("1.2.3.4:9876"), addr("10.0.0.1:5000"), "tcp")
            .unwrap()
            .with_tcptype(TcpType::Passive);
        assert_eq!(relay.base(), addr("10.0.0.1:5000"));
        assert_eq!(relay.transport_kind(), TransportKind::TcpPassive);
        assert_eq!(relay.family(), TransportFamily::Tcp);
    }

    #[test]
    fn transport_kinds() {
        let udp = Candidate::host(addr("1.2.3.4:1"), "udp").unwrap();
        let tcp = Candidate::host(addr("1.2.3.4:2"), "tcp").unwrap();
        let so = tcp.clone().with_tcptype(TcpType::So);
        let active = tcp.clone().with_tcptype(TcpType::Active);
        let tls = Candidate::host(addr("1.2.3.4:3"), "tls").unwrap();

        assert_eq!(udp.transport_kind(), TransportKind::Udp);
        assert_eq!(so.transport_kind(), TransportKind::TcpSimultaneousOpen);
        assert_eq!(tcp.transport_kind(), TransportKind::Unsupported);
        assert_eq!(tls.transport_kind(), TransportKind::Unsupported);

        assert!(udp.transport_kind().pairs_with(TransportKind::Udp));
        assert!(active.transport_kind().pairs_with(TransportKind::TcpPassive));
        assert!(!active.transport_kind().pairs_with(TransportKind::TcpActive));
        assert!(so.transport_kind().pairs_with(TransportKind::TcpSimultaneousOpen));
        assert!(!so.transport_kind().pairs_with(TransportKind::TcpPassive));
        assert!(!udp.transport_kind().pairs_with(TransportKind::TcpPassive));
        assert!(!TransportKind::Unsupported.pairs_with(TransportKind::Unsupported));
    }

    #[test]
    fn bad_candidate() {
        let s = "candidate:12344 bad value";
        assert!(Candidate::from_sdp_string(s).is_err());
        assert!(Candidate::host(addr("0.0.0.0:1"), "udp").is_err());
        assert!(Candidate::host(addr("224.0.0.1:1"), "udp").is_err());
        assert!(Candidate::host(addr("1.2.3.4:1"), "sctp").is_err());
        assert!(Candidate::host(addr("1.2.3.4:1"), "udp")
            .unwrap()
            .with_component(0)
            .is_err());
    }

    #[test]
    fn srflx_candidate_disallows_mixed_ip_versions() {
        let error = Candidate::server_reflexive(addr("10.0.0.1:1000"), addr("[::1]:1000"), "udp")
            .unwrap_err();

        assert_eq!(
            error.to_string(),
            "ICE bad candidate: addr and base are different IP versions"
        );
    }

    #[test]
    fn host_prio_from_default_table() {
        let udp = Candidate::host(addr("1.2.3.4:1"), "udp").unwrap();
        let tcp = Candidate::host(addr("1.2.3.4:1"), "tcp")
            .unwrap()
            .with_tcptype(TcpType::Passive);
        assert_eq!(udp.prio(), 120 << 24 | 65534 << 8 | 255);
        assert_eq!(tcp.prio(), 126 << 24 | 65534 << 8 | 255);
    }
}
