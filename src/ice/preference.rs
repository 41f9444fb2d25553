use crate::io::TransportFamily;

use super::{Candidate, CandidateKind};

/// Function assigning a local preference to a candidate.
///
/// The second argument is the number of candidates of the same kind that
/// were added before this one.
pub type LocalPreference = fn(&Candidate, usize) -> u32;

/// Type preference table indexed by candidate kind and transport family.
///
/// The default ranks host above peer reflexive above server reflexive above
/// relayed. Within a kind, TCP ranks above UDP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypePreferences {
    // [tcp, udp] per kind
    host: [u8; 2],
    prflx: [u8; 2],
    srflx: [u8; 2],
    relay: [u8; 2],
}

impl Default for TypePreferences {
    fn default() -> Self {
        TypePreferences {
            host: [126, 120],
            prflx: [110, 105],
            srflx: [100, 95],
            relay: [2, 1],
        }
    }
}

impl TypePreferences {
    /// Type preference for a kind of candidate over a transport family.
    pub fn get(&self, kind: CandidateKind, family: TransportFamily) -> u32 {
        self.row(kind)[Self::column(family)] as u32
    }

    /// Replace a single entry of the table.
    ///
    /// Type preferences must be within 0-126.
    pub fn set(mut self, kind: CandidateKind, family: TransportFamily, value: u8) -> Self {
        let column = Self::column(family);
        self.row_mut(kind)[column] = value.min(126);
        self
    }

    fn column(family: TransportFamily) -> usize {
        match family {
            TransportFamily::Tcp => 0,
            TransportFamily::Udp => 1,
        }
    }

    fn row(&self, kind: CandidateKind) -> &[u8; 2] {
        match kind {
            CandidateKind::Host => &self.host,
            CandidateKind::PeerReflexive => &self.prflx,
            CandidateKind::ServerReflexive => &self.srflx,
            CandidateKind::Relayed => &self.relay,
        }
    }

    fn row_mut(&mut self, kind: CandidateKind) -> &mut [u8; 2] {
        match kind {
            CandidateKind::Host => &mut self.host,
            CandidateKind::PeerReflexive => &mut self.prflx,
            CandidateKind::ServerReflexive => &mut self.srflx,
            CandidateKind::Relayed => &mut self.relay,
        }
    }
}

/// Candidate priority as of RFC 8445, Section 5.1.2.1.
pub fn compute_priority(type_preference: u32, local_preference: u32, component_id: u16) -> u32 {
    // The recommended formula combines a preference for the candidate type
    // (server reflexive, peer reflexive, relayed, and host), a preference
    // for the IP address for which the candidate was obtained, and a
    // component ID using the following formula:
    //
    // priority = (2^24)*(type preference) +
    //     (2^8)*(local preference) +
    //     (2^0)*(256 - component ID)
    let type_preference = type_preference.min(126);
    let local_preference = local_preference.min(65_535);
    let component = 256 - (component_id.clamp(1, 256) as u32);

    let prio = type_preference << 24 | local_preference << 8 | component;

    // https://datatracker.ietf.org/doc/html/rfc8445#section-5.1.2
    // MUST be a positive integer between 1 and (2**31 - 1)
    debug_assert!(prio < 2_u32.pow(31));

    prio.max(1)
}

/// Pair priority as of RFC 8445, Section 6.1.2.3.
pub fn pair_priority(local: u32, remote: u32, controlling: bool) -> u64 {
    // Let G be the priority for the candidate provided by the controlling
    // agent.  Let D be the priority for the candidate provided by the
    // controlled agent.
    // pair priority = 2^32*MIN(G,D) + 2*MAX(G,D) + (G>D?1:0)
    let (g, d) = if controlling {
        (local as u64, remote as u64)
    } else {
        (remote as u64, local as u64)
    };

    (1 << 32) * g.min(d) + 2 * g.max(d) + if g > d { 1 } else { 0 }
}

/// Standard local preference calculation for a candidate.
///
/// It is used to determine the preference of a candidate when there are multiple candidates
/// for a particular component for a particular data stream.
///
/// The preference is calculated based on the candidate type, the IP version of the candidate,
/// and the same_kind counter.
pub fn default_local_preference(c: &Candidate, same_kind: usize) -> u32 {
    let ip = c.addr();

    // https://datatracker.ietf.org/doc/html/rfc8445#section-5.1.2.1
    // If there are multiple candidates for a particular component for a
    // particular data stream that have the same type, the local preference
    // MUST be unique for each one.
    //
    // Candidates arrive one by one, so instead of numbering them up front we
    // assign the following intervals for the different types of candidates:
    //
    // 0     - 16384 => relay
    // 16384 - 32768 => srflx
    // 32768 - 49152 => prflx
    // 49152 - 65536 => host
    //
    // And furthermore we subdivide these to interleave IPv6 with IPv4
    // so that odd numbers are ipv6 and even are ipv4.
    let counter_start: u32 = {
        use CandidateKind::*;
        let x = match c.kind() {
            Host => 65_535,
            PeerReflexive => 49_151,
            ServerReflexive => 32_767,
            Relayed => 16_383,
        };
        x - if ip.is_ipv6() { 0 } else { 1 }
    };

    // Relayed candidates that translate between IP versions rank below those that don't.
    let relay_across_ip_version_punishment =
        if c.kind() == CandidateKind::Relayed && c.base().is_ipv4() != ip.is_ipv4() {
            1000
        } else {
            0
        };

    counter_start
        .saturating_sub(same_kind as u32 * 2)
        .saturating_sub(relay_across_ip_version_punishment)
}
