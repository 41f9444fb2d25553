use std::net::SocketAddr;

use crate::io::TransportFamily;

use super::{Candidate, CandidateKind};

/// What two candidates must share to have the same foundation.
///
/// RFC 8445, Section 5.1.1.3: same type, same base, same transport and
/// the same STUN/TURN server. The candidate address never participates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FoundationKey {
    kind: CandidateKind,
    family: TransportFamily,
    base: SocketAddr,
    server: Option<SocketAddr>,
}

impl FoundationKey {
    fn of(c: &Candidate) -> Self {
        FoundationKey {
            kind: c.kind(),
            family: c.family(),
            base: c.base(),
            server: c.server(),
        }
    }
}

/// Hands out foundations for local candidates.
///
/// The first candidate of a distinct key gets the next unused integer, later
/// candidates with the same key get the same one. Numbers are only comparable
/// within one registry.
#[derive(Debug, Default)]
pub struct FoundationRegistry {
    seen: Vec<(FoundationKey, u32)>,
}

impl FoundationRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The foundation for the candidate, assigning a new one if unseen.
    pub fn foundation(&mut self, c: &Candidate) -> u32 {
        let key = FoundationKey::of(c);

        if let Some((_, f)) = self.seen.iter().find(|(k, _)| *k == key) {
            return *f;
        }

        let next = self.seen.iter().map(|(_, f)| *f).max().unwrap_or(0) + 1;
        self.seen.push((key, next));
        trace!("New foundation {} for {:?}", next, key);

        next
    }

    /// Number of distinct foundations handed out.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Whether no foundation was handed out yet.
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Foundation of `c` given candidates that already have theirs.
///
/// Reuses the foundation of the first known candidate sharing the key,
/// otherwise returns one above the largest known.
pub fn compute_foundation(c: &Candidate, known: &[Candidate]) -> u32 {
    let key = FoundationKey::of(c);

    known
        .iter()
        .find(|k| FoundationKey::of(k) == key)
        .map(|k| k.foundation())
        .unwrap_or_else(|| known.iter().map(|k| k.foundation()).max().unwrap_or(0) + 1)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::io::TcpType;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn same_base_same_foundation() {
        let mut reg = FoundationRegistry::new();

        let h1 = Candidate::host(addr("10.0.0.1:1000"), "udp").unwrap();
        let h2 = Candidate::host(addr("10.0.0.1:1000"), "udp").unwrap();
        assert_eq!(reg.foundation(&h1), reg.foundation(&h2));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn address_does_not_participate() {
        let mut reg = FoundationRegistry::new();

        let base = addr("10.0.0.1:1000");
        let s1 = Candidate::server_reflexive(addr("1.1.1.1:1"), base, "udp").unwrap();
        let s2 = Candidate::server_reflexive(addr("2.2.2.2:2"), base, "udp").unwrap();
        assert_eq!(reg.foundation(&s1), reg.foundation(&s2));
    }

    #[test]
    fn kind_base_server_and_family_separate() {
        let mut reg = FoundationRegistry::new();

        let base = addr("10.0.0.1:1000");
        let host = Candidate::host(base, "udp").unwrap();
        let srflx = Candidate::server_reflexive(base, base, "udp").unwrap();
        let other_base = Candidate::host(addr("10.0.0.2:1000"), "udp").unwrap();
        let tcp = Candidate::host(base, "tcp")
            .unwrap()
            .with_tcptype(TcpType::Active);
        let via_a = Candidate::server_reflexive(addr("1.1.1.1:1"), base, "udp")
            .unwrap()
            .with_server(addr("3.3.3.3:3478"));
        let via_b = Candidate::server_reflexive(addr("1.1.1.1:1"), base, "udp")
            .unwrap()
            .with_server(addr("4.4.4.4:3478"));

        let all = [
            reg.foundation(&host),
            reg.foundation(&srflx),
            reg.foundation(&other_base),
            reg.foundation(&tcp),
            reg.foundation(&via_a),
            reg.foundation(&via_b),
        ];
        assert_eq!(all, [1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn tcp_roles_share_a_foundation() {
        let mut reg = FoundationRegistry::new();

        let base = addr("10.0.0.1:1000");
        let active = Candidate::host(base, "tcp")
            .unwrap()
            .with_tcptype(TcpType::Active);
        let passive = Candidate::host(base, "tcp")
            .unwrap()
            .with_tcptype(TcpType::Passive);
        assert_eq!(reg.foundation(&active), reg.foundation(&passive));
    }

    #[test]
    fn compute_against_known() {
        let h1 = Candidate::host(addr("10.0.0.1:1000"), "udp")
            .unwrap()
            .adopt(4, 65534, 1);
        let h2 = Candidate::host(addr("10.0.0.2:1000"), "udp")
            .unwrap()
            .adopt(9, 65532, 1);
        let known = [h1, h2];

        let same = Candidate::host(addr("10.0.0.2:1000"), "udp").unwrap();
        let fresh = Candidate::host(addr("10.0.0.3:1000"), "udp").unwrap();
        assert_eq!(compute_foundation(&same, &known), 9);
        assert_eq!(compute_foundation(&fresh, &known), 10);
        assert_eq!(compute_foundation(&fresh, &[]), 1);
    }
}
