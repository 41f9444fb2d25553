use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::checklist::{CheckList, CheckListState, CheckRequest};
use super::{Candidate, CandidateKind};
use crate::io::Protocol;

/// Identifies a media stream within an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub(crate) usize);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One media stream: its candidates and check list.
///
/// Candidates are only ever appended. The check list is behind its own
/// lock, which is where all pair state changes happen.
pub(crate) struct MediaStream {
    id: StreamId,
    name: String,
    components: Vec<u16>,
    local: Mutex<Vec<Arc<Candidate>>>,
    remote: Mutex<Vec<Arc<Candidate>>>,
    check_list: Mutex<CheckList>,
    cancel: CancellationToken,
}

impl MediaStream {
    pub fn new(
        id: StreamId,
        name: &str,
        components: &[u16],
        controlling: bool,
        max_pairs: usize,
        cancel: CancellationToken,
    ) -> Self {
        let mut check_list = CheckList::new(controlling, max_pairs);
        check_list.set_components(components);

        let mut components = components.to_vec();
        components.sort();
        components.dedup();

        MediaStream {
            id,
            name: name.to_string(),
            components,
            local: Mutex::new(vec![]),
            remote: Mutex::new(vec![]),
            check_list: Mutex::new(check_list),
            cancel,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_component(&self, component: u16) -> bool {
        self.components.contains(&component)
    }

    pub fn local_candidates(&self) -> Vec<Arc<Candidate>> {
        self.local.lock().clone()
    }

    pub fn remote_candidates(&self) -> Vec<Arc<Candidate>> {
        self.remote.lock().clone()
    }

    /// Number of local candidates of the same kind and IP version.
    pub fn same_kind(&self, c: &Candidate) -> usize {
        self.local
            .lock()
            .iter()
            .filter(|v| v.kind() == c.kind() && v.addr().is_ipv4() == c.addr().is_ipv4())
            .count()
    }

    /// Whether an equivalent local candidate is already known.
    ///
    /// A candidate is redundant if its address and base match one with the
    /// same protocol and component.
    pub fn is_redundant_local(&self, c: &Candidate) -> bool {
        self.local.lock().iter().any(|v| {
            v.addr() == c.addr()
                && v.base() == c.base()
                && v.proto() == c.proto()
                && v.tcptype() == c.tcptype()
                && v.component_id() == c.component_id()
        })
    }

    /// Add an adopted local candidate.
    ///
    /// If the check list is already built, the candidate is paired with the
    /// known remote candidates.
    pub fn add_local(&self, c: Arc<Candidate>) {
        self.local.lock().push(c.clone());

        let remote = self.remote_candidates();
        let mut list = self.check_list.lock();
        if list.is_built() {
            for r in &remote {
                list.add_discovered_pair(&c, r);
            }
        }
    }

    /// Keep a local candidate discovered by a check.
    ///
    /// Peer reflexive local candidates are never paired, they only show up
    /// as the local side of valid pairs.
    pub fn add_discovered_local(&self, c: Arc<Candidate>) {
        self.local.lock().push(c);
    }

    /// Add a remote candidate. Returns false if it is already known.
    pub fn add_remote(&self, c: Arc<Candidate>) -> bool {
        {
            let mut remote = self.remote.lock();
            let known = remote.iter().any(|v| {
                v.addr() == c.addr()
                    && v.proto() == c.proto()
                    && v.component_id() == c.component_id()
            });
            if known {
                return false;
            }
            remote.push(c.clone());
        }

        let local = self.local_candidates();
        let mut list = self.check_list.lock();
        if list.is_built() {
            for l in &local {
                list.add_discovered_pair(l, &c);
            }
        }

        true
    }

    /// Replace the check list with one built from the current candidates.
    pub fn build_check_list(&self, controlling: bool, max_pairs: usize) -> usize {
        let local = self.local_candidates();
        let remote = self.remote_candidates();

        let mut list = CheckList::build(&local, &remote, controlling, max_pairs);
        list.set_components(&self.components);

        let mut current = self.check_list.lock();
        current.cancel_all();
        *current = list;

        info!(
            "Stream {} ({}) check list with {} pairs",
            self.id,
            self.name,
            current.len()
        );

        current.len()
    }

    /// Run `f` with the check list locked.
    pub fn with_check_list<R>(&self, f: impl FnOnce(&mut CheckList) -> R) -> R {
        let mut list = self.check_list.lock();
        f(&mut list)
    }

    pub fn state(&self) -> CheckListState {
        self.check_list.lock().state()
    }

    pub fn is_running(&self) -> bool {
        self.check_list.lock().is_running()
    }

    /// Next check, canceled together with the stream.
    pub fn next_check(&self) -> Option<CheckRequest> {
        if self.cancel.is_cancelled() {
            return None;
        }
        self.check_list.lock().next_check(&self.cancel)
    }

    /// The local candidate that a mapped address of a response corresponds to.
    pub fn local_for_mapped(&self, mapped: SocketAddr, sent_from: &Candidate) -> Option<Arc<Candidate>> {
        self.local
            .lock()
            .iter()
            .find(|c| {
                c.addr() == mapped
                    && c.proto() == sent_from.proto()
                    && c.component_id() == sent_from.component_id()
            })
            .cloned()
    }

    /// The local candidate receiving traffic on `destination`.
    ///
    /// This is a host or a relayed candidate. Traffic never arrives on a
    /// reflexive candidate directly.
    pub fn local_for_destination(
        &self,
        destination: SocketAddr,
        proto: Protocol,
    ) -> Option<Arc<Candidate>> {
        self.local
            .lock()
            .iter()
            .find(|c| {
                matches!(c.kind(), CandidateKind::Host | CandidateKind::Relayed)
                    && (c.addr() == destination || c.base() == destination)
                    && c.proto() == proto
            })
            .cloned()
    }

    /// The remote candidate sending from `source`.
    pub fn remote_for_source(
        &self,
        source: SocketAddr,
        proto: Protocol,
        component: u16,
    ) -> Option<Arc<Candidate>> {
        self.remote
            .lock()
            .iter()
            .find(|c| c.addr() == source && c.proto() == proto && c.component_id() == component)
            .cloned()
    }

    /// Cancel all checks and stop handing out new ones.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.check_list.lock().cancel_all();
    }
}

impl fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("components", &self.components)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ice::CheckState;

    fn stream() -> MediaStream {
        MediaStream::new(StreamId(0), "audio", &[1], true, 100, CancellationToken::new())
    }

    fn host(s: &str) -> Arc<Candidate> {
        Arc::new(Candidate::host(s.parse().unwrap(), "udp").unwrap())
    }

    #[test]
    fn remote_dedup() {
        let s = stream();
        assert!(s.add_remote(host("2.2.2.2:1000")));
        assert!(!s.add_remote(host("2.2.2.2:1000")));
        assert_eq!(s.remote_candidates().len(), 1);
    }

    #[test]
    fn late_candidates_are_paired() {
        let s = stream();
        s.add_local(host("1.1.1.1:1000"));
        s.add_remote(host("2.2.2.2:1000"));
        assert_eq!(s.build_check_list(true, 100), 1);

        s.add_remote(host("3.3.3.3:1000"));
        let states: Vec<_> = s.with_check_list(|l| l.pairs().iter().map(|p| p.state()).collect());
        assert_eq!(states.len(), 2);
        assert!(states.iter().all(|s| *s == CheckState::Waiting));
    }

    #[test]
    fn late_remote_joins_empty_check_list() {
        let s = stream();
        s.add_local(host("1.1.1.1:1000"));
        assert_eq!(s.build_check_list(true, 100), 0);

        assert!(s.add_remote(host("2.2.2.2:1000")));
        let states: Vec<_> = s.with_check_list(|l| l.pairs().iter().map(|p| p.state()).collect());
        assert_eq!(states, vec![CheckState::Waiting]);
        assert!(s.next_check().is_some());
    }

    #[test]
    fn late_local_joins_empty_check_list() {
        let s = stream();
        s.add_remote(host("2.2.2.2:1000"));
        assert_eq!(s.build_check_list(true, 100), 0);

        s.add_local(host("1.1.1.1:1000"));
        assert_eq!(s.with_check_list(|l| l.len()), 1);
    }

    #[test]
    fn candidates_before_build_are_not_paired() {
        let s = stream();
        s.add_local(host("1.1.1.1:1000"));
        s.add_remote(host("2.2.2.2:1000"));
        assert!(s.with_check_list(|l| l.is_empty()));
    }

    #[test]
    fn destination_lookup_uses_host_and_relay() {
        let s = stream();
        s.add_local(host("1.1.1.1:1000"));
        let srflx = Candidate::server_reflexive(
            "5.5.5.5:1000".parse().unwrap(),
            "1.1.1.1:1000".parse().unwrap(),
            "udp",
        )
        .unwrap();
        s.add_local(Arc::new(srflx));

        let found = s
            .local_for_destination("1.1.1.1:1000".parse().unwrap(), Protocol::Udp)
            .unwrap();
        assert_eq!(found.kind(), CandidateKind::Host);
        assert!(s
            .local_for_destination("5.5.5.5:1000".parse().unwrap(), Protocol::Udp)
            .is_none());
    }

    #[test]
    fn cancel_stops_checks() {
        let s = stream();
        s.add_local(host("1.1.1.1:1000"));
        s.add_remote(host("2.2.2.2:1000"));
        s.build_check_list(true, 100);

        let req = s.next_check().unwrap();
        s.cancel();
        assert!(req.cancel.is_cancelled());
        assert!(s.next_check().is_none());
    }
}
