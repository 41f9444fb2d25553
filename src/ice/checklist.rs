use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::pair::{CandidatePair, CheckState, PairId};
use super::Candidate;
use crate::util::Pii;

/// State of a check list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckListState {
    /// Checks are still in progress.
    Running,
    /// Every component has a nominated pair.
    Completed,
    /// Some component has no pair left that can succeed.
    Failed,
}

/// A check picked by the pacer.
#[derive(Debug, Clone)]
pub struct CheckRequest {
    pub pair: PairId,
    pub local: Arc<Candidate>,
    pub remote: Arc<Candidate>,
    pub use_candidate: bool,
    pub cancel: CancellationToken,
}

/// Result of recording a successful check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckSuccess {
    /// Local foundation to unfreeze in every check list.
    pub foundation: u32,
    pub component: u16,
    /// The success nominated the pair.
    pub nominated: bool,
}

/// Ordered candidate pairs of one media stream.
///
/// All pair state lives here and is only changed through `&mut self`. The
/// stream wraps the list in a lock.
#[derive(Debug)]
pub struct CheckList {
    pairs: Vec<CandidatePair>,
    triggered: VecDeque<PairId>,
    valid: Vec<PairId>,
    components: Vec<u16>,
    state: CheckListState,
    controlling: bool,
    max_pairs: usize,
    /// Formed from the candidates, possibly without any pair.
    built: bool,
}

impl CheckList {
    /// An empty check list.
    pub fn new(controlling: bool, max_pairs: usize) -> Self {
        CheckList {
            pairs: vec![],
            triggered: VecDeque::new(),
            valid: vec![],
            components: vec![],
            state: CheckListState::Running,
            controlling,
            max_pairs,
            built: false,
        }
    }

    /// Pair, prune, order and unfreeze.
    ///
    /// RFC 8445, Section 6.1.2. Pairs are formed for local and remote candidates
    /// of the same component, IP version and a compatible transport. Of pairs with
    /// the same remote candidate and local candidates sharing a base, only the
    /// highest priority one is kept. The result is sorted by descending priority,
    /// truncated to `max_pairs` and the first pair of each local foundation is
    /// set Waiting.
    pub fn build(
        local: &[Arc<Candidate>],
        remote: &[Arc<Candidate>],
        controlling: bool,
        max_pairs: usize,
    ) -> Self {
        let mut list = CheckList::new(controlling, max_pairs);
        list.built = true;

        for l in local {
            for r in remote {
                list.form_pair(l, r);
            }
        }

        list.sort();

        if list.pairs.len() > list.max_pairs {
            debug!(
                "Truncate check list from {} to {} pairs",
                list.pairs.len(),
                list.max_pairs
            );
            list.pairs.truncate(list.max_pairs);
        }

        // The initial states for each pair in a checklist are computed by
        // performing the following sequence of steps:
        //
        // For each foundation, the agent sets the state of exactly one
        // candidate pair to the Waiting state (unfreezing it). The
        // candidate pair to unfreeze is the first in the list.
        let mut seen = HashSet::new();
        for p in &mut list.pairs {
            if seen.insert(p.foundation()) {
                p.set_state(CheckState::Waiting);
            }
        }

        let mut components: Vec<u16> = local.iter().map(|c| c.component_id()).collect();
        components.sort();
        components.dedup();
        list.components = components;

        debug!("Built check list with {} pairs", list.pairs.len());

        list
    }

    fn compatible(local: &Candidate, remote: &Candidate) -> bool {
        local.component_id() == remote.component_id()
            && local.addr().is_ipv4() == remote.addr().is_ipv4()
            && local.transport_kind().pairs_with(remote.transport_kind())
    }

    /// Form a pair unless redundant. Returns the index of the pair covering local/remote.
    fn form_pair(&mut self, local: &Arc<Candidate>, remote: &Arc<Candidate>) -> Option<usize> {
        if !Self::compatible(local, remote) {
            trace!("No pair for incompatible {:?} {:?}", local, remote);
            return None;
        }

        let pair = CandidatePair::new(local.clone(), remote.clone(), self.controlling);

        // The agent prunes each checklist.  This is done by removing a
        // candidate pair if it is redundant with a higher-priority candidate
        // pair in the same checklist.  Two candidate pairs are redundant if
        // their local candidates have the same base and their remote
        // candidates are identical.
        let redundant = self
            .pairs
            .iter()
            .position(|p| p.remote() == remote && p.local().base() == local.base());

        if let Some(idx) = redundant {
            let other = &self.pairs[idx];
            if pair.prio() > other.prio() {
                debug!("Replace redundant pair, current: {:?} replaced with: {:?}", other, pair);
                self.pairs[idx] = pair;
            } else {
                debug!("Reject redundant pair, current: {:?} rejected: {:?}", other, pair);
            }
            return Some(idx);
        }

        self.pairs.push(pair);

        Some(self.pairs.len() - 1)
    }

    fn sort(&mut self) {
        // Stable, ties keep the order they were formed in.
        self.pairs.sort_by(|a, b| b.prio().cmp(&a.prio()));
    }

    fn index_of(&self, id: PairId) -> Option<usize> {
        self.pairs.iter().position(|p| p.id() == id)
    }

    /// Components that must each get a nominated pair.
    pub fn set_components(&mut self, components: &[u16]) {
        for c in components {
            if !self.components.contains(c) {
                self.components.push(*c);
            }
        }
        self.components.sort();
    }

    pub fn components(&self) -> &[u16] {
        &self.components
    }

    pub fn pairs(&self) -> &[CandidatePair] {
        &self.pairs
    }

    pub fn pair(&self, id: PairId) -> Option<&CandidatePair> {
        self.pairs.iter().find(|p| p.id() == id)
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Whether the list was built. Late candidates are only paired into a
    /// built list, empty or not.
    pub fn is_built(&self) -> bool {
        self.built
    }

    pub fn state(&self) -> CheckListState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == CheckListState::Running
    }

    /// Pairs that had a successful check, in the order they succeeded.
    pub fn valid(&self) -> &[PairId] {
        &self.valid
    }

    pub fn triggered(&self) -> impl Iterator<Item = &PairId> + '_ {
        self.triggered.iter()
    }

    /// Pick the next pair to check and mark it in progress.
    ///
    /// Triggered checks go first, then the highest priority Waiting pair, and
    /// last the highest priority Frozen pair is unfrozen.
    pub fn next_check(&mut self, parent: &CancellationToken) -> Option<CheckRequest> {
        if !self.is_running() {
            return None;
        }

        let idx = self.next_index()?;
        let cancel = parent.child_token();

        let pair = &mut self.pairs[idx];
        pair.start_check(cancel.clone());

        Some(CheckRequest {
            pair: pair.id(),
            local: pair.local().clone(),
            remote: pair.remote().clone(),
            use_candidate: pair.use_candidate(),
            cancel,
        })
    }

    fn next_index(&mut self) -> Option<usize> {
        while let Some(id) = self.triggered.pop_front() {
            let Some(idx) = self.index_of(id) else {
                continue;
            };
            let p = &self.pairs[idx];
            match p.state() {
                // A pair is never checked twice at the same time.
                CheckState::InProgress => {
                    trace!("Skip triggered check, pair {} in progress", id);
                    continue;
                }
                CheckState::Succeeded if !p.use_candidate() => continue,
                _ => return Some(idx),
            }
        }

        if let Some(idx) = self
            .pairs
            .iter()
            .position(|p| p.state() == CheckState::Waiting)
        {
            return Some(idx);
        }

        let idx = self
            .pairs
            .iter()
            .position(|p| p.state() == CheckState::Frozen)?;
        trace!("Unfreeze pair {} for lack of waiting", self.pairs[idx].id());

        Some(idx)
    }

    /// Queue a triggered check for the pair.
    pub fn trigger(&mut self, id: PairId) {
        let Some(idx) = self.index_of(id) else {
            return;
        };
        let p = &mut self.pairs[idx];
        if matches!(p.state(), CheckState::Frozen | CheckState::Failed) {
            p.set_state(CheckState::Waiting);
        }
        if !self.triggered.contains(&id) {
            trace!("Triggered check for pair {}", id);
            self.triggered.push_back(id);
        }
    }

    /// Move Frozen pairs with the local foundation to Waiting.
    ///
    /// Idempotent, returns the number of pairs unfrozen.
    pub fn unfreeze(&mut self, foundation: u32) -> usize {
        let mut n = 0;
        for p in &mut self.pairs {
            if p.state() == CheckState::Frozen && p.foundation() == foundation {
                p.set_state(CheckState::Waiting);
                n += 1;
            }
        }
        if n > 0 {
            trace!("Unfroze {} pairs with foundation {}", n, foundation);
        }
        n
    }

    /// Record a valid response for the pair.
    pub fn record_success(&mut self, id: PairId, valid_local: Arc<Candidate>) -> Option<CheckSuccess> {
        let idx = self.index_of(id)?;

        let pair = &mut self.pairs[idx];
        let wants_nomination = pair.use_candidate() || pair.nominate_on_success();
        pair.record_success(valid_local);
        pair.set_use_candidate(false);
        pair.set_nominate_on_success(false);

        let foundation = pair.foundation();
        let component = pair.component_id();

        if !self.valid.contains(&id) {
            self.valid.push(id);
        }

        let nominated = wants_nomination && self.nominate(idx);

        Some(CheckSuccess {
            foundation,
            component,
            nominated,
        })
    }

    /// Record a failed check (timeout, error response or cancellation).
    pub fn record_failure(&mut self, id: PairId) {
        let Some(idx) = self.index_of(id) else {
            return;
        };
        self.pairs[idx].record_failure();
        self.valid.retain(|v| *v != id);
    }

    /// Retry a pair whose check hit a role conflict.
    pub fn retry(&mut self, id: PairId) {
        if let Some(idx) = self.index_of(id) {
            self.pairs[idx].set_state(CheckState::Waiting);
            self.trigger(id);
        }
    }

    /// Nominate a pair, keeping a single nominated pair per component.
    fn nominate(&mut self, idx: usize) -> bool {
        let component = self.pairs[idx].component_id();
        let prio = self.pairs[idx].prio();

        let current = self
            .pairs
            .iter()
            .position(|p| p.is_nominated() && p.component_id() == component);

        if let Some(cur) = current {
            if cur == idx {
                return true;
            }
            if self.pairs[cur].prio() >= prio {
                debug!("Keep nominated pair {:?}", self.pairs[cur]);
                return false;
            }
            self.pairs[cur].set_nominated(false);
        }

        let pair = &mut self.pairs[idx];
        pair.set_nominated(true);
        info!(
            "Nominated pair {} {} -> {}",
            pair.id(),
            Pii(pair.valid_local().addr()),
            Pii(pair.remote().addr())
        );

        true
    }

    /// The peer sent USE-CANDIDATE for the pair (controlled side).
    ///
    /// Nominates straight away if our own check already succeeded, otherwise
    /// nominates when it does.
    pub fn remote_nomination(&mut self, id: PairId) -> bool {
        let Some(idx) = self.index_of(id) else {
            return false;
        };
        if self.pairs[idx].state() == CheckState::Succeeded {
            return self.nominate(idx);
        }
        self.pairs[idx].set_nominate_on_success(true);
        false
    }

    /// Pairs the controlling agent should nominate now.
    ///
    /// For each component without nomination: the highest priority succeeded pair,
    /// provided no higher priority pair of that component can still succeed.
    pub fn nomination_candidates(&self) -> Vec<PairId> {
        let mut out = vec![];

        for component in &self.components {
            let busy = self
                .component_pairs(*component)
                .any(|p| p.is_nominated() || p.use_candidate());
            if busy {
                continue;
            }

            // pairs are sorted by priority
            let Some(best) = self
                .component_pairs(*component)
                .find(|p| p.state() == CheckState::Succeeded)
            else {
                continue;
            };

            let better_pending = self.component_pairs(*component).any(|p| {
                p.prio() > best.prio()
                    && matches!(
                        p.state(),
                        CheckState::Frozen | CheckState::Waiting | CheckState::InProgress
                    )
            });

            if !better_pending {
                out.push(best.id());
            }
        }

        out
    }

    fn component_pairs(&self, component: u16) -> impl Iterator<Item = &CandidatePair> + '_ {
        self.pairs
            .iter()
            .filter(move |p| p.component_id() == component)
    }

    /// Re-check a succeeded pair with USE-CANDIDATE.
    pub fn request_nomination(&mut self, id: PairId) {
        if let Some(idx) = self.index_of(id) {
            debug!("Nomination check for {:?}", self.pairs[idx]);
            self.pairs[idx].set_use_candidate(true);
            self.trigger(id);
        }
    }

    /// Update the list state, returning the new state on change.
    pub fn evaluate(&mut self) -> Option<CheckListState> {
        if !self.is_running() || self.components.is_empty() {
            return None;
        }

        let complete = self
            .components
            .iter()
            .all(|c| self.component_pairs(*c).any(|p| p.is_nominated()));

        let failed = self.components.iter().any(|c| {
            let mut pairs = self.component_pairs(*c).peekable();
            pairs.peek().is_some() && pairs.all(|p| !p.can_succeed())
        });

        let next = if complete {
            CheckListState::Completed
        } else if failed {
            CheckListState::Failed
        } else {
            return None;
        };

        debug!("Check list {:?} -> {:?}", self.state, next);
        self.state = next;

        // Remaining checks are of no use.
        for p in &mut self.pairs {
            p.cancel();
        }
        self.triggered.clear();

        Some(next)
    }

    /// Flip the role, recomputing all pair priorities.
    pub fn set_controlling(&mut self, controlling: bool) {
        if self.controlling == controlling {
            return;
        }
        self.controlling = controlling;
        for p in &mut self.pairs {
            p.update_prio(controlling);
        }
        self.sort();
    }

    /// Highest priority pair matching a STUN message's addresses.
    pub fn find_pair(&self, local: SocketAddr, remote: SocketAddr) -> Option<PairId> {
        self.pairs
            .iter()
            .find(|p| p.matches(local, remote))
            .map(|p| p.id())
    }

    /// Add a pair for a candidate discovered by an incoming request.
    ///
    /// Returns the existing pair if one already covers local/remote.
    pub fn add_discovered_pair(
        &mut self,
        local: &Arc<Candidate>,
        remote: &Arc<Candidate>,
    ) -> Option<PairId> {
        if let Some(p) = self
            .pairs
            .iter()
            .find(|p| p.remote() == remote && p.local().base() == local.base())
        {
            return Some(p.id());
        }

        let idx = self.form_pair(local, remote)?;
        let pair = &mut self.pairs[idx];
        pair.set_state(CheckState::Waiting);
        let id = pair.id();

        debug!("Created new pair for STUN request: {:?}", pair);

        self.sort();

        Some(id)
    }

    /// The nominated pair of each component.
    pub fn nominated(&self) -> impl Iterator<Item = &CandidatePair> + '_ {
        self.pairs.iter().filter(|p| p.is_nominated())
    }

    /// Cancel all in-flight checks.
    pub fn cancel_all(&mut self) {
        for p in &mut self.pairs {
            p.cancel();
        }
        self.triggered.clear();
    }
}
