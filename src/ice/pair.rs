use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::preference::pair_priority;
use super::Candidate;

/// Identifies a pair across check lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PairId(u64);

impl PairId {
    fn next() -> Self {
        static ID: AtomicU64 = AtomicU64::new(1);
        PairId(ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for PairId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A pair of candidates, local and remote, in a check list.
pub struct CandidatePair {
    id: PairId,

    local: Arc<Candidate>,
    remote: Arc<Candidate>,

    /// Local candidate of the valid pair created by a successful check. Differs from
    /// `local` when the mapped address revealed a peer reflexive candidate.
    valid_local: Option<Arc<Candidate>>,

    /// Calculated from local/remote priority and the role.
    prio: u64,

    state: CheckState,

    /// Set once the pair is nominated. Completes the component.
    nominated: bool,

    /// Next check carries USE-CANDIDATE (controlling side).
    use_candidate: bool,

    /// The peer nominated this pair before our own check succeeded (controlled side).
    nominate_on_success: bool,

    /// Number of checks dispatched for this pair.
    attempts: usize,

    /// Cancels the in-flight check, if any.
    cancel: Option<CancellationToken>,
}

/// State of a candidate pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckState {
    /// A check for this pair has not been sent, and it cannot be sent
    /// until the pair is unfrozen and moved into the Waiting state.
    #[default]
    Frozen,

    /// A check has not been sent for this pair.
    Waiting,

    /// A check has been sent for this pair, but the
    /// transaction is in progress.
    InProgress,

    /// A check has been sent for this pair, and it produced a
    /// successful result.
    Succeeded,

    /// A check has been sent for this pair, and it failed (a
    /// response to the check was never received, or a failure response
    /// was received).
    Failed,
}

impl CandidatePair {
    pub fn new(local: Arc<Candidate>, remote: Arc<Candidate>, controlling: bool) -> Self {
        let prio = pair_priority(local.prio(), remote.prio(), controlling);
        CandidatePair {
            id: PairId::next(),
            local,
            remote,
            valid_local: None,
            prio,
            state: CheckState::Frozen,
            nominated: false,
            use_candidate: false,
            nominate_on_success: false,
            attempts: 0,
            cancel: None,
        }
    }

    pub fn id(&self) -> PairId {
        self.id
    }

    pub fn local(&self) -> &Arc<Candidate> {
        &self.local
    }

    pub fn remote(&self) -> &Arc<Candidate> {
        &self.remote
    }

    /// The local side of the valid pair, falling back on the pair's own local.
    pub fn valid_local(&self) -> &Arc<Candidate> {
        self.valid_local.as_ref().unwrap_or(&self.local)
    }

    pub fn component_id(&self) -> u16 {
        self.local.component_id()
    }

    /// Foundation of the local candidate, used when unfreezing.
    pub fn foundation(&self) -> u32 {
        self.local.foundation()
    }

    pub fn prio(&self) -> u64 {
        self.prio
    }

    /// Recalculate the priority after a role change.
    pub fn update_prio(&mut self, controlling: bool) {
        self.prio = pair_priority(self.local.prio(), self.remote.prio(), controlling);
    }

    pub fn state(&self) -> CheckState {
        self.state
    }

    pub fn set_state(&mut self, state: CheckState) {
        if self.state != state {
            trace!("Pair {} state {:?} -> {:?}", self.id, self.state, state);
            self.state = state;
        }
    }

    pub fn is_nominated(&self) -> bool {
        self.nominated
    }

    pub fn set_nominated(&mut self, nominated: bool) {
        self.nominated = nominated;
    }

    pub fn use_candidate(&self) -> bool {
        self.use_candidate
    }

    pub fn set_use_candidate(&mut self, v: bool) {
        self.use_candidate = v;
    }

    pub fn nominate_on_success(&self) -> bool {
        self.nominate_on_success
    }

    pub fn set_nominate_on_success(&mut self, v: bool) {
        self.nominate_on_success = v;
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Mark the pair in progress with a new cancellation token for the check.
    pub fn start_check(&mut self, cancel: CancellationToken) {
        self.set_state(CheckState::InProgress);
        self.attempts += 1;
        self.cancel = Some(cancel);
    }

    pub fn record_success(&mut self, valid_local: Arc<Candidate>) {
        self.set_state(CheckState::Succeeded);
        self.valid_local = Some(valid_local);
        self.cancel = None;
    }

    pub fn record_failure(&mut self) {
        self.set_state(CheckState::Failed);
        self.use_candidate = false;
        self.cancel = None;
    }

    /// Cancel the in-flight check, if any.
    pub fn cancel(&mut self) {
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
    }

    /// Whether a check of this pair can still end up Succeeded.
    pub fn can_succeed(&self) -> bool {
        !matches!(self.state, CheckState::Failed)
    }

    /// Whether the pair is matched by the addresses of a STUN message.
    pub fn matches(&self, local: SocketAddr, remote: SocketAddr) -> bool {
        (self.local.addr() == local || self.local.base() == local) && self.remote.addr() == remote
    }
}

impl fmt::Debug for CandidatePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CandidatePair")
            .field("id", &self.id)
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("prio", &self.prio)
            .field("state", &self.state)
            .field("nominated", &self.nominated)
            .finish()
    }
}
