use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::checker::{CheckOutcome, ConnectivityChecker};
use super::checklist::{CheckListState, CheckRequest};
use super::foundation::FoundationRegistry;
use super::preference::compute_priority;
use super::stream::{MediaStream, StreamId};
use super::transaction::TransactionTracker;
use super::{Candidate, CandidateKind, CheckError, CheckState, Gatherer, IceError};
use super::{Session, SessionProvider, TransportKind};
use crate::config::IceConfig;
use crate::io::{stun_resend_delay, Id, NetError, Protocol, StunMessage, TcpType, TransId};
use crate::io::ROLE_CONFLICT;
use crate::util::Pii;

/// Foundations of remote peer reflexive candidates count up from here, well
/// clear of what peers number their own candidates with.
const REMOTE_PEER_REFLEXIVE_FOUNDATION: u32 = 0x8000_0000;

/// States the ICE connection can be in.
///
/// More details on connection states can be found in the [ICE RFC][1].
///
/// [1]: https://www.rfc-editor.org/rfc/rfc8445
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    /// Candidates are being gathered and exchanged.
    New,

    /// The agent is checking pairs of local and remote candidates against one
    /// another, but has not yet nominated any pair.
    Checking,

    /// At least one component has a nominated pair.
    Connected,

    /// Every component of every stream has a nominated pair. Checks have
    /// stopped.
    Completed,

    /// Some stream has a component without any pair that can succeed.
    Failed,
}

impl IceConnectionState {
    /// Tells if this state is a connected state.
    pub fn is_connected(&self) -> bool {
        use IceConnectionState::*;
        matches!(self, Connected | Completed)
    }

    /// Whether the agent is done, one way or the other.
    pub fn is_terminal(&self) -> bool {
        use IceConnectionState::*;
        matches!(self, Completed | Failed)
    }
}

/// Credentials for STUN packages.
///
/// By matching IceCreds in STUN to the exchanged credentials, we know which
/// STUN belongs to which peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IceCreds {
    /// Username fragment.
    pub ufrag: String,
    /// Password.
    pub pass: String,
}

impl IceCreds {
    /// Creates a new instance of `IceCreds` with random values for the username fragment and password.
    pub fn new() -> Self {
        // Username Fragment and Password:  Values used to perform connectivity
        // checks.  The values MUST be unguessable, with at least 128 bits of
        // random number generator output used to generate the password, and
        // at least 24 bits of output to generate the username fragment.
        let ufrag = Id::<4>::random().to_string();
        let pass = Id::<22>::random().to_string();
        IceCreds { ufrag, pass }
    }
}

impl Default for IceCreds {
    fn default() -> Self {
        IceCreds::new()
    }
}

/// Counters of STUN traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IceAgentStats {
    pub bind_request_sent: u64,
    pub bind_success_recv: u64,
    pub bind_failure_recv: u64,
    pub bind_request_recv: u64,
    pub discovered_recv_count: u64,
    pub nomination_send_count: u64,
    pub role_conflict_count: u64,
}

/// A nominated pair handed over to the application.
#[derive(Clone)]
pub struct SelectedPair {
    /// Stream the pair belongs to.
    pub stream: StreamId,
    /// Component within the stream.
    pub component: u16,
    /// Local side of the valid pair. Might be a peer reflexive candidate.
    pub local: Arc<Candidate>,
    /// Remote side.
    pub remote: Arc<Candidate>,
    /// The session the checks ran over. Use it for the media.
    pub session: Arc<dyn Session>,
}

impl fmt::Debug for SelectedPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectedPair")
            .field("stream", &self.stream)
            .field("component", &self.component)
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("session_local", &Pii(self.session.local_addr()))
            .field("session_remote", &Pii(self.session.remote_addr()))
            .finish()
    }
}

/// Events from an [`IceAgent`].
#[derive(Debug, Clone)]
pub enum IceAgentEvent {
    /// Connection state changed.
    StateChange(IceConnectionState),

    /// A component got its nominated pair.
    ComponentEstablished(SelectedPair),

    /// Every component of the stream has a nominated pair.
    StreamCompleted(StreamId),

    /// A component of the stream has no pair left that can succeed.
    StreamFailed(StreamId),

    /// All streams completed. One selected pair per component of every stream.
    Completed {
        /// The nominated pairs.
        selected: Vec<SelectedPair>,
    },

    /// Some stream failed. Checks have stopped.
    Failed,
}

/// Interactive Connectivity Establishment agent.
///
/// Cheap to clone, all clones drive the same agent. Checks run as tasks on
/// the tokio runtime [`IceAgent::start_checks`] is called from.
#[derive(Clone)]
pub struct IceAgent {
    shared: Arc<Shared>,
}

struct Shared {
    config: IceConfig,

    /// Credentials for this side.
    local_credentials: IceCreds,

    /// Credentials of the peer, needed to send requests and verify responses.
    remote_credentials: Mutex<Option<IceCreds>>,

    controlling: AtomicBool,

    /// Random number used to resolve role conflicts.
    control_tie_breaker: u64,

    streams: Mutex<Vec<Arc<MediaStream>>>,

    tracker: Arc<TransactionTracker>,

    sessions: Arc<dyn SessionProvider>,

    /// Foundations of local candidates across all streams.
    foundations: Mutex<FoundationRegistry>,

    next_remote_foundation: AtomicU32,

    events: mpsc::UnboundedSender<IceAgentEvent>,

    state: Mutex<IceConnectionState>,

    stats: Mutex<IceAgentStats>,

    started: AtomicBool,

    /// Parent of every stream and check token.
    cancel: CancellationToken,
}

impl IceAgent {
    /// Create an agent. Events are delivered on the returned receiver.
    pub fn new(
        config: IceConfig,
        sessions: Arc<dyn SessionProvider>,
    ) -> (Self, mpsc::UnboundedReceiver<IceAgentEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();

        let local_credentials = config
            .local_ice_credentials()
            .cloned()
            .unwrap_or_else(IceCreds::new);

        let shared = Shared {
            controlling: AtomicBool::new(config.controlling()),
            config,
            local_credentials,
            remote_credentials: Mutex::new(None),
            control_tie_breaker: fastrand::u64(..),
            streams: Mutex::new(vec![]),
            tracker: Arc::new(TransactionTracker::new()),
            sessions,
            foundations: Mutex::new(FoundationRegistry::new()),
            next_remote_foundation: AtomicU32::new(REMOTE_PEER_REFLEXIVE_FOUNDATION),
            events: tx,
            state: Mutex::new(IceConnectionState::New),
            stats: Mutex::new(IceAgentStats::default()),
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        };

        (
            IceAgent {
                shared: Arc::new(shared),
            },
            rx,
        )
    }

    /// Local credentials, to be handed to the peer.
    pub fn local_credentials(&self) -> &IceCreds {
        &self.shared.local_credentials
    }

    /// Sets the remote ice credentials.
    pub fn set_remote_credentials(&self, r: IceCreds) {
        let mut creds = self.shared.remote_credentials.lock();
        if creds.as_ref() != Some(&r) {
            info!("Set remote credentials: {:?}", Pii(&r));
            *creds = Some(r);
        }
    }

    /// The remote credentials, if set.
    pub fn remote_credentials(&self) -> Option<IceCreds> {
        self.shared.remote_credentials.lock().clone()
    }

    /// Whether this agent is controlling.
    pub fn controlling(&self) -> bool {
        self.shared.controlling()
    }

    /// Set the role. Pair priorities are recomputed on change.
    pub fn set_controlling(&self, v: bool) {
        self.shared.switch_role(v);
    }

    /// Current connection state.
    pub fn state(&self) -> IceConnectionState {
        *self.shared.state.lock()
    }

    /// STUN traffic counters.
    pub fn stats(&self) -> IceAgentStats {
        *self.shared.stats.lock()
    }

    /// Add a media stream with the given components.
    ///
    /// Components are numbered from 1. No components means a single one.
    pub fn add_stream(&self, name: &str, components: &[u16]) -> StreamId {
        let mut components: Vec<u16> = components.iter().copied().filter(|c| *c > 0).collect();
        if components.is_empty() {
            components.push(1);
        }

        let mut streams = self.shared.streams.lock();
        let id = StreamId(streams.len());

        let stream = MediaStream::new(
            id,
            name,
            &components,
            self.controlling(),
            self.shared.config.max_candidate_pairs(),
            self.shared.cancel.child_token(),
        );
        debug!("Add stream {:?}", stream);

        streams.push(Arc::new(stream));

        id
    }

    /// Gather local candidates for a stream.
    ///
    /// Server reflexive candidates with the same address as a host candidate
    /// are redundant and dropped. The remaining ones get their foundation and
    /// priority and are stored on the stream.
    pub fn gather_candidates(
        &self,
        stream: StreamId,
        gatherer: &dyn Gatherer,
    ) -> Result<Vec<Arc<Candidate>>, IceError> {
        let s = self.shared.stream(stream)?;
        let include_tcp = self.shared.config.include_tcp();

        let mut gathered = gatherer.gather(include_tcp);
        if !include_tcp {
            gathered.retain(|c| c.proto() == Protocol::Udp);
        }

        let hosts: Vec<(SocketAddr, Protocol)> = gathered
            .iter()
            .filter(|c| c.kind() == CandidateKind::Host)
            .map(|c| (c.addr(), c.proto()))
            .collect();

        gathered.retain(|c| {
            let redundant = c.kind() == CandidateKind::ServerReflexive
                && hosts.contains(&(c.addr(), c.proto()));
            if redundant {
                debug!("Drop server reflexive candidate same as host: {}", Pii(c.addr()));
            }
            !redundant
        });

        let mut adopted = vec![];
        for c in gathered {
            match self.shared.adopt_local(&s, c) {
                Ok(Some(c)) => adopted.push(c),
                Ok(None) => {}
                Err(e) => debug!("Skip gathered candidate: {}", e),
            }
        }

        info!("Gathered {} candidates for stream {}", adopted.len(), stream);

        Ok(adopted)
    }

    /// Add a single local candidate to a stream.
    ///
    /// Returns `None` if the candidate is redundant with an existing one.
    pub fn add_local_candidate(
        &self,
        stream: StreamId,
        c: Candidate,
    ) -> Result<Option<Arc<Candidate>>, IceError> {
        let s = self.shared.stream(stream)?;
        self.shared.adopt_local(&s, c)
    }

    /// Add candidates from the peer. Returns how many were new.
    ///
    /// Candidates carrying a ufrag that doesn't match the remote credentials
    /// are ignored.
    pub fn add_remote_candidates(
        &self,
        stream: StreamId,
        candidates: Vec<Candidate>,
    ) -> Result<usize, IceError> {
        let s = self.shared.stream(stream)?;
        let remote_ufrag = self
            .shared
            .remote_credentials
            .lock()
            .as_ref()
            .map(|c| c.ufrag.clone());

        let mut added = 0;
        for c in candidates {
            if !s.has_component(c.component_id()) {
                debug!("Ignore remote candidate for unknown component: {:?}", c);
                continue;
            }
            if let (Some(ufrag), Some(expected)) = (c.ufrag(), &remote_ufrag) {
                if ufrag != expected {
                    debug!("Ignore remote candidate with ufrag {}, expected {}", ufrag, expected);
                    continue;
                }
            }
            if c.transport_kind() == TransportKind::Unsupported {
                debug!("Ignore remote candidate with unsupported transport: {:?}", c);
                continue;
            }

            debug!("Add remote candidate: {:?}", Pii(&c));
            if s.add_remote(Arc::new(c)) {
                added += 1;
            }
        }

        Ok(added)
    }

    /// Local candidates of a stream.
    pub fn local_candidates(&self, stream: StreamId) -> Result<Vec<Arc<Candidate>>, IceError> {
        Ok(self.shared.stream(stream)?.local_candidates())
    }

    /// Remote candidates of a stream, including discovered peer reflexive ones.
    pub fn remote_candidates(&self, stream: StreamId) -> Result<Vec<Arc<Candidate>>, IceError> {
        Ok(self.shared.stream(stream)?.remote_candidates())
    }

    /// Build the check list of every stream from its candidates.
    ///
    /// Returns the total number of pairs.
    pub fn generate_check_lists(&self) -> usize {
        let controlling = self.controlling();
        let max_pairs = self.shared.config.max_candidate_pairs();

        self.shared
            .streams()
            .iter()
            .map(|s| s.build_check_list(controlling, max_pairs))
            .sum()
    }

    /// Pairs of a stream with their states, highest priority first.
    pub fn pairs(&self, stream: StreamId) -> Result<Vec<PairInfo>, IceError> {
        let s = self.shared.stream(stream)?;
        Ok(s.with_check_list(|l| {
            l.pairs()
                .iter()
                .map(|p| PairInfo {
                    local: p.local().clone(),
                    remote: p.remote().clone(),
                    prio: p.prio(),
                    state: p.state(),
                    nominated: p.is_nominated(),
                })
                .collect()
        }))
    }

    /// State of a stream's check list.
    pub fn stream_state(&self, stream: StreamId) -> Result<CheckListState, IceError> {
        Ok(self.shared.stream(stream)?.state())
    }

    /// Start the paced connectivity checks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_checks(&self) -> Result<(), IceError> {
        if self.shared.remote_credentials.lock().is_none() {
            return Err(IceError::NoRemoteCredentials);
        }

        let handle = Handle::try_current().map_err(|_| IceError::NoRuntime)?;

        if self.shared.started.swap(true, Ordering::AcqRel) {
            return Err(IceError::AlreadyStarted);
        }

        info!(
            "Start checks as {}",
            if self.controlling() { "controlling" } else { "controlled" }
        );
        self.shared.transition(IceConnectionState::New, IceConnectionState::Checking);

        let shared = self.shared.clone();
        handle.spawn(shared.pace());

        Ok(())
    }

    /// Recompute all pair priorities for the current role.
    pub fn recompute_pair_priorities(&self) {
        self.shared.recompute_pair_priorities();
    }

    /// Handles incoming data.
    ///
    /// `source` is the remote address the data came from, `destination` the
    /// local address it arrived on.
    pub fn handle_receive(
        &self,
        proto: Protocol,
        source: SocketAddr,
        destination: SocketAddr,
        buf: &[u8],
    ) -> Result<(), IceError> {
        let message = StunMessage::parse(buf)?;
        self.handle_message(proto, source, destination, message)
    }

    /// Handles an incoming, parsed STUN message.
    pub fn handle_message(
        &self,
        proto: Protocol,
        source: SocketAddr,
        destination: SocketAddr,
        message: StunMessage,
    ) -> Result<(), IceError> {
        trace!("Handle receive: {:?}", message);

        if message.is_binding_request() {
            self.shared.handle_request(proto, source, destination, message)
        } else if message.is_response() {
            self.shared.handle_response(source, message);
            Ok(())
        } else {
            trace!("Receive rejected, not a binding request or response");
            Ok(())
        }
    }

    /// Stop all checks. Incoming requests are still answered.
    pub fn stop(&self) {
        info!("Stop agent");
        self.shared.cancel.cancel();
        for s in self.shared.streams() {
            s.cancel();
        }
    }

    #[cfg(test)]
    fn tie_breaker(&self) -> u64 {
        self.shared.control_tie_breaker
    }
}

impl fmt::Debug for IceAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IceAgent")
            .field("controlling", &self.controlling())
            .field("state", &self.state())
            .field("streams", &*self.shared.streams.lock())
            .finish()
    }
}

/// Snapshot of a candidate pair.
#[derive(Debug, Clone)]
pub struct PairInfo {
    pub local: Arc<Candidate>,
    pub remote: Arc<Candidate>,
    pub prio: u64,
    pub state: CheckState,
    pub nominated: bool,
}

impl Shared {
    fn controlling(&self) -> bool {
        self.controlling.load(Ordering::Acquire)
    }

    fn streams(&self) -> Vec<Arc<MediaStream>> {
        self.streams.lock().clone()
    }

    fn stream(&self, id: StreamId) -> Result<Arc<MediaStream>, IceError> {
        self.streams
            .lock()
            .get(id.0)
            .cloned()
            .ok_or(IceError::UnknownStream(id))
    }

    fn emit(&self, event: IceAgentEvent) {
        trace!("Emit event: {:?}", event);
        if self.events.send(event).is_err() {
            trace!("Event receiver dropped");
        }
    }

    /// Move from one state to another, ignoring the change if the current
    /// state is something else.
    fn transition(&self, from: IceConnectionState, to: IceConnectionState) {
        let mut state = self.state.lock();
        if *state != from {
            return;
        }
        debug!("State change: {:?} -> {:?}", *state, to);
        *state = to;
        self.emit(IceAgentEvent::StateChange(to));
    }

    /// Enter a terminal state. Returns false if already terminal.
    fn finish(&self, to: IceConnectionState) -> bool {
        {
            let mut state = self.state.lock();
            if state.is_terminal() {
                return false;
            }
            info!("State change: {:?} -> {:?}", *state, to);
            *state = to;
            self.emit(IceAgentEvent::StateChange(to));
        }

        // Stops pacing and all remaining checks.
        self.cancel.cancel();

        true
    }

    fn switch_role(&self, controlling: bool) {
        let prev = self.controlling.swap(controlling, Ordering::AcqRel);
        if prev != controlling {
            info!(
                "Switch role to {}",
                if controlling { "controlling" } else { "controlled" }
            );
            self.recompute_pair_priorities();
        }
    }

    fn recompute_pair_priorities(&self) {
        let controlling = self.controlling();
        for s in self.streams() {
            s.with_check_list(|l| l.set_controlling(controlling));
        }
    }

    fn adopt_local(
        &self,
        stream: &MediaStream,
        mut c: Candidate,
    ) -> Result<Option<Arc<Candidate>>, IceError> {
        if !stream.has_component(c.component_id()) {
            return Err(IceError::BadCandidate(format!(
                "component {} not in stream {}",
                c.component_id(),
                stream.id()
            )));
        }

        if c.transport_kind() == TransportKind::Unsupported {
            return Err(IceError::BadCandidate(format!(
                "unsupported transport {} {:?}",
                c.proto(),
                c.tcptype()
            )));
        }

        if stream.is_redundant_local(&c) {
            debug!("Reject redundant local candidate: {:?}", c);
            return Ok(None);
        }

        let same_kind = stream.same_kind(&c);
        let local_preference = (self.config.local_preference())(&c, same_kind);
        let type_preference = self.config.type_preferences().get(c.kind(), c.family());
        let prio = compute_priority(type_preference, local_preference, c.component_id());
        let foundation = self.foundations.lock().foundation(&c);

        c.set_ufrag(&self.local_credentials.ufrag);
        let c = Arc::new(c.adopt(foundation, local_preference, prio));

        debug!("Add local candidate: {:?}", Pii(&c));
        stream.add_local(c.clone());

        Ok(Some(c))
    }

    /// Username and password for our requests.
    fn request_credentials(&self) -> Option<(String, String)> {
        let remote = self.remote_credentials.lock();
        let remote = remote.as_ref()?;
        // The username for the credential is formed by concatenating the
        // username fragment provided by the peer with the username fragment of
        // the ICE agent sending the request, separated by a colon (":").
        let username = format!("{}:{}", remote.ufrag, self.local_credentials.ufrag);
        Some((username, remote.pass.clone()))
    }

    async fn pace(self: Arc<Self>) {
        let mut ticker = interval(self.config.timing_advance());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut next = 0;

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    debug!("Stop pacing checks");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let running: Vec<_> = self
                .streams()
                .into_iter()
                .filter(|s| s.is_running())
                .collect();

            // Round robin. A stream without anything to check passes its turn on.
            for i in 0..running.len() {
                let idx = (next + i) % running.len();
                let stream = &running[idx];

                if let Some(req) = stream.next_check() {
                    next = idx + 1;
                    tokio::spawn(self.clone().run_check(stream.clone(), req));
                    break;
                }
            }
        }
    }

    async fn run_check(self: Arc<Self>, stream: Arc<MediaStream>, req: CheckRequest) {
        trace!(
            "Check pair {} {} -> {}",
            req.pair,
            req.local.base(),
            req.remote.addr()
        );
        let result = self.perform_check(&req).await;
        self.conclude_check(&stream, &req, result);
    }

    /// Send the request, retransmitting on timeout. Returns the outcome and
    /// the role we had when sending the last request.
    async fn perform_check(&self, req: &CheckRequest) -> Result<(CheckOutcome, bool), CheckError> {
        let Some((username, password)) = self.request_credentials() else {
            return Ok((CheckOutcome::Canceled, self.controlling()));
        };

        let Some(session) = self.sessions.session(&req.local, &req.remote) else {
            debug!(
                "No session for {} -> {}",
                Pii(req.local.base()),
                Pii(req.remote.addr())
            );
            return Err(NetError::Closed.into());
        };

        let prio = req.local.prio_prflx(self.config.type_preferences());
        let mut controlling = self.controlling();

        for attempt in 0..=self.config.max_stun_retransmits() {
            controlling = self.controlling();
            // Only the controlling side sends USE-CANDIDATE.
            let use_candidate = req.use_candidate && controlling;

            let request = StunMessage::binding_request(
                &username,
                TransId::new(),
                controlling,
                self.control_tie_breaker,
                prio,
                use_candidate,
            );

            let rto = stun_resend_delay(
                attempt + 1,
                self.config.initial_stun_rto(),
                self.config.max_stun_rto(),
            );

            {
                let mut stats = self.stats.lock();
                stats.bind_request_sent += 1;
                if use_candidate {
                    stats.nomination_send_count += 1;
                }
            }

            let checker = ConnectivityChecker::new(
                session.clone(),
                self.tracker.clone(),
                password.as_str(),
                req.cancel.clone(),
            );

            match checker.check(&request, rto).await? {
                CheckOutcome::NoResponse => {
                    trace!("No response for pair {}, attempt {}", req.pair, attempt + 1);
                }
                outcome => return Ok((outcome, controlling)),
            }
        }

        Ok((CheckOutcome::NoResponse, controlling))
    }

    fn conclude_check(
        &self,
        stream: &MediaStream,
        req: &CheckRequest,
        result: Result<(CheckOutcome, bool), CheckError>,
    ) {
        match result {
            Ok((CheckOutcome::Success(response), _)) => {
                self.on_check_success(stream, req, &response);
            }

            Ok((CheckOutcome::Failure(response), sent_controlling))
                if response.error_code() == Some(ROLE_CONFLICT) =>
            {
                // The peer wants the other role than the one we had when
                // sending, not whatever we have now.
                info!("Role conflict response for pair {}", req.pair);
                {
                    let mut stats = self.stats.lock();
                    stats.bind_failure_recv += 1;
                    stats.role_conflict_count += 1;
                }
                self.switch_role(!sent_controlling);
                stream.with_check_list(|l| l.retry(req.pair));
            }

            Ok((outcome, _)) => {
                if matches!(outcome, CheckOutcome::Failure(_)) {
                    self.stats.lock().bind_failure_recv += 1;
                }
                debug!("Check failed for pair {}: {:?}", req.pair, outcome);
                stream.with_check_list(|l| l.record_failure(req.pair));
            }

            Err(e) => {
                debug!("Check failed for pair {}: {}", req.pair, e);
                stream.with_check_list(|l| l.record_failure(req.pair));
            }
        }

        self.evaluate_stream(stream);
    }

    fn on_check_success(&self, stream: &MediaStream, req: &CheckRequest, response: &StunMessage) {
        // Guarded by the STUN parser for success responses.
        let Some(mapped) = response.mapped_address() else {
            stream.with_check_list(|l| l.record_failure(req.pair));
            return;
        };

        self.stats.lock().bind_success_recv += 1;

        let valid_local = match stream.local_for_mapped(mapped, &req.local) {
            Some(c) => c,
            None => self.local_peer_reflexive(stream, &req.local, mapped),
        };

        let Some(success) = stream.with_check_list(|l| l.record_success(req.pair, valid_local))
        else {
            // The pair is gone, the check list was rebuilt.
            return;
        };

        // Unfreeze the pairs with the same foundation in every check list.
        for s in self.streams() {
            s.with_check_list(|l| l.unfreeze(success.foundation));
        }

        if success.nominated {
            self.component_established(stream, success.component);
        }
    }

    /// A mapped address that matches no local candidate.
    fn local_peer_reflexive(
        &self,
        stream: &MediaStream,
        sent_from: &Candidate,
        mapped: SocketAddr,
    ) -> Arc<Candidate> {
        let prio = sent_from.prio_prflx(self.config.type_preferences());
        let local_preference = sent_from.local_preference();

        let c = Candidate::peer_reflexive(
            sent_from.proto(),
            sent_from.tcptype(),
            mapped,
            sent_from.base(),
            prio,
            0,
            sent_from.component_id(),
            Some(local_preference),
        );
        let foundation = self.foundations.lock().foundation(&c);
        let c = Arc::new(c.adopt(foundation, local_preference, prio));

        info!(
            "Created local peer reflexive candidate {} base {}",
            Pii(mapped),
            Pii(sent_from.base())
        );
        stream.add_discovered_local(c.clone());

        c
    }

    fn select(
        &self,
        stream: StreamId,
        component: u16,
        local: Arc<Candidate>,
        session_local: &Candidate,
        remote: Arc<Candidate>,
    ) -> Option<SelectedPair> {
        let session = self.sessions.session(session_local, &remote)?;
        Some(SelectedPair {
            stream,
            component,
            local,
            remote,
            session,
        })
    }

    fn selected_pairs(&self, stream: &MediaStream) -> Vec<SelectedPair> {
        let nominated: Vec<_> = stream.with_check_list(|l| {
            l.nominated()
                .map(|p| {
                    (
                        p.component_id(),
                        p.valid_local().clone(),
                        p.local().clone(),
                        p.remote().clone(),
                    )
                })
                .collect()
        });

        nominated
            .into_iter()
            .filter_map(|(component, local, session_local, remote)| {
                self.select(stream.id(), component, local, &session_local, remote)
            })
            .collect()
    }

    fn component_established(&self, stream: &MediaStream, component: u16) {
        let selected = self
            .selected_pairs(stream)
            .into_iter()
            .find(|s| s.component == component);

        if let Some(selected) = selected {
            info!(
                "Component {} of stream {} established: {} -> {}",
                component,
                stream.id(),
                Pii(selected.local.addr()),
                Pii(selected.remote.addr())
            );
            self.emit(IceAgentEvent::ComponentEstablished(selected));
        }

        self.transition(IceConnectionState::Checking, IceConnectionState::Connected);
    }

    /// Nominate if we can, then see whether the stream is done.
    fn evaluate_stream(&self, stream: &MediaStream) {
        let controlling = self.controlling();

        let change = stream.with_check_list(|l| {
            if controlling && l.is_running() {
                for id in l.nomination_candidates() {
                    l.request_nomination(id);
                }
            }
            l.evaluate()
        });

        match change {
            Some(CheckListState::Completed) => {
                info!("Stream {} ({}) completed", stream.id(), stream.name());
                self.emit(IceAgentEvent::StreamCompleted(stream.id()));
                self.evaluate_agent();
            }
            Some(CheckListState::Failed) => {
                warn!("Stream {} ({}) failed", stream.id(), stream.name());
                self.emit(IceAgentEvent::StreamFailed(stream.id()));
                self.evaluate_agent();
            }
            _ => {}
        }
    }

    fn evaluate_agent(&self) {
        let streams = self.streams();

        if streams.iter().any(|s| s.state() == CheckListState::Failed) {
            if self.finish(IceConnectionState::Failed) {
                self.emit(IceAgentEvent::Failed);
            }
            return;
        }

        let all_completed = streams
            .iter()
            .all(|s| s.state() == CheckListState::Completed);

        if all_completed {
            let selected: Vec<_> = streams.iter().flat_map(|s| self.selected_pairs(s)).collect();
            if self.finish(IceConnectionState::Completed) {
                self.emit(IceAgentEvent::Completed { selected });
            }
        }
    }

    fn handle_request(
        &self,
        proto: Protocol,
        source: SocketAddr,
        destination: SocketAddr,
        message: StunMessage,
    ) -> Result<(), IceError> {
        // The existence of USERNAME and PRIORITY is checked by the STUN parser.
        let Some((local_ufrag, remote_ufrag)) = message.split_username() else {
            return Ok(());
        };
        let Some(prio) = message.prio() else {
            return Ok(());
        };

        if local_ufrag != self.local_credentials.ufrag {
            debug!(
                "STUN request rejected, local user mismatch: {} != {}",
                local_ufrag, self.local_credentials.ufrag
            );
            return Ok(());
        }

        if let Some(remote) = &*self.remote_credentials.lock() {
            if remote_ufrag != remote.ufrag {
                debug!(
                    "STUN request rejected, remote user mismatch: {} != {}",
                    remote_ufrag, remote.ufrag
                );
                return Ok(());
            }
        }

        if !message.check_integrity(&self.local_credentials.pass) {
            debug!("STUN request rejected, integrity check failed");
            return Ok(());
        }

        self.stats.lock().bind_request_recv += 1;

        let Some((stream, local)) = self
            .streams()
            .into_iter()
            .find_map(|s| s.local_for_destination(destination, proto).map(|c| (s, c)))
        else {
            // Traffic for an address that is neither a host nor a relay
            // candidate of ours.
            debug!("STUN request for unknown destination {}", Pii(destination));
            return Ok(());
        };

        let component = local.component_id();
        let known_remote = stream.remote_for_source(source, proto, component);
        let is_new = known_remote.is_none();

        // If the source transport address of the request does not match any
        // existing remote candidates, it represents a new peer-reflexive remote
        // candidate.
        let remote = known_remote.unwrap_or_else(|| {
            let foundation = self.next_remote_foundation.fetch_add(1, Ordering::Relaxed);
            Arc::new(Candidate::peer_reflexive(
                proto,
                opposite_tcptype(local.tcptype()),
                source,
                source,
                prio,
                foundation,
                component,
                None,
            ))
        });

        let Some(session) = self.sessions.session(&local, &remote) else {
            debug!(
                "No session to reply {} -> {}",
                Pii(local.base()),
                Pii(source)
            );
            return Ok(());
        };

        if self.role_conflict(&message) {
            let reply = StunMessage::error_reply(message.trans_id(), ROLE_CONFLICT, "Role Conflict");
            debug!("Send STUN role conflict: {} -> {}", Pii(local.base()), Pii(source));
            session
                .write(&reply, &self.local_credentials.pass)
                .map_err(CheckError::from)?;
            return Ok(());
        }

        let controlling = self.controlling();
        let use_candidate = message.use_candidate();

        if use_candidate && controlling {
            // the other side is not controlling, and it sent USE-CANDIDATE. that's wrong.
            debug!("STUN request rejected, USE-CANDIDATE when local is controlling");
            return Ok(());
        }

        if is_new {
            info!(
                "Created peer reflexive remote candidate from STUN request: {:?}",
                Pii(&remote)
            );
            self.stats.lock().discovered_recv_count += 1;
            stream.add_remote(remote.clone());
        }

        let nominated = stream.with_check_list(|l| {
            let id = l.add_discovered_pair(&local, &remote)?;
            if !l.is_running() {
                return None;
            }
            l.trigger(id);
            Some(use_candidate && l.remote_nomination(id))
        });

        let reply = StunMessage::reply(message.trans_id(), source);
        trace!("Send STUN reply: {} -> {} {:?}", local.base(), source, reply);
        session
            .write(&reply, &self.local_credentials.pass)
            .map_err(CheckError::from)?;

        if nominated == Some(true) {
            self.component_established(&stream, component);
            self.evaluate_stream(&stream);
        }

        Ok(())
    }

    /// Resolve a role conflict from the request's ICE-CONTROLLING or
    /// ICE-CONTROLLED attribute. Returns true if the peer must switch, which
    /// is answered with a 487.
    ///
    /// RFC 8445, Section 7.3.1.1.
    fn role_conflict(&self, message: &StunMessage) -> bool {
        let ours = self.control_tie_breaker;

        if self.controlling() {
            let Some(theirs) = message.ice_controlling() else {
                return false;
            };
            self.stats.lock().role_conflict_count += 1;
            if ours >= theirs {
                debug!("Role conflict, both controlling, peer must switch");
                return true;
            }
            self.switch_role(false);
        } else {
            let Some(theirs) = message.ice_controlled() else {
                return false;
            };
            self.stats.lock().role_conflict_count += 1;
            if ours >= theirs {
                self.switch_role(true);
            } else {
                debug!("Role conflict, both controlled, peer must switch");
                return true;
            }
        }

        false
    }

    fn handle_response(&self, source: SocketAddr, message: StunMessage) {
        let Some(password) = self
            .remote_credentials
            .lock()
            .as_ref()
            .map(|c| c.pass.clone())
        else {
            debug!("STUN response rejected, no remote credentials");
            return;
        };

        if !message.check_integrity(&password) {
            debug!("STUN response rejected, integrity check failed");
            return;
        }

        self.tracker.on_response(message, source);
    }
}

fn opposite_tcptype(t: Option<TcpType>) -> Option<TcpType> {
    t.map(|t| match t {
        TcpType::Active => TcpType::Passive,
        TcpType::Passive => TcpType::Active,
        TcpType::So => TcpType::So,
    })
}
