use std::time::Duration;

use crate::ice::{default_local_preference, IceCreds, LocalPreference, TypePreferences};
use crate::io::{STUN_INITIAL_RTO, STUN_MAX_RETRANS, STUN_MAX_RTO};

/// Timing advance (Ta) value.
///
/// ICE agents SHOULD use a default Ta value, 50 ms, but MAY use another
/// value based on the characteristics of the associated data.
const TIMING_ADVANCE: Duration = Duration::from_millis(50);

/// The default limit of candidate pairs for the checklist set is 100,
/// but the value MUST be configurable.
const MAX_CANDIDATE_PAIRS: usize = 100;

/// Customized config for creating an [`IceAgent`][crate::IceAgent].
///
/// ```
/// use std::time::Duration;
/// use icecheck::IceConfig;
///
/// let config = IceConfig::new()
///     .set_controlling(true)
///     .set_timing_advance(Duration::from_millis(20))
///     .set_include_tcp(false);
///
/// assert!(config.controlling());
/// ```
///
/// Configs implement [`Clone`] to help create multiple agents.
#[derive(Debug, Clone)]
pub struct IceConfig {
    pub(crate) local_ice_credentials: Option<IceCreds>,
    pub(crate) controlling: bool,
    pub(crate) timing_advance: Duration,
    pub(crate) initial_stun_rto: Duration,
    pub(crate) max_stun_rto: Duration,
    pub(crate) max_stun_retransmits: usize,
    pub(crate) max_candidate_pairs: usize,
    pub(crate) include_tcp: bool,
    pub(crate) type_preferences: TypePreferences,
    pub(crate) local_preference: LocalPreference,
}

impl IceConfig {
    /// Creates a new default config.
    pub fn new() -> Self {
        IceConfig::default()
    }

    /// Get the local ICE credentials, if set.
    ///
    /// If not specified, local credentials will be randomly generated when
    /// creating the agent.
    pub fn local_ice_credentials(&self) -> Option<&IceCreds> {
        self.local_ice_credentials.as_ref()
    }

    /// Explicitly sets local ICE credentials.
    pub fn set_local_ice_credentials(mut self, local_ice_credentials: IceCreds) -> Self {
        self.local_ice_credentials = Some(local_ice_credentials);
        self
    }

    /// Whether the agent starts out controlling.
    ///
    /// The role can change later through role conflict resolution.
    pub fn controlling(&self) -> bool {
        self.controlling
    }

    /// Set the initial role. Defaults to controlled.
    pub fn set_controlling(mut self, controlling: bool) -> Self {
        self.controlling = controlling;
        self
    }

    /// Interval between two paced connectivity checks.
    pub fn timing_advance(&self) -> Duration {
        self.timing_advance
    }

    /// Set the pacing interval Ta. Defaults to 50ms.
    pub fn set_timing_advance(mut self, ta: Duration) -> Self {
        self.timing_advance = ta;
        self
    }

    /// Initial STUN retransmission timeout.
    pub fn initial_stun_rto(&self) -> Duration {
        self.initial_stun_rto
    }

    /// Set the initial STUN retransmission timeout. Defaults to 250ms.
    ///
    /// The timeout doubles on each retransmission up to [`IceConfig::max_stun_rto`].
    pub fn set_initial_stun_rto(mut self, rto: Duration) -> Self {
        self.initial_stun_rto = rto;
        self
    }

    /// Upper bound of the STUN retransmission timeout.
    pub fn max_stun_rto(&self) -> Duration {
        self.max_stun_rto
    }

    /// Set the max STUN retransmission timeout. Defaults to 3s.
    pub fn set_max_stun_rto(mut self, rto: Duration) -> Self {
        self.max_stun_rto = rto;
        self
    }

    /// How many times a request is retransmitted before the check fails.
    pub fn max_stun_retransmits(&self) -> usize {
        self.max_stun_retransmits
    }

    /// Set the number of STUN retransmits. Defaults to 7.
    pub fn set_max_stun_retransmits(mut self, num: usize) -> Self {
        self.max_stun_retransmits = num;
        self
    }

    /// Max number of candidate pairs in a check list.
    pub fn max_candidate_pairs(&self) -> usize {
        self.max_candidate_pairs
    }

    /// Set the max number of candidate pairs per check list. Defaults to 100.
    pub fn set_max_candidate_pairs(mut self, max: usize) -> Self {
        self.max_candidate_pairs = max;
        self
    }

    /// Whether TCP candidates are gathered.
    pub fn include_tcp(&self) -> bool {
        self.include_tcp
    }

    /// Gather TCP candidates. Defaults to true.
    pub fn set_include_tcp(mut self, include: bool) -> Self {
        self.include_tcp = include;
        self
    }

    /// Type preference table used to prioritize local candidates.
    pub fn type_preferences(&self) -> &TypePreferences {
        &self.type_preferences
    }

    /// Replace the type preference table.
    pub fn set_type_preferences(mut self, prefs: TypePreferences) -> Self {
        self.type_preferences = prefs;
        self
    }

    /// Local preference function used to prioritize local candidates.
    pub fn local_preference(&self) -> LocalPreference {
        self.local_preference
    }

    /// Replace the local preference function.
    ///
    /// It is given the candidate and the number of previously adopted local
    /// candidates of the same kind and IP version.
    pub fn set_local_preference(mut self, f: LocalPreference) -> Self {
        self.local_preference = f;
        self
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            local_ice_credentials: None,
            controlling: false,
            timing_advance: TIMING_ADVANCE,
            initial_stun_rto: STUN_INITIAL_RTO,
            max_stun_rto: STUN_MAX_RTO,
            max_stun_retransmits: STUN_MAX_RETRANS,
            max_candidate_pairs: MAX_CANDIDATE_PAIRS,
            include_tcp: true,
            type_preferences: TypePreferences::default(),
            local_preference: default_local_preference,
        }
    }
}
