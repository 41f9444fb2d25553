//! Interactive Connectivity Establishment.
//!
//! Candidates are paired into one [`CheckList`] per media stream. The
//! [`IceAgent`] paces connectivity checks over them, answers the peer's
//! checks and nominates one pair per component.

#![allow(clippy::new_without_default)]
#![allow(clippy::bool_to_int_with_if)]

mod error;
pub use error::{CheckError, IceError};

mod candidate;
pub use candidate::{Candidate, CandidateKind, TransportKind};

mod preference;
pub use preference::{compute_priority, default_local_preference, pair_priority};
pub use preference::{LocalPreference, TypePreferences};

mod foundation;
pub use foundation::{compute_foundation, FoundationRegistry};

mod pair;
pub use pair::{CandidatePair, CheckState, PairId};

mod checklist;
pub use checklist::{CheckList, CheckListState, CheckRequest, CheckSuccess};

mod transaction;
pub use transaction::{TransactionTracker, Waiter};

mod session;
pub use session::{Gatherer, Session, SessionProvider};

mod checker;
pub use checker::{CheckOutcome, ConnectivityChecker};

mod stream;
pub use stream::StreamId;

mod agent;
pub use agent::{IceAgent, IceAgentEvent, IceAgentStats, IceConnectionState, IceCreds};
pub use agent::{PairInfo, SelectedPair};
