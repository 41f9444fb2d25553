//! An [ICE][ice] agent that finds a working path between two peers.
//!
//! The agent pairs local candidates with the ones the remote peer sends
//! over signaling, orders the pairs by priority and runs STUN connectivity
//! checks over them. The controlling side nominates one pair per
//! component, and once every component of every stream has a nominated
//! pair the agent is done.
//!
//! The agent does not own any sockets. Gathering candidates and sending
//! bytes are handed in through the [`Gatherer`] and [`SessionProvider`]
//! traits, and incoming STUN messages are fed back via
//! [`IceAgent::handle_receive`].
//!
//! # Usage
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use icecheck::{Candidate, IceAgent, IceAgentEvent, IceConfig, IceCreds, SessionProvider};
//! # async fn run(sessions: Arc<dyn SessionProvider>) {
//! let config = IceConfig::new().set_controlling(true);
//! let (agent, mut events) = IceAgent::new(config, sessions);
//!
//! let audio = agent.add_stream("audio", &[1, 2]);
//!
//! let host = Candidate::host("10.0.0.1:5000".parse().unwrap(), "udp").unwrap();
//! agent.add_local_candidate(audio, host).unwrap();
//!
//! // Exchange credentials and candidates with the peer.
//! let remote_creds: IceCreds = todo!();
//! let remote: Vec<Candidate> = todo!();
//! agent.set_remote_credentials(remote_creds);
//! agent.add_remote_candidates(audio, remote).unwrap();
//!
//! agent.generate_check_lists();
//! agent.start_checks().unwrap();
//!
//! while let Some(event) = events.recv().await {
//!     if let IceAgentEvent::Completed { selected } = event {
//!         // One pair per component.
//!         println!("{:?}", selected);
//!         break;
//!     }
//! }
//! # }
//! ```
//!
//! # Runtime
//!
//! Checks run as tasks on the ambient [tokio][tokio] runtime. The agent is
//! cheap to clone and every clone talks to the same agent.
//!
//! [ice]:   https://www.rfc-editor.org/rfc/rfc8445
//! [tokio]: https://docs.rs/tokio

#![forbid(unsafe_code)]
#![allow(clippy::new_without_default)]
#![allow(clippy::bool_to_int_with_if)]
#![allow(clippy::manual_range_contains)]

#[macro_use]
extern crate tracing;

mod config;
pub use config::IceConfig;

pub mod ice;
pub use ice::{Candidate, CandidateKind, IceAgent, IceAgentEvent, IceAgentStats};
pub use ice::{Gatherer, Session, SessionProvider};
pub use ice::{IceConnectionState, IceCreds, PairInfo, SelectedPair, StreamId};

mod io;

mod sdp;
pub use sdp::{format_candidates, parse_candidates};

mod util;

/// Network related types to get STUN data in/out of the [`IceAgent`].
pub mod net {
    pub use crate::io::{stun_resend_delay, StunMessage, TransId};
    pub use crate::io::{Protocol, TcpType, TransportFamily};
    pub use crate::io::{ROLE_CONFLICT, STUN_INITIAL_RTO, STUN_MAX_RETRANS, STUN_MAX_RTO};
}

/// Various error types.
pub mod error {
    pub use crate::ice::{CheckError, IceError};
    pub use crate::io::{NetError, StunError};
    pub use crate::sdp::SdpError;
}
