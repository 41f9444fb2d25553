//! The `candidate` attribute used to exchange candidates with the peer.
//!
//! RFC 8839, Section 5.1, with the `tcptype` extension from RFC 6544 and
//! the `ufrag` extension browsers add.

use crate::{Candidate, CandidateKind};

mod error;
pub use error::SdpError;

mod parser;
pub(crate) use parser::parse_candidate;
use parser::parse_candidate_lines;

impl Candidate {
    /// The candidate as attribute value, without the `a=` prefix.
    ///
    /// ```
    /// use icecheck::Candidate;
    ///
    /// let c = Candidate::host("1.2.3.4:5000".parse().unwrap(), "udp").unwrap();
    /// assert!(c.to_sdp_string().ends_with(" 1.2.3.4 5000 typ host"));
    /// ```
    pub fn to_sdp_string(&self) -> String {
        let mut s = format!(
            "candidate:{} {} {} {} {} {} typ {}",
            self.foundation(),
            self.component_id(),
            self.proto(),
            self.prio(),
            self.addr().ip(),
            self.addr().port(),
            self.kind()
        );
        match self.raddr() {
            Some(raddr) => s.push_str(&format!(" raddr {} rport {}", raddr.ip(), raddr.port())),
            // Withheld related address.
            None if self.kind() != CandidateKind::Host => s.push_str(" raddr 0.0.0.0 rport 0"),
            None => {}
        }
        if let Some(tcptype) = self.tcptype() {
            s.push_str(&format!(" tcptype {}", tcptype));
        }
        if let Some(ufrag) = self.ufrag() {
            s.push_str(&format!(" ufrag {}", ufrag));
        }
        s
    }
}

/// Format candidates as `a=candidate` lines.
pub fn format_candidates<'a>(candidates: impl IntoIterator<Item = &'a Candidate>) -> String {
    candidates
        .into_iter()
        .map(|c| format!("a={}\r\n", c.to_sdp_string()))
        .collect()
}

/// Parse the `a=candidate` lines of a block of attributes.
///
/// Other lines are skipped.
pub fn parse_candidates(s: &str) -> Result<Vec<Candidate>, SdpError> {
    parse_candidate_lines(s)
}
