use combine::error::StringStreamError;
use thiserror::Error;

/// Errors from parsing candidate attributes.
#[derive(Debug, Error)]
pub enum SdpError {
    #[error("SDP parse: {0}")]
    Parse(#[from] StringStreamError),

    #[error("SDP inconsistent: {0}")]
    Inconsistent(String),
}
