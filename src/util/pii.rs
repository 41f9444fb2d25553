//! Redaction of addresses and credentials in logs.
//!
//! Anything wrapped in [`Pii`] is printed as `{REDACTED}` when the `pii`
//! feature is enabled. Use it for debug, info, warn and error logs. Trace
//! logs are not expected to be enabled in production and log plainly.

use core::fmt;
use core::ops::Deref;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pii<T>(pub T);

impl<T: fmt::Display> fmt::Display for Pii<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        #[cfg(feature = "pii")]
        {
            write!(f, "{{REDACTED}}")
        }
        #[cfg(not(feature = "pii"))]
        {
            write!(f, "{}", self.0)
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Pii<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        #[cfg(feature = "pii")]
        {
            write!(f, "{{REDACTED}}")
        }
        #[cfg(not(feature = "pii"))]
        {
            write!(f, "{:?}", self.0)
        }
    }
}

impl<T> Deref for Pii<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
