//! Global request identifier type

use std::fmt;

/// Correlates a global request with its reply on the control channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u32);

impl RequestId {
    /// Create a new request ID
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw ID value
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Identifier used for requests that do not want a reply
    pub const UNSOLICITED: RequestId = RequestId(0);
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

impl From<u32> for RequestId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}
