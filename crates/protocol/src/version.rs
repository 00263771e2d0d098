//! Protocol version management

use serde::{Deserialize, Serialize};

/// Protocol version carried in every message envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

/// Current protocol version
///
/// Minor 1 introduced the compressed-data message.
pub const CURRENT_VERSION: ProtocolVersion = ProtocolVersion {
    major: 1,
    minor: 1,
    patch: 0,
};

impl ProtocolVersion {
    /// Whether this version understands compressed-data messages
    pub fn supports_compression(&self) -> bool {
        self.major > 1 || (self.major == 1 && self.minor >= 1)
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
