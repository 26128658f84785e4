//! SimplePush wire protocol
//!
//! - [`message`]: the six wire message kinds and their JSON codec
//! - [`token`]: reversible endpoint tokens for `(uaid, channelID)`
//! - [`version`]: `version=<n>` notification body parsing

pub mod message;
pub mod token;
pub mod version;

pub use message::{CodecError, MessageType, Reply, Request, Status, Update};
pub use token::{EndpointTokenCodec, TokenError};
pub use version::{extract_version, VersionError};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// User agent identifier
///
/// Always a UUID. Anything a client sends that does not parse as one is
/// treated as absent and the agent gets a fresh id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uaid(Uuid);

impl Uaid {
    /// Generate a fresh random agent id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a client-supplied id, rejecting empty or malformed input
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for Uaid {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Uaid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for Uaid {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}
