//! Strongly-typed identifiers.
//!
//! Session ids are capability tokens: 256 bits from the OS CSPRNG, encoded as
//! unpadded URL-safe base64. Run and tool-call ids only need uniqueness and
//! use UUID v4.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Bytes of entropy in a session id.
pub const SESSION_ID_BYTES: usize = 32;

/// Macro to define a strongly-typed ID newtype wrapper.
///
/// Generates: struct, `from_string()`, `as_str()`, Display, Serialize, Deserialize.
/// With the `uuid` flag it also generates `new()` (UUID v4) and `Default`.
macro_rules! define_id {
    ($name:ident, uuid) => {
        define_id!($name);

        impl $name {
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }
    };
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn from_string(s: String) -> Result<Self, &'static str> {
                if s.is_empty() {
                    return Err(concat!(stringify!($name), " cannot be empty"));
                }
                Ok(Self(s))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_string(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id!(SessionId);
define_id!(RunId, uuid);
define_id!(ToolCallId, uuid);

impl SessionId {
    /// Mint an unguessable session id.
    pub fn generate() -> Self {
        let mut bytes = [0u8; SESSION_ID_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Parse a client-supplied id. Anything that could not have been minted
    /// by [`SessionId::generate`] is rejected so lookups never hash junk.
    pub fn parse(candidate: &str) -> Option<Self> {
        let candidate = candidate.trim();
        let decoded = URL_SAFE_NO_PAD.decode(candidate).ok()?;
        (decoded.len() == SESSION_ID_BYTES).then(|| Self(candidate.to_string()))
    }
}
