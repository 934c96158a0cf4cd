//! Opaque session identifiers.
//!
//! A session id is 128 random bits, rendered as 32 lowercase hex characters
//! wherever it leaves the process (URL paths, log fields, control messages).

use crate::error::FlexiError;
use std::fmt;
use std::str::FromStr;

/// Number of random bytes in a session id.
const SESSION_ID_LEN: usize = 16;

/// Unique handle to a multiplexed terminal session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId([u8; SESSION_ID_LEN]);

impl SessionId {
    /// Generate a fresh random session id.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; SESSION_ID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Raw identifier bytes.
    pub fn as_bytes(&self) -> &[u8; SESSION_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for SessionId {
    type Err = FlexiError;

    /// Parse the 32-character hex form. Upper-case digits are accepted.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != SESSION_ID_LEN * 2 {
            return Err(FlexiError::InvalidSessionId(format!(
                "expected {} hex chars, got {}",
                SESSION_ID_LEN * 2,
                s.len()
            )));
        }
        let mut bytes = [0u8; SESSION_ID_LEN];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| FlexiError::InvalidSessionId(e.to_string()))?;
        Ok(Self(bytes))
    }
}
