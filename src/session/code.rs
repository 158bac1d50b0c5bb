//! Room codes.
//!
//! The initiator shows a short code (or a QR code of it); the responder
//! types or scans it. Codes are generated locally with no collision check
//! against the relay.

use std::fmt;

use rand::Rng;

use super::error::SessionError;
use crate::relay::RoomId;

/// Characters a generated code is drawn from.
const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Length of a generated code.
pub const CODE_LEN: usize = 6;

/// A case-normalized room code such as `AB12C3`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomCode(String);

impl RoomCode {
    /// Generates a random six-character code.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let code = (0..CODE_LEN)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect();
        Self(code)
    }

    /// Parses a user-entered code.
    ///
    /// Surrounding whitespace is ignored and letters are upper-cased. The
    /// code must be non-empty ASCII alphanumerics no longer than a relay
    /// room id.
    pub fn parse(s: &str) -> Result<Self, SessionError> {
        let code = s.trim().to_ascii_uppercase();
        if code.is_empty()
            || code.len() > RoomId::MAX_LEN
            || !code.bytes().all(|b| b.is_ascii_alphanumeric())
        {
            return Err(SessionError::invalid_room_code(s));
        }
        Ok(Self(code))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for RoomCode {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
