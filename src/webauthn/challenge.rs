//! Challenge and user handle generation
//!
//! Randomness comes from the operating system through `ring`. If the source
//! fails the caller gets `EntropyUnavailable`; there is no weaker fallback.

use chrono::{DateTime, Utc};
use ring::rand::{SecureRandom, SystemRandom};

use super::errors::WebAuthnError;
use super::types::Challenge;

/// Challenge length in bytes (256 bits)
pub const CHALLENGE_LEN: usize = 32;

/// User handle length in bytes
pub const USER_HANDLE_LEN: usize = 16;

/// Source of cryptographically secure random bytes
pub trait EntropySource: Send + Sync {
    /// Fill `dest` completely or fail
    ///
    /// # Errors
    ///
    /// Returns `EntropyUnavailable` if the source cannot supply bytes
    fn fill(&self, dest: &mut [u8]) -> Result<(), WebAuthnError>;
}

impl EntropySource for SystemRandom {
    fn fill(&self, dest: &mut [u8]) -> Result<(), WebAuthnError> {
        SecureRandom::fill(self, dest).map_err(|_| WebAuthnError::EntropyUnavailable)
    }
}

/// Produces fresh single-use challenges
pub struct ChallengeGenerator {
    source: Box<dyn EntropySource>,
}

impl ChallengeGenerator {
    /// Generator backed by the operating system CSPRNG
    #[must_use]
    pub fn new() -> Self {
        Self::with_source(Box::new(SystemRandom::new()))
    }

    #[must_use]
    pub fn with_source(source: Box<dyn EntropySource>) -> Self {
        Self { source }
    }

    /// Generate a challenge valid until `expires_at`
    ///
    /// # Errors
    ///
    /// Returns `EntropyUnavailable` if the random source fails
    pub fn generate(&self, expires_at: DateTime<Utc>) -> Result<Challenge, WebAuthnError> {
        let bytes = self.random_bytes(CHALLENGE_LEN)?;
        Ok(Challenge::new(bytes, expires_at))
    }

    /// Generate an opaque user handle for a new identity
    ///
    /// # Errors
    ///
    /// Returns `EntropyUnavailable` if the random source fails
    pub fn user_handle(&self) -> Result<Vec<u8>, WebAuthnError> {
        self.random_bytes(USER_HANDLE_LEN)
    }

    fn random_bytes(&self, len: usize) -> Result<Vec<u8>, WebAuthnError> {
        let mut bytes = vec![0u8; len];
        self.source.fill(&mut bytes).inspect_err(|_| {
            log::error!("Secure random source failed while generating {len} bytes");
        })?;
        Ok(bytes)
    }
}

impl Default for ChallengeGenerator {
    fn default() -> Self {
        Self::new()
    }
}
