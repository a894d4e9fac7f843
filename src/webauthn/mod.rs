//! `WebAuthn` implementation
//!
//! Protocol building blocks for the kiosk ceremony engine: challenge
//! generation, client data and authenticator data checks, COSE keys, and the
//! attestation and assertion verifiers. Nothing in here holds state across
//! requests; the pending ceremonies live in [`crate::ceremony`] and the
//! credentials in [`crate::store`].

pub mod assertion;
pub mod attestation;
pub mod authenticator_data;
pub mod cbor;
pub mod challenge;
pub mod client_data;
pub mod cose;
mod errors;
mod settings;
mod types;

// Re-exports for public use
pub use assertion::AssertionVerifier;
pub use attestation::{AttestationVerifier, TrustLevel};
pub use challenge::{ChallengeGenerator, EntropySource};
pub use cose::{CosePublicKey, SUPPORTED_ALGORITHMS};
pub use errors::WebAuthnError;
pub use settings::{AttestationPolicy, CounterPolicy, WebAuthnSettings};
pub use types::*;
