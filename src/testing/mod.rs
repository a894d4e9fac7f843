//! Testing utilities for kioskpass
//!
//! Available to unit tests and, with the `testing` feature, to the
//! integration tests under `tests/`.
//!
//! ## Organization
//!
//! - [`authenticator`] - Software authenticator producing real WebAuthn responses
//! - [`ca`] - Throwaway attestation CA for `x5c` chains
//! - [`fixtures`] - Settings, ceremonies, credentials and a wired orchestrator
//!
//! ## Usage
//!
//! ```rust,ignore
//! use kioskpass::testing::{fixtures, SoftAuthenticator};
//! use kioskpass::webauthn::Identity;
//!
//! let harness = fixtures::orchestrator();
//! let mut authenticator = SoftAuthenticator::es256();
//! let identity = Identity::new("1234");
//!
//! fixtures::register(&harness.orchestrator, &mut authenticator, &identity).unwrap();
//! let outcome =
//!     fixtures::authenticate(&harness.orchestrator, &mut authenticator, Some(&identity)).unwrap();
//! assert_eq!(outcome.identity, identity);
//! ```

pub mod authenticator;
pub mod ca;
pub mod fixtures;

pub use authenticator::{AttestationMode, SoftAuthenticator, AAGUID};
pub use ca::{AttestationCert, LeafOptions, TestCa};

/// Common test constants
pub mod constants {
    /// Relying party id used by the test settings and the soft authenticator
    pub const RP_ID: &str = "kiosk.example";

    /// Origin accepted by the test settings
    pub const ORIGIN: &str = "https://kiosk.example";

    /// Default kiosk PIN
    pub const TEST_PIN: &str = "1234";
}
