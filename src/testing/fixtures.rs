//! Test fixtures providing pre-built test objects
//!
//! Settings, ceremonies, credentials and a fully wired orchestrator with a
//! manual clock, so tests do not rebuild the same objects every time.

use chrono::{Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

pub use super::constants::{ORIGIN, RP_ID};
use super::SoftAuthenticator;
use crate::ceremony::{CeremonyOrchestrator, Deadline, ManualClock, PendingCeremonyCache};
use crate::settings::KioskSettings;
use crate::store::MemoryCredentialStore;
use crate::webauthn::{
    AttestationVerifier, AuthenticationOutcome, Ceremony, CeremonyKind, ChallengeGenerator,
    Credential, Identity, RegistrationOutcome, WebAuthnError, WebAuthnSettings,
};

/// `WebAuthn` settings for the test relying party
#[must_use]
pub fn test_webauthn_settings() -> WebAuthnSettings {
    WebAuthnSettings {
        rp_id: RP_ID.to_string(),
        rp_name: "Kioskpass Test".to_string(),
        allowed_origins: vec![ORIGIN.to_string()],
        ..WebAuthnSettings::default()
    }
}

/// Application settings pointing at the test relying party
#[must_use]
pub fn test_kiosk_settings() -> KioskSettings {
    let mut settings = KioskSettings::default();
    settings.webauthn = test_webauthn_settings();
    settings
}

fn ceremony(kind: CeremonyKind, identity: Option<&str>, user_handle: Option<Vec<u8>>) -> Ceremony {
    let now = Utc::now();
    Ceremony {
        id: Uuid::new_v4().to_string(),
        kind,
        challenge: ChallengeGenerator::new()
            .generate(now + Duration::seconds(60))
            .expect("generate challenge"),
        identity: identity.map(Identity::from),
        user_handle,
        allowed_credentials: Vec::new(),
        created_at: now,
        consumed: true,
    }
}

/// Consumed registration ceremony for `identity` with user handle `[1; 16]`
#[must_use]
pub fn registration_ceremony(identity: &str) -> Ceremony {
    ceremony(CeremonyKind::Registration, Some(identity), Some(vec![1; 16]))
}

/// Consumed authentication ceremony
#[must_use]
pub fn authentication_ceremony(identity: Option<&str>) -> Ceremony {
    ceremony(CeremonyKind::Authentication, identity, None)
}

/// Register `authenticator` directly through the attestation verifier
#[must_use]
pub fn registered_credential(authenticator: &mut SoftAuthenticator, identity: &str) -> Credential {
    let ceremony = registration_ceremony(identity);
    let user_handle = ceremony.user_handle.clone().unwrap_or_default();
    let response = authenticator
        .make_credential(ceremony.challenge.as_bytes(), &user_handle)
        .expect("make credential");
    AttestationVerifier::with_trust_anchors(&test_webauthn_settings(), Vec::new())
        .verify(&ceremony, &response, Utc::now())
        .expect("verify attestation")
}

/// Stored credential with a placeholder key, for store tests
#[must_use]
pub fn credential_with_counter(credential_id: &[u8], owner: &str, counter: u32) -> Credential {
    Credential {
        credential_id: credential_id.to_vec(),
        owner: Identity::new(owner),
        user_handle: Vec::new(),
        public_key: vec![0xA0],
        algorithm: -7,
        signature_counter: counter,
        attestation_format: "none".to_string(),
        created_at: Utc::now(),
        last_used: None,
    }
}

/// Orchestrator wired to an in-memory store and a manual clock
pub struct TestHarness {
    pub orchestrator: CeremonyOrchestrator,
    pub store: Arc<MemoryCredentialStore>,
    pub clock: Arc<ManualClock>,
}

#[must_use]
pub fn orchestrator() -> TestHarness {
    orchestrator_with(test_webauthn_settings())
}

#[must_use]
pub fn orchestrator_with(settings: WebAuthnSettings) -> TestHarness {
    orchestrator_with_store(settings, Arc::new(MemoryCredentialStore::new()))
}

#[must_use]
pub fn orchestrator_with_store(
    settings: WebAuthnSettings,
    store: Arc<MemoryCredentialStore>,
) -> TestHarness {
    let clock = Arc::new(ManualClock::default());
    let cache = PendingCeremonyCache::new(
        settings.ceremony_timeout_seconds,
        ChallengeGenerator::new(),
        clock.clone(),
    );
    let attestation = AttestationVerifier::with_trust_anchors(&settings, Vec::new());
    let orchestrator = CeremonyOrchestrator::from_parts(settings, cache, store.clone(), attestation);
    TestHarness {
        orchestrator,
        store,
        clock,
    }
}

/// Full registration: options, authenticator response, finish
///
/// # Errors
///
/// Returns whatever the orchestrator rejects
pub fn register(
    orchestrator: &CeremonyOrchestrator,
    authenticator: &mut SoftAuthenticator,
    identity: &Identity,
) -> Result<RegistrationOutcome, WebAuthnError> {
    let options = orchestrator.begin_registration(identity)?;
    let response = authenticator
        .make_credential(&options.challenge, &options.user.id)
        .map_err(|e| WebAuthnError::MalformedResponse(e.to_string()))?;
    orchestrator.finish_registration(&options.ceremony_id, &response, Deadline::none())
}

/// Full authentication: options, assertion, finish
///
/// # Errors
///
/// Returns whatever the orchestrator rejects
pub fn authenticate(
    orchestrator: &CeremonyOrchestrator,
    authenticator: &mut SoftAuthenticator,
    identity: Option<&Identity>,
) -> Result<AuthenticationOutcome, WebAuthnError> {
    let options = orchestrator.begin_authentication(identity)?;
    let response = authenticator
        .get_assertion(&options.challenge)
        .map_err(|e| WebAuthnError::MalformedResponse(e.to_string()))?;
    orchestrator.finish_authentication(&options.ceremony_id, &response, Deadline::none())
}
