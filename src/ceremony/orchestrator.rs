//! Ceremony orchestrator
//!
//! Drives registration and authentication from options to outcome:
//! `OptionsIssued -> Verifying -> Completed | Failed`, with `Expired` for
//! ceremonies nobody finished in time. Every finish consumes its ceremony,
//! whatever the result, so a ceremony id is never usable twice.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::cache::{CeremonyRequest, PendingCeremonyCache};
use super::clock::{Clock, SystemClock};
use crate::store::CredentialStore;
use crate::utils::encoding;
use crate::utils::logging::LoggingHelper;
use crate::webauthn::client_data::CollectedClientData;
use crate::webauthn::{
    AssertionResponse, AssertionVerifier, AttestationResponse, AttestationVerifier,
    AuthenticationOptions, AuthenticationOutcome, Ceremony, CeremonyKind, ChallengeGenerator,
    Identity, RegistrationOptions, RegistrationOutcome, RelyingParty, UserEntity, WebAuthnError,
    WebAuthnSettings, SUPPORTED_ALGORITHMS,
};

// Characters of the encoded user handle shown in the account picker
const USER_LABEL_CHARS: usize = 8;

/// Account picker label for a user handle
///
/// Shared kiosk authenticators list every discoverable credential, so the
/// label is derived from the random user handle and never from the identity.
#[must_use]
pub fn user_label(user_handle: &[u8]) -> String {
    let encoded = encoding::encode(user_handle);
    let short: String = encoded.chars().take(USER_LABEL_CHARS).collect();
    format!("Kiosk user {short}")
}

/// Point in time after which a finish call gives up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// No deadline
    #[must_use]
    pub fn none() -> Self {
        Self(None)
    }

    #[must_use]
    pub fn at(instant: Instant) -> Self {
        Self(Some(instant))
    }

    #[must_use]
    pub fn after(duration: Duration) -> Self {
        Self(Instant::now().checked_add(duration))
    }

    /// # Errors
    ///
    /// Returns `DeadlineExceeded` once the deadline has passed
    pub fn check(&self) -> Result<(), WebAuthnError> {
        match self.0 {
            Some(deadline) if Instant::now() >= deadline => Err(WebAuthnError::DeadlineExceeded),
            _ => Ok(()),
        }
    }
}

/// Settles a consumed ceremony; one dropped without a result, e.g. by a
/// panicking verifier, is recorded as failed so the purge can reclaim it
struct SettleGuard<'a> {
    cache: &'a PendingCeremonyCache,
    ceremony_id: &'a str,
    settled: bool,
}

impl<'a> SettleGuard<'a> {
    fn new(cache: &'a PendingCeremonyCache, ceremony_id: &'a str) -> Self {
        Self {
            cache,
            ceremony_id,
            settled: false,
        }
    }

    fn settle(mut self, kind: CeremonyKind, result: Result<(), &WebAuthnError>) {
        self.cache.settle(self.ceremony_id, result.is_ok());
        self.settled = true;
        match result {
            Ok(()) => LoggingHelper::log_ceremony_completed(kind, self.ceremony_id),
            Err(e) => LoggingHelper::log_ceremony_failed(kind, self.ceremony_id, e),
        }
    }
}

impl Drop for SettleGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            log::warn!("Ceremony {} abandoned during verification", self.ceremony_id);
            self.cache.settle(self.ceremony_id, false);
        }
    }
}

pub struct CeremonyOrchestrator {
    settings: WebAuthnSettings,
    cache: PendingCeremonyCache,
    store: Arc<dyn CredentialStore>,
    attestation: AttestationVerifier,
    assertion: AssertionVerifier,
}

impl CeremonyOrchestrator {
    /// Production wiring: system clock, OS randomness, trust anchors from disk
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if a trust anchor cannot be loaded
    pub fn new(
        settings: WebAuthnSettings,
        store: Arc<dyn CredentialStore>,
    ) -> Result<Self, WebAuthnError> {
        let attestation = AttestationVerifier::new(&settings)?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let cache = PendingCeremonyCache::new(
            settings.ceremony_timeout_seconds,
            ChallengeGenerator::new(),
            clock,
        );
        Ok(Self::from_parts(settings, cache, store, attestation))
    }

    #[must_use]
    pub fn from_parts(
        settings: WebAuthnSettings,
        cache: PendingCeremonyCache,
        store: Arc<dyn CredentialStore>,
        attestation: AttestationVerifier,
    ) -> Self {
        let assertion = AssertionVerifier::new(&settings);
        Self {
            settings,
            cache,
            store,
            attestation,
            assertion,
        }
    }

    #[must_use]
    pub fn settings(&self) -> &WebAuthnSettings {
        &self.settings
    }

    #[must_use]
    pub fn cache(&self) -> &PendingCeremonyCache {
        &self.cache
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    /// Issue registration options for `identity`
    ///
    /// # Errors
    ///
    /// Returns `MalformedResponse` for an empty identity, `EntropyUnavailable`
    /// or `Storage`
    pub fn begin_registration(
        &self,
        identity: &Identity,
    ) -> Result<RegistrationOptions, WebAuthnError> {
        if identity.as_str().trim().is_empty() {
            return Err(WebAuthnError::MalformedResponse(
                "identity must not be empty".to_string(),
            ));
        }

        let existing = self.store.find_all_by_identity(identity)?;
        let user_handle = match self.store.user_handle_for(identity)? {
            Some(user_handle) => user_handle,
            None => self.cache.generator().user_handle()?,
        };
        let label = user_label(&user_handle);
        let exclude_credentials: Vec<Vec<u8>> =
            existing.into_iter().map(|c| c.credential_id).collect();

        let ceremony = self.cache.begin_with(CeremonyRequest {
            kind: CeremonyKind::Registration,
            identity: Some(identity.clone()),
            user_handle: Some(user_handle.clone()),
            allowed_credentials: Vec::new(),
        })?;
        LoggingHelper::log_ceremony_started(CeremonyKind::Registration, &ceremony.id, true);

        Ok(RegistrationOptions {
            ceremony_id: ceremony.id,
            challenge: ceremony.challenge.as_bytes().to_vec(),
            rp: RelyingParty {
                id: self.settings.rp_id.clone(),
                name: self.settings.rp_name.clone(),
            },
            user: UserEntity {
                id: user_handle,
                name: label.clone(),
                display_name: label,
            },
            algorithms: SUPPORTED_ALGORITHMS.to_vec(),
            timeout_ms: self.settings.ceremony_timeout_ms(),
            attestation: self.settings.attestation_conveyance(),
            user_verification: self.settings.user_verification().to_string(),
            authenticator_attachment: self.settings.authenticator_attachment.clone(),
            exclude_credentials,
        })
    }

    /// Issue authentication options, optionally restricted to one identity
    ///
    /// # Errors
    ///
    /// Returns `UnknownCredential` if `identity` has no credentials,
    /// `EntropyUnavailable` or `Storage`
    pub fn begin_authentication(
        &self,
        identity: Option<&Identity>,
    ) -> Result<AuthenticationOptions, WebAuthnError> {
        let allow_credentials = match identity {
            Some(identity) => {
                let ids: Vec<Vec<u8>> = self
                    .store
                    .find_all_by_identity(identity)?
                    .into_iter()
                    .map(|c| c.credential_id)
                    .collect();
                // An empty allow list would mean "any credential"
                if ids.is_empty() {
                    return Err(WebAuthnError::UnknownCredential);
                }
                ids
            }
            None => Vec::new(),
        };

        let ceremony = self.cache.begin_with(CeremonyRequest {
            kind: CeremonyKind::Authentication,
            identity: identity.cloned(),
            user_handle: None,
            allowed_credentials: allow_credentials.clone(),
        })?;
        LoggingHelper::log_ceremony_started(
            CeremonyKind::Authentication,
            &ceremony.id,
            identity.is_some(),
        );

        Ok(AuthenticationOptions {
            ceremony_id: ceremony.id,
            challenge: ceremony.challenge.as_bytes().to_vec(),
            rp_id: self.settings.rp_id.clone(),
            timeout_ms: self.settings.ceremony_timeout_ms(),
            user_verification: self.settings.user_verification().to_string(),
            allow_credentials,
        })
    }

    /// Verify a registration response and store the new credential
    ///
    /// # Errors
    ///
    /// Returns ceremony lifecycle errors, any attestation verification error,
    /// `DuplicateCredentialId`, `Storage` or `DeadlineExceeded`
    pub fn finish_registration(
        &self,
        ceremony_id: &str,
        response: &AttestationResponse,
        deadline: Deadline,
    ) -> Result<RegistrationOutcome, WebAuthnError> {
        let kind = CeremonyKind::Registration;
        let ceremony = self.consume(kind, ceremony_id, deadline)?;
        let guard = SettleGuard::new(&self.cache, &ceremony.id);

        let result = self.complete_registration(&ceremony, response, deadline);
        guard.settle(kind, result.as_ref().map(|_| ()));
        result
    }

    /// Verify an assertion and commit the new signature counter
    ///
    /// # Errors
    ///
    /// Returns ceremony lifecycle errors, `UnknownCredential`, any assertion
    /// verification error, `CounterRegression` from the store, `Storage` or
    /// `DeadlineExceeded`
    pub fn finish_authentication(
        &self,
        ceremony_id: &str,
        response: &AssertionResponse,
        deadline: Deadline,
    ) -> Result<AuthenticationOutcome, WebAuthnError> {
        let kind = CeremonyKind::Authentication;
        let ceremony = self.consume(kind, ceremony_id, deadline)?;
        let guard = SettleGuard::new(&self.cache, &ceremony.id);

        let result = self.complete_authentication(&ceremony, response, deadline);
        guard.settle(kind, result.as_ref().map(|_| ()));
        result
    }

    /// Id of the ceremony whose challenge the response signed
    ///
    /// For clients that finish without echoing the ceremony id; the
    /// challenge is unguessable and still consumed only once.
    ///
    /// # Errors
    ///
    /// Returns `MalformedResponse` if the client data cannot be read, or
    /// `CeremonyNotFound` if no ceremony issued that challenge
    pub fn ceremony_for_client_data(
        &self,
        client_data_json: &[u8],
    ) -> Result<String, WebAuthnError> {
        let client_data = CollectedClientData::parse(client_data_json)?;
        let challenge = encoding::decode(&client_data.challenge).map_err(|_| {
            WebAuthnError::MalformedResponse("challenge is not base64url".to_string())
        })?;
        self.cache
            .find_by_challenge(&challenge)
            .ok_or(WebAuthnError::CeremonyNotFound)
    }

    /// Drop stale ceremonies; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let removed = self.cache.purge_expired();
        LoggingHelper::log_purge(removed, self.cache.len());
        removed
    }

    fn consume(
        &self,
        kind: CeremonyKind,
        ceremony_id: &str,
        deadline: Deadline,
    ) -> Result<Ceremony, WebAuthnError> {
        deadline
            .check()
            .and_then(|()| self.cache.consume(ceremony_id))
            .inspect_err(|e| LoggingHelper::log_ceremony_failed(kind, ceremony_id, e))
    }

    fn complete_registration(
        &self,
        ceremony: &Ceremony,
        response: &AttestationResponse,
        deadline: Deadline,
    ) -> Result<RegistrationOutcome, WebAuthnError> {
        if ceremony.kind != CeremonyKind::Registration {
            return Err(WebAuthnError::CeremonyKindMismatch);
        }

        let credential = self
            .attestation
            .verify(ceremony, response, self.cache.now())?;
        deadline.check()?;

        let outcome = RegistrationOutcome {
            identity: credential.owner.clone(),
            credential_id: credential.credential_id.clone(),
            signature_counter: credential.signature_counter,
        };
        self.store.insert(credential)?;
        Ok(outcome)
    }

    fn complete_authentication(
        &self,
        ceremony: &Ceremony,
        response: &AssertionResponse,
        deadline: Deadline,
    ) -> Result<AuthenticationOutcome, WebAuthnError> {
        if ceremony.kind != CeremonyKind::Authentication {
            return Err(WebAuthnError::CeremonyKindMismatch);
        }
        if !ceremony.allowed_credentials.is_empty()
            && !ceremony.allowed_credentials.contains(&response.credential_id)
        {
            return Err(WebAuthnError::UnknownCredential);
        }

        let credential = self.store.find(&response.credential_id)?;
        if let Some(identity) = &ceremony.identity {
            if &credential.owner != identity {
                return Err(WebAuthnError::UnknownCredential);
            }
        }

        let outcome = self.assertion.verify(ceremony, response, &credential)?;
        deadline.check()?;

        self.store
            .update_counter(&credential.credential_id, outcome.signature_counter)?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ceremony::{CeremonyState, ManualClock};
    use crate::store::StoreError;
    use crate::testing::fixtures::{orchestrator, register, test_webauthn_settings};
    use crate::testing::SoftAuthenticator;
    use crate::webauthn::Credential;
    use chrono::Duration as ChronoDuration;
    use std::panic::{self, AssertUnwindSafe};

    #[test]
    fn test_registration_options_reuse_user_handle_and_exclude_existing() {
        let harness = orchestrator();
        let identity = Identity::new("1234");
        let mut authenticator = SoftAuthenticator::es256();
        register(&harness.orchestrator, &mut authenticator, &identity).unwrap();

        let options = harness.orchestrator.begin_registration(&identity).unwrap();
        let stored = harness.store.find(authenticator.credential_id()).unwrap();
        assert_eq!(options.user.id, stored.user_handle);
        assert_eq!(options.exclude_credentials, vec![stored.credential_id]);
        assert_eq!(options.algorithms, vec![-7, -8, -257]);
        assert_eq!(options.timeout_ms, 60_000);
    }

    #[test]
    fn test_user_entity_never_carries_the_identity() {
        let harness = orchestrator();
        let identity = Identity::new("4821");
        let options = harness.orchestrator.begin_registration(&identity).unwrap();

        assert_ne!(options.user.name, identity.as_str());
        assert_ne!(options.user.display_name, identity.as_str());
        assert_eq!(options.user.name, user_label(&options.user.id));
        assert!(options.user.name.starts_with("Kiosk user "));
    }

    struct PanickingStore;

    impl CredentialStore for PanickingStore {
        fn find(&self, _credential_id: &[u8]) -> Result<Credential, StoreError> {
            panic!("store unavailable")
        }

        fn find_all_by_identity(&self, _identity: &Identity) -> Result<Vec<Credential>, StoreError> {
            Ok(Vec::new())
        }

        fn insert(&self, _credential: Credential) -> Result<(), StoreError> {
            Ok(())
        }

        fn update_counter(&self, _credential_id: &[u8], _new_counter: u32) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[test]
    fn test_panicking_verification_still_settles_the_ceremony() {
        let settings = test_webauthn_settings();
        let clock = Arc::new(ManualClock::default());
        let cache = PendingCeremonyCache::new(60, ChallengeGenerator::new(), clock.clone());
        let attestation = AttestationVerifier::with_trust_anchors(&settings, Vec::new());
        let orchestrator =
            CeremonyOrchestrator::from_parts(settings, cache, Arc::new(PanickingStore), attestation);

        let options = orchestrator.begin_authentication(None).unwrap();
        let response = SoftAuthenticator::es256()
            .get_assertion(&options.challenge)
            .unwrap();
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            orchestrator.finish_authentication(&options.ceremony_id, &response, Deadline::none())
        }));
        assert!(result.is_err());
        assert_eq!(
            orchestrator.cache().state(&options.ceremony_id),
            Some(CeremonyState::Failed)
        );

        clock.advance(ChronoDuration::seconds(121));
        assert_eq!(orchestrator.purge_expired(), 1);
    }

    #[test]
    fn test_ceremony_resolves_from_signed_challenge() {
        let harness = orchestrator();
        let identity = Identity::new("5555");
        let mut authenticator = SoftAuthenticator::es256();
        register(&harness.orchestrator, &mut authenticator, &identity).unwrap();

        let options = harness.orchestrator.begin_authentication(None).unwrap();
        let response = authenticator.get_assertion(&options.challenge).unwrap();
        let ceremony_id = harness
            .orchestrator
            .ceremony_for_client_data(&response.client_data_json)
            .unwrap();
        assert_eq!(ceremony_id, options.ceremony_id);

        let outcome = harness
            .orchestrator
            .finish_authentication(&ceremony_id, &response, Deadline::none())
            .unwrap();
        assert_eq!(outcome.identity, identity);

        let stranger = SoftAuthenticator::es256().get_assertion(&[7; 32]).unwrap();
        assert_eq!(
            harness
                .orchestrator
                .ceremony_for_client_data(&stranger.client_data_json)
                .unwrap_err(),
            WebAuthnError::CeremonyNotFound
        );
        assert!(matches!(
            harness.orchestrator.ceremony_for_client_data(b"not json"),
            Err(WebAuthnError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_authentication_for_unknown_identity_is_refused() {
        let harness = orchestrator();
        assert_eq!(
            harness
                .orchestrator
                .begin_authentication(Some(&Identity::new("nobody")))
                .unwrap_err(),
            WebAuthnError::UnknownCredential
        );
    }

    #[test]
    fn test_kind_mismatch_consumes_the_ceremony() {
        let harness = orchestrator();
        let mut authenticator = SoftAuthenticator::es256();
        let options = harness
            .orchestrator
            .begin_authentication(None)
            .unwrap();
        let response = authenticator
            .make_credential(&options.challenge, &[1; 16])
            .unwrap();

        assert_eq!(
            harness
                .orchestrator
                .finish_registration(&options.ceremony_id, &response, Deadline::none())
                .unwrap_err(),
            WebAuthnError::CeremonyKindMismatch
        );
        assert_eq!(
            harness
                .orchestrator
                .finish_registration(&options.ceremony_id, &response, Deadline::none())
                .unwrap_err(),
            WebAuthnError::CeremonyAlreadyConsumed
        );
    }

    #[test]
    fn test_credential_outside_allow_list_is_unknown() {
        let harness = orchestrator();
        let mut alice = SoftAuthenticator::es256();
        let mut bob = SoftAuthenticator::es256();
        register(&harness.orchestrator, &mut alice, &Identity::new("alice")).unwrap();
        register(&harness.orchestrator, &mut bob, &Identity::new("bob")).unwrap();

        let options = harness
            .orchestrator
            .begin_authentication(Some(&Identity::new("alice")))
            .unwrap();
        let response = bob.get_assertion(&options.challenge).unwrap();
        assert_eq!(
            harness
                .orchestrator
                .finish_authentication(&options.ceremony_id, &response, Deadline::none())
                .unwrap_err(),
            WebAuthnError::UnknownCredential
        );
    }

    #[test]
    fn test_passed_deadline_leaves_ceremony_usable() {
        let harness = orchestrator();
        let identity = Identity::new("1234");
        let mut authenticator = SoftAuthenticator::es256();
        let options = harness.orchestrator.begin_registration(&identity).unwrap();
        let response = authenticator
            .make_credential(&options.challenge, &options.user.id)
            .unwrap();

        let expired = Deadline::at(Instant::now());
        assert_eq!(
            harness
                .orchestrator
                .finish_registration(&options.ceremony_id, &response, expired)
                .unwrap_err(),
            WebAuthnError::DeadlineExceeded
        );
        assert!(harness
            .orchestrator
            .finish_registration(&options.ceremony_id, &response, Deadline::none())
            .is_ok());
    }

    #[test]
    fn test_purge_expired_drops_stale_ceremonies() {
        let harness = orchestrator();
        harness.orchestrator.begin_authentication(None).unwrap();
        harness.clock.advance(ChronoDuration::seconds(121));
        assert_eq!(harness.orchestrator.purge_expired(), 1);
        assert!(harness.orchestrator.cache().is_empty());
    }

    #[test]
    fn test_deadline_helpers() {
        assert!(Deadline::none().check().is_ok());
        assert!(Deadline::after(Duration::from_secs(60)).check().is_ok());
        assert_eq!(
            Deadline::at(Instant::now()).check().unwrap_err(),
            WebAuthnError::DeadlineExceeded
        );
    }
}
