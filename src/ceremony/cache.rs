//! Pending ceremony cache
//!
//! Binds each issued challenge to one ceremony and hands it out exactly once.
//! The table sits behind a single mutex that is held only for map access;
//! challenge generation and verification happen outside it.
//!
//! Finished and expired entries are kept for one extra timeout period before
//! being purged, so a late finish still reports `CeremonyExpired` or
//! `CeremonyAlreadyConsumed` instead of `CeremonyNotFound`.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use super::clock::Clock;
use crate::webauthn::{Ceremony, CeremonyKind, ChallengeGenerator, Identity, WebAuthnError};

// Keeps `expires_at + timeout` far from the end of the calendar
const MAX_TIMEOUT_SECONDS: i64 = 86_400;

/// Lifecycle of a cached ceremony
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CeremonyState {
    OptionsIssued,
    /// Consumed; verification in progress
    Verifying,
    Completed,
    Failed,
    Expired,
}

impl fmt::Display for CeremonyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::OptionsIssued => "options_issued",
            Self::Verifying => "verifying",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Expired => "expired",
        };
        f.write_str(name)
    }
}

/// Parameters for a new ceremony
#[derive(Debug, Clone)]
pub struct CeremonyRequest {
    pub kind: CeremonyKind,
    pub identity: Option<Identity>,
    pub user_handle: Option<Vec<u8>>,
    pub allowed_credentials: Vec<Vec<u8>>,
}

impl CeremonyRequest {
    #[must_use]
    pub fn new(kind: CeremonyKind, identity: Option<Identity>) -> Self {
        Self {
            kind,
            identity,
            user_handle: None,
            allowed_credentials: Vec::new(),
        }
    }
}

struct Entry {
    ceremony: Ceremony,
    state: CeremonyState,
    expires_at: DateTime<Utc>,
}

pub struct PendingCeremonyCache {
    entries: Mutex<HashMap<String, Entry>>,
    generator: ChallengeGenerator,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl PendingCeremonyCache {
    #[must_use]
    pub fn new(timeout_seconds: u64, generator: ChallengeGenerator, clock: Arc<dyn Clock>) -> Self {
        let seconds = i64::try_from(timeout_seconds)
            .unwrap_or(MAX_TIMEOUT_SECONDS)
            .min(MAX_TIMEOUT_SECONDS);
        Self {
            entries: Mutex::new(HashMap::new()),
            generator,
            clock,
            timeout: Duration::seconds(seconds),
        }
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Generator shared with the orchestrator for user handles
    #[must_use]
    pub fn generator(&self) -> &ChallengeGenerator {
        &self.generator
    }

    /// Start a ceremony with only a kind and identity
    ///
    /// # Errors
    ///
    /// Returns `EntropyUnavailable` if no challenge can be generated
    pub fn begin(
        &self,
        kind: CeremonyKind,
        identity: Option<Identity>,
    ) -> Result<Ceremony, WebAuthnError> {
        self.begin_with(CeremonyRequest::new(kind, identity))
    }

    /// Start a ceremony and bind a fresh challenge to it
    ///
    /// # Errors
    ///
    /// Returns `EntropyUnavailable` if no challenge can be generated
    pub fn begin_with(&self, request: CeremonyRequest) -> Result<Ceremony, WebAuthnError> {
        let now = self.clock.now();
        let expires_at = now + self.timeout;
        let challenge = self.generator.generate(expires_at)?;

        let ceremony = Ceremony {
            id: Uuid::new_v4().to_string(),
            kind: request.kind,
            challenge,
            identity: request.identity,
            user_handle: request.user_handle,
            allowed_credentials: request.allowed_credentials,
            created_at: now,
            consumed: false,
        };

        let mut entries = self.lock();
        let purged = Self::purge_locked(&mut entries, now, self.timeout);
        if purged > 0 {
            log::debug!("Purged {purged} stale ceremonies");
        }
        entries.insert(
            ceremony.id.clone(),
            Entry {
                ceremony: ceremony.clone(),
                state: CeremonyState::OptionsIssued,
                expires_at,
            },
        );
        Ok(ceremony)
    }

    /// Take a ceremony for verification; succeeds at most once per id
    ///
    /// # Errors
    ///
    /// Returns `CeremonyNotFound`, `CeremonyExpired` or
    /// `CeremonyAlreadyConsumed`
    pub fn consume(&self, ceremony_id: &str) -> Result<Ceremony, WebAuthnError> {
        let now = self.clock.now();
        let mut entries = self.lock();
        let entry = entries
            .get_mut(ceremony_id)
            .ok_or(WebAuthnError::CeremonyNotFound)?;

        match entry.state {
            CeremonyState::OptionsIssued => {}
            CeremonyState::Expired => return Err(WebAuthnError::CeremonyExpired),
            _ => return Err(WebAuthnError::CeremonyAlreadyConsumed),
        }
        if now > entry.expires_at {
            entry.state = CeremonyState::Expired;
            return Err(WebAuthnError::CeremonyExpired);
        }

        entry.state = CeremonyState::Verifying;
        entry.ceremony.consumed = true;
        Ok(entry.ceremony.clone())
    }

    /// Record the outcome of a consumed ceremony
    pub fn settle(&self, ceremony_id: &str, succeeded: bool) {
        let mut entries = self.lock();
        if let Some(entry) = entries.get_mut(ceremony_id) {
            if entry.state == CeremonyState::Verifying {
                entry.state = if succeeded {
                    CeremonyState::Completed
                } else {
                    CeremonyState::Failed
                };
            }
        }
    }

    /// Id of the ceremony that issued `challenge`, whatever its state
    #[must_use]
    pub fn find_by_challenge(&self, challenge: &[u8]) -> Option<String> {
        self.lock()
            .iter()
            .find(|(_, entry)| entry.ceremony.challenge.as_bytes() == challenge)
            .map(|(id, _)| id.clone())
    }

    #[must_use]
    pub fn state(&self, ceremony_id: &str) -> Option<CeremonyState> {
        let now = self.clock.now();
        self.lock().get(ceremony_id).map(|entry| {
            if entry.state == CeremonyState::OptionsIssued && now > entry.expires_at {
                CeremonyState::Expired
            } else {
                entry.state
            }
        })
    }

    /// Drop entries whose grace period is over; returns how many were dropped
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        Self::purge_locked(&mut self.lock(), now, self.timeout)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn purge_locked(
        entries: &mut HashMap<String, Entry>,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> usize {
        let before = entries.len();
        entries.retain(|_, entry| {
            entry.state == CeremonyState::Verifying || now <= entry.expires_at + grace
        });
        before - entries.len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ceremony::clock::ManualClock;
    use std::sync::Barrier;
    use std::thread;

    fn cache() -> (PendingCeremonyCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let cache = PendingCeremonyCache::new(60, ChallengeGenerator::new(), clock.clone());
        (cache, clock)
    }

    #[test]
    fn test_find_by_challenge() {
        let (cache, _) = cache();
        let first = cache.begin(CeremonyKind::Authentication, None).unwrap();
        let second = cache.begin(CeremonyKind::Authentication, None).unwrap();

        assert_eq!(
            cache.find_by_challenge(second.challenge.as_bytes()),
            Some(second.id)
        );
        assert_eq!(
            cache.find_by_challenge(first.challenge.as_bytes()),
            Some(first.id)
        );
        assert_eq!(cache.find_by_challenge(&[0; 32]), None);
    }

    #[test]
    fn test_consume_once() {
        let (cache, _) = cache();
        let ceremony = cache
            .begin(CeremonyKind::Registration, Some(Identity::new("1234")))
            .unwrap();
        assert_eq!(cache.state(&ceremony.id), Some(CeremonyState::OptionsIssued));

        let consumed = cache.consume(&ceremony.id).unwrap();
        assert!(consumed.consumed);
        assert_eq!(consumed.challenge, ceremony.challenge);
        assert_eq!(cache.state(&ceremony.id), Some(CeremonyState::Verifying));

        assert_eq!(
            cache.consume(&ceremony.id).unwrap_err(),
            WebAuthnError::CeremonyAlreadyConsumed
        );

        cache.settle(&ceremony.id, true);
        assert_eq!(cache.state(&ceremony.id), Some(CeremonyState::Completed));
        assert_eq!(
            cache.consume(&ceremony.id).unwrap_err(),
            WebAuthnError::CeremonyAlreadyConsumed
        );
    }

    #[test]
    fn test_unknown_ceremony() {
        let (cache, _) = cache();
        assert_eq!(
            cache.consume("no-such-id").unwrap_err(),
            WebAuthnError::CeremonyNotFound
        );
    }

    #[test]
    fn test_expiry_boundary() {
        let (cache, clock) = cache();
        let first = cache.begin(CeremonyKind::Authentication, None).unwrap();
        let second = cache.begin(CeremonyKind::Authentication, None).unwrap();

        clock.advance(Duration::seconds(60));
        assert!(cache.consume(&first.id).is_ok(), "exactly at the deadline is still valid");

        clock.advance(Duration::milliseconds(1));
        assert_eq!(
            cache.consume(&second.id).unwrap_err(),
            WebAuthnError::CeremonyExpired
        );
        assert_eq!(cache.state(&second.id), Some(CeremonyState::Expired));
        assert_eq!(
            cache.consume(&second.id).unwrap_err(),
            WebAuthnError::CeremonyExpired
        );
    }

    #[test]
    fn test_purge_keeps_recent_and_in_flight_entries() {
        let (cache, clock) = cache();
        let stale = cache.begin(CeremonyKind::Authentication, None).unwrap();
        let in_flight = cache.begin(CeremonyKind::Authentication, None).unwrap();
        cache.consume(&in_flight.id).unwrap();

        clock.advance(Duration::seconds(90));
        assert_eq!(cache.purge_expired(), 0, "grace period not over yet");

        clock.advance(Duration::seconds(31));
        let fresh = cache.begin(CeremonyKind::Authentication, None).unwrap();
        assert_eq!(cache.state(&stale.id), None);
        assert_eq!(cache.state(&in_flight.id), Some(CeremonyState::Verifying));
        assert_eq!(cache.state(&fresh.id), Some(CeremonyState::OptionsIssued));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_failed_ceremony_cannot_be_retried() {
        let (cache, _) = cache();
        let ceremony = cache.begin(CeremonyKind::Authentication, None).unwrap();
        cache.consume(&ceremony.id).unwrap();
        cache.settle(&ceremony.id, false);
        assert_eq!(cache.state(&ceremony.id), Some(CeremonyState::Failed));
        assert_eq!(
            cache.consume(&ceremony.id).unwrap_err(),
            WebAuthnError::CeremonyAlreadyConsumed
        );
    }

    #[test]
    fn test_concurrent_consume_has_one_winner() {
        let (cache, _) = cache();
        let cache = Arc::new(cache);
        let ceremony = cache.begin(CeremonyKind::Authentication, None).unwrap();
        let threads = 16;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                let id = ceremony.id.clone();
                thread::spawn(move || {
                    barrier.wait();
                    cache.consume(&id)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| *e == WebAuthnError::CeremonyAlreadyConsumed));
    }
}
