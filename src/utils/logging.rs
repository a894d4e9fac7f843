// Centralized logging for ceremony outcomes and security events
use log::{debug, info, warn};

use crate::webauthn::{CeremonyKind, WebAuthnError};

/// Log target for events that suggest a forged or cloned authenticator
pub const SECURITY_TARGET: &str = "kioskpass::security";

pub struct LoggingHelper;

impl LoggingHelper {
    /// Log startup configuration
    pub fn log_startup(rp_id: &str, origins: &[String], attestation: &str, counter: &str) {
        info!("🔐 Relying party: {rp_id}");
        info!("🌐 Allowed origins: {origins:?}");
        info!("📜 Attestation policy: {attestation}, counter policy: {counter}");
    }

    /// Log a newly issued ceremony
    ///
    /// Identities are kiosk PINs and never reach the log.
    pub fn log_ceremony_started(kind: CeremonyKind, ceremony_id: &str, scoped: bool) {
        let scope = if scoped { "one identity" } else { "any credential" };
        debug!("Issued {kind} options for ceremony {ceremony_id} ({scope})");
    }

    /// Log a successful finish
    pub fn log_ceremony_completed(kind: CeremonyKind, ceremony_id: &str) {
        info!("✅ {kind} ceremony {ceremony_id} completed");
    }

    /// Log a failed finish; security events go to their own target at warn
    pub fn log_ceremony_failed(kind: CeremonyKind, ceremony_id: &str, error: &WebAuthnError) {
        if error.is_security_event() {
            warn!(
                target: SECURITY_TARGET,
                "🚨 {kind} ceremony {ceremony_id} rejected: {error} ({})",
                error.code()
            );
        } else if error.is_internal() {
            warn!("{kind} ceremony {ceremony_id} failed internally: {error}");
        } else if error.is_ceremony_lifecycle() {
            debug!("{kind} ceremony {ceremony_id} not usable: {error}");
        } else {
            info!("❌ {kind} ceremony {ceremony_id} failed: {error}");
        }
    }

    /// Log a purge sweep that removed entries
    pub fn log_purge(removed: usize, remaining: usize) {
        if removed > 0 {
            debug!("🧹 Purged {removed} stale ceremonies, {remaining} pending");
        }
    }
}
