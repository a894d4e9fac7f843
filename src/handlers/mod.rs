// HTTP request handlers for the kiosk
pub mod health;
pub mod kiosk;
pub mod passkey;
pub mod types;

use actix_web::{error, web, HttpResponse};
use serde_json::json;

use crate::settings::KioskSettings;

pub use health::ping;
pub use kiosk::{create_user, pin_lookup, serve_image};
pub use passkey::{auth_finish, auth_options, error_to_response, register_finish, register_options};

// Room for base64 expansion of an image plus the surrounding JSON
const JSON_OVERHEAD_BYTES: usize = 64 * 1024;

/// JSON extractor limits sized for the largest accepted image
#[must_use]
pub fn json_config(settings: &KioskSettings) -> web::JsonConfig {
    let limit = settings
        .storage
        .max_image_bytes
        .saturating_mul(4)
        .div_ceil(3)
        .saturating_add(JSON_OVERHEAD_BYTES);
    web::JsonConfig::default()
        .limit(limit)
        .error_handler(|err, _req| {
            let response = match &err {
                error::JsonPayloadError::Overflow { .. }
                | error::JsonPayloadError::OverflowKnownLength { .. } => {
                    HttpResponse::PayloadTooLarge().json(json!({
                        "error": "payload_too_large",
                        "message": err.to_string()
                    }))
                }
                _ => HttpResponse::BadRequest().json(json!({
                    "error": "invalid_request",
                    "message": err.to_string()
                })),
            };
            error::InternalError::from_response(err, response).into()
        })
}

/// Register every kiosk route
///
/// Expects `web::Data<CeremonyOrchestrator>` and `web::Data<dyn ImageStore>`
/// to be registered on the `App`.
pub fn configure_services(cfg: &mut web::ServiceConfig, settings: &KioskSettings) {
    cfg.app_data(json_config(settings))
        // Passkey ceremonies
        .route("/webauthn/register/options", web::post().to(register_options))
        .route("/webauthn/register/finish", web::post().to(register_finish))
        .route("/webauthn/auth/options", web::post().to(auth_options))
        // Identity-less (discoverable) options for the kiosk login page
        .route("/webauthn/auth/options", web::get().to(auth_options))
        .route("/webauthn/auth/finish", web::post().to(auth_finish))
        // Kiosk enrolment and PIN fallback
        .route("/api/users", web::post().to(create_user))
        .route("/api/pin/{pin}", web::get().to(pin_lookup))
        .route("/images/{name}", web::get().to(serve_image))
        // Health endpoint
        .route("/ping", web::get().to(ping));
}
