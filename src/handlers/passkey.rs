//! Passkey request handlers
//!
//! Thin HTTP wrappers around the `CeremonyOrchestrator`: decode the wire
//! format, run finish calls on the blocking pool under a timeout, and map
//! engine errors to JSON responses.

use actix_web::{web, HttpResponse};
use serde_json::json;
use std::time::Duration;

use super::types::{
    AuthFinishRequest, AuthOptionsRequest, CreationOptionsJson, OptionsResponse,
    RegisterFinishRequest, RegisterOptionsRequest, RequestOptionsJson,
};
use crate::ceremony::{CeremonyOrchestrator, Deadline};
use crate::store::ImageStore;
use crate::utils::encoding;
use crate::webauthn::{CeremonyKind, Identity, WebAuthnError};

/// Convert `WebAuthnError` to HTTP response
///
/// Authentication failures share one generic body so a caller cannot tell
/// which check rejected it.
pub fn error_to_response(kind: CeremonyKind, error: &WebAuthnError) -> HttpResponse {
    let body = |code: &str, message: String| json!({ "error": code, "message": message });
    match error {
        WebAuthnError::CeremonyNotFound => {
            HttpResponse::NotFound().json(body(error.code(), error.to_string()))
        }
        WebAuthnError::CeremonyExpired => {
            HttpResponse::Gone().json(body(error.code(), error.to_string()))
        }
        WebAuthnError::CeremonyAlreadyConsumed | WebAuthnError::DuplicateCredentialId => {
            HttpResponse::Conflict().json(body(error.code(), error.to_string()))
        }
        WebAuthnError::CeremonyKindMismatch | WebAuthnError::MalformedResponse(_) => {
            HttpResponse::BadRequest().json(body("invalid_request", error.to_string()))
        }
        WebAuthnError::DeadlineExceeded => HttpResponse::ServiceUnavailable().json(body(
            "verification_timeout",
            "Verification did not finish in time".to_string(),
        )),
        e if e.is_internal() => HttpResponse::InternalServerError().json(body(
            "internal_error",
            "An internal error occurred".to_string(),
        )),
        _ => match kind {
            CeremonyKind::Authentication => HttpResponse::Unauthorized().json(body(
                "authentication_failed",
                "Authentication failed".to_string(),
            )),
            CeremonyKind::Registration => {
                HttpResponse::BadRequest().json(body("registration_failed", error.to_string()))
            }
        },
    }
}

/// Start passkey registration
pub async fn register_options(
    orchestrator: web::Data<CeremonyOrchestrator>,
    body: web::Json<RegisterOptionsRequest>,
) -> HttpResponse {
    let identity = Identity::new(body.into_inner().identity.trim());
    match orchestrator.begin_registration(&identity) {
        Ok(options) => {
            HttpResponse::Ok().json(OptionsResponse::<CreationOptionsJson>::from(options))
        }
        Err(e) => error_to_response(CeremonyKind::Registration, &e),
    }
}

/// Complete passkey registration
pub async fn register_finish(
    orchestrator: web::Data<CeremonyOrchestrator>,
    body: web::Json<RegisterFinishRequest>,
) -> HttpResponse {
    let kind = CeremonyKind::Registration;
    let RegisterFinishRequest {
        ceremony_id,
        credential,
    } = body.into_inner();
    let response = match credential.into_response() {
        Ok(response) => response,
        Err(e) => return error_to_response(kind, &e),
    };

    let result = run_finish(&orchestrator, move |orchestrator, deadline| {
        orchestrator.finish_registration(&ceremony_id, &response, deadline)
    })
    .await;

    match result {
        Ok(outcome) => HttpResponse::Ok().json(json!({
            "ok": true,
            "credential_id": encoding::encode(&outcome.credential_id),
            "identity": outcome.identity,
        })),
        Err(e) => error_to_response(kind, &e),
    }
}

/// Start passkey authentication, optionally for one identity
pub async fn auth_options(
    orchestrator: web::Data<CeremonyOrchestrator>,
    body: Option<web::Json<AuthOptionsRequest>>,
) -> HttpResponse {
    let identity = body
        .and_then(|body| body.into_inner().identity)
        .map(|identity| identity.trim().to_string())
        .filter(|identity| !identity.is_empty())
        .map(Identity::new);

    match orchestrator.begin_authentication(identity.as_ref()) {
        Ok(options) => {
            HttpResponse::Ok().json(OptionsResponse::<RequestOptionsJson>::from(options))
        }
        Err(WebAuthnError::UnknownCredential) => HttpResponse::NotFound().json(json!({
            "error": "unknown_identity",
            "message": "No passkey is registered for this identity"
        })),
        Err(e) => error_to_response(CeremonyKind::Authentication, &e),
    }
}

/// Complete passkey authentication and return the identity's image
pub async fn auth_finish(
    orchestrator: web::Data<CeremonyOrchestrator>,
    images: web::Data<dyn ImageStore>,
    body: web::Json<AuthFinishRequest>,
) -> HttpResponse {
    let kind = CeremonyKind::Authentication;
    let AuthFinishRequest {
        ceremony_id,
        assertion,
    } = body.into_inner();
    let response = match assertion.into_response() {
        Ok(response) => response,
        Err(e) => return error_to_response(kind, &e),
    };
    let ceremony_id = match ceremony_id {
        Some(ceremony_id) => ceremony_id,
        None => match orchestrator.ceremony_for_client_data(&response.client_data_json) {
            Ok(ceremony_id) => ceremony_id,
            Err(e) => return error_to_response(kind, &e),
        },
    };

    let result = run_finish(&orchestrator, move |orchestrator, deadline| {
        orchestrator.finish_authentication(&ceremony_id, &response, deadline)
    })
    .await;

    match result {
        Ok(outcome) => {
            let image_url = match images.get(&outcome.identity) {
                Ok(image) => image.map(|image| image.url),
                Err(e) => {
                    log::warn!("Image lookup failed after authentication: {e}");
                    None
                }
            };
            // `imageUrl` is what the kiosk login page reads
            HttpResponse::Ok().json(json!({
                "ok": true,
                "identity": outcome.identity,
                "image_url": image_url,
                "imageUrl": image_url,
            }))
        }
        Err(e) => error_to_response(kind, &e),
    }
}

/// Run a finish call on the blocking pool, bounded by the verification timeout
async fn run_finish<T, F>(
    orchestrator: &web::Data<CeremonyOrchestrator>,
    finish: F,
) -> Result<T, WebAuthnError>
where
    T: Send + 'static,
    F: FnOnce(&CeremonyOrchestrator, Deadline) -> Result<T, WebAuthnError> + Send + 'static,
{
    let timeout = Duration::from_millis(orchestrator.settings().verification_timeout_ms);
    let deadline = Deadline::after(timeout);
    let orchestrator = orchestrator.clone();

    let task = web::block(move || finish(orchestrator.get_ref(), deadline));
    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            log::error!("Blocking verification task failed: {e}");
            Err(WebAuthnError::Storage("verification task failed".to_string()))
        }
        Err(_) => Err(WebAuthnError::DeadlineExceeded),
    }
}
