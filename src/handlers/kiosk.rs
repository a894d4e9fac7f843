//! Kiosk enrolment, PIN fallback and image serving

use actix_web::{web, HttpResponse};
use serde_json::json;

use super::types::CreateUserRequest;
use crate::store::{content_type_for, ImageStore, ImageStoreError};
use crate::utils::encoding;
use crate::webauthn::Identity;

/// Split a `data:<mime>;base64,<payload>` URL; bare base64 has no mime type
fn parse_image_payload(image: &str) -> Result<(Option<String>, Vec<u8>), String> {
    let (content_type, payload) = match image.strip_prefix("data:") {
        Some(rest) => {
            let (meta, payload) = rest
                .split_once(',')
                .ok_or_else(|| "data URL has no payload".to_string())?;
            let mime = meta
                .strip_suffix(";base64")
                .ok_or_else(|| "data URL must be base64 encoded".to_string())?;
            (Some(mime.to_string()).filter(|m| !m.is_empty()), payload)
        }
        None => (None, image),
    };
    let bytes = encoding::decode(payload.trim()).map_err(|_| "image is not valid base64".to_string())?;
    Ok((content_type, bytes))
}

fn image_error_response(error: &ImageStoreError) -> HttpResponse {
    match error {
        ImageStoreError::Empty => HttpResponse::BadRequest().json(json!({
            "error": "invalid_request",
            "message": error.to_string()
        })),
        ImageStoreError::TooLarge { .. } => HttpResponse::PayloadTooLarge().json(json!({
            "error": "image_too_large",
            "message": error.to_string()
        })),
        ImageStoreError::InvalidName => HttpResponse::NotFound().json(json!({
            "error": "not_found",
            "message": "Image not found"
        })),
        ImageStoreError::Io(e) => {
            log::error!("Image storage failed: {e}");
            HttpResponse::InternalServerError().json(json!({
                "error": "internal_error",
                "message": "An internal error occurred"
            }))
        }
    }
}

/// Enrol an identity (PIN) with its image
pub async fn create_user(
    images: web::Data<dyn ImageStore>,
    body: web::Json<CreateUserRequest>,
) -> HttpResponse {
    let CreateUserRequest { identity, image } = body.into_inner();
    let identity = identity.trim();
    if identity.is_empty() {
        return HttpResponse::BadRequest().json(json!({
            "error": "invalid_request",
            "message": "identity is required"
        }));
    }

    let (content_type, bytes) = match parse_image_payload(&image) {
        Ok(parsed) => parsed,
        Err(message) => {
            return HttpResponse::BadRequest().json(json!({
                "error": "invalid_request",
                "message": message
            }))
        }
    };

    let identity = Identity::new(identity);
    match images.put(&identity, &bytes, content_type.as_deref()) {
        Ok(image) => {
            log::info!("Enrolled image for a kiosk identity ({} bytes)", bytes.len());
            HttpResponse::Created().json(json!({
                "ok": true,
                "identity": identity,
                "image_url": image.url,
            }))
        }
        Err(e) => image_error_response(&e),
    }
}

/// PIN fallback: look up the image for a PIN without a passkey
pub async fn pin_lookup(
    images: web::Data<dyn ImageStore>,
    path: web::Path<String>,
) -> HttpResponse {
    let identity = Identity::new(path.into_inner().trim());
    match images.get(&identity) {
        Ok(Some(image)) => HttpResponse::Ok().json(json!({
            "ok": true,
            "image_url": image.url,
        })),
        Ok(None) => HttpResponse::NotFound().json(json!({
            "ok": false,
            "error": "unknown_identity",
            "message": "No image is registered for this PIN"
        })),
        Err(e) => image_error_response(&e),
    }
}

/// Serve a stored image by name
pub async fn serve_image(
    images: web::Data<dyn ImageStore>,
    path: web::Path<String>,
) -> HttpResponse {
    let name = path.into_inner();
    match images.read(&name) {
        Ok(Some(bytes)) => HttpResponse::Ok()
            .content_type(content_type_for(&name))
            .body(bytes),
        Ok(None) => {
            log::debug!("Image not found: {name}");
            HttpResponse::NotFound().json(json!({
                "error": "not_found",
                "message": "Image not found"
            }))
        }
        Err(e) => image_error_response(&e),
    }
}
