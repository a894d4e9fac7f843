#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

use actix_web::{
    middleware::{Compress, Logger},
    web, App, HttpServer,
};
use std::sync::Arc;
use std::time::Duration;

use kioskpass::{
    configure_services, utils::logging::LoggingHelper, CeremonyOrchestrator, CredentialStore,
    FsImageStore, ImageStore, KioskSettings, MemoryCredentialStore,
};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Load configuration from Settings.toml and environment variables
    // This also loads .env file and initializes the logger
    let settings = KioskSettings::load()
        .map_err(|e| std::io::Error::other(format!("Failed to load settings: {e}")))?;
    settings
        .validate()
        .map_err(|e| std::io::Error::other(format!("Invalid settings: {e}")))?;

    let store: Arc<dyn CredentialStore> = Arc::new(
        MemoryCredentialStore::open(&settings.storage.credentials_file).map_err(|e| {
            std::io::Error::other(format!("Failed to load credential store: {e}"))
        })?,
    );
    let images: Arc<dyn ImageStore> = Arc::new(
        FsImageStore::new(&settings.storage.images_dir, settings.storage.max_image_bytes)
            .map_err(|e| std::io::Error::other(format!("Failed to open image store: {e}")))?,
    );
    let orchestrator = CeremonyOrchestrator::new(settings.webauthn.clone(), store)
        .map_err(|e| std::io::Error::other(format!("Failed to initialize WebAuthn: {e}")))?;

    start_server(settings, web::Data::new(orchestrator), web::Data::from(images)).await
}

/// Start the HTTP server and the ceremony purge task
///
/// # Errors
///
/// Returns an error if:
/// - Server binding fails
/// - Server fails to start
async fn start_server(
    settings: KioskSettings,
    orchestrator: web::Data<CeremonyOrchestrator>,
    images: web::Data<dyn ImageStore>,
) -> std::io::Result<()> {
    let bind_address = settings.get_bind_address();
    print_startup_info(&bind_address, &settings);

    spawn_purge_task(orchestrator.clone(), settings.webauthn.ceremony_timeout_seconds);

    HttpServer::new(move || {
        App::new()
            .app_data(orchestrator.clone())
            .app_data(images.clone())
            .wrap(Compress::default())
            .wrap(Logger::default())
            .configure(|cfg| configure_services(cfg, &settings))
    })
    .bind(&bind_address)?
    .run()
    .await
}

/// Sweep stale ceremonies once per ceremony timeout
fn spawn_purge_task(orchestrator: web::Data<CeremonyOrchestrator>, timeout_seconds: u64) {
    actix_web::rt::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(timeout_seconds.max(1)));
        interval.tick().await;
        loop {
            interval.tick().await;
            orchestrator.purge_expired();
        }
    });
}

fn print_startup_info(bind_address: &str, settings: &KioskSettings) {
    let webauthn = &settings.webauthn;
    LoggingHelper::log_startup(
        &webauthn.rp_id,
        &webauthn.allowed_origins,
        &webauthn.attestation_policy.to_string(),
        &webauthn.counter_policy.to_string(),
    );

    println!("Starting Kioskpass on http://{bind_address}");
    println!();
    println!("Passkey endpoints:");
    println!("  POST /webauthn/register/options - Start passkey registration");
    println!("  POST /webauthn/register/finish  - Complete passkey registration");
    println!("  POST /webauthn/auth/options     - Start passkey authentication");
    println!("  POST /webauthn/auth/finish      - Complete passkey authentication");
    println!();
    println!("Kiosk endpoints:");
    println!("  POST /api/users       - Enrol a PIN with its image");
    println!("  GET  /api/pin/{{pin}}   - PIN fallback lookup");
    println!("  GET  /images/{{name}}   - Stored images");
    println!();
    println!("System endpoints:");
    println!("  GET  /ping            - Health check");
    println!(
        "  Credentials file: {}, images folder: {}",
        settings.storage.credentials_file, settings.storage.images_dir
    );
}
