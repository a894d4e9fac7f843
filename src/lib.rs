#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

/// Version of the kioskpass application
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod ceremony;
pub mod handlers;
pub mod settings;
pub mod store;
pub mod utils;
pub mod webauthn;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

/// Re-export commonly used items
pub use ceremony::{CeremonyOrchestrator, Deadline};
pub use handlers::configure_services;
pub use settings::KioskSettings;
pub use store::{CredentialStore, FsImageStore, ImageStore, MemoryCredentialStore};
pub use webauthn::{Identity, WebAuthnError, WebAuthnSettings};
