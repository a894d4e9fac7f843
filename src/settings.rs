use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::store::DEFAULT_MAX_IMAGE_BYTES;
use crate::webauthn::{WebAuthnError, WebAuthnSettings};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct KioskSettings {
    pub application: ApplicationSettings,
    pub webauthn: WebAuthnSettings,
    pub storage: StorageSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationSettings {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// JSON snapshot of registered credentials
    pub credentials_file: String,
    /// Directory holding one image per identity
    pub images_dir: String,
    pub max_image_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            credentials_file: "data/credentials.json".to_string(),
            images_dir: "data/images".to_string(),
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Messages produced while loading settings
///
/// The log level is itself a setting, so nothing can be logged until
/// loading is done; messages are held here and emitted afterwards.
#[derive(Debug, Default)]
pub struct LoadNotes(Vec<(log::Level, String)>);

impl LoadNotes {
    fn info(&mut self, message: String) {
        self.0.push((log::Level::Info, message));
    }

    fn warn(&mut self, message: String) {
        self.0.push((log::Level::Warn, message));
    }

    /// Warnings recorded so far
    pub fn warnings(&self) -> impl Iterator<Item = &str> {
        self.0
            .iter()
            .filter(|(level, _)| *level == log::Level::Warn)
            .map(|(_, message)| message.as_str())
    }

    /// Send every held message to the installed logger
    pub fn emit(self) {
        for (level, message) in self.0 {
            log::log!(level, "{message}");
        }
    }
}

impl KioskSettings {
    /// Load settings from configuration files and environment variables
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Logger initialization fails
    /// - A settings file cannot be read or parsed
    pub fn load() -> anyhow::Result<Self> {
        Self::load_env_file();
        let mut notes = LoadNotes::default();

        // Load base settings from TOML or defaults
        let secrets_dir = std::env::var("KIOSKPASS_SECRETS_DIR").ok();
        let mut settings = Self::load_base_settings(
            Path::new("."),
            secrets_dir.as_deref().map(Path::new),
            &mut notes,
        )?;

        // Apply environment variable overrides
        Self::apply_env_overrides(&mut settings, &mut notes);

        Self::initialize_logging(&settings.logging)?;
        notes.emit();
        Ok(settings)
    }

    /// Initialize `env_logger` with the configured filter
    ///
    /// # Errors
    ///
    /// Returns an error if a logger is already installed
    fn initialize_logging(logging: &LoggingSettings) -> anyhow::Result<()> {
        env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or(logging.level.as_str()),
        )
        .try_init()?;
        Ok(())
    }

    /// Load base settings from TOML file(s) or use defaults
    /// Settings are loaded with the following priority (highest to lowest):
    /// 1. Environment variables (applied separately after loading base settings)
    /// 2. Settings.toml in `KIOSKPASS_SECRETS_DIR` (if specified and exists)
    /// 3. Settings.toml in `base_dir` (if exists)
    /// 4. Default settings
    ///
    /// # Errors
    ///
    /// Returns an error if a settings file cannot be read or parsed
    pub fn load_base_settings(
        base_dir: &Path,
        secrets_dir: Option<&Path>,
        notes: &mut LoadNotes,
    ) -> anyhow::Result<Self> {
        let mut settings = Self::default();

        let default_config_path = base_dir.join("Settings.toml");
        if default_config_path.exists() {
            settings = Self::read_settings_file(&default_config_path)?;
            notes.info(format!(
                "✓ Loaded base settings from {}",
                default_config_path.display()
            ));
        }

        if let Some(secrets_dir) = secrets_dir {
            let secrets_path = secrets_dir.join("Settings.toml");
            if secrets_path.exists() {
                settings = Self::read_settings_file(&secrets_path)?;
                notes.info(format!("✓ Overriding settings from {}", secrets_path.display()));
            } else {
                notes.info(format!(
                    "ℹ KIOSKPASS_SECRETS_DIR set but no Settings.toml found at: {}",
                    secrets_path.display()
                ));
            }
        }

        Ok(settings)
    }

    fn read_settings_file(path: &Path) -> anyhow::Result<Self> {
        let toml_content = fs::read_to_string(path)?;
        basic_toml::from_str(&toml_content)
            .map_err(|e| anyhow::anyhow!("invalid settings file {}: {e}", path.display()))
    }

    /// Apply environment variable overrides to settings
    pub fn apply_env_overrides(settings: &mut Self, notes: &mut LoadNotes) {
        Self::apply_application_env_overrides(&mut settings.application, notes);
        Self::apply_webauthn_env_overrides(&mut settings.webauthn, notes);
        Self::apply_storage_env_overrides(&mut settings.storage, notes);
        Self::apply_logging_env_overrides(&mut settings.logging);
    }

    /// Apply environment overrides for application settings
    fn apply_application_env_overrides(
        app_settings: &mut ApplicationSettings,
        notes: &mut LoadNotes,
    ) {
        if let Ok(host) = std::env::var("HOST") {
            app_settings.host = host;
        }
        Self::apply_parsed_env_override("PORT", &mut app_settings.port, notes);
    }

    /// Apply environment overrides for `WebAuthn` settings
    fn apply_webauthn_env_overrides(webauthn: &mut WebAuthnSettings, notes: &mut LoadNotes) {
        if let Ok(rp_id) = std::env::var("RP_ID") {
            webauthn.rp_id = rp_id;
        }
        if let Ok(rp_name) = std::env::var("RP_NAME") {
            webauthn.rp_name = rp_name;
        }
        if let Ok(origins) = std::env::var("ALLOWED_ORIGINS") {
            webauthn.allowed_origins = split_list(&origins);
        }
        if let Ok(anchors) = std::env::var("TRUST_ANCHORS") {
            webauthn.trust_anchors = split_list(&anchors);
        }
        Self::apply_parsed_env_override(
            "CEREMONY_TIMEOUT_SECONDS",
            &mut webauthn.ceremony_timeout_seconds,
            notes,
        );
        Self::apply_parsed_env_override(
            "VERIFICATION_TIMEOUT_MS",
            &mut webauthn.verification_timeout_ms,
            notes,
        );
        Self::apply_parsed_env_override(
            "ATTESTATION_POLICY",
            &mut webauthn.attestation_policy,
            notes,
        );
        Self::apply_parsed_env_override("COUNTER_POLICY", &mut webauthn.counter_policy, notes);
        Self::apply_parsed_env_override(
            "REQUIRE_USER_VERIFICATION",
            &mut webauthn.require_user_verification,
            notes,
        );
    }

    /// Apply environment overrides for storage settings
    fn apply_storage_env_overrides(storage: &mut StorageSettings, notes: &mut LoadNotes) {
        if let Ok(path) = std::env::var("CREDENTIALS_FILE") {
            storage.credentials_file = path;
        }
        if let Ok(dir) = std::env::var("IMAGES_DIR") {
            storage.images_dir = dir;
        }
        Self::apply_parsed_env_override("MAX_IMAGE_BYTES", &mut storage.max_image_bytes, notes);
    }

    /// Apply environment overrides for logging settings
    fn apply_logging_env_overrides(logging_settings: &mut LoggingSettings) {
        if let Ok(log_level) = std::env::var("RUST_LOG") {
            logging_settings.level = log_level;
        }
    }

    /// Helper function to apply parsed environment variable overrides
    ///
    /// Unparseable values are ignored with a warning.
    fn apply_parsed_env_override<T>(env_var: &str, target: &mut T, notes: &mut LoadNotes)
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        if let Ok(value_str) = std::env::var(env_var) {
            match value_str.trim().parse::<T>() {
                Ok(value) => *target = value,
                Err(e) => notes.warn(format!("Ignoring {env_var}={value_str:?}: {e}")),
            }
        }
    }

    /// Load environment variables from .env file
    fn load_env_file() {
        if let Ok(contents) = std::fs::read_to_string(".env") {
            for line in contents.lines() {
                let line = line.trim();
                if line.starts_with('#') {
                    continue;
                }
                if let Some((key, value)) = line.split_once('=') {
                    std::env::set_var(key.trim(), value.trim());
                }
            }
        }
    }

    /// Reject settings the ceremony engine cannot work with
    ///
    /// # Errors
    ///
    /// Returns `Configuration` describing the first problem found
    pub fn validate(&self) -> Result<(), WebAuthnError> {
        let webauthn = &self.webauthn;
        let rp_id = webauthn.rp_id.trim();
        if rp_id.is_empty() {
            return Err(config_error("rp_id must not be empty"));
        }
        if webauthn.allowed_origins.is_empty() {
            return Err(config_error("allowed_origins must not be empty"));
        }
        for origin in &webauthn.allowed_origins {
            let parsed = url::Url::parse(origin)
                .map_err(|e| config_error(&format!("invalid origin {origin:?}: {e}")))?;
            let host = parsed
                .host_str()
                .ok_or_else(|| config_error(&format!("origin {origin:?} has no host")))?;
            if host != rp_id && !host.ends_with(&format!(".{rp_id}")) {
                return Err(config_error(&format!(
                    "origin {origin:?} is not within rp_id {rp_id:?}"
                )));
            }
        }
        if webauthn.ceremony_timeout_seconds == 0 {
            return Err(config_error("ceremony_timeout_seconds must be positive"));
        }
        if webauthn.verification_timeout_ms == 0 {
            return Err(config_error("verification_timeout_ms must be positive"));
        }
        if self.storage.max_image_bytes == 0 {
            return Err(config_error("max_image_bytes must be positive"));
        }
        Ok(())
    }

    /// Get the bind address for the server
    #[must_use]
    pub fn get_bind_address(&self) -> String {
        format!("{}:{}", self.application.host, self.application.port)
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn config_error(message: &str) -> WebAuthnError {
    WebAuthnError::Configuration(message.to_string())
}
