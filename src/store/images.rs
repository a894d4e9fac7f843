//! Image storage for kiosk identities
//!
//! Images are opaque bytes keyed by identity. The file name is derived from
//! the SHA-256 of the identity so PINs never appear on disk or in URLs.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;
use std::sync::{PoisonError, RwLock};
use thiserror::Error;

use super::credentials::write_atomically;
use crate::webauthn::Identity;

/// Default upper bound for a stored image
pub const DEFAULT_MAX_IMAGE_BYTES: usize = 5 * 1024 * 1024;

const URL_PREFIX: &str = "/images/";
const EXTENSIONS: [&str; 5] = ["png", "jpg", "gif", "webp", "img"];

#[derive(Debug, Error)]
pub enum ImageStoreError {
    #[error("image is empty")]
    Empty,
    #[error("image is {size} bytes, limit is {max}")]
    TooLarge { size: usize, max: usize },
    #[error("invalid image name")]
    InvalidName,
    #[error("image storage failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Where a stored image can be fetched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub name: String,
    pub url: String,
}

impl ImageRef {
    fn from_name(name: String) -> Self {
        let url = format!("{URL_PREFIX}{name}");
        Self { name, url }
    }
}

/// Storage for identity images
pub trait ImageStore: Send + Sync {
    /// # Errors
    ///
    /// Returns `Io` if the backing storage cannot be read
    fn get(&self, identity: &Identity) -> Result<Option<ImageRef>, ImageStoreError>;

    /// Store `bytes` for `identity`, replacing any previous image
    ///
    /// # Errors
    ///
    /// Returns `Empty`, `TooLarge` or `Io`
    fn put(
        &self,
        identity: &Identity,
        bytes: &[u8],
        content_type: Option<&str>,
    ) -> Result<ImageRef, ImageStoreError>;

    /// Raw bytes of a stored image by file name
    ///
    /// # Errors
    ///
    /// Returns `InvalidName` for names this store never produces
    fn read(&self, name: &str) -> Result<Option<Vec<u8>>, ImageStoreError>;
}

/// Content type for a stored image name
#[must_use]
pub fn content_type_for(name: &str) -> &'static str {
    match name.rsplit('.').next() {
        Some("png") => "image/png",
        Some("jpg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}

fn extension_for(content_type: Option<&str>) -> &'static str {
    match content_type.map(str::to_ascii_lowercase).as_deref() {
        Some("image/png") => "png",
        Some("image/jpeg" | "image/jpg") => "jpg",
        Some("image/gif") => "gif",
        Some("image/webp") => "webp",
        _ => "img",
    }
}

fn identity_stem(identity: &Identity) -> String {
    Sha256::digest(identity.as_str().as_bytes())
        .iter()
        .fold(String::with_capacity(64), |mut out, byte| {
            let _ = write!(out, "{byte:02x}");
            out
        })
}

fn check_size(bytes: &[u8], max: usize) -> Result<(), ImageStoreError> {
    if bytes.is_empty() {
        return Err(ImageStoreError::Empty);
    }
    if bytes.len() > max {
        return Err(ImageStoreError::TooLarge {
            size: bytes.len(),
            max,
        });
    }
    Ok(())
}

// Accept only `<64 hex>.<known extension>`, which also rules out traversal.
fn validate_name(name: &str) -> Result<(), ImageStoreError> {
    let (stem, ext) = name.split_once('.').ok_or(ImageStoreError::InvalidName)?;
    let stem_ok = stem.len() == 64 && stem.bytes().all(|b| b.is_ascii_hexdigit());
    if stem_ok && EXTENSIONS.contains(&ext) {
        Ok(())
    } else {
        Err(ImageStoreError::InvalidName)
    }
}

/// Images stored as files under one directory
pub struct FsImageStore {
    dir: PathBuf,
    max_bytes: usize,
}

impl FsImageStore {
    /// # Errors
    ///
    /// Returns `Io` if the directory cannot be created
    pub fn new(dir: impl Into<PathBuf>, max_bytes: usize) -> Result<Self, ImageStoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, max_bytes })
    }
}

impl ImageStore for FsImageStore {
    fn get(&self, identity: &Identity) -> Result<Option<ImageRef>, ImageStoreError> {
        let stem = identity_stem(identity);
        for ext in EXTENSIONS {
            let name = format!("{stem}.{ext}");
            if self.dir.join(&name).is_file() {
                return Ok(Some(ImageRef::from_name(name)));
            }
        }
        Ok(None)
    }

    fn put(
        &self,
        identity: &Identity,
        bytes: &[u8],
        content_type: Option<&str>,
    ) -> Result<ImageRef, ImageStoreError> {
        check_size(bytes, self.max_bytes)?;
        let stem = identity_stem(identity);
        let name = format!("{stem}.{}", extension_for(content_type));

        write_atomically(&self.dir.join(&name), bytes)?;
        // Drop an older image stored under a different extension
        for ext in EXTENSIONS {
            let other = format!("{stem}.{ext}");
            if other != name {
                match fs::remove_file(self.dir.join(&other)) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        log::debug!("Stored {} byte image as {name}", bytes.len());
        Ok(ImageRef::from_name(name))
    }

    fn read(&self, name: &str) -> Result<Option<Vec<u8>>, ImageStoreError> {
        validate_name(name)?;
        match fs::read(self.dir.join(name)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Images kept in memory, for tests and ephemeral kiosks
pub struct MemoryImageStore {
    images: RwLock<HashMap<String, Vec<u8>>>,
    max_bytes: usize,
}

impl MemoryImageStore {
    #[must_use]
    pub fn new(max_bytes: usize) -> Self {
        Self {
            images: RwLock::new(HashMap::new()),
            max_bytes,
        }
    }
}

impl Default for MemoryImageStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IMAGE_BYTES)
    }
}

impl ImageStore for MemoryImageStore {
    fn get(&self, identity: &Identity) -> Result<Option<ImageRef>, ImageStoreError> {
        let stem = identity_stem(identity);
        let images = self.images.read().unwrap_or_else(PoisonError::into_inner);
        Ok(EXTENSIONS
            .iter()
            .map(|ext| format!("{stem}.{ext}"))
            .find(|name| images.contains_key(name))
            .map(ImageRef::from_name))
    }

    fn put(
        &self,
        identity: &Identity,
        bytes: &[u8],
        content_type: Option<&str>,
    ) -> Result<ImageRef, ImageStoreError> {
        check_size(bytes, self.max_bytes)?;
        let stem = identity_stem(identity);
        let name = format!("{stem}.{}", extension_for(content_type));

        let mut images = self.images.write().unwrap_or_else(PoisonError::into_inner);
        images.retain(|key, _| !key.starts_with(&stem));
        images.insert(name.clone(), bytes.to_vec());
        Ok(ImageRef::from_name(name))
    }

    fn read(&self, name: &str) -> Result<Option<Vec<u8>>, ImageStoreError> {
        validate_name(name)?;
        Ok(self
            .images
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_round_trip() {
        let store = MemoryImageStore::default();
        let identity = Identity::new("1234");
        assert!(store.get(&identity).unwrap().is_none());

        let image = store.put(&identity, b"png bytes", Some("image/png")).unwrap();
        assert!(image.url.starts_with("/images/"));
        assert!(image.name.ends_with(".png"));
        assert!(!image.url.contains("1234"));
        assert_eq!(store.get(&identity).unwrap(), Some(image.clone()));
        assert_eq!(store.read(&image.name).unwrap(), Some(b"png bytes".to_vec()));
    }

    #[test]
    fn test_replacing_an_image_with_another_format() {
        let store = MemoryImageStore::default();
        let identity = Identity::new("1234");
        store.put(&identity, b"one", Some("image/png")).unwrap();
        let second = store.put(&identity, b"two", Some("image/jpeg")).unwrap();
        assert_eq!(store.get(&identity).unwrap(), Some(second));
    }

    #[test]
    fn test_size_limits() {
        let store = MemoryImageStore::new(4);
        let identity = Identity::new("1");
        assert!(matches!(
            store.put(&identity, b"", None),
            Err(ImageStoreError::Empty)
        ));
        assert!(matches!(
            store.put(&identity, b"12345", None),
            Err(ImageStoreError::TooLarge { size: 5, max: 4 })
        ));
        assert!(store.put(&identity, b"1234", None).is_ok());
    }

    #[test]
    fn test_invalid_names_are_rejected() {
        let store = MemoryImageStore::default();
        assert!(matches!(
            store.read("../Settings.toml"),
            Err(ImageStoreError::InvalidName)
        ));
        assert!(matches!(
            store.read(&format!("{}.exe", "a".repeat(64))),
            Err(ImageStoreError::InvalidName)
        ));
    }

    #[test]
    fn test_fs_store_writes_hashed_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsImageStore::new(dir.path(), DEFAULT_MAX_IMAGE_BYTES).unwrap();
        let identity = Identity::new("5678");

        let image = store.put(&identity, b"jpeg", Some("image/jpeg")).unwrap();
        assert!(dir.path().join(&image.name).is_file());
        assert_eq!(store.get(&identity).unwrap(), Some(image.clone()));
        assert_eq!(store.read(&image.name).unwrap(), Some(b"jpeg".to_vec()));

        let replaced = store.put(&identity, b"png", Some("image/png")).unwrap();
        assert!(!dir.path().join(&image.name).exists());
        assert_eq!(store.get(&identity).unwrap(), Some(replaced));
    }

    #[test]
    fn test_content_types() {
        assert_eq!(content_type_for("abc.png"), "image/png");
        assert_eq!(content_type_for("abc.jpg"), "image/jpeg");
        assert_eq!(content_type_for("abc.img"), "application/octet-stream");
    }
}
