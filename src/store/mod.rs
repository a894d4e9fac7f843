//! Credential and image storage

pub mod credentials;
pub mod images;

pub use credentials::{CredentialStore, MemoryCredentialStore, StoreError};
pub use images::{
    content_type_for, FsImageStore, ImageRef, ImageStore, ImageStoreError, MemoryImageStore,
    DEFAULT_MAX_IMAGE_BYTES,
};
