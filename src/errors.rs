//! Error types for the layerstore library.
//!
//! All fallible operations return [`Result<T>`], an alias for
//! `Result<T, StoreError>`. Callers that need to distinguish conditions
//! (record not found, duplicate name, store opened read-only, ...) match on
//! the variants directly; there is no string sniffing.

use std::path::PathBuf;

/// Result type alias for operations that may return a [`StoreError`].
pub type Result<T> = std::result::Result<T, StoreError>;

/// Error types for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested layer is not known to the store.
    #[error("layer not known: {0}")]
    LayerUnknown(String),

    /// The requested image is not known to the store.
    #[error("image not known: {0}")]
    ImageUnknown(String),

    /// The requested container is not known to the store.
    #[error("container not known: {0}")]
    ContainerUnknown(String),

    /// A record with this ID already exists.
    #[error("that ID is already in use: {0}")]
    DuplicateId(String),

    /// A name is already in use by another record.
    #[error("that name is already in use: {0}")]
    DuplicateName(String),

    /// The layer cannot be removed while other layers depend on it.
    #[error("layer has children: {0}")]
    LayerHasChildren(String),

    /// The layer cannot be removed while an image refers to it.
    #[error("layer is used by an image: {0}")]
    LayerUsedByImage(String),

    /// The layer cannot be removed while a container uses it.
    #[error("layer is used by a container: {0}")]
    LayerUsedByContainer(String),

    /// The image cannot be removed while a container is based on it.
    #[error("image is used by a container: {0}")]
    ImageUsedByContainer(String),

    /// The requested parent layer is in use as a container's layer.
    #[error("would-be parent layer is a container's layer: {0}")]
    ParentIsContainer(String),

    /// The identifier resolves to something other than a layer.
    #[error("identifier is not a layer: {0}")]
    NotALayer(String),

    /// The identifier resolves to something other than an image.
    #[error("identifier is not an image: {0}")]
    NotAnImage(String),

    /// The identifier resolves to something other than a container.
    #[error("identifier is not a container: {0}")]
    NotAContainer(String),

    /// The identifier does not resolve to any record at all.
    #[error("identifier is not known: {0}")]
    NotAnId(String),

    /// A mutating operation was attempted on a read-only store.
    #[error("called a write method on a read-only store at {0}")]
    StoreIsReadOnly(PathBuf),

    /// Not enough unused IDs remain in the configured ranges.
    #[error("not enough unused IDs in the requested range")]
    NoAvailableIds,

    /// The supplied ID mappings overlap or are malformed.
    #[error("invalid ID mappings: {0}")]
    InvalidMappings(String),

    /// The size of a requested item is not known.
    #[error("size is not known")]
    SizeUnknown,

    /// The digest of a requested item is not known.
    #[error("digest is not known")]
    DigestUnknown,

    /// The digest string is not in `algorithm:hex` form.
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    /// The operation is not supported by this store or driver.
    #[error("operation is not supported: {0}")]
    NotSupported(String),

    /// A layer-unmount was requested for a layer that is not mounted.
    #[error("layer is not mounted: {0}")]
    LayerNotMounted(String),

    /// Required options were left unset.
    #[error("missing necessary options: {0}")]
    IncompleteOptions(String),

    /// The driver reported a layer the metadata knows nothing about.
    #[error("layer in lower level storage driver not accounted for: {0}")]
    LayerUnaccounted(String),

    /// A layer is not referenced by any image or container.
    #[error("layer not referenced by any images or containers: {0}")]
    LayerUnreferenced(String),

    /// A layer's reproduced diff digest does not match the recorded one.
    #[error("layer content incorrect digest: {0}")]
    LayerIncorrectContentDigest(String),

    /// A layer's reproduced diff size does not match the recorded one.
    #[error("layer content incorrect size: {0}")]
    LayerIncorrectContentSize(String),

    /// A mounted layer's content differs from the applied diffs.
    #[error("layer content modified: {0}")]
    LayerContentModified(String),

    /// A layer's recorded big data item could not be read.
    #[error("layer data item is missing: {0}")]
    LayerDataMissing(String),

    /// A layer referenced by an image or container is missing entirely.
    #[error("layer is missing: {0}")]
    LayerMissing(String),

    /// An image's top layer (or mapped top layer) is missing or damaged.
    #[error("image layer is missing: {0}")]
    ImageLayerMissing(String),

    /// An image's recorded big data item could not be read.
    #[error("image data item is missing: {0}")]
    ImageDataMissing(String),

    /// An image's big data item has a size other than the recorded one.
    #[error("image data item has incorrect size: {0}")]
    ImageDataIncorrectSize(String),

    /// An image's big data item no longer matches the recorded digest.
    #[error("image data item has incorrect digest: {0}")]
    ImageDataIncorrectDigest(String),

    /// A container's base image is missing.
    #[error("image for container is missing: {0}")]
    ContainerImageMissing(String),

    /// A container's recorded big data item could not be read.
    #[error("container data item is missing: {0}")]
    ContainerDataMissing(String),

    /// A container's big data item has a size other than the recorded one.
    #[error("container data item has incorrect size: {0}")]
    ContainerDataIncorrectSize(String),

    /// I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Lock file operation failed.
    #[error("lock error: {0}")]
    Lock(#[from] crate::lockfile::LockError),
}

impl StoreError {
    /// True for the "record not known" family, which multi-store lookups
    /// treat as "keep searching" rather than a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::LayerUnknown(_)
                | StoreError::ImageUnknown(_)
                | StoreError::ContainerUnknown(_)
                | StoreError::NotAnId(_)
        )
    }
}
