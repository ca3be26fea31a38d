//! facelink-store — blob storage backends and the model/image asset manager.
//!
//! [`BlobStore`] is the durable-storage seam. The filesystem store backs
//! standalone deployments, the GCS store backs serverless ones, and the
//! in-memory store backs tests.

pub mod assets;
pub mod blob;
pub mod fs;
pub mod gcs;
pub mod memory;

pub use assets::{
    AssetError, AssetLocation, AssetManager, ModelAssetInfo, StoredIn, SyncFailure, SyncPolicy,
    SyncReport,
};
pub use blob::{BlobEntry, BlobStore, StoreError};
pub use fs::{write_atomic, write_file_atomic, FsBlobStore};
pub use gcs::{GcsBlobStore, GcsCredentials};
pub use memory::MemoryBlobStore;
