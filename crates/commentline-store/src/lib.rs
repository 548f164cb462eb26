//! commentline-store: durable storage for annotated comments
//!
//! Content hashing, the write-once [`ObjectStore`] interface with local
//! filesystem, Azure Blob and in-memory backends, and the per-source
//! checkpoint store that makes runs resumable.

pub mod azure;
pub mod checkpoint;
pub mod fs;
pub mod hash;
pub mod memory;
pub mod object_store;

pub use azure::{AzureBlobStore, ConnectionString};
pub use checkpoint::{Checkpoint, CheckpointStore, FsCheckpointStore, MemoryCheckpointStore};
pub use fs::FsObjectStore;
pub use hash::{content_hash, hash_bytes, page_key, short_hash};
pub use memory::MemoryObjectStore;
pub use object_store::{ObjectStore, PutOutcome, validate_key};
