//! Commentline Pipeline - fetch, classify and store comments for one source
//!
//! Wires a [`CommentSource`](commentline_core::CommentSource), a
//! [`Classifier`](commentline_core::Classifier) and an
//! [`ObjectStore`](commentline_store::ObjectStore) into a resumable run.
//!
//! # Example
//!
//! ```ignore
//! use commentline_pipeline::{Pipeline, PipelineConfig};
//!
//! let pipeline = Pipeline::new(&source, &classifier, &store, &checkpoints, &budget,
//!     PipelineConfig::default());
//! let status = pipeline.run("dQw4w9WgXcQ", true);
//! std::process::exit(status.code().into());
//! ```

pub mod batcher;
pub mod config;
pub mod error;
pub mod reader;
pub mod runner;
pub mod sink;
pub mod summary;

// Re-exports
pub use batcher::{Annotator, split_batches, validate};
pub use config::PipelineConfig;
pub use error::{ExitStatus, PipelineError};
pub use reader::{FetchError, PageStream, SourceReader};
pub use runner::{Pipeline, RunReport, RunState};
pub use sink::{
    SinkWriter, StoredArtifact, artifact_key, artifact_prefix, encode_payload, page_prefix,
    parse_artifact_key,
};
pub use summary::RunSummary;
