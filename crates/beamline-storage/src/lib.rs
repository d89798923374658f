//! Persistence for the orchestration layer.
//!
//! - [`catalog`]: completed runs, named (JSON lines) or temporary
//! - [`metadata`]: the run metadata dictionary and its two backends
//! - [`best_effort`]: per-run summary subscriber

pub mod best_effort;
pub mod catalog;
pub mod metadata;

pub use best_effort::{BestEffortCallback, RunSummary};
pub use catalog::{Catalog, RunRecord};
pub use metadata::{merge_metadata, session_metadata, Metadata, MetadataStore, RunMetadata};
