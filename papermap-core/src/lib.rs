//! # papermap-core: research paper corpus to interactive map
//!
//! Batch pipeline over a paper corpus held in an embedding store:
//!
//! 1. **Export**: read papers and embeddings from the store into a validated snapshot
//! 2. **Dedup**: collapse duplicates by content hash and normalized title
//! 3. **Assign**: give unclustered papers the nearest cluster and fill categories
//! 4. **Project**: reduce embeddings to 2D (UMAP via Python, or in-process PCA)
//! 5. **Render**: write a self-contained HTML map and a summary
//!
//! Optional: citation counts from OpenAlex for marker sizing.
//!
//! Stages hand off through immutable Parquet snapshots with JSON manifests.

// Foundation
pub mod config;
pub mod error;
pub mod persistence;
pub mod record;
pub mod runtime;

// Storage
pub mod snapshot;
pub mod store;

// Stages
pub mod assign;
pub mod citations;
pub mod dedup;
pub mod export;
pub mod project;
pub mod render;

// Orchestration
pub mod pipeline;

// Re-exports
pub use config::{PapermapConfig, load_config};
pub use error::{PapermapError, Result};
pub use pipeline::{Pipeline, PipelinePaths};
pub use record::PaperRecord;
pub use snapshot::{Snapshot, SnapshotManifest, Stage};
pub use store::{CorpusStore, InMemoryStore, SqliteCorpusStore, StoredPaper};
