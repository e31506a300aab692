//! Corpus export: store rows → validated export snapshot.

use crate::error::Result;
use crate::snapshot::{Snapshot, Stage};
use crate::store::{CorpusStore, StoreInfo};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{info, warn};

/// Options controlling how store rows become records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportOptions {
    /// Years above this are treated as bad data and dropped.
    pub max_year: i32,
    /// Skip rows with no embedding instead of failing the export.
    pub skip_unembedded: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            max_year: 2030,
            skip_unembedded: false,
        }
    }
}

/// What the export read and what it left out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportReport {
    pub source: StoreInfo,
    pub rows_read: usize,
    pub records_written: usize,
    pub skipped_unembedded: Vec<String>,
    pub duplicate_ids: Vec<String>,
    pub cluster_labels: usize,
}

/// Read every paper from `store` into an export snapshot.
///
/// Rows are validated one by one; the first row missing a required field
/// aborts the export. Repeated document ids keep their first occurrence.
pub async fn export_corpus(
    store: &dyn CorpusStore,
    options: &ExportOptions,
) -> Result<(Snapshot, ExportReport)> {
    let source = store.info();
    info!(kind = %source.kind, location = %source.location, "Exporting corpus");

    let rows = store.read_papers().await?;
    let labels = store.cluster_labels().await?;
    let rows_read = rows.len();

    let mut seen = HashSet::with_capacity(rows.len());
    let mut records = Vec::with_capacity(rows.len());
    let mut skipped_unembedded = Vec::new();
    let mut duplicate_ids = Vec::new();

    for (seq, row) in rows.into_iter().enumerate() {
        let seq = seq as u64;
        if options.skip_unembedded && !row.has_embedding() {
            skipped_unembedded.push(row.label(seq));
            continue;
        }
        let record = row.into_record(seq, &labels, options.max_year)?;
        if !seen.insert(record.id.clone()) {
            warn!(id = %record.id, "Duplicate document id in store, keeping first row");
            duplicate_ids.push(record.id);
            continue;
        }
        records.push(record);
    }

    if !skipped_unembedded.is_empty() {
        warn!(
            count = skipped_unembedded.len(),
            "Skipped rows without embeddings"
        );
    }

    let snapshot = Snapshot::new(Stage::Export, records)?;
    info!(
        rows = rows_read,
        records = snapshot.len(),
        dim = snapshot.embedding_dim(),
        labels = labels.len(),
        "Export complete"
    );

    let report = ExportReport {
        source,
        rows_read,
        records_written: snapshot.len(),
        skipped_unembedded,
        duplicate_ids,
        cluster_labels: labels.len(),
    };
    Ok((snapshot, report))
}
