//! Source embedding stores.
//!
//! A store yields raw [`StoredPaper`] rows, where every attribute may be
//! absent. [`StoredPaper::into_record`] is the single place where rows are
//! validated against the [`PaperRecord`] schema; nothing downstream ever sees a
//! record with a missing required field.

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryStore;
pub use sqlite::SqliteCorpusStore;

use crate::error::{PapermapError, Result};
use crate::record::{PaperRecord, derive_content_hash, normalize_title};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A paper row exactly as the store returned it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredPaper {
    pub document_id: Option<String>,
    pub title: Option<String>,
    #[serde(default)]
    pub authors: Vec<String>,
    pub year: Option<i64>,
    pub abstract_text: Option<String>,
    pub summary: Option<String>,
    pub file_path: Option<String>,
    pub content_hash: Option<String>,
    pub embedding: Option<Vec<f32>>,
    pub cluster_id: Option<i64>,
    pub macro_category: Option<String>,
    pub micro_topic: Option<String>,
    pub drive_url: Option<String>,
    pub research_question: Option<String>,
    pub indexed_at: Option<DateTime<Utc>>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl StoredPaper {
    /// Whether the row carries a usable embedding.
    pub fn has_embedding(&self) -> bool {
        self.embedding.as_ref().is_some_and(|e| !e.is_empty())
    }

    /// Identifier used in error messages, falling back to the row position.
    pub fn label(&self, seq: u64) -> String {
        self.document_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("<row {seq}>"))
    }

    /// Validate this row into a [`PaperRecord`].
    ///
    /// Years above `max_year` are treated as bad data and dropped. Cluster
    /// labels are joined from `labels`.
    pub fn into_record(
        self,
        seq: u64,
        labels: &BTreeMap<i64, String>,
        max_year: i32,
    ) -> Result<PaperRecord> {
        let label = self.label(seq);
        let id = non_blank(self.document_id)
            .ok_or_else(|| PapermapError::missing_field(&label, "document_id"))?;
        let title =
            non_blank(self.title).ok_or_else(|| PapermapError::missing_field(&id, "title"))?;
        let file_path = non_blank(self.file_path)
            .ok_or_else(|| PapermapError::missing_field(&id, "file_path"))?;
        let embedding = self
            .embedding
            .filter(|e| !e.is_empty())
            .ok_or_else(|| PapermapError::missing_field(&id, "document_embedding"))?;

        let authors: Vec<String> = self
            .authors
            .into_iter()
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect();
        let abstract_text = non_blank(self.abstract_text);
        let content_hash = non_blank(self.content_hash)
            .unwrap_or_else(|| derive_content_hash(&title, &authors, abstract_text.as_deref()));
        let year = self
            .year
            .and_then(|y| i32::try_from(y).ok())
            .filter(|y| *y <= max_year);

        Ok(PaperRecord {
            normalized_title: normalize_title(&title),
            cluster_label: self.cluster_id.and_then(|c| labels.get(&c).cloned()),
            id,
            title,
            authors,
            year,
            abstract_text,
            summary: non_blank(self.summary),
            file_path,
            content_hash,
            embedding,
            cluster_id: self.cluster_id,
            macro_category: non_blank(self.macro_category),
            micro_topic: non_blank(self.micro_topic),
            link: non_blank(self.drive_url),
            research_question: non_blank(self.research_question),
            indexed_at: self.indexed_at,
            ingest_seq: seq,
        })
    }
}

/// Where a store's data came from, for logs and manifests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreInfo {
    pub kind: String,
    pub location: String,
    pub accessed_at: DateTime<Utc>,
}

/// A read-only source of paper rows and cluster labels.
#[async_trait]
pub trait CorpusStore: Send + Sync {
    /// Read every paper row, in the store's natural order.
    async fn read_papers(&self) -> Result<Vec<StoredPaper>>;

    /// Human-readable cluster labels keyed by cluster id.
    async fn cluster_labels(&self) -> Result<BTreeMap<i64, String>>;

    fn info(&self) -> StoreInfo;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> StoredPaper {
        StoredPaper {
            document_id: Some("doc-1".into()),
            title: Some("Sparse Attention".into()),
            authors: vec![" Ada ".into(), "".into()],
            year: Some(2022),
            file_path: Some("papers/doc-1.pdf".into()),
            embedding: Some(vec![0.5, 0.5]),
            cluster_id: Some(2),
            ..Default::default()
        }
    }

    #[test]
    fn test_into_record_derives_keys() {
        let labels = BTreeMap::from([(2, "Transformers".to_string())]);
        let rec = row().into_record(7, &labels, 2030).unwrap();
        assert_eq!(rec.id, "doc-1");
        assert_eq!(rec.normalized_title, "sparseattention");
        assert_eq!(rec.authors, vec!["Ada".to_string()]);
        assert_eq!(rec.cluster_label.as_deref(), Some("Transformers"));
        assert_eq!(rec.ingest_seq, 7);
        assert_eq!(
            rec.content_hash,
            derive_content_hash("Sparse Attention", &["Ada".to_string()], None)
        );
    }

    #[test]
    fn test_store_hash_takes_precedence() {
        let mut r = row();
        r.content_hash = Some("feedface".into());
        let rec = r.into_record(0, &BTreeMap::new(), 2030).unwrap();
        assert_eq!(rec.content_hash, "feedface");
    }

    #[test]
    fn test_missing_required_fields() {
        let mut r = row();
        r.title = Some("   ".into());
        let err = r.into_record(0, &BTreeMap::new(), 2030).unwrap_err();
        assert_eq!(err.to_string(), "Record 'doc-1' is missing required field 'title'");

        let mut r = row();
        r.embedding = Some(Vec::new());
        let err = r.into_record(0, &BTreeMap::new(), 2030).unwrap_err();
        assert!(err.to_string().contains("document_embedding"));

        let mut r = row();
        r.document_id = None;
        let err = r.into_record(3, &BTreeMap::new(), 2030).unwrap_err();
        assert_eq!(err.record_ids(), vec!["<row 3>"]);
    }

    #[test]
    fn test_bad_year_dropped() {
        let mut r = row();
        r.year = Some(3024);
        let rec = r.into_record(0, &BTreeMap::new(), 2030).unwrap();
        assert_eq!(rec.year, None);
    }
}
