//! In-memory store, for tests and for feeding rows produced elsewhere.

use super::{CorpusStore, StoreInfo, StoredPaper};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    papers: Vec<StoredPaper>,
    labels: BTreeMap<i64, String>,
}

impl InMemoryStore {
    pub fn new(papers: Vec<StoredPaper>) -> Self {
        Self {
            papers,
            labels: BTreeMap::new(),
        }
    }

    pub fn with_labels(mut self, labels: BTreeMap<i64, String>) -> Self {
        self.labels = labels;
        self
    }
}

#[async_trait]
impl CorpusStore for InMemoryStore {
    async fn read_papers(&self) -> Result<Vec<StoredPaper>> {
        Ok(self.papers.clone())
    }

    async fn cluster_labels(&self) -> Result<BTreeMap<i64, String>> {
        Ok(self.labels.clone())
    }

    fn info(&self) -> StoreInfo {
        StoreInfo {
            kind: "memory".to_string(),
            location: format!("{} rows", self.papers.len()),
            accessed_at: chrono::Utc::now(),
        }
    }
}
