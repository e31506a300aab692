//! Immutable stage snapshots and their on-disk columnar form.
//!
//! Each pipeline stage consumes one [`Snapshot`] and produces a new one. The
//! constructor validates the invariants every stage relies on: unique record
//! ids, non-empty embeddings, and a single embedding dimensionality.

pub mod columnar;
pub mod manifest;

pub use columnar::{SCHEMA_VERSION, read_snapshot, snapshot_schema, write_snapshot};
pub use manifest::{LineageLink, SnapshotManifest};

use crate::error::{PapermapError, Result};
use crate::record::PaperRecord;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// The pipeline stage that produced a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Export,
    Dedup,
    Assign,
    /// 2D coordinates. Has a manifest in the lineage but is not a record snapshot.
    Project,
}

impl Stage {
    /// Every stage, in pipeline order.
    pub const ALL: [Stage; 4] = [Stage::Export, Stage::Dedup, Stage::Assign, Stage::Project];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Export => "export",
            Stage::Dedup => "dedup",
            Stage::Assign => "assign",
            Stage::Project => "project",
        }
    }

    /// Stages whose output this stage is derived from, oldest first.
    pub fn upstream(&self) -> &'static [Stage] {
        let idx = Stage::ALL.iter().position(|s| s == self).unwrap_or(0);
        &Stage::ALL[..idx]
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "export" => Ok(Stage::Export),
            "dedup" => Ok(Stage::Dedup),
            "assign" => Ok(Stage::Assign),
            "project" => Ok(Stage::Project),
            other => Err(format!("unknown stage '{other}'")),
        }
    }
}

/// An immutable set of paper records produced by one stage.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    stage: Stage,
    records: Vec<PaperRecord>,
}

impl Snapshot {
    /// Build a snapshot, validating ids and embedding dimensionality.
    pub fn new(stage: Stage, records: Vec<PaperRecord>) -> Result<Self> {
        let mut seen: HashMap<&str, usize> = HashMap::with_capacity(records.len());
        for (idx, rec) in records.iter().enumerate() {
            if let Some(first) = seen.insert(rec.id.as_str(), idx) {
                return Err(PapermapError::DuplicateInvariantViolation {
                    key: "record id".into(),
                    record_ids: vec![records[first].id.clone(), rec.id.clone()],
                });
            }
        }

        if let Some(first) = records.first() {
            let expected = first.embedding_dim();
            for rec in &records {
                if rec.embedding.is_empty() {
                    return Err(PapermapError::missing_field(&rec.id, "embedding"));
                }
                if rec.embedding_dim() != expected {
                    return Err(PapermapError::DimensionMismatch {
                        record_id: rec.id.clone(),
                        expected,
                        actual: rec.embedding_dim(),
                    });
                }
            }
        }

        Ok(Self { stage, records })
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn records(&self) -> &[PaperRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<PaperRecord> {
        self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Embedding dimensionality, or 0 for an empty snapshot.
    pub fn embedding_dim(&self) -> usize {
        self.records.first().map(|r| r.embedding_dim()).unwrap_or(0)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.records.iter().map(|r| r.id.as_str())
    }

    pub fn get(&self, id: &str) -> Option<&PaperRecord> {
        self.records.iter().find(|r| r.id == id)
    }
}
