//! Snapshot manifests and lineage.
//!
//! Every snapshot file gets a JSON sidecar recording what produced it and a
//! hash chain linking it to the snapshots it was derived from. The chain lets
//! a later run check that `assigned.parquet` really descends from the
//! `corpus.parquet` sitting next to it.

use super::{SCHEMA_VERSION, Snapshot, Stage};
use crate::error::Result;
use crate::persistence::{self, sha256_hex};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One step of a snapshot's lineage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineageLink {
    pub stage: Stage,
    pub file_hash: String,
    pub row_count: usize,
    /// `sha256(previous link hash : stage : file hash)`.
    pub hash: String,
}

/// Sidecar metadata describing one snapshot file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub stage: Stage,
    pub schema_version: u32,
    pub path: PathBuf,
    pub file_hash: String,
    pub row_count: usize,
    pub embedding_dim: usize,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub lineage: Vec<LineageLink>,
}

fn link_hash(previous: &str, stage: Stage, file_hash: &str) -> String {
    sha256_hex(format!("{previous}:{stage}:{file_hash}").as_bytes())
}

impl SnapshotManifest {
    /// Describe a freshly written snapshot file, chaining onto `parent` if given.
    pub fn for_file(
        path: &Path,
        snapshot: &Snapshot,
        parent: Option<&SnapshotManifest>,
    ) -> Result<Self> {
        Self::for_artifact(
            path,
            snapshot.stage(),
            snapshot.len(),
            snapshot.embedding_dim(),
            parent,
        )
    }

    /// Describe any stage output file. `dim` is the width of its vectors.
    pub fn for_artifact(
        path: &Path,
        stage: Stage,
        row_count: usize,
        dim: usize,
        parent: Option<&SnapshotManifest>,
    ) -> Result<Self> {
        let file_hash = persistence::hash_file(path)?;
        let mut lineage = parent.map(|p| p.lineage.clone()).unwrap_or_default();
        let previous = lineage.last().map(|l| l.hash.clone()).unwrap_or_default();
        lineage.push(LineageLink {
            stage,
            file_hash: file_hash.clone(),
            row_count,
            hash: link_hash(&previous, stage, &file_hash),
        });

        Ok(Self {
            stage,
            schema_version: SCHEMA_VERSION,
            path: path.to_path_buf(),
            file_hash,
            row_count,
            embedding_dim: dim,
            created_at: Utc::now(),
            lineage,
        })
    }

    /// Sidecar location for a snapshot file: `corpus.parquet` → `corpus.manifest.json`.
    pub fn sidecar_path(snapshot_path: &Path) -> PathBuf {
        snapshot_path.with_extension("manifest.json")
    }

    pub fn save(&self) -> Result<()> {
        persistence::atomic_write_json(&Self::sidecar_path(&self.path), self)?;
        Ok(())
    }

    /// Load the manifest for a snapshot file, if one exists.
    pub fn load(snapshot_path: &Path) -> Result<Option<Self>> {
        Ok(persistence::load_json(&Self::sidecar_path(snapshot_path))?)
    }

    /// Check the hash chain and that the file on disk still matches.
    pub fn verify(&self) -> Result<bool> {
        self.verify_at(&self.path)
    }

    /// Like [`verify`](Self::verify), hashing `path` instead of the recorded path.
    /// A workspace that has been moved still verifies.
    pub fn verify_at(&self, path: &Path) -> Result<bool> {
        let mut previous = String::new();
        for link in &self.lineage {
            if link.hash != link_hash(&previous, link.stage, &link.file_hash) {
                return Ok(false);
            }
            previous = link.hash.clone();
        }
        let chain_ends_here = self
            .lineage
            .last()
            .is_some_and(|l| l.file_hash == self.file_hash && l.stage == self.stage);
        if !chain_ends_here || !path.exists() {
            return Ok(false);
        }
        Ok(persistence::hash_file(path)? == self.file_hash)
    }

    /// Whether `parent` is an ancestor of this snapshot.
    pub fn descends_from(&self, parent: &SnapshotManifest) -> bool {
        self.lineage.len() > parent.lineage.len()
            && self.lineage[..parent.lineage.len()] == parent.lineage[..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::fixtures::record;
    use crate::snapshot::write_snapshot;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, stage: Stage) -> (PathBuf, Snapshot) {
        let path = dir.join(name);
        let snap = Snapshot::new(stage, vec![record("a", "Alpha", vec![1.0, 0.0])]).unwrap();
        write_snapshot(&path, &snap, 64).unwrap();
        (path, snap)
    }

    #[test]
    fn test_sidecar_path() {
        assert_eq!(
            SnapshotManifest::sidecar_path(Path::new("data/corpus.parquet")),
            PathBuf::from("data/corpus.manifest.json")
        );
    }

    #[test]
    fn test_manifest_chain_verifies() {
        let dir = TempDir::new().unwrap();
        let (p1, s1) = write(dir.path(), "corpus.parquet", Stage::Export);
        let root = SnapshotManifest::for_file(&p1, &s1, None).unwrap();
        root.save().unwrap();

        let (p2, s2) = write(dir.path(), "deduped.parquet", Stage::Dedup);
        let child = SnapshotManifest::for_file(&p2, &s2, Some(&root)).unwrap();
        child.save().unwrap();

        let loaded = SnapshotManifest::load(&p2).unwrap().unwrap();
        assert_eq!(loaded.lineage.len(), 2);
        assert!(loaded.verify().unwrap());
        assert!(loaded.descends_from(&root));
        assert!(!root.descends_from(&loaded));
    }

    #[test]
    fn test_manifest_detects_modified_file() {
        let dir = TempDir::new().unwrap();
        let (path, snap) = write(dir.path(), "corpus.parquet", Stage::Export);
        let manifest = SnapshotManifest::for_file(&path, &snap, None).unwrap();
        std::fs::write(&path, b"tampered").unwrap();
        assert!(!manifest.verify().unwrap());
    }

    #[test]
    fn test_verify_at_follows_moved_file() {
        let dir = TempDir::new().unwrap();
        let (path, snap) = write(dir.path(), "corpus.parquet", Stage::Export);
        let manifest = SnapshotManifest::for_file(&path, &snap, None).unwrap();
        let moved = dir.path().join("moved.parquet");
        std::fs::rename(&path, &moved).unwrap();
        assert!(!manifest.verify().unwrap());
        assert!(manifest.verify_at(&moved).unwrap());
    }

    #[test]
    fn test_artifact_manifest_extends_lineage() {
        let dir = TempDir::new().unwrap();
        let (p1, s1) = write(dir.path(), "assigned.parquet", Stage::Assign);
        let parent = SnapshotManifest::for_file(&p1, &s1, None).unwrap();
        let coords = dir.path().join("coords.parquet");
        std::fs::write(&coords, b"xy").unwrap();
        let child =
            SnapshotManifest::for_artifact(&coords, Stage::Project, 1, 2, Some(&parent)).unwrap();
        assert_eq!(child.stage, Stage::Project);
        assert!(child.verify().unwrap());
        assert!(child.descends_from(&parent));
    }

    #[test]
    fn test_manifest_detects_broken_chain() {
        let dir = TempDir::new().unwrap();
        let (path, snap) = write(dir.path(), "corpus.parquet", Stage::Export);
        let mut manifest = SnapshotManifest::for_file(&path, &snap, None).unwrap();
        manifest.lineage[0].hash = "0".repeat(64);
        assert!(!manifest.verify().unwrap());
    }
}
