//! Stage output persistence: atomic writes and content hashing.
//!
//! Every artifact a stage produces is written to a `.partial` sibling and
//! renamed into place only once fully written, so a failed stage never leaves
//! a half-written snapshot that a later stage could pick up.

use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".partial");
    path.with_file_name(name)
}

/// Atomically write raw bytes to `path`, creating parent directories.
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let partial = partial_path(path);
    if let Err(e) = std::fs::write(&partial, data) {
        let _ = std::fs::remove_file(&partial);
        return Err(e);
    }
    std::fs::rename(&partial, path)
}

/// Atomically write `data` as pretty-printed JSON.
pub fn atomic_write_json<T: serde::Serialize>(path: &Path, data: &T) -> io::Result<()> {
    let json = serde_json::to_string_pretty(data).map_err(io::Error::other)?;
    atomic_write(path, json.as_bytes())
}

/// Load JSON from `path`, returning `Ok(None)` when the file does not exist.
pub fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read_to_string(path)?;
    let value =
        serde_json::from_str(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some(value))
}

/// SHA-256 hex digest of arbitrary bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// SHA-256 hex digest of a file's contents.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let content = std::fs::read(path)?;
    Ok(sha256_hex(&content))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct StageLog {
        stage: String,
        rows: usize,
    }

    #[test]
    fn test_json_roundtrip_through_atomic_write() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs").join("dedupe.json");
        let log = StageLog {
            stage: "dedup".into(),
            rows: 12,
        };
        atomic_write_json(&path, &log).unwrap();
        let loaded: Option<StageLog> = load_json(&path).unwrap();
        assert_eq!(loaded, Some(log));
    }

    #[test]
    fn test_no_partial_file_left_behind() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("corpus.parquet");
        atomic_write(&path, b"PAR1").unwrap();
        assert!(path.exists());
        assert!(!dir.path().join("corpus.parquet.partial").exists());
    }

    #[test]
    fn test_load_json_missing_file() {
        let loaded: Option<StageLog> = load_json(Path::new("/nonexistent/stage.json")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_hash_file_matches_bytes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.bin");
        atomic_write(&path, b"hello").unwrap();
        assert_eq!(hash_file(&path).unwrap(), sha256_hex(b"hello"));
    }
}
