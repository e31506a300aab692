//! SQLite-backed embedding store.
//!
//! Layout:
//! - `documents`: one row per paper. `document_embedding` is a little-endian
//!   `f32` BLOB (a JSON array in a TEXT cell is also accepted); `authors` is a
//!   JSON array of strings.
//! - `clusters`: `(cluster_id INTEGER PRIMARY KEY, label TEXT)`, optional.
//!
//! Only the required columns must exist; optional columns that are absent read
//! as NULL. The store is opened read-only for export.

use super::{CorpusStore, StoreInfo, StoredPaper};
use crate::error::{PapermapError, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags, params};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Columns every documents table must have.
pub const REQUIRED_COLUMNS: &[&str] = &["document_id", "title", "file_path", "document_embedding"];

const OPTIONAL_COLUMNS: &[&str] = &[
    "authors",
    "year",
    "abstract",
    "document_summary",
    "content_hash",
    "cluster_id",
    "macro_category",
    "micro_topic_name",
    "drive_url",
    "q01_research_question",
    "indexed_at",
];

/// SQLite paper store.
#[derive(Debug, Clone)]
pub struct SqliteCorpusStore {
    db_path: PathBuf,
    documents_table: String,
    clusters_table: String,
}

fn check_identifier(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(PapermapError::config(format!("invalid table name '{name}'")))
    }
}

impl SqliteCorpusStore {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            documents_table: "documents".to_string(),
            clusters_table: "clusters".to_string(),
        }
    }

    /// Use non-default table names.
    pub fn with_tables(mut self, documents: &str, clusters: &str) -> Result<Self> {
        check_identifier(documents)?;
        check_identifier(clusters)?;
        self.documents_table = documents.to_string();
        self.clusters_table = clusters.to_string();
        Ok(self)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Create an empty store with the full documents and clusters layout.
    pub fn create(db_path: impl Into<PathBuf>) -> Result<Self> {
        let store = Self::new(db_path);
        let conn = Connection::open(&store.db_path)?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {docs} (
                document_id TEXT PRIMARY KEY,
                title TEXT,
                authors TEXT,
                year INTEGER,
                abstract TEXT,
                document_summary TEXT,
                file_path TEXT,
                content_hash TEXT,
                document_embedding BLOB,
                cluster_id INTEGER,
                macro_category TEXT,
                micro_topic_name TEXT,
                drive_url TEXT,
                q01_research_question TEXT,
                indexed_at TEXT
            );
            CREATE TABLE IF NOT EXISTS {clusters} (
                cluster_id INTEGER PRIMARY KEY,
                label TEXT NOT NULL
            );",
            docs = store.documents_table,
            clusters = store.clusters_table,
        ))?;
        Ok(store)
    }

    /// Insert one paper row (used to seed stores).
    pub fn insert_paper(&self, paper: &StoredPaper) -> Result<()> {
        let conn = Connection::open(&self.db_path)?;
        let authors = serde_json::to_string(&paper.authors)?;
        let embedding = paper.embedding.as_deref().map(encode_embedding);
        conn.execute(
            &format!(
                "INSERT INTO {} (document_id, title, authors, year, abstract, document_summary,
                    file_path, content_hash, document_embedding, cluster_id, macro_category,
                    micro_topic_name, drive_url, q01_research_question, indexed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                self.documents_table
            ),
            params![
                paper.document_id,
                paper.title,
                authors,
                paper.year,
                paper.abstract_text,
                paper.summary,
                paper.file_path,
                paper.content_hash,
                embedding,
                paper.cluster_id,
                paper.macro_category,
                paper.micro_topic,
                paper.drive_url,
                paper.research_question,
                paper.indexed_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    /// Insert or replace a cluster label.
    pub fn insert_cluster(&self, cluster_id: i64, label: &str) -> Result<()> {
        let conn = Connection::open(&self.db_path)?;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {} (cluster_id, label) VALUES (?1, ?2)",
                self.clusters_table
            ),
            params![cluster_id, label],
        )?;
        Ok(())
    }

    fn open_read_only(path: &Path) -> Result<Connection> {
        Ok(Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY,
        )?)
    }
}

/// Column names of `table`, empty if the table does not exist.
fn table_columns(conn: &Connection, table: &str) -> Result<HashSet<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<HashSet<String>>>()?;
    Ok(names)
}

pub(crate) fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_embedding(value: ValueRef<'_>, id: &str, db: &Path) -> Result<Option<Vec<f32>>> {
    match value {
        ValueRef::Null => Ok(None),
        ValueRef::Blob(bytes) => {
            if bytes.len() % 4 != 0 {
                return Err(PapermapError::schema_mismatch(
                    db,
                    format!(
                        "record '{id}' has an embedding blob of {} bytes, not a multiple of 4",
                        bytes.len()
                    ),
                ));
            }
            Ok(Some(
                bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ))
        }
        ValueRef::Text(text) => serde_json::from_slice::<Vec<f32>>(text)
            .map(Some)
            .map_err(|e| {
                PapermapError::schema_mismatch(
                    db,
                    format!("record '{id}' has a non-numeric embedding: {e}"),
                )
            }),
        _ => Err(PapermapError::schema_mismatch(
            db,
            format!("record '{id}' has a scalar embedding"),
        )),
    }
}

fn text(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Text(t) => Some(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Integer(n) => Some(n.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Null | ValueRef::Blob(_) => None,
    }
}

fn integer(value: ValueRef<'_>) -> Option<i64> {
    match value {
        ValueRef::Integer(n) => Some(n),
        // Pandas writes nullable integer columns as REAL.
        ValueRef::Real(f) if f.is_finite() => Some(f as i64),
        ValueRef::Text(t) => std::str::from_utf8(t).ok()?.trim().parse().ok(),
        _ => None,
    }
}

fn authors(value: ValueRef<'_>) -> Vec<String> {
    let Some(raw) = text(value) else {
        return Vec::new();
    };
    match serde_json::from_str::<Vec<String>>(&raw) {
        Ok(list) => list,
        Err(_) => raw
            .split(';')
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect(),
    }
}

fn timestamp(value: ValueRef<'_>) -> Option<DateTime<Utc>> {
    let raw = text(value)?;
    if let Ok(t) = DateTime::parse_from_rfc3339(&raw) {
        return Some(t.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|t| t.and_utc())
}

fn read_documents(db_path: &Path, table: &str) -> Result<Vec<StoredPaper>> {
    let conn = SqliteCorpusStore::open_read_only(db_path)?;
    let present = table_columns(&conn, table)?;
    let missing: Vec<&str> = REQUIRED_COLUMNS
        .iter()
        .copied()
        .filter(|c| !present.contains(*c))
        .collect();
    if !missing.is_empty() {
        return Err(PapermapError::schema_mismatch(
            db_path,
            format!("table '{table}' lacks required columns: {}", missing.join(", ")),
        ));
    }

    let select: Vec<String> = REQUIRED_COLUMNS
        .iter()
        .chain(OPTIONAL_COLUMNS)
        .map(|c| {
            if present.contains(*c) {
                (*c).to_string()
            } else {
                format!("NULL AS {c}")
            }
        })
        .collect();
    let absent: Vec<&&str> = OPTIONAL_COLUMNS
        .iter()
        .filter(|c| !present.contains(**c))
        .collect();
    if !absent.is_empty() {
        debug!(?absent, "Optional document columns not present");
    }

    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM {table} ORDER BY rowid",
        select.join(", ")
    ))?;
    let mut rows = stmt.query([])?;
    let mut papers = Vec::new();
    while let Some(row) = rows.next()? {
        let document_id = text(row.get_ref(0)?);
        let id_for_errors = document_id
            .clone()
            .unwrap_or_else(|| format!("<row {}>", papers.len()));
        let paper = StoredPaper {
            title: text(row.get_ref(1)?),
            file_path: text(row.get_ref(2)?),
            embedding: decode_embedding(row.get_ref(3)?, &id_for_errors, db_path)?,
            authors: authors(row.get_ref(4)?),
            year: integer(row.get_ref(5)?),
            abstract_text: text(row.get_ref(6)?),
            summary: text(row.get_ref(7)?),
            content_hash: text(row.get_ref(8)?),
            cluster_id: integer(row.get_ref(9)?),
            macro_category: text(row.get_ref(10)?),
            micro_topic: text(row.get_ref(11)?),
            drive_url: text(row.get_ref(12)?),
            research_question: text(row.get_ref(13)?),
            indexed_at: timestamp(row.get_ref(14)?),
            document_id,
        };
        papers.push(paper);
    }
    Ok(papers)
}

fn read_labels(db_path: &Path, table: &str) -> Result<BTreeMap<i64, String>> {
    let conn = SqliteCorpusStore::open_read_only(db_path)?;
    let present = table_columns(&conn, table)?;
    if present.is_empty() {
        warn!(table, "Cluster label table not found, clusters will be unlabeled");
        return Ok(BTreeMap::new());
    }
    if !present.contains("cluster_id") || !present.contains("label") {
        return Err(PapermapError::schema_mismatch(
            db_path,
            format!("table '{table}' needs cluster_id and label columns"),
        ));
    }
    let mut stmt = conn.prepare(&format!("SELECT cluster_id, label FROM {table}"))?;
    let mut rows = stmt.query([])?;
    let mut labels = BTreeMap::new();
    while let Some(row) = rows.next()? {
        if let (Some(id), Some(label)) = (integer(row.get_ref(0)?), text(row.get_ref(1)?)) {
            labels.insert(id, label);
        }
    }
    Ok(labels)
}

#[async_trait]
impl CorpusStore for SqliteCorpusStore {
    async fn read_papers(&self) -> Result<Vec<StoredPaper>> {
        let db_path = self.db_path.clone();
        let table = self.documents_table.clone();
        // rusqlite is blocking
        tokio::task::spawn_blocking(move || read_documents(&db_path, &table))
            .await
            .map_err(|e| PapermapError::config(format!("SQLite task join error: {e}")))?
    }

    async fn cluster_labels(&self) -> Result<BTreeMap<i64, String>> {
        let db_path = self.db_path.clone();
        let table = self.clusters_table.clone();
        tokio::task::spawn_blocking(move || read_labels(&db_path, &table))
            .await
            .map_err(|e| PapermapError::config(format!("SQLite task join error: {e}")))?
    }

    fn info(&self) -> StoreInfo {
        StoreInfo {
            kind: "sqlite".to_string(),
            location: self.db_path.display().to_string(),
            accessed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn paper(id: &str, embedding: Vec<f32>) -> StoredPaper {
        StoredPaper {
            document_id: Some(id.into()),
            title: Some(format!("Paper {id}")),
            authors: vec!["Noether".into(), "Hilbert".into()],
            year: Some(2019),
            file_path: Some(format!("pdfs/{id}.pdf")),
            embedding: Some(embedding),
            cluster_id: Some(1),
            indexed_at: Some("2023-05-01T08:00:00Z".parse().unwrap()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_seed_and_read_back() {
        let dir = TempDir::new().unwrap();
        let store = SqliteCorpusStore::create(dir.path().join("corpus.db")).unwrap();
        store.insert_paper(&paper("a", vec![0.25, -1.5])).unwrap();
        store.insert_paper(&paper("b", vec![1.0, 2.0])).unwrap();
        store.insert_cluster(1, "Algebra").unwrap();

        let papers = store.read_papers().await.unwrap();
        assert_eq!(papers.len(), 2);
        assert_eq!(papers[0], paper("a", vec![0.25, -1.5]));
        assert_eq!(papers[1].document_id.as_deref(), Some("b"));

        let labels = store.cluster_labels().await.unwrap();
        assert_eq!(labels.get(&1).map(String::as_str), Some("Algebra"));
    }

    #[tokio::test]
    async fn test_missing_required_column_is_schema_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("legacy.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch("CREATE TABLE documents (document_id TEXT, title TEXT);")
            .unwrap();
        drop(conn);

        let err = SqliteCorpusStore::new(&path).read_papers().await.unwrap_err();
        let msg = err.to_string();
        assert!(matches!(err, PapermapError::SchemaMismatch { .. }));
        assert!(msg.contains("file_path"));
        assert!(msg.contains("document_embedding"));
    }

    #[tokio::test]
    async fn test_minimal_table_and_json_embeddings() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("minimal.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE documents (document_id TEXT, title TEXT, file_path TEXT,
                document_embedding TEXT, cluster_id REAL);
             INSERT INTO documents VALUES ('x', 'X', 'x.pdf', '[1.0, 0.5]', 3.0);
             INSERT INTO documents VALUES ('y', 'Y', 'y.pdf', NULL, NULL);",
        )
        .unwrap();
        drop(conn);

        let store = SqliteCorpusStore::new(&path);
        let papers = store.read_papers().await.unwrap();
        assert_eq!(papers[0].embedding, Some(vec![1.0, 0.5]));
        assert_eq!(papers[0].cluster_id, Some(3));
        assert!(papers[0].authors.is_empty());
        assert_eq!(papers[1].embedding, None);
        assert!(store.cluster_labels().await.unwrap().is_empty());
    }

    #[test]
    fn test_table_names_are_validated() {
        assert!(SqliteCorpusStore::new("x.db")
            .with_tables("documents; DROP TABLE x", "clusters")
            .is_err());
        assert!(SqliteCorpusStore::new("x.db")
            .with_tables("docs_v2", "clusters_v2")
            .is_ok());
    }

    #[test]
    fn test_embedding_blob_roundtrip() {
        let bytes = encode_embedding(&[1.5, -2.0]);
        let decoded = decode_embedding(ValueRef::Blob(&bytes), "a", Path::new("x.db")).unwrap();
        assert_eq!(decoded, Some(vec![1.5, -2.0]));
        assert!(decode_embedding(ValueRef::Blob(&[0, 1, 2]), "a", Path::new("x.db")).is_err());
    }
}
