//! Arrow schema and Parquet I/O for snapshots.
//!
//! The schema is fixed and versioned. The version, the producing stage and the
//! embedding dimensionality travel in the Arrow schema metadata, which the
//! Parquet writer embeds in the file footer. Files are written in row groups of
//! `rows_per_group` records and land on disk atomically.

use super::{Snapshot, Stage};
use crate::error::{PapermapError, Result};
use crate::persistence;
use crate::record::PaperRecord;
use arrow::array::{
    Array, ArrayRef, FixedSizeListArray, FixedSizeListBuilder, Float32Array, Float32Builder,
    Int32Array, Int32Builder, Int64Array, Int64Builder, ListArray, ListBuilder, RecordBatch,
    StringArray, StringBuilder, UInt64Array, UInt64Builder,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Current snapshot schema version.
pub const SCHEMA_VERSION: u32 = 1;

const META_VERSION: &str = "papermap.schema_version";
const META_STAGE: &str = "papermap.stage";
const META_DIM: &str = "papermap.embedding_dim";

fn item_field(dtype: DataType) -> Arc<Field> {
    Arc::new(Field::new("item", dtype, true))
}

/// An empty snapshot has dimension 0 in its metadata but a width-1 column type.
fn embedding_type(dim: usize) -> DataType {
    DataType::FixedSizeList(item_field(DataType::Float32), dim.max(1) as i32)
}

/// Arrow schema for a snapshot of the given stage and embedding dimension.
pub fn snapshot_schema(stage: Stage, dim: usize) -> Schema {
    let fields = vec![
        Field::new("document_id", DataType::Utf8, false),
        Field::new("title", DataType::Utf8, false),
        Field::new("normalized_title", DataType::Utf8, false),
        Field::new("authors", DataType::List(item_field(DataType::Utf8)), false),
        Field::new("year", DataType::Int32, true),
        Field::new("abstract", DataType::Utf8, true),
        Field::new("document_summary", DataType::Utf8, true),
        Field::new("file_path", DataType::Utf8, false),
        Field::new("content_hash", DataType::Utf8, false),
        Field::new("document_embedding", embedding_type(dim), false),
        Field::new("cluster_id", DataType::Int64, true),
        Field::new("cluster_label", DataType::Utf8, true),
        Field::new("macro_category", DataType::Utf8, true),
        Field::new("micro_topic_name", DataType::Utf8, true),
        Field::new("drive_url", DataType::Utf8, true),
        Field::new("research_question", DataType::Utf8, true),
        Field::new("indexed_at", DataType::Utf8, true),
        Field::new("ingest_seq", DataType::UInt64, false),
    ];
    let metadata = HashMap::from([
        (META_VERSION.to_string(), SCHEMA_VERSION.to_string()),
        (META_STAGE.to_string(), stage.as_str().to_string()),
        (META_DIM.to_string(), dim.to_string()),
    ]);
    Schema::new_with_metadata(fields, metadata)
}

/// Convert records into a single Arrow batch.
pub fn to_record_batch(schema: SchemaRef, records: &[PaperRecord], dim: usize) -> Result<RecordBatch> {
    let n = records.len();
    let mut id = StringBuilder::new();
    let mut title = StringBuilder::new();
    let mut norm = StringBuilder::new();
    let mut authors = ListBuilder::new(StringBuilder::new());
    let mut year = Int32Builder::with_capacity(n);
    let mut abstract_text = StringBuilder::new();
    let mut summary = StringBuilder::new();
    let mut file_path = StringBuilder::new();
    let mut content_hash = StringBuilder::new();
    let mut embedding =
        FixedSizeListBuilder::with_capacity(Float32Builder::with_capacity(n * dim), dim as i32, n);
    let mut cluster_id = Int64Builder::with_capacity(n);
    let mut cluster_label = StringBuilder::new();
    let mut category = StringBuilder::new();
    let mut micro_topic = StringBuilder::new();
    let mut link = StringBuilder::new();
    let mut question = StringBuilder::new();
    let mut indexed_at = StringBuilder::new();
    let mut seq = UInt64Builder::with_capacity(n);

    for rec in records {
        if rec.embedding_dim() != dim {
            return Err(PapermapError::DimensionMismatch {
                record_id: rec.id.clone(),
                expected: dim,
                actual: rec.embedding_dim(),
            });
        }
        id.append_value(&rec.id);
        title.append_value(&rec.title);
        norm.append_value(&rec.normalized_title);
        for author in &rec.authors {
            authors.values().append_value(author);
        }
        authors.append(true);
        year.append_option(rec.year);
        abstract_text.append_option(rec.abstract_text.as_deref());
        summary.append_option(rec.summary.as_deref());
        file_path.append_value(&rec.file_path);
        content_hash.append_value(&rec.content_hash);
        embedding.values().append_slice(&rec.embedding);
        embedding.append(true);
        cluster_id.append_option(rec.cluster_id);
        cluster_label.append_option(rec.cluster_label.as_deref());
        category.append_option(rec.macro_category.as_deref());
        micro_topic.append_option(rec.micro_topic.as_deref());
        link.append_option(rec.link.as_deref());
        question.append_option(rec.research_question.as_deref());
        indexed_at.append_option(rec.indexed_at.map(|t| t.to_rfc3339()));
        seq.append_value(rec.ingest_seq);
    }

    let columns: Vec<ArrayRef> = vec![
        Arc::new(id.finish()),
        Arc::new(title.finish()),
        Arc::new(norm.finish()),
        Arc::new(authors.finish()),
        Arc::new(year.finish()),
        Arc::new(abstract_text.finish()),
        Arc::new(summary.finish()),
        Arc::new(file_path.finish()),
        Arc::new(content_hash.finish()),
        Arc::new(embedding.finish()),
        Arc::new(cluster_id.finish()),
        Arc::new(cluster_label.finish()),
        Arc::new(category.finish()),
        Arc::new(micro_topic.finish()),
        Arc::new(link.finish()),
        Arc::new(question.finish()),
        Arc::new(indexed_at.finish()),
        Arc::new(seq.finish()),
    ];
    Ok(RecordBatch::try_new(schema, columns)?)
}

fn column<'a, T: 'static>(batch: &'a RecordBatch, name: &str, path: &Path) -> Result<&'a T> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<T>())
        .ok_or_else(|| {
            PapermapError::schema_mismatch(
                path,
                format!("column '{name}' is missing or has an unexpected type"),
            )
        })
}

fn opt_string(array: &StringArray, i: usize) -> Option<String> {
    if array.is_null(i) {
        None
    } else {
        Some(array.value(i).to_string())
    }
}

/// Convert an Arrow batch back into records.
pub fn from_record_batch(batch: &RecordBatch, path: &Path) -> Result<Vec<PaperRecord>> {
    let id = column::<StringArray>(batch, "document_id", path)?;
    let title = column::<StringArray>(batch, "title", path)?;
    let norm = column::<StringArray>(batch, "normalized_title", path)?;
    let authors = column::<ListArray>(batch, "authors", path)?;
    let year = column::<Int32Array>(batch, "year", path)?;
    let abstract_text = column::<StringArray>(batch, "abstract", path)?;
    let summary = column::<StringArray>(batch, "document_summary", path)?;
    let file_path = column::<StringArray>(batch, "file_path", path)?;
    let content_hash = column::<StringArray>(batch, "content_hash", path)?;
    let embedding = column::<FixedSizeListArray>(batch, "document_embedding", path)?;
    let cluster_id = column::<Int64Array>(batch, "cluster_id", path)?;
    let cluster_label = column::<StringArray>(batch, "cluster_label", path)?;
    let category = column::<StringArray>(batch, "macro_category", path)?;
    let micro_topic = column::<StringArray>(batch, "micro_topic_name", path)?;
    let link = column::<StringArray>(batch, "drive_url", path)?;
    let question = column::<StringArray>(batch, "research_question", path)?;
    let indexed_at = column::<StringArray>(batch, "indexed_at", path)?;
    let seq = column::<UInt64Array>(batch, "ingest_seq", path)?;

    let mut records = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        let record_id = id.value(i).to_string();

        let author_values = authors.value(i);
        let author_values = author_values
            .as_any()
            .downcast_ref::<StringArray>()
            .ok_or_else(|| PapermapError::schema_mismatch(path, "authors is not a list of strings"))?;
        let author_list = (0..author_values.len())
            .filter(|j| !author_values.is_null(*j))
            .map(|j| author_values.value(j).to_string())
            .collect();

        let vector = embedding.value(i);
        let vector = vector
            .as_any()
            .downcast_ref::<Float32Array>()
            .ok_or_else(|| {
                PapermapError::schema_mismatch(path, "document_embedding is not a float32 list")
            })?
            .values()
            .to_vec();

        let indexed = match opt_string(indexed_at, i) {
            Some(raw) => Some(
                DateTime::parse_from_rfc3339(&raw)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|e| {
                        PapermapError::schema_mismatch(
                            path,
                            format!("record '{record_id}' has invalid indexed_at '{raw}': {e}"),
                        )
                    })?,
            ),
            None => None,
        };

        records.push(PaperRecord {
            id: record_id,
            title: title.value(i).to_string(),
            normalized_title: norm.value(i).to_string(),
            authors: author_list,
            year: (!year.is_null(i)).then(|| year.value(i)),
            abstract_text: opt_string(abstract_text, i),
            summary: opt_string(summary, i),
            file_path: file_path.value(i).to_string(),
            content_hash: content_hash.value(i).to_string(),
            embedding: vector,
            cluster_id: (!cluster_id.is_null(i)).then(|| cluster_id.value(i)),
            cluster_label: opt_string(cluster_label, i),
            macro_category: opt_string(category, i),
            micro_topic: opt_string(micro_topic, i),
            link: opt_string(link, i),
            research_question: opt_string(question, i),
            indexed_at: indexed,
            ingest_seq: seq.value(i),
        });
    }
    Ok(records)
}

/// Write a snapshot to `path` as Parquet, one row group per `rows_per_group` records.
pub fn write_snapshot(path: &Path, snapshot: &Snapshot, rows_per_group: usize) -> Result<()> {
    let dim = snapshot.embedding_dim();
    let schema: SchemaRef = Arc::new(snapshot_schema(snapshot.stage(), dim));
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();

    let mut writer = ArrowWriter::try_new(Vec::new(), schema.clone(), Some(props))?;
    for chunk in snapshot.records().chunks(rows_per_group.max(1)) {
        let batch = to_record_batch(schema.clone(), chunk, dim)?;
        writer.write(&batch)?;
        writer.flush()?;
    }
    let bytes = writer.into_inner()?;

    persistence::atomic_write(path, &bytes)?;
    info!(
        path = %path.display(),
        stage = %snapshot.stage(),
        rows = snapshot.len(),
        dim,
        "Snapshot written"
    );
    Ok(())
}

fn check_schema(file_schema: &Schema, path: &Path) -> Result<(Stage, usize)> {
    let meta = file_schema.metadata();
    let version = meta
        .get(META_VERSION)
        .ok_or_else(|| PapermapError::schema_mismatch(path, "no schema version in metadata"))?;
    if version != &SCHEMA_VERSION.to_string() {
        return Err(PapermapError::schema_mismatch(
            path,
            format!("schema version {version}, expected {SCHEMA_VERSION}"),
        ));
    }
    let stage: Stage = meta
        .get(META_STAGE)
        .ok_or_else(|| PapermapError::schema_mismatch(path, "no stage in metadata"))?
        .parse()
        .map_err(|e: String| PapermapError::schema_mismatch(path, e))?;
    let dim: usize = meta
        .get(META_DIM)
        .and_then(|d| d.parse().ok())
        .ok_or_else(|| PapermapError::schema_mismatch(path, "no embedding dimension in metadata"))?;

    let expected = snapshot_schema(stage, dim);
    let missing: Vec<&str> = expected
        .fields()
        .iter()
        .filter(|field| {
            file_schema
                .field_with_name(field.name())
                .map(|found| found.data_type() != field.data_type())
                .unwrap_or(true)
        })
        .map(|field| field.name().as_str())
        .collect();
    if !missing.is_empty() {
        return Err(PapermapError::schema_mismatch(
            path,
            format!("missing or mistyped columns: {}", missing.join(", ")),
        ));
    }
    Ok((stage, dim))
}

/// Read a snapshot written by [`write_snapshot`].
pub fn read_snapshot(path: &Path) -> Result<Snapshot> {
    let file = std::fs::File::open(path)?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
    let (stage, dim) = check_schema(builder.schema(), path)?;
    let reader = builder.build()?;

    let mut records = Vec::new();
    for batch in reader {
        records.extend(from_record_batch(&batch?, path)?);
    }
    debug!(path = %path.display(), stage = %stage, rows = records.len(), dim, "Snapshot read");
    Snapshot::new(stage, records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::fixtures::record;
    use tempfile::TempDir;

    fn sample() -> Snapshot {
        let mut a = record("a", "Graph Neural Networks", vec![0.1, 0.2, 0.3]);
        a.authors = vec!["Kim".into(), "Lee".into()];
        a.year = Some(2020);
        a.cluster_id = Some(4);
        a.cluster_label = Some("Graphs".into());
        a.macro_category = Some("Machine Learning".into());
        a.link = Some("https://drive.example/a".into());
        a.indexed_at = Some("2024-03-01T12:00:00Z".parse().unwrap());
        a.ingest_seq = 0;
        let mut b = record("b", "Protein Folding", vec![0.9, 0.1, 0.0]);
        b.ingest_seq = 1;
        Snapshot::new(Stage::Dedup, vec![a, b]).unwrap()
    }

    #[test]
    fn test_write_then_read_preserves_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("deduped.parquet");
        let snap = sample();
        write_snapshot(&path, &snap, 1).unwrap();

        let loaded = read_snapshot(&path).unwrap();
        assert_eq!(loaded.stage(), Stage::Dedup);
        assert_eq!(loaded.embedding_dim(), 3);
        pretty_assertions::assert_eq!(loaded, snap);
    }

    #[test]
    fn test_empty_snapshot_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.parquet");
        let snap = Snapshot::new(Stage::Export, Vec::new()).unwrap();
        write_snapshot(&path, &snap, 100).unwrap();
        let loaded = read_snapshot(&path).unwrap();
        assert!(loaded.is_empty());
        assert_eq!(loaded.stage(), Stage::Export);
    }

    #[test]
    fn test_foreign_parquet_is_schema_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("foreign.parquet");

        let schema = Arc::new(Schema::new(vec![Field::new("title", DataType::Utf8, false)]));
        let titles: ArrayRef = Arc::new(StringArray::from(vec!["x"]));
        let batch = RecordBatch::try_new(schema.clone(), vec![titles]).unwrap();
        let mut writer = ArrowWriter::try_new(Vec::new(), schema, None).unwrap();
        writer.write(&batch).unwrap();
        std::fs::write(&path, writer.into_inner().unwrap()).unwrap();

        let err = read_snapshot(&path).unwrap_err();
        assert!(matches!(err, PapermapError::SchemaMismatch { .. }));
    }

    #[test]
    fn test_missing_column_is_reported_by_name() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partial.parquet");

        let full = snapshot_schema(Stage::Export, 2);
        let fields: Vec<Field> = full
            .fields()
            .iter()
            .filter(|f| f.name() != "content_hash")
            .map(|f| (**f).clone())
            .collect();
        let schema = Arc::new(Schema::new_with_metadata(fields, full.metadata().clone()));
        let mut writer = ArrowWriter::try_new(Vec::new(), schema, None).unwrap();
        writer.flush().unwrap();
        std::fs::write(&path, writer.into_inner().unwrap()).unwrap();

        let err = read_snapshot(&path).unwrap_err();
        assert!(err.to_string().contains("content_hash"));
    }
}
