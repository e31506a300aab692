//! 2D projection of snapshot embeddings.
//!
//! A [`Projector`] maps N embeddings to N coordinate pairs. The result is a
//! [`Projection`] aligned with the snapshot's record order, persisted as its
//! own small Parquet file `(document_id, x, y)`.

pub mod pca;
pub mod umap;

pub use pca::PcaProjector;
pub use umap::{UmapParams, UmapProjector};

use crate::error::{PapermapError, Result};
use crate::persistence;
use crate::snapshot::Snapshot;
use arrow::array::{Array, ArrayRef, Float32Array, RecordBatch, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use async_trait::async_trait;
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

const META_METHOD: &str = "papermap.projection";
const META_SEED: &str = "papermap.seed";

/// Reduces embeddings to 2D coordinates.
#[async_trait]
pub trait Projector: Send + Sync {
    /// Short method name recorded with the coordinates.
    fn method(&self) -> &str;

    fn seed(&self) -> u64;

    /// Project `embeddings` (all the same length) to one `[x, y]` each.
    async fn project(&self, embeddings: &[Vec<f32>]) -> Result<Vec<[f32; 2]>>;
}

/// 2D coordinates for every record of a snapshot, in snapshot order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Projection {
    pub method: String,
    pub seed: u64,
    pub ids: Vec<String>,
    pub coords: Vec<[f32; 2]>,
}

impl Projection {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Coordinates keyed by record id.
    pub fn by_id(&self) -> HashMap<&str, [f32; 2]> {
        self.ids
            .iter()
            .map(String::as_str)
            .zip(self.coords.iter().copied())
            .collect()
    }
}

/// Project every record of `snapshot`, validating the projector's output.
pub async fn project_snapshot(projector: &dyn Projector, snapshot: &Snapshot) -> Result<Projection> {
    let ids: Vec<String> = snapshot.ids().map(String::from).collect();
    let coords = if snapshot.is_empty() {
        Vec::new()
    } else {
        let embeddings: Vec<Vec<f32>> = snapshot
            .records()
            .iter()
            .map(|r| r.embedding.clone())
            .collect();
        projector.project(&embeddings).await?
    };

    if coords.len() != ids.len() {
        return Err(PapermapError::projection(format!(
            "{} returned {} coordinates for {} records",
            projector.method(),
            coords.len(),
            ids.len()
        )));
    }
    if let Some((id, _)) = ids
        .iter()
        .zip(&coords)
        .find(|(_, [x, y])| !x.is_finite() || !y.is_finite())
    {
        return Err(PapermapError::projection(format!(
            "{} produced a non-finite coordinate for record '{id}'",
            projector.method()
        )));
    }

    info!(
        method = projector.method(),
        seed = projector.seed(),
        points = ids.len(),
        dim = snapshot.embedding_dim(),
        "Projection complete"
    );
    Ok(Projection {
        method: projector.method().to_string(),
        seed: projector.seed(),
        ids,
        coords,
    })
}

fn coords_schema(method: &str, seed: u64) -> Schema {
    Schema::new_with_metadata(
        vec![
            Field::new("document_id", DataType::Utf8, false),
            Field::new("x", DataType::Float32, false),
            Field::new("y", DataType::Float32, false),
        ],
        HashMap::from([
            (META_METHOD.to_string(), method.to_string()),
            (META_SEED.to_string(), seed.to_string()),
        ]),
    )
}

/// Write a projection as Parquet.
pub fn write_coordinates(path: &Path, projection: &Projection) -> Result<()> {
    let schema: SchemaRef = Arc::new(coords_schema(&projection.method, projection.seed));
    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from_iter_values(projection.ids.iter())),
        Arc::new(Float32Array::from_iter_values(
            projection.coords.iter().map(|c| c[0]),
        )),
        Arc::new(Float32Array::from_iter_values(
            projection.coords.iter().map(|c| c[1]),
        )),
    ];
    let batch = RecordBatch::try_new(schema.clone(), columns)?;

    let mut writer = ArrowWriter::try_new(Vec::new(), schema, None)?;
    writer.write(&batch)?;
    let bytes = writer.into_inner()?;
    persistence::atomic_write(path, &bytes)?;
    info!(path = %path.display(), points = projection.len(), "Coordinates written");
    Ok(())
}

fn typed_column<'a, T: 'static>(batch: &'a RecordBatch, name: &str, path: &Path) -> Result<&'a T> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<T>())
        .ok_or_else(|| {
            PapermapError::schema_mismatch(path, format!("missing or mistyped column '{name}'"))
        })
}

/// Read a projection written by [`write_coordinates`].
pub fn read_coordinates(path: &Path) -> Result<Projection> {
    let file = std::fs::File::open(path)?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
    let meta = builder.schema().metadata().clone();
    let method = meta
        .get(META_METHOD)
        .cloned()
        .ok_or_else(|| PapermapError::schema_mismatch(path, "no projection method in metadata"))?;
    let seed = meta
        .get(META_SEED)
        .and_then(|s| s.parse().ok())
        .unwrap_or_default();

    let mut ids = Vec::new();
    let mut coords = Vec::new();
    for batch in builder.build()? {
        let batch = batch?;
        let id = typed_column::<StringArray>(&batch, "document_id", path)?;
        let x = typed_column::<Float32Array>(&batch, "x", path)?;
        let y = typed_column::<Float32Array>(&batch, "y", path)?;
        if id.null_count() > 0 {
            return Err(PapermapError::schema_mismatch(path, "null document_id"));
        }
        for i in 0..batch.num_rows() {
            ids.push(id.value(i).to_string());
            coords.push([x.value(i), y.value(i)]);
        }
    }
    Ok(Projection {
        method,
        seed,
        ids,
        coords,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::fixtures::record;
    use crate::snapshot::Stage;
    use tempfile::TempDir;

    struct Fixed(Vec<[f32; 2]>);

    #[async_trait]
    impl Projector for Fixed {
        fn method(&self) -> &str {
            "fixed"
        }
        fn seed(&self) -> u64 {
            0
        }
        async fn project(&self, _embeddings: &[Vec<f32>]) -> Result<Vec<[f32; 2]>> {
            Ok(self.0.clone())
        }
    }

    fn snapshot() -> Snapshot {
        Snapshot::new(
            Stage::Assign,
            vec![
                record("a", "Alpha", vec![1.0, 0.0]),
                record("b", "Beta", vec![0.0, 1.0]),
            ],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_row_count_mismatch_is_error() {
        let err = project_snapshot(&Fixed(vec![[0.0, 0.0]]), &snapshot())
            .await
            .unwrap_err();
        assert!(matches!(err, PapermapError::Projection(_)));
    }

    #[tokio::test]
    async fn test_non_finite_coordinate_is_error() {
        let err = project_snapshot(&Fixed(vec![[0.0, 0.0], [f32::NAN, 1.0]]), &snapshot())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("'b'"));
    }

    #[tokio::test]
    async fn test_coordinates_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("coords.parquet");
        let proj = project_snapshot(&Fixed(vec![[0.5, -1.0], [2.0, 3.0]]), &snapshot())
            .await
            .unwrap();
        write_coordinates(&path, &proj).unwrap();
        let loaded = read_coordinates(&path).unwrap();
        assert_eq!(loaded, proj);
        assert_eq!(loaded.by_id()["b"], [2.0, 3.0]);
    }
}
