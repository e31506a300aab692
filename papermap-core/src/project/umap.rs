//! UMAP projection through `umap-learn` in a Python subprocess.

use super::Projector;
use super::pca::pca_2d;
use crate::error::{PapermapError, Result};
use crate::runtime::PythonRuntime;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

const UMAP_SCRIPT: &str = r#"
import json, sys
import numpy as np
import umap

req = json.load(sys.stdin)
x = np.asarray(req["embeddings"], dtype=np.float32)
reducer = umap.UMAP(
    n_components=2,
    n_neighbors=min(req["n_neighbors"], len(x) - 1),
    min_dist=req["min_dist"],
    metric=req["metric"],
    random_state=req["seed"],
)
coords = reducer.fit_transform(x)
json.dump({"coords": coords.astype(float).tolist()}, sys.stdout)
"#;

/// Fewer points than this cannot form a UMAP neighbor graph.
const MIN_POINTS: usize = 4;

/// UMAP hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UmapParams {
    pub n_neighbors: usize,
    pub min_dist: f32,
    pub metric: String,
    pub seed: u64,
}

impl Default for UmapParams {
    fn default() -> Self {
        Self {
            n_neighbors: 15,
            min_dist: 0.1,
            metric: "cosine".to_string(),
            seed: 42,
        }
    }
}

#[derive(Debug, Serialize)]
struct UmapRequest<'a> {
    embeddings: &'a [Vec<f32>],
    n_neighbors: usize,
    min_dist: f32,
    metric: &'a str,
    seed: u64,
}

#[derive(Debug, Deserialize)]
struct UmapResponse {
    coords: Vec<[f32; 2]>,
}

pub struct UmapProjector {
    runtime: PythonRuntime,
    params: UmapParams,
}

impl UmapProjector {
    pub fn new(runtime: PythonRuntime, params: UmapParams) -> Self {
        Self { runtime, params }
    }

    /// Check that the interpreter can import `umap` and `numpy`.
    pub async fn available(&self) -> bool {
        self.runtime.has_module("umap").await && self.runtime.has_module("numpy").await
    }

    fn request<'a>(&'a self, embeddings: &'a [Vec<f32>]) -> UmapRequest<'a> {
        UmapRequest {
            embeddings,
            n_neighbors: self.params.n_neighbors.max(2),
            min_dist: self.params.min_dist,
            metric: &self.params.metric,
            seed: self.params.seed,
        }
    }
}

#[async_trait]
impl Projector for UmapProjector {
    fn method(&self) -> &str {
        "umap"
    }

    fn seed(&self) -> u64 {
        self.params.seed
    }

    async fn project(&self, embeddings: &[Vec<f32>]) -> Result<Vec<[f32; 2]>> {
        if embeddings.len() < MIN_POINTS {
            warn!(
                points = embeddings.len(),
                "Too few points for UMAP, using PCA layout"
            );
            return pca_2d(embeddings, self.params.seed);
        }

        info!(
            points = embeddings.len(),
            n_neighbors = self.params.n_neighbors,
            min_dist = self.params.min_dist,
            metric = %self.params.metric,
            "Running UMAP"
        );
        let input = serde_json::to_value(self.request(embeddings))?;
        let output = self.runtime.run_json_script(UMAP_SCRIPT, &input).await?;
        let response: UmapResponse = serde_json::from_value(output)
            .map_err(|e| PapermapError::projection(format!("unexpected UMAP output: {e}")))?;
        Ok(response.coords)
    }
}
