//! Stage orchestration over files in the data and output directories.
//!
//! Each stage reads the previous stage's snapshot from disk, runs, and writes
//! its own snapshot plus manifest and report. Stages can be run one at a time
//! from the CLI or all together with [`Pipeline::run_all`].
//!
//! ```text
//! store ──export──▶ corpus.parquet ──dedup──▶ deduped.parquet ──assign──▶ assigned.parquet
//!                                                                            │
//!                                              coords.parquet ◀──project─────┤
//!                                                    │                       │
//!                                                    └────────render─────────┴──▶ map.html, summary.json
//! ```

use crate::assign::{AssignmentReport, assign};
use crate::citations::{CitationIndex, OpenAlexClient, WorkSearch, fetch_citations};
use crate::config::{PapermapConfig, ProjectionMethod};
use crate::dedup::{DedupReport, deduplicate};
use crate::error::{PapermapError, Result};
use crate::export::{ExportReport, export_corpus};
use crate::persistence;
use crate::project::{
    PcaProjector, Projection, Projector, UmapProjector, project_snapshot, read_coordinates,
    write_coordinates,
};
use crate::render::{MapSummary, MarkerSizing, build_map, write_map};
use crate::runtime::PythonRuntime;
use crate::snapshot::{Snapshot, SnapshotManifest, Stage, read_snapshot, write_snapshot};
use crate::store::{CorpusStore, SqliteCorpusStore};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// File locations for every stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelinePaths {
    pub data_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl PipelinePaths {
    pub fn from_config(workspace: &Path, config: &PapermapConfig) -> Self {
        Self {
            data_dir: PapermapConfig::resolve(workspace, &config.paths.data_dir),
            output_dir: PapermapConfig::resolve(workspace, &config.paths.output_dir),
        }
    }

    /// File written by `stage`. The project stage writes `coords.parquet`.
    pub fn snapshot(&self, stage: Stage) -> PathBuf {
        let name = match stage {
            Stage::Export => "corpus.parquet",
            Stage::Dedup => "deduped.parquet",
            Stage::Assign => "assigned.parquet",
            Stage::Project => "coords.parquet",
        };
        self.data_dir.join(name)
    }

    pub fn export_report(&self) -> PathBuf {
        self.data_dir.join("export_report.json")
    }

    pub fn dedupe_log(&self) -> PathBuf {
        self.data_dir.join("dedupe_log.json")
    }

    pub fn assignments(&self) -> PathBuf {
        self.data_dir.join("assignments.json")
    }

    pub fn coordinates(&self) -> PathBuf {
        self.snapshot(Stage::Project)
    }

    pub fn citations(&self) -> PathBuf {
        self.data_dir.join("citations.json")
    }

    pub fn map_html(&self) -> PathBuf {
        self.output_dir.join("map.html")
    }

    pub fn summary(&self) -> PathBuf {
        self.output_dir.join("summary.json")
    }
}

/// Result of one snapshot-producing stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageOutcome {
    pub stage: Stage,
    pub path: PathBuf,
    pub rows_in: usize,
    pub rows_out: usize,
    pub manifest: SnapshotManifest,
}

/// Result of a full run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub export: StageOutcome,
    pub dedup: StageOutcome,
    pub assign: StageOutcome,
    pub projection_method: String,
    pub map_path: PathBuf,
    pub summary: MapSummary,
}

pub struct Pipeline {
    workspace: PathBuf,
    config: PapermapConfig,
    paths: PipelinePaths,
}

impl Pipeline {
    pub fn new(workspace: impl Into<PathBuf>, config: PapermapConfig) -> Self {
        let workspace = workspace.into();
        let paths = PipelinePaths::from_config(&workspace, &config);
        Self {
            workspace,
            config,
            paths,
        }
    }

    pub fn config(&self) -> &PapermapConfig {
        &self.config
    }

    pub fn paths(&self) -> &PipelinePaths {
        &self.paths
    }

    /// The configured SQLite store.
    pub fn open_store(&self) -> Result<SqliteCorpusStore> {
        let store = &self.config.store;
        let db_path = PapermapConfig::resolve(&self.workspace, &store.db_path);
        if !db_path.exists() {
            return Err(PapermapError::config(format!(
                "store database not found: {}",
                db_path.display()
            )));
        }
        SqliteCorpusStore::new(db_path).with_tables(&store.documents_table, &store.clusters_table)
    }

    /// Load and check the manifest for a stage's output file.
    ///
    /// The file must match its manifest, and the manifest must descend from
    /// the current output of every upstream stage still on disk.
    pub fn verified_manifest(&self, stage: Stage) -> Result<SnapshotManifest> {
        let path = self.paths.snapshot(stage);
        let manifest = SnapshotManifest::load(&path)?.ok_or_else(|| {
            PapermapError::schema_mismatch(
                &path,
                format!("no manifest; rerun the {stage} stage"),
            )
        })?;
        if manifest.stage != stage || !manifest.verify_at(&path)? {
            return Err(PapermapError::schema_mismatch(
                &path,
                format!("file does not match its manifest; rerun the {stage} stage"),
            ));
        }
        for &ancestor in stage.upstream() {
            let ancestor_path = self.paths.snapshot(ancestor);
            if let Some(parent) = SnapshotManifest::load(&ancestor_path)? {
                if !manifest.descends_from(&parent) {
                    return Err(PapermapError::schema_mismatch(
                        &path,
                        format!(
                            "does not descend from the current {ancestor} output {}; \
                             rerun the stages after {ancestor}",
                            ancestor_path.display()
                        ),
                    ));
                }
            }
        }
        Ok(manifest)
    }

    /// Read a stage's snapshot, checking its stage, manifest and lineage.
    pub fn load_snapshot(&self, stage: Stage) -> Result<(Snapshot, SnapshotManifest)> {
        let path = self.paths.snapshot(stage);
        if !path.exists() {
            return Err(PapermapError::config(format!(
                "{} not found; run the {stage} stage first",
                path.display()
            )));
        }
        let snapshot = read_snapshot(&path)?;
        if snapshot.stage() != stage {
            return Err(PapermapError::schema_mismatch(
                &path,
                format!("expected a {stage} snapshot, found {}", snapshot.stage()),
            ));
        }
        let manifest = self.verified_manifest(stage)?;
        Ok((snapshot, manifest))
    }

    /// Seal a stage output: write the report, then the manifest.
    ///
    /// The manifest goes last so a sidecar only ever describes a complete
    /// output. If anything after the data file fails, the data file and any
    /// stale manifest are removed.
    fn seal<R: Serialize>(
        &self,
        path: &Path,
        report: Option<(&Path, &R)>,
        describe: impl FnOnce() -> Result<SnapshotManifest>,
    ) -> Result<SnapshotManifest> {
        let sealed = (|| -> Result<SnapshotManifest> {
            if let Some((report_path, report)) = report {
                persistence::atomic_write_json(report_path, report)?;
            }
            let manifest = describe()?;
            manifest.save()?;
            Ok(manifest)
        })();
        if let Err(e) = &sealed {
            warn!(path = %path.display(), error = %e, "Stage output incomplete, removing it");
            for stale in [path.to_path_buf(), SnapshotManifest::sidecar_path(path)] {
                match std::fs::remove_file(&stale) {
                    Err(rm) if rm.kind() != std::io::ErrorKind::NotFound => {
                        warn!(path = %stale.display(), error = %rm, "Could not remove stage output");
                    }
                    _ => {}
                }
            }
        }
        sealed
    }

    fn persist<R: Serialize>(
        &self,
        snapshot: &Snapshot,
        rows_in: usize,
        parent: Option<&SnapshotManifest>,
        report_path: &Path,
        report: &R,
    ) -> Result<StageOutcome> {
        let path = self.paths.snapshot(snapshot.stage());
        write_snapshot(&path, snapshot, self.config.paths.rows_per_group)?;
        let manifest = self.seal(&path, Some((report_path, report)), || {
            SnapshotManifest::for_file(&path, snapshot, parent)
        })?;
        Ok(StageOutcome {
            stage: snapshot.stage(),
            path,
            rows_in,
            rows_out: snapshot.len(),
            manifest,
        })
    }

    /// Export from the configured SQLite store.
    pub async fn export(&self) -> Result<StageOutcome> {
        let store = self.open_store()?;
        self.export_from(&store).await
    }

    pub async fn export_from(&self, store: &dyn CorpusStore) -> Result<StageOutcome> {
        let (snapshot, report): (Snapshot, ExportReport) =
            export_corpus(store, &self.config.export).await?;
        self.persist(
            &snapshot,
            report.rows_read,
            None,
            &self.paths.export_report(),
            &report,
        )
    }

    pub fn dedup(&self) -> Result<(StageOutcome, DedupReport)> {
        let (input, parent) = self.load_snapshot(Stage::Export)?;
        let (output, report) = deduplicate(&input)?;
        let outcome = self.persist(
            &output,
            input.len(),
            Some(&parent),
            &self.paths.dedupe_log(),
            &report,
        )?;
        Ok((outcome, report))
    }

    pub fn assign(&self) -> Result<(StageOutcome, AssignmentReport)> {
        let (input, parent) = self.load_snapshot(Stage::Dedup)?;
        let (output, report) = assign(&input)?;
        let outcome = self.persist(
            &output,
            input.len(),
            Some(&parent),
            &self.paths.assignments(),
            &report,
        )?;
        Ok((outcome, report))
    }

    /// Build the configured projector, falling back to PCA when UMAP is unavailable
    /// and fallback is enabled.
    pub async fn projector(&self) -> Result<Box<dyn Projector>> {
        let cfg = &self.config.projection;
        match cfg.method {
            ProjectionMethod::Pca => Ok(Box::new(PcaProjector::new(cfg.seed))),
            ProjectionMethod::Umap => {
                let runtime = PythonRuntime::with_config(
                    cfg.python_path.clone(),
                    cfg.venv_path.clone(),
                    self.workspace.clone(),
                    cfg.timeout(),
                );
                let umap = UmapProjector::new(runtime, cfg.umap_params());
                if umap.available().await {
                    Ok(Box::new(umap))
                } else if cfg.fallback_to_pca {
                    warn!("umap-learn not importable, falling back to PCA projection");
                    Ok(Box::new(PcaProjector::new(cfg.seed)))
                } else {
                    Err(PapermapError::Python(
                        "umap-learn is not importable; install it or set projection.method = \"pca\""
                            .to_string(),
                    ))
                }
            }
        }
    }

    pub async fn project(&self) -> Result<Projection> {
        let projector = self.projector().await?;
        self.project_with(projector.as_ref()).await
    }

    pub async fn project_with(&self, projector: &dyn Projector) -> Result<Projection> {
        let (snapshot, parent) = self.load_snapshot(Stage::Assign)?;
        let projection = project_snapshot(projector, &snapshot).await?;
        let path = self.paths.coordinates();
        write_coordinates(&path, &projection)?;
        self.seal::<()>(&path, None, || {
            SnapshotManifest::for_artifact(&path, Stage::Project, projection.len(), 2, Some(&parent))
        })?;
        Ok(projection)
    }

    pub async fn citations(&self) -> Result<CitationIndex> {
        let client = OpenAlexClient::new(&self.config.citations)?;
        self.citations_with(&client).await
    }

    /// Fetch citations for the assign snapshot, resuming from any existing index.
    pub async fn citations_with(&self, source: &dyn WorkSearch) -> Result<CitationIndex> {
        let (snapshot, _) = self.load_snapshot(Stage::Assign)?;
        let path = self.paths.citations();
        let existing = CitationIndex::load(&path)?;
        fetch_citations(
            source,
            snapshot.records(),
            &self.config.citations,
            existing,
            Some(&path),
        )
        .await
    }

    /// Render the map from the assign snapshot and its coordinates.
    pub fn render(&self) -> Result<MapSummary> {
        let (snapshot, _) = self.load_snapshot(Stage::Assign)?;
        let coords_path = self.paths.coordinates();
        if !coords_path.exists() {
            return Err(PapermapError::config(format!(
                "{} not found; run the project stage first",
                coords_path.display()
            )));
        }
        self.verified_manifest(Stage::Project)?;
        let projection = read_coordinates(&coords_path)?;

        let citations = match self.config.render.marker {
            MarkerSizing::Citations { .. } => {
                let index = CitationIndex::load(&self.paths.citations())?;
                if index.is_empty() {
                    warn!("Citation sizing requested but no citation index found");
                }
                Some(index)
            }
            MarkerSizing::Uniform { .. } => None,
        };

        let doc = build_map(&snapshot, &projection, &self.config.render, citations.as_ref())?;
        write_map(&doc, &self.paths.map_html(), &self.paths.summary())
    }

    /// Export from `store` and run every stage through render.
    pub async fn run_all(&self, store: &dyn CorpusStore) -> Result<RunSummary> {
        let export = self.export_from(store).await?;
        let (dedup, _) = self.dedup()?;
        let (assign, _) = self.assign()?;
        let projection = self.project().await?;
        let summary = self.render()?;
        info!(
            exported = export.rows_out,
            deduped = dedup.rows_out,
            plotted = summary.total_papers,
            map = %self.paths.map_html().display(),
            "Pipeline complete"
        );
        Ok(RunSummary {
            export,
            dedup,
            assign,
            projection_method: projection.method,
            map_path: self.paths.map_html(),
            summary,
        })
    }
}
