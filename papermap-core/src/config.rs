//! Configuration for papermap.
//!
//! Uses `figment` for layered configuration: defaults -> user config ->
//! workspace config -> explicit file -> environment. Configuration is loaded
//! from `~/.config/papermap/config.toml` and/or `.papermap/config.toml` in the
//! workspace directory.

use crate::citations::CitationOptions;
use crate::export::ExportOptions;
use crate::project::UmapParams;
use crate::render::RenderConfig;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PapermapConfig {
    pub store: StoreConfig,
    pub paths: PathsConfig,
    pub export: ExportOptions,
    pub projection: ProjectionConfig,
    pub render: RenderConfig,
    pub citations: CitationOptions,
}

/// Source SQLite store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub db_path: PathBuf,
    pub documents_table: String,
    pub clusters_table: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/corpus.db"),
            documents_table: "documents".to_string(),
            clusters_table: "clusters".to_string(),
        }
    }
}

/// Where snapshots and artifacts go. Relative paths resolve against the workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub data_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Records per Parquet row group.
    pub rows_per_group: usize,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            output_dir: PathBuf::from("output"),
            rows_per_group: 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectionMethod {
    Umap,
    Pca,
}

impl std::fmt::Display for ProjectionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProjectionMethod::Umap => write!(f, "umap"),
            ProjectionMethod::Pca => write!(f, "pca"),
        }
    }
}

/// Dimensionality reduction settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectionConfig {
    pub method: ProjectionMethod,
    pub seed: u64,
    pub n_neighbors: usize,
    pub min_dist: f32,
    pub metric: String,
    pub python_path: PathBuf,
    pub venv_path: Option<PathBuf>,
    pub timeout_secs: u64,
    /// Use PCA when `umap` cannot be imported instead of failing.
    pub fallback_to_pca: bool,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        let umap = UmapParams::default();
        Self {
            method: ProjectionMethod::Umap,
            seed: umap.seed,
            n_neighbors: umap.n_neighbors,
            min_dist: umap.min_dist,
            metric: umap.metric,
            python_path: PathBuf::from("python3"),
            venv_path: None,
            timeout_secs: 600,
            fallback_to_pca: true,
        }
    }
}

impl ProjectionConfig {
    pub fn umap_params(&self) -> UmapParams {
        UmapParams {
            n_neighbors: self.n_neighbors,
            min_dist: self.min_dist,
            metric: self.metric.clone(),
            seed: self.seed,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl PapermapConfig {
    /// Resolve a configured path against the workspace.
    pub fn resolve(workspace: &Path, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            workspace.join(path)
        }
    }
}

/// Path of the user-level config file, if a home directory is known.
pub fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "papermap", "papermap")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Load configuration from all sources.
///
/// `explicit` is a config file named on the command line; unlike the user and
/// workspace files it must exist.
pub fn load_config(
    workspace: Option<&Path>,
    explicit: Option<&Path>,
) -> Result<PapermapConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(PapermapConfig::default()));

    // User-level config
    if let Some(user_config) = user_config_path()
        && user_config.exists()
    {
        figment = figment.merge(Toml::file(&user_config));
    }

    // Workspace-level config
    if let Some(ws) = workspace {
        let ws_config = ws.join(".papermap").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    if let Some(path) = explicit {
        figment = figment.merge(Toml::file_exact(path));
    }

    // Environment variables (PAPERMAP_PROJECTION__METHOD, PAPERMAP_STORE__DB_PATH, etc.)
    figment = figment.merge(Env::prefixed("PAPERMAP_").split("__"));

    figment.extract().map_err(Box::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::ClickAction;

    #[test]
    fn test_config_serialization_roundtrip() {
        let config = PapermapConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: PapermapConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(deserialized, config);
    }

    #[test]
    fn test_load_config_defaults() {
        let config = load_config(None, None).unwrap();
        assert_eq!(config.export.max_year, 2030);
        assert_eq!(config.projection.n_neighbors, 15);
        assert_eq!(config.citations.concurrency, 10);
        assert_eq!(config.render.fallback_year, 2024);
    }

    #[test]
    fn test_load_config_from_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let cfg_dir = dir.path().join(".papermap");
        std::fs::create_dir_all(&cfg_dir).unwrap();
        std::fs::write(
            cfg_dir.join("config.toml"),
            r#"
[store]
db_path = "/srv/vectors.db"

[projection]
method = "pca"
seed = 7

[render]
title = "Lab Library"
click_action = "same_tab"
"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path()), None).unwrap();
        assert_eq!(config.store.db_path, PathBuf::from("/srv/vectors.db"));
        assert_eq!(config.store.documents_table, "documents");
        assert_eq!(config.projection.method, ProjectionMethod::Pca);
        assert_eq!(config.projection.seed, 7);
        assert_eq!(config.render.title, "Lab Library");
        assert_eq!(config.render.click_action, ClickAction::SameTab);
    }

    #[test]
    fn test_explicit_config_overrides_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let cfg_dir = dir.path().join(".papermap");
        std::fs::create_dir_all(&cfg_dir).unwrap();
        std::fs::write(cfg_dir.join("config.toml"), "[export]\nmax_year = 2040\n").unwrap();
        let explicit = dir.path().join("ci.toml");
        std::fs::write(&explicit, "[export]\nskip_unembedded = true\nmax_year = 2050\n").unwrap();

        let config = load_config(Some(dir.path()), Some(&explicit)).unwrap();
        assert_eq!(config.export.max_year, 2050);
        assert!(config.export.skip_unembedded);
    }

    #[test]
    fn test_missing_explicit_config_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(None, Some(&dir.path().join("nope.toml"))).is_err());
    }

    #[test]
    fn test_resolve_paths() {
        let ws = Path::new("/work");
        assert_eq!(
            PapermapConfig::resolve(ws, Path::new("data/x.db")),
            PathBuf::from("/work/data/x.db")
        );
        assert_eq!(
            PapermapConfig::resolve(ws, Path::new("/abs/x.db")),
            PathBuf::from("/abs/x.db")
        );
    }
}
