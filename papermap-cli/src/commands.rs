//! CLI subcommand handlers.

use crate::{Commands, ConfigAction};
use papermap_core::config::{PapermapConfig, ProjectionMethod, load_config};
use papermap_core::pipeline::{Pipeline, StageOutcome};
use papermap_core::snapshot::{SnapshotManifest, Stage};
use std::path::Path;

fn load(workspace: &Path, config_path: Option<&Path>) -> anyhow::Result<PapermapConfig> {
    load_config(Some(workspace), config_path)
        .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))
}

fn parse_method(method: &str) -> anyhow::Result<ProjectionMethod> {
    match method {
        "umap" => Ok(ProjectionMethod::Umap),
        "pca" => Ok(ProjectionMethod::Pca),
        other => anyhow::bail!("Unknown projection method: '{}'", other),
    }
}

fn print_outcome(outcome: &StageOutcome) {
    println!(
        "{}: {} -> {} records, wrote {}",
        outcome.stage,
        outcome.rows_in,
        outcome.rows_out,
        outcome.path.display()
    );
}

/// Handle a CLI subcommand.
pub async fn handle_command(
    command: Commands,
    workspace: &Path,
    config_path: Option<&Path>,
) -> anyhow::Result<()> {
    if let Commands::Config { action } = command {
        return handle_config(action, workspace, config_path);
    }

    let mut config = load(workspace, config_path)?;
    match command {
        Commands::Project {
            method: Some(ref m),
            ..
        }
        | Commands::Run { method: Some(ref m) } => {
            config.projection.method = parse_method(m)?;
        }
        _ => {}
    }
    if let Commands::Project { seed: Some(seed), .. } = command {
        config.projection.seed = seed;
    }
    if let Commands::Citations {
        contact: Some(ref contact),
    } = command
    {
        config.citations.contact = Some(contact.clone());
    }

    let pipeline = Pipeline::new(workspace, config);
    match command {
        Commands::Export => {
            let outcome = pipeline.export().await?;
            print_outcome(&outcome);
        }
        Commands::Dedup => {
            let (outcome, report) = pipeline.dedup()?;
            print_outcome(&outcome);
            println!(
                "  {} duplicate groups, {} records dropped (log: {})",
                report.groups.len(),
                report.dropped_count(),
                pipeline.paths().dedupe_log().display()
            );
        }
        Commands::Assign => {
            let (outcome, report) = pipeline.assign()?;
            print_outcome(&outcome);
            println!(
                "  {} clusters assigned from {} centroids, {} categories filled",
                report.assignments.len(),
                report.centroids,
                report.categories_filled()
            );
        }
        Commands::Project { .. } => {
            let projection = pipeline.project().await?;
            println!(
                "project: {} points via {} (seed {}), wrote {}",
                projection.len(),
                projection.method,
                projection.seed,
                pipeline.paths().coordinates().display()
            );
        }
        Commands::Citations { .. } => {
            let index = pipeline.citations().await?;
            println!(
                "citations: {} of {} papers matched, wrote {}",
                index.found_count(),
                index.len(),
                pipeline.paths().citations().display()
            );
        }
        Commands::Render => {
            let summary = pipeline.render()?;
            println!(
                "render: {} papers across {} research areas, wrote {}",
                summary.total_papers,
                summary.categories.len(),
                pipeline.paths().map_html().display()
            );
        }
        Commands::Run { .. } => {
            let store = pipeline.open_store()?;
            let run = pipeline.run_all(&store).await?;
            print_outcome(&run.export);
            print_outcome(&run.dedup);
            print_outcome(&run.assign);
            println!(
                "Map with {} papers ({} projection) written to {}",
                run.summary.total_papers,
                run.projection_method,
                run.map_path.display()
            );
        }
        Commands::Info { json } => handle_info(&pipeline, json)?,
        Commands::Config { .. } => {}
    }
    Ok(())
}

fn handle_info(pipeline: &Pipeline, json: bool) -> anyhow::Result<()> {
    let mut manifests = Vec::new();
    for stage in Stage::ALL {
        let path = pipeline.paths().snapshot(stage);
        match SnapshotManifest::load(&path)? {
            Some(manifest) => manifests.push(manifest),
            None if !json => println!("{stage}: no snapshot at {}", path.display()),
            None => {}
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&manifests)?);
        return Ok(());
    }

    for manifest in &manifests {
        let status = match pipeline.verified_manifest(manifest.stage) {
            Ok(_) => "ok".to_string(),
            Err(e) => format!("INVALID: {e}"),
        };
        println!(
            "{}: {} records, dim {}, schema v{}, created {} [{}]",
            manifest.stage,
            manifest.row_count,
            manifest.embedding_dim,
            manifest.schema_version,
            manifest.created_at.format("%Y-%m-%d %H:%M:%S"),
            status
        );
        println!("  {}", manifest.path.display());
        for link in &manifest.lineage {
            println!(
                "  <- {} ({} rows) {}",
                link.stage,
                link.row_count,
                &link.hash[..12.min(link.hash.len())]
            );
        }
    }
    Ok(())
}

fn handle_config(
    action: ConfigAction,
    workspace: &Path,
    config_path: Option<&Path>,
) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_dir = workspace.join(".papermap");
            std::fs::create_dir_all(&config_dir)?;

            let config_path = config_dir.join("config.toml");
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let toml_str = toml::to_string_pretty(&PapermapConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = load(workspace, config_path)?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_method() {
        assert_eq!(parse_method("pca").unwrap(), ProjectionMethod::Pca);
        assert_eq!(parse_method("umap").unwrap(), ProjectionMethod::Umap);
        assert!(parse_method("tsne").is_err());
    }

    #[test]
    fn test_config_init_writes_loadable_defaults() {
        let dir = tempfile::tempdir().unwrap();
        handle_config(ConfigAction::Init, dir.path(), None).unwrap();
        let config = load(dir.path(), None).unwrap();
        pretty_assertions::assert_eq!(config, PapermapConfig::default());
    }
}
