//! papermap CLI: run the corpus-to-map pipeline, one stage or all at once.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// papermap: turn an embedded paper corpus into an interactive map
#[derive(Parser, Debug)]
#[command(name = "papermap", version, about, long_about = None)]
struct Cli {
    /// Workspace directory (relative config paths resolve against it)
    #[arg(short, long, default_value = ".", global = true)]
    workspace: PathBuf,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Export papers from the embedding store into corpus.parquet
    Export,
    /// Collapse duplicate papers into deduped.parquet
    Dedup,
    /// Assign clusters and categories into assigned.parquet
    Assign,
    /// Project embeddings to 2D coordinates
    Project {
        /// Projection method, overriding the config
        #[arg(short, long, value_parser = ["umap", "pca"])]
        method: Option<String>,
        /// Random seed, overriding the config
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Fetch citation counts from OpenAlex
    Citations {
        /// Contact email for the OpenAlex polite pool
        #[arg(long)]
        contact: Option<String>,
    },
    /// Render the interactive map and summary
    Render,
    /// Run export, dedup, assign, project and render
    Run {
        #[arg(short, long, value_parser = ["umap", "pca"])]
        method: Option<String>,
    },
    /// Show snapshot manifests and lineage
    Info {
        /// Print manifests as JSON
        #[arg(long)]
        json: bool,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Write a default .papermap/config.toml into the workspace
    Init,
    /// Print the effective configuration
    Show,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "papermap", "papermap")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "papermap.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    commands::handle_command(cli.command, &workspace, cli.config.as_deref()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_project_overrides() {
        let cli = Cli::try_parse_from(["papermap", "project", "--method", "pca", "--seed", "7"])
            .unwrap();
        match cli.command {
            Commands::Project { method, seed } => {
                assert_eq!(method.as_deref(), Some("pca"));
                assert_eq!(seed, Some(7));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["papermap", "run", "-vv", "-w", "/tmp/ws"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.workspace, PathBuf::from("/tmp/ws"));
        assert!(matches!(cli.command, Commands::Run { method: None }));
    }

    #[test]
    fn test_rejects_unknown_method() {
        assert!(Cli::try_parse_from(["papermap", "project", "--method", "tsne"]).is_err());
    }

    #[test]
    fn test_subcommand_required() {
        assert!(Cli::try_parse_from(["papermap"]).is_err());
    }
}
