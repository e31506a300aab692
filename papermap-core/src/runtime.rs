//! Managed Python subprocess for the UMAP projection.
//!
//! The script reads one JSON document from stdin and writes one JSON document
//! to stdout. The child is killed if it outlives the timeout.

use crate::error::{PapermapError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// The detected Python installation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PythonInfo {
    pub path: PathBuf,
    pub version: String,
    pub venv_path: Option<PathBuf>,
}

/// Python subprocess runner.
#[derive(Debug, Clone)]
pub struct PythonRuntime {
    python_path: PathBuf,
    venv_path: Option<PathBuf>,
    workdir: PathBuf,
    timeout: Duration,
}

impl PythonRuntime {
    pub fn new(workdir: PathBuf) -> Self {
        Self {
            python_path: PathBuf::from("python3"),
            venv_path: None,
            workdir,
            timeout: Duration::from_secs(600),
        }
    }

    pub fn with_config(
        python_path: PathBuf,
        venv_path: Option<PathBuf>,
        workdir: PathBuf,
        timeout: Duration,
    ) -> Self {
        Self {
            python_path,
            venv_path,
            workdir,
            timeout,
        }
    }

    /// Find a working interpreter, trying `python3` then `python`.
    pub async fn detect() -> Result<PythonInfo> {
        for cmd in ["python3", "python"] {
            let Ok(output) = Command::new(cmd).arg("--version").output().await else {
                continue;
            };
            if !output.status.success() {
                continue;
            }
            // Python 2 prints its version on stderr.
            let mut version = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if version.is_empty() {
                version = String::from_utf8_lossy(&output.stderr).trim().to_string();
            }
            return Ok(PythonInfo {
                path: PathBuf::from(cmd),
                version,
                venv_path: detect_venv(),
            });
        }
        Err(PapermapError::Python(
            "Python not found. Install Python 3 with umap-learn, or use the pca projection."
                .to_string(),
        ))
    }

    /// Interpreter to run, preferring the virtualenv when one is set.
    pub fn python_cmd(&self) -> PathBuf {
        match &self.venv_path {
            Some(venv) => {
                let bin_dir = if cfg!(windows) { "Scripts" } else { "bin" };
                venv.join(bin_dir).join("python")
            }
            None => self.python_path.clone(),
        }
    }

    /// Run `script` with `input` as JSON on stdin, parsing stdout as JSON.
    pub async fn run_json_script(
        &self,
        script: &str,
        input: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let payload = serde_json::to_vec(input)?;
        debug!(
            script_len = script.len(),
            input_bytes = payload.len(),
            python = %self.python_cmd().display(),
            "Running Python script"
        );

        let run = async {
            let mut child = Command::new(self.python_cmd())
                .args(["-c", script])
                .current_dir(&self.workdir)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| PapermapError::Python(format!("Failed to spawn Python: {e}")))?;

            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(&payload).await?;
                stdin.shutdown().await?;
            }

            let output = child.wait_with_output().await?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(PapermapError::Python(format!(
                    "Python script failed ({}): {}",
                    output.status,
                    stderr.trim()
                )));
            }

            let stdout = String::from_utf8_lossy(&output.stdout);
            serde_json::from_str(stdout.trim())
                .map_err(|e| PapermapError::Python(format!("Invalid JSON output: {e}")))
        };

        match tokio::time::timeout(self.timeout, run).await {
            Ok(result) => result,
            Err(_) => Err(PapermapError::Timeout(format!(
                "Python script timed out after {}s",
                self.timeout.as_secs()
            ))),
        }
    }

    /// Whether `module` imports cleanly under this interpreter.
    pub async fn has_module(&self, module: &str) -> bool {
        let script = format!("import importlib; importlib.import_module('{module}')");
        Command::new(self.python_cmd())
            .args(["-c", &script])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .is_ok_and(|s| s.success())
    }
}

/// Virtualenv from `VIRTUAL_ENV` or a `.venv`/`venv` directory in the cwd.
fn detect_venv() -> Option<PathBuf> {
    if let Ok(venv) = std::env::var("VIRTUAL_ENV") {
        let path = PathBuf::from(venv);
        if path.exists() {
            return Some(path);
        }
    }
    [".venv", "venv"]
        .into_iter()
        .map(PathBuf::from)
        .find(|p| p.join("pyvenv.cfg").exists())
}
