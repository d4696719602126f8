//! User scripts
//!
//! Runs every file in the scripts directory in lexical order. A failing
//! script is logged and the rest still run.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::InitError;

/// Outcome of a scripts run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptsReport {
    /// Scripts started
    pub ran: usize,
    /// Scripts that could not be started or exited non-zero
    pub failed: Vec<String>,
}

impl ScriptsReport {
    pub fn failures(&self) -> usize {
        self.failed.len()
    }
}

/// Run all scripts in `dir`; a missing directory means nothing to run
pub async fn run_user_scripts(dir: &Path) -> Result<ScriptsReport, InitError> {
    let scripts = list_scripts(dir).await?;
    let mut report = ScriptsReport::default();

    if scripts.is_empty() {
        debug!("No user scripts in {}", dir.display());
        return Ok(report);
    }

    info!("Running {} user script(s)", scripts.len());
    for script in scripts {
        let name = script
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        report.ran += 1;
        if let Err(e) = run_script(&script).await {
            warn!("User script {} failed: {}", name, e);
            report.failed.push(name);
        }
    }

    if report.failed.is_empty() {
        info!("All {} user script(s) succeeded", report.ran);
    } else {
        warn!(
            "{} of {} user script(s) failed",
            report.failures(),
            report.ran
        );
    }
    Ok(report)
}

/// Regular files in `dir`, sorted by name
async fn list_scripts(dir: &Path) -> Result<Vec<PathBuf>, InitError> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut scripts = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            scripts.push(entry.path());
        }
    }
    scripts.sort();
    Ok(scripts)
}

async fn run_script(path: &Path) -> Result<(), InitError> {
    debug!("Running user script: {}", path.display());

    let output = tokio::process::Command::new(path)
        .output()
        .await
        .map_err(|e| InitError::Command(format!("{}: {e}", path.display())))?;

    if !output.stdout.is_empty() {
        info!("{}", String::from_utf8_lossy(&output.stdout).trim_end());
    }
    if !output.stderr.is_empty() {
        debug!("stderr: {}", String::from_utf8_lossy(&output.stderr).trim_end());
    }

    if !output.status.success() {
        return Err(InitError::Command(format!(
            "exited with status {}",
            output.status.code().unwrap_or(-1)
        )));
    }
    Ok(())
}
