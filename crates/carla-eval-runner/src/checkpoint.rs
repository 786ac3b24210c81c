use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::RunConfiguration;
use crate::error::RunError;

/// What the orchestrator knows about the checkpoint before the driver runs.
/// The file itself is owned by the driver and never opened here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckpointRecord {
    pub path: PathBuf,
    pub exists: bool,
    pub resume: bool,
}

impl CheckpointRecord {
    pub fn inspect(path: &Path, resume: bool) -> Self {
        Self {
            path: path.to_path_buf(),
            exists: path.is_file(),
            resume,
        }
    }

    /// True when the driver is expected to pick up where a previous run stopped.
    pub fn resumes_existing(&self) -> bool {
        self.resume && self.exists
    }
}

/// Creates the output directory and the checkpoint's parent if missing.
///
/// Creation is additive: existing directories and their contents are left
/// untouched, including a checkpoint from an earlier run.
pub fn prepare_checkpoint(config: &RunConfiguration) -> Result<CheckpointRecord, RunError> {
    ensure_dir(&config.output_dir)?;
    if let Some(parent) = config.checkpoint.parent() {
        ensure_dir(parent)?;
    }
    let record = CheckpointRecord::inspect(&config.checkpoint, config.resume);
    if record.resumes_existing() {
        info!(checkpoint = %record.path.display(), "resuming from existing checkpoint");
    } else if record.resume {
        warn!(
            checkpoint = %record.path.display(),
            "resume requested but no checkpoint exists; the driver will start fresh"
        );
    } else if record.exists {
        info!(
            checkpoint = %record.path.display(),
            "checkpoint exists and resume is off; overwrite semantics are left to the driver"
        );
    }
    Ok(record)
}

fn ensure_dir(path: &Path) -> Result<(), RunError> {
    if !path.is_dir() {
        fs::create_dir_all(path)?;
    }
    Ok(())
}
