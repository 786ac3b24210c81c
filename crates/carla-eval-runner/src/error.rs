use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failures the orchestrator reports before or around the driver call.
///
/// A non-zero driver exit is not represented here; it is a normal
/// [`crate::DriverOutcome`] carrying the driver's exit code.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("{what} not found: {} (set {hint})", path.display())]
    MissingPath {
        what: &'static str,
        path: PathBuf,
        hint: &'static str,
    },

    #[error("invalid value for {key}: '{value}' ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("simulator binary not found: {} (set CARLA_ROOT or pass --carla-root)", path.display())]
    SimulatorBinaryMissing { path: PathBuf },

    #[error("failed to launch simulator {}: {source}", path.display())]
    SimulatorSpawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("simulator exited during startup with status {status}")]
    SimulatorExited { status: String },

    #[error("simulator not accepting connections on {addr} after {waited:?}")]
    SimulatorNotReady { addr: String, waited: Duration },

    #[error("failed to start evaluation driver '{program}': {source}")]
    DriverSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RunError {
    /// Stable machine-readable code used by the CLI's `--json` error payload.
    pub fn code(&self) -> &'static str {
        match self {
            RunError::MissingPath { .. } | RunError::InvalidValue { .. } => "configuration_error",
            RunError::SimulatorBinaryMissing { .. }
            | RunError::SimulatorSpawn { .. }
            | RunError::SimulatorExited { .. } => "process_launch_error",
            RunError::SimulatorNotReady { .. } => "simulator_not_ready",
            RunError::DriverSpawn { .. } => "driver_invocation_error",
            RunError::Io(_) => "io_error",
        }
    }

    pub fn is_configuration(&self) -> bool {
        self.code() == "configuration_error"
    }
}
