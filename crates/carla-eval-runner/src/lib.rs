#![deny(rustdoc::broken_intra_doc_links)]

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use tracing::{info, warn};

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod invoker;
pub mod shutdown;
pub mod supervisor;
pub mod weather;

pub use checkpoint::{prepare_checkpoint, CheckpointRecord};
pub use config::{resolve_run_configuration, CliOverrides, EnvMap, ReadinessPolicy, RunConfiguration};
pub use error::RunError;
pub use invoker::{build_driver_args, driver_command, invoke_driver, DriverCommand, DriverOutcome};
pub use shutdown::{shutdown_signal, Interrupt};
pub use supervisor::{
    await_simulator, ensure_simulator, HostSimulator, ProcessHandle, SimulatorControl,
    SimulatorGuard, TeardownAction,
};

/// What happened during one orchestrated run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub simulator: ProcessHandle,
    /// `None` when teardown itself failed; the failure is logged.
    pub teardown: Option<TeardownAction>,
    pub checkpoint: CheckpointRecord,
    pub checkpoint_exists_after: bool,
    pub driver_invoked: bool,
    pub driver: DriverOutcome,
}

impl RunSummary {
    /// The orchestrator's own exit code: the driver's code verbatim, or the
    /// signal code when the run was interrupted.
    pub fn exit_code(&self) -> i32 {
        self.driver.exit_code()
    }
}

/// Resolved configuration plus the exact driver call, without touching any
/// process or directory.
#[derive(Debug, Clone, Serialize)]
pub struct RunPlan {
    pub config: RunConfiguration,
    pub driver: DriverCommand,
    pub checkpoint: CheckpointRecord,
}

pub fn describe_run(config: &RunConfiguration) -> Result<RunPlan, RunError> {
    Ok(RunPlan {
        config: config.clone(),
        driver: driver_command(config)?,
        checkpoint: CheckpointRecord::inspect(&config.checkpoint, config.resume),
    })
}

/// Runs one evaluation, stopping early on SIGINT/SIGTERM.
pub async fn run_evaluation<C: SimulatorControl>(
    config: &RunConfiguration,
    control: C,
) -> Result<RunSummary, RunError> {
    run_evaluation_until(config, control, shutdown_signal()).await
}

/// Same as [`run_evaluation`] with a caller-supplied interrupt source.
///
/// Steps run strictly in order: checkpoint directory preparation, simulator
/// detection or launch, readiness, one driver call. The simulator guard is
/// dropped on every path out of this function, so an owned simulator is
/// cleaned up whether the run succeeds, fails or is interrupted.
pub async fn run_evaluation_until<C, F>(
    config: &RunConfiguration,
    control: C,
    interrupt: F,
) -> Result<RunSummary, RunError>
where
    C: SimulatorControl,
    F: Future<Output = Interrupt>,
{
    let started_at = Utc::now();
    let run_id = format!("run_{}", started_at.format("%Y%m%d_%H%M%S"));
    info!(run_id = %run_id, routes = %config.routes.display(), track = %config.track, "starting evaluation run");

    let command = driver_command(config)?;
    let checkpoint = prepare_checkpoint(config)?;
    let mut guard = ensure_simulator(control, config)?;

    tokio::pin!(interrupt);
    let readiness = tokio::select! {
        ready = await_simulator(&mut guard, config) => Ok(ready),
        caught = &mut interrupt => Err(caught),
    };
    let mut driver_invoked = false;
    let driver = match readiness {
        Ok(ready) => {
            ready?;
            driver_invoked = true;
            invoke_driver(&command, &mut interrupt).await?
        }
        Err(caught) => {
            warn!(signal = caught.signal, "interrupted while waiting for the simulator");
            DriverOutcome::Interrupted {
                signal: caught.signal,
                code: caught.exit_code,
            }
        }
    };

    let simulator = guard.handle().clone();
    let teardown = match guard.teardown() {
        Ok(action) => Some(action),
        Err(err) => {
            warn!(error = %err, "simulator teardown failed");
            None
        }
    };

    let summary = RunSummary {
        run_id,
        started_at,
        finished_at: Utc::now(),
        simulator,
        teardown,
        checkpoint_exists_after: config.checkpoint.is_file(),
        checkpoint,
        driver_invoked,
        driver,
    };
    info!(
        run_id = %summary.run_id,
        exit_code = summary.exit_code(),
        checkpoint = %config.checkpoint.display(),
        "evaluation run finished"
    );
    Ok(summary)
}
