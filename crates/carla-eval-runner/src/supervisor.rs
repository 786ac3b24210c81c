use serde::Serialize;
use std::fs;
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::{ReadinessPolicy, RunConfiguration};
use crate::error::RunError;

/// Name matched against the host process table.
pub const SIMULATOR_PROCESS_NAME: &str = "CarlaUE4";
/// Launcher script under the simulator root.
pub const SIMULATOR_LAUNCHER: &str = "CarlaUE4.sh";
pub const SIMULATOR_LOG_FILE: &str = "simulator.log";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Host operations the supervisor needs. The real implementation shells out
/// to the process table; tests substitute a recording fake.
pub trait SimulatorControl {
    /// Whether any simulator process is visible, whatever port it bound.
    fn is_running(&mut self) -> Result<bool, RunError>;

    /// Starts the simulator for `config.port` with rendering disabled and
    /// returns its pid.
    fn launch(&mut self, config: &RunConfiguration) -> Result<u32, RunError>;

    /// Exit status of the process started by [`SimulatorControl::launch`], if
    /// it has already exited.
    fn launched_exit_status(&mut self) -> Result<Option<String>, RunError>;

    fn terminate(&mut self) -> Result<(), RunError>;

    /// Collects the launched process after it stopped on its own.
    fn reap(&mut self) -> Result<(), RunError> {
        Ok(())
    }
}

/// Simulator control backed by `pgrep`/`pkill` and a spawned launcher.
#[derive(Debug, Default)]
pub struct HostSimulator {
    child: Option<Child>,
}

impl HostSimulator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SimulatorControl for HostSimulator {
    fn is_running(&mut self) -> Result<bool, RunError> {
        let status = Command::new("pgrep")
            .arg("-f")
            .arg(SIMULATOR_PROCESS_NAME)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;
        // pgrep: 0 = match, 1 = no match, anything else is a usage/system error
        match status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(RunError::Io(std::io::Error::other(format!(
                "pgrep failed with status {}",
                status
            )))),
        }
    }

    fn launch(&mut self, config: &RunConfiguration) -> Result<u32, RunError> {
        let binary = config.carla_root.join(SIMULATOR_LAUNCHER);
        if !binary.is_file() {
            return Err(RunError::SimulatorBinaryMissing { path: binary });
        }
        let log_path = config.output_dir.join(SIMULATOR_LOG_FILE);
        let log = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        let log_err = log.try_clone()?;

        let mut cmd = Command::new(&binary);
        cmd.arg(format!("-carla-rpc-port={}", config.port));
        cmd.arg("-RenderOffScreen");
        cmd.current_dir(&config.carla_root);
        cmd.stdin(Stdio::null());
        cmd.stdout(log);
        cmd.stderr(log_err);
        let child = cmd.spawn().map_err(|source| RunError::SimulatorSpawn {
            path: binary.clone(),
            source,
        })?;
        let pid = child.id();
        info!(
            pid,
            port = config.port,
            binary = %binary.display(),
            log = %log_path.display(),
            "launched simulator"
        );
        self.child = Some(child);
        Ok(pid)
    }

    fn launched_exit_status(&mut self) -> Result<Option<String>, RunError> {
        match self.child.as_mut() {
            Some(child) => Ok(child.try_wait()?.map(|s| s.to_string())),
            None => Ok(None),
        }
    }

    fn terminate(&mut self) -> Result<(), RunError> {
        let status = Command::new("pkill")
            .arg("-f")
            .arg(SIMULATOR_PROCESS_NAME)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;
        debug!(status = %status, "pkill simulator");
        if let Some(mut child) = self.child.take() {
            // the launcher script may outlive pkill's match on the engine binary
            let _ = child.kill();
            let _ = child.wait();
        }
        Ok(())
    }

    fn reap(&mut self) -> Result<(), RunError> {
        if let Some(mut child) = self.child.take() {
            // the engine may be gone while its launcher script is still alive
            if child.try_wait()?.is_none() {
                let _ = child.kill();
            }
            let status = child.wait()?;
            debug!(status = %status, "reaped simulator launcher");
        }
        Ok(())
    }
}

/// The simulator as seen by this run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessHandle {
    /// Only known when this run launched the process.
    pub pid: Option<u32>,
    pub port: u16,
    pub started_by_this_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownAction {
    Terminated,
    LeftRunning,
    AlreadyStopped,
}

/// Owns the simulator handle for the duration of a run and tears it down on
/// every exit path, including unwinding and early returns.
pub struct SimulatorGuard<C: SimulatorControl> {
    control: C,
    handle: ProcessHandle,
    kill_on_exit: bool,
    attempted: bool,
    released: Option<TeardownAction>,
}

impl<C: SimulatorControl> SimulatorGuard<C> {
    fn new(control: C, handle: ProcessHandle, kill_on_exit: bool) -> Self {
        Self {
            control,
            handle,
            kill_on_exit,
            attempted: false,
            released: None,
        }
    }

    pub fn handle(&self) -> &ProcessHandle {
        &self.handle
    }

    pub fn control_mut(&mut self) -> &mut C {
        &mut self.control
    }

    /// Runs teardown now and reports what happened. Repeated calls (and the
    /// eventual drop) return the first result without acting again. A failed
    /// attempt is not retried; later calls report the simulator as left
    /// running.
    pub fn teardown(&mut self) -> Result<TeardownAction, RunError> {
        if self.attempted {
            return Ok(self.released.unwrap_or(TeardownAction::LeftRunning));
        }
        self.attempted = true;
        let action = if !self.kill_on_exit || !self.handle.started_by_this_run {
            TeardownAction::LeftRunning
        } else if !self.control.is_running()? {
            self.control.reap()?;
            TeardownAction::AlreadyStopped
        } else {
            self.control.terminate()?;
            TeardownAction::Terminated
        };
        self.released = Some(action);
        match action {
            TeardownAction::Terminated => info!(port = self.handle.port, "terminated simulator"),
            TeardownAction::LeftRunning => debug!(
                kill_on_exit = self.kill_on_exit,
                started_by_this_run = self.handle.started_by_this_run,
                "leaving simulator running"
            ),
            TeardownAction::AlreadyStopped => info!("simulator already stopped"),
        }
        Ok(action)
    }
}

impl<C: SimulatorControl> Drop for SimulatorGuard<C> {
    fn drop(&mut self) {
        if !self.attempted {
            if let Err(err) = self.teardown() {
                warn!(error = %err, "simulator teardown failed");
            }
        }
    }
}

/// Detects or launches the simulator. A detected process is reused as-is and
/// never owned by this run.
pub fn ensure_simulator<C: SimulatorControl>(
    mut control: C,
    config: &RunConfiguration,
) -> Result<SimulatorGuard<C>, RunError> {
    let handle = if control.is_running()? {
        info!(
            process = SIMULATOR_PROCESS_NAME,
            "simulator already running; skipping launch"
        );
        ProcessHandle {
            pid: None,
            port: config.port,
            started_by_this_run: false,
        }
    } else {
        let pid = control.launch(config)?;
        ProcessHandle {
            pid: Some(pid),
            port: config.port,
            started_by_this_run: true,
        }
    };
    Ok(SimulatorGuard::new(control, handle, config.kill_on_exit))
}

/// Brings the simulator to a usable state: a launched one is polled until it
/// accepts connections, a detected one is probed once so a port mismatch
/// shows up in the log.
pub async fn await_simulator<C: SimulatorControl>(
    guard: &mut SimulatorGuard<C>,
    config: &RunConfiguration,
) -> Result<(), RunError> {
    let addr = config.simulator_addr();
    if guard.handle().started_by_this_run {
        wait_until_ready(guard, &addr, config.readiness).await
    } else {
        if !port_accepts(&addr).await {
            warn!(
                addr = %addr,
                "a simulator process is running but nothing accepts connections on the configured port"
            );
        }
        Ok(())
    }
}

pub async fn wait_until_ready<C: SimulatorControl>(
    guard: &mut SimulatorGuard<C>,
    addr: &str,
    policy: ReadinessPolicy,
) -> Result<(), RunError> {
    let started = Instant::now();
    // an unrepresentable deadline means waiting without a bound
    let deadline = started.checked_add(policy.max_wait);
    let mut delay = policy.initial_delay;
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        if port_accepts(addr).await {
            info!(addr = %addr, attempt, waited = ?started.elapsed(), "simulator ready");
            return Ok(());
        }
        if let Some(status) = guard.control_mut().launched_exit_status()? {
            return Err(RunError::SimulatorExited { status });
        }
        let now = Instant::now();
        let pause = match deadline {
            Some(deadline) if now >= deadline => {
                return Err(RunError::SimulatorNotReady {
                    addr: addr.to_string(),
                    waited: now - started,
                });
            }
            Some(deadline) => delay.min(deadline - now),
            None => delay,
        };
        debug!(addr = %addr, attempt, pause = ?pause, "simulator not reachable yet");
        sleep(pause).await;
        delay = (delay * 2).min(policy.max_delay);
    }
}

async fn port_accepts(addr: &str) -> bool {
    matches!(timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await, Ok(Ok(_)))
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default)]
    pub struct FakeState {
        pub running: bool,
        pub launches: usize,
        pub terminations: usize,
        pub reaps: usize,
        pub exit_status: Option<String>,
        pub process_table_error: bool,
        pub process_table_queries: usize,
    }

    /// Records calls; launching flips `running` on, terminating flips it off.
    #[derive(Debug, Clone, Default)]
    pub struct FakeSimulator {
        pub state: Arc<Mutex<FakeState>>,
    }

    impl FakeSimulator {
        pub fn already_running() -> Self {
            let fake = Self::default();
            fake.state.lock().expect("lock").running = true;
            fake
        }

        pub fn snapshot(&self) -> (bool, usize, usize) {
            let s = self.state.lock().expect("lock");
            (s.running, s.launches, s.terminations)
        }
    }

    impl SimulatorControl for FakeSimulator {
        fn is_running(&mut self) -> Result<bool, RunError> {
            let mut s = self.state.lock().expect("lock");
            s.process_table_queries += 1;
            if s.process_table_error {
                return Err(RunError::Io(std::io::Error::other("pgrep failed with status 3")));
            }
            Ok(s.running)
        }

        fn launch(&mut self, _config: &RunConfiguration) -> Result<u32, RunError> {
            let mut s = self.state.lock().expect("lock");
            s.launches += 1;
            s.running = true;
            Ok(4242)
        }

        fn launched_exit_status(&mut self) -> Result<Option<String>, RunError> {
            Ok(self.state.lock().expect("lock").exit_status.clone())
        }

        fn terminate(&mut self) -> Result<(), RunError> {
            let mut s = self.state.lock().expect("lock");
            s.terminations += 1;
            s.running = false;
            Ok(())
        }

        fn reap(&mut self) -> Result<(), RunError> {
            self.state.lock().expect("lock").reaps += 1;
            Ok(())
        }
    }
}
