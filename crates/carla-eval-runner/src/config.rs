use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::RunError;
use crate::weather;

/// Snapshot of the process environment taken once, at resolution time.
pub type EnvMap = BTreeMap<String, String>;

pub const SIMULATOR_API_DIR: &str = "PythonAPI";
pub const SCENARIO_RUNNER_MODULE_DIR: &str = "srunner";
pub const LEADERBOARD_MODULE_DIR: &str = "leaderboard";
pub const DRIVER_SCRIPT: &str = "leaderboard/leaderboard_evaluator.py";
pub const CHECKPOINT_FILE_NAME: &str = "simulation_results.json";

const DEFAULT_TRACK: &str = "SENSORS";
const DEFAULT_PORT: u16 = 2000;
const DEFAULT_TIMEOUT_SECS: u64 = 60;
const DEFAULT_HOST: &str = "localhost";
const DEFAULT_TRAFFIC_MANAGER_PORT: u16 = 8000;
const DEFAULT_TRAFFIC_MANAGER_SEED: u64 = 0;
const DEFAULT_REPETITIONS: u32 = 1;
const DEFAULT_DRIVER: &str = "python3";
const DEFAULT_READY_TIMEOUT_SECS: u64 = 60;
const DEFAULT_RECORD_DIR: &str = "records";

/// Values supplied on the command line. `None` means "not given", so the
/// environment or the built-in default applies.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub model_path: Option<PathBuf>,
    pub routes: Option<PathBuf>,
    pub scenarios: Option<PathBuf>,
    pub checkpoint: Option<PathBuf>,
    pub track: Option<String>,
    pub port: Option<u16>,
    pub timeout: Option<u64>,
    pub output_dir: Option<PathBuf>,
    pub work_dir: Option<PathBuf>,
    pub carla_root: Option<PathBuf>,
    pub scenario_runner_root: Option<PathBuf>,
    pub leaderboard_root: Option<PathBuf>,
    pub agent: Option<PathBuf>,
    pub weather_preset: Option<String>,
    pub repetitions: Option<u32>,
    pub host: Option<String>,
    pub traffic_manager_port: Option<u16>,
    pub traffic_manager_seed: Option<u64>,
    pub record: Option<PathBuf>,
    pub debug: Option<bool>,
    pub resume: Option<bool>,
    pub kill_on_exit: Option<bool>,
    pub driver: Option<String>,
    pub ready_timeout_secs: Option<u64>,
}

/// Bounded backoff used while waiting for a freshly launched simulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReadinessPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_wait: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            max_wait: Duration::from_secs(DEFAULT_READY_TIMEOUT_SECS),
        }
    }
}

/// Fully resolved, immutable description of one evaluation run.
#[derive(Debug, Clone, Serialize)]
pub struct RunConfiguration {
    pub work_dir: PathBuf,
    pub carla_root: PathBuf,
    pub scenario_runner_root: PathBuf,
    pub leaderboard_root: PathBuf,
    pub output_dir: PathBuf,
    pub routes: PathBuf,
    pub scenarios: PathBuf,
    pub repetitions: u32,
    pub track: String,
    pub checkpoint: PathBuf,
    pub agent: PathBuf,
    pub agent_config: PathBuf,
    pub debug: bool,
    pub resume: bool,
    pub record: Option<PathBuf>,
    pub host: String,
    pub port: u16,
    pub timeout_secs: u64,
    pub traffic_manager_port: u16,
    pub traffic_manager_seed: u64,
    pub weather_preset: Option<String>,
    pub kill_on_exit: bool,
    pub driver_program: String,
    pub readiness: ReadinessPolicy,
    /// Module search path handed to the driver, in lookup order.
    pub search_path: Vec<PathBuf>,
}

/// Merges the three configuration layers and validates the required roots.
///
/// Nothing on disk is touched besides existence checks, so a failure here
/// leaves no trace.
pub fn resolve_run_configuration(
    env: &EnvMap,
    cli: &CliOverrides,
    cwd: &Path,
) -> Result<RunConfiguration, RunError> {
    let config = RunConfiguration::from_sources(env, cli, cwd)?;
    config.validate()?;
    debug!(
        work_dir = %config.work_dir.display(),
        carla_root = %config.carla_root.display(),
        checkpoint = %config.checkpoint.display(),
        "resolved run configuration"
    );
    Ok(config)
}

impl RunConfiguration {
    /// Applies CLI > environment > default precedence without validating paths.
    pub fn from_sources(env: &EnvMap, cli: &CliOverrides, cwd: &Path) -> Result<Self, RunError> {
        let work_dir = absolutize(
            cwd,
            pick_path(cli.work_dir.as_ref(), env, "WORK_DIR", || cwd.to_path_buf()),
        );
        let under_work = |rel: &str| work_dir.join(rel);

        let carla_root = absolutize(
            &work_dir,
            pick_path(cli.carla_root.as_ref(), env, "CARLA_ROOT", || {
                under_work("carla")
            }),
        );
        let scenario_runner_root = absolutize(
            &work_dir,
            pick_path(
                cli.scenario_runner_root.as_ref(),
                env,
                "SCENARIO_RUNNER_ROOT",
                || under_work("scenario_runner"),
            ),
        );
        let leaderboard_root = absolutize(
            &work_dir,
            pick_path(cli.leaderboard_root.as_ref(), env, "LEADERBOARD_ROOT", || {
                under_work("leaderboard")
            }),
        );
        let output_dir = absolutize(
            &work_dir,
            pick_path(cli.output_dir.as_ref(), env, "OUTPUT_DIR", || {
                under_work("results")
            }),
        );
        let routes = absolutize(
            &work_dir,
            pick_path(cli.routes.as_ref(), env, "ROUTES", || {
                leaderboard_root.join("data/longest6/longest6.xml")
            }),
        );
        let scenarios = absolutize(
            &work_dir,
            pick_path(cli.scenarios.as_ref(), env, "SCENARIOS", || {
                leaderboard_root.join("data/longest6/eval_scenarios.json")
            }),
        );
        let checkpoint = absolutize(
            &work_dir,
            pick_path(cli.checkpoint.as_ref(), env, "CHECKPOINT_ENDPOINT", || {
                output_dir.join(CHECKPOINT_FILE_NAME)
            }),
        );
        let agent = absolutize(
            &work_dir,
            pick_path(cli.agent.as_ref(), env, "TEAM_AGENT", || {
                under_work("src/compatibility/leaderboard_eval.py")
            }),
        );
        let agent_config = absolutize(
            &work_dir,
            pick_path(cli.model_path.as_ref(), env, "DEFAULT_MODEL_PATH", || {
                under_work("model_ckpt/transfuser")
            }),
        );
        let record = match cli.record.clone() {
            Some(path) => Some(path),
            None => match env_value(env, "RECORD_PATH") {
                Some(path) => Some(PathBuf::from(path)),
                None => record_from_flag(env, &output_dir),
            },
        }
        .map(|p| absolutize(&work_dir, p));

        let track = pick_string(cli.track.as_ref(), env, "CHALLENGE_TRACK_CODENAME", DEFAULT_TRACK);
        let host = pick_string(cli.host.as_ref(), env, "HOST", DEFAULT_HOST);
        let weather_preset = cli
            .weather_preset
            .clone()
            .or_else(|| env_value(env, "WEATHER_PRESET").map(str::to_string))
            .filter(|s| !s.trim().is_empty());
        if let Some(preset) = &weather_preset {
            if weather::lookup(preset).is_none() {
                warn!(preset = %preset, "unknown weather preset; forwarding to the driver as-is");
            }
        }

        let repetitions = pick_parsed(cli.repetitions, env, "REPETITIONS", DEFAULT_REPETITIONS)?;
        if repetitions == 0 {
            return Err(RunError::InvalidValue {
                key: "REPETITIONS",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        let port = pick_parsed(cli.port, env, "PORT", DEFAULT_PORT)?;
        let timeout_secs = pick_parsed(cli.timeout, env, "TIMEOUT", DEFAULT_TIMEOUT_SECS)?;
        let traffic_manager_port = pick_parsed(
            cli.traffic_manager_port,
            env,
            "TRAFFIC_MANAGER_PORT",
            DEFAULT_TRAFFIC_MANAGER_PORT,
        )?;
        let traffic_manager_seed = pick_parsed(
            cli.traffic_manager_seed,
            env,
            "TRAFFIC_MANAGER_SEED",
            DEFAULT_TRAFFIC_MANAGER_SEED,
        )?;
        let ready_timeout_secs = pick_parsed(
            cli.ready_timeout_secs,
            env,
            "CARLA_READY_TIMEOUT",
            DEFAULT_READY_TIMEOUT_SECS,
        )?;

        let debug = pick_flag(cli.debug, env, "DEBUG_CHALLENGE", false)?;
        let resume = pick_flag(cli.resume, env, "RESUME", false)?;
        let kill_on_exit = pick_flag(cli.kill_on_exit, env, "KILL_CARLA_ON_EXIT", true)?;

        let driver_program = pick_string(cli.driver.as_ref(), env, "PYTHON", DEFAULT_DRIVER);

        let mut search_path = vec![
            carla_root.join(SIMULATOR_API_DIR).join("carla"),
            scenario_runner_root.clone(),
            leaderboard_root.clone(),
        ];
        if let Some(existing) = env_value(env, "PYTHONPATH") {
            search_path.extend(std::env::split_paths(existing));
        }

        Ok(Self {
            work_dir,
            carla_root,
            scenario_runner_root,
            leaderboard_root,
            output_dir,
            routes,
            scenarios,
            repetitions,
            track,
            checkpoint,
            agent,
            agent_config,
            debug,
            resume,
            record,
            host,
            port,
            timeout_secs,
            traffic_manager_port,
            traffic_manager_seed,
            weather_preset,
            kill_on_exit,
            driver_program,
            readiness: ReadinessPolicy {
                max_wait: Duration::from_secs(ready_timeout_secs),
                ..ReadinessPolicy::default()
            },
            search_path,
        })
    }

    /// Checks each required root and its mandatory sub-directory, stopping at
    /// the first one that is missing.
    pub fn validate(&self) -> Result<(), RunError> {
        let carla_hint = "CARLA_ROOT or pass --carla-root";
        let runner_hint = "SCENARIO_RUNNER_ROOT or pass --scenario-runner-root";
        let leaderboard_hint = "LEADERBOARD_ROOT or pass --leaderboard-root";
        let required = [
            ("simulator root", self.carla_root.clone(), carla_hint),
            (
                "simulator API directory",
                self.carla_root.join(SIMULATOR_API_DIR),
                carla_hint,
            ),
            (
                "scenario runner root",
                self.scenario_runner_root.clone(),
                runner_hint,
            ),
            (
                "scenario runner module directory",
                self.scenario_runner_root.join(SCENARIO_RUNNER_MODULE_DIR),
                runner_hint,
            ),
            (
                "leaderboard root",
                self.leaderboard_root.clone(),
                leaderboard_hint,
            ),
            (
                "leaderboard module directory",
                self.leaderboard_root.join(LEADERBOARD_MODULE_DIR),
                leaderboard_hint,
            ),
        ];
        for (what, path, hint) in required {
            if !path.is_dir() {
                return Err(RunError::MissingPath { what, path, hint });
            }
        }

        for (what, path) in [("routes file", &self.routes), ("scenarios file", &self.scenarios)] {
            if !path.is_file() {
                warn!(path = %path.display(), "{} does not exist; the driver will report it", what);
            }
        }
        Ok(())
    }

    pub fn driver_script(&self) -> PathBuf {
        self.leaderboard_root.join(DRIVER_SCRIPT)
    }

    pub fn simulator_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Empty values count as unset, matching `${VAR:-default}` in shell wrappers.
fn env_value<'a>(env: &'a EnvMap, key: &str) -> Option<&'a str> {
    env.get(key).map(|s| s.trim()).filter(|s| !s.is_empty())
}

fn pick_path(
    cli: Option<&PathBuf>,
    env: &EnvMap,
    key: &str,
    default: impl FnOnce() -> PathBuf,
) -> PathBuf {
    if let Some(p) = cli {
        return p.clone();
    }
    env_value(env, key).map(PathBuf::from).unwrap_or_else(default)
}

fn pick_string(cli: Option<&String>, env: &EnvMap, key: &str, default: &str) -> String {
    cli.cloned()
        .or_else(|| env_value(env, key).map(str::to_string))
        .unwrap_or_else(|| default.to_string())
}

fn pick_parsed<T>(cli: Option<T>, env: &EnvMap, key: &'static str, default: T) -> Result<T, RunError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(v) = cli {
        return Ok(v);
    }
    match env_value(env, key) {
        Some(raw) => raw.parse::<T>().map_err(|e| RunError::InvalidValue {
            key,
            value: raw.to_string(),
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn pick_flag(cli: Option<bool>, env: &EnvMap, key: &'static str, default: bool) -> Result<bool, RunError> {
    if let Some(v) = cli {
        return Ok(v);
    }
    match env_value(env, key) {
        Some(raw) => parse_flag(raw).ok_or_else(|| RunError::InvalidValue {
            key,
            value: raw.to_string(),
            reason: "expected 1/0, true/false, yes/no or on/off".to_string(),
        }),
        None => Ok(default),
    }
}

/// `RECORD` is an on/off switch; when on, recordings land next to the results.
/// A value that is not a flag is taken as the recording directory itself.
fn record_from_flag(env: &EnvMap, output_dir: &Path) -> Option<PathBuf> {
    let raw = env_value(env, "RECORD")?;
    match parse_flag(raw) {
        Some(true) => Some(output_dir.join(DEFAULT_RECORD_DIR)),
        Some(false) => None,
        None => {
            debug!(value = %raw, "RECORD is not a flag; using it as the recording path");
            Some(PathBuf::from(raw))
        }
    }
}

pub fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn absolutize(base: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}
