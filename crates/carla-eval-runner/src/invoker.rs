use serde::Serialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::RunConfiguration;
use crate::error::RunError;
use crate::shutdown::Interrupt;

/// Exit code reported when the driver dies without a code or signal.
const UNKNOWN_EXIT_CODE: i32 = 1;

/// Everything needed to spawn the evaluation driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriverCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub current_dir: PathBuf,
}

impl DriverCommand {
    pub fn display(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(self.args.iter().cloned());
        shell_join(&parts)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DriverOutcome {
    Exited { code: i32 },
    Interrupted { signal: &'static str, code: i32 },
}

impl DriverOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            DriverOutcome::Exited { code } | DriverOutcome::Interrupted { code, .. } => *code,
        }
    }
}

/// Driver arguments in `--name=value` form. Optional settings that are unset
/// produce no argument at all.
pub fn build_driver_args(config: &RunConfiguration) -> Vec<String> {
    let mut args = vec![
        format!("--scenarios={}", config.scenarios.display()),
        format!("--routes={}", config.routes.display()),
        format!("--repetitions={}", config.repetitions),
        format!("--track={}", config.track),
        format!("--checkpoint={}", config.checkpoint.display()),
        format!("--agent={}", config.agent.display()),
        format!("--agent-config={}", config.agent_config.display()),
        format!("--debug={}", u8::from(config.debug)),
        format!("--resume={}", u8::from(config.resume)),
        format!("--port={}", config.port),
        format!("--timeout={}", config.timeout_secs),
        format!("--host={}", config.host),
        format!("--trafficManagerPort={}", config.traffic_manager_port),
        format!("--trafficManagerSeed={}", config.traffic_manager_seed),
    ];
    if let Some(record) = &config.record {
        args.push(format!("--record={}", record.display()));
    }
    if let Some(preset) = &config.weather_preset {
        args.push(format!("--weather-preset={}", preset));
    }
    args
}

pub fn driver_command(config: &RunConfiguration) -> Result<DriverCommand, RunError> {
    let search_path =
        std::env::join_paths(&config.search_path).map_err(|e| RunError::InvalidValue {
            key: "PYTHONPATH",
            value: format!("{:?}", config.search_path),
            reason: e.to_string(),
        })?;
    let mut args = vec![config.driver_script().display().to_string()];
    args.extend(build_driver_args(config));
    Ok(DriverCommand {
        program: config.driver_program.clone(),
        args,
        env: vec![
            (
                "PYTHONPATH".to_string(),
                search_path.to_string_lossy().to_string(),
            ),
            ("CARLA_ROOT".to_string(), path_string(&config.carla_root)),
            (
                "SCENARIO_RUNNER_ROOT".to_string(),
                path_string(&config.scenario_runner_root),
            ),
            (
                "LEADERBOARD_ROOT".to_string(),
                path_string(&config.leaderboard_root),
            ),
        ],
        current_dir: config.work_dir.clone(),
    })
}

/// Runs the driver in the foreground until it exits or `interrupt` fires.
/// On interrupt the driver is killed and reaped before returning.
pub async fn invoke_driver<F>(
    command: &DriverCommand,
    interrupt: F,
) -> Result<DriverOutcome, RunError>
where
    F: Future<Output = Interrupt>,
{
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args);
    cmd.envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    cmd.current_dir(&command.current_dir);
    cmd.kill_on_drop(true);

    info!(command = %command.display(), "invoking evaluation driver");
    let mut child = cmd.spawn().map_err(|source| RunError::DriverSpawn {
        program: command.program.clone(),
        source,
    })?;

    let finished = tokio::select! {
        status = child.wait() => Ok(status),
        caught = interrupt => Err(caught),
    };
    match finished {
        Ok(status) => {
            let code = exit_code(status?);
            info!(code, "evaluation driver exited");
            Ok(DriverOutcome::Exited { code })
        }
        Err(caught) => {
            warn!(signal = caught.signal, "interrupted; stopping evaluation driver");
            let _ = child.kill().await;
            Ok(DriverOutcome::Interrupted {
                signal: caught.signal,
                code: caught.exit_code,
            })
        }
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    UNKNOWN_EXIT_CODE
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CliOverrides, EnvMap};
    use crate::shutdown::SIGTERM;
    use chrono::Utc;
    use std::fs;

    fn config_with(cli: CliOverrides) -> RunConfiguration {
        RunConfiguration::from_sources(&EnvMap::new(), &cli, &PathBuf::from("/srv/eval"))
            .expect("config")
    }

    fn has_prefix(args: &[String], prefix: &str) -> bool {
        args.iter().any(|a| a.starts_with(prefix))
    }

    #[test]
    fn required_arguments_are_always_present() {
        let args = build_driver_args(&config_with(CliOverrides::default()));
        for flag in [
            "--scenarios=",
            "--routes=",
            "--repetitions=1",
            "--track=SENSORS",
            "--checkpoint=/srv/eval/results/simulation_results.json",
            "--agent=",
            "--agent-config=",
            "--debug=0",
            "--resume=0",
            "--port=2000",
            "--timeout=60",
        ] {
            assert!(has_prefix(&args, flag), "missing {} in {:?}", flag, args);
        }
    }

    #[test]
    fn weather_preset_omitted_when_absent() {
        let args = build_driver_args(&config_with(CliOverrides::default()));
        assert!(!args.iter().any(|a| a.contains("weather")), "{:?}", args);
        assert!(args.iter().all(|a| !a.ends_with('=')), "{:?}", args);
    }

    #[test]
    fn weather_preset_forwarded_verbatim() {
        let args = build_driver_args(&config_with(CliOverrides {
            weather_preset: Some("Hard Rain Noon".to_string()),
            ..CliOverrides::default()
        }));
        assert_eq!(
            args.iter().filter(|a| a.starts_with("--weather-preset")).count(),
            1
        );
        assert!(args.contains(&"--weather-preset=Hard Rain Noon".to_string()));
    }

    #[test]
    fn record_only_emitted_when_set() {
        let without = build_driver_args(&config_with(CliOverrides::default()));
        assert!(!has_prefix(&without, "--record"));
        let with = build_driver_args(&config_with(CliOverrides {
            record: Some(PathBuf::from("/tmp/rec")),
            ..CliOverrides::default()
        }));
        assert!(with.contains(&"--record=/tmp/rec".to_string()));
    }

    #[test]
    fn flags_render_as_numbers() {
        let args = build_driver_args(&config_with(CliOverrides {
            debug: Some(true),
            resume: Some(true),
            ..CliOverrides::default()
        }));
        assert!(args.contains(&"--debug=1".to_string()));
        assert!(args.contains(&"--resume=1".to_string()));
    }

    #[test]
    fn driver_command_runs_evaluator_script_with_search_path() {
        let cfg = config_with(CliOverrides::default());
        let cmd = driver_command(&cfg).expect("command");
        assert_eq!(cmd.program, "python3");
        assert_eq!(
            cmd.args[0],
            "/srv/eval/leaderboard/leaderboard/leaderboard_evaluator.py"
        );
        let pythonpath = cmd
            .env
            .iter()
            .find(|(k, _)| k == "PYTHONPATH")
            .map(|(_, v)| v.clone())
            .expect("PYTHONPATH");
        assert_eq!(
            pythonpath,
            "/srv/eval/carla/PythonAPI/carla:/srv/eval/scenario_runner:/srv/eval/leaderboard"
        );
    }

    #[test]
    fn display_quotes_arguments_with_spaces() {
        let cmd = DriverCommand {
            program: "python3".to_string(),
            args: vec!["--weather-preset=Hard Rain Noon".to_string()],
            env: vec![],
            current_dir: PathBuf::from("/"),
        };
        assert_eq!(cmd.display(), "python3 '--weather-preset=Hard Rain Noon'");
    }

    fn stub_command(script: &str) -> (DriverCommand, PathBuf) {
        let dir = std::env::temp_dir().join(format!(
            "carla_eval_driver_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("dir");
        let cmd = DriverCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: vec![],
            current_dir: dir.clone(),
        };
        (cmd, dir)
    }

    #[tokio::test]
    async fn driver_exit_code_is_passed_through() {
        let (cmd, dir) = stub_command("exit 3");
        let outcome = invoke_driver(&cmd, std::future::pending())
            .await
            .expect("invoke");
        assert_eq!(outcome, DriverOutcome::Exited { code: 3 });
        let _ = fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn interrupt_stops_the_driver() {
        let (cmd, dir) = stub_command("sleep 30");
        let outcome = invoke_driver(&cmd, async { SIGTERM })
            .await
            .expect("invoke");
        assert_eq!(outcome.exit_code(), 143);
        let _ = fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn missing_driver_program_is_a_spawn_error() {
        let (mut cmd, dir) = stub_command("");
        cmd.program = dir.join("no-such-driver").display().to_string();
        let err = invoke_driver(&cmd, std::future::pending())
            .await
            .expect_err("should fail");
        assert!(matches!(err, RunError::DriverSpawn { .. }), "unexpected: {}", err);
        let _ = fs::remove_dir_all(dir);
    }
}
