use chrono::Utc;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

const ENV_KEYS: &[&str] = &[
    "WORK_DIR",
    "CARLA_ROOT",
    "SCENARIO_RUNNER_ROOT",
    "LEADERBOARD_ROOT",
    "OUTPUT_DIR",
    "CHECKPOINT_ENDPOINT",
    "ROUTES",
    "SCENARIOS",
    "RESUME",
    "DEBUG_CHALLENGE",
    "PORT",
    "WEATHER_PRESET",
];

fn temp_work(tag: &str) -> PathBuf {
    let root = std::env::temp_dir().join(format!(
        "carla_eval_cli_{}_{}_{}",
        tag,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    fs::create_dir_all(&root).expect("temp work");
    root
}

fn make_roots(work: &Path) {
    fs::create_dir_all(work.join("carla/PythonAPI")).expect("carla");
    fs::create_dir_all(work.join("scenario_runner/srunner")).expect("srunner");
    fs::create_dir_all(work.join("leaderboard/leaderboard")).expect("leaderboard");
}

fn carla_eval(work: &Path, args: &[&str]) -> Output {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_carla-eval"));
    for key in ENV_KEYS {
        cmd.env_remove(key);
    }
    cmd.env("RUST_LOG", "warn");
    cmd.current_dir(work);
    cmd.args(args);
    cmd.output().expect("run carla-eval")
}

#[test]
fn unknown_flag_exits_nonzero_without_side_effects() {
    let work = temp_work("unknown");
    make_roots(&work);
    let out = carla_eval(&work, &["--frobnicate"]);
    assert_eq!(out.status.code(), Some(2));
    assert!(!work.join("results").exists());
    let _ = fs::remove_dir_all(work);
}

#[test]
fn missing_root_exits_nonzero_and_names_the_path() {
    let work = temp_work("missing");
    let out = carla_eval(&work, &[]);
    assert_eq!(out.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(
        stderr.contains(&work.join("carla").display().to_string()),
        "stderr: {}",
        stderr
    );
    assert!(!work.join("results").exists(), "nothing may be created");
    let _ = fs::remove_dir_all(work);
}

#[test]
fn missing_root_reports_json_error_code() {
    let work = temp_work("missing_json");
    let out = carla_eval(&work, &["--json"]);
    assert_eq!(out.status.code(), Some(1));
    let payload: Value = serde_json::from_slice(&out.stdout).expect("json");
    assert_eq!(payload["ok"], Value::Bool(false));
    assert_eq!(payload["error"]["code"], "configuration_error");
    let _ = fs::remove_dir_all(work);
}

#[test]
fn dry_run_prints_driver_call_without_touching_anything() {
    let work = temp_work("dry");
    make_roots(&work);
    let out = carla_eval(&work, &["--dry-run", "--json", "--port", "2100"]);
    assert_eq!(out.status.code(), Some(0), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    let payload: Value = serde_json::from_slice(&out.stdout).expect("json");
    let args: Vec<String> = payload["plan"]["driver"]["args"]
        .as_array()
        .expect("args")
        .iter()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();
    assert!(args.contains(&"--port=2100".to_string()), "{:?}", args);
    assert!(!args.iter().any(|a| a.starts_with("--weather-preset")));
    assert!(!work.join("results").exists(), "dry run creates nothing");
    let _ = fs::remove_dir_all(work);
}

#[test]
fn lists_weather_presets() {
    let work = temp_work("presets");
    let out = carla_eval(&work, &["--list-weather-presets"]);
    assert_eq!(out.status.code(), Some(0));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("HardRainNoon"));
    assert!(stdout.contains("Hard Rain Noon"));
    let _ = fs::remove_dir_all(work);
}
