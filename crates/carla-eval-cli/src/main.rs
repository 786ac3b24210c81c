use anyhow::Result;
use carla_eval_runner::weather::PRESETS;
use carla_eval_runner::{CliOverrides, EnvMap, RunError, RunPlan, RunSummary};
use clap::builder::BoolishValueParser;
use clap::Parser;
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "carla-eval",
    version = "0.3.0",
    about = "Run a leaderboard evaluation against a CARLA simulator"
)]
struct Cli {
    /// Agent configuration (model weights) passed to the agent as its config
    #[arg(long)]
    model_path: Option<PathBuf>,
    #[arg(long)]
    routes: Option<PathBuf>,
    #[arg(long)]
    scenarios: Option<PathBuf>,
    #[arg(long)]
    checkpoint: Option<PathBuf>,
    /// SENSORS or MAP
    #[arg(long)]
    track: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /// Per-route timeout in seconds, enforced by the driver
    #[arg(long)]
    timeout: Option<u64>,
    #[arg(long)]
    output_dir: Option<PathBuf>,
    #[arg(long)]
    work_dir: Option<PathBuf>,
    #[arg(long)]
    carla_root: Option<PathBuf>,
    #[arg(long)]
    scenario_runner_root: Option<PathBuf>,
    #[arg(long)]
    leaderboard_root: Option<PathBuf>,
    /// Agent entry point
    #[arg(long)]
    agent: Option<PathBuf>,
    #[arg(long)]
    weather_preset: Option<String>,
    #[arg(long)]
    repetitions: Option<u32>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    traffic_manager_port: Option<u16>,
    #[arg(long)]
    traffic_manager_seed: Option<u64>,
    /// Directory the driver records simulator logs into
    #[arg(long)]
    record: Option<PathBuf>,
    #[arg(long, value_name = "BOOL", num_args = 0..=1, default_missing_value = "true", value_parser = BoolishValueParser::new())]
    debug: Option<bool>,
    #[arg(long, value_name = "BOOL", num_args = 0..=1, default_missing_value = "true", value_parser = BoolishValueParser::new())]
    resume: Option<bool>,
    #[arg(long, value_name = "BOOL", num_args = 0..=1, default_missing_value = "true", value_parser = BoolishValueParser::new())]
    kill_on_exit: Option<bool>,
    /// Interpreter used to run the leaderboard evaluator
    #[arg(long)]
    driver: Option<String>,
    /// Seconds to wait for a launched simulator to accept connections
    #[arg(long)]
    ready_timeout: Option<u64>,
    /// Resolve and print the run without starting anything
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    list_weather_presets: bool,
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            model_path: self.model_path.clone(),
            routes: self.routes.clone(),
            scenarios: self.scenarios.clone(),
            checkpoint: self.checkpoint.clone(),
            track: self.track.clone(),
            port: self.port,
            timeout: self.timeout,
            output_dir: self.output_dir.clone(),
            work_dir: self.work_dir.clone(),
            carla_root: self.carla_root.clone(),
            scenario_runner_root: self.scenario_runner_root.clone(),
            leaderboard_root: self.leaderboard_root.clone(),
            agent: self.agent.clone(),
            weather_preset: self.weather_preset.clone(),
            repetitions: self.repetitions,
            host: self.host.clone(),
            traffic_manager_port: self.traffic_manager_port,
            traffic_manager_seed: self.traffic_manager_seed,
            record: self.record.clone(),
            debug: self.debug,
            resume: self.resume,
            kill_on_exit: self.kill_on_exit,
            driver: self.driver.clone(),
            ready_timeout_secs: self.ready_timeout,
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing();
    let json_mode = cli.json;
    let code = match run_command(cli) {
        Ok(code) => code,
        Err(err) => {
            if json_mode {
                let code = err
                    .downcast_ref::<RunError>()
                    .map(RunError::code)
                    .unwrap_or("command_failed");
                emit_json(&json_error(code, format!("{:#}", err), json!({})));
            } else {
                eprintln!("error: {:#}", err);
            }
            1
        }
    };
    std::process::exit(code);
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn run_command(cli: Cli) -> Result<i32> {
    if cli.list_weather_presets {
        if cli.json {
            emit_json(&presets_to_json());
        } else {
            print_presets();
        }
        return Ok(0);
    }

    let env: EnvMap = std::env::vars().collect();
    let cwd = std::env::current_dir()?;
    let config = carla_eval_runner::resolve_run_configuration(&env, &cli.overrides(), &cwd)?;

    if cli.dry_run {
        let plan = carla_eval_runner::describe_run(&config)?;
        if cli.json {
            emit_json(&json!({
                "ok": true,
                "command": "dry-run",
                "plan": serde_json::to_value(&plan)?,
            }));
        } else {
            print_plan(&plan);
        }
        return Ok(0);
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let summary = runtime.block_on(carla_eval_runner::run_evaluation(
        &config,
        carla_eval_runner::HostSimulator::new(),
    ))?;
    if cli.json {
        emit_json(&json!({
            "ok": summary.exit_code() == 0,
            "command": "run",
            "run": serde_json::to_value(&summary)?,
        }));
    } else {
        print_summary(&summary);
    }
    Ok(summary.exit_code())
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn presets_to_json() -> Value {
    json!({
        "ok": true,
        "command": "list-weather-presets",
        "presets": PRESETS
            .iter()
            .map(|p| json!({ "internal": p.internal, "display": p.display }))
            .collect::<Vec<_>>(),
    })
}

fn print_presets() {
    println!("weather presets (either spelling is accepted):");
    for preset in PRESETS {
        println!("  {:<20} {}", preset.internal, preset.display);
    }
    println!();
    println!("example: carla-eval --weather-preset=HardRainNoon");
    println!("example: carla-eval --weather-preset=\"Hard Rain Noon\"");
}

fn print_plan(plan: &RunPlan) {
    let config = &plan.config;
    println!("work_dir: {}", config.work_dir.display());
    println!("carla_root: {}", config.carla_root.display());
    println!("scenario_runner_root: {}", config.scenario_runner_root.display());
    println!("leaderboard_root: {}", config.leaderboard_root.display());
    println!("routes: {}", config.routes.display());
    println!("scenarios: {}", config.scenarios.display());
    println!("track: {}", config.track);
    println!("simulator: {}", config.simulator_addr());
    println!("kill_on_exit: {}", config.kill_on_exit);
    println!("checkpoint: {}", plan.checkpoint.path.display());
    println!("checkpoint_exists: {}", plan.checkpoint.exists);
    println!("resume: {}", plan.checkpoint.resume);
    if let Some(preset) = &config.weather_preset {
        println!("weather_preset: {}", preset);
    }
    println!("driver: {}", plan.driver.display());
}

fn print_summary(summary: &RunSummary) {
    println!("run_id: {}", summary.run_id);
    println!("exit_code: {}", summary.exit_code());
    println!("driver_invoked: {}", summary.driver_invoked);
    println!(
        "simulator_started_by_this_run: {}",
        summary.simulator.started_by_this_run
    );
    if let Some(action) = summary.teardown {
        println!("simulator_teardown: {:?}", action);
    }
    println!("checkpoint: {}", summary.checkpoint.path.display());
    println!("checkpoint_exists: {}", summary.checkpoint_exists_after);
    println!(
        "elapsed_secs: {}",
        (summary.finished_at - summary.started_at).num_seconds()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_flag_is_rejected() {
        let err = Cli::try_parse_from(["carla-eval", "--no-such-flag"]).expect_err("should fail");
        assert_eq!(err.kind(), clap::error::ErrorKind::UnknownArgument);
    }

    #[test]
    fn bare_bool_flag_means_true() {
        let cli = Cli::try_parse_from(["carla-eval", "--resume"]).expect("parse");
        assert_eq!(cli.resume, Some(true));
        assert_eq!(cli.debug, None);
    }

    #[test]
    fn bool_flag_accepts_explicit_value() {
        let cli = Cli::try_parse_from(["carla-eval", "--kill-on-exit=0", "--debug=yes"])
            .expect("parse");
        assert_eq!(cli.kill_on_exit, Some(false));
        assert_eq!(cli.debug, Some(true));
    }

    #[test]
    fn flags_map_onto_overrides() {
        let cli = Cli::try_parse_from([
            "carla-eval",
            "--model-path",
            "/m",
            "--port",
            "2004",
            "--weather-preset",
            "Wet Sunset",
            "--carla-root",
            "/opt/carla",
            "--ready-timeout",
            "5",
        ])
        .expect("parse");
        let o = cli.overrides();
        assert_eq!(o.model_path, Some(PathBuf::from("/m")));
        assert_eq!(o.port, Some(2004));
        assert_eq!(o.weather_preset.as_deref(), Some("Wet Sunset"));
        assert_eq!(o.carla_root, Some(PathBuf::from("/opt/carla")));
        assert_eq!(o.ready_timeout_secs, Some(5));
        assert_eq!(o.routes, None);
    }

    #[test]
    fn error_payload_shape() {
        let v = json_error("configuration_error", "missing".to_string(), json!({}));
        assert_eq!(v["ok"], json!(false));
        assert_eq!(v["error"]["code"], json!("configuration_error"));
    }
}
