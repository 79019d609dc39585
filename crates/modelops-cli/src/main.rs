use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use modelops_core::{ModelOpsConfig, CONFIG_FILE_NAME};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod commands;
mod kubectl;

use commands::jobs::JobsCommand;
use commands::results::ResultsCommand;

const LOG_ENV: &str = "MODELOPS_LOG";
const HOME_ENV: &str = "MODELOPS_HOME";

#[derive(Parser)]
#[command(name = "modelops", version, about = "Provenance store and job lifecycle for model runs")]
struct Cli {
    /// Config file; defaults to $MODELOPS_HOME/config.yaml or ~/.modelops/config.yaml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect and maintain stored results.
    Results {
        #[command(subcommand)]
        command: ResultsCommand,
    },
    /// Submit and track jobs.
    Jobs {
        #[command(subcommand)]
        command: JobsCommand,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = load_config(cli.config.as_deref()).and_then(|config| run_command(cli.command, &config));
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn modelops_home() -> PathBuf {
    if let Some(home) = std::env::var_os(HOME_ENV) {
        return PathBuf::from(home);
    }
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".modelops")
}

fn load_config(explicit: Option<&Path>) -> Result<ModelOpsConfig> {
    let home = modelops_home();
    let (path, base) = match explicit {
        Some(path) => {
            let base = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            (path.to_path_buf(), base)
        }
        None => (home.join(CONFIG_FILE_NAME), home),
    };
    ModelOpsConfig::load_or_default(&path, &base)
        .with_context(|| format!("loading config {}", path.display()))
}

fn run_command(command: Commands, config: &ModelOpsConfig) -> Result<Option<Value>> {
    match command {
        Commands::Results { command } => commands::results::run(command, config),
        Commands::Jobs { command } => commands::jobs::run(command, config),
    }
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

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Results { command } => command.json_mode(),
        Commands::Jobs { command } => command.json_mode(),
    }
}
