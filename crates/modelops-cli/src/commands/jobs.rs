use super::open_store;
use crate::kubectl::{fallback_status_command, KubectlOrchestrator};
use anyhow::{anyhow, Context as _, Result};
use chrono::{Duration, Utc};
use clap::Subcommand;
use modelops_core::{LocalBackend, ModelOpsConfig};
use modelops_jobs::{
    Job, JobFilter, JobLifecycle, JobState, JobStatus, LifecycleError, LifecycleSettings,
    RegistryError, SyncOutcome, ValidationReport,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const MISSING_PREVIEW: usize = 10;

#[derive(Subcommand)]
pub enum JobsCommand {
    /// Submit a job described by a JSON or YAML file.
    Submit {
        file: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Show the registry record of one job.
    Status {
        job_id: String,
        #[arg(long)]
        json: bool,
    },
    /// List jobs, newest first.
    List {
        #[arg(long)]
        status: Option<JobStatus>,
        #[arg(long)]
        since_hours: Option<i64>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
    /// Pull orchestrator status into the registry for one or all active jobs.
    Sync {
        job_id: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Re-run only the outputs a partially successful job is missing.
    Resume {
        job_id: String,
        #[arg(long)]
        json: bool,
    },
    /// Check a job's expected outputs against the store.
    Validate {
        job_id: String,
        #[arg(long)]
        json: bool,
    },
    /// Cancel a job that has not finished.
    Cancel {
        job_id: String,
        #[arg(long)]
        json: bool,
    },
}

impl JobsCommand {
    pub fn json_mode(&self) -> bool {
        match self {
            JobsCommand::Submit { json, .. }
            | JobsCommand::Status { json, .. }
            | JobsCommand::List { json, .. }
            | JobsCommand::Sync { json, .. }
            | JobsCommand::Resume { json, .. }
            | JobsCommand::Validate { json, .. }
            | JobsCommand::Cancel { json, .. } => *json,
        }
    }
}

fn lifecycle(config: &ModelOpsConfig) -> Result<JobLifecycle<KubectlOrchestrator>> {
    let backend = LocalBackend::open(&config.registry.root)?;
    let store = open_store(config, None)?;
    let mut env = BTreeMap::from([(
        "MODELOPS_SCHEMA".to_string(),
        config.schema.as_str().to_string(),
    )]);
    if let Some(address) = &config.orchestrator.scheduler_address {
        env.insert("MODELOPS_SCHEDULER_ADDRESS".to_string(), address.clone());
    }
    let settings = LifecycleSettings {
        namespace: config.orchestrator.namespace.clone(),
        image: config.orchestrator.image.clone(),
        validation_enabled: config.validation.enabled,
        env,
    };
    Ok(JobLifecycle::new(
        Arc::new(backend),
        store,
        KubectlOrchestrator::new(config.orchestrator.kubectl.clone()),
        settings,
    ))
}

fn read_job(path: &Path) -> Result<Job> {
    let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    let job = if is_yaml {
        serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
    } else {
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
    };
    Ok(job)
}

/// Adds the orchestrator fallback to registry outages so the operator can
/// still check on the job.
fn explain(err: LifecycleError, config: &ModelOpsConfig, job_id: &str) -> anyhow::Error {
    if err.is_registry_unavailable() {
        let fallback = fallback_status_command(
            &config.orchestrator.kubectl,
            &config.orchestrator.namespace,
            job_id,
        );
        eprintln!("warning: job registry is unavailable; status cannot be read from it");
        eprintln!("hint: check the job directly with `{}`", fallback);
        return anyhow!("{} (fallback: {})", err, fallback);
    }
    err.into()
}

pub fn run(command: JobsCommand, config: &ModelOpsConfig) -> Result<Option<Value>> {
    let lifecycle = lifecycle(config)?;
    match command {
        JobsCommand::Submit { file, json } => {
            let mut job = read_job(&file)?;
            let job_id = job.ensure_job_id().to_string();
            let state = lifecycle
                .submit_job(&job)
                .map_err(|err| explain(err, config, &job_id))?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "jobs submit",
                    "job": state,
                })));
            }
            println!("job_id: {}", state.job_id);
            println!("job_type: {}", job.job_type());
            println!("status: {}", state.status);
            println!("expected_outputs: {}", state.tasks_total);
            if let Some(name) = &state.k8s_name {
                println!(
                    "execution: {}/{}",
                    state.k8s_namespace.as_deref().unwrap_or("-"),
                    name
                );
            }
        }
        JobsCommand::Status { job_id, json } => {
            let state = match lifecycle.registry().get_job(&job_id) {
                Ok(state) => state,
                Err(err) => return Err(explain(err.into(), config, &job_id)),
            };
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "jobs status",
                    "job": state,
                })));
            }
            print_state(&state);
        }
        JobsCommand::List {
            status,
            since_hours,
            limit,
            json,
        } => {
            let filter = JobFilter {
                status,
                since: since_hours.map(|h| Utc::now() - Duration::hours(h)),
                limit: Some(limit),
            };
            let jobs = lifecycle
                .registry()
                .list_jobs(&filter)
                .map_err(|err| explain(err.into(), config, "<job-id>"))?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "jobs list",
                    "count": jobs.len(),
                    "jobs": jobs,
                })));
            }
            if jobs.is_empty() {
                println!("no jobs");
            }
            for job in &jobs {
                println!(
                    "{}  {:<16} {:>5.1}%  {}",
                    job.created_at.format("%Y-%m-%d %H:%M:%S"),
                    job.status.as_str(),
                    job.progress_percent,
                    job.job_id
                );
            }
        }
        JobsCommand::Sync { job_id, json } => {
            let outcomes = match &job_id {
                Some(id) => vec![lifecycle
                    .sync_and_validate(id)
                    .map_err(|err| explain(err, config, id))?],
                None => lifecycle
                    .sync_active_jobs()
                    .map_err(|err| explain(err, config, "<job-id>"))?,
            };
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "jobs sync",
                    "synced": outcomes,
                })));
            }
            if outcomes.is_empty() {
                println!("no active jobs");
            }
            for outcome in &outcomes {
                print_sync(outcome);
            }
        }
        JobsCommand::Resume { job_id, json } => {
            let outcome = lifecycle
                .resume_job(&job_id)
                .map_err(|err| explain(err, config, &job_id))?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "jobs resume",
                    "resume": outcome,
                })));
            }
            println!("original_job_id: {}", outcome.original_job_id);
            println!("new_job_id: {}", outcome.new_job_id);
            println!("resume_attempt: {}", outcome.resume_attempt);
            println!("sim_tasks: {}", outcome.sim_tasks);
            println!("aggregations: {}", outcome.aggregations);
            println!("status: {}", outcome.state.status);
        }
        JobsCommand::Validate { job_id, json } => {
            let report = lifecycle
                .validate_outputs(&job_id)
                .map_err(|err| explain(err, config, &job_id))?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "jobs validate",
                    "validation": report,
                })));
            }
            print_validation(&report);
        }
        JobsCommand::Cancel { job_id, json } => {
            let state = lifecycle.cancel_job(&job_id).map_err(|err| match err {
                LifecycleError::Registry(RegistryError::InvalidTransition { from, .. }) => {
                    anyhow!("job {} is already {}; nothing to cancel", job_id, from)
                }
                other => explain(other, config, &job_id),
            })?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "jobs cancel",
                    "job": state,
                })));
            }
            println!("job_id: {}", state.job_id);
            println!("status: {}", state.status);
        }
    }
    Ok(None)
}

fn print_state(state: &JobState) {
    println!("job_id: {}", state.job_id);
    println!("status: {}", state.status);
    if let Some(job_type) = state.metadata.get("job_type").and_then(Value::as_str) {
        println!("job_type: {}", job_type);
    }
    println!("created_at: {}", state.created_at.to_rfc3339());
    println!("updated_at: {}", state.updated_at.to_rfc3339());
    println!(
        "progress: {}/{} ({:.1}%)",
        state.tasks_completed, state.tasks_total, state.progress_percent
    );
    if let Some(name) = &state.k8s_name {
        println!(
            "execution: {}/{}",
            state.k8s_namespace.as_deref().unwrap_or("-"),
            name
        );
    }
    if let Some(path) = &state.results_path {
        println!("results_path: {}", path);
    }
    if let Some(message) = &state.error_message {
        println!(
            "error: [{}] {}",
            state.error_code.as_deref().unwrap_or("-"),
            message
        );
    }
    if let Some(at) = &state.validation_completed_at {
        println!("validated_at: {}", at.to_rfc3339());
        println!("tasks_verified: {}", state.tasks_verified.unwrap_or(0));
        println!("missing_outputs: {}", state.missing_outputs.len());
    }
    if state.status == JobStatus::PartialSuccess {
        println!("next: modelops jobs resume {}", state.job_id);
    }
}

fn print_sync(outcome: &SyncOutcome) {
    if outcome.changed() {
        println!("{}: {} -> {}", outcome.job_id, outcome.previous, outcome.current);
    } else {
        println!("{}: {} (unchanged)", outcome.job_id, outcome.current);
    }
    if let Some(report) = &outcome.validation {
        println!(
            "  validation: {}/{} outputs present",
            report.verified, report.expected
        );
    }
}

fn print_validation(report: &ValidationReport) {
    println!("job_id: {}", report.job_id);
    println!("expected: {}", report.expected);
    println!("verified: {}", report.verified);
    println!("missing: {}", report.missing.len());
    println!("outcome: {}", report.outcome);
    match report.finalized {
        Some(status) => println!("recorded_status: {}", status),
        None => println!("recorded_status: unchanged (job is not validating)"),
    }
    for spec in report.missing.iter().take(MISSING_PREVIEW) {
        println!("  missing {}: {}", spec.output_type, spec.provenance_path);
    }
    if report.missing.len() > MISSING_PREVIEW {
        println!("  ... {} more", report.missing.len() - MISSING_PREVIEW);
    }
}
