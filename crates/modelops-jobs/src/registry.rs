//! Persistent job state, one JSON record per job.
//!
//! Records are read-modify-written without locking; concurrent writers to
//! the same job race with last-writer-wins semantics.

use crate::manifest::OutputSpec;
use chrono::{DateTime, Utc};
use modelops_core::{DynBackend, StorageBackend, StorageBackendExt, StorageError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info, warn};

pub const REGISTRY_PREFIX: &str = "registry/jobs/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Submitting,
    Scheduled,
    Running,
    Validating,
    Succeeded,
    PartialSuccess,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 9] = [
        JobStatus::Pending,
        JobStatus::Submitting,
        JobStatus::Scheduled,
        JobStatus::Running,
        JobStatus::Validating,
        JobStatus::Succeeded,
        JobStatus::PartialSuccess,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Submitting => "submitting",
            JobStatus::Scheduled => "scheduled",
            JobStatus::Running => "running",
            JobStatus::Validating => "validating",
            JobStatus::Succeeded => "succeeded",
            JobStatus::PartialSuccess => "partial_success",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded
                | JobStatus::PartialSuccess
                | JobStatus::Failed
                | JobStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match self {
            Pending => matches!(next, Submitting | Failed | Cancelled),
            Submitting => matches!(next, Scheduled | Failed | Cancelled),
            Scheduled => matches!(next, Running | Validating | Succeeded | Failed | Cancelled),
            Running => matches!(next, Succeeded | Failed | Validating | Cancelled),
            Validating => matches!(next, Succeeded | PartialSuccess | Failed | Cancelled),
            Succeeded | PartialSuccess | Failed | Cancelled => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == wanted)
            .ok_or_else(|| {
                let known: Vec<_> = JobStatus::ALL.iter().map(|s| s.as_str()).collect();
                format!("unknown job status '{}' (expected one of {})", s, known.join(", "))
            })
    }
}

/// Outcome of output validation: every expected output present, some, or none.
pub fn validation_outcome(verified: usize, missing: usize) -> JobStatus {
    if missing == 0 {
        JobStatus::Succeeded
    } else if verified > 0 {
        JobStatus::PartialSuccess
    } else {
        JobStatus::Failed
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub message: String,
    pub code: String,
}

impl JobFailure {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: code.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    pub job_id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub k8s_name: Option<String>,
    #[serde(default)]
    pub k8s_namespace: Option<String>,
    #[serde(default)]
    pub tasks_total: u64,
    #[serde(default)]
    pub tasks_completed: u64,
    #[serde(default)]
    pub progress_percent: f64,
    #[serde(default)]
    pub results_path: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    #[serde(default)]
    pub validation_completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tasks_verified: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_outputs: Vec<OutputSpec>,
}

impl JobState {
    fn new(job_id: &str, metadata: BTreeMap<String, Value>) -> Self {
        let now = Utc::now();
        Self {
            job_id: job_id.to_string(),
            status: JobStatus::Pending,
            created_at: now,
            updated_at: now,
            k8s_name: None,
            k8s_namespace: None,
            tasks_total: 0,
            tasks_completed: 0,
            progress_percent: 0.0,
            results_path: None,
            error_message: None,
            error_code: None,
            metadata,
            validation_completed_at: None,
            tasks_verified: None,
            missing_outputs: Vec::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("job '{job_id}' not found in registry")]
    NotFound { job_id: String },
    #[error("job '{job_id}' is already registered")]
    AlreadyExists { job_id: String },
    #[error("job registry unavailable: {source}")]
    Unavailable {
        #[source]
        source: StorageError,
    },
    #[error("registry record for job '{job_id}' is corrupt: {reason}")]
    Corrupt { job_id: String, reason: String },
    #[error("job '{job_id}' cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("job '{job_id}' is {status}; {operation} requires {required}")]
    InvalidState {
        job_id: String,
        status: JobStatus,
        operation: &'static str,
        required: JobStatus,
    },
}

impl RegistryError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RegistryError::NotFound { .. })
    }

    /// The registry could not be reached; absence of the job is unknown.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, RegistryError::Unavailable { .. })
    }

    fn from_storage(job_id: &str, err: StorageError) -> Self {
        match err {
            StorageError::NotFound { .. } | StorageError::InvalidKey { .. } => {
                RegistryError::NotFound {
                    job_id: job_id.to_string(),
                }
            }
            StorageError::Json { source, .. } => RegistryError::Corrupt {
                job_id: job_id.to_string(),
                reason: source.to_string(),
            },
            other => RegistryError::Unavailable { source: other },
        }
    }
}

pub type RegistryResult<T> = Result<T, RegistryError>;

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    /// Only jobs created at or after this instant.
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl JobFilter {
    fn matches(&self, state: &JobState) -> bool {
        self.status.map_or(true, |s| state.status == s)
            && self.since.map_or(true, |since| state.created_at >= since)
    }
}

#[derive(Debug, Clone)]
pub struct JobRegistry {
    backend: DynBackend,
}

impl JobRegistry {
    pub fn new(backend: DynBackend) -> Self {
        Self { backend }
    }

    pub fn key(job_id: &str) -> String {
        format!("{}{}.json", REGISTRY_PREFIX, job_id)
    }

    /// Records a new job in `PENDING`.
    pub fn register_job(
        &self,
        job_id: &str,
        metadata: BTreeMap<String, Value>,
    ) -> RegistryResult<JobState> {
        let key = Self::key(job_id);
        let taken = self
            .backend
            .exists(&key)
            .map_err(|err| RegistryError::from_storage(job_id, err))?;
        if taken {
            return Err(RegistryError::AlreadyExists {
                job_id: job_id.to_string(),
            });
        }
        let state = JobState::new(job_id, metadata);
        self.save(&state)?;
        info!(job_id, "registered job");
        Ok(state)
    }

    pub fn get_job(&self, job_id: &str) -> RegistryResult<JobState> {
        self.backend
            .load_json(&Self::key(job_id))
            .map_err(|err| RegistryError::from_storage(job_id, err))
    }

    fn save(&self, state: &JobState) -> RegistryResult<()> {
        self.backend
            .save_json(&Self::key(&state.job_id), state)
            .map_err(|err| RegistryError::from_storage(&state.job_id, err))
    }

    fn modify(
        &self,
        job_id: &str,
        apply: impl FnOnce(&mut JobState) -> RegistryResult<()>,
    ) -> RegistryResult<JobState> {
        let mut state = self.get_job(job_id)?;
        apply(&mut state)?;
        state.updated_at = Utc::now();
        self.save(&state)?;
        Ok(state)
    }

    /// Moves a job to `status`. Setting the current status again is a no-op;
    /// anything outside the transition table is rejected.
    pub fn update_job_status(
        &self,
        job_id: &str,
        status: JobStatus,
        failure: Option<JobFailure>,
    ) -> RegistryResult<JobState> {
        let current = self.get_job(job_id)?;
        if current.status == status {
            debug!(job_id, %status, "status unchanged");
            return Ok(current);
        }
        self.modify(job_id, |state| {
            if !state.status.can_transition_to(status) {
                return Err(RegistryError::InvalidTransition {
                    job_id: job_id.to_string(),
                    from: state.status,
                    to: status,
                });
            }
            info!(job_id, from = %state.status, to = %status, "job status changed");
            state.status = status;
            if let Some(failure) = failure {
                state.error_message = Some(failure.message);
                state.error_code = Some(failure.code);
            }
            Ok(())
        })
    }

    /// Records where the job's execution unit lives.
    pub fn set_execution(&self, job_id: &str, name: &str, namespace: &str) -> RegistryResult<JobState> {
        self.modify(job_id, |state| {
            state.k8s_name = Some(name.to_string());
            state.k8s_namespace = Some(namespace.to_string());
            Ok(())
        })
    }

    pub fn set_results_path(&self, job_id: &str, path: &str) -> RegistryResult<JobState> {
        self.modify(job_id, |state| {
            state.results_path = Some(path.to_string());
            Ok(())
        })
    }

    /// Stores task counts and the derived percentage, capped at 100.
    pub fn update_progress(&self, job_id: &str, completed: u64, total: u64) -> RegistryResult<JobState> {
        self.modify(job_id, |state| {
            state.tasks_completed = completed;
            state.tasks_total = total;
            state.progress_percent = if total == 0 {
                0.0
            } else {
                (completed as f64 / total as f64 * 100.0).min(100.0)
            };
            Ok(())
        })
    }

    /// Jobs matching `filter`, newest first. Corrupt records are skipped.
    pub fn list_jobs(&self, filter: &JobFilter) -> RegistryResult<Vec<JobState>> {
        let keys = self
            .backend
            .list_keys(REGISTRY_PREFIX)
            .map_err(|source| RegistryError::Unavailable { source })?;
        let mut jobs = Vec::new();
        for key in keys {
            let Some(job_id) = key
                .strip_prefix(REGISTRY_PREFIX)
                .and_then(|rest| rest.strip_suffix(".json"))
            else {
                continue;
            };
            match self.get_job(job_id) {
                Ok(state) if filter.matches(&state) => jobs.push(state),
                Ok(_) | Err(RegistryError::NotFound { .. }) => {}
                Err(RegistryError::Corrupt { job_id, reason }) => {
                    warn!(%job_id, %reason, "skipping corrupt registry record");
                }
                Err(err) => return Err(err),
            }
        }
        jobs.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.job_id.cmp(&b.job_id))
        });
        if let Some(limit) = filter.limit {
            jobs.truncate(limit);
        }
        Ok(jobs)
    }

    /// Jobs not yet in a terminal state.
    pub fn active_jobs(&self) -> RegistryResult<Vec<JobState>> {
        let mut jobs = self.list_jobs(&JobFilter::default())?;
        jobs.retain(|job| !job.status.is_terminal());
        Ok(jobs)
    }

    /// Records the result of output validation for a `VALIDATING` job and
    /// moves it to its terminal status.
    pub fn finalize_with_validation(
        &self,
        job_id: &str,
        verified: u64,
        missing: Vec<OutputSpec>,
    ) -> RegistryResult<JobState> {
        self.modify(job_id, |state| {
            if state.status != JobStatus::Validating {
                return Err(RegistryError::InvalidState {
                    job_id: job_id.to_string(),
                    status: state.status,
                    operation: "finalizing validation",
                    required: JobStatus::Validating,
                });
            }
            let outcome = validation_outcome(verified as usize, missing.len());
            match outcome {
                JobStatus::PartialSuccess => {
                    state.error_code = Some("OUTPUTS_MISSING".into());
                    state.error_message = Some(format!(
                        "{} of {} expected outputs missing",
                        missing.len(),
                        verified as usize + missing.len()
                    ));
                }
                JobStatus::Failed => {
                    state.error_code = Some("NO_OUTPUTS".into());
                    state.error_message = Some("no expected outputs were found".into());
                }
                _ => {}
            }
            info!(job_id, verified, missing = missing.len(), outcome = %outcome, "validation finalized");
            state.status = outcome;
            state.tasks_verified = Some(verified);
            state.missing_outputs = missing;
            state.validation_completed_at = Some(Utc::now());
            Ok(())
        })
    }

    /// The outputs a `PARTIAL_SUCCESS` job still lacks.
    pub fn get_resumable_tasks(&self, job_id: &str) -> RegistryResult<Vec<OutputSpec>> {
        let state = self.get_job(job_id)?;
        if state.status != JobStatus::PartialSuccess {
            return Err(RegistryError::InvalidState {
                job_id: job_id.to_string(),
                status: state.status,
                operation: "resuming",
                required: JobStatus::PartialSuccess,
            });
        }
        Ok(state.missing_outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelops_core::MemoryBackend;
    use modelops_provenance::ResultKind;
    use serde_json::json;
    use std::sync::Arc;

    fn registry() -> (JobRegistry, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        (JobRegistry::new(backend.clone()), backend)
    }

    fn missing_spec(seed: u64) -> OutputSpec {
        OutputSpec {
            param_id: "p".repeat(64),
            seed: Some(seed),
            output_type: ResultKind::Simulation,
            bundle_ref: "sha256:0123456789abcdef".into(),
            bundle_digest: "0123456789abcdef".into(),
            model_digest: None,
            entrypoint: "models.seir:run".into(),
            requested_outputs: Vec::new(),
            replicate_count: 3,
            seeds: Vec::new(),
            provenance_path: format!("token/v2/sims/x/seed_{}", seed),
            param_values: Some(BTreeMap::from([("beta".to_string(), json!(0.3))])),
            target_id: None,
            aggregation_id: None,
        }
    }

    fn walk_to(registry: &JobRegistry, job_id: &str, path: &[JobStatus]) {
        for status in path {
            registry
                .update_job_status(job_id, *status, None)
                .expect("transition");
        }
    }

    #[test]
    fn transition_table_matches_lifecycle() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(Submitting));
        assert!(!Pending.can_transition_to(Running));
        assert!(Scheduled.can_transition_to(Validating));
        assert!(Running.can_transition_to(Validating));
        assert!(Validating.can_transition_to(PartialSuccess));
        assert!(!Running.can_transition_to(PartialSuccess));
        for terminal in [Succeeded, PartialSuccess, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            assert!(JobStatus::ALL.iter().all(|s| !terminal.can_transition_to(*s)));
        }
    }

    #[test]
    fn status_parses_from_cli_spellings() {
        assert_eq!("partial-success".parse::<JobStatus>(), Ok(JobStatus::PartialSuccess));
        assert_eq!("RUNNING".parse::<JobStatus>(), Ok(JobStatus::Running));
        assert!("done".parse::<JobStatus>().is_err());
        assert_eq!(
            serde_json::to_value(JobStatus::PartialSuccess).expect("encode"),
            json!("partial_success")
        );
    }

    #[test]
    fn validation_outcome_is_k_of_n() {
        assert_eq!(validation_outcome(10, 0), JobStatus::Succeeded);
        assert_eq!(validation_outcome(7, 3), JobStatus::PartialSuccess);
        assert_eq!(validation_outcome(0, 10), JobStatus::Failed);
        assert_eq!(validation_outcome(0, 0), JobStatus::Succeeded);
    }

    #[test]
    fn register_and_walk_lifecycle() {
        let (registry, _) = registry();
        let state = registry.register_job("job-1", BTreeMap::new()).expect("register");
        assert_eq!(state.status, JobStatus::Pending);
        assert!(matches!(
            registry.register_job("job-1", BTreeMap::new()),
            Err(RegistryError::AlreadyExists { .. })
        ));

        walk_to(&registry, "job-1", &[JobStatus::Submitting, JobStatus::Scheduled]);
        registry.set_execution("job-1", "job-job-1", "modelops").expect("exec");
        let state = registry
            .update_job_status("job-1", JobStatus::Running, None)
            .expect("running");
        assert_eq!(state.k8s_name.as_deref(), Some("job-job-1"));
        assert!(state.updated_at >= state.created_at);

        let again = registry
            .update_job_status("job-1", JobStatus::Running, None)
            .expect("same status");
        assert_eq!(again.status, JobStatus::Running);

        let err = registry
            .update_job_status("job-1", JobStatus::Pending, None)
            .expect_err("backwards");
        assert!(matches!(err, RegistryError::InvalidTransition { .. }));
    }

    #[test]
    fn failure_details_are_recorded() {
        let (registry, _) = registry();
        registry.register_job("job-f", BTreeMap::new()).expect("register");
        let state = registry
            .update_job_status(
                "job-f",
                JobStatus::Failed,
                Some(JobFailure::new("SUBMIT_FAILED", "cluster rejected job")),
            )
            .expect("fail");
        assert_eq!(state.error_code.as_deref(), Some("SUBMIT_FAILED"));
        assert_eq!(state.error_message.as_deref(), Some("cluster rejected job"));
    }

    #[test]
    fn progress_is_derived_from_counts() {
        let (registry, _) = registry();
        registry.register_job("job-p", BTreeMap::new()).expect("register");
        let state = registry.update_progress("job-p", 3, 12).expect("progress");
        assert_eq!(state.progress_percent, 25.0);
        let state = registry.update_progress("job-p", 0, 0).expect("progress");
        assert_eq!(state.progress_percent, 0.0);
    }

    #[test]
    fn unavailable_is_distinct_from_not_found() {
        let (registry, backend) = registry();
        assert!(registry.get_job("ghost").expect_err("missing").is_not_found());

        registry.register_job("job-u", BTreeMap::new()).expect("register");
        backend.set_offline(true);
        let err = registry.get_job("job-u").expect_err("offline");
        assert!(err.is_unavailable());
        assert!(!err.is_not_found());
        assert!(registry.list_jobs(&JobFilter::default()).expect_err("offline").is_unavailable());
    }

    #[test]
    fn corrupt_records_are_skipped_when_listing() {
        let (registry, backend) = registry();
        registry.register_job("job-ok", BTreeMap::new()).expect("register");
        backend
            .save(&JobRegistry::key("job-bad"), b"{not json")
            .expect("save");
        assert!(matches!(
            registry.get_job("job-bad"),
            Err(RegistryError::Corrupt { .. })
        ));
        let jobs = registry.list_jobs(&JobFilter::default()).expect("list");
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_id, "job-ok");
    }

    #[test]
    fn list_filters_and_orders_newest_first() {
        let (registry, backend) = registry();
        for (id, hours_ago) in [("old", 48), ("mid", 5), ("new", 1)] {
            let mut state = JobState::new(id, BTreeMap::new());
            state.created_at = Utc::now() - chrono::Duration::hours(hours_ago);
            backend.save_json(&JobRegistry::key(id), &state).expect("seed");
        }
        registry
            .update_job_status("mid", JobStatus::Cancelled, None)
            .expect("cancel");

        let all = registry.list_jobs(&JobFilter::default()).expect("list");
        let ids: Vec<_> = all.iter().map(|j| j.job_id.as_str()).collect();
        assert_eq!(ids, vec!["new", "mid", "old"]);

        let recent = registry
            .list_jobs(&JobFilter {
                since: Some(Utc::now() - chrono::Duration::hours(24)),
                ..JobFilter::default()
            })
            .expect("list");
        assert_eq!(recent.len(), 2);

        let cancelled = registry
            .list_jobs(&JobFilter {
                status: Some(JobStatus::Cancelled),
                ..JobFilter::default()
            })
            .expect("list");
        assert_eq!(cancelled.len(), 1);

        let limited = registry
            .list_jobs(&JobFilter {
                limit: Some(1),
                ..JobFilter::default()
            })
            .expect("list");
        assert_eq!(limited[0].job_id, "new");

        let active = registry.active_jobs().expect("active");
        assert_eq!(active.len(), 2);
    }

    #[test]
    fn finalize_records_partial_success_and_resumable_tasks() {
        let (registry, _) = registry();
        registry.register_job("job-v", BTreeMap::new()).expect("register");
        assert!(matches!(
            registry.finalize_with_validation("job-v", 1, Vec::new()),
            Err(RegistryError::InvalidState { .. })
        ));
        walk_to(
            &registry,
            "job-v",
            &[JobStatus::Submitting, JobStatus::Scheduled, JobStatus::Running, JobStatus::Validating],
        );

        let state = registry
            .finalize_with_validation("job-v", 4, vec![missing_spec(1), missing_spec(2)])
            .expect("finalize");
        assert_eq!(state.status, JobStatus::PartialSuccess);
        assert_eq!(state.tasks_verified, Some(4));
        assert!(state.validation_completed_at.is_some());
        assert_eq!(state.error_code.as_deref(), Some("OUTPUTS_MISSING"));

        let resumable = registry.get_resumable_tasks("job-v").expect("resumable");
        assert_eq!(resumable, vec![missing_spec(1), missing_spec(2)]);
    }

    #[test]
    fn resumable_tasks_require_partial_success() {
        let (registry, _) = registry();
        registry.register_job("job-r", BTreeMap::new()).expect("register");
        let err = registry.get_resumable_tasks("job-r").expect_err("pending");
        assert!(matches!(
            err,
            RegistryError::InvalidState {
                status: JobStatus::Pending,
                ..
            }
        ));
    }

    #[test]
    fn finalize_with_nothing_verified_fails() {
        let (registry, _) = registry();
        registry.register_job("job-z", BTreeMap::new()).expect("register");
        walk_to(
            &registry,
            "job-z",
            &[JobStatus::Submitting, JobStatus::Scheduled, JobStatus::Validating],
        );
        let state = registry
            .finalize_with_validation("job-z", 0, vec![missing_spec(0)])
            .expect("finalize");
        assert_eq!(state.status, JobStatus::Failed);
        assert_eq!(state.error_code.as_deref(), Some("NO_OUTPUTS"));
    }
}
