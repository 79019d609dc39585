//! Submission, status synchronization, output validation, resumption and
//! cancellation, driven against an [`Orchestrator`].

use crate::job::{
    Job, JobError, JobType, META_JOB_KEY, META_JOB_TYPE, META_RESUME_ATTEMPT, META_ROOT_JOB_ID,
};
use crate::manifest::{build_resume_job, generate_output_manifest, ManifestError, OutputSpec};
use crate::registry::{
    validation_outcome, JobFailure, JobRegistry, JobState, JobStatus, RegistryError,
};
use modelops_core::{DynBackend, StorageBackendExt, StorageError};
use modelops_provenance::{ProvenanceError, ProvenanceStore};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Counts reported by the orchestrator for one execution unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionStatus {
    pub active: u32,
    pub succeeded: u32,
    pub failed: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionRequest {
    pub job_id: String,
    pub job_type: JobType,
    /// Storage key of the job body; workers fetch the job from here.
    pub blob_key: String,
    pub namespace: String,
    pub image: String,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionHandle {
    pub name: String,
    pub namespace: String,
}

impl ExecutionHandle {
    fn of(state: &JobState) -> Option<Self> {
        Some(Self {
            name: state.k8s_name.clone()?,
            namespace: state.k8s_namespace.clone()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrchestratorError {
    #[error("orchestrator unavailable: {0}")]
    Unavailable(String),
    #[error("orchestrator rejected '{name}': {reason}")]
    Rejected { name: String, reason: String },
}

/// The cluster-side executor of jobs.
pub trait Orchestrator: Send + Sync {
    fn submit(&self, request: &ExecutionRequest) -> Result<ExecutionHandle, OrchestratorError>;
    /// `Ok(None)` when the execution unit no longer exists.
    fn status(&self, handle: &ExecutionHandle) -> Result<Option<ExecutionStatus>, OrchestratorError>;
    fn cancel(&self, handle: &ExecutionHandle) -> Result<(), OrchestratorError>;
}

/// The registry status implied by an orchestrator observation, or `None`
/// when the job should stay where it is.
///
/// Only `SCHEDULED` and `RUNNING` jobs follow the orchestrator. A vanished
/// execution unit fails a running job; completion goes through
/// `VALIDATING` when validation is enabled.
pub fn map_orchestrator_status(
    prior: JobStatus,
    observed: Option<ExecutionStatus>,
    validation_enabled: bool,
) -> Option<JobStatus> {
    if !matches!(prior, JobStatus::Scheduled | JobStatus::Running) {
        return None;
    }
    let Some(observed) = observed else {
        return (prior == JobStatus::Running).then_some(JobStatus::Failed);
    };
    if observed.failed > 0 {
        return Some(JobStatus::Failed);
    }
    if observed.succeeded > 0 && observed.active == 0 {
        return Some(if validation_enabled {
            JobStatus::Validating
        } else {
            JobStatus::Succeeded
        });
    }
    if observed.active > 0 && prior == JobStatus::Scheduled {
        return Some(JobStatus::Running);
    }
    None
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Provenance(#[from] ProvenanceError),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error("job body for '{job_id}' could not be stored or loaded: {source}")]
    JobBody {
        job_id: String,
        #[source]
        source: StorageError,
    },
    #[error("registry record for '{job_id}' does not reference a job body")]
    MissingJobKey { job_id: String },
}

impl LifecycleError {
    pub fn is_registry_unavailable(&self) -> bool {
        matches!(self, LifecycleError::Registry(err) if err.is_unavailable())
    }
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleSettings {
    pub namespace: String,
    pub image: String,
    pub validation_enabled: bool,
    /// Extra environment handed to every execution unit.
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncOutcome {
    pub job_id: String,
    pub previous: JobStatus,
    pub current: JobStatus,
    /// Validation run because the job reached `VALIDATING` during this sync.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationReport>,
}

impl SyncOutcome {
    pub fn changed(&self) -> bool {
        self.previous != self.current
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub job_id: String,
    pub expected: usize,
    pub verified: usize,
    pub missing: Vec<OutputSpec>,
    /// Status the counts imply.
    pub outcome: JobStatus,
    /// Status actually recorded; `None` when the job was not `VALIDATING`.
    pub finalized: Option<JobStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResumeOutcome {
    pub original_job_id: String,
    pub new_job_id: String,
    pub resume_attempt: u64,
    pub sim_tasks: usize,
    pub aggregations: usize,
    pub state: JobState,
}

pub struct JobLifecycle<O: Orchestrator> {
    backend: DynBackend,
    registry: JobRegistry,
    store: ProvenanceStore,
    orchestrator: O,
    settings: LifecycleSettings,
}

impl<O: Orchestrator> JobLifecycle<O> {
    /// Job bodies and registry records share `backend`.
    pub fn new(
        backend: DynBackend,
        store: ProvenanceStore,
        orchestrator: O,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            registry: JobRegistry::new(backend.clone()),
            backend,
            store,
            orchestrator,
            settings,
        }
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn store(&self) -> &ProvenanceStore {
        &self.store
    }

    pub fn orchestrator(&self) -> &O {
        &self.orchestrator
    }

    /// Validates and registers `job`, stores its body and hands it to the
    /// orchestrator. A rejected submission leaves the job `FAILED`.
    pub fn submit_job(&self, job: &Job) -> LifecycleResult<JobState> {
        job.validate()?;
        let job_id = job.job_id();
        let manifest = generate_output_manifest(job, self.store.schema())?;

        let blob_key = job.to_blob_key();
        let mut metadata = job.metadata().clone();
        metadata.insert(META_JOB_KEY.into(), json!(blob_key));
        metadata.insert(META_JOB_TYPE.into(), json!(job.job_type().as_str()));
        metadata.insert("bundle_ref".into(), json!(job.bundle_ref()));
        metadata.insert("schema".into(), json!(self.store.schema().name()));
        self.registry.register_job(job_id, metadata)?;

        if let Err(source) = self.backend.save_json(&blob_key, job) {
            self.registry.update_job_status(
                job_id,
                JobStatus::Failed,
                Some(JobFailure::new("JOB_BODY_UNAVAILABLE", source.to_string())),
            )?;
            return Err(LifecycleError::JobBody {
                job_id: job_id.to_string(),
                source,
            });
        }
        self.registry
            .update_progress(job_id, 0, manifest.len() as u64)?;
        let results_root = self
            .store
            .schema()
            .root_prefix()
            .map_err(ManifestError::from)?;
        self.registry.set_results_path(job_id, &results_root)?;
        self.registry
            .update_job_status(job_id, JobStatus::Submitting, None)?;

        let request = ExecutionRequest {
            job_id: job_id.to_string(),
            job_type: job.job_type(),
            blob_key,
            namespace: self.settings.namespace.clone(),
            image: self.settings.image.clone(),
            env: self.settings.env.clone(),
        };
        match self.orchestrator.submit(&request) {
            Ok(handle) => {
                info!(job_id, execution = %handle.name, namespace = %handle.namespace, "job submitted");
                self.registry
                    .set_execution(job_id, &handle.name, &handle.namespace)?;
                Ok(self
                    .registry
                    .update_job_status(job_id, JobStatus::Scheduled, None)?)
            }
            Err(err) => {
                warn!(job_id, error = %err, "submission failed");
                self.registry.update_job_status(
                    job_id,
                    JobStatus::Failed,
                    Some(JobFailure::new("SUBMIT_FAILED", err.to_string())),
                )?;
                Err(err.into())
            }
        }
    }

    /// The job body a registry record points at.
    pub fn load_job(&self, state: &JobState) -> LifecycleResult<Job> {
        let key = state
            .metadata
            .get(META_JOB_KEY)
            .and_then(Value::as_str)
            .ok_or_else(|| LifecycleError::MissingJobKey {
                job_id: state.job_id.clone(),
            })?;
        self.backend
            .load_json(key)
            .map_err(|source| LifecycleError::JobBody {
                job_id: state.job_id.clone(),
                source,
            })
    }

    /// Pulls the orchestrator's view of one job into the registry.
    pub fn sync_job(&self, job_id: &str) -> LifecycleResult<SyncOutcome> {
        let state = self.registry.get_job(job_id)?;
        let unchanged = |state: &JobState| SyncOutcome {
            job_id: job_id.to_string(),
            previous: state.status,
            current: state.status,
            validation: None,
        };
        if !matches!(state.status, JobStatus::Scheduled | JobStatus::Running) {
            return Ok(unchanged(&state));
        }
        let Some(handle) = ExecutionHandle::of(&state) else {
            return Ok(unchanged(&state));
        };

        let observed = self.orchestrator.status(&handle)?;
        let Some(next) =
            map_orchestrator_status(state.status, observed, self.settings.validation_enabled)
        else {
            return Ok(unchanged(&state));
        };
        let failure = match (next, observed) {
            (JobStatus::Failed, None) => Some(JobFailure::new(
                "EXECUTION_MISSING",
                format!("execution unit {}/{} no longer exists", handle.namespace, handle.name),
            )),
            (JobStatus::Failed, Some(s)) => Some(JobFailure::new(
                "EXECUTION_FAILED",
                format!("{} worker(s) failed", s.failed),
            )),
            _ => None,
        };
        let updated = self.registry.update_job_status(job_id, next, failure)?;
        Ok(SyncOutcome {
            job_id: job_id.to_string(),
            previous: state.status,
            current: updated.status,
            validation: None,
        })
    }

    /// Syncs every non-terminal job and validates those that reach
    /// `VALIDATING`. Orchestrator failures are logged per job; an
    /// unreachable registry aborts the sweep.
    pub fn sync_active_jobs(&self) -> LifecycleResult<Vec<SyncOutcome>> {
        let mut outcomes = Vec::new();
        for state in self.registry.active_jobs()? {
            match self.sync_and_validate(&state.job_id) {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) if err.is_registry_unavailable() => return Err(err),
                Err(err) => warn!(job_id = %state.job_id, error = %err, "sync failed"),
            }
        }
        Ok(outcomes)
    }

    /// [`Self::sync_job`], then validation if the job is now `VALIDATING`.
    pub fn sync_and_validate(&self, job_id: &str) -> LifecycleResult<SyncOutcome> {
        let mut outcome = self.sync_job(job_id)?;
        if outcome.current == JobStatus::Validating {
            let report = self.validate_outputs(job_id)?;
            if let Some(status) = report.finalized {
                outcome.current = status;
            }
            outcome.validation = Some(report);
        }
        Ok(outcome)
    }

    /// Checks the job's expected outputs against provenance storage. A job
    /// in `VALIDATING` is finalized; any other job only gets a report.
    pub fn validate_outputs(&self, job_id: &str) -> LifecycleResult<ValidationReport> {
        let state = self.registry.get_job(job_id)?;
        let job = self.load_job(&state)?;
        let manifest = generate_output_manifest(&job, self.store.schema())?;
        let expected = manifest.len();

        let mut missing = Vec::new();
        for spec in manifest {
            if !self.store.exists(&spec.provenance_path)? {
                missing.push(spec);
            }
        }
        let verified = expected - missing.len();
        let outcome = validation_outcome(verified, missing.len());
        info!(job_id, expected, verified, missing = missing.len(), "validated outputs");

        self.registry
            .update_progress(job_id, verified as u64, expected as u64)?;
        let finalized = if state.status == JobStatus::Validating {
            let state = self.registry.finalize_with_validation(
                job_id,
                verified as u64,
                missing.clone(),
            )?;
            Some(state.status)
        } else {
            None
        };
        Ok(ValidationReport {
            job_id: job_id.to_string(),
            expected,
            verified,
            missing,
            outcome,
            finalized,
        })
    }

    /// Submits a new job that re-runs only the outputs a `PARTIAL_SUCCESS`
    /// job is missing.
    pub fn resume_job(&self, job_id: &str) -> LifecycleResult<ResumeOutcome> {
        let missing = self.registry.get_resumable_tasks(job_id)?;
        let state = self.registry.get_job(job_id)?;
        let original = self.load_job(&state)?;

        let root = original
            .metadata()
            .get(META_ROOT_JOB_ID)
            .and_then(Value::as_str)
            .unwrap_or(job_id);
        let mut resume_attempt = original
            .metadata()
            .get(META_RESUME_ATTEMPT)
            .and_then(Value::as_u64)
            .unwrap_or(0)
            + 1;
        // A failed or cancelled attempt keeps its id registered; move past it.
        // A live or succeeded one is left for submit_job to refuse.
        let new_job_id = loop {
            let candidate = format!("{}-resume-{}", root, resume_attempt);
            match self.registry.get_job(&candidate) {
                Ok(prior) if matches!(prior.status, JobStatus::Failed | JobStatus::Cancelled) => {
                    debug!(
                        job_id,
                        skipped = %candidate,
                        status = %prior.status,
                        "skipping dead resume attempt"
                    );
                    resume_attempt += 1;
                }
                Ok(_) => break candidate,
                Err(err) if err.is_not_found() => break candidate,
                Err(err) => return Err(err.into()),
            }
        };

        let resumed = build_resume_job(&original, &missing, new_job_id.clone(), resume_attempt)?;
        let sim_tasks: usize = resumed
            .parameter_sets
            .iter()
            .map(|set| set.seeds.seeds().len())
            .sum();
        let aggregations = resumed.aggregations.len();
        info!(
            job_id,
            new_job_id = %new_job_id,
            sim_tasks,
            aggregations,
            "resuming job"
        );
        let state = self.submit_job(&Job::Simulation(resumed))?;
        Ok(ResumeOutcome {
            original_job_id: job_id.to_string(),
            new_job_id,
            resume_attempt,
            sim_tasks,
            aggregations,
            state,
        })
    }

    /// Cancels a non-terminal job. Orchestrator cleanup is best effort.
    pub fn cancel_job(&self, job_id: &str) -> LifecycleResult<JobState> {
        let state = self.registry.get_job(job_id)?;
        if !state.status.can_transition_to(JobStatus::Cancelled) {
            return Err(RegistryError::InvalidTransition {
                job_id: job_id.to_string(),
                from: state.status,
                to: JobStatus::Cancelled,
            }
            .into());
        }
        if let Some(handle) = ExecutionHandle::of(&state) {
            if let Err(err) = self.orchestrator.cancel(&handle) {
                warn!(job_id, error = %err, "orchestrator cancel failed");
            }
        }
        Ok(self.registry.update_job_status(
            job_id,
            JobStatus::Cancelled,
            Some(JobFailure::new("CANCELLED", "cancelled by user")),
        )?)
    }
}
