pub mod job;
pub mod lifecycle;
pub mod manifest;
pub mod registry;

pub use job::{
    bundle_digest, generate_job_id, AggregationRequest, CalibrationJob, Job, JobError, JobType,
    ParameterSet, SeedPlan, SimJob, TargetSpec, META_JOB_KEY, META_ORIGINAL_JOB_ID,
    META_RESUME_ATTEMPT, META_ROOT_JOB_ID,
};
pub use lifecycle::{
    map_orchestrator_status, ExecutionHandle, ExecutionRequest, ExecutionStatus, JobLifecycle,
    LifecycleError, LifecycleResult, LifecycleSettings, Orchestrator, OrchestratorError,
    ResumeOutcome, SyncOutcome, ValidationReport,
};
pub use manifest::{
    build_resume_job, generate_output_manifest, reconstruct_task_from_spec, ManifestError,
    OutputSpec, ReconstructedTask,
};
pub use registry::{
    validation_outcome, JobFailure, JobFilter, JobRegistry, JobState, JobStatus, RegistryError,
    RegistryResult, REGISTRY_PREFIX,
};
