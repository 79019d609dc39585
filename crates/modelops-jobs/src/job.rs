//! Job specifications as submitted by clients.
//!
//! A job body is serialized to JSON and stored under [`Job::to_blob_key`];
//! only that key travels through the orchestrator, and workers pull the full
//! body from storage.

use modelops_provenance::{param_id, SimTask};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

/// Minimum hex digits a bundle digest needs; paths use its first 12.
const MIN_DIGEST_HEX: usize = 12;

pub const META_JOB_KEY: &str = "job_key";
pub const META_JOB_TYPE: &str = "job_type";
pub const META_ORIGINAL_JOB_ID: &str = "original_job_id";
pub const META_ROOT_JOB_ID: &str = "root_job_id";
pub const META_RESUME_ATTEMPT: &str = "resume_attempt";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("invalid job id '{0}': use letters, digits, '.', '_' or '-'")]
    InvalidJobId(String),
    #[error("bundle ref '{0}' does not carry a sha256 digest")]
    InvalidBundleRef(String),
    #[error("job is missing {0}")]
    MissingField(&'static str),
    #[error("parameter set {param_id} has no seeds")]
    EmptySeedPlan { param_id: String },
    #[error("parameter set {param_id} lists seed {seed} more than once")]
    DuplicateSeed { param_id: String, seed: u64 },
    #[error("parameter set {param_id} appears more than once")]
    DuplicateParameterSet { param_id: String },
    #[error("invalid target spec: {0}")]
    InvalidTargetSpec(String),
    #[error("invalid calibration settings: {0}")]
    InvalidCalibration(String),
}

/// How a parameter set's replicates map to seeds.
///
/// `Replicates` uses the replicate index as the seed; `Explicit` carries the
/// caller's seeds verbatim. The two are never mixed: resumption always
/// produces `Explicit` plans so the exact missing seeds are re-run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "seed_mode", rename_all = "snake_case")]
pub enum SeedPlan {
    Replicates { replicate_count: u32 },
    Explicit { seeds: Vec<u64> },
}

impl SeedPlan {
    pub fn seeds(&self) -> Vec<u64> {
        match self {
            SeedPlan::Replicates { replicate_count } => (0..u64::from(*replicate_count)).collect(),
            SeedPlan::Explicit { seeds } => seeds.clone(),
        }
    }

    pub fn replicate_count(&self) -> u32 {
        match self {
            SeedPlan::Replicates { replicate_count } => *replicate_count,
            SeedPlan::Explicit { seeds } => seeds.len() as u32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
    pub params: BTreeMap<String, Value>,
    #[serde(flatten)]
    pub seeds: SeedPlan,
}

impl ParameterSet {
    pub fn param_id(&self) -> String {
        param_id(&self.params)
    }

    fn validate(&self) -> Result<(), JobError> {
        let seeds = self.seeds.seeds();
        if seeds.is_empty() {
            return Err(JobError::EmptySeedPlan {
                param_id: self.param_id(),
            });
        }
        let mut seen = BTreeSet::new();
        for seed in seeds {
            if !seen.insert(seed) {
                return Err(JobError::DuplicateSeed {
                    param_id: self.param_id(),
                    seed,
                });
            }
        }
        Ok(())
    }
}

/// Target data, loss and weights evaluated against simulation outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetSpec {
    /// Target entrypoints, e.g. `targets.prevalence:loss`.
    pub targets: Vec<String>,
    /// Observed data per target.
    #[serde(default)]
    pub data: BTreeMap<String, String>,
    #[serde(default = "default_loss")]
    pub loss: String,
    #[serde(default)]
    pub weights: BTreeMap<String, f64>,
}

fn default_loss() -> String {
    "mse".to_string()
}

impl TargetSpec {
    fn validate(&self) -> Result<(), JobError> {
        if self.targets.is_empty() {
            return Err(JobError::InvalidTargetSpec("no targets listed".into()));
        }
        let mut seen = BTreeSet::new();
        for target in &self.targets {
            if target.trim().is_empty() {
                return Err(JobError::InvalidTargetSpec("empty target entrypoint".into()));
            }
            if !seen.insert(target.as_str()) {
                return Err(JobError::InvalidTargetSpec(format!(
                    "target '{}' listed twice",
                    target
                )));
            }
        }
        if let Some(unknown) = self.weights.keys().find(|k| !seen.contains(k.as_str())) {
            return Err(JobError::InvalidTargetSpec(format!(
                "weight given for unknown target '{}'",
                unknown
            )));
        }
        Ok(())
    }
}

/// A single aggregation to (re)compute, independent of any target spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationRequest {
    pub params: BTreeMap<String, Value>,
    pub target: String,
    /// Every replicate seed the aggregation reduces over.
    pub seeds: Vec<u64>,
}

impl AggregationRequest {
    pub fn param_id(&self) -> String {
        param_id(&self.params)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimJob {
    #[serde(default)]
    pub job_id: String,
    pub bundle_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_digest: Option<String>,
    pub entrypoint: String,
    pub parameter_sets: Vec<ParameterSet>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_spec: Option<TargetSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aggregations: Vec<AggregationRequest>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationJob {
    #[serde(default)]
    pub job_id: String,
    pub bundle_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_digest: Option<String>,
    pub entrypoint: String,
    pub algorithm: String,
    pub target_spec: TargetSpec,
    pub max_iterations: u32,
    #[serde(default)]
    pub convergence_criteria: BTreeMap<String, f64>,
    #[serde(default)]
    pub algorithm_config: BTreeMap<String, Value>,
    /// Parameter sets the calibration evaluates.
    pub parameter_sets: Vec<ParameterSet>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Simulation,
    Calibration,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Simulation => "simulation",
            JobType::Calibration => "calibration",
        }
    }

    fn id_prefix(&self) -> &'static str {
        match self {
            JobType::Simulation => "sim",
            JobType::Calibration => "calib",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fresh job id such as `sim-3f2a9c1b7d4e`.
pub fn generate_job_id(job_type: JobType) -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("{}-{}", job_type.id_prefix(), &uuid[..12])
}

/// Hex digest carried by a bundle ref (`repo@sha256:<hex>` or `sha256:<hex>`).
pub fn bundle_digest(bundle_ref: &str) -> Result<String, JobError> {
    let invalid = || JobError::InvalidBundleRef(bundle_ref.to_string());
    let (_, hex) = bundle_ref.rsplit_once("sha256:").ok_or_else(invalid)?;
    if hex.len() < MIN_DIGEST_HEX || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(invalid());
    }
    Ok(hex.to_ascii_lowercase())
}

fn validate_job_id(job_id: &str) -> Result<(), JobError> {
    let ok = !job_id.is_empty()
        && job_id != "."
        && job_id != ".."
        && job_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if ok {
        Ok(())
    } else {
        Err(JobError::InvalidJobId(job_id.to_string()))
    }
}

fn validate_parameter_sets(sets: &[ParameterSet]) -> Result<(), JobError> {
    let mut seen = BTreeSet::new();
    for set in sets {
        set.validate()?;
        let id = set.param_id();
        if !seen.insert(id.clone()) {
            return Err(JobError::DuplicateParameterSet { param_id: id });
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "job_type", rename_all = "snake_case")]
pub enum Job {
    Simulation(SimJob),
    Calibration(CalibrationJob),
}

impl Job {
    pub fn job_id(&self) -> &str {
        match self {
            Job::Simulation(job) => &job.job_id,
            Job::Calibration(job) => &job.job_id,
        }
    }

    pub fn job_type(&self) -> JobType {
        match self {
            Job::Simulation(_) => JobType::Simulation,
            Job::Calibration(_) => JobType::Calibration,
        }
    }

    pub fn bundle_ref(&self) -> &str {
        match self {
            Job::Simulation(job) => &job.bundle_ref,
            Job::Calibration(job) => &job.bundle_ref,
        }
    }

    pub fn bundle_digest(&self) -> Result<String, JobError> {
        bundle_digest(self.bundle_ref())
    }

    pub fn model_digest(&self) -> Option<&str> {
        match self {
            Job::Simulation(job) => job.model_digest.as_deref(),
            Job::Calibration(job) => job.model_digest.as_deref(),
        }
    }

    pub fn entrypoint(&self) -> &str {
        match self {
            Job::Simulation(job) => &job.entrypoint,
            Job::Calibration(job) => &job.entrypoint,
        }
    }

    pub fn parameter_sets(&self) -> &[ParameterSet] {
        match self {
            Job::Simulation(job) => &job.parameter_sets,
            Job::Calibration(job) => &job.parameter_sets,
        }
    }

    pub fn outputs(&self) -> &[String] {
        match self {
            Job::Simulation(job) => &job.outputs,
            Job::Calibration(job) => &job.outputs,
        }
    }

    pub fn target_spec(&self) -> Option<&TargetSpec> {
        match self {
            Job::Simulation(job) => job.target_spec.as_ref(),
            Job::Calibration(job) => Some(&job.target_spec),
        }
    }

    /// Aggregations requested explicitly rather than through a target spec.
    pub fn aggregations(&self) -> &[AggregationRequest] {
        match self {
            Job::Simulation(job) => &job.aggregations,
            Job::Calibration(_) => &[],
        }
    }

    pub fn metadata(&self) -> &BTreeMap<String, Value> {
        match self {
            Job::Simulation(job) => &job.metadata,
            Job::Calibration(job) => &job.metadata,
        }
    }

    /// Assigns a generated id when the job was written without one.
    pub fn ensure_job_id(&mut self) -> &str {
        let job_type = self.job_type();
        let id = match self {
            Job::Simulation(job) => &mut job.job_id,
            Job::Calibration(job) => &mut job.job_id,
        };
        if id.is_empty() {
            *id = generate_job_id(job_type);
        }
        id
    }

    pub fn to_blob_key(&self) -> String {
        format!("jobs/{}/{}.json", self.job_type().as_str(), self.job_id())
    }

    /// The simulation task for one seed of `set`.
    pub fn sim_task(&self, set: &ParameterSet, seed: u64) -> Result<SimTask, JobError> {
        Ok(SimTask {
            bundle_ref: self.bundle_ref().to_string(),
            bundle_digest: self.bundle_digest()?,
            model_digest: self.model_digest().map(str::to_string),
            entrypoint: self.entrypoint().to_string(),
            params: set.params.clone(),
            seed,
            outputs: self.outputs().to_vec(),
        })
    }

    /// Every simulation task, in parameter-set then seed order.
    pub fn sim_tasks(&self) -> Result<Vec<SimTask>, JobError> {
        let mut tasks = Vec::new();
        for set in self.parameter_sets() {
            for seed in set.seeds.seeds() {
                tasks.push(self.sim_task(set, seed)?);
            }
        }
        Ok(tasks)
    }

    pub fn validate(&self) -> Result<(), JobError> {
        validate_job_id(self.job_id())?;
        self.bundle_digest()?;
        if self.entrypoint().trim().is_empty() {
            return Err(JobError::MissingField("entrypoint"));
        }
        validate_parameter_sets(self.parameter_sets())?;
        if let Some(spec) = self.target_spec() {
            spec.validate()?;
        }
        match self {
            Job::Simulation(job) => {
                if job.parameter_sets.is_empty() && job.aggregations.is_empty() {
                    return Err(JobError::MissingField("parameter_sets"));
                }
                for agg in &job.aggregations {
                    if agg.target.trim().is_empty() {
                        return Err(JobError::InvalidTargetSpec(
                            "aggregation without a target".into(),
                        ));
                    }
                    ParameterSet {
                        params: agg.params.clone(),
                        seeds: SeedPlan::Explicit {
                            seeds: agg.seeds.clone(),
                        },
                    }
                    .validate()?;
                }
            }
            Job::Calibration(job) => {
                if job.parameter_sets.is_empty() {
                    return Err(JobError::MissingField("parameter_sets"));
                }
                if job.algorithm.trim().is_empty() {
                    return Err(JobError::MissingField("algorithm"));
                }
                if job.max_iterations == 0 {
                    return Err(JobError::InvalidCalibration(
                        "max_iterations must be at least 1".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}
