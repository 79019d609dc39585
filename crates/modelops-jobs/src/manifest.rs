//! Expected-output manifests and task reconstruction.
//!
//! Every [`OutputSpec`] is self-contained: it carries enough of the job to
//! rebuild the exact task that produces it, so resumption never has to
//! re-derive seeds or parameters from the original job.

use crate::job::{
    AggregationRequest, Job, JobError, ParameterSet, SeedPlan, SimJob, META_JOB_TYPE,
    META_ORIGINAL_JOB_ID, META_RESUME_ATTEMPT, META_ROOT_JOB_ID,
};
use modelops_provenance::{
    param_id, AggregationTask, ProvenanceSchema, ResultKind, SchemaError, SimTask,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("output spec at {path} is missing {field}")]
    Incomplete { path: String, field: &'static str },
    #[error("output spec at {path} does not match its own {field}")]
    Inconsistent { path: String, field: &'static str },
}

/// One output a job is expected to leave in provenance storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub param_id: String,
    /// `None` for aggregations, which span every replicate seed.
    pub seed: Option<u64>,
    pub output_type: ResultKind,
    pub bundle_ref: String,
    pub bundle_digest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_digest: Option<String>,
    pub entrypoint: String,
    #[serde(default)]
    pub requested_outputs: Vec<String>,
    pub replicate_count: u32,
    /// Replicate seeds an aggregation reduces over; empty for simulations.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub seeds: Vec<u64>,
    pub provenance_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param_values: Option<BTreeMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregation_id: Option<String>,
}

/// A task rebuilt from an [`OutputSpec`].
#[derive(Debug, Clone, PartialEq)]
pub enum ReconstructedTask {
    Simulation(SimTask),
    Aggregation {
        task: AggregationTask,
        params: BTreeMap<String, Value>,
    },
}

fn sim_spec(
    job: &Job,
    set: &ParameterSet,
    seed: u64,
    schema: &ProvenanceSchema,
) -> Result<OutputSpec, ManifestError> {
    let task = job.sim_task(set, seed)?;
    let provenance_path = schema.sim_path(&task.path_context())?;
    Ok(OutputSpec {
        param_id: task.param_id(),
        seed: Some(seed),
        output_type: ResultKind::Simulation,
        bundle_ref: task.bundle_ref,
        bundle_digest: task.bundle_digest,
        model_digest: task.model_digest,
        entrypoint: task.entrypoint,
        requested_outputs: task.outputs,
        replicate_count: set.seeds.replicate_count(),
        seeds: Vec::new(),
        provenance_path,
        param_values: Some(task.params),
        target_id: None,
        aggregation_id: None,
    })
}

fn agg_spec(
    job: &Job,
    params: &BTreeMap<String, Value>,
    target: &str,
    seeds: Vec<u64>,
    schema: &ProvenanceSchema,
) -> Result<OutputSpec, ManifestError> {
    let task = AggregationTask {
        bundle_ref: job.bundle_ref().to_string(),
        bundle_digest: job.bundle_digest()?,
        model_digest: job.model_digest().map(str::to_string),
        target_entrypoint: target.to_string(),
        param_id: param_id(params),
        seeds,
    };
    let provenance_path = schema.agg_path(&task.path_context())?;
    Ok(OutputSpec {
        param_id: task.param_id.clone(),
        seed: None,
        output_type: ResultKind::Aggregation,
        replicate_count: task.replicate_count(),
        aggregation_id: Some(task.aggregation_id()),
        target_id: Some(task.target_entrypoint),
        bundle_ref: task.bundle_ref,
        bundle_digest: task.bundle_digest,
        model_digest: task.model_digest,
        entrypoint: job.entrypoint().to_string(),
        requested_outputs: job.outputs().to_vec(),
        seeds: task.seeds,
        provenance_path,
        param_values: Some(params.clone()),
    })
}

/// Every output `job` must produce under `schema`.
///
/// Simulations come first (parameter-set then seed order), then one
/// aggregation per parameter set and target, then explicitly requested
/// aggregations. Entries sharing a provenance path appear once.
pub fn generate_output_manifest(
    job: &Job,
    schema: &ProvenanceSchema,
) -> Result<Vec<OutputSpec>, ManifestError> {
    let mut specs = Vec::new();
    for set in job.parameter_sets() {
        for seed in set.seeds.seeds() {
            specs.push(sim_spec(job, set, seed, schema)?);
        }
    }
    if let Some(target_spec) = job.target_spec() {
        for set in job.parameter_sets() {
            for target in &target_spec.targets {
                specs.push(agg_spec(job, &set.params, target, set.seeds.seeds(), schema)?);
            }
        }
    }
    for request in job.aggregations() {
        specs.push(agg_spec(
            job,
            &request.params,
            &request.target,
            request.seeds.clone(),
            schema,
        )?);
    }

    let mut seen = BTreeSet::new();
    specs.retain(|spec| seen.insert(spec.provenance_path.clone()));
    Ok(specs)
}

/// Rebuilds the task that produces `spec`, checking the spec's own ids
/// against what it carries.
pub fn reconstruct_task_from_spec(spec: &OutputSpec) -> Result<ReconstructedTask, ManifestError> {
    let incomplete = |field| ManifestError::Incomplete {
        path: spec.provenance_path.clone(),
        field,
    };
    let inconsistent = |field| ManifestError::Inconsistent {
        path: spec.provenance_path.clone(),
        field,
    };

    let params = spec
        .param_values
        .clone()
        .ok_or_else(|| incomplete("param_values"))?;
    if param_id(&params) != spec.param_id {
        return Err(inconsistent("param_id"));
    }

    match spec.output_type {
        ResultKind::Simulation => {
            let seed = spec.seed.ok_or_else(|| incomplete("seed"))?;
            Ok(ReconstructedTask::Simulation(SimTask {
                bundle_ref: spec.bundle_ref.clone(),
                bundle_digest: spec.bundle_digest.clone(),
                model_digest: spec.model_digest.clone(),
                entrypoint: spec.entrypoint.clone(),
                params,
                seed,
                outputs: spec.requested_outputs.clone(),
            }))
        }
        ResultKind::Aggregation => {
            let target = spec.target_id.clone().ok_or_else(|| incomplete("target_id"))?;
            if spec.seeds.is_empty() {
                return Err(incomplete("seeds"));
            }
            let task = AggregationTask {
                bundle_ref: spec.bundle_ref.clone(),
                bundle_digest: spec.bundle_digest.clone(),
                model_digest: spec.model_digest.clone(),
                target_entrypoint: target,
                param_id: spec.param_id.clone(),
                seeds: spec.seeds.clone(),
            };
            if spec.aggregation_id.as_deref() != Some(task.aggregation_id().as_str()) {
                return Err(inconsistent("aggregation_id"));
            }
            Ok(ReconstructedTask::Aggregation { task, params })
        }
    }
}

/// Builds the simulation job that re-runs exactly `missing`.
///
/// Missing simulations are grouped by parameter set into explicit seed
/// plans; missing aggregations become explicit aggregation requests. The
/// new job inherits bundle, entrypoint and outputs from `original`.
pub fn build_resume_job(
    original: &Job,
    missing: &[OutputSpec],
    new_job_id: String,
    resume_attempt: u64,
) -> Result<SimJob, ManifestError> {
    let mut groups: Vec<(String, ParameterSet)> = Vec::new();
    let mut aggregations = Vec::new();

    for spec in missing {
        match reconstruct_task_from_spec(spec)? {
            ReconstructedTask::Simulation(task) => {
                let id = task.param_id();
                match groups.iter_mut().find(|(group_id, _)| *group_id == id) {
                    Some((_, set)) => {
                        if let SeedPlan::Explicit { seeds } = &mut set.seeds {
                            if !seeds.contains(&task.seed) {
                                seeds.push(task.seed);
                            }
                        }
                    }
                    None => groups.push((
                        id,
                        ParameterSet {
                            params: task.params,
                            seeds: SeedPlan::Explicit {
                                seeds: vec![task.seed],
                            },
                        },
                    )),
                }
            }
            ReconstructedTask::Aggregation { task, params } => {
                aggregations.push(AggregationRequest {
                    params,
                    target: task.target_entrypoint,
                    seeds: task.seeds,
                });
            }
        }
    }

    let mut metadata = original.metadata().clone();
    let root = original
        .metadata()
        .get(META_ROOT_JOB_ID)
        .and_then(Value::as_str)
        .unwrap_or(original.job_id())
        .to_string();
    metadata.insert(META_ORIGINAL_JOB_ID.into(), json!(original.job_id()));
    metadata.insert(META_ROOT_JOB_ID.into(), json!(root));
    metadata.insert(META_RESUME_ATTEMPT.into(), json!(resume_attempt));
    metadata.insert(
        "resumed_job_type".into(),
        json!(original.job_type().as_str()),
    );
    metadata.remove(META_JOB_TYPE);

    let priority = match original {
        Job::Simulation(job) => job.priority,
        Job::Calibration(_) => 0,
    };

    Ok(SimJob {
        job_id: new_job_id,
        bundle_ref: original.bundle_ref().to_string(),
        model_digest: original.model_digest().map(str::to_string),
        entrypoint: original.entrypoint().to_string(),
        parameter_sets: groups.into_iter().map(|(_, set)| set).collect(),
        outputs: original.outputs().to_vec(),
        priority,
        metadata,
        target_spec: None,
        aggregations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::TargetSpec;

    const BUNDLE: &str = "ghcr.io/acme/seir@sha256:0123456789abcdef0123456789abcdef";

    fn params(beta: f64) -> BTreeMap<String, Value> {
        BTreeMap::from([("beta".to_string(), json!(beta))])
    }

    fn job(plan_a: SeedPlan, plan_b: SeedPlan, targets: Option<Vec<&str>>) -> Job {
        Job::Simulation(SimJob {
            job_id: "sim-manifest".into(),
            bundle_ref: BUNDLE.into(),
            model_digest: None,
            entrypoint: "models.seir:run".into(),
            parameter_sets: vec![
                ParameterSet {
                    params: params(0.3),
                    seeds: plan_a,
                },
                ParameterSet {
                    params: params(0.4),
                    seeds: plan_b,
                },
            ],
            outputs: vec!["incidence".into()],
            priority: 2,
            metadata: BTreeMap::from([("owner".to_string(), json!("epi-team"))]),
            target_spec: targets.map(|t| TargetSpec {
                targets: t.into_iter().map(str::to_string).collect(),
                data: BTreeMap::new(),
                loss: "mse".into(),
                weights: BTreeMap::new(),
            }),
            aggregations: Vec::new(),
        })
    }

    fn schema() -> ProvenanceSchema {
        ProvenanceSchema::token_invalidation().expect("schema")
    }

    #[test]
    fn replicate_plans_expand_to_distinct_specs() {
        let job = job(
            SeedPlan::Replicates { replicate_count: 3 },
            SeedPlan::Replicates { replicate_count: 3 },
            None,
        );
        let specs = generate_output_manifest(&job, &schema()).expect("manifest");
        assert_eq!(specs.len(), 6);

        let paths: BTreeSet<_> = specs.iter().map(|s| s.provenance_path.clone()).collect();
        assert_eq!(paths.len(), 6);

        let first_id = param_id(&params(0.3));
        let seeds: Vec<_> = specs
            .iter()
            .filter(|s| s.param_id == first_id)
            .map(|s| s.seed)
            .collect();
        assert_eq!(seeds, vec![Some(0), Some(1), Some(2)]);
        assert!(specs.iter().all(|s| s.output_type == ResultKind::Simulation));
        assert!(specs.iter().all(|s| s.replicate_count == 3));
    }

    #[test]
    fn manifest_paths_match_store_paths() {
        let job = job(
            SeedPlan::Explicit { seeds: vec![11] },
            SeedPlan::Explicit { seeds: vec![12] },
            None,
        );
        let schema = schema();
        let specs = generate_output_manifest(&job, &schema).expect("manifest");
        let task = job
            .sim_task(&job.parameter_sets()[0], 11)
            .expect("task");
        assert_eq!(
            specs[0].provenance_path,
            schema.sim_path(&task.path_context()).expect("path")
        );
        assert!(specs[0].provenance_path.contains("/seed_11"));
    }

    #[test]
    fn target_specs_add_one_aggregation_per_set_and_target() {
        let job = job(
            SeedPlan::Replicates { replicate_count: 2 },
            SeedPlan::Replicates { replicate_count: 4 },
            Some(vec!["targets.prevalence:loss", "targets.incidence:loss"]),
        );
        let specs = generate_output_manifest(&job, &schema()).expect("manifest");
        let aggs: Vec<_> = specs
            .iter()
            .filter(|s| s.output_type == ResultKind::Aggregation)
            .collect();
        assert_eq!(specs.len(), 6 + 4);
        assert_eq!(aggs.len(), 4);
        assert!(aggs.iter().all(|s| s.seed.is_none()));
        assert_eq!(aggs[2].replicate_count, 4);
        assert_eq!(aggs[2].seeds, vec![0, 1, 2, 3]);
        assert!(aggs[0]
            .provenance_path
            .contains("/target_targets.prevalence_loss/agg_"));
    }

    #[test]
    fn explicit_aggregations_duplicating_targets_appear_once() {
        let mut job = job(
            SeedPlan::Replicates { replicate_count: 2 },
            SeedPlan::Replicates { replicate_count: 2 },
            Some(vec!["targets.prevalence:loss"]),
        );
        if let Job::Simulation(sim) = &mut job {
            sim.aggregations.push(AggregationRequest {
                params: params(0.3),
                target: "targets.prevalence:loss".into(),
                seeds: vec![0, 1],
            });
        }
        let specs = generate_output_manifest(&job, &schema()).expect("manifest");
        assert_eq!(specs.len(), 4 + 2);
    }

    #[test]
    fn specs_reconstruct_their_tasks() {
        let job = job(
            SeedPlan::Replicates { replicate_count: 2 },
            SeedPlan::Explicit { seeds: vec![7] },
            Some(vec!["targets.prevalence:loss"]),
        );
        let schema = schema();
        for spec in generate_output_manifest(&job, &schema).expect("manifest") {
            match reconstruct_task_from_spec(&spec).expect("reconstruct") {
                ReconstructedTask::Simulation(task) => {
                    assert_eq!(Some(task.seed), spec.seed);
                    assert_eq!(
                        schema.sim_path(&task.path_context()).expect("path"),
                        spec.provenance_path
                    );
                }
                ReconstructedTask::Aggregation { task, .. } => {
                    assert_eq!(Some(task.aggregation_id()), spec.aggregation_id);
                    assert_eq!(
                        schema.agg_path(&task.path_context()).expect("path"),
                        spec.provenance_path
                    );
                }
            }
        }
    }

    #[test]
    fn tampered_specs_are_rejected() {
        let job = job(
            SeedPlan::Replicates { replicate_count: 1 },
            SeedPlan::Replicates { replicate_count: 1 },
            None,
        );
        let mut spec = generate_output_manifest(&job, &schema()).expect("manifest")[0].clone();
        spec.param_id = "0".repeat(64);
        assert!(matches!(
            reconstruct_task_from_spec(&spec),
            Err(ManifestError::Inconsistent { field: "param_id", .. })
        ));
        spec.param_values = None;
        assert!(matches!(
            reconstruct_task_from_spec(&spec),
            Err(ManifestError::Incomplete { field: "param_values", .. })
        ));
    }

    #[test]
    fn resume_job_covers_exactly_the_missing_outputs() {
        let original = job(
            SeedPlan::Replicates { replicate_count: 3 },
            SeedPlan::Explicit { seeds: vec![5, 9] },
            Some(vec!["targets.prevalence:loss"]),
        );
        let schema = schema();
        let specs = generate_output_manifest(&original, &schema).expect("manifest");
        let missing: Vec<_> = specs
            .iter()
            .filter(|s| s.seed == Some(1) || s.seed == Some(9) || s.seed.is_none())
            .take(3)
            .cloned()
            .collect();
        assert_eq!(missing.len(), 3);

        let resumed = build_resume_job(&original, &missing, "sim-manifest-resume-1".into(), 1)
            .expect("resume");
        let resumed = Job::Simulation(resumed);
        assert!(resumed.validate().is_ok());
        let regenerated = generate_output_manifest(&resumed, &schema).expect("manifest");

        let expected: BTreeSet<_> = missing.iter().map(|s| s.provenance_path.clone()).collect();
        let actual: BTreeSet<_> = regenerated
            .iter()
            .map(|s| s.provenance_path.clone())
            .collect();
        assert_eq!(actual, expected);

        let pairs: BTreeSet<_> = regenerated
            .iter()
            .filter(|s| s.output_type == ResultKind::Simulation)
            .map(|s| (s.param_id.clone(), s.seed))
            .collect();
        let expected_pairs: BTreeSet<_> = missing
            .iter()
            .filter(|s| s.output_type == ResultKind::Simulation)
            .map(|s| (s.param_id.clone(), s.seed))
            .collect();
        assert_eq!(pairs, expected_pairs);

        let meta = resumed.metadata();
        assert_eq!(meta[META_ORIGINAL_JOB_ID], json!("sim-manifest"));
        assert_eq!(meta[META_ROOT_JOB_ID], json!("sim-manifest"));
        assert_eq!(meta[META_RESUME_ATTEMPT], json!(1));
        assert_eq!(meta["owner"], json!("epi-team"));
    }

    #[test]
    fn resumed_aggregations_keep_their_ids() {
        let original = job(
            SeedPlan::Replicates { replicate_count: 3 },
            SeedPlan::Replicates { replicate_count: 3 },
            Some(vec!["targets.prevalence:loss"]),
        );
        let schema = schema();
        let missing: Vec<_> = generate_output_manifest(&original, &schema)
            .expect("manifest")
            .into_iter()
            .filter(|s| s.output_type == ResultKind::Aggregation)
            .collect();
        let resumed = build_resume_job(&original, &missing, "r".into(), 1).expect("resume");
        assert!(resumed.parameter_sets.is_empty());
        assert_eq!(resumed.aggregations.len(), 2);
        let regenerated =
            generate_output_manifest(&Job::Simulation(resumed), &schema).expect("manifest");
        let ids: Vec<_> = regenerated.iter().map(|s| s.aggregation_id.clone()).collect();
        let expected: Vec<_> = missing.iter().map(|s| s.aggregation_id.clone()).collect();
        assert_eq!(ids, expected);
    }
}
