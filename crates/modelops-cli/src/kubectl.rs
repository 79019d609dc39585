use modelops_core::sha256_str;
use modelops_jobs::{
    ExecutionHandle, ExecutionRequest, ExecutionStatus, Orchestrator, OrchestratorError,
};
use serde_json::{json, Value};
use std::io::Write;
use std::process::{Command, Output, Stdio};
use tracing::debug;

const MAX_NAME_LEN: usize = 63;
const NAME_HASH_LEN: usize = 8;
const JOB_KEY_ENV: &str = "MODELOPS_JOB_KEY";

/// Kubernetes Job name for `job_id`: lowercase DNS label, at most 63 chars.
/// When the id does not map onto a label unchanged (case, punctuation or
/// length), a hash of the full id is appended so distinct ids keep
/// distinct names.
pub fn job_name(job_id: &str) -> String {
    let mut name: String = format!("modelops-{}", job_id)
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() {
                c
            } else {
                '-'
            }
        })
        .collect();
    let rewritten = job_id
        .chars()
        .any(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
    if rewritten || name.len() > MAX_NAME_LEN {
        name.truncate(MAX_NAME_LEN - NAME_HASH_LEN - 1);
        let digest = sha256_str(job_id);
        name = format!("{}-{}", name.trim_end_matches('-'), &digest[..NAME_HASH_LEN]);
    }
    name.trim_end_matches('-').to_string()
}

/// The command an operator can run when the registry is down.
pub fn fallback_status_command(kubectl: &str, namespace: &str, job_id: &str) -> String {
    format!("{} -n {} get job {}", kubectl, namespace, job_name(job_id))
}

fn job_manifest(request: &ExecutionRequest, name: &str) -> Value {
    let mut env = vec![json!({ "name": JOB_KEY_ENV, "value": request.blob_key })];
    env.extend(
        request
            .env
            .iter()
            .map(|(k, v)| json!({ "name": k, "value": v })),
    );
    json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": {
            "name": name,
            "namespace": request.namespace,
            "labels": {
                "app.kubernetes.io/managed-by": "modelops",
                "modelops/job-id": request.job_id,
                "modelops/job-type": request.job_type.as_str(),
            }
        },
        "spec": {
            "backoffLimit": 0,
            "template": {
                "metadata": {
                    "labels": { "modelops/job-id": request.job_id }
                },
                "spec": {
                    "restartPolicy": "Never",
                    "containers": [{
                        "name": "runner",
                        "image": request.image,
                        "args": ["run-job", request.blob_key],
                        "env": env,
                    }]
                }
            }
        }
    })
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

/// Drives Kubernetes Jobs through the `kubectl` binary.
#[derive(Debug, Clone)]
pub struct KubectlOrchestrator {
    kubectl: String,
}

impl KubectlOrchestrator {
    pub fn new(kubectl: impl Into<String>) -> Self {
        Self {
            kubectl: kubectl.into(),
        }
    }

    fn run(&self, args: &[&str], input: Option<&[u8]>) -> Result<Output, OrchestratorError> {
        debug!(kubectl = %self.kubectl, ?args, "invoking kubectl");
        let mut cmd = Command::new(&self.kubectl);
        cmd.args(args);
        cmd.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let unavailable = |err: std::io::Error| {
            OrchestratorError::Unavailable(format!("failed to run {}: {}", self.kubectl, err))
        };
        let mut child = cmd.spawn().map_err(unavailable)?;
        if let (Some(bytes), Some(mut stdin)) = (input, child.stdin.take()) {
            stdin.write_all(bytes).map_err(unavailable)?;
        }
        child.wait_with_output().map_err(unavailable)
    }
}

impl Orchestrator for KubectlOrchestrator {
    fn submit(&self, request: &ExecutionRequest) -> Result<ExecutionHandle, OrchestratorError> {
        let name = job_name(&request.job_id);
        let manifest = serde_json::to_vec(&job_manifest(request, &name)).map_err(|err| {
            OrchestratorError::Rejected {
                name: name.clone(),
                reason: format!("unencodable manifest: {}", err),
            }
        })?;
        let output = self.run(&["apply", "-f", "-"], Some(&manifest))?;
        if !output.status.success() {
            return Err(OrchestratorError::Rejected {
                name,
                reason: stderr_of(&output),
            });
        }
        Ok(ExecutionHandle {
            name,
            namespace: request.namespace.clone(),
        })
    }

    fn status(&self, handle: &ExecutionHandle) -> Result<Option<ExecutionStatus>, OrchestratorError> {
        let output = self.run(
            &["-n", &handle.namespace, "get", "job", &handle.name, "-o", "json"],
            None,
        )?;
        if !output.status.success() {
            let stderr = stderr_of(&output);
            if stderr.contains("NotFound") || stderr.contains("not found") {
                return Ok(None);
            }
            return Err(OrchestratorError::Unavailable(stderr));
        }
        let body: Value = serde_json::from_slice(&output.stdout).map_err(|err| {
            OrchestratorError::Unavailable(format!("unreadable job status: {}", err))
        })?;
        Ok(Some(parse_job_status(&body)))
    }

    fn cancel(&self, handle: &ExecutionHandle) -> Result<(), OrchestratorError> {
        let output = self.run(
            &[
                "-n",
                &handle.namespace,
                "delete",
                "job",
                &handle.name,
                "--ignore-not-found",
            ],
            None,
        )?;
        if output.status.success() {
            Ok(())
        } else {
            Err(OrchestratorError::Unavailable(stderr_of(&output)))
        }
    }
}

fn parse_job_status(body: &Value) -> ExecutionStatus {
    let count = |field: &str| {
        body.pointer(&format!("/status/{}", field))
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32
    };
    ExecutionStatus {
        active: count("active"),
        succeeded: count("succeeded"),
        failed: count("failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelops_jobs::JobType;
    use std::collections::BTreeMap;

    #[test]
    fn job_names_are_dns_labels() {
        assert_eq!(job_name("sim-3f2a9c1b7d4e"), "modelops-sim-3f2a9c1b7d4e");
        let renamed = job_name("Calib_Run.2");
        assert!(renamed.starts_with("modelops-calib-run-2-"), "{}", renamed);
        assert_eq!(renamed.len(), "modelops-calib-run-2-".len() + NAME_HASH_LEN);

        let long = job_name(&"x".repeat(100));
        assert_eq!(long.len(), MAX_NAME_LEN);
        assert!(!job_name(&format!("{}_", "y".repeat(53))).ends_with('-'));
        for name in [renamed, long] {
            assert!(name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
        }
    }

    #[test]
    fn lossy_names_stay_distinct() {
        assert_ne!(job_name("Sim-1"), job_name("sim-1"));
        assert_ne!(job_name("sim_1"), job_name("sim-1"));
        let root = "r".repeat(54);
        let first = job_name(&format!("{}-resume-1", root));
        let second = job_name(&format!("{}-resume-2", root));
        assert_ne!(first, second);
        assert!(first.len() <= MAX_NAME_LEN && second.len() <= MAX_NAME_LEN);
    }

    #[test]
    fn manifest_carries_blob_key_image_and_env() {
        let request = ExecutionRequest {
            job_id: "sim-1".into(),
            job_type: JobType::Simulation,
            blob_key: "jobs/simulation/sim-1.json".into(),
            namespace: "modelops".into(),
            image: "ghcr.io/modelops/runner:latest".into(),
            env: BTreeMap::from([("MODELOPS_SCHEMA".to_string(), "token".to_string())]),
        };
        let manifest = job_manifest(&request, "modelops-sim-1");
        assert_eq!(manifest["metadata"]["namespace"], "modelops");
        let container = &manifest["spec"]["template"]["spec"]["containers"][0];
        assert_eq!(container["image"], "ghcr.io/modelops/runner:latest");
        assert_eq!(container["args"][1], "jobs/simulation/sim-1.json");
        assert_eq!(container["env"][0]["name"], JOB_KEY_ENV);
        assert_eq!(container["env"][1]["value"], "token");
    }

    #[test]
    fn status_counts_default_to_zero() {
        let body = json!({ "status": { "active": 2, "failed": 1 } });
        assert_eq!(
            parse_job_status(&body),
            ExecutionStatus {
                active: 2,
                succeeded: 0,
                failed: 1
            }
        );
        assert_eq!(parse_job_status(&json!({})), ExecutionStatus::default());
    }

    #[test]
    fn fallback_names_the_orchestrator_job() {
        assert_eq!(
            fallback_status_command("kubectl", "modelops", "sim-1"),
            "kubectl -n modelops get job modelops-sim-1"
        );
    }
}
