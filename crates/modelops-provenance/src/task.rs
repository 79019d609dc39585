use crate::schema::PathContext;
use modelops_core::{canonical_json_digest, sha256_bytes};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;

pub const AGGREGATION_ID_LEN: usize = 16;
const TASK_ID_LEN: usize = 16;

/// Stable identifier of a parameter set: SHA-256 over its canonical JSON.
pub fn param_id(params: &BTreeMap<String, Value>) -> String {
    let object: serde_json::Map<String, Value> = params
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    canonical_json_digest(&Value::Object(object))
}

/// Deterministic id for aggregating `replicate_count` replicates of one
/// parameter set against one target.
pub fn aggregation_id(param_id: &str, target_id: &str, replicate_count: u32) -> String {
    let digest = canonical_json_digest(&json!({
        "param_id": param_id,
        "target_id": target_id,
        "replicate_count": replicate_count,
    }));
    digest[..AGGREGATION_ID_LEN].to_string()
}

/// Replaces anything outside `[A-Za-z0-9._-]` with `_` so a logical name can
/// be used as one path segment.
pub fn sanitize_segment(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".repeat(cleaned.len().max(1)),
        _ => cleaned,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    Simulation,
    Aggregation,
}

impl ResultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultKind::Simulation => "simulation",
            ResultKind::Aggregation => "aggregation",
        }
    }
}

impl fmt::Display for ResultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One simulation run: a parameter set evaluated under one seed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimTask {
    pub bundle_ref: String,
    pub bundle_digest: String,
    /// Looser cache key than `bundle_digest`; falls back to it when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_digest: Option<String>,
    pub entrypoint: String,
    pub params: BTreeMap<String, Value>,
    pub seed: u64,
    #[serde(default)]
    pub outputs: Vec<String>,
}

impl SimTask {
    pub fn param_id(&self) -> String {
        param_id(&self.params)
    }

    pub fn model_digest(&self) -> &str {
        self.model_digest.as_deref().unwrap_or(&self.bundle_digest)
    }

    pub fn task_id(&self) -> String {
        let digest = canonical_json_digest(&json!({
            "bundle_digest": self.bundle_digest,
            "entrypoint": self.entrypoint,
            "param_id": self.param_id(),
            "seed": self.seed,
        }));
        digest[..TASK_ID_LEN].to_string()
    }

    pub fn path_context(&self) -> PathContext {
        PathContext::new()
            .with("bundle_digest", &self.bundle_digest)
            .with("model_digest", self.model_digest())
            .with("param_id", self.param_id())
            .with("seed", self.seed)
            .with("entrypoint", &self.entrypoint)
    }
}

/// Reduction of one parameter set's replicates against one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationTask {
    pub bundle_ref: String,
    pub bundle_digest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_digest: Option<String>,
    pub target_entrypoint: String,
    pub param_id: String,
    /// Seeds of every replicate being reduced.
    pub seeds: Vec<u64>,
}

impl AggregationTask {
    pub fn replicate_count(&self) -> u32 {
        self.seeds.len() as u32
    }

    pub fn aggregation_id(&self) -> String {
        aggregation_id(
            &self.param_id,
            &self.target_entrypoint,
            self.replicate_count(),
        )
    }

    pub fn model_digest(&self) -> &str {
        self.model_digest.as_deref().unwrap_or(&self.bundle_digest)
    }

    pub fn path_context(&self) -> PathContext {
        PathContext::new()
            .with("bundle_digest", &self.bundle_digest)
            .with("model_digest", self.model_digest())
            .with("param_id", &self.param_id)
            .with("target", sanitize_segment(&self.target_entrypoint))
            .with("aggregation_id", self.aggregation_id())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub error_type: String,
    pub message: String,
    #[serde(default)]
    pub retryable: bool,
}

/// Size and checksum of one named output, as recorded in `result.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDigest {
    pub size: u64,
    pub checksum: String,
}

impl OutputDigest {
    pub fn of(bytes: &[u8]) -> Self {
        Self {
            size: bytes.len() as u64,
            checksum: sha256_bytes(bytes),
        }
    }
}

/// What a simulation produced: named binary outputs or an error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimReturn {
    pub task_id: String,
    pub outputs: BTreeMap<String, Vec<u8>>,
    pub error: Option<ErrorInfo>,
    /// Free-form failure detail (e.g. a traceback), stored as its own blob.
    pub error_details: Option<String>,
}

impl SimReturn {
    pub fn output_digests(&self) -> BTreeMap<String, OutputDigest> {
        digests(&self.outputs)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregationReturn {
    pub aggregation_id: String,
    pub loss: Option<f64>,
    pub diagnostics: BTreeMap<String, Value>,
    pub n_replicates: u32,
    pub outputs: BTreeMap<String, Vec<u8>>,
    pub error: Option<ErrorInfo>,
    pub error_details: Option<String>,
}

impl AggregationReturn {
    pub fn output_digests(&self) -> BTreeMap<String, OutputDigest> {
        digests(&self.outputs)
    }
}

fn digests(outputs: &BTreeMap<String, Vec<u8>>) -> BTreeMap<String, OutputDigest> {
    outputs
        .iter()
        .map(|(name, bytes)| (name.clone(), OutputDigest::of(bytes)))
        .collect()
}
