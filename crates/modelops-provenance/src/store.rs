//! Input-addressed storage of simulation and aggregation results.
//!
//! Each result lives in its own directory, placed by the schema:
//!
//! ```text
//! <root>/<schema>/v<version>/<sim or agg path>/
//!     metadata.json          task descriptor + stored_at
//!     result.json            per-output size/checksum, error info
//!     artifact_<name>.arrow  one per non-empty output
//!     error_details.txt      only when the task failed with details
//! ```
//!
//! Every file is written with temp-file + rename, and `result.json` is always
//! written last. An entry counts as present only once `result.json` exists,
//! so a reader racing a writer sees a miss rather than a half-written entry.
//!
//! The optional remote backend is a replica. The local write is the commit
//! point; replication afterwards is best effort and only logged on failure,
//! so an entry can exist locally without (yet) existing remotely.

use crate::schema::{check_namespace_part, ProvenanceSchema, SchemaError};
use crate::task::{
    sanitize_segment, AggregationReturn, AggregationTask, ErrorInfo, OutputDigest, ResultKind,
    SimReturn, SimTask,
};
use chrono::Utc;
use modelops_core::{
    atomic_write_bytes, ensure_dir, sha256_bytes, DynBackend, RetryPolicy, StorageBackend,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub const METADATA_FILE: &str = "metadata.json";
pub const RESULT_FILE: &str = "result.json";
pub const ERROR_DETAILS_FILE: &str = "error_details.txt";
const ARTIFACT_EXT: &str = "arrow";

pub fn artifact_file_name(output: &str) -> String {
    format!("artifact_{}.{}", sanitize_segment(output), ARTIFACT_EXT)
}

#[derive(Debug, thiserror::Error)]
pub enum ProvenanceError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode {what}: {source}")]
    Encode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("outputs '{first}' and '{second}' both map to artifact file '{file}'")]
    ArtifactNameCollision {
        first: String,
        second: String,
        file: String,
    },
    #[error("invalid store path '{path}': {reason}")]
    InvalidPath { path: String, reason: &'static str },
    #[error("corrupt provenance entry '{path}': {reason}")]
    Corrupt { path: String, reason: String },
}

fn io_error(path: &Path, source: io::Error) -> ProvenanceError {
    ProvenanceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Why an existing entry could not be read back.
#[derive(Debug, thiserror::Error)]
enum Corruption {
    #[error("missing {file}")]
    MissingFile { file: String },
    #[error("unreadable {file}: {source}")]
    Unreadable {
        file: String,
        #[source]
        source: io::Error,
    },
    #[error("malformed {file}: {source}")]
    Malformed {
        file: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{file} should hold {expected_size} bytes with checksum {expected}, found {actual_size} bytes with {actual}")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
        expected_size: u64,
        actual_size: u64,
    },
    #[error("entry records kind '{found}', expected '{expected}'")]
    WrongKind {
        found: ResultKind,
        expected: ResultKind,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct OutputRecord {
    size: u64,
    checksum: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimRecord {
    kind: ResultKind,
    task_id: String,
    outputs: BTreeMap<String, OutputRecord>,
    #[serde(default)]
    error: Option<ErrorInfo>,
    #[serde(default)]
    error_details: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AggRecord {
    kind: ResultKind,
    aggregation_id: String,
    loss: Option<f64>,
    #[serde(default)]
    diagnostics: BTreeMap<String, Value>,
    n_replicates: u32,
    outputs: BTreeMap<String, OutputRecord>,
    #[serde(default)]
    error: Option<ErrorInfo>,
    #[serde(default)]
    error_details: Option<String>,
}

/// A stored entry as raw JSON, for inspection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredEntry {
    pub path: String,
    pub metadata: Value,
    pub result: Value,
    pub artifacts: Vec<ArtifactStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactStatus {
    pub output: String,
    pub file: Option<String>,
    pub size: u64,
    pub checksum: String,
    pub present: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KindStats {
    pub entries: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub schema: String,
    pub version: String,
    pub root: PathBuf,
    pub simulations: KindStats,
    pub aggregations: KindStats,
    /// Entries with `metadata.json` but no `result.json`.
    pub incomplete: u64,
}

#[derive(Debug, Clone)]
struct RemoteReplica {
    backend: DynBackend,
    retry: RetryPolicy,
}

#[derive(Debug, Clone)]
pub struct ProvenanceStore {
    root: PathBuf,
    schema: ProvenanceSchema,
    remote: Option<RemoteReplica>,
}

impl ProvenanceStore {
    pub fn open(root: impl AsRef<Path>, schema: ProvenanceSchema) -> Result<Self, ProvenanceError> {
        let root = root.as_ref().to_path_buf();
        ensure_dir(&root).map_err(|e| io_error(&root, e))?;
        Ok(Self {
            root,
            schema,
            remote: None,
        })
    }

    /// Adds a secondary backend: filled after local writes, read on local misses.
    pub fn with_remote(mut self, backend: DynBackend, retry: RetryPolicy) -> Self {
        self.remote = Some(RemoteReplica { backend, retry });
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn schema(&self) -> &ProvenanceSchema {
        &self.schema
    }

    pub fn sim_path(&self, task: &SimTask) -> Result<String, SchemaError> {
        self.schema.sim_path(&task.path_context())
    }

    pub fn agg_path(&self, task: &AggregationTask) -> Result<String, SchemaError> {
        self.schema.agg_path(&task.path_context())
    }

    fn entry_dir(&self, rel: &str) -> PathBuf {
        rel.split('/').fold(self.root.clone(), |p, seg| p.join(seg))
    }

    pub fn get_sim(&self, task: &SimTask) -> Result<Option<SimReturn>, ProvenanceError> {
        let rel = self.sim_path(task)?;
        let dir = self.entry_dir(&rel);
        if !self.ensure_local(&rel, &dir) {
            debug!(path = %rel, "simulation cache miss");
            return Ok(None);
        }
        match read_sim(&dir) {
            Ok(result) => {
                debug!(path = %rel, "simulation cache hit");
                Ok(Some(result))
            }
            Err(corruption) => {
                warn!(path = %rel, error = %corruption, "corrupt simulation entry, treating as miss");
                Ok(None)
            }
        }
    }

    pub fn put_sim(&self, task: &SimTask, result: &SimReturn) -> Result<String, ProvenanceError> {
        let rel = self.sim_path(task)?;
        let dir = self.entry_dir(&rel);
        let (outputs, mut files) = prepare_outputs(&result.outputs)?;
        let error_details = push_error_details(&mut files, result.error_details.as_deref());

        let descriptor = json!({
            "kind": ResultKind::Simulation,
            "schema": self.schema.name(),
            "schema_version": self.schema.version(),
            "task_id": task.task_id(),
            "bundle_ref": task.bundle_ref,
            "bundle_digest": task.bundle_digest,
            "model_digest": task.model_digest(),
            "entrypoint": task.entrypoint,
            "param_id": task.param_id(),
            "params": task.params,
            "seed": task.seed,
            "outputs": task.outputs,
        });
        let record = SimRecord {
            kind: ResultKind::Simulation,
            task_id: result.task_id.clone(),
            outputs,
            error: result.error.clone(),
            error_details,
        };
        files.push((METADATA_FILE.to_string(), self.metadata_bytes(&dir, descriptor)?));
        files.push((RESULT_FILE.to_string(), encode("result.json", &record)?));
        self.commit(&rel, &dir, &files)?;
        info!(path = %rel, task_id = %result.task_id, failed = result.error.is_some(), "stored simulation result");
        Ok(rel)
    }

    pub fn get_agg(
        &self,
        task: &AggregationTask,
    ) -> Result<Option<AggregationReturn>, ProvenanceError> {
        let rel = self.agg_path(task)?;
        let dir = self.entry_dir(&rel);
        if !self.ensure_local(&rel, &dir) {
            debug!(path = %rel, "aggregation cache miss");
            return Ok(None);
        }
        match read_agg(&dir) {
            Ok(result) => {
                debug!(path = %rel, "aggregation cache hit");
                Ok(Some(result))
            }
            Err(corruption) => {
                warn!(path = %rel, error = %corruption, "corrupt aggregation entry, treating as miss");
                Ok(None)
            }
        }
    }

    pub fn put_agg(
        &self,
        task: &AggregationTask,
        result: &AggregationReturn,
    ) -> Result<String, ProvenanceError> {
        let rel = self.agg_path(task)?;
        let dir = self.entry_dir(&rel);
        let (outputs, mut files) = prepare_outputs(&result.outputs)?;
        let error_details = push_error_details(&mut files, result.error_details.as_deref());

        let descriptor = json!({
            "kind": ResultKind::Aggregation,
            "schema": self.schema.name(),
            "schema_version": self.schema.version(),
            "aggregation_id": task.aggregation_id(),
            "bundle_ref": task.bundle_ref,
            "bundle_digest": task.bundle_digest,
            "model_digest": task.model_digest(),
            "target_entrypoint": task.target_entrypoint,
            "param_id": task.param_id,
            "seeds": task.seeds,
        });
        let record = AggRecord {
            kind: ResultKind::Aggregation,
            aggregation_id: result.aggregation_id.clone(),
            loss: result.loss,
            diagnostics: result.diagnostics.clone(),
            n_replicates: result.n_replicates,
            outputs,
            error: result.error.clone(),
            error_details,
        };
        files.push((METADATA_FILE.to_string(), self.metadata_bytes(&dir, descriptor)?));
        files.push((RESULT_FILE.to_string(), encode("result.json", &record)?));
        self.commit(&rel, &dir, &files)?;
        info!(path = %rel, aggregation_id = %task.aggregation_id(), "stored aggregation result");
        Ok(rel)
    }

    /// Whether a readable entry exists at `rel`, hydrating from the replica
    /// on a local miss. An entry that `get_sim`/`get_agg` would reject as
    /// corrupt counts as absent.
    pub fn exists(&self, rel: &str) -> Result<bool, ProvenanceError> {
        check_rel_path(rel)?;
        let dir = self.entry_dir(rel);
        if !self.ensure_local(rel, &dir) {
            return Ok(false);
        }
        match verify_entry(&dir) {
            Ok(()) => Ok(true),
            Err(corruption) => {
                warn!(path = %rel, error = %corruption, "corrupt entry, reporting absent");
                Ok(false)
            }
        }
    }

    /// Up to `limit` metadata records of `kind` under this schema, each with
    /// an added `path`. Unreadable records are skipped.
    pub fn list_results(&self, kind: ResultKind, limit: usize) -> Result<Vec<Value>, ProvenanceError> {
        let base = self.entry_dir(&self.schema.root_prefix()?);
        let mut out = Vec::new();
        if !base.is_dir() || limit == 0 {
            return Ok(out);
        }
        for entry in WalkDir::new(&base).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(error = %err, "skipping unreadable store entry");
                    continue;
                }
            };
            if entry.file_name() != METADATA_FILE || !entry.file_type().is_file() {
                continue;
            }
            let Some(dir) = entry.path().parent() else {
                continue;
            };
            let mut metadata: Value = match read_json(dir, METADATA_FILE) {
                Ok(value) => value,
                Err(err) => {
                    warn!(path = %dir.display(), error = %err, "skipping unreadable metadata");
                    continue;
                }
            };
            if metadata.get("kind").and_then(Value::as_str) != Some(kind.as_str()) {
                continue;
            }
            if let Value::Object(map) = &mut metadata {
                map.insert("path".to_string(), Value::String(self.rel_of(dir)));
            }
            out.push(metadata);
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    /// Reads the entry at `rel` without decoding artifacts.
    pub fn load_entry(&self, rel: &str) -> Result<Option<StoredEntry>, ProvenanceError> {
        check_rel_path(rel)?;
        let dir = self.entry_dir(rel);
        if !self.ensure_local(rel, &dir) {
            return Ok(None);
        }
        let corrupt = |err: Corruption| ProvenanceError::Corrupt {
            path: rel.to_string(),
            reason: err.to_string(),
        };
        let metadata: Value = read_json(&dir, METADATA_FILE).map_err(corrupt)?;
        let result: Value = read_json(&dir, RESULT_FILE).map_err(corrupt)?;
        let outputs: BTreeMap<String, OutputRecord> = result
            .get("outputs")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|source| {
                corrupt(Corruption::Malformed {
                    file: RESULT_FILE.to_string(),
                    source,
                })
            })?
            .unwrap_or_default();
        let artifacts = outputs
            .into_iter()
            .map(|(output, record)| {
                let present = match &record.file {
                    Some(file) => dir.join(file).is_file(),
                    None => record.size == 0,
                };
                ArtifactStatus {
                    output,
                    file: record.file,
                    size: record.size,
                    checksum: record.checksum,
                    present,
                }
            })
            .collect();
        Ok(Some(StoredEntry {
            path: rel.to_string(),
            metadata,
            result,
            artifacts,
        }))
    }

    /// Deletes the whole namespace of schema `name` (all versions). Returns
    /// whether anything existed.
    pub fn clear_schema(&self, name: &str) -> Result<bool, ProvenanceError> {
        check_namespace_part("name", name)?;
        let dir = self.root.join(name);
        if !dir.exists() {
            return Ok(false);
        }
        fs::remove_dir_all(&dir).map_err(|e| io_error(&dir, e))?;
        info!(schema = name, path = %dir.display(), "cleared schema namespace");
        Ok(true)
    }

    pub fn stats(&self) -> Result<StoreStats, ProvenanceError> {
        let base = self.entry_dir(&self.schema.root_prefix()?);
        let mut stats = StoreStats {
            schema: self.schema.name().to_string(),
            version: self.schema.version().to_string(),
            root: base.clone(),
            simulations: KindStats::default(),
            aggregations: KindStats::default(),
            incomplete: 0,
        };
        if !base.is_dir() {
            return Ok(stats);
        }
        for entry in WalkDir::new(&base).into_iter().filter_map(Result::ok) {
            if entry.file_name() != METADATA_FILE {
                continue;
            }
            let Some(dir) = entry.path().parent() else {
                continue;
            };
            if !dir.join(RESULT_FILE).is_file() {
                stats.incomplete += 1;
                continue;
            }
            let kind = read_json::<Value>(dir, METADATA_FILE)
                .ok()
                .and_then(|m| m.get("kind").cloned())
                .and_then(|k| serde_json::from_value::<ResultKind>(k).ok());
            let bucket = match kind {
                Some(ResultKind::Simulation) => &mut stats.simulations,
                Some(ResultKind::Aggregation) => &mut stats.aggregations,
                None => {
                    stats.incomplete += 1;
                    continue;
                }
            };
            bucket.entries += 1;
            bucket.bytes += dir_size(dir);
        }
        Ok(stats)
    }

    fn rel_of(&self, dir: &Path) -> String {
        dir.strip_prefix(&self.root)
            .unwrap_or(dir)
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// `metadata.json` bytes for `descriptor`. A rewrite of an identical
    /// descriptor keeps the original `stored_at`, so repeated puts leave
    /// byte-identical files.
    fn metadata_bytes(&self, dir: &Path, descriptor: Value) -> Result<Vec<u8>, ProvenanceError> {
        let Value::Object(mut fields) = descriptor else {
            return Err(ProvenanceError::Corrupt {
                path: self.rel_of(dir),
                reason: "metadata descriptor is not an object".to_string(),
            });
        };
        let previous = read_json::<Map<String, Value>>(dir, METADATA_FILE)
            .ok()
            .and_then(|mut existing| {
                let stored_at = existing.remove("stored_at")?;
                (existing == fields).then_some(stored_at)
            });
        let stored_at = previous.unwrap_or_else(|| Value::String(Utc::now().to_rfc3339()));
        fields.insert("stored_at".to_string(), stored_at);
        encode("metadata.json", &Value::Object(fields))
    }

    fn commit(&self, rel: &str, dir: &Path, files: &[(String, Vec<u8>)]) -> Result<(), ProvenanceError> {
        ensure_dir(dir).map_err(|e| io_error(dir, e))?;
        for (name, bytes) in files {
            let path = dir.join(name);
            atomic_write_bytes(&path, bytes).map_err(|e| io_error(&path, e))?;
        }
        self.replicate(rel, files);
        Ok(())
    }

    fn replicate(&self, rel: &str, files: &[(String, Vec<u8>)]) {
        let Some(remote) = &self.remote else {
            return;
        };
        for (name, bytes) in files {
            let key = format!("{}/{}", rel, name);
            if let Err(err) = remote
                .retry
                .run("remote save", || remote.backend.save(&key, bytes))
            {
                warn!(path = %rel, file = %name, error = %err, "remote replication failed; local entry remains authoritative");
                return;
            }
        }
        debug!(path = %rel, files = files.len(), "replicated entry to remote");
    }

    fn ensure_local(&self, rel: &str, dir: &Path) -> bool {
        dir.join(RESULT_FILE).is_file() || self.hydrate(rel, dir)
    }

    /// Copies an entry from the replica into the local tree, `result.json` last.
    fn hydrate(&self, rel: &str, dir: &Path) -> bool {
        let Some(remote) = &self.remote else {
            return false;
        };
        let result_key = format!("{}/{}", rel, RESULT_FILE);
        match remote
            .retry
            .run("remote exists", || remote.backend.exists(&result_key))
        {
            Ok(true) => {}
            Ok(false) => return false,
            Err(err) => {
                warn!(path = %rel, error = %err, "remote lookup failed during hydration");
                return false;
            }
        }
        let prefix = format!("{}/", rel);
        let keys = match remote
            .retry
            .run("remote list", || remote.backend.list_keys(&prefix))
        {
            Ok(keys) => keys,
            Err(err) => {
                warn!(path = %rel, error = %err, "remote listing failed during hydration");
                return false;
            }
        };
        let mut names: Vec<&str> = keys
            .iter()
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter(|name| !name.contains('/') && *name != RESULT_FILE)
            .collect();
        names.push(RESULT_FILE);
        for name in names {
            let key = format!("{}{}", prefix, name);
            let bytes = match remote.retry.run("remote load", || remote.backend.load(&key)) {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(path = %rel, file = name, error = %err, "remote load failed during hydration");
                    return false;
                }
            };
            let path = dir.join(name);
            if let Err(err) = atomic_write_bytes(&path, &bytes) {
                warn!(path = %path.display(), error = %err, "could not write hydrated file");
                return false;
            }
        }
        info!(path = %rel, "hydrated entry from remote");
        dir.join(RESULT_FILE).is_file()
    }
}

fn check_rel_path(rel: &str) -> Result<(), ProvenanceError> {
    let invalid = |reason| {
        Err(ProvenanceError::InvalidPath {
            path: rel.to_string(),
            reason,
        })
    };
    if rel.is_empty() || rel.starts_with('/') {
        return invalid("path must be relative to the store root");
    }
    if rel
        .split('/')
        .any(|seg| seg.is_empty() || seg == "." || seg == "..")
    {
        return invalid("path has an empty or relative segment");
    }
    Ok(())
}

fn encode<T: Serialize>(what: &'static str, value: &T) -> Result<Vec<u8>, ProvenanceError> {
    serde_json::to_vec_pretty(value).map_err(|source| ProvenanceError::Encode { what, source })
}

/// Output records for `result.json` plus the artifact files to write.
/// Empty outputs are recorded without a file.
fn prepare_outputs(
    outputs: &BTreeMap<String, Vec<u8>>,
) -> Result<(BTreeMap<String, OutputRecord>, Vec<(String, Vec<u8>)>), ProvenanceError> {
    let mut records = BTreeMap::new();
    let mut files: Vec<(String, Vec<u8>)> = Vec::new();
    let mut owners: BTreeMap<String, &str> = BTreeMap::new();
    for (name, bytes) in outputs {
        let digest = OutputDigest::of(bytes);
        let file = if bytes.is_empty() {
            None
        } else {
            let file = artifact_file_name(name);
            if let Some(first) = owners.insert(file.clone(), name) {
                return Err(ProvenanceError::ArtifactNameCollision {
                    first: first.to_string(),
                    second: name.clone(),
                    file,
                });
            }
            files.push((file.clone(), bytes.clone()));
            Some(file)
        };
        records.insert(
            name.clone(),
            OutputRecord {
                size: digest.size,
                checksum: digest.checksum,
                file,
            },
        );
    }
    Ok((records, files))
}

fn push_error_details(files: &mut Vec<(String, Vec<u8>)>, details: Option<&str>) -> Option<String> {
    let details = details?;
    files.push((ERROR_DETAILS_FILE.to_string(), details.as_bytes().to_vec()));
    Some(ERROR_DETAILS_FILE.to_string())
}

fn read_file(dir: &Path, file: &str) -> Result<Vec<u8>, Corruption> {
    fs::read(dir.join(file)).map_err(|source| match source.kind() {
        ErrorKind::NotFound => Corruption::MissingFile {
            file: file.to_string(),
        },
        _ => Corruption::Unreadable {
            file: file.to_string(),
            source,
        },
    })
}

fn read_json<T: DeserializeOwned>(dir: &Path, file: &str) -> Result<T, Corruption> {
    let bytes = read_file(dir, file)?;
    serde_json::from_slice(&bytes).map_err(|source| Corruption::Malformed {
        file: file.to_string(),
        source,
    })
}

fn read_outputs(
    dir: &Path,
    records: &BTreeMap<String, OutputRecord>,
) -> Result<BTreeMap<String, Vec<u8>>, Corruption> {
    let mut outputs = BTreeMap::new();
    for (name, record) in records {
        let bytes = if record.size == 0 {
            Vec::new()
        } else {
            let file = record
                .file
                .clone()
                .unwrap_or_else(|| artifact_file_name(name));
            let bytes = read_file(dir, &file)?;
            let actual = sha256_bytes(&bytes);
            if actual != record.checksum || bytes.len() as u64 != record.size {
                return Err(Corruption::ChecksumMismatch {
                    file,
                    expected: record.checksum.clone(),
                    actual,
                    expected_size: record.size,
                    actual_size: bytes.len() as u64,
                });
            }
            bytes
        };
        outputs.insert(name.clone(), bytes);
    }
    Ok(outputs)
}

fn read_error_details(dir: &Path, file: Option<&str>) -> Result<Option<String>, Corruption> {
    let Some(file) = file else {
        return Ok(None);
    };
    let bytes = read_file(dir, file)?;
    Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
}

fn check_kind(found: ResultKind, expected: ResultKind) -> Result<(), Corruption> {
    if found != expected {
        return Err(Corruption::WrongKind { found, expected });
    }
    Ok(())
}

fn read_sim(dir: &Path) -> Result<SimReturn, Corruption> {
    // The descriptor must be present alongside the result.
    let _: Value = read_json(dir, METADATA_FILE)?;
    let record: SimRecord = read_json(dir, RESULT_FILE)?;
    check_kind(record.kind, ResultKind::Simulation)?;
    Ok(SimReturn {
        task_id: record.task_id,
        outputs: read_outputs(dir, &record.outputs)?,
        error: record.error,
        error_details: read_error_details(dir, record.error_details.as_deref())?,
    })
}

fn read_agg(dir: &Path) -> Result<AggregationReturn, Corruption> {
    let _: Value = read_json(dir, METADATA_FILE)?;
    let record: AggRecord = read_json(dir, RESULT_FILE)?;
    check_kind(record.kind, ResultKind::Aggregation)?;
    Ok(AggregationReturn {
        aggregation_id: record.aggregation_id,
        loss: record.loss,
        diagnostics: record.diagnostics,
        n_replicates: record.n_replicates,
        outputs: read_outputs(dir, &record.outputs)?,
        error: record.error,
        error_details: read_error_details(dir, record.error_details.as_deref())?,
    })
}

#[derive(Deserialize)]
struct KindTag {
    kind: ResultKind,
}

/// Runs the full read path for whichever kind the entry records.
fn verify_entry(dir: &Path) -> Result<(), Corruption> {
    let KindTag { kind } = read_json(dir, RESULT_FILE)?;
    match kind {
        ResultKind::Simulation => read_sim(dir).map(drop),
        ResultKind::Aggregation => read_agg(dir).map(drop),
    }
}

fn dir_size(dir: &Path) -> u64 {
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .filter_map(|e| e.metadata().ok())
                .filter(|m| m.is_file())
                .map(|m| m.len())
                .sum()
        })
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelops_core::MemoryBackend;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    fn sim_task(seed: u64) -> SimTask {
        SimTask {
            bundle_ref: "registry.local/seir@sha256:ab".into(),
            bundle_digest: "ab".repeat(32),
            model_digest: Some("cd".repeat(32)),
            entrypoint: "models.seir:run".into(),
            params: BTreeMap::from([("beta".to_string(), json!(0.3))]),
            seed,
            outputs: vec!["incidence".into(), "prevalence".into()],
        }
    }

    fn sim_return(task: &SimTask) -> SimReturn {
        SimReturn {
            task_id: task.task_id(),
            outputs: BTreeMap::from([
                ("incidence".to_string(), b"ARROW1 incidence table".to_vec()),
                ("prevalence".to_string(), Vec::new()),
            ]),
            error: None,
            error_details: None,
        }
    }

    fn agg_task() -> AggregationTask {
        AggregationTask {
            bundle_ref: "registry.local/seir@sha256:ab".into(),
            bundle_digest: "ab".repeat(32),
            model_digest: None,
            target_entrypoint: "targets.prevalence:loss".into(),
            param_id: sim_task(0).param_id(),
            seeds: vec![0, 1, 2],
        }
    }

    fn store(dir: &TempDir) -> ProvenanceStore {
        let schema = ProvenanceSchema::token_invalidation().expect("schema");
        ProvenanceStore::open(dir.path(), schema).expect("open")
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 1,
        }
    }

    #[test]
    fn sim_round_trip_preserves_outputs_and_errors() {
        let dir = TempDir::new().expect("tmp");
        let store = store(&dir);
        let task = sim_task(4);
        assert_eq!(store.get_sim(&task).expect("get"), None);

        let result = sim_return(&task);
        let path = store.put_sim(&task, &result).expect("put");
        assert_eq!(path, store.sim_path(&task).expect("path"));
        let loaded = store.get_sim(&task).expect("get").expect("hit");
        assert_eq!(loaded, result);
        assert_eq!(loaded.output_digests(), result.output_digests());

        let entry_dir = dir.path().join(&path);
        assert!(entry_dir.join("artifact_incidence.arrow").is_file());
        assert!(!entry_dir.join("artifact_prevalence.arrow").exists());

        let failed_task = sim_task(5);
        let failed = SimReturn {
            task_id: failed_task.task_id(),
            outputs: BTreeMap::new(),
            error: Some(ErrorInfo {
                error_type: "ValueError".into(),
                message: "negative population".into(),
                retryable: false,
            }),
            error_details: Some("Traceback (most recent call last): ...".into()),
        };
        store.put_sim(&failed_task, &failed).expect("put failed");
        assert_eq!(store.get_sim(&failed_task).expect("get"), Some(failed));
    }

    #[test]
    fn repeated_put_is_byte_identical() {
        let dir = TempDir::new().expect("tmp");
        let store = store(&dir);
        let task = sim_task(1);
        let result = sim_return(&task);
        let path = store.put_sim(&task, &result).expect("first put");
        let entry_dir = dir.path().join(&path);
        let snapshot = |file: &str| fs::read(entry_dir.join(file)).expect("read");
        let before = (snapshot(METADATA_FILE), snapshot(RESULT_FILE));

        let again = store.put_sim(&task, &result).expect("second put");
        assert_eq!(again, path);
        assert_eq!((snapshot(METADATA_FILE), snapshot(RESULT_FILE)), before);
        assert_eq!(store.get_sim(&task).expect("get"), Some(result));
    }

    #[test]
    fn entries_without_result_file_are_misses() {
        let dir = TempDir::new().expect("tmp");
        let store = store(&dir);
        let task = sim_task(2);
        let path = store.put_sim(&task, &sim_return(&task)).expect("put");
        fs::remove_file(dir.path().join(&path).join(RESULT_FILE)).expect("remove");
        assert_eq!(store.get_sim(&task).expect("get"), None);
        assert!(!store.exists(&path).expect("exists"));
    }

    #[test]
    fn corrupt_entries_are_misses_not_errors() {
        let dir = TempDir::new().expect("tmp");
        let store = store(&dir);
        let task = sim_task(3);
        let path = store.put_sim(&task, &sim_return(&task)).expect("put");
        let entry_dir = dir.path().join(&path);

        assert!(store.exists(&path).expect("exists"));

        fs::remove_file(entry_dir.join("artifact_incidence.arrow")).expect("remove artifact");
        assert_eq!(store.get_sim(&task).expect("missing artifact"), None);
        assert!(!store.exists(&path).expect("missing artifact"));

        store.put_sim(&task, &sim_return(&task)).expect("repair");
        assert!(store.exists(&path).expect("repaired"));
        fs::write(entry_dir.join("artifact_incidence.arrow"), b"tampered").expect("tamper");
        assert_eq!(store.get_sim(&task).expect("checksum mismatch"), None);
        assert!(!store.exists(&path).expect("checksum mismatch"));

        store.put_sim(&task, &sim_return(&task)).expect("repair");
        fs::write(entry_dir.join(RESULT_FILE), b"{ not json").expect("garble");
        assert_eq!(store.get_sim(&task).expect("malformed json"), None);
        assert!(!store.exists(&path).expect("malformed json"));

        store.put_sim(&task, &sim_return(&task)).expect("repair");
        fs::remove_file(entry_dir.join(METADATA_FILE)).expect("remove metadata");
        assert_eq!(store.get_sim(&task).expect("missing metadata"), None);
        assert!(!store.exists(&path).expect("missing metadata"));
    }

    #[test]
    fn concurrent_writers_of_one_task_never_expose_partial_entries() {
        let dir = TempDir::new().expect("tmp");
        let store = Arc::new(store(&dir));
        let task = sim_task(11);
        let result = sim_return(&task);
        let done = Arc::new(AtomicBool::new(false));

        let reader = {
            let (store, task, result, done) =
                (store.clone(), task.clone(), result.clone(), done.clone());
            thread::spawn(move || {
                let mut reads = 0u64;
                while !done.load(Ordering::SeqCst) {
                    if let Some(found) = store.get_sim(&task).expect("get") {
                        assert_eq!(found, result);
                    }
                    reads += 1;
                }
                reads
            })
        };
        let writers: Vec<_> = (0..4)
            .map(|_| {
                let (store, task, result) = (store.clone(), task.clone(), result.clone());
                thread::spawn(move || {
                    for _ in 0..25 {
                        store.put_sim(&task, &result).expect("put");
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().expect("writer thread");
        }
        done.store(true, Ordering::SeqCst);
        assert!(reader.join().expect("reader thread") > 0);

        assert_eq!(store.get_sim(&task).expect("get"), Some(result));
        let leftovers: Vec<_> = WalkDir::new(dir.path())
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .map(|e| e.path().display().to_string())
            .collect();
        assert!(leftovers.is_empty(), "{:?}", leftovers);
    }

    #[test]
    fn aggregation_round_trip() {
        let dir = TempDir::new().expect("tmp");
        let store = store(&dir);
        let task = agg_task();
        let result = AggregationReturn {
            aggregation_id: task.aggregation_id(),
            loss: Some(0.125),
            diagnostics: BTreeMap::from([("rmse".to_string(), json!(0.35))]),
            n_replicates: 3,
            outputs: BTreeMap::from([("residuals".to_string(), b"resid".to_vec())]),
            error: None,
            error_details: None,
        };
        let path = store.put_agg(&task, &result).expect("put");
        assert!(path.contains("target_targets.prevalence_loss"), "{}", path);
        assert!(path.ends_with(&format!("agg_{}", task.aggregation_id())));
        assert_eq!(store.get_agg(&task).expect("get"), Some(result));
    }

    #[test]
    fn list_results_filters_by_kind_and_limit() {
        let dir = TempDir::new().expect("tmp");
        let store = store(&dir);
        for seed in 0..3 {
            let task = sim_task(seed);
            store.put_sim(&task, &sim_return(&task)).expect("put");
        }
        let agg = agg_task();
        store
            .put_agg(
                &agg,
                &AggregationReturn {
                    aggregation_id: agg.aggregation_id(),
                    n_replicates: 3,
                    ..Default::default()
                },
            )
            .expect("put agg");
        fs::create_dir_all(dir.path().join("token/v2/sims/broken")).expect("mkdir");
        fs::write(dir.path().join("token/v2/sims/broken").join(METADATA_FILE), b"{").expect("garble");

        let sims = store.list_results(ResultKind::Simulation, 10).expect("list");
        assert_eq!(sims.len(), 3);
        for sim in &sims {
            let path = sim["path"].as_str().expect("path");
            assert!(store.exists(path).expect("exists"));
            assert_eq!(sim["kind"], "simulation");
        }
        assert_eq!(store.list_results(ResultKind::Simulation, 2).expect("list").len(), 2);
        assert_eq!(store.list_results(ResultKind::Aggregation, 10).expect("list").len(), 1);

        let stats = store.stats().expect("stats");
        assert_eq!(stats.simulations.entries, 3);
        assert_eq!(stats.aggregations.entries, 1);
        assert_eq!(stats.incomplete, 1);
        assert!(stats.simulations.bytes > 0);
    }

    #[test]
    fn clear_schema_removes_only_that_namespace() {
        let dir = TempDir::new().expect("tmp");
        let token = store(&dir);
        let bundle = ProvenanceStore::open(
            dir.path(),
            ProvenanceSchema::bundle_invalidation().expect("schema"),
        )
        .expect("open");
        let task = sim_task(0);
        token.put_sim(&task, &sim_return(&task)).expect("put");
        bundle.put_sim(&task, &sim_return(&task)).expect("put");

        assert!(token.clear_schema("token").expect("clear"));
        assert!(!token.clear_schema("token").expect("clear again"));
        assert_eq!(token.get_sim(&task).expect("get"), None);
        assert!(bundle.get_sim(&task).expect("get").is_some());
        assert!(token.clear_schema("../escape").is_err());
    }

    #[test]
    fn remote_replica_fills_misses_and_absorbs_outages() {
        let writer_dir = TempDir::new().expect("tmp");
        let reader_dir = TempDir::new().expect("tmp");
        let remote = Arc::new(MemoryBackend::new());
        let writer = store(&writer_dir).with_remote(remote.clone(), fast_retry());
        let reader = store(&reader_dir).with_remote(remote.clone(), fast_retry());

        let task = sim_task(9);
        let result = sim_return(&task);
        let path = writer.put_sim(&task, &result).expect("put");
        assert!(remote
            .exists(&format!("{}/{}", path, RESULT_FILE))
            .expect("remote has result"));

        assert!(reader.exists(&path).expect("exists via remote"));
        assert_eq!(reader.get_sim(&task).expect("hydrate"), Some(result.clone()));
        assert!(reader_dir.path().join(&path).join(RESULT_FILE).is_file());

        remote.set_offline(true);
        let other = sim_task(10);
        let other_result = sim_return(&other);
        writer
            .put_sim(&other, &other_result)
            .expect("local write succeeds while remote is down");
        assert_eq!(writer.get_sim(&other).expect("get"), Some(other_result));
        assert_eq!(reader.get_sim(&other).expect("remote down"), None);
    }

    #[test]
    fn inspection_reports_artifact_presence() {
        let dir = TempDir::new().expect("tmp");
        let store = store(&dir);
        let task = sim_task(6);
        let path = store.put_sim(&task, &sim_return(&task)).expect("put");
        let entry = store.load_entry(&path).expect("load").expect("present");
        assert_eq!(entry.metadata["seed"], 6);
        assert_eq!(entry.artifacts.len(), 2);
        assert!(entry.artifacts.iter().all(|a| a.present));

        assert!(store.load_entry("token/v2/sims/nope").expect("load").is_none());
        assert!(matches!(
            store.load_entry("../outside"),
            Err(ProvenanceError::InvalidPath { .. })
        ));
    }

    #[test]
    fn colliding_artifact_names_are_rejected() {
        let dir = TempDir::new().expect("tmp");
        let store = store(&dir);
        let task = sim_task(7);
        let result = SimReturn {
            task_id: task.task_id(),
            outputs: BTreeMap::from([
                ("a b".to_string(), b"1".to_vec()),
                ("a_b".to_string(), b"2".to_vec()),
            ]),
            ..Default::default()
        };
        assert!(matches!(
            store.put_sim(&task, &result),
            Err(ProvenanceError::ArtifactNameCollision { .. })
        ));
    }
}
