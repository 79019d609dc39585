//! Provenance storage: the path-template schema that places results, the
//! task and result value types, and the filesystem store with optional
//! remote replication.

pub mod schema;
pub mod store;
pub mod task;

pub use schema::{
    shard_segments, PathContext, PathTemplate, ProvenanceSchema, SchemaError, BUNDLE_SCHEMA_NAME,
    TOKEN_SCHEMA_NAME,
};
pub use store::{
    artifact_file_name, ArtifactStatus, KindStats, ProvenanceError, ProvenanceStore, StoreStats,
    StoredEntry, ERROR_DETAILS_FILE, METADATA_FILE, RESULT_FILE,
};
pub use task::{
    aggregation_id, param_id, sanitize_segment, AggregationReturn, AggregationTask, ErrorInfo,
    OutputDigest, ResultKind, SimReturn, SimTask, AGGREGATION_ID_LEN,
};
