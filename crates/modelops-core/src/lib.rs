//! Shared plumbing for the ModelOps workspace: digests, atomic file writes,
//! the byte-oriented storage backend interface and configuration loading.

mod config;
mod fsutil;
mod hash;
mod retry;
pub mod storage;

pub use config::{
    ConfigError, ModelOpsConfig, OrchestratorConfig, RegistryConfig, SchemaChoice, StorageConfig,
    ValidationConfig, CONFIG_FILE_NAME,
};
pub use fsutil::{atomic_write_bytes, atomic_write_json_pretty, ensure_dir};
pub use hash::{canonical_json_bytes, canonical_json_digest, sha256_bytes, sha256_str};
pub use retry::RetryPolicy;
pub use storage::{
    DynBackend, LocalBackend, MemoryBackend, StorageBackend, StorageBackendExt, StorageError,
    StorageResult,
};
