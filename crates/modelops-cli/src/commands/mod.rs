pub mod jobs;
pub mod results;

use anyhow::Result;
use modelops_core::{LocalBackend, ModelOpsConfig, SchemaChoice};
use modelops_provenance::{ProvenanceSchema, ProvenanceStore};
use std::sync::Arc;

/// The provenance store described by `config`, optionally under another schema.
pub fn open_store(config: &ModelOpsConfig, schema: Option<SchemaChoice>) -> Result<ProvenanceStore> {
    let schema = ProvenanceSchema::for_choice(schema.unwrap_or(config.schema))?;
    let mut store = ProvenanceStore::open(&config.storage.root, schema)?;
    if let Some(remote_root) = &config.storage.remote_root {
        let remote = LocalBackend::open(remote_root)?;
        store = store.with_remote(Arc::new(remote), config.remote_retry);
    }
    Ok(store)
}
