use super::open_store;
use anyhow::{anyhow, Result};
use clap::{Subcommand, ValueEnum};
use modelops_core::{ModelOpsConfig, SchemaChoice};
use modelops_provenance::{ProvenanceError, ResultKind, StoredEntry};
use serde_json::{json, Value};

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum KindArg {
    #[value(name = "sim")]
    Sim,
    #[value(name = "agg")]
    Agg,
}

impl From<KindArg> for ResultKind {
    fn from(value: KindArg) -> Self {
        match value {
            KindArg::Sim => ResultKind::Simulation,
            KindArg::Agg => ResultKind::Aggregation,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum SchemaArg {
    #[value(name = "bundle")]
    Bundle,
    #[value(name = "token")]
    Token,
}

impl From<SchemaArg> for SchemaChoice {
    fn from(value: SchemaArg) -> Self {
        match value {
            SchemaArg::Bundle => SchemaChoice::Bundle,
            SchemaArg::Token => SchemaChoice::Token,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ShowFormat {
    #[value(name = "summary")]
    Summary,
    #[value(name = "json")]
    Json,
    #[value(name = "artifacts")]
    Artifacts,
}

#[derive(Subcommand)]
pub enum ResultsCommand {
    /// List stored results of one kind.
    List {
        #[arg(long = "type", value_enum, default_value = "sim")]
        kind: KindArg,
        #[arg(long, value_enum)]
        schema: Option<SchemaArg>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
    /// Inspect one stored result by its relative path.
    Show {
        path: String,
        #[arg(long, value_enum, default_value = "summary")]
        format: ShowFormat,
        #[arg(long)]
        json: bool,
    },
    /// Delete every stored result of a schema namespace.
    Clear {
        #[arg(long)]
        schema: String,
        #[arg(long)]
        json: bool,
    },
    /// Entry counts and sizes for the active schema.
    Stats {
        #[arg(long, value_enum)]
        schema: Option<SchemaArg>,
        #[arg(long)]
        json: bool,
    },
}

impl ResultsCommand {
    pub fn json_mode(&self) -> bool {
        match self {
            ResultsCommand::List { json, .. }
            | ResultsCommand::Show { json, .. }
            | ResultsCommand::Clear { json, .. }
            | ResultsCommand::Stats { json, .. } => *json,
        }
    }
}

pub fn run(command: ResultsCommand, config: &ModelOpsConfig) -> Result<Option<Value>> {
    match command {
        ResultsCommand::List {
            kind,
            schema,
            limit,
            json,
        } => {
            let store = open_store(config, schema.map(Into::into))?;
            let kind: ResultKind = kind.into();
            let entries = store.list_results(kind, limit)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "results list",
                    "schema": store.schema().name(),
                    "type": kind,
                    "count": entries.len(),
                    "results": entries,
                })));
            }
            if entries.is_empty() {
                println!("no {} results under {}", kind, store.schema().name());
            }
            for entry in &entries {
                print_list_line(kind, entry);
            }
        }
        ResultsCommand::Show { path, format, json } => {
            let store = open_store(config, None)?;
            let entry = match store.load_entry(&path) {
                Ok(Some(entry)) => entry,
                Ok(None) => return Err(anyhow!("no complete result stored at {}", path)),
                Err(ProvenanceError::Corrupt { path, reason }) => {
                    eprintln!("warning: stored result at {} is corrupt: {}", path, reason);
                    eprintln!(
                        "hint: remove {} and re-run the task that produced it",
                        store.root().join(&path).display()
                    );
                    return Err(anyhow!("corrupt result at {}", path));
                }
                Err(err) => return Err(err.into()),
            };
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "results show",
                    "entry": entry,
                })));
            }
            match format {
                ShowFormat::Summary => print_entry_summary(&entry),
                ShowFormat::Json => println!(
                    "{}",
                    serde_json::to_string_pretty(&json!({
                        "metadata": entry.metadata,
                        "result": entry.result,
                    }))?
                ),
                ShowFormat::Artifacts => print_artifacts(&entry),
            }
        }
        ResultsCommand::Clear { schema, json } => {
            let store = open_store(config, None)?;
            let removed = store.clear_schema(&schema)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "results clear",
                    "schema": schema,
                    "removed": removed,
                })));
            }
            if removed {
                println!("removed: {}", store.root().join(&schema).display());
            } else {
                println!("nothing stored under schema {}", schema);
            }
        }
        ResultsCommand::Stats { schema, json } => {
            let store = open_store(config, schema.map(Into::into))?;
            let stats = store.stats()?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "results stats",
                    "stats": stats,
                })));
            }
            println!("schema: {} (v{})", stats.schema, stats.version);
            println!("root: {}", stats.root.display());
            println!(
                "simulations: {} ({} bytes)",
                stats.simulations.entries, stats.simulations.bytes
            );
            println!(
                "aggregations: {} ({} bytes)",
                stats.aggregations.entries, stats.aggregations.bytes
            );
            if stats.incomplete > 0 {
                println!("incomplete: {}", stats.incomplete);
            }
        }
    }
    Ok(None)
}

fn field<'a>(value: &'a Value, key: &str) -> &'a str {
    value.get(key).and_then(Value::as_str).unwrap_or("-")
}

fn print_list_line(kind: ResultKind, entry: &Value) {
    let path = field(entry, "path");
    let stored_at = field(entry, "stored_at");
    match kind {
        ResultKind::Simulation => {
            let seed = entry
                .get("seed")
                .map(Value::to_string)
                .unwrap_or_else(|| "-".to_string());
            println!("{}  seed={}  {}", stored_at, seed, path);
        }
        ResultKind::Aggregation => {
            println!("{}  target={}  {}", stored_at, field(entry, "target_entrypoint"), path);
        }
    }
}

fn print_entry_summary(entry: &StoredEntry) {
    println!("path: {}", entry.path);
    println!("kind: {}", field(&entry.metadata, "kind"));
    println!("stored_at: {}", field(&entry.metadata, "stored_at"));
    println!("entrypoint: {}", field(&entry.metadata, "entrypoint"));
    println!("param_id: {}", field(&entry.metadata, "param_id"));
    if let Some(seed) = entry.metadata.get("seed") {
        println!("seed: {}", seed);
    }
    if let Some(loss) = entry.result.get("loss").filter(|v| !v.is_null()) {
        println!("loss: {}", loss);
    }
    match entry.result.get("error").filter(|v| !v.is_null()) {
        Some(error) => println!(
            "error: {}: {}",
            field(error, "error_type"),
            field(error, "message")
        ),
        None => println!("error: none"),
    }
    let missing = entry.artifacts.iter().filter(|a| !a.present).count();
    println!("artifacts: {} ({} missing)", entry.artifacts.len(), missing);
}

fn print_artifacts(entry: &StoredEntry) {
    if entry.artifacts.is_empty() {
        println!("no artifacts");
    }
    for artifact in &entry.artifacts {
        println!(
            "{}  {} bytes  sha256:{}  {}{}",
            artifact.output,
            artifact.size,
            artifact.checksum,
            artifact.file.as_deref().unwrap_or("(empty)"),
            if artifact.present { "" } else { "  MISSING" }
        );
    }
}
