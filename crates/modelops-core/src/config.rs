use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "config.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Which digest keys simulation and aggregation paths.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaChoice {
    /// Invalidate whenever the bundle digest changes.
    Bundle,
    /// Invalidate only when the model digest changes.
    #[default]
    Token,
}

impl SchemaChoice {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaChoice::Bundle => "bundle",
            SchemaChoice::Token => "token",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Provenance store root.
    pub root: PathBuf,
    /// Optional secondary backend root used for off-box durability.
    pub remote_root: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("provenance"),
            remote_root: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Holds job registry records and submitted job bodies.
    pub root: PathBuf,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("registry"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub enabled: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub namespace: String,
    pub image: String,
    pub kubectl: String,
    pub scheduler_address: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            namespace: "modelops".to_string(),
            image: "ghcr.io/modelops/runner:latest".to_string(),
            kubectl: "kubectl".to_string(),
            scheduler_address: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelOpsConfig {
    pub storage: StorageConfig,
    pub registry: RegistryConfig,
    pub schema: SchemaChoice,
    pub validation: ValidationConfig,
    pub orchestrator: OrchestratorConfig,
    pub remote_retry: RetryPolicy,
}

impl ModelOpsConfig {
    /// Defaults with every relative path anchored at `home`.
    pub fn rooted_at(home: &Path) -> Self {
        let mut config = Self::default();
        config.resolve_paths(home);
        config
    }

    /// Reads `path`; a missing file yields [`ModelOpsConfig::rooted_at`] of
    /// `home`. Relative paths inside the file resolve against `home`.
    pub fn load_or_default(path: &Path, home: &Path) -> Result<Self, ConfigError> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Self::rooted_at(home)),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let mut config: Self = if raw.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?
        };
        config.resolve_paths(home);
        Ok(config)
    }

    fn resolve_paths(&mut self, base: &Path) {
        let anchor = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        anchor(&mut self.storage.root);
        if let Some(remote) = self.storage.remote_root.as_mut() {
            anchor(remote);
        }
        anchor(&mut self.registry.root);
    }
}
