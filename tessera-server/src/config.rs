use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tessera_core::{
    AssignmentStrategy, BlobTransferConfig, IngestionConfig, LiveNode, Result, StorageConfig,
    StoreDefinition, TesseraError,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node_id: String,
    pub bind_addr: String,
    /// URL peers use to reach this node. Defaults to `http://<bind_addr>`.
    #[serde(default)]
    pub advertise_url: Option<String>,
    #[serde(default)]
    pub storage: StorageConfig,
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub blob_transfer: BlobTransferConfig,
    #[serde(default)]
    pub changelog: ChangeLogConfig,
}

/// Controller-owned cluster state, loaded statically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub assignment_strategy: AssignmentStrategy,
    pub live_nodes: Vec<LiveNode>,
    #[serde(default)]
    pub stores: Vec<StoreDefinition>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeLogConfig {
    #[serde(default)]
    pub backend: ChangeLogBackend,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeLogBackend {
    #[default]
    Memory,
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(::config::Environment::with_prefix("TESSERA").separator("__"))
            .build()
            .map_err(|e| TesseraError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| TesseraError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn effective_advertise_url(&self) -> String {
        self.advertise_url
            .clone()
            .unwrap_or_else(|| format!("http://{}", self.bind_addr))
            .trim_end_matches('/')
            .to_string()
    }

    /// URLs of every other live node.
    pub fn peer_urls(&self) -> Vec<String> {
        self.cluster
            .live_nodes
            .iter()
            .filter(|node| node.node_id != self.node_id)
            .map(|node| node.url.trim_end_matches('/').to_string())
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(TesseraError::Config("node_id must not be empty".to_string()));
        }
        if !self
            .cluster
            .live_nodes
            .iter()
            .any(|node| node.node_id == self.node_id)
        {
            return Err(TesseraError::Config(format!(
                "node_id '{}' is not listed in cluster.live_nodes",
                self.node_id
            )));
        }

        let mut names = HashSet::new();
        for store in &self.cluster.stores {
            if store.name.is_empty() || store.name.starts_with('_') || store.name.contains('/') {
                return Err(TesseraError::Config(format!(
                    "invalid store name '{}'",
                    store.name
                )));
            }
            if !names.insert(store.name.as_str()) {
                return Err(TesseraError::Config(format!(
                    "store '{}' is defined twice",
                    store.name
                )));
            }
            if store.partition_count == 0 {
                return Err(TesseraError::Config(format!(
                    "store '{}' needs at least one partition",
                    store.name
                )));
            }
        }

        // A node-local log restarts at offset 0, below any installed snapshot.
        if self.changelog.backend == ChangeLogBackend::Memory
            && self.blob_transfer.enabled
            && self.cluster.live_nodes.len() > 1
        {
            return Err(TesseraError::Config(
                "changelog backend 'memory' cannot be combined with blob_transfer".to_string(),
            ));
        }

        self.ingestion.validate()?;
        self.blob_transfer.validate()?;
        Ok(())
    }
}
