use crate::retry::Transient;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    time::Duration,
};
use thiserror::Error;

/// The workload container's control channel.
#[async_trait::async_trait]
pub trait Workload: Send + Sync {
    async fn can_connect(&self) -> bool;

    async fn is_running(&self) -> bool;

    /// Merges a layer into the workload's plan.
    async fn add_layer(&self, layer: &Layer) -> Result<(), WorkloadError>;

    async fn restart(&self) -> Result<(), WorkloadError>;

    /// Writes a file in the workload container, creating missing parent directories.
    async fn push(&self, path: &str, content: &str) -> Result<(), WorkloadError>;

    /// Removes a file or directory tree from the workload container. A missing path is not an
    /// error.
    async fn remove(&self, path: &str) -> Result<(), WorkloadError>;

    /// Lists the names of the regular files in a workload directory. A missing directory is
    /// empty.
    async fn list_files(&self, dir: &str) -> Result<BTreeSet<String>, WorkloadError>;

    /// Runs a command in the workload container and returns its standard output.
    async fn exec(&self, command: &[String], timeout: Duration) -> Result<String, WorkloadError>;
}

#[derive(Debug, Error)]
pub enum WorkloadError {
    #[error("cannot connect to the workload container: {0}")]
    Unreachable(String),

    #[error("workload change failed: {0}")]
    Change(String),

    #[error("command exited with code {code}: {stderr}")]
    Exec { code: i32, stderr: String },

    #[error("command timed out after {0:?}")]
    Timeout(Duration),
}

impl Transient for WorkloadError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::Timeout(_))
    }
}

/// A Pebble plan layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layer {
    pub summary: String,
    pub description: String,
    pub services: BTreeMap<String, LayerService>,
    pub checks: BTreeMap<String, LayerCheck>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerService {
    #[serde(rename = "override")]
    pub override_: String,
    pub summary: String,
    pub command: String,
    pub startup: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerCheck {
    #[serde(rename = "override")]
    pub override_: String,
    pub http: HttpCheck,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpCheck {
    pub url: String,
}

// === impl Layer ===

impl Layer {
    /// The layer that runs Oathkeeper with the given configuration file.
    pub fn oathkeeper(service: &str, config_path: &str, api_port: u16) -> Self {
        let service_def = LayerService {
            override_: "replace".to_string(),
            summary: "Oathkeeper Operator layer".to_string(),
            command: format!("oathkeeper serve -c {config_path}"),
            startup: "enabled".to_string(),
        };
        let check = |probe: &str| LayerCheck {
            override_: "replace".to_string(),
            http: HttpCheck {
                url: format!("http://localhost:{api_port}/health/{probe}"),
            },
        };

        Self {
            summary: "oathkeeper-operator layer".to_string(),
            description: "pebble config layer for oathkeeper-operator".to_string(),
            services: [(service.to_string(), service_def)].into_iter().collect(),
            checks: [
                ("alive".to_string(), check("alive")),
                ("ready".to_string(), check("ready")),
            ]
            .into_iter()
            .collect(),
        }
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}
