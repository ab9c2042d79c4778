//! An [`ArtifactStore`] backed by a Kubernetes ConfigMap.
//!
//! Each artifact is a key of the ConfigMap's `data`. The ConfigMap is mounted into the workload
//! container, so an artifact's location is the mount directory joined with its key.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use oathkeeper_operator_k8s_api::{
    self as k8s, Api, ConfigMap, DeleteParams, Labels, Patch, PatchParams, PostParams,
};
use oathkeeper_operator_reconcile::{ArtifactStore, StoreError};
use std::{collections::BTreeSet, future::Future, time::Duration};
use tokio::time;
use tracing::{debug, info};

/// Bounds every request to the API server.
const TIMEOUT: Duration = Duration::from_secs(10);

pub struct ConfigMapStore {
    api: Api<ConfigMap>,
    name: String,
    namespace: String,
    labels: Labels,
    mount_dir: String,
}

// === impl ConfigMapStore ===

impl ConfigMapStore {
    pub fn new(
        client: k8s::Client,
        namespace: impl ToString,
        name: impl ToString,
        labels: Labels,
        mount_dir: impl ToString,
    ) -> Self {
        let namespace = namespace.to_string();
        Self {
            api: Api::namespaced(client, &namespace),
            name: name.to_string(),
            namespace,
            labels,
            mount_dir: mount_dir.to_string(),
        }
    }

    async fn request<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = Result<T, k8s::Error>>,
    ) -> Result<T, StoreError> {
        match time::timeout(TIMEOUT, fut).await {
            Ok(res) => res.map_err(|error| classify(op, &self.name, error)),
            Err(_) => Err(StoreError::Unavailable(anyhow::anyhow!(
                "{op} configmap {} timed out after {:?}",
                self.name,
                TIMEOUT
            ))),
        }
    }

    async fn patch_data(&self, data: serde_json::Value) -> Result<(), StoreError> {
        let params = PatchParams::default();
        self.request("patch", self.api.patch(&self.name, &params, &Patch::Merge(data)))
            .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ArtifactStore for ConfigMapStore {
    fn is_shared(&self) -> bool {
        true
    }

    fn location(&self, name: &str) -> String {
        format!("{}/{name}", self.mount_dir.trim_end_matches('/'))
    }

    async fn ensure(&self) -> Result<(), StoreError> {
        if self
            .request("get", self.api.get_opt(&self.name))
            .await?
            .is_some()
        {
            debug!(configmap = %self.name, "ConfigMap already exists");
            return Ok(());
        }

        let cm = k8s::configmap(&self.name, &self.namespace, &self.labels);
        match time::timeout(TIMEOUT, self.api.create(&PostParams::default(), &cm)).await {
            Ok(Ok(_)) => info!(configmap = %self.name, "Created ConfigMap"),
            Ok(Err(k8s::Error::Api(e))) if e.code == 409 => {
                debug!(configmap = %self.name, "ConfigMap already exists")
            }
            Ok(Err(error)) => return Err(classify("create", &self.name, error)),
            Err(_) => {
                return Err(StoreError::Unavailable(anyhow::anyhow!(
                    "create configmap {} timed out",
                    self.name
                )))
            }
        }
        Ok(())
    }

    async fn teardown(&self) -> Result<(), StoreError> {
        let params = DeleteParams::default();
        match time::timeout(TIMEOUT, self.api.delete(&self.name, &params)).await {
            Ok(Ok(_)) => info!(configmap = %self.name, "Deleted ConfigMap"),
            Ok(Err(k8s::Error::Api(e))) if e.code == 404 => {
                debug!(configmap = %self.name, "ConfigMap already deleted")
            }
            Ok(Err(error)) => return Err(classify("delete", &self.name, error)),
            Err(_) => {
                return Err(StoreError::Unavailable(anyhow::anyhow!(
                    "delete configmap {} timed out",
                    self.name
                )))
            }
        }
        Ok(())
    }

    async fn write(&self, name: &str, content: &str) -> Result<(), StoreError> {
        self.patch_data(data_patch([(name, Some(content))])).await?;
        debug!(configmap = %self.name, key = %name, "Updated ConfigMap key");
        Ok(())
    }

    async fn delete(&self, names: &[String]) -> Result<(), StoreError> {
        if names.is_empty() {
            return Ok(());
        }
        self.patch_data(data_patch(names.iter().map(|n| (n.as_str(), None))))
            .await?;
        debug!(configmap = %self.name, keys = ?names, "Removed ConfigMap keys");
        Ok(())
    }

    async fn list_keys(&self) -> Result<BTreeSet<String>, StoreError> {
        let cm = self.request("get", self.api.get(&self.name)).await?;
        Ok(cm.data.unwrap_or_default().into_keys().collect())
    }
}

/// Builds a JSON merge patch for a ConfigMap's `data`. A `None` value removes the key, which
/// is a no-op when the key is absent.
fn data_patch<'a>(
    entries: impl IntoIterator<Item = (&'a str, Option<&'a str>)>,
) -> serde_json::Value {
    let data = entries
        .into_iter()
        .map(|(key, value)| {
            let value = value.map_or(serde_json::Value::Null, |v| v.into());
            (key.to_string(), value)
        })
        .collect::<serde_json::Map<_, _>>();
    serde_json::json!({ "data": data })
}

/// Server-side failures and throttling may clear up on their own; client errors will not.
fn classify(op: &str, name: &str, error: k8s::Error) -> StoreError {
    let transient = match &error {
        k8s::Error::Api(response) => response.code == 429 || response.code >= 500,
        _ => true,
    };
    let error = anyhow::Error::new(error).context(format!("failed to {op} configmap {name}"));
    if transient {
        StoreError::Unavailable(error)
    } else {
        StoreError::Failed(error)
    }
}
