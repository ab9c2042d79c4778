use crate::{
    retry::Transient,
    store::{ArtifactStore, StoreError},
    workload::{Workload, WorkloadError},
};
use std::{collections::BTreeSet, sync::Arc};
use tracing::debug;

/// An [`ArtifactStore`] that keeps each artifact in a file of the workload container, written
/// through the workload's control channel. Files are local to this unit.
#[derive(Clone)]
pub struct WorkloadFiles {
    workload: Arc<dyn Workload>,
    dir: String,
}

// === impl WorkloadFiles ===

impl WorkloadFiles {
    pub fn new(workload: Arc<dyn Workload>, dir: impl ToString) -> Self {
        let dir = dir.to_string();
        Self {
            workload,
            dir: dir.trim_end_matches('/').to_string(),
        }
    }

    fn path(&self, name: &str) -> Result<String, StoreError> {
        let valid = !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains(['/', '\\']);
        if !valid {
            return Err(StoreError::Failed(anyhow::anyhow!(
                "invalid artifact name {name:?}"
            )));
        }
        Ok(format!("{}/{name}", self.dir))
    }
}

#[async_trait::async_trait]
impl ArtifactStore for WorkloadFiles {
    fn is_shared(&self) -> bool {
        false
    }

    fn location(&self, name: &str) -> String {
        format!("{}/{name}", self.dir)
    }

    /// Directories are created on the first write.
    async fn ensure(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn teardown(&self) -> Result<(), StoreError> {
        // The container's filesystem goes away with the unit.
        if !self.workload.can_connect().await {
            debug!(dir = %self.dir, "Workload is gone; nothing to remove");
            return Ok(());
        }
        self.workload
            .remove(&self.dir)
            .await
            .map_err(|error| store_error("remove", &self.dir, error))
    }

    async fn write(&self, name: &str, content: &str) -> Result<(), StoreError> {
        let path = self.path(name)?;
        self.workload
            .push(&path, content)
            .await
            .map_err(|error| store_error("push", &path, error))?;
        debug!(%path, "Pushed file");
        Ok(())
    }

    async fn delete(&self, names: &[String]) -> Result<(), StoreError> {
        for name in names {
            let path = self.path(name)?;
            self.workload
                .remove(&path)
                .await
                .map_err(|error| store_error("remove", &path, error))?;
            debug!(%path, "Removed file");
        }
        Ok(())
    }

    async fn list_keys(&self) -> Result<BTreeSet<String>, StoreError> {
        self.workload
            .list_files(&self.dir)
            .await
            .map_err(|error| store_error("list", &self.dir, error))
    }
}

fn store_error(op: &str, path: &str, error: WorkloadError) -> StoreError {
    let transient = error.is_transient();
    let error = anyhow::Error::new(error).context(format!("failed to {op} {path}"));
    if transient {
        StoreError::Unavailable(error)
    } else {
        StoreError::Failed(error)
    }
}
