use crate::retry::Transient;
use std::collections::BTreeSet;
use thiserror::Error;

/// A backend holding named text artifacts: rule documents and the service configuration.
#[async_trait::async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Indicates whether every unit of the application sees the same store. Shared stores are
    /// only ever written by the leader.
    fn is_shared(&self) -> bool;

    /// The location of a named artifact as seen by the workload.
    fn location(&self, name: &str) -> String;

    /// Creates the backing resource if it does not exist yet.
    async fn ensure(&self) -> Result<(), StoreError>;

    /// Removes the backing resource and everything in it.
    async fn teardown(&self) -> Result<(), StoreError>;

    async fn write(&self, name: &str, content: &str) -> Result<(), StoreError>;

    /// Deletes the named artifacts. Names that do not exist are ignored.
    async fn delete(&self, names: &[String]) -> Result<(), StoreError>;

    async fn list_keys(&self) -> Result<BTreeSet<String>, StoreError>;
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be reached; the request may succeed if retried.
    #[error("artifact store unavailable: {0}")]
    Unavailable(#[source] anyhow::Error),

    #[error("artifact store request failed: {0}")]
    Failed(#[source] anyhow::Error),
}

impl Transient for StoreError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}
