use oathkeeper_operator_core::{IdentityEndpoints, RelationData, RelationId};
use std::{collections::BTreeMap, fmt};

/// The status reported for this unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UnitStatus {
    Active,
    Maintenance(String),
    Waiting(String),
    Blocked(String),
}

/// An `auth-proxy` relation as seen from this side.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpstreamRelation {
    pub app_name: String,
    pub data: RelationData,
}

/// The model this unit runs in: leadership, relations and status reporting.
#[async_trait::async_trait]
pub trait Model: Send + Sync {
    async fn is_leader(&self) -> anyhow::Result<bool>;

    /// Indicates whether the peer relation (and thus the shared registry) exists.
    async fn has_peers(&self) -> anyhow::Result<bool>;

    /// Lists the active `auth-proxy` relations.
    async fn upstream_relation_ids(&self) -> anyhow::Result<Vec<RelationId>>;

    /// Looks up an active `auth-proxy` relation. Returns `None` once the relation is gone.
    async fn lookup_upstream(
        &self,
        relation_id: RelationId,
    ) -> anyhow::Result<Option<UpstreamRelation>>;

    /// Reads the identity provider's endpoints; both are absent without an identity provider.
    async fn identity_endpoints(&self) -> anyhow::Result<IdentityEndpoints>;

    async fn set_status(&self, status: UnitStatus) -> anyhow::Result<()>;

    /// Publishes this application's data on an `oathkeeper-info` relation.
    async fn publish_info(
        &self,
        relation_id: RelationId,
        info: BTreeMap<String, String>,
    ) -> anyhow::Result<()>;
}

// === impl UnitStatus ===

impl UnitStatus {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Maintenance(_) => "maintenance",
            Self::Waiting(_) => "waiting",
            Self::Blocked(_) => "blocked",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Active => "",
            Self::Maintenance(msg) | Self::Waiting(msg) | Self::Blocked(msg) => msg,
        }
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => f.write_str("active"),
            status => write!(f, "{}: {}", status.name(), status.message()),
        }
    }
}
