use crate::{
    model::{Model, UnitStatus},
    registry::{PeerData, Registry, RegistryError},
    retry::{retry_with_backoff, RetryConfig},
    store::{ArtifactStore, StoreError},
    workload::{Layer, Workload, WorkloadError},
};
use oathkeeper_operator_core::{
    config,
    rule::{artifact_name, RuleKind},
    synthesize, ArtifactNames, InvalidUpstream, ProtectedUpstream, RelationId,
    OATHKEEPER_API_PORT,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
};
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// The name of the Pebble service that runs Oathkeeper.
pub const SERVICE_NAME: &str = "oathkeeper";

/// The name of the service configuration artifact.
pub const CONFIG_NAME: &str = "oathkeeper.yaml";

const WAITING_FOR_CONTAINER: &str = "Waiting to connect to Oathkeeper container";
const WAITING_FOR_SERVICE: &str = "Waiting for Oathkeeper service";
const WAITING_FOR_PEERS: &str = "Waiting for peer relation";
const CONFIGURING: &str = "Configuring the container";
const RESTART_FAILED: &str = "Failed to restart the container, please consult the logs";

/// Artifact names recorded per `auth-proxy` relation.
type Entries = BTreeMap<RelationId, Vec<String>>;

#[derive(Clone, Debug)]
pub struct Settings {
    pub app_name: String,
    pub namespace: String,

    /// Advertised to `oathkeeper-info` requirers.
    pub rules_configmap_name: String,

    pub retry: RetryConfig,
}

/// Brings rule artifacts, the service configuration and the workload in line with the model.
pub struct Reconciler {
    settings: Settings,
    model: Arc<dyn Model>,
    workload: Arc<dyn Workload>,
    registry: Registry,
    rules: Arc<dyn ArtifactStore>,
    config: Arc<dyn ArtifactStore>,
}

/// A lifecycle event to reconcile.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum Event {
    Install,
    Remove,
    WorkloadReady,
    IdentityChanged,
    UpstreamChanged { relation_id: RelationId },
    UpstreamRemoved { relation_id: RelationId },
    InfoRequested { relation_id: RelationId },
    PeersChanged,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Applied,

    /// Nothing to do on this unit.
    Skipped,

    /// A precondition is not met; the event must be redelivered later.
    Deferred(&'static str),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("relation {relation_id} has invalid auth-proxy data: {source}")]
    Invalid {
        relation_id: RelationId,
        #[source]
        source: InvalidUpstream,
    },

    #[error("failed to render access rules: {0}")]
    Render(#[source] serde_json::Error),

    #[error("failed to render the service configuration: {0}")]
    RenderConfig(#[source] serde_yaml::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("failed to apply the workload layer: {0}")]
    Layer(#[source] WorkloadError),

    #[error("failed to restart the workload: {0}")]
    Restart(#[source] WorkloadError),

    #[error(transparent)]
    Model(#[from] anyhow::Error),
}

// === impl Reconciler ===

impl Reconciler {
    pub fn new(
        settings: Settings,
        model: Arc<dyn Model>,
        workload: Arc<dyn Workload>,
        peers: Arc<dyn PeerData>,
        rules: Arc<dyn ArtifactStore>,
        config: Arc<dyn ArtifactStore>,
    ) -> Self {
        Self {
            settings,
            model,
            workload,
            registry: Registry::new(peers),
            rules,
            config,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Reconciles a single event to completion.
    pub async fn handle(&self, event: &Event) -> Result<Outcome, Error> {
        let span = info_span!("reconcile", %event);
        async {
            let outcome = match *event {
                Event::Install => self.install().await,
                Event::Remove => self.remove().await,
                Event::WorkloadReady | Event::IdentityChanged => self.configure_workload().await,
                Event::UpstreamChanged { relation_id } => self.apply_upstream(relation_id).await,
                Event::UpstreamRemoved { relation_id } => self.remove_upstream(relation_id).await,
                Event::InfoRequested { relation_id } => self.publish_info(relation_id).await,
                Event::PeersChanged => self.sync_from_peers().await,
            }?;
            debug!(?outcome);
            Ok(outcome)
        }
        .instrument(span)
        .await
    }

    async fn install(&self) -> Result<Outcome, Error> {
        let leader = self.model.is_leader().await?;
        let mut outcome = Outcome::Skipped;
        for store in [&self.rules, &self.config] {
            if may_write(&**store, leader) {
                retry_with_backoff(&self.settings.retry, "ensure artifact store", || {
                    store.ensure()
                })
                .await?;
                outcome = Outcome::Applied;
            }
        }
        Ok(outcome)
    }

    async fn remove(&self) -> Result<Outcome, Error> {
        let leader = self.model.is_leader().await?;
        let mut outcome = Outcome::Skipped;
        for store in [&self.rules, &self.config] {
            if may_write(&**store, leader) {
                retry_with_backoff(&self.settings.retry, "tear down artifact store", || {
                    store.teardown()
                })
                .await?;
                outcome = Outcome::Applied;
            }
        }
        Ok(outcome)
    }

    /// Installs the workload layer, refreshes the service configuration and restarts the
    /// service.
    async fn configure_workload(&self) -> Result<Outcome, Error> {
        if !self.workload.can_connect().await {
            info!("Cannot connect to the Oathkeeper container; deferring");
            self.set_status(UnitStatus::Waiting(WAITING_FOR_CONTAINER.to_string()))
                .await?;
            return Ok(Outcome::Deferred(WAITING_FOR_CONTAINER));
        }

        self.set_status(UnitStatus::Maintenance(CONFIGURING.to_string()))
            .await?;

        let layer = Layer::oathkeeper(
            SERVICE_NAME,
            &self.config.location(CONFIG_NAME),
            OATHKEEPER_API_PORT,
        );
        retry_with_backoff(&self.settings.retry, "add layer", || {
            self.workload.add_layer(&layer)
        })
        .await
        .map_err(Error::Layer)?;

        let leader = self.model.is_leader().await?;
        if may_write(&*self.config, leader) {
            let (live, orphaned) = self.partition_entries().await?;
            self.prune(&orphaned, &live, leader).await?;
            self.push_config(&artifact_names(live)).await?;
        }

        self.restart().await?;
        self.set_status(UnitStatus::Active).await?;
        Ok(Outcome::Applied)
    }

    /// Replaces the rule artifacts of a single relation with those derived from its current
    /// data.
    async fn apply_upstream(&self, relation_id: RelationId) -> Result<Outcome, Error> {
        if let Some(reason) = self.check_preconditions().await? {
            return Ok(Outcome::Deferred(reason));
        }

        let leader = self.model.is_leader().await?;
        if !may_write(&*self.rules, leader) {
            debug!(relation_id, "Not the leader; skipping");
            return Ok(Outcome::Skipped);
        }

        let Some(relation) = self.model.lookup_upstream(relation_id).await? else {
            debug!(relation_id, "Relation no longer exists");
            return Ok(Outcome::Skipped);
        };
        let app = relation.app_name.as_str();
        let upstream = match ProtectedUpstream::from_relation_data(relation_id, app, &relation.data)
        {
            Ok(Some(upstream)) => upstream,
            Ok(None) => {
                debug!(relation_id, %app, "No auth-proxy data yet");
                return Ok(Outcome::Skipped);
            }
            Err(source) => {
                warn!(relation_id, %app, error = %source, "Rejecting auth-proxy data");
                return Err(Error::Invalid {
                    relation_id,
                    source,
                });
            }
        };

        let artifacts = synthesize(&upstream)
            .into_artifacts(&upstream.app_name)
            .map_err(Error::Render)?;
        let names = artifacts.iter().collect::<ArtifactNames>();
        let previous = self.registry.lookup(relation_id).await?.unwrap_or_default();

        for artifact in &artifacts {
            retry_with_backoff(&self.settings.retry, "write access rules", || {
                self.rules.write(&artifact.name, &artifact.content)
            })
            .await?;
            info!(relation_id, artifact = %artifact.name, "Wrote access rules");
        }

        if leader {
            self.registry.record(relation_id, &names).await?;
        }

        // Anything previously recorded for this relation, or that this application could have
        // produced, but that is not part of the new set.
        let candidates = [RuleKind::Allow, RuleKind::Deny]
            .map(|kind| artifact_name(&upstream.app_name, kind));
        let stale = previous
            .into_iter()
            .chain(candidates)
            .filter(|name| !names.contains(name))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect::<Vec<_>>();
        if !stale.is_empty() {
            retry_with_backoff(&self.settings.retry, "delete stale access rules", || {
                self.rules.delete(&stale)
            })
            .await?;
            debug!(relation_id, ?stale, "Deleted stale access rules");
        }

        let (mut live, mut orphaned) = self.partition_entries().await?;
        orphaned.remove(&relation_id);
        if names.is_empty() {
            live.remove(&relation_id);
        } else {
            live.insert(relation_id, names.to_vec());
        }
        self.prune(&orphaned, &live, leader).await?;
        self.push_config(&artifact_names(live)).await?;

        self.restart().await?;
        self.set_status(UnitStatus::Active).await?;
        Ok(Outcome::Applied)
    }

    /// Deletes the rule artifacts recorded for a relation that has been removed.
    async fn remove_upstream(&self, relation_id: RelationId) -> Result<Outcome, Error> {
        if let Some(reason) = self.check_preconditions().await? {
            return Ok(Outcome::Deferred(reason));
        }

        let leader = self.model.is_leader().await?;
        if !may_write(&*self.rules, leader) {
            debug!(relation_id, "Not the leader; skipping");
            return Ok(Outcome::Skipped);
        }

        let Some(names) = self.registry.lookup(relation_id).await? else {
            info!(relation_id, "No access rules recorded for relation");
            return Ok(Outcome::Skipped);
        };

        // The relation may still be listed while its removal is being handled.
        let (mut live, mut orphaned) = self.partition_entries().await?;
        live.remove(&relation_id);
        orphaned.insert(relation_id, names);
        self.prune(&orphaned, &live, leader).await?;
        self.push_config(&artifact_names(live)).await?;

        self.restart().await?;
        self.set_status(UnitStatus::Active).await?;
        Ok(Outcome::Applied)
    }

    async fn publish_info(&self, relation_id: RelationId) -> Result<Outcome, Error> {
        if !self.model.is_leader().await? {
            return Ok(Outcome::Skipped);
        }

        let Settings {
            app_name,
            namespace,
            rules_configmap_name,
            ..
        } = &self.settings;
        let info = [
            (
                "public_endpoint",
                format!("http://{app_name}.{namespace}.svc.cluster.local:{OATHKEEPER_API_PORT}"),
            ),
            ("rules_configmap_name", rules_configmap_name.clone()),
            ("configmaps_namespace", namespace.clone()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect::<BTreeMap<_, _>>();

        self.model.publish_info(relation_id, info).await?;
        info!(relation_id, "Published oathkeeper info");
        Ok(Outcome::Applied)
    }

    /// Recomposes a unit-local configuration from the shared registry. Only followers with a
    /// unit-local store have anything to do here.
    async fn sync_from_peers(&self) -> Result<Outcome, Error> {
        if self.config.is_shared() || self.model.is_leader().await? {
            return Ok(Outcome::Skipped);
        }
        if !self.workload.can_connect().await {
            self.set_status(UnitStatus::Waiting(WAITING_FOR_CONTAINER.to_string()))
                .await?;
            return Ok(Outcome::Deferred(WAITING_FOR_CONTAINER));
        }

        let (live, orphaned) = self.partition_entries().await?;
        self.prune(&orphaned, &live, false).await?;
        self.push_config(&artifact_names(live)).await?;
        self.restart().await?;
        self.set_status(UnitStatus::Active).await?;
        Ok(Outcome::Applied)
    }

    /// Checked before anything is written on behalf of an `auth-proxy` relation.
    async fn check_preconditions(&self) -> Result<Option<&'static str>, Error> {
        let reason = if !self.workload.can_connect().await {
            Some(WAITING_FOR_SERVICE)
        } else if !self.model.has_peers().await? {
            Some(WAITING_FOR_PEERS)
        } else {
            None
        };

        if let Some(reason) = reason {
            info!(%reason, "Deferring");
            self.set_status(UnitStatus::Waiting(reason.to_string()))
                .await?;
        }
        Ok(reason)
    }

    /// Splits the registry into the entries of active `auth-proxy` relations and orphans whose
    /// relation is gone, e.g. because a follower handled its removal.
    async fn partition_entries(&self) -> Result<(Entries, Entries), Error> {
        let active = self.model.upstream_relation_ids().await?;
        let entries = self.registry.entries().await?;
        Ok(entries
            .into_iter()
            .partition(|(relation_id, _)| active.contains(relation_id)))
    }

    /// Deletes the artifacts of orphaned entries that no live entry still uses. Only the leader
    /// forgets the entries themselves.
    async fn prune(&self, orphaned: &Entries, live: &Entries, leader: bool) -> Result<(), Error> {
        if orphaned.is_empty() || !may_write(&*self.rules, leader) {
            return Ok(());
        }

        let in_use = live.values().flatten().collect::<BTreeSet<_>>();
        let names = orphaned
            .values()
            .flatten()
            .filter(|name| !in_use.contains(name))
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect::<Vec<_>>();
        if !names.is_empty() {
            retry_with_backoff(&self.settings.retry, "delete access rules", || {
                self.rules.delete(&names)
            })
            .await?;
        }

        if leader {
            for relation_id in orphaned.keys() {
                self.registry.forget(*relation_id).await?;
            }
        }
        info!(
            relations = ?orphaned.keys().collect::<Vec<_>>(),
            artifacts = ?names,
            "Deleted access rules of removed relations"
        );
        Ok(())
    }

    /// Renders the service configuration over the given rule artifacts and writes it.
    async fn push_config(&self, names: &[String]) -> Result<(), Error> {
        let identity = self.model.identity_endpoints().await?;
        let locations = names
            .iter()
            .map(|name| self.rules.location(name))
            .collect::<Vec<_>>();
        let yaml = config::compose(&identity, &locations)
            .to_yaml()
            .map_err(Error::RenderConfig)?;

        retry_with_backoff(&self.settings.retry, "write service config", || {
            self.config.write(CONFIG_NAME, &yaml)
        })
        .await?;
        info!(repositories = locations.len(), "Updated service configuration");
        Ok(())
    }

    async fn restart(&self) -> Result<(), Error> {
        let res = retry_with_backoff(&self.settings.retry, "restart workload", || {
            self.workload.restart()
        })
        .await;
        if let Err(error) = res {
            error!(%error, "Failed to restart the container");
            self.set_status(UnitStatus::Blocked(RESTART_FAILED.to_string()))
                .await?;
            return Err(Error::Restart(error));
        }
        Ok(())
    }

    async fn set_status(&self, status: UnitStatus) -> Result<(), Error> {
        self.model.set_status(status).await?;
        Ok(())
    }
}

/// Every artifact name of the given entries, ordered by relation id. A name shared by two
/// relations of the same application is listed once.
fn artifact_names(entries: Entries) -> Vec<String> {
    let mut seen = BTreeSet::new();
    entries
        .into_values()
        .flatten()
        .filter(|name| seen.insert(name.clone()))
        .collect()
}

/// Shared stores are written by the leader only; unit-local stores by every unit.
fn may_write(store: &dyn ArtifactStore, leader: bool) -> bool {
    leader || !store.is_shared()
}

// === impl Event ===

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Install => f.write_str("install"),
            Self::Remove => f.write_str("remove"),
            Self::WorkloadReady => f.write_str("workload-ready"),
            Self::IdentityChanged => f.write_str("identity-changed"),
            Self::UpstreamChanged { relation_id } => write!(f, "upstream-changed:{relation_id}"),
            Self::UpstreamRemoved { relation_id } => write!(f, "upstream-removed:{relation_id}"),
            Self::InfoRequested { relation_id } => write!(f, "info-requested:{relation_id}"),
            Self::PeersChanged => f.write_str("peers-changed"),
        }
    }
}

// === impl Error ===

impl Error {
    /// Fatal errors fail the hook so that it is retried. Invalid requirer data and restart
    /// failures are reported through logs and status instead.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Invalid { .. } | Self::Restart(_))
    }
}
