//! Access to the Juju model through the hook tools available to a charm process.

use anyhow::{bail, Context, Result};
use oathkeeper_operator_core::{IdentityEndpoints, RelationData, RelationId};
use oathkeeper_operator_reconcile::{Model, PeerData, UnitStatus, UpstreamRelation};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use tokio::process::Command;
use tracing::{debug, trace};

/// The peer relation shared by all units of this application.
pub const PEER_RELATION: &str = "oathkeeper";
pub const AUTH_PROXY_RELATION: &str = "auth-proxy";
pub const KRATOS_INFO_RELATION: &str = "kratos-endpoint-info";
pub const OATHKEEPER_INFO_RELATION: &str = "oathkeeper-info";

const LOGIN_URL_KEY: &str = "login_browser_endpoint";
const SESSION_CHECK_URL_KEY: &str = "sessions_endpoint";

#[derive(Clone, Debug)]
pub struct HookTools {
    app_name: String,
}

// === impl HookTools ===

impl HookTools {
    pub fn new(app_name: impl ToString) -> Self {
        Self {
            app_name: app_name.to_string(),
        }
    }

    async fn run(&self, tool: &str, args: &[&str]) -> Result<String> {
        trace!(%tool, ?args, "Running hook tool");
        let output = Command::new(tool)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to run {tool}"))?;
        if !output.status.success() {
            bail!(
                "{tool} failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        String::from_utf8(output.stdout).with_context(|| format!("{tool} output is not UTF-8"))
    }

    async fn run_json<T: DeserializeOwned>(&self, tool: &str, args: &[&str]) -> Result<T> {
        let stdout = self.run(tool, args).await?;
        serde_json::from_str(&stdout).with_context(|| format!("failed to decode {tool} output"))
    }

    async fn relation_ids(&self, endpoint: &str) -> Result<Vec<RelationId>> {
        let ids: Option<Vec<String>> = self
            .run_json("relation-ids", &[endpoint, "--format=json"])
            .await?;
        ids.unwrap_or_default()
            .iter()
            .map(|id| parse_relation_id(id).with_context(|| format!("invalid relation id {id}")))
            .collect()
    }

    async fn remote_app(&self, endpoint: &str, relation_id: RelationId) -> Result<Option<String>> {
        let relation = relation_ref(endpoint, relation_id);
        let app: Option<String> = self
            .run_json("relation-list", &["-r", &relation, "--app", "--format=json"])
            .await?;
        Ok(app.filter(|app| !app.is_empty()))
    }

    async fn app_data(
        &self,
        endpoint: &str,
        relation_id: RelationId,
        app: &str,
    ) -> Result<RelationData> {
        let relation = relation_ref(endpoint, relation_id);
        let data: Option<RelationData> = self
            .run_json(
                "relation-get",
                &["-r", &relation, "--app", "--format=json", "-", app],
            )
            .await?;
        Ok(data.unwrap_or_default())
    }

    async fn set_app_data(
        &self,
        endpoint: &str,
        relation_id: RelationId,
        data: impl IntoIterator<Item = (String, String)>,
    ) -> Result<()> {
        let relation = relation_ref(endpoint, relation_id);
        let pairs = data
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>();
        let mut args = vec!["-r", relation.as_str(), "--app"];
        args.extend(pairs.iter().map(String::as_str));
        self.run("relation-set", &args).await?;
        Ok(())
    }

    async fn peer_relation(&self) -> Result<Option<RelationId>> {
        Ok(self.relation_ids(PEER_RELATION).await?.first().copied())
    }

    /// Reads an action parameter.
    pub async fn action_get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        self.run_json("action-get", &[key, "--format=json"]).await
    }

    pub async fn action_set(&self, results: &BTreeMap<String, String>) -> Result<()> {
        if results.is_empty() {
            return Ok(());
        }
        let pairs = results
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>();
        let args = pairs.iter().map(String::as_str).collect::<Vec<_>>();
        self.run("action-set", &args).await?;
        Ok(())
    }

    pub async fn action_fail(&self, message: &str) -> Result<()> {
        self.run("action-fail", &[message]).await?;
        Ok(())
    }

    pub async fn action_log(&self, message: &str) -> Result<()> {
        self.run("action-log", &[message]).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Model for HookTools {
    async fn is_leader(&self) -> Result<bool> {
        self.run_json("is-leader", &["--format=json"]).await
    }

    async fn has_peers(&self) -> Result<bool> {
        Ok(self.peer_relation().await?.is_some())
    }

    async fn upstream_relation_ids(&self) -> Result<Vec<RelationId>> {
        self.relation_ids(AUTH_PROXY_RELATION).await
    }

    async fn lookup_upstream(&self, relation_id: RelationId) -> Result<Option<UpstreamRelation>> {
        if !self.upstream_relation_ids().await?.contains(&relation_id) {
            return Ok(None);
        }
        let Some(app_name) = self.remote_app(AUTH_PROXY_RELATION, relation_id).await? else {
            return Ok(None);
        };
        let data = self
            .app_data(AUTH_PROXY_RELATION, relation_id, &app_name)
            .await?;
        Ok(Some(UpstreamRelation { app_name, data }))
    }

    async fn identity_endpoints(&self) -> Result<IdentityEndpoints> {
        let Some(relation_id) = self
            .relation_ids(KRATOS_INFO_RELATION)
            .await?
            .first()
            .copied()
        else {
            return Ok(IdentityEndpoints::default());
        };
        let Some(app) = self.remote_app(KRATOS_INFO_RELATION, relation_id).await? else {
            return Ok(IdentityEndpoints::default());
        };
        let mut data = self
            .app_data(KRATOS_INFO_RELATION, relation_id, &app)
            .await?;
        Ok(IdentityEndpoints {
            login_url: data.remove(LOGIN_URL_KEY),
            session_check_url: data.remove(SESSION_CHECK_URL_KEY),
        })
    }

    async fn set_status(&self, status: UnitStatus) -> Result<()> {
        debug!(%status, "Setting unit status");
        self.run("status-set", &[status.name(), status.message()])
            .await?;
        Ok(())
    }

    async fn publish_info(
        &self,
        relation_id: RelationId,
        info: BTreeMap<String, String>,
    ) -> Result<()> {
        self.set_app_data(OATHKEEPER_INFO_RELATION, relation_id, info)
            .await
    }
}

#[async_trait::async_trait]
impl PeerData for HookTools {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let Some(relation_id) = self.peer_relation().await? else {
            return Ok(None);
        };
        let mut data = self
            .app_data(PEER_RELATION, relation_id, &self.app_name)
            .await?;
        Ok(data.remove(key))
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        let Some(relation_id) = self.peer_relation().await? else {
            bail!("peer relation is not established");
        };
        self.set_app_data(PEER_RELATION, relation_id, [(key.to_string(), value)])
            .await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let Some(relation_id) = self.peer_relation().await? else {
            return Ok(());
        };
        // Setting an empty value removes the key.
        self.set_app_data(PEER_RELATION, relation_id, [(key.to_string(), String::new())])
            .await
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let Some(relation_id) = self.peer_relation().await? else {
            return Ok(Vec::new());
        };
        let data = self
            .app_data(PEER_RELATION, relation_id, &self.app_name)
            .await?;
        Ok(data.into_keys().collect())
    }
}

/// Parses a relation id as Juju presents it (`<endpoint>:<id>`). A bare id is accepted too.
pub fn parse_relation_id(s: &str) -> Option<RelationId> {
    let id = s.rsplit_once(':').map_or(s, |(_, id)| id);
    id.parse().ok()
}

fn relation_ref(endpoint: &str, relation_id: RelationId) -> String {
    format!("{endpoint}:{relation_id}")
}

/// Derives the application name from a unit name such as `oathkeeper/0`.
pub fn app_name(unit_name: &str) -> &str {
    unit_name.split_once('/').map_or(unit_name, |(app, _)| app)
}
