//! Operator actions that query the running Oathkeeper service through its CLI.

use crate::workload::{Workload, WorkloadError};
use oathkeeper_operator_core::OATHKEEPER_API_PORT;
use serde::Deserialize;
use serde_json::Value;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_LIST_LIMIT: u32 = 20;

const EXEC_TIMEOUT: Duration = Duration::from_secs(20);
const RULE_NOT_FOUND: &str = "Could not get rule";

pub struct RuleActions {
    workload: Arc<dyn Workload>,
    endpoint: String,
}

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("Service is not ready. Please re-run the action when the charm is active")]
    NotReady,

    #[error("Rule not found")]
    NotFound,

    #[error("Exited with code: {code}. Stderr: {stderr}")]
    Exec { code: i32, stderr: String },

    #[error("Something went wrong when trying to run the command: {0}")]
    Command(String),
}

#[derive(Debug, Deserialize)]
struct ListedRule {
    id: String,
}

// === impl RuleActions ===

impl RuleActions {
    pub fn new(workload: Arc<dyn Workload>) -> Self {
        Self {
            workload,
            endpoint: format!("http://localhost:{OATHKEEPER_API_PORT}"),
        }
    }

    /// Lists the ids of the rules Oathkeeper has loaded, keyed by position.
    pub async fn list_rules(&self, limit: u32) -> Result<BTreeMap<String, String>, ActionError> {
        self.ensure_running().await?;

        let limit = limit.to_string();
        let command: [&str; 7] = [
            "oathkeeper",
            "rules",
            "list",
            "--endpoint",
            &self.endpoint,
            "--limit",
            &limit,
        ];
        let stdout = self.run(&command).await.map_err(command_error)?;
        let rules = serde_json::from_str::<Vec<ListedRule>>(&stdout)
            .map_err(|error| ActionError::Command(error.to_string()))?;

        Ok(rules
            .into_iter()
            .enumerate()
            .map(|(i, rule)| (i.to_string(), rule.id))
            .collect())
    }

    /// Fetches a single rule, flattened into dotted keys.
    pub async fn get_rule(&self, rule_id: &str) -> Result<BTreeMap<String, String>, ActionError> {
        self.ensure_running().await?;

        let command: [&str; 6] = [
            "oathkeeper",
            "rules",
            "get",
            rule_id,
            "--endpoint",
            &self.endpoint,
        ];
        let stdout = match self.run(&command).await {
            Ok(stdout) => stdout,
            Err(WorkloadError::Exec { stderr, .. }) if stderr.contains(RULE_NOT_FOUND) => {
                debug!(%rule_id, "No such rule");
                return Err(ActionError::NotFound);
            }
            Err(WorkloadError::Exec { code, stderr }) => {
                return Err(ActionError::Exec { code, stderr });
            }
            Err(error) => return Err(command_error(error)),
        };
        let rule = serde_json::from_str::<Value>(&stdout)
            .map_err(|error| ActionError::Command(error.to_string()))?;
        Ok(flatten(&rule))
    }

    async fn ensure_running(&self) -> Result<(), ActionError> {
        if !self.workload.is_running().await {
            return Err(ActionError::NotReady);
        }
        Ok(())
    }

    async fn run(&self, command: &[&str]) -> Result<String, WorkloadError> {
        debug!(?command, "Running command");
        let command = command.iter().map(ToString::to_string).collect::<Vec<_>>();
        self.workload.exec(&command, EXEC_TIMEOUT).await
    }
}

fn command_error(error: WorkloadError) -> ActionError {
    ActionError::Command(error.to_string())
}

/// Flattens a JSON value into dotted keys, indexing array elements by position.
///
/// Scalars at the top level are keyed by the empty string.
pub fn flatten(value: &Value) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    flatten_into(String::new(), value, &mut out);
    out
}

fn flatten_into(prefix: String, value: &Value, out: &mut BTreeMap<String, String>) {
    let child = |key: &str| {
        if prefix.is_empty() {
            key.to_string()
        } else {
            format!("{prefix}.{key}")
        }
    };

    match value {
        Value::Object(map) => {
            for (key, value) in map {
                flatten_into(child(key), value, out);
            }
        }
        Value::Array(values) => {
            for (i, value) in values.iter().enumerate() {
                flatten_into(child(&i.to_string()), value, out);
            }
        }
        Value::String(s) => {
            out.insert(prefix, s.clone());
        }
        Value::Null => {
            out.insert(prefix, String::new());
        }
        other => {
            out.insert(prefix, other.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;
    use pretty_assertions::assert_eq;

    #[test]
    fn flattens_rules() {
        let rule = serde_json::json!({
            "id": "requirer:0:deny",
            "match": {
                "url": "<https|http>://example.com/<.*>",
                "methods": ["GET", "POST"],
            },
            "authenticators": [{"handler": "cookie_session"}],
            "authorizer": {"handler": "allow"},
            "upstream": {"preserve_host": false, "url": null},
        });

        assert_eq!(
            flatten(&rule),
            btreemap! {
                "id".to_string() => "requirer:0:deny".to_string(),
                "match.url".to_string() => "<https|http>://example.com/<.*>".to_string(),
                "match.methods.0".to_string() => "GET".to_string(),
                "match.methods.1".to_string() => "POST".to_string(),
                "authenticators.0.handler".to_string() => "cookie_session".to_string(),
                "authorizer.handler".to_string() => "allow".to_string(),
                "upstream.preserve_host".to_string() => "false".to_string(),
                "upstream.url".to_string() => "".to_string(),
            }
        );
    }

    #[test]
    fn formats_action_errors() {
        assert_eq!(ActionError::NotFound.to_string(), "Rule not found");
        assert_eq!(
            ActionError::Exec {
                code: 1,
                stderr: "boom".to_string()
            }
            .to_string(),
            "Exited with code: 1. Stderr: boom"
        );
        assert_eq!(
            ActionError::NotReady.to_string(),
            "Service is not ready. Please re-run the action when the charm is active"
        );
    }
}
