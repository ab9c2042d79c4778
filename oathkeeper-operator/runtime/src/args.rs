use crate::{
    deferred::DeferredQueue,
    dispatch::{Action, Dispatch},
    juju::{self, HookTools},
    k8s::Labels,
    pebble::Pebble,
    reconcile::{
        actions::{RuleActions, DEFAULT_LIST_LIMIT},
        reconciler::SERVICE_NAME,
        ArtifactStore, Event, Model, Reconciler, RetryConfig, Settings, WorkloadFiles,
    },
    service,
    store::ConfigMapStore,
};
use anyhow::{Context, Result};
use clap::Parser;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tracing::{debug, info, info_span, Instrument};

/// Holds the service configuration.
const CONFIG_CONFIGMAP: &str = "oathkeeper-config";

/// Holds one key per rule artifact.
const RULES_CONFIGMAP: &str = "access-rules";

const DEFERRED_FILE: &str = "deferred.json";

#[derive(Debug, Parser)]
#[clap(
    name = "oathkeeper-operator",
    about = "Manages Oathkeeper access rules for a Juju application"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "oathkeeper=info,warn",
        env = "OATHKEEPER_OPERATOR_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    /// The Kubernetes namespace the model is deployed in.
    #[clap(long, env = "JUJU_MODEL_NAME")]
    namespace: String,

    #[clap(long, env = "JUJU_UNIT_NAME")]
    unit_name: String,

    /// The hook or action being dispatched, e.g. `hooks/install`.
    #[clap(long, env = "JUJU_DISPATCH_PATH")]
    dispatch_path: String,

    #[clap(long, env = "JUJU_RELATION_ID")]
    relation_id: Option<String>,

    /// Where rule artifacts and the service configuration are stored.
    #[clap(long, value_enum, default_value = "configmap")]
    storage: Storage,

    /// The service configuration directory in the workload container.
    #[clap(long, default_value = "/etc/config")]
    workload_config_dir: String,

    /// The rule artifact directory in the workload container.
    #[clap(long, default_value = "/etc/config/oathkeeper")]
    workload_access_rules_dir: String,

    #[clap(long, default_value = "/charm/containers/oathkeeper/pebble.socket")]
    pebble_socket: PathBuf,

    /// Holds state that must survive between invocations, like deferred events.
    #[clap(long, default_value = ".oathkeeper-operator")]
    state_dir: PathBuf,

    #[clap(long, default_value = "5")]
    retry_attempts: u32,

    #[clap(long, default_value = "500")]
    retry_initial_delay_ms: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
enum Storage {
    /// Kubernetes ConfigMaps shared by every unit.
    Configmap,

    /// Files pushed into the workload container; local to each unit.
    Files,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            namespace,
            unit_name,
            dispatch_path,
            relation_id,
            storage,
            workload_config_dir,
            workload_access_rules_dir,
            pebble_socket,
            state_dir,
            retry_attempts,
            retry_initial_delay_ms,
        } = self;

        log_format.try_init(log_level)?;

        let dispatch = Dispatch::parse(&dispatch_path, relation_id.as_deref())?;
        let app_name = juju::app_name(&unit_name).to_string();
        let tools = Arc::new(HookTools::new(&app_name));
        let workload = Arc::new(Pebble::new(pebble_socket, SERVICE_NAME));

        let event = match dispatch {
            Dispatch::Ignored => {
                debug!(%dispatch_path, "Nothing to do");
                return Ok(());
            }
            Dispatch::Action(action) => {
                return run_action(action, &tools, RuleActions::new(workload))
                    .instrument(info_span!("action", %dispatch_path))
                    .await;
            }
            Dispatch::Event(event) => event,
        };

        let client = client
            .try_client()
            .await
            .context("failed to build a Kubernetes client")?;
        if event == Event::Install && tools.is_leader().await? {
            service::expose_api_port(client.clone(), &namespace, &app_name).await?;
        }

        let (rules, config): (Arc<dyn ArtifactStore>, Arc<dyn ArtifactStore>) = match storage {
            Storage::Configmap => {
                let labels = Labels::managed(&app_name);
                let rules = ConfigMapStore::new(
                    client.clone(),
                    &namespace,
                    RULES_CONFIGMAP,
                    labels.clone(),
                    &workload_access_rules_dir,
                );
                let config = ConfigMapStore::new(
                    client,
                    &namespace,
                    CONFIG_CONFIGMAP,
                    labels,
                    &workload_config_dir,
                );
                (Arc::new(rules), Arc::new(config))
            }
            Storage::Files => (
                Arc::new(WorkloadFiles::new(
                    workload.clone(),
                    workload_access_rules_dir,
                )),
                Arc::new(WorkloadFiles::new(workload.clone(), workload_config_dir)),
            ),
        };

        let settings = Settings {
            app_name,
            namespace,
            rules_configmap_name: RULES_CONFIGMAP.to_string(),
            retry: RetryConfig {
                max_attempts: retry_attempts,
                initial_delay: Duration::from_millis(retry_initial_delay_ms),
                ..Default::default()
            },
        };
        let reconciler = Reconciler::new(
            settings,
            tools.clone(),
            workload,
            tools,
            rules,
            config,
        );

        let mut queue = DeferredQueue::load(state_dir.join(DEFERRED_FILE)).await?;
        if !queue.events().is_empty() {
            info!(deferred = queue.events().len(), "Re-running deferred events");
        }
        queue
            .run(&reconciler, Some(event))
            .instrument(info_span!("hook", %dispatch_path, %unit_name))
            .await
    }
}

async fn run_action(action: Action, tools: &HookTools, actions: RuleActions) -> Result<()> {
    let res = match action {
        Action::ListRules => {
            let limit = match tools.action_get("limit").await? {
                Some(value) => parse_limit(&value)?,
                None => DEFAULT_LIST_LIMIT,
            };
            tools.action_log("Fetching access rules").await?;
            actions.list_rules(limit).await
        }
        Action::GetRule => {
            let rule_id = match tools.action_get("rule-id").await? {
                Some(serde_json::Value::String(id)) => id,
                other => anyhow::bail!("invalid rule-id parameter: {other:?}"),
            };
            tools
                .action_log(&format!("Getting rule: {rule_id}"))
                .await?;
            actions.get_rule(&rule_id).await
        }
    };

    match res {
        Ok(results) => {
            tools.action_log("Action succeeded").await?;
            tools.action_set(&results).await
        }
        Err(error) => {
            info!(%error, "Action failed");
            tools.action_fail(&error.to_string()).await
        }
    }
}

fn parse_limit(value: &serde_json::Value) -> Result<u32> {
    match value {
        serde_json::Value::Number(n) => n
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .with_context(|| format!("invalid limit {n}")),
        serde_json::Value::String(s) => s.parse().with_context(|| format!("invalid limit {s}")),
        serde_json::Value::Null => Ok(DEFAULT_LIST_LIMIT),
        other => anyhow::bail!("invalid limit {other}"),
    }
}
