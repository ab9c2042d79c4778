use crate::juju::{
    parse_relation_id, AUTH_PROXY_RELATION, KRATOS_INFO_RELATION, OATHKEEPER_INFO_RELATION,
    PEER_RELATION,
};
use oathkeeper_operator_reconcile::Event;
use thiserror::Error;

/// The pebble-ready hook is named after the workload container.
const CONTAINER_NAME: &str = "oathkeeper";

/// What a single invocation has been asked to do.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Dispatch {
    Event(Event),
    Action(Action),

    /// A hook this operator does not observe.
    Ignored,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Action {
    ListRules,
    GetRule,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("{0} requires a relation id")]
    MissingRelation(String),

    #[error("invalid relation id {0:?}")]
    InvalidRelation(String),
}

// === impl Dispatch ===

impl Dispatch {
    /// Resolves a dispatch path (e.g. `hooks/auth-proxy-relation-changed`) and, for relation
    /// hooks, the relation id Juju passes alongside it.
    pub fn parse(path: &str, relation_id: Option<&str>) -> Result<Self, DispatchError> {
        if let Some(action) = path.strip_prefix("actions/") {
            return Ok(match action {
                "list-rules" => Self::Action(Action::ListRules),
                "get-rule" => Self::Action(Action::GetRule),
                _ => Self::Ignored,
            });
        }

        let Some(hook) = path.strip_prefix("hooks/") else {
            return Ok(Self::Ignored);
        };
        match hook {
            "install" => return Ok(Self::Event(Event::Install)),
            "remove" => return Ok(Self::Event(Event::Remove)),
            _ => {}
        }
        if hook.strip_suffix("-pebble-ready") == Some(CONTAINER_NAME) {
            return Ok(Self::Event(Event::WorkloadReady));
        }

        let Some((endpoint, kind)) = hook.rsplit_once("-relation-") else {
            return Ok(Self::Ignored);
        };
        let relation = || {
            let id = relation_id.ok_or_else(|| DispatchError::MissingRelation(hook.to_string()))?;
            parse_relation_id(id).ok_or_else(|| DispatchError::InvalidRelation(id.to_string()))
        };

        let event = match (endpoint, kind) {
            (AUTH_PROXY_RELATION, "joined" | "changed") => Event::UpstreamChanged {
                relation_id: relation()?,
            },
            (AUTH_PROXY_RELATION, "broken") => Event::UpstreamRemoved {
                relation_id: relation()?,
            },
            (KRATOS_INFO_RELATION, "changed" | "broken") => Event::IdentityChanged,
            (PEER_RELATION, "changed") => Event::PeersChanged,
            (OATHKEEPER_INFO_RELATION, "joined" | "changed") => Event::InfoRequested {
                relation_id: relation()?,
            },
            _ => return Ok(Self::Ignored),
        };
        Ok(Self::Event(event))
    }
}
