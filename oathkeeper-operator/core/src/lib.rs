//! Oathkeeper Operator core
//!
//! Pure domain logic for the operator that manages an Ory Oathkeeper deployment. Requirer
//! applications declare, over an `auth-proxy` relation, the URLs they want protected and the
//! endpoints under those URLs that must stay publicly reachable. From that declaration we derive:
//!
//! - a set of Oathkeeper access rules per relation: allow rules for each public endpoint, and a
//!   single deny rule per protected URL that requires a session for everything else;
//! - the rule artifacts (named JSON documents) holding those rules;
//! - the service configuration document that points Oathkeeper at every rule artifact.
//!
//! ```text
//! [ RelationData ] -> [ ProtectedUpstream ] -> [ AccessRules ] -> [ Artifact ]
//!                                                                      |
//!                          [ IdentityEndpoints ] -> [ ServiceConfig ] <-+
//! ```
//!
//! Nothing in this crate performs I/O; synthesis is a deterministic function of its input.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod config;
pub mod rule;
pub mod upstream;

pub use self::{
    config::{IdentityEndpoints, ServiceConfig},
    rule::{synthesize, AccessRule, AccessRules, Artifact, ArtifactNames, RuleKind},
    upstream::{InvalidUpstream, ProtectedUpstream, RelationData, RelationId},
};

/// The port on which the Oathkeeper API is served.
pub const OATHKEEPER_API_PORT: u16 = 4456;

/// The port on which the Oathkeeper reverse proxy is served.
pub const OATHKEEPER_PROXY_PORT: u16 = 4455;
