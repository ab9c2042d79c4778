//! Reconciles Oathkeeper access rules and configuration with the state of the model.
//!
//! The [`Reconciler`] is driven by one [`Event`] at a time. Each event runs to completion:
//! requirer declarations are validated and synthesized into rule artifacts, the artifacts are
//! written to an [`ArtifactStore`] and recorded in the [`Registry`], and only then is the service
//! configuration recomposed and the workload restarted. Everything outside of this crate (the
//! model, the peer databag, the artifact backend, the workload) is reached through the traits
//! defined here.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod actions;
pub mod files;
pub mod model;
pub mod reconciler;
pub mod registry;
pub mod retry;
pub mod store;
pub mod workload;


pub use self::{
    actions::{ActionError, RuleActions},
    files::WorkloadFiles,
    model::{Model, UnitStatus, UpstreamRelation},
    reconciler::{Error, Event, Outcome, Reconciler, Settings},
    registry::{PeerData, Registry, RegistryError},
    retry::{retry_with_backoff, RetryConfig, Transient},
    store::{ArtifactStore, StoreError},
    workload::{Layer, Workload, WorkloadError},
};
