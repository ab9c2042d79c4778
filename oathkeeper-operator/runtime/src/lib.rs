//! Runs the operator inside a Juju charm: one process per dispatched hook or action.
//!
//! The model is reached through the Juju hook tools, the workload through the Pebble CLI, and
//! rule artifacts are kept either in ConfigMaps or in files pushed into the workload container.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use oathkeeper_operator_core as core;
pub use oathkeeper_operator_k8s_api as k8s;
pub use oathkeeper_operator_k8s_store as store;
pub use oathkeeper_operator_reconcile as reconcile;

mod args;
mod deferred;
mod dispatch;
mod juju;
mod pebble;
mod service;

pub use self::{
    args::Args,
    deferred::{DeferredQueue, Handler},
    dispatch::{Action, Dispatch},
    juju::HookTools,
    pebble::Pebble,
};
