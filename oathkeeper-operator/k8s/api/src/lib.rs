#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod labels;
pub mod service;

pub use self::{labels::Labels, service::service_ports};
pub use k8s_openapi::api::core::v1::{ConfigMap, Service};
pub use kube::{
    api::{Api, DeleteParams, ObjectMeta, Patch, PatchParams, PostParams, ResourceExt},
    Client, Error,
};

/// Builds an empty ConfigMap owned by the given application.
pub fn configmap(name: &str, namespace: &str, labels: &Labels) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.to_map()),
            ..Default::default()
        },
        ..Default::default()
    }
}
