//! Exposes the Oathkeeper API on the application's Service.

use crate::{
    core::OATHKEEPER_API_PORT,
    k8s::{self, Api, Patch, PatchParams, Service},
};
use anyhow::{Context, Result};
use std::time::Duration;
use tokio::time;
use tracing::info;

const API_PORT_NAME: &str = "oathkeeper-api";

const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Juju creates a Service named after the application; it only needs the API port added.
pub(crate) async fn expose_api_port(
    client: k8s::Client,
    namespace: &str,
    app_name: &str,
) -> Result<()> {
    let services = Api::<Service>::namespaced(client, namespace);
    let patch = k8s::service_ports([(API_PORT_NAME, OATHKEEPER_API_PORT)]);
    time::timeout(
        WRITE_TIMEOUT,
        services.patch(app_name, &PatchParams::default(), &Patch::Merge(&patch)),
    )
    .await
    .with_context(|| format!("timed out patching service {app_name}"))?
    .with_context(|| format!("failed to patch service {app_name}"))?;
    info!(service = %app_name, port = OATHKEEPER_API_PORT, "Exposed the Oathkeeper API");
    Ok(())
}
