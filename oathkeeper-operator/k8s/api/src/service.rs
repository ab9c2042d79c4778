use k8s_openapi::{
    api::core::v1::{Service, ServicePort, ServiceSpec},
    apimachinery::pkg::util::intstr::IntOrString,
};

/// Builds a merge patch that sets the ports of an application's Service. Each port targets the
/// same port on the pod.
pub fn service_ports<'a>(ports: impl IntoIterator<Item = (&'a str, u16)>) -> Service {
    let ports = ports
        .into_iter()
        .map(|(name, port)| ServicePort {
            name: Some(name.to_string()),
            port: port.into(),
            target_port: Some(IntOrString::Int(port.into())),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        })
        .collect();
    Service {
        spec: Some(ServiceSpec {
            ports: Some(ports),
            ..Default::default()
        }),
        ..Default::default()
    }
}
