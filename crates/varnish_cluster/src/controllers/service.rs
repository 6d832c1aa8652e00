use k8s_openapi::{
    api::core::v1::{Service, ServicePort, ServiceSpec},
    apimachinery::pkg::util::intstr::IntOrString,
};
use kube::{api::ObjectMeta, ResourceExt};
use serde_json::{json, Value};

use super::object::{apply_owned_metadata, owned_metadata, ManagedObject};
use crate::api::v1alpha1::{
    VarnishCluster, VarnishServicePort, VARNISH_METRICS_PORT, VARNISH_METRICS_PORT_NAME, VARNISH_PORT_NAME,
};
use crate::util::labels::{
    combined_labels, component_labels, Labels, COMPONENT_CACHE_SERVICE, COMPONENT_NO_CACHE_SERVICE,
};

/// Name of the single port on the no-cache service and its Endpoints
pub const NO_CACHE_PORT_NAME: &str = "backend";

pub fn no_cache_service_name(vc: &VarnishCluster) -> String {
    format!("{}-no-cache", vc.name_any())
}

pub fn cached_service_name(vc: &VarnishCluster) -> String {
    vc.name_any()
}

/// Labels of the no-cache service, which its Endpoints carry too
pub fn no_cache_endpoint_selector(vc: &VarnishCluster) -> Labels {
    component_labels(vc, COMPONENT_NO_CACHE_SERVICE)
}

/// Backend-facing service selecting the user's pods directly
pub fn desired_no_cache_service(vc: &VarnishCluster, port: &VarnishServicePort) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(no_cache_service_name(vc)),
            namespace: vc.namespace(),
            labels: Some(combined_labels(vc, COMPONENT_NO_CACHE_SERVICE)),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(vc.spec.backend.selector.clone()),
            ports: Some(vec![ServicePort {
                name: Some(NO_CACHE_PORT_NAME.to_string()),
                protocol: Some("TCP".to_string()),
                port: port.port,
                target_port: port.target_port.clone(),
                ..Default::default()
            }]),
            session_affinity: Some("None".to_string()),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Client-facing service routed through the varnish pods, also exposing their metrics
pub fn desired_cached_service(vc: &VarnishCluster, port: &VarnishServicePort, pod_selector: &Labels) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(cached_service_name(vc)),
            namespace: vc.namespace(),
            labels: Some(combined_labels(vc, COMPONENT_CACHE_SERVICE)),
            annotations: vc.cached_service_annotations(),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(pod_selector.clone()),
            ports: Some(vec![
                ServicePort {
                    name: Some(port.name.clone().unwrap_or_else(|| VARNISH_PORT_NAME.to_string())),
                    protocol: port.protocol.clone(),
                    port: port.port,
                    node_port: port.node_port,
                    target_port: Some(IntOrString::String(VARNISH_PORT_NAME.to_string())),
                    ..Default::default()
                },
                ServicePort {
                    name: Some(VARNISH_METRICS_PORT_NAME.to_string()),
                    protocol: Some("TCP".to_string()),
                    port: vc.spec.service.metrics_port.unwrap_or(VARNISH_METRICS_PORT),
                    target_port: Some(IntOrString::String(VARNISH_METRICS_PORT_NAME.to_string())),
                    ..Default::default()
                },
            ]),
            session_affinity: Some("None".to_string()),
            type_: vc.spec.service.type_.clone(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn allocates_node_ports(spec: &ServiceSpec) -> bool {
    matches!(spec.type_.as_deref(), Some("NodePort") | Some("LoadBalancer"))
}

/// Keeps node ports the platform allocated when the desired port leaves them open.
fn inherit_node_ports(desired: &mut [ServicePort], observed: &[ServicePort]) {
    for port in desired.iter_mut().filter(|p| p.node_port.is_none()) {
        if let Some(allocated) = observed.iter().find(|o| o.port == port.port) {
            port.node_port = allocated.node_port;
        }
    }
}

impl ManagedObject for Service {
    fn apply_defaults(&mut self) {
        if let Some(spec) = self.spec.as_mut() {
            spec.type_.get_or_insert_with(|| "ClusterIP".to_string());
            spec.session_affinity.get_or_insert_with(|| "None".to_string());
            for port in spec.ports.iter_mut().flatten() {
                port.protocol.get_or_insert_with(|| "TCP".to_string());
                if port.target_port.is_none() {
                    port.target_port = Some(IntOrString::Int(port.port));
                }
            }
        }
    }

    fn inherit_immutable(&mut self, observed: &Self) {
        let (Some(spec), Some(found)) = (self.spec.as_mut(), observed.spec.as_ref()) else {
            return;
        };
        spec.cluster_ip = found.cluster_ip.clone();
        spec.cluster_ips = found.cluster_ips.clone();
        if allocates_node_ports(spec) {
            if let (Some(ports), Some(found_ports)) = (spec.ports.as_mut(), found.ports.as_ref()) {
                inherit_node_ports(ports, found_ports);
            }
        }
    }

    fn owned_sections(&self) -> Value {
        json!({
            "metadata": owned_metadata(&self.metadata),
            "annotations": self.metadata.annotations,
            "spec": self.spec,
        })
    }

    fn apply_mutable(&self, observed: &mut Self) {
        apply_owned_metadata(&self.metadata, &mut observed.metadata);
        observed.metadata.annotations = self.metadata.annotations.clone();
        observed.spec = self.spec.clone();
    }
}
