//! Backend topology from Endpoints, joined with the labels of each address's node.

use async_trait::async_trait;
use k8s_openapi::{
    api::core::v1::{Endpoints, Node},
    apimachinery::pkg::util::intstr::IntOrString,
};
use kube::api::{Api, ListParams};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

use crate::util::errors::{Error, Result, StdError};
use crate::util::labels::{selector_string, Labels};

/// One address a VCL template can route to
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Backend {
    pub ip: String,
    pub node_labels: BTreeMap<String, String>,
    pub pod_name: String,
}

/// Read access to Endpoints and Nodes
#[async_trait]
pub trait EndpointSource: Send + Sync {
    async fn list_endpoints(&self, selector: &Labels) -> Result<Vec<Endpoints>, kube::Error>;
    async fn node_labels(&self, node_name: &str) -> Result<Labels, kube::Error>;
}

pub struct KubeEndpointSource {
    endpoints: Api<Endpoints>,
    nodes: Api<Node>,
}

impl KubeEndpointSource {
    pub fn new(client: kube::Client, namespace: &str) -> Self {
        Self {
            endpoints: Api::namespaced(client.clone(), namespace),
            nodes: Api::all(client),
        }
    }
}

#[async_trait]
impl EndpointSource for KubeEndpointSource {
    async fn list_endpoints(&self, selector: &Labels) -> Result<Vec<Endpoints>, kube::Error> {
        let params = ListParams::default().labels(&selector_string(selector));
        Ok(self.endpoints.list(&params).await?.items)
    }

    async fn node_labels(&self, node_name: &str) -> Result<Labels, kube::Error> {
        let node = self.nodes.get(node_name).await?;
        Ok(node.metadata.labels.unwrap_or_default())
    }
}

fn port_matches(port: i32, name: Option<&str>, target: &IntOrString) -> bool {
    match target {
        IntOrString::Int(number) => port == *number,
        IntOrString::String(target_name) => name == Some(target_name.as_str()),
    }
}

/// Backends behind the Endpoints matching `selector`, and the port they serve `target_port` on.
///
/// Not-ready addresses are included so pods that are still starting show up in the
/// rendered VCL. Backends are ordered by address so rendering is stable.
pub async fn resolve_backends<S>(source: &S, selector: &Labels, target_port: &IntOrString) -> Result<(Vec<Backend>, i32)>
where
    S: EndpointSource + ?Sized,
{
    let kube_err = |e| Error::StdError(StdError::KubeError(e));
    let selector_text = selector_string(selector);

    let endpoints = source.list_endpoints(selector).await.map_err(kube_err)?;
    if endpoints.is_empty() {
        return Err(StdError::NotFound(format!("no endpoints matching labels {selector_text}")).into());
    }

    let mut backends = Vec::new();
    let mut port_number = 0;
    for subset in endpoints.iter().flat_map(|e| e.subsets.iter().flatten()) {
        let Some(port) = subset
            .ports
            .iter()
            .flatten()
            .find(|p| port_matches(p.port, p.name.as_deref(), target_port))
        else {
            continue;
        };
        port_number = port.port;

        let addresses = subset.addresses.iter().flatten().chain(subset.not_ready_addresses.iter().flatten());
        for address in addresses {
            let node_labels = match address.node_name.as_deref() {
                Some(node) => source.node_labels(node).await.map_err(kube_err)?,
                None => Labels::new(),
            };
            backends.push(Backend {
                ip: address.ip.clone(),
                node_labels,
                pod_name: address
                    .target_ref
                    .as_ref()
                    .and_then(|r| r.name.clone())
                    .unwrap_or_default(),
            });
        }
    }

    if backends.is_empty() {
        return Err(StdError::NotFound(format!(
            "no addresses on port {target_port:?} in endpoints matching labels {selector_text}"
        ))
        .into());
    }

    backends.sort_by(|a, b| a.ip.cmp(&b.ip));
    debug!(selector = %selector_text, count = backends.len(), "Resolved backends");
    Ok((backends, port_number))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::api_error;
    use k8s_openapi::api::core::v1::{EndpointAddress, EndpointPort, EndpointSubset, ObjectReference};

    struct FakeSource {
        endpoints: Vec<Endpoints>,
        nodes: BTreeMap<String, Labels>,
    }

    #[async_trait]
    impl EndpointSource for FakeSource {
        async fn list_endpoints(&self, _selector: &Labels) -> Result<Vec<Endpoints>, kube::Error> {
            Ok(self.endpoints.clone())
        }

        async fn node_labels(&self, node_name: &str) -> Result<Labels, kube::Error> {
            self.nodes.get(node_name).cloned().ok_or_else(|| api_error(404, "NotFound"))
        }
    }

    fn address(ip: &str, node: Option<&str>, pod: &str) -> EndpointAddress {
        EndpointAddress {
            ip: ip.to_string(),
            node_name: node.map(str::to_string),
            target_ref: Some(ObjectReference {
                kind: Some("Pod".to_string()),
                name: Some(pod.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn endpoints(ready: Vec<EndpointAddress>, not_ready: Vec<EndpointAddress>) -> Endpoints {
        Endpoints {
            subsets: Some(vec![EndpointSubset {
                addresses: Some(ready),
                not_ready_addresses: Some(not_ready),
                ports: Some(vec![EndpointPort {
                    name: Some("http".to_string()),
                    port: 8080,
                    ..Default::default()
                }]),
            }]),
            ..Default::default()
        }
    }

    fn source(endpoints: Vec<Endpoints>) -> FakeSource {
        FakeSource {
            endpoints,
            nodes: BTreeMap::from([(
                "node-a".to_string(),
                Labels::from([("zone".to_string(), "eu-1".to_string())]),
            )]),
        }
    }

    #[tokio::test]
    async fn backends_are_sorted_by_address() {
        let source = source(vec![endpoints(
            vec![address("10.0.0.5", Some("node-a"), "web-1")],
            vec![address("10.0.0.2", None, "web-0")],
        )]);

        let (backends, port) = resolve_backends(&source, &Labels::new(), &IntOrString::Int(8080))
            .await
            .unwrap();

        let ips: Vec<&str> = backends.iter().map(|b| b.ip.as_str()).collect();
        assert_eq!(ips, vec!["10.0.0.2", "10.0.0.5"]);
        assert_eq!(port, 8080);
        assert_eq!(backends[0].pod_name, "web-0");
        assert!(backends[0].node_labels.is_empty());
        assert_eq!(backends[1].node_labels["zone"], "eu-1");
    }

    #[tokio::test]
    async fn ports_match_by_name() {
        let source = source(vec![endpoints(vec![address("10.0.0.7", None, "web-0")], vec![])]);
        let (backends, port) = resolve_backends(&source, &Labels::new(), &IntOrString::String("http".into()))
            .await
            .unwrap();
        assert_eq!(backends.len(), 1);
        assert_eq!(port, 8080);
    }

    #[tokio::test]
    async fn empty_topology_is_not_found() {
        let err = resolve_backends(&source(vec![]), &Labels::new(), &IntOrString::Int(8080))
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let unmatched = source(vec![endpoints(vec![address("10.0.0.7", None, "web-0")], vec![])]);
        let err = resolve_backends(&unmatched, &Labels::new(), &IntOrString::Int(9090))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn node_lookup_failures_propagate() {
        let source = source(vec![endpoints(vec![address("10.0.0.7", Some("gone"), "web-0")], vec![])]);
        let err = resolve_backends(&source, &Labels::new(), &IntOrString::Int(8080))
            .await
            .unwrap_err();
        assert!(matches!(err.inner(), StdError::KubeError(_)));
    }
}
