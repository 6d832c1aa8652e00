use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::DeploymentStatus;
use k8s_openapi::api::core::v1::{
    Affinity, Probe, ResourceRequirements, ServiceStatus, TCPSocketAction, Toleration,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::util::config::OperatorConfig;
use crate::util::errors::StdError;
use crate::util::quantity::quantity_to_bytes;

pub static VARNISH_CLUSTER_FINALIZER: &str = "varnishcluster.caching.varnish-operator.io";

pub const VARNISH_PORT: i32 = 6081;
pub const VARNISH_PORT_NAME: &str = "varnish";
pub const VARNISH_METRICS_PORT: i32 = 9131;
pub const VARNISH_METRICS_PORT_NAME: &str = "metrics";
pub const DEFAULT_ROLLOUT_DELAY_SECONDS: i32 = 60;
pub const VARNISH_ADMIN_ADDRESS: &str = "127.0.0.1:6082";
pub const DEFAULT_ENTRYPOINT_FILE: &str = "entrypoint.vcl";
pub const DEFAULT_BACKENDS_TEMPLATE: &str = "backends.vcl.tmpl";

/// Generate the Kubernetes wrapper struct `VarnishCluster` from our Spec and Status struct
///
/// This provides a hook for generating the CRD yaml (in crdgen)
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    kind = "VarnishCluster",
    group = "caching.varnish-operator.io",
    version = "v1alpha1",
    namespaced
)]
#[kube(status = "VarnishClusterStatus", shortname = "vc")]
#[kube(derive = "PartialEq")]
#[serde(rename_all = "camelCase")]
pub struct VarnishClusterSpec {
    pub replicas: Option<i32>,
    pub backend: VarnishClusterBackend,
    pub service: VarnishClusterService,
    #[serde(default)]
    pub vcl: VarnishClusterVcl,
    #[serde(default)]
    pub varnish: VarnishClusterVarnish,
    pub update_strategy: Option<VarnishClusterUpdateStrategy>,
    pub pod_disruption_budget: Option<VarnishClusterPodDisruptionBudget>,
    pub affinity: Option<Affinity>,
    pub tolerations: Option<Vec<Toleration>>,
    pub log_level: Option<String>,
    pub log_format: Option<String>,
}

/// Pods the no-cache service and the VCL backends point at
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct VarnishClusterBackend {
    pub selector: BTreeMap<String, String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VarnishClusterService {
    /// Exactly one port: `port` is exposed by both services, `targetPort` is the backend port
    pub ports: Vec<VarnishServicePort>,
    #[serde(rename = "type")]
    pub type_: Option<String>,
    pub annotations: Option<BTreeMap<String, String>>,
    /// Port of the cached service in front of the metrics exporter
    pub metrics_port: Option<i32>,
    /// Adds `prometheus.io/*` scrape annotations to the cached service
    pub prometheus_annotations: Option<bool>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VarnishServicePort {
    pub name: Option<String>,
    pub port: i32,
    pub target_port: Option<IntOrString>,
    pub node_port: Option<i32>,
    pub protocol: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VarnishClusterVcl {
    pub config_map_name: Option<String>,
    pub entrypoint_file_name: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VarnishClusterVarnish {
    pub image: Option<String>,
    pub image_pull_policy: Option<String>,
    pub controller_image: Option<String>,
    pub image_pull_secret: Option<String>,
    pub resources: Option<ResourceRequirements>,
    pub liveness_probe: Option<Probe>,
    pub readiness_probe: Option<Probe>,
    /// Extra `varnishd` arguments, merged with the computed defaults
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub metrics_exporter: VarnishClusterMetricsExporter,
}

/// Prometheus exporter reading the varnishd shared memory log
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VarnishClusterMetricsExporter {
    pub image: Option<String>,
    pub resources: Option<ResourceRequirements>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum UpdateStrategyType {
    #[default]
    RollingUpdate,
    /// Old pods are all gone before new ones start
    OnDelete,
    /// One pod at a time, waiting `delaySeconds` after each becomes ready
    DelayedRollingUpdate,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VarnishClusterUpdateStrategy {
    #[serde(rename = "type")]
    pub type_: Option<UpdateStrategyType>,
    pub delayed_rolling_update: Option<DelayedRollingUpdate>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DelayedRollingUpdate {
    pub delay_seconds: i32,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VarnishClusterPodDisruptionBudget {
    pub min_available: Option<IntOrString>,
    pub max_unavailable: Option<IntOrString>,
}

/// The status object of `VarnishCluster`
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VarnishClusterStatus {
    #[serde(default)]
    pub service: VarnishClusterServiceStatus,
    pub deployment: Option<DeploymentStatus>,
    pub varnish_pods_selector: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VarnishClusterServiceStatus {
    #[serde(default)]
    pub cached: ServiceSnapshot,
    #[serde(default)]
    pub no_cache: ServiceSnapshot,
}

/// Cluster IP and platform status of one derived service
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
pub struct ServiceSnapshot {
    pub ip: Option<String>,
    pub status: Option<ServiceStatus>,
}

impl VarnishCluster {
    /// Returns a copy with every optional field the reconcilers rely on filled in.
    pub fn with_defaults(&self, cfg: &OperatorConfig) -> VarnishCluster {
        let mut vc = self.clone();
        let spec = &mut vc.spec;

        if spec.replicas.is_none() {
            spec.replicas = Some(1);
        }
        spec.service.type_.get_or_insert_with(|| "ClusterIP".to_string());
        spec.service.metrics_port.get_or_insert(VARNISH_METRICS_PORT);
        spec.service.prometheus_annotations.get_or_insert(true);
        for port in spec.service.ports.iter_mut() {
            port.protocol.get_or_insert_with(|| "TCP".to_string());
            if port.target_port.is_none() {
                port.target_port = Some(IntOrString::Int(port.port));
            }
        }

        let name = self.metadata.name.clone().unwrap_or_default();
        spec.vcl
            .config_map_name
            .get_or_insert_with(|| format!("{name}-vcl-files"));
        spec.vcl
            .entrypoint_file_name
            .get_or_insert_with(|| DEFAULT_ENTRYPOINT_FILE.to_string());

        spec.varnish
            .image
            .get_or_insert_with(|| cfg.varnish_image.clone());
        spec.varnish
            .controller_image
            .get_or_insert_with(|| cfg.varnish_controller_image.clone());
        spec.varnish
            .image_pull_policy
            .get_or_insert_with(|| cfg.image_pull_policy.clone());
        spec.varnish.resources.get_or_insert_with(Default::default);
        spec.varnish.readiness_probe.get_or_insert_with(default_readiness_probe);
        spec.varnish
            .metrics_exporter
            .image
            .get_or_insert_with(|| cfg.varnish_metrics_exporter_image.clone());

        let strategy = spec.update_strategy.get_or_insert_with(Default::default);
        let kind = *strategy.type_.get_or_insert_with(Default::default);
        if kind == UpdateStrategyType::DelayedRollingUpdate {
            strategy
                .delayed_rolling_update
                .get_or_insert(DelayedRollingUpdate {
                    delay_seconds: DEFAULT_ROLLOUT_DELAY_SECONDS,
                });
        }

        spec.log_level.get_or_insert_with(|| cfg.log_level.clone());
        spec.log_format
            .get_or_insert_with(|| cfg.log_format.to_string());

        vc
    }

    /// Annotations of the cached service: the user's, on top of the scrape settings when enabled.
    pub fn cached_service_annotations(&self) -> Option<BTreeMap<String, String>> {
        let mut annotations = BTreeMap::new();
        if self.spec.service.prometheus_annotations.unwrap_or(true) {
            let port = self.spec.service.metrics_port.unwrap_or(VARNISH_METRICS_PORT);
            annotations.insert("prometheus.io/scrape".to_string(), "true".to_string());
            annotations.insert("prometheus.io/port".to_string(), port.to_string());
            annotations.insert("prometheus.io/path".to_string(), "/metrics".to_string());
        }
        annotations.extend(self.spec.service.annotations.clone().unwrap_or_default());
        (!annotations.is_empty()).then_some(annotations)
    }

    /// The single application port; the service spec must declare exactly one.
    pub fn application_port(&self) -> Result<VarnishServicePort, StdError> {
        match self.spec.service.ports.as_slice() {
            [port] => {
                let mut port = port.clone();
                if port.target_port.is_none() {
                    port.target_port = Some(IntOrString::Int(port.port));
                }
                Ok(port)
            }
            ports => Err(StdError::InvalidArgument(format!(
                "must specify exactly one port in service spec, found {}",
                ports.len()
            ))),
        }
    }

    pub fn vcl_config_map_name(&self) -> String {
        self.spec
            .vcl
            .config_map_name
            .clone()
            .unwrap_or_else(|| format!("{}-vcl-files", self.metadata.name.clone().unwrap_or_default()))
    }

    pub fn entrypoint_file(&self) -> String {
        self.spec
            .vcl
            .entrypoint_file_name
            .clone()
            .unwrap_or_else(|| DEFAULT_ENTRYPOINT_FILE.to_string())
    }

    /// Memory limit of the varnish container in bytes, if one is set.
    pub fn memory_limit_bytes(&self) -> Result<Option<i64>, StdError> {
        self.spec
            .varnish
            .resources
            .as_ref()
            .and_then(|r| r.limits.as_ref())
            .and_then(|limits| limits.get("memory"))
            .map(quantity_to_bytes)
            .transpose()
    }
}

/// Ready once varnishd accepts connections
fn default_readiness_probe() -> Probe {
    Probe {
        tcp_socket: Some(TCPSocketAction {
            port: IntOrString::String(VARNISH_PORT_NAME.to_string()),
            ..Default::default()
        }),
        initial_delay_seconds: Some(5),
        period_seconds: Some(10),
        ..Default::default()
    }
}
