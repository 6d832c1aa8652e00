use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment},
        core::v1::{
            Affinity, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, EnvVarSource,
            LocalObjectReference, ObjectFieldSelector, PodSpec, PodTemplateSpec, Volume, VolumeMount,
        },
    },
    apimachinery::pkg::{apis::meta::v1::LabelSelector, util::intstr::IntOrString},
};
use kube::{api::ObjectMeta, Resource, ResourceExt};
use serde_json::{json, Value};

use super::args::synthesize_args;
use super::object::{apply_owned_metadata, owned_metadata, ManagedObject};
use crate::api::v1alpha1::{
    UpdateStrategyType, VarnishCluster, VarnishClusterUpdateStrategy, DEFAULT_ROLLOUT_DELAY_SECONDS,
    VARNISH_METRICS_PORT, VARNISH_METRICS_PORT_NAME, VARNISH_PORT, VARNISH_PORT_NAME,
};
use crate::util::config::VCL_CONFIG_DIR;
use crate::util::errors::StdError;
use crate::util::labels::{combined_labels, component_labels, selector_string, Labels, COMPONENT_VARNISH};
use crate::util::quantity::normalize_resources;

pub const VARNISH_CONTAINER: &str = "varnish";
pub const CONTROLLER_CONTAINER: &str = "varnish-controller";
pub const METRICS_EXPORTER_CONTAINER: &str = "varnish-metrics-exporter";
pub const CONTROLLER_PORT: i32 = 8235;
const CONFIG_VOLUME: &str = "varnish-config";
const WORKDIR_VOLUME: &str = "varnish-workdir";
const VARNISH_WORKDIR: &str = "/var/lib/varnish";

pub fn deployment_name(vc: &VarnishCluster) -> String {
    format!("{}-varnish", vc.name_any())
}

/// Labels of the varnish pods, fixed for the lifetime of the cluster
pub fn pod_selector(vc: &VarnishCluster) -> Labels {
    component_labels(vc, COMPONENT_VARNISH)
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn config_mount() -> VolumeMount {
    VolumeMount {
        name: CONFIG_VOLUME.to_string(),
        mount_path: VCL_CONFIG_DIR.to_string(),
        ..Default::default()
    }
}

/// Shared memory log of varnishd, read by the exporter
fn workdir_mount() -> VolumeMount {
    VolumeMount {
        name: WORKDIR_VOLUME.to_string(),
        mount_path: VARNISH_WORKDIR.to_string(),
        ..Default::default()
    }
}

fn empty_dir(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

/// Maps the cluster's update strategy onto the Deployment's.
///
/// A Deployment cannot wait for manual pod deletion, so `OnDelete` recreates instead.
fn deployment_strategy(strategy: Option<&VarnishClusterUpdateStrategy>) -> (DeploymentStrategy, Option<i32>) {
    let kind = strategy.and_then(|s| s.type_).unwrap_or_default();
    match kind {
        UpdateStrategyType::RollingUpdate => (
            DeploymentStrategy {
                type_: Some("RollingUpdate".to_string()),
                ..Default::default()
            },
            None,
        ),
        UpdateStrategyType::OnDelete => (
            DeploymentStrategy {
                type_: Some("Recreate".to_string()),
                ..Default::default()
            },
            None,
        ),
        UpdateStrategyType::DelayedRollingUpdate => {
            let delay = strategy
                .and_then(|s| s.delayed_rolling_update.as_ref())
                .map_or(DEFAULT_ROLLOUT_DELAY_SECONDS, |d| d.delay_seconds);
            (
                DeploymentStrategy {
                    type_: Some("RollingUpdate".to_string()),
                    rolling_update: Some(RollingUpdateDeployment {
                        max_surge: Some(IntOrString::Int(0)),
                        max_unavailable: Some(IntOrString::Int(1)),
                    }),
                },
                Some(delay),
            )
        }
    }
}

/// Settings the VCL controller reads from its environment
fn controller_env(vc: &VarnishCluster, endpoint_selector: &Labels) -> Vec<EnvVar> {
    vec![
        env("ENDPOINT_SELECTOR_STRING", selector_string(endpoint_selector)),
        env("CONFIGMAP_NAME", vc.vcl_config_map_name()),
        env("NAMESPACE", vc.namespace().unwrap_or_default()),
        EnvVar {
            name: "POD_NAME".to_string(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    api_version: Some("v1".to_string()),
                    field_path: "metadata.name".to_string(),
                }),
                ..Default::default()
            }),
            ..Default::default()
        },
        env("VARNISH_CLUSTER_NAME", vc.name_any()),
        env("VARNISH_CLUSTER_UID", vc.uid().unwrap_or_default()),
        env("VARNISH_CLUSTER_GROUP", VarnishCluster::group(&())),
        env("VARNISH_CLUSTER_VERSION", VarnishCluster::version(&())),
        env("VARNISH_CLUSTER_KIND", VarnishCluster::kind(&())),
        env("LOG_LEVEL", vc.spec.log_level.clone().unwrap_or_else(|| "info".to_string())),
        env("LOG_FORMAT", vc.spec.log_format.clone().unwrap_or_else(|| "json".to_string())),
        env("VCL_DIR", VCL_CONFIG_DIR),
        env("HTTP_ADDRESS", format!("0.0.0.0:{CONTROLLER_PORT}")),
    ]
}

/// Cache workers plus their VCL controller and metrics exporter sidecars.
///
/// `vc` must already be defaulted. `endpoint_selector` selects the Endpoints of the
/// no-cache service, from which the sidecar learns the backends.
pub fn desired_deployment(
    vc: &VarnishCluster,
    service_account_name: &str,
    endpoint_selector: &Labels,
) -> Result<Deployment, StdError> {
    let entrypoint = vc.entrypoint_file();
    let args = synthesize_args(&vc.spec.varnish.args, vc.memory_limit_bytes()?, VARNISH_PORT, &entrypoint);
    let selector = pod_selector(vc);
    let varnish = &vc.spec.varnish;
    let (strategy, min_ready_seconds) = deployment_strategy(vc.spec.update_strategy.as_ref());

    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(deployment_name(vc)),
            namespace: vc.namespace(),
            labels: Some(combined_labels(vc, COMPONENT_VARNISH)),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: vc.spec.replicas,
            strategy: Some(strategy),
            min_ready_seconds,
            selector: LabelSelector {
                match_labels: Some(selector.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(selector),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(service_account_name.to_string()),
                    image_pull_secrets: varnish
                        .image_pull_secret
                        .clone()
                        .map(|name| vec![LocalObjectReference { name }]),
                    init_containers: Some(vec![Container {
                        name: "varnish-secret".to_string(),
                        image: varnish.image.clone(),
                        image_pull_policy: varnish.image_pull_policy.clone(),
                        command: Some(vec!["/bin/sh".to_string(), "-c".to_string()]),
                        args: Some(vec![format!(
                            "[ -s {VCL_CONFIG_DIR}/secret ] || head -c 32 /dev/urandom > {VCL_CONFIG_DIR}/secret"
                        )]),
                        volume_mounts: Some(vec![config_mount()]),
                        ..Default::default()
                    }]),
                    containers: vec![
                        Container {
                            name: VARNISH_CONTAINER.to_string(),
                            image: varnish.image.clone(),
                            image_pull_policy: varnish.image_pull_policy.clone(),
                            // varnishd refuses to start until the controller has written the entrypoint
                            command: Some(vec![
                                "/bin/sh".to_string(),
                                "-c".to_string(),
                                format!(
                                    "until [ -f {VCL_CONFIG_DIR}/{entrypoint} ]; do sleep 1; done; exec varnishd \"$@\""
                                ),
                                "varnishd".to_string(),
                            ]),
                            args: Some(args),
                            ports: Some(vec![ContainerPort {
                                name: Some(VARNISH_PORT_NAME.to_string()),
                                container_port: VARNISH_PORT,
                                protocol: Some("TCP".to_string()),
                                ..Default::default()
                            }]),
                            resources: Some(varnish.resources.clone().unwrap_or_default()),
                            liveness_probe: varnish.liveness_probe.clone(),
                            readiness_probe: varnish.readiness_probe.clone(),
                            volume_mounts: Some(vec![config_mount(), workdir_mount()]),
                            ..Default::default()
                        },
                        Container {
                            name: CONTROLLER_CONTAINER.to_string(),
                            image: varnish.controller_image.clone(),
                            image_pull_policy: varnish.image_pull_policy.clone(),
                            env: Some(controller_env(vc, endpoint_selector)),
                            ports: Some(vec![ContainerPort {
                                name: Some("controller".to_string()),
                                container_port: CONTROLLER_PORT,
                                protocol: Some("TCP".to_string()),
                                ..Default::default()
                            }]),
                            volume_mounts: Some(vec![config_mount()]),
                            ..Default::default()
                        },
                        Container {
                            name: METRICS_EXPORTER_CONTAINER.to_string(),
                            image: varnish.metrics_exporter.image.clone(),
                            image_pull_policy: varnish.image_pull_policy.clone(),
                            ports: Some(vec![ContainerPort {
                                name: Some(VARNISH_METRICS_PORT_NAME.to_string()),
                                container_port: VARNISH_METRICS_PORT,
                                protocol: Some("TCP".to_string()),
                                ..Default::default()
                            }]),
                            resources: varnish.metrics_exporter.resources.clone(),
                            volume_mounts: Some(vec![workdir_mount()]),
                            ..Default::default()
                        },
                    ],
                    volumes: Some(vec![empty_dir(CONFIG_VOLUME), empty_dir(WORKDIR_VOLUME)]),
                    affinity: Some(vc.spec.affinity.clone().unwrap_or_else(Affinity::default)),
                    tolerations: Some(vc.spec.tolerations.clone().unwrap_or_default()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

impl ManagedObject for Deployment {
    fn apply_defaults(&mut self) {
        let Some(spec) = self.spec.as_mut() else {
            return;
        };
        if spec.replicas.is_none() {
            spec.replicas = Some(1);
        }
        for pod in spec.template.spec.iter_mut() {
            for port in pod.containers.iter_mut().flat_map(|c| c.ports.iter_mut().flatten()) {
                if port.protocol.is_none() {
                    port.protocol = Some("TCP".to_string());
                }
            }
        }
    }

    /// The selector is immutable once set, so always enforce the existing one
    fn inherit_immutable(&mut self, observed: &Self) {
        if let (Some(spec), Some(found)) = (self.spec.as_mut(), observed.spec.as_ref()) {
            spec.selector = found.selector.clone();
            if let (Some(meta), Some(found_meta)) = (spec.template.metadata.as_mut(), found.template.metadata.as_ref()) {
                meta.labels = found_meta.labels.clone();
            }
        }
    }

    fn owned_sections(&self) -> Value {
        let mut spec = self.spec.clone();
        for pod in spec.iter_mut().filter_map(|s| s.template.spec.as_mut()) {
            let containers = pod.containers.iter_mut().chain(pod.init_containers.iter_mut().flatten());
            for resources in containers.filter_map(|c| c.resources.as_mut()) {
                normalize_resources(resources);
            }
        }
        json!({ "metadata": owned_metadata(&self.metadata), "spec": spec })
    }

    fn apply_mutable(&self, observed: &mut Self) {
        apply_owned_metadata(&self.metadata, &mut observed.metadata);
        observed.spec = self.spec.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::object::{reconcile_object, Change};
    use crate::fixtures::{varnish_cluster, FakeApi};
    use crate::util::config::OperatorConfig;
    use assert_json_diff::assert_json_include;
    use k8s_openapi::api::core::v1::ResourceRequirements;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use std::collections::BTreeMap;

    fn defaulted() -> VarnishCluster {
        varnish_cluster().with_defaults(&OperatorConfig::default())
    }

    fn endpoint_selector() -> Labels {
        BTreeMap::from([("varnish-component".to_string(), "no-cache-service".to_string())])
    }

    fn container<'a>(deployment: &'a Deployment, name: &str) -> &'a Container {
        deployment
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .and_then(|p| p.containers.iter().find(|c| c.name == name))
            .unwrap()
    }

    #[test]
    fn varnish_container_gets_the_synthesized_arguments() {
        let mut vc = defaulted();
        vc.spec.varnish.resources = Some(ResourceRequirements {
            limits: Some(BTreeMap::from([("memory".to_string(), Quantity("2Gi".to_string()))])),
            ..Default::default()
        });
        let deployment = desired_deployment(&vc, "sa", &endpoint_selector()).unwrap();

        let args = container(&deployment, VARNISH_CONTAINER).args.clone().unwrap();
        assert!(args.contains(&"malloc,1843M".to_string()));
        assert!(args.ends_with(&["-f".to_string(), "/etc/varnish/entrypoint.vcl".to_string()]));
    }

    #[test]
    fn containers_share_the_config_volume() {
        let deployment = desired_deployment(&defaulted(), "web-varnish-serviceaccount", &endpoint_selector()).unwrap();
        let mount = json!([{ "name": "varnish-config", "mountPath": "/etc/varnish" }]);
        assert_json_include!(
            actual: serde_json::to_value(&deployment).unwrap(),
            expected: json!({
                "spec": { "template": { "spec": {
                    "serviceAccountName": "web-varnish-serviceaccount",
                    "initContainers": [{ "name": "varnish-secret", "volumeMounts": mount }],
                    "containers": [
                        { "name": "varnish", "ports": [{ "name": "varnish", "containerPort": 6081 }], "volumeMounts": mount },
                        { "name": "varnish-controller", "ports": [{ "containerPort": 8235 }], "volumeMounts": mount },
                    ],
                    "volumes": [{ "name": "varnish-config", "emptyDir": {} }],
                }}}
            })
        );
    }

    #[test]
    fn exporter_shares_the_varnish_workdir() {
        let mut vc = defaulted();
        vc.spec.varnish.image_pull_secret = Some("registry".to_string());
        let deployment = desired_deployment(&vc, "sa", &endpoint_selector()).unwrap();
        let workdir = json!({ "name": "varnish-workdir", "mountPath": "/var/lib/varnish" });
        assert_json_include!(
            actual: serde_json::to_value(&deployment).unwrap(),
            expected: json!({
                "spec": { "template": { "spec": {
                    "imagePullSecrets": [{ "name": "registry" }],
                    "containers": [
                        {
                            "name": "varnish",
                            "readinessProbe": { "tcpSocket": { "port": "varnish" } },
                            "volumeMounts": [{ "name": "varnish-config" }, workdir],
                        },
                        { "name": "varnish-controller" },
                        {
                            "name": "varnish-metrics-exporter",
                            "image": "ghcr.io/varnish-operator/varnish-metrics-exporter:latest",
                            "ports": [{ "name": "metrics", "containerPort": 9131 }],
                            "volumeMounts": [workdir],
                        },
                    ],
                    "volumes": [{ "name": "varnish-config" }, { "name": "varnish-workdir", "emptyDir": {} }],
                }}}
            })
        );
        assert!(container(&deployment, VARNISH_CONTAINER).liveness_probe.is_none());
    }

    #[test]
    fn rollout_follows_the_update_strategy() {
        let strategy_of = |type_: Option<UpdateStrategyType>| {
            let mut vc = varnish_cluster();
            vc.spec.update_strategy = Some(VarnishClusterUpdateStrategy {
                type_,
                delayed_rolling_update: None,
            });
            let vc = vc.with_defaults(&OperatorConfig::default());
            desired_deployment(&vc, "sa", &endpoint_selector()).unwrap().spec.unwrap()
        };

        let spec = strategy_of(None);
        assert_eq!(spec.strategy.unwrap().type_.as_deref(), Some("RollingUpdate"));
        assert_eq!(spec.min_ready_seconds, None);

        let spec = strategy_of(Some(UpdateStrategyType::OnDelete));
        assert_eq!(spec.strategy.unwrap().type_.as_deref(), Some("Recreate"));

        let spec = strategy_of(Some(UpdateStrategyType::DelayedRollingUpdate));
        let strategy = spec.strategy.unwrap();
        assert_eq!(strategy.type_.as_deref(), Some("RollingUpdate"));
        let rolling = strategy.rolling_update.unwrap();
        assert_eq!(rolling.max_surge, Some(IntOrString::Int(0)));
        assert_eq!(rolling.max_unavailable, Some(IntOrString::Int(1)));
        assert_eq!(spec.min_ready_seconds, Some(60));
    }

    #[tokio::test]
    async fn stored_quantity_notation_is_not_a_change() {
        let with_resources = |cpu: &str, memory: &str| {
            let mut vc = defaulted();
            vc.spec.varnish.resources = Some(ResourceRequirements {
                limits: Some(BTreeMap::from([
                    ("cpu".to_string(), Quantity(cpu.to_string())),
                    ("memory".to_string(), Quantity(memory.to_string())),
                ])),
                ..Default::default()
            });
            desired_deployment(&vc, "sa", &endpoint_selector()).unwrap()
        };
        let api = FakeApi::new(vec![with_resources("500m", "1073741824")]);

        let applied = reconcile_object(&api, None, with_resources("0.5", "1Gi")).await.unwrap();
        assert_eq!(applied.change, Change::Unchanged);

        let applied = reconcile_object(&api, None, with_resources("1", "1Gi")).await.unwrap();
        assert_eq!(applied.change, Change::Updated);
    }

    #[test]
    fn sidecar_env_carries_the_endpoint_selector_and_owner() {
        let deployment = desired_deployment(&defaulted(), "sa", &endpoint_selector()).unwrap();
        let env = container(&deployment, CONTROLLER_CONTAINER).env.clone().unwrap();
        let value = |name: &str| env.iter().find(|e| e.name == name).and_then(|e| e.value.clone());

        assert_eq!(value("ENDPOINT_SELECTOR_STRING").as_deref(), Some("varnish-component=no-cache-service"));
        assert_eq!(value("CONFIGMAP_NAME").as_deref(), Some("web-vcl-files"));
        assert_eq!(value("VARNISH_CLUSTER_UID").as_deref(), Some("uid-1"));
        assert_eq!(value("VARNISH_CLUSTER_KIND").as_deref(), Some("VarnishCluster"));
        assert!(env.iter().any(|e| e.name == "POD_NAME" && e.value_from.is_some()));
    }

    #[tokio::test]
    async fn selector_and_pod_labels_are_kept_from_the_cluster() {
        let vc = defaulted();
        let mut existing = desired_deployment(&vc, "sa", &endpoint_selector()).unwrap();
        let legacy = BTreeMap::from([("app".to_string(), "legacy".to_string())]);
        let spec = existing.spec.as_mut().unwrap();
        spec.selector.match_labels = Some(legacy.clone());
        spec.template.metadata.as_mut().unwrap().labels = Some(legacy.clone());
        let api = FakeApi::new(vec![existing]);

        let mut scaled = vc.clone();
        scaled.spec.replicas = Some(4);
        let applied = reconcile_object(&api, None, desired_deployment(&scaled, "sa", &endpoint_selector()).unwrap())
            .await
            .unwrap();

        assert_eq!(applied.change, Change::Updated);
        let spec = applied.object.spec.unwrap();
        assert_eq!(spec.replicas, Some(4));
        assert_eq!(spec.selector.match_labels, Some(legacy));
    }

    #[test]
    fn pod_selector_is_the_generated_subset() {
        let deployment = desired_deployment(&defaulted(), "sa", &endpoint_selector()).unwrap();
        let spec = deployment.spec.unwrap();
        assert_eq!(spec.selector.match_labels.as_ref().unwrap().len(), 3);
        assert!(!spec.selector.match_labels.unwrap().contains_key("team"));
        assert_eq!(deployment.metadata.labels.unwrap()["team"], "edge");
    }
}
