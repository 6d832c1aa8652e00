use super::configmap::desired_config_map;
use super::deployment::{desired_deployment, pod_selector};
use super::object::{delete_object, reconcile_object};
use super::pdb::{desired_pdb, pdb_name};
use super::rbac::{
    cluster_role_binding_name, cluster_role_name, desired_cluster_role, desired_cluster_role_binding,
    desired_role, desired_role_binding, desired_service_account,
};
use super::service::{desired_cached_service, desired_no_cache_service, no_cache_endpoint_selector};
use crate::api::v1alpha1::{
    ServiceSnapshot, VarnishCluster, VarnishClusterServiceStatus, VarnishClusterStatus,
    VARNISH_CLUSTER_FINALIZER,
};
use crate::util::config::OperatorConfig;
use crate::util::errors::{Error, Result, StdError};
use crate::util::labels::{selector_string, Labels, LABEL_VARNISH_OWNER};
use crate::util::metrics::Metrics;
use crate::util::state::{Diagnostics, State};
use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{ConfigMap, Service, ServiceAccount},
    policy::v1::PodDisruptionBudget,
    rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding},
};
use kube::{
    api::{Api, ListParams, Patch, PatchParams, ResourceExt},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        events::{Event, EventType, Recorder},
        finalizer::{finalizer, Event as Finalizer},
        watcher::Config,
    },
    Resource,
};
use serde_json::json;
use std::sync::Arc;
use tokio::{sync::RwLock, time::Duration};
use tracing::*;

pub const FIELD_MANAGER: &str = "varnish-operator";
pub const REPORTER: &str = "varnish-operator";

// Context for our reconciler
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Operator settings, also the source of spec defaults
    pub config: OperatorConfig,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
}

impl Context {
    pub fn new(client: Client, config: OperatorConfig, state: &State) -> Result<Arc<Self>, prometheus::Error> {
        Ok(Arc::new(Context {
            client,
            config,
            diagnostics: state.diagnostics_handle(),
            metrics: state.register_metrics()?,
        }))
    }
}

fn kube_err(e: kube::Error) -> Error {
    Error::StdError(StdError::KubeError(e))
}

impl VarnishCluster {
    // Reconcile (for non-finalizer related changes)
    async fn reconcile(&self, ctx: Arc<Context>) -> Result<Action> {
        let client = ctx.client.clone();
        let recorder = ctx.diagnostics.read().await.recorder(client.clone());
        let vc = self.with_defaults(&ctx.config);
        let ns = vc
            .namespace()
            .ok_or_else(|| StdError::MetadataMissing("VarnishCluster has no namespace".to_string()))?;

        let port = match vc.application_port() {
            Ok(port) => port,
            Err(e) => {
                self.publish(&recorder, EventType::Warning, "InvalidSpec", e.to_string()).await;
                return Err(e.into());
            }
        };

        let oref = vc
            .controller_owner_ref(&())
            .ok_or_else(|| StdError::MetadataMissing("VarnishCluster has no uid".to_string()))?;
        let owner = Some(&oref);

        let service_account = reconcile_object(
            &Api::<ServiceAccount>::namespaced(client.clone(), &ns),
            owner,
            desired_service_account(&vc),
        )
        .await?
        .object;
        let role = reconcile_object(&Api::<Role>::namespaced(client.clone(), &ns), owner, desired_role(&vc))
            .await?
            .object;
        reconcile_object(
            &Api::<RoleBinding>::namespaced(client.clone(), &ns),
            owner,
            desired_role_binding(&vc, &role.name_any(), &service_account.name_any()),
        )
        .await?;

        // cluster-scoped, cleaned up by the finalizer instead of an owner reference
        let cluster_role = reconcile_object(&Api::<ClusterRole>::all(client.clone()), None, desired_cluster_role(&vc))
            .await?
            .object;
        reconcile_object(
            &Api::<ClusterRoleBinding>::all(client.clone()),
            None,
            desired_cluster_role_binding(&vc, &cluster_role.name_any(), &service_account.name_any()),
        )
        .await?;

        let services = Api::<Service>::namespaced(client.clone(), &ns);
        let endpoint_selector = no_cache_endpoint_selector(&vc);
        let no_cache = reconcile_object(&services, owner, desired_no_cache_service(&vc, &port))
            .await?
            .object;

        let deployment = reconcile_object(
            &Api::<Deployment>::namespaced(client.clone(), &ns),
            owner,
            desired_deployment(&vc, &service_account.name_any(), &endpoint_selector)?,
        )
        .await?
        .object;
        let varnish_selector = deployment_selector(&deployment).unwrap_or_else(|| pod_selector(&vc));

        reconcile_object(
            &Api::<ConfigMap>::namespaced(client.clone(), &ns),
            owner,
            desired_config_map(&vc),
        )
        .await?;

        let pdbs = Api::<PodDisruptionBudget>::namespaced(client.clone(), &ns);
        match desired_pdb(&vc, &varnish_selector) {
            Some(pdb) => {
                reconcile_object(&pdbs, owner, pdb).await?;
            }
            None => {
                delete_object::<PodDisruptionBudget, _>(&pdbs, &pdb_name(&vc)).await?;
            }
        }

        let cached = reconcile_object(&services, owner, desired_cached_service(&vc, &port, &varnish_selector))
            .await?
            .object;

        let status = compute_status(&no_cache, &cached, &deployment, &varnish_selector);
        if self.status.as_ref() != Some(&status) {
            debug!("Updating status of VarnishCluster \"{}\"", self.name_any());
            let patch = Patch::Apply(json!({
                "apiVersion": VarnishCluster::api_version(&()),
                "kind": VarnishCluster::kind(&()),
                "status": status,
            }));
            Api::<VarnishCluster>::namespaced(client, &ns)
                .patch_status(&self.name_any(), &PatchParams::apply(FIELD_MANAGER).force(), &patch)
                .await
                .map_err(kube_err)?;
        }

        // If no events were received, check back after the configured interval
        Ok(Action::requeue(ctx.config.requeue_interval))
    }

    // Finalizer cleanup (the object was deleted, ensure nothing is orphaned)
    async fn cleanup(&self, ctx: Arc<Context>) -> Result<Action> {
        let recorder = ctx.diagnostics.read().await.recorder(ctx.client.clone());
        delete_object::<ClusterRoleBinding, _>(
            &Api::<ClusterRoleBinding>::all(ctx.client.clone()),
            &cluster_role_binding_name(self),
        )
        .await?;
        delete_object::<ClusterRole, _>(&Api::<ClusterRole>::all(ctx.client.clone()), &cluster_role_name(self)).await?;

        self.publish(
            &recorder,
            EventType::Normal,
            "DeleteRequested",
            format!("Delete `{}`", self.name_any()),
        )
        .await;
        Ok(Action::await_change())
    }

    /// Events are best effort; a failure to record one never fails the pass.
    async fn publish(&self, recorder: &Recorder, type_: EventType, reason: &str, note: String) {
        let event = Event {
            type_,
            reason: reason.into(),
            note: Some(note),
            action: "Reconciling".into(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(&event, &self.object_ref(&())).await {
            warn!("failed to publish {reason} event: {e}");
        }
    }
}

fn deployment_selector(deployment: &Deployment) -> Option<Labels> {
    deployment.spec.as_ref()?.selector.match_labels.clone()
}

fn snapshot(service: &Service) -> ServiceSnapshot {
    ServiceSnapshot {
        ip: service.spec.as_ref().and_then(|s| s.cluster_ip.clone()),
        status: service.status.clone(),
    }
}

/// Status as derived from the applied objects
pub fn compute_status(
    no_cache: &Service,
    cached: &Service,
    deployment: &Deployment,
    varnish_selector: &Labels,
) -> VarnishClusterStatus {
    VarnishClusterStatus {
        service: VarnishClusterServiceStatus {
            cached: snapshot(cached),
            no_cache: snapshot(no_cache),
        },
        deployment: deployment.status.clone(),
        varnish_pods_selector: Some(selector_string(varnish_selector)),
    }
}

pub async fn reconcile(varnish_cluster: Arc<VarnishCluster>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = ctx.metrics.count_and_measure("varnishcluster");
    ctx.diagnostics.write().await.last_event = Utc::now();

    let ns = varnish_cluster
        .namespace()
        .ok_or_else(|| StdError::MetadataMissing("VarnishCluster has no namespace".to_string()))?;
    let varnish_clusters: Api<VarnishCluster> = Api::namespaced(ctx.client.clone(), &ns);

    info!("Reconciling VarnishCluster \"{}\" in {}", varnish_cluster.name_any(), ns);
    finalizer(
        &varnish_clusters,
        VARNISH_CLUSTER_FINALIZER,
        varnish_cluster.clone(),
        |event| async {
            match event {
                Finalizer::Apply(varnish_cluster) => varnish_cluster.reconcile(ctx.clone()).await,
                Finalizer::Cleanup(varnish_cluster) => varnish_cluster.cleanup(ctx.clone()).await,
            }
        },
    )
    .await
    .map_err(|e| Error::StdError(StdError::FinalizerError(Box::new(e))))
}

/// Decides retry vs. failure from the error class.
pub fn requeue_for(error: &Error, interval: Duration) -> (Action, bool) {
    if error.is_conflict() {
        return (Action::requeue(Duration::from_secs(1)), false);
    }
    if let Error::ErrorWithRequeue(e) = error {
        return (Action::requeue(e.duration), true);
    }
    if error.is_not_found() {
        return (Action::requeue(Duration::from_secs(10)), false);
    }
    (Action::requeue(interval), true)
}

fn error_policy(varnish_cluster: Arc<VarnishCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    let (action, is_failure) = requeue_for(error, ctx.config.requeue_interval);
    if is_failure {
        warn!("reconcile failed: {:?}", error);
        ctx.metrics.reconcile_failure(&varnish_cluster.name_any(), error);
    } else {
        debug!("reconcile of \"{}\" requeued: {}", varnish_cluster.name_any(), error);
    }
    action
}

/// Initialize the controller and shared state (given the crd is installed)
pub async fn run(state: State, config: OperatorConfig) -> Result<()> {
    let client = Client::try_default().await.map_err(kube_err)?;

    let varnish_clusters = Api::<VarnishCluster>::all(client.clone());
    if let Err(e) = varnish_clusters.list(&ListParams::default().limit(1)).await {
        error!("CRD is not queryable; {e:?}. Is the CRD installed?");
        info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
        return Err(kube_err(e));
    }

    let context = Context::new(client.clone(), config, &state)
        .map_err(|e| StdError::InvalidArgument(format!("metrics registration failed: {e}")))?;
    let owned = || Config::default().labels(LABEL_VARNISH_OWNER);

    Controller::new(varnish_clusters, Config::default().any_semantic())
        .owns(Api::<ServiceAccount>::all(client.clone()), owned())
        .owns(Api::<Role>::all(client.clone()), owned())
        .owns(Api::<RoleBinding>::all(client.clone()), owned())
        .owns(Api::<Service>::all(client.clone()), owned())
        .owns(Api::<Deployment>::all(client.clone()), owned())
        .owns(Api::<ConfigMap>::all(client.clone()), owned())
        .owns(Api::<PodDisruptionBudget>::all(client.clone()), owned())
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
    Ok(())
}
