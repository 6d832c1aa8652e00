//! The per-pod VCL controller running next to varnishd.
//!
//! Each pass renders the VCL ConfigMap against the current backend topology, syncs the
//! result into the VCL directory and, when anything changed, loads it as a new named
//! configuration.

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::{
    api::core::v1::{ConfigMap, Endpoints, Pod},
    apimachinery::pkg::util::intstr::IntOrString,
};
use kube::{
    api::{Api, Patch, PatchParams, ResourceExt},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        reflector::ObjectRef,
        watcher::Config,
    },
    Resource,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::{sync::RwLock, time::Duration};
use tracing::*;

use super::backends::{resolve_backends, EndpointSource, KubeEndpointSource};
use super::files::{read_current_files, sync_files};
use super::reload::{
    config_name_to_source_revision, vcl_config_name, CommandRunner, EventSink, ProcessRunner, ReloadTargets,
    VarnishAdmin,
};
use super::templates::{
    merge_rendered, render_templates, split_files_and_templates, verify_entrypoint, FileSet, TemplateContext,
};
use crate::api::v1alpha1::{VarnishCluster, VARNISH_PORT};
use crate::controllers::cluster_controller::requeue_for;
use crate::controllers::service::NO_CACHE_PORT_NAME;
use crate::util::config::SidecarConfig;
use crate::util::errors::{Error, Result, StdError};
use crate::util::labels::{component_labels, component_selector, selector_string, Labels, COMPONENT_CACHE_SERVICE};
use crate::util::metrics::Metrics;
use crate::util::state::{Diagnostics, State};

pub const REPORTER: &str = "varnish-controller";
pub const ANNOTATION_ACTIVE_VCL: &str = "varnish-operator.io/active-vcl";
pub const ANNOTATION_CONFIGMAP_VERSION: &str = "varnish-operator.io/configmap-version";

const RESYNC_INTERVAL: Duration = Duration::from_secs(300);
const RETRY_INTERVAL: Duration = Duration::from_secs(30);

pub struct Context {
    pub client: Client,
    pub config: SidecarConfig,
    pub admin: VarnishAdmin<ProcessRunner>,
    /// Set while synced files have not been loaded into varnishd yet
    pub reload_pending: AtomicBool,
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    pub metrics: Metrics,
}

impl Context {
    pub fn new(client: Client, config: SidecarConfig, state: &State) -> Result<Arc<Self>, prometheus::Error> {
        let admin = VarnishAdmin::new(
            ProcessRunner {
                timeout: config.command_timeout,
            },
            &config.list_command,
            &config.reload_command,
        );
        Ok(Arc::new(Context {
            client,
            config,
            admin,
            reload_pending: AtomicBool::new(false),
            diagnostics: state.diagnostics_handle(),
            metrics: state.register_metrics()?,
        }))
    }
}

fn kube_err(e: kube::Error) -> Error {
    Error::StdError(StdError::KubeError(e))
}

/// The full VCL file set for `cluster`: static files plus templates rendered against
/// the backends behind `endpoint_selector` and the varnish pods of the cluster.
pub async fn desired_files<S>(
    source: &S,
    cluster: &VarnishCluster,
    data: &BTreeMap<String, String>,
    endpoint_selector: &Labels,
) -> Result<FileSet>
where
    S: EndpointSource + ?Sized,
{
    let (files, templates) = split_files_and_templates(data);
    verify_entrypoint(&files, &templates, &cluster.entrypoint_file())?;

    // The no-cache Endpoints name their port after the Service port, whatever the target
    let backend_port = IntOrString::String(NO_CACHE_PORT_NAME.to_string());
    let (backends, target_port) = resolve_backends(source, endpoint_selector, &backend_port).await?;
    let (varnish_nodes, varnish_port) = resolve_backends(
        source,
        &component_labels(cluster, COMPONENT_CACHE_SERVICE),
        &IntOrString::Int(VARNISH_PORT),
    )
    .await?;

    let rendered = render_templates(
        &templates,
        &TemplateContext {
            backends,
            target_port,
            varnish_nodes,
            varnish_port,
        },
    )?;
    Ok(merge_rendered(files, rendered)?)
}

/// Syncs `desired` into `dir` and loads it when files changed, or when an earlier
/// load did not go through. Returns the name of the loaded configuration.
#[allow(clippy::too_many_arguments)]
pub async fn apply_files<R: CommandRunner>(
    dir: &Path,
    desired: &FileSet,
    revision: &str,
    reload_pending: &AtomicBool,
    admin: &VarnishAdmin<R>,
    events: &dyn EventSink,
    targets: &ReloadTargets<'_>,
    metrics: &Metrics,
) -> Result<Option<String>> {
    let current = read_current_files(dir).await?;
    if sync_files(dir, &current, desired).await? {
        reload_pending.store(true, Ordering::SeqCst);
    }
    if !reload_pending.load(Ordering::SeqCst) {
        return Ok(None);
    }

    let name = vcl_config_name(revision, Utc::now());
    match admin.reload(&name, targets, events).await {
        Ok(()) => {
            reload_pending.store(false, Ordering::SeqCst);
            metrics.vcl_reload("success");
            Ok(Some(name))
        }
        Err(e) => {
            metrics.vcl_reload(&e.metric_label());
            Err(e)
        }
    }
}

/// Merge patch recording the active configuration on the pod, None when already recorded.
pub fn pod_annotation_patch(pod: &Pod, active_vcl: &str) -> Option<serde_json::Value> {
    let desired = BTreeMap::from([
        (ANNOTATION_ACTIVE_VCL.to_string(), active_vcl.to_string()),
        (
            ANNOTATION_CONFIGMAP_VERSION.to_string(),
            config_name_to_source_revision(active_vcl),
        ),
    ]);
    let annotations = pod.annotations();
    if desired.iter().all(|(k, v)| annotations.get(k) == Some(v)) {
        return None;
    }
    Some(json!({ "metadata": { "annotations": desired } }))
}

pub async fn reconcile(config_map: Arc<ConfigMap>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = ctx.metrics.count_and_measure("vcl");
    ctx.diagnostics.write().await.last_event = Utc::now();

    let cfg = &ctx.config;
    let client = ctx.client.clone();
    info!("Syncing VCL from ConfigMap \"{}\"", config_map.name_any());

    let cluster = Api::<VarnishCluster>::namespaced(client.clone(), &cfg.namespace)
        .get(&cfg.varnish_cluster_name)
        .await
        .map_err(kube_err)?;
    let pods = Api::<Pod>::namespaced(client.clone(), &cfg.namespace);
    let pod = pods.get(&cfg.pod_name).await.map_err(kube_err)?;

    let data = config_map.data.clone().unwrap_or_default();
    let source = KubeEndpointSource::new(client.clone(), &cfg.namespace);
    let desired = desired_files(&source, &cluster, &data, &cfg.endpoint_selector).await?;

    let recorder = ctx.diagnostics.read().await.recorder(client);
    let pod_ref = pod.object_ref(&());
    let cluster_ref = cfg.cluster_reference();
    let targets = ReloadTargets {
        pod: &pod_ref,
        cluster: &cluster_ref,
    };
    let revision = config_map.resource_version().unwrap_or_default();
    apply_files(
        &cfg.vcl_dir,
        &desired,
        &revision,
        &ctx.reload_pending,
        &ctx.admin,
        &recorder,
        &targets,
        &ctx.metrics,
    )
    .await?;

    let active = ctx.admin.current_active_configuration().await?;
    ctx.diagnostics.write().await.active_vcl = Some(active.name.clone());
    if let Some(patch) = pod_annotation_patch(&pod, &active.name) {
        debug!(vcl = %active.name, "Annotating pod with the active VCL");
        pods.patch(&cfg.pod_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(kube_err)?;
    }

    Ok(Action::requeue(RESYNC_INTERVAL))
}

fn error_policy(config_map: Arc<ConfigMap>, error: &Error, ctx: Arc<Context>) -> Action {
    let (action, is_failure) = requeue_for(error, RETRY_INTERVAL);
    if is_failure {
        warn!("VCL sync failed: {:?}", error);
        ctx.metrics.reconcile_failure(&config_map.name_any(), error);
    } else {
        debug!("VCL sync of \"{}\" requeued: {}", config_map.name_any(), error);
    }
    action
}

/// Watches the VCL ConfigMap, the cluster and both Endpoints sets, syncing on every change.
pub async fn run(state: State, config: SidecarConfig) -> Result<()> {
    let client = Client::try_default().await.map_err(kube_err)?;
    let ns = config.namespace.clone();
    let cm_name = config.config_map_name.clone();

    let config_maps = Api::<ConfigMap>::namespaced(client.clone(), &ns);
    let clusters = Api::<VarnishCluster>::namespaced(client.clone(), &ns);
    let endpoints = Api::<Endpoints>::namespaced(client.clone(), &ns);
    let varnish_selector = component_selector(
        &config.varnish_cluster_name,
        &config.varnish_cluster_uid,
        COMPONENT_CACHE_SERVICE,
    );

    let by_name = |name: &str| Config::default().fields(&format!("metadata.name={name}"));
    let to_config_map = {
        let (name, ns) = (cm_name.clone(), ns.clone());
        move || Some(ObjectRef::<ConfigMap>::new(&name).within(&ns))
    };
    let (on_cluster, on_backends, on_varnish) = (to_config_map.clone(), to_config_map.clone(), to_config_map);

    let backend_watch = Config::default().labels(&config.endpoint_selector_string);
    let cluster_watch = by_name(&config.varnish_cluster_name);
    let context = Context::new(client, config, &state)
        .map_err(|e| StdError::InvalidArgument(format!("metrics registration failed: {e}")))?;

    Controller::new(config_maps, by_name(&cm_name))
        .watches(clusters, cluster_watch, move |_| on_cluster())
        .watches(endpoints.clone(), backend_watch, move |_| on_backends())
        .watches(endpoints, Config::default().labels(&selector_string(&varnish_selector)), move |_| {
            on_varnish()
        })
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
    Ok(())
}
