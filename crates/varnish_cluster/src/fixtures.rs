//! Objects shared by the unit tests
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{api::ObjectMeta, Resource};

use crate::api::v1alpha1::{
    VarnishCluster, VarnishClusterBackend, VarnishClusterService, VarnishClusterSpec,
    VarnishServicePort,
};
use crate::controllers::object::ObjectApi;
use crate::util::errors::StdError;
use crate::vcl::reload::{CommandOutput, CommandRunner, EventSink};

pub fn varnish_cluster() -> VarnishCluster {
    VarnishCluster {
        metadata: ObjectMeta {
            name: Some("web".to_string()),
            namespace: Some("default".to_string()),
            uid: Some("uid-1".to_string()),
            labels: Some(BTreeMap::from([("team".to_string(), "edge".to_string())])),
            ..Default::default()
        },
        spec: VarnishClusterSpec {
            backend: VarnishClusterBackend {
                selector: BTreeMap::from([("app".to_string(), "web".to_string())]),
            },
            service: VarnishClusterService {
                ports: vec![VarnishServicePort {
                    port: 80,
                    target_port: Some(IntOrString::Int(8080)),
                    ..Default::default()
                }],
                ..Default::default()
            },
            ..Default::default()
        },
        status: None,
    }
}

pub fn api_error(code: u16, reason: &str) -> kube::Error {
    kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{reason} happened"),
        reason: reason.to_string(),
        code,
    })
}

/// In-memory `ObjectApi` that records every call
pub struct FakeApi<K> {
    pub objects: Mutex<BTreeMap<String, K>>,
    pub calls: Mutex<Vec<String>>,
    pub conflict_on_update: bool,
}

impl<K: Resource + Clone> FakeApi<K> {
    pub fn new(existing: Vec<K>) -> Self {
        let objects = existing
            .into_iter()
            .map(|o| (o.meta().name.clone().unwrap_or_default(), o))
            .collect();
        Self {
            objects: Mutex::new(objects),
            calls: Mutex::new(Vec::new()),
            conflict_on_update: false,
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn stored(&self, name: &str) -> Option<K> {
        self.objects.lock().unwrap().get(name).cloned()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl<K: Resource + Clone + Send + Sync> ObjectApi<K> for FakeApi<K> {
    async fn fetch(&self, name: &str) -> Result<Option<K>, kube::Error> {
        self.record(format!("get {name}"));
        Ok(self.stored(name))
    }

    async fn create_new(&self, object: &K) -> Result<K, kube::Error> {
        let name = object.meta().name.clone().unwrap_or_default();
        self.record(format!("create {name}"));
        let mut object = object.clone();
        object.meta_mut().resource_version = Some("1".to_string());
        self.objects.lock().unwrap().insert(name, object.clone());
        Ok(object)
    }

    async fn update(&self, name: &str, object: &K) -> Result<K, kube::Error> {
        self.record(format!("update {name}"));
        if self.conflict_on_update {
            return Err(api_error(409, "Conflict"));
        }
        self.objects.lock().unwrap().insert(name.to_string(), object.clone());
        Ok(object.clone())
    }

    async fn remove(&self, name: &str) -> Result<(), kube::Error> {
        self.record(format!("delete {name}"));
        match self.objects.lock().unwrap().remove(name) {
            Some(_) => Ok(()),
            None => Err(api_error(404, "NotFound")),
        }
    }
}

/// Command runner answering `vcl_list` with fixed output and every other command with
/// queued results, success once the queue is empty
pub struct FakeRunner {
    pub list_output: Mutex<String>,
    pub reload_results: Mutex<VecDeque<CommandOutput>>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeRunner {
    pub fn new(list_output: &str) -> Self {
        Self {
            list_output: Mutex::new(list_output.to_string()),
            reload_results: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_reload_failure(self, output: &str) -> Self {
        self.reload_results.lock().unwrap().push_back(CommandOutput {
            success: false,
            output: output.to_string(),
        });
        self
    }

    pub fn set_list_output(&self, output: &str) {
        *self.list_output.lock().unwrap() = output.to_string();
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, command: &str, args: &[String]) -> Result<CommandOutput, StdError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{command} {}", args.join(" ")).trim().to_string());
        if command == "vcl_list" {
            return Ok(CommandOutput {
                success: true,
                output: self.list_output.lock().unwrap().clone(),
            });
        }
        Ok(self.reload_results.lock().unwrap().pop_front().unwrap_or(CommandOutput {
            success: true,
            output: "VCL compiled.\n".to_string(),
        }))
    }
}

/// Records warnings as (kind, reason, note)
#[derive(Default)]
pub struct FakeEvents {
    pub events: Mutex<Vec<(String, String, String)>>,
}

impl FakeEvents {
    pub fn recorded(&self) -> Vec<(String, String, String)> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventSink for FakeEvents {
    async fn warning(&self, target: &ObjectReference, reason: &str, note: String) {
        self.events.lock().unwrap().push((
            target.kind.clone().unwrap_or_default(),
            reason.to_string(),
            note,
        ));
    }
}

pub fn object_reference(kind: &str, name: &str) -> ObjectReference {
    ObjectReference {
        kind: Some(kind.to_string()),
        name: Some(name.to_string()),
        ..Default::default()
    }
}
