use k8s_openapi::api::core::v1::ConfigMap;
use kube::{api::ObjectMeta, ResourceExt};
use serde_json::{json, Value};
use std::collections::BTreeMap;

use super::object::{apply_owned_metadata, owned_metadata, ManagedObject};
use crate::api::v1alpha1::{VarnishCluster, DEFAULT_BACKENDS_TEMPLATE};
use crate::util::labels::{combined_labels, COMPONENT_VCL_FILES};

pub const DEFAULT_BACKENDS_VCL: &str = r#"import directors;

{% for backend in backends %}
backend be_{{ loop.index0 }} {
    .host = "{{ backend.ip }}";
    .port = "{{ target_port }}";
}
{% endfor %}

sub vcl_init {
    new cluster = directors.round_robin();
{% for backend in backends %}
    cluster.add_backend(be_{{ loop.index0 }});
{% endfor %}
}
"#;

pub const DEFAULT_ENTRYPOINT_VCL: &str = r#"vcl 4.1;

include "backends.vcl";

sub vcl_recv {
    set req.backend_hint = cluster.backend();
}
"#;

/// VCL sources. Seeded with a working round-robin setup on creation only; the
/// data belongs to the user afterwards.
pub fn desired_config_map(vc: &VarnishCluster) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(vc.vcl_config_map_name()),
            namespace: vc.namespace(),
            labels: Some(combined_labels(vc, COMPONENT_VCL_FILES)),
            ..Default::default()
        },
        data: Some(BTreeMap::from([
            (vc.entrypoint_file(), DEFAULT_ENTRYPOINT_VCL.to_string()),
            (DEFAULT_BACKENDS_TEMPLATE.to_string(), DEFAULT_BACKENDS_VCL.to_string()),
        ])),
        ..Default::default()
    }
}

impl ManagedObject for ConfigMap {
    fn inherit_immutable(&mut self, observed: &Self) {
        self.data = observed.data.clone();
        self.binary_data = observed.binary_data.clone();
    }

    fn owned_sections(&self) -> Value {
        json!({ "metadata": owned_metadata(&self.metadata) })
    }

    fn apply_mutable(&self, observed: &mut Self) {
        apply_owned_metadata(&self.metadata, &mut observed.metadata);
    }
}
