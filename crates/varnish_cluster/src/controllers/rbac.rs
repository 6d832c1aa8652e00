use k8s_openapi::api::{
    core::v1::ServiceAccount,
    rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding, RoleRef, Subject},
};
use kube::{api::ObjectMeta, ResourceExt};
use serde_json::{json, Value};

use super::object::{apply_owned_metadata, owned_metadata, ManagedObject};
use crate::api::v1alpha1::VarnishCluster;
use crate::util::labels::{
    combined_labels, COMPONENT_CLUSTER_ROLE, COMPONENT_CLUSTER_ROLE_BINDING, COMPONENT_ROLE,
    COMPONENT_ROLE_BINDING, COMPONENT_SERVICE_ACCOUNT,
};

const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

fn rule(api_groups: &[&str], resources: &[&str], verbs: &[&str]) -> PolicyRule {
    let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    PolicyRule {
        api_groups: Some(strings(api_groups)),
        resources: Some(strings(resources)),
        verbs: strings(verbs),
        ..Default::default()
    }
}

fn namespaced_meta(vc: &VarnishCluster, name: String, component: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: vc.namespace(),
        labels: Some(combined_labels(vc, component)),
        ..Default::default()
    }
}

fn cluster_meta(vc: &VarnishCluster, name: String, component: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        labels: Some(combined_labels(vc, component)),
        ..Default::default()
    }
}

pub fn service_account_name(vc: &VarnishCluster) -> String {
    format!("{}-varnish-serviceaccount", vc.name_any())
}

pub fn role_name(vc: &VarnishCluster) -> String {
    format!("{}-varnish-role", vc.name_any())
}

pub fn role_binding_name(vc: &VarnishCluster) -> String {
    format!("{}-varnish-rolebinding", vc.name_any())
}

/// Cluster-scoped, so the namespace is part of the name
pub fn cluster_role_name(vc: &VarnishCluster) -> String {
    format!("{}-{}-varnish-clusterrole", vc.namespace().unwrap_or_default(), vc.name_any())
}

pub fn cluster_role_binding_name(vc: &VarnishCluster) -> String {
    format!(
        "{}-{}-varnish-clusterrolebinding",
        vc.namespace().unwrap_or_default(),
        vc.name_any()
    )
}

/// Identity of the varnish pods
pub fn desired_service_account(vc: &VarnishCluster) -> ServiceAccount {
    ServiceAccount {
        metadata: namespaced_meta(vc, service_account_name(vc), COMPONENT_SERVICE_ACCOUNT),
        ..Default::default()
    }
}

/// What the VCL controller reads and writes in its own namespace
pub fn desired_role(vc: &VarnishCluster) -> Role {
    Role {
        metadata: namespaced_meta(vc, role_name(vc), COMPONENT_ROLE),
        rules: Some(vec![
            rule(&[""], &["endpoints", "configmaps"], &["get", "list", "watch"]),
            rule(&["", "events.k8s.io"], &["events"], &["create", "patch"]),
            rule(&[""], &["pods"], &["get", "list", "watch", "patch"]),
            rule(&["caching.varnish-operator.io"], &["varnishclusters"], &["get", "list", "watch"]),
        ]),
    }
}

pub fn desired_role_binding(vc: &VarnishCluster, role_name: &str, service_account_name: &str) -> RoleBinding {
    RoleBinding {
        metadata: namespaced_meta(vc, role_binding_name(vc), COMPONENT_ROLE_BINDING),
        role_ref: RoleRef {
            api_group: RBAC_API_GROUP.to_string(),
            kind: "Role".to_string(),
            name: role_name.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: service_account_name.to_string(),
            namespace: vc.namespace(),
            ..Default::default()
        }]),
    }
}

/// Node labels are exposed to the VCL templates, and nodes are cluster-scoped
pub fn desired_cluster_role(vc: &VarnishCluster) -> ClusterRole {
    ClusterRole {
        metadata: cluster_meta(vc, cluster_role_name(vc), COMPONENT_CLUSTER_ROLE),
        rules: Some(vec![rule(&[""], &["nodes"], &["get", "list", "watch"])]),
        ..Default::default()
    }
}

pub fn desired_cluster_role_binding(
    vc: &VarnishCluster,
    cluster_role_name: &str,
    service_account_name: &str,
) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: cluster_meta(vc, cluster_role_binding_name(vc), COMPONENT_CLUSTER_ROLE_BINDING),
        role_ref: RoleRef {
            api_group: RBAC_API_GROUP.to_string(),
            kind: "ClusterRole".to_string(),
            name: cluster_role_name.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: service_account_name.to_string(),
            namespace: vc.namespace(),
            ..Default::default()
        }]),
    }
}

impl ManagedObject for ServiceAccount {
    fn owned_sections(&self) -> Value {
        json!({ "metadata": owned_metadata(&self.metadata) })
    }

    fn apply_mutable(&self, observed: &mut Self) {
        apply_owned_metadata(&self.metadata, &mut observed.metadata);
    }
}

impl ManagedObject for Role {
    fn owned_sections(&self) -> Value {
        json!({ "metadata": owned_metadata(&self.metadata), "rules": self.rules })
    }

    fn apply_mutable(&self, observed: &mut Self) {
        apply_owned_metadata(&self.metadata, &mut observed.metadata);
        observed.rules = self.rules.clone();
    }
}

impl ManagedObject for ClusterRole {
    fn owned_sections(&self) -> Value {
        json!({ "metadata": owned_metadata(&self.metadata), "rules": self.rules })
    }

    fn apply_mutable(&self, observed: &mut Self) {
        apply_owned_metadata(&self.metadata, &mut observed.metadata);
        observed.rules = self.rules.clone();
    }
}

impl ManagedObject for RoleBinding {
    /// roleRef cannot be changed after creation
    fn inherit_immutable(&mut self, observed: &Self) {
        self.role_ref = observed.role_ref.clone();
    }

    fn owned_sections(&self) -> Value {
        json!({ "metadata": owned_metadata(&self.metadata), "subjects": self.subjects })
    }

    fn apply_mutable(&self, observed: &mut Self) {
        apply_owned_metadata(&self.metadata, &mut observed.metadata);
        observed.subjects = self.subjects.clone();
    }
}

impl ManagedObject for ClusterRoleBinding {
    fn inherit_immutable(&mut self, observed: &Self) {
        self.role_ref = observed.role_ref.clone();
    }

    fn owned_sections(&self) -> Value {
        json!({ "metadata": owned_metadata(&self.metadata), "subjects": self.subjects })
    }

    fn apply_mutable(&self, observed: &mut Self) {
        apply_owned_metadata(&self.metadata, &mut observed.metadata);
        observed.subjects = self.subjects.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::object::{reconcile_object, Change};
    use crate::fixtures::{varnish_cluster, FakeApi};
    use crate::util::labels::LABEL_VARNISH_COMPONENT;
    use kube::Resource;

    #[tokio::test]
    async fn creates_missing_service_account_with_owner() {
        let vc = varnish_cluster();
        let api = FakeApi::<ServiceAccount>::new(vec![]);
        let oref = vc.controller_owner_ref(&()).unwrap();

        let applied = reconcile_object(&api, Some(&oref), desired_service_account(&vc))
            .await
            .unwrap();

        assert_eq!(applied.change, Change::Created);
        assert_eq!(api.calls(), vec!["get web-varnish-serviceaccount", "create web-varnish-serviceaccount"]);
        let stored = api.stored("web-varnish-serviceaccount").unwrap();
        assert_eq!(stored.owner_references()[0].uid, "uid-1");
        assert_eq!(stored.labels()[LABEL_VARNISH_COMPONENT], COMPONENT_SERVICE_ACCOUNT);
    }

    #[tokio::test]
    async fn second_pass_is_a_no_op() {
        let vc = varnish_cluster();
        let api = FakeApi::<Role>::new(vec![]);
        let oref = vc.controller_owner_ref(&()).unwrap();

        reconcile_object(&api, Some(&oref), desired_role(&vc)).await.unwrap();
        let applied = reconcile_object(&api, Some(&oref), desired_role(&vc)).await.unwrap();

        assert_eq!(applied.change, Change::Unchanged);
        assert_eq!(api.calls().iter().filter(|c| c.starts_with("update")).count(), 0);
    }

    #[tokio::test]
    async fn changed_rules_are_written_back() {
        let vc = varnish_cluster();
        let mut stale = desired_role(&vc);
        stale.rules = Some(vec![rule(&[""], &["pods"], &["get"])]);
        stale.metadata.resource_version = Some("7".to_string());
        let api = FakeApi::new(vec![stale]);

        let applied = reconcile_object(&api, None, desired_role(&vc)).await.unwrap();

        assert_eq!(applied.change, Change::Updated);
        assert_eq!(applied.object.rules, desired_role(&vc).rules);
        assert_eq!(applied.object.metadata.resource_version.as_deref(), Some("7"));
    }

    #[tokio::test]
    async fn role_ref_is_never_rewritten() {
        let vc = varnish_cluster();
        let existing = desired_role_binding(&vc, "legacy-role", "web-varnish-serviceaccount");
        let api = FakeApi::new(vec![existing]);

        let desired = desired_role_binding(&vc, &role_name(&vc), &service_account_name(&vc));
        let applied = reconcile_object(&api, None, desired).await.unwrap();

        assert_eq!(applied.change, Change::Unchanged);
        assert_eq!(applied.object.role_ref.name, "legacy-role");
    }

    #[test]
    fn cluster_scoped_names_include_the_namespace() {
        let vc = varnish_cluster();
        let binding = desired_cluster_role_binding(&vc, &cluster_role_name(&vc), &service_account_name(&vc));
        assert_eq!(binding.name_any(), "default-web-varnish-clusterrolebinding");
        assert_eq!(binding.role_ref.name, "default-web-varnish-clusterrole");
        assert!(binding.metadata.namespace.is_none());
        assert_eq!(binding.subjects.unwrap()[0].namespace.as_deref(), Some("default"));
    }
}
