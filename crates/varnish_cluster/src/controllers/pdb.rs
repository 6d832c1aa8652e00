use k8s_openapi::{
    api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec},
    apimachinery::pkg::apis::meta::v1::LabelSelector,
};
use kube::{api::ObjectMeta, ResourceExt};
use serde_json::{json, Value};

use super::object::{apply_owned_metadata, owned_metadata, ManagedObject};
use crate::api::v1alpha1::VarnishCluster;
use crate::util::labels::{combined_labels, Labels, COMPONENT_PDB};

pub fn pdb_name(vc: &VarnishCluster) -> String {
    format!("{}-varnish-pdb", vc.name_any())
}

/// `None` when the cluster does not ask for a budget
pub fn desired_pdb(vc: &VarnishCluster, pod_selector: &Labels) -> Option<PodDisruptionBudget> {
    let budget = vc.spec.pod_disruption_budget.as_ref()?;
    Some(PodDisruptionBudget {
        metadata: ObjectMeta {
            name: Some(pdb_name(vc)),
            namespace: vc.namespace(),
            labels: Some(combined_labels(vc, COMPONENT_PDB)),
            ..Default::default()
        },
        spec: Some(PodDisruptionBudgetSpec {
            min_available: budget.min_available.clone(),
            max_unavailable: budget.max_unavailable.clone(),
            selector: Some(LabelSelector {
                match_labels: Some(pod_selector.clone()),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    })
}

impl ManagedObject for PodDisruptionBudget {
    fn owned_sections(&self) -> Value {
        json!({ "metadata": owned_metadata(&self.metadata), "spec": self.spec })
    }

    fn apply_mutable(&self, observed: &mut Self) {
        apply_owned_metadata(&self.metadata, &mut observed.metadata);
        observed.spec = self.spec.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::v1alpha1::VarnishClusterPodDisruptionBudget;
    use crate::controllers::object::{delete_object, reconcile_object, Change};
    use crate::fixtures::{varnish_cluster, FakeApi};
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

    #[tokio::test]
    async fn budget_follows_the_cluster_settings() {
        let mut vc = varnish_cluster();
        let selector = Labels::from([("varnish-component".to_string(), "varnish".to_string())]);
        assert!(desired_pdb(&vc, &selector).is_none());

        vc.spec.pod_disruption_budget = Some(VarnishClusterPodDisruptionBudget {
            min_available: Some(IntOrString::Int(1)),
            max_unavailable: None,
        });
        let api = FakeApi::<PodDisruptionBudget>::new(vec![]);
        let applied = reconcile_object(&api, None, desired_pdb(&vc, &selector).unwrap())
            .await
            .unwrap();
        assert_eq!(applied.change, Change::Created);

        vc.spec.pod_disruption_budget = Some(VarnishClusterPodDisruptionBudget {
            min_available: None,
            max_unavailable: Some(IntOrString::String("25%".to_string())),
        });
        let applied = reconcile_object(&api, None, desired_pdb(&vc, &selector).unwrap())
            .await
            .unwrap();
        assert_eq!(applied.change, Change::Updated);
        let spec = applied.object.spec.unwrap();
        assert_eq!(spec.min_available, None);
        assert_eq!(spec.max_unavailable, Some(IntOrString::String("25%".to_string())));
    }

    #[tokio::test]
    async fn deleting_a_missing_budget_is_success() {
        let api = FakeApi::<PodDisruptionBudget>::new(vec![]);
        assert!(!delete_object::<PodDisruptionBudget, _>(&api, "web-varnish-pdb").await.unwrap());
        assert_eq!(api.calls(), vec!["delete web-varnish-pdb"]);
    }
}
