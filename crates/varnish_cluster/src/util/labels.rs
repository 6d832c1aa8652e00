use std::collections::BTreeMap;

use kube::ResourceExt;

pub const LABEL_VARNISH_OWNER: &str = "varnish-owner";
pub const LABEL_VARNISH_COMPONENT: &str = "varnish-component";
pub const LABEL_VARNISH_UID: &str = "varnish-uid";

pub const COMPONENT_VARNISH: &str = "varnish";
pub const COMPONENT_CACHE_SERVICE: &str = "cache-service";
pub const COMPONENT_NO_CACHE_SERVICE: &str = "no-cache-service";
pub const COMPONENT_SERVICE_ACCOUNT: &str = "serviceaccount";
pub const COMPONENT_ROLE: &str = "role";
pub const COMPONENT_ROLE_BINDING: &str = "rolebinding";
pub const COMPONENT_CLUSTER_ROLE: &str = "clusterrole";
pub const COMPONENT_CLUSTER_ROLE_BINDING: &str = "clusterrolebinding";
pub const COMPONENT_VCL_FILES: &str = "vcl-files";
pub const COMPONENT_PDB: &str = "poddisruptionbudget";

pub type Labels = BTreeMap<String, String>;

/// Labels copied verbatim from the owner.
pub fn inherited_labels<K: ResourceExt>(owner: &K) -> Labels {
    owner.labels().clone()
}

/// The generated subset. Only built from fields that never change for the owner's
/// lifetime, so it is safe to use as an immutable selector.
pub fn component_labels<K: ResourceExt>(owner: &K, component: &str) -> Labels {
    component_selector(&owner.name_any(), &owner.uid().unwrap_or_default(), component)
}

/// Same as [`component_labels`] when only the owner's name and uid are at hand.
pub fn component_selector(owner_name: &str, owner_uid: &str, component: &str) -> Labels {
    BTreeMap::from([
        (LABEL_VARNISH_OWNER.to_string(), owner_name.to_string()),
        (LABEL_VARNISH_COMPONENT.to_string(), component.to_string()),
        (LABEL_VARNISH_UID.to_string(), owner_uid.to_string()),
    ])
}

/// Inherited labels overlaid with the generated ones; generated keys win.
pub fn combined_labels<K: ResourceExt>(owner: &K, component: &str) -> Labels {
    let mut labels = inherited_labels(owner);
    labels.extend(component_labels(owner, component));
    labels
}

/// Equality-based selector string, `k=v` pairs in key order.
pub fn selector_string(labels: &Labels) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Parses an equality-based selector (`a=b,c==d`) back into a label set.
pub fn parse_selector(selector: &str) -> Result<Labels, String> {
    let mut labels = Labels::new();
    for term in selector.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let (key, value) = term
            .split_once("==")
            .or_else(|| term.split_once('='))
            .ok_or_else(|| format!("selector term '{term}' is not of the form key=value"))?;
        let key = key.trim();
        if key.is_empty() || key.ends_with('!') {
            return Err(format!("selector term '{term}' is not an equality requirement"));
        }
        labels.insert(key.to_string(), value.trim().to_string());
    }
    Ok(labels)
}
