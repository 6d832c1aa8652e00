//! Create / update-if-different / no-op for every object a `VarnishCluster` owns.

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{
    api::{Api, DeleteParams, PostParams},
    Resource,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use std::fmt::Debug;
use tracing::{debug, info};

use crate::util::diff::semantic_diff;
use crate::util::errors::{Error, Result, StdError};

/// Typed access to one kind, scoped to a namespace (or the cluster).
#[async_trait]
pub trait ObjectApi<K>: Send + Sync {
    /// `None` when the object does not exist
    async fn fetch(&self, name: &str) -> Result<Option<K>, kube::Error>;
    async fn create_new(&self, object: &K) -> Result<K, kube::Error>;
    async fn update(&self, name: &str, object: &K) -> Result<K, kube::Error>;
    async fn remove(&self, name: &str) -> Result<(), kube::Error>;
}

#[async_trait]
impl<K> ObjectApi<K> for Api<K>
where
    K: Resource + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn fetch(&self, name: &str) -> Result<Option<K>, kube::Error> {
        self.get_opt(name).await
    }

    async fn create_new(&self, object: &K) -> Result<K, kube::Error> {
        self.create(&PostParams::default(), object).await
    }

    async fn update(&self, name: &str, object: &K) -> Result<K, kube::Error> {
        self.replace(name, &PostParams::default(), object).await
    }

    async fn remove(&self, name: &str) -> Result<(), kube::Error> {
        self.delete(name, &DeleteParams::background()).await.map(|_| ())
    }
}

/// Kind-specific rules of the generic reconciler
pub trait ManagedObject:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Fill in what the API server would default, so a fresh desired object compares equal
    fn apply_defaults(&mut self) {}

    /// Copy fields the platform assigned, or that must never change, from `observed`
    fn inherit_immutable(&mut self, _observed: &Self) {}

    /// The parts of the object this operator manages, as compared against the cluster
    fn owned_sections(&self) -> Value;

    /// Overwrite the managed parts of `observed` with ours
    fn apply_mutable(&self, observed: &mut Self);
}

/// Labels and owner references, managed on every kind
pub fn owned_metadata(meta: &ObjectMeta) -> Value {
    json!({
        "labels": meta.labels,
        "ownerReferences": meta.owner_references,
    })
}

pub fn apply_owned_metadata(desired: &ObjectMeta, observed: &mut ObjectMeta) {
    observed.labels = desired.labels.clone();
    observed.owner_references = desired.owner_references.clone();
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Change {
    Created,
    Updated,
    Unchanged,
}

/// The object as stored after the reconcile, and what was done to get there
#[derive(Clone, Debug)]
pub struct Applied<K> {
    pub object: K,
    pub change: Change,
}

/// Converges one object towards `desired`.
///
/// `owner` is stamped as the controller reference; cluster-scoped kinds pass `None`.
/// A conflicting update is returned as an error for the caller to classify.
pub async fn reconcile_object<K, A>(api: &A, owner: Option<&OwnerReference>, mut desired: K) -> Result<Applied<K>>
where
    K: ManagedObject,
    A: ObjectApi<K> + ?Sized,
{
    let kind = K::kind(&()).to_string();
    let name = desired
        .meta()
        .name
        .clone()
        .ok_or_else(|| StdError::MetadataMissing(format!("desired {kind} has no name")))?;

    if let Some(oref) = owner {
        desired.meta_mut().owner_references = Some(vec![oref.clone()]);
    }
    desired.apply_defaults();

    let observed = api
        .fetch(&name)
        .await
        .map_err(|e| Error::StdError(StdError::KubeError(e)))?;

    let Some(mut observed) = observed else {
        info!(%kind, %name, "Creating object");
        let created = api
            .create_new(&desired)
            .await
            .map_err(|e| Error::StdError(StdError::KubeError(e)))?;
        return Ok(Applied {
            object: created,
            change: Change::Created,
        });
    };

    desired.inherit_immutable(&observed);
    let diff = semantic_diff(&desired.owned_sections(), &observed.owned_sections());
    if diff.is_empty() {
        debug!(%kind, %name, "No updates for object");
        return Ok(Applied {
            object: observed,
            change: Change::Unchanged,
        });
    }

    info!(%kind, %name, ?diff, "Updating object");
    desired.apply_mutable(&mut observed);
    let updated = api
        .update(&name, &observed)
        .await
        .map_err(|e| Error::StdError(StdError::KubeError(e)))?;
    Ok(Applied {
        object: updated,
        change: Change::Updated,
    })
}

/// Removes an object that should no longer exist. Already gone is success.
pub async fn delete_object<K, A>(api: &A, name: &str) -> Result<bool>
where
    K: ManagedObject,
    A: ObjectApi<K> + ?Sized,
{
    match api.remove(name).await {
        Ok(()) => {
            info!(kind = %K::kind(&()), %name, "Deleted object");
            Ok(true)
        }
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
        Err(e) => Err(Error::StdError(StdError::KubeError(e))),
    }
}
