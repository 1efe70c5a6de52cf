//! Resolve a pod to the workload that owns its retry ledger.

use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;

use crate::error::{OperatorError, OperatorResult};
use crate::owner::OwnerKind;
use crate::store::ObjectStore;

/// Canonical owner of a pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedOwner {
    /// Owner kind after collapsing intermediate controllers.
    pub kind: OwnerKind,
    /// Owner name. For bare pods, the pod's own name.
    pub name: String,
    /// Namespace shared by pod and owner.
    pub namespace: String,
}

impl ResolvedOwner {
    /// `Kind/namespace/name`.
    pub fn object_ref(&self) -> String {
        format!("{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// Controlling owner reference, or the first one when none is marked.
pub fn primary_owner(references: &[OwnerReference]) -> Option<&OwnerReference> {
    references
        .iter()
        .find(|r| r.controller == Some(true))
        .or_else(|| references.first())
}

/// Walk one level of ownership, plus ReplicaSet→Deployment and
/// Job→CronJob.
///
/// Fails with [`OperatorError::UnsupportedOwner`] for unmanaged kinds and
/// with [`OperatorError::NotFound`] when an intermediate parent is gone.
pub async fn resolve_owner<S: ObjectStore>(store: &S, pod: &Pod) -> OperatorResult<ResolvedOwner> {
    let namespace = pod.namespace().unwrap_or_default();

    let Some(owner) = primary_owner(pod.owner_references()) else {
        return Ok(ResolvedOwner {
            kind: OwnerKind::Pod,
            name: pod.name_any(),
            namespace,
        });
    };

    let kind =
        OwnerKind::from_reference_kind(&owner.kind).ok_or_else(|| OperatorError::UnsupportedOwner {
            kind: owner.kind.clone(),
        })?;

    let (kind, name) = match kind {
        OwnerKind::ReplicaSet => {
            let rs: ReplicaSet = fetch_parent(store, &namespace, &owner.name).await?;
            collapse(&rs, "Deployment", OwnerKind::Deployment, OwnerKind::ReplicaSet)
        }
        OwnerKind::Job => {
            let job: Job = fetch_parent(store, &namespace, &owner.name).await?;
            collapse(&job, "CronJob", OwnerKind::CronJob, OwnerKind::Job)
        }
        other => (other, owner.name.clone()),
    };

    Ok(ResolvedOwner {
        kind,
        name,
        namespace,
    })
}

async fn fetch_parent<S: ObjectStore, K: crate::store::StoredObject>(
    store: &S,
    namespace: &str,
    name: &str,
) -> OperatorResult<K> {
    store
        .get::<K>(namespace, name)
        .await?
        .ok_or_else(|| OperatorError::NotFound {
            kind: K::kind(&()).to_string(),
            name: name.to_string(),
            namespace: namespace.to_string(),
        })
}

fn collapse<K: kube::Resource>(
    parent: &K,
    grandparent_kind: &str,
    collapsed: OwnerKind,
    standalone: OwnerKind,
) -> (OwnerKind, String) {
    match primary_owner(parent.owner_references()) {
        Some(r) if r.kind == grandparent_kind => (collapsed, r.name.clone()),
        _ => (standalone, parent.name_any()),
    }
}
