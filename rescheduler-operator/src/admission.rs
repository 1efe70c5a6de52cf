//! Mutating admission: inject the scheduling hint into new pods.
//!
//! When a pod is created for an owner that carries a retry budget and a
//! non-empty excluded-host set, the pod gets `kse.com/scheduled-hosts`
//! listing those nodes. Every failure path admits the pod unchanged.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};

use crate::audit::audit_logger;
use crate::controller::resolver::{ResolvedOwner, resolve_owner};
use crate::error::OperatorResult;
use crate::ledger::{HINT_ANNOTATION, Ledger, codec};
use crate::owner::{OwnerKind, Workload};
use crate::store::ObjectStore;

const ADMISSION_API_VERSION: &str = "admission.k8s.io/v1";

/// `admission.k8s.io/v1` AdmissionReview envelope.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReview {
    /// API version of the envelope.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    /// Always `AdmissionReview`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Present on requests from the API server.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<AdmissionRequest>,
    /// Present on our replies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<AdmissionResponse>,
}

impl AdmissionReview {
    /// Wrap a response in a v1 envelope.
    pub fn reply(response: AdmissionResponse) -> Self {
        Self {
            api_version: Some(ADMISSION_API_VERSION.to_string()),
            kind: Some("AdmissionReview".to_string()),
            request: None,
            response: Some(response),
        }
    }
}

/// Group/version/kind of the admitted object.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct GroupVersionKind {
    /// API group; empty for core.
    #[serde(default)]
    pub group: String,
    /// API version.
    #[serde(default)]
    pub version: String,
    /// Kind.
    pub kind: String,
}

/// The part of an admission request the injector reads.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRequest {
    /// Request UID echoed in the response.
    pub uid: String,
    /// Kind of the admitted object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<GroupVersionKind>,
    /// CREATE, UPDATE, DELETE or CONNECT.
    pub operation: String,
    /// Namespace of the object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Object being admitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<Pod>,
}

/// Admission verdict.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionResponse {
    /// Request UID.
    pub uid: String,
    /// Always true; the injector never blocks pod creation.
    pub allowed: bool,
    /// Base64-encoded JSON patch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
    /// `JSONPatch` when `patch` is set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch_type: Option<String>,
}

impl AdmissionResponse {
    /// Admit without changes.
    pub fn allow(uid: &str) -> Self {
        Self {
            uid: uid.to_string(),
            allowed: true,
            ..Default::default()
        }
    }

    /// Admit with a JSON patch.
    pub fn patched(uid: &str, patch: &serde_json::Value) -> OperatorResult<Self> {
        Ok(Self {
            uid: uid.to_string(),
            allowed: true,
            patch: Some(STANDARD.encode(serde_json::to_vec(patch)?)),
            patch_type: Some("JSONPatch".to_string()),
        })
    }
}

/// Looks up ledgers for pods being admitted.
pub struct HintInjector<S> {
    store: S,
    system_namespace: String,
}

impl<S: ObjectStore> HintInjector<S> {
    /// Create an injector. Pods in `system_namespace` are never patched.
    pub fn new(store: S, system_namespace: impl Into<String>) -> Self {
        Self {
            store,
            system_namespace: system_namespace.into(),
        }
    }

    /// Review a request. Always admits; attaches a patch when a hint applies.
    pub async fn review(&self, request: &AdmissionRequest) -> AdmissionResponse {
        let allow = AdmissionResponse::allow(&request.uid);

        if request.operation != "CREATE" {
            return allow;
        }
        if request.kind.as_ref().is_some_and(|gvk| gvk.kind != "Pod") {
            return allow;
        }
        let Some(mut pod) = request.object.clone() else {
            return allow;
        };
        if pod.metadata.namespace.is_none() {
            pod.metadata.namespace = request.namespace.clone();
        }
        let namespace = pod.namespace().unwrap_or_default();
        if namespace == self.system_namespace || pod.owner_references().is_empty() {
            return allow;
        }

        let (owner, hosts) = match self.hint_for(&pod).await {
            Ok(Some(found)) => found,
            Ok(None) => return allow,
            Err(e) => {
                tracing::warn!(
                    namespace = %namespace,
                    pod = %pod_label(&pod),
                    error = %e,
                    "Hint lookup failed; admitting unchanged"
                );
                return allow;
            }
        };

        let patch = match hint_patch(&pod, &hosts) {
            Ok(patch) => patch,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to build hint patch");
                return allow;
            }
        };

        match AdmissionResponse::patched(&request.uid, &patch) {
            Ok(response) => {
                tracing::info!(
                    namespace = %namespace,
                    pod = %pod_label(&pod),
                    owner = %owner.object_ref(),
                    hosts = ?hosts,
                    "Injected scheduling hint"
                );
                audit_logger()
                    .hint_injected(&namespace, &pod_label(&pod), &owner.object_ref(), &hosts)
                    .log();
                response
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode hint patch");
                allow
            }
        }
    }

    /// Excluded hosts for a new pod, with the owner they came from.
    ///
    /// `None` when the owner is unmanaged, has no ledger, or its host set
    /// is empty.
    pub async fn hint_for(&self, pod: &Pod) -> OperatorResult<Option<(ResolvedOwner, Vec<String>)>> {
        let owner = resolve_owner(&self.store, pod).await?;
        if !owner.kind.receives_admission_hint() {
            return Ok(None);
        }

        let pod_name = pod.metadata.name.clone().unwrap_or_default();
        let ledger = match owner.kind {
            OwnerKind::Deployment => self.owner_ledger::<Deployment>(&owner, &pod_name).await?,
            OwnerKind::ReplicaSet => self.owner_ledger::<ReplicaSet>(&owner, &pod_name).await?,
            OwnerKind::StatefulSet => self.owner_ledger::<StatefulSet>(&owner, &pod_name).await?,
            OwnerKind::Job => self.owner_ledger::<Job>(&owner, &pod_name).await?,
            OwnerKind::CronJob => self.owner_ledger::<CronJob>(&owner, &pod_name).await?,
            OwnerKind::DaemonSet | OwnerKind::Pod => None,
        };

        Ok(ledger
            .filter(|l| !l.excluded_hosts.is_empty())
            .map(|l| (owner, l.hosts())))
    }

    async fn owner_ledger<K: Workload>(
        &self,
        owner: &ResolvedOwner,
        pod_name: &str,
    ) -> OperatorResult<Option<Ledger>> {
        let Some(workload) = self.store.get::<K>(&owner.namespace, &owner.name).await? else {
            return Ok(None);
        };
        let object = owner.object_ref();
        let annotations = workload.meta().annotations.as_ref();
        if codec::decode_budget(annotations, &object)?.is_none() {
            return Ok(None);
        }
        codec::decode(K::KIND.ledger_schema(), annotations, pod_name, &object)
    }
}

/// JSON patch adding the hint annotation.
///
/// Adds a single key when the pod already has annotations, otherwise adds
/// the whole map.
pub fn hint_patch(pod: &Pod, hosts: &[String]) -> OperatorResult<serde_json::Value> {
    let value = serde_json::to_string(hosts)?;
    let has_annotations = pod
        .metadata
        .annotations
        .as_ref()
        .is_some_and(|a| !a.is_empty());

    Ok(if has_annotations {
        serde_json::json!([{
            "op": "add",
            "path": format!("/metadata/annotations/{}", escape_pointer(HINT_ANNOTATION)),
            "value": value,
        }])
    } else {
        serde_json::json!([{
            "op": "add",
            "path": "/metadata/annotations",
            "value": { HINT_ANNOTATION: value },
        }])
    })
}

/// RFC 6901 token escaping.
fn escape_pointer(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

fn pod_label(pod: &Pod) -> String {
    pod.metadata
        .name
        .clone()
        .or_else(|| pod.metadata.generate_name.clone())
        .unwrap_or_default()
}
