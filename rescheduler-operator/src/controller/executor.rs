//! Applies policy actions to the object store.
//!
//! In-place owners get their ledger annotation updated through a
//! read-modify-write loop, then the pod is deleted. Owners with immutable
//! selectors (Job, CronJob) and bare pods are deleted and created again
//! with the new ledger folded into the copy. If the copy cannot be created,
//! its manifest is logged and audited so the object can be restored by hand.

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use super::resolver::ResolvedOwner;
use crate::audit::audit_logger;
use crate::error::{OperatorError, OperatorResult};
use crate::ledger::{Ledger, render};
use crate::owner::{MutationStrategy, Workload};
use crate::policy::Action;
use crate::retry::{Backoff, retry_on_conflict, retry_while};
use crate::store::{ObjectStore, object_ref};

/// Applies [`Action`]s against a store.
pub struct MutationExecutor<'a, S> {
    store: &'a S,
    backoff: Backoff,
    recreate_backoff: Backoff,
}

impl<'a, S: ObjectStore> MutationExecutor<'a, S> {
    /// Create an executor over `store`.
    pub fn new(store: &'a S, backoff: Backoff) -> Self {
        Self {
            store,
            backoff,
            recreate_backoff: Backoff::recreate(),
        }
    }

    /// Backoff for creating a copy while the deleted original terminates.
    pub fn with_recreate_backoff(mut self, backoff: Backoff) -> Self {
        self.recreate_backoff = backoff;
        self
    }

    /// Persist the action's ledger on the owner and evict `pod_name` when
    /// the action calls for it.
    pub async fn apply<K: Workload>(
        &self,
        owner: &ResolvedOwner,
        pod_name: &str,
        action: &Action,
    ) -> OperatorResult<()> {
        let Some(ledger) = action.ledger() else {
            return Ok(());
        };

        if action.evicts() && K::KIND.mutation_strategy() == MutationStrategy::Recreate {
            return self.recreate::<K>(owner, pod_name, action, ledger).await;
        }

        self.write_in_place::<K>(owner, pod_name, action, ledger).await?;
        if action.evicts() {
            self.evict(&owner.namespace, pod_name, owner, action).await?;
        }
        Ok(())
    }

    async fn write_in_place<K: Workload>(
        &self,
        owner: &ResolvedOwner,
        pod_name: &str,
        action: &Action,
        ledger: &Ledger,
    ) -> OperatorResult<()> {
        let namespace = owner.namespace.as_str();
        let name = owner.name.as_str();
        let target = object_ref::<K>(namespace, name);
        let target = target.as_str();
        let store = self.store;

        retry_on_conflict(&self.backoff, target, || async move {
            let mut object = fetch::<S, K>(store, namespace, name).await?;
            stamp(&mut object, pod_name, ledger, target)?;
            store.replace(namespace, &object).await
        })
        .await?;

        tracing::info!(
            kind = %K::KIND,
            namespace = %namespace,
            name = %name,
            pod = %pod_name,
            action = action.name(),
            attempts = ledger.attempts,
            hosts = ?ledger.excluded_hosts,
            "Ledger updated"
        );
        audit_logger()
            .ledger_written(
                K::KIND.as_str(),
                namespace,
                name,
                pod_name,
                action.name(),
                ledger,
            )
            .log();
        Ok(())
    }

    async fn recreate<K: Workload>(
        &self,
        owner: &ResolvedOwner,
        pod_name: &str,
        action: &Action,
        ledger: &Ledger,
    ) -> OperatorResult<()> {
        let namespace = owner.namespace.as_str();
        let name = owner.name.as_str();
        let target = object_ref::<K>(namespace, name);
        let target = target.as_str();
        let store = self.store;

        let mut copy = fetch::<S, K>(store, namespace, name).await?;
        stamp(&mut copy, pod_name, ledger, target)?;
        strip_identity(copy.meta_mut());
        copy.strip_for_recreate();
        let copy = &copy;

        retry_on_conflict(&self.backoff, target, || async move {
            match store.delete::<K>(namespace, name).await {
                Err(e) if e.is_not_found() => Ok(()),
                other => other,
            }
        })
        .await?;

        // The old object may still be terminating.
        let created = retry_while(
            &self.recreate_backoff,
            target,
            |e| e.is_conflict() || e.is_already_exists(),
            || async move { store.create(namespace, copy).await },
        )
        .await;
        if let Err(cause) = created {
            let manifest = serde_json::to_value(copy).unwrap_or_default();
            tracing::error!(
                kind = %K::KIND,
                namespace = %namespace,
                name = %name,
                error = %cause,
                manifest = %manifest,
                "Deleted object could not be created again"
            );
            audit_logger()
                .recreate_failed(
                    K::KIND.as_str(),
                    namespace,
                    name,
                    action.name(),
                    &manifest,
                    &cause.to_string(),
                )
                .log();
            return Err(OperatorError::RecreateFailed {
                target: target.to_string(),
                manifest: manifest.to_string(),
                source: Box::new(cause),
            });
        }

        tracing::info!(
            kind = %K::KIND,
            namespace = %namespace,
            name = %name,
            pod = %pod_name,
            action = action.name(),
            attempts = ledger.attempts,
            hosts = ?ledger.excluded_hosts,
            "Owner recreated with updated ledger"
        );
        audit_logger()
            .recreated(K::KIND.as_str(), namespace, name, action.name(), ledger)
            .log();
        Ok(())
    }

    async fn evict(
        &self,
        namespace: &str,
        pod_name: &str,
        owner: &ResolvedOwner,
        action: &Action,
    ) -> OperatorResult<()> {
        let target = object_ref::<Pod>(namespace, pod_name);
        let store = self.store;

        retry_on_conflict(&self.backoff, &target, || async move {
            match store.delete::<Pod>(namespace, pod_name).await {
                Err(e) if e.is_not_found() => Ok(()),
                other => other,
            }
        })
        .await?;

        tracing::info!(namespace = %namespace, pod = %pod_name, owner = %owner.object_ref(), "Pod evicted");
        audit_logger()
            .pod_evicted(namespace, pod_name, &owner.object_ref(), action.name())
            .log();
        Ok(())
    }
}

async fn fetch<S: ObjectStore, K: Workload>(
    store: &S,
    namespace: &str,
    name: &str,
) -> OperatorResult<K> {
    store
        .get::<K>(namespace, name)
        .await?
        .ok_or_else(|| OperatorError::NotFound {
            kind: K::KIND.to_string(),
            name: name.to_string(),
            namespace: namespace.to_string(),
        })
}

/// Set the ledger annotation on `object`, merging into whatever the object
/// currently holds under that key.
fn stamp<K: Workload>(
    object: &mut K,
    pod_name: &str,
    ledger: &Ledger,
    target: &str,
) -> OperatorResult<()> {
    let schema = K::KIND.ledger_schema();
    let annotations = object.annotations_mut();
    let rendered = render(
        schema,
        annotations.get(schema.key()).map(String::as_str),
        pod_name,
        ledger,
        target,
    )?;
    annotations.insert(schema.key().to_string(), rendered);
    object.ledger_written(ledger)
}

fn strip_identity(meta: &mut ObjectMeta) {
    meta.uid = None;
    meta.resource_version = None;
    meta.creation_timestamp = None;
    meta.deletion_timestamp = None;
    meta.deletion_grace_period_seconds = None;
    meta.generation = None;
    meta.managed_fields = None;
}
