//! Object store abstraction.
//!
//! The reconciler talks to the cluster only through [`ObjectStore`], so the
//! same pipeline runs against the API server ([`KubeStore`]) and against
//! [`MemoryStore`] in tests.

mod api;
mod memory;

use std::fmt::Debug;
use std::sync::Arc;

use futures::future::BoxFuture;
use k8s_openapi::NamespaceResourceScope;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::OperatorResult;

pub use api::KubeStore;
pub use memory::{MemoryStore, Mutation};

/// Boxed future returned by store operations.
pub type StoreFuture<'a, T> = BoxFuture<'a, OperatorResult<T>>;

/// A namespaced Kubernetes object the store can persist.
pub trait StoredObject:
    kube::Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<T> StoredObject for T where
    T: kube::Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Namespaced CRUD with optimistic concurrency.
///
/// `replace` must fail with [`crate::OperatorError::Conflict`] when the
/// object's resource version is stale. `create` must fail with
/// [`crate::OperatorError::AlreadyExists`] when the name is taken. `delete`
/// uses zero grace period and background propagation, and fails with
/// [`crate::OperatorError::NotFound`] when the object is gone.
pub trait ObjectStore: Send + Sync + 'static {
    /// List objects of kind `K` across all namespaces.
    fn list<K: StoredObject>(&self) -> StoreFuture<'_, Vec<K>>;

    /// Fetch one object. Missing objects are `Ok(None)`.
    fn get<'a, K: StoredObject>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
    ) -> StoreFuture<'a, Option<K>>;

    /// Create `object` in `namespace`.
    fn create<'a, K: StoredObject>(
        &'a self,
        namespace: &'a str,
        object: &'a K,
    ) -> StoreFuture<'a, K>;

    /// Replace `object`, checking its resource version.
    fn replace<'a, K: StoredObject>(
        &'a self,
        namespace: &'a str,
        object: &'a K,
    ) -> StoreFuture<'a, K>;

    /// Delete an object immediately.
    fn delete<'a, K: StoredObject>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
    ) -> StoreFuture<'a, ()>;
}

impl<T: ObjectStore> ObjectStore for Arc<T> {
    fn list<K: StoredObject>(&self) -> StoreFuture<'_, Vec<K>> {
        (**self).list()
    }

    fn get<'a, K: StoredObject>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
    ) -> StoreFuture<'a, Option<K>> {
        (**self).get(namespace, name)
    }

    fn create<'a, K: StoredObject>(
        &'a self,
        namespace: &'a str,
        object: &'a K,
    ) -> StoreFuture<'a, K> {
        (**self).create(namespace, object)
    }

    fn replace<'a, K: StoredObject>(
        &'a self,
        namespace: &'a str,
        object: &'a K,
    ) -> StoreFuture<'a, K> {
        (**self).replace(namespace, object)
    }

    fn delete<'a, K: StoredObject>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
    ) -> StoreFuture<'a, ()> {
        (**self).delete::<K>(namespace, name)
    }
}

/// `kind/namespace/name` label for logs and errors.
pub fn object_ref<K: StoredObject>(namespace: &str, name: &str) -> String {
    format!("{}/{}/{}", K::kind(&()), namespace, name)
}
