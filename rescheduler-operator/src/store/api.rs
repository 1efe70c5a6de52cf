//! [`ObjectStore`] backed by the Kubernetes API server.

use futures::FutureExt;
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Api, Client, ResourceExt};

use super::{ObjectStore, StoreFuture, StoredObject};
use crate::error::OperatorError;

/// Store that reads and writes through a kube [`Client`].
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    /// Wrap a connected client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K: StoredObject>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

impl ObjectStore for KubeStore {
    fn list<K: StoredObject>(&self) -> StoreFuture<'_, Vec<K>> {
        async move {
            let api: Api<K> = Api::all(self.client.clone());
            let list = api
                .list(&ListParams::default())
                .await
                .map_err(|e| OperatorError::from_kube(e, &K::kind(&()), "", ""))?;
            Ok(list.items)
        }
        .boxed()
    }

    fn get<'a, K: StoredObject>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
    ) -> StoreFuture<'a, Option<K>> {
        async move {
            self.api::<K>(namespace)
                .get_opt(name)
                .await
                .map_err(|e| OperatorError::from_kube(e, &K::kind(&()), namespace, name))
        }
        .boxed()
    }

    fn create<'a, K: StoredObject>(
        &'a self,
        namespace: &'a str,
        object: &'a K,
    ) -> StoreFuture<'a, K> {
        async move {
            self.api::<K>(namespace)
                .create(&PostParams::default(), object)
                .await
                .map_err(|e| {
                    OperatorError::from_kube(e, &K::kind(&()), namespace, &object.name_any())
                })
        }
        .boxed()
    }

    fn replace<'a, K: StoredObject>(
        &'a self,
        namespace: &'a str,
        object: &'a K,
    ) -> StoreFuture<'a, K> {
        async move {
            let name = object.name_any();
            self.api::<K>(namespace)
                .replace(&name, &PostParams::default(), object)
                .await
                .map_err(|e| OperatorError::from_kube(e, &K::kind(&()), namespace, &name))
        }
        .boxed()
    }

    fn delete<'a, K: StoredObject>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
    ) -> StoreFuture<'a, ()> {
        async move {
            let params = DeleteParams::background().grace_period(0);
            self.api::<K>(namespace)
                .delete(name, &params)
                .await
                .map(|_| ())
                .map_err(|e| OperatorError::from_kube(e, &K::kind(&()), namespace, name))
        }
        .boxed()
    }
}
