//! In-memory [`ObjectStore`] with resource versions, cascading deletes and a
//! mutation journal. Used by the test suites and for dry runs.

use std::collections::BTreeMap;

use futures::FutureExt;
use futures::future::ready;
use kube::ResourceExt;
use parking_lot::Mutex;
use serde_json::Value;

use super::{ObjectStore, StoreFuture, StoredObject};
use crate::error::{OperatorError, OperatorResult};

type Key = (String, String, String);

/// A write applied to a [`MemoryStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Object created.
    Created {
        /// Kind.
        kind: String,
        /// Namespace.
        namespace: String,
        /// Name.
        name: String,
    },
    /// Object replaced.
    Replaced {
        /// Kind.
        kind: String,
        /// Namespace.
        namespace: String,
        /// Name.
        name: String,
    },
    /// Object deleted, directly or by cascade.
    Deleted {
        /// Kind.
        kind: String,
        /// Namespace.
        namespace: String,
        /// Name.
        name: String,
    },
}

impl Mutation {
    /// `(kind, namespace, name)` of the touched object.
    pub fn target(&self) -> (&str, &str, &str) {
        match self {
            Mutation::Created {
                kind,
                namespace,
                name,
            }
            | Mutation::Replaced {
                kind,
                namespace,
                name,
            }
            | Mutation::Deleted {
                kind,
                namespace,
                name,
            } => (kind, namespace, name),
        }
    }
}

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, Value>,
    version: u64,
    pending_conflicts: BTreeMap<Key, u32>,
    pending_create_failures: BTreeMap<Key, u32>,
    journal: Vec<Mutation>,
}

impl State {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    fn record(&mut self, key: &Key, make: fn(String, String, String) -> Mutation) {
        let (kind, namespace, name) = key.clone();
        self.journal.push(make(kind, namespace, name));
    }
}

/// Thread-safe in-memory object store.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

fn key<K: StoredObject>(namespace: &str, name: &str) -> Key {
    (
        K::kind(&()).to_string(),
        namespace.to_string(),
        name.to_string(),
    )
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object without recording a mutation. Assigns a UID and
    /// resource version when missing.
    ///
    /// # Panics
    ///
    /// Panics if the object cannot be serialized, so a broken fixture fails
    /// loudly instead of leaving the store empty.
    pub fn insert<K: StoredObject>(&self, mut object: K) -> K {
        let namespace = object.namespace().unwrap_or_else(|| "default".to_string());
        let mut state = self.state.lock();
        object.meta_mut().namespace = Some(namespace.clone());
        object
            .meta_mut()
            .uid
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string());
        object.meta_mut().resource_version = Some(state.next_version());
        let value = serde_json::to_value(&object).expect("seeded objects must serialize");
        state
            .objects
            .insert(key::<K>(&namespace, &object.name_any()), value);
        object
    }

    /// Synchronous read, for assertions.
    pub fn fetch<K: StoredObject>(&self, namespace: &str, name: &str) -> Option<K> {
        let state = self.state.lock();
        state
            .objects
            .get(&key::<K>(namespace, name))
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Make the next `count` replaces of the object fail with a conflict.
    pub fn inject_conflicts<K: StoredObject>(&self, namespace: &str, name: &str, count: u32) {
        self.state
            .lock()
            .pending_conflicts
            .insert(key::<K>(namespace, name), count);
    }

    /// Make the next `count` creates of the object fail as if an older
    /// object with the same name were still terminating.
    pub fn inject_create_failures<K: StoredObject>(&self, namespace: &str, name: &str, count: u32) {
        self.state
            .lock()
            .pending_create_failures
            .insert(key::<K>(namespace, name), count);
    }

    /// Writes applied so far, oldest first.
    pub fn journal(&self) -> Vec<Mutation> {
        self.state.lock().journal.clone()
    }

    /// Forget recorded writes.
    pub fn clear_journal(&self) {
        self.state.lock().journal.clear();
    }

    fn get_sync<K: StoredObject>(&self, namespace: &str, name: &str) -> OperatorResult<Option<K>> {
        let state = self.state.lock();
        match state.objects.get(&key::<K>(namespace, name)) {
            Some(v) => Ok(Some(serde_json::from_value(v.clone())?)),
            None => Ok(None),
        }
    }

    fn list_sync<K: StoredObject>(&self) -> OperatorResult<Vec<K>> {
        let kind = K::kind(&()).to_string();
        let state = self.state.lock();
        state
            .objects
            .iter()
            .filter(|((k, _, _), _)| *k == kind)
            .map(|(_, v)| serde_json::from_value(v.clone()).map_err(OperatorError::from))
            .collect()
    }

    fn create_sync<K: StoredObject>(&self, namespace: &str, object: &K) -> OperatorResult<K> {
        let name = object.name_any();
        let k = key::<K>(namespace, &name);
        let mut state = self.state.lock();
        let terminating = match state.pending_create_failures.get_mut(&k) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        };
        if terminating || state.objects.contains_key(&k) {
            return Err(OperatorError::AlreadyExists {
                kind: K::kind(&()).to_string(),
                name,
            });
        }
        let mut stored = object.clone();
        stored.meta_mut().namespace = Some(namespace.to_string());
        stored.meta_mut().uid = Some(uuid::Uuid::new_v4().to_string());
        stored.meta_mut().resource_version = Some(state.next_version());
        state.objects.insert(k.clone(), serde_json::to_value(&stored)?);
        state.record(&k, |kind, namespace, name| Mutation::Created {
            kind,
            namespace,
            name,
        });
        Ok(stored)
    }

    fn replace_sync<K: StoredObject>(&self, namespace: &str, object: &K) -> OperatorResult<K> {
        let name = object.name_any();
        let k = key::<K>(namespace, &name);
        let mut state = self.state.lock();

        let conflict = || OperatorError::Conflict {
            kind: K::kind(&()).to_string(),
            name: name.clone(),
            message: "the object has been modified; please apply your changes to the latest version and try again".to_string(),
        };

        if let Some(remaining) = state.pending_conflicts.get_mut(&k) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(conflict());
            }
        }

        let current_version = match state.objects.get(&k) {
            Some(v) => v
                .pointer("/metadata/resourceVersion")
                .and_then(Value::as_str)
                .map(str::to_string),
            None => {
                return Err(OperatorError::NotFound {
                    kind: K::kind(&()).to_string(),
                    name: name.clone(),
                    namespace: namespace.to_string(),
                });
            }
        };
        if let Some(expected) = object.meta().resource_version.as_ref() {
            if Some(expected) != current_version.as_ref() {
                return Err(conflict());
            }
        }

        let mut stored = object.clone();
        stored.meta_mut().resource_version = Some(state.next_version());
        state.objects.insert(k.clone(), serde_json::to_value(&stored)?);
        state.record(&k, |kind, namespace, name| Mutation::Replaced {
            kind,
            namespace,
            name,
        });
        Ok(stored)
    }

    fn delete_sync<K: StoredObject>(&self, namespace: &str, name: &str) -> OperatorResult<()> {
        let k = key::<K>(namespace, name);
        let mut state = self.state.lock();
        let Some(removed) = state.objects.remove(&k) else {
            return Err(OperatorError::NotFound {
                kind: K::kind(&()).to_string(),
                name: name.to_string(),
                namespace: namespace.to_string(),
            });
        };
        state.record(&k, |kind, namespace, name| Mutation::Deleted {
            kind,
            namespace,
            name,
        });

        // Background propagation: remove dependents, transitively.
        let mut owners: Vec<String> = uid_of(&removed).into_iter().collect();
        while let Some(owner_uid) = owners.pop() {
            let dependents: Vec<Key> = state
                .objects
                .iter()
                .filter(|((_, ns, _), v)| ns == namespace && is_owned_by(v, &owner_uid))
                .map(|(k, _)| k.clone())
                .collect();
            for dep in dependents {
                if let Some(v) = state.objects.remove(&dep) {
                    owners.extend(uid_of(&v));
                    state.record(&dep, |kind, namespace, name| Mutation::Deleted {
                        kind,
                        namespace,
                        name,
                    });
                }
            }
        }
        Ok(())
    }
}

fn uid_of(value: &Value) -> Option<String> {
    value
        .pointer("/metadata/uid")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn is_owned_by(value: &Value, owner_uid: &str) -> bool {
    value
        .pointer("/metadata/ownerReferences")
        .and_then(Value::as_array)
        .is_some_and(|refs| {
            refs.iter()
                .any(|r| r.get("uid").and_then(Value::as_str) == Some(owner_uid))
        })
}

impl ObjectStore for MemoryStore {
    fn list<K: StoredObject>(&self) -> StoreFuture<'_, Vec<K>> {
        ready(self.list_sync()).boxed()
    }

    fn get<'a, K: StoredObject>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
    ) -> StoreFuture<'a, Option<K>> {
        ready(self.get_sync(namespace, name)).boxed()
    }

    fn create<'a, K: StoredObject>(
        &'a self,
        namespace: &'a str,
        object: &'a K,
    ) -> StoreFuture<'a, K> {
        ready(self.create_sync(namespace, object)).boxed()
    }

    fn replace<'a, K: StoredObject>(
        &'a self,
        namespace: &'a str,
        object: &'a K,
    ) -> StoreFuture<'a, K> {
        ready(self.replace_sync(namespace, object)).boxed()
    }

    fn delete<'a, K: StoredObject>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
    ) -> StoreFuture<'a, ()> {
        ready(self.delete_sync::<K>(namespace, name)).boxed()
    }
}
