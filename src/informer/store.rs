//! Watch-maintained local cache of one resource collection.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use kube::Resource;

/// Index key of a cached object
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.map(str::to_string),
            name: name.into(),
        }
    }

    pub fn namespaced(namespace: &str, name: impl Into<String>) -> Self {
        Self::new(Some(namespace), name)
    }

    pub fn cluster(name: impl Into<String>) -> Self {
        Self::new(None, name)
    }

    /// Key of a Kubernetes object, `None` if it has no name
    pub fn of<K: Resource>(obj: &K) -> Option<Self> {
        let meta = obj.meta();
        let name = meta.name.clone()?;
        Some(Self {
            namespace: meta.namespace.clone(),
            name,
        })
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{ns}/{}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Anything whose readiness the lifecycle coordinator can poll
pub trait HasSynced: Send + Sync {
    fn has_synced(&self) -> bool;
}

#[derive(Debug)]
struct State<K> {
    objects: HashMap<ObjectKey, Arc<K>>,
    resource_version: Option<String>,
    synced_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct Shared<K> {
    state: RwLock<State<K>>,
    synced: AtomicBool,
}

/// Concurrently readable cache.
///
/// Cloning is cheap; clones share the same index. Only the owning reflector
/// writes, one event at a time under the write lock.
#[derive(Debug)]
pub struct Store<K> {
    shared: Arc<Shared<K>>,
}

impl<K> Clone for Store<K> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<K> Default for Store<K> {
    fn default() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: RwLock::new(State {
                    objects: HashMap::new(),
                    resource_version: None,
                    synced_at: None,
                }),
                synced: AtomicBool::new(false),
            }),
        }
    }
}

impl<K> Store<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.read(|state| state.objects.get(key).cloned())
    }

    pub fn get_namespaced(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        self.get(&ObjectKey::namespaced(namespace, name))
    }

    /// Snapshot of every cached object
    pub fn list(&self) -> Vec<Arc<K>> {
        self.read(|state| state.objects.values().cloned().collect())
    }

    /// Snapshot of the objects in one namespace
    pub fn list_namespace(&self, namespace: &str) -> Vec<Arc<K>> {
        self.read(|state| {
            state
                .objects
                .iter()
                .filter(|(key, _)| key.namespace.as_deref() == Some(namespace))
                .map(|(_, obj)| obj.clone())
                .collect()
        })
    }

    pub fn keys(&self) -> Vec<ObjectKey> {
        let mut keys = self.read(|state| state.objects.keys().cloned().collect::<Vec<_>>());
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.read(|state| state.objects.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True once the first listing has been published
    pub fn is_synced(&self) -> bool {
        self.shared.synced.load(Ordering::Acquire)
    }

    pub fn synced_at(&self) -> Option<DateTime<Utc>> {
        self.read(|state| state.synced_at)
    }

    /// Last resource version observed by the reflector
    pub fn resource_version(&self) -> Option<String> {
        self.read(|state| state.resource_version.clone())
    }

    /// True if both handles point at the same cache
    pub fn shares_with(&self, other: &Store<K>) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    fn read<T>(&self, f: impl FnOnce(&State<K>) -> T) -> T {
        let guard = self
            .shared
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    fn write<T>(&self, f: impl FnOnce(&mut State<K>) -> T) -> T {
        let mut guard = self
            .shared
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}

impl<K: Resource> Store<K> {
    /// Swap in a complete listing and mark the store synced.
    pub(crate) fn replace(&self, items: Vec<K>, resource_version: String) {
        let objects = items
            .into_iter()
            .filter_map(|obj| ObjectKey::of(&obj).map(|key| (key, Arc::new(obj))))
            .collect();

        self.write(|state| {
            state.objects = objects;
            state.resource_version = Some(resource_version);
            if state.synced_at.is_none() {
                state.synced_at = Some(Utc::now());
            }
        });
        self.shared.synced.store(true, Ordering::Release);
    }

    pub(crate) fn apply(&self, obj: K) {
        let Some(key) = ObjectKey::of(&obj) else {
            return;
        };
        let version = obj.meta().resource_version.clone();
        self.write(|state| {
            state.objects.insert(key, Arc::new(obj));
            if version.is_some() {
                state.resource_version = version;
            }
        });
    }

    pub(crate) fn delete(&self, obj: &K) {
        let Some(key) = ObjectKey::of(obj) else {
            return;
        };
        let version = obj.meta().resource_version.clone();
        self.write(|state| {
            state.objects.remove(&key);
            if version.is_some() {
                state.resource_version = version;
            }
        });
    }

    pub(crate) fn set_resource_version(&self, resource_version: String) {
        self.write(|state| state.resource_version = Some(resource_version));
    }
}

impl<K: Send + Sync> HasSynced for Store<K> {
    fn has_synced(&self) -> bool {
        self.is_synced()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::core::ObjectMeta;

    fn config_map(ns: &str, name: &str, rv: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(ns.to_string()),
                resource_version: Some(rv.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn object_key_display() {
        assert_eq!(ObjectKey::namespaced("default", "a").to_string(), "default/a");
        assert_eq!(ObjectKey::cluster("node-1").to_string(), "node-1");
    }

    #[test]
    fn replace_marks_synced_and_indexes() {
        let store = Store::new();
        assert!(!store.is_synced());

        store.replace(
            vec![config_map("a", "one", "1"), config_map("b", "two", "2")],
            "2".to_string(),
        );

        assert!(store.is_synced());
        assert!(store.synced_at().is_some());
        assert_eq!(store.len(), 2);
        assert_eq!(store.list_namespace("a").len(), 1);
        assert!(store.get_namespaced("b", "two").is_some());
        assert_eq!(store.resource_version().as_deref(), Some("2"));
    }

    #[test]
    fn apply_and_delete_track_resource_version() {
        let store = Store::new();
        store.replace(vec![], "10".to_string());

        store.apply(config_map("ns", "x", "11"));
        assert_eq!(store.len(), 1);
        assert_eq!(store.resource_version().as_deref(), Some("11"));

        store.delete(&config_map("ns", "x", "12"));
        assert!(store.is_empty());
        assert_eq!(store.resource_version().as_deref(), Some("12"));
    }

    #[test]
    fn objects_without_name_are_ignored() {
        let store: Store<ConfigMap> = Store::new();
        store.apply(ConfigMap::default());
        assert!(store.is_empty());
    }

    #[test]
    fn relist_keeps_synced_timestamp() {
        let store = Store::new();
        store.replace(vec![config_map("ns", "a", "1")], "1".to_string());
        let first = store.synced_at();

        store.replace(vec![config_map("ns", "b", "5")], "5".to_string());
        assert_eq!(store.synced_at(), first);
        assert_eq!(store.keys(), vec![ObjectKey::namespaced("ns", "b")]);
    }
}
