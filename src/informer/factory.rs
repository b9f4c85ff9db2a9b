//! Shared informer factories, one per API group client.

use std::any::Any;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;
use kube::api::Api;
use kube::core::{ApiResource, DynamicObject, NamespaceResourceScope, PartialObjectMeta};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;

use super::coordinator::LifecycleCoordinator;
use super::reflector::Reflector;
use super::source::{ApiSource, ListerWatcher, MetadataSource, Selectors};
use super::store::Store;
use crate::error::{Error, Result};
use crate::retry::RetryConfig;

type Registry = HashMap<String, Box<dyn Any + Send + Sync>>;

/// Hands out one shared [`Store`] per resource/selector combination and
/// registers its reflector with the coordinator.
#[derive(Clone)]
pub struct InformerFactory {
    group: String,
    client: Client,
    coordinator: LifecycleCoordinator,
    retry: RetryConfig,
    informers: Arc<Mutex<Registry>>,
}

impl InformerFactory {
    pub fn new(
        group: impl Into<String>,
        client: Client,
        coordinator: LifecycleCoordinator,
        retry: RetryConfig,
    ) -> Self {
        Self {
            group: group.into(),
            client,
            coordinator,
            retry,
            informers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Keys of every informer created so far
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.registry().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Shared store fed by `source`. A second request for `key` returns the
    /// first store; a new key after start is a configuration error.
    pub fn informer<K, L>(&self, key: &str, source: L) -> Result<Store<K>>
    where
        K: Resource + Send + Sync + 'static,
        L: ListerWatcher<K>,
    {
        let name = format!("{}/{}", self.group, key);
        let mut informers = self.registry();

        if let Some(existing) = informers.get(&name) {
            return existing.downcast_ref::<Store<K>>().cloned().ok_or_else(|| {
                Error::configuration(format!("informer {name} exists with another object type"))
            });
        }

        let store = Store::new();
        let reflector = Reflector::new(
            name.clone(),
            Arc::new(source),
            store.clone(),
            self.retry.clone(),
        );
        self.coordinator.register(
            name.clone(),
            Arc::new(store.clone()),
            Box::new(move |cancel| reflector.run(cancel).boxed()),
        )?;

        informers.insert(name, Box::new(store.clone()));
        Ok(store)
    }

    /// Cluster-wide informer for a statically typed resource
    pub fn typed<K>(&self, selectors: Selectors) -> Result<Store<K>>
    where
        K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    {
        let key = format!("{}/*/{}", resource_id::<K>(), selectors.describe());
        let api: Api<K> = Api::all(self.client.clone());
        self.informer(&key, ApiSource::new(api, selectors))
    }

    /// Informer for a statically typed resource in one namespace
    pub fn namespaced<K>(&self, namespace: &str, selectors: Selectors) -> Result<Store<K>>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Debug
            + Send
            + Sync
            + 'static,
    {
        let key = format!("{}/{}/{}", resource_id::<K>(), namespace, selectors.describe());
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        self.informer(&key, ApiSource::new(api, selectors))
    }

    /// Informer for any resource resolved at runtime
    pub fn dynamic(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        selectors: Selectors,
    ) -> Result<Store<DynamicObject>> {
        let key = dynamic_key(resource, namespace, &selectors);
        let api = dynamic_api(&self.client, resource, namespace);
        self.informer(&key, ApiSource::new(api, selectors))
    }

    /// Metadata-only informer for any resource resolved at runtime
    pub fn metadata(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        selectors: Selectors,
    ) -> Result<Store<PartialObjectMeta<DynamicObject>>> {
        let key = dynamic_key(resource, namespace, &selectors);
        let api = dynamic_api(&self.client, resource, namespace);
        self.informer(&key, MetadataSource::new(api, selectors))
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.informers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn resource_id<K: Resource<DynamicType = ()>>() -> String {
    let group = K::group(&());
    if group.is_empty() {
        format!("{}.{}", K::plural(&()), K::version(&()))
    } else {
        format!("{}.{}.{}", K::plural(&()), K::version(&()), group)
    }
}

fn dynamic_key(resource: &ApiResource, namespace: Option<&str>, selectors: &Selectors) -> String {
    let id = if resource.group.is_empty() {
        format!("{}.{}", resource.plural, resource.version)
    } else {
        format!("{}.{}.{}", resource.plural, resource.version, resource.group)
    };
    format!("{}/{}/{}", id, namespace.unwrap_or("*"), selectors.describe())
}

fn dynamic_api(client: &Client, resource: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
    match namespace {
        Some(ns) => Api::namespaced_with(client.clone(), ns, resource),
        None => Api::all_with(client.clone(), resource),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_client, FakeSource};
    use k8s_openapi::api::core::v1::{ConfigMap, Pod, Service};
    use kube::core::GroupVersionKind;
    use std::time::Duration;

    fn factory(coordinator: &LifecycleCoordinator) -> InformerFactory {
        InformerFactory::new("kube", test_client(), coordinator.clone(), RetryConfig::default())
    }

    #[tokio::test]
    async fn same_key_returns_shared_store() {
        let coordinator = LifecycleCoordinator::fast();
        let factory = factory(&coordinator);

        let first: Store<Pod> = factory.typed(Selectors::default()).unwrap();
        let second: Store<Pod> = factory.typed(Selectors::default()).unwrap();
        assert!(first.shares_with(&second));
        assert_eq!(coordinator.registered().len(), 1);

        let filtered: Store<Pod> = factory.typed(Selectors::default().labels("app=a")).unwrap();
        assert!(!filtered.shares_with(&first));
        assert_eq!(coordinator.registered().len(), 2);
    }

    #[tokio::test]
    async fn keys_describe_resource_and_scope() {
        let coordinator = LifecycleCoordinator::fast();
        let factory = factory(&coordinator);

        let _: Store<Service> = factory.namespaced("istio-system", Selectors::default()).unwrap();
        let gvk = GroupVersionKind::gvk("networking.istio.io", "v1beta1", "VirtualService");
        let ar = ApiResource::from_gvk(&gvk);
        factory.dynamic(&ar, None, Selectors::default()).unwrap();

        assert_eq!(
            factory.keys(),
            vec![
                "kube/services.v1/istio-system/labels=,fields=".to_string(),
                "kube/virtualservices.v1beta1.networking.istio.io/*/labels=,fields=".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn type_mismatch_on_existing_key_is_rejected() {
        let coordinator = LifecycleCoordinator::fast();
        let factory = factory(&coordinator);

        let _: Store<ConfigMap> = factory.informer("shared", FakeSource::builder().build()).unwrap();
        let err = factory
            .informer::<Pod, _>("shared", FakeSource::builder().build())
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn new_informer_after_start_fails_but_existing_is_returned() {
        let coordinator = LifecycleCoordinator::fast();
        let factory = factory(&coordinator);

        let source = FakeSource::<ConfigMap>::builder().build();
        let store = factory.informer("configmaps", source.clone()).unwrap();
        assert!(coordinator.run_and_wait(Duration::from_secs(5)).await);
        assert!(store.is_synced());

        let again = factory.informer("configmaps", source).unwrap();
        assert!(again.shares_with(&store));

        let err = factory
            .informer::<ConfigMap, _>("late", FakeSource::builder().build())
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        coordinator.shutdown().await;
    }
}
