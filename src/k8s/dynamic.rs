//! Dynamic and metadata-only clients
//!
//! Resources are resolved at runtime through API discovery. Resolutions are
//! memoised for the lifetime of the client.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use kube::api::{Api, ListParams};
use kube::core::{DynamicObject, GroupVersionKind, PartialObjectMeta};
use kube::discovery::{self, ApiCapabilities, ApiResource, Scope};
use kube::Client;
use tracing::debug;

use crate::error::{Error, Result};
use crate::informer::Selectors;

/// Resource and capabilities found by discovery
pub type Resolved = (ApiResource, ApiCapabilities);

/// Memoised GVK to resource resolution
#[derive(Clone, Default)]
pub struct DiscoveryCache {
    entries: Arc<Mutex<HashMap<String, Resolved>>>,
}

impl DiscoveryCache {
    fn key(gvk: &GroupVersionKind) -> String {
        format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
    }

    pub fn get(&self, gvk: &GroupVersionKind) -> Option<Resolved> {
        self.lock().get(&Self::key(gvk)).cloned()
    }

    pub fn insert(&self, gvk: &GroupVersionKind, resource: ApiResource, caps: ApiCapabilities) {
        self.lock().insert(Self::key(gvk), (resource, caps));
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Resolved>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Untyped access to any resource the API server serves
#[derive(Clone)]
pub struct DynamicClient {
    client: Client,
    default_namespace: String,
    discovery: DiscoveryCache,
}

impl DynamicClient {
    pub fn new(client: Client, default_namespace: impl Into<String>) -> Self {
        Self {
            client,
            default_namespace: default_namespace.into(),
            discovery: DiscoveryCache::default(),
        }
    }

    pub fn default_namespace(&self) -> &str {
        &self.default_namespace
    }

    pub fn discovery(&self) -> &DiscoveryCache {
        &self.discovery
    }

    /// Resolve `gvk` through discovery, once per kind
    pub async fn resolve(&self, gvk: &GroupVersionKind) -> Result<Resolved> {
        if let Some(resolved) = self.discovery.get(gvk) {
            return Ok(resolved);
        }

        let (resource, caps) = discovery::pinned_kind(&self.client, gvk)
            .await
            .map_err(|e| match e {
                kube::Error::Api(ref resp) if resp.code == 404 => Error::configuration(format!(
                    "{}/{} {} is not served by the cluster",
                    gvk.group, gvk.version, gvk.kind
                )),
                other => Error::Kube(other),
            })?;
        debug!(kind = %gvk.kind, plural = %resource.plural, "Discovered resource");
        self.discovery.insert(gvk, resource.clone(), caps.clone());
        Ok((resource, caps))
    }

    /// Api for `gvk`. Namespaced kinds use `namespace`, falling back to the
    /// handle's default namespace; cluster-scoped kinds ignore it.
    pub async fn api(&self, gvk: &GroupVersionKind, namespace: Option<&str>) -> Result<Api<DynamicObject>> {
        let (resource, caps) = self.resolve(gvk).await?;
        Ok(match caps.scope {
            Scope::Namespaced => Api::namespaced_with(
                self.client.clone(),
                namespace.unwrap_or(&self.default_namespace),
                &resource,
            ),
            Scope::Cluster => Api::all_with(self.client.clone(), &resource),
        })
    }

    /// Api for an already resolved resource, across all namespaces when
    /// `namespace` is `None`
    pub fn api_for(&self, resource: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, resource),
            None => Api::all_with(self.client.clone(), resource),
        }
    }
}

/// Metadata-only reads of any resource
#[derive(Clone)]
pub struct MetadataClient {
    client: Client,
}

impl MetadataClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, resource: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, resource),
            None => Api::all_with(self.client.clone(), resource),
        }
    }

    pub async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        selectors: &Selectors,
    ) -> Result<Vec<PartialObjectMeta<DynamicObject>>> {
        let mut params = ListParams::default();
        if let Some(labels) = &selectors.labels {
            params = params.labels(labels);
        }
        if let Some(fields) = &selectors.fields {
            params = params.fields(fields);
        }
        let list = self.api(resource, namespace).list_metadata(&params).await?;
        Ok(list.items)
    }

    pub async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<PartialObjectMeta<DynamicObject>> {
        Ok(self.api(resource, namespace).get_metadata(name).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_client;

    fn virtual_service() -> GroupVersionKind {
        GroupVersionKind::gvk("networking.istio.io", "v1beta1", "VirtualService")
    }

    fn namespaced_caps() -> ApiCapabilities {
        ApiCapabilities {
            scope: Scope::Namespaced,
            subresources: vec![],
            operations: vec![],
        }
    }

    #[tokio::test]
    async fn test_cached_resolution_skips_discovery() {
        let client = DynamicClient::new(test_client(), "default");
        let gvk = virtual_service();
        client
            .discovery()
            .insert(&gvk, ApiResource::from_gvk(&gvk), namespaced_caps());

        let (resource, caps) = client.resolve(&gvk).await.unwrap();
        assert_eq!(resource.plural, "virtualservices");
        assert!(matches!(caps.scope, Scope::Namespaced));
        assert_eq!(client.discovery().len(), 1);
    }

    #[tokio::test]
    async fn test_namespaced_api_falls_back_to_default_namespace() {
        let client = DynamicClient::new(test_client(), "mesh");
        let gvk = virtual_service();
        client
            .discovery()
            .insert(&gvk, ApiResource::from_gvk(&gvk), namespaced_caps());

        let api = client.api(&gvk, None).await.unwrap();
        assert!(api.resource_url().contains("/namespaces/mesh/"));
        let api = client.api(&gvk, Some("other")).await.unwrap();
        assert!(api.resource_url().contains("/namespaces/other/"));
    }

    #[tokio::test]
    async fn test_cluster_scoped_api_ignores_namespace() {
        let client = DynamicClient::new(test_client(), "mesh");
        let gvk = GroupVersionKind::gvk("rbac.authorization.k8s.io", "v1", "ClusterRole");
        client.discovery().insert(
            &gvk,
            ApiResource::from_gvk(&gvk),
            ApiCapabilities {
                scope: Scope::Cluster,
                subresources: vec![],
                operations: vec![],
            },
        );

        let api = client.api(&gvk, Some("ignored")).await.unwrap();
        assert!(!api.resource_url().contains("namespaces"));
    }
}
