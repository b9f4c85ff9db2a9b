//! List-then-watch sources feeding the reflectors.

use std::fmt::Debug;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use kube::api::{Api, ListParams, WatchParams};
use kube::core::{PartialObjectMeta, WatchEvent};
use kube::Resource;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{Error, Result};

/// Server-side watch timeout; the API server closes the stream after it
const WATCH_TIMEOUT_SECS: u32 = 290;

/// Full snapshot of a collection at one resource version
#[derive(Clone, Debug)]
pub struct Listing<K> {
    pub items: Vec<K>,
    pub resource_version: String,
}

/// Incremental change delivered by a watch
#[derive(Clone, Debug)]
pub enum Event<K> {
    /// Object added or modified
    Applied(K),
    /// Object removed
    Deleted(K),
    /// Progress marker without object changes
    Bookmark(String),
}

pub type EventStream<K> = BoxStream<'static, Result<Event<K>>>;

/// A collection that can be listed and then watched from the listing's version.
#[async_trait]
pub trait ListerWatcher<K>: Send + Sync + 'static {
    async fn list(&self) -> Result<Listing<K>>;

    /// Watch changes strictly after `resource_version`.
    async fn watch(&self, resource_version: &str) -> Result<EventStream<K>>;
}

/// Selectors narrowing a source
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Selectors {
    pub labels: Option<String>,
    pub fields: Option<String>,
}

impl Selectors {
    pub fn labels(mut self, selector: impl Into<String>) -> Self {
        self.labels = Some(selector.into());
        self
    }

    pub fn fields(mut self, selector: impl Into<String>) -> Self {
        self.fields = Some(selector.into());
        self
    }

    fn list_params(&self) -> ListParams {
        let mut params = ListParams::default();
        if let Some(labels) = &self.labels {
            params = params.labels(labels);
        }
        if let Some(fields) = &self.fields {
            params = params.fields(fields);
        }
        params
    }

    fn watch_params(&self) -> WatchParams {
        let mut params = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
        if let Some(labels) = &self.labels {
            params = params.labels(labels);
        }
        if let Some(fields) = &self.fields {
            params = params.fields(fields);
        }
        params
    }

    /// Stable suffix used in informer keys
    pub fn describe(&self) -> String {
        format!(
            "labels={},fields={}",
            self.labels.as_deref().unwrap_or(""),
            self.fields.as_deref().unwrap_or("")
        )
    }
}

/// Full objects through a kube-rs [`Api`]
pub struct ApiSource<K> {
    api: Api<K>,
    selectors: Selectors,
}

impl<K> ApiSource<K> {
    pub fn new(api: Api<K>, selectors: Selectors) -> Self {
        Self { api, selectors }
    }
}

#[async_trait]
impl<K> ListerWatcher<K> for ApiSource<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    async fn list(&self) -> Result<Listing<K>> {
        let list = self.api.list(&self.selectors.list_params()).await?;
        Ok(Listing {
            resource_version: list.metadata.resource_version.unwrap_or_default(),
            items: list.items,
        })
    }

    async fn watch(&self, resource_version: &str) -> Result<EventStream<K>> {
        let stream = self
            .api
            .watch(&self.selectors.watch_params(), resource_version)
            .await?;
        Ok(stream
            .map_err(Error::from)
            .and_then(|event| async move { convert(event) })
            .boxed())
    }
}

/// Metadata-only objects through a kube-rs [`Api`]
pub struct MetadataSource<K> {
    api: Api<K>,
    selectors: Selectors,
}

impl<K> MetadataSource<K> {
    pub fn new(api: Api<K>, selectors: Selectors) -> Self {
        Self { api, selectors }
    }
}

#[async_trait]
impl<K> ListerWatcher<PartialObjectMeta<K>> for MetadataSource<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    PartialObjectMeta<K>: Resource + Clone + DeserializeOwned + Debug + Send + Sync,
{
    async fn list(&self) -> Result<Listing<PartialObjectMeta<K>>> {
        let list = self
            .api
            .list_metadata(&self.selectors.list_params())
            .await?;
        Ok(Listing {
            resource_version: list.metadata.resource_version.unwrap_or_default(),
            items: list.items,
        })
    }

    async fn watch(&self, resource_version: &str) -> Result<EventStream<PartialObjectMeta<K>>> {
        let stream = self
            .api
            .watch_metadata(&self.selectors.watch_params(), resource_version)
            .await?;
        Ok(stream
            .map_err(Error::from)
            .and_then(|event| async move { convert(event) })
            .boxed())
    }
}

fn convert<K>(event: WatchEvent<K>) -> Result<Event<K>> {
    match event {
        WatchEvent::Added(obj) | WatchEvent::Modified(obj) => Ok(Event::Applied(obj)),
        WatchEvent::Deleted(obj) => Ok(Event::Deleted(obj)),
        WatchEvent::Bookmark(bookmark) => Ok(Event::Bookmark(bookmark.metadata.resource_version)),
        WatchEvent::Error(status) if status.code == 410 => {
            debug!(message = %status.message, "Watch resource version expired");
            Err(Error::transient(format!("watch expired: {}", status.message)))
        }
        WatchEvent::Error(status) => Err(Error::transient(format!(
            "watch error {}: {}",
            status.code, status.message
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Pod;
    use kube::core::ErrorResponse;

    #[test]
    fn selectors_describe_is_stable() {
        let selectors = Selectors::default().labels("app=istiod").fields("status.phase=Running");
        assert_eq!(
            selectors.describe(),
            "labels=app=istiod,fields=status.phase=Running"
        );
        assert_eq!(Selectors::default().describe(), "labels=,fields=");
    }

    #[test]
    fn selectors_reach_request_params() {
        let selectors = Selectors::default().labels("nodeLocal=a");
        assert_eq!(selectors.list_params().label_selector.as_deref(), Some("nodeLocal=a"));
        let wp = selectors.watch_params();
        assert_eq!(wp.label_selector.as_deref(), Some("nodeLocal=a"));
        assert_eq!(wp.timeout, Some(WATCH_TIMEOUT_SECS));
    }

    #[test]
    fn added_and_modified_become_applied() {
        assert!(matches!(
            convert(WatchEvent::Added(Pod::default())),
            Ok(Event::Applied(_))
        ));
        assert!(matches!(
            convert(WatchEvent::Modified(Pod::default())),
            Ok(Event::Applied(_))
        ));
        assert!(matches!(
            convert(WatchEvent::Deleted(Pod::default())),
            Ok(Event::Deleted(_))
        ));
    }

    #[test]
    fn expired_watch_is_transient() {
        let status = ErrorResponse {
            status: "Failure".to_string(),
            message: "too old resource version".to_string(),
            reason: "Expired".to_string(),
            code: 410,
        };
        let err = convert::<Pod>(WatchEvent::Error(status)).unwrap_err();
        assert!(err.is_transient());
        assert!(err.to_string().contains("expired"));
    }
}
