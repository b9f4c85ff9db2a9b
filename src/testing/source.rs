//! In-memory list/watch source.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc::{self, UnboundedSender};
use futures::StreamExt;
use kube::Resource;
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::informer::{Event, EventStream, ListerWatcher, Listing, ObjectKey};

#[derive(Clone, Copy, Debug, Default)]
struct Stats {
    lists: usize,
    watches: usize,
    watchers: usize,
}

struct State<K> {
    objects: BTreeMap<ObjectKey, K>,
    version: u64,
    /// Every event ever emitted, replayed to watches opened from an older version
    history: Vec<(u64, Event<K>)>,
    watchers: Vec<UnboundedSender<Result<Event<K>>>>,
    list_failure: Option<String>,
}

/// List/watch source backed by a map.
///
/// Watches opened from version `v` first receive every recorded event newer
/// than `v`, so nothing emitted between a list and the following watch is
/// lost. Mutations are visible to the next list and to open watches.
pub struct FakeSource<K> {
    state: Arc<Mutex<State<K>>>,
    stats: Arc<watch::Sender<Stats>>,
    list_delay: Duration,
    watch_delay: Duration,
    close_watches: bool,
}

impl<K> Clone for FakeSource<K> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            stats: self.stats.clone(),
            list_delay: self.list_delay,
            watch_delay: self.watch_delay,
            close_watches: self.close_watches,
        }
    }
}

/// Builder for [`FakeSource`]
pub struct FakeSourceBuilder<K> {
    objects: Vec<K>,
    list_delay: Duration,
    watch_delay: Duration,
    list_failure: Option<String>,
    close_watches: bool,
}

impl<K: Resource + Clone + Send + Sync + 'static> FakeSourceBuilder<K> {
    pub fn object(mut self, obj: K) -> Self {
        self.objects.push(obj);
        self
    }

    pub fn objects(mut self, objs: impl IntoIterator<Item = K>) -> Self {
        self.objects.extend(objs);
        self
    }

    /// Delay before each listing is taken
    pub fn list_delay(mut self, delay: Duration) -> Self {
        self.list_delay = delay;
        self
    }

    /// Delay before each watch is established
    pub fn watch_delay(mut self, delay: Duration) -> Self {
        self.watch_delay = delay;
        self
    }

    /// Every list call fails with `message`
    pub fn fail_lists(mut self, message: impl Into<String>) -> Self {
        self.list_failure = Some(message.into());
        self
    }

    /// Every watch ends right after replaying history
    pub fn close_watches_immediately(mut self) -> Self {
        self.close_watches = true;
        self
    }

    pub fn build(self) -> FakeSource<K> {
        let mut version = 0;
        let mut objects = BTreeMap::new();
        for mut obj in self.objects {
            version += 1;
            obj.meta_mut().resource_version = Some(version.to_string());
            if let Some(key) = ObjectKey::of(&obj) {
                objects.insert(key, obj);
            }
        }

        let (stats, _) = watch::channel(Stats::default());
        FakeSource {
            state: Arc::new(Mutex::new(State {
                objects,
                version,
                history: Vec::new(),
                watchers: Vec::new(),
                list_failure: self.list_failure,
            })),
            stats: Arc::new(stats),
            list_delay: self.list_delay,
            watch_delay: self.watch_delay,
            close_watches: self.close_watches,
        }
    }
}

impl<K: Resource + Clone + Send + Sync + 'static> FakeSource<K> {
    pub fn builder() -> FakeSourceBuilder<K> {
        FakeSourceBuilder {
            objects: Vec::new(),
            list_delay: Duration::ZERO,
            watch_delay: Duration::ZERO,
            list_failure: None,
            close_watches: false,
        }
    }

    /// Add or update an object and notify open watches
    pub fn apply(&self, mut obj: K) {
        let mut state = self.lock();
        state.version += 1;
        let version = state.version;
        obj.meta_mut().resource_version = Some(version.to_string());
        let Some(key) = ObjectKey::of(&obj) else {
            return;
        };
        state.objects.insert(key, obj.clone());
        self.emit(&mut state, version, Event::Applied(obj));
    }

    /// Remove an object and notify open watches
    pub fn delete(&self, key: &ObjectKey) {
        let mut state = self.lock();
        let Some(mut obj) = state.objects.remove(key) else {
            return;
        };
        state.version += 1;
        let version = state.version;
        obj.meta_mut().resource_version = Some(version.to_string());
        self.emit(&mut state, version, Event::Deleted(obj));
    }

    /// Remove an object without emitting an event, as if the event was missed
    pub fn delete_silently(&self, key: &ObjectKey) {
        let mut state = self.lock();
        state.objects.remove(key);
        state.version += 1;
    }

    /// Close every open watch cleanly
    pub fn drop_watches(&self) {
        let mut state = self.lock();
        state.watchers.clear();
        self.stats.send_modify(|s| s.watchers = 0);
    }

    /// End every open watch with an error
    pub fn fail_watches(&self, message: &str) {
        let mut state = self.lock();
        for watcher in state.watchers.drain(..) {
            let _ = watcher.unbounded_send(Err(Error::transient(message.to_string())));
        }
        self.stats.send_modify(|s| s.watchers = 0);
    }

    /// Number of list calls answered so far
    pub fn list_calls(&self) -> usize {
        self.stats.borrow().lists
    }

    /// Number of watches opened so far
    pub fn watch_calls(&self) -> usize {
        self.stats.borrow().watches
    }

    /// Number of currently open watches
    pub fn watchers(&self) -> usize {
        self.stats.borrow().watchers
    }

    /// Wait until at least `n` listings have been taken
    pub async fn wait_for_lists(&self, n: usize) {
        let mut rx = self.stats.subscribe();
        let _ = rx.wait_for(|s| s.lists >= n).await;
    }

    /// Wait until at least `n` watches are open
    pub async fn wait_for_watchers(&self, n: usize) {
        let mut rx = self.stats.subscribe();
        let _ = rx.wait_for(|s| s.watchers >= n).await;
    }

    fn emit(&self, state: &mut State<K>, version: u64, event: Event<K>) {
        state
            .watchers
            .retain(|watcher| watcher.unbounded_send(Ok(event.clone())).is_ok());
        state.history.push((version, event));
        let open = state.watchers.len();
        self.stats.send_modify(|s| s.watchers = open);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl<K: Resource + Clone + Send + Sync + 'static> ListerWatcher<K> for FakeSource<K> {
    async fn list(&self) -> Result<Listing<K>> {
        if !self.list_delay.is_zero() {
            tokio::time::sleep(self.list_delay).await;
        }

        let listing = {
            let state = self.lock();
            match &state.list_failure {
                Some(message) => Err(Error::transient(message.clone())),
                None => Ok(Listing {
                    items: state.objects.values().cloned().collect(),
                    resource_version: state.version.to_string(),
                }),
            }
        };
        self.stats.send_modify(|s| s.lists += 1);
        listing
    }

    async fn watch(&self, resource_version: &str) -> Result<EventStream<K>> {
        if !self.watch_delay.is_zero() {
            tokio::time::sleep(self.watch_delay).await;
        }

        let from: u64 = resource_version
            .parse()
            .map_err(|_| Error::transient(format!("bad resource version {resource_version:?}")))?;
        let (tx, rx) = mpsc::unbounded();

        let mut state = self.lock();
        for (version, event) in &state.history {
            if *version > from {
                let _ = tx.unbounded_send(Ok(event.clone()));
            }
        }
        if !self.close_watches {
            state.watchers.push(tx);
        }
        let open = state.watchers.len();
        drop(state);
        self.stats.send_modify(|s| {
            s.watches += 1;
            s.watchers = open;
        });

        Ok(rx.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::core::ObjectMeta;

    fn cm(name: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn watch_replays_events_after_listing() {
        let source = FakeSource::builder().object(cm("a")).build();
        let listing = source.list().await.unwrap();
        assert_eq!(listing.items.len(), 1);
        assert_eq!(listing.resource_version, "1");

        source.apply(cm("b"));
        let mut stream = source.watch(&listing.resource_version).await.unwrap();
        match stream.next().await {
            Some(Ok(Event::Applied(obj))) => assert_eq!(obj.metadata.name.as_deref(), Some("b")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(source.watchers(), 1);
        assert_eq!(source.list_calls(), 1);
    }

    #[tokio::test]
    async fn fail_watches_ends_streams_with_error() {
        let source = FakeSource::builder().object(cm("a")).build();
        let mut stream = source.watch("1").await.unwrap();
        source.fail_watches("boom");

        assert!(matches!(stream.next().await, Some(Err(_))));
        assert!(stream.next().await.is_none());
        assert_eq!(source.watchers(), 0);
    }
}
