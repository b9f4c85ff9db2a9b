//! List-then-watch loop keeping a [`Store`] in sync with its source.

use std::sync::Arc;

use futures::StreamExt;
use kube::Resource;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::source::{Event, EventStream, ListerWatcher};
use super::store::Store;
use crate::retry::{Backoff, RetryConfig};

/// How a watch stream ended
enum WatchEnd {
    /// Server closed the stream after delivering `events`; resume from the
    /// last version
    Closed { events: usize },
    /// Error or expiry; a fresh listing is required
    Failed,
    Cancelled,
}

/// Drives one source into one store until cancelled.
pub struct Reflector<K> {
    name: String,
    source: Arc<dyn ListerWatcher<K>>,
    store: Store<K>,
    retry: RetryConfig,
}

impl<K> Reflector<K>
where
    K: Resource + Send + Sync + 'static,
{
    pub fn new(
        name: impl Into<String>,
        source: Arc<dyn ListerWatcher<K>>,
        store: Store<K>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            store,
            retry,
        }
    }

    pub fn store(&self) -> &Store<K> {
        &self.store
    }

    /// Run until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let mut backoff = Backoff::new(RetryConfig {
            max_attempts: 0,
            ..self.retry.clone()
        });

        'relist: loop {
            if cancel.is_cancelled() {
                break;
            }

            let listing = tokio::select! {
                _ = cancel.cancelled() => break,
                listing = self.source.list() => listing,
            };
            let listing = match listing {
                Ok(listing) => listing,
                Err(e) => {
                    warn!(informer = %self.name, error = %e, "List failed");
                    if !backoff.wait(&cancel).await {
                        break;
                    }
                    continue;
                }
            };

            // The watch must exist before the listing becomes visible, so that
            // nothing emitted between the two is lost.
            let stream = tokio::select! {
                _ = cancel.cancelled() => break,
                stream = self.source.watch(&listing.resource_version) => stream,
            };
            let mut stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(informer = %self.name, error = %e, "Watch failed after list");
                    if !backoff.wait(&cancel).await {
                        break;
                    }
                    continue;
                }
            };

            let count = listing.items.len();
            let first_sync = !self.store.is_synced();
            self.store.replace(listing.items, listing.resource_version);
            backoff.reset();
            if first_sync {
                info!(informer = %self.name, objects = count, "Cache synced");
            } else {
                debug!(informer = %self.name, objects = count, "Cache relisted");
            }

            loop {
                match self.consume(&mut stream, &cancel).await {
                    WatchEnd::Cancelled => break 'relist,
                    WatchEnd::Failed => {
                        if !backoff.wait(&cancel).await {
                            break 'relist;
                        }
                        continue 'relist;
                    }
                    WatchEnd::Closed { events } => {
                        // an empty stream closed at once would otherwise spin
                        if events == 0 {
                            if !backoff.wait(&cancel).await {
                                break 'relist;
                            }
                        } else {
                            backoff.reset();
                        }
                        let Some(version) = self.store.resource_version() else {
                            continue 'relist;
                        };
                        debug!(informer = %self.name, %version, "Watch closed, resuming");
                        let resumed = tokio::select! {
                            _ = cancel.cancelled() => break 'relist,
                            resumed = self.source.watch(&version) => resumed,
                        };
                        match resumed {
                            Ok(next) => stream = next,
                            Err(e) => {
                                warn!(informer = %self.name, error = %e, "Resume failed, relisting");
                                continue 'relist;
                            }
                        }
                    }
                }
            }
        }

        debug!(informer = %self.name, "Reflector stopped");
    }

    async fn consume(&self, stream: &mut EventStream<K>, cancel: &CancellationToken) -> WatchEnd {
        let mut events = 0;
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return WatchEnd::Cancelled,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(Event::Applied(obj))) => self.store.apply(obj),
                Some(Ok(Event::Deleted(obj))) => self.store.delete(&obj),
                Some(Ok(Event::Bookmark(version))) => self.store.set_resource_version(version),
                Some(Err(e)) => {
                    warn!(informer = %self.name, error = %e, "Watch stream error");
                    return WatchEnd::Failed;
                }
                None => return WatchEnd::Closed { events },
            }
            events += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::informer::store::ObjectKey;
    use crate::testing::FakeSource;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::core::ObjectMeta;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

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

    fn spawn(source: &FakeSource<ConfigMap>) -> (Store<ConfigMap>, CancellationToken) {
        let store = Store::new();
        let cancel = CancellationToken::new();
        let reflector = Reflector::new(
            "configmaps",
            Arc::new(source.clone()),
            store.clone(),
            RetryConfig::fixed(Duration::from_millis(5)),
        );
        tokio::spawn(reflector.run(cancel.clone()));
        (store, cancel)
    }

    async fn eventually(check: impl Fn() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn initial_list_and_events_are_applied() {
        let source = FakeSource::builder().object(cm("a")).object(cm("b")).build();
        let (store, cancel) = spawn(&source);

        source.wait_for_watchers(1).await;
        eventually(|| store.is_synced()).await;
        assert_eq!(store.len(), 2);

        source.apply(cm("c"));
        source.delete(&ObjectKey::namespaced("default", "a"));
        eventually(|| store.len() == 2 && store.get_namespaced("default", "c").is_some()).await;
        assert!(store.get_namespaced("default", "a").is_none());

        cancel.cancel();
    }

    #[tokio::test]
    async fn events_between_list_and_watch_are_not_lost() {
        let source = FakeSource::builder()
            .object(cm("a"))
            .watch_delay(Duration::from_millis(30))
            .build();
        let (store, cancel) = spawn(&source);

        source.wait_for_lists(1).await;
        source.apply(cm("late"));

        source.wait_for_watchers(1).await;
        eventually(|| store.get_namespaced("default", "late").is_some()).await;
        cancel.cancel();
    }

    #[tokio::test]
    async fn dropped_stream_resumes_without_losing_keys() {
        let source = FakeSource::builder().object(cm("a")).object(cm("b")).build();
        let (store, cancel) = spawn(&source);
        source.wait_for_watchers(1).await;

        source.drop_watches();
        source.apply(cm("c"));
        source.wait_for_watchers(1).await;

        eventually(|| store.len() == 3).await;
        assert!(store.is_synced());
        cancel.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn watch_error_relists_atomically() {
        let source = FakeSource::builder().object(cm("keep")).object(cm("gone")).build();
        let (store, cancel) = spawn(&source);
        source.wait_for_watchers(1).await;
        assert_eq!(source.list_calls(), 1);

        let saw_missing = Arc::new(AtomicBool::new(false));
        let stop = CancellationToken::new();
        let reader = {
            let store = store.clone();
            let saw_missing = saw_missing.clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                let mut reads = 0u64;
                while !stop.is_cancelled() {
                    if store.get_namespaced("default", "keep").is_none() {
                        saw_missing.store(true, Ordering::SeqCst);
                    }
                    reads += 1;
                    tokio::task::yield_now().await;
                }
                reads
            })
        };

        source.delete_silently(&ObjectKey::namespaced("default", "gone"));
        source.fail_watches("connection reset");

        eventually(|| source.list_calls() >= 2 && store.len() == 1).await;
        stop.cancel();
        let reads = reader.await.unwrap();

        assert!(reads > 0);
        assert!(!saw_missing.load(Ordering::SeqCst));
        assert!(store.get_namespaced("default", "keep").is_some());
        assert!(store.is_synced());
        cancel.cancel();
    }

    #[tokio::test]
    async fn empty_watches_closing_at_once_back_off() {
        let source = FakeSource::builder()
            .object(cm("a"))
            .close_watches_immediately()
            .build();
        let store = Store::new();
        let cancel = CancellationToken::new();
        let reflector = Reflector::new(
            "configmaps",
            Arc::new(source.clone()),
            store.clone(),
            RetryConfig::fixed(Duration::from_millis(20)),
        );
        tokio::spawn(reflector.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        assert!(store.is_synced());
        let watches = source.watch_calls();
        assert!(watches >= 2, "watch reopened {watches} times");
        assert!(watches <= 12, "watch reopened {watches} times");
    }

    #[tokio::test]
    async fn failing_list_never_syncs_and_stops_on_cancel() {
        let source: FakeSource<ConfigMap> = FakeSource::builder().fail_lists("forbidden").build();
        let store = Store::new();
        let cancel = CancellationToken::new();
        let reflector = Reflector::new(
            "secrets",
            Arc::new(source.clone()),
            store.clone(),
            RetryConfig::fixed(Duration::from_millis(5)),
        );
        let handle = tokio::spawn(reflector.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!store.is_synced());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("reflector stops promptly")
            .unwrap();
    }
}
