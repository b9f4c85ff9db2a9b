//! Bounded-concurrency fan-out over a set of named targets.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::error::{Error, Result, TargetError};

/// Default number of targets contacted at once
pub const DEFAULT_CONCURRENCY: usize = 8;

/// Per-target outcome of a fan-out that did not fail everywhere
#[derive(Debug)]
pub struct FanOut<T> {
    pub results: BTreeMap<String, T>,
    pub failures: Vec<TargetError>,
}

impl<T> Default for FanOut<T> {
    fn default() -> Self {
        Self {
            results: BTreeMap::new(),
            failures: Vec::new(),
        }
    }
}

impl<T> FanOut<T> {
    /// Run `op` once per target, at most `concurrency` at a time.
    ///
    /// Fails with [`Error::Aggregate`] only when every target failed. An empty
    /// target list yields an empty result.
    pub async fn run<I, F, Fut>(targets: I, concurrency: usize, op: F) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let calls = targets.into_iter().map(|target| {
            let semaphore = semaphore.clone();
            let call = op(target.clone());
            async move {
                // the semaphore is never closed
                let _permit = semaphore.acquire().await.ok();
                (target, call.await)
            }
        });

        Self::collect(join_all(calls).await)
    }

    /// Split outcomes into results and failures.
    pub fn collect(outcomes: Vec<(String, Result<T>)>) -> Result<Self> {
        let mut fan_out = Self::default();
        for (target, outcome) in outcomes {
            match outcome {
                Ok(value) => {
                    debug!(%target, "Target succeeded");
                    fan_out.results.insert(target, value);
                }
                Err(error) => {
                    warn!(%target, %error, "Target failed");
                    fan_out.failures.push(TargetError::new(target, error));
                }
            }
        }

        if fan_out.results.is_empty() && !fan_out.failures.is_empty() {
            return Err(Error::Aggregate(fan_out.failures));
        }
        Ok(fan_out)
    }

    pub fn get(&self, target: &str) -> Option<&T> {
        self.results.get(target)
    }

    /// True when no target failed
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty() && self.failures.is_empty()
    }

    /// Keep only results satisfying `keep`
    pub fn retain(mut self, keep: impl Fn(&T) -> bool) -> Self {
        self.results.retain(|_, value| keep(value));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn targets(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_partial_failure_is_success() {
        let out = FanOut::run(targets(&["a", "b", "c"]), 2, |t| async move {
            if t == "b" {
                Err(Error::transient("connection refused"))
            } else {
                Ok(t.to_uppercase())
            }
        })
        .await
        .unwrap();

        assert_eq!(out.get("a").map(String::as_str), Some("A"));
        assert_eq!(out.results.len(), 2);
        assert_eq!(out.failures.len(), 1);
        assert_eq!(out.failures[0].target, "b");
        assert!(!out.is_complete());
    }

    #[tokio::test]
    async fn test_all_failed_is_aggregate() {
        let err = FanOut::<()>::run(targets(&["a", "b"]), 4, |t| async move {
            Err(Error::transient(format!("{t} unreachable")))
        })
        .await
        .unwrap_err();

        match err {
            Error::Aggregate(failures) => assert_eq!(failures.len(), 2),
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn test_empty_targets() {
        let out = FanOut::<()>::run(Vec::new(), 4, |_| async { Ok(()) }).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let out = FanOut::run(targets(&["a", "b", "c", "d", "e"]), 2, |_| {
            let running = running.clone();
            let peak = peak.clone();
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();

        assert_eq!(out.results.len(), 5);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }
}
