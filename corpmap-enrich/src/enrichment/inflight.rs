//! Singleflight registry for tier computations
//!
//! At most one live computation per (domain, tier). Later callers attach to
//! the running one and receive the same result. The computation runs in its
//! own task, so a subscriber that goes away never cancels it for the others.

use crate::types::{DomainKey, TierResult};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

/// A computation that did not produce a result
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("In-flight computation for {domain} tier {tier} failed: {reason}")]
pub struct InFlightError {
    pub domain: String,
    pub tier: u8,
    pub reason: String,
}

/// Shared handle every subscriber awaits
pub type TierFuture = Shared<BoxFuture<'static, Result<TierResult, InFlightError>>>;

type Key = (DomainKey, u8);

struct Handle {
    generation: u64,
    future: TierFuture,
    subscribers: Arc<AtomicUsize>,
}

/// How a caller got its handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attachment {
    Started,
    Joined,
}

#[derive(Default)]
pub struct InFlightRegistry {
    handles: Arc<Mutex<HashMap<Key, Handle>>>,
    generation: AtomicU64,
}

fn lock(map: &Mutex<HashMap<Key, Handle>>) -> MutexGuard<'_, HashMap<Key, Handle>> {
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Removes the handle when the computation task ends, panics included
struct Settle {
    handles: Arc<Mutex<HashMap<Key, Handle>>>,
    key: Key,
    generation: u64,
}

impl Drop for Settle {
    fn drop(&mut self) {
        let mut handles = lock(&self.handles);
        if handles
            .get(&self.key)
            .is_some_and(|h| h.generation == self.generation)
        {
            handles.remove(&self.key);
        }
    }
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the live computation for (domain, tier) or start one with `start`
    ///
    /// `start` is only called when no computation is live. The map lock is
    /// held across the spawn so no second computation can slip in between
    /// the lookup and the insert.
    pub fn get_or_start<F, Fut>(&self, domain: &DomainKey, tier: u8, start: F) -> (TierFuture, Attachment)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = TierResult> + Send + 'static,
    {
        let key = (domain.clone(), tier);
        let mut handles = lock(&self.handles);

        if let Some(handle) = handles.get(&key) {
            handle.subscribers.fetch_add(1, Ordering::SeqCst);
            tracing::debug!(domain = %domain, tier = tier, "Joined in-flight tier computation");
            return (handle.future.clone(), Attachment::Joined);
        }

        let computation = start();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let settle = Settle {
            handles: Arc::clone(&self.handles),
            key: key.clone(),
            generation,
        };
        let task = tokio::spawn(async move {
            let _settle = settle;
            computation.await
        });

        let domain_name = domain.to_string();
        let future: TierFuture = task
            .map(move |joined| {
                joined.map_err(|e| InFlightError {
                    domain: domain_name,
                    tier,
                    reason: if e.is_panic() {
                        "computation panicked".to_string()
                    } else {
                        e.to_string()
                    },
                })
            })
            .boxed()
            .shared();

        handles.insert(
            key,
            Handle {
                generation,
                future: future.clone(),
                subscribers: Arc::new(AtomicUsize::new(1)),
            },
        );

        (future, Attachment::Started)
    }

    /// Subscribers attached to the live computation, if any
    pub fn subscriber_count(&self, domain: &DomainKey, tier: u8) -> Option<usize> {
        lock(&self.handles)
            .get(&(domain.clone(), tier))
            .map(|h| h.subscribers.load(Ordering::SeqCst))
    }

    /// Live computations
    pub fn len(&self) -> usize {
        lock(&self.handles).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;

    fn domain() -> DomainKey {
        DomainKey::parse("acme.test").unwrap()
    }

    async fn never_started() -> TierResult {
        unreachable!("second caller must join")
    }

    async fn explode() -> TierResult {
        tokio::time::sleep(Duration::from_millis(10)).await;
        panic!("adapter exploded")
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_computation() {
        let registry = InFlightRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let start = || {
            let calls = Arc::clone(&calls);
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                TierResult::new(2, Vec::new(), Utc::now())
            }
        };

        let (first, a) = registry.get_or_start(&domain(), 2, start());
        let (second, b) = registry.get_or_start(&domain(), 2, start());
        assert_eq!(a, Attachment::Started);
        assert_eq!(b, Attachment::Joined);
        assert_eq!(registry.subscriber_count(&domain(), 2), Some(2));

        let (r1, r2) = tokio::join!(first, second);
        assert_eq!(r1.unwrap(), r2.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_different_tiers_do_not_share() {
        let registry = InFlightRegistry::new();
        let (t1, a) = registry.get_or_start(&domain(), 1, || async {
            TierResult::new(1, Vec::new(), Utc::now())
        });
        let (t2, b) = registry.get_or_start(&domain(), 2, || async {
            TierResult::new(2, Vec::new(), Utc::now())
        });

        assert_eq!((a, b), (Attachment::Started, Attachment::Started));
        assert_eq!(t1.await.unwrap().tier_number, 1);
        assert_eq!(t2.await.unwrap().tier_number, 2);
    }

    #[tokio::test]
    async fn test_dropped_subscriber_does_not_cancel_computation() {
        let registry = InFlightRegistry::new();
        let (first, _) = registry.get_or_start(&domain(), 1, || async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            TierResult::new(1, Vec::new(), Utc::now())
        });
        let (second, _) = registry.get_or_start(&domain(), 1, never_started);

        drop(first);
        assert_eq!(second.await.unwrap().tier_number, 1);
    }

    #[tokio::test]
    async fn test_panic_settles_every_subscriber_with_error() {
        let registry = InFlightRegistry::new();
        let (first, _) = registry.get_or_start(&domain(), 3, explode);
        let (second, _) = registry.get_or_start(&domain(), 3, || async {
            TierResult::new(3, Vec::new(), Utc::now())
        });

        let (r1, r2) = tokio::join!(first, second);
        let err = r1.unwrap_err();
        assert_eq!(err.reason, "computation panicked");
        assert_eq!(r2.unwrap_err(), err);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_settled_key_starts_fresh_computation() {
        let registry = InFlightRegistry::new();
        let (first, _) = registry.get_or_start(&domain(), 1, || async {
            TierResult::new(1, Vec::new(), Utc::now())
        });
        first.await.unwrap();

        let (_, attachment) = registry.get_or_start(&domain(), 1, || async {
            TierResult::new(1, Vec::new(), Utc::now())
        });
        assert_eq!(attachment, Attachment::Started);
    }
}
