//! Memoizing wrapper around async producers.
//!
//! Concurrent misses for the same arguments are not coalesced: each caller
//! that misses runs the producer itself.

use std::future::Future;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use super::key::generate_key;
use super::service::CacheService;

pub struct CachedProducer<F> {
    cache: CacheService,
    producer: F,
    type_label: String,
    ttl: Duration,
}

impl CacheService {
    /// Wrap `producer` so results are served from the cache for `ttl`.
    ///
    /// ```ignore
    /// let fetch_course = cache.cached(
    ///     |id: u64| async move { api.course(id).await },
    ///     "course",
    ///     Duration::from_secs(300),
    /// );
    /// let course = fetch_course.call(42).await?;
    /// ```
    pub fn cached<F>(
        &self,
        producer: F,
        type_label: impl Into<String>,
        ttl: Duration,
    ) -> CachedProducer<F> {
        CachedProducer {
            cache: self.clone(),
            producer,
            type_label: type_label.into(),
            ttl,
        }
    }
}

impl<F> CachedProducer<F> {
    pub fn type_label(&self) -> &str {
        &self.type_label
    }

    /// Return the cached result for `args`, or run the producer and cache
    /// what it returns. Producer errors pass through and are not cached.
    pub async fn call<A, T, E, Fut>(&self, args: A) -> Result<T, E>
    where
        F: Fn(A) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        A: Serialize,
        T: Serialize + DeserializeOwned,
    {
        let key = generate_key(&self.type_label, &args);
        if let Some(hit) = self.cache.get_async::<T>(&key).await {
            return Ok(hit);
        }

        debug!(key = %key, "Cache miss, calling producer");
        let value = (self.producer)(args).await?;
        self.cache.set_async(&key, &value, self.ttl).await;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use serde::Deserialize;

    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemoryStore;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Course {
        id: u64,
        title: String,
    }

    #[derive(Serialize)]
    struct CourseQuery {
        id: u64,
        include_modules: bool,
    }

    fn setup() -> (Arc<ManualClock>, CacheService) {
        let clock = Arc::new(ManualClock::starting_now());
        let cache = CacheService::builder()
            .clock(clock.clone())
            .bounded_store(Arc::new(MemoryStore::new(64 * 1024)))
            .build();
        (clock, cache)
    }

    #[tokio::test]
    async fn test_producer_called_once_within_ttl() {
        let (clock, cache) = setup();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let fetch = cache.cached(
            move |query: CourseQuery| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(Course {
                        id: query.id,
                        title: "Onboarding".into(),
                    })
                }
            },
            "course",
            Duration::from_millis(1000),
        );

        let query = || CourseQuery {
            id: 7,
            include_modules: true,
        };
        let first = fetch.call(query()).await.unwrap();
        clock.advance_millis(500);
        let second = fetch.call(query()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        clock.advance_millis(1000);
        fetch.call(query()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
    }

    #[tokio::test]
    async fn test_different_args_are_cached_separately() {
        let (_clock, cache) = setup();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let fetch = cache.cached(
            move |id: u64| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { Ok::<_, String>(id * 2) }
            },
            "double",
            Duration::from_secs(60),
        );

        assert_eq!(fetch.call(1).await, Ok(2));
        assert_eq!(fetch.call(2).await, Ok(4));
        assert_eq!(fetch.call(1).await, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(fetch.type_label(), "double");
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let (_clock, cache) = setup();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let fetch = cache.cached(
            move |_: ()| {
                let attempt = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        Err("upstream 503".to_string())
                    } else {
                        Ok(vec!["ok".to_string()])
                    }
                }
            },
            "flaky",
            Duration::from_secs(60),
        );

        assert_eq!(fetch.call(()).await, Err("upstream 503".to_string()));
        assert_eq!(fetch.call(()).await, Ok(vec!["ok".to_string()]));
        assert_eq!(fetch.call(()).await, Ok(vec!["ok".to_string()]));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_misses_each_call_producer() {
        let (_clock, cache) = setup();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let fetch = cache.cached(
            move |id: u64| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    Ok::<_, String>(id)
                }
            },
            "slow",
            Duration::from_secs(60),
        );

        let (a, b) = futures::future::join(fetch.call(9), fetch.call(9)).await;
        assert_eq!((a, b), (Ok(9), Ok(9)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
