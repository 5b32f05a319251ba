//! Compilation caches.
//!
//! [`ViewCache`] memoizes parsed documents per resolved path. A miss admits
//! exactly one builder per key; concurrent readers wait on the in-flight
//! build and fail with `Timeout` when their budget elapses instead of
//! hanging. Entries expire by TTL or when a watched file changes.
//!
//! [`LazyCache`] is the independent fragment store for deferred content:
//! fully-expanded HTML keyed by a one-time token with its own TTL.

use crate::RenderError;
use plume_core::Document;
use rand::Rng;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub doc: std::sync::Arc<Document>,
    pub expires: Instant,
    pub watched: Vec<PathBuf>,
}

enum Slot {
    Building,
    Ready(CacheEntry),
}

pub struct ViewCache {
    slots: Mutex<HashMap<String, Slot>>,
    cond: Condvar,
    ttl: Duration,
}

impl ViewCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            cond: Condvar::new(),
            ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    /// Returns the cached document for `key`, or runs `build` to produce
    /// it. While a build is in flight every other caller for the same key
    /// blocks until it finishes or `deadline` passes.
    pub fn get_or_compile<F>(
        &self,
        key: &str,
        deadline: Instant,
        build: F,
    ) -> Result<std::sync::Arc<Document>, RenderError>
    where
        F: FnOnce() -> Result<(std::sync::Arc<Document>, Vec<PathBuf>), RenderError>,
    {
        let mut slots = self.lock();
        loop {
            match slots.get(key) {
                Some(Slot::Ready(entry)) if entry.expires > Instant::now() => {
                    return Ok(entry.doc.clone());
                }
                Some(Slot::Building) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(RenderError::Timeout);
                    }
                    let (guard, wait) = self
                        .cond
                        .wait_timeout(slots, deadline - now)
                        .unwrap_or_else(|poison| poison.into_inner());
                    slots = guard;
                    if wait.timed_out() && matches!(slots.get(key), Some(Slot::Building)) {
                        return Err(RenderError::Timeout);
                    }
                }
                _ => {
                    slots.insert(key.to_string(), Slot::Building);
                    drop(slots);

                    let built = build();

                    slots = self.lock();
                    match built {
                        Ok((doc, watched)) => {
                            slots.insert(
                                key.to_string(),
                                Slot::Ready(CacheEntry {
                                    doc: doc.clone(),
                                    expires: Instant::now() + self.ttl,
                                    watched,
                                }),
                            );
                            self.cond.notify_all();
                            return Ok(doc);
                        }
                        Err(err) => {
                            slots.remove(key);
                            self.cond.notify_all();
                            return Err(err);
                        }
                    }
                }
            }
        }
    }

    /// True when a fresh entry exists for `key`.
    pub fn contains(&self, key: &str) -> bool {
        matches!(
            self.lock().get(key),
            Some(Slot::Ready(entry)) if entry.expires > Instant::now()
        )
    }

    /// Drops every entry that watches `path`.
    pub fn invalidate_path(&self, path: &Path) {
        self.lock().retain(|_, slot| match slot {
            Slot::Ready(entry) => !entry.watched.iter().any(|w| w == path),
            Slot::Building => true,
        });
    }

    pub fn invalidate_key(&self, key: &str) {
        self.lock().remove(key);
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.lock().retain(|_, slot| match slot {
            Slot::Ready(entry) => entry.expires > now,
            Slot::Building => true,
        });
    }
}

/// Expanded-HTML fragments keyed by a one-time token.
pub struct LazyCache {
    slots: Mutex<HashMap<String, (String, Instant)>>,
    ttl: Duration,
}

impl LazyCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, (String, Instant)>> {
        self.slots.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    /// Stores a fragment and returns its token.
    pub fn stash(&self, html: String) -> String {
        let token: String = rand::thread_rng()
            .sample_iter(rand::distributions::Alphanumeric)
            .take(48)
            .map(char::from)
            .collect();
        let now = Instant::now();
        let mut slots = self.lock();
        slots.retain(|_, (_, expires)| *expires > now);
        slots.insert(token.clone(), (html, now + self.ttl));
        token
    }

    /// Consumes a fragment. Each token resolves at most once.
    pub fn take(&self, token: &str) -> Option<String> {
        let (html, expires) = self.lock().remove(token)?;
        (expires > Instant::now()).then_some(html)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn doc() -> Arc<Document> {
        Arc::new(Document::default())
    }

    #[test]
    fn test_hit_after_miss() {
        let cache = ViewCache::new(Duration::from_secs(60));
        let deadline = Instant::now() + Duration::from_secs(1);
        let first = cache
            .get_or_compile("view:a", deadline, || Ok((doc(), Vec::new())))
            .unwrap();
        let second = cache
            .get_or_compile("view:a", deadline, || panic!("must not rebuild"))
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_concurrent_misses_build_once() {
        let cache = Arc::new(ViewCache::new(Duration::from_secs(60)));
        let builds = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                let builds = builds.clone();
                std::thread::spawn(move || {
                    let deadline = Instant::now() + Duration::from_secs(5);
                    cache.get_or_compile("view:shared", deadline, || {
                        builds.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(50));
                        Ok((doc(), Vec::new()))
                    })
                })
            })
            .collect();

        for handle in handles {
            assert!(handle.join().unwrap().is_ok());
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reader_times_out_instead_of_hanging() {
        let cache = Arc::new(ViewCache::new(Duration::from_secs(60)));

        let slow = {
            let cache = cache.clone();
            std::thread::spawn(move || {
                let deadline = Instant::now() + Duration::from_secs(5);
                cache.get_or_compile("view:slow", deadline, || {
                    std::thread::sleep(Duration::from_millis(400));
                    Ok((doc(), Vec::new()))
                })
            })
        };

        // Give the builder time to claim the slot.
        std::thread::sleep(Duration::from_millis(50));
        let deadline = Instant::now() + Duration::from_millis(50);
        let waited = cache.get_or_compile("view:slow", deadline, || {
            panic!("second builder must not run")
        });
        assert_eq!(waited.unwrap_err(), RenderError::Timeout);

        assert!(slow.join().unwrap().is_ok());
    }

    #[test]
    fn test_failed_build_releases_slot() {
        let cache = ViewCache::new(Duration::from_secs(60));
        let deadline = Instant::now() + Duration::from_secs(1);
        let err = cache.get_or_compile("view:x", deadline, || Err(RenderError::NotFound));
        assert_eq!(err.unwrap_err(), RenderError::NotFound);

        let ok = cache.get_or_compile("view:x", deadline, || Ok((doc(), Vec::new())));
        assert!(ok.is_ok());
    }

    #[test]
    fn test_ttl_expiry_rebuilds() {
        let cache = ViewCache::new(Duration::from_millis(10));
        let deadline = Instant::now() + Duration::from_secs(1);
        cache
            .get_or_compile("view:t", deadline, || Ok((doc(), Vec::new())))
            .unwrap();
        std::thread::sleep(Duration::from_millis(30));
        assert!(!cache.contains("view:t"));

        let rebuilt = Arc::new(AtomicUsize::new(0));
        let counter = rebuilt.clone();
        cache
            .get_or_compile("view:t", deadline, || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok((doc(), Vec::new()))
            })
            .unwrap();
        assert_eq!(rebuilt.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invalidate_by_watched_path() {
        let cache = ViewCache::new(Duration::from_secs(60));
        let deadline = Instant::now() + Duration::from_secs(1);
        let path = PathBuf::from("/views/page.xhtml");
        cache
            .get_or_compile("view:page", deadline, || Ok((doc(), vec![path.clone()])))
            .unwrap();
        assert!(cache.contains("view:page"));

        cache.invalidate_path(&path);
        assert!(!cache.contains("view:page"));
    }

    #[test]
    fn test_lazy_cache_tokens_are_one_shot() {
        let lazy = LazyCache::new(Duration::from_secs(60));
        let token = lazy.stash("<p>later</p>".to_string());
        assert_eq!(lazy.take(&token).as_deref(), Some("<p>later</p>"));
        assert_eq!(lazy.take(&token), None);
    }

    #[test]
    fn test_lazy_cache_expiry() {
        let lazy = LazyCache::new(Duration::from_millis(5));
        let token = lazy.stash("x".to_string());
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(lazy.take(&token), None);
    }
}
