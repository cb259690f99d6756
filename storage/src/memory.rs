//! In-process coordination store.
//!
//! Implements the full primitive set with TTL expiry and expiration
//! notifications, so several simulated nodes can share one instance. Expired
//! keys are reaped lazily on every call and by a background task started on
//! the first subscription.

use async_trait::async_trait;
use mqttpool_common::{ClusterError, CoordinationStore, ExpirationStream, Result};
use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;

const NOTIFY_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct State {
    strings: HashMap<String, Entry>,
    hashes: HashMap<String, BTreeMap<String, String>>,
    lists: HashMap<String, Vec<String>>,
}

impl State {
    fn take_expired(&mut self, now: Instant) -> Vec<String> {
        let expired: Vec<String> = self
            .strings
            .iter()
            .filter(|(_, entry)| entry.expires_at.map_or(false, |at| at <= now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            self.strings.remove(key);
        }
        expired
    }
}

struct Inner {
    state: Mutex<State>,
    notifier: Mutex<broadcast::Sender<String>>,
    unavailable: AtomicBool,
    reaper_started: AtomicBool,
    reap_interval: Duration,
}

impl Inner {
    fn reap(&self, state: &mut State) {
        let expired = state.take_expired(Instant::now());
        if expired.is_empty() {
            return;
        }
        let notifier = self.notifier.lock();
        for key in expired {
            debug!("Key expired: {}", key);
            // No subscribers is not an error
            let _ = notifier.send(key);
        }
    }
}

/// Shared in-memory store; clones share state
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_reap_interval(Duration::from_millis(20))
    }

    pub fn with_reap_interval(reap_interval: Duration) -> Self {
        let (tx, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                notifier: Mutex::new(tx),
                unavailable: AtomicBool::new(false),
                reaper_started: AtomicBool::new(false),
                reap_interval,
            }),
        }
    }

    /// Make every subsequent call fail with `StoreUnavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// End every open expiration stream, as a dropped subscription would
    pub fn sever_subscriptions(&self) {
        let (tx, _) = broadcast::channel(NOTIFY_CAPACITY);
        *self.inner.notifier.lock() = tx;
    }

    /// Expire `key` immediately, emitting a notification if it existed
    pub fn expire_now(&self, key: &str) {
        let mut state = self.inner.state.lock();
        if let Some(entry) = state.strings.get_mut(key) {
            entry.expires_at = Some(Instant::now());
        }
        self.inner.reap(&mut state);
    }

    /// Remaining time to live, if the key exists and has one
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let state = self.inner.state.lock();
        state
            .strings
            .get(key)
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(ClusterError::store("memory store marked unavailable"));
        }
        let mut state = self.inner.state.lock();
        self.inner.reap(&mut state);
        Ok(state)
    }

    fn start_reaper(&self) {
        if self.inner.reaper_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let interval = self.inner.reap_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let mut state = inner.state.lock();
                inner.reap(&mut state);
            }
        });
    }

    fn add(&self, key: &str, delta: i64) -> Result<i64> {
        let mut state = self.lock()?;
        let entry = state.strings.entry(key.to_string()).or_insert(Entry {
            value: "0".to_string(),
            expires_at: None,
        });
        let current: i64 = entry
            .value
            .parse()
            .map_err(|_| ClusterError::corrupt(key, format!("not an integer: {}", entry.value)))?;
        let next = current + delta;
        entry.value = next.to_string();
        Ok(next)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.lock()?;
        if state.strings.contains_key(key) {
            return Ok(false);
        }
        state.strings.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut state = self.lock()?;
        state.strings.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let state = self.lock()?;
        Ok(state.strings.get(key).map(|entry| entry.value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut state = self.lock()?;
        state.strings.remove(key);
        state.hashes.remove(key);
        state.lists.remove(key);
        Ok(())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let mut state = self.lock()?;
        match state.strings.get(key) {
            Some(entry) if entry.value == expected => {
                state.strings.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn hash_set(&self, map: &str, field: &str, value: &str) -> Result<()> {
        let mut state = self.lock()?;
        state
            .hashes
            .entry(map.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hash_set_if_absent(&self, map: &str, field: &str, value: &str) -> Result<bool> {
        let mut state = self.lock()?;
        let hash = state.hashes.entry(map.to_string()).or_default();
        if hash.contains_key(field) {
            return Ok(false);
        }
        hash.insert(field.to_string(), value.to_string());
        Ok(true)
    }

    async fn hash_get(&self, map: &str, field: &str) -> Result<Option<String>> {
        let state = self.lock()?;
        Ok(state.hashes.get(map).and_then(|hash| hash.get(field).cloned()))
    }

    async fn hash_get_all(&self, map: &str) -> Result<Vec<(String, String)>> {
        let state = self.lock()?;
        Ok(state
            .hashes
            .get(map)
            .map(|hash| {
                hash.iter()
                    .map(|(field, value)| (field.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn hash_delete(&self, map: &str, field: &str) -> Result<bool> {
        let mut state = self.lock()?;
        let removed = match state.hashes.get_mut(map) {
            Some(hash) => hash.remove(field).is_some(),
            None => false,
        };
        if state.hashes.get(map).map_or(false, |hash| hash.is_empty()) {
            state.hashes.remove(map);
        }
        Ok(removed)
    }

    async fn hash_exists(&self, map: &str, field: &str) -> Result<bool> {
        let state = self.lock()?;
        Ok(state
            .hashes
            .get(map)
            .map_or(false, |hash| hash.contains_key(field)))
    }

    async fn list_push(&self, list: &str, value: &str) -> Result<()> {
        let mut state = self.lock()?;
        state
            .lists
            .entry(list.to_string())
            .or_default()
            .push(value.to_string());
        Ok(())
    }

    async fn list_remove(&self, list: &str, value: &str) -> Result<()> {
        let mut state = self.lock()?;
        if let Some(items) = state.lists.get_mut(list) {
            items.retain(|item| item != value);
            if items.is_empty() {
                state.lists.remove(list);
            }
        }
        Ok(())
    }

    async fn list_range(&self, list: &str) -> Result<Vec<String>> {
        let state = self.lock()?;
        Ok(state.lists.get(list).cloned().unwrap_or_default())
    }

    async fn increment(&self, key: &str) -> Result<i64> {
        self.add(key, 1)
    }

    async fn decrement(&self, key: &str) -> Result<i64> {
        self.add(key, -1)
    }

    async fn subscribe_expirations(&self) -> Result<ExpirationStream> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(ClusterError::store("memory store marked unavailable"));
        }
        self.start_reaper();

        let rx = self.inner.notifier.lock().subscribe();
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(key) => return Some((key, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Expiration subscriber lagged by {} keys", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(stream))
    }
}
