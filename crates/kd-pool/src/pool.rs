//! KeyedPool - pool of lifecycle-managed dispatchers partitioned by endpoint key
//!
//! - One idle deque + active count per key, each behind its own lock
//! - Pool-wide total bounded by an atomic reservation
//! - Blocked borrowers wake on a per-key Notify (slot freed on that key) or the
//!   pool-wide Notify (total capacity freed); fairness between woken waiters
//!   and new arrivals is unspecified
//! - Factory hooks always run outside locks, under an `ActiveSlot` that frees
//!   its accounting when dropped, so cancelled borrows never leak capacity
//! - A key's entry is dropped from the map once it holds no dispatchers and
//!   no borrower references it

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use kd_common::{ExhaustedAction, KeyStats, PoolConfig, PoolCounters, PoolStats};

use crate::error::{FactoryError, PoolError};
use crate::factory::DispatcherFactory;
use crate::pool_metrics;
use crate::Result;

struct IdleDispatcher<D> {
    dispatcher: D,
    idle_since: Instant,
}

/// Per-key bookkeeping. The front of `idle` is always the oldest entry.
struct KeyState<D> {
    idle: VecDeque<IdleDispatcher<D>>,
    active: usize,
}

impl<D> KeyState<D> {
    fn size(&self) -> usize {
        self.idle.len() + self.active
    }
}

struct KeyEntry<D> {
    state: Mutex<KeyState<D>>,
    /// Signalled when a dispatcher for this key goes idle or a slot frees up
    available: Notify,
    /// Live `EntryRef`s; only changed while the map shard is held or by a holder
    users: AtomicUsize,
}

impl<D> KeyEntry<D> {
    fn new() -> Self {
        Self {
            state: Mutex::new(KeyState {
                idle: VecDeque::new(),
                active: 0,
            }),
            available: Notify::new(),
            users: AtomicUsize::new(0),
        }
    }

    fn occupancy(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.active, state.idle.len())
    }
}

type Entry<F> = Arc<KeyEntry<<F as DispatcherFactory>::Dispatcher>>;

#[derive(Default)]
struct Counters {
    created: AtomicU64,
    destroyed: AtomicU64,
    borrowed: AtomicU64,
    returned: AtomicU64,
    invalidated: AtomicU64,
    validation_failed: AtomicU64,
    exhausted: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> PoolCounters {
        PoolCounters {
            created: self.created.load(Ordering::Relaxed),
            destroyed: self.destroyed.load(Ordering::Relaxed),
            borrowed: self.borrowed.load(Ordering::Relaxed),
            returned: self.returned.load(Ordering::Relaxed),
            invalidated: self.invalidated.load(Ordering::Relaxed),
            validation_failed: self.validation_failed.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
        }
    }
}

enum Claim<F: DispatcherFactory> {
    /// An idle dispatcher, already counted as active
    Idle(F::Dispatcher),
    /// A reserved slot; the caller must create the dispatcher
    Create,
    /// An idle dispatcher taken from another key to free total capacity
    Reclaimed(F::Key, F::Dispatcher),
    Wait,
}

struct PoolInner<F: DispatcherFactory> {
    config: PoolConfig,
    factory: Arc<F>,
    entries: DashMap<F::Key, Entry<F>>,
    /// Idle + active dispatchers across all keys
    total: AtomicUsize,
    capacity_freed: Notify,
    drained: Notify,
    closed: AtomicBool,
    shutdown: CancellationToken,
    counters: Counters,
}

/// A borrower's hold on a key's entry. The last one dropped prunes the entry
/// if the key has no dispatchers left.
struct EntryRef<F: DispatcherFactory> {
    pool: Arc<PoolInner<F>>,
    key: F::Key,
    entry: Entry<F>,
}

impl<F: DispatcherFactory> Clone for EntryRef<F> {
    fn clone(&self) -> Self {
        self.entry.users.fetch_add(1, Ordering::SeqCst);
        Self {
            pool: self.pool.clone(),
            key: self.key.clone(),
            entry: self.entry.clone(),
        }
    }
}

impl<F: DispatcherFactory> Deref for EntryRef<F> {
    type Target = KeyEntry<F::Dispatcher>;

    fn deref(&self) -> &Self::Target {
        &self.entry
    }
}

impl<F: DispatcherFactory> Drop for EntryRef<F> {
    fn drop(&mut self) {
        if self.entry.users.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.pool.prune_entry(&self.key);
        }
    }
}

/// One dispatcher counted as active on a key. Dropping it frees the slot.
struct ActiveSlot<F: DispatcherFactory> {
    pool: Arc<PoolInner<F>>,
    entry: EntryRef<F>,
    armed: bool,
}

impl<F: DispatcherFactory> ActiveSlot<F> {
    fn new(entry: EntryRef<F>) -> Self {
        Self {
            pool: entry.pool.clone(),
            entry,
            armed: true,
        }
    }

    /// Move the dispatcher from active to idle. Hands it back when the idle
    /// deque is full or the pool has closed.
    fn park(
        mut self,
        dispatcher: F::Dispatcher,
    ) -> std::result::Result<(), (Self, F::Dispatcher)> {
        let mut state = self.entry.state.lock();
        if self.pool.closed.load(Ordering::SeqCst)
            || state.idle.len() >= self.pool.config.max_idle_per_key
        {
            drop(state);
            return Err((self, dispatcher));
        }
        state.active = state.active.saturating_sub(1);
        state.idle.push_back(IdleDispatcher {
            dispatcher,
            idle_since: Instant::now(),
        });
        let (active, idle) = (state.active, state.idle.len());
        drop(state);

        self.armed = false;
        self.pool.record_occupancy(&self.entry.key, active, idle);
        self.entry.available.notify_one();
        if self.pool.config.max_total.is_some() {
            self.pool.capacity_freed.notify_one();
        }
        Ok(())
    }
}

impl<F: DispatcherFactory> Drop for ActiveSlot<F> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let (active, idle) = {
            let mut state = self.entry.state.lock();
            state.active = state.active.saturating_sub(1);
            (state.active, state.idle.len())
        };
        self.pool.record_occupancy(&self.entry.key, active, idle);
        self.pool.release_total(1);
        self.pool.notify_freed(&self.entry, 1);
    }
}

struct Checkout<F: DispatcherFactory> {
    slot: ActiveSlot<F>,
    dispatcher: F::Dispatcher,
}

/// A dispatcher lent out by the pool.
///
/// Hand it back with [`PooledDispatcher::release`] or discard it with
/// [`PooledDispatcher::invalidate`]. Dropping the handle without either
/// returns it through the release path on a background task.
pub struct PooledDispatcher<F: DispatcherFactory> {
    checkout: Option<Checkout<F>>,
    key: F::Key,
    activated: bool,
    borrowed_at: Instant,
}

impl<F: DispatcherFactory> PooledDispatcher<F> {
    fn new(slot: ActiveSlot<F>, key: F::Key, dispatcher: F::Dispatcher) -> Self {
        Self {
            checkout: Some(Checkout { slot, dispatcher }),
            key,
            activated: false,
            borrowed_at: Instant::now(),
        }
    }

    /// Endpoint key this dispatcher is bound to
    pub fn key(&self) -> &F::Key {
        &self.key
    }

    /// Time since the dispatcher was handed out
    pub fn held_for(&self) -> Duration {
        self.borrowed_at.elapsed()
    }

    /// Return the dispatcher to the pool
    pub async fn release(mut self) {
        let held = self.held_for();
        if let Some(checkout) = self.checkout.take() {
            let pool = checkout.slot.pool.clone();
            pool.return_dispatcher(checkout, &self.key, held).await;
        }
    }

    /// Discard the dispatcher as known-bad; it is destroyed, never re-idled
    pub async fn invalidate(mut self) {
        if let Some(checkout) = self.checkout.take() {
            let pool = checkout.slot.pool.clone();
            pool.counters.invalidated.fetch_add(1, Ordering::Relaxed);
            debug!(endpoint = %self.key, "Dispatcher invalidated by caller");
            pool.destroy_checked_out(checkout, &self.key, "invalidated").await;
        }
    }

    async fn discard(mut self, reason: &'static str) {
        if let Some(checkout) = self.checkout.take() {
            let pool = checkout.slot.pool.clone();
            pool.destroy_checked_out(checkout, &self.key, reason).await;
        }
    }

    fn dispatcher_ref(&self) -> Option<&F::Dispatcher> {
        self.checkout.as_ref().map(|c| &c.dispatcher)
    }

    fn dispatcher_mut(&mut self) -> Option<&mut F::Dispatcher> {
        self.checkout.as_mut().map(|c| &mut c.dispatcher)
    }
}

impl<F: DispatcherFactory> Deref for PooledDispatcher<F> {
    type Target = F::Dispatcher;

    fn deref(&self) -> &Self::Target {
        self.dispatcher_ref()
            .expect("dispatcher is present until the handle is consumed")
    }
}

impl<F: DispatcherFactory> DerefMut for PooledDispatcher<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.dispatcher_mut()
            .expect("dispatcher is present until the handle is consumed")
    }
}

impl<F: DispatcherFactory> Drop for PooledDispatcher<F> {
    fn drop(&mut self) {
        let Some(checkout) = self.checkout.take() else {
            return;
        };
        let key = self.key.clone();
        let activated = self.activated;
        let held = self.borrowed_at.elapsed();

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!(endpoint = %key, activated, "Dispatcher dropped without release, reclaiming");
                let pool = checkout.slot.pool.clone();
                runtime.spawn(async move {
                    if activated {
                        pool.return_dispatcher(checkout, &key, held).await;
                    } else {
                        pool.destroy_checked_out(checkout, &key, "abandoned").await;
                    }
                });
            }
            Err(_) => {
                warn!(endpoint = %key, "Dispatcher dropped outside a runtime, discarding without destroy hook");
                drop(checkout);
            }
        }
    }
}

impl<F: DispatcherFactory> PoolInner<F> {
    /// Reference the key's entry, creating it on first use. The user count is
    /// raised while the shard is held so a concurrent prune cannot remove it.
    fn entry(self: &Arc<Self>, key: &F::Key) -> EntryRef<F> {
        let entry = match self.entries.get(key) {
            Some(existing) => {
                existing.users.fetch_add(1, Ordering::SeqCst);
                existing.value().clone()
            }
            None => {
                let inserted = self
                    .entries
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(KeyEntry::new()));
                inserted.users.fetch_add(1, Ordering::SeqCst);
                inserted.value().clone()
            }
        };
        EntryRef {
            pool: self.clone(),
            key: key.clone(),
            entry,
        }
    }

    /// Drop the key's entry when nothing references it and it holds no dispatchers
    fn prune_entry(&self, key: &F::Key) {
        let removed = self.entries.remove_if(key, |_, entry| {
            entry.users.load(Ordering::SeqCst) == 0 && entry.state.lock().size() == 0
        });
        if removed.is_some() {
            debug!(endpoint = %key, "Released empty endpoint entry");
        }
    }

    fn record_occupancy(&self, key: &F::Key, active: usize, idle: usize) {
        pool_metrics::set_key_occupancy(&key.to_string(), active, idle);
    }

    fn try_reserve_total(&self) -> bool {
        let Some(max_total) = self.config.max_total else {
            self.total.fetch_add(1, Ordering::SeqCst);
            return true;
        };
        let mut current = self.total.load(Ordering::SeqCst);
        loop {
            if current >= max_total {
                return false;
            }
            match self.total.compare_exchange_weak(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn release_total(&self, n: usize) {
        if n == 0 {
            return;
        }
        let previous = self.total.fetch_sub(n, Ordering::SeqCst);
        if previous == n {
            self.drained.notify_waiters();
        }
    }

    fn notify_freed(&self, entry: &KeyEntry<F::Dispatcher>, n: usize) {
        for _ in 0..n {
            entry.available.notify_one();
            self.capacity_freed.notify_one();
        }
    }

    fn pop_idle(&self, state: &mut KeyState<F::Dispatcher>) -> Option<IdleDispatcher<F::Dispatcher>> {
        if self.config.lifo {
            state.idle.pop_back()
        } else {
            state.idle.pop_front()
        }
    }

    fn try_claim(&self, key: &F::Key, entry: &KeyEntry<F::Dispatcher>) -> Result<Claim<F>> {
        {
            let mut state = entry.state.lock();
            if self.closed.load(Ordering::SeqCst) {
                return Err(PoolError::PoolClosed);
            }
            if let Some(idle) = self.pop_idle(&mut state) {
                state.active += 1;
                let (active, idle_len) = (state.active, state.idle.len());
                drop(state);
                self.record_occupancy(key, active, idle_len);
                return Ok(Claim::Idle(idle.dispatcher));
            }
            if state.size() >= self.config.max_active_per_key {
                return Ok(Claim::Wait);
            }
            if self.try_reserve_total() {
                state.active += 1;
                let (active, idle_len) = (state.active, state.idle.len());
                drop(state);
                self.record_occupancy(key, active, idle_len);
                return Ok(Claim::Create);
            }
        }

        // Key has room but the pool as a whole is full
        Ok(match self.reclaim_idle_elsewhere(key) {
            Some((victim_key, dispatcher)) => Claim::Reclaimed(victim_key, dispatcher),
            None => Claim::Wait,
        })
    }

    /// Take the oldest idle dispatcher of any other key, freeing one unit of total capacity
    fn reclaim_idle_elsewhere(&self, key: &F::Key) -> Option<(F::Key, F::Dispatcher)> {
        let mut oldest: Option<(F::Key, Instant)> = None;
        for item in self.entries.iter() {
            if item.key() == key {
                continue;
            }
            let state = item.value().state.lock();
            if let Some(front) = state.idle.front() {
                if oldest.as_ref().map_or(true, |(_, since)| front.idle_since < *since) {
                    oldest = Some((item.key().clone(), front.idle_since));
                }
            }
        }

        let (victim_key, _) = oldest?;
        let victim = self.entries.get(&victim_key)?.value().clone();
        let idle = victim.state.lock().idle.pop_front()?;
        self.release_total(1);
        victim.available.notify_one();

        let (active, idle_len) = victim.occupancy();
        self.record_occupancy(&victim_key, active, idle_len);
        drop(victim);
        self.prune_entry(&victim_key);
        Some((victim_key, idle.dispatcher))
    }

    async fn borrow(
        self: &Arc<Self>,
        key: &F::Key,
        cancel: Option<&CancellationToken>,
    ) -> Result<PooledDispatcher<F>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PoolError::PoolClosed);
        }

        let entry = self.entry(key);
        let started = Instant::now();
        let deadline = self
            .config
            .max_wait
            .map(|wait| tokio::time::Instant::now() + wait);

        loop {
            // Register interest before inspecting state so a release between
            // the check and the wait is not missed
            let key_available = entry.available.notified();
            let capacity_freed = self.capacity_freed.notified();
            tokio::pin!(key_available);
            tokio::pin!(capacity_freed);
            key_available.as_mut().enable();
            capacity_freed.as_mut().enable();

            match self.try_claim(key, &entry)? {
                Claim::Idle(dispatcher) => {
                    let slot = ActiveSlot::new(entry.clone());
                    let handle = PooledDispatcher::new(slot, key.clone(), dispatcher);
                    if let Ok(handle) = self.prepare(handle).await {
                        self.on_borrowed(key, started, false);
                        return Ok(handle);
                    }
                }
                Claim::Create => {
                    let slot = ActiveSlot::new(entry.clone());
                    let dispatcher = match self.factory.create(key).await {
                        Ok(dispatcher) => dispatcher,
                        Err(e) => {
                            pool_metrics::record_create_failed(&key.to_string());
                            warn!(endpoint = %key, error = %e, "Dispatcher creation failed");
                            return Err(PoolError::ResourceCreationFailed {
                                endpoint: key.to_string(),
                                source: e,
                            });
                        }
                    };
                    self.counters.created.fetch_add(1, Ordering::Relaxed);
                    pool_metrics::record_created(&key.to_string());

                    let handle = PooledDispatcher::new(slot, key.clone(), dispatcher);
                    return match self.prepare(handle).await {
                        Ok(handle) => {
                            self.on_borrowed(key, started, true);
                            Ok(handle)
                        }
                        Err(source) => Err(PoolError::ResourceCreationFailed {
                            endpoint: key.to_string(),
                            source,
                        }),
                    };
                }
                Claim::Reclaimed(victim_key, dispatcher) => {
                    debug!(
                        endpoint = %key,
                        victim = %victim_key,
                        "Pool at total capacity, reclaiming idle dispatcher of another endpoint"
                    );
                    self.destroy_dispatcher(&victim_key, dispatcher, "reclaimed").await;
                }
                Claim::Wait => {
                    if self.config.exhausted_action == ExhaustedAction::Fail {
                        return Err(self.exhausted(key));
                    }

                    debug!(endpoint = %key, "No dispatcher available, waiting");
                    tokio::select! {
                        _ = key_available.as_mut() => {}
                        _ = capacity_freed.as_mut() => {}
                        _ = self.shutdown.cancelled() => {}
                        _ = cancelled(cancel) => {
                            self.forward_wakeups(&entry);
                            debug!(endpoint = %key, "Borrow cancelled while waiting");
                            return Err(PoolError::Cancelled(key.to_string()));
                        }
                        _ = expired(deadline) => {
                            self.forward_wakeups(&entry);
                            return Err(self.exhausted(key));
                        }
                    }
                }
            }
        }
    }

    /// Validate (when configured) and activate a dispatcher about to be lent out.
    /// On failure the dispatcher has already been destroyed.
    async fn prepare(
        &self,
        mut handle: PooledDispatcher<F>,
    ) -> std::result::Result<PooledDispatcher<F>, FactoryError> {
        let key = handle.key.clone();

        if self.config.test_on_borrow {
            let valid = match handle.dispatcher_ref() {
                Some(dispatcher) => self.factory.validate(&key, dispatcher).await,
                None => false,
            };
            if !valid {
                self.counters.validation_failed.fetch_add(1, Ordering::Relaxed);
                pool_metrics::record_validation_failed(&key.to_string(), "borrow");
                debug!(endpoint = %key, "Dispatcher failed validation on borrow, destroying");
                handle.discard("invalid").await;
                return Err(FactoryError::Rejected("failed validation".to_string()));
            }
        }

        let activated = match handle.dispatcher_mut() {
            Some(dispatcher) => self.factory.activate(&key, dispatcher).await,
            None => Err(FactoryError::Rejected("dispatcher missing".to_string())),
        };
        if let Err(e) = activated {
            warn!(endpoint = %key, error = %e, "Dispatcher activation failed, destroying");
            handle.discard("activation_failed").await;
            return Err(e);
        }

        handle.activated = true;
        Ok(handle)
    }

    fn on_borrowed(&self, key: &F::Key, started: Instant, created: bool) {
        self.counters.borrowed.fetch_add(1, Ordering::Relaxed);
        let waited = started.elapsed();
        pool_metrics::record_borrowed(&key.to_string(), waited);
        debug!(
            endpoint = %key,
            created,
            wait_ms = waited.as_millis() as u64,
            "Dispatcher borrowed"
        );
    }

    fn exhausted(&self, key: &F::Key) -> PoolError {
        self.counters.exhausted.fetch_add(1, Ordering::Relaxed);
        pool_metrics::record_exhausted(&key.to_string());
        debug!(endpoint = %key, "Pool exhausted for endpoint");
        PoolError::PoolExhausted(key.to_string())
    }

    /// Pass on a wake-up this waiter may have consumed without using it
    fn forward_wakeups(&self, entry: &KeyEntry<F::Dispatcher>) {
        entry.available.notify_one();
        self.capacity_freed.notify_one();
    }

    async fn return_dispatcher(&self, checkout: Checkout<F>, key: &F::Key, held: Duration) {
        self.counters.returned.fetch_add(1, Ordering::Relaxed);
        pool_metrics::record_hold_time(&key.to_string(), held);

        let Checkout { slot, mut dispatcher } = checkout;

        if self.closed.load(Ordering::SeqCst) {
            self.destroy_checked_out(Checkout { slot, dispatcher }, key, "closed").await;
            return;
        }

        if self.config.test_on_return && !self.factory.validate(key, &dispatcher).await {
            self.counters.validation_failed.fetch_add(1, Ordering::Relaxed);
            pool_metrics::record_validation_failed(&key.to_string(), "return");
            debug!(endpoint = %key, "Dispatcher failed validation on return, destroying");
            self.destroy_checked_out(Checkout { slot, dispatcher }, key, "invalid").await;
            return;
        }

        if let Err(e) = self.factory.passivate(key, &mut dispatcher).await {
            warn!(endpoint = %key, error = %e, "Dispatcher passivation failed, destroying");
            self.destroy_checked_out(Checkout { slot, dispatcher }, key, "passivate_failed").await;
            return;
        }

        match slot.park(dispatcher) {
            Ok(()) => debug!(endpoint = %key, "Dispatcher returned to idle"),
            Err((slot, dispatcher)) => {
                debug!(endpoint = %key, "Idle limit reached or pool closed, destroying returned dispatcher");
                self.destroy_checked_out(Checkout { slot, dispatcher }, key, "idle_full").await;
            }
        }
    }

    /// Destroy a checked-out dispatcher; its slot is freed once destroy completes
    async fn destroy_checked_out(&self, checkout: Checkout<F>, key: &F::Key, reason: &'static str) {
        let Checkout { slot, dispatcher } = checkout;
        self.destroy_dispatcher(key, dispatcher, reason).await;
        drop(slot);
    }

    async fn destroy_dispatcher(&self, key: &F::Key, dispatcher: F::Dispatcher, reason: &'static str) {
        if let Err(e) = self.factory.destroy(key, dispatcher).await {
            error!(endpoint = %key, reason, error = %e, "Dispatcher destroy failed");
        }
        self.counters.destroyed.fetch_add(1, Ordering::Relaxed);
        pool_metrics::record_destroyed(&key.to_string(), reason);
        debug!(endpoint = %key, reason, "Dispatcher destroyed");
    }

    async fn clear_entry(&self, key: &F::Key, entry: &KeyEntry<F::Dispatcher>, reason: &'static str) -> usize {
        let drained: Vec<IdleDispatcher<F::Dispatcher>> = {
            let mut state = entry.state.lock();
            state.idle.drain(..).collect()
        };
        let count = drained.len();
        if count == 0 {
            return 0;
        }

        self.release_total(count);
        self.notify_freed(entry, count);
        let (active, idle_len) = entry.occupancy();
        self.record_occupancy(key, active, idle_len);
        self.prune_entry(key);

        for idle in drained {
            self.destroy_dispatcher(key, idle.dispatcher, reason).await;
        }
        count
    }

    fn snapshot_entries(&self) -> Vec<(F::Key, Entry<F>)> {
        self.entries
            .iter()
            .map(|item| (item.key().clone(), item.value().clone()))
            .collect()
    }

    async fn clear_all(&self, reason: &'static str) -> usize {
        let mut cleared = 0;
        for (key, entry) in self.snapshot_entries() {
            cleared += self.clear_entry(&key, &entry, reason).await;
        }
        cleared
    }

    async fn evict_idle(&self) -> usize {
        let Some(min_idle) = self.config.min_evictable_idle_time else {
            return 0;
        };

        let mut victims = Vec::new();
        for (key, entry) in self.snapshot_entries() {
            let mut expired = Vec::new();
            {
                let mut state = entry.state.lock();
                while state
                    .idle
                    .front()
                    .map_or(false, |idle| idle.idle_since.elapsed() >= min_idle)
                {
                    if let Some(idle) = state.idle.pop_front() {
                        expired.push(idle.dispatcher);
                    }
                }
            }
            if !expired.is_empty() {
                self.release_total(expired.len());
                self.notify_freed(&entry, expired.len());
                let (active, idle_len) = entry.occupancy();
                self.record_occupancy(&key, active, idle_len);
                drop(entry);
                self.prune_entry(&key);
                victims.extend(expired.into_iter().map(|d| (key.clone(), d)));
            }
        }

        let evicted = victims.len();
        for (key, dispatcher) in victims {
            self.destroy_dispatcher(&key, dispatcher, "evicted").await;
        }
        if evicted > 0 {
            debug!(evicted, "Evicted idle dispatchers");
        }
        evicted
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("Dispatcher pool already closed");
            return;
        }

        info!(
            total = self.total.load(Ordering::SeqCst),
            keys = self.entries.len(),
            "Closing dispatcher pool"
        );
        self.shutdown.cancel();

        let destroyed = self.clear_all("closed").await;
        let deadline = tokio::time::Instant::now() + self.config.close_timeout;

        loop {
            let drained = self.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();

            let remaining = self.total.load(Ordering::SeqCst);
            if remaining == 0 {
                info!(destroyed_idle = destroyed, "Dispatcher pool closed");
                return;
            }

            debug!(remaining, "Waiting for checked-out dispatchers to be returned");
            if tokio::time::timeout_at(deadline, drained).await.is_err() {
                warn!(
                    remaining = self.total.load(Ordering::SeqCst),
                    timeout_ms = self.config.close_timeout.as_millis() as u64,
                    "Close timed out with dispatchers still checked out; they are destroyed when returned"
                );
                return;
            }
        }
    }

    fn stats(&self) -> PoolStats {
        let mut keys: Vec<KeyStats> = self
            .entries
            .iter()
            .map(|item| {
                let state = item.value().state.lock();
                KeyStats {
                    endpoint: item.key().to_string(),
                    active: state.active,
                    idle: state.idle.len(),
                    max_active: self.config.max_active_per_key,
                }
            })
            .collect();
        keys.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));

        PoolStats {
            total_active: keys.iter().map(|k| k.active).sum(),
            total_idle: keys.iter().map(|k| k.idle).sum(),
            max_total: self.config.max_total,
            closed: self.closed.load(Ordering::SeqCst),
            keys,
            counters: self.counters.snapshot(),
            collected_at: Utc::now(),
        }
    }
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

async fn expired(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Keyed pool of dispatchers. Cheap to clone; clones share the same pool.
pub struct KeyedPool<F: DispatcherFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: DispatcherFactory> Clone for KeyedPool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<F: DispatcherFactory> KeyedPool<F> {
    /// Create a pool. A per-key maximum of zero can never lend anything, so
    /// such a pool fails every borrow with `PoolExhausted` instead of blocking.
    pub fn new(mut config: PoolConfig, factory: Arc<F>) -> Self {
        if config.max_active_per_key == 0 && config.exhausted_action == ExhaustedAction::Block {
            warn!("max_active_per_key is 0, borrows will fail immediately");
            config.exhausted_action = ExhaustedAction::Fail;
        }

        info!(
            max_active_per_key = config.max_active_per_key,
            max_idle_per_key = config.max_idle_per_key,
            max_total = ?config.max_total,
            exhausted_action = ?config.exhausted_action,
            max_wait_ms = ?config.max_wait.map(|w| w.as_millis() as u64),
            "Creating dispatcher pool"
        );

        Self {
            inner: Arc::new(PoolInner {
                config,
                factory,
                entries: DashMap::new(),
                total: AtomicUsize::new(0),
                capacity_freed: Notify::new(),
                drained: Notify::new(),
                closed: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                counters: Counters::default(),
            }),
        }
    }

    /// Borrow a dispatcher for `key`, creating one if the key has capacity.
    ///
    /// When the key is at capacity this waits for a return (bounded by
    /// `max_wait`) or fails right away, depending on `exhausted_action`.
    pub async fn borrow(&self, key: &F::Key) -> Result<PooledDispatcher<F>> {
        self.inner.borrow(key, None).await
    }

    /// Like [`KeyedPool::borrow`], but a blocked wait ends with
    /// `PoolError::Cancelled` once `cancel` fires
    pub async fn borrow_with_cancel(
        &self,
        key: &F::Key,
        cancel: &CancellationToken,
    ) -> Result<PooledDispatcher<F>> {
        self.inner.borrow(key, Some(cancel)).await
    }

    /// Return a dispatcher: validated, passivated and re-idled, or destroyed
    pub async fn release(&self, dispatcher: PooledDispatcher<F>) {
        dispatcher.release().await;
    }

    /// Destroy a dispatcher the caller knows to be bad
    pub async fn invalidate(&self, dispatcher: PooledDispatcher<F>) {
        dispatcher.invalidate().await;
    }

    /// Destroy all idle dispatchers of one key; returns how many were destroyed
    pub async fn clear(&self, key: &F::Key) -> usize {
        let Some(entry) = self.inner.entries.get(key).map(|e| e.value().clone()) else {
            return 0;
        };
        self.inner.clear_entry(key, &entry, "cleared").await
    }

    /// Destroy all idle dispatchers of every key
    pub async fn clear_all(&self) -> usize {
        self.inner.clear_all("cleared").await
    }

    /// Destroy idle dispatchers idle for longer than `min_evictable_idle_time`
    pub async fn evict_idle(&self) -> usize {
        self.inner.evict_idle().await
    }

    /// Shut the pool down.
    ///
    /// New borrows fail with `PoolClosed`, blocked borrowers are woken with the
    /// same error, idle dispatchers are destroyed, and checked-out dispatchers
    /// are awaited for up to `close_timeout`.
    pub async fn close(&self) {
        self.inner.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn num_active(&self, key: &F::Key) -> usize {
        self.inner
            .entries
            .get(key)
            .map(|e| e.value().state.lock().active)
            .unwrap_or(0)
    }

    pub fn num_idle(&self, key: &F::Key) -> usize {
        self.inner
            .entries
            .get(key)
            .map(|e| e.value().state.lock().idle.len())
            .unwrap_or(0)
    }

    /// Idle + active dispatchers across all keys
    pub fn total(&self) -> usize {
        self.inner.total.load(Ordering::SeqCst)
    }

    /// Endpoint keys currently tracked (holding dispatchers or referenced by a borrower)
    pub fn num_keys(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.stats()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn factory(&self) -> &Arc<F> {
        &self.inner.factory
    }

    /// Cancelled when the pool closes
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }
}
