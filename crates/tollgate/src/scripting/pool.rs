//! Interpreter Pool (spec.md §4.1): a bounded set of Lua interpreter slots
//! checked out per request, each tracking its own loaded-scripts set so no
//! scripted function value ever needs to cross a slot boundary (spec.md §9).

use crate::error::GatewayError;
use mlua::Lua;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tracing::debug;

/// A single interpreter instance plus the set of script identifiers it has
/// already executed at least once (so their globals are populated).
pub struct InterpreterSlot {
    pub lua: Lua,
    pub loaded: HashSet<String>,
}

impl InterpreterSlot {
    fn new() -> Self {
        Self {
            lua: Lua::new(),
            loaded: HashSet::new(),
        }
    }
}

#[derive(Default)]
struct PoolMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    wait_nanos_total: AtomicU64,
    active: AtomicU64,
}

/// Bounded pool of `InterpreterSlot`s. `size` slots are pre-warmed; up to
/// `max_burst` additional slots may be created transiently under load, but
/// the pool never exceeds `max_burst` slots outstanding at once.
pub struct InterpreterPool {
    free: Arc<Mutex<Vec<InterpreterSlot>>>,
    permits: Arc<Semaphore>,
    closed: AtomicBool,
    metrics: PoolMetrics,
}

/// RAII handle returned by `get`. Drop returns the slot to the pool (or
/// drops it, if the pool has since been closed) and releases its permit.
pub struct CheckedOutSlot<'a> {
    pool: &'a InterpreterPool,
    slot: Option<InterpreterSlot>,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl<'a> std::ops::Deref for CheckedOutSlot<'a> {
    type Target = InterpreterSlot;
    fn deref(&self) -> &InterpreterSlot {
        self.slot.as_ref().expect("slot present until drop")
    }
}

impl<'a> std::ops::DerefMut for CheckedOutSlot<'a> {
    fn deref_mut(&mut self) -> &mut InterpreterSlot {
        self.slot.as_mut().expect("slot present until drop")
    }
}

impl<'a> Drop for CheckedOutSlot<'a> {
    fn drop(&mut self) {
        self.pool.metrics.active.fetch_sub(1, Ordering::AcqRel);
        if let Some(slot) = self.slot.take() {
            if !self.pool.closed.load(Ordering::Acquire) {
                if let Ok(mut free) = self.pool.free.try_lock() {
                    free.push(slot);
                    return;
                }
                // Another task holds the lock briefly; fall back to a
                // blocking-free insert rather than leaking the slot.
                let free = self.pool.free.clone();
                tokio::spawn(async move {
                    free.lock().await.push(slot);
                });
            }
            // Pool closed: the slot (and its `Lua`) is simply dropped.
        }
    }
}

impl InterpreterPool {
    pub fn new(size: usize, max_burst: usize) -> Self {
        let size = size.max(1);
        let max_permits = size.max(max_burst).max(1);
        let mut free = Vec::with_capacity(size);
        for _ in 0..size {
            free.push(InterpreterSlot::new());
        }
        Self {
            free: Arc::new(Mutex::new(free)),
            permits: Arc::new(Semaphore::new(max_permits)),
            closed: AtomicBool::new(false),
            metrics: PoolMetrics::default(),
        }
    }

    /// Checks a slot out, waiting up to `acquire_timeout` for one to free
    /// up. Creates a fresh slot on demand when the free list is empty but a
    /// permit is still available (burst growth up to `max_burst`).
    pub async fn get(&self, acquire_timeout: Duration) -> Result<CheckedOutSlot<'_>, GatewayError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(GatewayError::PoolClosed);
        }

        let started = Instant::now();
        let permit = tokio::time::timeout(acquire_timeout, Arc::clone(&self.permits).acquire_owned())
            .await
            .map_err(|_| GatewayError::PoolExhausted)?
            .map_err(|_| GatewayError::PoolClosed)?;

        if self.closed.load(Ordering::Acquire) {
            return Err(GatewayError::PoolClosed);
        }

        let wait = started.elapsed();
        self.metrics
            .wait_nanos_total
            .fetch_add(wait.as_nanos() as u64, Ordering::Relaxed);
        crate::metrics::SCRIPT_POOL_WAIT_SECONDS.observe(wait.as_secs_f64());

        let slot = {
            let mut free = self.free.lock().await;
            match free.pop() {
                Some(slot) => {
                    self.metrics.hits.fetch_add(1, Ordering::Relaxed);
                    crate::metrics::SCRIPT_POOL_HITS.inc();
                    slot
                }
                None => {
                    self.metrics.misses.fetch_add(1, Ordering::Relaxed);
                    crate::metrics::SCRIPT_POOL_MISSES.inc();
                    InterpreterSlot::new()
                }
            }
        };

        self.metrics.active.fetch_add(1, Ordering::AcqRel);
        Ok(CheckedOutSlot {
            pool: self,
            slot: Some(slot),
            _permit: permit,
        })
    }

    /// Marks the pool closed: already-checked-out slots are dropped rather
    /// than returned on release, and further `get` calls fail immediately
    /// (spec.md §4.1 edge policy).
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        debug!("interpreter pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn hits(&self) -> u64 {
        self.metrics.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.metrics.misses.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> u64 {
        self.metrics.active.load(Ordering::Relaxed)
    }

    pub fn avg_wait(&self) -> Duration {
        let hits_and_misses = self.hits() + self.misses();
        if hits_and_misses == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.metrics.wait_nanos_total.load(Ordering::Relaxed) / hits_and_misses)
    }
}
