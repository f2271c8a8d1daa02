//! The leaky bucket state machine.
//!
//! A [`Bucket`] owns one persisted pending counter and, while that counter is
//! nonzero, one background decay task that drains `size` units from it every
//! `interval`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, trace, warn};

use super::id::BucketId;
use super::info::BucketInfo;
use crate::error::Result;
use crate::store::{Store, StoreError, Transaction};

/// Callback receiving store errors hit by a bucket's decay task.
pub type ErrorSink = Arc<dyn Fn(&BucketId, &StoreError) + Send + Sync>;

/// An [`ErrorSink`] that logs through `tracing`.
pub fn log_errors() -> ErrorSink {
    Arc::new(|id, err| {
        error!(id = %id, error = %err, "Bucket decay failed");
    })
}

/// Runtime options shared by every bucket of a limiter.
#[derive(Clone)]
pub struct BucketOptions {
    /// Delete the pending counter outright when a bucket is stopped from the
    /// outside (eviction, clear, shutdown).
    pub purge_on_stop: bool,
    /// Where decay task failures are reported.
    pub error_sink: ErrorSink,
}

impl Default for BucketOptions {
    fn default() -> Self {
        Self {
            purge_on_stop: false,
            error_sink: log_errors(),
        }
    }
}

impl std::fmt::Debug for BucketOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketOptions")
            .field("purge_on_stop", &self.purge_on_stop)
            .finish_non_exhaustive()
    }
}

/// Mutable part of the configuration.
#[derive(Debug, Clone, Copy)]
struct Limits {
    interval: Duration,
    size: u32,
}

/// Message delivered on a decay task's stop channel.
#[derive(Debug)]
struct Stop {
    purge: bool,
}

/// Handle to a running decay task.
struct DecayTask {
    stop: oneshot::Sender<Stop>,
    handle: JoinHandle<()>,
}

impl DecayTask {
    /// Signal the task without waiting for it. The task may already have
    /// exited, in which case the signal goes nowhere.
    fn signal(self, purge: bool) -> JoinHandle<()> {
        let _ = self.stop.send(Stop { purge });
        self.handle
    }
}

/// A rate limit bucket.
///
/// Buckets start out stopped. Committing a nonzero pending counter starts
/// the decay task; committing a zero counter stops it. At most one decay
/// task that has not been told to stop exists per bucket.
pub struct Bucket<S: Store> {
    id: BucketId,
    pending_key: Vec<u8>,
    limits: RwLock<Limits>,
    store: Arc<S>,
    options: BucketOptions,
    decay: Mutex<Option<DecayTask>>,
    generation: AtomicU64,
    retired: AtomicBool,
    this: Weak<Bucket<S>>,
}

impl<S: Store> std::fmt::Debug for Bucket<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let limits = *self.limits.read();
        f.debug_struct("Bucket")
            .field("id", &self.id)
            .field("interval", &limits.interval)
            .field("size", &limits.size)
            .field("running", &self.is_running())
            .finish()
    }
}

impl<S: Store> Bucket<S> {
    /// Build a stopped bucket. Fails if `info` has a zero size or interval.
    pub fn new(store: Arc<S>, info: BucketInfo, options: BucketOptions) -> Result<Arc<Self>> {
        info.validate()?;

        Ok(Arc::new_cyclic(|this| Self {
            pending_key: info.id.pending_key(),
            id: info.id,
            limits: RwLock::new(Limits {
                interval: info.interval,
                size: info.size,
            }),
            store,
            options,
            decay: Mutex::new(None),
            generation: AtomicU64::new(0),
            retired: AtomicBool::new(false),
            this: this.clone(),
        }))
    }

    /// The bucket's identity.
    pub fn id(&self) -> &BucketId {
        &self.id
    }

    /// A snapshot of the bucket's current configuration.
    pub fn info(&self) -> BucketInfo {
        let limits = *self.limits.read();
        BucketInfo {
            id: self.id.clone(),
            interval: limits.interval,
            size: limits.size,
        }
    }

    /// Whether a decay task is currently active.
    pub fn is_running(&self) -> bool {
        self.decay.lock().is_some()
    }

    /// How many decay tasks this bucket has launched so far.
    pub fn decay_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// (Re)start the decay task, stopping any existing one first.
    pub fn start(&self) {
        let mut decay = self.decay.lock();
        if let Some(task) = decay.take() {
            task.signal(false);
        }
        *decay = Some(self.spawn_decay());
    }

    /// Start the decay task unless one is already running or the bucket
    /// was retired.
    fn ensure_running(&self) {
        let mut decay = self.decay.lock();
        if decay.is_none() && !self.retired.load(Ordering::SeqCst) {
            *decay = Some(self.spawn_decay());
        }
    }

    /// Signal the decay task to exit. Returns `false` if the bucket was
    /// already stopped. Does not wait for the task.
    pub fn stop(&self) -> bool {
        self.stop_with(self.options.purge_on_stop).is_some()
    }

    /// Stop the decay task and wait for it to exit.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.stop_with(self.options.purge_on_stop) {
            if let Err(e) = handle.await {
                warn!(id = %self.id, error = %e, "Decay task ended abnormally");
            }
        }
    }

    /// Keep later increments from restarting the decay task. Used once the
    /// bucket leaves its registry, so a stale handle cannot drain the
    /// counter alongside a reloaded bucket. Does not stop a running task.
    pub fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    /// Whether [`Bucket::retire`] was called.
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    fn stop_with(&self, purge: bool) -> Option<JoinHandle<()>> {
        let task = self.decay.lock().take()?;
        debug!(id = %self.id, purge, "Stopping bucket");
        Some(task.signal(purge))
    }

    /// Apply a new configuration. The pending counter is untouched; a
    /// running decay task is restarted if the interval changed.
    pub fn reconfigure(&self, info: &BucketInfo) -> Result<()> {
        info.validate()?;

        let interval_changed = {
            let mut limits = self.limits.write();
            let changed = limits.interval != info.interval;
            limits.interval = info.interval;
            limits.size = info.size;
            changed
        };

        if interval_changed && self.is_running() {
            self.start();
        }
        Ok(())
    }

    /// Read the pending counter. A missing counter is zero.
    pub fn get_pending<T: Transaction>(&self, txn: &mut T) -> std::result::Result<u32, StoreError> {
        let Some(raw) = txn.get(&self.pending_key)? else {
            return Ok(0);
        };

        let bytes: [u8; 4] = raw.as_slice().try_into().map_err(|_| StoreError::Corrupt {
            key: String::from_utf8_lossy(&self.pending_key).into_owned(),
            reason: format!("expected 4 bytes, found {}", raw.len()),
        })?;
        Ok(u32::from_le_bytes(bytes))
    }

    /// Add `delta` to the pending counter and return the new count.
    ///
    /// The count saturates at zero. Reaching zero deletes the counter and
    /// stops the bucket; a nonzero count starts the decay task if it is not
    /// already running. Both transitions happen once `txn` commits, and not
    /// at all if it fails.
    ///
    /// # Panics
    ///
    /// Panics if the count would exceed `u32::MAX`.
    pub fn incr_pending<T: Transaction>(
        &self,
        txn: &mut T,
        delta: i64,
    ) -> std::result::Result<u32, StoreError> {
        let current = self.get_pending(txn)?;
        let pending = apply_delta(current, delta);

        if pending == 0 {
            txn.delete(&self.pending_key)?;
        } else {
            txn.set(&self.pending_key, pending.to_le_bytes().to_vec())?;
        }

        let this = self.this.clone();
        txn.on_commit(Box::new(move || {
            let Some(bucket) = this.upgrade() else {
                return;
            };
            if pending == 0 {
                // Nothing left to purge, and a purge could race a restart
                bucket.stop_with(false);
            } else {
                bucket.ensure_running();
            }
        }));

        trace!(id = %self.id, current, delta, pending, "Pending updated");
        Ok(pending)
    }

    /// Wait time implied by a given pending count: one interval for every
    /// full `size` units of backlog.
    pub fn timeout_for(&self, pending: u32) -> Duration {
        let limits = *self.limits.read();
        backlog_wait(limits.interval, limits.size, pending)
    }

    /// Wait time implied by the currently stored pending count.
    pub fn timeout<T: Transaction>(&self, txn: &mut T) -> std::result::Result<Duration, StoreError> {
        let pending = self.get_pending(txn)?;
        Ok(self.timeout_for(pending))
    }

    /// Consume one unit and return the wait time computed from the count as
    /// it was before this unit was added.
    pub fn timeout_and_incr<T: Transaction>(
        &self,
        txn: &mut T,
    ) -> std::result::Result<Duration, StoreError> {
        let pending = self.incr_pending(txn, 1)?;
        Ok(self.timeout_for(pending - 1))
    }

    fn spawn_decay(&self) -> DecayTask {
        let (stop_tx, stop_rx) = oneshot::channel();
        let interval = self.limits.read().interval;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        debug!(id = %self.id, ?interval, generation, "Starting bucket decay");

        let handle = tokio::spawn(run_decay(
            self.this.clone(),
            Purge {
                store: Arc::clone(&self.store),
                id: self.id.clone(),
                sink: Arc::clone(&self.options.error_sink),
            },
            interval,
            stop_rx,
        ));

        DecayTask {
            stop: stop_tx,
            handle,
        }
    }

    /// One decay step: drain `size` units in a fresh transaction.
    fn decay_tick(&self) {
        let size = self.limits.read().size;
        let result = self
            .store
            .update(|txn| self.incr_pending(txn, -i64::from(size)));

        match result {
            Ok(pending) => trace!(id = %self.id, pending, "Bucket decayed"),
            Err(err) => {
                warn!(id = %self.id, error = %err, "Bucket decay transaction failed");
                (self.options.error_sink)(&self.id, &err);
            }
        }
    }
}

/// What a decay task needs to delete the counter after its bucket is gone.
struct Purge<S: Store> {
    store: Arc<S>,
    id: BucketId,
    sink: ErrorSink,
}

impl<S: Store> Purge<S> {
    fn run(&self) {
        let key = self.id.pending_key();
        match self.store.update(|txn| txn.delete(&key)) {
            Ok(()) => debug!(id = %self.id, "Purged pending counter"),
            Err(err) => (self.sink)(&self.id, &err),
        }
    }
}

async fn run_decay<S: Store>(
    bucket: Weak<Bucket<S>>,
    purge: Purge<S>,
    interval: Duration,
    mut stop: oneshot::Receiver<Stop>,
) {
    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let purge_on_exit = loop {
        tokio::select! {
            biased;
            signal = &mut stop => {
                // A dropped sender means the bucket itself was dropped
                break signal.map(|s| s.purge).unwrap_or(false);
            }
            _ = ticker.tick() => {
                let Some(bucket) = bucket.upgrade() else {
                    break false;
                };
                bucket.decay_tick();
            }
        }
    };

    if purge_on_exit {
        purge.run();
    }
    trace!(id = %purge.id, "Decay task exited");
}

fn apply_delta(current: u32, delta: i64) -> u32 {
    // current >= 0, so only a positive delta can overflow the i64 sum
    let next = i64::from(current)
        .checked_add(delta)
        .unwrap_or(i64::MAX);

    if next <= 0 {
        return 0;
    }
    match u32::try_from(next) {
        Ok(pending) => pending,
        Err(_) => panic!("integer overflow: pending count {current} + {delta} exceeds u32::MAX"),
    }
}

fn backlog_wait(interval: Duration, size: u32, pending: u32) -> Duration {
    interval
        .checked_mul(pending / size)
        .unwrap_or(Duration::MAX)
}
