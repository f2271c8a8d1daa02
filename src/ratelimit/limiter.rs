//! Bucket registry and the rate limit query.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, trace};

use super::bucket::{Bucket, BucketOptions};
use super::id::BucketId;
use super::info::BucketInfo;
use super::registry::Registry;
use crate::error::{Result, SluiceError};
use crate::store::{Store, Transaction};

/// Options for a [`Limiter`].
#[derive(Debug, Clone, Default)]
pub struct LimiterOptions {
    /// Maximum number of cached buckets; `None` means unbounded. Evicted
    /// buckets are retired and stopped.
    pub capacity: Option<NonZeroUsize>,
    /// Options handed to every bucket this limiter builds.
    pub bucket: BucketOptions,
}

/// A rate limit query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// Bucket identity
    pub id: BucketId,
    /// Size override; zero keeps the current size
    pub size: u32,
    /// Interval override; zero keeps the current interval
    pub interval: Duration,
    /// Units to consume; zero only reports the current wait
    pub amount: u32,
}

/// The answer to a [`FetchRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    /// Bucket identity
    pub id: BucketId,
    /// How long the caller must wait before proceeding; zero admits now
    pub wait: Duration,
}

/// The registry of rate limit buckets.
///
/// Holds at most one live [`Bucket`] per identity. Bucket creation is
/// single-flight: concurrent first lookups of the same identity serialize on
/// a per-identity lock, so only one of them loads or creates the bucket.
pub struct Limiter<S: Store> {
    store: Arc<S>,
    options: LimiterOptions,
    buckets: Mutex<Registry<Arc<Bucket<S>>>>,
    creating: DashMap<BucketId, Arc<Mutex<()>>>,
}

impl<S: Store> Limiter<S> {
    /// Create an unbounded limiter over `store`.
    pub fn new(store: Arc<S>) -> Self {
        Self::with_options(store, LimiterOptions::default())
    }

    /// Create a limiter with explicit options.
    pub fn with_options(store: Arc<S>, options: LimiterOptions) -> Self {
        Self {
            store,
            buckets: Mutex::new(Registry::new(options.capacity)),
            options,
            creating: DashMap::new(),
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Get a bucket by id, loading it from the store if it is not cached.
    ///
    /// Returns `Ok(None)` if no configuration is stored for `id`. A bucket
    /// loaded with a nonzero pending count resumes decaying immediately.
    pub fn get(&self, id: &BucketId) -> Result<Option<Arc<Bucket<S>>>> {
        if let Some(bucket) = self.cached(id) {
            return Ok(Some(bucket));
        }
        self.single_flight(id, || self.load(id))
    }

    /// Get a bucket, creating and persisting it if it does not exist.
    ///
    /// For an existing bucket, nonzero fields of `info` that differ from the
    /// current configuration are persisted and applied; the pending counter
    /// is left alone. Identical configurations are not rewritten.
    pub fn get_and_save(&self, info: &BucketInfo) -> Result<Arc<Bucket<S>>> {
        if let Some(bucket) = self.cached(&info.id) {
            self.update_config(&bucket, info)?;
            return Ok(bucket);
        }

        self.single_flight(&info.id, || -> Result<Arc<Bucket<S>>> {
            if let Some(bucket) = self.load(&info.id)? {
                self.update_config(&bucket, info)?;
                return Ok(bucket);
            }

            let bucket = Bucket::new(
                Arc::clone(&self.store),
                info.clone(),
                self.options.bucket.clone(),
            )?;
            self.store
                .update(|txn| info.save(txn))
                .map_err(SluiceError::from)?;

            debug!(
                id = %info.id,
                interval = ?info.interval,
                size = info.size,
                "Created bucket"
            );
            self.insert(Arc::clone(&bucket));
            Ok(bucket)
        })
    }

    /// Answer a rate limit query.
    ///
    /// The wait is computed from the pending count before this request's
    /// consumption. Consumption happens in the same transaction as the read,
    /// and the transaction is read-only when nothing is consumed.
    pub async fn fetch(&self, request: FetchRequest) -> Result<FetchOutcome> {
        let bucket = self.get_and_save(&BucketInfo {
            id: request.id,
            interval: request.interval,
            size: request.size,
        })?;

        let consuming = request.amount != 0;
        let mut txn = self.store.begin(consuming)?;

        let wait = bucket.timeout(&mut txn)?;
        if consuming {
            bucket.incr_pending(&mut txn, i64::from(request.amount))?;
        }
        txn.commit()?;

        trace!(
            id = %bucket.id(),
            amount = request.amount,
            wait = ?wait,
            "Fetched rate limit"
        );

        Ok(FetchOutcome {
            id: bucket.id().clone(),
            wait,
        })
    }

    /// Number of cached buckets.
    pub fn len(&self) -> usize {
        self.buckets.lock().len()
    }

    /// Whether no buckets are cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every cached bucket, signalling their decay tasks to stop.
    pub fn clear(&self) {
        let buckets = self.buckets.lock().drain();
        for bucket in buckets {
            bucket.retire();
            bucket.stop();
        }
    }

    /// Drop every cached bucket and wait for their decay tasks to exit.
    pub async fn shutdown(&self) {
        let buckets = self.buckets.lock().drain();
        info!(buckets = buckets.len(), "Shutting down limiter");
        for bucket in buckets {
            bucket.retire();
            bucket.shutdown().await;
        }
    }

    fn cached(&self, id: &BucketId) -> Option<Arc<Bucket<S>>> {
        self.buckets.lock().get(id)
    }

    fn insert(&self, bucket: Arc<Bucket<S>>) {
        let evicted = self.buckets.lock().insert(bucket.id().clone(), bucket);
        for bucket in evicted {
            debug!(id = %bucket.id(), "Evicted bucket");
            bucket.retire();
            bucket.stop();
        }
    }

    /// Load `id` from the store into the cache. Must run under the
    /// identity's creation lock.
    fn load(&self, id: &BucketId) -> Result<Option<Arc<Bucket<S>>>> {
        if let Some(bucket) = self.cached(id) {
            return Ok(Some(bucket));
        }

        let loaded = self.store.view(|txn| -> Result<Option<(Arc<Bucket<S>>, u32)>> {
            let Some(info) = BucketInfo::fetch(txn, id)? else {
                return Ok(None);
            };
            let bucket = Bucket::new(
                Arc::clone(&self.store),
                info,
                self.options.bucket.clone(),
            )?;
            let pending = bucket.get_pending(txn)?;
            Ok(Some((bucket, pending)))
        })?;

        let Some((bucket, pending)) = loaded else {
            return Ok(None);
        };

        debug!(id = %id, pending, "Loaded bucket from store");
        if pending > 0 {
            bucket.start();
        }
        self.insert(Arc::clone(&bucket));
        Ok(Some(bucket))
    }

    fn update_config(&self, bucket: &Bucket<S>, overrides: &BucketInfo) -> Result<()> {
        let current = bucket.info();
        let merged = current.merged(overrides);
        if merged == current {
            return Ok(());
        }
        merged.validate()?;

        self.store
            .update(|txn| merged.save(txn))
            .map_err(SluiceError::from)?;
        bucket.reconfigure(&merged)?;

        info!(
            id = %merged.id,
            interval = ?merged.interval,
            size = merged.size,
            "Updated bucket configuration"
        );
        Ok(())
    }

    /// Run `f` while holding the creation lock for `id`.
    fn single_flight<R>(&self, id: &BucketId, f: impl FnOnce() -> R) -> R {
        let lock = Arc::clone(self.creating.entry(id.clone()).or_default().value());
        let out = {
            let _guard = lock.lock();
            f()
        };
        drop(lock);
        self.creating
            .remove_if(id, |_, lock| Arc::strong_count(lock) == 1);
        out
    }
}
