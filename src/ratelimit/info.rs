//! Bucket configuration and its persistence.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::id::BucketId;
use crate::error::{Result, SluiceError};
use crate::store::{StoreError, Transaction};

/// Longest accepted decay interval, one year.
pub const MAX_INTERVAL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// The rate limit configuration of one bucket.
///
/// `size` units of pending demand drain every `interval`. A `BucketInfo`
/// used as a request may carry zeros, meaning "keep what is already
/// configured"; a bucket can only be built from a [validated](Self::validate)
/// one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketInfo {
    /// Identity of the bucket
    pub id: BucketId,
    /// How often `size` units drain
    pub interval: Duration,
    /// Units drained per interval
    pub size: u32,
}

/// The persisted form; the id is already part of the key.
#[derive(Debug, Serialize, Deserialize)]
struct StoredInfo {
    interval: Duration,
    size: u32,
}

impl BucketInfo {
    /// Create a validated bucket configuration.
    pub fn new(id: impl Into<BucketId>, interval: Duration, size: u32) -> Result<Self> {
        let info = Self {
            id: id.into(),
            interval,
            size,
        };
        info.validate()?;
        Ok(info)
    }

    /// Reject configurations a bucket cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.size == 0 {
            return Err(SluiceError::EmptyBucket);
        }
        if self.interval.is_zero() {
            return Err(SluiceError::ZeroInterval);
        }
        if self.interval > MAX_INTERVAL {
            return Err(SluiceError::IntervalTooLong { max: MAX_INTERVAL });
        }
        Ok(())
    }

    /// Apply `overrides` on top of this configuration. Zero-valued fields
    /// in `overrides` keep the current value.
    pub fn merged(&self, overrides: &BucketInfo) -> BucketInfo {
        BucketInfo {
            id: self.id.clone(),
            interval: if overrides.interval.is_zero() {
                self.interval
            } else {
                overrides.interval
            },
            size: if overrides.size == 0 {
                self.size
            } else {
                overrides.size
            },
        }
    }

    /// Write this configuration under its info key, replacing any prior one.
    pub fn save<T: Transaction>(&self, txn: &mut T) -> std::result::Result<(), StoreError> {
        let stored = StoredInfo {
            interval: self.interval,
            size: self.size,
        };
        txn.set(&self.id.info_key(), serde_json::to_vec(&stored)?)
    }

    /// Read the configuration stored for `id`, or `None` if there is none.
    pub fn fetch<T: Transaction>(
        txn: &mut T,
        id: &BucketId,
    ) -> std::result::Result<Option<Self>, StoreError> {
        let key = id.info_key();
        let Some(raw) = txn.get(&key)? else {
            return Ok(None);
        };

        let stored: StoredInfo =
            serde_json::from_slice(&raw).map_err(|e| StoreError::Corrupt {
                key: String::from_utf8_lossy(&key).into_owned(),
                reason: e.to_string(),
            })?;

        let info = Self {
            id: id.clone(),
            interval: stored.interval,
            size: stored.size,
        };
        if let Err(e) = info.validate() {
            return Err(StoreError::Corrupt {
                key: String::from_utf8_lossy(&key).into_owned(),
                reason: e.to_string(),
            });
        }

        Ok(Some(info))
    }
}
