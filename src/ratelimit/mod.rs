//! Leaky bucket rate limiting: buckets, their persistence and the registry.

mod bucket;
mod id;
mod info;
mod limiter;
mod registry;

pub use bucket::{log_errors, Bucket, BucketOptions, ErrorSink};
pub use id::BucketId;
pub use info::BucketInfo;
pub use limiter::{FetchOutcome, FetchRequest, Limiter, LimiterOptions};
