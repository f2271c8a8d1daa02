//! Rate limit service implementation.

use std::sync::Arc;
use std::time::Duration;
use tonic::{Request, Response, Status};
use tracing::{debug, error, instrument, warn};

use super::proto::ratelimiter_server::Ratelimiter;
use super::proto::{FetchRequest, FetchResponse};
use crate::error::SluiceError;
use crate::ratelimit::{self, BucketId, Limiter};
use crate::store::{Store, StoreError};

/// Implementation of the `sluice.Ratelimiter` gRPC interface.
pub struct RatelimiterService<S: Store> {
    /// The limiter answering queries
    limiter: Arc<Limiter<S>>,
}

impl<S: Store> RatelimiterService<S> {
    /// Create a new service backed by `limiter`.
    pub fn new(limiter: Arc<Limiter<S>>) -> Self {
        Self { limiter }
    }
}

#[tonic::async_trait]
impl<S: Store> Ratelimiter for RatelimiterService<S> {
    /// Report how long the caller must wait, consuming `incr` units.
    #[instrument(
        skip(self, request),
        fields(
            id = %String::from_utf8_lossy(&request.get_ref().id),
            size = request.get_ref().size,
            incr = request.get_ref().incr
        )
    )]
    async fn fetch(
        &self,
        request: Request<FetchRequest>,
    ) -> Result<Response<FetchResponse>, Status> {
        let req = request.into_inner();

        if req.id.is_empty() {
            warn!("Received fetch request with empty id");
            return Err(Status::invalid_argument("id is required"));
        }

        let interval = match req.interval {
            Some(interval) => duration_from_proto(interval)?,
            None => Duration::ZERO,
        };

        let outcome = self
            .limiter
            .fetch(ratelimit::FetchRequest {
                id: BucketId::new(req.id),
                size: req.size,
                interval,
                amount: req.incr,
            })
            .await
            .map_err(status_from_error)?;

        debug!(wait = ?outcome.wait, "Rate limit decision made");

        Ok(Response::new(FetchResponse {
            id: outcome.id.into_bytes(),
            wait_for: Some(duration_to_proto(outcome.wait)),
        }))
    }
}

fn duration_from_proto(d: prost_types::Duration) -> Result<Duration, Status> {
    if d.seconds < 0 || d.nanos < 0 {
        return Err(Status::invalid_argument("interval must not be negative"));
    }
    Ok(Duration::from_secs(d.seconds as u64) + Duration::from_nanos(d.nanos as u64))
}

fn duration_to_proto(d: Duration) -> prost_types::Duration {
    prost_types::Duration {
        seconds: i64::try_from(d.as_secs()).unwrap_or(i64::MAX),
        nanos: d.subsec_nanos() as i32,
    }
}

fn status_from_error(err: SluiceError) -> Status {
    match err {
        SluiceError::EmptyBucket
        | SluiceError::ZeroInterval
        | SluiceError::IntervalTooLong { .. } => {
            Status::invalid_argument(err.to_string())
        }
        SluiceError::Store(StoreError::Conflict) => Status::aborted(err.to_string()),
        other => {
            error!(error = %other, "Fetch failed");
            Status::internal(other.to_string())
        }
    }
}
