//! gRPC server module for the rate limit service.

mod server;
mod service;

pub use server::GrpcServer;
pub use service::RatelimiterService;

pub mod proto;

// Re-export commonly used types
pub use proto::ratelimiter_server::RatelimiterServer;
pub use proto::{FetchRequest, FetchResponse};
