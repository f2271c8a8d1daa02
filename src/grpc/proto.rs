//! Wire messages for the `sluice.Ratelimiter` service.

/// Ask how long to wait before acting on bucket `id`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FetchRequest {
    /// Bucket identity
    #[prost(bytes = "vec", tag = "1")]
    pub id: ::prost::alloc::vec::Vec<u8>,
    /// Units drained per interval; 0 keeps the stored value
    #[prost(uint32, tag = "2")]
    pub size: u32,
    /// Drain interval; unset or zero keeps the stored value
    #[prost(message, optional, tag = "3")]
    pub interval: ::core::option::Option<::prost_types::Duration>,
    /// Units to consume; 0 only reports the current wait
    #[prost(uint32, tag = "4")]
    pub incr: u32,
}

/// How long the caller must wait.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FetchResponse {
    /// Bucket identity
    #[prost(bytes = "vec", tag = "1")]
    pub id: ::prost::alloc::vec::Vec<u8>,
    /// Wait before proceeding; zero admits immediately
    #[prost(message, optional, tag = "2")]
    pub wait_for: ::core::option::Option<::prost_types::Duration>,
}

include!(concat!(env!("OUT_DIR"), "/sluice.Ratelimiter.rs"));
