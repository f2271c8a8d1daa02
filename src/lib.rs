//! Sluice - Persistent Leaky Bucket Rate Limiting Service
//!
//! This crate implements a single-node rate limiting service. Every bucket
//! keeps a pending counter in a transactional store; a background task drains
//! it at a fixed rate, and callers are told how long to wait based on the
//! backlog in front of them. State survives process restarts.

pub mod config;
pub mod error;
pub mod grpc;
pub mod ratelimit;
pub mod store;
