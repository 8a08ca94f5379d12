//! Slidegate - Rate-Limiting Reverse Proxy
//!
//! This crate implements request-rate admission control in front of an HTTP
//! upstream. Each request is attributed to a client key, counted against a
//! sliding window approximated from two fixed windows, and either forwarded
//! or rejected with standard rate limit headers.

pub mod config;
pub mod error;
pub mod proxy;
pub mod ratelimit;
