//! Tollgate - Fixed-Window Request Rate Limiting
//!
//! This crate admits or rejects requests per caller identifier under named
//! policies. Each policy counts requests in fixed windows, keyed by client
//! address, authenticated user, or both. Window state lives in a pluggable
//! store (in-process or Redis), and the limiter fails open when the store
//! cannot answer in time.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
