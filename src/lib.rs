//! Queue-backed edge cache invalidation.
//!
//! Content changes are recorded as references on a persistent queue, expanded
//! into the URLs and cache tags that serve them, and sent to a CDN purge API in
//! batches the provider accepts.

pub mod application;
pub mod config;
pub mod domain;
pub mod infra;
pub mod purge;
pub mod queue;
