//! Async coordination primitives shared across the server.

pub mod caching_dedup;
pub mod dedup;
pub mod fingerprint;
pub mod named_queue;
pub mod worker_pool;

pub use caching_dedup::{CachingDedup, CachingDedupConfig};
pub use dedup::Dedup;
pub use fingerprint::{fingerprint, fingerprint_json, fingerprint_parts, sha256_hex};
pub use named_queue::NamedQueue;
pub use worker_pool::WorkerPool;
