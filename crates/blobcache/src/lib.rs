#![doc = include_str!("../README.md")]

//! # Lock Ordering
//!
//! ```text
//! 1. service lock   (Shared<K>: free-slot pool + key -> region map)
//! 2. gap wait state (SparseFileTracker: per-gap outcome + waiter list)
//! ```
//!
//! Acquire top-to-bottom. Never hold a gap's wait-state lock while
//! acquiring the service lock — `CacheFileRegion::dec_ref` only reaches
//! back into the service lock after it has already released the packed
//! ref-count atomic, not while holding any tracker-internal lock.

mod cache_file_region;
mod clock;
mod config;
pub mod error;
mod executor;
mod metrics;
mod region_key;
mod registry;
mod service;
mod shared_bytes;
mod sparse_file_tracker;

pub use cache_file_region::{CacheFileRegion, Listener, Reader, Writer, FREQ_MAX};
pub use clock::{Clock, SystemClock, TestClock};
pub use config::{CacheConfig, NodeRoleSet, ResolvedCacheConfig, SizeSetting};
pub use error::{Error, Result};
pub use executor::{DirectExecutor, Executor, Executors, ManualExecutor, RayonExecutor, Task};
pub use metrics::{CacheMetrics, CountingMetrics, NoopMetrics};
pub use region_key::RegionKey;
pub use service::SharedBlobCacheService;
pub use shared_bytes::RegionChannel;
pub use sparse_file_tracker::{Gap, SparseFileTracker};
