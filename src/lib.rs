//! Lock-free segment pools with epoch-based ABA safety and deadline-bounded
//! incremental reclamation.
//!
//! Concurrent logging structures (card-dirtying queues, remembered-set
//! logs, ...) hand out fixed-size **segments** to many threads at once. This
//! crate recycles those segments through lock-free pools and gives excess
//! memory back a little at a time:
//!
//! - [`QuiescenceEpoch`]: critical sections (`pin`) and a grace-period wait
//!   (`synchronize`). The only blocking primitive in the crate.
//! - [`SegmentPool`]: a lock-free free list fed by two pending lists. Released
//!   segments reach the free list in batches after a `synchronize()`, which
//!   makes pops ABA-safe without tagged pointers.
//! - [`HandleSet`] / [`BufferHandle`]: a per-thread cursor that fills a segment
//!   and routes it to a [`CompletedSegmentSink`] when full.
//! - [`ReclamationController`]: a resumable state machine that trims every pool
//!   of a [`PoolSet`] toward a target derived from usage statistics, in steps
//!   bounded by a deadline.
//! - [`ReclamationService`]: a background thread driving the controller.
//!
//! 带有基于纪元的 ABA 安全性和截止时间受限的增量回收的无锁段池。
//!
//! # Example
//! ```
//! use epoch_segpool::{MemoryStats, PoolSet, ReclamationController, SegmentPool};
//!
//! let pools = PoolSet::builder()
//!     .pool(SegmentPool::builder("young").segment_capacity(16))
//!     .build();
//! let local = pools.register();
//! let pool = pools.pool(0);
//!
//! // Fill the pool with 20 free segments
//! let segments: Vec<_> = (0..20).map(|_| pool.allocate(&local)).collect();
//! for segment in segments {
//!     pool.release(&local, segment);
//! }
//! pool.try_transfer_pending();
//! assert_eq!(pool.free_count(), 20);
//!
//! // 30 segments in use: keep 10% of them (3) and free the rest
//! let mut young = MemoryStats::new(pools.len());
//! young.record(0, 30 * pool.segment_bytes(), 30);
//! let candidates = MemoryStats::new(pools.len());
//!
//! let mut controller = ReclamationController::new(&pools);
//! controller.notify_new_stats(&young, &candidates);
//! while controller.execute() {}
//! assert_eq!(pool.free_count(), 3);
//! ```

mod controller;
mod domain;
mod handle;
mod list;
mod pool;
mod reader;
mod segment;
#[cfg(not(feature = "loom"))]
mod service;
mod state;
mod stats;
mod sync;
mod trace;

pub use controller::{
    ControllerState, CycleReport, ReclamationController, ReclamationControllerBuilder,
    StatsNotifier,
};
pub use domain::{QuiescenceEpoch, QuiescenceEpochBuilder};
pub use handle::{BufferHandle, CompletedSegmentSink, HandleSet};
pub use pool::{PoolSet, PoolSetBuilder, SegmentPool, SegmentPoolBuilder};
pub use reader::{LocalEpoch, PinGuard};
pub use segment::{BackingAllocator, Segment, SystemAllocator};
#[cfg(not(feature = "loom"))]
pub use service::ReclamationService;
pub use stats::MemoryStats;

#[cfg(all(test, not(feature = "loom")))]
mod tests;
