use crate::sync::{Arc, AtomicUsize, Mutex};
use std::time::Duration;
use std::vec::Vec;

/// Default pending-list length at which `release` attempts a transfer.
/// `release` 尝试转移时的默认待处理列表长度。
pub(crate) const DEFAULT_TRANSFER_THRESHOLD: usize = 10;

/// Default interval for cleaning up dead participant slots (in synchronizations).
/// 清理死参与者槽的默认间隔（以同步次数为单位）。
pub(crate) const DEFAULT_CLEANUP_INTERVAL: usize = 16;

/// Default share of the used segment count kept on a free list after trimming.
/// 修剪后在空闲列表上保留的已用段数量的默认比例。
pub(crate) const DEFAULT_KEEP_EXCESS_RATIO: f64 = 0.1;

/// Default time budget of a single controller step.
pub(crate) const DEFAULT_STEP_DURATION: Duration = Duration::from_millis(1);

/// Default delay before the next step while a reclamation cycle is in progress.
pub(crate) const DEFAULT_ACTIVE_RESCHEDULE_DELAY: Duration = Duration::from_millis(10);

/// Default delay between polls while the controller is dormant.
pub(crate) const DEFAULT_DORMANT_RESCHEDULE_DELAY: Duration = Duration::from_millis(1000);

/// Represents a participant that is not currently inside a critical section.
/// 表示当前不在临界区内的参与者。
pub(crate) const INACTIVE_EPOCH: usize = usize::MAX;

/// A slot allocated for a participant thread to record the epoch its
/// critical section started in.
///
/// Cache-aligned to prevent false sharing between participants.
///
/// 为参与者线程分配的槽，用于记录其临界区开始时的纪元。
/// 缓存对齐以防止参与者之间的伪共享。
#[derive(Debug)]
#[repr(align(64))]
pub(crate) struct ParticipantSlot {
    /// The epoch observed on entry, or INACTIVE_EPOCH.
    /// 进入时观察到的纪元，或 INACTIVE_EPOCH。
    pub(crate) active_epoch: AtomicUsize,
}

/// Global shared state of a quiescence domain.
///
/// 静默域的全局共享状态。
#[derive(Debug)]
#[repr(align(64))]
pub(crate) struct SharedState {
    /// The global monotonic epoch counter, advanced by `synchronize`.
    /// 全局单调纪元计数器，由 `synchronize` 推进。
    pub(crate) global_epoch: AtomicUsize,
    /// Number of completed synchronizations, drives dead slot cleanup.
    /// 已完成的同步次数，用于驱动死槽清理。
    pub(crate) synchronize_count: AtomicUsize,
    /// How many synchronizations between dead slot sweeps. `0` disables them.
    pub(crate) cleanup_interval: usize,
    /// List of all registered participant slots. Protected by a Mutex.
    /// 所有注册参与者槽的列表。由 Mutex 保护。
    pub(crate) participants: Mutex<Vec<Arc<ParticipantSlot>>>,
}
