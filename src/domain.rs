use crate::reader::LocalEpoch;
use crate::state::{DEFAULT_CLEANUP_INTERVAL, INACTIVE_EPOCH, SharedState};
use crate::sync::{Arc, AtomicUsize, Backoff, Mutex, Ordering, fence};
use std::vec::Vec;

/// Builder for configuring a `QuiescenceEpoch`.
///
/// # Example
/// ```
/// use epoch_segpool::QuiescenceEpoch;
///
/// let epoch = QuiescenceEpoch::builder()
///     .cleanup_interval(32)
///     .build();
/// ```
///
/// 用于配置 `QuiescenceEpoch` 的构建器。
pub struct QuiescenceEpochBuilder {
    cleanup_interval: usize,
}

impl QuiescenceEpochBuilder {
    /// Create a new builder with default settings.
    /// 创建一个带有默认设置的新构建器。
    #[inline]
    pub fn new() -> Self {
        Self {
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }

    /// Set the cleanup interval for dead participant slots.
    ///
    /// Slots of dropped `LocalEpoch`s are pruned every N synchronizations.
    /// Set to `0` to disable periodic cleanup (not recommended).
    ///
    /// Default: `16`
    ///
    /// 设置死参与者槽的清理间隔。
    /// 已 drop 的 `LocalEpoch` 的槽每 N 次同步清理一次。
    /// 设置为 `0` 可禁用定期清理（不推荐）。
    #[inline]
    pub fn cleanup_interval(mut self, interval: usize) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Build the `QuiescenceEpoch` with the configured settings.
    /// 使用配置的设置构建 `QuiescenceEpoch`。
    #[inline]
    pub fn build(self) -> QuiescenceEpoch {
        QuiescenceEpoch {
            shared: Arc::new(SharedState {
                global_epoch: AtomicUsize::new(0),
                synchronize_count: AtomicUsize::new(0),
                cleanup_interval: self.cleanup_interval,
                participants: Mutex::new(Vec::new()),
            }),
        }
    }
}

impl Default for QuiescenceEpochBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A process-wide epoch counter with critical sections and a grace-period wait.
///
/// `QuiescenceEpoch` gives threads two things:
/// - **enter / exit**: `LocalEpoch::pin()` marks the calling thread as touching
///   a shared lock-free structure until the returned guard is dropped.
/// - **synchronize**: `synchronize()` advances the epoch and waits until every
///   critical section that started before the call has exited. Critical
///   sections that start afterwards are not waited for and are never blocked.
///
/// This is the ABA-safety primitive of the segment pools: a node removed from a
/// lock-free list is only relinked or freed after a `synchronize()`, so no
/// thread can still be holding a stale pointer to it.
///
/// `QuiescenceEpoch` is `Clone` and can be safely shared across threads.
///
/// **Typical Usage**:
/// ```
/// use epoch_segpool::QuiescenceEpoch;
///
/// let epoch = QuiescenceEpoch::new();
///
/// // Worker thread: register once, pin around each access
/// let local = epoch.register();
/// {
///     let _guard = local.pin();
///     // read shared lock-free state...
/// }
///
/// // Any thread: wait for all earlier critical sections
/// epoch.synchronize();
/// ```
///
/// 带有临界区和宽限期等待的全局纪元计数器。
/// - **进入 / 退出**：`LocalEpoch::pin()` 标记调用线程正在访问共享无锁结构，
///   直到返回的守卫被 drop。
/// - **同步**：`synchronize()` 推进纪元并等待所有在调用之前开始的临界区退出。
///   之后开始的临界区不会被等待，也永远不会被阻塞。
/// 这是段池的 ABA 安全原语。
#[derive(Clone, Debug)]
pub struct QuiescenceEpoch {
    pub(crate) shared: Arc<SharedState>,
}

impl QuiescenceEpoch {
    /// Create a new quiescence domain with default settings.
    /// 创建一个带有默认设置的新静默域。
    #[inline]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Create a builder for configuring the quiescence domain.
    /// 创建一个用于配置静默域的构建器。
    #[inline]
    pub fn builder() -> QuiescenceEpochBuilder {
        QuiescenceEpochBuilder::new()
    }

    /// Register a new participant for the current thread.
    ///
    /// Returns a `LocalEpoch` that should be stored per-thread.
    /// The caller is responsible for ensuring that each `LocalEpoch` is used
    /// by only one thread at a time.
    ///
    /// 为当前线程注册一个新的参与者。
    /// 返回一个应该在每个线程中存储的 `LocalEpoch`。
    #[inline]
    pub fn register(&self) -> LocalEpoch {
        LocalEpoch::new(self.shared.clone())
    }

    /// The current value of the global epoch counter.
    /// 全局纪元计数器的当前值。
    #[inline]
    pub fn current_epoch(&self) -> usize {
        self.shared.global_epoch.load(Ordering::Acquire)
    }

    /// The number of registered participant slots, including dead ones not yet pruned.
    /// 已注册参与者槽的数量，包括尚未清理的死槽。
    #[inline]
    pub fn participant_count(&self) -> usize {
        self.shared.participants.lock().len()
    }

    /// Wait until every critical section that began before this call has exited.
    ///
    /// This method:
    /// 1. Advances the global epoch to `target`.
    /// 2. Takes a snapshot of the registered participants (pruning dead slots
    ///    every `cleanup_interval` calls).
    /// 3. Waits for each participant whose published epoch is older than
    ///    `target`. A participant that is inactive, or that re-entered under
    ///    the new epoch, is not waited for.
    ///
    /// Participants registered after the snapshot cannot hold a critical
    /// section from before the epoch advance, so they are skipped safely.
    ///
    /// **Deadlock**: must not be called while the calling thread holds a
    /// `PinGuard` of this domain.
    ///
    /// 等待所有在此调用之前开始的临界区退出。
    /// 此方法：
    /// 1. 将全局纪元推进到 `target`。
    /// 2. 获取已注册参与者的快照（每 `cleanup_interval` 次调用清理死槽）。
    /// 3. 等待每个发布的纪元早于 `target` 的参与者。
    /// **死锁**：调用线程持有此域的 `PinGuard` 时不得调用。
    pub fn synchronize(&self) {
        let target = self.shared.global_epoch.fetch_add(1, Ordering::SeqCst) + 1;

        let count = self.shared.synchronize_count.fetch_add(1, Ordering::Relaxed) + 1;
        let interval = self.shared.cleanup_interval;
        let should_cleanup = interval > 0 && count % interval == 0;

        let snapshot = {
            let mut participants = self.shared.participants.lock();
            if should_cleanup {
                // Only this Vec holds a reference once the LocalEpoch was dropped
                participants.retain(|slot| Arc::strong_count(slot) > 1);
            }
            participants.clone()
        };

        // Pairs with the fence in pin: a section that missed the caller's
        // earlier stores has its slot visible here
        fence(Ordering::SeqCst);

        for slot in snapshot.iter() {
            let mut backoff = Backoff::new();
            loop {
                let epoch = slot.active_epoch.load(Ordering::SeqCst);
                if epoch == INACTIVE_EPOCH || epoch >= target {
                    break;
                }
                backoff.snooze();
            }
        }
    }
}

impl Default for QuiescenceEpoch {
    fn default() -> Self {
        Self::new()
    }
}
