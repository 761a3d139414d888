use crate::domain::QuiescenceEpoch;
use crate::state::{INACTIVE_EPOCH, ParticipantSlot, SharedState};
use crate::sync::{Arc, AtomicUsize, Cell, Ordering, fence};

/// A participant thread's local epoch state.
///
/// Each thread that touches a segment pool should own one `LocalEpoch`,
/// obtained via `QuiescenceEpoch::register()`. It is `Send` but `!Sync`
/// (due to `Cell`): it can move to another thread, but only one thread may
/// use it at a time.
///
/// 参与者线程的本地纪元状态。
/// 每个访问段池的线程应该持有一个通过 `QuiescenceEpoch::register()` 获得的 `LocalEpoch`。
/// 它是 `Send` 但 `!Sync` 的（因为 `Cell`）：可以移动到其他线程，但同一时间只能由一个线程使用。
pub struct LocalEpoch {
    slot: Arc<ParticipantSlot>,
    shared: Arc<SharedState>,
    pin_count: Cell<usize>,
}

impl LocalEpoch {
    pub(crate) fn new(shared: Arc<SharedState>) -> Self {
        let slot = Arc::new(ParticipantSlot {
            active_epoch: AtomicUsize::new(INACTIVE_EPOCH),
        });

        // Register immediately so a concurrent synchronize sees every later pin
        shared.participants.lock().push(Arc::clone(&slot));

        LocalEpoch {
            slot,
            shared,
            pin_count: Cell::new(0),
        }
    }

    /// Enter a critical section.
    ///
    /// Returns a `PinGuard`; the critical section lasts until the guard (and
    /// every clone of it) is dropped. A `synchronize()` started after this
    /// call waits for the section to end.
    ///
    /// **Reentrancy**: nested calls only bump a counter, the slot is published
    /// on the outermost pin and cleared on the outermost drop.
    ///
    /// 进入临界区。
    /// 返回一个 `PinGuard`；临界区持续到守卫（及其所有克隆）被 drop。
    /// 此调用之后开始的 `synchronize()` 会等待该临界区结束。
    /// **可重入性**：嵌套调用只增加计数器，槽位在最外层 pin 时发布，在最外层 drop 时清除。
    #[inline]
    pub fn pin(&self) -> PinGuard<'_> {
        let pin_count = self.pin_count.get();

        if pin_count == 0 {
            let current_epoch = self.shared.global_epoch.load(Ordering::SeqCst);
            self.slot
                .active_epoch
                .store(current_epoch, Ordering::SeqCst);
            // Pairs with the fence in synchronize: loads inside the section
            // cannot be ordered before the slot store
            fence(Ordering::SeqCst);
        }

        self.pin_count.set(pin_count + 1);

        PinGuard { local: self }
    }

    /// Whether this participant is currently inside a critical section.
    /// 此参与者当前是否在临界区内。
    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.pin_count.get() > 0
    }

    /// Whether this participant was registered with `epoch`.
    /// 此参与者是否注册于 `epoch`。
    #[inline]
    pub fn belongs_to(&self, epoch: &QuiescenceEpoch) -> bool {
        Arc::ptr_eq(&self.shared, &epoch.shared)
    }
}

/// A guard that keeps the current thread inside a critical section.
///
/// `PinGuard` is obtained by calling `LocalEpoch::pin()`. It is `!Send` and
/// `!Sync` because it references a `!Sync` `LocalEpoch`, and its lifetime is
/// bound to that `LocalEpoch`.
///
/// 保持当前线程处于临界区的守卫。
/// `PinGuard` 通过调用 `LocalEpoch::pin()` 获得。
/// 它是 `!Send` 和 `!Sync` 的，生命周期被绑定到它来自的 `LocalEpoch`。
#[must_use]
pub struct PinGuard<'a> {
    local: &'a LocalEpoch,
}

impl<'a> Clone for PinGuard<'a> {
    /// Clone this guard to create a nested pin.
    /// 克隆此守卫以创建嵌套 pin。
    #[inline]
    fn clone(&self) -> Self {
        let pin_count = self.local.pin_count.get();

        assert!(
            pin_count > 0,
            "BUG: Cloning a PinGuard in an unpinned state (pin_count = 0). \
             This indicates incorrect API usage or a library bug."
        );

        self.local.pin_count.set(pin_count + 1);

        PinGuard { local: self.local }
    }
}

impl<'a> Drop for PinGuard<'a> {
    #[inline]
    fn drop(&mut self) {
        let pin_count = self.local.pin_count.get();

        assert!(
            pin_count > 0,
            "BUG: Dropping a PinGuard in an unpinned state (pin_count = 0). \
             This indicates incorrect API usage or a library bug."
        );

        if pin_count == 1 {
            self.local
                .slot
                .active_epoch
                .store(INACTIVE_EPOCH, Ordering::Release);
        }

        self.local.pin_count.set(pin_count - 1);
    }
}
