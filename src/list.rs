use crate::segment::{SegmentChain, SegmentHeader};
use crate::sync::{AtomicPtr, AtomicUsize, Ordering};
use std::ptr::{self, NonNull};

/// Lock-free LIFO stack of free segments (Treiber stack).
///
/// `pop` is only ABA-safe when called inside a critical section of the
/// pool's `QuiescenceEpoch`, and segments are only pushed back after a
/// `synchronize()`. Head operations are `SeqCst` so that ordering holds
/// against the slot loads in `synchronize`.
///
/// 空闲段的无锁 LIFO 栈（Treiber 栈）。
/// 只有在池的 `QuiescenceEpoch` 临界区内调用 `pop` 时才是 ABA 安全的，
/// 且段只会在 `synchronize()` 之后被推回。
pub(crate) struct FreeList {
    head: AtomicPtr<SegmentHeader>,
}

impl FreeList {
    pub(crate) fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Pop the top segment, clearing its link.
    ///
    /// # Safety
    /// The caller must be inside a critical section of the owning domain, and
    /// nodes of this list must only be freed or relinked after a `synchronize()`.
    pub(crate) unsafe fn pop(&self) -> Option<NonNull<SegmentHeader>> {
        let mut top = self.head.load(Ordering::SeqCst);
        loop {
            let node = NonNull::new(top)?;
            // SAFETY: the critical section keeps `node` alive even if another
            // thread pops it concurrently
            let next = unsafe { node.as_ref().next() };
            match self
                .head
                .compare_exchange_weak(top, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => {
                    // SAFETY: we won the CAS, the node is now exclusively ours
                    unsafe { node.as_ref().set_next(ptr::null_mut()) };
                    return Some(node);
                }
                Err(current) => top = current,
            }
        }
    }

    /// Prepend a whole chain with a single CAS loop on the head.
    pub(crate) fn prepend(&self, chain: SegmentChain) {
        if chain.is_empty() {
            return;
        }
        let (first, last, _) = chain.into_raw_parts();
        let mut top = self.head.load(Ordering::SeqCst);
        loop {
            // SAFETY: `last` is still exclusively ours until the CAS publishes it
            unsafe { (*last).set_next(top) };
            match self
                .head
                .compare_exchange_weak(top, first, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return,
                Err(current) => top = current,
            }
        }
    }

    /// Detach every segment at once.
    ///
    /// Concurrent poppers may still read links of the detached nodes, so the
    /// chain must not be freed before a `synchronize()`.
    pub(crate) fn take_all(&self) -> SegmentChain {
        let first = self.head.swap(ptr::null_mut(), Ordering::SeqCst);
        let mut last = ptr::null_mut();
        let mut len = 0;
        let mut node = first;
        while !node.is_null() {
            last = node;
            len += 1;
            // SAFETY: detached nodes are ours; poppers never write their links
            node = unsafe { (*node).next() };
        }
        // SAFETY: walked above
        unsafe { SegmentChain::from_raw_parts(first, last, len) }
    }
}

/// Append-only staging list for released segments.
///
/// Any number of threads may `add` concurrently; `take_all` requires that
/// no `add` is in progress, which the pool guarantees by flipping the active
/// list and calling `synchronize()` first.
///
/// 已释放段的只追加暂存列表。
/// 任意数量的线程可以并发 `add`；`take_all` 要求没有正在进行的 `add`。
pub(crate) struct PendingList {
    head: AtomicPtr<SegmentHeader>,
    tail: AtomicPtr<SegmentHeader>,
    count: AtomicUsize,
}

impl PendingList {
    pub(crate) fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            tail: AtomicPtr::new(ptr::null_mut()),
            count: AtomicUsize::new(0),
        }
    }

    /// Push `node` and return the list length including it.
    ///
    /// The link of the new head is set after it became visible, which is fine
    /// because nothing walks a pending list until all adds have drained.
    ///
    /// # Safety
    /// `node` must be exclusively owned by the caller with a null link.
    pub(crate) unsafe fn add(&self, node: NonNull<SegmentHeader>) -> usize {
        let node = node.as_ptr();
        let old_head = self.head.swap(node, Ordering::SeqCst);
        if old_head.is_null() {
            // First node of this round is the tail the transfer splices with
            self.tail.store(node, Ordering::Relaxed);
        } else {
            unsafe { (*node).set_next(old_head) };
        }
        self.count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Detach the whole list and reset it to empty.
    pub(crate) fn take_all(&self) -> SegmentChain {
        let head = self.head.swap(ptr::null_mut(), Ordering::SeqCst);
        let tail = self.tail.swap(ptr::null_mut(), Ordering::Relaxed);
        let count = self.count.swap(0, Ordering::AcqRel);
        // SAFETY: no add is in flight, so head..=tail holds exactly `count` nodes
        unsafe { SegmentChain::from_raw_parts(head, tail, count) }
    }

    #[inline]
    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }
}
