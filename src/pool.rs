use crate::domain::QuiescenceEpoch;
use crate::list::{FreeList, PendingList};
use crate::reader::LocalEpoch;
use crate::segment::{BackingAllocator, Segment, SegmentChain, SystemAllocator, segment_layout};
use crate::state::DEFAULT_TRANSFER_THRESHOLD;
use crate::stats::MemoryStats;
use crate::sync::{AtomicBool, AtomicUsize, Ordering};
use crate::trace;
use std::alloc::{Layout, handle_alloc_error};
use std::ptr::NonNull;
use std::string::String;
use std::sync::Arc;
use std::vec::Vec;

/// Default segment payload length in words.
const DEFAULT_SEGMENT_CAPACITY: usize = 256;

/// Builder for configuring a `SegmentPool`.
///
/// # Example
/// ```
/// use epoch_segpool::{QuiescenceEpoch, SegmentPool};
///
/// let epoch = QuiescenceEpoch::new();
/// let pool = SegmentPool::builder("dirty-cards")
///     .segment_capacity(64)
///     .transfer_threshold(16)
///     .build(&epoch);
/// assert_eq!(pool.segment_capacity(), 64);
/// ```
///
/// 用于配置 `SegmentPool` 的构建器。
pub struct SegmentPoolBuilder {
    name: String,
    segment_capacity: usize,
    transfer_threshold: Option<usize>,
    backing: Arc<dyn BackingAllocator>,
}

impl SegmentPoolBuilder {
    /// Create a new builder for a pool called `name` with default settings.
    /// 为名为 `name` 的池创建一个带有默认设置的新构建器。
    #[inline]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            segment_capacity: DEFAULT_SEGMENT_CAPACITY,
            transfer_threshold: Some(DEFAULT_TRANSFER_THRESHOLD),
            backing: Arc::new(SystemAllocator),
        }
    }

    /// Set the number of words each segment holds.
    ///
    /// Default: `256`
    #[inline]
    pub fn segment_capacity(mut self, capacity: usize) -> Self {
        self.segment_capacity = capacity;
        self
    }

    /// Set the pending-list length at which `release` attempts a transfer.
    ///
    /// Pass `None` to disable automatic transfers; the pending segments then
    /// only reach the free list through `try_transfer_pending()` or
    /// `reduce_free_list()`.
    ///
    /// Default: `Some(10)`
    ///
    /// 设置 `release` 尝试转移时的待处理列表长度。
    /// 传递 `None` 可禁用自动转移。
    #[inline]
    pub fn transfer_threshold(mut self, threshold: impl Into<Option<usize>>) -> Self {
        self.transfer_threshold = threshold.into();
        self
    }

    /// Set the source of backing memory.
    ///
    /// Default: `SystemAllocator`
    #[inline]
    pub fn backing(mut self, backing: Arc<dyn BackingAllocator>) -> Self {
        self.backing = backing;
        self
    }

    /// Build the pool within the quiescence domain `epoch`.
    ///
    /// # Panics
    /// If the segment capacity is zero or its layout overflows.
    ///
    /// 在静默域 `epoch` 中构建池。
    pub fn build(self, epoch: &QuiescenceEpoch) -> SegmentPool {
        assert!(
            self.segment_capacity > 0,
            "segment capacity of pool {} must be non-zero",
            self.name
        );
        let layout = segment_layout(self.segment_capacity).unwrap_or_else(|| {
            panic!(
                "segment capacity {} of pool {} overflows the address space",
                self.segment_capacity, self.name
            )
        });

        SegmentPool {
            name: self.name,
            segment_capacity: self.segment_capacity,
            layout,
            transfer_threshold: self.transfer_threshold,
            backing: self.backing,
            epoch: epoch.clone(),
            free_list: FreeList::new(),
            free_count: AtomicUsize::new(0),
            pending: [PendingList::new(), PendingList::new()],
            active_pending: AtomicUsize::new(0),
            transfer_lock: AtomicBool::new(false),
            allocated: AtomicUsize::new(0),
        }
    }
}

/// A lock-free pool of fixed-size segments for one memory category.
///
/// Released segments first land on one of two **pending lists** (a double
/// buffer selected by a parity index). Once enough have accumulated, one
/// thread wins the transfer lock, flips the active list, waits for in-flight
/// critical sections with `synchronize()`, and splices the now-inactive list
/// onto the **free list** in one step. This keeps `release` non-blocking
/// while still making free-list pops ABA-safe.
///
/// **Thread Safety**: `SegmentPool` is `Send + Sync`. Each thread passes its
/// own `LocalEpoch`, registered with the same domain as the pool.
///
/// 单一内存类别的固定大小段的无锁池。
/// 释放的段首先进入两个**待处理列表**之一（由奇偶索引选择的双缓冲）。
/// 当积累足够多时，一个线程赢得转移锁，切换活跃列表，通过 `synchronize()`
/// 等待进行中的临界区，然后一次性将不活跃列表拼接到**空闲列表**上。
/// 这使得 `release` 保持非阻塞，同时空闲列表的弹出仍然是 ABA 安全的。
pub struct SegmentPool {
    name: String,
    segment_capacity: usize,
    layout: Layout,
    transfer_threshold: Option<usize>,
    backing: Arc<dyn BackingAllocator>,
    epoch: QuiescenceEpoch,
    free_list: FreeList,
    /// Approximate size of `free_list`; incremented before nodes become
    /// visible there and decremented after they were removed.
    free_count: AtomicUsize,
    pub(crate) pending: [PendingList; 2],
    active_pending: AtomicUsize,
    transfer_lock: AtomicBool,
    /// Segments backing-allocated and not yet destroyed.
    allocated: AtomicUsize,
}

impl SegmentPool {
    /// Create a builder for a pool called `name`.
    /// 创建一个名为 `name` 的池的构建器。
    #[inline]
    pub fn builder(name: impl Into<String>) -> SegmentPoolBuilder {
        SegmentPoolBuilder::new(name)
    }

    /// Category name, for diagnostics.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of words in each segment.
    #[inline]
    pub fn segment_capacity(&self) -> usize {
        self.segment_capacity
    }

    /// Size of one segment's backing block in bytes, header included.
    #[inline]
    pub fn segment_bytes(&self) -> usize {
        self.layout.size()
    }

    /// The quiescence domain this pool synchronizes on.
    #[inline]
    pub fn epoch(&self) -> &QuiescenceEpoch {
        &self.epoch
    }

    /// The pending-list length that triggers a transfer, if any.
    #[inline]
    pub fn transfer_threshold(&self) -> Option<usize> {
        self.transfer_threshold
    }

    /// Take a segment, recycling a free one when possible.
    ///
    /// The pop happens inside a critical section so that a concurrent
    /// transfer cannot relink a node while this thread still holds a stale
    /// pointer to it. On a miss a new segment is backing-allocated.
    ///
    /// Never blocks except inside the backing allocator.
    ///
    /// # Panics
    /// Aborts through `handle_alloc_error` if backing memory is exhausted.
    ///
    /// 获取一个段，尽可能复用空闲段。
    /// 弹出在临界区内进行，未命中时分配新段。
    /// 除了在后备分配器内部之外从不阻塞。
    pub fn allocate(&self, local: &LocalEpoch) -> Segment {
        debug_assert!(
            local.belongs_to(&self.epoch),
            "BUG: LocalEpoch registered with a different domain than pool {}",
            self.name
        );

        let node = {
            let _guard = local.pin();
            // SAFETY: pinned, and nodes are only relinked or freed after synchronize()
            unsafe { self.free_list.pop() }
        };

        match node {
            Some(node) => {
                // Decrement only after the pop is confirmed, so the count never underflows
                let previous = self.free_count.fetch_sub(1, Ordering::AcqRel);
                debug_assert!(previous != 0, "free_count underflow in pool {}", self.name);
                // SAFETY: the pop handed us exclusive ownership
                let mut segment = unsafe { Segment::from_raw(node) };
                segment.clear();
                segment
            }
            None => self.allocate_backing(),
        }
    }

    fn allocate_backing(&self) -> Segment {
        let raw = self.backing.allocate(self.layout);
        let Some(raw) = NonNull::new(raw) else {
            handle_alloc_error(self.layout)
        };
        self.allocated.fetch_add(1, Ordering::Relaxed);
        // SAFETY: `raw` is a fresh block of `self.layout`
        unsafe { Segment::init(raw, self.segment_capacity) }
    }

    /// Give a segment back to the pool.
    ///
    /// The segment is appended to the active pending list inside a critical
    /// section. When that list reaches the transfer threshold, a transfer is
    /// attempted; losing the race for the transfer lock is fine, the holder
    /// or a later release will pick the segment up.
    ///
    /// The transfer attempt is skipped while `local` is pinned, since
    /// `synchronize()` would wait on the caller itself.
    ///
    /// # Panics
    /// If `segment` was allocated by a pool of a different capacity.
    ///
    /// 将段归还给池。
    /// 段在临界区内被追加到活跃的待处理列表。当该列表达到转移阈值时尝试转移；
    /// 输掉转移锁的竞争没有关系，持有者或之后的释放会处理该段。
    pub fn release(&self, local: &LocalEpoch, segment: Segment) {
        assert_eq!(
            segment.capacity(),
            self.segment_capacity,
            "BUG: segment of capacity {} released to pool {} of capacity {}",
            segment.capacity(),
            self.name,
            self.segment_capacity
        );
        debug_assert!(segment.is_unlinked(), "BUG: released segment is still linked");
        debug_assert!(
            local.belongs_to(&self.epoch),
            "BUG: LocalEpoch registered with a different domain than pool {}",
            self.name
        );

        let node = segment.into_raw();
        let count = {
            let _guard = local.pin();
            let index = self.active_pending.load(Ordering::SeqCst);
            // SAFETY: `node` was owned by the segment we just consumed
            unsafe { self.pending[index].add(node) }
        };

        if let Some(threshold) = self.transfer_threshold {
            if count >= threshold && !local.is_pinned() {
                self.try_transfer_pending();
            }
        }
    }

    /// Try to move the pending segments onto the free list.
    ///
    /// Returns `false` without waiting if another thread holds the transfer
    /// lock, `true` once this thread performed a (possibly empty) transfer.
    ///
    /// **Steps**:
    /// 1. Claim the transfer lock (plain load first to skip a doomed CAS).
    /// 2. Flip the active pending list. The lock holder is its only writer.
    /// 3. `synchronize()`: wait out every critical section that may still be
    ///    popping from the free list or adding to the now-inactive list.
    /// 4. Detach the inactive list, add its length to `free_count`, then
    ///    prepend it to the free list.
    ///
    /// Must not be called while the calling thread is pinned in this domain.
    ///
    /// 尝试将待处理段移动到空闲列表。
    /// 如果另一个线程持有转移锁，则不等待直接返回 `false`；
    /// 此线程执行了（可能为空的）转移后返回 `true`。
    pub fn try_transfer_pending(&self) -> bool {
        if self.transfer_lock.load(Ordering::Relaxed)
            || self
                .transfer_lock
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
        {
            return false;
        }

        let index = self.active_pending.load(Ordering::Relaxed);
        self.active_pending.store(index ^ 1, Ordering::SeqCst);

        self.epoch.synchronize();

        let chain = self.pending[index].take_all();
        let count = chain.len();
        if count > 0 {
            // Count first so a concurrent allocate() never underflows it
            self.free_count.fetch_add(count, Ordering::AcqRel);
            self.free_list.prepend(chain);
            trace::pending_transferred(&self.name, count);
        }

        self.transfer_lock.store(false, Ordering::Release);
        true
    }

    /// Destroy up to `goal` free segments, returning their memory to the
    /// backing allocator. Returns how many were destroyed.
    ///
    /// A transfer is attempted first so recently released segments count.
    /// The popped segments are freed only after a `synchronize()`, because a
    /// concurrent `allocate` may still be reading their links.
    ///
    /// # Panics
    /// If `local` is pinned.
    ///
    /// 销毁最多 `goal` 个空闲段，将其内存归还给后备分配器。返回销毁的数量。
    pub fn reduce_free_list(&self, local: &LocalEpoch, goal: usize) -> usize {
        assert!(
            !local.is_pinned(),
            "BUG: reduce_free_list called inside a critical section"
        );

        self.try_transfer_pending();

        let mut removed = SegmentChain::new();
        {
            let _guard = local.pin();
            while removed.len() < goal {
                // SAFETY: pinned; the popped nodes are freed after synchronize()
                let Some(node) = (unsafe { self.free_list.pop() }) else {
                    break;
                };
                removed.push_front(unsafe { Segment::from_raw(node) });
            }
        }

        let count = removed.len();
        if count > 0 {
            let previous = self.free_count.fetch_sub(count, Ordering::AcqRel);
            debug_assert!(previous >= count, "free_count underflow in pool {}", self.name);
            self.destroy_chain(removed);
        }

        trace::free_list_reduced(&self.name, count, self.free_count());
        count
    }

    /// Detach the whole free list, e.g. to hand part of it back later.
    pub(crate) fn take_free_list(&self) -> SegmentChain {
        let chain = self.free_list.take_all();
        if !chain.is_empty() {
            let previous = self.free_count.fetch_sub(chain.len(), Ordering::AcqRel);
            debug_assert!(previous >= chain.len(), "free_count underflow in pool {}", self.name);
        }
        chain
    }

    /// Free a chain that may have been visible on the free list.
    pub(crate) fn destroy_chain(&self, chain: SegmentChain) {
        if chain.is_empty() {
            return;
        }
        self.epoch.synchronize();
        self.destroy_unshared(chain);
    }

    /// Free a chain no other thread can reach.
    fn destroy_unshared(&self, mut chain: SegmentChain) {
        while let Some(segment) = chain.pop_front() {
            // SAFETY: every segment of this pool was allocated with `self.layout`
            unsafe { segment.destroy(&*self.backing, self.layout) };
            self.allocated.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Approximate number of segments on the free list.
    /// 空闲列表上段数量的近似值。
    #[inline]
    pub fn free_count(&self) -> usize {
        self.free_count.load(Ordering::Relaxed)
    }

    /// Number of segments waiting on either pending list.
    /// 两个待处理列表上等待的段数量。
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending[0].count() + self.pending[1].count()
    }

    /// Number of segments currently backed by memory, wherever they are.
    /// 当前有后备内存的段数量，无论它们在哪里。
    #[inline]
    pub fn allocated_count(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Bytes held by the free list.
    #[inline]
    pub fn mem_size(&self) -> usize {
        self.free_count() * self.segment_bytes()
    }
}

impl std::fmt::Debug for SegmentPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentPool")
            .field("name", &self.name)
            .field("segment_capacity", &self.segment_capacity)
            .field("free_count", &self.free_count())
            .field("pending_count", &self.pending_count())
            .field("allocated_count", &self.allocated_count())
            .finish()
    }
}

impl Drop for SegmentPool {
    /// Destroys the free list and both pending lists.
    ///
    /// `&mut self` means no other thread can still be touching the lists,
    /// so no synchronization is needed.
    fn drop(&mut self) {
        let free = self.free_list.take_all();
        self.destroy_unshared(free);
        for index in 0..self.pending.len() {
            let pending = self.pending[index].take_all();
            self.destroy_unshared(pending);
        }

        debug_assert!(
            self.allocated_count() == 0 || std::thread::panicking(),
            "BUG: pool {} dropped with {} segments still on loan",
            self.name,
            self.allocated_count()
        );
    }
}

/// Builder for a `PoolSet`.
///
/// 用于 `PoolSet` 的构建器。
pub struct PoolSetBuilder {
    epoch: Option<QuiescenceEpoch>,
    pools: Vec<SegmentPoolBuilder>,
}

impl PoolSetBuilder {
    #[inline]
    pub fn new() -> Self {
        Self {
            epoch: None,
            pools: Vec::new(),
        }
    }

    /// Share an existing quiescence domain instead of creating one.
    #[inline]
    pub fn epoch(mut self, epoch: QuiescenceEpoch) -> Self {
        self.epoch = Some(epoch);
        self
    }

    /// Add a category. Categories are numbered in insertion order.
    /// 添加一个类别。类别按插入顺序编号。
    #[inline]
    pub fn pool(mut self, pool: SegmentPoolBuilder) -> Self {
        self.pools.push(pool);
        self
    }

    pub fn build(self) -> PoolSet {
        let epoch = self.epoch.unwrap_or_default();
        let pools = self
            .pools
            .into_iter()
            .map(|builder| Arc::new(builder.build(&epoch)))
            .collect();
        PoolSet { epoch, pools }
    }
}

impl Default for PoolSetBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The set of segment pools, one per memory category, sharing one
/// quiescence domain.
///
/// Built once and shared by reference with the reclamation controller and
/// every site that allocates segments.
///
/// **Typical Usage**:
/// ```
/// use epoch_segpool::{PoolSet, SegmentPool};
///
/// let pools = PoolSet::builder()
///     .pool(SegmentPool::builder("young").segment_capacity(32))
///     .pool(SegmentPool::builder("candidates").segment_capacity(128))
///     .build();
///
/// let local = pools.register();
/// let segment = pools.pool(0).allocate(&local);
/// pools.pool(0).release(&local, segment);
/// ```
///
/// 段池的集合，每个内存类别一个，共享一个静默域。
/// 构建一次，并通过引用与回收控制器及每个分配段的调用点共享。
pub struct PoolSet {
    epoch: QuiescenceEpoch,
    pools: Vec<Arc<SegmentPool>>,
}

impl PoolSet {
    #[inline]
    pub fn builder() -> PoolSetBuilder {
        PoolSetBuilder::new()
    }

    /// The shared quiescence domain.
    #[inline]
    pub fn epoch(&self) -> &QuiescenceEpoch {
        &self.epoch
    }

    /// Register a participant for the calling thread.
    #[inline]
    pub fn register(&self) -> LocalEpoch {
        self.epoch.register()
    }

    /// The pool of `category`.
    ///
    /// # Panics
    /// If `category` is out of range.
    #[inline]
    pub fn pool(&self, category: usize) -> &Arc<SegmentPool> {
        &self.pools[category]
    }

    #[inline]
    pub fn get(&self, category: usize) -> Option<&Arc<SegmentPool>> {
        self.pools.get(category)
    }

    /// The category of the pool called `name`.
    pub fn category(&self, name: &str) -> Option<usize> {
        self.pools.iter().position(|pool| pool.name() == name)
    }

    /// Number of categories.
    #[inline]
    pub fn len(&self) -> usize {
        self.pools.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    #[inline]
    pub fn iter(&self) -> std::slice::Iter<'_, Arc<SegmentPool>> {
        self.pools.iter()
    }

    /// Free-list bytes and segments of every category.
    /// 每个类别的空闲列表字节数和段数。
    pub fn free_list_stats(&self) -> MemoryStats {
        let mut stats = MemoryStats::new(self.pools.len());
        for (category, pool) in self.pools.iter().enumerate() {
            stats.record(category, pool.mem_size(), pool.free_count());
        }
        stats
    }

    /// Total free-list bytes over all categories.
    pub fn mem_size(&self) -> usize {
        self.pools.iter().map(|pool| pool.mem_size()).sum()
    }
}

impl std::fmt::Debug for PoolSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.pools.iter()).finish()
    }
}
