use crate::sync::{AtomicPtr, Ordering};
use std::alloc::Layout;
use std::ptr::{self, NonNull};

/// Source of the raw memory backing pooled segments.
///
/// Implementations must be thread-safe: pools call `allocate` from any
/// mutator thread on a free-list miss, and `deallocate` from whichever thread
/// trims the pool or drops it.
///
/// 池化段的原始内存来源。
/// 实现必须是线程安全的：池在空闲列表未命中时从任意线程调用 `allocate`，
/// 并从修剪或 drop 池的线程调用 `deallocate`。
pub trait BackingAllocator: Send + Sync {
    /// Allocate a block for `layout`. Returning null signals out-of-memory,
    /// which the pool turns into `handle_alloc_error`.
    fn allocate(&self, layout: Layout) -> *mut u8;

    /// Return a block obtained from `allocate` with the same `layout`.
    ///
    /// # Safety
    /// `ptr` must come from `self.allocate(layout)` and must not be used afterwards.
    unsafe fn deallocate(&self, ptr: *mut u8, layout: Layout);
}

/// The global Rust allocator.
/// 全局 Rust 分配器。
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

impl BackingAllocator for SystemAllocator {
    #[inline]
    fn allocate(&self, layout: Layout) -> *mut u8 {
        // SAFETY: segment layouts always have a non-zero size (the header)
        unsafe { std::alloc::alloc(layout) }
    }

    #[inline]
    unsafe fn deallocate(&self, ptr: *mut u8, layout: Layout) {
        unsafe { std::alloc::dealloc(ptr, layout) }
    }
}

/// In-memory header placed at the start of every segment.
/// The payload of `capacity` words follows directly after it.
#[repr(C)]
pub(crate) struct SegmentHeader {
    /// Intrusive link, only meaningful while on a free or pending list.
    pub(crate) next: AtomicPtr<SegmentHeader>,
    /// Payload length in words.
    capacity: usize,
    /// Cursor recorded when the segment was detached from a handle.
    index: usize,
}

impl SegmentHeader {
    #[inline]
    pub(crate) fn next(&self) -> *mut SegmentHeader {
        self.next.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_next(&self, next: *mut SegmentHeader) {
        self.next.store(next, Ordering::Relaxed);
    }
}

/// Byte offset of the payload from the start of the segment.
#[inline]
fn payload_offset() -> usize {
    // usize and SegmentHeader share alignment, so no padding sits between them
    std::mem::size_of::<SegmentHeader>()
}

/// Memory layout of a segment holding `capacity` words, or `None` on overflow.
pub(crate) fn segment_layout(capacity: usize) -> Option<Layout> {
    let header = Layout::new::<SegmentHeader>();
    let payload = Layout::array::<usize>(capacity).ok()?;
    let (layout, offset) = header.extend(payload).ok()?;
    debug_assert_eq!(offset, payload_offset());
    Some(layout.pad_to_align())
}

/// An exclusively owned, fixed-capacity block of pooled memory.
///
/// A `Segment` is handed out by `SegmentPool::allocate` and handed back with
/// `SegmentPool::release`; while you hold it, no other thread can observe it.
/// The payload is `capacity()` pointer-sized words. Handles fill it from the
/// top down, so the valid entries of a completed segment are
/// `entries() == words()[index()..]`.
///
/// Dropping a `Segment` instead of releasing it leaks its backing memory.
///
/// 一个独占的、固定容量的池化内存块。
/// `Segment` 由 `SegmentPool::allocate` 分配并通过 `SegmentPool::release` 归还；
/// 持有期间其他线程无法观察到它。
/// drop 一个 `Segment` 而不归还它会泄漏其后备内存。
#[must_use = "a segment that is not released leaks its backing memory"]
pub struct Segment {
    header: NonNull<SegmentHeader>,
}

// SAFETY: a Segment is the unique owner of its memory
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Initialize a freshly allocated block as an empty segment.
    ///
    /// # Safety
    /// `raw` must point to a writable block of `segment_layout(capacity)`.
    pub(crate) unsafe fn init(raw: NonNull<u8>, capacity: usize) -> Self {
        let header = raw.cast::<SegmentHeader>();
        unsafe {
            header.as_ptr().write(SegmentHeader {
                next: AtomicPtr::new(ptr::null_mut()),
                capacity,
                index: capacity,
            });
            // Payload words start zeroed so `words()` never exposes uninitialized memory
            ptr::write_bytes(raw.as_ptr().add(payload_offset()) as *mut usize, 0, capacity);
        }
        Segment { header }
    }

    /// Reclaim ownership of a segment previously leaked with `into_raw`.
    ///
    /// # Safety
    /// `header` must come from `into_raw` and must not be owned by anything else.
    #[inline]
    pub(crate) unsafe fn from_raw(header: NonNull<SegmentHeader>) -> Self {
        Segment { header }
    }

    /// Give up ownership, e.g. to link the segment into a list.
    #[inline]
    pub(crate) fn into_raw(self) -> NonNull<SegmentHeader> {
        let header = self.header;
        std::mem::forget(self);
        header
    }

    #[inline]
    fn header(&self) -> &SegmentHeader {
        // SAFETY: the header stays valid for as long as we own the segment
        unsafe { self.header.as_ref() }
    }

    /// Whether the intrusive link is clear.
    #[inline]
    pub(crate) fn is_unlinked(&self) -> bool {
        self.header().next().is_null()
    }

    /// Payload length in words.
    /// 载荷长度（以字为单位）。
    #[inline]
    pub fn capacity(&self) -> usize {
        self.header().capacity
    }

    /// The cursor recorded when this segment was detached from a handle.
    /// Equal to `capacity()` for an unused segment.
    ///
    /// 段从句柄分离时记录的游标。未使用的段等于 `capacity()`。
    #[inline]
    pub fn index(&self) -> usize {
        self.header().index
    }

    /// Record a cursor position. Clamped to `capacity()`.
    #[inline]
    pub fn set_index(&mut self, index: usize) {
        let capacity = self.capacity();
        // SAFETY: exclusive ownership, and no list reads `index`
        unsafe { (*self.header.as_ptr()).index = index.min(capacity) };
    }

    /// Number of entries between the recorded cursor and the top.
    #[inline]
    pub fn len(&self) -> usize {
        self.capacity() - self.index()
    }

    /// Whether no entries were recorded.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.index() == self.capacity()
    }

    /// The whole payload.
    /// 整个载荷。
    #[inline]
    pub fn words(&self) -> &[usize] {
        // SAFETY: the payload holds `capacity` initialized words behind the header
        unsafe {
            let base = (self.header.as_ptr() as *const u8).add(payload_offset()) as *const usize;
            std::slice::from_raw_parts(base, self.capacity())
        }
    }

    /// The whole payload, mutably.
    #[inline]
    pub fn words_mut(&mut self) -> &mut [usize] {
        // SAFETY: as in `words`, and `&mut self` guarantees exclusivity
        unsafe {
            let base = (self.header.as_ptr() as *mut u8).add(payload_offset()) as *mut usize;
            std::slice::from_raw_parts_mut(base, self.capacity())
        }
    }

    /// The entries recorded at or above the cursor.
    /// 游标及以上记录的条目。
    #[inline]
    pub fn entries(&self) -> &[usize] {
        &self.words()[self.index()..]
    }

    /// Reset the cursor so the segment reads as unused.
    #[inline]
    pub(crate) fn clear(&mut self) {
        let capacity = self.capacity();
        self.set_index(capacity);
    }

    /// Tear down the header and give the raw block back to `backing`.
    ///
    /// # Safety
    /// `layout` must be the layout the segment was allocated with by `backing`.
    pub(crate) unsafe fn destroy(self, backing: &dyn BackingAllocator, layout: Layout) {
        let header = self.into_raw();
        unsafe {
            ptr::drop_in_place(header.as_ptr());
            backing.deallocate(header.as_ptr() as *mut u8, layout);
        }
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("addr", &self.header)
            .field("capacity", &self.capacity())
            .field("index", &self.index())
            .finish()
    }
}

/// A detached chain of segments linked through their intrusive links.
///
/// The chain owns its segments exclusively. It is produced by draining a free
/// or pending list and consumed by prepending it to a free list, popping
/// segments off one by one, or destroying it.
///
/// 通过侵入式链接串联的分离段链。链独占其段。
pub(crate) struct SegmentChain {
    head: *mut SegmentHeader,
    tail: *mut SegmentHeader,
    len: usize,
}

// SAFETY: the chain is the unique owner of its segments
unsafe impl Send for SegmentChain {}

impl SegmentChain {
    #[inline]
    pub(crate) const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
            len: 0,
        }
    }

    /// Adopt an already linked sequence.
    ///
    /// # Safety
    /// `head..=tail` must be a null-terminated chain of `len` exclusively owned segments.
    #[inline]
    pub(crate) unsafe fn from_raw_parts(
        head: *mut SegmentHeader,
        tail: *mut SegmentHeader,
        len: usize,
    ) -> Self {
        debug_assert_eq!(head.is_null(), len == 0);
        debug_assert_eq!(tail.is_null(), len == 0);
        Self { head, tail, len }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Release ownership of the linked segments to the caller.
    #[inline]
    pub(crate) fn into_raw_parts(self) -> (*mut SegmentHeader, *mut SegmentHeader, usize) {
        let parts = (self.head, self.tail, self.len);
        std::mem::forget(self);
        parts
    }

    pub(crate) fn push_front(&mut self, segment: Segment) {
        let node = segment.into_raw().as_ptr();
        // SAFETY: the node is ours and not on any list
        unsafe { (*node).set_next(self.head) };
        if self.tail.is_null() {
            self.tail = node;
        }
        self.head = node;
        self.len += 1;
    }

    pub(crate) fn pop_front(&mut self) -> Option<Segment> {
        let node = NonNull::new(self.head)?;
        // SAFETY: every node of the chain is exclusively owned by it
        unsafe {
            self.head = node.as_ref().next();
            node.as_ref().set_next(ptr::null_mut());
        }
        if self.head.is_null() {
            self.tail = ptr::null_mut();
        }
        self.len -= 1;
        // SAFETY: unlinked above, ownership moves to the returned segment
        Some(unsafe { Segment::from_raw(node) })
    }
}

impl Drop for SegmentChain {
    fn drop(&mut self) {
        debug_assert!(
            self.len == 0 || std::thread::panicking(),
            "BUG: dropping a chain of {} segments leaks their memory",
            self.len
        );
    }
}
