use crate::pool::SegmentPool;
use crate::reader::LocalEpoch;
use crate::segment::Segment;
use std::sync::Arc;

/// Receiver of segments that a handle filled and detached.
///
/// For example a collector enqueues them for later scanning. An empty
/// segment is never routed here, `HandleSet::flush` returns it straight to
/// the pool.
///
/// 接收句柄填满并分离的段。例如回收器将它们入队以供之后扫描。
/// 空段永远不会被路由到这里。
pub trait CompletedSegmentSink: Send + Sync {
    fn enqueue_completed(&self, segment: Segment);
}

impl<F> CompletedSegmentSink for F
where
    F: Fn(Segment) + Send + Sync,
{
    #[inline]
    fn enqueue_completed(&self, segment: Segment) {
        self(segment)
    }
}

/// A per-thread cursor over a borrowed segment.
///
/// The cursor counts down from the segment capacity to `0` as entries are
/// appended. A handle owns the `LocalEpoch` of the thread using it and must
/// be flushed (`HandleSet::flush`) before it is dropped.
///
/// 借用段上的每线程游标。
/// 追加条目时游标从段容量递减到 `0`。句柄持有使用它的线程的 `LocalEpoch`，
/// 在 drop 之前必须被 flush。
pub struct BufferHandle {
    segment: Option<Segment>,
    index: usize,
    local: LocalEpoch,
}

impl BufferHandle {
    /// The cursor. `0` when full or when no segment is installed.
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Whether a segment is currently installed.
    #[inline]
    pub fn has_segment(&self) -> bool {
        self.segment.is_some()
    }

    /// Number of entries appended to the current segment.
    #[inline]
    pub fn len(&self) -> usize {
        self.segment
            .as_ref()
            .map_or(0, |segment| segment.capacity() - self.index)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The entries appended so far, most recent first.
    pub fn entries(&self) -> &[usize] {
        match self.segment.as_ref() {
            Some(segment) => &segment.words()[self.index..],
            None => &[],
        }
    }

    /// The participant this handle pins with.
    #[inline]
    pub fn local_epoch(&self) -> &LocalEpoch {
        &self.local
    }

    /// Detach the segment, recording the cursor in it.
    fn detach(&mut self) -> Option<Segment> {
        let mut segment = self.segment.take()?;
        segment.set_index(self.index);
        self.index = 0;
        Some(segment)
    }
}

impl Drop for BufferHandle {
    fn drop(&mut self) {
        debug_assert!(
            self.segment.is_none() || std::thread::panicking(),
            "BUG: BufferHandle dropped without being flushed"
        );
    }
}

/// Shared configuration of a family of `BufferHandle`s: the pool their
/// segments come from and the sink completed segments are routed to.
///
/// **Typical Usage**:
/// ```
/// use std::sync::{Arc, Mutex};
/// use epoch_segpool::{HandleSet, QuiescenceEpoch, Segment, SegmentPool};
///
/// let epoch = QuiescenceEpoch::new();
/// let pool = Arc::new(SegmentPool::builder("log").segment_capacity(2).build(&epoch));
/// let completed = Arc::new(Mutex::new(Vec::new()));
/// let sink = {
///     let completed = completed.clone();
///     move |segment: Segment| completed.lock().unwrap().push(segment)
/// };
/// let set = HandleSet::new(pool.clone(), sink);
///
/// let mut handle = set.create_handle();
/// set.install_new_buffer(&mut handle);
/// assert!(set.try_append(&mut handle, 1));
/// assert!(set.try_append(&mut handle, 2));
/// assert!(!set.try_append(&mut handle, 3));
/// set.flush(&mut handle);
///
/// let local = epoch.register();
/// for segment in completed.lock().unwrap().drain(..) {
///     assert_eq!(segment.entries(), &[2, 1]);
///     pool.release(&local, segment);
/// }
/// ```
///
/// 一组 `BufferHandle` 的共享配置：段来源的池以及已完成段被路由到的接收器。
pub struct HandleSet<S> {
    pool: Arc<SegmentPool>,
    sink: S,
}

impl<S: CompletedSegmentSink> HandleSet<S> {
    pub fn new(pool: Arc<SegmentPool>, sink: S) -> Self {
        Self { pool, sink }
    }

    #[inline]
    pub fn pool(&self) -> &Arc<SegmentPool> {
        &self.pool
    }

    #[inline]
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Capacity of the segments handed to handles.
    #[inline]
    pub fn segment_capacity(&self) -> usize {
        self.pool.segment_capacity()
    }

    /// Create a handle without a segment for the calling thread.
    /// 为调用线程创建一个没有段的句柄。
    pub fn create_handle(&self) -> BufferHandle {
        BufferHandle {
            segment: None,
            index: 0,
            local: self.pool.epoch().register(),
        }
    }

    /// Append `value` at the next (decreasing) slot.
    ///
    /// Returns `false` without touching the handle if the segment is full or
    /// absent; the caller then typically calls `exchange_buffer_with_new` and
    /// `retry_append`.
    ///
    /// 在下一个（递减的）槽追加 `value`。
    /// 如果段已满或不存在，则返回 `false` 且不修改句柄。
    #[inline]
    pub fn try_append(&self, handle: &mut BufferHandle, value: usize) -> bool {
        if handle.index == 0 {
            return false;
        }
        let Some(segment) = handle.segment.as_mut() else {
            return false;
        };
        handle.index -= 1;
        segment.words_mut()[handle.index] = value;
        true
    }

    /// Append `value` after a fresh segment was installed.
    ///
    /// # Panics
    /// If the handle has no room.
    pub fn retry_append(&self, handle: &mut BufferHandle, value: usize) {
        assert!(
            handle.index != 0 && handle.segment.is_some(),
            "BUG: retry_append on a handle without room"
        );
        let appended = self.try_append(handle, value);
        debug_assert!(appended);
    }

    /// Install a fresh segment and reset the cursor to full capacity.
    ///
    /// A segment still installed is released back to the pool first, with
    /// its entries discarded.
    pub fn install_new_buffer(&self, handle: &mut BufferHandle) {
        if let Some(mut old) = handle.segment.take() {
            old.set_index(old.capacity());
            self.pool.release(&handle.local, old);
        }
        let segment = self.pool.allocate(&handle.local);
        handle.index = segment.capacity();
        handle.segment = Some(segment);
    }

    /// Detach the current segment as a completed unit and install a fresh one.
    ///
    /// The detached segment (if any) records the cursor in `Segment::index`
    /// and is returned for the caller to route.
    ///
    /// 将当前段作为已完成单元分离并安装一个新段。
    pub fn exchange_buffer_with_new(&self, handle: &mut BufferHandle) -> Option<Segment> {
        let detached = handle.detach();
        self.install_new_buffer(handle);
        detached
    }

    /// Detach the current segment: an unused one goes back to the pool,
    /// a used one to the completed-segment sink. No-op without a segment.
    ///
    /// 分离当前段：未使用的段归还给池，已使用的段交给已完成段接收器。
    pub fn flush(&self, handle: &mut BufferHandle) {
        let Some(segment) = handle.detach() else {
            return;
        };
        if segment.is_empty() {
            self.pool.release(&handle.local, segment);
        } else {
            self.sink.enqueue_completed(segment);
        }
    }

    /// Discard the current entries, keeping the segment.
    pub fn reset(&self, handle: &mut BufferHandle) {
        if let Some(segment) = handle.segment.as_ref() {
            handle.index = segment.capacity();
        }
    }

    /// Hand a processed segment back to the pool.
    pub fn deallocate_segment(&self, handle: &BufferHandle, mut segment: Segment) {
        segment.set_index(segment.capacity());
        self.pool.release(&handle.local, segment);
    }
}
