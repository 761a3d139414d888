use std::vec::Vec;

/// Per-category memory usage: bytes and segment counts, one entry per pool
/// of a `PoolSet`.
///
/// Statistics are typically not taken atomically across categories, so a
/// snapshot can be slightly inconsistent. Consumers must tolerate that.
///
/// 每个类别的内存使用情况：字节数和段数，`PoolSet` 的每个池对应一项。
/// 统计信息通常不是跨类别原子获取的，因此快照可能略有不一致。
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MemoryStats {
    mem_sizes: Vec<usize>,
    segments: Vec<usize>,
}

impl MemoryStats {
    /// All-zero statistics for `categories` categories.
    /// 用于 `categories` 个类别的全零统计。
    pub fn new(categories: usize) -> Self {
        Self {
            mem_sizes: vec![0; categories],
            segments: vec![0; categories],
        }
    }

    /// Number of categories covered.
    #[inline]
    pub fn categories(&self) -> usize {
        self.segments.len()
    }

    /// Set the usage of one category.
    ///
    /// A `ReclamationController` sizes its keep target from `segments` only,
    /// so a caller must report segment counts for them to be retained.
    ///
    /// # Panics
    /// If `category` is out of range.
    pub fn record(&mut self, category: usize, mem_size: usize, segments: usize) {
        self.mem_sizes[category] = mem_size;
        self.segments[category] = segments;
    }

    /// Bytes used by `category`.
    #[inline]
    pub fn mem_size(&self, category: usize) -> usize {
        self.mem_sizes[category]
    }

    /// Segments used by `category`.
    #[inline]
    pub fn segments(&self, category: usize) -> usize {
        self.segments[category]
    }

    /// Sum of bytes over all categories.
    pub fn total_mem_size(&self) -> usize {
        self.mem_sizes.iter().sum()
    }

    /// Sum of segments over all categories.
    pub fn total_segments(&self) -> usize {
        self.segments.iter().sum()
    }

    /// Add `other` category by category.
    ///
    /// # Panics
    /// If the two statistics cover a different number of categories.
    ///
    /// 逐类别累加 `other`。
    pub fn add(&mut self, other: &MemoryStats) {
        assert_eq!(
            self.categories(),
            other.categories(),
            "BUG: adding memory statistics of different category counts"
        );
        for (mine, theirs) in self.mem_sizes.iter_mut().zip(&other.mem_sizes) {
            *mine += *theirs;
        }
        for (mine, theirs) in self.segments.iter_mut().zip(&other.segments) {
            *mine += *theirs;
        }
    }

    /// Reset every category to zero.
    pub fn clear(&mut self) {
        self.mem_sizes.iter_mut().for_each(|size| *size = 0);
        self.segments.iter_mut().for_each(|count| *count = 0);
    }
}
