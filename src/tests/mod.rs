mod controller_tests;
mod pool_tests;

use crate::segment::{BackingAllocator, SystemAllocator};
use std::alloc::Layout;
use std::sync::atomic::{AtomicUsize, Ordering};

/// 测试用的后备分配器：统计分配和释放次数
#[derive(Debug, Default)]
pub(crate) struct CountingAllocator {
    allocations: AtomicUsize,
    deallocations: AtomicUsize,
}

impl CountingAllocator {
    pub(crate) fn allocations(&self) -> usize {
        self.allocations.load(Ordering::SeqCst)
    }

    pub(crate) fn deallocations(&self) -> usize {
        self.deallocations.load(Ordering::SeqCst)
    }

    /// 仍然存活的块数量
    pub(crate) fn live(&self) -> usize {
        self.allocations() - self.deallocations()
    }
}

impl BackingAllocator for CountingAllocator {
    fn allocate(&self, layout: Layout) -> *mut u8 {
        self.allocations.fetch_add(1, Ordering::SeqCst);
        SystemAllocator.allocate(layout)
    }

    unsafe fn deallocate(&self, ptr: *mut u8, layout: Layout) {
        self.deallocations.fetch_add(1, Ordering::SeqCst);
        unsafe { SystemAllocator.deallocate(ptr, layout) }
    }
}
