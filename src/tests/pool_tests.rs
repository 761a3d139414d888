/// 段池测试模块
/// 测试分配、释放、待处理列表转移和空闲列表修剪
use super::CountingAllocator;
use crate::{MemoryStats, PoolSet, QuiescenceEpoch, SegmentPool};
use std::sync::Arc;

fn counting_pool(epoch: &QuiescenceEpoch, capacity: usize) -> (SegmentPool, Arc<CountingAllocator>) {
    let backing = Arc::new(CountingAllocator::default());
    let pool = SegmentPool::builder("test")
        .segment_capacity(capacity)
        .backing(backing.clone())
        .build(epoch);
    (pool, backing)
}

/// 测试1: 空池上的分配会从后备分配器获取新段
#[test]
fn test_allocate_from_empty_pool() {
    let epoch = QuiescenceEpoch::new();
    let (pool, backing) = counting_pool(&epoch, 8);
    let local = epoch.register();

    let segment = pool.allocate(&local);
    assert_eq!(segment.capacity(), 8);
    assert_eq!(segment.index(), 8);
    assert!(segment.is_empty());
    assert!(segment.words().iter().all(|&word| word == 0));
    assert_eq!(backing.allocations(), 1);
    assert_eq!(pool.allocated_count(), 1);

    pool.release(&local, segment);
}

/// 测试2: 第 10 次释放触发转移，前 9 次不触发
#[test]
fn test_tenth_release_triggers_transfer() {
    let epoch = QuiescenceEpoch::new();
    let (pool, _backing) = counting_pool(&epoch, 8);
    let local = epoch.register();

    let mut segments: Vec<_> = (0..10).map(|_| pool.allocate(&local)).collect();
    let last = segments.pop().unwrap();

    for segment in segments {
        pool.release(&local, segment);
    }
    assert_eq!(pool.free_count(), 0);
    assert_eq!(pool.pending_count(), 9);

    pool.release(&local, last);
    assert_eq!(pool.free_count(), 10);
    assert_eq!(pool.pending_count(), 0);
    assert_eq!(pool.pending[0].count(), 0);
    assert_eq!(pool.pending[1].count(), 0);
}

/// 测试3: 释放后的段被复用，不再调用后备分配器
#[test]
fn test_released_segments_are_recycled() {
    let epoch = QuiescenceEpoch::new();
    let (pool, backing) = counting_pool(&epoch, 4);
    let local = epoch.register();

    let segments: Vec<_> = (0..10).map(|_| pool.allocate(&local)).collect();
    for segment in segments {
        pool.release(&local, segment);
    }
    assert_eq!(backing.allocations(), 10);
    assert_eq!(pool.free_count(), 10);

    let reused: Vec<_> = (0..10).map(|_| pool.allocate(&local)).collect();
    assert_eq!(backing.allocations(), 10);
    assert_eq!(pool.free_count(), 0);

    // The free list is empty again, the next one goes to the backing allocator
    let fresh = pool.allocate(&local);
    assert_eq!(backing.allocations(), 11);

    for segment in reused {
        pool.release(&local, segment);
    }
    pool.release(&local, fresh);
}

/// 测试4: 复用的段被重置为未使用状态
#[test]
fn test_recycled_segment_is_cleared() {
    let epoch = QuiescenceEpoch::new();
    let pool = SegmentPool::builder("test")
        .segment_capacity(4)
        .transfer_threshold(1)
        .build(&epoch);
    let local = epoch.register();

    let mut segment = pool.allocate(&local);
    segment.words_mut()[3] = 42;
    segment.set_index(3);
    assert_eq!(segment.entries(), &[42]);
    pool.release(&local, segment);
    assert_eq!(pool.free_count(), 1);

    let segment = pool.allocate(&local);
    assert_eq!(segment.index(), 4);
    assert!(segment.entries().is_empty());
    pool.release(&local, segment);
}

/// 测试5: 禁用阈值时段停留在待处理列表，直到显式转移
#[test]
fn test_disabled_threshold() {
    let epoch = QuiescenceEpoch::new();
    let pool = SegmentPool::builder("test")
        .segment_capacity(2)
        .transfer_threshold(None)
        .build(&epoch);
    let local = epoch.register();

    let segments: Vec<_> = (0..50).map(|_| pool.allocate(&local)).collect();
    for segment in segments {
        pool.release(&local, segment);
    }
    assert_eq!(pool.free_count(), 0);
    assert_eq!(pool.pending_count(), 50);

    assert!(pool.try_transfer_pending());
    assert_eq!(pool.free_count(), 50);
    assert_eq!(pool.pending_count(), 0);
}

/// 测试6: 连续两次转移覆盖两个待处理列表
#[test]
fn test_transfer_alternates_pending_lists() {
    let epoch = QuiescenceEpoch::new();
    let pool = SegmentPool::builder("test")
        .segment_capacity(2)
        .transfer_threshold(None)
        .build(&epoch);
    let local = epoch.register();

    let first = pool.allocate(&local);
    let second = pool.allocate(&local);

    pool.release(&local, first);
    // Flips the active list and moves the one segment
    assert!(pool.try_transfer_pending());
    assert_eq!(pool.free_count(), 1);

    pool.release(&local, second);
    assert_eq!(pool.pending_count(), 1);
    assert!(pool.try_transfer_pending());
    assert_eq!(pool.free_count(), 2);
    assert_eq!(pool.pending_count(), 0);
}

/// 测试7: pin 期间的释放不尝试转移
#[test]
fn test_release_while_pinned_skips_transfer() {
    let epoch = QuiescenceEpoch::new();
    let pool = SegmentPool::builder("test").segment_capacity(2).build(&epoch);
    let local = epoch.register();

    let segments: Vec<_> = (0..12).map(|_| pool.allocate(&local)).collect();
    {
        let _guard = local.pin();
        for segment in segments {
            pool.release(&local, segment);
        }
        assert_eq!(pool.free_count(), 0);
        assert_eq!(pool.pending_count(), 12);
    }

    assert!(pool.try_transfer_pending());
    assert_eq!(pool.free_count(), 12);
}

/// 测试8: reduce_free_list 销毁请求数量的段
#[test]
fn test_reduce_free_list() {
    let epoch = QuiescenceEpoch::new();
    let (pool, backing) = counting_pool(&epoch, 8);
    let local = epoch.register();

    let segments: Vec<_> = (0..20).map(|_| pool.allocate(&local)).collect();
    for segment in segments {
        pool.release(&local, segment);
    }
    assert_eq!(pool.free_count(), 20);

    assert_eq!(pool.reduce_free_list(&local, 5), 5);
    assert_eq!(pool.free_count(), 15);
    assert_eq!(pool.allocated_count(), 15);
    assert_eq!(backing.deallocations(), 5);

    // Asking for more than is free destroys what is there
    assert_eq!(pool.reduce_free_list(&local, 100), 15);
    assert_eq!(pool.free_count(), 0);
    assert_eq!(backing.live(), 0);

    assert_eq!(pool.reduce_free_list(&local, 3), 0);
}

/// 测试9: reduce_free_list 会先转移待处理的段
#[test]
fn test_reduce_free_list_transfers_pending() {
    let epoch = QuiescenceEpoch::new();
    let (pool, backing) = counting_pool(&epoch, 8);
    let local = epoch.register();

    let segments: Vec<_> = (0..3).map(|_| pool.allocate(&local)).collect();
    for segment in segments {
        pool.release(&local, segment);
    }
    assert_eq!(pool.pending_count(), 3);

    assert_eq!(pool.reduce_free_list(&local, 2), 2);
    assert_eq!(pool.pending_count(), 0);
    assert_eq!(pool.free_count(), 1);
    assert_eq!(backing.live(), 1);
}

/// 测试10: 在临界区内调用 reduce_free_list 会 panic
#[test]
#[should_panic(expected = "inside a critical section")]
fn test_reduce_free_list_while_pinned_panics() {
    let epoch = QuiescenceEpoch::new();
    let pool = SegmentPool::builder("test").build(&epoch);
    let local = epoch.register();

    let _guard = local.pin();
    pool.reduce_free_list(&local, 1);
}

/// 测试11: 释放容量不匹配的段会 panic
#[test]
#[should_panic(expected = "of capacity")]
fn test_release_capacity_mismatch_panics() {
    let epoch = QuiescenceEpoch::new();
    let small = SegmentPool::builder("small").segment_capacity(4).build(&epoch);
    let large = SegmentPool::builder("large").segment_capacity(8).build(&epoch);
    let local = epoch.register();

    let segment = small.allocate(&local);
    large.release(&local, segment);
}

/// 测试12: 零容量的池会在构建时 panic
#[test]
#[should_panic(expected = "must be non-zero")]
fn test_zero_capacity_panics() {
    let epoch = QuiescenceEpoch::new();
    let _pool = SegmentPool::builder("empty").segment_capacity(0).build(&epoch);
}

/// 测试13: drop 池会销毁空闲列表和待处理列表上的所有段
#[test]
fn test_drop_destroys_all_segments() {
    let epoch = QuiescenceEpoch::new();
    let (pool, backing) = counting_pool(&epoch, 8);
    let local = epoch.register();

    let segments: Vec<_> = (0..25).map(|_| pool.allocate(&local)).collect();
    for segment in segments {
        pool.release(&local, segment);
    }
    // 20 transferred, 5 still pending
    assert_eq!(pool.free_count(), 20);
    assert_eq!(pool.pending_count(), 5);

    drop(pool);
    assert_eq!(backing.allocations(), 25);
    assert_eq!(backing.live(), 0);
}

/// 测试14: mem_size 按段字节数计算空闲列表
#[test]
fn test_mem_size() {
    let epoch = QuiescenceEpoch::new();
    let pool = SegmentPool::builder("test")
        .segment_capacity(16)
        .transfer_threshold(1)
        .build(&epoch);
    let local = epoch.register();

    assert!(pool.segment_bytes() >= 16 * std::mem::size_of::<usize>());
    assert_eq!(pool.mem_size(), 0);

    let a = pool.allocate(&local);
    let b = pool.allocate(&local);
    pool.release(&local, a);
    pool.release(&local, b);
    assert_eq!(pool.mem_size(), 2 * pool.segment_bytes());
}

/// 测试15: PoolSet 按插入顺序编号类别并共享一个域
#[test]
fn test_pool_set_categories() {
    let pools = PoolSet::builder()
        .pool(SegmentPool::builder("young").segment_capacity(4))
        .pool(SegmentPool::builder("candidates").segment_capacity(8))
        .build();

    assert_eq!(pools.len(), 2);
    assert!(!pools.is_empty());
    assert_eq!(pools.category("young"), Some(0));
    assert_eq!(pools.category("candidates"), Some(1));
    assert_eq!(pools.category("old"), None);
    assert_eq!(pools.pool(1).segment_capacity(), 8);
    assert!(pools.get(2).is_none());

    let local = pools.register();
    for pool in pools.iter() {
        assert!(local.belongs_to(pool.epoch()));
    }
}

/// 测试16: free_list_stats 报告每个类别的空闲段
#[test]
fn test_pool_set_free_list_stats() {
    let pools = PoolSet::builder()
        .pool(SegmentPool::builder("a").segment_capacity(4).transfer_threshold(1))
        .pool(SegmentPool::builder("b").segment_capacity(4).transfer_threshold(1))
        .build();
    let local = pools.register();

    let segments: Vec<_> = (0..3).map(|_| pools.pool(1).allocate(&local)).collect();
    for segment in segments {
        pools.pool(1).release(&local, segment);
    }

    let stats = pools.free_list_stats();
    let mut expected = MemoryStats::new(2);
    expected.record(1, 3 * pools.pool(1).segment_bytes(), 3);
    assert_eq!(stats, expected);
    assert_eq!(pools.mem_size(), 3 * pools.pool(1).segment_bytes());
}
