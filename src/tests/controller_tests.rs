/// 回收控制器测试模块
/// 测试状态机推进、截止时间、保留量计算和统计信息通知
use crate::{
    ControllerState, CycleReport, LocalEpoch, MemoryStats, PoolSet, ReclamationController,
    SegmentPool,
};
use std::thread;
use std::time::{Duration, Instant};

fn two_pools() -> PoolSet {
    PoolSet::builder()
        .pool(SegmentPool::builder("young").segment_capacity(4))
        .pool(SegmentPool::builder("candidates").segment_capacity(8))
        .build()
}

/// 向池的空闲列表放入 `count` 个段
fn fill(pools: &PoolSet, local: &LocalEpoch, category: usize, count: usize) {
    let pool = pools.pool(category);
    let segments: Vec<_> = (0..count).map(|_| pool.allocate(local)).collect();
    for segment in segments {
        pool.release(local, segment);
    }
    pool.try_transfer_pending();
}

fn used(pools: &PoolSet, segments: &[usize]) -> MemoryStats {
    let mut stats = MemoryStats::new(pools.len());
    for (category, &count) in segments.iter().enumerate() {
        stats.record(category, count * pools.pool(category).segment_bytes(), count);
    }
    stats
}

fn far_deadline() -> Instant {
    Instant::now() + Duration::from_secs(60)
}

/// 测试1: 新控制器处于 Inactive，execute 不做任何事
#[test]
fn test_new_controller_is_inactive() {
    let pools = two_pools();
    let mut controller = ReclamationController::builder()
        .dormant_reschedule_delay(Duration::from_millis(500))
        .build(&pools);

    assert_eq!(controller.state(), ControllerState::Inactive);
    assert!(!controller.is_active());
    assert!(!controller.execute());
    assert_eq!(controller.reschedule_delay(), Duration::from_millis(500));
    assert_eq!(controller.cycles_completed(), 0);
    assert_eq!(controller.last_cycle(), None);
}

/// 测试2: 通知统计信息启动一个周期
#[test]
fn test_notify_starts_cycle() {
    let pools = two_pools();
    let mut controller = ReclamationController::builder()
        .active_reschedule_delay(Duration::from_millis(7))
        .build(&pools);

    controller.notify_new_stats(&used(&pools, &[3, 4]), &used(&pools, &[1, 2]));
    assert_eq!(controller.state(), ControllerState::CalculateUsed);
    assert!(controller.is_active());
    assert_eq!(controller.reschedule_delay(), Duration::from_millis(7));

    // Young and candidate usage are summed per category
    assert_eq!(controller.total_used(), &used(&pools, &[4, 6]));
}

/// 测试3: 足够远的截止时间在一次调用中完成整个周期
#[test]
fn test_full_cycle_within_deadline() {
    let pools = two_pools();
    let local = pools.register();
    fill(&pools, &local, 0, 20);
    fill(&pools, &local, 1, 10);

    let mut controller = ReclamationController::new(&pools);
    controller.notify_new_stats(&used(&pools, &[30, 0]), &MemoryStats::new(2));

    assert!(!controller.execute_until(far_deadline()));
    assert_eq!(controller.state(), ControllerState::Inactive);

    // 10% of 30 used segments stay, everything else is returned
    assert_eq!(pools.pool(0).free_count(), 3);
    assert_eq!(pools.pool(1).free_count(), 0);
    assert_eq!(pools.pool(0).allocated_count(), 3);
    assert_eq!(pools.pool(1).allocated_count(), 0);

    assert_eq!(controller.cycles_completed(), 1);
    assert_eq!(
        controller.last_cycle(),
        Some(CycleReport {
            returned_to_vm: 3,
            returned_to_os: 27,
        })
    );
}

/// 测试4: 已过期的截止时间每次调用只推进一个类别，且不跳过状态
#[test]
fn test_past_deadline_advances_one_category_per_call() {
    let pools = two_pools();
    let local = pools.register();
    fill(&pools, &local, 0, 20);
    fill(&pools, &local, 1, 10);

    let mut controller = ReclamationController::new(&pools);
    controller.notify_new_stats(&used(&pools, &[30, 20]), &MemoryStats::new(2));

    let mut states = Vec::new();
    let mut more = true;
    while more {
        more = controller.execute_until(Instant::now());
        states.push(controller.state());
        if states.len() == 1 {
            // Only the first category was unlinked so far
            assert_eq!(pools.pool(0).free_count(), 0);
            assert_eq!(pools.pool(1).free_count(), 10);
        }
    }

    assert_eq!(
        states,
        vec![
            ControllerState::CalculateUsed,
            ControllerState::ReturnToVm,
            ControllerState::ReturnToVm,
            ControllerState::ReturnToOs,
            ControllerState::ReturnToOs,
            ControllerState::Cleanup,
            ControllerState::Inactive,
        ]
    );
    assert_eq!(pools.pool(0).free_count(), 3);
    assert_eq!(pools.pool(1).free_count(), 2);
    assert_eq!(controller.cycles_completed(), 1);
}

/// 测试5: 保留量不超过空闲段数量
#[test]
fn test_keep_is_capped_by_free_segments() {
    let pools = two_pools();
    let local = pools.register();
    fill(&pools, &local, 0, 2);

    let mut controller = ReclamationController::new(&pools);
    controller.notify_new_stats(&used(&pools, &[100, 0]), &MemoryStats::new(2));
    while controller.execute_until(far_deadline()) {}

    assert_eq!(pools.pool(0).free_count(), 2);
    assert_eq!(
        controller.last_cycle(),
        Some(CycleReport {
            returned_to_vm: 2,
            returned_to_os: 0,
        })
    );
}

/// 测试6: 比例 0 释放全部空闲段，比例 1 保留与已用数量相同的段
#[test]
fn test_keep_excess_ratio_bounds() {
    let pools = two_pools();
    let local = pools.register();

    fill(&pools, &local, 0, 12);
    let mut controller = ReclamationController::builder()
        .keep_excess_ratio(0.0)
        .build(&pools);
    controller.notify_new_stats(&used(&pools, &[50, 0]), &MemoryStats::new(2));
    while controller.execute_until(far_deadline()) {}
    assert_eq!(pools.pool(0).free_count(), 0);
    drop(controller);

    fill(&pools, &local, 0, 12);
    let mut controller = ReclamationController::builder()
        .keep_excess_ratio(1.0)
        .build(&pools);
    controller.notify_new_stats(&used(&pools, &[5, 0]), &MemoryStats::new(2));
    while controller.execute_until(far_deadline()) {}
    assert_eq!(pools.pool(0).free_count(), 5);
}

/// 测试7: 计算完成后到达的统计信息会在 Cleanup 之后重新开始周期
#[test]
fn test_stats_after_calculation_restart_cycle() {
    let pools = two_pools();
    let local = pools.register();
    fill(&pools, &local, 0, 20);

    let mut controller = ReclamationController::new(&pools);
    controller.notify_new_stats(&used(&pools, &[30, 0]), &MemoryStats::new(2));
    while controller.state() != ControllerState::ReturnToVm {
        controller.execute_until(Instant::now());
    }

    // The running cycle keeps 3, the restarted one keeps none
    controller.notify_new_stats(&MemoryStats::new(2), &MemoryStats::new(2));
    assert_eq!(controller.state(), ControllerState::ReturnToVm);

    assert!(!controller.execute_until(far_deadline()));
    assert_eq!(controller.cycles_completed(), 2);
    assert_eq!(pools.pool(0).free_count(), 0);
    assert_eq!(pools.pool(0).allocated_count(), 0);
}

/// 测试8: CalculateUsed 期间到达的统计信息用于剩余类别，不重新开始
#[test]
fn test_stats_during_calculation_apply_to_remaining_categories() {
    let pools = two_pools();
    let local = pools.register();
    fill(&pools, &local, 0, 20);
    fill(&pools, &local, 1, 10);

    let mut controller = ReclamationController::new(&pools);
    controller.notify_new_stats(&used(&pools, &[30, 0]), &MemoryStats::new(2));
    controller.execute_until(Instant::now());
    assert_eq!(controller.state(), ControllerState::CalculateUsed);

    controller.notify_new_stats(&used(&pools, &[0, 50]), &MemoryStats::new(2));
    assert!(!controller.execute_until(far_deadline()));

    assert_eq!(controller.cycles_completed(), 1);
    // Category 0 was calculated with the first statistics
    assert_eq!(pools.pool(0).free_count(), 3);
    assert_eq!(pools.pool(1).free_count(), 5);
}

/// 测试9: 周期中被释放的段也会被修剪到目标值
#[test]
fn test_segments_released_mid_cycle_are_trimmed() {
    let pools = two_pools();
    let local = pools.register();
    fill(&pools, &local, 0, 20);

    let mut controller = ReclamationController::new(&pools);
    controller.notify_new_stats(&used(&pools, &[30, 0]), &MemoryStats::new(2));
    while controller.state() == ControllerState::CalculateUsed {
        controller.execute_until(Instant::now());
    }
    assert_eq!(pools.pool(0).free_count(), 0);

    // A mutator allocates fresh segments and gives them back while the free list is unlinked
    let pool = pools.pool(0);
    let segments: Vec<_> = (0..5).map(|_| pool.allocate(&local)).collect();
    for segment in segments {
        pool.release(&local, segment);
    }
    assert_eq!(pool.allocated_count(), 25);

    while controller.execute_until(far_deadline()) {}
    assert_eq!(pool.free_count(), 3);
    assert_eq!(pool.allocated_count(), 3);
}

/// 测试10: drop 中断周期的控制器会把摘下的段归还给池
#[test]
fn test_drop_mid_cycle_returns_segments() {
    let pools = two_pools();
    let local = pools.register();
    fill(&pools, &local, 0, 20);

    let mut controller = ReclamationController::new(&pools);
    controller.notify_new_stats(&used(&pools, &[30, 0]), &MemoryStats::new(2));
    controller.execute_until(Instant::now());
    assert_eq!(pools.pool(0).free_count(), 0);

    drop(controller);
    let pool = pools.pool(0);
    pool.try_transfer_pending();
    assert_eq!(pool.free_count(), 20);
    assert_eq!(pool.allocated_count(), 20);
}

/// 测试11: 从其他线程推送的统计信息在下一次 execute 时被处理
#[test]
fn test_notifier_from_another_thread() {
    let pools = two_pools();
    let local = pools.register();
    fill(&pools, &local, 1, 10);

    let mut controller = ReclamationController::new(&pools);
    let notifier = controller.notifier();
    let young = used(&pools, &[0, 20]);

    thread::spawn(move || notifier.notify_new_stats(&young, &MemoryStats::new(2)))
        .join()
        .unwrap();

    // Picked up lazily
    assert!(!controller.is_active());
    assert!(!controller.execute_until(far_deadline()));
    assert_eq!(controller.cycles_completed(), 1);
    assert_eq!(pools.pool(1).free_count(), 2);
}

/// 测试12: 只保留最新推送的统计信息
#[test]
fn test_notifier_keeps_newest_stats() {
    let pools = two_pools();
    let mut controller = ReclamationController::new(&pools);
    let notifier = controller.notifier();

    notifier.notify_new_stats(&used(&pools, &[1, 1]), &MemoryStats::new(2));
    notifier.notify_new_stats(&used(&pools, &[7, 9]), &MemoryStats::new(2));

    controller.execute_until(far_deadline());
    assert_eq!(controller.total_used(), &used(&pools, &[7, 9]));
    assert_eq!(controller.cycles_completed(), 1);
}

/// 测试13: 没有任何类别时周期也能完成
#[test]
fn test_cycle_without_categories() {
    let pools = PoolSet::builder().build();
    let mut controller = ReclamationController::new(&pools);

    controller.notify_new_stats(&MemoryStats::new(0), &MemoryStats::new(0));
    assert!(!controller.execute_until(Instant::now()));
    assert_eq!(controller.cycles_completed(), 1);
}

/// 测试14: 类别数量不匹配的统计信息会 panic
#[test]
#[should_panic(expected = "categories")]
fn test_stats_category_mismatch_panics() {
    let pools = two_pools();
    let mut controller = ReclamationController::new(&pools);
    controller.notify_new_stats(&MemoryStats::new(3), &MemoryStats::new(3));
}

/// 测试15: 超出范围的保留比例会 panic
#[test]
#[should_panic(expected = "keep_excess_ratio")]
fn test_invalid_keep_ratio_panics() {
    let pools = two_pools();
    let _controller = ReclamationController::builder()
        .keep_excess_ratio(1.5)
        .build(&pools);
}

/// 测试16: 状态名称
#[test]
fn test_state_names() {
    assert_eq!(ControllerState::Inactive.to_string(), "Inactive");
    assert_eq!(ControllerState::CalculateUsed.name(), "CalculateUsed");
    assert_eq!(ControllerState::ReturnToVm.name(), "ReturnToVM");
    assert_eq!(ControllerState::ReturnToOs.name(), "ReturnToOS");
    assert_eq!(ControllerState::Cleanup.name(), "Cleanup");
}

/// 测试17: ReturnToVM 之后才释放的段在 ReturnToOS 中同样被修剪
#[test]
fn test_segments_released_after_return_to_vm_are_trimmed() {
    let pools = two_pools();
    let local = pools.register();
    fill(&pools, &local, 0, 20);

    let mut controller = ReclamationController::new(&pools);
    controller.notify_new_stats(&used(&pools, &[30, 0]), &MemoryStats::new(2));
    while controller.state() != ControllerState::ReturnToOs {
        controller.execute_until(Instant::now());
    }
    let pool = pools.pool(0);
    assert_eq!(pool.free_count(), 3);

    // Below the transfer threshold, so the releases stay on a pending list
    let segments: Vec<_> = (0..5).map(|_| pool.allocate(&local)).collect();
    for segment in segments {
        pool.release(&local, segment);
    }
    assert_eq!(pool.free_count(), 0);
    assert_eq!(pool.pending_count(), 5);

    while controller.execute_until(far_deadline()) {}
    assert_eq!(pool.pending_count(), 0);
    assert_eq!(pool.free_count(), 3);
    assert_eq!(pool.allocated_count(), 3);
    assert_eq!(
        controller.last_cycle(),
        Some(CycleReport {
            returned_to_vm: 3,
            returned_to_os: 19,
        })
    );
}

/// 测试18: 保留目标只由段数决定，只报告字节数的类别不保留段
#[test]
fn test_keep_is_driven_by_segment_counts() {
    let pools = two_pools();
    let local = pools.register();
    fill(&pools, &local, 0, 10);

    let mut bytes_only = MemoryStats::new(2);
    bytes_only.record(0, 100 * pools.pool(0).segment_bytes(), 0);

    let mut controller = ReclamationController::new(&pools);
    controller.notify_new_stats(&bytes_only, &MemoryStats::new(2));
    while controller.execute_until(far_deadline()) {}

    assert_eq!(pools.pool(0).free_count(), 0);
    assert_eq!(pools.pool(0).allocated_count(), 0);
    assert_eq!(controller.total_used().mem_size(0), 100 * pools.pool(0).segment_bytes());
}
