use crate::pool::{PoolSet, SegmentPool};
use crate::reader::LocalEpoch;
use crate::segment::SegmentChain;
use crate::state::{
    DEFAULT_ACTIVE_RESCHEDULE_DELAY, DEFAULT_DORMANT_RESCHEDULE_DELAY, DEFAULT_KEEP_EXCESS_RATIO,
    DEFAULT_STEP_DURATION,
};
use crate::stats::MemoryStats;
use crate::trace;
use antidote::Mutex;
use std::fmt;
use std::sync::Arc;
use std::thread::Thread;
use std::time::{Duration, Instant};
use std::vec::Vec;

/// The externally visible state of a `ReclamationController`.
///
/// `ReclamationController` 对外可见的状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControllerState {
    /// Dormant, waiting for new statistics.
    Inactive,
    /// Computing per-category targets and unlinking the free lists.
    CalculateUsed,
    /// Handing the retained share back to the pools.
    ReturnToVm,
    /// Destroying the excess.
    ReturnToOs,
    /// Dropping the per-cycle plans.
    Cleanup,
}

impl ControllerState {
    pub fn name(self) -> &'static str {
        match self {
            ControllerState::Inactive => "Inactive",
            ControllerState::CalculateUsed => "CalculateUsed",
            ControllerState::ReturnToVm => "ReturnToVM",
            ControllerState::ReturnToOs => "ReturnToOS",
            ControllerState::Cleanup => "Cleanup",
        }
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What one completed reclamation cycle did, summed over categories.
/// 一个已完成的回收周期的结果，按类别求和。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CycleReport {
    /// Segments handed back to their pools.
    pub returned_to_vm: usize,
    /// Segments whose backing memory was destroyed.
    pub returned_to_os: usize,
}

/// In-progress state of one category within a cycle.
struct ReturnPlan {
    /// Segments to retain on the pool's free list.
    keep: usize,
    /// The pool's free list, unlinked during CalculateUsed.
    stash: SegmentChain,
    returned_to_vm: usize,
    returned_to_os: usize,
}

/// Controller state with the data each state works on.
enum Phase {
    Inactive,
    CalculateUsed { next: usize, plans: Vec<ReturnPlan> },
    ReturnToVm { next: usize, plans: Vec<ReturnPlan> },
    ReturnToOs { next: usize, plans: Vec<ReturnPlan> },
    Cleanup { plans: Vec<ReturnPlan> },
}

impl Phase {
    fn state(&self) -> ControllerState {
        match self {
            Phase::Inactive => ControllerState::Inactive,
            Phase::CalculateUsed { .. } => ControllerState::CalculateUsed,
            Phase::ReturnToVm { .. } => ControllerState::ReturnToVm,
            Phase::ReturnToOs { .. } => ControllerState::ReturnToOs,
            Phase::Cleanup { .. } => ControllerState::Cleanup,
        }
    }

    fn start() -> Self {
        Phase::CalculateUsed {
            next: 0,
            plans: Vec::new(),
        }
    }

    fn into_plans(self) -> Vec<ReturnPlan> {
        match self {
            Phase::Inactive => Vec::new(),
            Phase::CalculateUsed { plans, .. }
            | Phase::ReturnToVm { plans, .. }
            | Phase::ReturnToOs { plans, .. }
            | Phase::Cleanup { plans } => plans,
        }
    }
}

/// Statistics pushed from other threads, picked up by the next `execute`.
pub(crate) struct StatsInbox {
    pending: Mutex<Option<MemoryStats>>,
    waker: Mutex<Option<Thread>>,
}

/// A cloneable, thread-safe way to call `notify_new_stats` on a controller
/// owned by another thread.
///
/// The newest statistics replace any not yet picked up. If the controller
/// runs inside a `ReclamationService`, the service thread is woken at once.
///
/// 一种可克隆的、线程安全的方式，用于在另一个线程持有的控制器上调用 `notify_new_stats`。
/// 最新的统计信息会替换尚未被处理的统计信息。
#[derive(Clone)]
pub struct StatsNotifier {
    inbox: Arc<StatsInbox>,
    categories: usize,
}

impl StatsNotifier {
    /// Push fresh usage for the young generation and the collection set
    /// candidates. May be called at any time.
    pub fn notify_new_stats(&self, young: &MemoryStats, candidates: &MemoryStats) {
        let total = combine(young, candidates, self.categories);
        *self.inbox.pending.lock() = Some(total);
        if let Some(thread) = self.inbox.waker.lock().as_ref() {
            thread.unpark();
        }
    }
}

fn combine(young: &MemoryStats, candidates: &MemoryStats, categories: usize) -> MemoryStats {
    assert_eq!(
        young.categories(),
        categories,
        "BUG: statistics cover {} categories, controller has {}",
        young.categories(),
        categories
    );
    let mut total = young.clone();
    total.add(candidates);
    total
}

/// How many of `free` segments to retain given `used` live ones.
fn keep_size(free: usize, used: usize, ratio: f64) -> usize {
    let to_keep = (used as f64 * ratio) as usize;
    free.min(to_keep)
}

#[inline]
fn deadline_exceeded(deadline: Instant) -> bool {
    Instant::now() >= deadline
}

/// Run `work` for categories `*next..len`, stopping when the deadline passed.
///
/// The deadline is only honoured once this `execute` call made progress, so
/// every call completes at least one unit. Returns whether all categories
/// were processed.
fn for_each_category(
    next: &mut usize,
    len: usize,
    deadline: Instant,
    progressed: &mut bool,
    mut work: impl FnMut(usize),
) -> bool {
    while *next < len {
        if *progressed && deadline_exceeded(deadline) {
            return false;
        }
        work(*next);
        *next += 1;
        *progressed = true;
    }
    true
}

/// Builder for a `ReclamationController`.
///
/// # Example
/// ```
/// use std::time::Duration;
/// use epoch_segpool::{PoolSet, ReclamationController, SegmentPool};
///
/// let pools = PoolSet::builder()
///     .pool(SegmentPool::builder("young"))
///     .build();
/// let controller = ReclamationController::builder()
///     .keep_excess_ratio(0.25)
///     .step_duration(Duration::from_micros(500))
///     .build(&pools);
/// assert!(!controller.is_active());
/// ```
///
/// 用于 `ReclamationController` 的构建器。
pub struct ReclamationControllerBuilder {
    keep_excess_ratio: f64,
    step_duration: Duration,
    active_reschedule_delay: Duration,
    dormant_reschedule_delay: Duration,
}

impl ReclamationControllerBuilder {
    #[inline]
    pub fn new() -> Self {
        Self {
            keep_excess_ratio: DEFAULT_KEEP_EXCESS_RATIO,
            step_duration: DEFAULT_STEP_DURATION,
            active_reschedule_delay: DEFAULT_ACTIVE_RESCHEDULE_DELAY,
            dormant_reschedule_delay: DEFAULT_DORMANT_RESCHEDULE_DELAY,
        }
    }

    /// Share of a category's used segment count kept on its free list.
    ///
    /// Default: `0.1`
    ///
    /// 类别已用段数量中保留在其空闲列表上的比例。
    #[inline]
    pub fn keep_excess_ratio(mut self, ratio: f64) -> Self {
        self.keep_excess_ratio = ratio;
        self
    }

    /// Time budget of one `execute()` call.
    ///
    /// Default: `1ms`
    #[inline]
    pub fn step_duration(mut self, duration: Duration) -> Self {
        self.step_duration = duration;
        self
    }

    /// Delay before the next step while a cycle is in progress.
    ///
    /// Default: `10ms`
    #[inline]
    pub fn active_reschedule_delay(mut self, delay: Duration) -> Self {
        self.active_reschedule_delay = delay;
        self
    }

    /// Delay between polls while dormant.
    ///
    /// Default: `1s`
    #[inline]
    pub fn dormant_reschedule_delay(mut self, delay: Duration) -> Self {
        self.dormant_reschedule_delay = delay;
        self
    }

    /// Build a controller over every category of `pools`.
    ///
    /// # Panics
    /// If the keep ratio is not within `[0, 1]`.
    pub fn build(self, pools: &PoolSet) -> ReclamationController {
        assert!(
            (0.0..=1.0).contains(&self.keep_excess_ratio),
            "keep_excess_ratio must be within [0, 1], got {}",
            self.keep_excess_ratio
        );

        ReclamationController {
            pools: pools.iter().cloned().collect(),
            local: pools.register(),
            keep_excess_ratio: self.keep_excess_ratio,
            step_duration: self.step_duration,
            active_reschedule_delay: self.active_reschedule_delay,
            dormant_reschedule_delay: self.dormant_reschedule_delay,
            phase: Phase::Inactive,
            total_used: MemoryStats::new(pools.len()),
            restart_pending: false,
            inbox: Arc::new(StatsInbox {
                pending: Mutex::new(None),
                waker: Mutex::new(None),
            }),
            cycles_completed: 0,
            last_cycle: None,
        }
    }
}

impl Default for ReclamationControllerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A periodic, resumable task that shrinks the pools of a `PoolSet` back
/// toward a target size.
///
/// Each cycle walks the categories through four states:
/// 1. **CalculateUsed**: settle pending segments, unlink the whole free list
///    and compute how many segments to keep (`used * keep_excess_ratio`,
///    capped by what is free).
/// 2. **ReturnToVM**: release the kept segments back to the pool.
/// 3. **ReturnToOS**: destroy the rest, then trim whatever mutators released
///    in the meantime down to the kept amount with `reduce_free_list`.
/// 4. **Cleanup**: drop the plans and go dormant (or start over if newer
///    statistics arrived during the cycle).
///
/// Work is bounded by a deadline checked between categories; a truncated
/// state resumes at the next unprocessed category on the next call. Every
/// call processes at least one category.
///
/// **Thread Safety**: the controller is `Send` but must be driven by one
/// thread at a time. Other threads push statistics through a `StatsNotifier`.
///
/// 一个周期性的、可恢复的任务，将 `PoolSet` 的池收缩回目标大小。
/// 每个周期让各类别经历四个状态：
/// 1. **CalculateUsed**：结算待处理段，摘下整个空闲列表并计算要保留的段数。
/// 2. **ReturnToVM**：将保留的段释放回池。
/// 3. **ReturnToOS**：销毁其余的段，然后用 `reduce_free_list` 将期间释放的段修剪到保留量。
/// 4. **Cleanup**：丢弃计划并进入休眠（如果周期中到达了更新的统计信息则重新开始）。
/// 工作受类别之间检查的截止时间限制；被截断的状态在下次调用时从下一个未处理的类别恢复。
pub struct ReclamationController {
    pools: Vec<Arc<SegmentPool>>,
    local: LocalEpoch,
    keep_excess_ratio: f64,
    step_duration: Duration,
    active_reschedule_delay: Duration,
    dormant_reschedule_delay: Duration,
    phase: Phase,
    total_used: MemoryStats,
    restart_pending: bool,
    inbox: Arc<StatsInbox>,
    cycles_completed: usize,
    last_cycle: Option<CycleReport>,
}

impl ReclamationController {
    /// Create a controller with default settings.
    #[inline]
    pub fn new(pools: &PoolSet) -> Self {
        Self::builder().build(pools)
    }

    #[inline]
    pub fn builder() -> ReclamationControllerBuilder {
        ReclamationControllerBuilder::new()
    }

    #[inline]
    pub fn state(&self) -> ControllerState {
        self.phase.state()
    }

    /// Whether a cycle is in progress.
    #[inline]
    pub fn is_active(&self) -> bool {
        !matches!(self.phase, Phase::Inactive)
    }

    /// The combined usage statistics of the latest notification.
    #[inline]
    pub fn total_used(&self) -> &MemoryStats {
        &self.total_used
    }

    #[inline]
    pub fn cycles_completed(&self) -> usize {
        self.cycles_completed
    }

    /// Summary of the most recently completed cycle.
    #[inline]
    pub fn last_cycle(&self) -> Option<CycleReport> {
        self.last_cycle
    }

    #[inline]
    pub fn step_duration(&self) -> Duration {
        self.step_duration
    }

    /// A handle for pushing statistics from other threads.
    pub fn notifier(&self) -> StatsNotifier {
        StatsNotifier {
            inbox: self.inbox.clone(),
            categories: self.pools.len(),
        }
    }

    #[cfg(not(feature = "loom"))]
    pub(crate) fn set_waker(&self, thread: Option<Thread>) {
        *self.inbox.waker.lock() = thread;
    }

    /// Delay the scheduler should wait before calling `execute` again:
    /// short while a cycle is in progress, long while dormant.
    ///
    /// 调度器再次调用 `execute` 之前应等待的延迟：周期进行中时较短，休眠时较长。
    #[inline]
    pub fn reschedule_delay(&self) -> Duration {
        if self.is_active() {
            self.active_reschedule_delay
        } else {
            self.dormant_reschedule_delay
        }
    }

    /// Receive new usage statistics for the young generation and the
    /// collection set candidates.
    ///
    /// From `Inactive` this starts a cycle. During a cycle the new numbers
    /// replace the old ones: categories not yet calculated use them, and if
    /// the calculation is already past, a new cycle starts after Cleanup.
    ///
    /// Only the segment counts drive the keep target. The byte sizes are
    /// carried along for `total_used` but never read by the plan.
    ///
    /// # Panics
    /// If the statistics do not cover exactly the controller's categories.
    ///
    /// 接收年轻代和回收集候选的新使用统计。
    /// 从 `Inactive` 开始一个周期。周期中新数据替换旧数据：尚未计算的类别使用它们，
    /// 如果计算已经完成，则在 Cleanup 之后开始新的周期。
    /// 只有段数决定保留目标，字节数不参与计算。
    pub fn notify_new_stats(&mut self, young: &MemoryStats, candidates: &MemoryStats) {
        let total = combine(young, candidates, self.pools.len());
        self.accept_stats(total);
    }

    fn accept_stats(&mut self, total: MemoryStats) {
        self.total_used = total;
        match self.phase {
            Phase::Inactive => self.set_phase(Phase::start()),
            Phase::CalculateUsed { .. } => {}
            _ => self.restart_pending = true,
        }
    }

    fn absorb_notifications(&mut self) {
        let pending = self.inbox.pending.lock().take();
        if let Some(total) = pending {
            self.accept_stats(total);
        }
    }

    fn set_phase(&mut self, phase: Phase) {
        trace::state_change(self.phase.state().name(), phase.state().name());
        self.phase = phase;
    }

    /// Perform one quantum of work bounded by `step_duration`.
    /// Returns whether more work remains. A no-op while `Inactive`.
    ///
    /// 执行一个受 `step_duration` 限制的工作量。返回是否还有剩余工作。
    #[inline]
    pub fn execute(&mut self) -> bool {
        let deadline = Instant::now() + self.step_duration;
        self.execute_until(deadline)
    }

    /// Perform work until `deadline`. Returns whether more work remains.
    ///
    /// Completed states advance to the next one within the same call while
    /// time allows. At least one category (or the Cleanup step) is processed
    /// even if `deadline` already passed.
    ///
    /// 执行工作直到 `deadline`。返回是否还有剩余工作。
    pub fn execute_until(&mut self, deadline: Instant) -> bool {
        self.absorb_notifications();
        if !self.is_active() {
            return false;
        }

        let start = Instant::now();
        let mut progressed = false;

        loop {
            let phase = std::mem::replace(&mut self.phase, Phase::Inactive);
            let (phase, completed) = self.advance(phase, deadline, &mut progressed);
            if !completed {
                self.phase = phase;
                break;
            }
            let from = phase.state();
            self.phase = self.next_phase(phase);
            trace::state_change(from.name(), self.state().name());
            if !self.is_active() {
                break;
            }
        }

        let more_work = self.is_active();
        trace::step_finished(start.elapsed(), self.state().name(), more_work);
        more_work
    }

    /// Do the bounded work of the current state. Returns the (possibly
    /// updated) phase, and whether the state finished.
    fn advance(
        &mut self,
        phase: Phase,
        deadline: Instant,
        progressed: &mut bool,
    ) -> (Phase, bool) {
        match phase {
            Phase::Inactive => (Phase::Inactive, false),
            Phase::CalculateUsed {
                mut next,
                mut plans,
            } => {
                let categories = self.pools.len();
                let done = for_each_category(&mut next, categories, deadline, progressed, |index| {
                    plans.push(self.calculate_plan(index))
                });
                (Phase::CalculateUsed { next, plans }, done)
            }
            Phase::ReturnToVm {
                mut next,
                mut plans,
            } => {
                let categories = plans.len();
                let done = for_each_category(&mut next, categories, deadline, progressed, |index| {
                    self.return_to_vm(index, &mut plans[index])
                });
                (Phase::ReturnToVm { next, plans }, done)
            }
            Phase::ReturnToOs {
                mut next,
                mut plans,
            } => {
                let categories = plans.len();
                let done = for_each_category(&mut next, categories, deadline, progressed, |index| {
                    self.return_to_os(index, &mut plans[index])
                });
                (Phase::ReturnToOs { next, plans }, done)
            }
            Phase::Cleanup { plans } => {
                if *progressed && deadline_exceeded(deadline) {
                    return (Phase::Cleanup { plans }, false);
                }
                *progressed = true;
                self.cleanup(plans);
                (Phase::Cleanup { plans: Vec::new() }, true)
            }
        }
    }

    /// The state following `finished`.
    fn next_phase(&mut self, finished: Phase) -> Phase {
        match finished {
            Phase::Inactive => Phase::Inactive,
            Phase::CalculateUsed { plans, .. } => Phase::ReturnToVm { next: 0, plans },
            Phase::ReturnToVm { plans, .. } => Phase::ReturnToOs { next: 0, plans },
            Phase::ReturnToOs { plans, .. } => Phase::Cleanup { plans },
            Phase::Cleanup { .. } => {
                if std::mem::take(&mut self.restart_pending) {
                    Phase::start()
                } else {
                    Phase::Inactive
                }
            }
        }
    }

    fn calculate_plan(&self, category: usize) -> ReturnPlan {
        let pool = &self.pools[category];
        pool.try_transfer_pending();
        let stash = pool.take_free_list();
        let free = stash.len();
        let used = self.total_used.segments(category);
        let keep = keep_size(free, used, self.keep_excess_ratio);
        trace::return_plan(pool.name(), free, used, keep);
        ReturnPlan {
            keep,
            stash,
            returned_to_vm: 0,
            returned_to_os: 0,
        }
    }

    fn return_to_vm(&self, category: usize, plan: &mut ReturnPlan) {
        let pool = &self.pools[category];
        while plan.returned_to_vm < plan.keep {
            let Some(segment) = plan.stash.pop_front() else {
                break;
            };
            pool.release(&self.local, segment);
            plan.returned_to_vm += 1;
        }
        // Make the retained segments allocatable right away
        pool.try_transfer_pending();
    }

    fn return_to_os(&self, category: usize, plan: &mut ReturnPlan) {
        let pool = &self.pools[category];
        let excess = std::mem::replace(&mut plan.stash, SegmentChain::new());
        plan.returned_to_os += excess.len();
        pool.destroy_chain(excess);

        // Segments released since ReturnToVM count towards the target
        pool.try_transfer_pending();
        let over_target = pool.free_count().saturating_sub(plan.keep);
        if over_target > 0 {
            plan.returned_to_os += pool.reduce_free_list(&self.local, over_target);
        }
    }

    fn cleanup(&mut self, plans: Vec<ReturnPlan>) {
        let mut report = CycleReport::default();
        for plan in plans {
            debug_assert!(plan.stash.is_empty());
            report.returned_to_vm += plan.returned_to_vm;
            report.returned_to_os += plan.returned_to_os;
        }
        self.last_cycle = Some(report);
        self.cycles_completed += 1;
    }
}

impl Drop for ReclamationController {
    /// Hands segments still unlinked by an interrupted cycle back to their pools.
    fn drop(&mut self) {
        let phase = std::mem::replace(&mut self.phase, Phase::Inactive);
        for (category, mut plan) in phase.into_plans().into_iter().enumerate() {
            while let Some(segment) = plan.stash.pop_front() {
                self.pools[category].release(&self.local, segment);
            }
        }
    }
}
