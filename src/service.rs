use crate::controller::{ReclamationController, StatsNotifier};
use crate::trace;
use std::io;
use std::string::String;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

const DEFAULT_THREAD_NAME: &str = "segment-reclaim";

/// Drives a `ReclamationController` from a dedicated background thread.
///
/// The thread calls `execute()`, then parks for the controller's
/// `reschedule_delay()`. Statistics pushed through `notifier()` wake it
/// immediately.
///
/// **Typical Usage**:
/// ```
/// use epoch_segpool::{MemoryStats, PoolSet, ReclamationController, ReclamationService, SegmentPool};
///
/// let pools = PoolSet::builder().pool(SegmentPool::builder("young")).build();
/// let service = ReclamationService::spawn(ReclamationController::new(&pools)).unwrap();
///
/// let stats = MemoryStats::new(pools.len());
/// service.notifier().notify_new_stats(&stats, &stats);
///
/// let controller = service.shutdown();
/// assert_eq!(controller.total_used(), &stats);
/// ```
///
/// 通过专用后台线程驱动 `ReclamationController`。
/// 线程调用 `execute()`，然后按控制器的 `reschedule_delay()` 休眠。
/// 通过 `notifier()` 推送的统计信息会立即唤醒它。
pub struct ReclamationService {
    notifier: StatsNotifier,
    stop: Arc<AtomicBool>,
    thread: JoinHandle<ReclamationController>,
}

impl ReclamationService {
    /// Start the service on a thread named `segment-reclaim`.
    #[inline]
    pub fn spawn(controller: ReclamationController) -> io::Result<Self> {
        Self::spawn_named(controller, DEFAULT_THREAD_NAME)
    }

    /// Start the service on a thread called `name`.
    pub fn spawn_named(
        controller: ReclamationController,
        name: impl Into<String>,
    ) -> io::Result<Self> {
        let notifier = controller.notifier();
        let stop = Arc::new(AtomicBool::new(false));

        let thread = thread::Builder::new().name(name.into()).spawn({
            let stop = stop.clone();
            move || run(controller, &stop)
        })?;

        Ok(Self {
            notifier,
            stop,
            thread,
        })
    }

    /// A handle for pushing statistics to the controller.
    #[inline]
    pub fn notifier(&self) -> StatsNotifier {
        self.notifier.clone()
    }

    /// Stop the thread and hand the controller back.
    ///
    /// A cycle in progress is left where it stopped; dropping the returned
    /// controller gives its unlinked segments back to the pools.
    ///
    /// # Panics
    /// If the service thread panicked.
    ///
    /// 停止线程并交还控制器。
    pub fn shutdown(self) -> ReclamationController {
        self.stop.store(true, Ordering::Release);
        self.thread.thread().unpark();
        match self.thread.join() {
            Ok(controller) => controller,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

fn run(mut controller: ReclamationController, stop: &AtomicBool) -> ReclamationController {
    let current = thread::current();
    let name = current.name().unwrap_or(DEFAULT_THREAD_NAME).to_owned();
    controller.set_waker(Some(current));
    trace::service_started(&name);

    while !stop.load(Ordering::Acquire) {
        controller.execute();
        if stop.load(Ordering::Acquire) {
            break;
        }
        thread::park_timeout(controller.reschedule_delay());
    }

    controller.set_waker(None);
    trace::service_stopped(&name, controller.cycles_completed());
    controller
}
