use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::deque::{Injector, Steal};
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::env_var::config;

/// A monotonic deadline handed to work items.  Work is abandoned at the
/// deadline (never mid-message); the item is simply re-queued.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TimeLimit {
    deadline: Option<Instant>,
}

impl TimeLimit {
    pub(crate) fn relative(d: Duration) -> TimeLimit {
        TimeLimit {
            deadline: Some(Instant::now() + d),
        }
    }

    pub(crate) fn unlimited() -> TimeLimit {
        TimeLimit { deadline: None }
    }

    pub(crate) fn work_slice() -> TimeLimit {
        TimeLimit::relative(Duration::from_micros(config().work_slice_us))
    }

    pub(crate) fn is_expired(&self) -> bool {
        match self.deadline {
            None => false,
            Some(d) => Instant::now() >= d,
        }
    }
}

/// Something the worker pool can give time slices to -- one per channel.
///
/// `do_work` makes best-effort forward progress within the limit and returns
/// true iff it wants to be re-queued immediately (more work already known to
/// be pending).  Items that run dry come back through `make_active`.
pub(crate) trait BackgroundWorkItem: Send + Sync {
    fn do_work(self: Arc<Self>, work_until: TimeLimit) -> bool;
    fn name(&self) -> &str;
}

struct BgWorkShared {
    injector: Injector<Arc<dyn BackgroundWorkItem>>,
    sleepers: Mutex<usize>,
    wakeup: Condvar,
    shutdown: AtomicBool,
    active_cnt: AtomicUsize,
}

/// Pool of worker threads time-slicing the registered work items.
pub(crate) struct BackgroundWorkManager {
    shared: Arc<BgWorkShared>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl BackgroundWorkManager {
    pub(crate) fn new() -> BackgroundWorkManager {
        BackgroundWorkManager {
            shared: Arc::new(BgWorkShared {
                injector: Injector::new(),
                sleepers: Mutex::new(0),
                wakeup: Condvar::new(),
                shutdown: AtomicBool::new(false),
                active_cnt: AtomicUsize::new(0),
            }),
            threads: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn handle(&self) -> BgWorkHandle {
        BgWorkHandle {
            shared: self.shared.clone(),
        }
    }

    pub(crate) fn start_workers(&self, count: usize) {
        let mut threads = self.threads.lock();
        for i in 0..count {
            let shared = self.shared.clone();
            let builder = thread::Builder::new().name(format!("ferry-worker-{}", i));
            threads.push(
                builder
                    .spawn(move || {
                        shared.active_cnt.fetch_add(1, Ordering::SeqCst);
                        worker_loop(&shared);
                        shared.active_cnt.fetch_sub(1, Ordering::SeqCst);
                    })
                    .unwrap(),
            );
        }
    }

    pub(crate) fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.wakeup.notify_all();
        let mut threads = self.threads.lock();
        for t in threads.drain(..) {
            let _ = t.join();
        }
        debug!(target: "ferry::dma", "background workers stopped");
    }
}

/// Cheap clonable handle items use to make themselves active.
#[derive(Clone)]
pub(crate) struct BgWorkHandle {
    shared: Arc<BgWorkShared>,
}

impl BgWorkHandle {
    pub(crate) fn make_active(&self, item: Arc<dyn BackgroundWorkItem>) {
        self.shared.injector.push(item);
        self.shared.wakeup.notify_one();
    }
}

fn worker_loop(shared: &BgWorkShared) {
    loop {
        match shared.injector.steal() {
            Steal::Success(item) => {
                let again = item.clone().do_work(TimeLimit::work_slice());
                if again {
                    shared.injector.push(item);
                }
            }
            Steal::Retry => continue,
            Steal::Empty => {
                if shared.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                let mut sleepers = shared.sleepers.lock();
                if !shared.injector.is_empty() || shared.shutdown.load(Ordering::SeqCst) {
                    continue;
                }
                *sleepers += 1;
                let _ = shared
                    .wakeup
                    .wait_for(&mut sleepers, Duration::from_millis(10));
                *sleepers -= 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountItem {
        hits: AtomicUsize,
        rounds: usize,
    }

    impl BackgroundWorkItem for CountItem {
        fn do_work(self: Arc<Self>, _until: TimeLimit) -> bool {
            let n = self.hits.fetch_add(1, Ordering::SeqCst) + 1;
            n < self.rounds
        }
        fn name(&self) -> &str {
            "count"
        }
    }

    #[test]
    fn items_get_time_slices() {
        let mgr = BackgroundWorkManager::new();
        mgr.start_workers(2);
        let item = Arc::new(CountItem {
            hits: AtomicUsize::new(0),
            rounds: 5,
        });
        mgr.handle().make_active(item.clone());
        let deadline = Instant::now() + Duration::from_secs(5);
        while item.hits.load(Ordering::SeqCst) < 5 {
            assert!(Instant::now() < deadline, "work item starved");
            thread::yield_now();
        }
        mgr.shutdown();
    }

    #[test]
    fn expired_limit_reports_expired() {
        let tl = TimeLimit::relative(Duration::from_micros(1));
        thread::sleep(Duration::from_millis(1));
        assert!(tl.is_expired());
        assert!(!TimeLimit::unlimited().is_expired());
    }
}
