//! The background worker running low-priority eviction passes.
//!
//! A tidy-up releases a small share of a cache (see
//! [`Evictable::tidy_up`](../trait.Evictable.html#tymethod.tidy_up)) off the
//! request-serving threads. Urgent eviction is never queued here; whoever
//! detects urgent pressure calls the cache directly.

use crate::{
    authority::{CacheId, Evictable},
    common::constants::TIDY_UP_IDLE_POLL_MILLIS,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    thread::JoinHandle,
    time::Duration,
};

static GLOBAL_SCHEDULER: Lazy<Arc<TidyUpScheduler>> = Lazy::new(|| Arc::new(TidyUpScheduler::new()));

/// A single worker thread draining a deduplicated queue of caches to tidy up.
///
/// Producers never block. The worker takes one cache at a time, blocking with
/// a timeout while the queue is empty. Queueing a cache that is already queued
/// has no effect.
///
/// Dropping the scheduler stops the worker after the pass it is currently
/// running, if any. Caches still queued at that point are not tidied.
pub struct TidyUpScheduler {
    snd: Option<Sender<CacheId>>,
    state: Arc<SchedulerState>,
    worker: Option<JoinHandle<()>>,
}

struct SchedulerState {
    queued: Mutex<HashMap<CacheId, Weak<dyn Evictable>>>,
    is_shutting_down: AtomicBool,
    completed_passes: AtomicU64,
}

impl fmt::Debug for TidyUpScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TidyUpScheduler")
            .field("pending", &self.pending())
            .field("completed_passes", &self.completed_passes())
            .finish()
    }
}

impl Default for TidyUpScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TidyUpScheduler {
    fn drop(&mut self) {
        // Disallow to run more passes by now.
        self.state.is_shutting_down.store(true, Ordering::Release);
        // Disconnect the channel so the worker wakes up.
        self.snd.take();

        if let Some(worker) = self.worker.take() {
            // The worker may itself drop the last handle to this scheduler,
            // through the last handle to a cache it was tidying up.
            if worker.thread().id() != std::thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

impl TidyUpScheduler {
    /// Starts a scheduler with its own worker thread.
    pub fn new() -> Self {
        let (snd, rcv) = crossbeam_channel::unbounded();
        let state = Arc::new(SchedulerState {
            queued: Mutex::new(HashMap::default()),
            is_shutting_down: AtomicBool::new(false),
            completed_passes: AtomicU64::new(0),
        });

        let worker_state = Arc::clone(&state);
        let worker = std::thread::Builder::new()
            .name("softcache-tidy-up".to_string())
            .spawn(move || run_worker(&worker_state, &rcv))
            .expect("Failed to spawn the tidy-up worker thread");

        Self {
            snd: Some(snd),
            state,
            worker: Some(worker),
        }
    }

    /// Returns the process-wide scheduler, starting its worker on first use.
    pub fn global() -> Arc<TidyUpScheduler> {
        Arc::clone(&GLOBAL_SCHEDULER)
    }

    /// Queues `cache` for a tidy-up pass. Returns `false` when the cache is
    /// already queued, has been dropped, or the scheduler is shutting down.
    pub fn register(&self, cache: Weak<dyn Evictable>) -> bool {
        let id = match cache.upgrade() {
            Some(c) => c.id(),
            None => return false,
        };
        if self.state.is_shutting_down.load(Ordering::Acquire) {
            return false;
        }

        let mut queued = self.state.queued.lock();
        if queued.contains_key(&id) {
            return false;
        }
        let sent = self
            .snd
            .as_ref()
            .map(|snd| snd.send(id).is_ok())
            .unwrap_or_default();
        if sent {
            queued.insert(id, cache);
        }
        sent
    }

    /// Returns `true` if the cache is queued and its pass has not started yet.
    pub fn is_queued(&self, id: CacheId) -> bool {
        self.state.queued.lock().contains_key(&id)
    }

    /// Returns the number of caches waiting for their pass.
    pub fn pending(&self) -> usize {
        self.state.queued.lock().len()
    }

    /// Returns the number of tidy-up passes the worker has finished.
    pub fn completed_passes(&self) -> u64 {
        self.state.completed_passes.load(Ordering::Acquire)
    }
}

fn run_worker(state: &SchedulerState, rcv: &Receiver<CacheId>) {
    #[cfg(feature = "logging")]
    log::debug!("Tidy-up worker started");

    let idle_poll = Duration::from_millis(TIDY_UP_IDLE_POLL_MILLIS);
    loop {
        match rcv.recv_timeout(idle_poll) {
            Ok(id) => {
                if state.is_shutting_down.load(Ordering::Acquire) {
                    break;
                }
                // Dequeue before running, so the cache can be queued again while
                // its pass is in progress.
                let cache = state.queued.lock().remove(&id).and_then(|w| w.upgrade());
                if let Some(cache) = cache {
                    run_pass(&*cache);
                }
                state.completed_passes.fetch_add(1, Ordering::AcqRel);
            }
            Err(RecvTimeoutError::Timeout) => {
                if state.is_shutting_down.load(Ordering::Acquire) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    #[cfg(feature = "logging")]
    log::debug!("Tidy-up worker stopped");
}

fn run_pass(cache: &dyn Evictable) {
    match catch_unwind(AssertUnwindSafe(|| cache.tidy_up())) {
        #[cfg_attr(not(feature = "logging"), allow(unused_variables))]
        Ok(released) => {
            #[cfg(feature = "logging")]
            log::trace!("Tidied up {:?}: released {released} bytes", cache.id());
        }
        Err(_payload) => {
            #[cfg(feature = "logging")]
            log::error!("Tidy-up of {:?} panicked; the worker keeps running", cache.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::TidyUpScheduler;
    use crate::{
        authority::{CacheId, Evictable},
        ConfigError, Cost,
    };

    use std::{
        sync::{
            atomic::{AtomicU64, Ordering},
            Arc,
        },
        time::{Duration, Instant},
    };

    struct Counting {
        id: CacheId,
        passes: AtomicU64,
        panics: bool,
    }

    impl Counting {
        fn new(panics: bool) -> Arc<Self> {
            Arc::new(Self {
                id: CacheId::new(),
                passes: AtomicU64::new(0),
                panics,
            })
        }
    }

    impl Evictable for Counting {
        fn id(&self) -> CacheId {
            self.id
        }

        fn cost(&self) -> Cost {
            Cost::Low
        }

        fn free_memory(&self, _percent: f64) -> Result<u64, ConfigError> {
            Ok(0)
        }

        fn panic_free_memory(&self) -> u64 {
            0
        }

        fn queued_free_memory(&self, _percent: f64) -> Result<u64, ConfigError> {
            Ok(0)
        }

        fn tidy_up(&self) -> u64 {
            self.passes.fetch_add(1, Ordering::AcqRel);
            if self.panics {
                panic!("tidy-up failed");
            }
            1
        }

        fn estimated_size(&self) -> u64 {
            0
        }

        fn last_accessed(&self) -> i64 {
            0
        }
    }

    fn weak(cache: &Arc<Counting>) -> std::sync::Weak<dyn Evictable> {
        let cache: Arc<dyn Evictable> = cache.clone();
        Arc::downgrade(&cache)
    }

    fn wait_for(scheduler: &TidyUpScheduler, passes: u64) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while scheduler.completed_passes() < passes {
            assert!(Instant::now() < deadline, "tidy-up worker timed out");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn runs_queued_caches() {
        let scheduler = TidyUpScheduler::new();
        let a = Counting::new(false);
        let b = Counting::new(false);

        assert!(scheduler.register(weak(&a)));
        assert!(scheduler.register(weak(&b)));
        wait_for(&scheduler, 2);

        assert_eq!(a.passes.load(Ordering::Acquire), 1);
        assert_eq!(b.passes.load(Ordering::Acquire), 1);
        assert_eq!(scheduler.pending(), 0);

        // Once its pass ran, a cache can be queued again.
        assert!(scheduler.register(weak(&a)));
        wait_for(&scheduler, 3);
        assert_eq!(a.passes.load(Ordering::Acquire), 2);
    }

    #[test]
    fn register_is_idempotent_while_queued() {
        struct Blocking {
            id: CacheId,
            started: crossbeam_channel::Sender<()>,
            release: crossbeam_channel::Receiver<()>,
        }

        impl Evictable for Blocking {
            fn id(&self) -> CacheId {
                self.id
            }
            fn cost(&self) -> Cost {
                Cost::Low
            }
            fn free_memory(&self, _percent: f64) -> Result<u64, ConfigError> {
                Ok(0)
            }
            fn panic_free_memory(&self) -> u64 {
                0
            }
            fn queued_free_memory(&self, _percent: f64) -> Result<u64, ConfigError> {
                Ok(0)
            }
            fn tidy_up(&self) -> u64 {
                let _ = self.started.send(());
                let _ = self.release.recv_timeout(Duration::from_secs(5));
                0
            }
            fn estimated_size(&self) -> u64 {
                0
            }
            fn last_accessed(&self) -> i64 {
                0
            }
        }

        let scheduler = TidyUpScheduler::new();
        let (started_snd, started_rcv) = crossbeam_channel::unbounded();
        let (release_snd, release_rcv) = crossbeam_channel::unbounded();
        let blocking: Arc<dyn Evictable> = Arc::new(Blocking {
            id: CacheId::new(),
            started: started_snd,
            release: release_rcv,
        });
        assert!(scheduler.register(Arc::downgrade(&blocking)));
        started_rcv
            .recv_timeout(Duration::from_secs(5))
            .expect("blocking pass did not start");

        // The worker is busy, so `a` stays queued.
        let a = Counting::new(false);
        assert!(scheduler.register(weak(&a)));
        assert!(!scheduler.register(weak(&a)));
        assert!(scheduler.is_queued(a.id));
        assert_eq!(scheduler.pending(), 1);

        release_snd.send(()).unwrap();
        wait_for(&scheduler, 2);
        assert_eq!(a.passes.load(Ordering::Acquire), 1);
        assert!(!scheduler.is_queued(a.id));
    }

    #[test]
    fn dropped_caches_are_not_queued() {
        let scheduler = TidyUpScheduler::new();
        let a = Counting::new(false);
        let w = weak(&a);
        drop(a);
        assert!(!scheduler.register(w));
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn survives_a_panicking_pass() {
        let scheduler = TidyUpScheduler::new();
        let bad = Counting::new(true);
        let good = Counting::new(false);

        assert!(scheduler.register(weak(&bad)));
        assert!(scheduler.register(weak(&good)));
        wait_for(&scheduler, 2);
        assert_eq!(bad.passes.load(Ordering::Acquire), 1);
        assert_eq!(good.passes.load(Ordering::Acquire), 1);
    }

    #[test]
    fn drop_stops_the_worker() {
        let scheduler = TidyUpScheduler::new();
        let a = Counting::new(false);
        assert!(scheduler.register(weak(&a)));
        wait_for(&scheduler, 1);
        // Joins the worker thread; must not hang.
        drop(scheduler);
    }
}
