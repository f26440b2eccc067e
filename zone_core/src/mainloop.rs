//! Mainloop & timers, §4.3. The mainloop itself is a single cooperative
//! thread: [`Mainloop::run_iteration`] is called in a loop by
//! `zone_server`'s `main`, passing in the current time and the
//! arena/player advance steps so this module stays free of any dependency
//! on `arena`/`player` types.
//!
//! Worker-pool timers share the same [`TimerAction`]/`set_timer` contract
//! but run on a background thread (`WorkerTimers`) rather than the
//! mainloop — callers are responsible for synchronizing whatever state
//! their callback touches (§4.3).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use log::debug;

use crate::error::MainloopError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    Continue,
    Stop,
}

/// §6 exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Normal,
    ModuleInitFailure,
    ConfigError,
    Recycle,
}

type TimerCallback = Box<dyn FnMut() -> TimerAction + Send>;
type CleanupCallback = Box<dyn FnOnce() + Send>;

struct Timer {
    id: u64,
    /// Stands in for "callback identity" in the source's C API (function
    /// pointers aren't a stable identity in Rust) — callers pick a stable
    /// tag per logical timer kind so `clear_timer(tag, None)` can cancel
    /// every instance of it, matching the null-key bulk-cancel contract.
    tag: &'static str,
    key: Option<u64>,
    interval: Option<Duration>,
    next_due: Instant,
    callback: TimerCallback,
    cleanup: Option<CleanupCallback>,
}

/// Opaque handle returned by `set_timer`, usable for precise cancellation.
pub struct TimerHandle {
    id: u64,
}

/// Shared by [`Mainloop`] (run on the mainloop thread) and `WorkerTimers`
/// (run on a background thread) — the registration/cancellation contract
/// is identical either way (§4.3).
#[derive(Default)]
pub struct TimerRegistry {
    timers: Mutex<Vec<Timer>>,
    next_id: AtomicU64,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self {
            timers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn set_timer<F>(
        &self,
        tag: &'static str,
        key: Option<u64>,
        initial_delay: Duration,
        interval: Option<Duration>,
        now: Instant,
        callback: F,
        cleanup: Option<CleanupCallback>,
    ) -> TimerHandle
    where
        F: FnMut() -> TimerAction + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.timers.lock().unwrap().push(Timer {
            id,
            tag,
            key,
            interval,
            next_due: now + initial_delay,
            callback: Box::new(callback),
            cleanup,
        });
        TimerHandle { id }
    }

    /// Cancels by `(tag, key)`. `key: None` cancels every timer registered
    /// under `tag`, matching the source's "null key matches all timers for
    /// that callback" contract. Runs each cancelled timer's cleanup
    /// callback once.
    pub fn clear_timer(&self, tag: &'static str, key: Option<u64>) {
        let mut timers = self.timers.lock().unwrap();
        let mut i = 0;
        while i < timers.len() {
            let matches = timers[i].tag == tag && (key.is_none() || timers[i].key == key);
            if matches {
                let removed = timers.remove(i);
                if let Some(cleanup) = removed.cleanup {
                    cleanup();
                }
            } else {
                i += 1;
            }
        }
    }

    pub fn clear_handle(&self, handle: TimerHandle) {
        let mut timers = self.timers.lock().unwrap();
        if let Some(pos) = timers.iter().position(|t| t.id == handle.id) {
            let removed = timers.remove(pos);
            if let Some(cleanup) = removed.cleanup {
                cleanup();
            }
        }
    }

    /// Runs every timer whose `next_due <= now`, in deadline order.
    /// Returns how many fired.
    pub fn run_due(&self, now: Instant) -> usize {
        let due_ids: Vec<u64> = {
            let mut timers = self.timers.lock().unwrap();
            timers.sort_by_key(|t| t.next_due);
            timers
                .iter()
                .filter(|t| t.next_due <= now)
                .map(|t| t.id)
                .collect()
        };

        let mut fired = 0;
        for id in due_ids {
            // Re-fetch by id each time: `callback()` may register or clear
            // other timers, which would invalidate a held index/borrow.
            let mut callback = {
                let mut timers = self.timers.lock().unwrap();
                match timers.iter().position(|t| t.id == id) {
                    Some(pos) => std::mem::replace(
                        &mut timers[pos].callback,
                        Box::new(|| TimerAction::Stop),
                    ),
                    None => continue,
                }
            };
            let action = callback();
            fired += 1;

            let mut timers = self.timers.lock().unwrap();
            if let Some(pos) = timers.iter().position(|t| t.id == id) {
                timers[pos].callback = callback;
                match (action, timers[pos].interval) {
                    (TimerAction::Continue, Some(interval)) => {
                        timers[pos].next_due = now + interval;
                    }
                    _ => {
                        let removed = timers.remove(pos);
                        if let Some(cleanup) = removed.cleanup {
                            cleanup();
                        }
                    }
                }
            }
        }
        fired
    }
}

/// FIFO work-item queue with drain tracking for
/// `wait_for_main_work_item_drain` (§4.3).
#[derive(Default)]
pub struct WorkQueue {
    queue: Mutex<VecDeque<Box<dyn FnOnce() + Send>>>,
    queued: AtomicU64,
    processed: AtomicU64,
    drain_cv: Condvar,
    closed: AtomicBool,
}

impl WorkQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn queue_main_work_item<F: FnOnce() + Send + 'static>(&self, item: F) -> Result<(), MainloopError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MainloopError::QueueClosed);
        }
        self.queue.lock().unwrap().push_back(Box::new(item));
        self.queued.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Drains and runs every queued item, in FIFO order. Called from the
    /// mainloop each iteration.
    pub fn drain(&self) -> usize {
        let items: Vec<_> = {
            let mut queue = self.queue.lock().unwrap();
            queue.drain(..).collect()
        };
        let n = items.len();
        for item in items {
            item();
        }
        if n > 0 {
            self.processed.fetch_add(n as u64, Ordering::SeqCst);
            self.drain_cv.notify_all();
        }
        n
    }

    /// Blocks until every item queued *before this call* has run. Used by
    /// modules during teardown.
    pub fn wait_for_main_work_item_drain(&self) {
        let target = self.queued.load(Ordering::SeqCst);
        let guard = self.queue.lock().unwrap();
        let _unused = self
            .drain_cv
            .wait_while(guard, |_| self.processed.load(Ordering::SeqCst) < target)
            .unwrap();
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// The single cooperative mainloop thread (§4.3). Owns mainloop-scoped
/// timers and the FIFO work queue; arena/player lifecycle advancement is
/// injected as closures by the caller so this module has no dependency on
/// those types.
pub struct Mainloop {
    pub timers: TimerRegistry,
    pub work_queue: Arc<WorkQueue>,
    exit_code: Mutex<Option<ExitCode>>,
    quit_requested_at: AtomicI32,
}

impl Mainloop {
    pub fn new() -> Self {
        Self {
            timers: TimerRegistry::new(),
            work_queue: WorkQueue::new(),
            exit_code: Mutex::new(None),
            quit_requested_at: AtomicI32::new(-1),
        }
    }

    /// Requests shutdown with the given exit code. Work items queued after
    /// this call are still drained before the loop actually exits (§5).
    pub fn quit(&self, code: ExitCode) {
        *self.exit_code.lock().unwrap() = Some(code);
        self.work_queue.close();
    }

    pub fn exit_code(&self) -> Option<ExitCode> {
        *self.exit_code.lock().unwrap()
    }

    /// One mainloop iteration, per the five steps in §4.3. Returns `true`
    /// if the loop should keep running (no quit requested, or work items
    /// still pending after quit).
    pub fn run_iteration(
        &self,
        now: Instant,
        mut advance_arenas: impl FnMut(),
        mut advance_players: impl FnMut(),
    ) -> bool {
        self.timers.run_due(now);
        self.work_queue.drain();
        advance_arenas();
        advance_players();

        match self.exit_code() {
            Some(_) if self.work_queue.queue.lock().unwrap().is_empty() => {
                debug!("mainloop exiting, work queue drained");
                false
            }
            _ => true,
        }
    }
}

impl Default for Mainloop {
    fn default() -> Self {
        Self::new()
    }
}
