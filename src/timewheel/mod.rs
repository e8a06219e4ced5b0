//! Hashed Time Wheel
//!
//! A classic hashed timing wheel for deferred jobs, used by the databases to
//! schedule key expirations. `slot_num` buckets are visited round-robin, one
//! per tick; a job whose delay exceeds a full revolution carries a `circle`
//! counter and is skipped until the wheel has spun past it the right number
//! of times.
//!
//! ```text
//!            tick
//!             │
//!   ┌───┬───┬─▼─┬───┬───┐
//!   │ 0 │ 1 │ 2 │ 3 │...│   slot = (current + delay/interval) % slot_num
//!   └───┴───┴───┴───┴───┘   circle = (delay/interval) / slot_num
//! ```
//!
//! All slot state is owned by a single driver thread; callers talk to it
//! through one bounded rendezvous channel, so no mutation ever needs a lock.
//! Jobs are identified by an opaque string key: scheduling under an existing
//! key replaces the previous job, and removal is idempotent. Fired jobs run
//! on their own thread behind `catch_unwind` so a panicking job cannot take
//! the wheel down.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use tracing::{error, trace};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Task {
    circle: usize,
    job: Job,
}

enum WheelCmd {
    Add { delay: Duration, key: String, job: Job },
    Remove(String),
    Stop,
}

/// Handle to a running time wheel.
///
/// Cheap to share behind an `Arc`; [`stop`](TimeWheel::stop) shuts the
/// driver thread down and discards all pending jobs.
pub struct TimeWheel {
    tx: Mutex<Option<SyncSender<WheelCmd>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl TimeWheel {
    /// Starts a wheel ticking every `interval` over `slot_num` slots.
    pub fn new(interval: Duration, slot_num: usize) -> Self {
        assert!(interval >= Duration::from_millis(1), "tick interval too small");
        assert!(slot_num > 0, "wheel needs at least one slot");

        // Rendezvous channel: the driver thread is the single owner of all
        // slot state, and every command is handed over synchronously.
        let (tx, rx) = sync_channel(0);
        let driver = std::thread::Builder::new()
            .name("timewheel".into())
            .spawn(move || Driver::new(interval, slot_num).run(rx))
            .expect("failed to spawn timewheel driver");

        Self {
            tx: Mutex::new(Some(tx)),
            driver: Mutex::new(Some(driver)),
        }
    }

    fn send(&self, cmd: WheelCmd) {
        let tx = self.tx.lock().unwrap();
        if let Some(tx) = tx.as_ref() {
            // A send error means the driver is gone; scheduling after stop
            // is a no-op, like cancelling a finished job.
            let _ = tx.send(cmd);
        }
    }

    /// Schedules `job` to run after `delay`, keyed by `key`.
    ///
    /// An existing job under the same key is cancelled first.
    pub fn add_job(&self, delay: Duration, key: impl Into<String>, job: impl FnOnce() + Send + 'static) {
        self.send(WheelCmd::Add {
            delay,
            key: key.into(),
            job: Box::new(job),
        });
    }

    /// Schedules `job` to run at the wall-clock instant `when`.
    ///
    /// Instants already in the past fire on the next tick.
    pub fn at(&self, when: SystemTime, key: impl Into<String>, job: impl FnOnce() + Send + 'static) {
        let delay = when
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO);
        self.add_job(delay, key, job);
    }

    /// Cancels the job under `key`. Unknown keys are ignored.
    pub fn remove_job(&self, key: impl Into<String>) {
        self.send(WheelCmd::Remove(key.into()));
    }

    /// Stops the driver thread and drops every pending job.
    pub fn stop(&self) {
        let tx = self.tx.lock().unwrap().take();
        if let Some(tx) = tx {
            let _ = tx.send(WheelCmd::Stop);
        }
        if let Some(driver) = self.driver.lock().unwrap().take() {
            let _ = driver.join();
        }
    }
}

impl Drop for TimeWheel {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The single-threaded owner of all wheel state.
struct Driver {
    interval: Duration,
    slots: Vec<HashMap<String, Task>>,
    // key -> slot holding it, for O(1) cancellation
    timer: HashMap<String, usize>,
    current_pos: usize,
}

impl Driver {
    fn new(interval: Duration, slot_num: usize) -> Self {
        Self {
            interval,
            slots: (0..slot_num).map(|_| HashMap::new()).collect(),
            timer: HashMap::new(),
            current_pos: 0,
        }
    }

    fn run(mut self, rx: Receiver<WheelCmd>) {
        let mut next_tick = Instant::now() + self.interval;
        loop {
            let timeout = next_tick.saturating_duration_since(Instant::now());
            match rx.recv_timeout(timeout) {
                Ok(WheelCmd::Add { delay, key, job }) => self.add_task(delay, key, job),
                Ok(WheelCmd::Remove(key)) => self.remove_task(&key),
                Ok(WheelCmd::Stop) | Err(RecvTimeoutError::Disconnected) => return,
                Err(RecvTimeoutError::Timeout) => {
                    self.tick();
                    next_tick += self.interval;
                }
            }
        }
    }

    fn add_task(&mut self, delay: Duration, key: String, job: Job) {
        let step = (delay.as_millis() / self.interval.as_millis()) as usize;
        let circle = step / self.slots.len();
        let pos = (self.current_pos + step) % self.slots.len();

        if self.timer.contains_key(&key) {
            self.remove_task(&key);
        }
        trace!(key = %key, slot = pos, circle, "scheduled task");
        self.slots[pos].insert(key.clone(), Task { circle, job });
        self.timer.insert(key, pos);
    }

    fn remove_task(&mut self, key: &str) {
        if let Some(pos) = self.timer.remove(key) {
            self.slots[pos].remove(key);
        }
    }

    fn tick(&mut self) {
        let pos = self.current_pos;
        self.current_pos = (self.current_pos + 1) % self.slots.len();

        let slot = &mut self.slots[pos];
        if slot.is_empty() {
            return;
        }

        let due: Vec<String> = slot
            .iter()
            .filter(|(_, task)| task.circle == 0)
            .map(|(key, _)| key.clone())
            .collect();
        for task in slot.values_mut() {
            task.circle = task.circle.saturating_sub(1);
        }
        for key in due {
            if let Some(task) = slot.remove(&key) {
                self.timer.remove(&key);
                // Run off-thread so a slow or panicking job never stalls
                // the wheel itself.
                std::thread::spawn(move || {
                    if catch_unwind(AssertUnwindSafe(task.job)).is_err() {
                        error!(key = %key, "timewheel task panicked");
                    }
                });
            }
        }
    }
}
