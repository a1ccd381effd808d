//! Per-portal activity watchdog.
//!
//! Every tick the watchdog compares two clocks against the last recorded
//! activity: the monotonic clock catches a hung fetch session, and the wall
//! clock catches a machine that slept and resumed (monotonic time does not
//! advance through suspend on every platform, wall time does). Either
//! breach raises a one-shot recovery request consumed by the portal run.

use log::warn;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::task::JoinHandle;

use super::stop::StopToken;

/// Default seconds without a heartbeat before recovery is requested.
pub const DEFAULT_INACTIVITY_SECS: u64 = 120;
/// Default wall-clock jump treated as a sleep/resume, in seconds.
pub const DEFAULT_SLEEP_JUMP_SECS: u64 = 180;
/// Watchdog poll period.
const TICK: Duration = Duration::from_secs(10);

/// Watchdog thresholds.
#[derive(Debug, Clone, Copy)]
pub struct WatchdogConfig {
    pub inactivity: Duration,
    pub sleep_jump: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            inactivity: Duration::from_secs(DEFAULT_INACTIVITY_SECS),
            sleep_jump: Duration::from_secs(DEFAULT_SLEEP_JUMP_SECS),
        }
    }
}

/// Shared last-activity state, touched by the portal run on every heartbeat.
#[derive(Clone)]
pub struct ActivityTracker {
    inner: Arc<Mutex<(Instant, SystemTime)>>,
}

impl ActivityTracker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new((Instant::now(), SystemTime::now()))),
        }
    }

    /// Record activity now, on both clocks.
    pub fn touch(&self) {
        *self.inner.lock() = (Instant::now(), SystemTime::now());
    }

    fn snapshot(&self) -> (Instant, SystemTime) {
        *self.inner.lock()
    }
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a running watchdog. The task ends on its own once it raises the
/// trigger or the portal stop is set; `finish` reaps it.
pub struct WatchdogHandle {
    done: StopToken,
    task: JoinHandle<()>,
}

impl WatchdogHandle {
    /// Tell the watchdog the run is over and reap the task. The task may be
    /// mid-tick, so it is aborted rather than waited out.
    pub async fn finish(self) {
        self.done.set();
        self.task.abort();
        let _ = self.task.await;
    }
}

/// Spawn the watchdog for one portal run attempt. When a threshold is
/// breached, `trigger` is set exactly once and the task exits.
pub fn spawn_watchdog(
    portal_name: String,
    tracker: ActivityTracker,
    stop: StopToken,
    trigger: StopToken,
    config: WatchdogConfig,
) -> WatchdogHandle {
    let done = StopToken::new();
    let done_for_task = done.clone();

    let task = tokio::spawn(async move {
        loop {
            if done_for_task.is_set() || stop.is_set() {
                return;
            }

            let (last_mono, last_wall) = tracker.snapshot();
            let wall_gap = SystemTime::now()
                .duration_since(last_wall)
                .unwrap_or(Duration::ZERO);
            if wall_gap >= config.sleep_jump {
                warn!(
                    "Watchdog: sleep/network pause detected for {portal_name} \
                     ({}s wall-clock jump); requesting recovery",
                    wall_gap.as_secs()
                );
                trigger.set();
                return;
            }

            if last_mono.elapsed() >= config.inactivity {
                warn!(
                    "Watchdog: no activity for {}s on {portal_name}; requesting recovery",
                    config.inactivity.as_secs()
                );
                trigger.set();
                return;
            }

            tokio::time::sleep(TICK).await;
        }
    });

    WatchdogHandle { done, task }
}
