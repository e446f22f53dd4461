use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use supervisor_config::ConfigSource;

use crate::supervisor::Supervisor;

/// Fixed-cadence driver calling `tick` on every program (spec.md §4.5).
///
/// Runs on a dedicated OS thread, matching the background-thread monitor
/// loop shape the supervisor's reference implementation uses, with the
/// re-entrancy window closed by `supervisor`'s mutex rather than left to
/// coincidence (spec.md §9). Signal handlers never touch `supervisor`
/// directly (spec.md §5); they set `stop`/`reload`, and this loop drains
/// both flags at each tick boundary.
pub struct MonitorLoop {
    period: Duration,
}

impl MonitorLoop {
    pub fn new(period: Duration) -> Self {
        MonitorLoop { period }
    }

    /// Blocks the calling thread until `stop` is set. Intended to be
    /// spawned onto its own thread.
    pub fn run(
        &self,
        supervisor: Arc<Mutex<Supervisor>>,
        stop: Arc<AtomicBool>,
        reload: Arc<AtomicBool>,
        source: &dyn ConfigSource,
    ) {
        while !stop.load(Ordering::SeqCst) {
            let tick_start = Instant::now();
            {
                let mut guard = supervisor.lock().expect("supervisor mutex poisoned");
                if reload.swap(false, Ordering::SeqCst) {
                    // A reload that fails leaves the supervisor on the
                    // previously active spec (spec.md §7); no retry here.
                    if let Err(err) = guard.reload(source) {
                        tracing::error!(error = %err, "reload failed, keeping previous configuration");
                    }
                }
                guard.tick_all();
            }
            let elapsed = tick_start.elapsed();
            if elapsed < self.period {
                std::thread::sleep(self.period - elapsed);
            }
        }
    }
}

impl Default for MonitorLoop {
    fn default() -> Self {
        MonitorLoop::new(Duration::from_secs(1))
    }
}
