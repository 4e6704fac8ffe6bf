//! Job Manager
//!
//! Process-wide registry of active runs and code-loops: cooperative
//! cancellation flags, the global code-loop lock, sliding-hour rate limits
//! and the timeout supervisor.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::OwnedMutexGuard;
use tracing::{info, warn};

use crate::error::{EngineError, EngineResult};

/// Cooperative cancellation flag checked between iteration steps.
#[derive(Debug, Default)]
pub struct CancelFlag {
    cancelled: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl CancelFlag {
    pub fn cancel(&self, reason: impl Into<String>) {
        let mut guard = self.reason.lock().expect("cancel reason lock");
        if guard.is_none() {
            *guard = Some(reason.into());
        }
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().expect("cancel reason lock").clone()
    }
}

struct ActiveRun {
    cancel: Arc<CancelFlag>,
    started: Instant,
}

/// Sliding-window counter keyed by client id.
#[derive(Default)]
struct SlidingWindows {
    windows: HashMap<String, VecDeque<Instant>>,
}

impl SlidingWindows {
    /// Admit one event, or report how long until the window frees up.
    fn admit(&mut self, key: &str, limit: u32, window: Duration) -> Result<(), u64> {
        let now = Instant::now();
        let entries = self.windows.entry(key.to_string()).or_default();
        while let Some(front) = entries.front() {
            if now.duration_since(*front) >= window {
                entries.pop_front();
            } else {
                break;
            }
        }
        if entries.len() >= limit as usize {
            let retry_after = match entries.front() {
                Some(oldest) => window.saturating_sub(now.duration_since(*oldest)),
                None => window,
            };
            return Err(retry_after.as_secs().max(1));
        }
        entries.push_back(now);
        Ok(())
    }
}

pub struct JobManager {
    active: Mutex<HashMap<i64, ActiveRun>>,
    code_loop_lock: Arc<tokio::sync::Mutex<()>>,
    code_loop_window: Mutex<SlidingWindows>,
    run_windows: Mutex<SlidingWindows>,
    code_loop_max_per_hour: u32,
    runs_per_hour_per_client: u32,
    run_timeout: Option<Duration>,
}

impl JobManager {
    pub fn new(
        code_loop_max_per_hour: u32,
        runs_per_hour_per_client: u32,
        run_timeout: Option<Duration>,
    ) -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
            code_loop_lock: Arc::new(tokio::sync::Mutex::new(())),
            code_loop_window: Mutex::new(SlidingWindows::default()),
            run_windows: Mutex::new(SlidingWindows::default()),
            code_loop_max_per_hour,
            runs_per_hour_per_client,
            run_timeout,
        }
    }

    /// Rate-limit check for a new meta-run; called before the run is created.
    pub fn admit_run(&self, client_id: &str) -> EngineResult<()> {
        let mut windows = self.run_windows.lock().expect("run window lock");
        windows
            .admit(client_id, self.runs_per_hour_per_client, Duration::from_secs(3600))
            .map_err(|retry_after_s| EngineError::RateLimited { retry_after_s })
    }

    /// Register a run and arm its timeout supervisor.
    pub fn register_run(self: &Arc<Self>, run_id: i64) -> Arc<CancelFlag> {
        let cancel = Arc::new(CancelFlag::default());
        {
            let mut active = self.active.lock().expect("active run lock");
            active.insert(run_id, ActiveRun { cancel: Arc::clone(&cancel), started: Instant::now() });
        }
        info!(run_id, "run registered");

        if let Some(timeout) = self.run_timeout {
            let manager = Arc::clone(self);
            let flag = Arc::clone(&cancel);
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let still_active = manager
                    .active
                    .lock()
                    .expect("active run lock")
                    .contains_key(&run_id);
                if still_active && !flag.is_cancelled() {
                    warn!(run_id, "run exceeded {:?}, cancelling", timeout);
                    flag.cancel("timeout");
                }
            });
        }
        cancel
    }

    pub fn cancel_run(&self, run_id: i64) -> bool {
        let active = self.active.lock().expect("active run lock");
        match active.get(&run_id) {
            Some(run) => {
                run.cancel.cancel("requested");
                true
            }
            None => false,
        }
    }

    pub fn complete_run(&self, run_id: i64) {
        let mut active = self.active.lock().expect("active run lock");
        if let Some(run) = active.remove(&run_id) {
            info!(run_id, elapsed_s = run.started.elapsed().as_secs(), "run deregistered");
        }
    }

    pub fn active_run_count(&self) -> usize {
        self.active.lock().expect("active run lock").len()
    }

    /// Cooperatively cancel every active run (graceful shutdown).
    pub fn cancel_all(&self, reason: &str) {
        let active = self.active.lock().expect("active run lock");
        for run in active.values() {
            run.cancel.cancel(reason);
        }
    }

    pub fn is_active(&self, run_id: i64) -> bool {
        self.active.lock().expect("active run lock").contains_key(&run_id)
    }

    /// Acquire the global code-loop slot. At most one loop runs at a time
    /// (live or dry-run); excess calls reject synchronously.
    pub fn begin_code_loop(&self) -> EngineResult<OwnedMutexGuard<()>> {
        {
            let mut window = self.code_loop_window.lock().expect("code loop window lock");
            window
                .admit("global", self.code_loop_max_per_hour, Duration::from_secs(3600))
                .map_err(|retry_after_s| EngineError::RateLimited { retry_after_s })?;
        }
        Arc::clone(&self.code_loop_lock)
            .try_lock_owned()
            .map_err(|_| EngineError::CodeLoopBusy)
    }
}
