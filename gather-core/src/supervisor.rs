//! Supervisor — the perpetual scheduling loop that decides when the
//! distribution engine runs.
//!
//! Each cycle reads the settings snapshot, gates on enabled / target group /
//! pending targets, computes the next eligible instant, and waits on a race
//! of stop, wake and timeout. Stop always wins. Exactly one engine run
//! happens per eligibility, and the running flag is cleared on every exit
//! path, including a panicking run.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use gather_store::Store;

use crate::engine::{Engine, RunParams, RunReport};
use crate::errors::CoreError;
use crate::registry::Registry;
use crate::settings::{
    self, AutomationSettings, KEY_FORCED_WAKEUP, KEY_RUNNING,
};

// ─── Config ───────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug)]
pub struct SupervisorConfig {
    /// Upper bound on any single wait, so settings changes are re-read.
    pub poll_interval:    Duration,
    /// Minimum spacing between runs when no daily schedule is configured.
    pub min_run_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval:    Duration::from_secs(60),
            min_run_interval: Duration::from_secs(300),
        }
    }
}

// ─── Next-run computation ─────────────────────────────────────────────────────

/// When the next run is due. Pure; all clock input comes through `now`.
///
/// Priority: a forced wake runs now. A daily `HH:MM` schedule runs at
/// today's instant — tomorrow's if a run already happened today at or after
/// it, immediately if the instant has passed without a run. Without a
/// schedule, runs are spaced `min_interval` apart from the last one.
pub fn compute_next_run(
    daily_start: Option<&str>,
    last_run: Option<DateTime<Utc>>,
    forced: bool,
    min_interval: ChronoDuration,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    if forced {
        return now;
    }

    if let Some(spec) = daily_start {
        if let Ok(time) = NaiveTime::parse_from_str(spec, "%H:%M") {
            let today = now.date_naive().and_time(time).and_utc();
            let ran_today = last_run
                .map(|lr| lr.date_naive() == now.date_naive() && lr >= today)
                .unwrap_or(false);
            if ran_today {
                return today + ChronoDuration::days(1);
            }
            return if today <= now { now } else { today };
        }
        // Unparseable schedule degrades to interval spacing.
    }

    match last_run {
        Some(lr) => {
            let due = lr + min_interval;
            if due <= now { now } else { due }
        }
        None => now,
    }
}

// ─── Status ───────────────────────────────────────────────────────────────────

/// Snapshot for the administrative surface.
#[derive(Clone, Debug, Serialize)]
pub struct SupervisorStatus {
    pub running:         bool,
    pub enabled:         bool,
    pub next_run:        Option<DateTime<Utc>>,
    pub last_run:        Option<DateTime<Utc>>,
    pub last_result:     Option<Value>,
    pub pending_targets: u64,
    pub active_sessions: u64,
    pub loaded_sessions: usize,
}

// ─── Supervisor ───────────────────────────────────────────────────────────────

enum Fired {
    Stop,
    Wake,
    Timeout,
}

struct Shared {
    store:    Arc<Store>,
    registry: Arc<Registry>,
    engine:   Arc<Engine>,
    config:   SupervisorConfig,
    stop:     watch::Sender<bool>,
    wake:     Notify,
    running:  AtomicBool,
}

pub struct Supervisor {
    shared: Arc<Shared>,
    task:   Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(
        store: Arc<Store>,
        registry: Arc<Registry>,
        engine: Arc<Engine>,
        config: SupervisorConfig,
    ) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                store,
                registry,
                engine,
                config,
                stop,
                wake:    Notify::new(),
                running: AtomicBool::new(false),
            }),
            task: Mutex::new(None),
        }
    }

    // ─── Lifecycle ────────────────────────────────────────────────────────

    /// Start the loop. Idempotent: a second start while the loop is alive
    /// is a no-op.
    pub async fn start(&self) {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            debug!("supervisor already running");
            return;
        }
        // A stale running marker from a crashed process must not survive.
        if let Err(e) = self.shared.store.clear_setting(KEY_RUNNING) {
            warn!(error = %e, "failed to clear stale running marker");
        }
        let _ = self.shared.stop.send(false);

        let shared = Arc::clone(&self.shared);
        *task = Some(tokio::spawn(async move { shared.run_loop().await }));
        info!("supervisor started");
    }

    /// Signal the loop to exit and wait for it, including any in-flight
    /// engine run.
    pub async fn stop(&self) {
        let _ = self.shared.stop.send(true);
        self.shared.wake.notify_one();
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "supervisor loop task failed");
            }
        }
        info!("supervisor stopped");
    }

    /// Request an immediate run: sets the forced-wakeup flag and interrupts
    /// the current wait.
    pub fn wake(&self) {
        if let Err(e) = settings::request_forced_wakeup(&self.shared.store) {
            warn!(error = %e, "failed to record forced wakeup");
        }
        self.shared.wake.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    // ─── Status ───────────────────────────────────────────────────────────

    pub async fn status(&self) -> Result<SupervisorStatus, CoreError> {
        let shared = &self.shared;
        let s = AutomationSettings::load(&shared.store)?;
        let last_run = settings::last_run(&shared.store)?;
        let stats = shared.store.stats()?;

        let next_run = if s.enabled
            && s.target_group_id.is_some()
            && stats.pending_targets > 0
        {
            let forced = shared.store.get_setting(KEY_FORCED_WAKEUP)?.is_some();
            let min = ChronoDuration::from_std(shared.config.min_run_interval)
                .unwrap_or_else(|_| ChronoDuration::seconds(300));
            Some(compute_next_run(
                s.daily_start_time.as_deref(),
                last_run,
                forced,
                min,
                Utc::now(),
            ))
        } else {
            None
        };

        Ok(SupervisorStatus {
            running: self.is_running(),
            enabled: s.enabled,
            next_run,
            last_run,
            last_result: shared.store.get_setting(settings::KEY_LAST_RESULT)?,
            pending_targets: stats.pending_targets,
            active_sessions: stats.active_sessions,
            loaded_sessions: shared.registry.loaded_user_count().await,
        })
    }
}

impl Shared {
    async fn run_loop(self: Arc<Self>) {
        // Stamp the loop start so a restart with pending work waits out the
        // regular spacing instead of firing an immediate catch-up run.
        if let Err(e) = settings::set_last_run(&self.store, Utc::now()) {
            warn!(error = %e, "failed to stamp loop start");
        }
        loop {
            if *self.stop.borrow() {
                break;
            }

            let s = match AutomationSettings::load(&self.store) {
                Ok(s)  => s,
                Err(e) => {
                    warn!(error = %e, "failed to read settings");
                    if matches!(self.wait(self.config.poll_interval).await, Fired::Stop) {
                        break;
                    }
                    continue;
                }
            };

            let pending = self.store.pending_target_count().unwrap_or(0);
            let Some(params) = RunParams::from_settings(&s) else {
                debug!("no target group configured");
                if matches!(self.wait(self.config.poll_interval).await, Fired::Stop) {
                    break;
                }
                continue;
            };
            if !s.enabled || pending == 0 {
                if matches!(self.wait(self.config.poll_interval).await, Fired::Stop) {
                    break;
                }
                continue;
            }

            let forced = settings::take_forced_wakeup(&self.store).unwrap_or(false);
            let last_run = settings::last_run(&self.store).unwrap_or(None);
            let min = ChronoDuration::from_std(self.config.min_run_interval)
                .unwrap_or_else(|_| ChronoDuration::seconds(300));
            let now = Utc::now();
            let next = compute_next_run(s.daily_start_time.as_deref(), last_run, forced, min, now);

            if next > now {
                let remaining = (next - now)
                    .to_std()
                    .unwrap_or(self.config.poll_interval)
                    .min(self.config.poll_interval);
                debug!(next_run = %next, "waiting for next eligible run");
                match self.wait(remaining).await {
                    Fired::Stop             => break,
                    Fired::Wake | Fired::Timeout => continue,
                }
            }

            self.execute_run(&params).await;
        }

        if let Err(e) = self.store.clear_setting(KEY_RUNNING) {
            warn!(error = %e, "failed to clear running marker on exit");
        }
        debug!("supervisor loop exited");
    }

    /// One engine invocation with start/finish markers. The run is spawned
    /// so a panic is caught at the join boundary instead of killing the
    /// loop; the running flag is cleared no matter how the run ends.
    async fn execute_run(&self, params: &RunParams) {
        let started = Utc::now();
        if let Err(e) = settings::set_last_run(&self.store, started) {
            warn!(error = %e, "failed to stamp run start");
        }
        if let Err(e) = self.store.set_setting(KEY_RUNNING, &json!(true)) {
            warn!(error = %e, "failed to set running marker");
        }
        self.running.store(true, Ordering::SeqCst);
        info!(group = params.group_id, "starting distribution run");

        let engine = Arc::clone(&self.engine);
        let params = params.clone();
        let handle = tokio::spawn(async move { engine.run(&params).await });
        let report: Option<RunReport> = match handle.await {
            Ok(report) => Some(report),
            Err(e) => {
                error!(error = %e, "distribution run panicked");
                let failure = json!({
                    "success": false,
                    "message": format!("run panicked: {e}"),
                });
                if let Err(e) = settings::set_last_result(&self.store, &failure) {
                    warn!(error = %e, "failed to persist panic result");
                }
                None
            }
        };

        self.running.store(false, Ordering::SeqCst);
        if let Err(e) = self.store.clear_setting(KEY_RUNNING) {
            warn!(error = %e, "failed to clear running marker");
        }
        if let Some(report) = report {
            info!(success = report.success, message = %report.message, "run recorded");
        }
    }

    /// Race stop, wake, and a timeout; stop takes priority.
    async fn wait(&self, duration: Duration) -> Fired {
        if *self.stop.borrow() {
            return Fired::Stop;
        }
        let mut stop_rx = self.stop.subscribe();
        tokio::select! {
            biased;
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() { Fired::Stop } else { Fired::Timeout }
            }
            _ = self.wake.notified() => Fired::Wake,
            _ = sleep(duration)      => Fired::Timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn forced_wake_runs_now() {
        let now = at(2025, 6, 1, 12, 0);
        let next = compute_next_run(Some("09:00"), None, true, ChronoDuration::minutes(5), now);
        assert_eq!(next, now);
    }

    #[test]
    fn daily_schedule_after_todays_run_moves_to_tomorrow() {
        let now = at(2025, 6, 1, 10, 0);
        let last = Some(at(2025, 6, 1, 9, 5));
        let next = compute_next_run(Some("09:00"), last, false, ChronoDuration::minutes(5), now);
        assert_eq!(next, at(2025, 6, 2, 9, 0));
    }

    #[test]
    fn daily_schedule_passed_without_run_fires_immediately() {
        let now = at(2025, 6, 1, 10, 0);
        let next = compute_next_run(Some("09:00"), None, false, ChronoDuration::minutes(5), now);
        assert_eq!(next, now);
    }

    #[test]
    fn daily_schedule_in_future_waits_for_it() {
        let now = at(2025, 6, 1, 8, 0);
        let last = Some(at(2025, 5, 31, 9, 1));
        let next = compute_next_run(Some("09:00"), last, false, ChronoDuration::minutes(5), now);
        assert_eq!(next, at(2025, 6, 1, 9, 0));
    }

    #[test]
    fn interval_spacing_waits_out_the_remainder() {
        let now = at(2025, 6, 1, 12, 2);
        let last = Some(at(2025, 6, 1, 12, 0));
        let next = compute_next_run(None, last, false, ChronoDuration::minutes(5), now);
        assert_eq!(next, at(2025, 6, 1, 12, 5));
    }

    #[test]
    fn interval_elapsed_runs_now() {
        let now = at(2025, 6, 1, 12, 10);
        let last = Some(at(2025, 6, 1, 12, 0));
        let next = compute_next_run(None, last, false, ChronoDuration::minutes(5), now);
        assert_eq!(next, now);
    }

    #[test]
    fn no_history_runs_now() {
        let now = at(2025, 6, 1, 12, 0);
        let next = compute_next_run(None, None, false, ChronoDuration::minutes(5), now);
        assert_eq!(next, now);
    }

    #[test]
    fn unparseable_schedule_falls_back_to_interval() {
        let now = at(2025, 6, 1, 12, 2);
        let last = Some(at(2025, 6, 1, 12, 0));
        let next = compute_next_run(Some("nine-ish"), last, false, ChronoDuration::minutes(5), now);
        assert_eq!(next, at(2025, 6, 1, 12, 5));
    }
}
