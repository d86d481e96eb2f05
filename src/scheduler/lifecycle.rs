//! Lifecycle Manager - supervision, durable state, self-healing
//!
//! Owns the persisted SchedulerState: every job event and monitor tick
//! mutates it under one lock and writes it atomically to disk
//! (tmp-file + rename with a one-generation backup). A background
//! monitor classifies health from the failure rate and restarts the
//! scheduler when it goes critical, capped at three restarts per hour.

use chrono::Utc;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use super::core::{JobEvent, JobOutcome, Scheduler};
use crate::models::{
    EventType, ExecutionEvent, HealthLevel, HealthSnapshot, SchedulerState,
};

/// Wait between stop and start during an automatic restart
const RESTART_PAUSE: Duration = Duration::from_secs(2);

/// Restarts allowed per rolling hour before auto-recovery disables
/// itself
const MAX_RESTARTS_PER_HOUR: usize = 3;

/// Supervises the scheduler and persists its state
pub struct LifecycleManager {
    state: Mutex<SchedulerState>,
    state_file: PathBuf,
    scheduler: Arc<Scheduler>,
    monitor_interval: Duration,
    component_flags: BTreeMap<String, bool>,
    shutdown: AtomicBool,
}

impl LifecycleManager {
    pub fn new(
        scheduler: Arc<Scheduler>,
        state_file: impl Into<PathBuf>,
        monitor_interval: Duration,
        component_flags: BTreeMap<String, bool>,
    ) -> Self {
        Self {
            state: Mutex::new(SchedulerState::default()),
            state_file: state_file.into(),
            scheduler,
            monitor_interval,
            component_flags,
            shutdown: AtomicBool::new(false),
        }
    }

    // ========================================================================
    // State persistence
    // ========================================================================

    /// Restore the previous generation's counters and history, if any
    pub fn restore_previous_state(&self) {
        let Some(previous) = load_state_file(&self.state_file) else {
            tracing::info!("No previous scheduler state, starting fresh");
            return;
        };

        let mut state = self.state.lock().expect("state lock");
        state.error_count = previous.error_count;
        state.last_error_time = previous.last_error_time;
        state.execution_history = previous.execution_history;
        state.health_status = previous.health_status;
        state.stats = previous.stats;
        tracing::info!(
            "Previous scheduler state restored ({} events, {} executions)",
            state.execution_history.len(),
            state.stats.total_executions
        );
    }

    /// Atomically persist the current state: write the tmp file, move
    /// the current file to .backup, rename tmp into place.
    pub fn save_state(&self) {
        let snapshot = {
            let mut state = self.state.lock().expect("state lock");
            state.process_id = std::process::id();
            state.saved_at = Some(Utc::now());
            state.clone()
        };

        if let Err(e) = write_state_atomically(&self.state_file, &snapshot) {
            tracing::error!("Failed to persist scheduler state: {}", e);
        }
    }

    /// Copy of the current state (readers never hold the lock)
    pub fn state_snapshot(&self) -> SchedulerState {
        self.state.lock().expect("state lock").clone()
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Record one event in the bounded history and persist
    pub fn record_event(&self, event_type: EventType, success: bool, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!("Event recorded: {} - {}", event_type.as_str(), message);
        {
            let mut state = self.state.lock().expect("state lock");
            state.push_event(ExecutionEvent::now(event_type, success, message));
            if !success {
                state.error_count += 1;
                state.last_error_time = Some(Utc::now());
            }
        }
        self.save_state();
    }

    pub fn mark_started(&self) {
        {
            let mut state = self.state.lock().expect("state lock");
            state.is_running = true;
            let now = Utc::now();
            state.start_time = Some(now);
            state.stats.uptime_start = Some(now);
        }
        self.record_event(EventType::SchedulerStarted, true, "调度器启动成功");
    }

    pub fn mark_stopped(&self) {
        {
            let mut state = self.state.lock().expect("state lock");
            state.is_running = false;
        }
        self.record_event(EventType::SchedulerStopped, true, "调度器正常停止");
    }

    /// Drain job events from the scheduler into stats and history.
    /// Runs until the sender side closes.
    pub async fn run_event_loop(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<JobEvent>) {
        while let Some(event) = events.recv().await {
            match event.outcome {
                JobOutcome::Success => {
                    {
                        let mut state = self.state.lock().expect("state lock");
                        state.stats.total_executions += 1;
                        state.stats.successful_executions += 1;
                        state.stats.last_execution_time = Some(Utc::now());
                    }
                    self.record_event(
                        EventType::JobExecuted,
                        true,
                        format!("任务 {} 执行成功", event.job_id),
                    );
                },
                JobOutcome::Failed(error) => {
                    {
                        let mut state = self.state.lock().expect("state lock");
                        state.stats.total_executions += 1;
                        state.stats.failed_executions += 1;
                        state.stats.last_execution_time = Some(Utc::now());
                    }
                    self.record_event(
                        EventType::JobFailed,
                        false,
                        format!("任务 {} 执行失败: {}", event.job_id, error),
                    );
                },
                JobOutcome::Skipped(reason) => {
                    self.record_event(
                        EventType::JobSkipped,
                        true,
                        format!("任务 {} 跳过: {}", event.job_id, reason),
                    );
                },
            }
        }
        tracing::debug!("Job event channel closed");
    }

    // ========================================================================
    // Health monitoring and auto-recovery
    // ========================================================================

    /// One health observation: classify, record, persist
    pub fn check_health(&self) -> HealthLevel {
        let mut components = self.component_flags.clone();
        components.insert(
            "scheduler".to_string(),
            self.state.lock().expect("state lock").is_running && !self.scheduler.is_stopping(),
        );

        let (failure_rate, overall) = {
            let mut state = self.state.lock().expect("state lock");
            let failure_rate = state.stats.failure_rate();
            let overall = HealthSnapshot::classify(failure_rate, &components);
            state.health_status = HealthSnapshot {
                overall,
                components,
                last_check: Some(Utc::now()),
                failure_rate,
            };
            state.stats.next_execution_time = self
                .scheduler
                .next_fire_time()
                .map(|dt| dt.with_timezone(&Utc));
            (failure_rate, overall)
        };

        if overall != HealthLevel::Healthy {
            self.record_event(
                EventType::HealthCheck,
                false,
                format!("健康状态: {}, 失败率: {:.1}%", overall.as_str(), failure_rate * 100.0),
            );
        }

        tracing::debug!("Health check: {} (failure rate {:.3})", overall.as_str(), failure_rate);
        overall
    }

    /// Monitor loop: health check, auto-recovery, state persistence.
    /// Sleeps in short slices so shutdown is noticed promptly.
    pub async fn run_monitor_loop(self: Arc<Self>) {
        tracing::info!("Health monitor started (interval {:?})", self.monitor_interval);

        let slice = Duration::from_millis(500);
        let mut waited = Duration::ZERO;

        while !self.shutdown.load(Ordering::Relaxed) {
            tokio::time::sleep(slice).await;
            waited += slice;
            if waited < self.monitor_interval {
                continue;
            }
            waited = Duration::ZERO;

            let overall = self.check_health();
            if overall == HealthLevel::Critical {
                self.attempt_recovery().await;
            }

            self.save_state();
        }

        tracing::info!("Health monitor stopped");
    }

    /// Restart the scheduler when critical, unless the hourly restart
    /// budget is spent.
    async fn attempt_recovery(&self) {
        let recent = self
            .state
            .lock()
            .expect("state lock")
            .recent_restarts(Utc::now());

        if recent >= MAX_RESTARTS_PER_HOUR {
            tracing::error!("Restart budget exhausted ({}/h), auto-recovery disabled", recent);
            self.record_event(EventType::AutoRecoveryDisabled, false, "重启次数超限");
            return;
        }

        tracing::warn!("Critical health detected, restarting scheduler");
        self.scheduler.request_stop();
        tokio::time::sleep(RESTART_PAUSE).await;
        self.scheduler.reset_for_restart();
        tokio::spawn(Arc::clone(&self.scheduler).run());

        self.record_event(EventType::SchedulerRestarted, true, "自动恢复重启");
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Graceful shutdown path shared by signals and normal exit
    pub fn initiate_shutdown(&self, reason: &str) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.record_event(EventType::SignalReceived, true, reason.to_string());
        {
            let mut state = self.state.lock().expect("state lock");
            state.is_running = false;
        }
        self.save_state();
        self.scheduler.request_stop();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Resolve when SIGINT or SIGTERM arrives
    pub async fn wait_for_signal() -> &'static str {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            let mut sigterm =
                signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => "SIGINT",
                _ = sigterm.recv() => "SIGTERM",
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            "SIGINT"
        }
    }
}

// ============================================================================
// State file I/O
// ============================================================================

fn write_state_atomically(path: &Path, state: &SchedulerState) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let json = serde_json::to_string_pretty(state)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, json)?;

    if path.exists() {
        let backup_path = path.with_extension("json.backup");
        if backup_path.exists() {
            std::fs::remove_file(&backup_path)?;
        }
        std::fs::rename(path, &backup_path)?;
    }

    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Read the state file; a corrupt or missing main file falls back to
/// the previous generation.
pub fn load_state_file(path: &Path) -> Option<SchedulerState> {
    match try_read_state(path) {
        Some(state) => Some(state),
        None => {
            let backup_path = path.with_extension("json.backup");
            let state = try_read_state(&backup_path);
            if state.is_some() {
                tracing::warn!("Main state file unusable, loaded backup generation");
            }
            state
        },
    }
}

fn try_read_state(path: &Path) -> Option<SchedulerState> {
    let content = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(state) => Some(state),
        Err(e) => {
            tracing::warn!("State file {} corrupt: {}", path.display(), e);
            None
        },
    }
}
