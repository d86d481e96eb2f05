//! Scheduler State Models
//!
//! Persisted snapshot used for crash recovery, plus the execution-history
//! ring and health classification types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Hard cap on the execution-history ring
pub const MAX_HISTORY_SIZE: usize = 100;

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SchedulerStarted,
    SchedulerStopped,
    SchedulerStartFailed,
    JobExecuted,
    JobFailed,
    JobSkipped,
    SignalReceived,
    HealthCheck,
    SchedulerRestarted,
    AutoRecoveryDisabled,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SchedulerStarted => "scheduler_started",
            Self::SchedulerStopped => "scheduler_stopped",
            Self::SchedulerStartFailed => "scheduler_start_failed",
            Self::JobExecuted => "job_executed",
            Self::JobFailed => "job_failed",
            Self::JobSkipped => "job_skipped",
            Self::SignalReceived => "signal_received",
            Self::HealthCheck => "health_check",
            Self::SchedulerRestarted => "scheduler_restarted",
            Self::AutoRecoveryDisabled => "auto_recovery_disabled",
        }
    }
}

/// One recorded scheduler event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub success: bool,
    pub message: String,
}

impl ExecutionEvent {
    pub fn now(event_type: EventType, success: bool, message: impl Into<String>) -> Self {
        Self { timestamp: Utc::now(), event_type, success, message: message.into() }
    }
}

// ============================================================================
// Health
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    #[default]
    Unknown,
    Healthy,
    Degraded,
    Warning,
    Critical,
}

impl HealthLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// One health-monitor observation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub overall: HealthLevel,
    /// Per-component readiness flags
    pub components: BTreeMap<String, bool>,
    pub last_check: Option<DateTime<Utc>>,
    pub failure_rate: f64,
}

impl HealthSnapshot {
    /// Classify overall health from the failure rate and component flags
    pub fn classify(failure_rate: f64, components: &BTreeMap<String, bool>) -> HealthLevel {
        if failure_rate > 0.5 {
            HealthLevel::Critical
        } else if failure_rate > 0.2 {
            HealthLevel::Warning
        } else if !components.is_empty() && components.values().all(|ok| *ok) {
            HealthLevel::Healthy
        } else {
            HealthLevel::Degraded
        }
    }
}

// ============================================================================
// Stats
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub last_execution_time: Option<DateTime<Utc>>,
    pub next_execution_time: Option<DateTime<Utc>>,
    pub uptime_start: Option<DateTime<Utc>>,
}

impl SchedulerStats {
    pub fn failure_rate(&self) -> f64 {
        self.failed_executions as f64 / (self.total_executions.max(1)) as f64
    }
}

// ============================================================================
// Persisted state
// ============================================================================

/// Snapshot written atomically on every monitor tick and significant event
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerState {
    pub is_running: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub process_id: u32,
    pub error_count: u32,
    pub last_error_time: Option<DateTime<Utc>>,
    pub execution_history: Vec<ExecutionEvent>,
    pub health_status: HealthSnapshot,
    pub stats: SchedulerStats,
    pub saved_at: Option<DateTime<Utc>>,
}

impl SchedulerState {
    /// Append an event, trimming the ring to its cap (oldest first)
    pub fn push_event(&mut self, event: ExecutionEvent) {
        self.execution_history.push(event);
        if self.execution_history.len() > MAX_HISTORY_SIZE {
            let excess = self.execution_history.len() - MAX_HISTORY_SIZE;
            self.execution_history.drain(0..excess);
        }
    }

    /// Count `scheduler_restarted` events in the last hour
    pub fn recent_restarts(&self, now: DateTime<Utc>) -> usize {
        self.execution_history
            .iter()
            .filter(|e| {
                e.event_type == EventType::SchedulerRestarted
                    && now.signed_duration_since(e.timestamp) < chrono::Duration::hours(1)
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_ring_never_exceeds_cap() {
        let mut state = SchedulerState::default();
        for i in 0..250 {
            state.push_event(ExecutionEvent::now(
                EventType::JobExecuted,
                true,
                format!("job {}", i),
            ));
            assert!(state.execution_history.len() <= MAX_HISTORY_SIZE);
        }
        assert_eq!(state.execution_history.len(), MAX_HISTORY_SIZE);
        // Oldest entries were discarded first
        assert_eq!(state.execution_history[0].message, "job 150");
    }

    #[test]
    fn health_classification_thresholds() {
        let mut components = BTreeMap::new();
        components.insert("scheduler".to_string(), true);
        components.insert("store".to_string(), true);

        assert_eq!(HealthSnapshot::classify(0.6, &components), HealthLevel::Critical);
        assert_eq!(HealthSnapshot::classify(0.3, &components), HealthLevel::Warning);
        assert_eq!(HealthSnapshot::classify(0.0, &components), HealthLevel::Healthy);

        components.insert("email".to_string(), false);
        assert_eq!(HealthSnapshot::classify(0.0, &components), HealthLevel::Degraded);
    }

    #[test]
    fn failure_rate_matches_crash_recovery_scenario() {
        let stats = SchedulerStats {
            total_executions: 160,
            successful_executions: 100,
            failed_executions: 60,
            ..Default::default()
        };
        assert!((stats.failure_rate() - 0.375).abs() < 1e-9);
    }

    #[test]
    fn state_round_trips_through_json() {
        let mut state = SchedulerState { is_running: true, process_id: 4242, ..Default::default() };
        state.push_event(ExecutionEvent::now(EventType::SchedulerStarted, true, "up"));
        let json = serde_json::to_string_pretty(&state).unwrap();
        let loaded: SchedulerState = serde_json::from_str(&json).unwrap();
        assert!(loaded.is_running);
        assert_eq!(loaded.process_id, 4242);
        assert_eq!(loaded.execution_history.len(), 1);
        assert_eq!(loaded.execution_history[0].event_type, EventType::SchedulerStarted);
    }
}
