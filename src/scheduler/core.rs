//! Minimal trigger engine
//!
//! A single tick loop drives every job: compute due jobs, coalesce
//! overlapping runs (max one instance per job), honor misfire grace,
//! and publish a JobEvent for every outcome to the lifecycle manager.

use chrono::{DateTime, Local};
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::trigger::{MisfireDecision, Trigger, misfire_decision};

/// Default misfire grace window (5 minutes)
pub const DEFAULT_MISFIRE_GRACE: Duration = Duration::from_secs(300);

/// Tick resolution of the scheduler loop
const TICK: Duration = Duration::from_millis(250);

/// How long a graceful stop waits for in-flight jobs
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Job actions
// ============================================================================

/// A schedulable unit of work
pub trait JobAction: Send + Sync + 'static {
    fn run(&self) -> Pin<Box<dyn Future<Output = Result<(), anyhow::Error>> + Send + '_>>;
}

/// Closures returning a future are job actions
impl<F, Fut> JobAction for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
{
    fn run(&self) -> Pin<Box<dyn Future<Output = Result<(), anyhow::Error>> + Send + '_>> {
        Box::pin((self)())
    }
}

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Success,
    Failed(String),
    /// Coalesced (previous run still active) or dropped past grace
    Skipped(String),
}

/// Published to the lifecycle manager after every job decision
#[derive(Debug, Clone)]
pub struct JobEvent {
    pub job_id: String,
    pub outcome: JobOutcome,
}

// ============================================================================
// Scheduler
// ============================================================================

struct JobEntry {
    id: String,
    name: String,
    trigger: Trigger,
    misfire_grace: Duration,
    action: Arc<dyn JobAction>,
    running: Arc<AtomicBool>,
    next_fire: DateTime<Local>,
}

/// Snapshot of one job for status displays
#[derive(Debug, Clone)]
pub struct JobInfo {
    pub id: String,
    pub name: String,
    pub trigger: String,
    pub next_fire: DateTime<Local>,
    pub running: bool,
}

/// Calendar/interval trigger engine with per-job single-instance
/// locking
pub struct Scheduler {
    jobs: Mutex<Vec<JobEntry>>,
    shutdown: AtomicBool,
    paused: AtomicBool,
    in_flight: Arc<AtomicUsize>,
    events: mpsc::UnboundedSender<JobEvent>,
}

impl Scheduler {
    pub fn new(events: mpsc::UnboundedSender<JobEvent>) -> Self {
        Self {
            jobs: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            in_flight: Arc::new(AtomicUsize::new(0)),
            events,
        }
    }

    /// Register a job. Duplicate ids replace the existing entry.
    pub fn add_job(
        &self,
        id: impl Into<String>,
        name: impl Into<String>,
        trigger: Trigger,
        misfire_grace: Duration,
        action: Arc<dyn JobAction>,
    ) {
        let id = id.into();
        let name = name.into();
        let entry = JobEntry {
            id: id.clone(),
            name: name.clone(),
            trigger,
            misfire_grace,
            action,
            running: Arc::new(AtomicBool::new(false)),
            next_fire: trigger.next_fire(Local::now()),
        };

        let mut jobs = self.jobs.lock().expect("scheduler lock");
        jobs.retain(|j| j.id != entry.id);
        jobs.push(entry);
        tracing::info!("Job registered: {} ({}) {}", name, id, trigger.describe());
    }

    pub fn job_count(&self) -> usize {
        self.jobs.lock().expect("scheduler lock").len()
    }

    /// Snapshot of all jobs for the dashboard and status command
    pub fn job_snapshots(&self) -> Vec<JobInfo> {
        self.jobs
            .lock()
            .expect("scheduler lock")
            .iter()
            .map(|j| JobInfo {
                id: j.id.clone(),
                name: j.name.clone(),
                trigger: j.trigger.describe(),
                next_fire: j.next_fire,
                running: j.running.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Earliest upcoming fire time across all jobs
    pub fn next_fire_time(&self) -> Option<DateTime<Local>> {
        self.jobs
            .lock()
            .expect("scheduler lock")
            .iter()
            .map(|j| j.next_fire)
            .min()
    }

    /// Paused schedulers keep their job list but fire nothing
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
        tracing::info!("Scheduler paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
        tracing::info!("Scheduler resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    /// Request a stop; `run` drains in-flight jobs before returning
    pub fn request_stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Re-arm after a stop: clear the shutdown flag and recompute every
    /// next-fire time. The job list is retained across restarts.
    pub fn reset_for_restart(&self) {
        let now = Local::now();
        {
            let mut jobs = self.jobs.lock().expect("scheduler lock");
            for job in jobs.iter_mut() {
                job.next_fire = job.trigger.next_fire(now);
            }
        }
        self.shutdown.store(false, Ordering::Relaxed);
        self.paused.store(false, Ordering::Relaxed);
        tracing::info!("Scheduler re-armed for restart");
    }

    pub fn is_stopping(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Run one job immediately, outside its schedule
    pub async fn run_job_once(&self, job_id: &str) -> bool {
        let action = {
            let jobs = self.jobs.lock().expect("scheduler lock");
            jobs.iter()
                .find(|j| j.id == job_id)
                .map(|j| Arc::clone(&j.action))
        };
        match action {
            Some(action) => {
                tracing::info!("Running job on demand: {}", job_id);
                let result = action.run().await;
                self.publish(job_id, match result {
                    Ok(()) => JobOutcome::Success,
                    Err(e) => JobOutcome::Failed(e.to_string()),
                });
                true
            },
            None => {
                tracing::error!("Unknown job: {}", job_id);
                false
            },
        }
    }

    /// Tick loop. Returns after `request_stop`, once in-flight jobs
    /// have drained (bounded by the join timeout).
    pub async fn run(self: Arc<Self>) {
        tracing::info!("Scheduler loop started ({} jobs)", self.job_count());

        while !self.shutdown.load(Ordering::Relaxed) {
            if !self.paused.load(Ordering::Relaxed) {
                self.fire_due_jobs();
            }
            tokio::time::sleep(TICK).await;
        }

        // Graceful drain
        let deadline = tokio::time::Instant::now() + STOP_JOIN_TIMEOUT;
        while self.in_flight.load(Ordering::Relaxed) > 0 {
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    "Stop timeout with {} jobs still in flight",
                    self.in_flight.load(Ordering::Relaxed)
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        tracing::info!("Scheduler loop stopped");
    }

    /// One pass over the job table: fire, coalesce, or drop each due
    /// entry
    fn fire_due_jobs(&self) {
        let now = Local::now();
        let mut due: Vec<(String, String, Arc<dyn JobAction>, Arc<AtomicBool>)> = Vec::new();

        {
            let mut jobs = self.jobs.lock().expect("scheduler lock");
            for job in jobs.iter_mut() {
                match misfire_decision(job.next_fire, now, job.misfire_grace) {
                    MisfireDecision::NotDue => {},
                    MisfireDecision::Drop => {
                        tracing::warn!(
                            "Job {} missed its {} fire beyond grace, dropping",
                            job.id,
                            job.next_fire.format("%H:%M:%S")
                        );
                        job.next_fire = job.trigger.next_fire(now);
                        self.publish(&job.id, JobOutcome::Skipped("misfire".to_string()));
                    },
                    MisfireDecision::Fire => {
                        job.next_fire = job.trigger.next_fire(now);
                        if job.running.load(Ordering::Relaxed) {
                            tracing::warn!("Job {} still running, coalescing this fire", job.id);
                            self.publish(
                                &job.id,
                                JobOutcome::Skipped("previous run still active".to_string()),
                            );
                        } else {
                            due.push((
                                job.id.clone(),
                                job.name.clone(),
                                Arc::clone(&job.action),
                                Arc::clone(&job.running),
                            ));
                        }
                    },
                }
            }
        }

        for (id, name, action, running) in due {
            running.store(true, Ordering::Relaxed);
            self.in_flight.fetch_add(1, Ordering::Relaxed);

            let in_flight = Arc::clone(&self.in_flight);
            let events = self.events.clone();
            tokio::spawn(async move {
                tracing::info!("=== Job started: {} ===", name);
                let outcome = match action.run().await {
                    Ok(()) => {
                        tracing::info!("=== Job finished: {} ===", name);
                        JobOutcome::Success
                    },
                    Err(e) => {
                        tracing::error!("=== Job failed: {}: {} ===", name, e);
                        JobOutcome::Failed(e.to_string())
                    },
                };
                running.store(false, Ordering::Relaxed);
                in_flight.fetch_sub(1, Ordering::Relaxed);
                let _ = events.send(JobEvent { job_id: id, outcome });
            });
        }
    }

    fn publish(&self, job_id: &str, outcome: JobOutcome) {
        let event = JobEvent { job_id: job_id.to_string(), outcome };
        if self.events.send(event).is_err() {
            tracing::debug!("Job event listener gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn counting_action(counter: Arc<AtomicU32>) -> Arc<dyn JobAction> {
        Arc::new(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::Relaxed);
                Ok::<(), anyhow::Error>(())
            }
        })
    }

    #[tokio::test]
    async fn interval_job_fires_repeatedly() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler = Arc::new(Scheduler::new(tx));
        let counter = Arc::new(AtomicU32::new(0));

        scheduler.add_job(
            "tick",
            "tick job",
            Trigger::Interval { every: Duration::from_millis(300) },
            DEFAULT_MISFIRE_GRACE,
            counting_action(Arc::clone(&counter)),
        );

        let handle = tokio::spawn(Arc::clone(&scheduler).run());
        tokio::time::sleep(Duration::from_millis(1100)).await;
        scheduler.request_stop();
        handle.await.unwrap();

        let runs = counter.load(Ordering::Relaxed);
        assert!(runs >= 2, "expected at least 2 runs, got {}", runs);

        let mut successes = 0;
        while let Ok(event) = rx.try_recv() {
            if event.outcome == JobOutcome::Success {
                successes += 1;
            }
        }
        assert_eq!(successes, runs);
    }

    #[tokio::test]
    async fn overlapping_fires_coalesce() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler = Arc::new(Scheduler::new(tx));
        let counter = Arc::new(AtomicU32::new(0));

        let slow_counter = Arc::clone(&counter);
        scheduler.add_job(
            "slow",
            "slow job",
            Trigger::Interval { every: Duration::from_millis(200) },
            DEFAULT_MISFIRE_GRACE,
            Arc::new(move || {
                let counter = Arc::clone(&slow_counter);
                async move {
                    counter.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(Duration::from_millis(700)).await;
                    Ok::<(), anyhow::Error>(())
                }
            }),
        );

        let handle = tokio::spawn(Arc::clone(&scheduler).run());
        tokio::time::sleep(Duration::from_millis(1200)).await;
        scheduler.request_stop();
        handle.await.unwrap();

        // The 700ms body spans multiple 200ms periods; overlapping
        // fires must be skipped, not run concurrently
        let runs = counter.load(Ordering::Relaxed);
        assert!(runs <= 2, "coalescing failed: {} concurrent-ish runs", runs);

        let mut skips = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event.outcome, JobOutcome::Skipped(_)) {
                skips += 1;
            }
        }
        assert!(skips >= 1, "expected at least one coalesced fire");
    }

    #[tokio::test]
    async fn failing_job_reports_failure_and_keeps_schedule() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler = Arc::new(Scheduler::new(tx));

        scheduler.add_job(
            "flaky",
            "flaky job",
            Trigger::Interval { every: Duration::from_millis(200) },
            DEFAULT_MISFIRE_GRACE,
            Arc::new(|| async { Err::<(), anyhow::Error>(anyhow::anyhow!("boom")) }),
        );

        let handle = tokio::spawn(Arc::clone(&scheduler).run());
        tokio::time::sleep(Duration::from_millis(700)).await;
        scheduler.request_stop();
        handle.await.unwrap();

        let mut failures = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event.outcome, JobOutcome::Failed(_)) {
                failures += 1;
            }
        }
        assert!(failures >= 2, "next invocation must be unaffected by failure");
    }

    #[tokio::test]
    async fn run_job_once_executes_on_demand() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler = Arc::new(Scheduler::new(tx));
        let counter = Arc::new(AtomicU32::new(0));

        scheduler.add_job(
            "manual",
            "manual job",
            Trigger::daily(3, 0),
            DEFAULT_MISFIRE_GRACE,
            counting_action(Arc::clone(&counter)),
        );

        assert!(scheduler.run_job_once("manual").await);
        assert!(!scheduler.run_job_once("missing").await);
        assert_eq!(counter.load(Ordering::Relaxed), 1);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.job_id, "manual");
        assert_eq!(event.outcome, JobOutcome::Success);
    }

    #[tokio::test]
    async fn paused_scheduler_fires_nothing() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let scheduler = Arc::new(Scheduler::new(tx));
        let counter = Arc::new(AtomicU32::new(0));

        scheduler.add_job(
            "paused",
            "paused job",
            Trigger::Interval { every: Duration::from_millis(100) },
            DEFAULT_MISFIRE_GRACE,
            counting_action(Arc::clone(&counter)),
        );

        scheduler.pause();
        let handle = tokio::spawn(Arc::clone(&scheduler).run());
        tokio::time::sleep(Duration::from_millis(500)).await;
        scheduler.request_stop();
        handle.await.unwrap();

        assert_eq!(counter.load(Ordering::Relaxed), 0);
        assert_eq!(scheduler.job_count(), 1);
    }
}
