//! Periodic maintenance: retention cleanup, reminder broadcast and store heartbeat.
//!
//! Each job runs in its own tokio task on its own interval. A tick never
//! overlaps a previous run of the same job, and every run is spawned as a
//! separate task so a failure or panic only affects that run.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::feedback::error::StorageError;
use crate::feedback::report::escape_html;
use crate::feedback::store::EventStore;
use crate::feedback::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Cleanup,
    Reminders,
    Heartbeat,
}

impl JobKind {
    pub const ALL: [JobKind; 3] = [JobKind::Cleanup, JobKind::Reminders, JobKind::Heartbeat];
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Cleanup => "cleanup",
            Self::Reminders => "reminders",
            Self::Heartbeat => "heartbeat",
        };
        f.write_str(name)
    }
}

/// Intervals and retention for the three jobs.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub cleanup_interval: StdDuration,
    pub reminder_check_interval: StdDuration,
    pub heartbeat_interval: StdDuration,
    /// Entries older than this are deleted by the cleanup job.
    pub retention: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cleanup_interval: StdDuration::from_secs(3600),
            reminder_check_interval: StdDuration::from_secs(60),
            heartbeat_interval: StdDuration::from_secs(600),
            retention: Duration::days(5),
        }
    }
}

impl SchedulerConfig {
    pub fn interval(&self, kind: JobKind) -> StdDuration {
        match kind {
            JobKind::Cleanup => self.cleanup_interval,
            JobKind::Reminders => self.reminder_check_interval,
            JobKind::Heartbeat => self.heartbeat_interval,
        }
    }
}

/// Bookkeeping for one job, reported by the health endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobStatus {
    pub interval_secs: u64,
    pub running: bool,
    pub runs: u64,
    pub failures: u64,
    pub last_started: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// How a single run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Number of rows deleted or reminders sent; 0 for the heartbeat.
    Completed(usize),
    Failed(String),
    /// The previous run of the same job had not finished.
    Skipped,
}

/// Delete entries older than the retention window. Returns the number removed.
pub fn cleanup(
    store: &EventStore,
    retention: Duration,
    now: DateTime<Utc>,
) -> Result<usize, StorageError> {
    let deleted = store.delete_older_than(now - retention)?;
    if deleted > 0 {
        info!("🧹 Cleanup: removed {} entries older than {} days", deleted, retention.num_days());
    }
    Ok(deleted)
}

/// Send every due reminder once and move it to its next occurrence.
///
/// The claim happens before the send, so concurrent ticks cannot deliver the
/// same occurrence twice. A failed send is logged and not retried.
pub async fn broadcast_reminders(
    store: &EventStore,
    transport: &dyn Transport,
    now: DateTime<Utc>,
) -> Result<usize, StorageError> {
    let due = store.due_reminders(now)?;
    if due.is_empty() {
        return Ok(0);
    }

    let mut sent = 0;
    for reminder in due {
        if !store.claim_reminder(&reminder, now)? {
            debug!("Reminder of group {} already claimed", reminder.group_id);
            continue;
        }

        let text = format!("⏰ Reminder: {}", escape_html(&reminder.text));
        match transport.send_text(reminder.group_id, &text, None).await {
            Ok(msg_id) => {
                sent += 1;
                info!("Sent reminder to group {} (msg {})", reminder.group_id, msg_id);
            }
            Err(e) => warn!("Failed to send reminder to group {}: {}", reminder.group_id, e),
        }
    }
    Ok(sent)
}

/// Owns the job intervals and their run history.
pub struct Scheduler {
    config: SchedulerConfig,
    store: Arc<EventStore>,
    transport: Arc<dyn Transport>,
    status: Mutex<BTreeMap<JobKind, JobStatus>>,
}

/// Running scheduler tasks.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Stop all loops, letting in-flight runs finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Scheduler task ended abnormally: {e}");
            }
        }
        info!("Scheduler stopped");
    }
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, store: Arc<EventStore>, transport: Arc<dyn Transport>) -> Self {
        let status = JobKind::ALL
            .into_iter()
            .map(|kind| {
                let status = JobStatus {
                    interval_secs: config.interval(kind).as_secs(),
                    ..JobStatus::default()
                };
                (kind, status)
            })
            .collect();
        Self { config, store, transport, status: Mutex::new(status) }
    }

    fn status_lock(&self) -> MutexGuard<'_, BTreeMap<JobKind, JobStatus>> {
        self.status.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Snapshot of every job's bookkeeping.
    pub fn status(&self) -> BTreeMap<JobKind, JobStatus> {
        self.status_lock().clone()
    }

    /// Spawn one loop per job.
    pub fn start(self: &Arc<Self>) -> SchedulerHandle {
        let (shutdown, rx) = watch::channel(false);
        let tasks = JobKind::ALL
            .into_iter()
            .map(|kind| tokio::spawn(Arc::clone(self).run_loop(kind, rx.clone())))
            .collect();
        info!(
            "Scheduler started (cleanup every {:?}, reminders every {:?}, heartbeat every {:?})",
            self.config.cleanup_interval,
            self.config.reminder_check_interval,
            self.config.heartbeat_interval
        );
        SchedulerHandle { shutdown, tasks }
    }

    async fn run_loop(self: Arc<Self>, kind: JobKind, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval(kind));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.run_once(kind, Utc::now()).await;
                }
            }
        }
        debug!("{} loop exited", kind);
    }

    /// Run one job now. Skips if the previous run of the same job is still going.
    pub async fn run_once(self: &Arc<Self>, kind: JobKind, now: DateTime<Utc>) -> JobOutcome {
        if !self.begin(kind, now) {
            debug!("{} still running, skipping tick", kind);
            return JobOutcome::Skipped;
        }

        let this = Arc::clone(self);
        let run = tokio::spawn(async move { this.execute(kind, now).await });

        let outcome = match run.await {
            Ok(Ok(count)) => JobOutcome::Completed(count),
            Ok(Err(e)) => {
                warn!("{} job failed: {}", kind, e);
                JobOutcome::Failed(e.to_string())
            }
            Err(e) => {
                error!("{} job aborted: {}", kind, e);
                JobOutcome::Failed(format!("aborted: {e}"))
            }
        };

        self.finish(kind, &outcome, Utc::now());
        outcome
    }

    async fn execute(&self, kind: JobKind, now: DateTime<Utc>) -> Result<usize, StorageError> {
        match kind {
            JobKind::Cleanup => cleanup(&self.store, self.config.retention, now),
            JobKind::Reminders => broadcast_reminders(&self.store, self.transport.as_ref(), now).await,
            JobKind::Heartbeat => {
                self.store.heartbeat()?;
                debug!("Store heartbeat OK");
                Ok(0)
            }
        }
    }

    fn begin(&self, kind: JobKind, now: DateTime<Utc>) -> bool {
        let mut status = self.status_lock();
        let job = status.entry(kind).or_default();
        if job.running {
            return false;
        }
        job.running = true;
        job.last_started = Some(now);
        true
    }

    fn finish(&self, kind: JobKind, outcome: &JobOutcome, finished_at: DateTime<Utc>) {
        let mut status = self.status_lock();
        let job = status.entry(kind).or_default();
        job.running = false;
        job.runs += 1;
        match outcome {
            JobOutcome::Completed(_) => {
                job.last_success = Some(finished_at);
                job.last_error = None;
            }
            JobOutcome::Failed(e) => {
                job.failures += 1;
                job.last_error = Some(e.clone());
            }
            JobOutcome::Skipped => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_intervals() {
        let config = SchedulerConfig::default();
        assert_eq!(config.interval(JobKind::Cleanup), StdDuration::from_secs(3600));
        assert_eq!(config.interval(JobKind::Reminders), StdDuration::from_secs(60));
        assert_eq!(config.interval(JobKind::Heartbeat), StdDuration::from_secs(600));
        assert_eq!(config.retention, Duration::days(5));
    }

    #[test]
    fn test_job_kind_display() {
        assert_eq!(JobKind::Cleanup.to_string(), "cleanup");
        assert_eq!(JobKind::Heartbeat.to_string(), "heartbeat");
    }

    #[tokio::test]
    async fn test_overlapping_run_is_skipped() {
        use crate::feedback::testing::FakeTransport;

        let store = Arc::new(EventStore::in_memory().unwrap());
        let scheduler = Arc::new(Scheduler::new(
            SchedulerConfig::default(),
            store,
            Arc::new(FakeTransport::default()),
        ));
        let now = Utc::now();

        assert!(scheduler.begin(JobKind::Cleanup, now));
        assert_eq!(scheduler.run_once(JobKind::Cleanup, now).await, JobOutcome::Skipped);
        assert_eq!(scheduler.status()[&JobKind::Cleanup].runs, 0);

        scheduler.finish(JobKind::Cleanup, &JobOutcome::Completed(0), now);
        assert_eq!(scheduler.run_once(JobKind::Cleanup, now).await, JobOutcome::Completed(0));
        assert_eq!(scheduler.status()[&JobKind::Cleanup].runs, 2);
    }
}
