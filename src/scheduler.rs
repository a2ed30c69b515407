//! Triggers for update cycles: a fixed interval, a daily wall-clock time,
//! debounced file-system changes, and manual requests.
//!
//! Every trigger feeds one queue drained by a single worker loop, so at most
//! one cycle runs at a time. The queue holds a single pending trigger; a
//! trigger arriving while another is already pending is dropped, since the
//! pending cycle will scan the whole knowledge base anyway.

use anyhow::Result;
use chrono::{DateTime, Local, NaiveTime, TimeZone};
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::models::{UpdateResult, UpdateStatus};
use crate::updater::IncrementalUpdater;
use crate::watcher::{run_debounced, FileWatcher, PendingBatch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateTrigger {
    Scheduled,
    FileWatch,
    Manual,
}

/// Counters kept for the lifetime of a scheduler.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    pub start_time: Option<DateTime<Local>>,
    pub scheduled_updates: u64,
    pub file_watch_updates: u64,
    pub manual_updates: u64,
    pub failed_updates: u64,
    pub last_scheduled_update: Option<DateTime<Local>>,
    pub last_file_watch_update: Option<DateTime<Local>>,
    pub last_manual_update: Option<DateTime<Local>>,
}

impl SchedulerStats {
    fn record(&mut self, trigger: UpdateTrigger, result: &UpdateResult) {
        let now = Some(Local::now());
        match trigger {
            UpdateTrigger::Scheduled => {
                self.scheduled_updates += 1;
                self.last_scheduled_update = now;
            }
            UpdateTrigger::FileWatch => {
                self.file_watch_updates += 1;
                self.last_file_watch_update = now;
            }
            UpdateTrigger::Manual => {
                self.manual_updates += 1;
                self.last_manual_update = now;
            }
        }
        if result.status == UpdateStatus::Error {
            self.failed_updates += 1;
        }
    }
}

pub struct UpdateScheduler {
    updater: Arc<IncrementalUpdater>,
    config: SchedulerConfig,
    stats: Mutex<SchedulerStats>,
}

impl UpdateScheduler {
    pub fn new(updater: Arc<IncrementalUpdater>, config: SchedulerConfig) -> Self {
        Self {
            updater,
            config,
            stats: Mutex::new(SchedulerStats::default()),
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Run one cycle on behalf of `trigger` and record it.
    pub async fn trigger(&self, trigger: UpdateTrigger, force_rebuild: bool) -> UpdateResult {
        info!(?trigger, force_rebuild, "update triggered");
        let result = self.updater.incremental_update(force_rebuild).await;

        match result.status {
            UpdateStatus::Success => info!(
                ?trigger,
                added = result.changes.added,
                modified = result.changes.modified,
                deleted = result.changes.deleted,
                duration_secs = result.duration,
                "update succeeded"
            ),
            UpdateStatus::NoChanges => info!(?trigger, "no changes"),
            UpdateStatus::Error => warn!(
                ?trigger,
                error = result.error.as_deref().unwrap_or("unknown"),
                "update failed"
            ),
        }

        self.stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record(trigger, &result);
        result
    }

    pub async fn manual_update(&self, force_rebuild: bool) -> UpdateResult {
        self.trigger(UpdateTrigger::Manual, force_rebuild).await
    }

    /// Start every configured trigger and process them until `shutdown`
    /// resolves. A cycle already running when shutdown arrives completes first.
    pub async fn run<S>(&self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).start_time = Some(Local::now());

        let (tx, mut rx) = mpsc::channel::<UpdateTrigger>(1);
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        let scheduled = &self.config.scheduled_update;
        if scheduled.enabled {
            if let Some(period) = scheduled.interval() {
                info!(every_hours = scheduled.interval_hours, "interval updates enabled");
                tasks.push(spawn_interval_trigger(period, tx.clone()));
            }
            if let Some(at) = scheduled.daily_time()? {
                info!(at = %at.format("%H:%M"), "daily update enabled");
                tasks.push(spawn_daily_trigger(at, tx.clone()));
            }
        }

        let _watcher = if self.config.file_watch.enabled {
            let (event_tx, event_rx) = mpsc::unbounded_channel();
            let watcher = FileWatcher::start(&self.updater.settings().knowledge_base, event_tx)?;
            let trigger_tx = tx.clone();
            tasks.push(tokio::spawn(run_debounced(
                event_rx,
                self.config.file_watch.debounce(),
                move |batch: PendingBatch| {
                    debug!(files = batch.paths().len(), "debounced file changes");
                    offer(&trigger_tx, UpdateTrigger::FileWatch);
                    std::future::ready(())
                },
            )));
            Some(watcher)
        } else {
            None
        };
        drop(tx);

        info!("scheduler running; press Ctrl+C to stop");
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                trigger = rx.recv() => match trigger {
                    Some(trigger) => {
                        self.trigger(trigger, false).await;
                    }
                    None => {
                        warn!("no update triggers are enabled; waiting for shutdown");
                        (&mut shutdown).await;
                        break;
                    }
                },
            }
        }

        info!("scheduler stopping");
        for task in tasks {
            task.abort();
        }
        self.log_stats();
        Ok(())
    }

    pub fn log_stats(&self) {
        let stats = self.stats();
        info!(
            scheduled = stats.scheduled_updates,
            file_watch = stats.file_watch_updates,
            manual = stats.manual_updates,
            failed = stats.failed_updates,
            "scheduler statistics"
        );
        if let Some(start) = stats.start_time {
            let uptime = Local::now() - start;
            info!(uptime_secs = uptime.num_seconds(), "scheduler uptime");
        }
    }
}

/// Queue `trigger` unless one is already pending.
fn offer(tx: &mpsc::Sender<UpdateTrigger>, trigger: UpdateTrigger) {
    match tx.try_send(trigger) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            debug!(?trigger, "update already pending; trigger coalesced");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {}
    }
}

pub(crate) fn spawn_interval_trigger(
    period: Duration,
    tx: mpsc::Sender<UpdateTrigger>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if tx.is_closed() {
                return;
            }
            offer(&tx, UpdateTrigger::Scheduled);
        }
    })
}

pub(crate) fn spawn_daily_trigger(at: NaiveTime, tx: mpsc::Sender<UpdateTrigger>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let now = Local::now();
            let next = next_daily_run(&now, at);
            let wait = (next.clone() - now).to_std().unwrap_or(Duration::ZERO);
            debug!(next = %next, "next daily update");
            tokio::time::sleep(wait).await;
            if tx.is_closed() {
                return;
            }
            offer(&tx, UpdateTrigger::Scheduled);
        }
    })
}

/// The first occurrence of wall-clock `at` strictly after `now`, in `now`'s zone.
///
/// If `at` does not exist on that day (a DST gap), the next day is used.
pub fn next_daily_run<Tz: TimeZone>(now: &DateTime<Tz>, at: NaiveTime) -> DateTime<Tz> {
    let tz = now.timezone();
    let mut day = now.date_naive();
    for _ in 0..3 {
        if let Some(candidate) = tz.from_local_datetime(&day.and_time(at)).earliest() {
            if candidate > *now {
                return candidate;
            }
        }
        day = day.succ_opt().unwrap_or(day);
    }
    now.clone() + chrono::Duration::days(1)
}
