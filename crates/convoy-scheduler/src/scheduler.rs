//! Schedule runner
//!
//! Each tick walks the minutes since the previous tick (bounded by the
//! catch-up window) and fires every enabled entry whose expression matches.
//! A fired (entry, expression, minute) triple is remembered, so duplicate or
//! overlapping ticks never fire the same occurrence twice.

use crate::error::{Result, ScheduleError};
use crate::expression::ScheduleExpression;
use async_trait::async_trait;
use chrono::{DateTime, DurationRound, Utc};
use convoy_types::{
    ControlPlaneContext, ConvoyEvent, ConvoyEventEnvelope, EventSource, ScheduleEntry,
    ScheduleEntryId,
};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Executes the target of a schedule entry
#[async_trait]
pub trait ScheduleDispatcher: Send + Sync {
    async fn dispatch(&self, entry: &ScheduleEntry, minute: DateTime<Utc>) -> Result<()>;
}

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(with = "convoy_types::duration_serde")]
    pub tick_interval: Duration,
    /// How far back a late tick still fires missed minutes
    #[serde(with = "convoy_types::duration_serde")]
    pub catch_up_window: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            catch_up_window: Duration::from_secs(60 * 60),
        }
    }
}

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub fired: Vec<(ScheduleEntryId, DateTime<Utc>)>,
    pub failed: Vec<(ScheduleEntryId, DateTime<Utc>, String)>,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        self.fired.is_empty() && self.failed.is_empty()
    }
}

struct CompiledEntry {
    entry: ScheduleEntry,
    expression: ScheduleExpression,
}

/// Fires schedule entries through a dispatcher
pub struct Scheduler {
    entries: DashMap<ScheduleEntryId, CompiledEntry>,
    fired: DashSet<(ScheduleEntryId, String, i64)>,
    last_tick: Mutex<Option<DateTime<Utc>>>,
    dispatcher: Arc<dyn ScheduleDispatcher>,
    config: SchedulerConfig,
    event_tx: broadcast::Sender<ConvoyEventEnvelope>,
    context: ControlPlaneContext,
}

impl Scheduler {
    pub fn new(
        dispatcher: Arc<dyn ScheduleDispatcher>,
        config: SchedulerConfig,
        event_tx: broadcast::Sender<ConvoyEventEnvelope>,
        context: ControlPlaneContext,
    ) -> Self {
        Self {
            entries: DashMap::new(),
            fired: DashSet::new(),
            last_tick: Mutex::new(None),
            dispatcher,
            config,
            event_tx,
            context,
        }
    }

    /// Add or replace an entry
    pub fn add(&self, entry: ScheduleEntry) -> Result<()> {
        let expression = ScheduleExpression::parse(&entry.expression)?;
        debug!(entry_id = %entry.id, expression = %entry.expression, "Schedule entry added");
        self.entries
            .insert(entry.id.clone(), CompiledEntry { entry, expression });
        Ok(())
    }

    pub fn remove(&self, id: &ScheduleEntryId) -> Result<ScheduleEntry> {
        self.entries
            .remove(id)
            .map(|(_, compiled)| compiled.entry)
            .ok_or_else(|| ScheduleError::EntryNotFound(id.clone()))
    }

    pub fn set_enabled(&self, id: &ScheduleEntryId, enabled: bool) -> Result<()> {
        let mut compiled = self
            .entries
            .get_mut(id)
            .ok_or_else(|| ScheduleError::EntryNotFound(id.clone()))?;
        compiled.entry.enabled = enabled;
        Ok(())
    }

    pub fn entries(&self) -> Vec<ScheduleEntry> {
        self.entries.iter().map(|e| e.entry.clone()).collect()
    }

    /// Fire everything due up to and including the minute containing `now`
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let current = floor_minute(now);
        let window = chrono::Duration::from_std(self.config.catch_up_window)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let earliest = current - window + chrono::Duration::minutes(1);

        let start = {
            let mut last = self.last_tick.lock().unwrap_or_else(|e| e.into_inner());
            let start = match *last {
                Some(previous) => previous + chrono::Duration::minutes(1),
                None => current,
            };
            if last.map_or(true, |previous| current > previous) {
                *last = Some(current);
            }
            start.max(earliest)
        };

        let mut report = TickReport::default();
        let mut minute = start;
        while minute <= current {
            self.fire_minute(minute, &mut report).await;
            minute += chrono::Duration::minutes(1);
        }

        self.prune(earliest);
        report
    }

    async fn fire_minute(&self, minute: DateTime<Utc>, report: &mut TickReport) {
        let due: Vec<ScheduleEntry> = self
            .entries
            .iter()
            .filter(|e| e.entry.enabled && e.expression.matches(minute))
            .map(|e| e.entry.clone())
            .collect();

        for entry in due {
            let occurrence = (
                entry.id.clone(),
                entry.expression.clone(),
                minute.timestamp(),
            );
            if !self.fired.insert(occurrence) {
                debug!(entry_id = %entry.id, %minute, "Occurrence already fired");
                continue;
            }

            match self.dispatcher.dispatch(&entry, minute).await {
                Ok(()) => {
                    info!(entry_id = %entry.id, %minute, "Schedule fired");
                    self.emit_event(ConvoyEvent::ScheduleFired {
                        entry_id: entry.id.clone(),
                        minute,
                    });
                    report.fired.push((entry.id, minute));
                }
                Err(e) => {
                    warn!(entry_id = %entry.id, %minute, error = %e, "Schedule dispatch failed");
                    self.emit_event(ConvoyEvent::ScheduleDispatchFailed {
                        entry_id: entry.id.clone(),
                        minute,
                        reason: e.to_string(),
                    });
                    report.failed.push((entry.id, minute, e.to_string()));
                }
            }
        }
    }

    fn prune(&self, earliest: DateTime<Utc>) {
        let cutoff = earliest.timestamp();
        self.fired.retain(|(_, _, minute)| *minute >= cutoff);
    }

    /// Tick every `tick_interval` until `shutdown` is cancelled
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(entries = self.entries.len(), "Scheduler started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.tick(Utc::now()).await;
                    if !report.is_empty() {
                        debug!(fired = report.fired.len(), failed = report.failed.len(), "Scheduler tick");
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }

        info!("Scheduler stopped");
    }

    fn emit_event(&self, event: ConvoyEvent) {
        let envelope = ConvoyEventEnvelope::new(event, EventSource::Scheduler, &self.context);
        let _ = self.event_tx.send(envelope);
    }
}

fn floor_minute(at: DateTime<Utc>) -> DateTime<Utc> {
    at.duration_trunc(chrono::Duration::minutes(1)).unwrap_or(at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use convoy_types::{BatchRun, ClusterId, ScheduleTarget, TaskSpec};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ScheduleDispatcher for Counting {
        async fn dispatch(&self, _entry: &ScheduleEntry, _minute: DateTime<Utc>) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ScheduleError::Dispatch("cluster unreachable".into()));
            }
            Ok(())
        }
    }

    fn scan(expression: &str) -> ScheduleEntry {
        ScheduleEntry::new(
            "image-scan",
            expression,
            ScheduleTarget::RunTask(BatchRun {
                cluster: ClusterId::new("batch"),
                job_name: "image-scan".into(),
                task: TaskSpec::new("scan"),
                count: 1,
                attempts: 1,
            }),
        )
    }

    fn scheduler(dispatcher: Arc<Counting>) -> Scheduler {
        let (tx, _) = broadcast::channel(16);
        Scheduler::new(dispatcher, SchedulerConfig::default(), tx, ControlPlaneContext::default())
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, h, m, s).unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_ticks_fire_once() {
        let dispatcher = Arc::new(Counting::default());
        let scheduler = scheduler(dispatcher.clone());
        scheduler.add(scan("cron(0 3 * * ? *)")).unwrap();

        let first = scheduler.tick(at(3, 0, 5)).await;
        let second = scheduler.tick(at(3, 0, 40)).await;

        assert_eq!(first.fired.len(), 1);
        assert!(second.is_empty());
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_late_tick_catches_up() {
        let dispatcher = Arc::new(Counting::default());
        let scheduler = scheduler(dispatcher.clone());
        scheduler.add(scan("*/10 * * * *")).unwrap();

        scheduler.tick(at(3, 1, 0)).await;
        let report = scheduler.tick(at(3, 35, 0)).await;

        let minutes: Vec<u32> = report
            .fired
            .iter()
            .map(|(_, m)| chrono::Timelike::minute(m))
            .collect();
        assert_eq!(minutes, vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn test_catch_up_is_bounded() {
        let dispatcher = Arc::new(Counting::default());
        let scheduler = scheduler(dispatcher.clone());
        scheduler.add(scan("rate(1 minute)")).unwrap();

        scheduler.tick(at(1, 0, 0)).await;
        let report = scheduler.tick(at(4, 0, 0)).await;
        assert_eq!(report.fired.len(), 60);
    }

    #[tokio::test]
    async fn test_failed_dispatch_is_reported_not_retried() {
        let dispatcher = Arc::new(Counting {
            fail: true,
            ..Counting::default()
        });
        let scheduler = scheduler(dispatcher.clone());
        scheduler.add(scan("rate(5 minutes)")).unwrap();

        let report = scheduler.tick(at(3, 5, 0)).await;
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].2.contains("unreachable"));

        scheduler.tick(at(3, 5, 30)).await;
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disabled_and_removed_entries() {
        let dispatcher = Arc::new(Counting::default());
        let scheduler = scheduler(dispatcher.clone());
        scheduler.add(scan("rate(1 minute)").disabled()).unwrap();

        assert!(scheduler.tick(at(3, 0, 0)).await.is_empty());

        let id = ScheduleEntryId::new("image-scan");
        scheduler.set_enabled(&id, true).unwrap();
        assert_eq!(scheduler.tick(at(3, 1, 0)).await.fired.len(), 1);

        scheduler.remove(&id).unwrap();
        assert!(scheduler.tick(at(3, 2, 0)).await.is_empty());
        assert!(matches!(
            scheduler.remove(&id),
            Err(ScheduleError::EntryNotFound(_))
        ));
    }

    #[test]
    fn test_invalid_expression_is_rejected() {
        let scheduler = scheduler(Arc::new(Counting::default()));
        assert!(matches!(
            scheduler.add(scan("rate(3 fortnights)")),
            Err(ScheduleError::InvalidExpression { .. })
        ));
        assert!(scheduler.entries().is_empty());
    }
}
