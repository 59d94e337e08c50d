//! Leader-gated usage sampling.
//!
//! While this process leads, every tick stamps one simulated minute and
//! records the number of leased instances for every (zone, site) the
//! directory knows about.

use crate::core::{LeaseError, Result, SiteId, ZoneId, format_timestamp, now_minute};
use crate::directory::ZoneDirectory;
use crate::leader::LeaderGate;
use crate::usage::{AppendOutcome, UsageRecorder};
use chrono::{NaiveDateTime, TimeDelta};
use futures::stream::{self, StreamExt};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_RECORD_CONCURRENCY: usize = 16;

const MILLIS_PER_MINUTE: u64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Simulated minutes per real minute.
    pub acceleration_ratio: NonZeroU32,
    /// Per-site recordings allowed in flight during one tick.
    pub max_concurrency: usize,
}

impl SchedulerConfig {
    pub fn new(acceleration_ratio: NonZeroU32) -> Self {
        Self {
            acceleration_ratio,
            max_concurrency: DEFAULT_RECORD_CONCURRENCY,
        }
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    /// Real time between ticks: `60000 / acceleration_ratio` ms, never zero.
    pub fn tick_interval(&self) -> Duration {
        let millis = MILLIS_PER_MINUTE / u64::from(self.acceleration_ratio.get());
        Duration::from_millis(millis.max(1))
    }
}

/// Minute-resolution simulated time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualClock {
    current: NaiveDateTime,
}

impl VirtualClock {
    /// Start at `now`, or at the newest recorded timestamp if history is
    /// already ahead of the wall clock.
    pub fn seeded(now: NaiveDateTime, latest_recorded: Option<NaiveDateTime>) -> Self {
        let current = match latest_recorded {
            Some(latest) if latest > now => latest,
            _ => now,
        };
        Self { current }
    }

    pub fn current(&self) -> NaiveDateTime {
        self.current
    }

    /// Step one simulated minute and return the new time.
    pub fn advance(&mut self) -> NaiveDateTime {
        self.current += TimeDelta::minutes(1);
        self.current
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Leading,
}

/// Summary of one tick's fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub timestamp: NaiveDateTime,
    pub sites: usize,
    pub recorded: usize,
    pub already_recorded: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl TickReport {
    fn empty(timestamp: NaiveDateTime) -> Self {
        Self {
            timestamp,
            sites: 0,
            recorded: 0,
            already_recorded: 0,
            skipped: 0,
            failed: 0,
        }
    }
}

enum SiteOutcome {
    Recorded(AppendOutcome),
    Skipped,
    Failed,
}

pub struct PeriodicScheduler {
    directory: ZoneDirectory,
    recorder: UsageRecorder,
    config: SchedulerConfig,
    state: watch::Sender<SchedulerState>,
    running: AtomicBool,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl PeriodicScheduler {
    pub fn new(directory: ZoneDirectory, recorder: UsageRecorder, config: SchedulerConfig) -> Self {
        let (state, _) = watch::channel(SchedulerState::Idle);
        Self {
            directory,
            recorder,
            config,
            state,
            running: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    /// Follow `gate` until `shutdown` fires: lead while leadership is held,
    /// idle otherwise.
    ///
    /// Only one `run` may be active per scheduler. Returns
    /// `LeadershipClosed` if the gate goes away.
    pub async fn run(&self, gate: &dyn LeaderGate, shutdown: CancellationToken) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(LeaseError::AlreadyRunning);
        }
        let _running = RunningGuard(&self.running);
        let mut leadership = gate.subscribe();
        info!(identity = %gate.identity(), interval = ?self.config.tick_interval(), "Scheduler started");

        loop {
            // Idle until granted.
            while !*leadership.borrow_and_update() {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Scheduler stopped");
                        return Ok(());
                    }
                    changed = leadership.changed() => {
                        if changed.is_err() {
                            return Err(LeaseError::LeadershipClosed);
                        }
                    }
                }
            }

            let term = shutdown.child_token();
            self.state.send_replace(SchedulerState::Leading);
            info!(identity = %gate.identity(), "Leading");

            let lead = self.lead(term.clone());
            tokio::pin!(lead);
            let gate_closed = tokio::select! {
                _ = &mut lead => false,
                closed = wait_for_loss(&mut leadership) => {
                    term.cancel();
                    lead.await;
                    closed
                }
            };

            self.state.send_replace(SchedulerState::Idle);
            info!(identity = %gate.identity(), "Idle");

            if gate_closed {
                return Err(LeaseError::LeadershipClosed);
            }
            if shutdown.is_cancelled() {
                info!("Scheduler stopped");
                return Ok(());
            }
        }
    }

    /// Tick until `cancel` fires. The first tick comes one interval in.
    pub async fn lead(&self, cancel: CancellationToken) {
        let mut clock = VirtualClock::seeded(now_minute(), self.latest_recorded().await);
        let period = self.config.tick_interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(clock = %format_timestamp(&clock.current()), "Virtual clock seeded");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let timestamp = clock.advance();
                    match self.run_tick(timestamp, &cancel).await {
                        Ok(report) => info!(
                            timestamp = %format_timestamp(&report.timestamp),
                            sites = report.sites,
                            recorded = report.recorded,
                            already_recorded = report.already_recorded,
                            skipped = report.skipped,
                            failed = report.failed,
                            "Tick complete"
                        ),
                        Err(err) => warn!(
                            timestamp = %format_timestamp(&timestamp),
                            error = %err,
                            "Tick failed"
                        ),
                    }
                }
            }
        }
    }

    /// Record every (zone, site) once under `timestamp`.
    ///
    /// Waits for all per-site work. Sites whose task has not started when
    /// `cancel` fires are skipped.
    pub async fn run_tick(&self, timestamp: NaiveDateTime, cancel: &CancellationToken) -> Result<TickReport> {
        let zones = self.directory.list_zones().await?;
        let pairs: Vec<(ZoneId, SiteId)> = zones
            .into_iter()
            .flat_map(|(zone, sites)| sites.into_iter().map(move |site| (zone.clone(), site)))
            .collect();

        let mut report = TickReport::empty(timestamp);
        report.sites = pairs.len();

        let recorder = &self.recorder;
        let outcomes: Vec<SiteOutcome> = stream::iter(pairs)
            .map(move |(zone, site)| async move {
                if cancel.is_cancelled() {
                    return SiteOutcome::Skipped;
                }
                match recorder.record_site(&zone, &site, timestamp).await {
                    Ok(outcome) => SiteOutcome::Recorded(outcome),
                    Err(err) => {
                        warn!(zone = %zone, site = %site, error = %err, "Failed to record usage");
                        SiteOutcome::Failed
                    }
                }
            })
            .buffer_unordered(self.config.max_concurrency.max(1))
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                SiteOutcome::Recorded(AppendOutcome::Appended { .. }) => report.recorded += 1,
                SiteOutcome::Recorded(AppendOutcome::AlreadyRecorded) => report.already_recorded += 1,
                SiteOutcome::Skipped => report.skipped += 1,
                SiteOutcome::Failed => report.failed += 1,
            }
        }
        Ok(report)
    }

    async fn latest_recorded(&self) -> Option<NaiveDateTime> {
        let zones = match self.directory.zones().await {
            Ok(zones) => zones,
            Err(err) => {
                warn!(error = %err, "Could not list zones to seed the clock");
                return None;
            }
        };
        match self.recorder.latest_timestamp(&zones).await {
            Ok(latest) => latest,
            Err(err) => {
                warn!(error = %err, "Could not read latest usage record");
                None
            }
        }
    }
}

/// Resolves once leadership is lost; `true` when the gate itself closed.
async fn wait_for_loss(leadership: &mut watch::Receiver<bool>) -> bool {
    loop {
        if leadership.changed().await.is_err() {
            return true;
        }
        if !*leadership.borrow_and_update() {
            return false;
        }
    }
}
