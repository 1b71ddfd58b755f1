//! Reconciler: idle ⇄ syncing, plus a backoff phase between failed runs.
//!
//! A run starts on an offline→online transition (or on boot) when records
//! are pending. Progress is displayed through scheduled ticks; the actual
//! delivery pass starts once progress reaches 100% and reports back through
//! [`Reconciler::finish`]. Only one run exists at a time: a trigger while a
//! run is active is ignored, and every tick, retry and pass outcome carries
//! the run id so anything arriving for an aborted run does nothing.

use rand::Rng;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::capabilities::Scheduler;
use crate::config::SyncConfig;
use crate::event::Event;
use crate::model::{AttemptId, TimerId};
use crate::outbox::DrainReport;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Syncing {
        progress_pct: u8,
        /// Pending count when the run started.
        snapshot: usize,
    },
    Backoff {
        failures: u32,
        delay_ms: u64,
    },
}

#[derive(Debug, PartialEq, Eq)]
pub enum TickOutcome {
    /// Fire for a run that no longer exists.
    Stale,
    Progress,
    /// Progress hit 100%: deliver now and report back via [`Reconciler::finish`].
    DrainNow,
}

/// Exponential backoff capped at `max_ms`, with jitter on top.
#[must_use]
pub fn backoff_delay(failures: u32, config: &SyncConfig, jitter_ms: u64) -> u64 {
    let exponent = failures.saturating_sub(1);
    config
        .base_backoff_ms
        .saturating_mul(2u64.saturating_pow(exponent))
        .min(config.max_backoff_ms)
        .saturating_add(jitter_ms)
}

#[derive(Debug)]
pub struct Reconciler {
    config: SyncConfig,
    phase: SyncPhase,
    run: AttemptId,
    timer: Option<TimerId>,
    failures: u32,
}

impl Reconciler {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            phase: SyncPhase::Idle,
            run: AttemptId::default(),
            timer: None,
            failures: 0,
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn run(&self) -> AttemptId {
        self.run
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.phase, SyncPhase::Idle)
    }

    pub fn progress_pct(&self) -> u8 {
        match self.phase {
            SyncPhase::Syncing { progress_pct, .. } => progress_pct,
            _ => 0,
        }
    }

    /// Displayed remaining count: the snapshot scaled down with progress,
    /// zero at 100%.
    pub fn remaining(&self) -> usize {
        match self.phase {
            SyncPhase::Syncing {
                progress_pct,
                snapshot,
            } => {
                if progress_pct >= 100 {
                    return 0;
                }
                let done = (usize::from(progress_pct) * snapshot) / 100;
                snapshot.saturating_sub(done)
            }
            _ => 0,
        }
    }

    /// Connectivity came back (or boot found pending work). Returns whether
    /// a run started.
    pub fn trigger(&mut self, pending: usize, scheduler: &dyn Scheduler) -> bool {
        if !self.is_idle() {
            debug!(run = self.run.0, phase = ?self.phase, "sync already active, trigger ignored");
            return false;
        }
        if pending == 0 {
            debug!("nothing pending, staying idle");
            return false;
        }
        self.failures = 0;
        self.run = self.run.next();
        self.start(pending, scheduler);
        info!(run = self.run.0, pending, "sync started");
        true
    }

    fn start(&mut self, pending: usize, scheduler: &dyn Scheduler) {
        self.phase = SyncPhase::Syncing {
            progress_pct: 0,
            snapshot: pending,
        };
        self.schedule(
            Duration::from_millis(self.config.tick_ms),
            Event::SyncTick { run: self.run },
            scheduler,
        );
    }

    fn schedule(&mut self, after: Duration, event: Event, scheduler: &dyn Scheduler) {
        if let Some(old) = self.timer.take() {
            scheduler.cancel(old);
        }
        self.timer = Some(scheduler.schedule(after, event));
    }

    pub fn on_tick(&mut self, run: AttemptId, scheduler: &dyn Scheduler) -> TickOutcome {
        let SyncPhase::Syncing {
            progress_pct,
            snapshot,
        } = self.phase
        else {
            return TickOutcome::Stale;
        };
        if run != self.run {
            return TickOutcome::Stale;
        }
        self.timer = None;

        let progress = progress_pct.saturating_add(self.config.step_pct).min(100);
        self.phase = SyncPhase::Syncing {
            progress_pct: progress,
            snapshot,
        };
        if progress >= 100 {
            return TickOutcome::DrainNow;
        }
        self.schedule(
            Duration::from_millis(self.config.tick_ms),
            Event::SyncTick { run },
            scheduler,
        );
        TickOutcome::Progress
    }

    /// Records a delivery pass's outcome: back to idle when nothing is left
    /// to retry, otherwise backoff until `max_attempts`. Returns false for a
    /// pass that belongs to a run which no longer exists.
    pub fn finish(&mut self, run: AttemptId, report: &DrainReport, scheduler: &dyn Scheduler) -> bool {
        if run != self.run || !matches!(self.phase, SyncPhase::Syncing { .. }) {
            debug!(run = run.0, current = self.run.0, "outcome for a stale run ignored");
            return false;
        }
        if report.all_delivered() {
            info!(
                run = self.run.0,
                delivered = report.confirmed.len(),
                rejected = report.rejected.len(),
                "sync complete"
            );
            self.reset();
            return true;
        }

        self.failures += 1;
        if self.failures >= self.config.max_attempts {
            warn!(
                run = self.run.0,
                failures = self.failures,
                pending = report.pending,
                "sync giving up until connectivity changes"
            );
            self.reset();
            return true;
        }

        let jitter = if self.config.jitter_max_ms > 0 {
            rand::thread_rng().gen_range(0..self.config.jitter_max_ms)
        } else {
            0
        };
        let delay_ms = backoff_delay(self.failures, &self.config, jitter);
        warn!(
            run = self.run.0,
            failures = self.failures,
            delay_ms,
            pending = report.pending,
            "sync failed, backing off"
        );
        self.phase = SyncPhase::Backoff {
            failures: self.failures,
            delay_ms,
        };
        self.schedule(
            Duration::from_millis(delay_ms),
            Event::SyncRetry { run: self.run },
            scheduler,
        );
        true
    }

    /// Backoff elapsed. Restarts the run if anything is still pending.
    pub fn on_retry(&mut self, run: AttemptId, pending: usize, scheduler: &dyn Scheduler) -> bool {
        if run != self.run || !matches!(self.phase, SyncPhase::Backoff { .. }) {
            return false;
        }
        self.timer = None;
        if pending == 0 {
            self.reset();
            return false;
        }
        debug!(run = run.0, failures = self.failures, "retrying sync");
        self.start(pending, scheduler);
        true
    }

    /// Connectivity lost: drop the run. Records already claimed by its
    /// delivery pass are released by the caller.
    pub fn abort(&mut self, scheduler: &dyn Scheduler) {
        if self.is_idle() {
            return;
        }
        if let Some(timer) = self.timer.take() {
            scheduler.cancel(timer);
        }
        info!(run = self.run.0, phase = ?self.phase, "sync aborted");
        self.reset();
    }

    fn reset(&mut self) {
        self.phase = SyncPhase::Idle;
        self.timer = None;
        self.failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{ManualScheduler, UplinkError};
    use crate::model::{LocalId, UnixTimeMs};

    fn config() -> SyncConfig {
        SyncConfig {
            jitter_max_ms: 0,
            ..SyncConfig::default()
        }
    }

    fn failed_report() -> DrainReport {
        DrainReport {
            failed: vec![(LocalId::new("a"), UplinkError::Offline)],
            pending: 1,
            ..DrainReport::default()
        }
    }

    #[test]
    fn zero_pending_stays_idle() {
        let s = ManualScheduler::new(UnixTimeMs(0));
        let mut r = Reconciler::new(config());
        assert!(!r.trigger(0, &s));
        assert!(r.is_idle());
        assert_eq!(s.pending_count(), 0);
    }

    #[test]
    fn remaining_shrinks_with_progress() {
        let s = ManualScheduler::new(UnixTimeMs(0));
        let mut r = Reconciler::new(config());
        r.trigger(7, &s);
        assert_eq!(r.remaining(), 7);

        let mut seen = vec![];
        loop {
            match r.on_tick(r.run(), &s) {
                TickOutcome::Progress => seen.push(r.remaining()),
                TickOutcome::DrainNow => break,
                TickOutcome::Stale => panic!("stale tick"),
            }
        }
        assert!(seen.windows(2).all(|w| w[0] >= w[1]));
        // 10% of 7 floors to 0, so the first tick still shows 7.
        assert_eq!(seen[0], 7);
        assert_eq!(r.remaining(), 0);
        assert_eq!(r.progress_pct(), 100);
    }

    #[test]
    fn second_trigger_while_syncing_is_ignored() {
        let s = ManualScheduler::new(UnixTimeMs(0));
        let mut r = Reconciler::new(config());
        assert!(r.trigger(3, &s));
        let run = r.run();
        assert!(!r.trigger(5, &s));
        assert_eq!(r.run(), run);
        assert_eq!(s.pending_count(), 1);
    }

    #[test]
    fn stale_tick_after_abort_is_ignored() {
        let s = ManualScheduler::new(UnixTimeMs(0));
        let mut r = Reconciler::new(config());
        r.trigger(3, &s);
        let old = r.run();
        r.abort(&s);
        assert_eq!(s.pending_count(), 0);
        r.trigger(3, &s);
        assert_eq!(r.on_tick(old, &s), TickOutcome::Stale);
    }

    #[test]
    fn failure_backs_off_then_gives_up() {
        let s = ManualScheduler::new(UnixTimeMs(0));
        let mut r = Reconciler::new(SyncConfig {
            max_attempts: 3,
            ..config()
        });
        r.trigger(1, &s);

        assert!(r.finish(r.run(), &failed_report(), &s));
        assert_eq!(r.phase(), SyncPhase::Backoff { failures: 1, delay_ms: 1_000 });
        assert!(r.on_retry(r.run(), 1, &s));

        r.finish(r.run(), &failed_report(), &s);
        assert_eq!(r.phase(), SyncPhase::Backoff { failures: 2, delay_ms: 2_000 });
        assert!(r.on_retry(r.run(), 1, &s));

        r.finish(r.run(), &failed_report(), &s);
        assert!(r.is_idle());
    }

    #[test]
    fn rejections_alone_do_not_back_off() {
        let s = ManualScheduler::new(UnixTimeMs(0));
        let mut r = Reconciler::new(config());
        r.trigger(1, &s);
        let report = DrainReport {
            rejected: vec![(LocalId::new("a"), UplinkError::Rejected { reason: "bad".into() })],
            ..DrainReport::default()
        };
        assert!(r.finish(r.run(), &report, &s));
        assert!(r.is_idle());
        assert_eq!(s.pending_count(), 0);
    }

    #[test]
    fn outcome_of_an_aborted_run_is_ignored() {
        let s = ManualScheduler::new(UnixTimeMs(0));
        let mut r = Reconciler::new(config());
        r.trigger(1, &s);
        let old = r.run();
        r.abort(&s);
        r.trigger(2, &s);
        assert!(!r.finish(old, &failed_report(), &s));
        assert_eq!(r.phase(), SyncPhase::Syncing { progress_pct: 0, snapshot: 2 });
    }

    #[test]
    fn backoff_is_capped() {
        let c = config();
        assert_eq!(backoff_delay(1, &c, 0), 1_000);
        assert_eq!(backoff_delay(4, &c, 0), 8_000);
        assert_eq!(backoff_delay(30, &c, 0), 60_000);
        assert_eq!(backoff_delay(30, &c, 250), 60_250);
    }

    #[test]
    fn retry_with_nothing_pending_returns_idle() {
        let s = ManualScheduler::new(UnixTimeMs(0));
        let mut r = Reconciler::new(config());
        r.trigger(1, &s);
        r.finish(r.run(), &failed_report(), &s);
        assert!(!r.on_retry(r.run(), 0, &s));
        assert!(r.is_idle());
    }
}
