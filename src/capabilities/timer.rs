use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crux_core::capability::{Capability, CapabilityContext, Operation};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::event::Event;
use crate::model::TimerId;

/// Deferred event delivery. Every "delay" in the engine (idle timeout, scan
/// progress, payment settlement, sync progress) is a scheduled event, never
/// a wait.
pub trait Scheduler {
    fn schedule(&self, after: Duration, event: Event) -> TimerId;
    /// Cancelling an unknown or already fired timer is a no-op.
    fn cancel(&self, id: TimerId);
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum TimerOperation {
    Start { id: TimerId, after_ms: u64 },
    Cancel { id: TimerId },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TimerOutput {
    Fired,
    /// Answer to a `Cancel`, and to the `Start` it cancelled.
    Cancelled,
}

impl Operation for TimerOperation {
    type Output = TimerOutput;
}

/// The shell owns the clock: it answers `Start` with `Fired` once `after_ms`
/// has passed, or with `Cancelled` when a matching `Cancel` arrives first.
/// Ids are handed out here so the engine can cancel before the shell has
/// even seen the request.
pub struct Timer<Ev> {
    context: CapabilityContext<TimerOperation, Ev>,
    next_id: Arc<AtomicU64>,
}

impl<Ev> Capability<Ev> for Timer<Ev> {
    type Operation = TimerOperation;
    type MappedSelf<MappedEv> = Timer<MappedEv>;

    fn map_event<F, NewEv>(&self, f: F) -> Self::MappedSelf<NewEv>
    where
        F: Fn(NewEv) -> Ev + Send + Sync + 'static,
        Ev: 'static,
        NewEv: 'static + Send,
    {
        Timer {
            context: self.context.map_event(f),
            next_id: Arc::clone(&self.next_id),
        }
    }
}

impl<Ev> Timer<Ev>
where
    Ev: Send + 'static,
{
    pub fn new(context: CapabilityContext<TimerOperation, Ev>) -> Self {
        Self {
            context,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn start(&self, after: Duration, event: Ev) -> TimerId {
        let id = TimerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let after_ms = u64::try_from(after.as_millis()).unwrap_or(u64::MAX);
        let ctx = self.context.clone();
        self.context.spawn(async move {
            if ctx.request_from_shell(TimerOperation::Start { id, after_ms }).await == TimerOutput::Fired {
                ctx.update_app(event);
            }
        });
        id
    }

    pub fn stop(&self, id: TimerId) {
        let ctx = self.context.clone();
        self.context.spawn(async move {
            ctx.request_from_shell(TimerOperation::Cancel { id }).await;
        });
    }
}

impl Scheduler for Timer<Event> {
    fn schedule(&self, after: Duration, event: Event) -> TimerId {
        let name = event.name();
        let id = self.start(after, event);
        trace!(timer = id.0, after_ms = after.as_millis(), event = name, "scheduled");
        id
    }

    fn cancel(&self, id: TimerId) {
        self.stop(id);
    }
}

// ============================================================================
// Virtual scheduler for unit tests of the individual machines
// ============================================================================

#[cfg(test)]
pub(crate) use self::manual::ManualScheduler;
