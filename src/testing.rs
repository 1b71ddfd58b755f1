//! Deterministic host for driving the engine in tests: a virtual clock,
//! a scripted back office and any queue storage backend, all wired to the
//! app through crux's `AppTester`. Every effect is carried out synchronously
//! except timers, which wait until the clock is moved past them.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use crux_core::testing::{AppTester, Update};
use crux_core::Request;
use tracing::warn;

use crate::app::{App, Model, ViewModel};
use crate::capabilities::{
    serve, BackOffice, Clock, Effect, ManualClock, QueueStorage, RecordingBackOffice, SequentialIds, TimerOperation,
    TimerOutput,
};
use crate::config::KioskConfig;
use crate::event::Event;
use crate::model::{TimerId, UnixTimeMs};
use crate::outbox::QueueRecord;

pub struct Simulator {
    tester: AppTester<App, Effect>,
    pub model: Model,
    pub back_office: RecordingBackOffice,
    clock: ManualClock,
    // (due, id) keeps FIFO among equal due times since ids increase.
    timers: BTreeMap<(UnixTimeMs, TimerId), Request<TimerOperation>>,
    storage: Box<dyn QueueStorage>,
    receipts: Vec<QueueRecord>,
}

impl Simulator {
    pub const EPOCH: UnixTimeMs = UnixTimeMs(1_700_000_000_000);

    /// Ids come out as `rec-0001`, `rec-0002`, ...
    pub fn new(config: KioskConfig, storage: Box<dyn QueueStorage>) -> Self {
        let clock = ManualClock::new(Self::EPOCH);
        let model = Model::new(config)
            .with_clock(clock.clone())
            .with_ids(SequentialIds::new("rec"));
        Self {
            tester: AppTester::default(),
            model,
            back_office: RecordingBackOffice::new(),
            clock,
            timers: BTreeMap::new(),
            storage,
            receipts: Vec::new(),
        }
    }

    pub fn now(&self) -> UnixTimeMs {
        self.clock.now()
    }

    /// Dispatches one event and everything that follows from it. Returns the
    /// receipts issued along the way.
    pub fn send(&mut self, event: Event) -> Vec<QueueRecord> {
        let mut work = VecDeque::from([event]);
        let mut issued = Vec::new();
        while let Some(event) = work.pop_front() {
            let update = self.tester.update(event, &mut self.model);
            self.carry_out(update, &mut work, &mut issued);
        }
        self.receipts.extend(issued.iter().cloned());
        issued
    }

    /// Fires the earliest timer due by `deadline`, moving the clock to its
    /// due time. Returns the events it produced without dispatching them, or
    /// `None` when nothing is due.
    pub fn fire_next_due(&mut self, deadline: UnixTimeMs) -> Option<Vec<Event>> {
        let key = *self.timers.keys().next().filter(|(due, _)| *due <= deadline)?;
        let mut request = self.timers.remove(&key)?;
        self.clock.advance_to(key.0);

        let mut work = VecDeque::new();
        let mut issued = Vec::new();
        self.resolve(&mut request, TimerOutput::Fired, &mut work, &mut issued);
        self.receipts.extend(issued);
        Some(work.into())
    }

    /// Moves the clock forward, dispatching every timer that comes due on
    /// the way in due order.
    pub fn advance(&mut self, by: Duration) {
        let deadline = self
            .now()
            .add_millis(u64::try_from(by.as_millis()).unwrap_or(u64::MAX));
        while let Some(events) = self.fire_next_due(deadline) {
            for event in events {
                self.send(event);
            }
        }
        self.clock.advance_to(deadline);
    }

    pub fn view(&self) -> ViewModel {
        self.tester.view(&self.model)
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    /// Every receipt issued so far.
    pub fn receipts(&self) -> &[QueueRecord] {
        &self.receipts
    }

    pub fn storage(&self) -> &dyn QueueStorage {
        self.storage.as_ref()
    }

    /// Hands the backend over, e.g. to boot a fresh simulator on it.
    pub fn into_storage(self) -> Box<dyn QueueStorage> {
        self.storage
    }

    fn carry_out(&mut self, update: Update<Effect, Event>, work: &mut VecDeque<Event>, issued: &mut Vec<QueueRecord>) {
        work.extend(update.events);
        let mut effects: VecDeque<Effect> = update.effects.into();

        while let Some(effect) = effects.pop_front() {
            let follow_up = match effect {
                Effect::Render(_) => None,
                Effect::Receipt(request) => {
                    issued.push(request.operation.record.clone());
                    None
                }
                Effect::Timer(request) => self.timer(request),
                Effect::Uplink(mut request) => {
                    let result = self.back_office.submit(&request.operation.record);
                    self.resolve_with(&mut request, result)
                }
                Effect::Store(mut request) => {
                    let output = serve(self.storage.as_mut(), &request.operation);
                    self.resolve_with(&mut request, output)
                }
            };
            if let Some(update) = follow_up {
                work.extend(update.events);
                effects.extend(update.effects);
            }
        }
    }

    fn timer(&mut self, mut request: Request<TimerOperation>) -> Option<Update<Effect, Event>> {
        match request.operation.clone() {
            TimerOperation::Start { id, after_ms } => {
                let due = self.now().add_millis(after_ms);
                self.timers.insert((due, id), request);
                None
            }
            TimerOperation::Cancel { id } => {
                // The cancelled start is answered too so its task finishes.
                if let Some(key) = self.timers.keys().find(|(_, timer)| *timer == id).copied() {
                    if let Some(mut start) = self.timers.remove(&key) {
                        self.resolve_with(&mut start, TimerOutput::Cancelled);
                    }
                }
                self.resolve_with(&mut request, TimerOutput::Cancelled)
            }
        }
    }

    fn resolve_with<Op>(&mut self, request: &mut Request<Op>, output: Op::Output) -> Option<Update<Effect, Event>>
    where
        Op: crux_core::capability::Operation,
    {
        match self.tester.resolve(request, output) {
            Ok(update) => Some(update),
            Err(e) => {
                warn!(error = %e, "request could not be resolved");
                None
            }
        }
    }

    fn resolve<Op>(
        &mut self,
        request: &mut Request<Op>,
        output: Op::Output,
        work: &mut VecDeque<Event>,
        issued: &mut Vec<QueueRecord>,
    ) where
        Op: crux_core::capability::Operation,
    {
        if let Some(update) = self.resolve_with(request, output) {
            self.carry_out(update, work, issued);
        }
    }
}
