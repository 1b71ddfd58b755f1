//! The engine: one `update` per event, strictly in arrival order, against a
//! single [`Model`]. The session controller and the reconciler never call
//! each other; they meet only through `Model::online` and the queue.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::auth::{AuthOutcome, AuthStep};
use crate::capabilities::{
    Capabilities, Clock, DemoIdentityProvider, IdGenerator, SynthesizingLookup, SystemClock, UplinkError, UuidIds,
};
use crate::config::KioskConfig;
use crate::event::{Event, SessionEvent};
use crate::model::{AttemptId, LocalId, Mode, UnixTimeMs};
use crate::outbox::{DrainReport, OfflineQueue, QueueRecord, RecordKind};
use crate::session::{advance, IdleTimer, ScreenKind, Session};
use crate::sync::{Reconciler, SyncPhase, TickOutcome};
use crate::workflow::complaint::ComplaintOutcome;
use crate::workflow::payment::{Bill, PaymentOutcome};
use crate::workflow::{ActiveWorkflow, TransitionError};

// ============================================================================
// Model
// ============================================================================

/// Who asked for a delivery pass, and so who hears how it ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PassOrigin {
    Run(AttemptId),
    Quiet,
}

/// Records claimed for one pass, submitted one at a time oldest first.
#[derive(Debug)]
struct DeliveryPass {
    origin: PassOrigin,
    current: Option<LocalId>,
    remaining: VecDeque<QueueRecord>,
    report: DrainReport,
}

pub struct Model {
    pub session: Session,
    pub workflow: Option<ActiveWorkflow>,
    /// Last connectivity reported by the environment. Never set by the engine.
    pub online: bool,
    pub queue: OfflineQueue,
    pub reconciler: Reconciler,
    pub idle: IdleTimer,
    pub last_receipt: Option<QueueRecord>,
    pub config: KioskConfig,
    clock: Box<dyn Clock>,
    ids: Box<dyn IdGenerator>,
    bills: SynthesizingLookup,
    identity: DemoIdentityProvider,
    deliveries: HashMap<AttemptId, DeliveryPass>,
    delivery_passes: AttemptId,
    workflow_attempts: AttemptId,
}

impl Default for Model {
    fn default() -> Self {
        Self::new(KioskConfig::default())
    }
}

impl Model {
    pub fn new(config: KioskConfig) -> Self {
        Self {
            session: Session::new(),
            workflow: None,
            online: false,
            queue: OfflineQueue::with_capacity(config.storage.capacity),
            reconciler: Reconciler::new(config.sync.clone()),
            idle: IdleTimer::new(config.idle_timeout()),
            last_receipt: None,
            clock: Box::new(SystemClock),
            ids: Box::new(UuidIds),
            bills: SynthesizingLookup::with_fixtures(),
            identity: DemoIdentityProvider::new(config.auth.expected_otp.clone()),
            deliveries: HashMap::new(),
            delivery_passes: AttemptId::default(),
            workflow_attempts: AttemptId::default(),
            config,
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    #[must_use]
    pub fn with_ids(mut self, ids: impl IdGenerator + 'static) -> Self {
        self.ids = Box::new(ids);
        self
    }

    /// Delivery passes still waiting on the uplink.
    pub fn deliveries_in_flight(&self) -> usize {
        self.deliveries.len()
    }
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("screen", &self.session.screen.kind())
            .field("route", &self.session.route())
            .field("workflow", &self.workflow.as_ref().map(ActiveWorkflow::step_name))
            .field("online", &self.online)
            .field("queue", &self.queue)
            .field("sync", &self.reconciler.phase())
            .field("deliveries", &self.deliveries.len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// View
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViewModel {
    pub screen: ScreenKind,
    pub mode: Option<Mode>,
    pub route: Option<String>,
    pub citizen_name: Option<String>,
    pub online: bool,
    pub pending_count: usize,
    /// Records the back office refused; they wait for an operator.
    pub rejected_count: usize,
    pub sync: SyncView,
    pub step: Option<StepView>,
    pub bill: Option<BillView>,
    pub receipt: Option<ReceiptView>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncView {
    pub phase: &'static str,
    pub progress_pct: u8,
    pub remaining: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepView {
    pub flow: &'static str,
    pub step: &'static str,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BillView {
    pub consumer_name: String,
    pub amount: String,
    pub due_date: String,
    pub units: Option<u32>,
}

impl From<&Bill> for BillView {
    fn from(bill: &Bill) -> Self {
        Self {
            consumer_name: bill.consumer_name.clone(),
            amount: bill.amount_display(),
            due_date: bill.due_date.clone(),
            units: bill.units,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReceiptView {
    pub local_id: String,
    pub kind: RecordKind,
    pub synced: bool,
}

// ============================================================================
// App
// ============================================================================

#[derive(Debug, Default)]
pub struct App;

impl crux_core::App for App {
    type Event = Event;
    type Model = Model;
    type ViewModel = ViewModel;
    type Capabilities = Capabilities;

    #[instrument(skip_all, fields(event = event.name()))]
    fn update(&self, event: Event, model: &mut Model, caps: &Capabilities) {
        let now = model.clock.now();
        let rearm_idle = event.is_user_initiated()
            || matches!(event, Event::Session(SessionEvent::DevOverride(_)));
        if event.is_user_initiated() {
            model.session.touch(now);
        }

        Self::dispatch(event, now, model, caps);

        if rearm_idle {
            if model.session.is_idle() {
                model.idle.disarm(&caps.timer);
            } else {
                model.idle.rearm(now, &caps.timer);
            }
        }

        for write in model.queue.take_writes() {
            caps.store.write(write, |key, error| Event::StoreFailed { key, error });
        }
        caps.render.render();
    }

    fn view(&self, model: &Model) -> ViewModel {
        let session = &model.session;

        let step = if let Some(flow) = session.auth_flow() {
            Some(StepView {
                flow: "auth",
                step: flow.step.name(),
                message: flow.step.error().map(ToString::to_string),
            })
        } else {
            model.workflow.as_ref().map(|wf| StepView {
                flow: wf.kind(),
                step: wf.step_name(),
                message: wf.error().map(ToString::to_string),
            })
        };

        let bill = match &model.workflow {
            Some(ActiveWorkflow::Payment(flow)) => flow.step.bill().map(BillView::from),
            _ => None,
        };

        let phase = model.reconciler.phase();
        let sync = SyncView {
            phase: match phase {
                SyncPhase::Idle => "idle",
                SyncPhase::Syncing { .. } => "syncing",
                SyncPhase::Backoff { .. } => "backoff",
            },
            progress_pct: model.reconciler.progress_pct(),
            remaining: model.reconciler.remaining(),
        };

        ViewModel {
            screen: session.screen.kind(),
            mode: session.mode(),
            route: session.route().map(|r| r.to_string()),
            citizen_name: session.citizen().map(|c| c.name.clone()),
            online: model.online,
            pending_count: model.queue.count(),
            rejected_count: model.queue.rejected().len(),
            sync,
            step,
            bill,
            receipt: model.last_receipt.as_ref().map(|r| ReceiptView {
                local_id: r.local_id.to_string(),
                kind: r.kind(),
                synced: model
                    .queue
                    .synced(&r.local_id)
                    .unwrap_or_else(|| r.synced()),
            }),
        }
    }
}

impl App {
    fn dispatch(event: Event, now: UnixTimeMs, model: &mut Model, caps: &Capabilities) {
        match event {
            Event::Configure(config) => Self::configure(*config, model),

            Event::Boot { online } => {
                model.online = online;
                info!(online, "kiosk booted, loading queue");
                caps.store.load(|result| Event::QueueLoaded(Box::new(result)));
            }

            Event::QueueLoaded(result) => {
                match *result {
                    Ok(stored) => {
                        model.queue.restore(stored);
                    }
                    Err(e) => error!(error = %e, "offline queue could not be loaded, starting empty"),
                }
                let pending = model.queue.count();
                if model.online && !model.reconciler.trigger(pending, &caps.timer) {
                    Self::quiet_drain(model, caps);
                }
            }

            Event::StoreFailed { key, error } => model.queue.write_failed(&key, &error),

            Event::Activity(kind) => {
                trace!(?kind, "activity");
            }

            Event::Session(ev) => Self::apply_session(ev, model, caps),

            Event::Auth(ev) => {
                let Some(flow) = model.session.auth_flow_mut() else {
                    debug!("auth event outside citizen-auth ignored");
                    return;
                };
                let outcome = flow.handle(ev, &model.identity);
                // Leaving the scan step by hand stops its ticks.
                if !matches!(flow.step, AuthStep::Scanning { .. }) {
                    if let Some(timer) = flow.scan_timer.take() {
                        caps.timer.stop(timer);
                    }
                }
                Self::apply_auth_outcome(outcome, model, caps);
            }

            Event::ScanTick { attempt } => {
                let Some(flow) = model
                    .session
                    .auth_flow_mut()
                    .filter(|f| f.attempt == attempt)
                else {
                    debug!(attempt = attempt.0, "stale scan tick");
                    return;
                };
                let outcome = flow.tick(model.config.auth.scan_step_pct, &model.identity);
                Self::apply_auth_outcome(outcome, model, caps);
            }

            Event::Payment(ev) => {
                let Some(ActiveWorkflow::Payment(flow)) = model.workflow.as_mut() else {
                    debug!(event = ev.name(), "no payment workflow active");
                    return;
                };
                match flow.handle(ev, &model.bills) {
                    Ok(PaymentOutcome::Stay) => {}
                    Ok(PaymentOutcome::BeginSettlement(method)) => {
                        let delay = model.config.payment.settlement_delay(method);
                        flow.settlement = Some(caps.timer.start(
                            delay,
                            Event::PaymentSettled {
                                attempt: flow.attempt,
                            },
                        ));
                    }
                    Err(e) => debug!(error = %e, "payment event rejected"),
                }
            }

            Event::PaymentSettled { attempt } => {
                let Some(ActiveWorkflow::Payment(flow)) = model
                    .workflow
                    .as_mut()
                    .filter(|wf| wf.attempt() == attempt)
                else {
                    debug!(attempt = attempt.0, "settlement for discarded payment ignored");
                    return;
                };
                let (queue, online) = (&model.queue, model.online);
                let filed = flow.complete(model.ids.next_id(), now, |record| queue.enqueue(record, online));
                Self::record_filed(filed, model, caps);
            }

            Event::Complaint(ev) => {
                let Some(ActiveWorkflow::Complaint(flow)) = model.workflow.as_mut() else {
                    debug!(event = ev.name(), "no complaint workflow active");
                    return;
                };
                match flow.handle(ev) {
                    Ok(ComplaintOutcome::Stay) => {}
                    Ok(ComplaintOutcome::ReadyToFile) => {
                        let (queue, online) = (&model.queue, model.online);
                        let filed = flow.complete(model.ids.next_id(), now, |record| queue.enqueue(record, online));
                        Self::record_filed(filed, model, caps);
                    }
                    Err(e) => debug!(error = %e, "complaint event rejected"),
                }
            }

            Event::ConnectivityChanged { online } => {
                let was_online = model.online;
                model.online = online;
                info!(online, "connectivity changed");
                match (was_online, online) {
                    (false, true) => {
                        let pending = model.queue.count();
                        // Optimistic leftovers are not counted but still owed.
                        if !model.reconciler.trigger(pending, &caps.timer) {
                            Self::quiet_drain(model, caps);
                        }
                    }
                    // Passes in flight stop at their next record.
                    (true, false) => model.reconciler.abort(&caps.timer),
                    _ => {}
                }
            }

            Event::IdleTimerFired { armed_at, generation } => {
                if !model.idle.accept_fire(generation) {
                    debug!(generation, "stale idle fire ignored");
                } else if model.session.idle_reset_allowed() {
                    info!(
                        idle_ms = now.millis_since(model.session.last_activity_at),
                        armed_at = armed_at.0,
                        "idle timeout"
                    );
                    Self::apply_session(SessionEvent::IdleTimeout, model, caps);
                } else {
                    debug!(route = ?model.session.route(), "idle timeout suppressed");
                }
            }

            Event::SyncTick { run } => match model.reconciler.on_tick(run, &caps.timer) {
                TickOutcome::Stale => debug!(run = run.0, "stale sync tick"),
                TickOutcome::Progress => {}
                TickOutcome::DrainNow => Self::start_pass(PassOrigin::Run(run), model, caps),
            },

            Event::SyncRetry { run } => {
                let pending = model.queue.count();
                if !model.reconciler.on_retry(run, pending, &caps.timer) {
                    debug!(run = run.0, "sync retry not needed");
                }
            }

            Event::Delivered { pass, local_id, result } => {
                let Some(delivery) = model
                    .deliveries
                    .get_mut(&pass)
                    .filter(|d| d.current.as_ref() == Some(&local_id))
                else {
                    debug!(pass = pass.0, %local_id, "result for an unknown delivery ignored");
                    return;
                };
                delivery.current = None;
                let offline = matches!(result, Err(UplinkError::Offline));
                model.queue.settle(&local_id, result, now, &mut delivery.report);
                if offline {
                    let rest: Vec<LocalId> = delivery.remaining.drain(..).map(|r| r.local_id).collect();
                    model.queue.release(&rest, &mut delivery.report);
                }
                Self::refresh_receipt(model);
                Self::advance_pass(pass, model, caps);
            }
        }
    }

    /// Applied only between customers so no timer or workflow is built on
    /// the old values.
    fn configure(config: KioskConfig, model: &mut Model) {
        if !model.session.is_idle() || !model.reconciler.is_idle() {
            warn!("configuration ignored while the kiosk is busy");
            return;
        }
        if let Err(e) = config.validate() {
            error!(error = %e, "configuration rejected");
            return;
        }
        model.queue.set_capacity(config.storage.capacity);
        model.reconciler = Reconciler::new(config.sync.clone());
        model.idle = IdleTimer::new(config.idle_timeout());
        model.identity = DemoIdentityProvider::new(config.auth.expected_otp.clone());
        model.config = config;
        info!("configuration applied");
    }

    /// Runs the session transition and keeps what hangs off the session in
    /// step with it: the auth scan timer and the active workflow.
    fn apply_session(event: SessionEvent, model: &mut Model, caps: &Capabilities) {
        let explicit_navigation = matches!(event, SessionEvent::Navigate(_));
        let before_kind = model.session.screen.kind();
        let before_route = model.session.route();
        let before_auth = model
            .session
            .auth_flow()
            .map(|f| (f.attempt, f.scan_timer));

        let session = std::mem::take(&mut model.session);
        model.session = advance(session, event);

        if let Some((attempt, Some(timer))) = before_auth {
            if model.session.auth_flow().map(|f| f.attempt) != Some(attempt) {
                caps.timer.stop(timer);
            }
        }

        let route = model.session.route();
        let kind = model.session.screen.kind();
        let routed_again = explicit_navigation && route.is_some();
        if route == before_route && kind == before_kind && !routed_again {
            return;
        }

        if let Some(mut old) = model.workflow.take() {
            debug!(
                kind = old.kind(),
                step = old.step_name(),
                "workflow discarded"
            );
            old.teardown(&caps.timer);
        }
        if let Some(route) = route {
            model.workflow_attempts = model.workflow_attempts.next();
            model.workflow = ActiveWorkflow::for_route(route, model.workflow_attempts);
            if let Some(wf) = &model.workflow {
                debug!(kind = wf.kind(), attempt = wf.attempt().0, %route, "workflow started");
            }
        }
    }

    fn apply_auth_outcome(outcome: AuthOutcome, model: &mut Model, caps: &Capabilities) {
        match outcome {
            AuthOutcome::Stay => {}
            AuthOutcome::ScanContinues => {
                let tick = Duration::from_millis(model.config.auth.scan_tick_ms);
                if let Some(flow) = model.session.auth_flow_mut() {
                    if let Some(old) = flow.scan_timer.take() {
                        caps.timer.stop(old);
                    }
                    flow.scan_timer = Some(caps.timer.start(
                        tick,
                        Event::ScanTick {
                            attempt: flow.attempt,
                        },
                    ));
                }
            }
            AuthOutcome::Authenticated(identity) => {
                Self::apply_session(SessionEvent::Authenticated(identity), model, caps);
            }
        }
    }

    /// A terminal step was attempted. A filed record gets its receipt and,
    /// online, goes out right away; a record the queue refused leaves no
    /// receipt behind.
    fn record_filed(filed: Result<QueueRecord, TransitionError>, model: &mut Model, caps: &Capabilities) {
        match filed {
            Ok(record) => {
                model.last_receipt = Some(record.clone());
                caps.receipt.issue(record);
                Self::quiet_drain(model, caps);
            }
            Err(TransitionError::NotFiled { reason }) => {
                error!(%reason, "record could not be queued");
                model.last_receipt = None;
            }
            Err(e) => debug!(error = %e, "nothing filed"),
        }
    }

    /// Delivers undelivered records without a progress indicator. Only runs
    /// online with no reconciler run active; a failure hands the leftovers
    /// to a regular run.
    fn quiet_drain(model: &mut Model, caps: &Capabilities) {
        if !model.online || !model.reconciler.is_idle() || model.queue.undelivered() == 0 {
            return;
        }
        Self::start_pass(PassOrigin::Quiet, model, caps);
    }

    fn start_pass(origin: PassOrigin, model: &mut Model, caps: &Capabilities) {
        model.delivery_passes = model.delivery_passes.next();
        let id = model.delivery_passes;
        let remaining: VecDeque<QueueRecord> = model.queue.claim().into();
        debug!(pass = id.0, ?origin, records = remaining.len(), "delivery pass started");
        model.deliveries.insert(
            id,
            DeliveryPass {
                origin,
                current: None,
                remaining,
                report: DrainReport::default(),
            },
        );
        Self::advance_pass(id, model, caps);
    }

    /// Submits the next record of a pass, or concludes it once nothing is
    /// left. Going offline releases whatever was not submitted yet.
    fn advance_pass(id: AttemptId, model: &mut Model, caps: &Capabilities) {
        let Some(pass) = model.deliveries.get_mut(&id) else {
            return;
        };
        if model.online {
            if let Some(record) = pass.remaining.pop_front() {
                let local_id = record.local_id.clone();
                pass.current = Some(local_id.clone());
                caps.uplink.submit(record, move |result| Event::Delivered {
                    pass: id,
                    local_id,
                    result,
                });
                return;
            }
        } else {
            let rest: Vec<LocalId> = pass.remaining.drain(..).map(|r| r.local_id).collect();
            model.queue.release(&rest, &mut pass.report);
        }

        if let Some(pass) = model.deliveries.remove(&id) {
            Self::conclude(pass, model, caps);
        }
    }

    /// Confirmed records are compacted after every pass, so an always-online
    /// kiosk never fills its queue with delivered records.
    fn conclude(pass: DeliveryPass, model: &mut Model, caps: &Capabilities) {
        let DeliveryPass {
            origin, mut report, ..
        } = pass;
        report.pending = model.queue.count();
        info!(
            ?origin,
            confirmed = report.confirmed.len(),
            failed = report.failed.len(),
            rejected = report.rejected.len(),
            released = report.released,
            pending = report.pending,
            "delivery pass finished"
        );
        model.queue.compact();

        match origin {
            PassOrigin::Run(run) => {
                model.reconciler.finish(run, &report, &caps.timer);
            }
            PassOrigin::Quiet if !report.all_delivered() && model.online => {
                model.reconciler.trigger(report.pending, &caps.timer);
            }
            PassOrigin::Quiet => {}
        }
    }

    fn refresh_receipt(model: &mut Model) {
        if let Some(receipt) = &mut model.last_receipt {
            if let Some(current) = model.queue.get(&receipt.local_id) {
                *receipt = current;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{Effect, MemoryStorage, TimerOperation};
    use crate::event::{ComplaintEvent, Path, PaymentEvent};
    use crate::model::{Route, ServiceType};
    use crate::testing::Simulator;
    use crate::workflow::payment::PaymentMethod;
    use crux_core::testing::AppTester;

    fn sim(online: bool) -> Simulator {
        let mut s = Simulator::new(KioskConfig::default(), Box::new(MemoryStorage::new()));
        s.send(Event::Boot { online });
        s
    }

    fn guest_at(s: &mut Simulator, route: Route) {
        s.send(Event::Session(SessionEvent::Start));
        s.send(Event::Session(SessionEvent::SelectPath(Path::Guest)));
        s.send(Event::Session(SessionEvent::Navigate(route)));
    }

    #[test]
    fn boot_asks_the_shell_for_the_queue() {
        let app = AppTester::<App, Effect>::default();
        let mut model = Model::default();

        let update = app.update(Event::Boot { online: false }, &mut model);
        assert!(update.effects.iter().any(|e| matches!(e, Effect::Store(_))));
        assert!(update.effects.iter().any(|e| matches!(e, Effect::Render(_))));
        assert!(!model.online);
    }

    #[test]
    fn settlement_is_a_shell_timer() {
        let app = AppTester::<App, Effect>::default();
        let mut model = Model::default();
        for event in [
            Event::Session(SessionEvent::Start),
            Event::Session(SessionEvent::SelectPath(Path::Guest)),
            Event::Session(SessionEvent::Navigate(Route::Bill(ServiceType::Gas))),
            Event::Payment(PaymentEvent::SubmitConsumerId("GAS-77".into())),
            Event::Payment(PaymentEvent::ConfirmBill),
        ] {
            app.update(event, &mut model);
        }

        let update = app.update(Event::Payment(PaymentEvent::ChooseMethod(PaymentMethod::Card)), &mut model);
        let starts: Vec<u64> = update
            .effects
            .iter()
            .filter_map(|e| match e {
                Effect::Timer(request) => match request.operation {
                    TimerOperation::Start { after_ms, .. } => Some(after_ms),
                    TimerOperation::Cancel { .. } => None,
                },
                _ => None,
            })
            .collect();
        // Settlement plus the rearmed idle timer.
        assert!(starts.contains(&3_000));
        assert!(starts.contains(&120_000));
    }

    #[test]
    fn payment_settles_after_method_delay() {
        let mut s = sim(false);
        guest_at(&mut s, Route::Bill(ServiceType::Electricity));
        s.send(Event::Payment(PaymentEvent::SubmitConsumerId("PSEB-123456".into())));
        s.send(Event::Payment(PaymentEvent::ConfirmBill));
        s.send(Event::Payment(PaymentEvent::ChooseMethod(PaymentMethod::Card)));
        assert_eq!(s.view().step.unwrap().step, "processing");

        s.advance(Duration::from_millis(2_999));
        assert_eq!(s.model.queue.len(), 0);
        s.advance(Duration::from_millis(1));
        assert_eq!(s.model.queue.len(), 1);
        assert_eq!(s.model.queue.count(), 1);
        assert_eq!(s.view().step.unwrap().step, "success");
        assert_eq!(s.receipts().len(), 1);
    }

    #[test]
    fn navigating_away_mid_settlement_creates_no_record() {
        let mut s = sim(true);
        guest_at(&mut s, Route::Bill(ServiceType::Water));
        s.send(Event::Payment(PaymentEvent::SubmitConsumerId("WTR-1".into())));
        s.send(Event::Payment(PaymentEvent::ConfirmBill));
        s.send(Event::Payment(PaymentEvent::ChooseMethod(PaymentMethod::Cash)));
        s.send(Event::Session(SessionEvent::GoHome));

        s.advance(Duration::from_secs(10));
        assert!(s.model.queue.is_empty());
        assert!(s.model.workflow.is_none());
        assert!(s.receipts().is_empty());
    }

    #[test]
    fn online_complaint_is_delivered_immediately() {
        let mut s = sim(true);
        guest_at(&mut s, Route::Complaint);
        s.send(Event::Complaint(ComplaintEvent::Describe("garbage not collected".into())));
        let receipts = s.send(Event::Complaint(ComplaintEvent::Submit));

        let [receipt] = &receipts[..] else {
            panic!("expected one receipt, got {receipts:?}");
        };
        assert!(receipt.synced());
        assert_eq!(s.back_office.submitted(), &[receipt.local_id.clone()]);
        assert_eq!(s.model.queue.synced(&receipt.local_id), Some(true));
        assert_eq!(s.model.queue.count(), 0);
        // Delivered and compacted in the same pass.
        assert!(s.model.queue.is_empty());
    }

    #[test]
    fn renavigating_to_same_route_starts_fresh_workflow() {
        let mut s = sim(false);
        guest_at(&mut s, Route::Complaint);
        s.send(Event::Complaint(ComplaintEvent::Describe("pothole".into())));
        s.send(Event::Complaint(ComplaintEvent::Submit));
        let first = s.model.workflow.as_ref().map(ActiveWorkflow::attempt);

        s.send(Event::Session(SessionEvent::Navigate(Route::Complaint)));
        let wf = s.model.workflow.as_ref().unwrap();
        assert_ne!(Some(wf.attempt()), first);
        assert_eq!(wf.step_name(), "category");
    }

    #[test]
    fn admin_route_is_never_reset() {
        let mut s = sim(false);
        guest_at(&mut s, Route::Admin);
        s.advance(Duration::from_secs(600));
        assert_eq!(s.model.session.route(), Some(Route::Admin));
    }

    #[test]
    fn scan_timer_is_cancelled_when_auth_screen_is_left() {
        let mut s = sim(false);
        s.send(Event::Session(SessionEvent::Start));
        s.send(Event::Session(SessionEvent::SelectPath(Path::Citizen)));
        s.send(Event::Auth(crate::event::AuthEvent::ChooseBiometric));
        s.send(Event::Session(SessionEvent::GoHome));

        // Back on idle the idle timer is disarmed too, so nothing is left.
        assert_eq!(s.pending_timers(), 0);
    }

    #[test]
    fn view_reports_sync_progress() {
        let mut s = sim(false);
        guest_at(&mut s, Route::Complaint);
        s.send(Event::Complaint(ComplaintEvent::Describe("no water since morning".into())));
        s.send(Event::Complaint(ComplaintEvent::Submit));
        assert_eq!(s.view().pending_count, 1);

        s.send(Event::ConnectivityChanged { online: true });
        let view = s.view();
        assert_eq!(view.sync.phase, "syncing");
        assert_eq!(view.sync.remaining, 1);

        s.advance(Duration::from_secs(5));
        let view = s.view();
        assert_eq!(view.sync.phase, "idle");
        assert_eq!(view.pending_count, 0);
        assert!(view.receipt.unwrap().synced);
    }

    #[test]
    fn full_queue_leaves_payment_unfinished_without_receipt() {
        let mut config = KioskConfig::default();
        config.storage.capacity = 1;
        let mut s = Simulator::new(config, Box::new(MemoryStorage::new()));
        s.send(Event::Boot { online: false });

        guest_at(&mut s, Route::Complaint);
        s.send(Event::Complaint(ComplaintEvent::Describe("pothole on main road".into())));
        s.send(Event::Complaint(ComplaintEvent::Submit));
        assert!(s.model.last_receipt.is_some());

        s.send(Event::Session(SessionEvent::Navigate(Route::Bill(ServiceType::Gas))));
        s.send(Event::Payment(PaymentEvent::SubmitConsumerId("GAS-77".into())));
        s.send(Event::Payment(PaymentEvent::ConfirmBill));
        s.send(Event::Payment(PaymentEvent::ChooseMethod(PaymentMethod::Upi)));
        s.advance(Duration::from_secs(3));

        let view = s.view();
        let step = view.step.unwrap();
        assert_eq!(step.step, "pay");
        assert_eq!(step.message.as_deref(), Some("Could not save this request, please try again"));
        assert!(view.receipt.is_none());
        assert!(s.model.last_receipt.is_none());
        assert_eq!(s.receipts().len(), 1);
        assert_eq!(s.model.queue.len(), 1);
    }

    #[test]
    fn configure_is_ignored_mid_session() {
        let mut s = sim(false);
        guest_at(&mut s, Route::Complaint);
        let mut config = KioskConfig::default();
        config.session.idle_timeout_secs = 5;
        s.send(Event::Configure(Box::new(config.clone())));
        assert_eq!(s.model.config.session.idle_timeout_secs, 120);

        s.advance(Duration::from_secs(121));
        assert!(s.model.session.is_idle());
        s.send(Event::Configure(Box::new(config)));
        assert_eq!(s.model.config.session.idle_timeout_secs, 5);
        assert_eq!(s.model.idle.timeout(), Duration::from_secs(5));
    }
}
