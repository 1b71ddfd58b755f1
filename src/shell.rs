//! Runtime host for the engine: owns the crux core, the queue storage
//! backend, the back office and the tokio timers, and carries out every
//! effect the core asks for. Timer fires come back through the same input
//! channel as events from the environment.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use crux_core::{Core, Request};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::app::{App, ViewModel};
use crate::capabilities::{
    serve, BackOffice, Capabilities, Effect, QueueStorage, SimulatedBackOffice, TimerOperation, TimerOutput,
};
use crate::config::KioskConfig;
use crate::event::{ActivityKind, AuthEvent, ComplaintEvent, Event, Path, PaymentEvent, SessionEvent};
use crate::model::{GeoPoint, Route, TimerId};
use crate::outbox::QueueRecord;
use crate::workflow::complaint::CategoryId;
use crate::workflow::payment::PaymentMethod;

/// One parsed line of operator input.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Dispatch(Vec<Event>),
    Status,
    Quit,
}

#[derive(Debug)]
pub enum Input {
    Event(Event),
    TimerFired(TimerId),
}

pub struct Shell {
    core: Core<Effect, App>,
    storage: Box<dyn QueueStorage>,
    back_office: Box<dyn BackOffice>,
    timers: HashMap<TimerId, (Request<TimerOperation>, JoinHandle<()>)>,
    tx: UnboundedSender<Input>,
    rx: UnboundedReceiver<Input>,
}

impl Shell {
    /// Must be called inside a tokio runtime; timers are spawned on it.
    pub fn new(config: KioskConfig, storage: Box<dyn QueueStorage>) -> Self {
        let (tx, rx) = unbounded_channel();
        let mut shell = Self {
            core: Core::new::<Capabilities>(),
            storage,
            back_office: Box::new(SimulatedBackOffice),
            timers: HashMap::new(),
            tx,
            rx,
        };
        shell.dispatch(Event::Configure(Box::new(config)));
        shell
    }

    #[must_use]
    pub fn with_back_office(mut self, back_office: impl BackOffice + 'static) -> Self {
        self.back_office = Box::new(back_office);
        self
    }

    /// Sender for events from the environment.
    pub fn sender(&self) -> UnboundedSender<Input> {
        self.tx.clone()
    }

    /// Returns the receipts issued while handling the event.
    pub fn dispatch(&mut self, event: Event) -> Vec<QueueRecord> {
        let effects = self.core.process_event(event);
        self.process(effects)
    }

    pub fn handle(&mut self, input: Input) -> Vec<QueueRecord> {
        match input {
            Input::Event(event) => self.dispatch(event),
            Input::TimerFired(id) => match self.timers.remove(&id) {
                Some((mut request, _)) => {
                    let effects = self.core.resolve(&mut request, TimerOutput::Fired);
                    self.process(effects)
                }
                None => {
                    debug!(timer = id.0, "fire for a cancelled timer ignored");
                    Vec::new()
                }
            },
        }
    }

    /// Next timer fire or anything sent via [`sender`].
    ///
    /// [`sender`]: Shell::sender
    pub async fn next_input(&mut self) -> Option<Input> {
        self.rx.recv().await
    }

    pub fn view(&self) -> ViewModel {
        self.core.view()
    }

    fn process(&mut self, effects: Vec<Effect>) -> Vec<QueueRecord> {
        let mut work: VecDeque<Effect> = effects.into();
        let mut receipts = Vec::new();

        while let Some(effect) = work.pop_front() {
            match effect {
                Effect::Render(_) => {}
                Effect::Receipt(request) => {
                    let record = request.operation.record;
                    info!(
                        local_id = %record.local_id,
                        kind = ?record.kind(),
                        synced = record.synced(),
                        "receipt ready"
                    );
                    receipts.push(record);
                }
                Effect::Timer(mut request) => match request.operation.clone() {
                    TimerOperation::Start { id, after_ms } => {
                        let tx = self.tx.clone();
                        let handle = tokio::spawn(async move {
                            tokio::time::sleep(Duration::from_millis(after_ms)).await;
                            // The shell may already be gone.
                            let _ = tx.send(Input::TimerFired(id));
                        });
                        self.timers.insert(id, (request, handle));
                    }
                    TimerOperation::Cancel { id } => {
                        if let Some((mut start, handle)) = self.timers.remove(&id) {
                            handle.abort();
                            work.extend(self.core.resolve(&mut start, TimerOutput::Cancelled));
                        }
                        work.extend(self.core.resolve(&mut request, TimerOutput::Cancelled));
                    }
                },
                Effect::Uplink(mut request) => {
                    let result = self.back_office.submit(&request.operation.record);
                    work.extend(self.core.resolve(&mut request, result));
                }
                Effect::Store(mut request) => {
                    let output = serve(self.storage.as_mut(), &request.operation);
                    work.extend(self.core.resolve(&mut request, output));
                }
            }
        }
        receipts
    }
}

/// Parses one operator command. Every command except `status` and `quit` is
/// preceded by a touch, the way a tap on the screen would be.
pub fn parse_command(line: &str) -> Result<Command, String> {
    let line = line.trim();
    let (cmd, arg) = match line.split_once(char::is_whitespace) {
        Some((cmd, arg)) => (cmd, arg.trim()),
        None => (line, ""),
    };
    let need_arg = |what: &str| {
        if arg.is_empty() {
            Err(format!("{cmd}: missing {what}"))
        } else {
            Ok(arg.to_string())
        }
    };

    let event = match cmd {
        "status" => return Ok(Command::Status),
        "quit" | "exit" => return Ok(Command::Quit),
        "online" => return Ok(Command::Dispatch(vec![Event::ConnectivityChanged { online: true }])),
        "offline" => return Ok(Command::Dispatch(vec![Event::ConnectivityChanged { online: false }])),

        "start" => Event::Session(SessionEvent::Start),
        "guest" => Event::Session(SessionEvent::SelectPath(Path::Guest)),
        "citizen" => Event::Session(SessionEvent::SelectPath(Path::Citizen)),
        "home" => Event::Session(SessionEvent::GoHome),
        "logout" => Event::Session(SessionEvent::Logout),
        "nav" => {
            let route: Route = need_arg("route")?.parse().map_err(|e| format!("{e}"))?;
            Event::Session(SessionEvent::Navigate(route))
        }

        "otp-method" => Event::Auth(AuthEvent::ChooseOtp),
        "scan" => Event::Auth(AuthEvent::ChooseBiometric),
        "mobile" => Event::Auth(AuthEvent::SubmitMobile(need_arg("number")?)),
        "otp" => Event::Auth(AuthEvent::SubmitOtp(need_arg("code")?)),

        "consumer" => Event::Payment(PaymentEvent::SubmitConsumerId(arg.to_string())),
        "confirm" => Event::Payment(PaymentEvent::ConfirmBill),
        "method" => {
            let method: PaymentMethod = need_arg("method")?.parse()?;
            Event::Payment(PaymentEvent::ChooseMethod(method))
        }
        "restart" => Event::Payment(PaymentEvent::Restart),

        "describe" => Event::Complaint(ComplaintEvent::Describe(arg.to_string())),
        "details" => Event::Complaint(ComplaintEvent::SetDescription(arg.to_string())),
        "category" => {
            let category: CategoryId = need_arg("category")?.parse()?;
            Event::Complaint(ComplaintEvent::SelectCategory(category))
        }
        "photo" => Event::Complaint(ComplaintEvent::AttachPhoto(if arg.is_empty() {
            "camera://capture".to_string()
        } else {
            arg.to_string()
        })),
        "locate" => {
            let fix = match arg.split_once(',') {
                Some((lat, lon)) => {
                    let lat = lat.trim().parse::<f64>().map_err(|e| e.to_string())?;
                    let lon = lon.trim().parse::<f64>().map_err(|e| e.to_string())?;
                    Some(GeoPoint::new(lat, lon).ok_or("locate: coordinates out of range")?)
                }
                None => None,
            };
            Event::Complaint(ComplaintEvent::AttachLocation(fix))
        }
        "submit" => Event::Complaint(ComplaintEvent::Submit),

        // `back` goes to whichever machine is in front; the others ignore it.
        "back" => {
            return Ok(Command::Dispatch(vec![
                Event::Activity(ActivityKind::Touch),
                Event::Auth(AuthEvent::Back),
                Event::Payment(PaymentEvent::Back),
                Event::Complaint(ComplaintEvent::Back),
            ]))
        }

        "" => return Err("empty command".into()),
        other => return Err(format!("unknown command: {other}")),
    };

    debug!(command = cmd, "parsed");
    Ok(Command::Dispatch(vec![Event::Activity(ActivityKind::Touch), event]))
}
