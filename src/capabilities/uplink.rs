use crux_core::capability::{Capability, CapabilityContext, Operation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::LocalId;
use crate::outbox::QueueRecord;

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum UplinkError {
    #[error("network unavailable")]
    Offline,
    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("server rejected record: {reason}")]
    Rejected { reason: String },
}

impl UplinkError {
    /// A rejection is final: sending the same record again gets the same
    /// answer.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, UplinkError::Rejected { .. })
    }
}

/// Delivery of one queued record to the back office.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UplinkOperation {
    pub record: QueueRecord,
}

impl Operation for UplinkOperation {
    type Output = Result<(), UplinkError>;
}

pub struct Uplink<Ev> {
    context: CapabilityContext<UplinkOperation, Ev>,
}

impl<Ev> Capability<Ev> for Uplink<Ev> {
    type Operation = UplinkOperation;
    type MappedSelf<MappedEv> = Uplink<MappedEv>;

    fn map_event<F, NewEv>(&self, f: F) -> Self::MappedSelf<NewEv>
    where
        F: Fn(NewEv) -> Ev + Send + Sync + 'static,
        Ev: 'static,
        NewEv: 'static + Send,
    {
        Uplink::new(self.context.map_event(f))
    }
}

impl<Ev> Uplink<Ev>
where
    Ev: Send + 'static,
{
    pub fn new(context: CapabilityContext<UplinkOperation, Ev>) -> Self {
        Self { context }
    }

    pub fn submit<F>(&self, record: QueueRecord, callback: F)
    where
        F: FnOnce(Result<(), UplinkError>) -> Ev + Send + 'static,
    {
        let ctx = self.context.clone();
        self.context.spawn(async move {
            let result = ctx.request_from_shell(UplinkOperation { record }).await;
            ctx.update_app(callback(result));
        });
    }
}

// ============================================================================
// Shell side
// ============================================================================

/// What the shell hands uplink requests to.
pub trait BackOffice {
    fn submit(&mut self, record: &QueueRecord) -> Result<(), UplinkError>;
}

/// The deployed kiosk has no back office; delivery always succeeds.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimulatedBackOffice;

impl BackOffice for SimulatedBackOffice {
    fn submit(&mut self, _record: &QueueRecord) -> Result<(), UplinkError> {
        Ok(())
    }
}

/// Remembers every accepted submission and can be scripted to fail the
/// next few.
#[derive(Debug, Default)]
pub struct RecordingBackOffice {
    submitted: Vec<LocalId>,
    attempts: usize,
    script: Vec<UplinkError>,
}

impl RecordingBackOffice {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` submissions time out.
    pub fn fail_next(&mut self, n: usize) {
        self.script = vec![UplinkError::Timeout { timeout_ms: 10_000 }; n];
    }

    /// The next `n` submissions are refused by the server.
    pub fn reject_next(&mut self, n: usize, reason: &str) {
        self.script = vec![
            UplinkError::Rejected {
                reason: reason.to_string(),
            };
            n
        ];
    }

    /// Ids the back office accepted, in arrival order.
    pub fn submitted(&self) -> &[LocalId] {
        &self.submitted
    }

    /// Every submission, accepted or not.
    pub fn attempts(&self) -> usize {
        self.attempts
    }
}

impl BackOffice for RecordingBackOffice {
    fn submit(&mut self, record: &QueueRecord) -> Result<(), UplinkError> {
        self.attempts += 1;
        if !self.script.is_empty() {
            return Err(self.script.remove(0));
        }
        self.submitted.push(record.local_id.clone());
        Ok(())
    }
}
