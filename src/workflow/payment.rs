use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info, warn};

use super::TransitionError;
use crate::capabilities::BillLookup;
use crate::event::{PaymentEvent, ValidationError};
use crate::model::{AttemptId, ConsumerId, LocalId, ServiceType, TimerId, UnixTimeMs};
use crate::outbox::{QueueError, QueueRecord, RecordPayload};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Upi,
    Card,
    Cash,
    NetBanking,
}

impl PaymentMethod {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            PaymentMethod::Upi => "UPI",
            PaymentMethod::Card => "Card",
            PaymentMethod::Cash => "Cash",
            PaymentMethod::NetBanking => "Net Banking",
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for PaymentMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['-', '_', ' '], "").as_str() {
            "upi" => Ok(Self::Upi),
            "card" => Ok(Self::Card),
            "cash" => Ok(Self::Cash),
            "netbanking" => Ok(Self::NetBanking),
            other => Err(format!("unknown payment method: {other}")),
        }
    }
}

/// Resolved bill as returned by the lookup collaborator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bill {
    pub consumer_id: ConsumerId,
    pub consumer_name: String,
    pub service: ServiceType,
    pub amount_paise: u64,
    pub units: Option<u32>,
    pub due_date: String,
    /// True when no record existed and the lookup made one up.
    pub synthesized: bool,
}

impl Bill {
    #[must_use]
    pub fn amount_display(&self) -> String {
        format!("Rs {}.{:02}", self.amount_paise / 100, self.amount_paise % 100)
    }
}

/// What a payment record carries to the queue.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentPayload {
    pub service: ServiceType,
    pub consumer_id: ConsumerId,
    pub consumer_name: String,
    pub amount_paise: u64,
    pub method: PaymentMethod,
}

// Consumer details stay out of logs.
impl fmt::Debug for PaymentPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PaymentPayload")
            .field("service", &self.service)
            .field("amount_paise", &self.amount_paise)
            .field("method", &self.method)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "step", rename_all = "kebab-case")]
pub enum PaymentStep {
    Input {
        error: Option<ValidationError>,
    },
    Bill {
        bill: Bill,
    },
    /// `method` set means the simulated settlement is running.
    Pay {
        bill: Bill,
        method: Option<PaymentMethod>,
        error: Option<ValidationError>,
    },
    Success {
        local_id: LocalId,
        bill: Bill,
        method: PaymentMethod,
    },
}

impl PaymentStep {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            PaymentStep::Input { .. } => "input",
            PaymentStep::Bill { .. } => "bill",
            PaymentStep::Pay { method: None, .. } => "pay",
            PaymentStep::Pay { method: Some(_), .. } => "processing",
            PaymentStep::Success { .. } => "success",
        }
    }

    #[must_use]
    pub fn error(&self) -> Option<&ValidationError> {
        match self {
            PaymentStep::Input { error } | PaymentStep::Pay { error, .. } => error.as_ref(),
            _ => None,
        }
    }

    #[must_use]
    pub fn bill(&self) -> Option<&Bill> {
        match self {
            PaymentStep::Input { .. } => None,
            PaymentStep::Bill { bill }
            | PaymentStep::Pay { bill, .. }
            | PaymentStep::Success { bill, .. } => Some(bill),
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, PaymentStep::Success { .. })
    }

    fn is_processing(&self) -> bool {
        matches!(self, PaymentStep::Pay { method: Some(_), .. })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum PaymentOutcome {
    Stay,
    /// Method chosen; schedule the settlement callback for this method.
    BeginSettlement(PaymentMethod),
}

/// input -> bill -> pay -> success. Back goes one step, restart goes to
/// input; neither is possible while settling or after success.
#[derive(Clone, Debug, PartialEq)]
pub struct PaymentFlow {
    pub attempt: AttemptId,
    pub service: ServiceType,
    pub step: PaymentStep,
    pub settlement: Option<TimerId>,
}

impl PaymentFlow {
    #[must_use]
    pub fn new(attempt: AttemptId, service: ServiceType) -> Self {
        Self {
            attempt,
            service,
            step: PaymentStep::Input { error: None },
            settlement: None,
        }
    }

    pub fn handle(
        &mut self,
        event: PaymentEvent,
        bills: &dyn BillLookup,
    ) -> Result<PaymentOutcome, TransitionError> {
        if self.step.is_terminal() {
            return Err(TransitionError::Completed);
        }
        if self.step.is_processing() {
            return Err(TransitionError::Busy);
        }

        let event_name = event.name();
        let next = match (&self.step, event) {
            (PaymentStep::Input { .. }, PaymentEvent::SubmitConsumerId(raw)) => {
                let raw = raw.trim();
                if raw.is_empty() {
                    PaymentStep::Input {
                        error: Some(ValidationError::EmptyConsumerId),
                    }
                } else {
                    let bill = bills.lookup(self.service, &ConsumerId::new(raw));
                    debug!(
                        attempt = self.attempt.0,
                        synthesized = bill.synthesized,
                        amount_paise = bill.amount_paise,
                        "bill resolved"
                    );
                    PaymentStep::Bill { bill }
                }
            }
            (PaymentStep::Bill { bill }, PaymentEvent::ConfirmBill) => PaymentStep::Pay {
                bill: bill.clone(),
                method: None,
                error: None,
            },
            (PaymentStep::Pay { bill, .. }, PaymentEvent::ChooseMethod(method)) => {
                info!(attempt = self.attempt.0, %method, "payment settling");
                self.step = PaymentStep::Pay {
                    bill: bill.clone(),
                    method: Some(method),
                    error: None,
                };
                return Ok(PaymentOutcome::BeginSettlement(method));
            }
            (PaymentStep::Bill { .. }, PaymentEvent::Back) => PaymentStep::Input { error: None },
            (PaymentStep::Pay { bill, .. }, PaymentEvent::Back) => PaymentStep::Bill { bill: bill.clone() },
            (PaymentStep::Bill { .. } | PaymentStep::Pay { .. }, PaymentEvent::Restart) => {
                PaymentStep::Input { error: None }
            }
            (step, _) => {
                return Err(TransitionError::NotAllowed {
                    step: step.name(),
                    event: event_name,
                })
            }
        };
        self.step = next;
        Ok(PaymentOutcome::Stay)
    }

    /// Settlement callback fired: build the record and hand it to `file`.
    /// Success is entered only once the record is filed; if filing fails the
    /// flow returns to method selection with an inline error so the user can
    /// try again. Only valid while processing.
    pub fn complete<F>(&mut self, local_id: LocalId, now: UnixTimeMs, file: F) -> Result<QueueRecord, TransitionError>
    where
        F: FnOnce(QueueRecord) -> Result<QueueRecord, QueueError>,
    {
        let PaymentStep::Pay {
            bill,
            method: Some(method),
            ..
        } = &self.step
        else {
            return Err(match self.step {
                PaymentStep::Success { .. } => TransitionError::Completed,
                ref step => TransitionError::NotAllowed {
                    step: step.name(),
                    event: "payment_settled",
                },
            });
        };

        let (bill, method) = (bill.clone(), *method);
        let payload = PaymentPayload {
            service: self.service,
            consumer_id: bill.consumer_id.clone(),
            consumer_name: bill.consumer_name.clone(),
            amount_paise: bill.amount_paise,
            method,
        };
        self.settlement = None;

        match file(QueueRecord::new(local_id.clone(), RecordPayload::Payment(payload), now)) {
            Ok(record) => {
                self.step = PaymentStep::Success { local_id, bill, method };
                info!(attempt = self.attempt.0, local_id = %record.local_id, "payment completed");
                Ok(record)
            }
            Err(e) => {
                warn!(attempt = self.attempt.0, error = %e, "payment could not be filed");
                self.step = PaymentStep::Pay {
                    bill,
                    method: None,
                    error: Some(ValidationError::NotSaved),
                };
                Err(TransitionError::NotFiled { reason: e.to_string() })
            }
        }
    }
}
