//! Guided task machines. Each instance covers exactly one attempt: it is
//! created when its route is entered and dropped on completion or when the
//! user navigates away. The record for the offline queue is built on the
//! way into the terminal step, and the step is entered only once the record
//! is filed.

pub mod complaint;
pub mod payment;

use thiserror::Error;

use crate::capabilities::Scheduler;
use crate::event::ValidationError;
use crate::model::{AttemptId, Route};

use self::complaint::ComplaintFlow;
use self::payment::PaymentFlow;

/// A workflow event that the current step does not accept. Logged and
/// dropped by the app; never shown to the user.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("'{event}' is not valid in step '{step}'")]
    NotAllowed {
        step: &'static str,
        event: &'static str,
    },

    #[error("payment is being processed")]
    Busy,

    #[error("workflow already completed")]
    Completed,

    #[error("record could not be filed: {reason}")]
    NotFiled { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActiveWorkflow {
    Payment(PaymentFlow),
    Complaint(ComplaintFlow),
}

impl ActiveWorkflow {
    /// The workflow a route owns, if any.
    pub fn for_route(route: Route, attempt: AttemptId) -> Option<Self> {
        match route {
            Route::Bill(service) => Some(Self::Payment(PaymentFlow::new(attempt, service))),
            Route::Complaint => Some(Self::Complaint(ComplaintFlow::new(attempt))),
            Route::Home | Route::Admin => None,
        }
    }

    pub fn attempt(&self) -> AttemptId {
        match self {
            Self::Payment(flow) => flow.attempt,
            Self::Complaint(flow) => flow.attempt,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Payment(_) => "payment",
            Self::Complaint(_) => "complaint",
        }
    }

    pub fn step_name(&self) -> &'static str {
        match self {
            Self::Payment(flow) => flow.step.name(),
            Self::Complaint(flow) => flow.step.name(),
        }
    }

    pub fn error(&self) -> Option<&ValidationError> {
        match self {
            Self::Payment(flow) => flow.step.error(),
            Self::Complaint(flow) => flow.step.error(),
        }
    }

    /// Cancels every callback this instance scheduled. Called before the
    /// instance is dropped so nothing fires against discarded state.
    pub fn teardown(&mut self, scheduler: &dyn Scheduler) {
        if let Self::Payment(flow) = self {
            if let Some(timer) = flow.settlement.take() {
                scheduler.cancel(timer);
            }
        }
    }
}
