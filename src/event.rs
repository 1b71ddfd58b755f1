use serde::{Deserialize, Serialize};

use crate::capabilities::{KvError, KvKey, StoredQueue, UplinkError};
use crate::config::KioskConfig;
use crate::model::{AttemptId, GeoPoint, Identity, LocalId, Route, UnixTimeMs};
use crate::session::Screen;
use crate::workflow::complaint::CategoryId;
use crate::workflow::payment::PaymentMethod;

// --- Inline validation errors (never escalate past the step that raised them) ---

#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Please enter your consumer number")]
    EmptyConsumerId,
    #[error("Please describe the problem")]
    EmptyDescription,
    #[error("Please choose a category")]
    NoCategory,
    #[error("Enter a valid 10-digit mobile number")]
    InvalidMobile,
    #[error("OTP does not match")]
    OtpMismatch,
    #[error("Could not save this request, please try again")]
    NotSaved,
}

/// Where the kiosk user wants to go from the gateway.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Path {
    Guest,
    Citizen,
}

/// Raw input kinds that count as activity for the idle timer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Pointer,
    Touch,
    Key,
    Click,
}

// --- Session controller input ---

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SessionEvent {
    Start,
    SelectPath(Path),
    Authenticated(Identity),
    Logout,
    GoHome,
    IdleTimeout,
    Navigate(Route),
    /// Debug escape hatch: jumps anywhere, bypassing every guard.
    DevOverride(Box<Screen>),
}

// --- Citizen authentication sub-flow ---

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthEvent {
    ChooseOtp,
    ChooseBiometric,
    SubmitMobile(String),
    SubmitOtp(String),
    Back,
}

// --- Bill payment workflow ---

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentEvent {
    SubmitConsumerId(String),
    ConfirmBill,
    ChooseMethod(PaymentMethod),
    Back,
    Restart,
}

impl PaymentEvent {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::SubmitConsumerId(_) => "submit_consumer_id",
            Self::ConfirmBill => "confirm_bill",
            Self::ChooseMethod(_) => "choose_method",
            Self::Back => "back",
            Self::Restart => "restart",
        }
    }
}

// --- Complaint workflow ---

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ComplaintEvent {
    SelectCategory(CategoryId),
    /// Free text, typed or transcribed from speech; the category is inferred.
    Describe(String),
    SetDescription(String),
    AttachPhoto(String),
    /// `None` means the device could not provide a fix.
    AttachLocation(Option<GeoPoint>),
    Submit,
    Back,
}

impl ComplaintEvent {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::SelectCategory(_) => "select_category",
            Self::Describe(_) => "describe",
            Self::SetDescription(_) => "set_description",
            Self::AttachPhoto(_) => "attach_photo",
            Self::AttachLocation(_) => "attach_location",
            Self::Submit => "submit",
            Self::Back => "back",
        }
    }
}

// --- Top-level event: no None variant, large variants boxed ---

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Event {
    /// Applied only while the kiosk is idle.
    Configure(Box<KioskConfig>),
    Boot { online: bool },
    Activity(ActivityKind),
    Session(SessionEvent),
    Auth(AuthEvent),
    Payment(PaymentEvent),
    Complaint(ComplaintEvent),
    ConnectivityChanged { online: bool },

    // Scheduled callbacks
    IdleTimerFired { armed_at: UnixTimeMs, generation: u64 },
    ScanTick { attempt: AttemptId },
    PaymentSettled { attempt: AttemptId },
    SyncTick { run: AttemptId },
    SyncRetry { run: AttemptId },

    // Shell responses
    QueueLoaded(Box<Result<StoredQueue, KvError>>),
    StoreFailed { key: KvKey, error: KvError },
    Delivered {
        pass: AttemptId,
        local_id: LocalId,
        result: Result<(), UplinkError>,
    },
}

impl Event {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Configure(_) => "configure",
            Self::Boot { .. } => "boot",
            Self::Activity(_) => "activity",
            Self::Session(_) => "session",
            Self::Auth(_) => "auth",
            Self::Payment(_) => "payment",
            Self::Complaint(_) => "complaint",
            Self::ConnectivityChanged { .. } => "connectivity_changed",
            Self::IdleTimerFired { .. } => "idle_timer_fired",
            Self::ScanTick { .. } => "scan_tick",
            Self::PaymentSettled { .. } => "payment_settled",
            Self::SyncTick { .. } => "sync_tick",
            Self::SyncRetry { .. } => "sync_retry",
            Self::QueueLoaded(_) => "queue_loaded",
            Self::StoreFailed { .. } => "store_failed",
            Self::Delivered { .. } => "delivered",
        }
    }

    /// True for everything a person at the kiosk produced. These rearm the
    /// idle timer; timer fires and connectivity changes do not.
    #[must_use]
    pub fn is_user_initiated(&self) -> bool {
        match self {
            Self::Activity(_)
            | Self::Auth(_)
            | Self::Payment(_)
            | Self::Complaint(_) => true,
            Self::Session(ev) => !matches!(
                ev,
                SessionEvent::IdleTimeout | SessionEvent::DevOverride(_)
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_fires_are_not_activity() {
        assert!(!Event::IdleTimerFired { armed_at: UnixTimeMs(0), generation: 1 }.is_user_initiated());
        assert!(!Event::SyncTick { run: AttemptId(1) }.is_user_initiated());
        assert!(!Event::ConnectivityChanged { online: true }.is_user_initiated());
        assert!(!Event::Session(SessionEvent::IdleTimeout).is_user_initiated());
        assert!(!Event::Delivered {
            pass: AttemptId(1),
            local_id: LocalId::new("a"),
            result: Ok(()),
        }
        .is_user_initiated());
    }

    #[test]
    fn taps_are_activity() {
        assert!(Event::Activity(ActivityKind::Touch).is_user_initiated());
        assert!(Event::Session(SessionEvent::Start).is_user_initiated());
        assert!(Event::Payment(PaymentEvent::ConfirmBill).is_user_initiated());
    }

    #[test]
    fn validation_messages_are_user_facing() {
        assert_eq!(ValidationError::OtpMismatch.to_string(), "OTP does not match");
    }

    #[test]
    fn event_size_is_reasonable() {
        let size = std::mem::size_of::<Event>();
        assert!(size <= 128, "Event enum is {size} bytes, box more variants");
    }
}
