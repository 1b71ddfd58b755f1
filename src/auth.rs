//! Citizen authentication sub-flow, running while the session is on the
//! citizen-auth screen. Identity itself comes from the external provider;
//! this machine only sequences method choice, mobile/OTP entry and the
//! timed biometric scan.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::capabilities::IdentityProvider;
use crate::event::{AuthEvent, ValidationError};
use crate::model::{AttemptId, Identity, TimerId};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "kebab-case")]
pub enum AuthStep {
    ChooseMethod,
    EnterMobile {
        error: Option<ValidationError>,
    },
    EnterOtp {
        mobile: String,
        error: Option<ValidationError>,
    },
    Scanning {
        progress_pct: u8,
    },
}

impl AuthStep {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            AuthStep::ChooseMethod => "choose-method",
            AuthStep::EnterMobile { .. } => "enter-mobile",
            AuthStep::EnterOtp { .. } => "enter-otp",
            AuthStep::Scanning { .. } => "scanning",
        }
    }

    #[must_use]
    pub fn error(&self) -> Option<&ValidationError> {
        match self {
            AuthStep::EnterMobile { error } | AuthStep::EnterOtp { error, .. } => error.as_ref(),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuthFlow {
    pub attempt: AttemptId,
    pub step: AuthStep,
    /// Pending scan tick, cancelled when the screen is left.
    #[serde(skip)]
    pub scan_timer: Option<TimerId>,
}

#[derive(Debug, PartialEq)]
pub enum AuthOutcome {
    Stay,
    /// Scan progressed; schedule the next tick.
    ScanContinues,
    Authenticated(Identity),
}

impl AuthFlow {
    #[must_use]
    pub fn new(attempt: AttemptId) -> Self {
        Self {
            attempt,
            step: AuthStep::ChooseMethod,
            scan_timer: None,
        }
    }

    pub fn handle(&mut self, event: AuthEvent, provider: &dyn IdentityProvider) -> AuthOutcome {
        match (&self.step, event) {
            (_, AuthEvent::Back) => {
                self.step = AuthStep::ChooseMethod;
            }
            (AuthStep::ChooseMethod, AuthEvent::ChooseOtp) => {
                self.step = AuthStep::EnterMobile { error: None };
            }
            (AuthStep::ChooseMethod, AuthEvent::ChooseBiometric) => {
                self.step = AuthStep::Scanning { progress_pct: 0 };
                return AuthOutcome::ScanContinues;
            }
            (AuthStep::EnterMobile { .. }, AuthEvent::SubmitMobile(raw)) => {
                self.step = match normalize_mobile(&raw) {
                    Some(mobile) => AuthStep::EnterOtp { mobile, error: None },
                    None => AuthStep::EnterMobile {
                        error: Some(ValidationError::InvalidMobile),
                    },
                };
            }
            (AuthStep::EnterOtp { mobile, .. }, AuthEvent::SubmitOtp(otp)) => {
                let mobile = mobile.clone();
                match provider.verify_otp(&mobile, otp.trim()) {
                    Some(identity) => {
                        info!(attempt = self.attempt.0, "otp verified");
                        return AuthOutcome::Authenticated(identity);
                    }
                    None => {
                        debug!(attempt = self.attempt.0, "otp mismatch");
                        self.step = AuthStep::EnterOtp {
                            mobile,
                            error: Some(ValidationError::OtpMismatch),
                        };
                    }
                }
            }
            (step, other) => {
                debug!(step = step.name(), event = ?other, "auth event ignored");
            }
        }
        AuthOutcome::Stay
    }

    /// One scheduled scan tick. Completes into the provider's biometric
    /// identity once progress reaches 100%.
    pub fn tick(&mut self, step_pct: u8, provider: &dyn IdentityProvider) -> AuthOutcome {
        self.scan_timer = None;
        let AuthStep::Scanning { progress_pct } = self.step else {
            return AuthOutcome::Stay;
        };
        let progress = progress_pct.saturating_add(step_pct).min(100);
        self.step = AuthStep::Scanning { progress_pct: progress };
        if progress < 100 {
            return AuthOutcome::ScanContinues;
        }
        match provider.biometric_identity() {
            Some(identity) => AuthOutcome::Authenticated(identity),
            None => {
                // Scanner produced nothing usable: fall back to the OTP path.
                self.step = AuthStep::EnterMobile { error: None };
                AuthOutcome::Stay
            }
        }
    }
}

/// Accepts "98765 43210", "+91 9876543210" and plain ten digits.
fn normalize_mobile(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| !c.is_whitespace() && *c != '-').collect();
    let digits = digits.strip_prefix("+91").unwrap_or(&digits);
    (digits.len() == 10 && digits.bytes().all(|b| b.is_ascii_digit())).then(|| digits.to_string())
}
