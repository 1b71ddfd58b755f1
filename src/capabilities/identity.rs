use crate::model::Identity;

/// External identity provider behind the citizen-auth screen. The core
/// only needs a non-null identity back; it does not inspect its shape.
pub trait IdentityProvider {
    fn verify_otp(&self, mobile: &str, otp: &str) -> Option<Identity>;
    fn biometric_identity(&self) -> Option<Identity>;
}

/// Stand-in provider for the kiosk demo deployment: one expected OTP, one
/// enrolled citizen.
#[derive(Debug, Clone)]
pub struct DemoIdentityProvider {
    expected_otp: String,
}

impl DemoIdentityProvider {
    pub const CITIZEN_NAME: &'static str = "Vivek Kumar";
    const CITIZEN_REF: &'static str = "PB-CIT-204918";

    pub fn new(expected_otp: impl Into<String>) -> Self {
        Self {
            expected_otp: expected_otp.into(),
        }
    }

    fn citizen(contact_ref: &str) -> Identity {
        Identity {
            name: Self::CITIZEN_NAME.to_string(),
            contact_ref: contact_ref.to_string(),
            citizen_ref: Some(Self::CITIZEN_REF.to_string()),
        }
    }
}

impl IdentityProvider for DemoIdentityProvider {
    fn verify_otp(&self, mobile: &str, otp: &str) -> Option<Identity> {
        (!otp.is_empty() && otp == self.expected_otp).then(|| Self::citizen(mobile))
    }

    fn biometric_identity(&self) -> Option<Identity> {
        Some(Self::citizen("biometric"))
    }
}
