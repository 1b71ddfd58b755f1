use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// --- Typed IDs ---

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

typed_id!(LocalId);
typed_id!(ConsumerId);

/// Handle for a scheduled callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimerId(pub u64);

/// Identifies one workflow attempt, auth attempt or sync run. Scheduled
/// callbacks carry it so a fire against a discarded instance is ignored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct AttemptId(pub u64);

impl AttemptId {
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

/// Explicit timestamp unit.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    #[must_use]
    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
        )
    }

    #[must_use]
    pub const fn add_millis(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms))
    }

    #[must_use]
    pub const fn millis_since(self, earlier: Self) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

// --- Service catalogue ---

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceType {
    Electricity,
    Water,
    Gas,
    PropertyTax,
}

impl ServiceType {
    pub const ALL: [ServiceType; 4] = [
        ServiceType::Electricity,
        ServiceType::Water,
        ServiceType::Gas,
        ServiceType::PropertyTax,
    ];

    #[must_use]
    pub const fn slug(self) -> &'static str {
        match self {
            ServiceType::Electricity => "electricity",
            ServiceType::Water => "water",
            ServiceType::Gas => "gas",
            ServiceType::PropertyTax => "property-tax",
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unknown service type: {0}")]
    UnknownService(String),
    #[error("unknown route: {0}")]
    UnknownRoute(String),
}

impl FromStr for ServiceType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        ServiceType::ALL
            .into_iter()
            .find(|svc| svc.slug() == needle)
            .ok_or(ParseError::UnknownService(needle))
    }
}

// --- Routes within the guest / citizen screens ---

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(tag = "route", content = "service", rename_all = "kebab-case")]
pub enum Route {
    #[default]
    Home,
    Bill(ServiceType),
    Complaint,
    Admin,
}

impl Route {
    /// Admin is the only route exempt from the idle reset.
    #[must_use]
    pub const fn is_admin(self) -> bool {
        matches!(self, Route::Admin)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Home => f.write_str("home"),
            Route::Bill(svc) => write!(f, "bill/{svc}"),
            Route::Complaint => f.write_str("complaint"),
            Route::Admin => f.write_str("admin"),
        }
    }
}

impl FromStr for Route {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().trim_start_matches('/');
        match s {
            "" | "home" => Ok(Route::Home),
            "complaint" => Ok(Route::Complaint),
            "admin" => Ok(Route::Admin),
            other => match other.split_once(['/', ':']) {
                Some(("bill", svc)) => Ok(Route::Bill(svc.parse()?)),
                _ => Err(ParseError::UnknownRoute(other.to_string())),
            },
        }
    }
}

// --- Identity handed over by the identity provider ---

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub contact_ref: String,
    pub citizen_ref: Option<String>,
}

// Contact details stay out of logs.
impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("name", &self.name)
            .field("contact_ref_present", &!self.contact_ref.is_empty())
            .field("citizen_ref", &self.citizen_ref)
            .finish()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Guest,
    Citizen,
}

/// Validated lat/lon
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    /// Used when the kiosk has no geolocation fix.
    pub const KIOSK_DEFAULT: GeoPoint = GeoPoint {
        lat: 30.7333,
        lon: 76.7794,
    };

    pub fn new(lat: f64, lon: f64) -> Option<Self> {
        if !lat.is_finite() || !lon.is_finite() {
            return None;
        }
        if !(-90.0..=90.0).contains(&lat) {
            return None;
        }
        if !(-180.0..=180.0).contains(&lon) {
            return None;
        }
        Some(Self { lat, lon })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_parses_bill_paths() {
        assert_eq!("bill/electricity".parse(), Ok(Route::Bill(ServiceType::Electricity)));
        assert_eq!("/bill:water".parse(), Ok(Route::Bill(ServiceType::Water)));
        assert_eq!("home".parse(), Ok(Route::Home));
        assert_eq!("admin".parse(), Ok(Route::Admin));
        assert!("bill/unknown".parse::<Route>().is_err());
        assert!("settings".parse::<Route>().is_err());
    }

    #[test]
    fn route_display_roundtrips_through_parse() {
        for route in [Route::Home, Route::Complaint, Route::Admin, Route::Bill(ServiceType::PropertyTax)] {
            assert_eq!(route.to_string().parse::<Route>(), Ok(route));
        }
    }

    #[test]
    fn geo_point_rejects_out_of_range() {
        assert!(GeoPoint::new(91.0, 0.0).is_none());
        assert!(GeoPoint::new(0.0, f64::NAN).is_none());
        assert!(GeoPoint::new(30.0, 76.0).is_some());
    }

    #[test]
    fn identity_debug_hides_contact() {
        let id = Identity {
            name: "A".into(),
            contact_ref: "9876543210".into(),
            citizen_ref: None,
        };
        assert!(!format!("{id:?}").contains("9876543210"));
    }

    #[test]
    fn time_arithmetic_saturates() {
        let t = UnixTimeMs(10);
        assert_eq!(t.millis_since(UnixTimeMs(20)), 0);
        assert_eq!(UnixTimeMs(u64::MAX).add_millis(5), UnixTimeMs(u64::MAX));
    }
}
