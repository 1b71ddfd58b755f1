use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info, warn};

use super::TransitionError;
use crate::event::{ComplaintEvent, ValidationError};
use crate::model::{AttemptId, GeoPoint, LocalId, UnixTimeMs};
use crate::outbox::{QueueError, QueueRecord, RecordPayload};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategoryId {
    Electricity,
    Water,
    Streetlight,
    Garbage,
    Roads,
    Drainage,
    Other,
}

pub struct Category {
    pub id: CategoryId,
    pub label: &'static str,
    pub keywords: &'static [&'static str],
}

/// Catalog order is also inference priority.
pub const CATALOG: &[Category] = &[
    Category {
        id: CategoryId::Electricity,
        label: "Electricity",
        keywords: &["power cut", "electricity", "no power", "voltage", "transformer", "outage", "meter"],
    },
    Category {
        id: CategoryId::Water,
        label: "Water Supply",
        keywords: &["no water", "water supply", "leak", "pipeline", "dirty water", "tap"],
    },
    Category {
        id: CategoryId::Streetlight,
        label: "Streetlight",
        keywords: &["street light", "streetlight", "lamp post", "pole light"],
    },
    Category {
        id: CategoryId::Garbage,
        label: "Garbage",
        keywords: &["garbage", "trash", "waste", "dustbin", "litter"],
    },
    Category {
        id: CategoryId::Roads,
        label: "Roads",
        keywords: &["pothole", "road", "footpath", "speed breaker"],
    },
    Category {
        id: CategoryId::Drainage,
        label: "Drainage",
        keywords: &["drain", "sewer", "sewage", "waterlogging", "overflow"],
    },
    Category {
        id: CategoryId::Other,
        label: "Other",
        keywords: &[],
    },
];

impl CategoryId {
    #[must_use]
    pub fn category(self) -> &'static Category {
        CATALOG
            .iter()
            .find(|c| c.id == self)
            .unwrap_or(&CATALOG[CATALOG.len() - 1])
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        self.category().label
    }
}

impl fmt::Display for CategoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for CategoryId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase().replace([' ', '-', '_'], "");
        CATALOG
            .iter()
            .find(|c| {
                c.label.to_ascii_lowercase().replace(' ', "") == needle
                    || format!("{:?}", c.id).to_ascii_lowercase() == needle
            })
            .map(|c| c.id)
            .ok_or_else(|| format!("unknown category: {s}"))
    }
}

/// Keyword match of free text against labels and keywords. First match in
/// catalog order wins.
#[must_use]
pub fn infer_category(text: &str) -> Option<CategoryId> {
    let text = text.to_lowercase();
    if text.trim().is_empty() {
        return None;
    }
    CATALOG
        .iter()
        .find(|c| {
            text.contains(&c.label.to_lowercase()) || c.keywords.iter().any(|k| text.contains(k))
        })
        .map(|c| c.id)
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplaintPayload {
    pub category: CategoryId,
    pub description: String,
    pub photo: Option<String>,
    pub location: GeoPoint,
    /// No device fix; `location` is the kiosk's own coordinates.
    pub location_is_default: bool,
}

impl fmt::Debug for ComplaintPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComplaintPayload")
            .field("category", &self.category)
            .field("description_len", &self.description.len())
            .field("has_photo", &self.photo.is_some())
            .field("location_is_default", &self.location_is_default)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "step", rename_all = "kebab-case")]
pub enum ComplaintStep {
    Category {
        error: Option<ValidationError>,
        /// Text that did not match any category, kept as the description
        /// once a category is picked by hand.
        unmatched: Option<String>,
    },
    Details {
        category: CategoryId,
        description: String,
        photo: Option<String>,
        location: Option<GeoPoint>,
        location_is_default: bool,
        error: Option<ValidationError>,
    },
    Done {
        local_id: LocalId,
        category: CategoryId,
    },
}

impl ComplaintStep {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ComplaintStep::Category { .. } => "category",
            ComplaintStep::Details { .. } => "details",
            ComplaintStep::Done { .. } => "done",
        }
    }

    #[must_use]
    pub fn error(&self) -> Option<&ValidationError> {
        match self {
            ComplaintStep::Category { error, .. } | ComplaintStep::Details { error, .. } => error.as_ref(),
            ComplaintStep::Done { .. } => None,
        }
    }

    #[must_use]
    pub fn category(&self) -> Option<CategoryId> {
        match self {
            ComplaintStep::Category { .. } => None,
            ComplaintStep::Details { category, .. } | ComplaintStep::Done { category, .. } => Some(*category),
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, ComplaintStep::Done { .. })
    }

    fn details(category: CategoryId, description: String) -> Self {
        ComplaintStep::Details {
            category,
            description,
            photo: None,
            location: None,
            location_is_default: false,
            error: None,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ComplaintOutcome {
    Stay,
    /// Description present; the caller files the record via
    /// [`ComplaintFlow::complete`].
    ReadyToFile,
}

/// category -> details -> done.
#[derive(Clone, Debug, PartialEq)]
pub struct ComplaintFlow {
    pub attempt: AttemptId,
    pub step: ComplaintStep,
}

impl ComplaintFlow {
    #[must_use]
    pub fn new(attempt: AttemptId) -> Self {
        Self {
            attempt,
            step: ComplaintStep::Category {
                error: None,
                unmatched: None,
            },
        }
    }

    pub fn handle(&mut self, event: ComplaintEvent) -> Result<ComplaintOutcome, TransitionError> {
        if self.step.is_terminal() {
            return Err(TransitionError::Completed);
        }
        let event_name = event.name();
        match (&mut self.step, event) {
            (ComplaintStep::Category { unmatched, .. }, ComplaintEvent::SelectCategory(category)) => {
                let description = unmatched.take().unwrap_or_default();
                self.step = ComplaintStep::details(category, description);
            }
            (ComplaintStep::Category { .. }, ComplaintEvent::Describe(text)) => {
                match infer_category(&text) {
                    Some(category) => {
                        debug!(attempt = self.attempt.0, ?category, "category inferred");
                        self.step = ComplaintStep::details(category, text.trim().to_string());
                    }
                    None => {
                        let text = text.trim();
                        self.step = ComplaintStep::Category {
                            error: Some(ValidationError::NoCategory),
                            unmatched: (!text.is_empty()).then(|| text.to_string()),
                        };
                    }
                }
            }
            (ComplaintStep::Category { error, .. }, ComplaintEvent::Submit) => {
                *error = Some(ValidationError::NoCategory);
            }

            (
                ComplaintStep::Details {
                    description, error, ..
                },
                ComplaintEvent::Describe(text) | ComplaintEvent::SetDescription(text),
            ) => {
                *description = text.trim().to_string();
                *error = None;
            }
            (ComplaintStep::Details { category, .. }, ComplaintEvent::SelectCategory(new)) => {
                *category = new;
            }
            (ComplaintStep::Details { photo, .. }, ComplaintEvent::AttachPhoto(reference)) => {
                *photo = Some(reference);
            }
            (
                ComplaintStep::Details {
                    location,
                    location_is_default,
                    ..
                },
                ComplaintEvent::AttachLocation(fix),
            ) => {
                *location_is_default = fix.is_none();
                *location = Some(fix.unwrap_or(GeoPoint::KIOSK_DEFAULT));
            }
            (
                ComplaintStep::Details {
                    description, error, ..
                },
                ComplaintEvent::Submit,
            ) => {
                if description.trim().is_empty() {
                    *error = Some(ValidationError::EmptyDescription);
                } else {
                    return Ok(ComplaintOutcome::ReadyToFile);
                }
            }
            (ComplaintStep::Details { .. }, ComplaintEvent::Back) => {
                self.step = ComplaintStep::Category {
                    error: None,
                    unmatched: None,
                };
            }

            (step, _) => {
                return Err(TransitionError::NotAllowed {
                    step: step.name(),
                    event: event_name,
                })
            }
        }
        Ok(ComplaintOutcome::Stay)
    }

    /// Builds the record and hands it to `file`; `done` is entered only
    /// once the record is filed. Re-checks the description so a record can
    /// never be filed without one. A filing failure stays on `details` with
    /// an inline error and the user's input intact.
    pub fn complete<F>(&mut self, local_id: LocalId, now: UnixTimeMs, file: F) -> Result<QueueRecord, TransitionError>
    where
        F: FnOnce(QueueRecord) -> Result<QueueRecord, QueueError>,
    {
        let ComplaintStep::Details {
            category,
            description,
            photo,
            location,
            location_is_default,
            error,
        } = &mut self.step
        else {
            return Err(match self.step {
                ComplaintStep::Done { .. } => TransitionError::Completed,
                ref step => TransitionError::NotAllowed {
                    step: step.name(),
                    event: "submit",
                },
            });
        };
        if description.trim().is_empty() {
            *error = Some(ValidationError::EmptyDescription);
            return Err(TransitionError::NotAllowed {
                step: "details",
                event: "submit",
            });
        }

        // Without an explicit fix the complaint is pinned to the kiosk.
        let (point, is_default) = match location {
            Some(point) => (*point, *location_is_default),
            None => (GeoPoint::KIOSK_DEFAULT, true),
        };
        let payload = ComplaintPayload {
            category: *category,
            description: description.clone(),
            photo: photo.clone(),
            location: point,
            location_is_default: is_default,
        };

        match file(QueueRecord::new(local_id.clone(), RecordPayload::Complaint(payload), now)) {
            Ok(record) => {
                let category = *category;
                self.step = ComplaintStep::Done { local_id, category };
                info!(attempt = self.attempt.0, local_id = %record.local_id, ?category, "complaint filed");
                Ok(record)
            }
            Err(e) => {
                warn!(attempt = self.attempt.0, error = %e, "complaint could not be filed");
                *error = Some(ValidationError::NotSaved);
                Err(TransitionError::NotFiled { reason: e.to_string() })
            }
        }
    }
}
