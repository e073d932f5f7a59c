//! Wire and storage types shared between the site client and the REST API.
//!
//! Field names follow the API's camelCase JSON.

pub mod analytics;
pub mod auth;
pub mod content;
pub mod forms;

use serde::{Deserialize, Serialize};

pub use analytics::{AnalyticsEvent, EventCategory, EventKind, TrackEventRequest};
pub use content::{ContactInfo, ContentFilter, Project, Service, SubmissionRecord, Testimonial};
pub use forms::{
    CareerForm, ContactForm, FeedbackForm, FormData, FormType, ReachUsForm, SubmitFormRequest,
    SubmitFormResponse,
};

/// Identifies a browser profile (or, natively, a data directory) across sessions.
#[derive(
    Clone,
    Debug,
    Serialize,
    Deserialize,
    Hash,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    schemars::JsonSchema,
)]
#[serde(transparent)]
pub struct VisitorId(String);

/// Groups the events emitted within one visit.
#[derive(
    Clone,
    Debug,
    Serialize,
    Deserialize,
    Hash,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    schemars::JsonSchema,
)]
#[serde(transparent)]
pub struct SessionId(String);

macro_rules! string_id {
    ($name:ident) => {
        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(VisitorId);
string_id!(SessionId);

/// Body of every non-2xx response.
#[derive(Debug, Serialize, Deserialize, Clone, schemars::JsonSchema)]
pub struct ApiErrorBody {
    pub error: String,
}

/// Generic acknowledgement returned by write endpoints.
#[derive(Debug, Serialize, Deserialize, Clone, Default, schemars::JsonSchema)]
pub struct Ack {
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, schemars::JsonSchema)]
pub struct HealthStatus {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}
