use serde::{Deserialize, Serialize};

use crate::{SessionId, VisitorId};

#[derive(
    Clone,
    Copy,
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
#[serde(rename_all = "snake_case")]
pub enum FormType {
    Contact,
    Career,
    Feedback,
    ReachUs,
}

impl FormType {
    pub const ALL: [FormType; 4] = [
        FormType::Contact,
        FormType::Career,
        FormType::Feedback,
        FormType::ReachUs,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FormType::Contact => "contact",
            FormType::Career => "career",
            FormType::Feedback => "feedback",
            FormType::ReachUs => "reach_us",
        }
    }
}

impl std::fmt::Display for FormType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for FormType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "contact" => Ok(FormType::Contact),
            "career" => Ok(FormType::Career),
            "feedback" | "testimonial" => Ok(FormType::Feedback),
            "reach_us" | "reach-us" => Ok(FormType::ReachUs),
            other => Err(format!("unknown form type `{other}`")),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContactForm {
    pub name: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CareerForm {
    pub name: String,
    pub email: String,
    pub phone: String,
    pub position: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experience: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A testimonial left by a client. Shown on the site once approved.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackForm {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    pub feedback: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReachUsForm {
    pub name: String,
    pub phone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirement: Option<String>,
}

/// Payload of one of the site's forms, tagged the way `POST /forms/submit` expects:
/// `{"type": "contact", "formData": {...}}`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, schemars::JsonSchema)]
#[serde(tag = "type", content = "formData", rename_all = "snake_case")]
pub enum FormData {
    Contact(ContactForm),
    Career(CareerForm),
    Feedback(FeedbackForm),
    ReachUs(ReachUsForm),
}

impl FormData {
    pub fn form_type(&self) -> FormType {
        match self {
            FormData::Contact(_) => FormType::Contact,
            FormData::Career(_) => FormType::Career,
            FormData::Feedback(_) => FormType::Feedback,
            FormData::ReachUs(_) => FormType::ReachUs,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            FormData::Contact(form) => &form.name,
            FormData::Career(form) => &form.name,
            FormData::Feedback(form) => &form.name,
            FormData::ReachUs(form) => &form.name,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubmitFormRequest {
    #[serde(flatten)]
    pub form: FormData,
    pub visitor_id: VisitorId,
    pub session_id: SessionId,
    /// Where the submission came from, e.g. `website` or `local_sync`.
    pub source: String,
    /// Client-assigned id, stable across retries so the server can drop replays.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_submission_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubmitFormResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Prefilled WhatsApp text composed by the server, when it offers one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub whatsapp_message: Option<String>,
}

impl SubmitFormResponse {
    /// The server-assigned id, rendered as a string whether it was sent as a number or not.
    pub fn id_string(&self) -> Option<String> {
        self.id.as_ref().map(|id| match id {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}
