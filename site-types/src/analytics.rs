use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{FormData, FormType, SessionId, VisitorId};

/// The four logs the analytics buffer keeps, one per kind of event.
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
#[serde(rename_all = "camelCase")]
pub enum EventCategory {
    PageViews,
    ButtonClicks,
    FormSubmissions,
    WhatsappRedirects,
}

impl EventCategory {
    pub const ALL: [EventCategory; 4] = [
        EventCategory::PageViews,
        EventCategory::ButtonClicks,
        EventCategory::FormSubmissions,
        EventCategory::WhatsappRedirects,
    ];
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, schemars::JsonSchema)]
#[serde(tag = "eventType", rename_all = "snake_case")]
pub enum EventKind {
    PageView {
        page: String,
    },
    ButtonClick {
        element: String,
        location: String,
    },
    #[serde(rename_all = "camelCase")]
    FormSubmission {
        form_type: FormType,
        #[serde(rename = "formData")]
        form: FormData,
    },
    #[serde(rename = "whatsapp_redirect", rename_all = "camelCase")]
    WhatsAppRedirect {
        message: String,
        #[serde(rename = "formData", default, skip_serializing_if = "Option::is_none")]
        form: Option<FormData>,
    },
}

impl EventKind {
    pub fn category(&self) -> EventCategory {
        match self {
            EventKind::PageView { .. } => EventCategory::PageViews,
            EventKind::ButtonClick { .. } => EventCategory::ButtonClicks,
            EventKind::FormSubmission { .. } => EventCategory::FormSubmissions,
            EventKind::WhatsAppRedirect { .. } => EventCategory::WhatsappRedirects,
        }
    }

    /// The name the API files this event under in `POST /analytics/track`.
    pub fn event_type(&self) -> &'static str {
        match self {
            EventKind::PageView { .. } => "page_view",
            EventKind::ButtonClick { .. } => "button_click",
            EventKind::FormSubmission { .. } => "form_submission",
            EventKind::WhatsAppRedirect { .. } => "whatsapp_redirect",
        }
    }
}

/// One recorded usage signal. Immutable once recorded.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsEvent {
    pub id: String,
    pub visitor_id: VisitorId,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TrackEventRequest {
    pub visitor_id: VisitorId,
    pub session_id: SessionId,
    pub event_type: String,
    pub event_data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
}

impl TrackEventRequest {
    /// Builds the request body for `event`. The event's own fields (minus the tag) become `eventData`.
    pub fn from_event(event: &AnalyticsEvent, session_id: SessionId) -> Self {
        let mut event_data = serde_json::to_value(&event.kind).unwrap_or_default();
        if let Some(object) = event_data.as_object_mut() {
            object.remove("eventType");
            object.insert(
                "timestamp".to_string(),
                serde_json::Value::String(event.timestamp.to_rfc3339()),
            );
            object.insert(
                "clientEventId".to_string(),
                serde_json::Value::String(event.id.clone()),
            );
        }
        Self {
            visitor_id: event.visitor_id.clone(),
            session_id,
            event_type: event.kind.event_type().to_string(),
            event_data,
            user_agent: None,
            referrer: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ContactForm;
    use chrono::TimeZone;

    fn click() -> AnalyticsEvent {
        AnalyticsEvent {
            id: "e1".to_string(),
            visitor_id: VisitorId::new("v1"),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap(),
            kind: EventKind::ButtonClick {
                element: "get-quote".to_string(),
                location: "hero".to_string(),
            },
        }
    }

    #[test]
    fn test_event_is_flat() {
        let json = serde_json::to_value(click()).unwrap();
        assert_eq!(json["eventType"], "button_click");
        assert_eq!(json["element"], "get-quote");
        assert_eq!(json["visitorId"], "v1");
        assert_eq!(json["timestamp"], "2024-05-01T09:30:00Z");

        let back: AnalyticsEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, click());
    }

    #[test]
    fn test_track_request_from_event() {
        let request = TrackEventRequest::from_event(&click(), SessionId::new("s1"));
        assert_eq!(request.event_type, "button_click");
        assert_eq!(request.event_data["location"], "hero");
        assert_eq!(request.event_data["clientEventId"], "e1");
        assert!(request.event_data.get("eventType").is_none());
    }

    #[test]
    fn test_categories() {
        let submission = EventKind::FormSubmission {
            form_type: FormType::Contact,
            form: FormData::Contact(ContactForm {
                name: "Ankit".to_string(),
                email: "a@x.com".to_string(),
                phone: None,
                service: None,
                message: "hi".to_string(),
            }),
        };
        assert_eq!(submission.category(), EventCategory::FormSubmissions);
        assert_eq!(click().kind.category(), EventCategory::ButtonClicks);

        let redirect = EventKind::WhatsAppRedirect {
            message: "Hello".to_string(),
            form: None,
        };
        let json = serde_json::to_value(&redirect).unwrap();
        assert_eq!(json["eventType"], "whatsapp_redirect");
        assert_eq!(redirect.category(), EventCategory::WhatsappRedirects);
    }
}
