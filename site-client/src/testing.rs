//! In-process stand-ins for the API and the WhatsApp handoff.

use std::sync::Mutex;
use std::time::Duration;

use site_types::{SubmitFormRequest, SubmitFormResponse, Testimonial, TrackEventRequest};

use crate::api::{ApiError, Remote};
use crate::whatsapp::Handoff;

#[derive(Debug, Clone, Copy)]
pub enum Reply {
    Accepted,
    Offline,
    TimedOut,
    /// A gateway in front of a dead backend.
    ServerDown,
    /// The server took the request but its reply can't be parsed.
    Garbled,
    Invalid(&'static str),
    Unsuccessful(&'static str),
}

#[derive(Default)]
struct FakeState {
    delivered: Vec<SubmitFormRequest>,
    events: Vec<TrackEventRequest>,
    testimonial_calls: usize,
}

pub struct FakeRemote {
    reply: Mutex<Reply>,
    delay: Mutex<Duration>,
    whatsapp_message: Option<String>,
    testimonials: Vec<Testimonial>,
    state: Mutex<FakeState>,
}

impl FakeRemote {
    pub fn new(reply: Reply) -> Self {
        Self {
            reply: Mutex::new(reply),
            delay: Mutex::new(Duration::ZERO),
            whatsapp_message: None,
            testimonials: Vec::new(),
            state: Mutex::new(FakeState::default()),
        }
    }

    pub fn with_whatsapp_message(mut self, message: &str) -> Self {
        self.whatsapp_message = Some(message.to_string());
        self
    }

    pub fn with_testimonials(mut self, testimonials: Vec<Testimonial>) -> Self {
        self.testimonials = testimonials;
        self
    }

    pub fn set_reply(&self, reply: Reply) {
        *self.reply.lock().unwrap() = reply;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Every form request that reached the fake, including refused ones.
    pub fn delivered(&self) -> Vec<SubmitFormRequest> {
        self.state.lock().unwrap().delivered.clone()
    }

    pub fn events(&self) -> Vec<TrackEventRequest> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn testimonial_calls(&self) -> usize {
        self.state.lock().unwrap().testimonial_calls
    }

    async fn answer(&self) -> Result<(), ApiError> {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let reply = *self.reply.lock().unwrap();
        match reply {
            Reply::Accepted | Reply::Unsuccessful(_) => Ok(()),
            Reply::Offline => Err(ApiError::Transport("connection refused".to_string())),
            Reply::TimedOut => Err(ApiError::Timeout(Duration::from_secs(10))),
            Reply::ServerDown => Err(ApiError::Server {
                status: 503,
                message: "HTTP error! status: 503".to_string(),
            }),
            Reply::Garbled => Err(ApiError::Decode("expected value at line 1 column 1".to_string())),
            Reply::Invalid(message) => Err(ApiError::Validation {
                status: 400,
                message: message.to_string(),
            }),
        }
    }
}

impl Remote for FakeRemote {
    async fn deliver_form(
        &self,
        request: &SubmitFormRequest,
    ) -> Result<SubmitFormResponse, ApiError> {
        self.answer().await?;
        self.state.lock().unwrap().delivered.push(request.clone());
        let reply = *self.reply.lock().unwrap();
        Ok(match reply {
            Reply::Unsuccessful(message) => SubmitFormResponse {
                success: false,
                id: None,
                error: Some(message.to_string()),
                message: None,
                whatsapp_message: None,
            },
            _ => {
                let id = self.state.lock().unwrap().delivered.len();
                SubmitFormResponse {
                    success: true,
                    id: Some(serde_json::json!(id)),
                    error: None,
                    message: Some("Form submitted successfully".to_string()),
                    whatsapp_message: self.whatsapp_message.clone(),
                }
            }
        })
    }

    async fn send_event(&self, request: &TrackEventRequest) -> Result<(), ApiError> {
        self.answer().await?;
        self.state.lock().unwrap().events.push(request.clone());
        Ok(())
    }

    async fn fetch_testimonials(&self) -> Result<Vec<Testimonial>, ApiError> {
        self.state.lock().unwrap().testimonial_calls += 1;
        self.answer().await?;
        Ok(self.testimonials.clone())
    }
}

#[derive(Default)]
pub struct RecordingHandoff {
    opened: Mutex<Vec<String>>,
}

impl RecordingHandoff {
    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().unwrap().clone()
    }
}

impl Handoff for RecordingHandoff {
    fn open(&self, url: &str) {
        self.opened.lock().unwrap().push(url.to_string());
    }
}
