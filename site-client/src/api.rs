//! The single path every call to the REST API goes through.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use futures::future::{AbortRegistration, Abortable};
use reqwest::{Method, StatusCode, header, multipart};
use serde::{Serialize, de::DeserializeOwned};
use site_types::auth::{LoginRequest, LoginResponse};
use site_types::content::{
    ContactInfo, ContentFilter, Project, ProjectInput, Service, SubmissionRecord, Testimonial,
    TestimonialInput,
};
use site_types::{
    Ack, ApiErrorBody, HealthStatus, SubmitFormRequest, SubmitFormResponse, TrackEventRequest,
};
use stash::Stash;

pub const AUTH_TOKEN_KEY: &str = "auth_token";

#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    /// The server rejected the request as malformed. Retrying the same payload won't help.
    #[error("{message}")]
    Validation { status: u16, message: String },
    #[error("{message}")]
    Auth { status: u16, message: String },
    #[error("{message}")]
    Server { status: u16, message: String },
    /// No response at all: offline, DNS failure, refused connection, reset mid-body.
    #[error("network error: {0}")]
    Transport(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("request cancelled")]
    Cancelled,
    #[error("unexpected response body: {0}")]
    Decode(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ApiError {
    /// True when the request never got an answer, i.e. the server may never have seen it.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ApiError::Transport(_) | ApiError::Timeout(_) | ApiError::Cancelled
        )
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Validation { status, .. }
            | ApiError::Auth { status, .. }
            | ApiError::Server { status, .. } => Some(*status),
            _ => None,
        }
    }

    fn from_response(status: StatusCode, body: &str) -> Self {
        let message = serde_json::from_str::<ApiErrorBody>(body)
            .map(|body| body.error)
            .unwrap_or_else(|_| format!("HTTP error! status: {}", status.as_u16()));
        let status_code = status.as_u16();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ApiError::Auth {
                status: status_code,
                message,
            },
            s if s.is_client_error() => ApiError::Validation {
                status: status_code,
                message,
            },
            _ => ApiError::Server {
                status: status_code,
                message,
            },
        }
    }
}

fn transport_error(e: reqwest::Error) -> ApiError {
    ApiError::Transport(e.to_string())
}

/// An image attached to a testimonial or project. Its presence switches the request to multipart.
#[derive(Debug, Clone)]
pub struct ImageUpload {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

enum RequestBody {
    Empty,
    Json(serde_json::Value),
    Multipart {
        fields: serde_json::Value,
        image: ImageUpload,
    },
}

pub struct ApiRequest {
    method: Method,
    endpoint: String,
    query: Vec<(String, String)>,
    body: RequestBody,
    auth_required: bool,
    timeout: Option<Duration>,
    abort: Option<AbortRegistration>,
}

impl ApiRequest {
    pub fn new(method: Method, endpoint: impl Into<String>) -> Self {
        Self {
            method,
            endpoint: endpoint.into(),
            query: Vec::new(),
            body: RequestBody::Empty,
            auth_required: false,
            timeout: None,
            abort: None,
        }
    }

    pub fn get(endpoint: impl Into<String>) -> Self {
        Self::new(Method::GET, endpoint)
    }

    pub fn post(endpoint: impl Into<String>) -> Self {
        Self::new(Method::POST, endpoint)
    }

    pub fn put(endpoint: impl Into<String>) -> Self {
        Self::new(Method::PUT, endpoint)
    }

    pub fn delete(endpoint: impl Into<String>) -> Self {
        Self::new(Method::DELETE, endpoint)
    }

    pub fn json(mut self, body: &impl Serialize) -> Result<Self, ApiError> {
        self.body = RequestBody::Json(to_json(body)?);
        Ok(self)
    }

    /// JSON body, or a multipart form of the same fields plus an `image` part when `image` is set.
    pub fn json_or_multipart(
        mut self,
        fields: &impl Serialize,
        image: Option<ImageUpload>,
    ) -> Result<Self, ApiError> {
        let fields = to_json(fields)?;
        self.body = match image {
            Some(image) => RequestBody::Multipart { fields, image },
            None => RequestBody::Json(fields),
        };
        Ok(self)
    }

    /// Appends the non-null fields of `query` as query parameters.
    pub fn query(mut self, query: &impl Serialize) -> Result<Self, ApiError> {
        if let serde_json::Value::Object(fields) = to_json(query)? {
            for (name, value) in fields {
                match value {
                    serde_json::Value::Null => {}
                    serde_json::Value::String(s) => self.query.push((name, s)),
                    other => self.query.push((name, other.to_string())),
                }
            }
        }
        Ok(self)
    }

    /// Sends the bearer token, if one is held.
    pub fn authorized(mut self) -> Self {
        self.auth_required = true;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Lets the caller cancel the request through the matching `AbortHandle`.
    pub fn abortable(mut self, registration: AbortRegistration) -> Self {
        self.abort = Some(registration);
        self
    }
}

fn to_json(value: &impl Serialize) -> Result<serde_json::Value, ApiError> {
    serde_json::to_value(value).map_err(|e| ApiError::InvalidRequest(e.to_string()))
}

fn multipart_form(
    fields: serde_json::Value,
    image: ImageUpload,
) -> Result<multipart::Form, ApiError> {
    let mut form = multipart::Form::new();
    if let serde_json::Value::Object(fields) = fields {
        for (name, value) in fields {
            let text = match value {
                serde_json::Value::Null => continue,
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            form = form.text(name, text);
        }
    }
    let part = multipart::Part::bytes(image.bytes)
        .file_name(image.file_name)
        .mime_str(&image.content_type)
        .map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
    Ok(form.part("image", part))
}

pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
    // mirrored to the stash so a login survives restarts
    token: RwLock<Option<String>>,
    stash: Arc<Stash>,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    /// Restores a previously stored auth token from `stash`, if there is one.
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        stash: Arc<Stash>,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .user_agent(concat!(
                env!("CARGO_PKG_NAME"),
                "/",
                env!("CARGO_PKG_VERSION")
            ))
            .build()?;
        let token = stash.get::<String>(AUTH_TOKEN_KEY);
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
            token: RwLock::new(token),
            stash,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn token(&self) -> Option<String> {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// `None` logs out: the token is cleared from memory and from storage.
    pub fn set_token(&self, token: Option<String>) {
        match &token {
            Some(token) => {
                self.stash.set(AUTH_TOKEN_KEY, token);
            }
            None => self.stash.remove(AUTH_TOKEN_KEY),
        }
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = token;
    }

    pub async fn send<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, ApiError> {
        let ApiRequest {
            method,
            endpoint,
            query,
            body,
            auth_required,
            timeout,
            abort,
        } = request;

        let url = format!("{}{}", self.base_url, endpoint);
        let mut builder = self.http.request(method.clone(), &url);
        if !query.is_empty() {
            builder = builder.query(&query);
        }
        if auth_required {
            match self.token() {
                Some(token) => builder = builder.bearer_auth(token),
                None => log::warn!("{method} {endpoint} needs auth but no token is held"),
            }
        }
        builder = match body {
            RequestBody::Empty => builder.header(header::CONTENT_TYPE, "application/json"),
            RequestBody::Json(value) => builder.json(&value),
            RequestBody::Multipart { fields, image } => {
                builder.multipart(multipart_form(fields, image)?)
            }
        };

        let timeout = timeout.unwrap_or(self.timeout);
        let attempt = tokio::time::timeout(timeout, Self::dispatch::<T>(builder));
        let outcome = match abort {
            Some(registration) => Abortable::new(attempt, registration)
                .await
                .map_err(|_| ApiError::Cancelled)?,
            None => attempt.await,
        };
        let result = outcome.unwrap_or(Err(ApiError::Timeout(timeout)));

        if let Err(e) = &result {
            log::debug!("{method} {endpoint} failed: {e}");
        }
        result
    }

    async fn dispatch<T: DeserializeOwned>(builder: reqwest::RequestBuilder) -> Result<T, ApiError> {
        let response = builder.send().await.map_err(transport_error)?;
        let status = response.status();
        let text = response.text().await.map_err(transport_error)?;

        if !status.is_success() {
            return Err(ApiError::from_response(status, &text));
        }

        let text = if text.trim().is_empty() {
            "null"
        } else {
            text.as_str()
        };
        serde_json::from_str(text).map_err(|e| ApiError::Decode(format!("{e}. Body: {text}")))
    }

    pub async fn health(&self) -> Result<HealthStatus, ApiError> {
        self.send(ApiRequest::get("/health")).await
    }

    pub async fn submit_form(
        &self,
        request: &SubmitFormRequest,
    ) -> Result<SubmitFormResponse, ApiError> {
        self.send(ApiRequest::post("/forms/submit").json(request)?)
            .await
    }

    pub async fn track_event(&self, request: &TrackEventRequest) -> Result<Ack, ApiError> {
        self.send(ApiRequest::post("/analytics/track").json(request)?)
            .await
    }

    pub async fn projects(&self, filter: &ContentFilter) -> Result<Vec<Project>, ApiError> {
        self.send(ApiRequest::get("/projects").query(filter)?).await
    }

    pub async fn project(&self, id: i64) -> Result<Project, ApiError> {
        self.send(ApiRequest::get(format!("/projects/{id}"))).await
    }

    pub async fn testimonials(&self, filter: &ContentFilter) -> Result<Vec<Testimonial>, ApiError> {
        self.send(ApiRequest::get("/testimonials").query(filter)?)
            .await
    }

    pub async fn services(&self) -> Result<Vec<Service>, ApiError> {
        self.send(ApiRequest::get("/services")).await
    }

    pub async fn config(&self) -> Result<BTreeMap<String, serde_json::Value>, ApiError> {
        self.send(ApiRequest::get("/config")).await
    }

    pub async fn contact_info(&self) -> Result<ContactInfo, ApiError> {
        self.send(ApiRequest::get("/contact-info")).await
    }

    /// Logs in and keeps the returned token for later authorized calls.
    pub async fn login(&self, username: &str, password: &str) -> Result<LoginResponse, ApiError> {
        let request = LoginRequest {
            username: username.to_string(),
            password: password.to_string(),
        };
        let response: LoginResponse = self
            .send(ApiRequest::post("/auth/login").json(&request)?)
            .await?;
        self.set_token(Some(response.token.clone()));
        log::info!("Logged in as {username}");
        Ok(response)
    }

    pub fn logout(&self) {
        self.set_token(None);
    }

    pub async fn create_testimonial(
        &self,
        testimonial: &TestimonialInput,
        image: Option<ImageUpload>,
    ) -> Result<Testimonial, ApiError> {
        let request = ApiRequest::post("/testimonials")
            .json_or_multipart(testimonial, image)?
            .authorized();
        self.send(request).await
    }

    pub async fn update_testimonial(
        &self,
        id: i64,
        testimonial: &TestimonialInput,
        image: Option<ImageUpload>,
    ) -> Result<Testimonial, ApiError> {
        let request = ApiRequest::put(format!("/testimonials/{id}"))
            .json_or_multipart(testimonial, image)?
            .authorized();
        self.send(request).await
    }

    pub async fn delete_testimonial(&self, id: i64) -> Result<Ack, ApiError> {
        self.send(ApiRequest::delete(format!("/testimonials/{id}")).authorized())
            .await
    }

    pub async fn create_project(
        &self,
        project: &ProjectInput,
        image: Option<ImageUpload>,
    ) -> Result<Project, ApiError> {
        let request = ApiRequest::post("/projects")
            .json_or_multipart(project, image)?
            .authorized();
        self.send(request).await
    }

    pub async fn update_project(
        &self,
        id: i64,
        project: &ProjectInput,
        image: Option<ImageUpload>,
    ) -> Result<Project, ApiError> {
        let request = ApiRequest::put(format!("/projects/{id}"))
            .json_or_multipart(project, image)?
            .authorized();
        self.send(request).await
    }

    pub async fn delete_project(&self, id: i64) -> Result<Ack, ApiError> {
        self.send(ApiRequest::delete(format!("/projects/{id}")).authorized())
            .await
    }

    pub async fn submissions(&self) -> Result<Vec<SubmissionRecord>, ApiError> {
        self.send(ApiRequest::get("/forms/submissions").authorized())
            .await
    }

    pub async fn submission(&self, id: i64) -> Result<SubmissionRecord, ApiError> {
        self.send(ApiRequest::get(format!("/forms/submissions/{id}")).authorized())
            .await
    }

    pub async fn delete_submission(&self, id: i64) -> Result<Ack, ApiError> {
        self.send(ApiRequest::delete(format!("/forms/submissions/{id}")).authorized())
            .await
    }

    pub async fn set_config(&self, key: &str, value: &serde_json::Value) -> Result<Ack, ApiError> {
        let request = ApiRequest::put(format!("/config/{key}"))
            .json(&serde_json::json!({ "value": value }))?
            .authorized();
        self.send(request).await
    }
}

/// The part of the API the submission pipeline, analytics forwarding and content aggregation depend on.
pub trait Remote: Send + Sync + 'static {
    fn deliver_form(
        &self,
        request: &SubmitFormRequest,
    ) -> impl Future<Output = Result<SubmitFormResponse, ApiError>> + Send;

    fn send_event(
        &self,
        request: &TrackEventRequest,
    ) -> impl Future<Output = Result<(), ApiError>> + Send;

    fn fetch_testimonials(&self) -> impl Future<Output = Result<Vec<Testimonial>, ApiError>> + Send;
}

impl Remote for ApiClient {
    async fn deliver_form(
        &self,
        request: &SubmitFormRequest,
    ) -> Result<SubmitFormResponse, ApiError> {
        self.submit_form(request).await
    }

    async fn send_event(&self, request: &TrackEventRequest) -> Result<(), ApiError> {
        self.track_event(request).await.map(|_| ())
    }

    async fn fetch_testimonials(&self) -> Result<Vec<Testimonial>, ApiError> {
        let filter = ContentFilter {
            approved: Some(true),
            ..Default::default()
        };
        self.testimonials(&filter).await
    }
}
