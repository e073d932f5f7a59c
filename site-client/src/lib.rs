//! Client side of the business site: the API client plus everything that keeps working without it.
//!
//! [`Site`] is the entry point. It owns one data directory (the native counterpart of a browser origin's
//! storage) and everything derived from it:
//! - a visitor id that persists and a session id that doesn't ([`identity`])
//! - form submissions, with a local queue for the ones the API didn't receive ([`pipeline`], [`pending`])
//! - capped local analytics, forwarded to the API when it's reachable ([`analytics`])
//! - testimonial lists merged from seed content, pending feedback and the API ([`aggregator`])

pub mod aggregator;
pub mod analytics;
pub mod api;
pub mod config;
pub mod identity;
pub mod pending;
pub mod pipeline;
pub mod whatsapp;

#[cfg(test)]
mod testing;

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex, PoisonError};

use site_types::{
    AnalyticsEvent, FormData, FormType, SessionId, Testimonial, TrackEventRequest, VisitorId,
};
use stash::{DirStorage, Stash, StorageError};
use tokio::task::JoinSet;

pub use aggregator::{ContentAggregator, ContentSource, DisplayTestimonial};
pub use analytics::{AnalyticsBuffer, AnalyticsLog, AnalyticsSnapshot};
pub use api::{ApiClient, ApiError, ApiRequest, Remote};
pub use config::{ClientConfig, ConfigError};
pub use identity::Identity;
pub use pending::{PendingQueue, PendingSubmission};
pub use pipeline::{FlushReport, SubmissionOutcome, SubmissionPipeline, SubmissionReceipt};
pub use whatsapp::{Handoff, LogHandoff};

#[derive(Debug, thiserror::Error)]
pub enum SiteError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("failed to build the HTTP client: {0}")]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

// initialized through a static so the logger is only ever set up once per process
static LOGGER: LazyLock<()> = LazyLock::new(|| {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
    log::info!("Logging initialized");
});

pub struct Site<R: Remote = ApiClient> {
    config: ClientConfig,
    stash: Arc<Stash>,
    identity: Identity,
    analytics: AnalyticsBuffer,
    remote: Arc<R>,
    pipeline: SubmissionPipeline<R>,
    aggregator: ContentAggregator<R>,
    // best-effort analytics forwards still on their way to the API
    forwards: Mutex<JoinSet<()>>,
}

impl Site<ApiClient> {
    /// Opens `config.data_dir` and connects to `config.api_base_url`. Nothing is sent until a method needs it.
    pub fn init(config: ClientConfig) -> Result<Self, SiteError> {
        LazyLock::force(&LOGGER);

        let storage = DirStorage::open(&config.data_dir).inspect_err(|e| {
            log::error!("Error opening {}: {e}", config.data_dir.display());
        })?;
        let stash = Arc::new(Stash::new(storage));
        let client = ApiClient::new(
            config.api_base_url.clone(),
            config.request_timeout,
            Arc::clone(&stash),
        )?;
        Ok(Self::assemble(config, stash, Arc::new(client)))
    }

    pub fn from_env() -> Result<Self, SiteError> {
        Self::init(ClientConfig::from_env()?)
    }
}

impl<R: Remote> Site<R> {
    /// Builds a site over an already opened stash and any [`Remote`].
    pub fn assemble(config: ClientConfig, stash: Arc<Stash>, remote: Arc<R>) -> Self {
        let identity = Identity::new(Arc::clone(&stash));
        let analytics = AnalyticsBuffer::load(
            Arc::clone(&stash),
            identity.visitor_id(),
            config.analytics_retention,
        );
        let queue = PendingQueue::new(Arc::clone(&stash));
        let pipeline = SubmissionPipeline::new(
            Arc::clone(&remote),
            queue.clone(),
            config.whatsapp_number.clone(),
        );
        let aggregator = ContentAggregator::new(Arc::clone(&remote), queue, Arc::clone(&stash));
        Self {
            config,
            stash,
            identity,
            analytics,
            remote,
            pipeline,
            aggregator,
            forwards: Mutex::new(JoinSet::new()),
        }
    }

    /// Show the last fetched testimonials when the API is unreachable.
    pub fn with_cached_testimonials(mut self, enabled: bool) -> Self {
        self.aggregator = self.aggregator.with_cached_fallback(enabled);
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn api(&self) -> &R {
        &self.remote
    }

    pub fn stash(&self) -> &Stash {
        &self.stash
    }

    pub fn visitor_id(&self) -> VisitorId {
        self.identity.visitor_id()
    }

    pub fn session_id(&self) -> SessionId {
        self.identity.session_id()
    }

    pub fn track_page_view(&self, page: &str) {
        let event = self.analytics.track_page_view(page);
        self.forward(event);
    }

    pub fn track_click(&self, element: &str, location: &str) {
        let event = self.analytics.track_click(element, location);
        self.forward(event);
    }

    /// Submits `form`, falling back to the local queue when the API can't be reached.
    /// With a `handoff`, the WhatsApp link is opened once the submission is safe.
    pub async fn submit_form(
        &self,
        form: FormData,
        handoff: Option<&dyn Handoff>,
    ) -> SubmissionReceipt {
        let receipt = self
            .pipeline
            .submit(form.clone(), self.visitor_id(), self.session_id(), handoff)
            .await;

        if !matches!(receipt.outcome, SubmissionOutcome::Rejected { .. }) {
            let event = self.analytics.track_form_submission(&form);
            self.forward(event);
        }
        if let Some(whatsapp) = &receipt.whatsapp {
            let event = self
                .analytics
                .track_whatsapp_redirect(&whatsapp.message, Some(&form));
            self.forward(event);
        }
        receipt
    }

    pub fn pending(&self, form_type: FormType) -> Vec<PendingSubmission> {
        self.pipeline.queue().list(form_type)
    }

    pub async fn flush_pending(&self, form_type: FormType) -> FlushReport {
        self.pipeline.flush_pending(form_type).await
    }

    pub async fn flush_all(&self) -> Vec<(FormType, FlushReport)> {
        self.pipeline.flush_all().await
    }

    pub async fn merged_testimonials(&self, seed: &[Testimonial]) -> Vec<DisplayTestimonial> {
        self.aggregator.merged_testimonials(seed).await
    }

    pub fn analytics_snapshot(&self) -> AnalyticsSnapshot {
        self.analytics.snapshot()
    }

    pub fn export_analytics(&self, dir: &Path) -> std::io::Result<PathBuf> {
        self.analytics.export_snapshot(dir)
    }

    pub fn clear_analytics(&self) {
        self.analytics.clear();
    }

    /// Waits for outstanding analytics forwards and persists the analytics log one last time.
    pub async fn dispose(self) {
        let mut forwards = std::mem::take(
            &mut *self.forwards.lock().unwrap_or_else(PoisonError::into_inner),
        );
        while forwards.join_next().await.is_some() {}
        self.analytics.persist();
        log::info!("Site state saved to {}", self.config.data_dir.display());
    }

    fn forward(&self, event: AnalyticsEvent) {
        if tokio::runtime::Handle::try_current().is_err() {
            log::debug!("No async runtime, keeping event {} local only", event.id);
            return;
        }
        let remote = Arc::clone(&self.remote);
        let request = TrackEventRequest::from_event(&event, self.session_id());
        let mut forwards = self.forwards.lock().unwrap_or_else(PoisonError::into_inner);
        // reap finished forwards so the set doesn't grow without bound
        while forwards.try_join_next().is_some() {}
        forwards.spawn(async move {
            if let Err(e) = remote.send_event(&request).await {
                log::debug!("Analytics event {} not forwarded: {e}", event.id);
            }
        });
    }
}
