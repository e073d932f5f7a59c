//! Builds display lists out of bundled seed content, locally pending submissions and the API.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use site_types::{FormData, FormType, Testimonial};
use stash::Stash;

use crate::api::Remote;
use crate::pending::{PendingQueue, PendingSubmission};

/// The last testimonials fetched from the API.
pub const CACHED_TESTIMONIALS_KEY: &str = "cached_testimonials";

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ContentSource {
    Seed,
    Pending,
    Remote,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DisplayTestimonial {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub designation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    pub source: ContentSource,
}

impl DisplayTestimonial {
    pub fn from_testimonial(testimonial: &Testimonial, source: ContentSource) -> Self {
        Self {
            name: testimonial.name.clone(),
            designation: testimonial.designation.clone(),
            company: testimonial.company.clone(),
            content: testimonial.content.clone(),
            rating: testimonial.rating,
            image_url: testimonial.image_url.clone(),
            source,
        }
    }

    /// `None` unless `pending` is a feedback submission.
    pub fn from_pending(pending: &PendingSubmission) -> Option<Self> {
        let FormData::Feedback(feedback) = &pending.form else {
            return None;
        };
        Some(Self {
            name: feedback.name.clone(),
            designation: feedback.project.clone(),
            company: None,
            content: feedback.feedback.clone(),
            rating: feedback.rating,
            image_url: None,
            source: ContentSource::Pending,
        })
    }
}

/// Seed entries first, in their given order, then pending ones, then remote ones. Duplicates are kept.
pub fn merge(
    seed: &[Testimonial],
    pending: &[PendingSubmission],
    remote: &[Testimonial],
) -> Vec<DisplayTestimonial> {
    seed.iter()
        .map(|t| DisplayTestimonial::from_testimonial(t, ContentSource::Seed))
        .chain(pending.iter().filter_map(DisplayTestimonial::from_pending))
        .chain(
            remote
                .iter()
                .map(|t| DisplayTestimonial::from_testimonial(t, ContentSource::Remote)),
        )
        .collect()
}

pub struct ContentAggregator<R: Remote> {
    remote: Arc<R>,
    queue: PendingQueue,
    stash: Arc<Stash>,
    cached_fallback: bool,
}

impl<R: Remote> ContentAggregator<R> {
    pub fn new(remote: Arc<R>, queue: PendingQueue, stash: Arc<Stash>) -> Self {
        Self {
            remote,
            queue,
            stash,
            cached_fallback: false,
        }
    }

    /// When the API can't be reached, show the last fetched testimonials instead of none.
    pub fn with_cached_fallback(mut self, enabled: bool) -> Self {
        self.cached_fallback = enabled;
        self
    }

    /// Never fails: if the API is unavailable the remote part is empty (or cached, see [`Self::with_cached_fallback`]).
    pub async fn merged_testimonials(&self, seed: &[Testimonial]) -> Vec<DisplayTestimonial> {
        let remote = match self.remote.fetch_testimonials().await {
            Ok(testimonials) => {
                self.stash.set(CACHED_TESTIMONIALS_KEY, &testimonials);
                testimonials
            }
            Err(e) if self.cached_fallback => {
                let cached: Vec<Testimonial> =
                    self.stash.get(CACHED_TESTIMONIALS_KEY).unwrap_or_default();
                log::warn!(
                    "Failed to fetch testimonials ({e}), showing {} cached",
                    cached.len()
                );
                cached
            }
            Err(e) => {
                log::warn!("Failed to fetch testimonials: {e}");
                Vec::new()
            }
        };
        let pending = self.queue.list(FormType::Feedback);
        merge(seed, &pending, &remote)
    }
}
