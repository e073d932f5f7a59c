//! Local usage analytics. Events are kept per category, capped, and persisted after every change.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use site_types::{AnalyticsEvent, EventCategory, EventKind, FormData, VisitorId};
use stash::{Persisted, Stash};

use crate::identity::generate_id;

/// How many events each category keeps unless configured otherwise.
pub const DEFAULT_RETENTION: usize = 1000;

pub const ANALYTICS_KEY: &str = "analytics_log";

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsLog {
    #[serde(default)]
    pub page_views: Vec<AnalyticsEvent>,
    #[serde(default)]
    pub button_clicks: Vec<AnalyticsEvent>,
    #[serde(default)]
    pub form_submissions: Vec<AnalyticsEvent>,
    #[serde(default)]
    pub whatsapp_redirects: Vec<AnalyticsEvent>,
    /// Every visitor seen since the log was last cleared, including those whose events were rotated out.
    #[serde(default)]
    pub unique_visitors: BTreeSet<VisitorId>,
    #[serde(default)]
    pub total_clicks: u64,
}

impl AnalyticsLog {
    pub fn events(&self, category: EventCategory) -> &[AnalyticsEvent] {
        match category {
            EventCategory::PageViews => &self.page_views,
            EventCategory::ButtonClicks => &self.button_clicks,
            EventCategory::FormSubmissions => &self.form_submissions,
            EventCategory::WhatsappRedirects => &self.whatsapp_redirects,
        }
    }

    fn events_mut(&mut self, category: EventCategory) -> &mut Vec<AnalyticsEvent> {
        match category {
            EventCategory::PageViews => &mut self.page_views,
            EventCategory::ButtonClicks => &mut self.button_clicks,
            EventCategory::FormSubmissions => &mut self.form_submissions,
            EventCategory::WhatsappRedirects => &mut self.whatsapp_redirects,
        }
    }

    pub fn record(&mut self, event: AnalyticsEvent) {
        if matches!(event.kind, EventKind::ButtonClick { .. }) {
            self.total_clicks += 1;
        }
        self.unique_visitors.insert(event.visitor_id.clone());
        self.events_mut(event.kind.category()).push(event);
    }

    /// Drops the oldest events so no category holds more than `retention`. Returns how many were dropped.
    pub fn rotate(&mut self, retention: usize) -> usize {
        EventCategory::ALL
            .into_iter()
            .map(|category| {
                let events = self.events_mut(category);
                let excess = events.len().saturating_sub(retention);
                events.drain(..excess);
                excess
            })
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        EventCategory::ALL
            .into_iter()
            .all(|category| self.events(category).is_empty())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsSnapshot {
    #[serde(flatten)]
    pub log: AnalyticsLog,
    pub unique_visitors_count: usize,
}

pub struct AnalyticsBuffer {
    stash: Arc<Stash>,
    visitor_id: VisitorId,
    retention: usize,
    log: Mutex<AnalyticsLog>,
}

impl AnalyticsBuffer {
    /// Picks up the log persisted in `stash`, or starts an empty one if there is none or it can't be read.
    pub fn load(stash: Arc<Stash>, visitor_id: VisitorId, retention: usize) -> Self {
        let mut log: AnalyticsLog = stash.get(ANALYTICS_KEY).unwrap_or_default();
        let dropped = log.rotate(retention);
        if dropped > 0 {
            log::info!("Dropped {dropped} stored analytics events over the retention of {retention}");
        }
        Self {
            stash,
            visitor_id,
            retention,
            log: Mutex::new(log),
        }
    }

    pub fn track_page_view(&self, page: &str) -> AnalyticsEvent {
        self.record(EventKind::PageView {
            page: page.to_string(),
        })
    }

    pub fn track_click(&self, element: &str, location: &str) -> AnalyticsEvent {
        self.record(EventKind::ButtonClick {
            element: element.to_string(),
            location: location.to_string(),
        })
    }

    pub fn track_form_submission(&self, form: &FormData) -> AnalyticsEvent {
        self.record(EventKind::FormSubmission {
            form_type: form.form_type(),
            form: form.clone(),
        })
    }

    pub fn track_whatsapp_redirect(&self, message: &str, form: Option<&FormData>) -> AnalyticsEvent {
        self.record(EventKind::WhatsAppRedirect {
            message: message.to_string(),
            form: form.cloned(),
        })
    }

    fn record(&self, kind: EventKind) -> AnalyticsEvent {
        let event = AnalyticsEvent {
            id: generate_id(),
            visitor_id: self.visitor_id.clone(),
            timestamp: Utc::now(),
            kind,
        };
        log::debug!("Tracking {} event {}", event.kind.event_type(), event.id);

        let mut log = self.lock();
        log.record(event.clone());
        self.persist_locked(&mut log);
        event
    }

    pub fn snapshot(&self) -> AnalyticsSnapshot {
        let log = self.lock().clone();
        AnalyticsSnapshot {
            unique_visitors_count: log.unique_visitors.len(),
            log,
        }
    }

    /// Writes the current snapshot to `dir/analytics-<timestamp>.json` and returns the path. The log is left as is.
    pub fn export_snapshot(&self, dir: &Path) -> std::io::Result<PathBuf> {
        let snapshot = self.snapshot();
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!(
            "analytics-{}.json",
            Utc::now().format("%Y%m%dT%H%M%S%.3fZ")
        ));
        std::fs::write(&path, serde_json::to_vec_pretty(&snapshot)?)?;
        log::info!("Exported analytics to {}", path.display());
        Ok(path)
    }

    /// Forgets every event and removes the stored copy.
    pub fn clear(&self) {
        let mut log = self.lock();
        *log = AnalyticsLog::default();
        self.stash.remove(ANALYTICS_KEY);
        log::info!("Cleared analytics");
    }

    pub fn persist(&self) -> Persisted {
        let mut log = self.lock();
        self.persist_locked(&mut log)
    }

    fn persist_locked(&self, log: &mut AnalyticsLog) -> Persisted {
        log.rotate(self.retention);
        let persisted = self.stash.set(ANALYTICS_KEY, log);
        match persisted {
            Persisted::Stored => {}
            Persisted::Truncated => log::warn!("Analytics log was truncated to fit storage"),
            Persisted::Dropped => log::error!("Failed to persist the analytics log"),
        }
        persisted
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AnalyticsLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
