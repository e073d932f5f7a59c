//! Form submissions that could not be delivered yet, kept per form type until a flush delivers them.
//!
//! Queues are stored as JSON arrays and handled entry by entry: an entry this build can't read (an older or newer
//! shape) is skipped when listing but stays in storage, and is never dropped by a push or a remove.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use site_types::{FormData, FormType, SessionId, SubmitFormRequest, VisitorId};
use stash::{Persisted, Stash};

/// How many entries each per-form queue keeps. Older entries are evicted first.
pub const PENDING_RETENTION: usize = 1000;

/// `source` sent with submissions replayed from the local queue.
pub const SYNC_SOURCE: &str = "local_sync";

pub fn pending_key(form_type: FormType) -> String {
    format!("pending_{form_type}")
}

/// Entries the server refused on replay. Kept rather than discarded so an operator can look at them.
pub fn rejected_key(form_type: FormType) -> String {
    format!("rejected_{form_type}")
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PendingSubmission {
    pub id: String,
    pub name: String,
    #[serde(flatten)]
    pub form: FormData,
    pub visitor_id: VisitorId,
    pub session_id: SessionId,
    pub created_at: DateTime<Utc>,
    pub from_local_storage: bool,
}

impl PendingSubmission {
    pub fn new(id: String, form: FormData, visitor_id: VisitorId, session_id: SessionId) -> Self {
        Self {
            id,
            name: form.name().to_string(),
            form,
            visitor_id,
            session_id,
            created_at: Utc::now(),
            from_local_storage: true,
        }
    }

    pub fn form_type(&self) -> FormType {
        self.form.form_type()
    }

    /// The request that replays this submission. It carries the pending id so the server can drop duplicates.
    pub fn to_request(&self) -> SubmitFormRequest {
        SubmitFormRequest {
            form: self.form.clone(),
            visitor_id: self.visitor_id.clone(),
            session_id: self.session_id.clone(),
            source: SYNC_SOURCE.to_string(),
            client_submission_id: Some(self.id.clone()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PendingQueue {
    stash: Arc<Stash>,
}

impl PendingQueue {
    pub fn new(stash: Arc<Stash>) -> Self {
        Self { stash }
    }

    pub fn push(&self, submission: PendingSubmission) -> Persisted {
        let key = pending_key(submission.form_type());
        append_capped(&self.stash, &key, vec![submission])
    }

    /// The entries of `form_type` that parse, oldest first.
    pub fn list(&self, form_type: FormType) -> Vec<PendingSubmission> {
        read_entries(&self.stash, &pending_key(form_type))
    }

    pub fn len(&self, form_type: FormType) -> usize {
        self.list(form_type).len()
    }

    pub fn is_empty(&self, form_type: FormType) -> bool {
        self.len(form_type) == 0
    }

    /// Removes the entries with the given ids. Entries added since they were read are untouched.
    pub fn remove(&self, form_type: FormType, ids: &BTreeSet<String>) -> usize {
        if ids.is_empty() {
            return 0;
        }
        let (removed, _) = self.stash.update(
            &pending_key(form_type),
            |queue: &mut Vec<Value>| {
                let before = queue.len();
                queue.retain(|entry| !entry_id(entry).is_some_and(|id| ids.contains(id)));
                before - queue.len()
            },
        );
        removed
    }

    pub fn reject(&self, form_type: FormType, entries: Vec<PendingSubmission>) -> Persisted {
        append_capped(&self.stash, &rejected_key(form_type), entries)
    }

    pub fn rejected(&self, form_type: FormType) -> Vec<PendingSubmission> {
        read_entries(&self.stash, &rejected_key(form_type))
    }
}

fn entry_id(entry: &Value) -> Option<&str> {
    entry.get("id").and_then(Value::as_str)
}

fn read_entries(stash: &Stash, key: &str) -> Vec<PendingSubmission> {
    let raw: Vec<Value> = stash.get(key).unwrap_or_default();
    raw.into_iter()
        .enumerate()
        .filter_map(|(index, entry)| {
            serde_json::from_value(entry)
                .inspect_err(|e| log::warn!("Skipping unreadable entry {index} of `{key}`: {e}"))
                .ok()
        })
        .collect()
}

fn append_capped(stash: &Stash, key: &str, entries: Vec<PendingSubmission>) -> Persisted {
    let entries: Vec<Value> = entries
        .iter()
        .filter_map(|entry| {
            serde_json::to_value(entry)
                .inspect_err(|e| log::error!("Failed to serialize submission {}: {e}", entry.id))
                .ok()
        })
        .collect();
    let (evicted, persisted) = stash.update(key, |queue: &mut Vec<Value>| {
        queue.extend(entries);
        let excess = queue.len().saturating_sub(PENDING_RETENTION);
        queue
            .drain(..excess)
            .map(|entry| entry_id(&entry).unwrap_or("?").to_string())
            .collect::<Vec<_>>()
    });
    if !evicted.is_empty() {
        log::warn!(
            "`{key}` is over {PENDING_RETENTION} entries, evicted the oldest: {}",
            evicted.join(", ")
        );
    }
    if persisted == Persisted::Dropped {
        log::error!("Failed to persist `{key}`");
    }
    persisted
}
