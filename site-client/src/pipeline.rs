//! Delivers form submissions, falling back to the local pending queue when the API can't be reached.
//!
//! Every submission ends in exactly one [`SubmissionOutcome`]:
//! 1. The API accepted it: `Submitted`.
//! 2. The API answered and refused the payload: `Rejected`, with the server's message for the user. Nothing is
//!    stored, because the same payload would be refused again.
//! 3. The API never answered, or answered with a server failure (5xx): `SavedLocally`. The submission goes into
//!    the pending queue and [`SubmissionPipeline::flush_pending`] delivers it later.
//!
//! If a WhatsApp handoff was requested it is opened exactly once, after (1) or (3) has been persisted.

use std::collections::BTreeSet;
use std::sync::Arc;

use chokepoint::ChokePoint;
use site_types::{FormData, FormType, SessionId, SubmitFormRequest, VisitorId};

use crate::api::{ApiError, Remote};
use crate::identity::generate_id;
use crate::pending::{PendingQueue, PendingSubmission};
use crate::whatsapp::{Handoff, whatsapp_link, whatsapp_message};

/// `source` sent with submissions made directly from a form.
pub const WEBSITE_SOURCE: &str = "website";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionOutcome {
    Submitted { id: Option<String> },
    SavedLocally { pending_id: String },
    Rejected { message: String },
}

impl SubmissionOutcome {
    /// What to tell the user.
    pub fn user_message(&self) -> String {
        match self {
            SubmissionOutcome::Submitted { .. } => {
                "Thank you! Your submission has been received.".to_string()
            }
            SubmissionOutcome::SavedLocally { .. } => {
                "You appear to be offline. Your submission was saved on this device and will be sent automatically."
                    .to_string()
            }
            SubmissionOutcome::Rejected { message } => {
                format!("Please check the form and try again: {message}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhatsAppHandoff {
    pub message: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionReceipt {
    pub outcome: SubmissionOutcome,
    /// Set when a handoff was requested and opened.
    pub whatsapp: Option<WhatsAppHandoff>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub delivered: usize,
    /// Refused by the server on replay and moved to the rejected list.
    pub rejected: usize,
    /// Still queued after this flush.
    pub remaining: usize,
    /// Why the flush stopped early, if it did.
    pub interrupted: Option<String>,
}

pub struct SubmissionPipeline<R: Remote> {
    remote: Arc<R>,
    queue: PendingQueue,
    whatsapp_number: Option<String>,
    flushes: ChokePoint<FormType, FlushReport>,
}

impl<R: Remote> SubmissionPipeline<R> {
    pub fn new(remote: Arc<R>, queue: PendingQueue, whatsapp_number: Option<String>) -> Self {
        Self {
            remote,
            queue,
            whatsapp_number,
            flushes: ChokePoint::new(),
        }
    }

    pub fn queue(&self) -> &PendingQueue {
        &self.queue
    }

    pub async fn submit(
        &self,
        form: FormData,
        visitor_id: VisitorId,
        session_id: SessionId,
        handoff: Option<&dyn Handoff>,
    ) -> SubmissionReceipt {
        // minted up front so a replay from the queue carries the id of the first attempt
        let submission_id = generate_id();
        let request = SubmitFormRequest {
            form,
            visitor_id,
            session_id,
            source: WEBSITE_SOURCE.to_string(),
            client_submission_id: Some(submission_id.clone()),
        };

        let (outcome, server_message) = match self.remote.deliver_form(&request).await {
            Ok(response) if response.success => {
                let id = response.id_string();
                log::info!("{} submission delivered (id {id:?})", request.form.form_type());
                (SubmissionOutcome::Submitted { id }, response.whatsapp_message)
            }
            Ok(response) => {
                let message = response
                    .error
                    .or(response.message)
                    .unwrap_or_else(|| "Submission was not accepted".to_string());
                (SubmissionOutcome::Rejected { message }, None)
            }
            Err(ApiError::Decode(e)) => {
                // a 2xx the client couldn't read; the server has the submission
                log::warn!("{} submission accepted with unreadable reply: {e}", request.form.form_type());
                (SubmissionOutcome::Submitted { id: None }, None)
            }
            Err(e)
                if e.is_transport()
                    || matches!(e, ApiError::Server { .. } | ApiError::InvalidRequest(_)) =>
            {
                log::warn!(
                    "Could not deliver to the API ({e}), keeping {} submission locally",
                    request.form.form_type()
                );
                let SubmitFormRequest {
                    form,
                    visitor_id,
                    session_id,
                    ..
                } = request.clone();
                self.queue.push(PendingSubmission::new(
                    submission_id.clone(),
                    form,
                    visitor_id,
                    session_id,
                ));
                (
                    SubmissionOutcome::SavedLocally {
                        pending_id: submission_id,
                    },
                    None,
                )
            }
            Err(e) => (
                SubmissionOutcome::Rejected {
                    message: e.to_string(),
                },
                None,
            ),
        };

        let whatsapp = match (handoff, &outcome) {
            (Some(_), SubmissionOutcome::Rejected { .. }) | (None, _) => None,
            (Some(handoff), _) => {
                let message = server_message.unwrap_or_else(|| whatsapp_message(&request.form));
                let url = whatsapp_link(self.whatsapp_number.as_deref(), &message);
                handoff.open(&url);
                Some(WhatsAppHandoff { message, url })
            }
        };

        SubmissionReceipt { outcome, whatsapp }
    }

    /// Replays queued submissions of `form_type` in order, stopping at the first one that can't reach the API.
    ///
    /// Safe to call repeatedly and concurrently: overlapping calls for one form type share a single run,
    /// and entries are removed by id, so submissions queued during a flush are kept.
    pub async fn flush_pending(&self, form_type: FormType) -> FlushReport {
        let remote = Arc::clone(&self.remote);
        let queue = self.queue.clone();
        self.flushes
            .run(form_type, move || async move {
                flush_queue(remote.as_ref(), &queue, form_type).await
            })
            .await
    }

    pub async fn flush_all(&self) -> Vec<(FormType, FlushReport)> {
        let mut reports = Vec::new();
        for form_type in FormType::ALL {
            if self.queue.is_empty(form_type) {
                continue;
            }
            reports.push((form_type, self.flush_pending(form_type).await));
        }
        reports
    }
}

async fn flush_queue<R: Remote>(
    remote: &R,
    queue: &PendingQueue,
    form_type: FormType,
) -> FlushReport {
    let entries = queue.list(form_type);
    let mut delivered = BTreeSet::new();
    let mut refused = Vec::new();
    let mut interrupted = None;

    for entry in entries {
        match remote.deliver_form(&entry.to_request()).await {
            Ok(response) if response.success => {
                delivered.insert(entry.id.clone());
            }
            Ok(response) => {
                log::warn!(
                    "Server refused queued submission {}: {:?}",
                    entry.id,
                    response.error.as_deref().or(response.message.as_deref())
                );
                refused.push(entry);
            }
            Err(ApiError::Validation { message, .. }) => {
                log::warn!("Server refused queued submission {}: {message}", entry.id);
                refused.push(entry);
            }
            Err(ApiError::Decode(e)) => {
                // a 2xx with an odd body still means the server took it
                log::warn!("Queued submission {} accepted with unreadable reply: {e}", entry.id);
                delivered.insert(entry.id.clone());
            }
            Err(e) => {
                log::info!("Stopping flush of {form_type} submissions: {e}");
                interrupted = Some(e.to_string());
                break;
            }
        }
    }

    let mut done = delivered.clone();
    done.extend(refused.iter().map(|entry| entry.id.clone()));
    let rejected = refused.len();
    if !refused.is_empty() {
        queue.reject(form_type, refused);
    }
    queue.remove(form_type, &done);

    let report = FlushReport {
        delivered: delivered.len(),
        rejected,
        remaining: queue.len(form_type),
        interrupted,
    };
    if report.delivered + report.rejected > 0 {
        log::info!("Flushed {form_type} submissions: {report:?}");
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeRemote, Reply, RecordingHandoff};
    use site_types::{ContactForm, FeedbackForm};
    use stash::Stash;

    fn ids() -> (VisitorId, SessionId) {
        (VisitorId::new("v1"), SessionId::new("s1"))
    }

    fn feedback_form() -> FormData {
        FormData::Feedback(FeedbackForm {
            name: "Ankit".to_string(),
            email: Some("a@x.com".to_string()),
            rating: None,
            project: None,
            feedback: "hi".to_string(),
        })
    }

    fn contact_form() -> FormData {
        FormData::Contact(ContactForm {
            name: "Ankit".to_string(),
            email: "a@x.com".to_string(),
            phone: None,
            service: None,
            message: "hi".to_string(),
        })
    }

    fn pipeline(remote: FakeRemote) -> (SubmissionPipeline<FakeRemote>, Arc<FakeRemote>, Arc<Stash>) {
        let stash = Arc::new(Stash::in_memory());
        let remote = Arc::new(remote);
        let pipeline = SubmissionPipeline::new(
            Arc::clone(&remote),
            PendingQueue::new(Arc::clone(&stash)),
            Some("919876543210".to_string()),
        );
        (pipeline, remote, stash)
    }

    #[tokio::test]
    async fn test_offline_submission_is_kept() {
        let (pipeline, _, stash) = pipeline(FakeRemote::new(Reply::Offline));
        let (visitor, session) = ids();

        let receipt = pipeline.submit(feedback_form(), visitor, session, None).await;

        let SubmissionOutcome::SavedLocally { pending_id } = &receipt.outcome else {
            panic!("expected a local save, got {:?}", receipt.outcome);
        };
        let stored = stash.get_json("pending_feedback").unwrap();
        let stored = stored.as_array().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0]["name"], "Ankit");
        assert_eq!(stored[0]["fromLocalStorage"], true);
        assert_eq!(stored[0]["id"], pending_id.as_str());
        assert!(receipt.outcome.user_message().contains("saved on this device"));
    }

    #[tokio::test]
    async fn test_unreadable_success_is_not_queued() {
        let (pipeline, _, _) = pipeline(FakeRemote::new(Reply::Garbled));
        let (visitor, session) = ids();
        let receipt = pipeline.submit(contact_form(), visitor, session, None).await;
        assert_eq!(receipt.outcome, SubmissionOutcome::Submitted { id: None });
        assert!(pipeline.queue().is_empty(FormType::Contact));
    }

    #[tokio::test]
    async fn test_timeout_counts_as_offline() {
        let (pipeline, _, _) = pipeline(FakeRemote::new(Reply::TimedOut));
        let (visitor, session) = ids();
        let receipt = pipeline.submit(contact_form(), visitor, session, None).await;
        assert!(matches!(receipt.outcome, SubmissionOutcome::SavedLocally { .. }));
        assert_eq!(pipeline.queue().len(FormType::Contact), 1);
    }

    #[tokio::test]
    async fn test_server_failure_is_kept_for_retry() {
        let (pipeline, remote, _) = pipeline(FakeRemote::new(Reply::ServerDown));
        let (visitor, session) = ids();
        let handoff = RecordingHandoff::default();

        let receipt = pipeline
            .submit(contact_form(), visitor, session, Some(&handoff))
            .await;
        assert!(matches!(receipt.outcome, SubmissionOutcome::SavedLocally { .. }));
        assert!(receipt.outcome.user_message().contains("saved on this device"));
        assert_eq!(pipeline.queue().len(FormType::Contact), 1);
        assert_eq!(handoff.opened().len(), 1);

        let report = pipeline.flush_pending(FormType::Contact).await;
        assert_eq!(report.remaining, 1);
        assert!(report.interrupted.is_some());

        remote.set_reply(Reply::Accepted);
        let report = pipeline.flush_pending(FormType::Contact).await;
        assert_eq!(report.delivered, 1);
        assert!(pipeline.queue().is_empty(FormType::Contact));
    }

    #[tokio::test]
    async fn test_validation_error_is_not_stored() {
        let (pipeline, _, stash) = pipeline(FakeRemote::new(Reply::Invalid("Email is required")));
        let (visitor, session) = ids();
        let handoff = RecordingHandoff::default();

        let receipt = pipeline
            .submit(contact_form(), visitor, session, Some(&handoff))
            .await;

        assert_eq!(
            receipt.outcome,
            SubmissionOutcome::Rejected {
                message: "Email is required".to_string()
            }
        );
        assert_eq!(stash.get_json("pending_contact"), None);
        assert!(handoff.opened().is_empty());
        assert_eq!(receipt.whatsapp, None);
    }

    #[tokio::test]
    async fn test_unsuccessful_reply_is_rejected() {
        let (pipeline, _, _) = pipeline(FakeRemote::new(Reply::Unsuccessful("Duplicate")));
        let (visitor, session) = ids();
        let receipt = pipeline.submit(contact_form(), visitor, session, None).await;
        assert_eq!(
            receipt.outcome,
            SubmissionOutcome::Rejected {
                message: "Duplicate".to_string()
            }
        );
        assert!(pipeline.queue().is_empty(FormType::Contact));
    }

    #[tokio::test]
    async fn test_handoff_opens_once_on_either_path() {
        for reply in [Reply::Accepted, Reply::Offline] {
            let (pipeline, _, _) = pipeline(FakeRemote::new(reply));
            let (visitor, session) = ids();
            let handoff = RecordingHandoff::default();

            let receipt = pipeline
                .submit(contact_form(), visitor, session, Some(&handoff))
                .await;

            let opened = handoff.opened();
            assert_eq!(opened.len(), 1, "{:?}", receipt.outcome);
            assert!(opened[0].starts_with("https://wa.me/919876543210?text="));
            assert_eq!(receipt.whatsapp.map(|w| w.url), Some(opened[0].clone()));
        }
    }

    #[tokio::test]
    async fn test_server_whatsapp_message_wins() {
        let remote = FakeRemote::new(Reply::Accepted).with_whatsapp_message("Server says hi");
        let (pipeline, _, _) = pipeline(remote);
        let (visitor, session) = ids();
        let handoff = RecordingHandoff::default();

        let receipt = pipeline
            .submit(contact_form(), visitor, session, Some(&handoff))
            .await;
        assert_eq!(
            receipt.whatsapp.map(|w| w.message).as_deref(),
            Some("Server says hi")
        );
    }

    #[tokio::test]
    async fn test_flush_delivers_and_clears() {
        let (pipeline, remote, _) = pipeline(FakeRemote::new(Reply::Offline));
        for _ in 0..3 {
            let (visitor, session) = ids();
            pipeline.submit(feedback_form(), visitor, session, None).await;
        }
        let queued: Vec<_> = pipeline
            .queue()
            .list(FormType::Feedback)
            .into_iter()
            .map(|entry| entry.id)
            .collect();

        remote.set_reply(Reply::Accepted);
        let report = pipeline.flush_pending(FormType::Feedback).await;
        assert_eq!(
            report,
            FlushReport {
                delivered: 3,
                rejected: 0,
                remaining: 0,
                interrupted: None
            }
        );

        let replayed: Vec<_> = remote
            .delivered()
            .into_iter()
            .filter(|request| request.source == crate::pending::SYNC_SOURCE)
            .filter_map(|request| request.client_submission_id)
            .collect();
        assert_eq!(replayed, queued);

        // nothing left, so a second flush sends nothing
        let before = remote.delivered().len();
        assert_eq!(
            pipeline.flush_pending(FormType::Feedback).await,
            FlushReport::default()
        );
        assert_eq!(remote.delivered().len(), before);
    }

    #[tokio::test]
    async fn test_flush_stops_when_still_offline() {
        let (pipeline, _, _) = pipeline(FakeRemote::new(Reply::Offline));
        let (visitor, session) = ids();
        pipeline.submit(contact_form(), visitor, session, None).await;

        let report = pipeline.flush_pending(FormType::Contact).await;
        assert_eq!(report.delivered, 0);
        assert_eq!(report.remaining, 1);
        assert!(report.interrupted.is_some());
    }

    #[tokio::test]
    async fn test_flush_moves_refused_entries_aside() {
        let (pipeline, remote, _) = pipeline(FakeRemote::new(Reply::Offline));
        let (visitor, session) = ids();
        pipeline.submit(contact_form(), visitor, session, None).await;

        remote.set_reply(Reply::Invalid("Phone is required"));
        let report = pipeline.flush_pending(FormType::Contact).await;
        assert_eq!(report.rejected, 1);
        assert_eq!(report.remaining, 0);
        assert_eq!(pipeline.queue().rejected(FormType::Contact).len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_flushes_send_each_entry_once() {
        let (pipeline, remote, _) = pipeline(FakeRemote::new(Reply::Offline));
        for _ in 0..4 {
            let (visitor, session) = ids();
            pipeline.submit(contact_form(), visitor, session, None).await;
        }
        remote.set_reply(Reply::Accepted);
        remote.set_delay(std::time::Duration::from_millis(10));

        let (a, b) = tokio::join!(
            pipeline.flush_pending(FormType::Contact),
            pipeline.flush_pending(FormType::Contact)
        );
        assert_eq!(a, b);
        assert_eq!(a.delivered, 4);

        let replays = remote
            .delivered()
            .into_iter()
            .filter(|request| request.source == crate::pending::SYNC_SOURCE)
            .count();
        assert_eq!(replays, 4);
    }

    #[tokio::test]
    async fn test_flush_all_skips_empty_queues() {
        let (pipeline, remote, _) = pipeline(FakeRemote::new(Reply::Offline));
        let (visitor, session) = ids();
        pipeline.submit(feedback_form(), visitor, session, None).await;
        remote.set_reply(Reply::Accepted);

        let reports = pipeline.flush_all().await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].0, FormType::Feedback);
        assert_eq!(reports[0].1.delivered, 1);
    }
}
