use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{Value, json};
use site_client::{ClientConfig, LogHandoff, Site, SubmissionOutcome};
use site_types::{FeedbackForm, FormData, FormType};

type Seen = Arc<Mutex<Vec<Value>>>;

fn unreachable_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}/api")
}

async fn serve(seen: Seen) -> String {
    let app = Router::new()
        .route(
            "/api/forms/submit",
            post(|State(seen): State<Seen>, Json(body): Json<Value>| async move {
                let mut seen = seen.lock().unwrap();
                seen.push(body);
                Json(json!({ "success": true, "id": seen.len() }))
            }),
        )
        .route("/api/analytics/track", post(|| async { Json(json!({ "success": true })) }))
        .with_state(seen);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    format!("http://{addr}/api")
}

fn config(data_dir: &std::path::Path, api_base_url: String) -> ClientConfig {
    ClientConfig {
        api_base_url,
        data_dir: data_dir.to_path_buf(),
        request_timeout: Duration::from_secs(2),
        ..ClientConfig::default()
    }
}

fn feedback() -> FormData {
    FormData::Feedback(FeedbackForm {
        name: "Ankit".to_string(),
        email: Some("a@x.com".to_string()),
        rating: None,
        project: None,
        feedback: "hi".to_string(),
    })
}

#[tokio::test]
async fn test_offline_submission_survives_restart_and_syncs() {
    let dir = tempfile::tempdir().unwrap();

    let offline = Site::init(config(dir.path(), unreachable_url())).unwrap();
    let visitor = offline.visitor_id();
    let receipt = offline.submit_form(feedback(), Some(&LogHandoff)).await;
    let SubmissionOutcome::SavedLocally { pending_id } = &receipt.outcome else {
        panic!("expected a local save, got {:?}", receipt.outcome);
    };
    assert!(receipt.whatsapp.is_some());
    offline.dispose().await;

    let stored: Value =
        serde_json::from_slice(&std::fs::read(dir.path().join("pending_feedback.json")).unwrap())
            .unwrap();
    assert_eq!(stored[0]["name"], "Ankit");
    assert_eq!(stored[0]["fromLocalStorage"], true);

    let seen: Seen = Arc::default();
    let online = Site::init(config(dir.path(), serve(Arc::clone(&seen)).await)).unwrap();
    assert_eq!(online.visitor_id(), visitor);
    assert_eq!(online.pending(FormType::Feedback).len(), 1);

    let reports = online.flush_all().await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].1.delivered, 1);
    assert!(online.pending(FormType::Feedback).is_empty());

    let replayed = seen.lock().unwrap()[0].clone();
    assert_eq!(replayed["source"], "local_sync");
    assert_eq!(replayed["clientSubmissionId"], pending_id.as_str());
    assert_eq!(replayed["formData"]["name"], "Ankit");
    assert_eq!(replayed["visitorId"], visitor.as_str());

    let snapshot = online.analytics_snapshot();
    assert_eq!(snapshot.log.form_submissions.len(), 1);
    online.dispose().await;
}

#[tokio::test]
async fn test_online_submission_is_not_queued() {
    let dir = tempfile::tempdir().unwrap();
    let seen: Seen = Arc::default();
    let site = Site::init(config(dir.path(), serve(Arc::clone(&seen)).await)).unwrap();

    let receipt = site.submit_form(feedback(), None).await;
    assert_eq!(
        receipt.outcome,
        SubmissionOutcome::Submitted {
            id: Some("1".to_string())
        }
    );
    assert!(site.pending(FormType::Feedback).is_empty());
    assert_eq!(seen.lock().unwrap()[0]["source"], "website");
    site.dispose().await;
}
