//! Signed activity delivery
//!
//! Deliveries are queued as [`DeliveryRequest`]s on the "ap" queue and
//! sent by [`DeliveryHandler`]. A delivery that keeps failing is retried
//! with a growing delay; after the last attempt every follower using the
//! target inbox is dropped.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use http::{HeaderMap, HeaderValue, Method};
use reqwest::header::{ACCEPT, ACCEPT_CHARSET, CONTENT_TYPE, DATE, HOST, USER_AGENT};
use serde::{Deserialize, Serialize};

use super::activity::Activity;
use super::actor::{ACTIVITY_JSON, REQUEST_TIMEOUT, is_success_status, validate_remote_url};
use super::events::{EventSender, FederationEvent};
use super::identity::FederationIdentity;
use super::queue::{Queue, QueueAction, QueueHandler};
use super::signature::{host_header_value, http_date};
use crate::data::{Database, QueueItem};
use crate::error::AppError;
use crate::metrics::{DELIVERIES_TOTAL, DELIVERY_DURATION_SECONDS, FOLLOWER_CHANGES_TOTAL};

/// Name of the queue outbound activities go through
pub const DELIVERY_QUEUE: &str = "ap";

/// Content-Type of delivery bodies
pub const ACTIVITY_JSON_UTF8: &str = "application/activity+json; charset=utf-8";

/// Payload of a queued delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRequest {
    /// IRI of the local account the activity is sent as
    pub account_iri: String,
    /// Target inbox URL
    pub inbox: String,
    /// Encoded activity, sent byte for byte
    pub activity: String,
    /// Failed attempts so far
    #[serde(default)]
    pub tries: u32,
}

impl DeliveryRequest {
    pub fn new(account_iri: &str, inbox: &str, activity: &Activity) -> Result<Self, AppError> {
        let activity = activity
            .to_json()
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to encode activity: {}", e)))?;

        Ok(Self {
            account_iri: account_iri.to_string(),
            inbox: inbox.to_string(),
            activity,
            tries: 0,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, AppError> {
        serde_json::to_vec(self)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to encode delivery: {}", e)))
    }

    pub fn decode(content: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(content)
    }
}

/// Queue `activity` for immediate delivery to `inbox`
pub async fn enqueue_delivery(
    queue: &Queue,
    account_iri: &str,
    inbox: &str,
    activity: &Activity,
) -> Result<String, AppError> {
    let request = DeliveryRequest::new(account_iri, inbox, activity)?;
    queue.enqueue(&request.encode()?, Utc::now()).await
}

/// Sends signed POST requests to remote inboxes
#[derive(Clone)]
pub struct DeliveryClient {
    http_client: reqwest::Client,
    identity: Arc<FederationIdentity>,
    user_agent: String,
}

impl DeliveryClient {
    pub fn new(
        http_client: reqwest::Client,
        identity: Arc<FederationIdentity>,
        user_agent: &str,
    ) -> Self {
        Self {
            http_client,
            identity,
            user_agent: user_agent.to_string(),
        }
    }

    /// POST `body` to `inbox`, signed as `account_iri`
    ///
    /// Any failure, including a non-success status, is an error.
    pub async fn deliver(&self, account_iri: &str, inbox: &str, body: &[u8]) -> Result<(), AppError> {
        let url = validate_remote_url(inbox)?;

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT_CHARSET, HeaderValue::from_static("utf-8"));
        headers.insert(ACCEPT, HeaderValue::from_static(ACTIVITY_JSON));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(ACTIVITY_JSON_UTF8));
        headers.insert(DATE, header_value(&http_date(Utc::now()))?);
        headers.insert(USER_AGENT, header_value(&self.user_agent)?);
        headers.insert(HOST, header_value(&host_header_value(&url)?)?);

        let key_id = format!("{}#main-key", account_iri);
        self.identity
            .signer()
            .sign(&Method::POST, &url, &mut headers, body, &key_id)?;

        let started = Instant::now();
        let result = self
            .http_client
            .post(url)
            .headers(headers)
            .body(body.to_vec())
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await;

        let outcome = match &result {
            Ok(response) if is_success_status(response.status()) => "success",
            _ => "failure",
        };
        DELIVERY_DURATION_SECONDS
            .with_label_values(&[outcome])
            .observe(started.elapsed().as_secs_f64());
        DELIVERIES_TOTAL.with_label_values(&[outcome]).inc();

        let response = result?;
        let status = response.status();
        if !is_success_status(status) {
            return Err(AppError::Federation(format!(
                "Delivery to {} failed with status {}",
                inbox, status
            )));
        }

        tracing::debug!(inbox = %inbox, status = %status, "Activity delivered");
        Ok(())
    }
}

fn header_value(value: &str) -> Result<HeaderValue, AppError> {
    HeaderValue::from_str(value)
        .map_err(|e| AppError::Validation(format!("Invalid header value {:?}: {}", value, e)))
}

/// Retry policy of the delivery queue
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts before the target inbox is given up on
    pub max_attempts: u32,
    /// The n-th retry waits `n * delay_unit`
    pub delay_unit: Duration,
}

impl From<&crate::config::QueueConfig> for RetryPolicy {
    fn from(config: &crate::config::QueueConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            delay_unit: Duration::from_secs(config.retry_delay_seconds),
        }
    }
}

/// Handles items of the delivery queue
pub struct DeliveryHandler {
    client: DeliveryClient,
    db: Arc<Database>,
    policy: RetryPolicy,
    events: EventSender,
}

impl DeliveryHandler {
    pub fn new(
        client: DeliveryClient,
        db: Arc<Database>,
        policy: RetryPolicy,
        events: EventSender,
    ) -> Self {
        Self {
            client,
            db,
            policy,
            events,
        }
    }

    async fn evict_inbox(&self, inbox: &str) {
        match self.db.remove_inbox(inbox).await {
            Ok(removed) => {
                tracing::warn!(
                    inbox = %inbox,
                    removed = removed.len(),
                    "Giving up on inbox, removed its followers"
                );
                for follower in removed {
                    FOLLOWER_CHANGES_TOTAL.with_label_values(&["evicted"]).inc();
                    let _ = self.events.send(FederationEvent::FollowerRemoved {
                        account: follower.account,
                        follower: follower.follower,
                    });
                }
            }
            Err(e) => tracing::error!(inbox = %inbox, "Failed to remove inbox: {}", e),
        }
    }
}

impl QueueHandler for DeliveryHandler {
    async fn handle(&self, item: QueueItem) -> QueueAction {
        let mut request = match DeliveryRequest::decode(&item.content) {
            Ok(request) => request,
            Err(e) => {
                tracing::error!(item = %item.id, "Dropping undecodable delivery: {}", e);
                return QueueAction::Dequeue;
            }
        };

        let result = self
            .client
            .deliver(&request.account_iri, &request.inbox, request.activity.as_bytes())
            .await;

        let error = match result {
            Ok(()) => return QueueAction::Dequeue,
            Err(e) => e,
        };

        request.tries += 1;
        if request.tries < self.policy.max_attempts {
            tracing::info!(
                inbox = %request.inbox,
                tries = request.tries,
                "Delivery failed, retrying later: {}",
                error
            );

            let delay = self.policy.delay_unit.saturating_mul(request.tries);
            return match request.encode() {
                Ok(content) => QueueAction::Reschedule { content, delay },
                Err(e) => {
                    tracing::error!(item = %item.id, "Failed to re-encode delivery: {}", e);
                    QueueAction::Dequeue
                }
            };
        }

        tracing::warn!(
            inbox = %request.inbox,
            tries = request.tries,
            "Delivery failed for the last time: {}",
            error
        );
        self.evict_inbox(&request.inbox).await;
        QueueAction::Dequeue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::activity::ActivityKind;
    use crate::federation::events;
    use crate::federation::identity::tests::test_identity;
    use crate::federation::signature::verify_signature;
    use axum::body::Bytes;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::Router;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::net::TcpListener;

    #[derive(Clone, Default)]
    struct Captured {
        requests: Arc<Mutex<Vec<(HeaderMap, Vec<u8>)>>>,
    }

    async fn spawn_inbox(status: StatusCode) -> (String, Captured) {
        let captured = Captured::default();
        let router = Router::new()
            .route(
                "/users/bob/inbox",
                post(
                    move |State(captured): State<Captured>, headers: HeaderMap, body: Bytes| async move {
                        captured
                            .requests
                            .lock()
                            .unwrap()
                            .push((headers, body.to_vec()));
                        status
                    },
                ),
            )
            .with_state(captured.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        (format!("http://{}/users/bob/inbox", addr), captured)
    }

    async fn create_test_db() -> (Arc<Database>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::connect(&temp_dir.path().join("delivery.db"))
            .await
            .unwrap();
        (Arc::new(db), temp_dir)
    }

    fn handler(identity: Arc<FederationIdentity>, db: Arc<Database>) -> DeliveryHandler {
        let (events, _) = events::channel();
        DeliveryHandler::new(
            DeliveryClient::new(reqwest::Client::new(), identity, "Pressfed/test"),
            db,
            RetryPolicy {
                max_attempts: 20,
                delay_unit: Duration::from_secs(600),
            },
            events,
        )
    }

    fn queue_item(request: &DeliveryRequest) -> QueueItem {
        QueueItem {
            id: "01TEST".to_string(),
            name: DELIVERY_QUEUE.to_string(),
            content: request.encode().unwrap(),
            schedule_ms: 0,
            attempts: 0,
            created_at: Utc::now(),
        }
    }

    fn accept_request(inbox: &str) -> DeliveryRequest {
        let mut accept = Activity::new(ActivityKind::Accept);
        accept.id = Some("https://example.com/alice#abc".to_string());
        accept.actor = Some("https://example.com/alice".to_string());
        DeliveryRequest::new("https://example.com/alice", inbox, &accept).unwrap()
    }

    #[test]
    fn request_tries_default_to_zero() {
        let request = DeliveryRequest::decode(
            br#"{"account_iri":"https://example.com/alice","inbox":"https://r.example/inbox","activity":"{}"}"#,
        )
        .unwrap();
        assert_eq!(request.tries, 0);
    }

    #[tokio::test]
    async fn delivery_is_signed_and_sends_exact_body() {
        let identity = Arc::new(test_identity());
        let (inbox, captured) = spawn_inbox(StatusCode::ACCEPTED).await;
        let client = DeliveryClient::new(reqwest::Client::new(), Arc::clone(&identity), "Pressfed/test");
        let body = br#"{"type":"Accept","id":"https://example.com/alice#x"}"#;

        client
            .deliver("https://example.com/alice", &inbox, body)
            .await
            .unwrap();

        let requests = captured.requests.lock().unwrap();
        let (headers, received) = &requests[0];
        assert_eq!(received.as_slice(), body.as_slice());
        assert_eq!(headers.get("content-type").unwrap(), ACTIVITY_JSON_UTF8);
        assert_eq!(headers.get("accept").unwrap(), ACTIVITY_JSON);
        assert_eq!(headers.get("accept-charset").unwrap(), "utf-8");
        assert_eq!(headers.get("user-agent").unwrap(), "Pressfed/test");

        let host = url::Url::parse(&inbox).unwrap();
        assert_eq!(
            headers.get("host").unwrap().to_str().unwrap(),
            host_header_value(&host).unwrap()
        );

        let signature = headers.get("signature").unwrap().to_str().unwrap();
        assert!(signature.contains("keyId=\"https://example.com/alice#main-key\""));

        verify_signature(
            "POST",
            "/users/bob/inbox",
            headers,
            Some(received.as_slice()),
            identity.public_key_pem(),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let identity = Arc::new(test_identity());
        let (inbox, _) = spawn_inbox(StatusCode::INTERNAL_SERVER_ERROR).await;
        let client = DeliveryClient::new(reqwest::Client::new(), identity, "ua");

        let result = client.deliver("https://example.com/alice", &inbox, b"{}").await;
        assert!(matches!(result, Err(AppError::Federation(_))));
    }

    #[tokio::test]
    async fn successful_delivery_is_dequeued() {
        let identity = Arc::new(test_identity());
        let (db, _temp) = create_test_db().await;
        let (inbox, captured) = spawn_inbox(StatusCode::OK).await;

        let action = handler(identity, db).handle(queue_item(&accept_request(&inbox))).await;

        assert_eq!(action, QueueAction::Dequeue);
        assert_eq!(captured.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn undecodable_item_is_dequeued() {
        let identity = Arc::new(test_identity());
        let (db, _temp) = create_test_db().await;
        let mut item = queue_item(&accept_request("https://remote.example/inbox"));
        item.content = b"garbage".to_vec();

        assert_eq!(handler(identity, db).handle(item).await, QueueAction::Dequeue);
    }

    #[tokio::test]
    async fn failures_back_off_linearly() {
        let identity = Arc::new(test_identity());
        let (db, _temp) = create_test_db().await;
        let (inbox, _) = spawn_inbox(StatusCode::SERVICE_UNAVAILABLE).await;
        let handler = handler(identity, db);

        let mut request = accept_request(&inbox);
        for expected_tries in 1..20u32 {
            match handler.handle(queue_item(&request)).await {
                QueueAction::Reschedule { content, delay } => {
                    let next = DeliveryRequest::decode(&content).unwrap();
                    assert_eq!(next.tries, expected_tries);
                    assert_eq!(next.activity, request.activity);
                    assert_eq!(delay, Duration::from_secs(600) * expected_tries);
                    request = next;
                }
                QueueAction::Dequeue => panic!("dequeued after {} tries", expected_tries),
            }
        }
    }

    #[tokio::test]
    async fn oversized_delay_unit_saturates() {
        let identity = Arc::new(test_identity());
        let (db, _temp) = create_test_db().await;
        let (inbox, _) = spawn_inbox(StatusCode::SERVICE_UNAVAILABLE).await;
        let (events, _) = events::channel();
        let handler = DeliveryHandler::new(
            DeliveryClient::new(reqwest::Client::new(), identity, "ua"),
            db,
            RetryPolicy {
                max_attempts: 20,
                delay_unit: Duration::MAX,
            },
            events,
        );

        let mut request = accept_request(&inbox);
        request.tries = 5;
        match handler.handle(queue_item(&request)).await {
            QueueAction::Reschedule { delay, .. } => assert_eq!(delay, Duration::MAX),
            QueueAction::Dequeue => panic!("expected a retry"),
        }
    }

    #[tokio::test]
    async fn last_failure_evicts_every_follower_of_the_inbox() {
        let identity = Arc::new(test_identity());
        let (db, _temp) = create_test_db().await;
        let (inbox, _) = spawn_inbox(StatusCode::GONE).await;

        db.upsert_follower("alice", "https://remote.example/users/bob", &inbox)
            .await
            .unwrap();
        db.upsert_follower("blog", "https://remote.example/users/bob", &inbox)
            .await
            .unwrap();
        db.upsert_follower("alice", "https://other.example/users/carol", "https://other.example/inbox")
            .await
            .unwrap();

        let (events, mut receiver) = events::channel();
        let handler = DeliveryHandler::new(
            DeliveryClient::new(reqwest::Client::new(), identity, "ua"),
            Arc::clone(&db),
            RetryPolicy {
                max_attempts: 20,
                delay_unit: Duration::from_secs(600),
            },
            events,
        );

        let mut request = accept_request(&inbox);
        request.tries = 19;
        assert_eq!(handler.handle(queue_item(&request)).await, QueueAction::Dequeue);

        assert!(db.list_followers("blog").await.unwrap().is_empty());
        let remaining = db.list_followers("alice").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert!(remaining.contains_key("https://other.example/users/carol"));

        assert!(matches!(
            receiver.try_recv().unwrap(),
            FederationEvent::FollowerRemoved { .. }
        ));
    }
}
