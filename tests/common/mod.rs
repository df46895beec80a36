//! Common test utilities for E2E tests

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use pressfed::{AppState, config};
use rsa::RsaPrivateKey;
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::pkcs8::LineEnding;
use tempfile::TempDir;
use tokio::net::TcpListener;

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
}

/// Configuration used by every test server: account "alice" on example.com
pub fn test_config(temp_dir: &TempDir) -> config::AppConfig {
    let mut accounts = BTreeMap::new();
    accounts.insert(
        "alice".to_string(),
        config::AccountConfig {
            path: "/alice".to_string(),
            display_name: Some("Alice".to_string()),
        },
    );

    config::AppConfig {
        server: config::ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0, // Let OS assign port
            domain: "example.com".to_string(),
            protocol: "https".to_string(),
        },
        database: config::DatabaseConfig {
            path: temp_dir.path().join("test.db"),
        },
        activitypub: config::ActivityPubConfig {
            enabled: true,
            key_path: temp_dir.path().join("private.pem"),
            user_agent: "Pressfed/test".to_string(),
        },
        queue: config::QueueConfig {
            poll_interval_seconds: 1,
            ..config::QueueConfig::default()
        },
        accounts,
        logging: config::LoggingConfig {
            level: "info".to_string(),
            format: "pretty".to_string(),
        },
    }
}

/// Write a fresh RSA key where the configuration expects it
pub fn write_test_key(config: &config::AppConfig) {
    let key = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
    let pem = key.to_pkcs1_pem(LineEnding::LF).unwrap();
    std::fs::write(&config.activitypub.key_path, pem.as_bytes()).unwrap();
}

impl TestServer {
    /// Create a test server with federation enabled
    pub async fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir);
        write_test_key(&config);
        Self::start(config, temp_dir).await
    }

    /// Create a test server whose key file does not exist
    pub async fn without_key() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir);
        Self::start(config, temp_dir).await
    }

    async fn start(config: config::AppConfig, temp_dir: TempDir) -> Self {
        // Initialize app state
        let state = AppState::new(config).await.unwrap();

        // Create HTTP client
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap();

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let addr_str = format!("http://{}", addr);

        let app = pressfed::build_router(state.clone());

        // Spawn server in background
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // Wait a bit for server to start
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

        Self {
            addr: addr_str,
            state,
            _temp_dir: temp_dir,
            client,
        }
    }

    /// Get base URL for API requests
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    pub fn federation(&self) -> &pressfed::service::Federation {
        self.state
            .federation
            .as_deref()
            .expect("federation enabled")
    }

    /// POST a JSON body to an inbox path
    pub async fn post_inbox(&self, path: &str, body: &serde_json::Value) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .header("Content-Type", "application/activity+json")
            .body(body.to_string())
            .send()
            .await
            .unwrap()
    }
}

/// A request received by the fake remote inbox
#[derive(Debug, Clone)]
pub struct ReceivedDelivery {
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

/// A remote server with one actor at `/actor` and its inbox at `/actor/inbox`
pub struct FakeRemote {
    pub base: String,
    pub received: Arc<Mutex<Vec<ReceivedDelivery>>>,
}

impl FakeRemote {
    pub async fn start(inbox_status: StatusCode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let received = Arc::new(Mutex::new(Vec::new()));

        let actor_id = format!("{}/actor", base);
        let router = Router::new()
            .route(
                "/actor",
                get(move || {
                    let actor_id = actor_id.clone();
                    async move {
                        Json(serde_json::json!({
                            "id": actor_id,
                            "type": "Person",
                            "inbox": format!("{}/inbox", actor_id)
                        }))
                    }
                }),
            )
            .route(
                "/actor/inbox",
                post(
                    move |State(received): State<Arc<Mutex<Vec<ReceivedDelivery>>>>,
                          headers: HeaderMap,
                          body: Bytes| async move {
                        received.lock().unwrap().push(ReceivedDelivery {
                            headers,
                            body: body.to_vec(),
                        });
                        inbox_status
                    },
                ),
            )
            .with_state(Arc::clone(&received));

        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { base, received }
    }

    pub fn actor(&self) -> String {
        format!("{}/actor", self.base)
    }

    pub fn inbox(&self) -> String {
        format!("{}/actor/inbox", self.base)
    }

    /// Wait until `count` deliveries arrived
    pub async fn wait_for_deliveries(&self, count: usize) -> Vec<ReceivedDelivery> {
        tokio::time::timeout(std::time::Duration::from_secs(10), async {
            loop {
                {
                    let received = self.received.lock().unwrap();
                    if received.len() >= count {
                        return received.clone();
                    }
                }
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("deliveries did not arrive in time")
    }
}
