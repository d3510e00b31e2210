//! gossip transport
//!
//! [`GossipTransport`] is the node's only view of the publish/subscribe
//! network. [`WakuClient`] talks to a waku relay node over its rest api,
//! [`MemoryTransport`] keeps every topic in process for tests and simulation.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{NodeError, Result};

/// one message as the relay hands it out
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GossipMessage {
    /// base64
    pub payload: String,
    pub content_topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

#[async_trait]
pub trait GossipTransport: Send + Sync {
    async fn health_check(&self) -> Result<bool>;

    async fn subscribe(&self, topics: &[String]) -> Result<()>;

    /// messages on `topic`; subscribes and retries once when the relay does
    /// not know the topic yet
    async fn fetch_messages(&self, topic: &str) -> Result<Vec<GossipMessage>>;

    async fn push_message(&self, payload: &str, topic: &str) -> Result<()>;
}

/// waku relay rest client
#[derive(Clone)]
pub struct WakuClient {
    base_url: String,
    client: Client,
    retries: u32,
    backoff: Duration,
}

impl WakuClient {
    pub fn new(base_url: &str, timeout: Duration, retries: u32, backoff: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NodeError::ComponentInit(format!("http client: {}", e)))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            retries,
            backoff,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            &config.gossip_url,
            config.request_timeout(),
            config.transport_retries,
            config.retry_backoff(),
        )
    }

    fn messages_url(&self, topic: &str) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(topic.as_bytes()).collect();
        format!("{}/relay/v1/auto/messages/{}", self.base_url, encoded)
    }

    /// run `op`, retrying transient failures with a fixed backoff
    async fn retrying<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Err(e) if e.is_transient() && attempt < self.retries => {
                    attempt += 1;
                    warn!("{} failed (attempt {}/{}): {}", what, attempt, self.retries + 1, e);
                    tokio::time::sleep(self.backoff).await;
                }
                other => return other,
            }
        }
    }

    /// `None` when the relay answers 404 (topic not subscribed)
    async fn fetch_once(&self, topic: &str) -> Result<Option<Vec<GossipMessage>>> {
        let response = self.client.get(self.messages_url(topic)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let messages = response.error_for_status()?.json().await?;
        Ok(Some(messages))
    }

    /// `false` when the relay answers 404
    async fn push_once(&self, payload: &str, topic: &str) -> Result<bool> {
        let body = json!({
            "payload": payload,
            "contentTopic": topic,
        });
        let response = self
            .client
            .post(format!("{}/relay/v1/auto/messages", self.base_url))
            .json(&body)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        response.error_for_status()?;
        Ok(true)
    }
}

#[async_trait]
impl GossipTransport for WakuClient {
    async fn health_check(&self) -> Result<bool> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await;
        match response {
            Ok(r) => Ok(r.status().is_success()),
            Err(e) => {
                debug!("relay health check failed: {}", e);
                Ok(false)
            }
        }
    }

    async fn subscribe(&self, topics: &[String]) -> Result<()> {
        self.retrying("subscribe", || async {
            self.client
                .post(format!("{}/relay/v1/subscriptions", self.base_url))
                .json(&topics)
                .send()
                .await?
                .error_for_status()?;
            Ok::<(), NodeError>(())
        })
        .await
    }

    async fn fetch_messages(&self, topic: &str) -> Result<Vec<GossipMessage>> {
        if let Some(messages) = self.retrying("fetch", || self.fetch_once(topic)).await? {
            return Ok(messages);
        }
        debug!("topic {} not subscribed, subscribing", topic);
        self.subscribe(&[topic.to_string()]).await?;
        self.retrying("fetch", || self.fetch_once(topic))
            .await?
            .ok_or_else(|| NodeError::Transport(format!("relay does not serve topic {}", topic)))
    }

    async fn push_message(&self, payload: &str, topic: &str) -> Result<()> {
        if self.retrying("push", || self.push_once(payload, topic)).await? {
            return Ok(());
        }
        debug!("topic {} not subscribed, subscribing", topic);
        self.subscribe(&[topic.to_string()]).await?;
        if self.retrying("push", || self.push_once(payload, topic)).await? {
            Ok(())
        } else {
            Err(NodeError::Transport(format!("relay refused push to {}", topic)))
        }
    }
}

#[derive(Default)]
struct MemoryTopics {
    subscribed: HashSet<String>,
    messages: HashMap<String, Vec<GossipMessage>>,
}

/// in-process transport; every fetch sees every message ever pushed to the
/// topic
#[derive(Clone, Default)]
pub struct MemoryTransport {
    inner: Arc<Mutex<MemoryTopics>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryTopics>> {
        self.inner
            .lock()
            .map_err(|_| NodeError::Transport("memory transport poisoned".into()))
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.lock().map(|t| t.subscribed.contains(topic)).unwrap_or(false)
    }

    pub fn message_count(&self, topic: &str) -> usize {
        self.lock()
            .map(|t| t.messages.get(topic).map(Vec::len).unwrap_or(0))
            .unwrap_or(0)
    }
}

#[async_trait]
impl GossipTransport for MemoryTransport {
    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    async fn subscribe(&self, topics: &[String]) -> Result<()> {
        let mut inner = self.lock()?;
        inner.subscribed.extend(topics.iter().cloned());
        Ok(())
    }

    async fn fetch_messages(&self, topic: &str) -> Result<Vec<GossipMessage>> {
        let mut inner = self.lock()?;
        inner.subscribed.insert(topic.to_string());
        Ok(inner.messages.get(topic).cloned().unwrap_or_default())
    }

    async fn push_message(&self, payload: &str, topic: &str) -> Result<()> {
        let mut inner = self.lock()?;
        inner.messages.entry(topic.to_string()).or_default().push(GossipMessage {
            payload: payload.to_string(),
            content_topic: topic.to_string(),
            timestamp: None,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, State};
    use axum::http::StatusCode as HttpStatus;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// minimal relay: topics must be subscribed before use, and the first
    /// `failures` fetches answer 503
    #[derive(Clone, Default)]
    struct FakeRelay {
        topics: Arc<Mutex<MemoryTopics>>,
        failures: Arc<AtomicU32>,
        subscribe_calls: Arc<AtomicU32>,
    }

    async fn health() -> &'static str {
        "Node is healthy"
    }

    async fn subscribe(State(relay): State<FakeRelay>, Json(topics): Json<Vec<String>>) -> HttpStatus {
        relay.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        relay.topics.lock().unwrap().subscribed.extend(topics);
        HttpStatus::OK
    }

    async fn fetch(
        State(relay): State<FakeRelay>,
        Path(topic): Path<String>,
    ) -> std::result::Result<Json<Vec<GossipMessage>>, HttpStatus> {
        if relay
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(HttpStatus::SERVICE_UNAVAILABLE);
        }
        let topics = relay.topics.lock().unwrap();
        if !topics.subscribed.contains(&topic) {
            return Err(HttpStatus::NOT_FOUND);
        }
        Ok(Json(topics.messages.get(&topic).cloned().unwrap_or_default()))
    }

    async fn push(State(relay): State<FakeRelay>, Json(message): Json<GossipMessage>) -> HttpStatus {
        let mut topics = relay.topics.lock().unwrap();
        if !topics.subscribed.contains(&message.content_topic) {
            return HttpStatus::NOT_FOUND;
        }
        topics
            .messages
            .entry(message.content_topic.clone())
            .or_default()
            .push(message);
        HttpStatus::OK
    }

    async fn spawn_relay(relay: FakeRelay) -> String {
        let app = Router::new()
            .route("/health", get(health))
            .route("/relay/v1/subscriptions", post(subscribe))
            .route("/relay/v1/auto/messages", post(push))
            .route("/relay/v1/auto/messages/{topic}", get(fetch))
            .with_state(relay);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn client(url: &str, retries: u32) -> WakuClient {
        WakuClient::new(url, Duration::from_secs(5), retries, Duration::from_millis(10)).unwrap()
    }

    #[test]
    fn test_topic_is_url_encoded() {
        let client = client("http://relay:8645/", 0);
        assert_eq!(
            client.messages_url("/dria/0/heartbeat/proto"),
            "http://relay:8645/relay/v1/auto/messages/%2Fdria%2F0%2Fheartbeat%2Fproto"
        );
    }

    #[tokio::test]
    async fn test_unsubscribed_topic_subscribes_and_retries() {
        let relay = FakeRelay::default();
        let url = spawn_relay(relay.clone()).await;
        let client = client(&url, 0);

        assert!(client.health_check().await.unwrap());

        let topic = "/dria/0/task-1/proto";
        client.push_message("aGVsbG8=", topic).await.unwrap();
        assert_eq!(relay.subscribe_calls.load(Ordering::SeqCst), 1);

        let messages = client.fetch_messages(topic).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload, "aGVsbG8=");
        assert_eq!(messages[0].content_topic, topic);
        assert_eq!(relay.subscribe_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_errors_retried() {
        let relay = FakeRelay::default();
        relay.failures.store(2, Ordering::SeqCst);
        let url = spawn_relay(relay.clone()).await;

        let topic = "/dria/0/heartbeat/proto".to_string();
        let flaky = client(&url, 2);
        flaky.subscribe(&[topic.clone()]).await.unwrap();
        assert!(flaky.fetch_messages(&topic).await.unwrap().is_empty());

        relay.failures.store(3, Ordering::SeqCst);
        let err = flaky.fetch_messages(&topic).await.unwrap_err();
        assert!(err.is_transient(), "{err}");
    }

    #[tokio::test]
    async fn test_unreachable_relay_is_unhealthy() {
        let client = client("http://127.0.0.1:1", 0);
        assert!(!client.health_check().await.unwrap());
        assert!(client.fetch_messages("/x/0/y/proto").await.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn test_memory_transport_keeps_history() {
        let transport = MemoryTransport::new();
        transport.push_message("a", "/t/0/x/proto").await.unwrap();
        transport.push_message("b", "/t/0/x/proto").await.unwrap();

        let first = transport.fetch_messages("/t/0/x/proto").await.unwrap();
        let second = transport.fetch_messages("/t/0/x/proto").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
        assert!(transport.is_subscribed("/t/0/x/proto"));
        assert!(transport.fetch_messages("/t/0/y/proto").await.unwrap().is_empty());
    }
}
