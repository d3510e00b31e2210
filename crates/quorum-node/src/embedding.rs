//! token-level text embeddings
//!
//! an [`Embedder`] turns each text into one vector per token, which is what
//! [`crate::consensus::max_similarity`] scores.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{NodeError, Result};

/// one vector per token
pub type TokenVectors = Vec<Vec<f32>>;

#[async_trait]
pub trait Embedder: Send + Sync {
    /// one [`TokenVectors`] per input text, in input order
    async fn embed(&self, texts: &[String]) -> Result<Vec<TokenVectors>>;
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    texts: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<TokenVectors>,
}

/// remote embedding service, `POST {url}/embed`
#[derive(Clone)]
pub struct HttpEmbedder {
    url: String,
    client: Client,
}

impl HttpEmbedder {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NodeError::ComponentInit(format!("http client: {}", e)))?;
        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<TokenVectors>> {
        let response: EmbedResponse = self
            .client
            .post(format!("{}/embed", self.url))
            .json(&EmbedRequest { texts })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .map_err(|e| NodeError::Embedding(e.to_string()))?;

        if response.embeddings.len() != texts.len() {
            return Err(NodeError::Embedding(format!(
                "asked for {} embeddings, got {}",
                texts.len(),
                response.embeddings.len()
            )));
        }
        Ok(response.embeddings)
    }
}

/// offline embedder: every lowercase word maps to a fixed pseudo-random unit
/// vector, so identical words score 1 and unrelated words score near 0
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dim: usize,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self { dim: 64 }
    }
}

impl HashingEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(1) }
    }

    fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
    }

    fn token_vector(&self, token: &str) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.dim);
        let mut block = 0u32;
        while out.len() < self.dim {
            let mut hasher = Sha256::new();
            hasher.update(token.as_bytes());
            hasher.update(block.to_le_bytes());
            for byte in hasher.finalize() {
                if out.len() == self.dim {
                    break;
                }
                out.push(byte as i8 as f32);
            }
            block += 1;
        }
        let norm = out.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            out.iter_mut().for_each(|x| *x /= norm);
        }
        out
    }

    pub fn embed_text(&self, text: &str) -> TokenVectors {
        Self::tokens(text).map(|t| self.token_vector(&t)).collect()
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<TokenVectors>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::cosine;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex};

    /// embedding service stub: one vector per word, optionally short one
    /// text or failing outright
    #[derive(Clone, Default)]
    struct FakeService {
        requests: Arc<Mutex<Vec<Value>>>,
        drop_last: bool,
        fail: bool,
    }

    async fn embed_handler(
        State(service): State<FakeService>,
        Json(body): Json<Value>,
    ) -> std::result::Result<Json<Value>, StatusCode> {
        service.requests.lock().unwrap().push(body.clone());
        if service.fail {
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
        let mut embeddings: Vec<Vec<Vec<f32>>> = body["texts"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| {
                t.as_str()
                    .unwrap()
                    .split_whitespace()
                    .map(|w| vec![w.len() as f32, 1.0])
                    .collect()
            })
            .collect();
        if service.drop_last {
            embeddings.pop();
        }
        Ok(Json(json!({ "embeddings": embeddings })))
    }

    async fn spawn_service(service: FakeService) -> String {
        let app = Router::new()
            .route("/embed", post(embed_handler))
            .with_state(service);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/", addr)
    }

    fn texts() -> Vec<String> {
        vec!["paris is nice".to_string(), "paris".to_string()]
    }

    #[tokio::test]
    async fn test_http_embedder_posts_texts() {
        let service = FakeService::default();
        let url = spawn_service(service.clone()).await;
        let embedder = HttpEmbedder::new(&url, Duration::from_secs(5)).unwrap();

        let out = embedder.embed(&texts()).await.unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].len(), 3);
        assert_eq!(out[1], vec![vec![5.0, 1.0]]);

        let requests = service.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0], json!({ "texts": ["paris is nice", "paris"] }));
    }

    #[tokio::test]
    async fn test_http_embedder_count_mismatch() {
        let url = spawn_service(FakeService {
            drop_last: true,
            ..FakeService::default()
        })
        .await;
        let embedder = HttpEmbedder::new(&url, Duration::from_secs(5)).unwrap();
        assert!(matches!(
            embedder.embed(&texts()).await,
            Err(NodeError::Embedding(_))
        ));
    }

    #[tokio::test]
    async fn test_http_embedder_server_error_is_transient() {
        let url = spawn_service(FakeService {
            fail: true,
            ..FakeService::default()
        })
        .await;
        let embedder = HttpEmbedder::new(&url, Duration::from_secs(5)).unwrap();
        assert!(embedder.embed(&texts()).await.unwrap_err().is_transient());
    }

    #[test]
    fn test_hashing_embedder_shape() {
        let embedder = HashingEmbedder::new(32);
        let vectors = embedder.embed_text("The answer, is 42!");
        assert_eq!(vectors.len(), 4);
        assert!(vectors.iter().all(|v| v.len() == 32));
        assert!(embedder.embed_text("  ...  ").is_empty());
    }

    #[test]
    fn test_same_token_same_vector() {
        let embedder = HashingEmbedder::default();
        let a = embedder.embed_text("Paris");
        let b = embedder.embed_text("paris");
        assert!((cosine(&a[0], &b[0]) - 1.0).abs() < 1e-5);

        let c = embedder.embed_text("london");
        assert!(cosine(&a[0], &c[0]).abs() < 0.6);
    }

    #[tokio::test]
    async fn test_embed_keeps_order() {
        let embedder = HashingEmbedder::default();
        let texts = vec!["one two".to_string(), "three".to_string()];
        let out = embedder.embed(&texts).await.unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].len(), 2);
        assert_eq!(out[1].len(), 1);
    }
}
