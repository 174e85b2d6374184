//! Embedding provider boundary. The vision/text encoder itself is an
//! opaque remote service; this crate only shapes requests and vectors.
//!
//! Every failure path degrades to `None`: a missing embedding must never
//! abort a scrape run or force an update cycle downstream.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;
use vitrine_core::ProductRecord;

pub const CRATE_NAME: &str = "vitrine-embed";

pub const DEFAULT_EMBEDDING_DIM: usize = 768;

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed_image(&self, image_url: &str) -> Option<Vec<f32>>;
    async fn embed_text(&self, text: &str) -> Option<Vec<f32>>;
}

/// Disabled embeddings: always `None`. Used for tests and `--no-embeddings`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEmbedder;

#[async_trait]
impl Embedder for NoopEmbedder {
    async fn embed_image(&self, _image_url: &str) -> Option<Vec<f32>> {
        None
    }

    async fn embed_text(&self, _text: &str) -> Option<Vec<f32>> {
        None
    }
}

#[derive(Debug, Clone)]
pub struct EmbedConfig {
    pub endpoint: String,
    pub dimension: usize,
    pub timeout: Duration,
}

impl EmbedConfig {
    /// Reads `VITRINE_EMBED_URL`; absent means embeddings are disabled.
    pub fn from_env() -> Option<Self> {
        let endpoint = std::env::var("VITRINE_EMBED_URL").ok()?;
        let dimension = std::env::var("VITRINE_EMBED_DIM")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_EMBEDDING_DIM);
        Some(Self {
            endpoint,
            dimension,
            timeout: Duration::from_secs(60),
        })
    }
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    image_url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

/// Remote inference client for a fixed-dimension encoder.
#[derive(Debug)]
pub struct HttpEmbedder {
    client: reqwest::Client,
    endpoint: String,
    dimension: usize,
}

impl HttpEmbedder {
    pub fn new(config: EmbedConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building embedding client")?;
        Ok(Self {
            client,
            endpoint: config.endpoint,
            dimension: config.dimension.max(1),
        })
    }

    async fn request(&self, payload: EmbedRequest<'_>) -> Option<Vec<f32>> {
        let result = self
            .client
            .post(&self.endpoint)
            .json(&payload)
            .send()
            .await;
        let resp = match result {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                warn!(status = %resp.status(), "embedding service rejected request");
                return None;
            }
            Err(err) => {
                warn!(%err, "embedding service unavailable");
                return None;
            }
        };
        match resp.json::<EmbedResponse>().await {
            Ok(body) => Some(shape_vector(body.embedding, self.dimension)),
            Err(err) => {
                warn!(%err, "embedding response was not a vector");
                None
            }
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed_image(&self, image_url: &str) -> Option<Vec<f32>> {
        self.request(EmbedRequest {
            image_url: Some(image_url),
            text: None,
        })
        .await
    }

    async fn embed_text(&self, text: &str) -> Option<Vec<f32>> {
        if text.is_empty() {
            return None;
        }
        self.request(EmbedRequest {
            image_url: None,
            text: Some(text),
        })
        .await
    }
}

/// Pad or truncate to the configured dimension, then L2-normalize.
pub fn shape_vector(mut embedding: Vec<f32>, dimension: usize) -> Vec<f32> {
    if embedding.len() != dimension {
        warn!(
            got = embedding.len(),
            want = dimension,
            "embedding dimension mismatch"
        );
        embedding.resize(dimension, 0.0);
    }
    let norm = embedding.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut embedding {
            *v /= norm;
        }
    }
    embedding
}

/// Searchable text for the info embedding: title plus whatever descriptive
/// attributes the record carries.
pub fn info_text(record: &ProductRecord) -> String {
    let mut parts = vec![record.title.clone()];
    if let Some(category) = &record.category {
        parts.push(category.clone());
    }
    if let Some(gender) = &record.gender {
        parts.push(gender.clone());
    }
    if let Some(metadata) = record.parsed_metadata() {
        if !metadata.sizes_available.is_empty() {
            parts.push(metadata.sizes_available.join(" "));
        }
        if let Some(collection) = metadata.collection {
            parts.push(collection);
        }
    }
    if let Some(description) = &record.description {
        parts.push(description.clone());
    }
    if let Some(price) = &record.price {
        parts.push(price.clone());
    }
    parts.retain(|p| !p.is_empty());
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use vitrine_core::{product_id, ProductMetadata};

    #[test]
    fn shape_vector_normalizes_to_unit_length() {
        let shaped = shape_vector(vec![3.0, 4.0], 2);
        let norm = shaped.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn shape_vector_pads_and_truncates() {
        assert_eq!(shape_vector(vec![1.0], 3).len(), 3);
        assert_eq!(shape_vector(vec![1.0; 8], 3).len(), 3);
        assert_eq!(shape_vector(Vec::new(), 3), vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn info_text_concatenates_descriptive_fields() {
        let metadata = ProductMetadata {
            in_stock: true,
            sizes_available: vec!["M".to_string(), "L".to_string()],
            collection: Some("shop all".to_string()),
        };
        let record = ProductRecord {
            id: product_id("vitrine", "https://s.com/products/x"),
            source: "vitrine".to_string(),
            product_url: "https://s.com/products/x".to_string(),
            image_url: None,
            additional_images: None,
            brand: None,
            title: "Heavyweight Shirt".to_string(),
            description: Some("Boxy fit.".to_string()),
            category: Some("clothes".to_string()),
            gender: Some("man".to_string()),
            price: Some("120USD".to_string()),
            size: Some("L,M".to_string()),
            metadata: Some(serde_json::to_string(&metadata).unwrap()),
            tags: None,
            country: Some("US".to_string()),
            second_hand: false,
            sale: false,
            other: None,
            image_embedding: None,
            info_embedding: None,
        };
        assert_eq!(
            info_text(&record),
            "Heavyweight Shirt clothes man M L shop all Boxy fit. 120USD"
        );
    }

    #[tokio::test]
    async fn noop_embedder_always_returns_none() {
        let embedder = NoopEmbedder;
        assert!(embedder.embed_image("https://img").await.is_none());
        assert!(embedder.embed_text("shirt").await.is_none());
    }
}
