//! Detector - external detection collaborator
//!
//! ## Responsibilities
//!
//! - `Detector` trait: one frame in, detections out
//! - HTTP adapter posting the frame as multipart and parsing the reply

use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bounding box in frame coordinates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

/// One detected object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    #[serde(alias = "conf")]
    pub confidence: f32,
    pub bbox: BoundingBox,
}

/// Detection collaborator
#[async_trait]
pub trait Detector: Send + Sync {
    async fn detect(&self, source_id: &str, frame: Vec<u8>) -> Result<Vec<Detection>>;

    /// Reachability check for health reporting
    async fn health_check(&self) -> bool {
        true
    }
}

#[derive(Debug, Deserialize)]
struct DetectResponse {
    #[serde(default)]
    detections: Vec<Detection>,
}

/// HTTP detection service client
pub struct HttpDetector {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDetector {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl Detector for HttpDetector {
    async fn detect(&self, source_id: &str, frame: Vec<u8>) -> Result<Vec<Detection>> {
        let url = format!("{}/v1/detect", self.base_url);

        let form = Form::new()
            .part(
                "image",
                Part::bytes(frame)
                    .file_name("frame.jpg")
                    .mime_str("image/jpeg")?,
            )
            .text("source_id", source_id.to_string());

        let resp = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::DetectionTimeout(format!("{}: {}", source_id, e))
                } else {
                    Error::DetectionCollaborator(e.to_string())
                }
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::DetectionCollaborator(format!(
                "detect failed: {} - {}",
                status, body
            )));
        }

        let parsed: DetectResponse = resp
            .json()
            .await
            .map_err(|e| Error::DetectionCollaborator(format!("invalid response: {}", e)))?;
        Ok(parsed.detections)
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/healthz", self.base_url);
        match self.client.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}
