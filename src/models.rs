//! Shared API models

use serde::{Deserialize, Serialize};

/// Standard API response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_sec: u64,
    pub ffmpeg: Option<String>,
    pub detector_configured: bool,
    pub detector_connected: bool,
    pub sources: usize,
}

/// Host load snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostStats {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub overloaded: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_response_shape() {
        let ok = serde_json::to_value(ApiResponse::success(3)).unwrap();
        assert_eq!(ok, serde_json::json!({"success": true, "data": 3}));

        let err = serde_json::to_value(ApiResponse::<()>::error("nope")).unwrap();
        assert_eq!(err, serde_json::json!({"success": false, "error": "nope"}));
    }
}
