//! Uniform JSON response envelope.
//!
//! ```json
//! { "ok": true, "code": "ok", "message": "success", "data": { ... }, "retriable": false }
//! ```

use axum::Json;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub ok: bool,
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub retriable: bool,
}

/// Successful response carrying `data`.
pub fn ok<T: Serialize>(data: T) -> Json<Envelope<T>> {
    ok_with_message("success", data)
}

pub fn ok_with_message<T: Serialize>(message: &str, data: T) -> Json<Envelope<T>> {
    Json(Envelope {
        ok: true,
        code: "ok".to_string(),
        message: message.to_string(),
        data: Some(data),
        details: None,
        retriable: false,
    })
}
