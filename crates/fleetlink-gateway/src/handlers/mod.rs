//! HTTP and realtime message handlers.
//!
//! HTTP handlers answer with `{success, message, ...}` bodies; failures go
//! through [`GatewayError`]'s `IntoResponse`.

pub mod direct_control;
pub mod health;
pub mod realtime;

use crate::error::GatewayError;
use axum::extract::rejection::JsonRejection;
use axum::Json;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Successful response body.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub message: String,
    pub data: T,
}

impl<T: Serialize> ApiResponse<T> {
    /// Wrap `data` in a success body.
    pub fn ok(message: impl Into<String>, data: T) -> Json<Self> {
        Json(Self {
            success: true,
            message: message.into(),
            data,
        })
    }
}

/// Unwrap a JSON body, turning extractor rejections into validation errors.
pub(crate) fn json_body<T: DeserializeOwned>(
    body: Result<Json<T>, JsonRejection>,
) -> Result<T, GatewayError> {
    body.map(|Json(value)| value)
        .map_err(|rejection| GatewayError::Validation(rejection.body_text()))
}

/// Require a non-blank string field.
pub(crate) fn required(value: Option<String>, field: &str) -> Result<String, GatewayError> {
    match value.map(|v| v.trim().to_string()) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(GatewayError::Validation(format!("{} is required", field))),
    }
}
