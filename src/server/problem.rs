//! RFC 7807 problem documents for every HTTP error.

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use crate::errors::{LicenseError, PipelineError};

const PROBLEM_TYPE_BASE: &str = "https://marketpipe.dev/problems";

/// The error envelope returned by every API endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Problem {
    #[serde(rename = "type")]
    pub type_uri: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Seconds the client should wait before retrying.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl Problem {
    pub fn new(status: StatusCode, title: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            type_uri: "about:blank".to_string(),
            title: title.into(),
            status: status.as_u16(),
            detail: detail.into(),
            instance: None,
            trace_id: None,
            error_code: None,
            retry_after: None,
            hint: None,
        }
    }

    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "Invalid request", detail)
            .with_code("bad_request")
            .with_hint("check the request payload against the API documentation")
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        let code = code.into();
        self.type_uri = format!("{PROBLEM_TYPE_BASE}/{code}");
        self.error_code = Some(code);
        self
    }

    pub fn with_trace_id(mut self, trace_id: Option<String>) -> Self {
        self.trace_id = trace_id;
        self
    }

    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn from_pipeline_error(err: &PipelineError, trace_id: Option<String>) -> Self {
        let status =
            StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut problem = Self::new(status, "Pipeline request failed", err.to_string())
            .with_code(err.code())
            .with_trace_id(trace_id);
        if let PipelineError::License(license) = err {
            problem.retry_after = license.retry_after().map(|d| d.as_secs());
            problem.hint = Some(license_hint(license).into());
            problem.title = "License check failed".into();
        }
        problem
    }

    pub fn from_license_error(err: &LicenseError, trace_id: Option<String>) -> Self {
        let status =
            StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        Self::new(status, "License check failed", err.to_string())
            .with_code(err.code())
            .with_trace_id(trace_id)
            .with_hint(license_hint(err))
            .with_retry_after(err.retry_after().map(|d| d.as_secs()))
    }

    fn with_retry_after(mut self, retry_after: Option<u64>) -> Self {
        self.retry_after = retry_after;
        self
    }
}

fn license_hint(err: &LicenseError) -> &'static str {
    match err {
        LicenseError::InvalidKey => "double-check the key, or contact support",
        LicenseError::Expired(_) => "renew the license and activate again",
        LicenseError::MachineMismatch => "this key is active on another machine",
        LicenseError::NotActivated => "activate a license key first",
        LicenseError::Revoked => "contact support about this key",
        LicenseError::RateLimited { .. } => "wait before trying again",
        LicenseError::Network(_) => "check connectivity to the license registry",
        LicenseError::Storage(_) => "check permissions on the data directory",
    }
}

impl IntoResponse for Problem {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let retry_after = self.retry_after;
        let mut response = (status, Json(self)).into_response();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn problem_serializes_rfc7807_fields() {
        let problem = Problem::new(StatusCode::NOT_FOUND, "Not found", "pipeline p-1 not found")
            .with_code("pipeline_not_found")
            .with_trace_id(Some("abc-123".into()))
            .with_instance("/api/pipeline/status/p-1");
        let json = serde_json::to_value(&problem).unwrap();
        assert_eq!(json["type"], format!("{PROBLEM_TYPE_BASE}/pipeline_not_found"));
        assert_eq!(json["status"], 404);
        assert_eq!(json["trace_id"], "abc-123");
        assert_eq!(json["instance"], "/api/pipeline/status/p-1");
    }

    #[test]
    fn rate_limited_license_error_carries_retry_after() {
        let err = LicenseError::RateLimited {
            retry_after: Duration::from_secs(90),
        };
        let problem = Problem::from_license_error(&err, None);
        assert_eq!(problem.status, 429);
        assert_eq!(problem.retry_after, Some(90));
        assert_eq!(problem.error_code.as_deref(), Some("rate_limited"));
    }

    #[test]
    fn pipeline_error_maps_status_and_code() {
        let err = PipelineError::NotFound("p-9".into());
        let problem = Problem::from_pipeline_error(&err, Some("t-1".into()));
        assert_eq!(problem.status, 404);
        assert_eq!(problem.error_code.as_deref(), Some("pipeline_not_found"));
        assert_eq!(problem.trace_id.as_deref(), Some("t-1"));
    }

    #[test]
    fn license_gate_failure_is_403_with_hint() {
        let err = PipelineError::License(LicenseError::NotActivated);
        let problem = Problem::from_pipeline_error(&err, None);
        assert_eq!(problem.status, 403);
        assert!(problem.hint.as_deref().unwrap().contains("activate"));
    }
}
