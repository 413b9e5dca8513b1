//! Remote license registry client.
//!
//! The registry is the authoritative copy of every license record. The
//! manager talks to it through the [`LicenseRegistry`] trait so tests can
//! substitute an in-memory registry; production uses [`HttpRegistry`]
//! (reqwest, 30 s timeout).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::LicenseError;

/// HTTP timeout for registry calls.
const REGISTRY_TIMEOUT: Duration = Duration::from_secs(30);

/// License lifecycle state as the registry reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteStatus {
    Available,
    Activated,
    Expired,
    Revoked,
}

/// The registry's view of one license.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteLicense {
    pub key: String,
    pub status: RemoteStatus,
    #[serde(default)]
    pub machine_id: Option<String>,
    #[serde(default)]
    pub expires_on: Option<NaiveDate>,
    #[serde(default)]
    pub issued_at: Option<DateTime<Utc>>,
    /// Standard validity duration, used when `expires_on` is not set yet.
    #[serde(default)]
    pub duration_days: Option<i64>,
}

/// The operations the license manager needs from the registry.
#[async_trait]
pub trait LicenseRegistry: Send + Sync {
    /// Fetch the current record for a key.
    async fn fetch(&self, key: &str) -> Result<RemoteLicense, LicenseError>;

    /// Bind a key to a machine (the activation write).
    async fn bind(&self, key: &str, machine_id: &str) -> Result<RemoteLicense, LicenseError>;
}

/// Production registry client.
pub struct HttpRegistry {
    http: reqwest::Client,
    base_url: String,
}

impl HttpRegistry {
    pub fn new(base_url: impl Into<String>) -> Result<Self, LicenseError> {
        let http = reqwest::Client::builder()
            .timeout(REGISTRY_TIMEOUT)
            .build()
            .map_err(|e| LicenseError::Network(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn decode(response: reqwest::Response) -> Result<RemoteLicense, LicenseError> {
        match response.status() {
            s if s.is_success() => response
                .json::<RemoteLicense>()
                .await
                .map_err(|e| LicenseError::Network(format!("malformed registry response: {e}"))),
            reqwest::StatusCode::NOT_FOUND => Err(LicenseError::InvalidKey),
            reqwest::StatusCode::CONFLICT => Err(LicenseError::MachineMismatch),
            s => Err(LicenseError::Network(format!("registry returned {s}"))),
        }
    }
}

#[derive(Serialize)]
struct BindRequest<'a> {
    machine_id: &'a str,
}

#[async_trait]
impl LicenseRegistry for HttpRegistry {
    async fn fetch(&self, key: &str) -> Result<RemoteLicense, LicenseError> {
        let url = format!("{}/licenses/{key}", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| LicenseError::Network(e.to_string()))?;
        Self::decode(response).await
    }

    async fn bind(&self, key: &str, machine_id: &str) -> Result<RemoteLicense, LicenseError> {
        let url = format!("{}/licenses/{key}/activate", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&BindRequest { machine_id })
            .send()
            .await
            .map_err(|e| LicenseError::Network(e.to_string()))?;
        Self::decode(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_license_deserializes_with_optional_fields_absent() {
        let license: RemoteLicense =
            serde_json::from_str(r#"{"key": "K-1", "status": "available"}"#).unwrap();
        assert_eq!(license.status, RemoteStatus::Available);
        assert!(license.machine_id.is_none());
        assert!(license.expires_on.is_none());
    }

    #[test]
    fn remote_license_full_round_trip() {
        let license = RemoteLicense {
            key: "K-2".into(),
            status: RemoteStatus::Activated,
            machine_id: Some("abc123".into()),
            expires_on: NaiveDate::from_ymd_opt(2026, 1, 1),
            issued_at: Some(Utc::now()),
            duration_days: Some(365),
        };
        let json = serde_json::to_string(&license).unwrap();
        let back: RemoteLicense = serde_json::from_str(&json).unwrap();
        assert_eq!(back.status, RemoteStatus::Activated);
        assert_eq!(back.machine_id.as_deref(), Some("abc123"));
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let client = HttpRegistry::new("https://registry.example/api/").unwrap();
        assert_eq!(client.base_url, "https://registry.example/api");
    }
}
