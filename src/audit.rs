use crate::models::AuditRecord;
use async_trait::async_trait;
use reqwest::Client;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("store rejected record: {0}")]
    Rejected(String),
}

/// Append-only sink for delivery outcomes.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, record: &AuditRecord) -> Result<(), AuditError>;
}

/// Inserts records into the `email_logs` collection of a PostgREST-style
/// document store.
#[derive(Debug, Clone)]
pub struct RestAuditStore {
    base_url: String,
    service_key: String,
    http: Client,
}

impl RestAuditStore {
    pub fn from_env(http: Client) -> Option<Self> {
        let base_url = std::env::var("AUDIT_STORE_URL").ok()?;
        let service_key = std::env::var("AUDIT_STORE_KEY").ok()?;
        Some(Self::new(base_url, service_key, http))
    }

    pub fn new(base_url: impl Into<String>, service_key: impl Into<String>, http: Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            service_key: service_key.into(),
            http,
        }
    }
}

#[async_trait]
impl AuditStore for RestAuditStore {
    async fn append(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let url = format!("{}/rest/v1/email_logs", self.base_url);
        let response = self
            .http
            .post(url)
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
            .header("Prefer", "return=minimal")
            .json(record)
            .send()
            .await
            .map_err(|err| AuditError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(AuditError::Rejected(format!("HTTP {}", response.status())));
        }
        Ok(())
    }
}

/// Writes records to the diagnostic stream when no store is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAuditStore;

#[async_trait]
impl AuditStore for LogAuditStore {
    async fn append(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let encoded =
            serde_json::to_string(record).map_err(|err| AuditError::Rejected(err.to_string()))?;
        info!(target = "ceylog.audit", record = %encoded, "email_log");
        Ok(())
    }
}
