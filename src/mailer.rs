use crate::models::ExportArtifact;
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const RESEND_API_URL: &str = "https://api.resend.com/emails";

#[derive(Debug, Error)]
pub enum MailError {
    #[error("missing mail api key")]
    MissingCredentials,
    #[error("http error: {0}")]
    Http(String),
    #[error("provider rejected message: {0}")]
    Rejected(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone)]
pub struct OutboundEmail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub text: String,
    pub attachment: ExportArtifact,
}

/// Sends one message with one attachment and returns the provider message id.
#[async_trait]
pub trait MailSender: Send + Sync {
    async fn send(&self, email: &OutboundEmail) -> Result<String, MailError>;
}

pub struct ResendMailer {
    api_key: Option<String>,
    endpoint: String,
    http: Client,
}

impl ResendMailer {
    pub fn from_env(http: Client) -> Self {
        Self {
            api_key: std::env::var("RESEND_API_KEY")
                .ok()
                .filter(|value| !value.trim().is_empty()),
            endpoint: std::env::var("RESEND_API_URL").unwrap_or_else(|_| RESEND_API_URL.into()),
            http,
        }
    }
}

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    text: &'a str,
    attachments: [Attachment<'a>; 1],
}

#[derive(Debug, Serialize)]
struct Attachment<'a> {
    filename: &'a str,
    content: String,
    content_type: &'a str,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    message: Option<String>,
}

#[async_trait]
impl MailSender for ResendMailer {
    async fn send(&self, email: &OutboundEmail) -> Result<String, MailError> {
        let api_key = self.api_key.as_ref().ok_or(MailError::MissingCredentials)?;

        let body = SendRequest {
            from: &email.from,
            to: [&email.to],
            subject: &email.subject,
            text: &email.text,
            attachments: [Attachment {
                filename: &email.attachment.filename,
                content: BASE64.encode(&email.attachment.content),
                content_type: email.attachment.format.content_type(),
            }],
        };

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| MailError::Http(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response
                .json::<ErrorResponse>()
                .await
                .ok()
                .and_then(|payload| payload.message)
                .unwrap_or_else(|| format!("HTTP {status}"));
            return Err(MailError::Rejected(detail));
        }

        let payload: SendResponse = response
            .json()
            .await
            .map_err(|err| MailError::InvalidResponse(err.to_string()))?;
        Ok(payload.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExportFormat;

    fn email() -> OutboundEmail {
        OutboundEmail {
            from: "Ceylog Reports <reports@ceylog.com>".into(),
            to: "buyer@gmail.com".into(),
            subject: "Your Report from Ceylog".into(),
            text: "hi".into(),
            attachment: ExportArtifact {
                filename: "report.csv".into(),
                format: ExportFormat::Csv,
                content: b"a,b\n1,2\n".to_vec(),
            },
        }
    }

    #[test]
    fn request_body_carries_base64_attachment() {
        let email = email();
        let body = SendRequest {
            from: &email.from,
            to: [&email.to],
            subject: &email.subject,
            text: &email.text,
            attachments: [Attachment {
                filename: &email.attachment.filename,
                content: BASE64.encode(&email.attachment.content),
                content_type: email.attachment.format.content_type(),
            }],
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["to"][0], "buyer@gmail.com");
        assert_eq!(value["attachments"][0]["filename"], "report.csv");
        assert_eq!(value["attachments"][0]["content"], "YSxiCjEsMgo=");
    }

    #[tokio::test]
    async fn missing_key_fails_before_network() {
        let mailer = ResendMailer {
            api_key: None,
            endpoint: RESEND_API_URL.into(),
            http: Client::new(),
        };
        assert!(matches!(
            mailer.send(&email()).await,
            Err(MailError::MissingCredentials)
        ));
    }
}
