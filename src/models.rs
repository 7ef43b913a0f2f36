use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use serde_with::skip_serializing_none;

/// Attachment kinds a report can be exported to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Csv,
    Pdf,
    Docx,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Pdf => "pdf",
            ExportFormat::Docx => "docx",
        }
    }

    pub fn from_str(input: &str) -> Option<Self> {
        match input {
            "csv" => Some(ExportFormat::Csv),
            "pdf" => Some(ExportFormat::Pdf),
            "docx" => Some(ExportFormat::Docx),
            _ => None,
        }
    }

    pub fn filename(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "report.csv",
            ExportFormat::Pdf => "report.pdf",
            ExportFormat::Docx => "report.docx",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "text/csv",
            ExportFormat::Pdf => "application/pdf",
            ExportFormat::Docx => {
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            }
        }
    }
}

/// A report delivery request that has passed schema and content validation.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    pub recipient: String,
    pub format: ExportFormat,
    pub report_data: Map<String, Value>,
    /// Already sanitized down to the allowed inline markup.
    pub message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExportArtifact {
    pub filename: String,
    pub format: ExportFormat,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Sent,
    Error,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub user_id: String,
    pub recipient: Option<String>,
    pub format: Option<ExportFormat>,
    pub status: AuditOutcome,
    pub message_id: Option<String>,
    pub error: Option<String>,
    pub ip_address: String,
    pub user_agent: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
}

impl ApiError {
    pub fn message(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SendReportResponse {
    pub message: String,
    pub message_id: String,
}

/// Product fields sent to the market analysis and visibility prompts.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProductBrief {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub sector: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BuyerSearch {
    #[serde(default)]
    pub product: Option<String>,
    #[serde(default)]
    pub sector: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BuyerMatch {
    pub company_name: String,
    #[serde(default)]
    pub sector_match: String,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub contact_email: Option<String>,
    #[serde(default)]
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuyerMatchesResponse {
    pub buyers: Vec<BuyerMatch>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VisibilityContent {
    pub seo_text: String,
    pub linkedin_post: String,
    pub ebay_listing: String,
    pub email_pitch: String,
}
