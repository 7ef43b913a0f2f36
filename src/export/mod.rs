//! Report exporters. Each format is an independent pure function; [`export`]
//! only dispatches on the requested format.

pub mod csv;
pub mod docx;
pub mod pdf;

use crate::models::{ExportArtifact, ExportFormat};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

pub const REPORT_TITLE: &str = "Ceylog Report";

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("report has no fields to export")]
    EmptyReport,
    #[error("csv export failed: {0}")]
    Csv(String),
    #[error("pdf export failed: {0}")]
    Pdf(String),
    #[error("docx export failed: {0}")]
    Docx(String),
    #[error("payload could not be rendered: {0}")]
    Render(String),
}

/// Seam used by the delivery orchestrator so exporters can be swapped in tests.
pub trait ReportExporter: Send + Sync {
    fn export(
        &self,
        format: ExportFormat,
        data: &Map<String, Value>,
        generated_at: DateTime<Utc>,
    ) -> Result<ExportArtifact, ExportError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StandardExporter;

impl ReportExporter for StandardExporter {
    fn export(
        &self,
        format: ExportFormat,
        data: &Map<String, Value>,
        generated_at: DateTime<Utc>,
    ) -> Result<ExportArtifact, ExportError> {
        export(format, data, generated_at)
    }
}

pub fn export(
    format: ExportFormat,
    data: &Map<String, Value>,
    generated_at: DateTime<Utc>,
) -> Result<ExportArtifact, ExportError> {
    let content = match format {
        ExportFormat::Csv => csv::to_csv(data)?,
        ExportFormat::Pdf => pdf::to_pdf(data, generated_at)?,
        ExportFormat::Docx => docx::to_docx(data, generated_at)?,
    };
    Ok(ExportArtifact {
        filename: format.filename().to_string(),
        format,
        content,
    })
}

/// Two-space indented JSON, the body text of the document formats.
pub(crate) fn pretty_payload(data: &Map<String, Value>) -> Result<String, ExportError> {
    serde_json::to_string_pretty(data).map_err(|err| ExportError::Render(err.to_string()))
}

pub(crate) fn generated_on(generated_at: DateTime<Utc>) -> String {
    format!(
        "Generated on: {}",
        generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    )
}
