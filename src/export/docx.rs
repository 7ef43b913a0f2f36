use super::{ExportError, REPORT_TITLE, generated_on, pretty_payload};
use chrono::{DateTime, Utc};
use docx_rs::{AlignmentType, Docx, LineSpacing, Paragraph, Run, Style, StyleType};
use serde_json::{Map, Value};
use std::io::Cursor;

const HEADING_STYLE: &str = "Heading1";
/// Half-points, i.e. 12pt.
const BODY_SIZE: usize = 24;
/// Twentieths of a point after the title and timestamp.
const SPACING_AFTER: u32 = 200;

pub fn to_docx(
    data: &Map<String, Value>,
    generated_at: DateTime<Utc>,
) -> Result<Vec<u8>, ExportError> {
    let body = pretty_payload(data)?;

    let heading = Style::new(HEADING_STYLE, StyleType::Paragraph)
        .name("Heading 1")
        .size(32)
        .bold();

    let title = Paragraph::new()
        .add_run(Run::new().add_text(REPORT_TITLE))
        .style(HEADING_STYLE)
        .align(AlignmentType::Center)
        .line_spacing(LineSpacing::new().after(SPACING_AFTER));

    let stamp = Paragraph::new()
        .add_run(Run::new().add_text(generated_on(generated_at)))
        .align(AlignmentType::Center)
        .line_spacing(LineSpacing::new().after(SPACING_AFTER));

    let content = Paragraph::new().add_run(Run::new().add_text(body).size(BODY_SIZE));

    let mut buffer = Cursor::new(Vec::new());
    Docx::new()
        .add_style(heading)
        .add_paragraph(title)
        .add_paragraph(stamp)
        .add_paragraph(content)
        .build()
        .pack(&mut buffer)
        .map_err(|err| ExportError::Docx(err.to_string()))?;
    Ok(buffer.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn produces_zip_container() {
        let data = json!({ "buyers": [{ "companyName": "Acme Imports" }] })
            .as_object()
            .cloned()
            .unwrap();
        let bytes = to_docx(&data, Utc::now()).expect("docx");
        assert!(bytes.starts_with(b"PK"));
        assert!(bytes.len() > 100);
    }
}
