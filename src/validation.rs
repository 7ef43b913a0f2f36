use crate::config::DeliveryConfig;
use crate::models::{DeliveryRequest, ExportFormat};
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// First violated rule of a report delivery body; the message is shown to the caller.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct ValidationError(pub String);

impl ValidationError {
    fn field(field: &str, message: &str) -> Self {
        Self(format!("{field}: {message}"))
    }
}

pub const SENSITIVE_DATA_MESSAGE: &str = "Report contains sensitive data";
pub const DOMAIN_NOT_ALLOWED_MESSAGE: &str = "Email domain not allowed";

static EMAIL_SYNTAX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9_'+\-.]*[A-Za-z0-9_+\-]@([A-Za-z0-9][A-Za-z0-9\-]*\.)+[A-Za-z]{2,}$")
        .expect("email pattern")
});

// Card numbers, e-mail addresses, phone numbers, vehicle plates, IPv4 addresses.
// Deliberately broad: any 16-digit or 10-digit run matches. ASCII-only, so `\d` is
// 0-9 and `\b` treats every non-ASCII character as a non-word character.
static SENSITIVE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"\b\d{16}\b",
        r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Z|a-z]{2,}\b",
        r"\b\d{3}[-.]?\d{3}[-.]?\d{4}\b",
        r"\b[A-Z]{2}\d{2}[A-Z]{2}\d{4}\b",
        r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b",
    ]
    .iter()
    .map(|pattern| {
        RegexBuilder::new(pattern)
            .unicode(false)
            .build()
            .expect("sensitive pattern")
    })
    .collect()
});

/// Parses and validates a delivery body. Rules are checked in field order
/// (`recipient`, `format`, `reportData`, `message`) and the first failure wins;
/// the sensitive-data scan only runs once `reportData` is otherwise valid.
pub fn validate_request(
    body: &[u8],
    config: &DeliveryConfig,
) -> Result<DeliveryRequest, ValidationError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|_| ValidationError("Invalid JSON body".to_string()))?;
    let Value::Object(mut fields) = value else {
        return Err(ValidationError("Expected object, received non-object body".to_string()));
    };

    let recipient = validate_recipient(fields.get("recipient"), &config.allowed_email_domains)?;
    let format = validate_format(fields.get("format"))?;
    let report_data = validate_report_data(fields.remove("reportData"), config.max_payload_bytes)?;
    let message = validate_message(fields.get("message"), config.max_message_chars)?;

    Ok(DeliveryRequest {
        recipient,
        format,
        report_data,
        message,
    })
}

fn validate_recipient(
    value: Option<&Value>,
    allowed_domains: &[String],
) -> Result<String, ValidationError> {
    let recipient = match value {
        None | Some(Value::Null) => return Err(ValidationError::field("recipient", "Required")),
        Some(Value::String(s)) => s,
        Some(other) => {
            return Err(ValidationError::field(
                "recipient",
                &format!("Expected string, received {}", type_name(other)),
            ));
        }
    };
    if !is_valid_email(recipient) {
        return Err(ValidationError::field("recipient", "Invalid email"));
    }
    let domain = recipient.split('@').nth(1).unwrap_or_default();
    if !allowed_domains.iter().any(|allowed| allowed == domain) {
        return Err(ValidationError(DOMAIN_NOT_ALLOWED_MESSAGE.to_string()));
    }
    Ok(recipient.clone())
}

fn validate_format(value: Option<&Value>) -> Result<ExportFormat, ValidationError> {
    match value {
        None | Some(Value::Null) => Err(ValidationError::field("format", "Required")),
        Some(Value::String(raw)) => ExportFormat::from_str(raw).ok_or_else(|| {
            ValidationError::field(
                "format",
                &format!("Invalid enum value. Expected 'pdf' | 'csv' | 'docx', received '{raw}'"),
            )
        }),
        Some(other) => Err(ValidationError::field(
            "format",
            &format!("Expected string, received {}", type_name(other)),
        )),
    }
}

fn validate_report_data(
    value: Option<Value>,
    max_bytes: usize,
) -> Result<Map<String, Value>, ValidationError> {
    let data = match value {
        None | Some(Value::Null) => return Err(ValidationError::field("reportData", "Required")),
        Some(Value::Object(map)) => map,
        Some(other) => {
            return Err(ValidationError::field(
                "reportData",
                &format!("Expected object, received {}", type_name(&other)),
            ));
        }
    };
    let serialized = serde_json::to_string(&data)
        .map_err(|_| ValidationError::field("reportData", "Unserializable value"))?;
    if serialized.len() > max_bytes {
        return Err(ValidationError("Report data exceeds maximum size".to_string()));
    }
    if contains_sensitive_data(&serialized) {
        return Err(ValidationError(SENSITIVE_DATA_MESSAGE.to_string()));
    }
    Ok(data)
}

fn validate_message(
    value: Option<&Value>,
    max_chars: usize,
) -> Result<Option<String>, ValidationError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(raw)) => {
            if raw.chars().count() > max_chars {
                return Err(ValidationError::field(
                    "message",
                    &format!("String must contain at most {max_chars} character(s)"),
                ));
            }
            Ok(Some(sanitize_message(raw)))
        }
        Some(other) => Err(ValidationError::field(
            "message",
            &format!("Expected string, received {}", type_name(other)),
        )),
    }
}

pub fn is_valid_email(candidate: &str) -> bool {
    !candidate.starts_with('.') && !candidate.contains("..") && EMAIL_SYNTAX.is_match(candidate)
}

/// Scans the compact JSON form of a report against the sensitive-data patterns.
pub fn contains_sensitive_data(serialized: &str) -> bool {
    SENSITIVE_PATTERNS
        .iter()
        .any(|pattern| pattern.is_match(serialized))
}

/// Keeps `b`, `i`, `em`, `strong` and `a[href]` with http(s) targets; all other
/// markup, attributes and event handlers are removed.
pub fn sanitize_message(message: &str) -> String {
    let tags: HashSet<&str> = ["b", "i", "em", "strong", "a"].into_iter().collect();
    let tag_attributes: HashMap<&str, HashSet<&str>> =
        [("a", ["href"].into_iter().collect())].into_iter().collect();
    let schemes: HashSet<&str> = ["http", "https"].into_iter().collect();

    let mut builder = ammonia::Builder::default();
    builder
        .tags(tags)
        .generic_attributes(HashSet::new())
        .tag_attributes(tag_attributes)
        .url_schemes(schemes)
        .link_rel(None);
    builder.clean(message).to_string()
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
