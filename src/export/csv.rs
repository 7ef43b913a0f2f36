use super::ExportError;
use ::csv::{QuoteStyle, WriterBuilder};
use serde_json::{Map, Value};

/// One header line of top-level keys and one row of values. Strings lose
/// their `<` and `>` characters (a blunt guard, not escaping); nested values
/// are written as compact JSON.
pub fn to_csv(data: &Map<String, Value>) -> Result<Vec<u8>, ExportError> {
    if data.is_empty() {
        return Err(ExportError::EmptyReport);
    }

    let mut writer = WriterBuilder::new()
        .delimiter(b',')
        .quote(b'"')
        .quote_style(QuoteStyle::NonNumeric)
        .from_writer(Vec::new());

    writer
        .write_record(data.keys())
        .map_err(|err| ExportError::Csv(err.to_string()))?;

    let mut row = Vec::with_capacity(data.len());
    for value in data.values() {
        row.push(cell(strip_angle_brackets(value.clone()))?);
    }
    writer
        .write_record(&row)
        .map_err(|err| ExportError::Csv(err.to_string()))?;

    writer
        .into_inner()
        .map_err(|err| ExportError::Csv(err.to_string()))
}

fn strip_angle_brackets(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(s.replace(['<', '>'], "")),
        Value::Array(items) => Value::Array(items.into_iter().map(strip_angle_brackets).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| (key, strip_angle_brackets(value)))
                .collect(),
        ),
        other => other,
    }
}

fn cell(value: Value) -> Result<String, ExportError> {
    match value {
        Value::Null => Ok(String::new()),
        Value::String(s) => Ok(s),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        nested => serde_json::to_string(&nested).map_err(|err| ExportError::Csv(err.to_string())),
    }
}
