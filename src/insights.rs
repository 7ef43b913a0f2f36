use crate::llm::{ChatModel, LlmMessage};
use crate::models::{BuyerMatch, BuyerSearch, ProductBrief, VisibilityContent};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

const ANALYST_PROMPT: &str =
    "You are a market analysis expert. Provide detailed, accurate, and actionable market insights.";
const MATCHMAKER_PROMPT: &str = "You are a professional business matchmaker specializing in UK markets. \
Provide accurate, actionable matches with real companies.";
const MARKETER_PROMPT: &str = "You are a professional marketing assistant specializing in B2B product \
marketing and international trade. Your responses should be clear, professional, and optimized for each \
specific platform.";

#[derive(Debug, Error)]
pub enum InsightError {
    #[error("missing required fields")]
    MissingFields,
    #[error("llm request failed: {0}")]
    Llm(String),
    #[error("model returned no content")]
    EmptyResponse,
    #[error("unable to parse model output: {0}")]
    Parse(String),
    #[error("model output has the wrong shape")]
    InvalidShape,
}

/// Asks for a sectioned analysis and keys each `Title: text` block by its
/// lower-cased, whitespace-free title (`Market Size` becomes `marketsize`).
pub async fn generate_market_analysis(
    llm: &dyn ChatModel,
    brief: &ProductBrief,
) -> Result<Map<String, Value>, InsightError> {
    let prompt = format!(
        "Analyze the market for the following product:\n\n\
Product Name: {name}\nDescription: {description}\nSector: {sector}\n\n\
Please provide a comprehensive market analysis in the following format:\n\n\
Market Size: [Estimate of the total market size and potential revenue]\n\n\
Growth Trends: [Current and projected market growth trends]\n\n\
Key Competitors: [Main competitors in the market]\n\n\
Target Markets: [Primary and secondary target markets]\n\n\
Recommendations: [Strategic recommendations for market entry and growth]\n\n\
Make the analysis specific to this product and sector, focusing on actionable insights.",
        name = field(&brief.name),
        description = field(&brief.description),
        sector = field(&brief.sector),
    );
    let text = complete(llm, ANALYST_PROMPT, prompt, 1000).await?;
    Ok(parse_sections(&text))
}

pub async fn match_buyers(
    llm: &dyn ChatModel,
    search: &BuyerSearch,
) -> Result<Vec<BuyerMatch>, InsightError> {
    let sector = field(&search.sector);
    let prompt = format!(
        "List UK-based companies or distributors who might be interested in this product:\n\
Product: {product}\nSector: {sector}\nDescription: {description}\n\n\
Format the response as a JSON array of objects with these fields:\n\
{{\n  \"companyName\": string,\n  \"sectorMatch\": string,\n  \"website\": string (optional),\n  \
\"contactEmail\": string (optional),\n  \"confidence\": number (0-100)\n}}\n\n\
Focus on real, established UK companies in the {sector} sector.",
        product = field(&search.product),
        description = field(&search.description),
    );
    let text = match complete(llm, MATCHMAKER_PROMPT, prompt, 2000).await {
        Err(InsightError::EmptyResponse) => "[]".to_string(),
        other => other?,
    };
    serde_json::from_str(&strip_markdown_fence(&text))
        .map_err(|err| InsightError::Parse(err.to_string()))
}

pub async fn generate_visibility_content(
    llm: &dyn ChatModel,
    brief: &ProductBrief,
) -> Result<VisibilityContent, InsightError> {
    let (Some(name), Some(description), Some(sector)) = (
        present(&brief.name),
        present(&brief.description),
        present(&brief.sector),
    ) else {
        return Err(InsightError::MissingFields);
    };

    let prompt = format!(
        "Generate 4 types of content for the product below:\n\n\
Product Name: {name}\nSector: {sector}\nDescription: {description}\n\n\
1. SEO-optimized product description (150-200 words) with natural keywords and unique selling points.\n\
2. LinkedIn post with a hook, relevant hashtags and a call-to-action.\n\
3. eBay-style listing with a title, key features and bullet points.\n\
4. Cold email to B2B buyers in the UK market with a subject line and a specific call-to-action.\n\n\
Return each content piece as a separate string in JSON format:\n\
{{\n  \"seoText\": \"...\",\n  \"linkedinPost\": \"...\",\n  \"ebayListing\": \"...\",\n  \"emailPitch\": \"...\"\n}}"
    );
    let text = complete(llm, MARKETER_PROMPT, prompt, 2000).await?;
    let value: Value = serde_json::from_str(&strip_markdown_fence(&text))
        .map_err(|err| InsightError::Parse(err.to_string()))?;
    visibility_from_value(&value).ok_or(InsightError::InvalidShape)
}

async fn complete(
    llm: &dyn ChatModel,
    system: &str,
    prompt: String,
    max_tokens: u32,
) -> Result<String, InsightError> {
    let response = llm
        .chat(&[LlmMessage::system(system), LlmMessage::user(prompt)], max_tokens)
        .await
        .map_err(|err| InsightError::Llm(err.to_string()))?;
    if let Some(usage) = &response.usage {
        debug!(
            target = "ceylog.insights",
            prompt_tokens = ?usage.prompt_tokens,
            completion_tokens = ?usage.completion_tokens,
            "llm usage",
        );
    }
    response
        .text
        .filter(|text| !text.trim().is_empty())
        .ok_or(InsightError::EmptyResponse)
}

pub fn parse_sections(text: &str) -> Map<String, Value> {
    let mut sections = Map::new();
    for block in text.split("\n\n") {
        let Some((title, content)) = block.split_once(": ") else {
            continue;
        };
        let key: String = title
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_lowercase();
        let content = content.trim();
        if key.is_empty() || content.is_empty() {
            continue;
        }
        sections.insert(key, Value::String(content.to_string()));
    }
    sections
}

fn visibility_from_value(value: &Value) -> Option<VisibilityContent> {
    let text = |key: &str| {
        value
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    Some(VisibilityContent {
        seo_text: text("seoText")?,
        linkedin_post: text("linkedinPost")?,
        ebay_listing: text("ebayListing")?,
        email_pitch: text("emailPitch")?,
    })
}

fn strip_markdown_fence(input: &str) -> String {
    let trimmed = input.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    let mut body = Vec::new();
    for line in trimmed.lines().skip(1) {
        if line.trim_start().starts_with("```") {
            break;
        }
        body.push(line);
    }
    body.join("\n")
}

fn field(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("")
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}
