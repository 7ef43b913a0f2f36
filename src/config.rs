use std::{env, time::Duration};
use tracing::warn;

const DEFAULT_ORIGINS: &[&str] = &["https://ceylog.com", "https://app.ceylog.com"];
const DEFAULT_EMAIL_DOMAINS: &[&str] = &["gmail.com", "outlook.com", "yahoo.com", "hotmail.com"];

/// Limits and allow-lists applied by the report delivery route.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub allowed_origins: Vec<String>,
    pub allowed_email_domains: Vec<String>,
    pub max_request_bytes: u64,
    pub max_payload_bytes: usize,
    pub max_message_chars: usize,
    pub rate_limit: RateLimitConfig,
    pub mail: MailConfig,
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub max_requests: u64,
    pub window: Duration,
}

#[derive(Debug, Clone)]
pub struct MailConfig {
    pub from: String,
    pub subject: String,
    pub default_body: String,
}

#[derive(Debug, Clone, Copy)]
pub struct HttpTimeouts {
    pub request: Duration,
    pub connect: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            allowed_origins: to_owned_list(DEFAULT_ORIGINS),
            allowed_email_domains: to_owned_list(DEFAULT_EMAIL_DOMAINS),
            max_request_bytes: 5 * 1024 * 1024,
            max_payload_bytes: 100 * 1024,
            max_message_chars: 1000,
            rate_limit: RateLimitConfig::default(),
            mail: MailConfig::default(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 10,
            window: Duration::from_secs(60 * 60),
        }
    }
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            from: "Ceylog Reports <reports@ceylog.com>".to_string(),
            subject: "Your Report from Ceylog".to_string(),
            default_body: "Please find your requested report attached.".to_string(),
        }
    }
}

impl DeliveryConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            allowed_origins: list_or_default(&lookup, "ALLOWED_ORIGINS", DEFAULT_ORIGINS),
            allowed_email_domains: list_or_default(
                &lookup,
                "ALLOWED_EMAIL_DOMAINS",
                DEFAULT_EMAIL_DOMAINS,
            ),
            max_request_bytes: parse_or(
                &lookup,
                "REPORT_MAX_REQUEST_BYTES",
                defaults.max_request_bytes,
            ),
            max_payload_bytes: parse_or(
                &lookup,
                "REPORT_MAX_PAYLOAD_BYTES",
                defaults.max_payload_bytes,
            ),
            max_message_chars: parse_or(
                &lookup,
                "REPORT_MAX_MESSAGE_CHARS",
                defaults.max_message_chars,
            ),
            rate_limit: RateLimitConfig {
                max_requests: parse_or(
                    &lookup,
                    "RATE_LIMIT_MAX_REQUESTS",
                    defaults.rate_limit.max_requests,
                ),
                window: Duration::from_secs(parse_or(
                    &lookup,
                    "RATE_LIMIT_WINDOW_SECS",
                    defaults.rate_limit.window.as_secs(),
                )),
            },
            mail: MailConfig {
                from: lookup("MAIL_FROM").unwrap_or(defaults.mail.from),
                subject: lookup("MAIL_SUBJECT").unwrap_or(defaults.mail.subject),
                default_body: defaults.mail.default_body,
            },
        }
    }
}

impl HttpTimeouts {
    pub fn from_env() -> Self {
        let lookup = |key: &str| env::var(key).ok();
        Self {
            request: Duration::from_secs(parse_or(&lookup, "HTTP_TIMEOUT_SECS", 15)),
            connect: Duration::from_secs(parse_or(&lookup, "HTTP_CONNECT_TIMEOUT_SECS", 5)),
        }
    }
}

/// Parses `key` as `T`, keeping `default` for unset, malformed or zero values.
fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: std::str::FromStr + PartialEq + Default,
{
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(value) if value != T::default() => value,
        _ => {
            warn!(target = "ceylog.config", key, value = %raw, "ignored invalid setting");
            default
        }
    }
}

fn list_or_default(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: &[&str],
) -> Vec<String> {
    let entries: Vec<String> = lookup(key)
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect();
    if entries.is_empty() {
        to_owned_list(default)
    } else {
        entries
    }
}

fn to_owned_list(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_limits() {
        let cfg = DeliveryConfig::from_lookup(|_| None);
        assert_eq!(cfg.max_request_bytes, 5 * 1024 * 1024);
        assert_eq!(cfg.max_payload_bytes, 100 * 1024);
        assert_eq!(cfg.max_message_chars, 1000);
        assert_eq!(cfg.rate_limit.max_requests, 10);
        assert_eq!(cfg.rate_limit.window, Duration::from_secs(3600));
        assert!(cfg.allowed_email_domains.contains(&"gmail.com".to_string()));
    }

    #[test]
    fn overrides_are_parsed() {
        let cfg = DeliveryConfig::from_lookup(lookup_from(&[
            ("ALLOWED_ORIGINS", "https://a.test, *.b.test"),
            ("RATE_LIMIT_MAX_REQUESTS", "3"),
            ("MAIL_SUBJECT", "Hello"),
        ]));
        assert_eq!(cfg.allowed_origins, vec!["https://a.test", "*.b.test"]);
        assert_eq!(cfg.rate_limit.max_requests, 3);
        assert_eq!(cfg.mail.subject, "Hello");
    }

    #[test]
    fn malformed_values_fall_back() {
        let cfg = DeliveryConfig::from_lookup(lookup_from(&[
            ("ALLOWED_EMAIL_DOMAINS", " , "),
            ("REPORT_MAX_PAYLOAD_BYTES", "lots"),
            ("RATE_LIMIT_WINDOW_SECS", "0"),
        ]));
        assert_eq!(cfg.allowed_email_domains.len(), 4);
        assert_eq!(cfg.max_payload_bytes, 100 * 1024);
        assert_eq!(cfg.rate_limit.window, Duration::from_secs(3600));
    }
}
