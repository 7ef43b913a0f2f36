use crate::models::ApiError;
use async_trait::async_trait;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use reqwest::Client;
use serde::Deserialize;
use std::{collections::HashMap, convert::Infallible, env, sync::Arc};
use thiserror::Error;
use tracing::{info, warn};

const FIREBASE_LOOKUP_URL: &str = "https://identitytoolkit.googleapis.com/v1/accounts:lookup";

/// The authenticated caller, attached to request extensions by [`require_identity`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActorContext {
    pub actor_id: String,
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("token rejected")]
    Rejected,
    #[error("identity service unavailable: {0}")]
    Unavailable(String),
}

/// Resolves a bearer credential to an actor id.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<ActorContext, IdentityError>;
}

/// Verifies Firebase ID tokens through the Identity Toolkit REST API.
pub struct FirebaseIdentity {
    api_key: String,
    http: Client,
}

#[derive(Deserialize)]
struct LookupResponse {
    #[serde(default)]
    users: Vec<LookupUser>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LookupUser {
    local_id: String,
}

impl FirebaseIdentity {
    pub fn from_env(http: Client) -> Option<Self> {
        let api_key = env::var("FIREBASE_API_KEY")
            .ok()
            .filter(|value| !value.trim().is_empty())?;
        Some(Self { api_key, http })
    }
}

#[async_trait]
impl IdentityVerifier for FirebaseIdentity {
    async fn verify(&self, token: &str) -> Result<ActorContext, IdentityError> {
        let response = self
            .http
            .post(FIREBASE_LOOKUP_URL)
            .query(&[("key", self.api_key.as_str())])
            .json(&serde_json::json!({ "idToken": token }))
            .send()
            .await
            .map_err(|err| IdentityError::Unavailable(err.to_string()))?;

        if response.status().is_client_error() {
            return Err(IdentityError::Rejected);
        }
        if !response.status().is_success() {
            return Err(IdentityError::Unavailable(format!(
                "HTTP {}",
                response.status()
            )));
        }

        let payload: LookupResponse = response
            .json()
            .await
            .map_err(|err| IdentityError::Unavailable(err.to_string()))?;
        payload
            .users
            .into_iter()
            .next()
            .map(|user| ActorContext {
                actor_id: user.local_id,
            })
            .ok_or(IdentityError::Rejected)
    }
}

/// Fixed token table for local runs, loaded from `DEMO_ID_TOKENS`
/// (`actor:token` pairs separated by commas).
pub struct StaticIdentity {
    tokens: HashMap<String, String>,
}

impl StaticIdentity {
    pub fn new(pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        let tokens = pairs
            .into_iter()
            .map(|(actor, token)| (token, actor))
            .collect();
        Self { tokens }
    }

    pub fn from_env() -> Self {
        let raw = env::var("DEMO_ID_TOKENS").unwrap_or_default();
        let identity = Self::new(parse_token_pairs(&raw));
        if identity.tokens.is_empty() {
            warn!(
                target = "ceylog.auth",
                "no identity verifier configured; every bearer token will be rejected"
            );
        } else {
            info!(
                target = "ceylog.auth",
                token_count = identity.tokens.len(),
                "loaded demo identity tokens from env"
            );
        }
        identity
    }
}

#[async_trait]
impl IdentityVerifier for StaticIdentity {
    async fn verify(&self, token: &str) -> Result<ActorContext, IdentityError> {
        self.tokens
            .get(token)
            .map(|actor| ActorContext {
                actor_id: actor.clone(),
            })
            .ok_or(IdentityError::Rejected)
    }
}

fn parse_token_pairs(raw: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for entry in raw.split(',') {
        let trimmed = entry.trim();
        if trimmed.is_empty() {
            continue;
        }
        let mut parts = trimmed.splitn(2, ':');
        let actor = parts.next().map(str::trim).filter(|s| !s.is_empty());
        let token = parts.next().map(str::trim).filter(|s| !s.is_empty());
        match (actor, token) {
            (Some(actor), Some(token)) => pairs.push((actor.to_string(), token.to_string())),
            _ => warn!(
                target = "ceylog.auth",
                "ignored malformed DEMO_ID_TOKENS entry: {trimmed}"
            ),
        }
    }
    pairs
}

/// Exact match, or `*.domain` entries matching any origin ending in `domain`.
pub fn origin_allowed(origin: Option<&str>, allowed: &[String]) -> bool {
    let Some(origin) = origin else {
        return false;
    };
    allowed.iter().any(|candidate| {
        if origin == candidate {
            return true;
        }
        match candidate.strip_prefix("*.") {
            Some(domain) => origin.ends_with(domain),
            None => false,
        }
    })
}

/// Only a declared, parseable length above the ceiling is rejected here.
pub fn declared_length_exceeds(content_length: Option<&str>, max_bytes: u64) -> bool {
    content_length
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .is_some_and(|declared| declared > max_bytes)
}

/// Returns the token of a `Bearer <token>` authorization header.
pub fn extract_bearer(headers: &http::HeaderMap) -> Option<String> {
    headers
        .get(http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

/// Gate for the insight routes: the same bearer check as report delivery,
/// without the origin, size and rate gates.
pub async fn require_identity(
    State(verifier): State<Arc<dyn IdentityVerifier>>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let Some(token) = extract_bearer(request.headers()) else {
        return Ok(unauthorized_response());
    };

    match verifier.verify(&token).await {
        Ok(actor) => {
            request.extensions_mut().insert(actor);
            Ok(next.run(request).await)
        }
        Err(err) => {
            warn!(target = "ceylog.auth", error = %err, "identity verification failed");
            Ok(unauthorized_response())
        }
    }
}

fn unauthorized_response() -> Response {
    (StatusCode::UNAUTHORIZED, Json(ApiError::message("Unauthorized"))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, HeaderValue};

    fn allow_list() -> Vec<String> {
        vec![
            "https://ceylog.com".to_string(),
            "*.ceylog.app".to_string(),
        ]
    }

    #[test]
    fn origin_exact_and_wildcard_match() {
        let allowed = allow_list();
        assert!(origin_allowed(Some("https://ceylog.com"), &allowed));
        assert!(origin_allowed(Some("https://eu.ceylog.app"), &allowed));
        assert!(!origin_allowed(Some("https://ceylog.com.evil.test"), &allowed));
        assert!(!origin_allowed(None, &allowed));
    }

    #[test]
    fn declared_length_gate() {
        assert!(declared_length_exceeds(Some("6291456"), 5 * 1024 * 1024));
        assert!(!declared_length_exceeds(Some("5242880"), 5 * 1024 * 1024));
        assert!(!declared_length_exceeds(Some("not-a-number"), 10));
        assert!(!declared_length_exceeds(None, 10));
    }

    #[test]
    fn bearer_requires_exact_prefix() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_bearer(&headers), None);

        headers.insert(
            http::header::AUTHORIZATION,
            HeaderValue::from_static("InvalidToken"),
        );
        assert_eq!(extract_bearer(&headers), None);

        headers.insert(
            http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer "),
        );
        assert_eq!(extract_bearer(&headers), None);

        headers.insert(
            http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer abc.def"),
        );
        assert_eq!(extract_bearer(&headers).as_deref(), Some("abc.def"));
    }

    #[test]
    fn token_pairs_skip_malformed_entries() {
        let pairs = parse_token_pairs("alice:tok-a, broken, :nope,bob:tok-b");
        assert_eq!(
            pairs,
            vec![
                ("alice".to_string(), "tok-a".to_string()),
                ("bob".to_string(), "tok-b".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn static_identity_resolves_known_tokens() {
        let identity = StaticIdentity::new([("alice".to_string(), "tok-a".to_string())]);
        let actor = identity.verify("tok-a").await.expect("known token");
        assert_eq!(actor.actor_id, "alice");
        assert!(matches!(
            identity.verify("tok-z").await,
            Err(IdentityError::Rejected)
        ));
    }
}
