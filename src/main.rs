mod audit;
mod config;
mod delivery;
mod export;
mod http;
mod insights;
mod llm;
mod mailer;
mod metrics;
mod models;
mod rate_limit;
mod security;
mod validation;

use audit::{AuditStore, LogAuditStore, RestAuditStore};
use axum::{
    Json, Router,
    body::Body,
    extract::{Extension, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, StatusCode, request::Parts},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use config::{DeliveryConfig, HttpTimeouts};
use delivery::{DeliveryError, ReportDelivery};
use eyre::WrapErr;
use insights::InsightError;
use llm::{ChatModel, LlmClient, LlmConfig};
use mailer::ResendMailer;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{
    ApiError, BuyerMatchesResponse, BuyerSearch, ProductBrief, SendReportResponse,
    VisibilityContent,
};
use rate_limit::{CounterStore, MemoryCounterStore, RedisCounterStore};
use security::{ActorContext, FirebaseIdentity, IdentityVerifier, StaticIdentity, require_identity};
use serde_json::{Map, Value, json};
use std::{net::SocketAddr, sync::Arc};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "ceylog.api", "server crashed: {err:#}");
    }
}

async fn run() -> eyre::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let http = http::build_client(HttpTimeouts::from_env());
    let config = DeliveryConfig::from_env();

    let identity: Arc<dyn IdentityVerifier> = match FirebaseIdentity::from_env(http.clone()) {
        Some(firebase) => Arc::new(firebase),
        None => Arc::new(StaticIdentity::from_env()),
    };
    let counters: Arc<dyn CounterStore> = match std::env::var("REDIS_URL")
        .ok()
        .and_then(|url| redis::Client::open(url).ok())
    {
        Some(client) => Arc::new(RedisCounterStore::new(client, config.rate_limit)),
        None => {
            warn!(
                target = "ceylog.api",
                "REDIS_URL not set; rate limit counters are process-local"
            );
            Arc::new(MemoryCounterStore::default())
        }
    };
    let audit: Arc<dyn AuditStore> = match RestAuditStore::from_env(http.clone()) {
        Some(store) => Arc::new(store),
        None => Arc::new(LogAuditStore),
    };
    let mailer = Arc::new(ResendMailer::from_env(http.clone()));
    let llm: Arc<dyn ChatModel> = Arc::new(LlmClient::new(LlmConfig::from_env(), http));

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .wrap_err("failed to install prometheus recorder")?;

    let delivery = ReportDelivery::new(config, identity.clone(), counters, mailer, audit);
    let state = AppState {
        delivery,
        llm,
        prometheus_handle: Some(prometheus_handle),
    };
    let app = build_router(state, identity);

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "ceylog.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    delivery: ReportDelivery,
    llm: Arc<dyn ChatModel>,
    prometheus_handle: Option<PrometheusHandle>,
}

fn build_router(state: AppState, identity: Arc<dyn IdentityVerifier>) -> Router {
    let allowed = state.delivery.config().allowed_origins.clone();
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(AllowOrigin::predicate(
            move |origin: &HeaderValue, _: &Parts| {
                security::origin_allowed(origin.to_str().ok(), &allowed)
            },
        ));

    let insights = Router::new()
        .route("/generate-market-analysis", post(generate_market_analysis))
        .route("/match-buyers", post(match_buyers))
        .route(
            "/generate-visibility-content",
            post(generate_visibility_content),
        )
        .route_layer(middleware::from_fn_with_state(identity, require_identity))
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/api/send-report-email", post(send_report_email))
        .nest("/api", insights)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "ceylog-api-rs",
    }))
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(256 * 1024)
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    let body = state
        .prometheus_handle
        .as_ref()
        .map(PrometheusHandle::render)
        .unwrap_or_default();
    (
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4",
        )],
        body,
    )
        .into_response()
}

/// Export a report and e-mail it as an attachment.
///
/// - Method: `POST`
/// - Path: `/api/send-report-email`
/// - Headers: `Origin` (allow-listed), `Authorization: Bearer <id token>`
/// - Body: `{ recipient, format: "pdf" | "csv" | "docx", reportData, message? }`
/// - Response: `{ message, messageId }`
///
/// The raw body is read by the delivery pipeline so the origin, size and
/// identity gates run before any parsing.
async fn send_report_email(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<SendReportResponse>, AppError> {
    crate::metrics::inc_requests("/api/send-report-email");
    let response = state.delivery.deliver(&headers, body).await?;
    Ok(Json(response))
}

async fn generate_market_analysis(
    State(state): State<AppState>,
    Extension(actor): Extension<ActorContext>,
    payload: Result<Json<ProductBrief>, JsonRejection>,
) -> Result<Json<Map<String, Value>>, AppError> {
    crate::metrics::inc_requests("/api/generate-market-analysis");
    let Json(brief) = payload?;
    info!(target = "ceylog.api", actor = %actor.actor_id, "market analysis requested");
    insights::generate_market_analysis(state.llm.as_ref(), &brief)
        .await
        .map(Json)
        .map_err(|err| AppError::insight("Failed to generate market analysis", err))
}

async fn match_buyers(
    State(state): State<AppState>,
    Extension(actor): Extension<ActorContext>,
    payload: Result<Json<BuyerSearch>, JsonRejection>,
) -> Result<Json<BuyerMatchesResponse>, AppError> {
    crate::metrics::inc_requests("/api/match-buyers");
    let Json(search) = payload?;
    info!(target = "ceylog.api", actor = %actor.actor_id, "buyer matching requested");
    insights::match_buyers(state.llm.as_ref(), &search)
        .await
        .map(|buyers| Json(BuyerMatchesResponse { buyers }))
        .map_err(|err| AppError::insight("Failed to generate buyer matches", err))
}

async fn generate_visibility_content(
    State(state): State<AppState>,
    Extension(actor): Extension<ActorContext>,
    payload: Result<Json<ProductBrief>, JsonRejection>,
) -> Result<Json<VisibilityContent>, AppError> {
    crate::metrics::inc_requests("/api/generate-visibility-content");
    let Json(brief) = payload?;
    info!(target = "ceylog.api", actor = %actor.actor_id, "visibility content requested");
    insights::generate_visibility_content(state.llm.as_ref(), &brief)
        .await
        .map(Json)
        .map_err(|err| {
            let message = match &err {
                InsightError::Parse(_) => "Failed to parse OpenAI response",
                InsightError::InvalidShape => "Invalid response format from OpenAI",
                _ => "Failed to generate content",
            };
            AppError::insight(message, err)
        })
}

#[derive(Debug)]
enum AppError {
    Delivery(DeliveryError),
    Insight {
        message: &'static str,
        source: InsightError,
    },
    BadRequest(String),
}

impl AppError {
    fn insight(message: &'static str, source: InsightError) -> Self {
        Self::Insight { message, source }
    }
}

impl From<DeliveryError> for AppError {
    fn from(value: DeliveryError) -> Self {
        Self::Delivery(value)
    }
}

impl From<JsonRejection> for AppError {
    fn from(value: JsonRejection) -> Self {
        Self::BadRequest(value.body_text())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::Delivery(err) => {
                let status = match &err {
                    DeliveryError::OriginRejected => StatusCode::FORBIDDEN,
                    DeliveryError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
                    DeliveryError::Unauthorized => StatusCode::UNAUTHORIZED,
                    DeliveryError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
                    DeliveryError::Validation(_) => StatusCode::BAD_REQUEST,
                    DeliveryError::Conversion(_) | DeliveryError::Delivery(_) => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (status, err.public_message())
            }
            AppError::Insight {
                source: InsightError::MissingFields,
                ..
            } => (
                StatusCode::BAD_REQUEST,
                "Missing required fields: name, description, and sector are required".to_string(),
            ),
            AppError::Insight { message, source } => {
                error!(target = "ceylog.api", error = %source, "{message}");
                (StatusCode::INTERNAL_SERVER_ERROR, message.to_string())
            }
            AppError::BadRequest(detail) => (StatusCode::BAD_REQUEST, detail),
        };
        (status, Json(ApiError::message(message))).into_response()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
