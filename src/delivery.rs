use crate::audit::AuditStore;
use crate::config::DeliveryConfig;
use crate::export::{ExportError, ReportExporter, StandardExporter};
use crate::mailer::{MailError, MailSender, OutboundEmail};
use crate::metrics::timed;
use crate::models::{
    AuditOutcome, AuditRecord, DeliveryRequest, ExportArtifact, ExportFormat, SendReportResponse,
};
use crate::rate_limit::{CounterStore, RateDecision, RateGate};
use crate::security::{
    ActorContext, IdentityVerifier, declared_length_exceeds, extract_bearer, origin_allowed,
};
use crate::validation::{ValidationError, validate_request};
use axum::body::Body;
use axum::http::{HeaderMap, header};
use chrono::Utc;
use serde_json::Value;
use std::{sync::Arc, time::Instant};
use thiserror::Error;
use tracing::{error, info, warn};

pub const RATE_LIMITED_MESSAGE: &str = "Rate limit exceeded. Please try again later.";
pub const SENT_MESSAGE: &str = "Report sent successfully";

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("origin not allowed")]
    OriginRejected,
    #[error("request exceeds size ceiling")]
    PayloadTooLarge,
    #[error("unauthorized")]
    Unauthorized,
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("format conversion failed: {0}")]
    Conversion(#[from] ExportError),
    #[error("mail delivery failed: {0}")]
    Delivery(#[from] MailError),
}

impl DeliveryError {
    /// Caller-facing text; 500-class variants stay generic.
    pub fn public_message(&self) -> String {
        match self {
            DeliveryError::OriginRejected => "Invalid origin".to_string(),
            DeliveryError::PayloadTooLarge => "Request too large".to_string(),
            DeliveryError::Unauthorized => "Unauthorized".to_string(),
            DeliveryError::RateLimited => RATE_LIMITED_MESSAGE.to_string(),
            DeliveryError::Validation(err) => err.0.clone(),
            DeliveryError::Conversion(_) => "Failed to convert report format".to_string(),
            DeliveryError::Delivery(_) => "Failed to send report email".to_string(),
        }
    }
}

/// What the audit entry of a failed attempt can say about the request.
#[derive(Debug, Default)]
struct AttemptTrace {
    recipient: Option<String>,
    format: Option<ExportFormat>,
}

struct ClientInfo {
    ip_address: String,
    user_agent: String,
}

impl ClientInfo {
    fn from_headers(headers: &HeaderMap) -> Self {
        let read = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
                .unwrap_or_else(|| "unknown".to_string())
        };
        Self {
            ip_address: read("x-forwarded-for"),
            user_agent: read(header::USER_AGENT.as_str()),
        }
    }
}

/// Report delivery: origin and size gate, identity, rate gate, validation,
/// export, send, audit. Every stage short-circuits the ones after it.
#[derive(Clone)]
pub struct ReportDelivery {
    config: Arc<DeliveryConfig>,
    identity: Arc<dyn IdentityVerifier>,
    rate_gate: RateGate,
    exporter: Arc<dyn ReportExporter>,
    mailer: Arc<dyn MailSender>,
    audit: Arc<dyn AuditStore>,
}

impl ReportDelivery {
    pub fn new(
        config: DeliveryConfig,
        identity: Arc<dyn IdentityVerifier>,
        counters: Arc<dyn CounterStore>,
        mailer: Arc<dyn MailSender>,
        audit: Arc<dyn AuditStore>,
    ) -> Self {
        let rate_gate = RateGate::new(counters, config.rate_limit);
        Self {
            config: Arc::new(config),
            identity,
            rate_gate,
            exporter: Arc::new(StandardExporter),
            mailer,
            audit,
        }
    }

    pub fn with_exporter(mut self, exporter: Arc<dyn ReportExporter>) -> Self {
        self.exporter = exporter;
        self
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    pub async fn deliver(
        &self,
        headers: &HeaderMap,
        body: Body,
    ) -> Result<SendReportResponse, DeliveryError> {
        let origin = header_str(headers, header::ORIGIN);
        if !origin_allowed(origin, &self.config.allowed_origins) {
            warn!(target = "ceylog.delivery", origin = ?origin, "rejected origin");
            return Err(DeliveryError::OriginRejected);
        }
        if declared_length_exceeds(
            header_str(headers, header::CONTENT_LENGTH),
            self.config.max_request_bytes,
        ) {
            return Err(DeliveryError::PayloadTooLarge);
        }

        let token = extract_bearer(headers).ok_or(DeliveryError::Unauthorized)?;
        let actor = timed("verify_identity", self.identity.verify(&token))
            .await
            .map_err(|err| {
                warn!(target = "ceylog.delivery", error = %err, "identity verification failed");
                DeliveryError::Unauthorized
            })?;

        let client = ClientInfo::from_headers(headers);
        let mut trace = AttemptTrace::default();
        match self.run_for_actor(&actor, body, &mut trace).await {
            Ok(message_id) => {
                crate::metrics::delivery_outcome("sent");
                info!(
                    target = "ceylog.delivery",
                    actor = %actor.actor_id,
                    format = ?trace.format,
                    message_id = %message_id,
                    "report sent",
                );
                self.record(AuditRecord {
                    user_id: actor.actor_id.clone(),
                    recipient: trace.recipient,
                    format: trace.format,
                    status: AuditOutcome::Sent,
                    message_id: Some(message_id.clone()),
                    error: None,
                    ip_address: client.ip_address,
                    user_agent: client.user_agent,
                    timestamp: Utc::now(),
                })
                .await;
                Ok(SendReportResponse {
                    message: SENT_MESSAGE.to_string(),
                    message_id,
                })
            }
            Err(err) => {
                crate::metrics::delivery_outcome("error");
                self.record(AuditRecord {
                    user_id: actor.actor_id.clone(),
                    recipient: trace.recipient,
                    format: trace.format,
                    status: AuditOutcome::Error,
                    message_id: None,
                    error: Some(err.to_string()),
                    ip_address: client.ip_address,
                    user_agent: client.user_agent,
                    timestamp: Utc::now(),
                })
                .await;
                Err(err)
            }
        }
    }

    async fn run_for_actor(
        &self,
        actor: &ActorContext,
        body: Body,
        trace: &mut AttemptTrace,
    ) -> Result<String, DeliveryError> {
        if timed("rate_gate", self.rate_gate.check(&actor.actor_id)).await == RateDecision::Limited
        {
            info!(target = "ceylog.delivery", actor = %actor.actor_id, "rate limited");
            return Err(DeliveryError::RateLimited);
        }

        // The cap is the only expected reason for a failed read.
        let bytes = axum::body::to_bytes(body, self.config.max_request_bytes as usize)
            .await
            .map_err(|_| DeliveryError::PayloadTooLarge)?;
        trace_raw_fields(&bytes, trace);

        let request = validate_request(&bytes, &self.config).inspect_err(|err| {
            info!(
                target = "ceylog.delivery",
                actor = %actor.actor_id,
                error = %err,
                "validation failed"
            );
        })?;

        let started = Instant::now();
        let attachment = self
            .exporter
            .export(request.format, &request.report_data, Utc::now())
            .inspect_err(|err| {
                error!(
                    target = "ceylog.delivery",
                    actor = %actor.actor_id,
                    format = request.format.as_str(),
                    error = %err,
                    "error converting report format"
                );
            })?;
        crate::metrics::stage_elapsed("export", started.elapsed().as_millis());

        let email = self.compose(&request, attachment);
        timed("send_email", self.mailer.send(&email))
            .await
            .inspect_err(|err| {
                error!(
                    target = "ceylog.delivery",
                    actor = %actor.actor_id,
                    error = %err,
                    "error sending report email"
                );
            })
            .map_err(DeliveryError::from)
    }

    fn compose(&self, request: &DeliveryRequest, attachment: ExportArtifact) -> OutboundEmail {
        let text = request
            .message
            .as_deref()
            .filter(|message| !message.is_empty())
            .unwrap_or(&self.config.mail.default_body)
            .to_string();
        OutboundEmail {
            from: self.config.mail.from.clone(),
            to: request.recipient.clone(),
            subject: self.config.mail.subject.clone(),
            text,
            attachment,
        }
    }

    /// Audit writes never change the outcome of the request.
    async fn record(&self, record: AuditRecord) {
        if let Err(err) = timed("audit", self.audit.append(&record)).await {
            error!(
                target = "ceylog.audit",
                actor = %record.user_id,
                status = ?record.status,
                error = %err,
                "error logging activity",
            );
        }
    }
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn trace_raw_fields(bytes: &[u8], trace: &mut AttemptTrace) {
    let Ok(Value::Object(fields)) = serde_json::from_slice::<Value>(bytes) else {
        return;
    };
    trace.recipient = fields
        .get("recipient")
        .and_then(Value::as_str)
        .map(str::to_string);
    trace.format = fields
        .get("format")
        .and_then(Value::as_str)
        .and_then(ExportFormat::from_str);
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::audit::AuditError;
    use crate::rate_limit::{MemoryCounterStore, StoreError};
    use crate::security::StaticIdentity;
    use async_trait::async_trait;
    use axum::http::HeaderValue;
    use chrono::DateTime;
    use serde_json::{Map, json};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    pub const TOKEN: &str = "tok-alice";

    #[derive(Default)]
    pub struct FakeMailer {
        pub calls: AtomicUsize,
        pub fail: bool,
    }

    #[async_trait]
    impl MailSender for FakeMailer {
        async fn send(&self, email: &OutboundEmail) -> Result<String, MailError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail {
                return Err(MailError::Rejected("provider down".into()));
            }
            Ok(format!("msg-{n}-{}", email.attachment.filename))
        }
    }

    #[derive(Default)]
    pub struct RecordingAudit {
        pub records: Mutex<Vec<AuditRecord>>,
        pub fail: bool,
    }

    #[async_trait]
    impl AuditStore for RecordingAudit {
        async fn append(&self, record: &AuditRecord) -> Result<(), AuditError> {
            self.records.lock().await.push(record.clone());
            if self.fail {
                return Err(AuditError::Request("store offline".into()));
            }
            Ok(())
        }
    }

    /// Standard exporters with call counting and an optional failing format.
    #[derive(Default)]
    pub struct CountingExporter {
        pub calls: AtomicUsize,
        pub fail_on: Option<ExportFormat>,
    }

    impl ReportExporter for CountingExporter {
        fn export(
            &self,
            format: ExportFormat,
            data: &Map<String, Value>,
            generated_at: DateTime<Utc>,
        ) -> Result<ExportArtifact, ExportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_on == Some(format) {
                return Err(ExportError::Render("injected".into()));
            }
            StandardExporter.export(format, data, generated_at)
        }
    }

    struct BrokenCounters;

    #[async_trait]
    impl CounterStore for BrokenCounters {
        async fn count_since(&self, _: &str, _: DateTime<Utc>) -> Result<u64, StoreError> {
            Err(StoreError::Connection("refused".into()))
        }

        async fn record(&self, _: &str, _: DateTime<Utc>) -> Result<(), StoreError> {
            Err(StoreError::Connection("refused".into()))
        }
    }

    pub struct Harness {
        pub delivery: ReportDelivery,
        pub mailer: Arc<FakeMailer>,
        pub audit: Arc<RecordingAudit>,
        pub exporter: Arc<CountingExporter>,
    }

    pub fn harness_with(
        mailer: FakeMailer,
        audit: RecordingAudit,
        exporter: CountingExporter,
        counters: Arc<dyn CounterStore>,
    ) -> Harness {
        let mailer = Arc::new(mailer);
        let audit = Arc::new(audit);
        let exporter = Arc::new(exporter);
        let identity = Arc::new(StaticIdentity::new([(
            "alice".to_string(),
            TOKEN.to_string(),
        )]));
        let delivery = ReportDelivery::new(
            DeliveryConfig::default(),
            identity,
            counters,
            mailer.clone(),
            audit.clone(),
        )
        .with_exporter(exporter.clone());
        Harness {
            delivery,
            mailer,
            audit,
            exporter,
        }
    }

    pub fn harness() -> Harness {
        harness_with(
            FakeMailer::default(),
            RecordingAudit::default(),
            CountingExporter::default(),
            Arc::new(MemoryCounterStore::default()),
        )
    }

    pub fn headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::ORIGIN, HeaderValue::from_static("https://app.ceylog.com"));
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {TOKEN}")).unwrap(),
        );
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9"));
        headers
    }

    pub fn payload(format: &str) -> Value {
        json!({
            "recipient": "buyer@gmail.com",
            "format": format,
            "reportData": {
                "product": "Ceylon tea",
                "marketSize": "GBP 1.2bn",
                "buyers": [{ "companyName": "Acme Imports", "confidence": 82 }]
            },
            "message": "Quarterly <b>report</b><script>x</script>"
        })
    }

    fn body(value: &Value) -> Body {
        Body::from(serde_json::to_vec(value).unwrap())
    }

    #[tokio::test]
    async fn sends_and_audits_success() {
        let h = harness();
        let response = h
            .delivery
            .deliver(&headers(), body(&payload("csv")))
            .await
            .expect("delivered");
        assert_eq!(response.message, SENT_MESSAGE);
        assert_eq!(response.message_id, "msg-1-report.csv");

        let records = h.audit.records.lock().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, AuditOutcome::Sent);
        assert_eq!(records[0].user_id, "alice");
        assert_eq!(records[0].ip_address, "203.0.113.9");
        assert_eq!(records[0].user_agent, "unknown");
        assert_eq!(records[0].format, Some(ExportFormat::Csv));
    }

    #[tokio::test]
    async fn missing_or_malformed_authorization_is_unauthorized_without_audit() {
        let h = harness();
        let mut no_auth = headers();
        no_auth.remove(header::AUTHORIZATION);
        let err = h.delivery.deliver(&no_auth, body(&payload("pdf"))).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Unauthorized));

        let mut malformed = headers();
        malformed.insert(header::AUTHORIZATION, HeaderValue::from_static("Token abc"));
        let err = h.delivery.deliver(&malformed, body(&payload("pdf"))).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Unauthorized));

        let mut unknown = headers();
        unknown.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer nope"));
        let err = h.delivery.deliver(&unknown, body(&payload("pdf"))).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Unauthorized));

        assert!(h.audit.records.lock().await.is_empty());
        assert_eq!(h.mailer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn origin_is_checked_first() {
        let h = harness();
        let mut bad = headers();
        bad.insert(header::ORIGIN, HeaderValue::from_static("https://evil.test"));
        bad.remove(header::AUTHORIZATION);
        let err = h.delivery.deliver(&bad, body(&payload("pdf"))).await.unwrap_err();
        assert!(matches!(err, DeliveryError::OriginRejected));
    }

    #[tokio::test]
    async fn oversized_declaration_rejected_before_authorization() {
        let h = harness();
        let mut big = headers();
        big.remove(header::AUTHORIZATION);
        big.insert(header::CONTENT_LENGTH, HeaderValue::from_static("6291456"));
        let err = h.delivery.deliver(&big, body(&payload("pdf"))).await.unwrap_err();
        assert!(matches!(err, DeliveryError::PayloadTooLarge));
        assert!(h.audit.records.lock().await.is_empty());
    }

    #[tokio::test]
    async fn undeclared_oversized_body_is_cut_off_while_reading() {
        let h = harness();
        let mut value = payload("csv");
        value["reportData"] = json!({ "notes": "x".repeat(5 * 1024 * 1024) });
        let err = h.delivery.deliver(&headers(), body(&value)).await.unwrap_err();
        assert!(matches!(err, DeliveryError::PayloadTooLarge));
        assert_eq!(h.exporter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn sensitive_report_never_reaches_exporter_or_mailer() {
        let h = harness();
        let mut value = payload("pdf");
        value["reportData"] = json!({ "orderRef": "4111111111111111" });
        let err = h.delivery.deliver(&headers(), body(&value)).await.unwrap_err();
        assert_eq!(err.public_message(), "Report contains sensitive data");
        assert_eq!(h.exporter.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.mailer.calls.load(Ordering::SeqCst), 0);

        let records = h.audit.records.lock().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, AuditOutcome::Error);
    }

    #[tokio::test]
    async fn disallowed_domain_is_a_validation_error() {
        let h = harness();
        let mut value = payload("csv");
        value["recipient"] = json!("user@evil.test");
        let err = h.delivery.deliver(&headers(), body(&value)).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Validation(_)));
        assert_eq!(err.public_message(), "Email domain not allowed");
    }

    #[tokio::test]
    async fn each_format_is_independent() {
        let h = harness_with(
            FakeMailer::default(),
            RecordingAudit::default(),
            CountingExporter {
                calls: AtomicUsize::new(0),
                fail_on: Some(ExportFormat::Pdf),
            },
            Arc::new(MemoryCounterStore::default()),
        );
        let csv = h.delivery.deliver(&headers(), body(&payload("csv"))).await;
        let pdf = h.delivery.deliver(&headers(), body(&payload("pdf"))).await;
        let docx = h.delivery.deliver(&headers(), body(&payload("docx"))).await;

        assert!(csv.expect("csv").message_id.ends_with("report.csv"));
        let err = pdf.unwrap_err();
        assert!(matches!(err, DeliveryError::Conversion(_)));
        assert_eq!(err.public_message(), "Failed to convert report format");
        assert!(docx.expect("docx").message_id.ends_with("report.docx"));
        assert_eq!(h.mailer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn audit_failure_after_send_still_succeeds() {
        let h = harness_with(
            FakeMailer::default(),
            RecordingAudit {
                fail: true,
                ..Default::default()
            },
            CountingExporter::default(),
            Arc::new(MemoryCounterStore::default()),
        );
        let response = h
            .delivery
            .deliver(&headers(), body(&payload("docx")))
            .await
            .expect("send result is kept");
        assert_eq!(response.message_id, "msg-1-report.docx");
    }

    #[tokio::test]
    async fn audit_failure_after_failed_send_stays_failed() {
        let h = harness_with(
            FakeMailer {
                fail: true,
                ..Default::default()
            },
            RecordingAudit {
                fail: true,
                ..Default::default()
            },
            CountingExporter::default(),
            Arc::new(MemoryCounterStore::default()),
        );
        let err = h
            .delivery
            .deliver(&headers(), body(&payload("csv")))
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Delivery(_)));
        assert_eq!(err.public_message(), "Failed to send report email");

        let records = h.audit.records.lock().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, AuditOutcome::Error);
        assert!(records[0].error.as_deref().unwrap().contains("provider down"));
    }

    #[tokio::test]
    async fn tenth_request_passes_and_eleventh_is_limited() {
        let h = harness();
        for _ in 0..9 {
            h.delivery
                .deliver(&headers(), body(&payload("csv")))
                .await
                .expect("under ceiling");
        }
        h.delivery
            .deliver(&headers(), body(&payload("csv")))
            .await
            .expect("tenth request");
        let err = h
            .delivery
            .deliver(&headers(), body(&payload("csv")))
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::RateLimited));
        assert_eq!(h.mailer.calls.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn counter_store_outage_fails_open() {
        let h = harness_with(
            FakeMailer::default(),
            RecordingAudit::default(),
            CountingExporter::default(),
            Arc::new(BrokenCounters),
        );
        for _ in 0..12 {
            h.delivery
                .deliver(&headers(), body(&payload("csv")))
                .await
                .expect("limiter disabled");
        }
    }

    #[tokio::test]
    async fn empty_message_falls_back_to_default_body() {
        let h = harness();
        let mut value = payload("csv");
        value["message"] = json!("<script>only</script>");
        let request = validate_request(&serde_json::to_vec(&value).unwrap(), h.delivery.config())
            .expect("valid");
        let artifact = StandardExporter
            .export(request.format, &request.report_data, Utc::now())
            .unwrap();
        let email = h.delivery.compose(&request, artifact);
        assert_eq!(email.text, "Please find your requested report attached.");
        assert_eq!(email.subject, "Your Report from Ceylog");
    }

    #[tokio::test]
    async fn whitespace_message_is_sent_as_is() {
        let h = harness();
        let mut value = payload("csv");
        value["message"] = json!("   ");
        let request = validate_request(&serde_json::to_vec(&value).unwrap(), h.delivery.config())
            .expect("valid");
        let artifact = StandardExporter
            .export(request.format, &request.report_data, Utc::now())
            .unwrap();
        let email = h.delivery.compose(&request, artifact);
        assert_eq!(email.text, "   ");
    }
}
