//! The external payment gateway.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{Money, OrderId};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use super::breaker::{BreakerError, CircuitBreaker};

/// Why the gateway did not do what was asked.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// A business refusal (card declined, already cancelled, ...).
    #[error("{code}: {message}")]
    Declined { code: String, message: String },

    /// The gateway could not be reached or could not serve the request.
    #[error("gateway unavailable: {0}")]
    Unavailable(String),
}

impl GatewayError {
    pub fn declined(code: impl Into<String>, message: impl Into<String>) -> Self {
        GatewayError::Declined {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, GatewayError::Unavailable(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub payment_key: String,
    pub order_id: OrderId,
    pub amount: Money,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Approval {
    pub payment_key: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Captures the charge the buyer authorized.
    async fn approve(&self, request: &ApprovalRequest) -> Result<Approval, GatewayError>;

    /// Refunds a captured charge in full.
    async fn cancel(&self, payment_key: &str, reason: &str) -> Result<(), GatewayError>;
}

#[derive(Debug, Clone)]
pub struct HttpGatewayConfig {
    pub base_url: String,
    pub secret: String,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

/// Gateway error body.
#[derive(Debug, Deserialize)]
struct Failure {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Gateway reached over HTTP with a basic-auth secret key.
#[derive(Clone)]
pub struct HttpGateway {
    client: Client,
    base_url: String,
    secret: String,
}

impl HttpGateway {
    pub fn new(config: HttpGatewayConfig) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.read_timeout)
            .build()
            .map_err(|e| GatewayError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            secret: config.secret,
        })
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response, GatewayError> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .basic_auth(&self.secret, Some(""))
            .json(body)
            .send()
            .await
            .map_err(|e| {
                let kind = if e.is_timeout() { "timeout" } else { "transport" };
                GatewayError::Unavailable(format!("{kind}: {e}"))
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(rejection(status, &body))
    }
}

/// Statuses the gateway answers business refusals with.
const DECLINE_STATUSES: [StatusCode; 4] = [
    StatusCode::BAD_REQUEST,
    StatusCode::PAYMENT_REQUIRED,
    StatusCode::CONFLICT,
    StatusCode::UNPROCESSABLE_ENTITY,
];

/// Maps a non-success answer onto a decline or an outage.
///
/// Only a decline status carrying a failure code is a decline. Auth errors,
/// unknown routes, throttling and server errors mean the gateway cannot
/// serve us right now.
fn rejection(status: StatusCode, body: &str) -> GatewayError {
    let failure = serde_json::from_str::<Failure>(body).ok();
    match failure {
        Some(Failure {
            code: Some(code),
            message,
        }) if DECLINE_STATUSES.contains(&status) => GatewayError::Declined {
            code,
            message: message
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("declined").to_string()),
        },
        _ => GatewayError::Unavailable(format!("gateway returned {status}")),
    }
}

#[async_trait]
impl PaymentGateway for HttpGateway {
    async fn approve(&self, request: &ApprovalRequest) -> Result<Approval, GatewayError> {
        self.post("/v1/payments/confirm", request)
            .await?
            .json()
            .await
            .map_err(|e| GatewayError::Unavailable(format!("unreadable approval: {e}")))
    }

    async fn cancel(&self, payment_key: &str, reason: &str) -> Result<(), GatewayError> {
        self.post(
            &format!("/v1/payments/{payment_key}/cancel"),
            &serde_json::json!({ "cancelReason": reason }),
        )
        .await?;
        Ok(())
    }
}

/// Wraps a gateway in a circuit breaker. Only unavailability trips it.
#[derive(Clone)]
pub struct BreakerGateway {
    inner: Arc<dyn PaymentGateway>,
    breaker: CircuitBreaker,
}

impl BreakerGateway {
    pub fn new(inner: Arc<dyn PaymentGateway>, breaker: CircuitBreaker) -> Self {
        Self { inner, breaker }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    fn unwrap_breaker<T>(
        operation: &'static str,
        result: Result<T, BreakerError<GatewayError>>,
    ) -> Result<T, GatewayError> {
        let outcome = match &result {
            Ok(_) => "ok",
            Err(BreakerError::Inner(GatewayError::Declined { .. })) => "declined",
            Err(BreakerError::Inner(GatewayError::Unavailable(_))) => "unavailable",
            Err(BreakerError::Open { .. }) => "rejected",
        };
        metrics::counter!("payment_gateway_calls_total", "operation" => operation, "outcome" => outcome)
            .increment(1);
        result.map_err(|err| match err {
            BreakerError::Inner(err) => err,
            open @ BreakerError::Open { .. } => GatewayError::Unavailable(open.to_string()),
        })
    }
}

#[async_trait]
impl PaymentGateway for BreakerGateway {
    async fn approve(&self, request: &ApprovalRequest) -> Result<Approval, GatewayError> {
        let result = self
            .breaker
            .call(|| self.inner.approve(request), GatewayError::is_unavailable)
            .await;
        Self::unwrap_breaker("approve", result)
    }

    async fn cancel(&self, payment_key: &str, reason: &str) -> Result<(), GatewayError> {
        let result = self
            .breaker
            .call(|| self.inner.cancel(payment_key, reason), GatewayError::is_unavailable)
            .await;
        Self::unwrap_breaker("cancel", result)
    }
}

/// What a [`ScriptedGateway`] does on its next call.
#[derive(Debug, Clone)]
pub enum Scripted {
    Succeed,
    Fail(GatewayError),
}

/// Gateway answering from a queue; succeeds once the queue is empty.
///
/// Used by tests and by processes started without a gateway URL.
#[derive(Clone, Default)]
pub struct ScriptedGateway {
    approvals: Arc<Mutex<VecDeque<Scripted>>>,
    cancels: Arc<Mutex<VecDeque<Scripted>>>,
    cancelled: Arc<Mutex<Vec<String>>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn script_approve(&self, next: Scripted) {
        self.approvals.lock().await.push_back(next);
    }

    pub async fn script_cancel(&self, next: Scripted) {
        self.cancels.lock().await.push_back(next);
    }

    /// Payment keys successfully cancelled so far.
    pub async fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().await.clone()
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn approve(&self, request: &ApprovalRequest) -> Result<Approval, GatewayError> {
        match self.approvals.lock().await.pop_front() {
            Some(Scripted::Fail(err)) => Err(err),
            Some(Scripted::Succeed) | None => Ok(Approval {
                payment_key: request.payment_key.clone(),
            }),
        }
    }

    async fn cancel(&self, payment_key: &str, _reason: &str) -> Result<(), GatewayError> {
        match self.cancels.lock().await.pop_front() {
            Some(Scripted::Fail(err)) => Err(err),
            Some(Scripted::Succeed) | None => {
                self.cancelled.lock().await.push(payment_key.to_string());
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{body_json, body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::payment::breaker::{BreakerConfig, BreakerState};

    fn http_gateway(server: &MockServer, read_timeout: Duration) -> HttpGateway {
        HttpGateway::new(HttpGatewayConfig {
            base_url: format!("{}/", server.uri()),
            secret: "sk_test".to_string(),
            connect_timeout: Duration::from_secs(1),
            read_timeout,
        })
        .unwrap()
    }

    async fn answering(status: u16, body: serde_json::Value) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(status).set_body_json(body))
            .mount(&server)
            .await;
        server
    }

    fn request() -> ApprovalRequest {
        ApprovalRequest {
            payment_key: "pk-1".to_string(),
            order_id: OrderId::new(),
            amount: Money::from_cents(1000),
        }
    }

    fn guarded(inner: &ScriptedGateway) -> BreakerGateway {
        BreakerGateway::new(
            Arc::new(inner.clone()),
            CircuitBreaker::new(
                "payment-gateway",
                BreakerConfig {
                    failure_threshold: 2,
                    ..BreakerConfig::default()
                },
            ),
        )
    }

    #[tokio::test]
    async fn test_declines_do_not_trip_the_breaker() {
        let inner = ScriptedGateway::new();
        let gateway = guarded(&inner);
        for _ in 0..3 {
            inner
                .script_approve(Scripted::Fail(GatewayError::declined("REJECT_CARD", "no")))
                .await;
            assert!(matches!(
                gateway.approve(&request()).await,
                Err(GatewayError::Declined { .. })
            ));
        }
        assert_eq!(gateway.breaker().state().await, BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_outages_open_the_circuit_and_fail_fast() {
        let inner = ScriptedGateway::new();
        let gateway = guarded(&inner);
        for _ in 0..2 {
            inner
                .script_approve(Scripted::Fail(GatewayError::Unavailable("timeout".to_string())))
                .await;
            let _ = gateway.approve(&request()).await;
        }
        assert_eq!(gateway.breaker().state().await, BreakerState::Open);

        // The inner gateway would succeed now, but is never called.
        let err = gateway.approve(&request()).await.unwrap_err();
        assert!(err.is_unavailable());
        assert!(err.to_string().contains("open"));
    }

    #[tokio::test]
    async fn test_scripted_gateway_records_cancels() {
        let gateway = ScriptedGateway::new();
        gateway.cancel("pk-1", "refund").await.unwrap();
        gateway
            .script_cancel(Scripted::Fail(GatewayError::declined("ALREADY_CANCELED", "no")))
            .await;
        assert!(gateway.cancel("pk-2", "refund").await.is_err());
        assert_eq!(gateway.cancelled().await, vec!["pk-1".to_string()]);
    }

    #[tokio::test]
    async fn test_http_approve_sends_the_confirmation_contract() {
        let server = MockServer::start().await;
        let request = request();
        Mock::given(method("POST"))
            .and(path("/v1/payments/confirm"))
            .and(header("authorization", "Basic c2tfdGVzdDo="))
            .and(body_partial_json(json!({
                "paymentKey": "pk-1",
                "orderId": request.order_id.to_string(),
                "amount": 1000,
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "paymentKey": "pk-1" })))
            .expect(1)
            .mount(&server)
            .await;

        let approval = http_gateway(&server, Duration::from_secs(2))
            .approve(&request)
            .await
            .unwrap();
        assert_eq!(approval.payment_key, "pk-1");
    }

    #[tokio::test]
    async fn test_http_cancel_sends_the_reason() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/payments/pk-9/cancel"))
            .and(body_json(json!({ "cancelReason": "customer request" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        http_gateway(&server, Duration::from_secs(2))
            .cancel("pk-9", "customer request")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_http_business_refusals_are_declines() {
        let server = answering(400, json!({ "code": "REJECT_CARD", "message": "card declined" })).await;
        let err = http_gateway(&server, Duration::from_secs(2))
            .approve(&request())
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::declined("REJECT_CARD", "card declined"));

        let server = answering(409, json!({ "code": "ALREADY_CANCELED" })).await;
        let err = http_gateway(&server, Duration::from_secs(2))
            .cancel("pk-1", "refund")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Declined { ref code, .. } if code == "ALREADY_CANCELED"));
    }

    #[tokio::test]
    async fn test_http_outages_and_misconfiguration_are_unavailable() {
        for status in [401, 403, 404, 408, 429, 500, 503] {
            let server = answering(status, json!({ "code": "UNAUTHORIZED_KEY", "message": "no" })).await;
            let err = http_gateway(&server, Duration::from_secs(2))
                .approve(&request())
                .await
                .unwrap_err();
            assert!(err.is_unavailable(), "status {status} gave {err:?}");
        }
    }

    #[tokio::test]
    async fn test_http_refusal_without_failure_code_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("<html>bad gateway config</html>"))
            .mount(&server)
            .await;

        let err = http_gateway(&server, Duration::from_secs(2))
            .approve(&request())
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
    }

    #[tokio::test]
    async fn test_http_timeout_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "paymentKey": "pk-1" }))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let err = http_gateway(&server, Duration::from_millis(50))
            .approve(&request())
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
        assert!(err.to_string().contains("timeout"));
    }

    #[tokio::test]
    async fn test_http_auth_failures_open_the_circuit() {
        let server = answering(401, json!({ "code": "UNAUTHORIZED_KEY" })).await;
        let gateway = BreakerGateway::new(
            Arc::new(http_gateway(&server, Duration::from_secs(2))),
            CircuitBreaker::new(
                "payment-gateway",
                BreakerConfig {
                    failure_threshold: 2,
                    ..BreakerConfig::default()
                },
            ),
        );

        for _ in 0..2 {
            assert!(gateway.approve(&request()).await.unwrap_err().is_unavailable());
        }
        assert_eq!(gateway.breaker().state().await, BreakerState::Open);
    }
}
