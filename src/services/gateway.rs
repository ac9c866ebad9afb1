use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::config::GatewayConfig;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex HMAC-SHA256 of a request or callback body.
pub const SIGNATURE_HEADER: &str = "x-verify";

#[derive(Debug, Error)]
pub enum GatewayError {
    /// No gateway credentials; the storefront runs in demo mode.
    #[error("payment gateway is not configured")]
    NotConfigured,

    #[error("payment gateway rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("payment gateway unreachable: {0}")]
    Transport(String),

    #[error("unexpected payment gateway response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            GatewayError::InvalidResponse(err.to_string())
        } else {
            GatewayError::Transport(err.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateRequest {
    pub merchant_transaction_id: String,
    pub amount_minor: i64,
    /// Order reference shown to the shopper on the gateway page
    pub order_ref: String,
    pub redirect_url: String,
    pub callback_url: String,
    pub customer_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateResponse {
    pub checkout_url: String,
    #[serde(default)]
    pub gateway_reference: Option<String>,
}

/// Payment outcome as reported by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayPaymentState {
    Success,
    Failure,
    Pending,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStatus {
    pub merchant_transaction_id: String,
    pub state: GatewayPaymentState,
    #[serde(default)]
    pub amount_minor: Option<i64>,
    #[serde(default)]
    pub gateway_reference: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundRequest {
    pub merchant_transaction_id: String,
    pub refund_id: String,
    pub amount_minor: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefundState {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundStatus {
    pub refund_id: String,
    pub state: RefundState,
    #[serde(default)]
    pub amount_minor: Option<i64>,
}

/// Redirect-style payment processor.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn is_configured(&self) -> bool;

    /// Shared secret for callback verification, when configured.
    fn callback_secret(&self) -> Option<&str>;

    async fn initiate(&self, request: &InitiateRequest) -> Result<InitiateResponse, GatewayError>;

    async fn check_status(&self, merchant_transaction_id: &str)
        -> Result<GatewayStatus, GatewayError>;

    async fn refund(&self, request: &RefundRequest) -> Result<RefundStatus, GatewayError>;

    async fn check_refund_status(&self, refund_id: &str) -> Result<RefundStatus, GatewayError>;
}

pub fn sign_payload(secret: &str, body: &[u8]) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time check of a hex HMAC-SHA256 signature over `body`.
pub fn verify_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Gateway used when credentials are absent. Every call reports `NotConfigured`.
#[derive(Debug, Default)]
pub struct UnconfiguredGateway;

#[async_trait]
impl PaymentGateway for UnconfiguredGateway {
    fn is_configured(&self) -> bool {
        false
    }

    fn callback_secret(&self) -> Option<&str> {
        None
    }

    async fn initiate(&self, _request: &InitiateRequest) -> Result<InitiateResponse, GatewayError> {
        Err(GatewayError::NotConfigured)
    }

    async fn check_status(&self, _id: &str) -> Result<GatewayStatus, GatewayError> {
        Err(GatewayError::NotConfigured)
    }

    async fn refund(&self, _request: &RefundRequest) -> Result<RefundStatus, GatewayError> {
        Err(GatewayError::NotConfigured)
    }

    async fn check_refund_status(&self, _refund_id: &str) -> Result<RefundStatus, GatewayError> {
        Err(GatewayError::NotConfigured)
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    #[serde(default)]
    message: Option<String>,
    data: Option<T>,
}

/// HTTP client for the redirect gateway. Request bodies are JSON and signed
/// with [`SIGNATURE_HEADER`].
#[derive(Clone)]
pub struct RedirectGatewayClient {
    client: reqwest::Client,
    base_url: String,
    merchant_id: String,
    secret: String,
}

impl RedirectGatewayClient {
    pub fn new(base_url: &str, merchant_id: &str, secret: &str, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            merchant_id: merchant_id.to_string(),
            secret: secret.to_string(),
        }
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, GatewayError> {
        let payload =
            serde_json::to_vec(body).map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .header("content-type", "application/json")
            .header("x-merchant-id", &self.merchant_id)
            .header(SIGNATURE_HEADER, sign_payload(&self.secret, &payload))
            .body(payload)
            .send()
            .await?;
        Self::unwrap_envelope(response).await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, GatewayError> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .header("x-merchant-id", &self.merchant_id)
            .header(SIGNATURE_HEADER, sign_payload(&self.secret, path.as_bytes()))
            .send()
            .await?;
        Self::unwrap_envelope(response).await
    }

    async fn unwrap_envelope<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, GatewayError> {
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "gateway returned non-success");
            return Err(GatewayError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        let envelope: Envelope<T> = response.json().await?;
        if !envelope.success {
            return Err(GatewayError::Rejected {
                status: status.as_u16(),
                message: envelope.message.unwrap_or_else(|| "declined".to_string()),
            });
        }
        envelope
            .data
            .ok_or_else(|| GatewayError::InvalidResponse("missing data".to_string()))
    }
}

#[async_trait]
impl PaymentGateway for RedirectGatewayClient {
    fn is_configured(&self) -> bool {
        true
    }

    fn callback_secret(&self) -> Option<&str> {
        Some(&self.secret)
    }

    #[instrument(skip(self, request), fields(merchant_transaction_id = %request.merchant_transaction_id))]
    async fn initiate(&self, request: &InitiateRequest) -> Result<InitiateResponse, GatewayError> {
        let response: InitiateResponse = self.post("/v1/payments", request).await?;
        info!("gateway checkout opened");
        Ok(response)
    }

    #[instrument(skip(self))]
    async fn check_status(
        &self,
        merchant_transaction_id: &str,
    ) -> Result<GatewayStatus, GatewayError> {
        self.get(&format!(
            "/v1/payments/{}/{}/status",
            self.merchant_id, merchant_transaction_id
        ))
        .await
    }

    #[instrument(skip(self, request), fields(refund_id = %request.refund_id))]
    async fn refund(&self, request: &RefundRequest) -> Result<RefundStatus, GatewayError> {
        self.post("/v1/refunds", request).await
    }

    #[instrument(skip(self))]
    async fn check_refund_status(&self, refund_id: &str) -> Result<RefundStatus, GatewayError> {
        self.get(&format!(
            "/v1/refunds/{}/{}/status",
            self.merchant_id, refund_id
        ))
        .await
    }
}

/// Builds the HTTP client when credentials are present, otherwise the demo-mode gateway.
pub fn gateway_from_config(config: &GatewayConfig) -> Arc<dyn PaymentGateway> {
    match (&config.base_url, &config.merchant_id, &config.secret) {
        (Some(url), Some(merchant), Some(secret)) if config.is_configured() => {
            Arc::new(RedirectGatewayClient::new(
                url,
                merchant,
                secret,
                Duration::from_secs(config.timeout_secs),
            ))
        }
        _ => {
            info!("payment gateway credentials absent; gateway checkout runs in demo mode");
            Arc::new(UnconfiguredGateway)
        }
    }
}
