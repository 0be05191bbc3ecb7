//! Local payload delivery: the seam between the forwarder and whatever
//! consumes packets addressed to this node.
//!
//! The core never interprets payload bytes. On local termination it hands
//! `(amount, destination, payload)` to a [`PayloadHandler`] and maps the
//! decision back into the packet pipeline; the fulfillment is derived from
//! the payload hash, so handlers know nothing about conditions.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as b64;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

use crate::address::Address;
use crate::codec::ErrorCode;

/// A locally terminating payment handed to the handler.
#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub payment_id: Uuid,
    pub amount: u64,
    pub destination: Address,
    pub payload: Vec<u8>,
}

/// Handler verdict. Payload bytes pass through opaquely in both directions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerDecision {
    Accept {
        response_payload: Vec<u8>,
    },
    Reject {
        code: String,
        message: String,
        response_payload: Vec<u8>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("handler transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("handler returned status {0}")]
    Status(u16),
    #[error("handler response malformed: {0}")]
    MalformedResponse(String),
    #[error("handler timed out")]
    Timeout,
}

/// Consumer of locally terminating payments. Open set; implemented in
/// process for embedded deployments and over HTTP for standalone ones.
#[async_trait]
pub trait PayloadHandler: Send + Sync {
    async fn handle(&self, request: &PaymentRequest) -> Result<HandlerDecision, HandlerError>;
}

/// Maps handler-domain reject codes onto the wire error-code registry.
/// Unknown codes map to `F99`.
#[derive(Debug, Clone, Default)]
pub struct CodeMap {
    mappings: HashMap<String, ErrorCode>,
}

impl CodeMap {
    pub fn new(mappings: HashMap<String, ErrorCode>) -> Self {
        CodeMap { mappings }
    }

    pub fn map(&self, domain_code: &str) -> ErrorCode {
        self.mappings
            .get(domain_code)
            .copied()
            .unwrap_or(ErrorCode::HANDLER_REJECTED)
    }
}

// ============================================================================
// HTTP delivery (standalone mode)
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HandlePaymentRequest {
    payment_id: String,
    amount: u64,
    destination: String,
    payload: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HandlePaymentResponse {
    accept: bool,
    #[serde(default)]
    reject_reason: Option<RejectReason>,
    #[serde(default)]
    response_payload: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RejectReason {
    code: String,
    #[serde(default)]
    message: String,
}

/// Delivers payments to an external service via `POST /handle-payment`.
pub struct HttpPayloadHandler {
    http: reqwest::Client,
    url: Url,
}

impl HttpPayloadHandler {
    pub fn new(base_url: &Url, timeout: Duration) -> Result<Self, HandlerError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let url = base_url
            .join("handle-payment")
            .map_err(|e| HandlerError::MalformedResponse(format!("bad handler url: {e}")))?;
        Ok(HttpPayloadHandler { http, url })
    }

    fn decode_response_payload(field: Option<&String>) -> Result<Vec<u8>, HandlerError> {
        match field {
            None => Ok(Vec::new()),
            Some(encoded) => b64
                .decode(encoded)
                .map_err(|e| HandlerError::MalformedResponse(format!("responsePayload: {e}"))),
        }
    }
}

#[async_trait]
impl PayloadHandler for HttpPayloadHandler {
    async fn handle(&self, request: &PaymentRequest) -> Result<HandlerDecision, HandlerError> {
        let body = HandlePaymentRequest {
            payment_id: request.payment_id.to_string(),
            amount: request.amount,
            destination: request.destination.to_string(),
            payload: b64.encode(&request.payload),
        };
        let response = self
            .http
            .post(self.url.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    HandlerError::Timeout
                } else {
                    HandlerError::Transport(e)
                }
            })?;
        if !response.status().is_success() {
            return Err(HandlerError::Status(response.status().as_u16()));
        }
        let parsed: HandlePaymentResponse = response
            .json()
            .await
            .map_err(|e| HandlerError::MalformedResponse(e.to_string()))?;

        let response_payload = Self::decode_response_payload(parsed.response_payload.as_ref())?;
        if parsed.accept {
            Ok(HandlerDecision::Accept { response_payload })
        } else {
            let reason = parsed.reject_reason.unwrap_or(RejectReason {
                code: String::new(),
                message: String::new(),
            });
            Ok(HandlerDecision::Reject {
                code: reason.code,
                message: reason.message,
                response_payload,
            })
        }
    }
}
