//! Seam to the external payment gateway. Capture happens outside this crate and
//! reaches us through the orchestrator; only refunds are initiated from here.

use async_trait::async_trait;
use thiserror::Error;

use crate::model::Payment;

#[derive(Debug, Clone, Error)]
#[error("payment gateway error: {message}")]
pub struct GatewayError {
    pub message: String,
    /// Whether retrying the same call may succeed.
    pub retryable: bool,
}

impl GatewayError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundReceipt {
    pub refund_id: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn refund(&self, payment: &Payment, reason: &str) -> Result<RefundReceipt, GatewayError>;
}
