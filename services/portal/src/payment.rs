//! Payment processor abstraction
//!
//! The lifecycle engine only talks to a [`PaymentProcessor`]. Every call is
//! classified as success, a decline (terminal, reported verbatim) or
//! unavailability (transient, safe to retry with the same idempotency key).

use async_trait::async_trait;
use thiserror::Error;

/// How the guest tokenized their payment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentMethod {
    Card,
    ApplePay,
    GooglePay,
}

impl PaymentMethod {
    /// Parse the client SDK's method name; anything unknown is a card
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "APPLE_PAY" => PaymentMethod::ApplePay,
            "GOOGLE_PAY" => PaymentMethod::GooglePay,
            _ => PaymentMethod::Card,
        }
    }

    /// Wallet tokens cannot be stored as a card on file
    pub fn is_wallet(&self) -> bool {
        matches!(self, PaymentMethod::ApplePay | PaymentMethod::GooglePay)
    }
}

/// A single-use token from the client SDK plus the cardholder's name
#[derive(Debug, Clone)]
pub struct PaymentSource {
    pub source_id: String,
    pub given_name: String,
    pub family_name: String,
    pub method: PaymentMethod,
}

impl PaymentSource {
    pub fn validate(&self) -> Result<(), String> {
        if self.source_id.trim().is_empty() {
            return Err("source_id is required".to_string());
        }
        if !self.method.is_wallet()
            && (self.given_name.trim().is_empty() || self.family_name.trim().is_empty())
        {
            return Err("given_name and family_name are required for card payments".to_string());
        }
        Ok(())
    }
}

/// Request for an authorization hold
#[derive(Debug, Clone)]
pub struct HoldRequest {
    pub amount_cents: i64,
    pub source: PaymentSource,
    /// Stable per session so a retried request cannot place a second hold
    pub idempotency_key: String,
    /// Shown on the processor's dashboard
    pub reference: String,
}

/// Display metadata for the card behind a hold
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CardOnFile {
    pub customer_id: Option<String>,
    pub card_id: Option<String>,
    pub brand: Option<String>,
    pub last4: Option<String>,
}

/// A placed authorization hold
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hold {
    pub hold_id: String,
    pub card: CardOnFile,
}

/// Direct charge against a stored card
#[derive(Debug, Clone)]
pub struct ChargeRequest {
    pub card_id: String,
    pub customer_id: String,
    pub amount_cents: i64,
    pub idempotency_key: String,
    pub reference: String,
}

/// Result of a capture, void or charge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub payment_id: String,
    pub amount_cents: i64,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PaymentError {
    /// The processor refused; retrying will not help
    #[error("Payment declined: {0}")]
    Declined(String),

    /// Timeout, transport failure or processor outage
    #[error("Payment processor unavailable: {0}")]
    Unavailable(String),
}

pub type PaymentResult<T> = Result<T, PaymentError>;

#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    async fn authorize(&self, request: &HoldRequest) -> PaymentResult<Hold>;

    async fn capture(&self, hold_id: &str, amount_cents: i64) -> PaymentResult<Settlement>;

    async fn void(&self, hold_id: &str) -> PaymentResult<Settlement>;

    async fn charge(&self, request: &ChargeRequest) -> PaymentResult<Settlement>;
}
