//! Square REST client implementing [`PaymentProcessor`]
//!
//! Holds are created with `autocomplete=false`. Cards go through a customer
//! and a card on file first so an overrun can later be charged directly;
//! wallet tokens are sent straight to the payments endpoint.

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::payment::{
    CardOnFile, ChargeRequest, Hold, HoldRequest, PaymentError, PaymentProcessor, PaymentResult,
    Settlement,
};

pub const SQUARE_API_VERSION: &str = "2026-01-22";
const SANDBOX_BASE_URL: &str = "https://connect.squareupsandbox.com";
const PRODUCTION_BASE_URL: &str = "https://connect.squareup.com";
const SANDBOX_SDK_URL: &str = "https://sandbox.web.squarecdn.com/v1/square.js";
const PRODUCTION_SDK_URL: &str = "https://web.squarecdn.com/v1/square.js";

/// Square's limit on `reference_id`
const REFERENCE_LEN: usize = 40;
/// Square's limit on `idempotency_key`
const IDEMPOTENCY_KEY_LEN: usize = 45;

/// Square account settings
#[derive(Debug, Clone)]
pub struct SquareConfig {
    pub sandbox: bool,
    pub app_id: String,
    pub access_token: String,
    /// Empty until configured or fetched at startup
    pub location_id: String,
    pub currency: String,
}

impl SquareConfig {
    pub fn base_url(&self) -> &'static str {
        if self.sandbox {
            SANDBOX_BASE_URL
        } else {
            PRODUCTION_BASE_URL
        }
    }

    /// Web Payments SDK script for the card form
    pub fn sdk_url(&self) -> &'static str {
        if self.sandbox {
            SANDBOX_SDK_URL
        } else {
            PRODUCTION_SDK_URL
        }
    }
}

#[derive(Clone)]
pub struct SquareClient {
    http: reqwest::Client,
    config: SquareConfig,
    base_url: String,
}

#[derive(Deserialize)]
struct PaymentEnvelope {
    payment: SquarePayment,
}

#[derive(Deserialize)]
struct SquarePayment {
    id: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    amount_money: Option<Money>,
    #[serde(default)]
    card_details: Option<CardDetails>,
}

#[derive(Deserialize)]
struct Money {
    amount: i64,
}

#[derive(Deserialize)]
struct CardDetails {
    #[serde(default)]
    card: Option<SquareCard>,
}

#[derive(Deserialize)]
struct SquareCard {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    card_brand: Option<String>,
    #[serde(default, rename = "last_4")]
    last4: Option<String>,
}

#[derive(Deserialize)]
struct CustomerEnvelope {
    customer: SquareId,
}

#[derive(Deserialize)]
struct CardEnvelope {
    card: SquareCard,
}

#[derive(Deserialize)]
struct SquareId {
    id: String,
}

#[derive(Deserialize)]
struct LocationsEnvelope {
    #[serde(default)]
    locations: Vec<Location>,
}

#[derive(Deserialize)]
struct Location {
    id: String,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    errors: Vec<SquareApiError>,
}

#[derive(Deserialize)]
struct SquareApiError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    detail: Option<String>,
}

/// Where an existing payment stands before we try to settle it
#[derive(Debug, PartialEq, Eq)]
enum PaymentStatus {
    Open,
    Completed,
    Canceled,
}

impl SquarePayment {
    fn status(&self) -> PaymentStatus {
        match self.status.as_deref() {
            Some("COMPLETED") => PaymentStatus::Completed,
            Some("CANCELED") | Some("FAILED") => PaymentStatus::Canceled,
            _ => PaymentStatus::Open,
        }
    }

    fn settlement(&self, fallback_cents: i64) -> Settlement {
        Settlement {
            payment_id: self.id.clone(),
            amount_cents: self
                .amount_money
                .as_ref()
                .map(|m| m.amount)
                .unwrap_or(fallback_cents),
        }
    }
}

/// Turn a non-success response into a decline or an outage
pub fn classify_failure(status: StatusCode, body: &str) -> PaymentError {
    let detail = error_detail(body).unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        PaymentError::Unavailable(detail)
    } else {
        PaymentError::Declined(detail)
    }
}

/// Square's `errors[]` joined with `; `, preferring `detail` over `code`
pub fn error_detail(body: &str) -> Option<String> {
    let envelope: ErrorEnvelope = serde_json::from_str(body).ok()?;
    let parts: Vec<String> = envelope
        .errors
        .into_iter()
        .filter_map(|e| e.detail.or(e.code))
        .filter(|s| !s.is_empty())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("; "))
    }
}

fn truncate(value: &str, max: usize) -> String {
    value.chars().take(max).collect()
}

fn card_idempotency_key(hold_key: &str) -> String {
    truncate(&format!("card:{}", hold_key), IDEMPOTENCY_KEY_LEN)
}

/// One amount update per hold and final amount, so a retried capture replays it
fn update_idempotency_key(hold_id: &str, amount_cents: i64) -> String {
    truncate(&format!("upd:{}:{}", amount_cents, hold_id), IDEMPOTENCY_KEY_LEN)
}

impl SquareClient {
    /// Create a new Square client with a per-request timeout
    pub fn new(config: SquareConfig, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let base_url = config.base_url().to_string();
        Ok(Self {
            http,
            config,
            base_url,
        })
    }

    pub fn config(&self) -> &SquareConfig {
        &self.config
    }

    pub fn set_location_id(&mut self, location_id: String) {
        self.config.location_id = location_id;
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> PaymentResult<T> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .http
            .request(method.clone(), &url)
            .bearer_auth(&self.config.access_token)
            .header("Square-Version", SQUARE_API_VERSION);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(|e| {
            error!("Square {} {} failed: {}", method, path, e);
            PaymentError::Unavailable(format!("Square request failed: {}", e))
        })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| {
            PaymentError::Unavailable(format!("Square response unreadable: {}", e))
        })?;
        info!("Square {} {} -> HTTP {}", method, path, status.as_u16());

        if !status.is_success() {
            return Err(classify_failure(status, &text));
        }

        serde_json::from_str(&text).map_err(|e| {
            error!("Unexpected Square response for {} {}: {}", method, path, e);
            PaymentError::Unavailable(format!("Unexpected Square response: {}", e))
        })
    }

    /// First ACTIVE location on the account
    pub async fn fetch_first_location_id(&self) -> PaymentResult<String> {
        let envelope: LocationsEnvelope = self.send(Method::GET, "/v2/locations", None).await?;
        envelope
            .locations
            .into_iter()
            .find(|l| l.status.as_deref() == Some("ACTIVE"))
            .map(|l| l.id)
            .ok_or_else(|| PaymentError::Declined("No active Square locations found".to_string()))
    }

    async fn create_customer(&self, request: &HoldRequest) -> PaymentResult<String> {
        let body = json!({
            "idempotency_key": truncate(&format!("cust:{}", request.idempotency_key), IDEMPOTENCY_KEY_LEN),
            "given_name": request.source.given_name,
            "family_name": request.source.family_name,
            "reference_id": truncate(&request.reference, REFERENCE_LEN),
            "note": format!("EV charger session {}", request.reference),
        });
        let envelope: CustomerEnvelope = self.send(Method::POST, "/v2/customers", Some(body)).await?;
        Ok(envelope.customer.id)
    }

    async fn create_card(&self, request: &HoldRequest, customer_id: &str) -> PaymentResult<CardOnFile> {
        let body = json!({
            "idempotency_key": card_idempotency_key(&request.idempotency_key),
            "source_id": request.source.source_id,
            "card": {
                "customer_id": customer_id,
                "reference_id": truncate(&request.reference, REFERENCE_LEN),
            },
        });
        let envelope: CardEnvelope = self.send(Method::POST, "/v2/cards", Some(body)).await?;
        let card_id = envelope
            .card
            .id
            .ok_or_else(|| PaymentError::Unavailable("Square card response without id".to_string()))?;

        Ok(CardOnFile {
            customer_id: Some(customer_id.to_string()),
            card_id: Some(card_id),
            brand: envelope.card.card_brand,
            last4: envelope.card.last4,
        })
    }

    async fn fetch_payment(&self, payment_id: &str) -> PaymentResult<SquarePayment> {
        let envelope: PaymentEnvelope = self
            .send(Method::GET, &format!("/v2/payments/{}", payment_id), None)
            .await?;
        Ok(envelope.payment)
    }

    fn money(&self, amount_cents: i64) -> Value {
        json!({ "amount": amount_cents, "currency": self.config.currency })
    }
}

#[async_trait]
impl PaymentProcessor for SquareClient {
    async fn authorize(&self, request: &HoldRequest) -> PaymentResult<Hold> {
        let mut body = json!({
            "idempotency_key": truncate(&request.idempotency_key, IDEMPOTENCY_KEY_LEN),
            "autocomplete": false,
            "amount_money": self.money(request.amount_cents),
            "location_id": self.config.location_id,
            "reference_id": truncate(&request.reference, REFERENCE_LEN),
            "note": format!(
                "EV charger authorization hold for {}. Pre-auth of ${}.{:02}.",
                request.reference,
                request.amount_cents / 100,
                request.amount_cents % 100
            ),
        });

        let card = if request.source.method.is_wallet() {
            body["source_id"] = json!(request.source.source_id);
            None
        } else {
            let customer_id = self.create_customer(request).await?;
            let card = self.create_card(request, &customer_id).await?;
            body["source_id"] = json!(card.card_id);
            body["customer_id"] = json!(customer_id);
            Some(card)
        };

        let envelope: PaymentEnvelope = self.send(Method::POST, "/v2/payments", Some(body)).await?;
        let payment = envelope.payment;

        // Wallet payments only report card details on the payment itself
        let card = card.unwrap_or_else(|| {
            let details = payment.card_details.as_ref().and_then(|d| d.card.as_ref());
            CardOnFile {
                customer_id: None,
                card_id: None,
                brand: details.and_then(|c| c.card_brand.clone()),
                last4: details.and_then(|c| c.last4.clone()),
            }
        });

        info!(hold_id = %payment.id, "Square hold created");
        Ok(Hold {
            hold_id: payment.id,
            card,
        })
    }

    async fn capture(&self, hold_id: &str, amount_cents: i64) -> PaymentResult<Settlement> {
        // A retry after a lost response finds the hold already settled
        let existing = self.fetch_payment(hold_id).await?;
        match existing.status() {
            PaymentStatus::Completed => {
                info!(hold_id, "Square hold already captured");
                return Ok(existing.settlement(amount_cents));
            }
            PaymentStatus::Canceled => {
                warn!(hold_id, "Square hold canceled before capture");
                return Err(PaymentError::Declined(format!(
                    "Payment {} was already canceled",
                    hold_id
                )));
            }
            PaymentStatus::Open => {}
        }

        let update = json!({
            "idempotency_key": update_idempotency_key(hold_id, amount_cents),
            "payment": { "amount_money": self.money(amount_cents) },
        });
        let _: PaymentEnvelope = self
            .send(Method::PUT, &format!("/v2/payments/{}", hold_id), Some(update))
            .await?;

        let completed: PaymentEnvelope = self
            .send(
                Method::POST,
                &format!("/v2/payments/{}/complete", hold_id),
                Some(json!({})),
            )
            .await?;
        Ok(completed.payment.settlement(amount_cents))
    }

    async fn void(&self, hold_id: &str) -> PaymentResult<Settlement> {
        let existing = self.fetch_payment(hold_id).await?;
        match existing.status() {
            PaymentStatus::Canceled => {
                info!(hold_id, "Square hold already canceled");
                return Ok(Settlement {
                    payment_id: existing.id,
                    amount_cents: 0,
                });
            }
            PaymentStatus::Completed => {
                warn!(hold_id, "Square hold captured before void");
                return Err(PaymentError::Declined(format!(
                    "Payment {} was already captured",
                    hold_id
                )));
            }
            PaymentStatus::Open => {}
        }

        let cancelled: PaymentEnvelope = self
            .send(
                Method::POST,
                &format!("/v2/payments/{}/cancel", hold_id),
                Some(json!({})),
            )
            .await?;
        Ok(Settlement {
            payment_id: cancelled.payment.id,
            amount_cents: 0,
        })
    }

    async fn charge(&self, request: &ChargeRequest) -> PaymentResult<Settlement> {
        let body = json!({
            "idempotency_key": truncate(&request.idempotency_key, IDEMPOTENCY_KEY_LEN),
            "source_id": request.card_id,
            "customer_id": request.customer_id,
            "autocomplete": true,
            "amount_money": self.money(request.amount_cents),
            "location_id": self.config.location_id,
            "reference_id": truncate(&request.reference, REFERENCE_LEN),
            "note": format!("EV charging final charge for {}", request.reference),
        });
        let envelope: PaymentEnvelope = self.send(Method::POST, "/v2/payments", Some(body)).await?;
        Ok(envelope.payment.settlement(request.amount_cents))
    }
}
