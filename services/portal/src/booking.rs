//! Booking round trip with the automation layer
//!
//! `/start` publishes `request_session` and waits for the matching
//! `booking/response`. Only one request may be in flight at a time.

use chrono::Utc;
use common::error::BusError;
use common::mqtt::Publisher;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, oneshot};
use tracing::{info, warn};

use crate::topics::{self, TopicKind};

#[derive(Error, Debug)]
pub enum BookingError {
    #[error("Another session request is in progress, try again shortly")]
    Busy,

    #[error("No booking response within {0:?}")]
    Timeout(Duration),

    #[error("Failed to request booking: {0}")]
    Bus(#[from] BusError),

    #[error("Invalid booking response: {0}")]
    InvalidResponse(String),
}

/// Booking granted by the automation layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingOffer {
    pub booking_id: String,
    pub amount_cents: i64,
}

#[derive(Deserialize)]
struct BookingResponse {
    #[serde(default)]
    booking_id: Option<Value>,
    /// Dollars
    #[serde(default)]
    initial_authorization_amount: Option<f64>,
}

struct Waiter {
    home_id: String,
    charger_id: String,
    reply: oneshot::Sender<Vec<u8>>,
}

#[derive(Clone)]
pub struct BookingBroker {
    bus: Arc<dyn Publisher>,
    in_flight: Arc<Mutex<()>>,
    waiter: Arc<Mutex<Option<Waiter>>>,
    response_timeout: Duration,
    default_amount_cents: i64,
}

impl BookingBroker {
    /// Create a new booking broker
    pub fn new(bus: Arc<dyn Publisher>, response_timeout: Duration, default_amount_cents: i64) -> Self {
        Self {
            bus,
            in_flight: Arc::new(Mutex::new(())),
            waiter: Arc::new(Mutex::new(None)),
            response_timeout,
            default_amount_cents,
        }
    }

    /// Ask for a booking and wait for the answer
    pub async fn request(&self, home_id: &str, charger_id: &str) -> Result<BookingOffer, BookingError> {
        let _flight = self.in_flight.try_lock().map_err(|_| BookingError::Busy)?;

        // Register before publishing so a fast reply is not missed
        let (reply, response) = oneshot::channel();
        *self.waiter.lock().await = Some(Waiter {
            home_id: home_id.to_string(),
            charger_id: charger_id.to_string(),
            reply,
        });

        let payload = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "home_id": home_id,
            "charger_id": charger_id,
        });
        let topic = topics::topic(home_id, charger_id, TopicKind::RequestSession);
        if let Err(e) = self.bus.publish(&topic, &payload).await {
            self.waiter.lock().await.take();
            return Err(e.into());
        }
        info!(topic = %topic, "Requested booking");

        let raw = match tokio::time::timeout(self.response_timeout, response).await {
            Ok(Ok(raw)) => raw,
            _ => {
                self.waiter.lock().await.take();
                warn!("No booking response within {:?}", self.response_timeout);
                return Err(BookingError::Timeout(self.response_timeout));
            }
        };

        let offer = parse_offer(&raw, self.default_amount_cents)?;
        info!(booking_id = %offer.booking_id, amount_cents = offer.amount_cents, "Booking received");
        Ok(offer)
    }

    /// Hand a `booking/response` to the pending request; false if nobody waits
    pub async fn deliver(&self, home_id: &str, charger_id: &str, payload: &[u8]) -> bool {
        let mut slot = self.waiter.lock().await;
        let matches = slot
            .as_ref()
            .is_some_and(|w| w.home_id == home_id && w.charger_id == charger_id);
        if !matches {
            warn!(home_id, charger_id, "Dropping booking response nobody is waiting for");
            return false;
        }
        match slot.take() {
            Some(waiter) => waiter.reply.send(payload.to_vec()).is_ok(),
            None => false,
        }
    }
}

fn parse_offer(raw: &[u8], default_amount_cents: i64) -> Result<BookingOffer, BookingError> {
    let response: BookingResponse = serde_json::from_slice(raw)
        .map_err(|e| BookingError::InvalidResponse(format!("not a JSON object: {}", e)))?;

    let booking_id = match response.booking_id {
        Some(Value::String(s)) if !s.trim().is_empty() => s,
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err(BookingError::InvalidResponse("missing booking_id".to_string())),
    };

    let amount_cents = match response.initial_authorization_amount {
        Some(dollars) if dollars.is_finite() && dollars > 0.0 => (dollars * 100.0).round() as i64,
        Some(dollars) => {
            return Err(BookingError::InvalidResponse(format!(
                "initial_authorization_amount must be positive, got {}",
                dollars
            )));
        }
        None => default_amount_cents,
    };

    Ok(BookingOffer {
        booking_id,
        amount_cents,
    })
}
