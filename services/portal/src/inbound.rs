//! Routes inbound MQTT messages to the booking broker and the engine

use async_trait::async_trait;
use common::mqtt::{Delivery, MessageHandler};
use serde::Deserialize;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::booking::BookingBroker;
use crate::lifecycle::{LifecycleEngine, LifecycleError, LifecycleResult};
use crate::models::{FinalizeHint, Session};
use crate::topics::{self, ParsedTopic, TopicKind};

/// Identifies the session a message refers to
#[derive(Deserialize, Default)]
struct SessionRef {
    #[serde(default)]
    session_token: Option<String>,
    #[serde(default)]
    booking_id: Option<Value>,
}

impl SessionRef {
    fn booking_id(&self) -> Option<String> {
        match &self.booking_id {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }
}

#[derive(Deserialize)]
struct AuthorizeResponse {
    #[serde(flatten)]
    session: SessionRef,
    #[serde(default)]
    success: bool,
}

#[derive(Deserialize)]
struct FinalizeMessage {
    #[serde(flatten)]
    session: SessionRef,
    #[serde(default)]
    final_amount_cents: Option<i64>,
}

#[derive(Clone)]
pub struct InboundRouter {
    engine: LifecycleEngine,
    booking: BookingBroker,
}

impl InboundRouter {
    /// Create a new inbound router
    pub fn new(engine: LifecycleEngine, booking: BookingBroker) -> Self {
        Self { engine, booking }
    }

    /// Find the session for a message, ignoring ones for another charger
    async fn resolve(&self, topic: &ParsedTopic, reference: &SessionRef) -> LifecycleResult<Session> {
        let session = if let Some(token) = reference.session_token.as_deref().filter(|t| !t.is_empty()) {
            self.engine.get(token).await?
        } else if let Some(booking_id) = reference.booking_id() {
            self.engine
                .find_by_booking(&booking_id)
                .await?
                .ok_or(LifecycleError::NotFound)?
        } else {
            return Err(LifecycleError::InvalidInput(
                "message carries neither session_token nor booking_id".to_string(),
            ));
        };

        if session.home_id != topic.home_id || session.charger_id != topic.charger_id {
            warn!(
                session = session.log_id(),
                topic_charger = %topic.charger_id,
                "Session belongs to another charger"
            );
            return Err(LifecycleError::NotFound);
        }
        Ok(session)
    }

    async fn on_authorize_response(&self, topic: &ParsedTopic, payload: &[u8]) -> Delivery {
        let message: AuthorizeResponse = match serde_json::from_slice(payload) {
            Ok(m) => m,
            Err(e) => {
                warn!("Malformed authorize response: {}", e);
                return Delivery::Ack;
            }
        };

        let result = async {
            let session = self.resolve(topic, &message.session).await?;
            if message.success {
                self.engine.mark_active(&session.token).await
            } else {
                warn!(session = session.log_id(), "Charger refused the session, releasing hold");
                self.engine
                    .finalize(&session.token, FinalizeHint::Cancelled, "charger")
                    .await
            }
        }
        .await;

        disposition("authorize_session/response", result)
    }

    async fn on_finalize(&self, topic: &ParsedTopic, payload: &[u8]) -> Delivery {
        let message: FinalizeMessage = match serde_json::from_slice(payload) {
            Ok(m) => m,
            Err(e) => {
                warn!("Malformed finalize message: {}", e);
                return Delivery::Ack;
            }
        };
        let Some(amount_cents) = message.final_amount_cents else {
            error!("finalize_session without final_amount_cents, ignoring");
            return Delivery::Ack;
        };

        let result = async {
            let session = self.resolve(topic, &message.session).await?;
            self.engine
                .finalize(&session.token, FinalizeHint::from_final_amount(amount_cents), "charger")
                .await
        }
        .await;

        disposition("finalize_session", result)
    }
}

/// Transient failures are redelivered; everything else is settled
fn disposition(kind: &str, result: LifecycleResult<Session>) -> Delivery {
    match result {
        Ok(session) => {
            info!(session = session.log_id(), state = %session.state, "Handled {}", kind);
            Delivery::Ack
        }
        Err(
            e @ (LifecycleError::ProcessorUnavailable(_)
            | LifecycleError::Store(_)
            | LifecycleError::Bus(_)),
        ) => {
            warn!("Transient failure handling {}: {}", kind, e);
            Delivery::Redeliver
        }
        Err(e) => {
            warn!("Dropping {}: {}", kind, e);
            Delivery::Ack
        }
    }
}

#[async_trait]
impl MessageHandler for InboundRouter {
    async fn on_message(&self, topic: &str, payload: &[u8]) -> Delivery {
        let Some(parsed) = topics::parse(topic) else {
            warn!(topic, "Message on unexpected topic");
            return Delivery::Ack;
        };

        match parsed.kind {
            TopicKind::BookingResponse => {
                self.booking
                    .deliver(&parsed.home_id, &parsed.charger_id, payload)
                    .await;
                Delivery::Ack
            }
            TopicKind::AuthorizeResponse => self.on_authorize_response(&parsed, payload).await,
            TopicKind::FinalizeSession => self.on_finalize(&parsed, payload).await,
            // Our own outbound topics
            TopicKind::RequestSession | TopicKind::AuthorizeSession => Delivery::Ack,
        }
    }
}
