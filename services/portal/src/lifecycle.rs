//! Session lifecycle engine
//!
//! Every state change for a session goes through [`LifecycleEngine`]. Calls
//! for one token are serialized by a keyed mutex, and each transition is
//! persisted and audited before anything is published or returned.
//!
//! ```text
//! requested -> authorizing -> authorized -> active -> finalizing -> captured | voided
//! requested | authorizing -> auth_failed
//! authorized -> finalizing
//! ```

use chrono::Utc;
use common::error::{BusError, DatabaseError};
use common::mqtt::Publisher;
use dashmap::DashMap;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard, broadcast};
use tracing::{error, info, warn};

use crate::models::{
    AuditEntry, AuditRecord, FinalizeHint, NewSession, Session, SessionEvent, SessionFilter,
    SessionState, Settle, short_token,
};
use crate::payment::{
    ChargeRequest, HoldRequest, PaymentError, PaymentProcessor, PaymentResult, PaymentSource,
    Settlement,
};
use crate::repositories::SessionStore;
use crate::topics::{self, TopicKind};
use crate::validation::{validate_amount, validate_final_amount, validate_identifier, validate_note};

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("A session is already open on charger {charger_id}")]
    Conflict { charger_id: String },

    #[error("Payment declined: {0}")]
    ProcessorDeclined(String),

    #[error("Payment processor unavailable: {0}")]
    ProcessorUnavailable(String),

    #[error("Session not found")]
    NotFound,

    #[error("Cannot {operation} a session that is {state}")]
    InvalidState {
        state: SessionState,
        operation: &'static str,
    },

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Store error: {0}")]
    Store(#[from] DatabaseError),
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;

impl From<PaymentError> for LifecycleError {
    fn from(err: PaymentError) -> Self {
        match err {
            PaymentError::Declined(reason) => LifecycleError::ProcessorDeclined(reason),
            PaymentError::Unavailable(reason) => LifecycleError::ProcessorUnavailable(reason),
        }
    }
}

#[derive(Debug, Clone)]
pub enum AuthorizeOutcome {
    Authorized(Session),
    Declined { reason: String },
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Bound on every processor call
    pub processor_timeout: Duration,
    /// A `requested` session older than this is abandoned
    pub pending_ttl: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            processor_timeout: Duration::from_secs(10),
            pending_ttl: Duration::from_secs(15 * 60),
        }
    }
}

/// Async mutexes keyed by string, dropped once nobody holds them
#[derive(Clone, Default)]
struct KeyedLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

/// Held lock; removes its map entry on drop when no one else wants it
struct KeyGuard {
    guard: Option<OwnedMutexGuard<()>>,
    key: String,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    async fn lock(&self, key: &str) -> KeyGuard {
        let mutex = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        KeyGuard {
            guard: Some(mutex.lock_owned().await),
            key: key.to_string(),
            locks: self.locks.clone(),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.len()
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

/// Idempotency key for the hold of a session
pub fn hold_idempotency_key(token: &str) -> String {
    format!("hold:{}", token)
}

/// Idempotency key for the direct charge of an overrun
pub fn charge_idempotency_key(token: &str) -> String {
    format!("fin:{}", token)
}

fn describe_hint(hint: FinalizeHint) -> String {
    match hint {
        FinalizeHint::Used { amount_cents } => format!("used {} cents", amount_cents),
        FinalizeHint::Cancelled => "cancelled".to_string(),
    }
}

#[derive(Clone)]
pub struct LifecycleEngine {
    store: Arc<dyn SessionStore>,
    processor: Arc<dyn PaymentProcessor>,
    bus: Arc<dyn Publisher>,
    locks: KeyedLocks,
    events: broadcast::Sender<SessionEvent>,
    settings: EngineSettings,
}

impl LifecycleEngine {
    /// Create a new lifecycle engine
    pub fn new(
        store: Arc<dyn SessionStore>,
        processor: Arc<dyn PaymentProcessor>,
        bus: Arc<dyn Publisher>,
        settings: EngineSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            store,
            processor,
            bus,
            locks: KeyedLocks::default(),
            events,
            settings,
        }
    }

    /// Transitions as they are persisted
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub async fn get(&self, token: &str) -> LifecycleResult<Session> {
        self.store.get(token).await?.ok_or(LifecycleError::NotFound)
    }

    pub async fn find_by_booking(&self, booking_id: &str) -> LifecycleResult<Option<Session>> {
        Ok(self.store.find_by_booking_id(booking_id).await?)
    }

    pub async fn list(&self, filter: &SessionFilter) -> LifecycleResult<Vec<Session>> {
        Ok(self.store.list(filter).await?)
    }

    pub async fn audit_trail(&self, token: &str) -> LifecycleResult<Vec<AuditEntry>> {
        Ok(self.store.audit_trail(token).await?)
    }

    /// Open a session on a charger
    pub async fn create_session(&self, new: NewSession) -> LifecycleResult<Session> {
        validate_identifier("home_id", &new.home_id).map_err(LifecycleError::InvalidInput)?;
        validate_identifier("charger_id", &new.charger_id).map_err(LifecycleError::InvalidInput)?;
        validate_amount(new.amount_cents).map_err(LifecycleError::InvalidInput)?;
        if new.booking_id.as_ref().is_some_and(|b| b.trim().is_empty()) {
            return Err(LifecycleError::InvalidInput("booking_id must not be empty".to_string()));
        }

        let charger_key = format!("charger:{}/{}", new.home_id, new.charger_id);
        let _charger_guard = self.locks.lock(&charger_key).await;

        if let Some(open) = self.store.find_open(&new.home_id, &new.charger_id).await? {
            self.expire_if_abandoned(open).await?;
        }

        let session = Session::new(new);
        self.store.put(&session).await.map_err(|e| match e {
            DatabaseError::Conflict(_) => LifecycleError::Conflict {
                charger_id: session.charger_id.clone(),
            },
            other => LifecycleError::Store(other),
        })?;
        self.audit(&session, "guest", "create", None, None).await;
        self.emit(&session);

        info!(
            session = session.log_id(),
            home_id = %session.home_id,
            charger_id = %session.charger_id,
            booking_id = ?session.booking_id,
            amount_cents = session.amount_cents,
            "Session created"
        );
        Ok(session)
    }

    /// Expire a stale `requested` session, or report the charger as taken
    async fn expire_if_abandoned(&self, open: Session) -> LifecycleResult<()> {
        let conflict = || LifecycleError::Conflict {
            charger_id: open.charger_id.clone(),
        };
        if open.state != SessionState::Requested || !self.is_abandoned(&open) {
            return Err(conflict());
        }

        let _guard = self.locks.lock(&open.token).await;
        let mut current = self.load(&open.token).await?;
        if current.state != SessionState::Requested {
            return Err(conflict());
        }

        current.last_error = Some("expired".to_string());
        self.commit(&mut current, SessionState::AuthFailed, "system", "expire", Some("expired"))
            .await?;
        info!(session = current.log_id(), "Expired abandoned session");
        Ok(())
    }

    fn is_abandoned(&self, session: &Session) -> bool {
        let age = Utc::now().signed_duration_since(session.updated_at);
        age.to_std().is_ok_and(|age| age > self.settings.pending_ttl)
    }

    /// Place the payment hold for a session
    pub async fn authorize(&self, token: &str, source: PaymentSource) -> LifecycleResult<AuthorizeOutcome> {
        source.validate().map_err(LifecycleError::InvalidInput)?;

        let _guard = self.locks.lock(token).await;
        let mut session = self.load(token).await?;

        match session.state {
            SessionState::Requested => {
                self.commit(&mut session, SessionState::Authorizing, "guest", "authorize_started", None)
                    .await?;
            }
            SessionState::Authorizing => {
                info!(session = session.log_id(), "Retrying authorization");
            }
            SessionState::AuthFailed => {
                let reason = session
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "declined".to_string());
                return Ok(AuthorizeOutcome::Declined { reason });
            }
            _ => return Ok(AuthorizeOutcome::Authorized(session)),
        }

        let request = HoldRequest {
            amount_cents: session.amount_cents,
            source,
            idempotency_key: hold_idempotency_key(&session.token),
            reference: session
                .booking_id
                .clone()
                .unwrap_or_else(|| session.token.clone()),
        };

        match self.bounded(self.processor.authorize(&request)).await {
            Ok(hold) => {
                session.hold_id = Some(hold.hold_id);
                session.customer_id = hold.card.customer_id;
                session.card_id = hold.card.card_id;
                session.card_brand = hold.card.brand;
                session.card_last4 = hold.card.last4;
                session.last_error = None;
                self.commit(&mut session, SessionState::Authorized, "processor", "authorized", None)
                    .await?;
                info!(session = session.log_id(), hold_id = ?session.hold_id, "Hold placed");
                Ok(AuthorizeOutcome::Authorized(session))
            }
            Err(PaymentError::Declined(reason)) => {
                session.last_error = Some(reason.clone());
                self.commit(&mut session, SessionState::AuthFailed, "processor", "declined", Some(&reason))
                    .await?;
                warn!(session = session.log_id(), "Hold declined: {}", reason);
                Ok(AuthorizeOutcome::Declined { reason })
            }
            Err(PaymentError::Unavailable(reason)) => {
                self.record_error(&mut session, &reason).await;
                Err(LifecycleError::ProcessorUnavailable(reason))
            }
        }
    }

    /// Ask the automation layer to enable the charger
    pub async fn request_activation(&self, token: &str) -> LifecycleResult<Session> {
        let _guard = self.locks.lock(token).await;
        let session = self.load(token).await?;

        match session.state {
            SessionState::Authorized => {}
            SessionState::Active => return Ok(session),
            state => {
                return Err(LifecycleError::InvalidState {
                    state,
                    operation: "request activation of",
                });
            }
        }

        let payload = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "home_id": session.home_id,
            "charger_id": session.charger_id,
            "booking_id": session.booking_id,
            "session_token": session.token,
            "payment_id": session.hold_id,
            "amount_cents": session.amount_cents,
        });
        let topic = topics::topic(&session.home_id, &session.charger_id, TopicKind::AuthorizeSession);
        self.bus.publish(&topic, &payload).await.map_err(|e| {
            error!(session = session.log_id(), "Hold placed but charger not notified: {}", e);
            e
        })?;

        self.audit(&session, "engine", "activation_requested", None, None).await;
        info!(session = session.log_id(), topic = %topic, "Activation requested");
        Ok(session)
    }

    /// Record that the charger accepted the session
    pub async fn mark_active(&self, token: &str) -> LifecycleResult<Session> {
        let _guard = self.locks.lock(token).await;
        let mut session = self.load(token).await?;

        match session.state {
            SessionState::Authorized => {
                self.commit(&mut session, SessionState::Active, "charger", "activated", None)
                    .await?;
                Ok(session)
            }
            SessionState::Active
            | SessionState::Finalizing
            | SessionState::SettleFailed
            | SessionState::Captured
            | SessionState::Voided => Ok(session),
            state => Err(LifecycleError::InvalidState {
                state,
                operation: "activate",
            }),
        }
    }

    /// Capture or void the hold
    ///
    /// The first accepted hint is persisted and wins: a retry while
    /// `finalizing` re-executes the stored hint, and a call on a finished
    /// session returns it unchanged. After the processor refused a
    /// settlement (`settle_failed`) the new hint replaces the stored one.
    pub async fn finalize(&self, token: &str, hint: FinalizeHint, actor: &str) -> LifecycleResult<Session> {
        if let FinalizeHint::Used { amount_cents } = hint {
            validate_final_amount(amount_cents).map_err(LifecycleError::InvalidInput)?;
        }

        let _guard = self.locks.lock(token).await;
        let mut session = self.load(token).await?;

        let hint = match session.state {
            SessionState::Captured | SessionState::Voided => {
                info!(session = session.log_id(), state = %session.state, "Already finalized");
                return Ok(session);
            }
            SessionState::Finalizing => session.finalize_hint.unwrap_or(hint),
            SessionState::Authorized | SessionState::Active => {
                session.finalize_hint = Some(hint);
                self.commit(
                    &mut session,
                    SessionState::Finalizing,
                    actor,
                    "finalize_started",
                    Some(&describe_hint(hint)),
                )
                .await?;
                hint
            }
            // Retried off the charger: a newer session may already hold it
            SessionState::SettleFailed => {
                session.finalize_hint = Some(hint);
                self.store.put(&session).await?;
                self.audit(&session, actor, "finalize_retry", Some(&describe_hint(hint)), Some(session.state))
                    .await;
                hint
            }
            state => {
                return Err(LifecycleError::InvalidState {
                    state,
                    operation: "finalize",
                });
            }
        };

        self.settle(&mut session, hint, actor).await?;
        Ok(session)
    }

    async fn settle(&self, session: &mut Session, hint: FinalizeHint, actor: &str) -> LifecycleResult<()> {
        let hold_id = session.hold_id.clone().ok_or(LifecycleError::InvalidState {
            state: session.state,
            operation: "settle without a hold",
        })?;

        let outcome = match hint.decide(session.amount_cents) {
            Settle::Void => self
                .bounded(self.processor.void(&hold_id))
                .await
                .map(|s| (SessionState::Voided, s)),
            Settle::Capture(amount) => self
                .bounded(self.processor.capture(&hold_id, amount))
                .await
                .map(|s| (SessionState::Captured, s)),
            Settle::Overcharge(amount) => self
                .settle_overcharge(session, &hold_id, amount)
                .await
                .map(|s| (SessionState::Captured, s)),
        };

        match outcome {
            Ok((next, settlement)) => {
                session.settlement_id = Some(settlement.payment_id);
                session.captured_amount_cents = Some(settlement.amount_cents);
                session.last_error = None;
                self.commit(session, next, actor, next.as_str(), None).await?;
                info!(
                    session = session.log_id(),
                    state = %next,
                    amount_cents = settlement.amount_cents,
                    "Session finalized"
                );
                Ok(())
            }
            // Refused outright: free the charger and leave it to an operator
            Err(PaymentError::Declined(reason)) => {
                warn!(session = session.log_id(), "Settlement declined: {}", reason);
                session.last_error = Some(reason.clone());
                self.commit(session, SessionState::SettleFailed, actor, "settle_failed", Some(&reason))
                    .await?;
                Err(LifecycleError::ProcessorDeclined(reason))
            }
            Err(e) => {
                warn!(session = session.log_id(), "Finalize failed: {}", e);
                self.record_error(session, &e.to_string()).await;
                Err(e.into())
            }
        }
    }

    /// Release the hold and charge the card on file for the full amount
    async fn settle_overcharge(
        &self,
        session: &Session,
        hold_id: &str,
        amount_cents: i64,
    ) -> PaymentResult<Settlement> {
        let (Some(card_id), Some(customer_id)) = (session.card_id.clone(), session.customer_id.clone())
        else {
            warn!(
                session = session.log_id(),
                amount_cents, "No card on file for overrun, capturing the hold amount"
            );
            return self
                .bounded(self.processor.capture(hold_id, session.amount_cents))
                .await;
        };

        if let Err(e) = self.bounded(self.processor.void(hold_id)).await {
            warn!(session = session.log_id(), "Could not release hold before overrun charge: {}", e);
        }

        let request = ChargeRequest {
            card_id,
            customer_id,
            amount_cents,
            idempotency_key: charge_idempotency_key(&session.token),
            reference: session
                .booking_id
                .clone()
                .unwrap_or_else(|| session.token.clone()),
        };
        self.bounded(self.processor.charge(&request)).await
    }

    /// Attach an operator note
    pub async fn annotate(&self, token: &str, note: &str, actor: &str) -> LifecycleResult<Session> {
        validate_note(note).map_err(LifecycleError::InvalidInput)?;
        if !self.store.set_note(token, note).await? {
            return Err(LifecycleError::NotFound);
        }
        let session = self.get(token).await?;
        self.audit(&session, actor, "note", Some(note), None).await;
        Ok(session)
    }

    /// Hide a session from the default listing
    pub async fn soft_delete(&self, token: &str, actor: &str) -> LifecycleResult<Session> {
        if !self.store.soft_delete(token).await? {
            return Err(LifecycleError::NotFound);
        }
        let session = self.get(token).await?;
        self.audit(&session, actor, "soft_delete", None, None).await;
        Ok(session)
    }

    async fn load(&self, token: &str) -> LifecycleResult<Session> {
        self.store.get(token).await?.ok_or(LifecycleError::NotFound)
    }

    async fn bounded<T>(&self, call: impl Future<Output = PaymentResult<T>>) -> PaymentResult<T> {
        tokio::time::timeout(self.settings.processor_timeout, call)
            .await
            .unwrap_or_else(|_| {
                Err(PaymentError::Unavailable(format!(
                    "no response within {:?}",
                    self.settings.processor_timeout
                )))
            })
    }

    /// Persist and audit a transition, then announce it
    async fn commit(
        &self,
        session: &mut Session,
        next: SessionState,
        actor: &str,
        action: &str,
        reason: Option<&str>,
    ) -> LifecycleResult<()> {
        let before = session.state;
        session.state = next;
        session.updated_at = Utc::now();
        self.store.put(session).await?;
        self.audit(session, actor, action, reason, Some(before)).await;
        self.emit(session);

        info!(session = session.log_id(), from = %before, to = %next, actor, "Session transition");
        Ok(())
    }

    /// Keep the failure on the record without changing state
    async fn record_error(&self, session: &mut Session, reason: &str) {
        session.last_error = Some(reason.to_string());
        session.updated_at = Utc::now();
        if let Err(e) = self.store.put(session).await {
            error!(session = session.log_id(), "Failed to record error: {}", e);
        }
    }

    async fn audit(
        &self,
        session: &Session,
        actor: &str,
        action: &str,
        reason: Option<&str>,
        before: Option<SessionState>,
    ) {
        let record = AuditRecord {
            actor: actor.to_string(),
            action: action.to_string(),
            token: session.token.clone(),
            reason: reason.map(str::to_string),
            before_state: before,
            after_state: Some(session.state),
        };
        if let Err(e) = self.store.append_audit(&record).await {
            error!(session = short_token(&session.token), "Failed to write audit entry: {}", e);
        }
    }

    fn emit(&self, session: &Session) {
        // No receivers is fine
        let _ = self.events.send(SessionEvent {
            token: session.token.clone(),
            state: session.state,
        });
    }
}
