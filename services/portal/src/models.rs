//! Session records, audit entries and the views served over HTTP

use chrono::{DateTime, Utc};
use rand::{Rng, distributions::Alphanumeric};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Length of a generated session token
pub const TOKEN_LEN: usize = 32;

/// Lifecycle state of a charging session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Requested,
    Authorizing,
    Authorized,
    Active,
    Finalizing,
    /// The processor refused the capture or void; an operator settles it
    SettleFailed,
    AuthFailed,
    Captured,
    Voided,
}

impl SessionState {
    /// States that hold the charger
    pub const OPEN: [SessionState; 5] = [
        SessionState::Requested,
        SessionState::Authorizing,
        SessionState::Authorized,
        SessionState::Active,
        SessionState::Finalizing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Requested => "requested",
            SessionState::Authorizing => "authorizing",
            SessionState::Authorized => "authorized",
            SessionState::Active => "active",
            SessionState::Finalizing => "finalizing",
            SessionState::SettleFailed => "settle_failed",
            SessionState::AuthFailed => "auth_failed",
            SessionState::Captured => "captured",
            SessionState::Voided => "voided",
        }
    }

    pub fn is_open(&self) -> bool {
        Self::OPEN.contains(self)
    }

    /// Terminal states never change again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::AuthFailed | SessionState::Captured | SessionState::Voided
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "requested" => Ok(SessionState::Requested),
            "authorizing" => Ok(SessionState::Authorizing),
            "authorized" => Ok(SessionState::Authorized),
            "active" => Ok(SessionState::Active),
            "finalizing" => Ok(SessionState::Finalizing),
            "settle_failed" => Ok(SessionState::SettleFailed),
            "auth_failed" => Ok(SessionState::AuthFailed),
            "captured" => Ok(SessionState::Captured),
            "voided" => Ok(SessionState::Voided),
            other => Err(format!("Unknown session state: {}", other)),
        }
    }
}

/// How a session ended, as reported by the charger or an operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FinalizeHint {
    Used { amount_cents: i64 },
    Cancelled,
}

/// Settlement chosen for a hint against the held amount
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settle {
    Void,
    Capture(i64),
    /// Final amount exceeds the hold
    Overcharge(i64),
}

impl FinalizeHint {
    /// Build a hint from a reported final amount; zero means nothing was used
    pub fn from_final_amount(amount_cents: i64) -> Self {
        if amount_cents == 0 {
            FinalizeHint::Cancelled
        } else {
            FinalizeHint::Used { amount_cents }
        }
    }

    pub fn decide(&self, held_cents: i64) -> Settle {
        match *self {
            FinalizeHint::Cancelled | FinalizeHint::Used { amount_cents: 0 } => Settle::Void,
            FinalizeHint::Used { amount_cents } if amount_cents <= held_cents => {
                Settle::Capture(amount_cents)
            }
            FinalizeHint::Used { amount_cents } => Settle::Overcharge(amount_cents),
        }
    }
}

/// A charging session record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub token: String,
    pub home_id: String,
    pub charger_id: String,
    pub booking_id: Option<String>,
    pub amount_cents: i64,
    pub state: SessionState,
    pub hold_id: Option<String>,
    pub customer_id: Option<String>,
    pub card_id: Option<String>,
    pub card_brand: Option<String>,
    pub card_last4: Option<String>,
    pub finalize_hint: Option<FinalizeHint>,
    pub settlement_id: Option<String>,
    pub captured_amount_cents: Option<i64>,
    pub last_error: Option<String>,
    pub note: Option<String>,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Create a fresh `requested` session with a new token
    pub fn new(new: NewSession) -> Self {
        let now = Utc::now();
        Self {
            token: generate_token(),
            home_id: new.home_id,
            charger_id: new.charger_id,
            booking_id: new.booking_id,
            amount_cents: new.amount_cents,
            state: SessionState::Requested,
            hold_id: None,
            customer_id: None,
            card_id: None,
            card_brand: None,
            card_last4: None,
            finalize_hint: None,
            settlement_id: None,
            captured_amount_cents: None,
            last_error: None,
            note: None,
            is_deleted: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Token prefix safe to print in logs
    pub fn log_id(&self) -> &str {
        short_token(&self.token)
    }
}

/// First characters of a token, for log lines
pub fn short_token(token: &str) -> &str {
    token.get(..8).unwrap_or(token)
}

fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}

/// Input for creating a session
#[derive(Debug, Clone)]
pub struct NewSession {
    pub home_id: String,
    pub charger_id: String,
    pub amount_cents: i64,
    pub booking_id: Option<String>,
}

/// Fields of a session that are safe to show the guest holding the token
#[derive(Debug, Serialize)]
pub struct SessionView {
    pub session_token: String,
    pub home_id: String,
    pub charger_id: String,
    pub booking_id: Option<String>,
    pub state: SessionState,
    pub amount_cents: i64,
    pub captured_amount_cents: Option<i64>,
    pub card_brand: Option<String>,
    pub card_last4: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Session> for SessionView {
    fn from(session: &Session) -> Self {
        Self {
            session_token: session.token.clone(),
            home_id: session.home_id.clone(),
            charger_id: session.charger_id.clone(),
            booking_id: session.booking_id.clone(),
            state: session.state,
            amount_cents: session.amount_cents,
            captured_amount_cents: session.captured_amount_cents,
            card_brand: session.card_brand.clone(),
            card_last4: session.card_last4.clone(),
            created_at: session.created_at,
            updated_at: session.updated_at,
        }
    }
}

/// Broadcast after every persisted transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub token: String,
    pub state: SessionState,
}

/// An audit entry to append
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub actor: String,
    pub action: String,
    pub token: String,
    pub reason: Option<String>,
    pub before_state: Option<SessionState>,
    pub after_state: Option<SessionState>,
}

/// A stored audit entry
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub id: i64,
    pub ts: DateTime<Utc>,
    pub actor: String,
    pub action: String,
    pub token: String,
    pub reason: Option<String>,
    pub before_state: Option<String>,
    pub after_state: Option<String>,
}

/// Filter for the admin session listing
#[derive(Debug, Clone)]
pub struct SessionFilter {
    pub state: Option<SessionState>,
    pub limit: u32,
    pub offset: u32,
    pub include_deleted: bool,
}

impl Default for SessionFilter {
    fn default() -> Self {
        Self {
            state: None,
            limit: 50,
            offset: 0,
            include_deleted: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_strings_parse_back() {
        for state in [
            SessionState::Requested,
            SessionState::Authorizing,
            SessionState::Authorized,
            SessionState::Active,
            SessionState::Finalizing,
            SessionState::AuthFailed,
            SessionState::Captured,
            SessionState::Voided,
        ] {
            assert_eq!(state.as_str().parse::<SessionState>(), Ok(state));
            assert_eq!(state.is_terminal(), !state.is_open());
        }
        assert!("pending".parse::<SessionState>().is_err());
    }

    #[test]
    fn test_settle_failed_frees_charger_but_can_retry() {
        let state: SessionState = "settle_failed".parse().unwrap();
        assert_eq!(state, SessionState::SettleFailed);
        assert!(!state.is_open());
        assert!(!state.is_terminal());
    }

    #[test]
    fn test_finalize_hint_decision() {
        assert_eq!(FinalizeHint::Cancelled.decide(100), Settle::Void);
        assert_eq!(FinalizeHint::Used { amount_cents: 0 }.decide(100), Settle::Void);
        assert_eq!(FinalizeHint::Used { amount_cents: 40 }.decide(100), Settle::Capture(40));
        assert_eq!(FinalizeHint::Used { amount_cents: 100 }.decide(100), Settle::Capture(100));
        assert_eq!(
            FinalizeHint::Used { amount_cents: 130 }.decide(100),
            Settle::Overcharge(130)
        );
        assert_eq!(FinalizeHint::from_final_amount(0), FinalizeHint::Cancelled);
        assert_eq!(
            FinalizeHint::from_final_amount(75),
            FinalizeHint::Used { amount_cents: 75 }
        );
    }

    #[test]
    fn test_finalize_hint_json_shape() {
        let used = serde_json::to_string(&FinalizeHint::Used { amount_cents: 75 }).unwrap();
        assert_eq!(used, r#"{"outcome":"used","amount_cents":75}"#);
        let cancelled = serde_json::to_string(&FinalizeHint::Cancelled).unwrap();
        assert_eq!(cancelled, r#"{"outcome":"cancelled"}"#);
    }

    #[test]
    fn test_new_session_token() {
        let session = Session::new(NewSession {
            home_id: "h1".into(),
            charger_id: "c1".into(),
            amount_cents: 100,
            booking_id: None,
        });
        assert_eq!(session.token.len(), TOKEN_LEN);
        assert!(session.token.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(session.state, SessionState::Requested);
        assert_eq!(session.log_id().len(), 8);
        assert_eq!(short_token("abc"), "abc");
    }
}
