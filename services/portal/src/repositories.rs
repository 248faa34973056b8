//! Repositories for session persistence

use async_trait::async_trait;
use common::error::DatabaseResult;

use crate::models::{AuditEntry, AuditRecord, Session, SessionFilter};

#[cfg(test)]
pub mod memory;
pub mod session;

pub use session::SqliteSessionStore;

/// Durable storage for session records and their audit trail
///
/// `put` is an atomic upsert keyed by token. Records in a terminal state are
/// never overwritten, and a write that would leave two open sessions on the
/// same charger fails with `DatabaseError::Conflict`.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, token: &str) -> DatabaseResult<Option<Session>>;

    async fn put(&self, session: &Session) -> DatabaseResult<()>;

    /// Most recently updated session carrying this booking id
    async fn find_by_booking_id(&self, booking_id: &str) -> DatabaseResult<Option<Session>>;

    /// The non-terminal session holding this charger, if any
    async fn find_open(&self, home_id: &str, charger_id: &str) -> DatabaseResult<Option<Session>>;

    /// Newest first
    async fn list(&self, filter: &SessionFilter) -> DatabaseResult<Vec<Session>>;

    /// Returns false when the token is unknown
    async fn set_note(&self, token: &str, note: &str) -> DatabaseResult<bool>;

    /// Returns false when the token is unknown
    async fn soft_delete(&self, token: &str) -> DatabaseResult<bool>;

    async fn append_audit(&self, record: &AuditRecord) -> DatabaseResult<()>;

    /// Oldest first
    async fn audit_trail(&self, token: &str) -> DatabaseResult<Vec<AuditEntry>>;
}
