//! In-memory session store for unit tests

use async_trait::async_trait;
use chrono::Utc;
use common::error::{DatabaseError, DatabaseResult};
use std::collections::HashMap;
use tokio::sync::Mutex;

use super::SessionStore;
use crate::models::{AuditEntry, AuditRecord, Session, SessionFilter};

#[derive(Default)]
struct Tables {
    sessions: HashMap<String, Session>,
    audit: Vec<AuditEntry>,
}

/// Mirrors the SQLite store's constraints without a database
#[derive(Default)]
pub struct MemorySessionStore {
    tables: Mutex<Tables>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, token: &str) -> DatabaseResult<Option<Session>> {
        Ok(self.tables.lock().await.sessions.get(token).cloned())
    }

    async fn put(&self, session: &Session) -> DatabaseResult<()> {
        let mut tables = self.tables.lock().await;

        if session.state.is_open() {
            let clash = tables.sessions.values().any(|s| {
                s.token != session.token
                    && s.home_id == session.home_id
                    && s.charger_id == session.charger_id
                    && s.state.is_open()
            });
            if clash {
                return Err(DatabaseError::Conflict(format!(
                    "open session exists for {}/{}",
                    session.home_id, session.charger_id
                )));
            }
        }

        match tables.sessions.get_mut(&session.token) {
            Some(existing) if existing.state.is_terminal() => {}
            Some(existing) => {
                let note = existing.note.take();
                let is_deleted = existing.is_deleted;
                *existing = session.clone();
                existing.note = note;
                existing.is_deleted = is_deleted;
            }
            None => {
                tables.sessions.insert(session.token.clone(), session.clone());
            }
        }
        Ok(())
    }

    async fn find_by_booking_id(&self, booking_id: &str) -> DatabaseResult<Option<Session>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .sessions
            .values()
            .filter(|s| s.booking_id.as_deref() == Some(booking_id))
            .max_by_key(|s| s.updated_at)
            .cloned())
    }

    async fn find_open(&self, home_id: &str, charger_id: &str) -> DatabaseResult<Option<Session>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .sessions
            .values()
            .find(|s| s.home_id == home_id && s.charger_id == charger_id && s.state.is_open())
            .cloned())
    }

    async fn list(&self, filter: &SessionFilter) -> DatabaseResult<Vec<Session>> {
        let tables = self.tables.lock().await;
        let mut sessions: Vec<Session> = tables
            .sessions
            .values()
            .filter(|s| filter.include_deleted || !s.is_deleted)
            .filter(|s| filter.state.is_none_or(|state| s.state == state))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions
            .into_iter()
            .skip(filter.offset as usize)
            .take(filter.limit as usize)
            .collect())
    }

    async fn set_note(&self, token: &str, note: &str) -> DatabaseResult<bool> {
        let mut tables = self.tables.lock().await;
        Ok(match tables.sessions.get_mut(token) {
            Some(s) => {
                s.note = Some(note.to_string());
                true
            }
            None => false,
        })
    }

    async fn soft_delete(&self, token: &str) -> DatabaseResult<bool> {
        let mut tables = self.tables.lock().await;
        Ok(match tables.sessions.get_mut(token) {
            Some(s) => {
                s.is_deleted = true;
                true
            }
            None => false,
        })
    }

    async fn append_audit(&self, record: &AuditRecord) -> DatabaseResult<()> {
        let mut tables = self.tables.lock().await;
        let id = tables.audit.len() as i64 + 1;
        tables.audit.push(AuditEntry {
            id,
            ts: Utc::now(),
            actor: record.actor.clone(),
            action: record.action.clone(),
            token: record.token.clone(),
            reason: record.reason.clone(),
            before_state: record.before_state.map(|s| s.to_string()),
            after_state: record.after_state.map(|s| s.to_string()),
        });
        Ok(())
    }

    async fn audit_trail(&self, token: &str) -> DatabaseResult<Vec<AuditEntry>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .audit
            .iter()
            .filter(|e| e.token == token)
            .cloned()
            .collect())
    }
}
