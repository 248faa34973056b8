//! SQLite-backed session store

use async_trait::async_trait;
use chrono::Utc;
use common::error::{DatabaseError, DatabaseResult};
use sqlx::sqlite::SqliteRow;
use sqlx::types::Json;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::info;

use super::SessionStore;
use crate::models::{AuditEntry, AuditRecord, FinalizeHint, Session, SessionFilter};

const SESSION_COLUMNS: &str = "token, home_id, charger_id, booking_id, amount_cents, state, \
     hold_id, customer_id, card_id, card_brand, card_last4, finalize_hint, settlement_id, \
     captured_amount_cents, last_error, note, is_deleted, created_at, updated_at";

/// Columns added after the first schema, with their definitions
const ADDED_COLUMNS: [(&str, &str); 3] = [
    ("last_error", "TEXT"),
    ("note", "TEXT"),
    ("is_deleted", "INTEGER NOT NULL DEFAULT 0"),
];

/// Session repository for database operations
#[derive(Clone)]
pub struct SqliteSessionStore {
    pool: SqlitePool,
}

impl SqliteSessionStore {
    /// Create a new session store
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create tables and indexes, and add columns missing from older files
    pub async fn init_schema(&self) -> DatabaseResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                token TEXT PRIMARY KEY,
                home_id TEXT NOT NULL,
                charger_id TEXT NOT NULL,
                booking_id TEXT,
                amount_cents INTEGER NOT NULL,
                state TEXT NOT NULL,
                hold_id TEXT,
                customer_id TEXT,
                card_id TEXT,
                card_brand TEXT,
                card_last4 TEXT,
                finalize_hint TEXT,
                settlement_id TEXT,
                captured_amount_cents INTEGER,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| DatabaseError::Migration(format!("create sessions: {}", e)))?;

        let existing: Vec<String> =
            sqlx::query_scalar("SELECT name FROM pragma_table_info('sessions')")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| DatabaseError::Migration(format!("inspect sessions: {}", e)))?;

        for (column, definition) in ADDED_COLUMNS {
            if !existing.iter().any(|c| c == column) {
                info!("Adding column sessions.{}", column);
                sqlx::query(&format!(
                    "ALTER TABLE sessions ADD COLUMN {} {}",
                    column, definition
                ))
                .execute(&self.pool)
                .await
                .map_err(|e| DatabaseError::Migration(format!("add {}: {}", column, e)))?;
            }
        }

        let statements = [
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_open_charger
            ON sessions (home_id, charger_id)
            WHERE state IN ('requested', 'authorizing', 'authorized', 'active', 'finalizing')
            "#,
            "CREATE INDEX IF NOT EXISTS idx_sessions_booking ON sessions (booking_id)",
            "CREATE INDEX IF NOT EXISTS idx_sessions_created ON sessions (created_at)",
            r#"
            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts TEXT NOT NULL,
                actor TEXT NOT NULL,
                action TEXT NOT NULL,
                token TEXT NOT NULL,
                reason TEXT,
                before_state TEXT,
                after_state TEXT
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_audit_log_token ON audit_log (token)",
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        }

        Ok(())
    }
}

fn session_from_row(row: &SqliteRow) -> DatabaseResult<Session> {
    let state: String = row.try_get("state").map_err(DatabaseError::Query)?;
    let hint: Option<Json<FinalizeHint>> =
        row.try_get("finalize_hint").map_err(DatabaseError::Query)?;

    Ok(Session {
        token: row.try_get("token").map_err(DatabaseError::Query)?,
        home_id: row.try_get("home_id").map_err(DatabaseError::Query)?,
        charger_id: row.try_get("charger_id").map_err(DatabaseError::Query)?,
        booking_id: row.try_get("booking_id").map_err(DatabaseError::Query)?,
        amount_cents: row.try_get("amount_cents").map_err(DatabaseError::Query)?,
        state: state.parse().map_err(DatabaseError::Decode)?,
        hold_id: row.try_get("hold_id").map_err(DatabaseError::Query)?,
        customer_id: row.try_get("customer_id").map_err(DatabaseError::Query)?,
        card_id: row.try_get("card_id").map_err(DatabaseError::Query)?,
        card_brand: row.try_get("card_brand").map_err(DatabaseError::Query)?,
        card_last4: row.try_get("card_last4").map_err(DatabaseError::Query)?,
        finalize_hint: hint.map(|Json(h)| h),
        settlement_id: row.try_get("settlement_id").map_err(DatabaseError::Query)?,
        captured_amount_cents: row
            .try_get("captured_amount_cents")
            .map_err(DatabaseError::Query)?,
        last_error: row.try_get("last_error").map_err(DatabaseError::Query)?,
        note: row.try_get("note").map_err(DatabaseError::Query)?,
        is_deleted: row.try_get("is_deleted").map_err(DatabaseError::Query)?,
        created_at: row.try_get("created_at").map_err(DatabaseError::Query)?,
        updated_at: row.try_get("updated_at").map_err(DatabaseError::Query)?,
    })
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn get(&self, token: &str) -> DatabaseResult<Option<Session>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM sessions WHERE token = ?",
            SESSION_COLUMNS
        ))
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::Query)?;

        row.as_ref().map(session_from_row).transpose()
    }

    async fn put(&self, session: &Session) -> DatabaseResult<()> {
        // Note and soft-delete flag belong to the admin and are only set on insert
        sqlx::query(
            r#"
            INSERT INTO sessions (
                token, home_id, charger_id, booking_id, amount_cents, state,
                hold_id, customer_id, card_id, card_brand, card_last4, finalize_hint,
                settlement_id, captured_amount_cents, last_error, note, is_deleted,
                created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(token) DO UPDATE SET
                booking_id = excluded.booking_id,
                amount_cents = excluded.amount_cents,
                state = excluded.state,
                hold_id = excluded.hold_id,
                customer_id = excluded.customer_id,
                card_id = excluded.card_id,
                card_brand = excluded.card_brand,
                card_last4 = excluded.card_last4,
                finalize_hint = excluded.finalize_hint,
                settlement_id = excluded.settlement_id,
                captured_amount_cents = excluded.captured_amount_cents,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at
            WHERE sessions.state NOT IN ('auth_failed', 'captured', 'voided')
            "#,
        )
        .bind(&session.token)
        .bind(&session.home_id)
        .bind(&session.charger_id)
        .bind(&session.booking_id)
        .bind(session.amount_cents)
        .bind(session.state.as_str())
        .bind(&session.hold_id)
        .bind(&session.customer_id)
        .bind(&session.card_id)
        .bind(&session.card_brand)
        .bind(&session.card_last4)
        .bind(session.finalize_hint.map(Json))
        .bind(&session.settlement_id)
        .bind(session.captured_amount_cents)
        .bind(&session.last_error)
        .bind(&session.note)
        .bind(session.is_deleted)
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_query)?;

        Ok(())
    }

    async fn find_by_booking_id(&self, booking_id: &str) -> DatabaseResult<Option<Session>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM sessions WHERE booking_id = ? ORDER BY updated_at DESC LIMIT 1",
            SESSION_COLUMNS
        ))
        .bind(booking_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::Query)?;

        row.as_ref().map(session_from_row).transpose()
    }

    async fn find_open(&self, home_id: &str, charger_id: &str) -> DatabaseResult<Option<Session>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {} FROM sessions
            WHERE home_id = ? AND charger_id = ?
              AND state IN ('requested', 'authorizing', 'authorized', 'active', 'finalizing')
            LIMIT 1
            "#,
            SESSION_COLUMNS
        ))
        .bind(home_id)
        .bind(charger_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::Query)?;

        row.as_ref().map(session_from_row).transpose()
    }

    async fn list(&self, filter: &SessionFilter) -> DatabaseResult<Vec<Session>> {
        let mut query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM sessions WHERE 1 = 1",
            SESSION_COLUMNS
        ));
        if !filter.include_deleted {
            query.push(" AND is_deleted = 0");
        }
        if let Some(state) = filter.state {
            query.push(" AND state = ").push_bind(state.as_str());
        }
        query
            .push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(i64::from(filter.limit))
            .push(" OFFSET ")
            .push_bind(i64::from(filter.offset));

        let rows = query
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::Query)?;

        rows.iter().map(session_from_row).collect()
    }

    async fn set_note(&self, token: &str, note: &str) -> DatabaseResult<bool> {
        // Admin edits leave updated_at alone so they never delay expiry
        let result = sqlx::query("UPDATE sessions SET note = ? WHERE token = ?")
            .bind(note)
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::Query)?;

        Ok(result.rows_affected() > 0)
    }

    async fn soft_delete(&self, token: &str) -> DatabaseResult<bool> {
        let result = sqlx::query("UPDATE sessions SET is_deleted = 1 WHERE token = ?")
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::Query)?;

        Ok(result.rows_affected() > 0)
    }

    async fn append_audit(&self, record: &AuditRecord) -> DatabaseResult<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (ts, actor, action, token, reason, before_state, after_state)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(Utc::now())
        .bind(&record.actor)
        .bind(&record.action)
        .bind(&record.token)
        .bind(&record.reason)
        .bind(record.before_state.map(|s| s.as_str()))
        .bind(record.after_state.map(|s| s.as_str()))
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::Query)?;

        Ok(())
    }

    async fn audit_trail(&self, token: &str) -> DatabaseResult<Vec<AuditEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, ts, actor, action, token, reason, before_state, after_state
            FROM audit_log
            WHERE token = ?
            ORDER BY id ASC
            "#,
        )
        .bind(token)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::Query)?;

        let entries = rows
            .into_iter()
            .map(|row| AuditEntry {
                id: row.get("id"),
                ts: row.get("ts"),
                actor: row.get("actor"),
                action: row.get("action"),
                token: row.get("token"),
                reason: row.get("reason"),
                before_state: row.get("before_state"),
                after_state: row.get("after_state"),
            })
            .collect();

        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewSession, SessionState};
    use common::database::{DatabaseConfig, init_pool};

    async fn store() -> SqliteSessionStore {
        let pool = init_pool(&DatabaseConfig::in_memory())
            .await
            .expect("in-memory pool");
        let store = SqliteSessionStore::new(pool);
        store.init_schema().await.expect("schema");
        store
    }

    fn session(charger_id: &str, booking_id: &str) -> Session {
        Session::new(NewSession {
            home_id: "h1".into(),
            charger_id: charger_id.into(),
            amount_cents: 100,
            booking_id: Some(booking_id.into()),
        })
    }

    #[tokio::test]
    async fn test_put_and_get_round_trip_with_hint() -> anyhow::Result<()> {
        let store = store().await;
        let mut s = session("c1", "b1");
        store.put(&s).await?;

        s.state = SessionState::Finalizing;
        s.hold_id = Some("H1".into());
        s.finalize_hint = Some(FinalizeHint::Used { amount_cents: 60 });
        store.put(&s).await?;

        let loaded = store.get(&s.token).await?.expect("stored");
        assert_eq!(loaded.state, SessionState::Finalizing);
        assert_eq!(loaded.hold_id.as_deref(), Some("H1"));
        assert_eq!(loaded.finalize_hint, Some(FinalizeHint::Used { amount_cents: 60 }));
        assert!(store.get("missing").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_open_sessions_are_unique_per_charger() -> anyhow::Result<()> {
        let store = store().await;
        let first = session("c1", "b1");
        store.put(&first).await?;

        let second = session("c1", "b2");
        let err = store.put(&second).await.expect_err("second open session");
        assert!(matches!(err, DatabaseError::Conflict(_)), "got {err:?}");

        // Other chargers are independent
        store.put(&session("c2", "b3")).await?;

        // Once the first is terminal the charger is free again
        let mut done = first.clone();
        done.state = SessionState::Voided;
        store.put(&done).await?;
        store.put(&second).await?;

        let open = store.find_open("h1", "c1").await?.expect("open session");
        assert_eq!(open.token, second.token);

        // A refused settlement does not hold the charger either
        let mut refused = second.clone();
        refused.state = SessionState::SettleFailed;
        store.put(&refused).await?;
        assert!(store.find_open("h1", "c1").await?.is_none());
        store.put(&session("c1", "b4")).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_terminal_records_are_not_overwritten() -> anyhow::Result<()> {
        let store = store().await;
        let mut s = session("c1", "b1");
        s.state = SessionState::Captured;
        s.captured_amount_cents = Some(80);
        store.put(&s).await?;

        let mut stale = s.clone();
        stale.state = SessionState::Active;
        stale.captured_amount_cents = None;
        store.put(&stale).await?;

        let loaded = store.get(&s.token).await?.expect("stored");
        assert_eq!(loaded.state, SessionState::Captured);
        assert_eq!(loaded.captured_amount_cents, Some(80));
        Ok(())
    }

    #[tokio::test]
    async fn test_note_and_soft_delete_survive_engine_writes() -> anyhow::Result<()> {
        let store = store().await;
        let mut s = session("c1", "b1");
        store.put(&s).await?;

        assert!(store.set_note(&s.token, "called the guest").await?);
        assert!(store.soft_delete(&s.token).await?);
        assert!(!store.set_note("missing", "x").await?);

        // The engine's copy has no note; writing it must not clear the admin fields
        s.state = SessionState::Authorizing;
        store.put(&s).await?;

        let loaded = store.get(&s.token).await?.expect("stored");
        assert_eq!(loaded.note.as_deref(), Some("called the guest"));
        assert!(loaded.is_deleted);
        assert_eq!(loaded.state, SessionState::Authorizing);
        Ok(())
    }

    #[tokio::test]
    async fn test_admin_edits_keep_updated_at() -> anyhow::Result<()> {
        let store = store().await;
        let s = session("c1", "b1");
        store.put(&s).await?;
        let before = store.get(&s.token).await?.expect("stored").updated_at;

        store.set_note(&s.token, "left a voicemail").await?;
        store.soft_delete(&s.token).await?;

        let loaded = store.get(&s.token).await?.expect("stored");
        assert_eq!(loaded.updated_at, before);
        assert_eq!(loaded.note.as_deref(), Some("left a voicemail"));
        Ok(())
    }

    #[tokio::test]
    async fn test_list_filters_and_booking_lookup() -> anyhow::Result<()> {
        let store = store().await;
        let mut a = session("c1", "b1");
        a.state = SessionState::Captured;
        store.put(&a).await?;
        let b = session("c2", "b2");
        store.put(&b).await?;
        let mut c = session("c3", "b3");
        c.state = SessionState::Voided;
        store.put(&c).await?;
        store.soft_delete(&c.token).await?;

        let all = store.list(&SessionFilter::default()).await?;
        assert_eq!(all.len(), 2);

        let with_deleted = store
            .list(&SessionFilter {
                include_deleted: true,
                ..SessionFilter::default()
            })
            .await?;
        assert_eq!(with_deleted.len(), 3);

        let captured = store
            .list(&SessionFilter {
                state: Some(SessionState::Captured),
                ..SessionFilter::default()
            })
            .await?;
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].token, a.token);

        let page = store
            .list(&SessionFilter {
                limit: 1,
                offset: 0,
                include_deleted: true,
                state: None,
            })
            .await?;
        assert_eq!(page.len(), 1);

        let found = store.find_by_booking_id("b2").await?.expect("by booking");
        assert_eq!(found.token, b.token);
        assert!(store.find_by_booking_id("nope").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_audit_trail_is_ordered() -> anyhow::Result<()> {
        let store = store().await;
        for (action, before, after) in [
            ("create", None, Some(SessionState::Requested)),
            (
                "authorize_started",
                Some(SessionState::Requested),
                Some(SessionState::Authorizing),
            ),
        ] {
            store
                .append_audit(&AuditRecord {
                    actor: "guest".into(),
                    action: action.into(),
                    token: "tok".into(),
                    reason: None,
                    before_state: before,
                    after_state: after,
                })
                .await?;
        }

        let trail = store.audit_trail("tok").await?;
        assert_eq!(trail.len(), 2);
        assert_eq!(trail[0].action, "create");
        assert_eq!(trail[0].before_state, None);
        assert_eq!(trail[1].after_state.as_deref(), Some("authorizing"));
        assert!(store.audit_trail("other").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_schema_adds_missing_columns() -> anyhow::Result<()> {
        let pool = init_pool(&DatabaseConfig::in_memory()).await?;
        sqlx::query(
            r#"
            CREATE TABLE sessions (
                token TEXT PRIMARY KEY,
                home_id TEXT NOT NULL,
                charger_id TEXT NOT NULL,
                booking_id TEXT,
                amount_cents INTEGER NOT NULL,
                state TEXT NOT NULL,
                hold_id TEXT,
                customer_id TEXT,
                card_id TEXT,
                card_brand TEXT,
                card_last4 TEXT,
                finalize_hint TEXT,
                settlement_id TEXT,
                captured_amount_cents INTEGER,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let store = SqliteSessionStore::new(pool);
        store.init_schema().await?;
        // Idempotent on a second run
        store.init_schema().await?;

        let s = session("c1", "b1");
        store.put(&s).await?;
        store.set_note(&s.token, "migrated").await?;
        let loaded = store.get(&s.token).await?.expect("stored");
        assert_eq!(loaded.note.as_deref(), Some("migrated"));
        assert!(!loaded.is_deleted);
        Ok(())
    }
}
