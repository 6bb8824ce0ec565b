//! # PgStore
//!
//! Persistence of normalized login events and quarantined messages on top of PostgreSQL.
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use thiserror::Error;

use crate::login_event::NormalizedLoginEvent;
use crate::quarantine::QuarantineRecord;

/// Enumeration of errors for operations with a `LoginStore`.
/// Errors can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("{command} query timed out after {timeout:?}")]
    TimeoutError {
        command: String,
        timeout: time::Duration,
    },
}

/// The two writes the worker needs from a relational store.
#[async_trait]
pub trait LoginStore: Send + Sync {
    /// Insert a single login event in its own transaction.
    async fn insert_event(&self, event: &NormalizedLoginEvent) -> Result<(), PersistenceError>;

    /// Insert a single quarantine row in its own transaction, creating the quarantine table
    /// if it doesn't exist yet.
    async fn insert_quarantine(&self, record: &QuarantineRecord) -> Result<(), PersistenceError>;
}

const INSERT_LOGIN_EVENT: &str = r#"
INSERT INTO user_logins
    (user_id, device_type, masked_ip, masked_device_id, locale, app_version, create_date)
VALUES
    ($1, $2, $3, $4, $5, $6, $7)
"#;

const CREATE_QUARANTINE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS error_records (
    error_id serial PRIMARY KEY,
    error_message text,
    message jsonb,
    message_body jsonb,
    stage text
)
"#;

// Tables created before quarantine rows were tagged with a stage lack the column.
const ADD_QUARANTINE_STAGE_COLUMN: &str = r#"
ALTER TABLE error_records ADD COLUMN IF NOT EXISTS stage text
"#;

const INSERT_QUARANTINE_RECORD: &str = r#"
INSERT INTO error_records
    (error_message, message, message_body, stage)
VALUES
    ($1, $2, $3, $4)
"#;

/// A `LoginStore` backed by a PostgreSQL connection pool.
pub struct PgStore {
    pool: PgPool,
    /// Upper bound for every statement, transaction management included.
    statement_timeout: time::Duration,
    /// Set once the quarantine table is known to exist.
    quarantine_table_ready: AtomicBool,
}

pub type PgStoreResult<T> = std::result::Result<T, PersistenceError>;

impl PgStore {
    /// Connect to PostgreSQL. Unlike the rest of the API this fails fast: a worker that can't
    /// reach its store has nothing useful to do.
    pub async fn new(
        url: &str,
        max_connections: u32,
        statement_timeout: time::Duration,
    ) -> PgStoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(statement_timeout)
            .connect(url)
            .await
            .map_err(|error| PersistenceError::ConnectionError { error })?;

        Ok(Self::new_from_pool(pool, statement_timeout))
    }

    /// Initialize a `PgStore` from an existing pool.
    pub fn new_from_pool(pool: PgPool, statement_timeout: time::Duration) -> Self {
        Self {
            pool,
            statement_timeout,
            quarantine_table_ready: AtomicBool::new(false),
        }
    }

    /// Close every connection held by this store. Consumes the store so it can only happen once.
    pub async fn close(self) {
        self.pool.close().await;
    }

    async fn with_timeout<T, F>(&self, command: &str, future: F) -> PgStoreResult<T>
    where
        F: Future<Output = PgStoreResult<T>>,
    {
        tokio::time::timeout(self.statement_timeout, future)
            .await
            .map_err(|_| PersistenceError::TimeoutError {
                command: command.to_owned(),
                timeout: self.statement_timeout,
            })?
    }

    async fn insert_event_tx(&self, event: &NormalizedLoginEvent) -> PgStoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(|error| query_error("BEGIN", error))?;

        sqlx::query(INSERT_LOGIN_EVENT)
            .bind(&event.user_id)
            .bind(&event.device_type)
            .bind(&event.masked_ip)
            .bind(&event.masked_device_id)
            .bind(&event.locale)
            .bind(&event.app_version)
            .bind(event.create_date)
            .execute(&mut *tx)
            .await
            .map_err(|error| query_error("INSERT", error))?;

        tx.commit().await.map_err(|error| query_error("COMMIT", error))
    }

    async fn insert_quarantine_tx(&self, record: &QuarantineRecord) -> PgStoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(|error| query_error("BEGIN", error))?;

        let create_table = !self.quarantine_table_ready.load(Ordering::Relaxed);
        if create_table {
            sqlx::query(CREATE_QUARANTINE_TABLE)
                .execute(&mut *tx)
                .await
                .map_err(|error| query_error("CREATE TABLE", error))?;
            sqlx::query(ADD_QUARANTINE_STAGE_COLUMN)
                .execute(&mut *tx)
                .await
                .map_err(|error| query_error("ALTER TABLE", error))?;
        }

        sqlx::query(INSERT_QUARANTINE_RECORD)
            .bind(&record.error_message)
            .bind(Json(&record.message))
            .bind(record.message_body.as_ref().map(Json))
            .bind(record.stage.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|error| query_error("INSERT", error))?;

        tx.commit().await.map_err(|error| query_error("COMMIT", error))?;

        if create_table {
            self.quarantine_table_ready.store(true, Ordering::Relaxed);
        }

        Ok(())
    }
}

fn query_error(command: &str, error: sqlx::Error) -> PersistenceError {
    PersistenceError::QueryError {
        command: command.to_owned(),
        error,
    }
}

#[async_trait]
impl LoginStore for PgStore {
    async fn insert_event(&self, event: &NormalizedLoginEvent) -> PgStoreResult<()> {
        self.with_timeout("INSERT", self.insert_event_tx(event))
            .await
    }

    async fn insert_quarantine(&self, record: &QuarantineRecord) -> PgStoreResult<()> {
        self.with_timeout("INSERT", self.insert_quarantine_tx(record))
            .await
    }
}

/// In-memory `LoginStore` for tests. Always available, no conditional compilation needed.
#[derive(Default)]
pub struct MockLoginStore {
    events: Mutex<Vec<NormalizedLoginEvent>>,
    quarantined: Mutex<Vec<QuarantineRecord>>,
    max_app_version_length: Option<usize>,
    reject_events: Option<String>,
    reject_quarantine: Option<String>,
}

impl MockLoginStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject events whose `app_version` is longer than `length`, like a `varchar(length)`.
    pub fn with_max_app_version_length(mut self, length: usize) -> Self {
        self.max_app_version_length = Some(length);
        self
    }

    /// Reject every event insert with `reason`.
    pub fn reject_events(mut self, reason: &str) -> Self {
        self.reject_events = Some(reason.to_owned());
        self
    }

    /// Reject every quarantine insert with `reason`.
    pub fn reject_quarantine(mut self, reason: &str) -> Self {
        self.reject_quarantine = Some(reason.to_owned());
        self
    }

    pub fn events(&self) -> Vec<NormalizedLoginEvent> {
        self.events.lock().expect("poisoned MockLoginStore mutex").clone()
    }

    pub fn quarantined(&self) -> Vec<QuarantineRecord> {
        self.quarantined
            .lock()
            .expect("poisoned MockLoginStore mutex")
            .clone()
    }
}

#[async_trait]
impl LoginStore for MockLoginStore {
    async fn insert_event(&self, event: &NormalizedLoginEvent) -> PgStoreResult<()> {
        if let Some(reason) = &self.reject_events {
            return Err(query_error("INSERT", sqlx::Error::Protocol(reason.to_owned())));
        }

        if let (Some(limit), Some(app_version)) =
            (self.max_app_version_length, &event.app_version)
        {
            if app_version.chars().count() > limit {
                return Err(query_error(
                    "INSERT",
                    sqlx::Error::Protocol(format!(
                        "value too long for type character varying({limit})"
                    )),
                ));
            }
        }

        self.events
            .lock()
            .expect("poisoned MockLoginStore mutex")
            .push(event.clone());
        Ok(())
    }

    async fn insert_quarantine(&self, record: &QuarantineRecord) -> PgStoreResult<()> {
        if let Some(reason) = &self.reject_quarantine {
            return Err(query_error("INSERT", sqlx::Error::Protocol(reason.to_owned())));
        }

        self.quarantined
            .lock()
            .expect("poisoned MockLoginStore mutex")
            .push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::login_event::RawLoginEvent;
    use crate::quarantine::FailureStage;
    use chrono::{DateTime, Utc};

    fn normalized_event(app_version: &str) -> NormalizedLoginEvent {
        RawLoginEvent {
            user_id: Some("u1".to_owned()),
            device_type: Some("ios".to_owned()),
            ip: Some("1.2.3.4".to_owned()),
            device_id: Some("d1".to_owned()),
            locale: Some("en-US".to_owned()),
            app_version: Some(app_version.to_owned()),
        }
        .normalize()
        .unwrap()
    }

    fn quarantine_record() -> QuarantineRecord {
        QuarantineRecord::new(
            FailureStage::Parse,
            "expected value at line 1 column 1",
            serde_json::json!({"MessageId": "m1", "ReceiptHandle": "r1", "Body": "not json"}),
            None,
        )
    }

    #[tokio::test]
    async fn test_mock_store_records_rows() {
        let store = MockLoginStore::new();

        store.insert_event(&normalized_event("3.2.1")).await.unwrap();
        store.insert_quarantine(&quarantine_record()).await.unwrap();

        assert_eq!(store.events().len(), 1);
        assert_eq!(store.quarantined(), vec![quarantine_record()]);
    }

    #[tokio::test]
    async fn test_mock_store_enforces_app_version_length() {
        let store = MockLoginStore::new().with_max_app_version_length(10);

        let error = store
            .insert_event(&normalized_event("10.20.30.40-rc1"))
            .await
            .unwrap_err();

        assert!(error.to_string().contains("character varying(10)"));
        assert!(store.events().is_empty());
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a running PostgreSQL at DATABASE_URL"]
    async fn test_can_insert_login_event(db: PgPool) {
        let store = PgStore::new_from_pool(db.clone(), time::Duration::from_secs(5));
        let event = normalized_event("3.2.1");

        store.insert_event(&event).await.expect("failed to insert");

        let (user_id, masked_ip, create_date): (String, String, DateTime<Utc>) =
            sqlx::query_as("SELECT user_id, masked_ip, create_date FROM user_logins")
                .fetch_one(&db)
                .await
                .unwrap();
        assert_eq!(user_id, "u1");
        assert_eq!(masked_ip, event.masked_ip);
        assert_eq!(create_date.timestamp(), event.create_date.timestamp());
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a running PostgreSQL at DATABASE_URL"]
    async fn test_oversize_app_version_is_rejected(db: PgPool) {
        let store = PgStore::new_from_pool(db.clone(), time::Duration::from_secs(5));

        let result = store.insert_event(&normalized_event("10.20.30.40-rc1")).await;

        assert!(matches!(
            result,
            Err(PersistenceError::QueryError { ref command, .. }) if command == "INSERT"
        ));
        let (count,): (i64,) = sqlx::query_as("SELECT count(*) FROM user_logins")
            .fetch_one(&db)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a running PostgreSQL at DATABASE_URL"]
    async fn test_insert_quarantine_creates_table(db: PgPool) {
        let store = PgStore::new_from_pool(db.clone(), time::Duration::from_secs(5));

        store
            .insert_quarantine(&quarantine_record())
            .await
            .expect("failed to quarantine");
        store
            .insert_quarantine(&quarantine_record())
            .await
            .expect("failed to quarantine twice");

        let rows: Vec<(i32, String, Option<Json<serde_json::Value>>, String)> = sqlx::query_as(
            "SELECT error_id, error_message, message_body, stage FROM error_records ORDER BY error_id",
        )
        .fetch_all(&db)
        .await
        .unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].0 < rows[1].0);
        assert_eq!(rows[0].1, "expected value at line 1 column 1");
        assert!(rows[0].2.is_none());
        assert_eq!(rows[0].3, "parse");
    }
}
