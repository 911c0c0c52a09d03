//! The store adapter: schema, composite indexes, keyset cursors, and the
//! transaction helper used by multi-write operations.
//!
//! Collections map one-to-one onto tables. Every query in the domain
//! modules carries an `owner_id = ?` predicate; the adapter owns the
//! schema so those predicates are always index-backed.

use std::sync::{Arc, Mutex, MutexGuard};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use time::{Date, Month, OffsetDateTime, Time};
use uuid::Uuid;

use crate::Error;

/// Mint a fresh opaque entity id.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// The current instant, UTC.
pub fn now() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

/// Milliseconds since the epoch, the representation instants take in the
/// store. Integer storage keeps keyset comparisons exact.
pub fn timestamp_ms(instant: OffsetDateTime) -> i64 {
    (instant.unix_timestamp_nanos() / 1_000_000) as i64
}

/// Rebuild an instant from its stored millisecond representation.
pub fn from_timestamp_ms(ms: i64) -> Result<OffsetDateTime, Error> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000)
        .map_err(|error| Error::Validation(format!("timestamp out of range: {error}")))
}

/// Format the UTC calendar date of `instant` as `YYYY-MM-DD`.
pub fn date_string(instant: OffsetDateTime) -> String {
    let date = instant.date();
    format!(
        "{:04}-{:02}-{:02}",
        date.year(),
        u8::from(date.month()),
        date.day()
    )
}

/// Parse a `YYYY-MM` month designator.
///
/// # Errors
/// Returns [Error::InvalidParameter] if the value is not a calendar month.
pub fn parse_month(value: &str) -> Result<(i32, Month), Error> {
    let invalid = || Error::InvalidParameter(format!("'{value}' is not a YYYY-MM month"));

    let (year_part, month_part) = value.split_once('-').ok_or_else(invalid)?;
    let year: i32 = year_part.parse().map_err(|_| invalid())?;
    let month_number: u8 = month_part.parse().map_err(|_| invalid())?;
    let month = Month::try_from(month_number).map_err(|_| invalid())?;

    Ok((year, month))
}

/// Parse a `YYYY-MM-DD` calendar date.
///
/// # Errors
/// Returns [Error::InvalidParameter] if the value is not a calendar date.
pub fn parse_date(value: &str) -> Result<Date, Error> {
    let invalid = || Error::InvalidParameter(format!("'{value}' is not a YYYY-MM-DD date"));

    let mut parts = value.splitn(3, '-');
    let year: i32 = parts.next().ok_or_else(invalid)?.parse().map_err(|_| invalid())?;
    let month_number: u8 = parts.next().ok_or_else(invalid)?.parse().map_err(|_| invalid())?;
    let day: u8 = parts.next().ok_or_else(invalid)?.parse().map_err(|_| invalid())?;
    let month = Month::try_from(month_number).map_err(|_| invalid())?;

    Date::from_calendar_date(year, month, day).map_err(|_| invalid())
}

/// The first and last instant of a month, UTC.
pub fn month_bounds(year: i32, month: Month) -> (OffsetDateTime, OffsetDateTime) {
    let first_day = Date::from_calendar_date(year, month, 1)
        .expect("the first of a valid month always exists");
    let last_day = Date::from_calendar_date(
        year,
        month,
        time::util::days_in_year_month(year, month),
    )
    .expect("the last of a valid month always exists");

    (
        first_day.midnight().assume_utc(),
        last_day.with_time(Time::MAX).assume_utc(),
    )
}

/// The month immediately before `(year, month)`.
pub fn previous_month(year: i32, month: Month) -> (i32, Month) {
    match month {
        Month::January => (year - 1, Month::December),
        other => (year, other.previous()),
    }
}

/// Shared handle to the embedded store.
#[derive(Debug, Clone)]
pub struct Store {
    connection: Arc<Mutex<Connection>>,
}

impl Store {
    /// Wrap `connection` and create any missing tables and indexes.
    ///
    /// # Errors
    /// Returns an error if the schema cannot be created.
    pub fn new(connection: Connection) -> Result<Self, Error> {
        initialize(&connection)?;

        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
        })
    }

    /// Open an in-memory store. Used by tests and local development.
    pub fn open_in_memory() -> Result<Self, Error> {
        let connection = Connection::open_in_memory()?;
        Self::new(connection)
    }

    /// Acquire the connection.
    ///
    /// # Panics
    /// Panics if the lock for the database connection is poisoned.
    pub fn lock(&self) -> MutexGuard<'_, Connection> {
        self.connection
            .lock()
            .expect("Could not acquire database lock")
    }

    /// Run `operation` inside a single store transaction. On error no
    /// partial state is visible.
    ///
    /// # Errors
    /// Propagates the operation's error after rolling back, or the
    /// commit error.
    pub fn run_in_transaction<T>(
        &self,
        operation: impl FnOnce(&Connection) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let connection = self.lock();
        let tx = connection.unchecked_transaction()?;
        let value = operation(&tx)?;
        tx.commit()?;

        Ok(value)
    }
}

/// Create the tables and the composite indexes the read paths depend on.
pub fn initialize(connection: &Connection) -> Result<(), Error> {
    connection.execute_batch(
        "CREATE TABLE IF NOT EXISTS accounts (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            name TEXT NOT NULL,
            kind TEXT NOT NULL,
            institution TEXT,
            last_four TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS categories (
            id TEXT PRIMARY KEY,
            owner_id TEXT,
            name TEXT NOT NULL,
            icon TEXT NOT NULL,
            color TEXT NOT NULL,
            is_default INTEGER NOT NULL DEFAULT 0,
            parent_id TEXT,
            sort_order INTEGER NOT NULL DEFAULT 0,
            is_hidden INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS transactions (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            account_id TEXT NOT NULL,
            import_id TEXT,
            posted_at INTEGER NOT NULL,
            amount INTEGER NOT NULL,
            description TEXT NOT NULL,
            merchant_raw TEXT NOT NULL,
            merchant_normalized TEXT NOT NULL,
            category_id TEXT,
            auto_category TEXT,
            manual_override INTEGER NOT NULL DEFAULT 0,
            explainability TEXT NOT NULL,
            notes TEXT,
            tags TEXT NOT NULL DEFAULT '[]',
            corrected_at INTEGER,
            is_split_parent INTEGER NOT NULL DEFAULT 0,
            split_parent_id TEXT,
            receipt_line_items TEXT,
            tx_key TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS rules (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            name TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            priority INTEGER NOT NULL,
            conditions TEXT NOT NULL,
            action TEXT NOT NULL,
            source TEXT NOT NULL,
            match_count INTEGER NOT NULL DEFAULT 0,
            last_matched_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS imports (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            account_id TEXT NOT NULL,
            filename TEXT NOT NULL,
            file_type TEXT NOT NULL,
            status TEXT NOT NULL,
            transaction_count INTEGER NOT NULL DEFAULT 0,
            error_message TEXT,
            created_at INTEGER NOT NULL,
            completed_at INTEGER
        );

        CREATE TABLE IF NOT EXISTS merchants (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            merchant_raw TEXT NOT NULL,
            merchant_normalized TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE(owner_id, merchant_raw)
        );

        CREATE TABLE IF NOT EXISTS dismissed_suggestions (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            merchant_normalized TEXT NOT NULL,
            category_id TEXT NOT NULL,
            dismissed_at INTEGER NOT NULL,
            UNIQUE(owner_id, merchant_normalized, category_id)
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_tx_owner_key
            ON transactions(owner_id, tx_key);
        CREATE INDEX IF NOT EXISTS idx_tx_owner_posted
            ON transactions(owner_id, posted_at DESC);
        CREATE INDEX IF NOT EXISTS idx_tx_owner_category_posted
            ON transactions(owner_id, category_id, posted_at DESC);
        CREATE INDEX IF NOT EXISTS idx_tx_owner_account_posted
            ON transactions(owner_id, account_id, posted_at DESC);
        CREATE INDEX IF NOT EXISTS idx_tx_owner_merchant_posted
            ON transactions(owner_id, merchant_normalized, posted_at DESC);
        CREATE INDEX IF NOT EXISTS idx_tx_owner_override_posted
            ON transactions(owner_id, manual_override, posted_at DESC);
        CREATE INDEX IF NOT EXISTS idx_tx_owner_split_posted
            ON transactions(owner_id, is_split_parent, posted_at DESC);
        CREATE INDEX IF NOT EXISTS idx_tx_owner_import_posted
            ON transactions(owner_id, import_id, posted_at DESC);
        CREATE INDEX IF NOT EXISTS idx_tx_split_parent
            ON transactions(owner_id, split_parent_id);
        CREATE INDEX IF NOT EXISTS idx_rules_owner_enabled_priority
            ON rules(owner_id, enabled, priority DESC);
        CREATE INDEX IF NOT EXISTS idx_accounts_owner ON accounts(owner_id);
        CREATE INDEX IF NOT EXISTS idx_imports_owner_created
            ON imports(owner_id, created_at DESC);
        ",
    )?;

    Ok(())
}

/// The position a list cursor points at: the sort key of the last row the
/// client has seen. Opaque to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    /// Millisecond timestamp of the last row's `posted_at`.
    pub posted_at: i64,
    /// Id of the last row, breaking ties between equal timestamps.
    pub id: String,
}

/// Encode a cursor as an opaque URL-safe token.
pub fn encode_cursor(cursor: &Cursor) -> String {
    let payload = serde_json::to_vec(cursor).expect("cursor serialization cannot fail");
    URL_SAFE_NO_PAD.encode(payload)
}

/// Decode a cursor token.
///
/// # Errors
/// Returns [Error::InvalidCursor] if the token is not a cursor this
/// service produced.
pub fn decode_cursor(token: &str) -> Result<Cursor, Error> {
    let payload = URL_SAFE_NO_PAD
        .decode(token)
        .map_err(|_| Error::InvalidCursor)?;

    serde_json::from_slice(&payload).map_err(|_| Error::InvalidCursor)
}
