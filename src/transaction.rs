//! The `Transaction` entity: the normalized record every document is
//! ingested into, the explainability payload that records why a category
//! was chosen, the filtered cursor listing, and user corrections.

use axum::{
    extract::{Path, Query, State},
    response::Response,
    Json,
};
use rusqlite::{params, params_from_iter, types::Value, Connection, Row};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use crate::{
    account::timestamp_column,
    auth::AuthContext,
    category::find_category,
    envelope::{self, double_option, Pagination},
    store::{self, Cursor, Store},
    suggestion::{self, RuleSuggestion},
    Error,
};

/// Maximum length of the free-form notes field, in characters.
pub const MAX_NOTES_CHARS: usize = 500;
/// Maximum number of tags on a transaction.
pub const MAX_TAGS: usize = 10;
/// Maximum length of a single tag, in characters.
pub const MAX_TAG_CHARS: usize = 50;

/// Default page size for transaction listings.
pub const DEFAULT_PAGE_SIZE: u32 = 50;
/// Maximum page size for transaction listings.
pub const MAX_PAGE_SIZE: u32 = 100;

// ============================================================================
// MODELS
// ============================================================================

/// Why a transaction carries its current category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    RuleMatch,
    Llm,
    Manual,
    NoMatch,
    Default,
    Split,
}

/// Which rule condition produced a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Exact,
    Contains,
    Regex,
    Description,
}

/// The audit payload recording why a category was chosen. A transaction
/// always carries exactly one current explainability; the superseded one
/// lives inside [AutoCategory] once the user overrides it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Explainability {
    pub reason: Reason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_type: Option<MatchKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_pattern: Option<String>,
    pub confidence: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_reasoning: Option<String>,
}

impl Explainability {
    fn bare(reason: Reason, confidence: f64) -> Self {
        Self {
            reason,
            rule_id: None,
            rule_name: None,
            match_type: None,
            matched_value: None,
            matched_pattern: None,
            confidence,
            timestamp: store::now(),
            llm_model: None,
            llm_reasoning: None,
        }
    }

    /// No rule matched and no classifier answered.
    pub fn no_match() -> Self {
        Self::bare(Reason::NoMatch, 0.0)
    }

    /// The user hand-set the category.
    pub fn manual() -> Self {
        Self::bare(Reason::Manual, 1.0)
    }

    /// The record was created by the split protocol.
    pub fn split() -> Self {
        Self::bare(Reason::Split, 1.0)
    }
}

/// The last non-manual categorization result, preserved when the user
/// overrides it so the audit trail survives the correction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoCategory {
    pub category_id: Option<String>,
    pub explainability: Explainability,
}

/// One line of a parsed receipt, embedded in the transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptLineItem {
    pub name: String,
    pub quantity: f64,
    /// Price per unit in cents.
    pub unit_price: i64,
    /// Line total in cents.
    pub total_price: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

/// A single monetary movement. Amounts are signed cents: expenses
/// negative, income positive.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: String,
    pub owner_id: String,
    pub account_id: String,
    pub import_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub posted_at: OffsetDateTime,
    pub amount: i64,
    pub description: String,
    pub merchant_raw: String,
    pub merchant_normalized: String,
    pub category_id: Option<String>,
    pub auto_category: Option<AutoCategory>,
    pub manual_override: bool,
    pub explainability: Explainability,
    pub notes: Option<String>,
    pub tags: Vec<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub corrected_at: Option<OffsetDateTime>,
    pub is_split_parent: bool,
    pub split_parent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt_line_items: Option<Vec<ReceiptLineItem>>,
    pub tx_key: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// The stable content hash used to deduplicate transactions within an
/// owner: sha-256 over account, posted date, amount and description.
pub fn compute_tx_key(
    account_id: &str,
    posted_at: OffsetDateTime,
    amount: i64,
    description: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(account_id.as_bytes());
    hasher.update(b"|");
    hasher.update(store::date_string(posted_at).as_bytes());
    hasher.update(b"|");
    hasher.update(amount.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(description.as_bytes());

    let digest = hasher.finalize();
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// Validate the notes field limits.
pub fn validate_notes(notes: Option<&str>) -> Result<(), Error> {
    if let Some(notes) = notes {
        if notes.chars().count() > MAX_NOTES_CHARS {
            return Err(Error::Validation(format!(
                "notes must be at most {MAX_NOTES_CHARS} characters"
            )));
        }
    }

    Ok(())
}

/// Validate the tags field limits.
pub fn validate_tags(tags: &[String]) -> Result<(), Error> {
    if tags.len() > MAX_TAGS {
        return Err(Error::Validation(format!(
            "a transaction can carry at most {MAX_TAGS} tags"
        )));
    }

    for tag in tags {
        if tag.chars().count() > MAX_TAG_CHARS {
            return Err(Error::Validation(format!(
                "tags must be at most {MAX_TAG_CHARS} characters"
            )));
        }
    }

    Ok(())
}

// ============================================================================
// ROUTE HANDLERS
// ============================================================================

/// The raw query string of the transaction listing.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListTransactionsParams {
    pub month: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub category_id: Option<String>,
    pub account_id: Option<String>,
    pub merchant: Option<String>,
    pub min_amount: Option<i64>,
    pub max_amount: Option<i64>,
    /// Comma-separated tag list.
    pub tags: Option<String>,
    pub uncategorized: Option<bool>,
    pub limit: Option<u32>,
    pub cursor: Option<String>,
}

/// Route handler for the filtered, cursored transaction listing.
///
/// Defaults to the current month, newest first. Split parents are never
/// listed; their children are the visible records.
pub async fn list_transactions_endpoint(
    auth: AuthContext,
    State(store): State<Store>,
    Query(params): Query<ListTransactionsParams>,
) -> Result<Response, Error> {
    let query = build_query(&auth.owner_id, params)?;

    let connection = store.lock();
    let page = list_transactions(&query, &connection)?;

    Ok(envelope::ok_paginated(
        page.transactions,
        Pagination {
            cursor: page.next_cursor,
            has_more: page.has_more,
            total: None,
        },
    ))
}

/// Route handler fetching a single transaction.
pub async fn get_transaction_endpoint(
    auth: AuthContext,
    Path(transaction_id): Path<String>,
    State(store): State<Store>,
) -> Result<Response, Error> {
    let connection = store.lock();
    let transaction = get_transaction(&auth.owner_id, &transaction_id, &connection)?;

    Ok(envelope::ok(transaction))
}

/// A user correction: any of category, notes, or tags.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTransactionRequest {
    #[serde(default, deserialize_with = "double_option")]
    pub category_id: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub notes: Option<Option<String>>,
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdateTransactionResponse {
    transaction: Transaction,
    #[serde(skip_serializing_if = "Option::is_none")]
    rule_suggestion: Option<RuleSuggestion>,
}

/// Route handler applying a user correction to a transaction.
///
/// A category change marks the transaction as manually overridden,
/// preserves the superseded automatic result, and may return a rule
/// suggestion derived from the correction.
pub async fn update_transaction_endpoint(
    auth: AuthContext,
    Path(transaction_id): Path<String>,
    State(store): State<Store>,
    Json(request): Json<UpdateTransactionRequest>,
) -> Result<Response, Error> {
    let connection = store.lock();
    let (transaction, category_changed) =
        apply_correction(&auth.owner_id, &transaction_id, request, &connection)?;

    let rule_suggestion = match (&transaction.category_id, category_changed) {
        (Some(new_category_id), true) => suggestion::generate_suggestion(
            &auth.owner_id,
            &transaction.merchant_normalized,
            new_category_id,
            &connection,
        )?,
        _ => None,
    };

    Ok(envelope::ok(UpdateTransactionResponse {
        transaction,
        rule_suggestion,
    }))
}

fn build_query(owner_id: &str, params: ListTransactionsParams) -> Result<TransactionQuery, Error> {
    let (start, end) = if let Some(month) = params.month.as_deref() {
        let (year, month) = store::parse_month(month)?;
        let (start, end) = store::month_bounds(year, month);
        (Some(start), Some(end))
    } else if params.start_date.is_some() || params.end_date.is_some() {
        let start = params
            .start_date
            .as_deref()
            .map(store::parse_date)
            .transpose()?
            .map(|date| date.midnight().assume_utc());
        let end = params
            .end_date
            .as_deref()
            .map(store::parse_date)
            .transpose()?
            .map(|date| date.with_time(time::Time::MAX).assume_utc());
        (start, end)
    } else {
        let today = store::now().date();
        let (start, end) = store::month_bounds(today.year(), today.month());
        (Some(start), Some(end))
    };

    let limit = params
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);

    let cursor = params
        .cursor
        .as_deref()
        .map(store::decode_cursor)
        .transpose()?;

    let tags = params
        .tags
        .as_deref()
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|tag| !tag.is_empty())
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default();

    Ok(TransactionQuery {
        owner_id: owner_id.to_owned(),
        start,
        end,
        category_id: params.category_id,
        account_id: params.account_id,
        merchant: params.merchant,
        min_amount: params.min_amount,
        max_amount: params.max_amount,
        tags,
        uncategorized: params.uncategorized.unwrap_or(false),
        limit,
        cursor,
    })
}

// ============================================================================
// DATABASE FUNCTIONS
// ============================================================================

/// Defines how transactions are fetched from [list_transactions].
#[derive(Debug, Default)]
pub struct TransactionQuery {
    pub owner_id: String,
    /// Include transactions posted at or after this instant.
    pub start: Option<OffsetDateTime>,
    /// Include transactions posted at or before this instant.
    pub end: Option<OffsetDateTime>,
    pub category_id: Option<String>,
    pub account_id: Option<String>,
    /// Case-insensitive substring over the normalized merchant.
    pub merchant: Option<String>,
    /// Inclusive lower bound in cents.
    pub min_amount: Option<i64>,
    /// Inclusive upper bound in cents.
    pub max_amount: Option<i64>,
    /// Require every listed tag to be present.
    pub tags: Vec<String>,
    /// Only transactions without a category.
    pub uncategorized: bool,
    pub limit: u32,
    pub cursor: Option<Cursor>,
}

/// One page of a transaction listing.
#[derive(Debug)]
pub struct TransactionPage {
    pub transactions: Vec<Transaction>,
    pub has_more: bool,
    pub next_cursor: Option<String>,
}

const TX_COLUMNS: &str = "id, owner_id, account_id, import_id, posted_at, amount, description, \
     merchant_raw, merchant_normalized, category_id, auto_category, manual_override, \
     explainability, notes, tags, corrected_at, is_split_parent, split_parent_id, \
     receipt_line_items, tx_key, created_at, updated_at";

/// List transactions matching `query`, newest first, keyset-paged.
///
/// Fetches one row beyond the limit to learn whether more pages exist;
/// the surplus row is discarded.
pub fn list_transactions(
    query: &TransactionQuery,
    connection: &Connection,
) -> Result<TransactionPage, Error> {
    let mut sql = format!(
        "SELECT {TX_COLUMNS} FROM transactions
         WHERE owner_id = ? AND is_split_parent = 0"
    );
    let mut parameters: Vec<Value> = vec![Value::Text(query.owner_id.clone())];

    if let Some(start) = query.start {
        sql.push_str(" AND posted_at >= ?");
        parameters.push(Value::Integer(store::timestamp_ms(start)));
    }
    if let Some(end) = query.end {
        sql.push_str(" AND posted_at <= ?");
        parameters.push(Value::Integer(store::timestamp_ms(end)));
    }
    if query.uncategorized {
        sql.push_str(" AND category_id IS NULL");
    } else if let Some(category_id) = &query.category_id {
        sql.push_str(" AND category_id = ?");
        parameters.push(Value::Text(category_id.clone()));
    }
    if let Some(account_id) = &query.account_id {
        sql.push_str(" AND account_id = ?");
        parameters.push(Value::Text(account_id.clone()));
    }
    if let Some(merchant) = &query.merchant {
        sql.push_str(" AND merchant_normalized LIKE ? ESCAPE '\\'");
        parameters.push(Value::Text(format!("%{}%", escape_like(merchant))));
    }
    if let Some(min_amount) = query.min_amount {
        sql.push_str(" AND amount >= ?");
        parameters.push(Value::Integer(min_amount));
    }
    if let Some(max_amount) = query.max_amount {
        sql.push_str(" AND amount <= ?");
        parameters.push(Value::Integer(max_amount));
    }
    for tag in &query.tags {
        sql.push_str(" AND tags LIKE ? ESCAPE '\\'");
        parameters.push(Value::Text(format!("%\"{}\"%", escape_like(tag))));
    }
    if let Some(cursor) = &query.cursor {
        sql.push_str(" AND (posted_at < ? OR (posted_at = ? AND id < ?))");
        parameters.push(Value::Integer(cursor.posted_at));
        parameters.push(Value::Integer(cursor.posted_at));
        parameters.push(Value::Text(cursor.id.clone()));
    }

    sql.push_str(" ORDER BY posted_at DESC, id DESC LIMIT ?");
    parameters.push(Value::Integer(i64::from(query.limit) + 1));

    let mut transactions: Vec<Transaction> = connection
        .prepare(&sql)?
        .query_map(params_from_iter(parameters), map_transaction_row)?
        .collect::<Result<Vec<_>, _>>()?;

    let has_more = transactions.len() > query.limit as usize;
    if has_more {
        transactions.truncate(query.limit as usize);
    }

    let next_cursor = if has_more {
        transactions.last().map(|last| {
            store::encode_cursor(&Cursor {
                posted_at: store::timestamp_ms(last.posted_at),
                id: last.id.clone(),
            })
        })
    } else {
        None
    };

    Ok(TransactionPage {
        transactions,
        has_more,
        next_cursor,
    })
}

fn escape_like(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// Insert a transaction.
///
/// # Errors
/// Returns [Error::Conflict] if the owner already holds a transaction
/// with the same `tx_key`.
pub fn insert_transaction(transaction: &Transaction, connection: &Connection) -> Result<(), Error> {
    connection.execute(
        &format!(
            "INSERT INTO transactions ({TX_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                     ?18, ?19, ?20, ?21, ?22)"
        ),
        params![
            transaction.id,
            transaction.owner_id,
            transaction.account_id,
            transaction.import_id,
            store::timestamp_ms(transaction.posted_at),
            transaction.amount,
            transaction.description,
            transaction.merchant_raw,
            transaction.merchant_normalized,
            transaction.category_id,
            to_json_column(&transaction.auto_category)?,
            transaction.manual_override,
            serde_json::to_string(&transaction.explainability)
                .map_err(|error| Error::Validation(error.to_string()))?,
            transaction.notes,
            serde_json::to_string(&transaction.tags)
                .map_err(|error| Error::Validation(error.to_string()))?,
            transaction.corrected_at.map(store::timestamp_ms),
            transaction.is_split_parent,
            transaction.split_parent_id,
            to_json_column(&transaction.receipt_line_items)?,
            transaction.tx_key,
            store::timestamp_ms(transaction.created_at),
            store::timestamp_ms(transaction.updated_at),
        ],
    )?;

    Ok(())
}

/// Retrieve a transaction by id, scoped to `owner_id`.
///
/// # Errors
/// Returns [Error::NotFound] if the transaction does not exist for this
/// owner.
pub fn get_transaction(
    owner_id: &str,
    transaction_id: &str,
    connection: &Connection,
) -> Result<Transaction, Error> {
    connection
        .prepare(&format!(
            "SELECT {TX_COLUMNS} FROM transactions WHERE id = ?1 AND owner_id = ?2"
        ))?
        .query_row((transaction_id, owner_id), map_transaction_row)
        .map_err(Error::from)
}

/// Whether the owner already holds a transaction with this content hash.
pub fn tx_key_exists(owner_id: &str, tx_key: &str, connection: &Connection) -> Result<bool, Error> {
    let count: i64 = connection.query_row(
        "SELECT COUNT(*) FROM transactions WHERE owner_id = ?1 AND tx_key = ?2",
        (owner_id, tx_key),
        |row| row.get(0),
    )?;

    Ok(count > 0)
}

/// Apply a user correction. Returns the updated transaction and whether
/// the category changed (which is what drives rule suggestions).
///
/// # Errors
/// Returns [Error::Validation] for field-limit violations and
/// [Error::NotFound] for an unknown transaction or category.
pub fn apply_correction(
    owner_id: &str,
    transaction_id: &str,
    request: UpdateTransactionRequest,
    connection: &Connection,
) -> Result<(Transaction, bool), Error> {
    let mut transaction = get_transaction(owner_id, transaction_id, connection)?;

    if let Some(notes) = &request.notes {
        validate_notes(notes.as_deref())?;
    }
    if let Some(tags) = &request.tags {
        validate_tags(tags)?;
    }

    let mut category_changed = false;
    if let Some(new_category_id) = &request.category_id {
        if *new_category_id != transaction.category_id {
            if let Some(category_id) = new_category_id {
                // Resolving the category also rejects cross-owner ids.
                find_category(owner_id, category_id, connection)?;
            }

            if !transaction.manual_override {
                transaction.auto_category = Some(AutoCategory {
                    category_id: transaction.category_id.clone(),
                    explainability: transaction.explainability.clone(),
                });
            }

            transaction.category_id = new_category_id.clone();
            transaction.manual_override = true;
            transaction.explainability = Explainability::manual();
            transaction.corrected_at = Some(store::now());
            category_changed = true;
        }
    }

    if let Some(notes) = request.notes {
        transaction.notes = notes;
    }
    if let Some(tags) = request.tags {
        transaction.tags = tags;
    }
    transaction.updated_at = store::now();

    let rows_affected = connection.execute(
        "UPDATE transactions
         SET category_id = ?1, auto_category = ?2, manual_override = ?3, explainability = ?4,
             notes = ?5, tags = ?6, corrected_at = ?7, updated_at = ?8
         WHERE id = ?9 AND owner_id = ?10",
        params![
            transaction.category_id,
            to_json_column(&transaction.auto_category)?,
            transaction.manual_override,
            serde_json::to_string(&transaction.explainability)
                .map_err(|error| Error::Validation(error.to_string()))?,
            transaction.notes,
            serde_json::to_string(&transaction.tags)
                .map_err(|error| Error::Validation(error.to_string()))?,
            transaction.corrected_at.map(store::timestamp_ms),
            store::timestamp_ms(transaction.updated_at),
            transaction_id,
            owner_id,
        ],
    )?;

    if rows_affected == 0 {
        return Err(Error::NotFound);
    }

    Ok((transaction, category_changed))
}

/// Replace the categorization of a transaction with a fresh automatic
/// result. Used by the recategorization scan; the new result also becomes
/// the preserved automatic one.
pub fn update_categorization(
    owner_id: &str,
    transaction_id: &str,
    category_id: Option<&str>,
    explainability: &Explainability,
    connection: &Connection,
) -> Result<(), Error> {
    let auto_category = AutoCategory {
        category_id: category_id.map(str::to_owned),
        explainability: explainability.clone(),
    };

    let rows_affected = connection.execute(
        "UPDATE transactions
         SET category_id = ?1, explainability = ?2, auto_category = ?3, updated_at = ?4
         WHERE id = ?5 AND owner_id = ?6",
        params![
            category_id,
            serde_json::to_string(explainability)
                .map_err(|error| Error::Validation(error.to_string()))?,
            serde_json::to_string(&auto_category)
                .map_err(|error| Error::Validation(error.to_string()))?,
            store::timestamp_ms(store::now()),
            transaction_id,
            owner_id,
        ],
    )?;

    if rows_affected == 0 {
        return Err(Error::NotFound);
    }

    Ok(())
}

fn to_json_column<T: Serialize>(value: &Option<T>) -> Result<Option<String>, Error> {
    value
        .as_ref()
        .map(|value| serde_json::to_string(value))
        .transpose()
        .map_err(|error| Error::Validation(error.to_string()))
}

fn json_column<T: DeserializeOwned>(row: &Row, index: usize) -> Result<T, rusqlite::Error> {
    let raw: String = row.get(index)?;

    serde_json::from_str(&raw).map_err(|error| {
        rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(error))
    })
}

fn optional_json_column<T: DeserializeOwned>(
    row: &Row,
    index: usize,
) -> Result<Option<T>, rusqlite::Error> {
    let raw: Option<String> = row.get(index)?;

    raw.map(|raw| {
        serde_json::from_str(&raw).map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(
                index,
                rusqlite::types::Type::Text,
                Box::new(error),
            )
        })
    })
    .transpose()
}

fn optional_timestamp_column(
    row: &Row,
    index: usize,
) -> Result<Option<OffsetDateTime>, rusqlite::Error> {
    let ms: Option<i64> = row.get(index)?;

    match ms {
        None => Ok(None),
        Some(ms) => store::from_timestamp_ms(ms).map(Some).map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(
                index,
                rusqlite::types::Type::Integer,
                error.to_string().into(),
            )
        }),
    }
}

pub(crate) fn map_transaction_row(row: &Row) -> Result<Transaction, rusqlite::Error> {
    Ok(Transaction {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        account_id: row.get(2)?,
        import_id: row.get(3)?,
        posted_at: timestamp_column(row, 4)?,
        amount: row.get(5)?,
        description: row.get(6)?,
        merchant_raw: row.get(7)?,
        merchant_normalized: row.get(8)?,
        category_id: row.get(9)?,
        auto_category: optional_json_column(row, 10)?,
        manual_override: row.get(11)?,
        explainability: json_column(row, 12)?,
        notes: row.get(13)?,
        tags: json_column(row, 14)?,
        corrected_at: optional_timestamp_column(row, 15)?,
        is_split_parent: row.get(16)?,
        split_parent_id: row.get(17)?,
        receipt_line_items: optional_json_column(row, 18)?,
        tx_key: row.get(19)?,
        created_at: timestamp_column(row, 20)?,
        updated_at: timestamp_column(row, 21)?,
    })
}
