//! The `Import` entity and the ingestion pipeline.
//!
//! A document comes in as bytes, transactions come out persisted:
//! parse (deterministic first, multimodal fallback), normalize the
//! merchant, deduplicate on the content hash, categorize in batch, write.
//! The Import record tracks the run through its status machine
//! `pending → processing → {completed, failed}`; terminal states are
//! immutable.

use std::collections::HashSet;
use std::sync::Arc;

use axum::{
    extract::{FromRef, Path, State},
    response::Response,
    Json,
};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use rusqlite::{Connection, Row};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    account::{get_account, timestamp_column},
    app_state::AppState,
    auth::AuthContext,
    categorize::{categorize_items, spawn_rule_stat_bump, BatchItem},
    category::list_categories,
    csv,
    envelope,
    llm::{CategoryChoice, Classifier, DocumentKind, LlmClient, ReceiptBlock},
    merchant,
    rule::load_enabled_rules,
    store::{self, Store},
    transaction::{compute_tx_key, insert_transaction, tx_key_exists, Transaction},
    Error,
};

/// Uploads above this size are rejected before any parsing.
pub const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

/// Where an import is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ImportStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ImportStatus::Pending => "pending",
            ImportStatus::Processing => "processing",
            ImportStatus::Completed => "completed",
            ImportStatus::Failed => "failed",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ImportStatus::Pending),
            "processing" => Some(ImportStatus::Processing),
            "completed" => Some(ImportStatus::Completed),
            "failed" => Some(ImportStatus::Failed),
            _ => None,
        }
    }
}

/// One ingestion run of one document against one account.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Import {
    pub id: String,
    pub owner_id: String,
    pub account_id: String,
    pub filename: String,
    pub file_type: DocumentKind,
    pub status: ImportStatus,
    pub transaction_count: i64,
    pub error_message: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
}

/// What an ingestion run produced.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestOutcome {
    pub import_id: String,
    pub created: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
}

/// Map a MIME type onto a document kind.
///
/// # Errors
/// Returns [Error::UnsupportedContentType] for anything the pipeline
/// does not ingest.
pub fn kind_from_mime(mime_type: &str) -> Result<DocumentKind, Error> {
    let essence = mime_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_lowercase();

    match essence.as_str() {
        "text/csv" | "application/csv" | "text/plain" => Ok(DocumentKind::Csv),
        "application/pdf" => Ok(DocumentKind::Pdf),
        "image/png" | "image/jpeg" | "image/jpg" | "image/webp" | "image/heic" | "image/heif" => {
            Ok(DocumentKind::Image)
        }
        _ => Err(Error::UnsupportedContentType(mime_type.to_owned())),
    }
}

// ============================================================================
// ROUTE HANDLERS
// ============================================================================

/// The state the import endpoints need.
#[derive(Clone)]
pub struct ImportState {
    pub store: Store,
    pub llm: Arc<LlmClient>,
    pub llm_enabled: bool,
}

impl FromRef<AppState> for ImportState {
    fn from_ref(state: &AppState) -> Self {
        Self {
            store: state.store.clone(),
            llm: Arc::clone(&state.llm),
            llm_enabled: state.config.llm_categorization_enabled,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    pub account_id: String,
    /// Base64 of the document bytes.
    pub content: String,
    pub filename: String,
    pub mime_type: String,
}

/// Route handler ingesting an uploaded document.
pub async fn upload_import_endpoint(
    auth: AuthContext,
    State(state): State<ImportState>,
    Json(request): Json<UploadRequest>,
) -> Result<Response, Error> {
    let bytes = BASE64_STANDARD
        .decode(request.content.as_bytes())
        .map_err(|_| Error::InvalidRequest("content must be base64".to_owned()))?;

    // The parse fallback always has the multimodal parser available; the
    // categorization flag only gates the classifier.
    let classifier = state.llm_enabled.then(|| Arc::clone(&state.llm));

    let outcome = run_import(
        &auth.owner_id,
        &request.account_id,
        &bytes,
        &request.filename,
        &request.mime_type,
        &state.store,
        Some(state.llm.as_ref()),
        classifier,
    )
    .await?;

    Ok(envelope::created(outcome))
}

/// Route handler listing the owner's imports, newest first.
pub async fn list_imports_endpoint(
    auth: AuthContext,
    State(state): State<ImportState>,
) -> Result<Response, Error> {
    let connection = state.store.lock();
    let imports = list_imports(&auth.owner_id, &connection)?;

    Ok(envelope::ok(imports))
}

/// Route handler fetching a single import.
pub async fn get_import_endpoint(
    auth: AuthContext,
    Path(import_id): Path<String>,
    State(state): State<ImportState>,
) -> Result<Response, Error> {
    let connection = state.store.lock();
    let import = get_import(&auth.owner_id, &import_id, &connection)?;

    Ok(envelope::ok(import))
}

// ============================================================================
// PIPELINE
// ============================================================================

/// A parsed row on its way to becoming a transaction.
struct RowDraft {
    posted_at: OffsetDateTime,
    amount: i64,
    description: String,
    merchant_raw: String,
}

/// Ingest one document end to end.
///
/// Re-importing the same document is idempotent: rows whose content hash
/// the owner already holds are counted as skipped, not created.
///
/// # Errors
/// Returns [Error::AccountNotFound], the size/type gate errors, or
/// [Error::ImportFailed] when no transactions could be extracted; the
/// Import record is left in `failed` with the operator detail in that
/// case.
#[allow(clippy::too_many_arguments)]
pub async fn run_import<C>(
    owner_id: &str,
    account_id: &str,
    bytes: &[u8],
    filename: &str,
    mime_type: &str,
    store: &Store,
    parser: Option<&LlmClient>,
    classifier: Option<Arc<C>>,
) -> Result<IngestOutcome, Error>
where
    C: Classifier + 'static,
{
    {
        let connection = store.lock();
        get_account(owner_id, account_id, &connection).map_err(|error| match error {
            Error::NotFound => Error::AccountNotFound,
            other => other,
        })?;
    }

    if bytes.len() > MAX_UPLOAD_BYTES {
        return Err(Error::FileTooLarge {
            size: bytes.len(),
            limit: MAX_UPLOAD_BYTES,
        });
    }
    let kind = kind_from_mime(mime_type)?;

    let import = {
        let connection = store.lock();
        let import = create_import(owner_id, account_id, filename, kind, &connection)?;
        mark_processing(owner_id, &import.id, &connection)?;
        import
    };

    // From here on every failure terminates the Import as failed; rows
    // already persisted stay valid and re-running the import skips them.
    match ingest_into(owner_id, account_id, bytes, kind, &import, store, parser, classifier).await
    {
        Ok((created, skipped, errors)) => {
            {
                let connection = store.lock();
                complete_import(owner_id, &import.id, created as i64, &connection)?;
            }

            tracing::info!(
                "import {} finished: {created} created, {skipped} skipped, {} errors",
                import.id,
                errors.len()
            );

            Ok(IngestOutcome {
                import_id: import.id,
                created,
                skipped,
                errors,
            })
        }
        Err(error) => {
            let message = error.to_string();
            {
                let connection = store.lock();
                if let Err(fail_error) = fail_import(owner_id, &import.id, &message, &connection) {
                    tracing::error!("could not mark import {} failed: {fail_error}", import.id);
                }
            }

            match error {
                Error::ParseFailure(message) | Error::LlmUnavailable(message) => {
                    Err(Error::ImportFailed(message))
                }
                other => Err(other),
            }
        }
    }
}

/// The fallible middle of the pipeline: parse, normalize, deduplicate,
/// categorize, persist. Returns `(created, skipped, errors)`.
#[allow(clippy::too_many_arguments)]
async fn ingest_into<C>(
    owner_id: &str,
    account_id: &str,
    bytes: &[u8],
    kind: DocumentKind,
    import: &Import,
    store: &Store,
    parser: Option<&LlmClient>,
    classifier: Option<Arc<C>>,
) -> Result<(usize, usize, Vec<String>), Error>
where
    C: Classifier + 'static,
{
    let (rows, receipt) = parse_rows(bytes, kind, parser).await?;

    if rows.is_empty() {
        return Err(Error::ParseFailure(
            "no transactions could be extracted".to_owned(),
        ));
    }

    let mut skipped = 0usize;
    let mut errors: Vec<String> = Vec::new();
    let mut seen_keys: HashSet<String> = HashSet::new();
    let mut survivors: Vec<(RowDraft, String, String)> = Vec::new(); // (row, merchant, tx_key)

    for row in rows {
        let mut normalized = merchant::normalize_merchant(&row.merchant_raw);
        if !merchant::is_usable(&normalized) {
            let cached = {
                let connection = store.lock();
                cached_merchant(owner_id, &row.merchant_raw, &connection)?
            };

            if let Some(cached) = cached {
                normalized = cached;
            } else if let Some(parser) = parser {
                match parser.normalize_merchant(&row.merchant_raw).await {
                    Ok(name) => {
                        let connection = store.lock();
                        cache_merchant(owner_id, &row.merchant_raw, &name, &connection)?;
                        normalized = name;
                    }
                    Err(error) => {
                        tracing::debug!(
                            "keeping deterministic merchant for '{}': {error}",
                            row.merchant_raw
                        );
                    }
                }
            }
        }

        let tx_key = compute_tx_key(account_id, row.posted_at, row.amount, &row.description);

        let duplicate = seen_keys.contains(&tx_key) || {
            let connection = store.lock();
            tx_key_exists(owner_id, &tx_key, &connection)?
        };
        if duplicate {
            skipped += 1;
            continue;
        }

        seen_keys.insert(tx_key.clone());
        survivors.push((row, normalized, tx_key));
    }

    let (rules, categories) = {
        let connection = store.lock();
        let rules = load_enabled_rules(owner_id, &connection)?;
        let categories: Vec<CategoryChoice> = list_categories(owner_id, &connection)?
            .into_iter()
            .filter(|category| !category.is_hidden)
            .map(|category| CategoryChoice {
                id: category.id,
                name: category.name,
            })
            .collect();
        (rules, categories)
    };

    let items: Vec<(BatchItem, &RowDraft, &str)> = survivors
        .iter()
        .map(|(row, normalized, _)| {
            (
                BatchItem {
                    id: store::new_id(),
                    account_id: account_id.to_owned(),
                    amount: row.amount,
                    merchant_normalized: normalized.clone(),
                    merchant_raw: row.merchant_raw.clone(),
                    description: row.description.clone(),
                },
                row,
                normalized.as_str(),
            )
        })
        .collect();

    let batch: Vec<BatchItem> = items.iter().map(|(item, _, _)| item.clone()).collect();
    let mut outcomes = categorize_items(&batch, &rules, &categories, classifier).await;

    let mut created = 0usize;
    let now = store::now();

    for ((item, row, normalized), (_, _, tx_key)) in items.iter().zip(survivors.iter()) {
        let outcome = outcomes.remove(&item.id);
        let (category_id, tags, explainability, matched_rule_id) = match outcome {
            Some(outcome) => (
                outcome.category_id,
                outcome.tags,
                outcome.explainability,
                outcome.matched_rule_id,
            ),
            None => (
                None,
                Vec::new(),
                crate::transaction::Explainability::no_match(),
                None,
            ),
        };

        let transaction = Transaction {
            id: item.id.clone(),
            owner_id: owner_id.to_owned(),
            account_id: account_id.to_owned(),
            import_id: Some(import.id.clone()),
            posted_at: row.posted_at,
            amount: row.amount,
            description: row.description.clone(),
            merchant_raw: row.merchant_raw.clone(),
            merchant_normalized: (*normalized).to_owned(),
            category_id,
            auto_category: None,
            manual_override: false,
            explainability,
            notes: None,
            tags,
            corrected_at: None,
            is_split_parent: false,
            split_parent_id: None,
            receipt_line_items: receipt
                .as_ref()
                .filter(|_| kind == DocumentKind::Image)
                .map(|receipt| receipt.line_items.clone()),
            tx_key: tx_key.clone(),
            created_at: now,
            updated_at: now,
        };

        let inserted = {
            let connection = store.lock();
            insert_transaction(&transaction, &connection)
        };

        match inserted {
            Ok(()) => {
                created += 1;
                if let Some(rule_id) = matched_rule_id {
                    spawn_rule_stat_bump(store.clone(), owner_id.to_owned(), rule_id);
                }
            }
            Err(Error::Conflict(_)) => {
                // A concurrent import of the same document won the race.
                skipped += 1;
            }
            Err(error) => {
                tracing::error!("failed to persist a transaction: {error}");
                errors.push(format!("row '{}': could not be saved", row.description));
            }
        }
    }

    Ok((created, skipped, errors))
}

/// Parse the document into row drafts, falling back to the multimodal
/// parser when the deterministic one yields nothing.
async fn parse_rows(
    bytes: &[u8],
    kind: DocumentKind,
    parser: Option<&LlmClient>,
) -> Result<(Vec<RowDraft>, Option<ReceiptBlock>), Error> {
    match kind {
        DocumentKind::Csv => {
            let text = String::from_utf8_lossy(bytes);
            let rows = csv::parse_statement(&text);

            if !rows.is_empty() {
                let drafts = rows
                    .into_iter()
                    .map(|row| RowDraft {
                        posted_at: row.posted_at.midnight().assume_utc(),
                        amount: row.amount,
                        description: row.description,
                        merchant_raw: row.merchant_raw,
                    })
                    .collect();
                return Ok((drafts, None));
            }

            let Some(parser) = parser else {
                return Err(Error::ParseFailure(
                    "the statement layout was not recognized".to_owned(),
                ));
            };

            tracing::debug!("deterministic parser yielded zero rows, falling back");
            let parsed = parser.parse_document(bytes, kind, None).await?;
            Ok((document_drafts(parsed.transactions), parsed.receipt))
        }
        DocumentKind::Pdf | DocumentKind::Image => {
            let Some(parser) = parser else {
                return Err(Error::ParseFailure(
                    "no parser is available for this document kind".to_owned(),
                ));
            };

            let parsed = parser.parse_document(bytes, kind, None).await?;
            Ok((document_drafts(parsed.transactions), parsed.receipt))
        }
    }
}

fn document_drafts(transactions: Vec<crate::llm::ParsedDocTransaction>) -> Vec<RowDraft> {
    transactions
        .into_iter()
        .map(|row| RowDraft {
            posted_at: row.posted_at.midnight().assume_utc(),
            amount: row.amount,
            description: row.description,
            merchant_raw: row.merchant_raw,
        })
        .collect()
}

// ============================================================================
// DATABASE FUNCTIONS
// ============================================================================

/// Look up a previously LLM-normalized merchant for this owner.
fn cached_merchant(
    owner_id: &str,
    merchant_raw: &str,
    connection: &Connection,
) -> Result<Option<String>, Error> {
    let result = connection.query_row(
        "SELECT merchant_normalized FROM merchants
         WHERE owner_id = ?1 AND merchant_raw = ?2",
        (owner_id, merchant_raw),
        |row| row.get(0),
    );

    match result {
        Ok(normalized) => Ok(Some(normalized)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(error) => Err(error.into()),
    }
}

/// Remember an LLM-normalized merchant so repeat imports skip the call.
fn cache_merchant(
    owner_id: &str,
    merchant_raw: &str,
    merchant_normalized: &str,
    connection: &Connection,
) -> Result<(), Error> {
    connection.execute(
        "INSERT OR IGNORE INTO merchants
         (id, owner_id, merchant_raw, merchant_normalized, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        (
            store::new_id(),
            owner_id,
            merchant_raw,
            merchant_normalized,
            store::timestamp_ms(store::now()),
        ),
    )?;

    Ok(())
}

const IMPORT_COLUMNS: &str = "id, owner_id, account_id, filename, file_type, status, \
     transaction_count, error_message, created_at, completed_at";

/// Create an import record in `pending`.
pub fn create_import(
    owner_id: &str,
    account_id: &str,
    filename: &str,
    file_type: DocumentKind,
    connection: &Connection,
) -> Result<Import, Error> {
    let import = Import {
        id: store::new_id(),
        owner_id: owner_id.to_owned(),
        account_id: account_id.to_owned(),
        filename: filename.to_owned(),
        file_type,
        status: ImportStatus::Pending,
        transaction_count: 0,
        error_message: None,
        created_at: store::now(),
        completed_at: None,
    };

    connection.execute(
        &format!(
            "INSERT INTO imports ({IMPORT_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
        ),
        rusqlite::params![
            import.id,
            import.owner_id,
            import.account_id,
            import.filename,
            import.file_type.as_str(),
            import.status.as_str(),
            import.transaction_count,
            import.error_message,
            store::timestamp_ms(import.created_at),
            Option::<i64>::None,
        ],
    )?;

    Ok(import)
}

/// Move a pending import into `processing`.
///
/// # Errors
/// Returns [Error::Conflict] if the import is not pending.
pub fn mark_processing(
    owner_id: &str,
    import_id: &str,
    connection: &Connection,
) -> Result<(), Error> {
    transition(
        owner_id,
        import_id,
        "UPDATE imports SET status = 'processing'
         WHERE id = ?1 AND owner_id = ?2 AND status = 'pending'",
        connection,
    )
}

/// Terminate an import as `completed` with its created-row count.
///
/// # Errors
/// Returns [Error::Conflict] if the import is already terminal.
pub fn complete_import(
    owner_id: &str,
    import_id: &str,
    transaction_count: i64,
    connection: &Connection,
) -> Result<(), Error> {
    let rows_affected = connection.execute(
        "UPDATE imports SET status = 'completed', transaction_count = ?3, completed_at = ?4
         WHERE id = ?1 AND owner_id = ?2 AND status IN ('pending', 'processing')",
        rusqlite::params![
            import_id,
            owner_id,
            transaction_count,
            store::timestamp_ms(store::now()),
        ],
    )?;

    terminal_guard(owner_id, import_id, rows_affected, connection)
}

/// Terminate an import as `failed` with an operator-facing message.
///
/// # Errors
/// Returns [Error::Conflict] if the import is already terminal.
pub fn fail_import(
    owner_id: &str,
    import_id: &str,
    error_message: &str,
    connection: &Connection,
) -> Result<(), Error> {
    let rows_affected = connection.execute(
        "UPDATE imports SET status = 'failed', error_message = ?3, completed_at = ?4
         WHERE id = ?1 AND owner_id = ?2 AND status IN ('pending', 'processing')",
        rusqlite::params![
            import_id,
            owner_id,
            error_message,
            store::timestamp_ms(store::now()),
        ],
    )?;

    terminal_guard(owner_id, import_id, rows_affected, connection)
}

fn transition(
    owner_id: &str,
    import_id: &str,
    sql: &str,
    connection: &Connection,
) -> Result<(), Error> {
    let rows_affected = connection.execute(sql, (import_id, owner_id))?;

    terminal_guard(owner_id, import_id, rows_affected, connection)
}

fn terminal_guard(
    owner_id: &str,
    import_id: &str,
    rows_affected: usize,
    connection: &Connection,
) -> Result<(), Error> {
    if rows_affected > 0 {
        return Ok(());
    }

    // Distinguish "gone" from "already terminal".
    get_import(owner_id, import_id, connection)?;
    Err(Error::Conflict(
        "the import is already in a terminal state".to_owned(),
    ))
}

/// Retrieve an import by id, scoped to `owner_id`.
pub fn get_import(
    owner_id: &str,
    import_id: &str,
    connection: &Connection,
) -> Result<Import, Error> {
    connection
        .prepare(&format!(
            "SELECT {IMPORT_COLUMNS} FROM imports WHERE id = ?1 AND owner_id = ?2"
        ))?
        .query_row((import_id, owner_id), map_import_row)
        .map_err(Error::from)
}

/// Retrieve the owner's imports, newest first.
pub fn list_imports(owner_id: &str, connection: &Connection) -> Result<Vec<Import>, Error> {
    connection
        .prepare(&format!(
            "SELECT {IMPORT_COLUMNS} FROM imports WHERE owner_id = ?1
             ORDER BY created_at DESC, id DESC"
        ))?
        .query_map([owner_id], map_import_row)?
        .map(|maybe_import| maybe_import.map_err(Error::from))
        .collect()
}

fn map_import_row(row: &Row) -> Result<Import, rusqlite::Error> {
    let file_type: String = row.get(4)?;
    let status: String = row.get(5)?;
    let completed_at: Option<i64> = row.get(9)?;

    Ok(Import {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        account_id: row.get(2)?,
        filename: row.get(3)?,
        file_type: DocumentKind::parse(&file_type).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                4,
                rusqlite::types::Type::Text,
                format!("unknown file type '{file_type}'").into(),
            )
        })?,
        status: ImportStatus::parse(&status).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                5,
                rusqlite::types::Type::Text,
                format!("unknown import status '{status}'").into(),
            )
        })?,
        transaction_count: row.get(6)?,
        error_message: row.get(7)?,
        created_at: timestamp_column(row, 8)?,
        completed_at: match completed_at {
            None => None,
            Some(ms) => Some(store::from_timestamp_ms(ms).map_err(|error| {
                rusqlite::Error::FromSqlConversionFailure(
                    9,
                    rusqlite::types::Type::Integer,
                    error.to_string().into(),
                )
            })?),
        },
    })
}

#[cfg(test)]
mod import_tests {
    use super::*;
    use crate::account::{create_account, AccountType, CreateAccountRequest};
    use crate::category::seed_default_categories;
    use crate::llm::Classification;
    use crate::transaction::{list_transactions, Reason, TransactionQuery};

    const HAPPY_CSV: &str = "date,amount,description\n\
        2024-01-15,-50.00,COFFEE SHOP #123\n\
        2024-01-16,100.00,SALARY";

    /// The pipeline under test never reaches a network: the parser slot
    /// is empty and this stub stands in for the classifier.
    struct NeverClassifier;

    impl Classifier for NeverClassifier {
        async fn classify(
            &self,
            _item: &crate::llm::ClassifyItem,
            _categories: &[CategoryChoice],
        ) -> Classification {
            Classification::no_answer("unused in tests")
        }
    }

    fn seeded_store() -> (Store, String) {
        let store = Store::open_in_memory().unwrap();
        let account_id = {
            let connection = store.lock();
            seed_default_categories(&connection).unwrap();
            create_account(
                "u-1",
                CreateAccountRequest {
                    name: "Everyday".to_owned(),
                    kind: AccountType::Checking,
                    institution: None,
                    last_four: None,
                },
                &connection,
            )
            .unwrap()
            .id
        };
        (store, account_id)
    }

    async fn ingest_csv(store: &Store, account_id: &str, csv: &str) -> Result<IngestOutcome, Error> {
        run_import::<NeverClassifier>(
            "u-1",
            account_id,
            csv.as_bytes(),
            "statement.csv",
            "text/csv",
            store,
            None,
            None,
        )
        .await
    }

    #[tokio::test]
    async fn csv_happy_path_creates_normalized_transactions() {
        let (store, account_id) = seeded_store();

        let outcome = ingest_csv(&store, &account_id, HAPPY_CSV).await.unwrap();

        assert_eq!(outcome.created, 2);
        assert_eq!(outcome.skipped, 0);
        assert!(outcome.errors.is_empty());

        let connection = store.lock();
        let page = list_transactions(
            &TransactionQuery {
                owner_id: "u-1".to_owned(),
                start: Some(store::from_timestamp_ms(0).unwrap()),
                end: Some(store::now()),
                limit: 10,
                ..Default::default()
            },
            &connection,
        )
        .unwrap();

        assert_eq!(page.transactions.len(), 2);
        let amounts: Vec<i64> = page.transactions.iter().map(|tx| tx.amount).collect();
        assert!(amounts.contains(&-5000));
        assert!(amounts.contains(&10000));

        let merchants: Vec<&str> = page
            .transactions
            .iter()
            .map(|tx| tx.merchant_normalized.as_str())
            .collect();
        assert!(merchants.contains(&"COFFEE SHOP"));
        assert!(merchants.contains(&"SALARY"));

        for tx in &page.transactions {
            assert_eq!(tx.import_id.as_deref(), Some(outcome.import_id.as_str()));
            assert!(!tx.manual_override);
        }

        let import = get_import("u-1", &outcome.import_id, &connection).unwrap();
        assert_eq!(import.status, ImportStatus::Completed);
        assert_eq!(import.transaction_count, 2);
        assert!(import.completed_at.is_some());
    }

    #[tokio::test]
    async fn reimporting_the_same_document_is_idempotent() {
        let (store, account_id) = seeded_store();

        let first = ingest_csv(&store, &account_id, HAPPY_CSV).await.unwrap();
        assert_eq!(first.created, 2);

        let second = ingest_csv(&store, &account_id, HAPPY_CSV).await.unwrap();
        assert_eq!(second.created, 0);
        assert_eq!(second.skipped, 2);

        let connection = store.lock();
        let count: i64 = connection
            .query_row(
                "SELECT COUNT(*) FROM transactions WHERE owner_id = 'u-1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn a_changed_row_creates_a_new_record() {
        let (store, account_id) = seeded_store();

        ingest_csv(&store, &account_id, HAPPY_CSV).await.unwrap();

        let amended = "date,amount,description\n\
            2024-01-15,-50.01,COFFEE SHOP #123\n\
            2024-01-16,100.00,SALARY";
        let outcome = ingest_csv(&store, &account_id, amended).await.unwrap();

        assert_eq!(outcome.created, 1);
        assert_eq!(outcome.skipped, 1);
    }

    #[tokio::test]
    async fn rules_categorize_during_ingestion() {
        let (store, account_id) = seeded_store();
        {
            let connection = store.lock();
            crate::rule::create_rule(
                "u-1",
                crate::rule::CreateRuleRequest {
                    name: "coffee".to_owned(),
                    enabled: None,
                    priority: Some(700),
                    conditions: crate::rule::RuleConditions {
                        merchant_contains: Some("COFFEE".to_owned()),
                        ..Default::default()
                    },
                    action: crate::rule::RuleAction {
                        category_id: "dining".to_owned(),
                        add_tags: vec!["coffee".to_owned()],
                    },
                },
                crate::rule::RuleSource::User,
                &connection,
            )
            .unwrap();
        }

        ingest_csv(&store, &account_id, HAPPY_CSV).await.unwrap();

        let connection = store.lock();
        let page = list_transactions(
            &TransactionQuery {
                owner_id: "u-1".to_owned(),
                start: Some(store::from_timestamp_ms(0).unwrap()),
                end: Some(store::now()),
                limit: 10,
                ..Default::default()
            },
            &connection,
        )
        .unwrap();

        let coffee = page
            .transactions
            .iter()
            .find(|tx| tx.merchant_normalized == "COFFEE SHOP")
            .unwrap();
        assert_eq!(coffee.category_id.as_deref(), Some("dining"));
        assert_eq!(coffee.explainability.reason, Reason::RuleMatch);
        assert_eq!(coffee.tags, vec!["coffee".to_owned()]);

        let salary = page
            .transactions
            .iter()
            .find(|tx| tx.merchant_normalized == "SALARY")
            .unwrap();
        assert_eq!(salary.category_id, None);
        assert_eq!(salary.explainability.reason, Reason::NoMatch);
    }

    #[tokio::test]
    async fn unknown_account_is_account_not_found() {
        let (store, _) = seeded_store();

        let result = ingest_csv(&store, "missing-account", HAPPY_CSV).await;

        assert!(matches!(result, Err(Error::AccountNotFound)));
    }

    #[tokio::test]
    async fn oversized_uploads_are_rejected_before_parsing() {
        let (store, account_id) = seeded_store();
        let oversized = vec![b'a'; MAX_UPLOAD_BYTES + 1];

        let result = run_import::<NeverClassifier>(
            "u-1",
            &account_id,
            &oversized,
            "big.csv",
            "text/csv",
            &store,
            None,
            None,
        )
        .await;

        assert!(matches!(result, Err(Error::FileTooLarge { .. })));

        // No import record was created for the rejected upload.
        let connection = store.lock();
        assert!(list_imports("u-1", &connection).unwrap().is_empty());
    }

    #[tokio::test]
    async fn unmappable_mime_is_unsupported() {
        let (store, account_id) = seeded_store();

        let result = run_import::<NeverClassifier>(
            "u-1",
            &account_id,
            b"hello",
            "page.html",
            "text/html",
            &store,
            None,
            None,
        )
        .await;

        assert!(matches!(result, Err(Error::UnsupportedContentType(_))));
    }

    #[tokio::test]
    async fn unparsable_documents_leave_a_failed_import() {
        let (store, account_id) = seeded_store();

        let result = ingest_csv(&store, &account_id, "not,a,statement\nat,all,").await;
        assert!(matches!(result, Err(Error::ImportFailed(_))));

        let connection = store.lock();
        let imports = list_imports("u-1", &connection).unwrap();
        assert_eq!(imports.len(), 1);
        assert_eq!(imports[0].status, ImportStatus::Failed);
        assert!(imports[0].error_message.is_some());
        assert!(imports[0].completed_at.is_some());
    }

    #[test]
    fn terminal_imports_are_immutable() {
        let (store, account_id) = seeded_store();
        let connection = store.lock();

        let import =
            create_import("u-1", &account_id, "x.csv", DocumentKind::Csv, &connection).unwrap();
        mark_processing("u-1", &import.id, &connection).unwrap();
        complete_import("u-1", &import.id, 3, &connection).unwrap();

        assert!(matches!(
            fail_import("u-1", &import.id, "too late", &connection),
            Err(Error::Conflict(_))
        ));
        assert!(matches!(
            complete_import("u-1", &import.id, 4, &connection),
            Err(Error::Conflict(_))
        ));
        assert!(matches!(
            mark_processing("u-1", &import.id, &connection),
            Err(Error::Conflict(_))
        ));

        let reloaded = get_import("u-1", &import.id, &connection).unwrap();
        assert_eq!(reloaded.transaction_count, 3);
    }

    #[test]
    fn mime_types_map_to_document_kinds() {
        assert_eq!(kind_from_mime("text/csv").unwrap(), DocumentKind::Csv);
        assert_eq!(
            kind_from_mime("text/csv; charset=utf-8").unwrap(),
            DocumentKind::Csv
        );
        assert_eq!(kind_from_mime("application/pdf").unwrap(), DocumentKind::Pdf);
        assert_eq!(kind_from_mime("image/png").unwrap(), DocumentKind::Image);
        assert_eq!(kind_from_mime("IMAGE/JPEG").unwrap(), DocumentKind::Image);
        assert!(matches!(
            kind_from_mime("text/html"),
            Err(Error::UnsupportedContentType(_))
        ));
    }
}
