//! The `Account` entity and its endpoints.
//!
//! Accounts are created by the user and only mutated through
//! user-initiated fields; the ingestion pipeline never touches them.

use axum::{
    extract::{Path, State},
    response::Response,
};
use axum::Json;
use rusqlite::{Connection, Row};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    auth::AuthContext,
    envelope::{self, double_option},
    store::{self, Store},
    Error,
};

/// The kind of financial account a statement belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    Checking,
    Savings,
    Credit,
    Investment,
    Other,
}

impl AccountType {
    pub fn as_str(self) -> &'static str {
        match self {
            AccountType::Checking => "checking",
            AccountType::Savings => "savings",
            AccountType::Credit => "credit",
            AccountType::Investment => "investment",
            AccountType::Other => "other",
        }
    }

    pub fn parse(value: &str) -> Result<Self, Error> {
        match value {
            "checking" => Ok(AccountType::Checking),
            "savings" => Ok(AccountType::Savings),
            "credit" => Ok(AccountType::Credit),
            "investment" => Ok(AccountType::Investment),
            "other" => Ok(AccountType::Other),
            other => Err(Error::Validation(format!("unknown account type '{other}'"))),
        }
    }
}

/// A financial account owned by exactly one user.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: AccountType,
    pub institution: Option<String>,
    pub last_four: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAccountRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: AccountType,
    pub institution: Option<String>,
    pub last_four: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UpdateAccountRequest {
    pub name: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub institution: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub last_four: Option<Option<String>>,
}

// ============================================================================
// ROUTE HANDLERS
// ============================================================================

/// Route handler listing the owner's accounts.
pub async fn list_accounts_endpoint(
    auth: AuthContext,
    State(store): State<Store>,
) -> Result<Response, Error> {
    let connection = store.lock();
    let accounts = list_accounts(&auth.owner_id, &connection)?;

    Ok(envelope::ok(accounts))
}

/// Route handler creating an account.
pub async fn create_account_endpoint(
    auth: AuthContext,
    State(store): State<Store>,
    Json(request): Json<CreateAccountRequest>,
) -> Result<Response, Error> {
    let connection = store.lock();
    let account = create_account(&auth.owner_id, request, &connection)?;

    Ok(envelope::created(account))
}

/// Route handler fetching a single account.
pub async fn get_account_endpoint(
    auth: AuthContext,
    Path(account_id): Path<String>,
    State(store): State<Store>,
) -> Result<Response, Error> {
    let connection = store.lock();
    let account = get_account(&auth.owner_id, &account_id, &connection)?;

    Ok(envelope::ok(account))
}

/// Route handler updating the user-initiated fields of an account.
pub async fn update_account_endpoint(
    auth: AuthContext,
    Path(account_id): Path<String>,
    State(store): State<Store>,
    Json(request): Json<UpdateAccountRequest>,
) -> Result<Response, Error> {
    let connection = store.lock();
    let account = update_account(&auth.owner_id, &account_id, request, &connection)?;

    Ok(envelope::ok(account))
}

/// Route handler deleting an account.
pub async fn delete_account_endpoint(
    auth: AuthContext,
    Path(account_id): Path<String>,
    State(store): State<Store>,
) -> Result<Response, Error> {
    let connection = store.lock();
    delete_account(&auth.owner_id, &account_id, &connection)?;

    Ok(envelope::ok(serde_json::json!({ "deleted": true })))
}

// ============================================================================
// DATABASE FUNCTIONS
// ============================================================================

/// Create an account for `owner_id`.
///
/// # Errors
/// Returns [Error::Validation] for an empty name or a malformed
/// `last_four`, or an SQL error.
pub fn create_account(
    owner_id: &str,
    request: CreateAccountRequest,
    connection: &Connection,
) -> Result<Account, Error> {
    let name = request.name.trim();
    if name.is_empty() {
        return Err(Error::Validation("account name cannot be empty".to_owned()));
    }

    validate_last_four(request.last_four.as_deref())?;

    let now = store::now();
    let account = Account {
        id: store::new_id(),
        owner_id: owner_id.to_owned(),
        name: name.to_owned(),
        kind: request.kind,
        institution: request.institution,
        last_four: request.last_four,
        created_at: now,
        updated_at: now,
    };

    connection.execute(
        "INSERT INTO accounts (id, owner_id, name, kind, institution, last_four, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        (
            &account.id,
            &account.owner_id,
            &account.name,
            account.kind.as_str(),
            &account.institution,
            &account.last_four,
            store::timestamp_ms(account.created_at),
            store::timestamp_ms(account.updated_at),
        ),
    )?;

    Ok(account)
}

/// Retrieve an account by id, scoped to `owner_id`.
///
/// # Errors
/// Returns [Error::NotFound] if the account does not exist for this owner.
pub fn get_account(
    owner_id: &str,
    account_id: &str,
    connection: &Connection,
) -> Result<Account, Error> {
    connection
        .prepare(
            "SELECT id, owner_id, name, kind, institution, last_four, created_at, updated_at
             FROM accounts WHERE id = ?1 AND owner_id = ?2",
        )?
        .query_row((account_id, owner_id), map_account_row)
        .map_err(Error::from)
}

/// Retrieve all accounts belonging to `owner_id`, ordered by name.
pub fn list_accounts(owner_id: &str, connection: &Connection) -> Result<Vec<Account>, Error> {
    connection
        .prepare(
            "SELECT id, owner_id, name, kind, institution, last_four, created_at, updated_at
             FROM accounts WHERE owner_id = ?1 ORDER BY name, id",
        )?
        .query_map([owner_id], map_account_row)?
        .map(|maybe_account| maybe_account.map_err(Error::from))
        .collect()
}

/// Update the user-initiated fields of an account.
///
/// # Errors
/// Returns [Error::NotFound] if the account does not exist for this owner.
pub fn update_account(
    owner_id: &str,
    account_id: &str,
    request: UpdateAccountRequest,
    connection: &Connection,
) -> Result<Account, Error> {
    let mut account = get_account(owner_id, account_id, connection)?;

    if let Some(name) = request.name {
        let name = name.trim().to_owned();
        if name.is_empty() {
            return Err(Error::Validation("account name cannot be empty".to_owned()));
        }
        account.name = name;
    }
    if let Some(institution) = request.institution {
        account.institution = institution;
    }
    if let Some(last_four) = request.last_four {
        validate_last_four(last_four.as_deref())?;
        account.last_four = last_four;
    }
    account.updated_at = store::now();

    let rows_affected = connection.execute(
        "UPDATE accounts SET name = ?1, institution = ?2, last_four = ?3, updated_at = ?4
         WHERE id = ?5 AND owner_id = ?6",
        (
            &account.name,
            &account.institution,
            &account.last_four,
            store::timestamp_ms(account.updated_at),
            account_id,
            owner_id,
        ),
    )?;

    if rows_affected == 0 {
        return Err(Error::NotFound);
    }

    Ok(account)
}

/// Delete an account.
///
/// # Errors
/// Returns [Error::NotFound] if the account does not exist for this owner.
pub fn delete_account(
    owner_id: &str,
    account_id: &str,
    connection: &Connection,
) -> Result<(), Error> {
    let rows_affected = connection.execute(
        "DELETE FROM accounts WHERE id = ?1 AND owner_id = ?2",
        (account_id, owner_id),
    )?;

    if rows_affected == 0 {
        return Err(Error::NotFound);
    }

    Ok(())
}

fn validate_last_four(last_four: Option<&str>) -> Result<(), Error> {
    match last_four {
        None => Ok(()),
        Some(digits) if digits.len() <= 4 && digits.chars().all(|c| c.is_ascii_digit()) => Ok(()),
        Some(other) => Err(Error::Validation(format!(
            "lastFour must be up to four digits, got '{other}'"
        ))),
    }
}

fn map_account_row(row: &Row) -> Result<Account, rusqlite::Error> {
    let kind: String = row.get(3)?;

    Ok(Account {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        name: row.get(2)?,
        kind: AccountType::parse(&kind).map_err(|_| {
            rusqlite::Error::FromSqlConversionFailure(
                3,
                rusqlite::types::Type::Text,
                format!("unknown account type '{kind}'").into(),
            )
        })?,
        institution: row.get(4)?,
        last_four: row.get(5)?,
        created_at: timestamp_column(row, 6)?,
        updated_at: timestamp_column(row, 7)?,
    })
}

/// Read a millisecond timestamp column as an [OffsetDateTime].
pub(crate) fn timestamp_column(row: &Row, index: usize) -> Result<OffsetDateTime, rusqlite::Error> {
    let ms: i64 = row.get(index)?;

    store::from_timestamp_ms(ms).map_err(|error| {
        rusqlite::Error::FromSqlConversionFailure(
            index,
            rusqlite::types::Type::Integer,
            error.to_string().into(),
        )
    })
}

#[cfg(test)]
mod account_tests {
    use super::*;
    use crate::store::Store;

    fn test_store() -> Store {
        Store::open_in_memory().expect("Could not open in-memory store")
    }

    fn checking(name: &str) -> CreateAccountRequest {
        CreateAccountRequest {
            name: name.to_owned(),
            kind: AccountType::Checking,
            institution: None,
            last_four: None,
        }
    }

    #[test]
    fn create_and_get_account() {
        let store = test_store();
        let connection = store.lock();

        let created = create_account("u-1", checking("Everyday"), &connection).unwrap();
        let fetched = get_account("u-1", &created.id, &connection).unwrap();

        assert_eq!(fetched.id, created.id);
        assert_eq!(fetched.name, "Everyday");
        assert_eq!(fetched.kind, AccountType::Checking);
    }

    #[test]
    fn cross_owner_lookup_is_not_found() {
        let store = test_store();
        let connection = store.lock();

        let created = create_account("u-1", checking("Everyday"), &connection).unwrap();
        let result = get_account("u-2", &created.id, &connection);

        assert!(matches!(result, Err(Error::NotFound)));
    }

    #[test]
    fn empty_name_is_rejected() {
        let store = test_store();
        let connection = store.lock();

        let result = create_account("u-1", checking("   "), &connection);

        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn invalid_last_four_is_rejected() {
        let store = test_store();
        let connection = store.lock();

        let mut request = checking("Card");
        request.last_four = Some("12345".to_owned());

        let result = create_account("u-1", request, &connection);

        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn list_accounts_is_owner_scoped_and_ordered() {
        let store = test_store();
        let connection = store.lock();

        create_account("u-1", checking("Beta"), &connection).unwrap();
        create_account("u-1", checking("Alpha"), &connection).unwrap();
        create_account("u-2", checking("Other"), &connection).unwrap();

        let accounts = list_accounts("u-1", &connection).unwrap();

        assert_eq!(accounts.len(), 2);
        assert_eq!(accounts[0].name, "Alpha");
        assert_eq!(accounts[1].name, "Beta");
    }

    #[test]
    fn update_account_changes_only_supplied_fields() {
        let store = test_store();
        let connection = store.lock();

        let mut request = checking("Everyday");
        request.institution = Some("First Bank".to_owned());
        let created = create_account("u-1", request, &connection).unwrap();

        let updated = update_account(
            "u-1",
            &created.id,
            UpdateAccountRequest {
                name: Some("Renamed".to_owned()),
                ..Default::default()
            },
            &connection,
        )
        .unwrap();

        assert_eq!(updated.name, "Renamed");
        assert_eq!(updated.institution.as_deref(), Some("First Bank"));
    }

    #[test]
    fn delete_missing_account_is_not_found() {
        let store = test_store();
        let connection = store.lock();

        let result = delete_account("u-1", "missing", &connection);

        assert!(matches!(result, Err(Error::NotFound)));
    }
}
