//! The `Category` entity: the default taxonomy plus per-user categories.
//!
//! Default categories have a NULL owner and are read-only for everyone;
//! user categories belong to exactly one owner.

use axum::{extract::State, response::Response};
use rusqlite::{Connection, Row};
use serde::Serialize;
use time::OffsetDateTime;

use crate::{
    account::timestamp_column,
    auth::AuthContext,
    envelope,
    store::{self, Store},
    Error,
};

/// A spending category.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub id: String,
    /// NULL for the built-in defaults.
    pub owner_id: Option<String>,
    pub name: String,
    pub icon: String,
    pub color: String,
    pub is_default: bool,
    pub parent_id: Option<String>,
    pub sort_order: i64,
    pub is_hidden: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// The built-in categories every owner sees. Ids are stable slugs so
/// rules and corrections can reference them across installs.
const DEFAULT_CATEGORIES: &[(&str, &str, &str, &str)] = &[
    ("groceries", "Groceries", "shopping-cart", "#4CAF50"),
    ("dining", "Dining", "utensils", "#FF7043"),
    ("transport", "Transport", "bus", "#42A5F5"),
    ("shopping", "Shopping", "shopping-bag", "#AB47BC"),
    ("utilities", "Utilities", "zap", "#FFCA28"),
    ("housing", "Housing", "home", "#8D6E63"),
    ("health", "Health", "heart", "#EF5350"),
    ("entertainment", "Entertainment", "film", "#7E57C2"),
    ("travel", "Travel", "plane", "#26A69A"),
    ("subscriptions", "Subscriptions", "repeat", "#5C6BC0"),
    ("fees", "Fees & Charges", "file-text", "#78909C"),
    ("income", "Income", "trending-up", "#66BB6A"),
];

/// Insert any missing default categories. Safe to call on every start up.
pub fn seed_default_categories(connection: &Connection) -> Result<(), Error> {
    let now = store::timestamp_ms(store::now());

    let mut statement = connection.prepare(
        "INSERT OR IGNORE INTO categories
         (id, owner_id, name, icon, color, is_default, parent_id, sort_order, is_hidden, created_at, updated_at)
         VALUES (?1, NULL, ?2, ?3, ?4, 1, NULL, ?5, 0, ?6, ?6)",
    )?;

    for (index, (id, name, icon, color)) in DEFAULT_CATEGORIES.iter().enumerate() {
        statement.execute((id, name, icon, color, index as i64, now))?;
    }

    Ok(())
}

/// Route handler listing the categories visible to the owner: the
/// defaults plus their own.
pub async fn list_categories_endpoint(
    auth: AuthContext,
    State(store): State<Store>,
) -> Result<Response, Error> {
    let connection = store.lock();
    let categories = list_categories(&auth.owner_id, &connection)?;

    Ok(envelope::ok(categories))
}

/// Retrieve the categories visible to `owner_id`: defaults first, then
/// the owner's, each ordered by sort order and name.
pub fn list_categories(owner_id: &str, connection: &Connection) -> Result<Vec<Category>, Error> {
    connection
        .prepare(
            "SELECT id, owner_id, name, icon, color, is_default, parent_id, sort_order, is_hidden,
                    created_at, updated_at
             FROM categories
             WHERE owner_id IS NULL OR owner_id = ?1
             ORDER BY is_default DESC, sort_order, name, id",
        )?
        .query_map([owner_id], map_category_row)?
        .map(|maybe_category| maybe_category.map_err(Error::from))
        .collect()
}

/// Retrieve a single category visible to `owner_id` (a default or one of
/// their own).
///
/// # Errors
/// Returns [Error::NotFound] if no such category is visible to the owner.
pub fn find_category(
    owner_id: &str,
    category_id: &str,
    connection: &Connection,
) -> Result<Category, Error> {
    connection
        .prepare(
            "SELECT id, owner_id, name, icon, color, is_default, parent_id, sort_order, is_hidden,
                    created_at, updated_at
             FROM categories
             WHERE id = ?1 AND (owner_id IS NULL OR owner_id = ?2)",
        )?
        .query_row((category_id, owner_id), map_category_row)
        .map_err(Error::from)
}

fn map_category_row(row: &Row) -> Result<Category, rusqlite::Error> {
    Ok(Category {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        name: row.get(2)?,
        icon: row.get(3)?,
        color: row.get(4)?,
        is_default: row.get(5)?,
        parent_id: row.get(6)?,
        sort_order: row.get(7)?,
        is_hidden: row.get(8)?,
        created_at: timestamp_column(row, 9)?,
        updated_at: timestamp_column(row, 10)?,
    })
}

#[cfg(test)]
mod category_tests {
    use super::*;
    use crate::store::Store;

    fn seeded_store() -> Store {
        let store = Store::open_in_memory().unwrap();
        seed_default_categories(&store.lock()).expect("Could not seed categories");
        store
    }

    #[test]
    fn seeding_is_idempotent() {
        let store = seeded_store();
        let connection = store.lock();

        seed_default_categories(&connection).unwrap();

        let count: i64 = connection
            .query_row("SELECT COUNT(*) FROM categories", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count as usize, super::DEFAULT_CATEGORIES.len());
    }

    #[test]
    fn defaults_are_visible_to_every_owner() {
        let store = seeded_store();
        let connection = store.lock();

        let categories = list_categories("anyone", &connection).unwrap();

        assert_eq!(categories.len(), super::DEFAULT_CATEGORIES.len());
        assert!(categories.iter().all(|category| category.is_default));
        assert!(categories.iter().all(|category| category.owner_id.is_none()));
    }

    #[test]
    fn find_category_resolves_defaults_and_misses() {
        let store = seeded_store();
        let connection = store.lock();

        let dining = find_category("anyone", "dining", &connection).unwrap();
        assert_eq!(dining.name, "Dining");

        let missing = find_category("anyone", "not-a-category", &connection);
        assert!(matches!(missing, Err(Error::NotFound)));
    }
}
