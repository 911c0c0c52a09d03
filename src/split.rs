//! The split/unsplit protocol: dividing a transaction into sibling
//! records whose amounts sum back to the parent.
//!
//! The parent stays in the store but is hidden from listings while split;
//! the children are the canonical visible records. Both directions run
//! inside one store transaction so no partial split is ever visible.

use axum::{
    extract::{Path, State},
    response::Response,
    Json,
};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::{
    auth::AuthContext,
    category::find_category,
    envelope,
    store::{self, Store},
    transaction::{
        get_transaction, insert_transaction, map_transaction_row, validate_notes, Explainability,
        Transaction,
    },
    Error,
};

/// Fewest parts a transaction can be split into.
pub const MIN_SPLITS: usize = 2;
/// Most parts a transaction can be split into.
pub const MAX_SPLITS: usize = 10;

/// One requested part of a split.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitItem {
    /// Signed cents; must carry the parent's sign.
    pub amount: i64,
    pub category_id: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitRequest {
    pub splits: Vec<SplitItem>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitOutcome {
    pub parent: Transaction,
    pub children: Vec<Transaction>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsplitOutcome {
    pub deleted: usize,
}

// ============================================================================
// ROUTE HANDLERS
// ============================================================================

/// Route handler splitting a transaction into parts.
pub async fn split_transaction_endpoint(
    auth: AuthContext,
    Path(transaction_id): Path<String>,
    State(store): State<Store>,
    Json(request): Json<SplitRequest>,
) -> Result<Response, Error> {
    let outcome = split_transaction(&auth.owner_id, &transaction_id, request.splits, &store)?;

    Ok(envelope::created(outcome))
}

/// Route handler undoing a split.
pub async fn unsplit_transaction_endpoint(
    auth: AuthContext,
    Path(transaction_id): Path<String>,
    State(store): State<Store>,
) -> Result<Response, Error> {
    let outcome = unsplit_transaction(&auth.owner_id, &transaction_id, &store)?;

    Ok(envelope::ok(outcome))
}

/// Route handler listing the children of a split transaction.
pub async fn list_splits_endpoint(
    auth: AuthContext,
    Path(transaction_id): Path<String>,
    State(store): State<Store>,
) -> Result<Response, Error> {
    let connection = store.lock();
    // 404 for transactions that do not exist for this owner.
    get_transaction(&auth.owner_id, &transaction_id, &connection)?;
    let children = get_split_children(&auth.owner_id, &transaction_id, &connection)?;

    Ok(envelope::ok(children))
}

// ============================================================================
// PROTOCOL
// ============================================================================

/// Split `transaction_id` into `splits` parts inside one store
/// transaction.
///
/// # Errors
/// Returns [Error::Validation] when the request breaks the protocol
/// (wrong part count, sum mismatch, sign mismatch, already split, or the
/// transaction is itself a split child) and [Error::NotFound] for an
/// unknown transaction or category.
pub fn split_transaction(
    owner_id: &str,
    transaction_id: &str,
    splits: Vec<SplitItem>,
    store: &Store,
) -> Result<SplitOutcome, Error> {
    store.run_in_transaction(|connection| {
        let mut parent = get_transaction(owner_id, transaction_id, connection)?;

        if parent.is_split_parent {
            return Err(Error::Validation(
                "the transaction is already split".to_owned(),
            ));
        }
        if parent.split_parent_id.is_some() {
            return Err(Error::Validation(
                "a split child cannot be split again".to_owned(),
            ));
        }
        if splits.len() < MIN_SPLITS || splits.len() > MAX_SPLITS {
            return Err(Error::Validation(format!(
                "a transaction splits into between {MIN_SPLITS} and {MAX_SPLITS} parts"
            )));
        }

        let total: i64 = splits.iter().map(|split| split.amount).sum();
        if total != parent.amount {
            return Err(Error::Validation(format!(
                "split amounts sum to {total} but the transaction amount is {}",
                parent.amount
            )));
        }
        if splits
            .iter()
            .any(|split| split.amount.signum() != parent.amount.signum())
        {
            return Err(Error::Validation(
                "every split amount must carry the transaction's sign".to_owned(),
            ));
        }

        for split in &splits {
            validate_notes(split.notes.as_deref())?;
            if let Some(category_id) = &split.category_id {
                find_category(owner_id, category_id, connection)?;
            }
        }

        let now = store::now();
        let part_count = splits.len();
        let mut children = Vec::with_capacity(part_count);

        for (index, split) in splits.into_iter().enumerate() {
            let part_number = index + 1;
            let manual_override = split.category_id.is_some();

            let child = Transaction {
                id: store::new_id(),
                owner_id: parent.owner_id.clone(),
                account_id: parent.account_id.clone(),
                import_id: parent.import_id.clone(),
                posted_at: parent.posted_at,
                amount: split.amount,
                description: format!(
                    "{} (Split {part_number}/{part_count})",
                    parent.description
                ),
                merchant_raw: parent.merchant_raw.clone(),
                merchant_normalized: parent.merchant_normalized.clone(),
                category_id: split.category_id,
                auto_category: manual_override.then(|| crate::transaction::AutoCategory {
                    category_id: None,
                    explainability: Explainability::split(),
                }),
                manual_override,
                explainability: Explainability::split(),
                notes: split.notes,
                tags: Vec::new(),
                corrected_at: None,
                is_split_parent: false,
                split_parent_id: Some(parent.id.clone()),
                receipt_line_items: None,
                tx_key: format!("{}_split_{part_number}", parent.tx_key),
                created_at: now,
                updated_at: now,
            };

            insert_transaction(&child, connection)?;
            children.push(child);
        }

        parent.is_split_parent = true;
        parent.updated_at = now;
        connection.execute(
            "UPDATE transactions SET is_split_parent = 1, updated_at = ?1
             WHERE id = ?2 AND owner_id = ?3",
            (
                store::timestamp_ms(parent.updated_at),
                &parent.id,
                owner_id,
            ),
        )?;

        Ok(SplitOutcome { parent, children })
    })
}

/// Delete the children of a split transaction and restore the parent's
/// visibility. Returns how many children were deleted.
///
/// # Errors
/// Returns [Error::Validation] if the transaction is not a split parent.
pub fn unsplit_transaction(
    owner_id: &str,
    transaction_id: &str,
    store: &Store,
) -> Result<UnsplitOutcome, Error> {
    store.run_in_transaction(|connection| {
        let parent = get_transaction(owner_id, transaction_id, connection)?;

        if !parent.is_split_parent {
            return Err(Error::Validation(
                "the transaction is not split".to_owned(),
            ));
        }

        let deleted = connection.execute(
            "DELETE FROM transactions WHERE owner_id = ?1 AND split_parent_id = ?2",
            (owner_id, transaction_id),
        )?;

        connection.execute(
            "UPDATE transactions SET is_split_parent = 0, updated_at = ?1
             WHERE id = ?2 AND owner_id = ?3",
            (
                store::timestamp_ms(store::now()),
                transaction_id,
                owner_id,
            ),
        )?;

        Ok(UnsplitOutcome { deleted })
    })
}

/// The children of a split transaction, in part order.
pub fn get_split_children(
    owner_id: &str,
    parent_id: &str,
    connection: &Connection,
) -> Result<Vec<Transaction>, Error> {
    connection
        .prepare(
            "SELECT id, owner_id, account_id, import_id, posted_at, amount, description,
                    merchant_raw, merchant_normalized, category_id, auto_category, manual_override,
                    explainability, notes, tags, corrected_at, is_split_parent, split_parent_id,
                    receipt_line_items, tx_key, created_at, updated_at
             FROM transactions
             WHERE owner_id = ?1 AND split_parent_id = ?2
             ORDER BY LENGTH(tx_key), tx_key",
        )?
        .query_map((owner_id, parent_id), map_transaction_row)?
        .map(|maybe_transaction| maybe_transaction.map_err(Error::from))
        .collect()
}

#[cfg(test)]
mod split_tests {
    use super::*;
    use crate::category::seed_default_categories;
    use crate::store::Store;
    use crate::transaction::test_fixtures::transaction;
    use crate::transaction::{list_transactions, Reason, TransactionQuery};

    fn seeded_store() -> Store {
        let store = Store::open_in_memory().unwrap();
        seed_default_categories(&store.lock()).unwrap();
        store
    }

    fn insert_parent(store: &Store, amount: i64) -> Transaction {
        let tx = transaction("u-1", "a-1", amount);
        insert_transaction(&tx, &store.lock()).unwrap();
        tx
    }

    fn part(amount: i64) -> SplitItem {
        SplitItem {
            amount,
            category_id: None,
            notes: None,
        }
    }

    #[test]
    fn split_divides_and_hides_the_parent() {
        let store = seeded_store();
        let parent = insert_parent(&store, -10000);

        let outcome = split_transaction(
            "u-1",
            &parent.id,
            vec![
                SplitItem {
                    amount: -4000,
                    category_id: Some("dining".to_owned()),
                    notes: None,
                },
                part(-3500),
                part(-2500),
            ],
            &store,
        )
        .unwrap();

        assert!(outcome.parent.is_split_parent);
        assert_eq!(outcome.children.len(), 3);
        assert_eq!(
            outcome.children.iter().map(|child| child.amount).sum::<i64>(),
            -10000
        );
        assert!(outcome.children[0].manual_override);
        assert!(!outcome.children[1].manual_override);
        assert_eq!(outcome.children[0].explainability.reason, Reason::Split);
        assert_eq!(
            outcome.children[1].description,
            format!("{} (Split 2/3)", parent.description)
        );
        assert_eq!(
            outcome.children[2].tx_key,
            format!("{}_split_3", parent.tx_key)
        );

        // The parent disappears from listings; the children are visible.
        let connection = store.lock();
        let page = list_transactions(
            &TransactionQuery {
                owner_id: "u-1".to_owned(),
                limit: 10,
                ..Default::default()
            },
            &connection,
        )
        .unwrap();
        let ids: Vec<_> = page.transactions.iter().map(|tx| tx.id.clone()).collect();
        assert!(!ids.contains(&parent.id));
        assert_eq!(page.transactions.len(), 3);
    }

    #[test]
    fn sum_mismatch_is_rejected_without_partial_state() {
        let store = seeded_store();
        let parent = insert_parent(&store, -10000);

        let result = split_transaction(
            "u-1",
            &parent.id,
            vec![part(-4000), part(-3000)],
            &store,
        );
        assert!(matches!(result, Err(Error::Validation(_))));

        let connection = store.lock();
        let reloaded = get_transaction("u-1", &parent.id, &connection).unwrap();
        assert!(!reloaded.is_split_parent);
        assert!(get_split_children("u-1", &parent.id, &connection)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn sign_mismatch_is_rejected() {
        let store = seeded_store();
        let parent = insert_parent(&store, -10000);

        let result = split_transaction(
            "u-1",
            &parent.id,
            vec![part(-11000), part(1000)],
            &store,
        );

        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn part_count_bounds_are_enforced() {
        let store = seeded_store();
        let parent = insert_parent(&store, -10000);

        let one = split_transaction("u-1", &parent.id, vec![part(-10000)], &store);
        assert!(matches!(one, Err(Error::Validation(_))));

        let eleven: Vec<SplitItem> = (0..11)
            .map(|index| part(if index == 0 { -10000 + 10 * 10 } else { -10 }))
            .collect();
        let too_many = split_transaction("u-1", &parent.id, eleven, &store);
        assert!(matches!(too_many, Err(Error::Validation(_))));
    }

    #[test]
    fn double_split_and_child_split_are_rejected() {
        let store = seeded_store();
        let parent = insert_parent(&store, -10000);

        let outcome =
            split_transaction("u-1", &parent.id, vec![part(-4000), part(-6000)], &store).unwrap();

        let again = split_transaction("u-1", &parent.id, vec![part(-5000), part(-5000)], &store);
        assert!(matches!(again, Err(Error::Validation(_))));

        let child_id = &outcome.children[0].id;
        let child_split =
            split_transaction("u-1", child_id, vec![part(-2000), part(-2000)], &store);
        assert!(matches!(child_split, Err(Error::Validation(_))));
    }

    #[test]
    fn unsplit_restores_the_parent() {
        let store = seeded_store();
        let parent = insert_parent(&store, -10000);

        split_transaction(
            "u-1",
            &parent.id,
            vec![part(-4000), part(-3500), part(-2500)],
            &store,
        )
        .unwrap();

        let outcome = unsplit_transaction("u-1", &parent.id, &store).unwrap();
        assert_eq!(outcome.deleted, 3);

        let connection = store.lock();
        let restored = get_transaction("u-1", &parent.id, &connection).unwrap();
        assert!(!restored.is_split_parent);
        assert_eq!(restored.amount, parent.amount);
        assert_eq!(restored.tx_key, parent.tx_key);
        assert!(get_split_children("u-1", &parent.id, &connection)
            .unwrap()
            .is_empty());

        let page = list_transactions(
            &TransactionQuery {
                owner_id: "u-1".to_owned(),
                limit: 10,
                ..Default::default()
            },
            &connection,
        )
        .unwrap();
        assert_eq!(page.transactions.len(), 1);
        assert_eq!(page.transactions[0].id, parent.id);
    }

    #[test]
    fn unsplit_of_an_unsplit_transaction_is_rejected() {
        let store = seeded_store();
        let parent = insert_parent(&store, -10000);

        let result = unsplit_transaction("u-1", &parent.id, &store);

        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn children_are_listed_in_part_order() {
        let store = seeded_store();
        let parent = insert_parent(&store, -10000);

        let amounts: Vec<SplitItem> = vec![
            part(-1000),
            part(-1000),
            part(-1000),
            part(-1000),
            part(-1000),
            part(-1000),
            part(-1000),
            part(-1000),
            part(-1000),
            part(-1000),
        ];
        split_transaction("u-1", &parent.id, amounts, &store).unwrap();

        let connection = store.lock();
        let children = get_split_children("u-1", &parent.id, &connection).unwrap();

        assert_eq!(children.len(), 10);
        for (index, child) in children.iter().enumerate() {
            assert_eq!(
                child.tx_key,
                format!("{}_split_{}", parent.tx_key, index + 1)
            );
        }
    }
}
