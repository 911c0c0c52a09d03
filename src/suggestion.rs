//! Rule suggestions: one-shot rule templates generated when a user
//! corrects a transaction's category, plus the dismissal bookkeeping that
//! stops a declined suggestion from coming back.
//!
//! Suggestions are not persisted; only accepting one creates a rule, and
//! only dismissing one leaves a trace.

use axum::{extract::State, response::Response, Json};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::{
    auth::AuthContext,
    category::find_category,
    envelope,
    rule::{
        create_rule, CreateRuleRequest, RuleAction, RuleConditions, RuleSource,
        DEFAULT_SUGGESTION_PRIORITY,
    },
    store::{self, Store},
    Error,
};

/// Merchants shorter than this produce no suggestion; the normalized
/// name carries too little signal to generalize from.
pub const MIN_MERCHANT_CHARS: usize = 3;

/// The rule template embedded in a suggestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestedRule {
    pub name: String,
    pub priority: i64,
    pub conditions: RuleConditions,
    pub action: RuleAction,
}

/// A one-shot suggestion offered in the response to a correction.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleSuggestion {
    /// Fresh opaque identifier; not a persisted entity id.
    pub id: String,
    pub message: String,
    pub rule: SuggestedRule,
}

/// Generate at most one suggestion for a correction that moved
/// `merchant_normalized` to `new_category_id`.
///
/// Suppressed when the merchant is too short, when an equivalent rule
/// already exists, or when the owner dismissed this exact suggestion
/// before.
pub fn generate_suggestion(
    owner_id: &str,
    merchant_normalized: &str,
    new_category_id: &str,
    connection: &Connection,
) -> Result<Option<RuleSuggestion>, Error> {
    let merchant = merchant_normalized.trim();
    if merchant.chars().count() < MIN_MERCHANT_CHARS {
        return Ok(None);
    }

    if rule_covers_merchant(owner_id, merchant, connection)? {
        return Ok(None);
    }

    if is_dismissed(owner_id, merchant, new_category_id, connection)? {
        return Ok(None);
    }

    let category = find_category(owner_id, new_category_id, connection)?;

    Ok(Some(RuleSuggestion {
        id: store::new_id(),
        message: format!(
            "Always categorize {merchant} as {}? Accepting creates a rule you can edit later.",
            category.name
        ),
        rule: SuggestedRule {
            name: format!("Categorize {merchant}"),
            priority: DEFAULT_SUGGESTION_PRIORITY,
            conditions: RuleConditions {
                merchant_contains: Some(merchant.to_owned()),
                ..Default::default()
            },
            action: RuleAction {
                category_id: new_category_id.to_owned(),
                add_tags: Vec::new(),
            },
        },
    }))
}

/// Whether any of the owner's rules already targets this merchant with an
/// exact or contains condition (case-insensitive).
fn rule_covers_merchant(
    owner_id: &str,
    merchant: &str,
    connection: &Connection,
) -> Result<bool, Error> {
    let merchant_lower = merchant.to_lowercase();

    let conditions: Vec<String> = connection
        .prepare("SELECT conditions FROM rules WHERE owner_id = ?1")?
        .query_map([owner_id], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;

    for raw in conditions {
        let Ok(parsed) = serde_json::from_str::<RuleConditions>(&raw) else {
            tracing::warn!("skipping undecodable rule conditions while suggesting");
            continue;
        };

        let covers = parsed
            .merchant_exact
            .as_deref()
            .is_some_and(|pattern| pattern.to_lowercase() == merchant_lower)
            || parsed
                .merchant_contains
                .as_deref()
                .is_some_and(|pattern| pattern.to_lowercase() == merchant_lower);

        if covers {
            return Ok(true);
        }
    }

    Ok(false)
}

fn is_dismissed(
    owner_id: &str,
    merchant: &str,
    category_id: &str,
    connection: &Connection,
) -> Result<bool, Error> {
    let count: i64 = connection.query_row(
        "SELECT COUNT(*) FROM dismissed_suggestions
         WHERE owner_id = ?1 AND merchant_normalized = ?2 AND category_id = ?3",
        (owner_id, merchant, category_id),
        |row| row.get(0),
    )?;

    Ok(count > 0)
}

// ============================================================================
// ROUTE HANDLERS
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DismissSuggestionRequest {
    pub merchant_normalized: String,
    pub category_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptSuggestionRequest {
    pub rule: SuggestedRule,
}

/// Route handler recording that a suggestion should not be offered again.
pub async fn dismiss_suggestion_endpoint(
    auth: AuthContext,
    State(store): State<Store>,
    Json(request): Json<DismissSuggestionRequest>,
) -> Result<Response, Error> {
    let connection = store.lock();
    dismiss_suggestion(
        &auth.owner_id,
        &request.merchant_normalized,
        &request.category_id,
        &connection,
    )?;

    Ok(envelope::ok(serde_json::json!({ "dismissed": true })))
}

/// Route handler turning an offered suggestion into a persisted rule.
pub async fn accept_suggestion_endpoint(
    auth: AuthContext,
    State(store): State<Store>,
    Json(request): Json<AcceptSuggestionRequest>,
) -> Result<Response, Error> {
    let connection = store.lock();
    let template = request.rule;

    let rule = create_rule(
        &auth.owner_id,
        CreateRuleRequest {
            name: template.name,
            enabled: Some(true),
            priority: Some(template.priority),
            conditions: template.conditions,
            action: template.action,
        },
        RuleSource::Suggestion,
        &connection,
    )?;

    Ok(envelope::created(rule))
}

/// Persist a dismissal. Repeated dismissals of the same suggestion are
/// idempotent.
pub fn dismiss_suggestion(
    owner_id: &str,
    merchant_normalized: &str,
    category_id: &str,
    connection: &Connection,
) -> Result<(), Error> {
    connection.execute(
        "INSERT OR IGNORE INTO dismissed_suggestions
         (id, owner_id, merchant_normalized, category_id, dismissed_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        (
            store::new_id(),
            owner_id,
            merchant_normalized,
            category_id,
            store::timestamp_ms(store::now()),
        ),
    )?;

    Ok(())
}

#[cfg(test)]
mod suggestion_tests {
    use super::*;
    use crate::category::seed_default_categories;
    use crate::rule::{get_rule, RuleSource};
    use crate::store::Store;

    fn seeded_store() -> Store {
        let store = Store::open_in_memory().unwrap();
        seed_default_categories(&store.lock()).unwrap();
        store
    }

    #[test]
    fn correction_produces_a_contains_suggestion() {
        let store = seeded_store();
        let connection = store.lock();

        let suggestion = generate_suggestion("u-1", "CHIPOTLE", "dining", &connection)
            .unwrap()
            .expect("a suggestion should be offered");

        assert_eq!(suggestion.rule.priority, 300);
        assert_eq!(
            suggestion.rule.conditions.merchant_contains.as_deref(),
            Some("CHIPOTLE")
        );
        assert_eq!(suggestion.rule.action.category_id, "dining");
        assert!(suggestion.message.contains("CHIPOTLE"));
        assert!(!suggestion.id.is_empty());
    }

    #[test]
    fn short_merchants_are_suppressed() {
        let store = seeded_store();
        let connection = store.lock();

        assert!(generate_suggestion("u-1", "AB", "dining", &connection)
            .unwrap()
            .is_none());
        assert!(generate_suggestion("u-1", "  A  ", "dining", &connection)
            .unwrap()
            .is_none());
    }

    #[test]
    fn accepting_creates_a_suggestion_sourced_rule_and_suppresses_repeats() {
        let store = seeded_store();
        let connection = store.lock();

        let suggestion = generate_suggestion("u-1", "CHIPOTLE", "dining", &connection)
            .unwrap()
            .expect("a suggestion should be offered");

        let rule = create_rule(
            "u-1",
            CreateRuleRequest {
                name: suggestion.rule.name.clone(),
                enabled: Some(true),
                priority: Some(suggestion.rule.priority),
                conditions: suggestion.rule.conditions.clone(),
                action: suggestion.rule.action.clone(),
            },
            RuleSource::Suggestion,
            &connection,
        )
        .unwrap();

        let reloaded = get_rule("u-1", &rule.id, &connection).unwrap();
        assert_eq!(reloaded.source, RuleSource::Suggestion);
        assert_eq!(reloaded.priority, 300);

        // The next CHIPOTLE correction finds the rule and stays quiet.
        let repeat = generate_suggestion("u-1", "CHIPOTLE", "groceries", &connection).unwrap();
        assert!(repeat.is_none());

        // Case differences do not defeat the check.
        let cased = generate_suggestion("u-1", "Chipotle", "dining", &connection).unwrap();
        assert!(cased.is_none());
    }

    #[test]
    fn dismissal_silences_exactly_that_pairing() {
        let store = seeded_store();
        let connection = store.lock();

        dismiss_suggestion("u-1", "CHIPOTLE", "dining", &connection).unwrap();
        // Dismissing twice is fine.
        dismiss_suggestion("u-1", "CHIPOTLE", "dining", &connection).unwrap();

        let suppressed = generate_suggestion("u-1", "CHIPOTLE", "dining", &connection).unwrap();
        assert!(suppressed.is_none());

        // A different category for the same merchant is still offered.
        let different = generate_suggestion("u-1", "CHIPOTLE", "groceries", &connection).unwrap();
        assert!(different.is_some());

        // Another owner is unaffected.
        let other_owner = generate_suggestion("u-2", "CHIPOTLE", "dining", &connection).unwrap();
        assert!(other_owner.is_some());
    }

    #[test]
    fn unknown_category_fails_loudly() {
        let store = seeded_store();
        let connection = store.lock();

        let result = generate_suggestion("u-1", "CHIPOTLE", "not-a-category", &connection);
        assert!(matches!(result, Err(Error::NotFound)));
    }
}
