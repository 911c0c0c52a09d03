//! The `Rule` entity and the deterministic rule engine.
//!
//! Rules categorize transactions without a model call: the engine filters
//! to enabled rules, walks them by priority, and the first match wins.
//! Match statistics are advanced out-of-band by the orchestrator and never
//! block a response.

use axum::{
    extract::{Path, State},
    response::Response,
    Json,
};
use regex::RegexBuilder;
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    account::timestamp_column,
    auth::AuthContext,
    category::find_category,
    envelope,
    store::{self, Store},
    transaction::{Explainability, MatchKind, Reason},
    Error,
};

/// Hard cap on rules per owner; bounds rule-engine cost.
pub const MAX_RULES_PER_OWNER: usize = 100;
/// Lowest priority a rule can take.
pub const MIN_PRIORITY: i64 = 1;
/// Highest priority a rule can take.
pub const MAX_PRIORITY: i64 = 1000;
/// Priority assigned to user-created rules without an explicit one.
pub const DEFAULT_USER_PRIORITY: i64 = 500;
/// Priority assigned to rules born from accepted suggestions.
pub const DEFAULT_SUGGESTION_PRIORITY: i64 = 300;
/// Longest regex pattern a rule may carry.
pub const MAX_REGEX_LENGTH: usize = 200;

/// Confidence attached to each textual match kind.
pub const CONFIDENCE_EXACT: f64 = 1.0;
pub const CONFIDENCE_CONTAINS: f64 = 0.8;
pub const CONFIDENCE_REGEX: f64 = 0.6;
pub const CONFIDENCE_DESCRIPTION: f64 = 0.5;

/// Pattern shapes with catastrophic backtracking potential, rejected at
/// rule-create time.
const REDOS_SHAPES: &[&str] = &["(.*)+", "(.+)+", "([^]+)+", "(.*)*", "(.+)*"];

// ============================================================================
// MODELS
// ============================================================================

/// The optional predicates of a rule. At least one must be set.
///
/// Account and amount predicates are gates: they can veto a match but
/// never produce one on their own.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuleConditions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    /// Inclusive lower bound in cents.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount_min: Option<i64>,
    /// Inclusive upper bound in cents.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount_max: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merchant_exact: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merchant_contains: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merchant_regex: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description_contains: Option<String>,
}

impl RuleConditions {
    /// Whether no predicate is set at all.
    pub fn is_empty(&self) -> bool {
        self.account_id.is_none()
            && self.amount_min.is_none()
            && self.amount_max.is_none()
            && self.merchant_exact.is_none()
            && self.merchant_contains.is_none()
            && self.merchant_regex.is_none()
            && self.description_contains.is_none()
    }
}

/// What a matching rule applies to a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleAction {
    pub category_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub add_tags: Vec<String>,
}

/// Where a rule came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleSource {
    User,
    Suggestion,
    System,
}

impl RuleSource {
    pub fn as_str(self) -> &'static str {
        match self {
            RuleSource::User => "user",
            RuleSource::Suggestion => "suggestion",
            RuleSource::System => "system",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(RuleSource::User),
            "suggestion" => Some(RuleSource::Suggestion),
            "system" => Some(RuleSource::System),
            _ => None,
        }
    }
}

/// A categorization rule owned by one user.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub enabled: bool,
    pub priority: i64,
    pub conditions: RuleConditions,
    pub action: RuleAction,
    pub source: RuleSource,
    pub match_count: i64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_matched_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

// ============================================================================
// RULE ENGINE
// ============================================================================

/// The fields of a transaction the engine matches against.
#[derive(Debug, Clone, Copy)]
pub struct RuleInput<'a> {
    pub account_id: &'a str,
    /// Signed cents.
    pub amount: i64,
    pub merchant_normalized: &'a str,
    pub description: &'a str,
}

/// The engine's verdict for one transaction.
#[derive(Debug, Clone)]
pub struct RuleOutcome {
    pub category_id: Option<String>,
    pub tags: Vec<String>,
    pub explainability: Explainability,
}

struct TextualMatch {
    kind: MatchKind,
    matched_value: String,
    matched_pattern: String,
    confidence: f64,
}

/// Run the rule engine over one transaction. Pure: the caller supplies
/// the rule set and the engine mutates nothing.
///
/// Enabled rules are walked in priority order (descending, then creation
/// order for a stable tie-break) and the first match wins.
pub fn categorize_with_rules(input: &RuleInput<'_>, rules: &[Rule]) -> RuleOutcome {
    let mut ordered: Vec<&Rule> = rules.iter().filter(|rule| rule.enabled).collect();
    ordered.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.created_at.cmp(&b.created_at))
            .then(a.id.cmp(&b.id))
    });

    for rule in ordered {
        if let Some(textual) = match_rule(input, &rule.conditions) {
            return RuleOutcome {
                category_id: Some(rule.action.category_id.clone()),
                tags: rule.action.add_tags.clone(),
                explainability: Explainability {
                    reason: Reason::RuleMatch,
                    rule_id: Some(rule.id.clone()),
                    rule_name: Some(rule.name.clone()),
                    match_type: Some(textual.kind),
                    matched_value: Some(textual.matched_value),
                    matched_pattern: Some(textual.matched_pattern),
                    confidence: textual.confidence,
                    timestamp: store::now(),
                    llm_model: None,
                    llm_reasoning: None,
                },
            };
        }
    }

    RuleOutcome {
        category_id: None,
        tags: Vec::new(),
        explainability: Explainability::no_match(),
    }
}

/// Test one rule against one transaction.
///
/// Conditions apply in a fixed order, short-circuiting: the account and
/// amount gates veto first, then the textual conditions are tried and the
/// first to match decides the match kind. A rule with only gates never
/// matches.
fn match_rule(input: &RuleInput<'_>, conditions: &RuleConditions) -> Option<TextualMatch> {
    if let Some(account_id) = &conditions.account_id {
        if account_id != input.account_id {
            return None;
        }
    }
    if let Some(amount_min) = conditions.amount_min {
        if input.amount < amount_min {
            return None;
        }
    }
    if let Some(amount_max) = conditions.amount_max {
        if input.amount > amount_max {
            return None;
        }
    }

    let merchant = input.merchant_normalized;
    let merchant_lower = merchant.to_lowercase();

    if let Some(pattern) = &conditions.merchant_exact {
        if merchant_lower == pattern.to_lowercase() {
            return Some(TextualMatch {
                kind: MatchKind::Exact,
                matched_value: merchant.to_owned(),
                matched_pattern: pattern.clone(),
                confidence: CONFIDENCE_EXACT,
            });
        }
    }

    if let Some(pattern) = &conditions.merchant_contains {
        if merchant_lower.contains(&pattern.to_lowercase()) {
            return Some(TextualMatch {
                kind: MatchKind::Contains,
                matched_value: merchant.to_owned(),
                matched_pattern: pattern.clone(),
                confidence: CONFIDENCE_CONTAINS,
            });
        }
    }

    if let Some(pattern) = &conditions.merchant_regex {
        match RegexBuilder::new(pattern).case_insensitive(true).build() {
            Ok(regex) => {
                if regex.is_match(merchant) {
                    return Some(TextualMatch {
                        kind: MatchKind::Regex,
                        matched_value: merchant.to_owned(),
                        matched_pattern: pattern.clone(),
                        confidence: CONFIDENCE_REGEX,
                    });
                }
            }
            Err(error) => {
                // Vetted at create time; a pattern that stopped compiling
                // is treated as non-matching.
                tracing::warn!("skipping invalid rule regex '{pattern}': {error}");
            }
        }
    }

    if let Some(pattern) = &conditions.description_contains {
        if input
            .description
            .to_lowercase()
            .contains(&pattern.to_lowercase())
        {
            return Some(TextualMatch {
                kind: MatchKind::Description,
                matched_value: input.description.to_owned(),
                matched_pattern: pattern.clone(),
                confidence: CONFIDENCE_DESCRIPTION,
            });
        }
    }

    None
}

/// Vet a regex pattern at rule-create time.
///
/// # Errors
/// Returns [Error::Validation] for over-long patterns, known
/// catastrophic-backtracking shapes, or patterns that do not compile.
pub fn validate_regex_pattern(pattern: &str) -> Result<(), Error> {
    if pattern.chars().count() > MAX_REGEX_LENGTH {
        return Err(Error::Validation(format!(
            "regex patterns are limited to {MAX_REGEX_LENGTH} characters"
        )));
    }

    if let Some(shape) = REDOS_SHAPES.iter().find(|shape| pattern.contains(**shape)) {
        return Err(Error::Validation(format!(
            "regex pattern contains the unsafe shape '{shape}'"
        )));
    }

    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|error| Error::Validation(format!("invalid regex pattern: {error}")))?;

    Ok(())
}

fn validate_conditions(conditions: &RuleConditions) -> Result<(), Error> {
    if conditions.is_empty() {
        return Err(Error::Validation(
            "a rule needs at least one condition".to_owned(),
        ));
    }

    if let Some(pattern) = &conditions.merchant_regex {
        validate_regex_pattern(pattern)?;
    }

    Ok(())
}

// ============================================================================
// ROUTE HANDLERS
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRuleRequest {
    pub name: String,
    pub enabled: Option<bool>,
    pub priority: Option<i64>,
    pub conditions: RuleConditions,
    pub action: RuleAction,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRuleRequest {
    pub name: Option<String>,
    pub enabled: Option<bool>,
    pub priority: Option<i64>,
    /// Replaces the whole condition bag when present.
    pub conditions: Option<RuleConditions>,
    pub action: Option<RuleAction>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReorderRulesRequest {
    pub rule_ids: Vec<String>,
}

/// Route handler listing the owner's rules, highest priority first.
pub async fn list_rules_endpoint(
    auth: AuthContext,
    State(store): State<Store>,
) -> Result<Response, Error> {
    let connection = store.lock();
    let rules = list_rules(&auth.owner_id, &connection)?;

    Ok(envelope::ok(rules))
}

/// Route handler creating a user rule.
pub async fn create_rule_endpoint(
    auth: AuthContext,
    State(store): State<Store>,
    Json(request): Json<CreateRuleRequest>,
) -> Result<Response, Error> {
    let connection = store.lock();
    let rule = create_rule(&auth.owner_id, request, RuleSource::User, &connection)?;

    Ok(envelope::created(rule))
}

/// Route handler fetching a single rule.
pub async fn get_rule_endpoint(
    auth: AuthContext,
    Path(rule_id): Path<String>,
    State(store): State<Store>,
) -> Result<Response, Error> {
    let connection = store.lock();
    let rule = get_rule(&auth.owner_id, &rule_id, &connection)?;

    Ok(envelope::ok(rule))
}

/// Route handler updating a rule.
pub async fn update_rule_endpoint(
    auth: AuthContext,
    Path(rule_id): Path<String>,
    State(store): State<Store>,
    Json(request): Json<UpdateRuleRequest>,
) -> Result<Response, Error> {
    let connection = store.lock();
    let rule = update_rule(&auth.owner_id, &rule_id, request, &connection)?;

    Ok(envelope::ok(rule))
}

/// Route handler deleting a rule. Existing transactions keep their
/// categories; deletion only stops future matches.
pub async fn delete_rule_endpoint(
    auth: AuthContext,
    Path(rule_id): Path<String>,
    State(store): State<Store>,
) -> Result<Response, Error> {
    let connection = store.lock();
    delete_rule(&auth.owner_id, &rule_id, &connection)?;

    Ok(envelope::ok(serde_json::json!({ "deleted": true })))
}

/// Route handler assigning priorities from an ordered id list.
pub async fn reorder_rules_endpoint(
    auth: AuthContext,
    State(store): State<Store>,
    Json(request): Json<ReorderRulesRequest>,
) -> Result<Response, Error> {
    let reordered = store
        .run_in_transaction(|connection| reorder_rules(&auth.owner_id, &request.rule_ids, connection))?;

    Ok(envelope::ok(serde_json::json!({ "reordered": reordered })))
}

// ============================================================================
// DATABASE FUNCTIONS
// ============================================================================

const RULE_COLUMNS: &str = "id, owner_id, name, enabled, priority, conditions, action, source, \
     match_count, last_matched_at, created_at, updated_at";

/// Create a rule for `owner_id`.
///
/// Priorities outside `[1, 1000]` are clamped. Creation fails once the
/// owner holds [MAX_RULES_PER_OWNER] rules.
///
/// # Errors
/// Returns [Error::Validation] for zero-condition rules, unsafe regexes,
/// or an exhausted quota, and [Error::NotFound] for an unknown target
/// category.
pub fn create_rule(
    owner_id: &str,
    request: CreateRuleRequest,
    source: RuleSource,
    connection: &Connection,
) -> Result<Rule, Error> {
    let name = request.name.trim();
    if name.is_empty() {
        return Err(Error::Validation("rule name cannot be empty".to_owned()));
    }

    validate_conditions(&request.conditions)?;
    find_category(owner_id, &request.action.category_id, connection)?;

    let rule_count: i64 = connection.query_row(
        "SELECT COUNT(*) FROM rules WHERE owner_id = ?1",
        [owner_id],
        |row| row.get(0),
    )?;
    if rule_count as usize >= MAX_RULES_PER_OWNER {
        return Err(Error::Validation(format!(
            "the rule limit of {MAX_RULES_PER_OWNER} has been reached"
        )));
    }

    let default_priority = match source {
        RuleSource::Suggestion => DEFAULT_SUGGESTION_PRIORITY,
        _ => DEFAULT_USER_PRIORITY,
    };
    let priority = request
        .priority
        .unwrap_or(default_priority)
        .clamp(MIN_PRIORITY, MAX_PRIORITY);

    let now = store::now();
    let rule = Rule {
        id: store::new_id(),
        owner_id: owner_id.to_owned(),
        name: name.to_owned(),
        enabled: request.enabled.unwrap_or(true),
        priority,
        conditions: request.conditions,
        action: request.action,
        source,
        match_count: 0,
        last_matched_at: None,
        created_at: now,
        updated_at: now,
    };

    connection.execute(
        &format!(
            "INSERT INTO rules ({RULE_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
        ),
        params![
            rule.id,
            rule.owner_id,
            rule.name,
            rule.enabled,
            rule.priority,
            serde_json::to_string(&rule.conditions)
                .map_err(|error| Error::Validation(error.to_string()))?,
            serde_json::to_string(&rule.action)
                .map_err(|error| Error::Validation(error.to_string()))?,
            rule.source.as_str(),
            rule.match_count,
            rule.last_matched_at.map(store::timestamp_ms),
            store::timestamp_ms(rule.created_at),
            store::timestamp_ms(rule.updated_at),
        ],
    )?;

    Ok(rule)
}

/// Retrieve a rule by id, scoped to `owner_id`.
pub fn get_rule(owner_id: &str, rule_id: &str, connection: &Connection) -> Result<Rule, Error> {
    connection
        .prepare(&format!(
            "SELECT {RULE_COLUMNS} FROM rules WHERE id = ?1 AND owner_id = ?2"
        ))?
        .query_row((rule_id, owner_id), map_rule_row)
        .map_err(Error::from)
}

/// Retrieve all rules for `owner_id`, highest priority first.
pub fn list_rules(owner_id: &str, connection: &Connection) -> Result<Vec<Rule>, Error> {
    connection
        .prepare(&format!(
            "SELECT {RULE_COLUMNS} FROM rules WHERE owner_id = ?1
             ORDER BY priority DESC, created_at ASC, id ASC"
        ))?
        .query_map([owner_id], map_rule_row)?
        .map(|maybe_rule| maybe_rule.map_err(Error::from))
        .collect()
}

/// Retrieve the enabled rules for `owner_id` in evaluation order. The
/// orchestrator loads these once per call.
pub fn load_enabled_rules(owner_id: &str, connection: &Connection) -> Result<Vec<Rule>, Error> {
    connection
        .prepare(&format!(
            "SELECT {RULE_COLUMNS} FROM rules WHERE owner_id = ?1 AND enabled = 1
             ORDER BY priority DESC, created_at ASC, id ASC"
        ))?
        .query_map([owner_id], map_rule_row)?
        .map(|maybe_rule| maybe_rule.map_err(Error::from))
        .collect()
}

/// Update a rule with partial fields.
///
/// # Errors
/// Returns [Error::NotFound] for an unknown rule and [Error::Validation]
/// when the update would leave the rule without conditions or with an
/// unsafe regex.
pub fn update_rule(
    owner_id: &str,
    rule_id: &str,
    request: UpdateRuleRequest,
    connection: &Connection,
) -> Result<Rule, Error> {
    let mut rule = get_rule(owner_id, rule_id, connection)?;

    if let Some(name) = request.name {
        let name = name.trim().to_owned();
        if name.is_empty() {
            return Err(Error::Validation("rule name cannot be empty".to_owned()));
        }
        rule.name = name;
    }
    if let Some(enabled) = request.enabled {
        rule.enabled = enabled;
    }
    if let Some(priority) = request.priority {
        rule.priority = priority.clamp(MIN_PRIORITY, MAX_PRIORITY);
    }
    if let Some(conditions) = request.conditions {
        rule.conditions = conditions;
    }
    if let Some(action) = request.action {
        find_category(owner_id, &action.category_id, connection)?;
        rule.action = action;
    }

    validate_conditions(&rule.conditions)?;
    rule.updated_at = store::now();

    let rows_affected = connection.execute(
        "UPDATE rules
         SET name = ?1, enabled = ?2, priority = ?3, conditions = ?4, action = ?5, updated_at = ?6
         WHERE id = ?7 AND owner_id = ?8",
        params![
            rule.name,
            rule.enabled,
            rule.priority,
            serde_json::to_string(&rule.conditions)
                .map_err(|error| Error::Validation(error.to_string()))?,
            serde_json::to_string(&rule.action)
                .map_err(|error| Error::Validation(error.to_string()))?,
            store::timestamp_ms(rule.updated_at),
            rule_id,
            owner_id,
        ],
    )?;

    if rows_affected == 0 {
        return Err(Error::NotFound);
    }

    Ok(rule)
}

/// Delete a rule.
pub fn delete_rule(owner_id: &str, rule_id: &str, connection: &Connection) -> Result<(), Error> {
    let rows_affected = connection.execute(
        "DELETE FROM rules WHERE id = ?1 AND owner_id = ?2",
        (rule_id, owner_id),
    )?;

    if rows_affected == 0 {
        return Err(Error::NotFound);
    }

    Ok(())
}

/// Assign priorities `1000, 999, …` following the order of `rule_ids`.
/// Ids that do not resolve are skipped; rules absent from the list keep
/// their priority. Returns how many rules were updated.
pub fn reorder_rules(
    owner_id: &str,
    rule_ids: &[String],
    connection: &Connection,
) -> Result<usize, Error> {
    let now = store::timestamp_ms(store::now());
    let mut reordered = 0;

    let mut statement = connection.prepare(
        "UPDATE rules SET priority = ?1, updated_at = ?2 WHERE id = ?3 AND owner_id = ?4",
    )?;

    for (index, rule_id) in rule_ids.iter().enumerate() {
        let priority = (MAX_PRIORITY - index as i64).max(MIN_PRIORITY);
        reordered += statement.execute(params![priority, now, rule_id, owner_id])?;
    }

    Ok(reordered)
}

/// Advance a rule's match statistics. Called fire-and-forget from the
/// orchestrator; losing a racing increment is acceptable.
pub fn bump_rule_stats(
    owner_id: &str,
    rule_id: &str,
    connection: &Connection,
) -> Result<(), Error> {
    connection.execute(
        "UPDATE rules SET match_count = match_count + 1, last_matched_at = ?1
         WHERE id = ?2 AND owner_id = ?3",
        params![store::timestamp_ms(store::now()), rule_id, owner_id],
    )?;

    Ok(())
}

fn map_rule_row(row: &Row) -> Result<Rule, rusqlite::Error> {
    let conditions: String = row.get(5)?;
    let action: String = row.get(6)?;
    let source: String = row.get(7)?;
    let last_matched_at: Option<i64> = row.get(9)?;

    Ok(Rule {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        name: row.get(2)?,
        enabled: row.get(3)?,
        priority: row.get(4)?,
        conditions: serde_json::from_str(&conditions).map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(error))
        })?,
        action: serde_json::from_str(&action).map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(error))
        })?,
        source: RuleSource::parse(&source).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                7,
                rusqlite::types::Type::Text,
                format!("unknown rule source '{source}'").into(),
            )
        })?,
        match_count: row.get(8)?,
        last_matched_at: match last_matched_at {
            None => None,
            Some(ms) => Some(store::from_timestamp_ms(ms).map_err(|error| {
                rusqlite::Error::FromSqlConversionFailure(
                    9,
                    rusqlite::types::Type::Integer,
                    error.to_string().into(),
                )
            })?),
        },
        created_at: timestamp_column(row, 10)?,
        updated_at: timestamp_column(row, 11)?,
    })
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::*;

    /// An in-memory rule for engine tests, bypassing the store.
    pub fn rule(priority: i64, conditions: RuleConditions, category_id: &str) -> Rule {
        let now = store::now();

        Rule {
            id: store::new_id(),
            owner_id: "u-1".to_owned(),
            name: format!("rule p{priority}"),
            enabled: true,
            priority,
            conditions,
            action: RuleAction {
                category_id: category_id.to_owned(),
                add_tags: Vec::new(),
            },
            source: RuleSource::User,
            match_count: 0,
            last_matched_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn contains(pattern: &str) -> RuleConditions {
        RuleConditions {
            merchant_contains: Some(pattern.to_owned()),
            ..Default::default()
        }
    }

    pub fn exact(pattern: &str) -> RuleConditions {
        RuleConditions {
            merchant_exact: Some(pattern.to_owned()),
            ..Default::default()
        }
    }
}


#[cfg(test)]
mod rule_lifecycle_tests {
    use super::*;
    use crate::category::seed_default_categories;
    use crate::store::Store;

    fn seeded_store() -> Store {
        let store = Store::open_in_memory().unwrap();
        seed_default_categories(&store.lock()).unwrap();
        store
    }

    fn request(name: &str, priority: Option<i64>) -> CreateRuleRequest {
        CreateRuleRequest {
            name: name.to_owned(),
            enabled: None,
            priority,
            conditions: RuleConditions {
                merchant_contains: Some("STARBUCKS".to_owned()),
                ..Default::default()
            },
            action: RuleAction {
                category_id: "dining".to_owned(),
                add_tags: Vec::new(),
            },
        }
    }

    #[test]
    fn create_defaults_by_source() {
        let store = seeded_store();
        let connection = store.lock();

        let user_rule =
            create_rule("u-1", request("user rule", None), RuleSource::User, &connection).unwrap();
        assert_eq!(user_rule.priority, DEFAULT_USER_PRIORITY);
        assert!(user_rule.enabled);

        let suggested = create_rule(
            "u-1",
            request("suggested rule", None),
            RuleSource::Suggestion,
            &connection,
        )
        .unwrap();
        assert_eq!(suggested.priority, DEFAULT_SUGGESTION_PRIORITY);
        assert_eq!(suggested.source, RuleSource::Suggestion);
    }

    #[test]
    fn priority_is_clamped_on_create_and_update() {
        let store = seeded_store();
        let connection = store.lock();

        let low = create_rule("u-1", request("low", Some(0)), RuleSource::User, &connection).unwrap();
        assert_eq!(low.priority, MIN_PRIORITY);

        let high =
            create_rule("u-1", request("high", Some(1001)), RuleSource::User, &connection).unwrap();
        assert_eq!(high.priority, MAX_PRIORITY);

        let updated = update_rule(
            "u-1",
            &low.id,
            UpdateRuleRequest {
                priority: Some(5000),
                ..Default::default()
            },
            &connection,
        )
        .unwrap();
        assert_eq!(updated.priority, MAX_PRIORITY);
    }

    #[test]
    fn zero_condition_rules_are_rejected() {
        let store = seeded_store();
        let connection = store.lock();

        let mut bare = request("bare", None);
        bare.conditions = RuleConditions::default();

        let result = create_rule("u-1", bare, RuleSource::User, &connection);
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn unknown_target_category_is_rejected() {
        let store = seeded_store();
        let connection = store.lock();

        let mut bad = request("bad", None);
        bad.action.category_id = "not-a-category".to_owned();

        let result = create_rule("u-1", bad, RuleSource::User, &connection);
        assert!(matches!(result, Err(Error::NotFound)));
    }

    #[test]
    fn regex_vetting_boundaries() {
        assert!(validate_regex_pattern(&"a".repeat(200)).is_ok());
        assert!(validate_regex_pattern(&"a".repeat(201)).is_err());

        for shape in ["(.*)+", "(.+)+", "([^]+)+", "(.*)*", "(.+)*"] {
            let pattern = format!("^{shape}$");
            assert!(
                validate_regex_pattern(&pattern).is_err(),
                "{shape} should be rejected"
            );
        }

        assert!(validate_regex_pattern("(unclosed").is_err());
        assert!(validate_regex_pattern("^UBER (TRIP|EATS)").is_ok());
    }

    #[test]
    fn rule_cap_is_enforced_and_freed_by_deletion() {
        let store = seeded_store();
        let connection = store.lock();

        for index in 0..MAX_RULES_PER_OWNER {
            create_rule(
                "u-1",
                request(&format!("rule {index}"), None),
                RuleSource::User,
                &connection,
            )
            .unwrap();
        }

        let over_cap = create_rule("u-1", request("one too many", None), RuleSource::User, &connection);
        assert!(matches!(over_cap, Err(Error::Validation(_))));

        // Another owner has their own quota.
        create_rule("u-2", request("other owner", None), RuleSource::User, &connection).unwrap();

        let victim = list_rules("u-1", &connection).unwrap().pop().unwrap();
        delete_rule("u-1", &victim.id, &connection).unwrap();
        create_rule("u-1", request("fits again", None), RuleSource::User, &connection).unwrap();
    }

    #[test]
    fn update_cannot_empty_the_conditions() {
        let store = seeded_store();
        let connection = store.lock();

        let rule = create_rule("u-1", request("rule", None), RuleSource::User, &connection).unwrap();

        let result = update_rule(
            "u-1",
            &rule.id,
            UpdateRuleRequest {
                conditions: Some(RuleConditions::default()),
                ..Default::default()
            },
            &connection,
        );

        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn reorder_assigns_descending_priorities_and_skips_absent_ids() {
        let store = seeded_store();
        let connection = store.lock();

        let first = create_rule("u-1", request("first", Some(10)), RuleSource::User, &connection).unwrap();
        let second =
            create_rule("u-1", request("second", Some(20)), RuleSource::User, &connection).unwrap();
        let untouched =
            create_rule("u-1", request("untouched", Some(30)), RuleSource::User, &connection).unwrap();

        let reordered = reorder_rules(
            "u-1",
            &[
                second.id.clone(),
                "missing-rule".to_owned(),
                first.id.clone(),
            ],
            &connection,
        )
        .unwrap();
        assert_eq!(reordered, 2);

        assert_eq!(get_rule("u-1", &second.id, &connection).unwrap().priority, 1000);
        // The missing id still consumes a slot in the sequence.
        assert_eq!(get_rule("u-1", &first.id, &connection).unwrap().priority, 998);
        assert_eq!(
            get_rule("u-1", &untouched.id, &connection).unwrap().priority,
            30
        );
    }

    #[test]
    fn bump_rule_stats_advances_counters() {
        let store = seeded_store();
        let connection = store.lock();

        let rule = create_rule("u-1", request("rule", None), RuleSource::User, &connection).unwrap();
        bump_rule_stats("u-1", &rule.id, &connection).unwrap();
        bump_rule_stats("u-1", &rule.id, &connection).unwrap();

        let reloaded = get_rule("u-1", &rule.id, &connection).unwrap();
        assert_eq!(reloaded.match_count, 2);
        assert!(reloaded.last_matched_at.is_some());
    }

    #[test]
    fn deleting_a_missing_rule_is_not_found() {
        let store = seeded_store();
        let connection = store.lock();

        assert!(matches!(
            delete_rule("u-1", "missing", &connection),
            Err(Error::NotFound)
        ));
    }
}
