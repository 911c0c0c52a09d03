//! The categorization orchestrator: combines the rule engine and the LLM
//! classifier under a confidence gate.
//!
//! A rule match at or above the gate short-circuits the classifier; below
//! it the classifier gets the last word, and when it has no answer the
//! transaction stays uncategorized with the classifier's reasoning kept
//! for the audit trail. Classifier failures never fail a request.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{extract::FromRef, extract::State, response::Response, Json};
use serde::{Deserialize, Serialize};

use crate::{
    app_state::AppState,
    auth::AuthContext,
    category::list_categories,
    envelope,
    llm::{classify_batch, CategoryChoice, Classifier, ClassifyItem, LlmClient},
    rule::{bump_rule_stats, categorize_with_rules, load_enabled_rules, Rule, RuleInput},
    store::Store,
    transaction::{get_transaction, update_categorization, Explainability, Reason},
    Error,
};

/// Rule matches at or above this confidence skip the classifier.
pub const CONFIDENCE_GATE: f64 = 0.7;

/// The orchestrator's verdict for one transaction.
#[derive(Debug, Clone)]
pub struct CategorizeOutcome {
    pub category_id: Option<String>,
    pub tags: Vec<String>,
    pub explainability: Explainability,
    /// The rule whose statistics should be advanced, when a rule won.
    pub matched_rule_id: Option<String>,
}

/// The fields of one not-yet-persisted transaction the batch flow works on.
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub id: String,
    pub account_id: String,
    /// Signed cents.
    pub amount: i64,
    pub merchant_normalized: String,
    pub merchant_raw: String,
    pub description: String,
}

/// Run the single-transaction flow.
///
/// `classifier` is `None` when LLM categorization is disabled by
/// configuration; the rule result is then returned as-is, even below the
/// gate.
pub async fn categorize_transaction<C: Classifier>(
    item: &BatchItem,
    rules: &[Rule],
    categories: &[CategoryChoice],
    classifier: Option<&C>,
) -> CategorizeOutcome {
    let rule_outcome = categorize_with_rules(
        &RuleInput {
            account_id: &item.account_id,
            amount: item.amount,
            merchant_normalized: &item.merchant_normalized,
            description: &item.description,
        },
        rules,
    );

    let gate_passed = rule_outcome.category_id.is_some()
        && rule_outcome.explainability.confidence >= CONFIDENCE_GATE;

    if gate_passed {
        let matched_rule_id = rule_outcome.explainability.rule_id.clone();
        return CategorizeOutcome {
            category_id: rule_outcome.category_id,
            tags: rule_outcome.tags,
            explainability: rule_outcome.explainability,
            matched_rule_id,
        };
    }

    let Some(classifier) = classifier else {
        let matched_rule_id = rule_outcome.explainability.rule_id.clone();
        return CategorizeOutcome {
            category_id: rule_outcome.category_id,
            tags: rule_outcome.tags,
            explainability: rule_outcome.explainability,
            matched_rule_id,
        };
    };

    let classification = classifier
        .classify(
            &ClassifyItem {
                description: item.description.clone(),
                merchant_raw: item.merchant_raw.clone(),
                amount: item.amount,
            },
            categories,
        )
        .await;

    merge_classification(rule_outcome, classification)
}

/// Combine a below-gate rule outcome with the classifier's verdict.
///
/// An answered classification wins; an unreachable classifier falls back
/// to whatever rule result was already computed; a reachable classifier
/// with no answer leaves the transaction uncategorized but keeps the
/// reasoning for the audit trail.
fn merge_classification(
    rule_outcome: crate::rule::RuleOutcome,
    classification: crate::llm::Classification,
) -> CategorizeOutcome {
    if classification.category_id.is_none() && classification.unavailable {
        tracing::debug!("classifier unavailable, keeping the rule result");
        let matched_rule_id = rule_outcome.explainability.rule_id.clone();
        return CategorizeOutcome {
            category_id: rule_outcome.category_id,
            tags: rule_outcome.tags,
            explainability: rule_outcome.explainability,
            matched_rule_id,
        };
    }

    let mut explainability = Explainability::no_match();
    explainability.llm_model = classification.model;
    if !classification.reasoning.is_empty() {
        explainability.llm_reasoning = Some(classification.reasoning);
    }

    match classification.category_id {
        Some(category_id) => {
            explainability.reason = Reason::Llm;
            explainability.confidence = classification.confidence;

            CategorizeOutcome {
                category_id: Some(category_id),
                tags: Vec::new(),
                explainability,
                matched_rule_id: None,
            }
        }
        None => CategorizeOutcome {
            category_id: None,
            tags: Vec::new(),
            explainability,
            matched_rule_id: None,
        },
    }
}

/// Run the batch flow: one rule pass over every item, then the bounded
/// classifier batch over the ones failing the gate, merged by item id.
pub async fn categorize_items<C>(
    items: &[BatchItem],
    rules: &[Rule],
    categories: &[CategoryChoice],
    classifier: Option<Arc<C>>,
) -> HashMap<String, CategorizeOutcome>
where
    C: Classifier + 'static,
{
    let mut outcomes: HashMap<String, CategorizeOutcome> = HashMap::new();
    let mut second_pass: Vec<(String, ClassifyItem)> = Vec::new();
    let mut rule_results: HashMap<String, crate::rule::RuleOutcome> = HashMap::new();

    for item in items {
        let rule_outcome = categorize_with_rules(
            &RuleInput {
                account_id: &item.account_id,
                amount: item.amount,
                merchant_normalized: &item.merchant_normalized,
                description: &item.description,
            },
            rules,
        );

        let gate_passed = rule_outcome.category_id.is_some()
            && rule_outcome.explainability.confidence >= CONFIDENCE_GATE;

        if gate_passed || classifier.is_none() {
            let matched_rule_id = rule_outcome.explainability.rule_id.clone();
            outcomes.insert(
                item.id.clone(),
                CategorizeOutcome {
                    category_id: rule_outcome.category_id,
                    tags: rule_outcome.tags,
                    explainability: rule_outcome.explainability,
                    matched_rule_id,
                },
            );
        } else {
            second_pass.push((
                item.id.clone(),
                ClassifyItem {
                    description: item.description.clone(),
                    merchant_raw: item.merchant_raw.clone(),
                    amount: item.amount,
                },
            ));
            rule_results.insert(item.id.clone(), rule_outcome);
        }
    }

    if let (Some(classifier), false) = (classifier, second_pass.is_empty()) {
        let classifications = classify_batch(classifier, second_pass, categories.to_vec()).await;

        for (id, classification) in classifications {
            let rule_outcome = rule_results.remove(&id).unwrap_or_else(|| {
                crate::rule::RuleOutcome {
                    category_id: None,
                    tags: Vec::new(),
                    explainability: Explainability::no_match(),
                }
            });
            outcomes.insert(id, merge_classification(rule_outcome, classification));
        }
    }

    outcomes
}

/// Advance a winning rule's statistics without blocking the response.
/// Racing increments may lose updates; the counters are best-effort.
pub fn spawn_rule_stat_bump(store: Store, owner_id: String, rule_id: String) {
    tokio::spawn(async move {
        let connection = store.lock();
        if let Err(error) = bump_rule_stats(&owner_id, &rule_id, &connection) {
            tracing::debug!("rule stat update lost for {rule_id}: {error}");
        }
    });
}

// ============================================================================
// RECATEGORIZATION
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecategorizeRequest {
    pub transaction_ids: Vec<String>,
    #[serde(default)]
    pub include_manual_overrides: bool,
}

#[derive(Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecategorizeOutcome {
    pub updated: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// The state the orchestrator endpoints need.
#[derive(Clone)]
pub struct CategorizeState {
    pub store: Store,
    pub llm: Arc<LlmClient>,
    pub llm_enabled: bool,
}

impl FromRef<AppState> for CategorizeState {
    fn from_ref(state: &AppState) -> Self {
        Self {
            store: state.store.clone(),
            llm: Arc::clone(&state.llm),
            llm_enabled: state.config.llm_categorization_enabled,
        }
    }
}

/// Route handler re-running categorization over a set of transactions.
pub async fn recategorize_endpoint(
    auth: AuthContext,
    State(state): State<CategorizeState>,
    Json(request): Json<RecategorizeRequest>,
) -> Result<Response, Error> {
    let classifier = state.llm_enabled.then(|| Arc::clone(&state.llm));

    let outcome = recategorize(
        &auth.owner_id,
        &request.transaction_ids,
        request.include_manual_overrides,
        &state.store,
        classifier,
    )
    .await?;

    Ok(envelope::ok(outcome))
}

/// Re-run the single-transaction flow over `transaction_ids`, updating
/// only transactions whose category actually changes. Errors are
/// per-transaction and never fail the scan.
pub async fn recategorize<C>(
    owner_id: &str,
    transaction_ids: &[String],
    include_manual_overrides: bool,
    store: &Store,
    classifier: Option<Arc<C>>,
) -> Result<RecategorizeOutcome, Error>
where
    C: Classifier + 'static,
{
    // Rules and categories are loaded once per scan.
    let (rules, categories) = {
        let connection = store.lock();
        let rules = load_enabled_rules(owner_id, &connection)?;
        let categories: Vec<CategoryChoice> = list_categories(owner_id, &connection)?
            .into_iter()
            .map(|category| CategoryChoice {
                id: category.id,
                name: category.name,
            })
            .collect();
        (rules, categories)
    };

    let mut outcome = RecategorizeOutcome::default();

    for transaction_id in transaction_ids {
        let transaction = {
            let connection = store.lock();
            get_transaction(owner_id, transaction_id, &connection)
        };

        let transaction = match transaction {
            Ok(transaction) => transaction,
            Err(Error::NotFound) => {
                outcome.errors += 1;
                continue;
            }
            Err(error) => {
                tracing::error!("recategorization failed to load {transaction_id}: {error}");
                outcome.errors += 1;
                continue;
            }
        };

        if transaction.is_split_parent {
            outcome.skipped += 1;
            continue;
        }
        if transaction.manual_override && !include_manual_overrides {
            outcome.skipped += 1;
            continue;
        }

        let item = BatchItem {
            id: transaction.id.clone(),
            account_id: transaction.account_id.clone(),
            amount: transaction.amount,
            merchant_normalized: transaction.merchant_normalized.clone(),
            merchant_raw: transaction.merchant_raw.clone(),
            description: transaction.description.clone(),
        };

        let fresh =
            categorize_transaction(&item, &rules, &categories, classifier.as_deref()).await;

        if fresh.category_id == transaction.category_id {
            outcome.skipped += 1;
            continue;
        }

        let update = {
            let connection = store.lock();
            update_categorization(
                owner_id,
                transaction_id,
                fresh.category_id.as_deref(),
                &fresh.explainability,
                &connection,
            )
        };

        match update {
            Ok(()) => {
                outcome.updated += 1;
                if let Some(rule_id) = fresh.matched_rule_id {
                    spawn_rule_stat_bump(store.clone(), owner_id.to_owned(), rule_id);
                }
            }
            Err(error) => {
                tracing::error!("recategorization failed to update {transaction_id}: {error}");
                outcome.errors += 1;
            }
        }
    }

    Ok(outcome)
}

#[cfg(test)]
mod categorize_tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::category::seed_default_categories;
    use crate::llm::Classification;
    use crate::rule::test_fixtures::{contains, rule};
    use crate::transaction::test_fixtures::transaction;
    use crate::transaction::{insert_transaction, MatchKind};

    /// A stub classifier with a scripted answer and a call counter.
    struct ScriptedClassifier {
        answer: Classification,
        calls: AtomicUsize,
    }

    impl ScriptedClassifier {
        fn answering(category_id: Option<&str>, confidence: f64) -> Self {
            Self {
                answer: Classification {
                    category_id: category_id.map(str::to_owned),
                    confidence,
                    reasoning: "scripted".to_owned(),
                    model: Some("stub-model".to_owned()),
                    unavailable: false,
                },
                calls: AtomicUsize::new(0),
            }
        }

        fn unreachable() -> Self {
            Self {
                answer: Classification::no_answer("connection refused"),
                calls: AtomicUsize::new(0),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Classifier for ScriptedClassifier {
        async fn classify(
            &self,
            _item: &ClassifyItem,
            _categories: &[CategoryChoice],
        ) -> Classification {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answer.clone()
        }
    }

    fn item(merchant: &str) -> BatchItem {
        BatchItem {
            id: "tx-1".to_owned(),
            account_id: "a-1".to_owned(),
            amount: -450,
            merchant_normalized: merchant.to_owned(),
            merchant_raw: merchant.to_owned(),
            description: format!("{merchant} PURCHASE"),
        }
    }

    fn choices() -> Vec<CategoryChoice> {
        vec![CategoryChoice {
            id: "dining".to_owned(),
            name: "Dining".to_owned(),
        }]
    }

    #[tokio::test]
    async fn confident_rule_match_skips_the_classifier() {
        let rules = vec![rule(700, contains("STARBUCKS"), "dining")];
        let classifier = ScriptedClassifier::answering(Some("dining"), 0.99);

        let outcome = categorize_transaction(
            &item("STARBUCKS"),
            &rules,
            &choices(),
            Some(&classifier),
        )
        .await;

        assert_eq!(outcome.category_id.as_deref(), Some("dining"));
        assert_eq!(outcome.explainability.reason, Reason::RuleMatch);
        assert_eq!(outcome.explainability.match_type, Some(MatchKind::Contains));
        assert_eq!(outcome.explainability.confidence, 0.8);
        assert!(outcome.matched_rule_id.is_some());
        assert_eq!(classifier.call_count(), 0);
    }

    #[tokio::test]
    async fn below_gate_rule_match_defers_to_the_classifier() {
        // A description match carries 0.5 confidence, under the 0.7 gate.
        let below_gate = crate::rule::RuleConditions {
            description_contains: Some("PURCHASE".to_owned()),
            ..Default::default()
        };
        let rules = vec![rule(500, below_gate, "groceries")];
        let classifier = ScriptedClassifier::answering(Some("dining"), 0.9);

        let outcome =
            categorize_transaction(&item("SOMEWHERE"), &rules, &choices(), Some(&classifier)).await;

        assert_eq!(outcome.category_id.as_deref(), Some("dining"));
        assert_eq!(outcome.explainability.reason, Reason::Llm);
        assert_eq!(outcome.explainability.llm_model.as_deref(), Some("stub-model"));
        assert_eq!(classifier.call_count(), 1);
    }

    #[tokio::test]
    async fn disabled_classifier_returns_the_rule_result_as_is() {
        let below_gate = crate::rule::RuleConditions {
            description_contains: Some("PURCHASE".to_owned()),
            ..Default::default()
        };
        let rules = vec![rule(500, below_gate, "groceries")];

        let outcome = categorize_transaction::<ScriptedClassifier>(
            &item("SOMEWHERE"),
            &rules,
            &choices(),
            None,
        )
        .await;

        assert_eq!(outcome.category_id.as_deref(), Some("groceries"));
        assert_eq!(outcome.explainability.confidence, 0.5);
    }

    #[tokio::test]
    async fn classifier_no_answer_leaves_no_match_with_reasoning() {
        let classifier = ScriptedClassifier::answering(None, 0.0);

        let outcome =
            categorize_transaction(&item("MYSTERY"), &[], &choices(), Some(&classifier)).await;

        assert_eq!(outcome.category_id, None);
        assert_eq!(outcome.explainability.reason, Reason::NoMatch);
        assert_eq!(outcome.explainability.confidence, 0.0);
        assert_eq!(
            outcome.explainability.llm_reasoning.as_deref(),
            Some("scripted")
        );
    }

    #[tokio::test]
    async fn unreachable_classifier_falls_back_to_the_rule_result() {
        let below_gate = crate::rule::RuleConditions {
            description_contains: Some("PURCHASE".to_owned()),
            ..Default::default()
        };
        let rules = vec![rule(500, below_gate, "groceries")];
        let classifier = ScriptedClassifier::unreachable();

        let outcome =
            categorize_transaction(&item("SOMEWHERE"), &rules, &choices(), Some(&classifier)).await;

        // The below-gate rule result survives the outage.
        assert_eq!(outcome.category_id.as_deref(), Some("groceries"));
        assert_eq!(outcome.explainability.reason, Reason::RuleMatch);
        assert_eq!(classifier.call_count(), 1);
    }

    #[tokio::test]
    async fn batch_flow_sends_only_gate_failures_to_the_classifier() {
        let rules = vec![rule(700, contains("STARBUCKS"), "dining")];
        let classifier = Arc::new(ScriptedClassifier::answering(Some("dining"), 0.9));

        let items = vec![
            BatchItem {
                id: "tx-rule".to_owned(),
                ..item("STARBUCKS")
            },
            BatchItem {
                id: "tx-llm".to_owned(),
                ..item("UNKNOWN CAFE")
            },
        ];

        let outcomes =
            categorize_items(&items, &rules, &choices(), Some(Arc::clone(&classifier))).await;

        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes["tx-rule"].explainability.reason, Reason::RuleMatch);
        assert_eq!(outcomes["tx-llm"].explainability.reason, Reason::Llm);
        assert_eq!(classifier.call_count(), 1);
    }

    #[tokio::test]
    async fn recategorize_updates_skips_and_counts_errors() {
        let store = Store::open_in_memory().unwrap();
        seed_default_categories(&store.lock()).unwrap();

        let mut plain = transaction("u-1", "a-1", -450);
        plain.merchant_normalized = "STARBUCKS".to_owned();
        let mut overridden = transaction("u-1", "a-1", -900);
        overridden.merchant_normalized = "STARBUCKS".to_owned();
        overridden.manual_override = true;
        overridden.category_id = Some("groceries".to_owned());
        {
            let connection = store.lock();
            insert_transaction(&plain, &connection).unwrap();
            insert_transaction(&overridden, &connection).unwrap();
            crate::rule::create_rule(
                "u-1",
                crate::rule::CreateRuleRequest {
                    name: "starbucks".to_owned(),
                    enabled: None,
                    priority: Some(700),
                    conditions: contains("STARBUCKS"),
                    action: crate::rule::RuleAction {
                        category_id: "dining".to_owned(),
                        add_tags: Vec::new(),
                    },
                },
                crate::rule::RuleSource::User,
                &connection,
            )
            .unwrap();
        }

        let ids = vec![
            plain.id.clone(),
            overridden.id.clone(),
            "missing".to_owned(),
        ];

        let outcome = recategorize::<ScriptedClassifier>("u-1", &ids, false, &store, None)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            RecategorizeOutcome {
                updated: 1,
                skipped: 1,
                errors: 1,
            }
        );

        let connection = store.lock();
        let updated = get_transaction("u-1", &plain.id, &connection).unwrap();
        assert_eq!(updated.category_id.as_deref(), Some("dining"));
        assert_eq!(updated.explainability.reason, Reason::RuleMatch);
        let auto = updated.auto_category.expect("auto category recorded");
        assert_eq!(auto.category_id.as_deref(), Some("dining"));

        let untouched = get_transaction("u-1", &overridden.id, &connection).unwrap();
        assert_eq!(untouched.category_id.as_deref(), Some("groceries"));
    }

    #[tokio::test]
    async fn recategorize_can_cross_manual_overrides_when_asked() {
        let store = Store::open_in_memory().unwrap();
        seed_default_categories(&store.lock()).unwrap();

        let mut overridden = transaction("u-1", "a-1", -900);
        overridden.merchant_normalized = "STARBUCKS".to_owned();
        overridden.manual_override = true;
        overridden.category_id = Some("groceries".to_owned());
        {
            let connection = store.lock();
            insert_transaction(&overridden, &connection).unwrap();
            crate::rule::create_rule(
                "u-1",
                crate::rule::CreateRuleRequest {
                    name: "starbucks".to_owned(),
                    enabled: None,
                    priority: Some(700),
                    conditions: contains("STARBUCKS"),
                    action: crate::rule::RuleAction {
                        category_id: "dining".to_owned(),
                        add_tags: Vec::new(),
                    },
                },
                crate::rule::RuleSource::User,
                &connection,
            )
            .unwrap();
        }

        let ids = vec![overridden.id.clone()];
        let outcome = recategorize::<ScriptedClassifier>("u-1", &ids, true, &store, None)
            .await
            .unwrap();

        assert_eq!(outcome.updated, 1);

        let connection = store.lock();
        let updated = get_transaction("u-1", &overridden.id, &connection).unwrap();
        assert_eq!(updated.category_id.as_deref(), Some("dining"));
    }

    #[tokio::test]
    async fn recategorize_with_no_change_skips() {
        let store = Store::open_in_memory().unwrap();
        seed_default_categories(&store.lock()).unwrap();

        let tx = transaction("u-1", "a-1", -450);
        insert_transaction(&tx, &store.lock()).unwrap();

        let outcome =
            recategorize::<ScriptedClassifier>("u-1", &[tx.id.clone()], false, &store, None)
                .await
                .unwrap();

        // No rules, no classifier: the fresh result is also uncategorized.
        assert_eq!(outcome.skipped, 1);
        assert_eq!(outcome.updated, 0);
    }
}
