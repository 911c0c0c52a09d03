//! The API endpoint URIs.
//!
//! For endpoints that take a parameter, e.g., '/api/v1/rules/{rule_id}',
//! use [format_endpoint].

/// Unauthenticated liveness probe.
pub const HEALTHZ: &str = "/healthz";

/// The route to list transactions or to filter them with query parameters.
pub const TRANSACTIONS: &str = "/api/v1/transactions";
/// The route to fetch or correct a single transaction.
pub const TRANSACTION: &str = "/api/v1/transactions/{transaction_id}";
/// The route to split a transaction into parts.
pub const TRANSACTION_SPLIT: &str = "/api/v1/transactions/{transaction_id}/split";
/// The route to undo a split.
pub const TRANSACTION_UNSPLIT: &str = "/api/v1/transactions/{transaction_id}/unsplit";
/// The route to list the children of a split transaction.
pub const TRANSACTION_SPLITS: &str = "/api/v1/transactions/{transaction_id}/splits";
/// The route to re-run categorization over a set of transactions.
pub const TRANSACTIONS_RECATEGORIZE: &str = "/api/v1/transactions/recategorize";

/// The route to list or create accounts.
pub const ACCOUNTS: &str = "/api/v1/accounts";
/// The route to fetch, update or delete a single account.
pub const ACCOUNT: &str = "/api/v1/accounts/{account_id}";

/// The route to list categories.
pub const CATEGORIES: &str = "/api/v1/categories";

/// The route to list or create rules.
pub const RULES: &str = "/api/v1/rules";
/// The route to fetch, update or delete a single rule.
pub const RULE: &str = "/api/v1/rules/{rule_id}";
/// The route to reorder rules by priority.
pub const RULES_REORDER: &str = "/api/v1/rules/reorder";
/// The route to dismiss a rule suggestion.
pub const SUGGESTION_DISMISS: &str = "/api/v1/rules/suggestions/dismiss";
/// The route to accept a rule suggestion.
pub const SUGGESTION_ACCEPT: &str = "/api/v1/rules/suggestions/accept";

/// The route to upload a document for ingestion.
pub const IMPORT_UPLOAD: &str = "/api/v1/imports/upload";
/// The route to list imports.
pub const IMPORTS: &str = "/api/v1/imports";
/// The route to fetch a single import.
pub const IMPORT: &str = "/api/v1/imports/{import_id}";

/// The route for the monthly overview.
pub const ANALYTICS_MONTHLY: &str = "/api/v1/analytics/monthly";
/// The route for the month-over-month spending trend.
pub const ANALYTICS_TREND: &str = "/api/v1/analytics/trend";
/// The route for category breakdowns across months.
pub const ANALYTICS_CATEGORIES: &str = "/api/v1/analytics/categories";
/// The route for per-account totals in a month.
pub const ANALYTICS_ACCOUNTS: &str = "/api/v1/analytics/accounts";

/// Replace the parameter in `endpoint_path` with `id`.
///
/// A parameter is a string that starts with a left brace, followed by
/// lowercase letters or underscores, and ends with a right brace. If no
/// parameter is found in `endpoint_path`, the original path is returned.
pub fn format_endpoint(endpoint_path: &str, id: &str) -> String {
    let Some(param_start) = endpoint_path.find('{') else {
        return endpoint_path.to_string();
    };

    let param_end = endpoint_path[param_start..]
        .find('}')
        .map(|offset| param_start + offset + 1)
        .unwrap_or(endpoint_path.len());

    format!(
        "{}{}{}",
        &endpoint_path[..param_start],
        id,
        &endpoint_path[param_end..]
    )
}
