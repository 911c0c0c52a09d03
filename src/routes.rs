//! Application router configuration.

use axum::{
    http::HeaderValue,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::{Any, CorsLayer};

use crate::{
    account::{
        create_account_endpoint, delete_account_endpoint, get_account_endpoint,
        list_accounts_endpoint, update_account_endpoint,
    },
    analytics::{accounts_endpoint, categories_endpoint, monthly_endpoint, trend_endpoint},
    app_state::AppState,
    categorize::recategorize_endpoint,
    category::list_categories_endpoint,
    endpoints,
    import::{get_import_endpoint, list_imports_endpoint, upload_import_endpoint},
    rule::{
        create_rule_endpoint, delete_rule_endpoint, get_rule_endpoint, list_rules_endpoint,
        reorder_rules_endpoint, update_rule_endpoint,
    },
    split::{list_splits_endpoint, split_transaction_endpoint, unsplit_transaction_endpoint},
    suggestion::{accept_suggestion_endpoint, dismiss_suggestion_endpoint},
    transaction::{
        get_transaction_endpoint, list_transactions_endpoint, update_transaction_endpoint,
    },
};

/// Return a router with all the app's routes.
pub fn build_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route(endpoints::HEALTHZ, get(healthz))
        .route(endpoints::TRANSACTIONS, get(list_transactions_endpoint))
        .route(
            endpoints::TRANSACTIONS_RECATEGORIZE,
            post(recategorize_endpoint),
        )
        .route(
            endpoints::TRANSACTION,
            get(get_transaction_endpoint).patch(update_transaction_endpoint),
        )
        .route(endpoints::TRANSACTION_SPLIT, post(split_transaction_endpoint))
        .route(
            endpoints::TRANSACTION_UNSPLIT,
            post(unsplit_transaction_endpoint),
        )
        .route(endpoints::TRANSACTION_SPLITS, get(list_splits_endpoint))
        .route(
            endpoints::ACCOUNTS,
            get(list_accounts_endpoint).post(create_account_endpoint),
        )
        .route(
            endpoints::ACCOUNT,
            get(get_account_endpoint)
                .patch(update_account_endpoint)
                .delete(delete_account_endpoint),
        )
        .route(endpoints::CATEGORIES, get(list_categories_endpoint))
        .route(
            endpoints::RULES,
            get(list_rules_endpoint).post(create_rule_endpoint),
        )
        .route(endpoints::RULES_REORDER, post(reorder_rules_endpoint))
        .route(
            endpoints::RULE,
            get(get_rule_endpoint)
                .patch(update_rule_endpoint)
                .delete(delete_rule_endpoint),
        )
        .route(endpoints::SUGGESTION_DISMISS, post(dismiss_suggestion_endpoint))
        .route(endpoints::SUGGESTION_ACCEPT, post(accept_suggestion_endpoint))
        .route(endpoints::IMPORT_UPLOAD, post(upload_import_endpoint))
        .route(endpoints::IMPORTS, get(list_imports_endpoint))
        .route(endpoints::IMPORT, get(get_import_endpoint))
        .route(endpoints::ANALYTICS_MONTHLY, get(monthly_endpoint))
        .route(endpoints::ANALYTICS_TREND, get(trend_endpoint))
        .route(endpoints::ANALYTICS_CATEGORIES, get(categories_endpoint))
        .route(endpoints::ANALYTICS_ACCOUNTS, get(accounts_endpoint));

    if let Some(origin) = &state.config.cors_allowed_origin {
        match origin.parse::<HeaderValue>() {
            Ok(origin) => {
                router = router.layer(
                    CorsLayer::new()
                        .allow_origin(origin)
                        .allow_methods(Any)
                        .allow_headers(Any),
                );
            }
            Err(error) => {
                tracing::warn!("ignoring unusable CORS_ALLOWED_ORIGIN '{origin}': {error}");
            }
        }
    }

    router.with_state(state)
}

/// Unauthenticated liveness probe.
async fn healthz() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}
