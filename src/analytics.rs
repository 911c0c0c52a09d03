//! The monthly aggregation read path behind the dashboard endpoints.
//!
//! One pass over a month's non-parent transactions produces the overview:
//! totals, category and merchant breakdowns, and a zero-filled per-day
//! series. The reduction is deterministic: repeated calls over a frozen
//! data set serialize byte-for-byte identically.

use std::collections::HashMap;

use axum::{
    extract::{Query, State},
    response::Response,
};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use time::Month;

use crate::{
    account::list_accounts,
    auth::AuthContext,
    envelope,
    store::{self, Store},
    Error,
};

// ============================================================================
// MODELS
// ============================================================================

/// One expense category's slice of a month.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryBucket {
    /// `None` is the Uncategorized bucket.
    pub category_id: Option<String>,
    /// Signed cents (negative: these are expenses).
    pub amount: i64,
    pub count: u64,
    /// Share of the month's expenses, 0–100.
    pub percentage: f64,
}

/// One merchant's expense slice of a month.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MerchantBucket {
    pub merchant: String,
    /// Signed cents.
    pub amount: i64,
    pub count: u64,
}

/// One calendar day of a month.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DayBucket {
    /// `YYYY-MM-DD`.
    pub date: String,
    pub income: i64,
    pub expenses: i64,
    pub net: i64,
    pub count: u64,
}

/// The single-pass reduction of one month.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthlyOverview {
    /// `YYYY-MM`.
    pub month: String,
    pub total_income: i64,
    pub total_expenses: i64,
    pub net: i64,
    pub categorized_count: u64,
    pub uncategorized_count: u64,
    pub manual_override_count: u64,
    pub categories: Vec<CategoryBucket>,
    /// Top ten merchants by absolute expense.
    pub merchants: Vec<MerchantBucket>,
    pub days: Vec<DayBucket>,
}

/// A month compared against the month before it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpendingTrend {
    pub current: MonthlyOverview,
    pub previous: MonthlyOverview,
    /// Percent changes; `None` when the prior base is zero.
    pub income_change: Option<f64>,
    pub expenses_change: Option<f64>,
    pub net_change: Option<f64>,
}

/// How many merchants the breakdown keeps.
const TOP_MERCHANTS: usize = 10;

// ============================================================================
// AGGREGATION
// ============================================================================

struct MonthRow {
    amount: i64,
    category_id: Option<String>,
    manual_override: bool,
    merchant_normalized: String,
    posted_at_ms: i64,
}

/// Compute the overview of `(year, month)` for `owner_id`.
pub fn monthly_overview(
    owner_id: &str,
    year: i32,
    month: Month,
    connection: &Connection,
) -> Result<MonthlyOverview, Error> {
    let (start, end) = store::month_bounds(year, month);

    let rows: Vec<MonthRow> = connection
        .prepare(
            "SELECT amount, category_id, manual_override, merchant_normalized, posted_at
             FROM transactions
             WHERE owner_id = ?1 AND is_split_parent = 0 AND posted_at >= ?2 AND posted_at <= ?3",
        )?
        .query_map(
            (
                owner_id,
                store::timestamp_ms(start),
                store::timestamp_ms(end),
            ),
            |row| {
                Ok(MonthRow {
                    amount: row.get(0)?,
                    category_id: row.get(1)?,
                    manual_override: row.get(2)?,
                    merchant_normalized: row.get(3)?,
                    posted_at_ms: row.get(4)?,
                })
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;

    let mut total_income = 0i64;
    let mut total_expenses = 0i64;
    let mut categorized_count = 0u64;
    let mut uncategorized_count = 0u64;
    let mut manual_override_count = 0u64;
    let mut category_totals: HashMap<Option<String>, (i64, u64)> = HashMap::new();
    let mut merchant_totals: HashMap<String, (i64, u64)> = HashMap::new();
    let mut day_totals: HashMap<String, (i64, i64, u64)> = HashMap::new();

    for row in &rows {
        if row.amount > 0 {
            total_income += row.amount;
        } else {
            total_expenses += row.amount;
        }

        if row.category_id.is_some() {
            categorized_count += 1;
        } else {
            uncategorized_count += 1;
        }
        if row.manual_override {
            manual_override_count += 1;
        }

        if row.amount < 0 {
            let category_entry = category_totals
                .entry(row.category_id.clone())
                .or_insert((0, 0));
            category_entry.0 += row.amount;
            category_entry.1 += 1;

            let merchant_entry = merchant_totals
                .entry(row.merchant_normalized.clone())
                .or_insert((0, 0));
            merchant_entry.0 += row.amount;
            merchant_entry.1 += 1;
        }

        let day = store::date_string(store::from_timestamp_ms(row.posted_at_ms)?);
        let day_entry = day_totals.entry(day).or_insert((0, 0, 0));
        if row.amount > 0 {
            day_entry.0 += row.amount;
        } else {
            day_entry.1 += row.amount;
        }
        day_entry.2 += 1;
    }

    let expense_base = total_expenses.abs();
    let mut categories: Vec<CategoryBucket> = category_totals
        .into_iter()
        .map(|(category_id, (amount, count))| CategoryBucket {
            category_id,
            amount,
            count,
            percentage: if expense_base == 0 {
                0.0
            } else {
                (amount.abs() as f64 / expense_base as f64) * 100.0
            },
        })
        .collect();
    // Largest expense first; the uncategorized bucket sorts last among
    // equals so null placement is stable.
    categories.sort_by(|a, b| {
        a.amount
            .cmp(&b.amount)
            .then_with(|| match (&a.category_id, &b.category_id) {
                (Some(left), Some(right)) => left.cmp(right),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            })
    });

    let mut merchants: Vec<MerchantBucket> = merchant_totals
        .into_iter()
        .map(|(merchant, (amount, count))| MerchantBucket {
            merchant,
            amount,
            count,
        })
        .collect();
    merchants.sort_by(|a, b| {
        b.amount
            .abs()
            .cmp(&a.amount.abs())
            .then_with(|| a.merchant.cmp(&b.merchant))
    });
    merchants.truncate(TOP_MERCHANTS);

    let month_label = format!("{year:04}-{:02}", u8::from(month));
    let days_in_month = time::util::days_in_year_month(year, month);
    let days: Vec<DayBucket> = (1..=days_in_month)
        .map(|day| {
            let date = format!("{month_label}-{day:02}");
            let (income, expenses, count) = day_totals.get(&date).copied().unwrap_or((0, 0, 0));
            DayBucket {
                date,
                income,
                expenses,
                net: income + expenses,
                count,
            }
        })
        .collect();

    Ok(MonthlyOverview {
        month: month_label,
        net: total_income + total_expenses,
        total_income,
        total_expenses,
        categorized_count,
        uncategorized_count,
        manual_override_count,
        categories,
        merchants,
        days,
    })
}

/// Compose the overview of a month with the month before it.
pub fn spending_trend(
    owner_id: &str,
    year: i32,
    month: Month,
    connection: &Connection,
) -> Result<SpendingTrend, Error> {
    let current = monthly_overview(owner_id, year, month, connection)?;
    let (previous_year, previous_month) = store::previous_month(year, month);
    let previous = monthly_overview(owner_id, previous_year, previous_month, connection)?;

    let income_change = percent_change(previous.total_income, current.total_income);
    // Expenses compare by magnitude so "spent 50% more" reads positive.
    let expenses_change = percent_change(
        previous.total_expenses.abs(),
        current.total_expenses.abs(),
    );
    let net_change = percent_change(previous.net, current.net);

    Ok(SpendingTrend {
        current,
        previous,
        income_change,
        expenses_change,
        net_change,
    })
}

/// Percent change from `previous` to `current`, `None` on a zero base.
fn percent_change(previous: i64, current: i64) -> Option<f64> {
    if previous == 0 {
        return None;
    }

    Some(((current - previous) as f64 / previous.abs() as f64) * 100.0)
}

// ============================================================================
// ROUTE HANDLERS
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct MonthParam {
    pub month: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct MonthsParam {
    pub month: Option<String>,
    /// Comma-separated `YYYY-MM` list for multi-month breakdowns.
    pub months: Option<String>,
}

fn resolve_month(param: Option<&str>) -> Result<(i32, Month), Error> {
    match param {
        Some(raw) => store::parse_month(raw),
        None => {
            let today = store::now().date();
            Ok((today.year(), today.month()))
        }
    }
}

/// Route handler for the monthly overview.
pub async fn monthly_endpoint(
    auth: AuthContext,
    State(store): State<Store>,
    Query(params): Query<MonthParam>,
) -> Result<Response, Error> {
    let (year, month) = resolve_month(params.month.as_deref())?;

    let connection = store.lock();
    let overview = monthly_overview(&auth.owner_id, year, month, &connection)?;

    Ok(envelope::ok(overview))
}

/// Route handler for the month-over-month trend.
pub async fn trend_endpoint(
    auth: AuthContext,
    State(store): State<Store>,
    Query(params): Query<MonthParam>,
) -> Result<Response, Error> {
    let (year, month) = resolve_month(params.month.as_deref())?;

    let connection = store.lock();
    let trend = spending_trend(&auth.owner_id, year, month, &connection)?;

    Ok(envelope::ok(trend))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MonthCategories {
    month: String,
    categories: Vec<CategoryBucket>,
}

/// Route handler for category breakdowns across one or more months.
pub async fn categories_endpoint(
    auth: AuthContext,
    State(store): State<Store>,
    Query(params): Query<MonthsParam>,
) -> Result<Response, Error> {
    let months: Vec<(i32, Month)> = match params.months.as_deref() {
        Some(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(store::parse_month)
            .collect::<Result<Vec<_>, _>>()?,
        None => vec![resolve_month(params.month.as_deref())?],
    };

    let connection = store.lock();
    let breakdowns = months
        .into_iter()
        .map(|(year, month)| {
            monthly_overview(&auth.owner_id, year, month, &connection).map(|overview| {
                MonthCategories {
                    month: overview.month,
                    categories: overview.categories,
                }
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(envelope::ok(breakdowns))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AccountSummary {
    account_id: String,
    name: String,
    income: i64,
    expenses: i64,
    net: i64,
    count: u64,
}

/// Route handler for per-account totals within a month.
pub async fn accounts_endpoint(
    auth: AuthContext,
    State(store): State<Store>,
    Query(params): Query<MonthParam>,
) -> Result<Response, Error> {
    let (year, month) = resolve_month(params.month.as_deref())?;
    let (start, end) = store::month_bounds(year, month);

    let connection = store.lock();
    let accounts = list_accounts(&auth.owner_id, &connection)?;

    let mut totals: HashMap<String, (i64, i64, u64)> = HashMap::new();
    connection
        .prepare(
            "SELECT account_id, amount FROM transactions
             WHERE owner_id = ?1 AND is_split_parent = 0 AND posted_at >= ?2 AND posted_at <= ?3",
        )?
        .query_map(
            (
                &auth.owner_id,
                store::timestamp_ms(start),
                store::timestamp_ms(end),
            ),
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
        )?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .for_each(|(account_id, amount)| {
            let entry = totals.entry(account_id).or_insert((0, 0, 0));
            if amount > 0 {
                entry.0 += amount;
            } else {
                entry.1 += amount;
            }
            entry.2 += 1;
        });

    let summaries: Vec<AccountSummary> = accounts
        .into_iter()
        .map(|account| {
            let (income, expenses, count) = totals.get(&account.id).copied().unwrap_or((0, 0, 0));
            AccountSummary {
                account_id: account.id,
                name: account.name,
                income,
                expenses,
                net: income + expenses,
                count,
            }
        })
        .collect();

    Ok(envelope::ok(summaries))
}
