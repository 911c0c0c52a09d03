//! The deterministic parser for delimited statement exports.
//!
//! Banks disagree on header names, date formats, and whether amounts come
//! signed or as debit/credit pairs; this parser resolves the common
//! aliases and hands back normalized rows. A document it cannot shape
//! yields zero rows, which is the ingestion pipeline's signal to fall
//! back to the multimodal parser.

use time::{format_description::BorrowedFormatItem, macros::format_description, Date};

/// One transaction row extracted from a delimited statement.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRow {
    pub posted_at: Date,
    /// Signed cents; expenses negative.
    pub amount: i64,
    pub description: String,
    /// The unprocessed merchant text, before normalization.
    pub merchant_raw: String,
}

const DATE_ALIASES: &[&str] = &["date", "posted date", "transaction date", "posting date"];
const AMOUNT_ALIASES: &[&str] = &["amount", "transaction amount"];
const DEBIT_ALIASES: &[&str] = &["debit", "withdrawal"];
const CREDIT_ALIASES: &[&str] = &["credit", "deposit"];
const DESCRIPTION_ALIASES: &[&str] = &[
    "description",
    "merchant",
    "name",
    "transaction description",
    "memo",
];

#[derive(Debug)]
struct ColumnMap {
    date: usize,
    description: usize,
    amount: Option<usize>,
    debit: Option<usize>,
    credit: Option<usize>,
}

/// Parse a delimited statement into transaction rows.
///
/// Rows with an unparsable date or a zero amount are dropped. An
/// unrecognized layout produces an empty vector rather than an error.
pub fn parse_statement(text: &str) -> Vec<ParsedRow> {
    let mut lines = text.lines().enumerate();

    let Some((header_index, columns)) = lines.by_ref().find_map(|(index, line)| {
        detect_header(line).map(|columns| (index, columns))
    }) else {
        tracing::debug!("no recognizable header row in statement");
        return Vec::new();
    };

    let mut rows = Vec::new();

    for (line_number, line) in text.lines().enumerate().skip(header_index + 1) {
        if line.trim().is_empty() {
            continue;
        }

        let fields = split_fields(line);
        let Some(date_field) = fields.get(columns.date) else {
            continue;
        };
        let Some(description_field) = fields.get(columns.description) else {
            continue;
        };

        let Some(posted_at) = parse_flexible_date(date_field.trim()) else {
            tracing::debug!("skipping line {line_number}: unparsable date '{date_field}'");
            continue;
        };

        let amount = match columns.amount {
            Some(amount_column) => fields
                .get(amount_column)
                .and_then(|field| parse_amount_cents(field)),
            None => {
                // Separate debit/credit columns: the amount is credit − debit.
                let debit = columns
                    .debit
                    .and_then(|column| fields.get(column))
                    .and_then(|field| parse_amount_cents(field))
                    .unwrap_or(0);
                let credit = columns
                    .credit
                    .and_then(|column| fields.get(column))
                    .and_then(|field| parse_amount_cents(field))
                    .unwrap_or(0);
                Some(credit - debit)
            }
        };

        let Some(amount) = amount else {
            tracing::debug!("skipping line {line_number}: unparsable amount");
            continue;
        };
        if amount == 0 {
            tracing::debug!("skipping line {line_number}: zero amount");
            continue;
        }

        let description = description_field.trim().to_owned();

        rows.push(ParsedRow {
            posted_at,
            amount,
            merchant_raw: description.clone(),
            description,
        });
    }

    rows
}

/// Try to read `line` as a header row, resolving column aliases.
fn detect_header(line: &str) -> Option<ColumnMap> {
    let fields = split_fields(line);
    let normalized: Vec<String> = fields
        .iter()
        .map(|field| field.trim().trim_matches('"').to_lowercase())
        .collect();

    let find = |aliases: &[&str]| {
        normalized
            .iter()
            .position(|field| aliases.contains(&field.as_str()))
    };

    let date = find(DATE_ALIASES)?;
    let description = find(DESCRIPTION_ALIASES)?;
    let amount = find(AMOUNT_ALIASES);
    let debit = find(DEBIT_ALIASES);
    let credit = find(CREDIT_ALIASES);

    if amount.is_none() && (debit.is_none() || credit.is_none()) {
        return None;
    }

    Some(ColumnMap {
        date,
        description,
        amount,
        debit,
        credit,
    })
}

/// Split one line into fields, honoring double quotes so embedded commas
/// survive. A doubled quote inside a quoted field is an escaped quote.
fn split_fields(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut characters = line.chars().peekable();

    while let Some(character) = characters.next() {
        match character {
            '"' if in_quotes && characters.peek() == Some(&'"') => {
                characters.next();
                current.push('"');
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                fields.push(current.trim().to_owned());
                current = String::new();
            }
            other => current.push(other),
        }
    }
    fields.push(current.trim().to_owned());

    fields
}

const YMD_DASH: &[BorrowedFormatItem] = format_description!("[year]-[month]-[day]");
const YMD_SLASH: &[BorrowedFormatItem] = format_description!("[year]/[month]/[day]");
const MDY_SLASH: &[BorrowedFormatItem] = format_description!("[month]/[day]/[year]");
const MDY_DASH: &[BorrowedFormatItem] = format_description!("[month]-[day]-[year]");

/// Parse a date in any of the statement formats seen in the wild.
pub fn parse_flexible_date(value: &str) -> Option<Date> {
    let value = value.trim_matches('"').trim();

    [YMD_DASH, YMD_SLASH, MDY_SLASH, MDY_DASH]
        .iter()
        .find_map(|format| Date::parse(value, format).ok())
}

/// Parse a monetary field into signed cents.
///
/// Handles `$`, thousands separators, surrounding quotes, leading signs,
/// and accountant-style parentheses for negatives. Returns `None` for
/// anything that is not a number.
pub fn parse_amount_cents(raw: &str) -> Option<i64> {
    let mut text = raw.trim().trim_matches('"').replace(['$', ','], "");
    text = text.trim().to_owned();

    let mut negative = false;
    if text.starts_with('(') && text.ends_with(')') {
        negative = true;
        text = text[1..text.len() - 1].trim().to_owned();
    }
    if let Some(rest) = text.strip_prefix('-') {
        negative = !negative;
        text = rest.to_owned();
    } else if let Some(rest) = text.strip_prefix('+') {
        text = rest.to_owned();
    }

    if text.is_empty() {
        return None;
    }

    let (whole, fraction) = match text.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (text.as_str(), ""),
    };

    if !whole.chars().all(|c| c.is_ascii_digit())
        || !fraction.chars().all(|c| c.is_ascii_digit())
        || (whole.is_empty() && fraction.is_empty())
    {
        return None;
    }

    let whole_value: i64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };

    // Two decimal places of cents; further digits are beyond minor units.
    let mut fraction_digits = fraction.chars().take(2).collect::<String>();
    while fraction_digits.len() < 2 {
        fraction_digits.push('0');
    }
    let fraction_value: i64 = fraction_digits.parse().ok()?;

    let cents = whole_value.checked_mul(100)?.checked_add(fraction_value)?;

    Some(if negative { -cents } else { cents })
}

#[cfg(test)]
mod csv_tests {
    use time::macros::date;

    use super::*;

    #[test]
    fn parses_a_plain_statement() {
        let csv = "date,amount,description\n\
            2024-01-15,-50.00,COFFEE SHOP #123\n\
            2024-01-16,100.00,SALARY";

        let rows = parse_statement(csv);

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].posted_at, date!(2024 - 01 - 15));
        assert_eq!(rows[0].amount, -5000);
        assert_eq!(rows[0].description, "COFFEE SHOP #123");
        assert_eq!(rows[1].amount, 10000);
        assert_eq!(rows[1].description, "SALARY");
    }

    #[test]
    fn resolves_header_aliases() {
        let csv = "Posted Date,Transaction Amount,Memo\n\
            01/15/2024,\"-1,250.00\",RENT";

        let rows = parse_statement(csv);

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].posted_at, date!(2024 - 01 - 15));
        assert_eq!(rows[0].amount, -125_000);
        assert_eq!(rows[0].description, "RENT");
    }

    #[test]
    fn computes_amounts_from_debit_credit_pairs() {
        let csv = "Date,Description,Withdrawal,Deposit\n\
            2024-02-01,GROCERY STORE,45.67,\n\
            2024-02-02,PAYCHECK,,2000.00\n\
            2024-02-03,NOTHING,,";

        let rows = parse_statement(csv);

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].amount, -4567);
        assert_eq!(rows[1].amount, 200_000);
        // The zero-amount row is dropped.
    }

    #[test]
    fn handles_quoted_fields_with_embedded_commas() {
        let csv = "date,amount,description\n\
            2024-03-05,-12.34,\"ACME, INC #42\"";

        let rows = parse_statement(csv);

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].description, "ACME, INC #42");
    }

    #[test]
    fn drops_rows_with_bad_dates_and_zero_amounts() {
        let csv = "date,amount,description\n\
            not-a-date,-5.00,BAD DATE\n\
            2024-03-05,0.00,ZERO\n\
            2024-03-06,-5.00,KEPT";

        let rows = parse_statement(csv);

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].description, "KEPT");
    }

    #[test]
    fn skips_preamble_lines_before_the_header() {
        let csv = "Statement for account 1234\n\
            Generated 2024-04-01\n\
            \n\
            date,amount,description\n\
            2024-03-20,-8.00,LUNCH";

        let rows = parse_statement(csv);

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].description, "LUNCH");
    }

    #[test]
    fn unrecognized_layouts_yield_zero_rows() {
        assert!(parse_statement("").is_empty());
        assert!(parse_statement("just,some,random\nvalues,1,2").is_empty());
        // Debit without credit is not a usable pair.
        assert!(parse_statement("date,description,debit\n2024-01-01,X,5.00").is_empty());
    }

    #[test]
    fn parse_amount_cents_handles_statement_formats() {
        assert_eq!(parse_amount_cents("-50.00"), Some(-5000));
        assert_eq!(parse_amount_cents("100"), Some(10000));
        assert_eq!(parse_amount_cents("$1,234.56"), Some(123_456));
        assert_eq!(parse_amount_cents("\"-2,000.00\""), Some(-200_000));
        assert_eq!(parse_amount_cents("(75.25)"), Some(-7525));
        assert_eq!(parse_amount_cents("+10.5"), Some(1050));
        assert_eq!(parse_amount_cents(".50"), Some(50));
        assert_eq!(parse_amount_cents(""), None);
        assert_eq!(parse_amount_cents("N/A"), None);
        assert_eq!(parse_amount_cents("12.34.56"), None);
    }

    #[test]
    fn parse_flexible_date_accepts_common_formats() {
        assert_eq!(parse_flexible_date("2024-01-15"), Some(date!(2024 - 01 - 15)));
        assert_eq!(parse_flexible_date("2024/01/15"), Some(date!(2024 - 01 - 15)));
        assert_eq!(parse_flexible_date("01/15/2024"), Some(date!(2024 - 01 - 15)));
        assert_eq!(parse_flexible_date("01-15-2024"), Some(date!(2024 - 01 - 15)));
        assert_eq!(parse_flexible_date("15 Jan 2024"), None);
    }
}
