//! The deterministic merchant normalizer.
//!
//! Raw statement descriptors like `SQ *STARBUCKS #12345` collapse to a
//! canonical uppercase merchant name (`STARBUCKS`) that rules and
//! breakdowns key on. The ingestion pipeline falls back to the LLM
//! normalizer only when this one leaves fewer than
//! [MIN_NORMALIZED_CHARS] characters.

use std::sync::OnceLock;

use regex::Regex;

/// Results shorter than this send the raw merchant to the secondary
/// normalizer.
pub const MIN_NORMALIZED_CHARS: usize = 3;

/// Statement words that carry no merchant signal.
const NOISE_TOKENS: &[&str] = &["PURCHASE", "PAYMENT", "DEBIT", "CREDIT", "POS", "CHECKCARD"];

fn processor_prefix() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(SQ|TST|PP|PAYPAL|PY|CKE)\s*\*\s*").expect("static pattern compiles")
    })
}

fn store_number_tail() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[#*]\d+").expect("static pattern compiles"))
}

fn long_digit_run() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\d{4,}").expect("static pattern compiles"))
}

/// Normalize a raw merchant descriptor.
///
/// Uppercases, strips payment-processor prefixes, store-number tails
/// (`#123`, `*123`), runs of four or more digits, and the noise tokens
/// banks decorate descriptors with, then collapses whitespace.
pub fn normalize_merchant(raw: &str) -> String {
    let upper = raw.to_uppercase();
    let stripped = processor_prefix().replace(&upper, "");
    let stripped = store_number_tail().replace_all(&stripped, " ");
    let stripped = long_digit_run().replace_all(&stripped, " ");

    stripped
        .split_whitespace()
        .filter(|token| !NOISE_TOKENS.contains(token))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Whether a normalized merchant is substantial enough to use as-is.
pub fn is_usable(normalized: &str) -> bool {
    normalized.chars().count() >= MIN_NORMALIZED_CHARS
}
