//! Keyword intent routing
//!
//! Detects which statement capabilities a query asks for. Used to build
//! single-intent plans without a reasoning call, and to tell a generic data
//! request apart from a query with nothing to look up.

use crate::models::Capability;

const INCOME_KEYWORDS: &[&str] = &[
    "revenue",
    "revenues",
    "sales",
    "income statement",
    "net income",
    "earnings",
    "top line",
    "bottom line",
];

const BALANCE_KEYWORDS: &[&str] = &[
    "balance sheet",
    "assets",
    "liabilities",
    "shareholder equity",
    "stockholder equity",
    "book value",
];

const CASH_FLOW_KEYWORDS: &[&str] = &[
    "cash flow",
    "cashflow",
    "free cash",
    "operating cash",
    "capex",
    "capital expenditure",
    "capital expenditures",
];

const RATIO_KEYWORDS: &[&str] = &[
    "ratio",
    "ratios",
    "roe",
    "return on equity",
    "margin",
    "margins",
    "debt to equity",
    "leverage",
    "liquidity",
];

/// Lowercase, punctuation to spaces, padded so phrases match on word
/// boundaries
fn normalize(query: &str) -> String {
    let cleaned: String = query
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    format!(" {} ", cleaned.split_whitespace().collect::<Vec<_>>().join(" "))
}

fn mentions(normalized: &str, keywords: &[&str]) -> bool {
    keywords
        .iter()
        .any(|k| normalized.contains(&format!(" {} ", k)))
}

/// Capabilities the query asks for, in a fixed order
pub fn detect_intents(query: &str) -> Vec<Capability> {
    let normalized = normalize(query);

    let mut intents = Vec::new();
    if mentions(&normalized, INCOME_KEYWORDS) {
        intents.push(Capability::IncomeStatement);
    }
    if mentions(&normalized, BALANCE_KEYWORDS) {
        intents.push(Capability::BalanceSheet);
    }
    if mentions(&normalized, CASH_FLOW_KEYWORDS) {
        intents.push(Capability::CashFlow);
    }
    if mentions(&normalized, RATIO_KEYWORDS) {
        intents.push(Capability::FinancialRatios);
    }
    intents
}
