//! Core data models for the research pipeline

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub type TaskId = String;

/// Completed task payloads keyed by task id. Ordered so that downstream
/// consumers never depend on completion order.
pub type TaskResults = BTreeMap<TaskId, TaskResult>;

/// Canonical field names shared by providers, the executor and the validator
pub mod fields {
    pub const TOTAL_REVENUE: &str = "totalRevenue";
    pub const NET_INCOME: &str = "netIncome";
    pub const GROSS_PROFIT: &str = "grossProfit";
    pub const OPERATING_INCOME: &str = "operatingIncome";
    pub const TOTAL_ASSETS: &str = "totalAssets";
    pub const TOTAL_LIABILITIES: &str = "totalLiabilities";
    pub const TOTAL_EQUITY: &str = "totalShareholderEquity";
    pub const CURRENT_ASSETS: &str = "totalCurrentAssets";
    pub const CURRENT_LIABILITIES: &str = "totalCurrentLiabilities";
    pub const OPERATING_CASHFLOW: &str = "operatingCashflow";
    pub const CAPITAL_EXPENDITURES: &str = "capitalExpenditures";

    pub const RETURN_ON_EQUITY: &str = "returnOnEquity";
    pub const NET_MARGIN: &str = "netMargin";
    pub const DEBT_TO_EQUITY: &str = "debtToEquity";
    pub const CURRENT_RATIO: &str = "currentRatio";
}

//
// ================= Statements & Capabilities =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum StatementType {
    IncomeStatement,
    BalanceSheet,
    CashFlow,
}

impl StatementType {
    pub const ALL: [StatementType; 3] = [
        StatementType::IncomeStatement,
        StatementType::BalanceSheet,
        StatementType::CashFlow,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StatementType::IncomeStatement => "income_statement",
            StatementType::BalanceSheet => "balance_sheet",
            StatementType::CashFlow => "cash_flow",
        }
    }

    /// Minimum fields a payload must carry to count as structurally valid
    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            StatementType::IncomeStatement => &[fields::TOTAL_REVENUE, fields::NET_INCOME],
            StatementType::BalanceSheet => &[
                fields::TOTAL_ASSETS,
                fields::TOTAL_LIABILITIES,
                fields::TOTAL_EQUITY,
            ],
            StatementType::CashFlow => &[fields::OPERATING_CASHFLOW],
        }
    }
}

impl fmt::Display for StatementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tools the executor knows how to run. A plan may only reference these.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    IncomeStatement,
    BalanceSheet,
    CashFlow,
    /// Derived: computed from income statement and balance sheet
    FinancialRatios,
}

impl Capability {
    pub const ALL: [Capability; 4] = [
        Capability::IncomeStatement,
        Capability::BalanceSheet,
        Capability::CashFlow,
        Capability::FinancialRatios,
    ];

    pub fn tool_name(&self) -> &'static str {
        match self {
            Capability::IncomeStatement => "income_statement",
            Capability::BalanceSheet => "balance_sheet",
            Capability::CashFlow => "cash_flow",
            Capability::FinancialRatios => "financial_ratios",
        }
    }

    pub fn from_tool_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.tool_name() == name.trim())
    }

    pub fn description(&self) -> &'static str {
        match self {
            Capability::IncomeStatement => "Fetch the latest annual income statement",
            Capability::BalanceSheet => "Fetch the latest annual balance sheet",
            Capability::CashFlow => "Fetch the latest annual cash flow statement",
            Capability::FinancialRatios => {
                "Compute ROE, net margin, debt-to-equity and current ratio"
            }
        }
    }

    /// Statements fetched to satisfy this capability, in fetch order
    pub fn statements(&self) -> &'static [StatementType] {
        match self {
            Capability::IncomeStatement => &[StatementType::IncomeStatement],
            Capability::BalanceSheet => &[StatementType::BalanceSheet],
            Capability::CashFlow => &[StatementType::CashFlow],
            Capability::FinancialRatios => {
                &[StatementType::IncomeStatement, StatementType::BalanceSheet]
            }
        }
    }

    pub fn is_derived(&self) -> bool {
        matches!(self, Capability::FinancialRatios)
    }
}

//
// ================= Entities =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Company,
    Index,
    Sector,
    Macro,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Entity {
    pub name: String,
    #[serde(rename = "type", alias = "kind")]
    pub kind: EntityKind,
    #[serde(default)]
    pub ticker: Option<String>,
}

impl Entity {
    pub fn company(name: impl Into<String>, ticker: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: EntityKind::Company,
            ticker: Some(ticker.into()),
        }
    }

    pub fn is_resolvable(&self) -> bool {
        self.ticker.as_deref().is_some_and(|t| !t.trim().is_empty())
    }
}

//
// ================= Tasks =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    pub tool_name: String,
    pub tool_args: BTreeMap<String, String>,
    pub status: TaskStatus,
    /// Present only when Completed
    pub result: Option<TaskResult>,
    /// Present only when Failed
    pub error: Option<String>,
}

impl Task {
    pub fn new(
        id: impl Into<TaskId>,
        description: impl Into<String>,
        tool_name: impl Into<String>,
        tool_args: BTreeMap<String, String>,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            tool_name: tool_name.into(),
            tool_args,
            status: TaskStatus::Pending,
            result: None,
            error: None,
        }
    }

    pub fn ticker(&self) -> Option<&str> {
        self.tool_args
            .get("ticker")
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
    }

    pub fn capability(&self) -> Option<Capability> {
        Capability::from_tool_name(&self.tool_name)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn start(mut self) -> Self {
        if self.status == TaskStatus::Pending {
            self.status = TaskStatus::Running;
        }
        self
    }

    /// Terminal tasks are returned unchanged
    pub fn complete(mut self, result: TaskResult) -> Self {
        if self.is_terminal() {
            return self;
        }
        self.status = TaskStatus::Completed;
        self.result = Some(result);
        self.error = None;
        self
    }

    /// Terminal tasks are returned unchanged
    pub fn fail(mut self, reason: impl Into<String>) -> Self {
        if self.is_terminal() {
            return self;
        }
        self.status = TaskStatus::Failed;
        self.result = None;
        self.error = Some(reason.into());
        self
    }
}

//
// ================= Provider Payloads =================
//

/// One financial statement as returned by a provider
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatementPayload {
    pub ticker: String,
    pub statement: StatementType,
    /// Provider name, stamped by the router
    pub provider: String,
    /// Position of the provider in the router's priority list (0 = primary)
    pub provider_rank: usize,
    /// Period identifier, e.g. the fiscal date ending
    pub period: String,
    pub period_end: Option<NaiveDate>,
    pub fetched_at: DateTime<Utc>,
    /// Figures for the latest period
    pub fields: BTreeMap<String, f64>,
    /// Figures for earlier periods, most recent first
    #[serde(default)]
    pub history: Vec<BTreeMap<String, f64>>,
}

impl StatementPayload {
    pub fn new(
        ticker: impl Into<String>,
        statement: StatementType,
        period: impl Into<String>,
        fields: BTreeMap<String, f64>,
    ) -> Self {
        let period = period.into();
        let period_end = NaiveDate::parse_from_str(&period, "%Y-%m-%d").ok();
        Self {
            ticker: ticker.into(),
            statement,
            provider: String::new(),
            provider_rank: 0,
            period,
            period_end,
            fetched_at: Utc::now(),
            fields,
            history: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, field: &str) -> Option<f64> {
        self.fields.get(field).copied()
    }

    pub fn missing_fields(&self) -> Vec<&'static str> {
        self.statement
            .required_fields()
            .iter()
            .copied()
            .filter(|f| !self.fields.contains_key(*f))
            .collect()
    }

    /// Days between the end of the reported period and the fetch
    pub fn age_days(&self) -> Option<i64> {
        self.period_end
            .map(|end| (self.fetched_at.date_naive() - end).num_days())
    }
}

/// Structured payload of a completed task
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskResult {
    pub capability: Capability,
    pub ticker: String,
    /// True when metrics were computed rather than looked up
    pub derived: bool,
    pub sources: Vec<StatementPayload>,
    pub metrics: BTreeMap<String, f64>,
}

impl TaskResult {
    pub fn lookup(capability: Capability, payload: StatementPayload) -> Self {
        Self {
            capability,
            ticker: payload.ticker.clone(),
            derived: false,
            metrics: payload.fields.clone(),
            sources: vec![payload],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty() || self.metrics.is_empty()
    }

    pub fn source(&self, statement: StatementType) -> Option<&StatementPayload> {
        self.sources.iter().find(|p| p.statement == statement)
    }
}
