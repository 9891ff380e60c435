//! Validator
//!
//! Runs a fixed, ordered chain of checks over the executed plan. Every check
//! runs even after a blocking failure so the issue list is complete. Any
//! blocking issue invalidates the result and forces overall confidence to
//! zero; that is the gate in front of synthesis.
//!
//! Validation is a pure function of `(plan, results)`.

use crate::config::ResearchConfig;
use crate::config::ConfidenceWeights;
use crate::models::{Task, TaskResults};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

pub mod checks;
pub mod confidence;

pub use checks::default_checks;
pub use confidence::ConfidenceBreakdown;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Blocking,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IssueCode {
    EmptyPlan,
    IncompleteTask,
    TaskError,
    EmptyResult,
    NegativeRevenue,
    NegativeTotalAssets,
    NegativeTotalLiabilities,
    BalanceSheetMismatch,
    RatioOutOfBounds,
    StaleData,
    FuturePeriod,
    StatisticalOutlier,
    NoConfidence,
}

impl IssueCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueCode::EmptyPlan => "empty_plan",
            IssueCode::IncompleteTask => "incomplete_task",
            IssueCode::TaskError => "task_error",
            IssueCode::EmptyResult => "empty_result",
            IssueCode::NegativeRevenue => "negative_revenue",
            IssueCode::NegativeTotalAssets => "negative_total_assets",
            IssueCode::NegativeTotalLiabilities => "negative_total_liabilities",
            IssueCode::BalanceSheetMismatch => "balance_sheet_mismatch",
            IssueCode::RatioOutOfBounds => "ratio_out_of_bounds",
            IssueCode::StaleData => "stale_data",
            IssueCode::FuturePeriod => "future_period",
            IssueCode::StatisticalOutlier => "statistical_outlier",
            IssueCode::NoConfidence => "no_confidence",
        }
    }
}

impl fmt::Display for IssueCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationIssue {
    pub code: IssueCode,
    pub severity: Severity,
    pub message: String,
}

impl ValidationIssue {
    pub fn blocking(code: IssueCode, message: impl Into<String>) -> Self {
        Self {
            code,
            severity: Severity::Blocking,
            message: message.into(),
        }
    }

    pub fn warning(code: IssueCode, message: impl Into<String>) -> Self {
        Self {
            code,
            severity: Severity::Warning,
            message: message.into(),
        }
    }

    pub fn is_blocking(&self) -> bool {
        self.severity == Severity::Blocking
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Outcome of validation. `is_valid == false` exactly when overall
/// confidence is zero and at least one issue is blocking.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationResult {
    is_valid: bool,
    confidence: ConfidenceBreakdown,
    issues: Vec<ValidationIssue>,
}

impl ValidationResult {
    /// The only constructor; applies the gate
    pub fn new(confidence: ConfidenceBreakdown, mut issues: Vec<ValidationIssue>) -> Self {
        if !issues.iter().any(ValidationIssue::is_blocking) && confidence.overall <= 0.0 {
            issues.push(ValidationIssue::blocking(
                IssueCode::NoConfidence,
                "Overall confidence is zero",
            ));
        }

        let is_valid = !issues.iter().any(ValidationIssue::is_blocking);
        let confidence = if is_valid {
            confidence
        } else {
            confidence.gated()
        };

        Self {
            is_valid,
            confidence,
            issues,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid
    }

    pub fn confidence(&self) -> &ConfidenceBreakdown {
        &self.confidence
    }

    pub fn overall(&self) -> f64 {
        self.confidence.overall
    }

    pub fn issues(&self) -> &[ValidationIssue] {
        &self.issues
    }

    pub fn blocking_issues(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| i.is_blocking())
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| !i.is_blocking())
    }
}

/// Thresholds the checks and the confidence model read
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationPolicy {
    pub ratio_validation_enabled: bool,
    pub freshness_threshold_days: i64,
    pub outlier_sigma: f64,
    pub weights: ConfidenceWeights,
    /// Relative balance-sheet mismatch above which a warning is raised
    pub consistency_warning_tolerance: f64,
    /// Relative balance-sheet mismatch above which the run is blocked
    pub consistency_blocking_tolerance: f64,
    pub return_on_equity_bounds: (f64, f64),
    pub net_margin_bounds: (f64, f64),
    pub max_debt_to_equity: f64,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            ratio_validation_enabled: true,
            freshness_threshold_days: 180,
            outlier_sigma: 3.0,
            weights: ConfidenceWeights::default(),
            consistency_warning_tolerance: 0.01,
            consistency_blocking_tolerance: 0.10,
            return_on_equity_bounds: (-2.0, 2.0),
            net_margin_bounds: (-1.0, 1.0),
            max_debt_to_equity: 10.0,
        }
    }
}

impl ValidationPolicy {
    pub fn from_config(config: &ResearchConfig) -> Self {
        Self {
            ratio_validation_enabled: config.ratio_validation_enabled,
            freshness_threshold_days: config.freshness_threshold_days,
            outlier_sigma: config.outlier_sigma,
            weights: config.confidence_weights,
            ..Self::default()
        }
    }
}

/// One link in the validation chain
pub trait ValidationCheck: Send + Sync {
    fn name(&self) -> &'static str;

    fn check(
        &self,
        plan: &[Task],
        results: &TaskResults,
        policy: &ValidationPolicy,
    ) -> Vec<ValidationIssue>;
}

pub struct Validator {
    checks: Vec<Box<dyn ValidationCheck>>,
    policy: ValidationPolicy,
}

impl Validator {
    /// Validator with the standard check chain
    pub fn new(policy: ValidationPolicy) -> Self {
        Self {
            checks: default_checks(),
            policy,
        }
    }

    pub fn check_names(&self) -> Vec<&'static str> {
        self.checks.iter().map(|c| c.name()).collect()
    }

    pub fn validate(&self, plan: &[Task], results: &TaskResults) -> ValidationResult {
        let issues: Vec<ValidationIssue> = self
            .checks
            .iter()
            .flat_map(|check| check.check(plan, results, &self.policy))
            .collect();

        let confidence = ConfidenceBreakdown::compute(plan, results, &self.policy);
        let result = ValidationResult::new(confidence, issues);

        info!(
            check_count = self.checks.len(),
            valid = result.is_valid(),
            blocking = result.blocking_issues().count(),
            warnings = result.warnings().count(),
            overall = result.overall(),
            "Validation completed"
        );

        result
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(ValidationPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        fields, Capability, StatementPayload, StatementType, TaskResult, TaskStatus,
    };
    use chrono::{Duration, Utc};
    use std::collections::BTreeMap;

    fn args(ticker: &str) -> BTreeMap<String, String> {
        BTreeMap::from([("ticker".to_string(), ticker.to_string())])
    }

    fn fresh(mut payload: StatementPayload) -> StatementPayload {
        payload.fetched_at = Utc::now();
        payload.period_end = Some((Utc::now() - Duration::days(30)).date_naive());
        payload
    }

    fn income_result(revenue: f64) -> TaskResult {
        let payload = fresh(StatementPayload::new(
            "AAPL",
            StatementType::IncomeStatement,
            "2023-12-31",
            BTreeMap::from([
                (fields::TOTAL_REVENUE.to_string(), revenue),
                (fields::NET_INCOME.to_string(), 25.0),
            ]),
        ));
        TaskResult::lookup(Capability::IncomeStatement, payload)
    }

    fn balance_result(assets: f64, liabilities: f64, equity: f64) -> TaskResult {
        let payload = fresh(StatementPayload::new(
            "AAPL",
            StatementType::BalanceSheet,
            "2023-12-31",
            BTreeMap::from([
                (fields::TOTAL_ASSETS.to_string(), assets),
                (fields::TOTAL_LIABILITIES.to_string(), liabilities),
                (fields::TOTAL_EQUITY.to_string(), equity),
            ]),
        ));
        TaskResult::lookup(Capability::BalanceSheet, payload)
    }

    fn completed(id: &str, tool: &str, result: TaskResult) -> (Task, TaskResults) {
        let task = Task::new(id, format!("Fetch {}", tool), tool, args("AAPL"))
            .start()
            .complete(result.clone());
        (task, TaskResults::from([(id.to_string(), result)]))
    }

    #[test]
    fn test_valid_data_passes() {
        let (task, results) = completed("task-1", "income_statement", income_result(100.0));

        let result = Validator::default().validate(&[task], &results);

        assert!(result.is_valid());
        assert!(result.overall() > 0.0);
        assert_eq!(result.confidence().data_coverage, 1.0);
        assert!(result.blocking_issues().next().is_none());
    }

    #[test]
    fn test_incomplete_task_blocks() {
        let task = Task::new("task-1", "Fetch data", "income_statement", args("AAPL"));

        let result = Validator::default().validate(&[task], &TaskResults::new());

        assert!(!result.is_valid());
        assert_eq!(result.overall(), 0.0);
        assert!(result
            .issues()
            .iter()
            .any(|i| i.code == IssueCode::IncompleteTask && i.is_blocking()));
    }

    #[test]
    fn test_failed_task_blocks() {
        let task = Task::new("task-1", "Fetch data", "income_statement", args("ZZZZ"))
            .start()
            .fail("Data provider error: all providers failed");

        let result = Validator::default().validate(&[task], &TaskResults::new());

        assert!(!result.is_valid());
        assert_eq!(result.overall(), 0.0);
        assert!(result.issues().iter().any(|i| i.code == IssueCode::TaskError));
    }

    #[test]
    fn test_completed_task_without_data_blocks() {
        let (task, _) = completed("task-1", "income_statement", income_result(100.0));

        let result = Validator::default().validate(&[task], &TaskResults::new());

        assert!(!result.is_valid());
        assert!(result.issues().iter().any(|i| i.code == IssueCode::EmptyResult));
    }

    #[test]
    fn test_empty_plan_blocks() {
        let result = Validator::default().validate(&[], &TaskResults::new());
        assert!(!result.is_valid());
        assert_eq!(result.issues()[0].code, IssueCode::EmptyPlan);
    }

    #[test]
    fn test_balance_sheet_mismatch_blocks_completed_run() {
        let (task, results) =
            completed("task-1", "balance_sheet", balance_result(100.0, 90.0, 60.0));
        assert_eq!(task.status, TaskStatus::Completed);

        let result = Validator::default().validate(&[task], &results);

        assert!(!result.is_valid());
        assert_eq!(result.overall(), 0.0);
        let issue = result
            .issues()
            .iter()
            .find(|i| i.code == IssueCode::BalanceSheetMismatch)
            .unwrap();
        assert!(issue.is_blocking());
    }

    #[test]
    fn test_negative_revenue_only_warns() {
        let (task, results) = completed("task-1", "income_statement", income_result(-5.0));

        let result = Validator::default().validate(&[task], &results);

        assert!(result.is_valid());
        assert!(result.overall() > 0.0);
        let issue = result.warnings().next().unwrap();
        assert_eq!(issue.code, IssueCode::NegativeRevenue);
    }

    #[test]
    fn test_all_checks_run_after_blocking_failure() {
        let (done, results) = completed("task-1", "income_statement", income_result(-5.0));
        let pending = Task::new("task-2", "Fetch more", "cash_flow", args("AAPL"));

        let result = Validator::default().validate(&[done, pending], &results);

        assert!(!result.is_valid());
        let codes: Vec<IssueCode> = result.issues().iter().map(|i| i.code).collect();
        assert!(codes.contains(&IssueCode::IncompleteTask));
        assert!(codes.contains(&IssueCode::NegativeRevenue));
    }

    #[test]
    fn test_validation_is_idempotent() {
        let (task, results) =
            completed("task-1", "balance_sheet", balance_result(100.0, 60.0, 40.5));
        let validator = Validator::default();

        let first = validator.validate(std::slice::from_ref(&task), &results);
        let second = validator.validate(std::slice::from_ref(&task), &results);
        assert_eq!(first, second);
    }

    #[test]
    fn test_invalid_iff_zero_confidence() {
        let cases = vec![
            completed("task-1", "income_statement", income_result(100.0)),
            completed("task-1", "income_statement", income_result(-1.0)),
            completed("task-1", "balance_sheet", balance_result(-10.0, 5.0, 5.0)),
            completed("task-1", "balance_sheet", balance_result(100.0, 60.0, 40.0)),
            completed("task-1", "balance_sheet", balance_result(100.0, 90.0, 60.0)),
        ];

        for (task, results) in cases {
            let result = Validator::default().validate(&[task], &results);
            assert_eq!(!result.is_valid(), result.overall() == 0.0);
            assert_eq!(
                !result.is_valid(),
                result.blocking_issues().next().is_some()
            );
        }
    }

    #[test]
    fn test_zero_confidence_without_blocking_is_gated() {
        let result = ValidationResult::new(ConfidenceBreakdown::default(), vec![]);
        assert!(!result.is_valid());
        assert_eq!(result.issues()[0].code, IssueCode::NoConfidence);
    }

    #[test]
    fn test_chain_order() {
        assert_eq!(
            Validator::default().check_names(),
            vec![
                "completeness",
                "task_errors",
                "non_empty_results",
                "negative_revenue",
                "balance_sheet_consistency",
                "ratio_bounds",
                "freshness",
                "statistical_outliers",
            ]
        );
    }
}
