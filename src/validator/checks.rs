//! The validation chain

use super::{IssueCode, ValidationCheck, ValidationIssue, ValidationPolicy};
use crate::models::{fields, StatementPayload, StatementType, Task, TaskResults, TaskStatus};
use std::collections::BTreeSet;

/// The standard chain, in evaluation order
pub fn default_checks() -> Vec<Box<dyn ValidationCheck>> {
    vec![
        Box::new(CompletenessCheck),
        Box::new(TaskErrorCheck),
        Box::new(NonEmptyResultCheck),
        Box::new(NegativeRevenueCheck),
        Box::new(BalanceSheetCheck),
        Box::new(RatioBoundsCheck),
        Box::new(FreshnessCheck),
        Box::new(OutlierCheck),
    ]
}

/// Statements across all results, each (ticker, statement, period) once.
/// A ratios task and a balance-sheet task for the same ticker share a
/// payload and should not report it twice.
fn unique_sources(results: &TaskResults) -> Vec<&StatementPayload> {
    let mut seen = BTreeSet::new();
    results
        .values()
        .flat_map(|r| r.sources.iter())
        .filter(|p| seen.insert((p.ticker.as_str(), p.statement, p.period.as_str())))
        .collect()
}

//
// ================= Structural Checks =================
//

/// Every planned task reached a terminal state
pub struct CompletenessCheck;

impl ValidationCheck for CompletenessCheck {
    fn name(&self) -> &'static str {
        "completeness"
    }

    fn check(
        &self,
        plan: &[Task],
        _results: &TaskResults,
        _policy: &ValidationPolicy,
    ) -> Vec<ValidationIssue> {
        if plan.is_empty() {
            return vec![ValidationIssue::blocking(
                IssueCode::EmptyPlan,
                "No tasks were planned",
            )];
        }

        plan.iter()
            .filter(|t| !t.is_terminal())
            .map(|t| {
                ValidationIssue::blocking(
                    IssueCode::IncompleteTask,
                    format!("Incomplete task {}: {}", t.id, t.description),
                )
            })
            .collect()
    }
}

pub struct TaskErrorCheck;

impl ValidationCheck for TaskErrorCheck {
    fn name(&self) -> &'static str {
        "task_errors"
    }

    fn check(
        &self,
        plan: &[Task],
        _results: &TaskResults,
        _policy: &ValidationPolicy,
    ) -> Vec<ValidationIssue> {
        plan.iter()
            .filter(|t| t.status == TaskStatus::Failed || t.error.is_some())
            .map(|t| {
                ValidationIssue::blocking(
                    IssueCode::TaskError,
                    format!(
                        "Task {} failed: {}",
                        t.id,
                        t.error.as_deref().unwrap_or("unknown error")
                    ),
                )
            })
            .collect()
    }
}

/// Completed tasks carry data in the results map
pub struct NonEmptyResultCheck;

impl ValidationCheck for NonEmptyResultCheck {
    fn name(&self) -> &'static str {
        "non_empty_results"
    }

    fn check(
        &self,
        plan: &[Task],
        results: &TaskResults,
        _policy: &ValidationPolicy,
    ) -> Vec<ValidationIssue> {
        plan.iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .filter(|t| results.get(&t.id).map_or(true, |r| r.is_empty()))
            .map(|t| {
                ValidationIssue::blocking(
                    IssueCode::EmptyResult,
                    format!("Task {} completed without data", t.id),
                )
            })
            .collect()
    }
}

//
// ================= Domain Checks =================
//

pub struct NegativeRevenueCheck;

impl ValidationCheck for NegativeRevenueCheck {
    fn name(&self) -> &'static str {
        "negative_revenue"
    }

    fn check(
        &self,
        _plan: &[Task],
        results: &TaskResults,
        _policy: &ValidationPolicy,
    ) -> Vec<ValidationIssue> {
        unique_sources(results)
            .into_iter()
            .filter(|p| p.statement == StatementType::IncomeStatement)
            .filter_map(|p| {
                let revenue = p.get(fields::TOTAL_REVENUE)?;
                (revenue < 0.0).then(|| {
                    ValidationIssue::warning(
                        IssueCode::NegativeRevenue,
                        format!(
                            "{} reports negative revenue ({}) for {}",
                            p.ticker, revenue, p.period
                        ),
                    )
                })
            })
            .collect()
    }
}

/// Assets should equal liabilities plus equity. Negative totals are
/// impossible and block.
pub struct BalanceSheetCheck;

impl ValidationCheck for BalanceSheetCheck {
    fn name(&self) -> &'static str {
        "balance_sheet_consistency"
    }

    fn check(
        &self,
        _plan: &[Task],
        results: &TaskResults,
        policy: &ValidationPolicy,
    ) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        for p in unique_sources(results)
            .into_iter()
            .filter(|p| p.statement == StatementType::BalanceSheet)
        {
            let assets = p.get(fields::TOTAL_ASSETS);
            let liabilities = p.get(fields::TOTAL_LIABILITIES);
            let equity = p.get(fields::TOTAL_EQUITY);

            if let Some(a) = assets.filter(|a| *a < 0.0) {
                issues.push(ValidationIssue::blocking(
                    IssueCode::NegativeTotalAssets,
                    format!("{} reports negative total assets ({}) for {}", p.ticker, a, p.period),
                ));
            }
            if let Some(l) = liabilities.filter(|l| *l < 0.0) {
                issues.push(ValidationIssue::blocking(
                    IssueCode::NegativeTotalLiabilities,
                    format!(
                        "{} reports negative total liabilities ({}) for {}",
                        p.ticker, l, p.period
                    ),
                ));
            }

            let (Some(a), Some(l), Some(e)) = (assets, liabilities, equity) else {
                continue;
            };

            let claimed = l + e;
            let scale = a.abs().max(claimed.abs());
            if scale == 0.0 {
                continue;
            }
            let mismatch = (a - claimed).abs() / scale;

            let message = format!(
                "{} balance sheet for {} does not balance: assets {} vs liabilities + equity {} ({:.1}% off)",
                p.ticker,
                p.period,
                a,
                claimed,
                mismatch * 100.0
            );
            if mismatch > policy.consistency_blocking_tolerance {
                issues.push(ValidationIssue::blocking(IssueCode::BalanceSheetMismatch, message));
            } else if mismatch > policy.consistency_warning_tolerance {
                issues.push(ValidationIssue::warning(IssueCode::BalanceSheetMismatch, message));
            }
        }

        issues
    }
}

/// Plausibility of computed ratios; disabled by configuration
pub struct RatioBoundsCheck;

impl ValidationCheck for RatioBoundsCheck {
    fn name(&self) -> &'static str {
        "ratio_bounds"
    }

    fn check(
        &self,
        _plan: &[Task],
        results: &TaskResults,
        policy: &ValidationPolicy,
    ) -> Vec<ValidationIssue> {
        if !policy.ratio_validation_enabled {
            return Vec::new();
        }

        let mut issues = Vec::new();
        for (task_id, result) in results.iter().filter(|(_, r)| r.derived) {
            let mut flag = |metric: &str, value: f64, range: String| {
                issues.push(ValidationIssue::warning(
                    IssueCode::RatioOutOfBounds,
                    format!(
                        "{} {} of {:.3} is outside the plausible range {} (task {})",
                        result.ticker, metric, value, range, task_id
                    ),
                ));
            };

            let (roe_lo, roe_hi) = policy.return_on_equity_bounds;
            if let Some(roe) = result.metrics.get(fields::RETURN_ON_EQUITY).copied() {
                if roe < roe_lo || roe > roe_hi {
                    flag("return on equity", roe, format!("[{}, {}]", roe_lo, roe_hi));
                }
            }

            let (margin_lo, margin_hi) = policy.net_margin_bounds;
            if let Some(margin) = result.metrics.get(fields::NET_MARGIN).copied() {
                if margin < margin_lo || margin > margin_hi {
                    flag("net margin", margin, format!("[{}, {}]", margin_lo, margin_hi));
                }
            }

            if let Some(de) = result.metrics.get(fields::DEBT_TO_EQUITY).copied() {
                if de > policy.max_debt_to_equity {
                    flag(
                        "debt to equity",
                        de,
                        format!("<= {}", policy.max_debt_to_equity),
                    );
                }
            }
        }
        issues
    }
}

pub struct FreshnessCheck;

impl ValidationCheck for FreshnessCheck {
    fn name(&self) -> &'static str {
        "freshness"
    }

    fn check(
        &self,
        _plan: &[Task],
        results: &TaskResults,
        policy: &ValidationPolicy,
    ) -> Vec<ValidationIssue> {
        unique_sources(results)
            .into_iter()
            .filter_map(|p| {
                let age = p.age_days()?;
                if age > policy.freshness_threshold_days {
                    Some(ValidationIssue::warning(
                        IssueCode::StaleData,
                        format!(
                            "{} {} for {} is {} days old (threshold {})",
                            p.ticker, p.statement, p.period, age, policy.freshness_threshold_days
                        ),
                    ))
                } else if age < 0 {
                    Some(ValidationIssue::warning(
                        IssueCode::FuturePeriod,
                        format!(
                            "{} {} period {} ends after it was fetched",
                            p.ticker, p.statement, p.period
                        ),
                    ))
                } else {
                    None
                }
            })
            .collect()
    }
}

/// Latest value of each required field against its own history
pub struct OutlierCheck;

/// Fewer prior periods than this and no z-score is computed
const MIN_HISTORY: usize = 3;

impl ValidationCheck for OutlierCheck {
    fn name(&self) -> &'static str {
        "statistical_outliers"
    }

    fn check(
        &self,
        _plan: &[Task],
        results: &TaskResults,
        policy: &ValidationPolicy,
    ) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        for p in unique_sources(results) {
            for field in p.statement.required_fields() {
                let Some(latest) = p.get(field) else {
                    continue;
                };
                let history: Vec<f64> = p
                    .history
                    .iter()
                    .filter_map(|period| period.get(*field).copied())
                    .collect();

                if let Some(z) = z_score(latest, &history) {
                    if z.abs() > policy.outlier_sigma {
                        issues.push(ValidationIssue::warning(
                            IssueCode::StatisticalOutlier,
                            format!(
                                "{} {} of {} for {} is {:.1} standard deviations from its history",
                                p.ticker, field, latest, p.period, z
                            ),
                        ));
                    }
                }
            }
        }

        issues
    }
}

fn z_score(value: f64, history: &[f64]) -> Option<f64> {
    if history.len() < MIN_HISTORY {
        return None;
    }
    let n = history.len() as f64;
    let mean = history.iter().sum::<f64>() / n;
    let variance = history.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    let std_dev = variance.sqrt();
    if std_dev == 0.0 {
        return None;
    }
    Some((value - mean) / std_dev)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Capability, TaskResult};
    use crate::validator::Severity;
    use chrono::{Duration, Utc};
    use std::collections::BTreeMap;

    fn payload(statement: StatementType, values: &[(&str, f64)]) -> StatementPayload {
        let mut p = StatementPayload::new(
            "AAPL",
            statement,
            "2023-12-31",
            values.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        );
        p.period_end = Some((Utc::now() - Duration::days(10)).date_naive());
        p
    }

    fn single(capability: Capability, p: StatementPayload) -> TaskResults {
        TaskResults::from([("task-1".to_string(), TaskResult::lookup(capability, p))])
    }

    fn ratios(metrics: &[(&str, f64)]) -> TaskResults {
        let result = TaskResult {
            capability: Capability::FinancialRatios,
            ticker: "AAPL".to_string(),
            derived: true,
            sources: Vec::new(),
            metrics: metrics.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        };
        TaskResults::from([("task-1".to_string(), result)])
    }

    #[test]
    fn test_small_mismatch_only_warns() {
        let results = single(
            Capability::BalanceSheet,
            payload(
                StatementType::BalanceSheet,
                &[
                    (fields::TOTAL_ASSETS, 100.0),
                    (fields::TOTAL_LIABILITIES, 60.0),
                    (fields::TOTAL_EQUITY, 45.0),
                ],
            ),
        );

        let issues = BalanceSheetCheck.check(&[], &results, &ValidationPolicy::default());
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, Severity::Warning);
    }

    #[test]
    fn test_within_tolerance_is_clean() {
        let results = single(
            Capability::BalanceSheet,
            payload(
                StatementType::BalanceSheet,
                &[
                    (fields::TOTAL_ASSETS, 1000.0),
                    (fields::TOTAL_LIABILITIES, 600.0),
                    (fields::TOTAL_EQUITY, 401.0),
                ],
            ),
        );

        assert!(BalanceSheetCheck
            .check(&[], &results, &ValidationPolicy::default())
            .is_empty());
    }

    #[test]
    fn test_negative_assets_block() {
        let results = single(
            Capability::BalanceSheet,
            payload(StatementType::BalanceSheet, &[(fields::TOTAL_ASSETS, -1.0)]),
        );

        let issues = BalanceSheetCheck.check(&[], &results, &ValidationPolicy::default());
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].code, IssueCode::NegativeTotalAssets);
        assert!(issues[0].is_blocking());
    }

    #[test]
    fn test_shared_source_reported_once() {
        let p = payload(StatementType::IncomeStatement, &[(fields::TOTAL_REVENUE, -3.0)]);
        let mut results = single(Capability::IncomeStatement, p.clone());
        results.insert(
            "task-2".to_string(),
            TaskResult::lookup(Capability::IncomeStatement, p),
        );

        let issues = NegativeRevenueCheck.check(&[], &results, &ValidationPolicy::default());
        assert_eq!(issues.len(), 1);
    }

    #[test]
    fn test_ratio_bounds() {
        let results = ratios(&[
            (fields::RETURN_ON_EQUITY, 3.5),
            (fields::NET_MARGIN, 0.2),
            (fields::DEBT_TO_EQUITY, 12.0),
        ]);

        let issues = RatioBoundsCheck.check(&[], &results, &ValidationPolicy::default());
        assert_eq!(issues.len(), 2);
        assert!(issues.iter().all(|i| i.code == IssueCode::RatioOutOfBounds));
        assert!(issues.iter().all(|i| !i.is_blocking()));
    }

    #[test]
    fn test_ratio_bounds_can_be_disabled() {
        let results = ratios(&[(fields::RETURN_ON_EQUITY, 3.5)]);
        let policy = ValidationPolicy {
            ratio_validation_enabled: false,
            ..ValidationPolicy::default()
        };

        assert!(RatioBoundsCheck.check(&[], &results, &policy).is_empty());
    }

    #[test]
    fn test_stale_data_warns() {
        let mut p = payload(StatementType::CashFlow, &[(fields::OPERATING_CASHFLOW, 5.0)]);
        p.period_end = Some((Utc::now() - Duration::days(400)).date_naive());
        let results = single(Capability::CashFlow, p);

        let issues = FreshnessCheck.check(&[], &results, &ValidationPolicy::default());
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].code, IssueCode::StaleData);
        assert_eq!(issues[0].severity, Severity::Warning);
    }

    #[test]
    fn test_outlier_against_history() {
        let mut p = payload(StatementType::CashFlow, &[(fields::OPERATING_CASHFLOW, 500.0)]);
        p.history = [100.0, 102.0, 98.0, 101.0]
            .into_iter()
            .map(|v| BTreeMap::from([(fields::OPERATING_CASHFLOW.to_string(), v)]))
            .collect();
        let results = single(Capability::CashFlow, p);

        let issues = OutlierCheck.check(&[], &results, &ValidationPolicy::default());
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].code, IssueCode::StatisticalOutlier);
        assert!(!issues[0].is_blocking());
    }

    #[test]
    fn test_short_history_skips_outliers() {
        assert_eq!(z_score(500.0, &[100.0, 101.0]), None);
        assert_eq!(z_score(500.0, &[100.0, 100.0, 100.0]), None);
        assert!(z_score(100.0, &[99.0, 100.0, 101.0]).is_some_and(|z| z.abs() < 1e-9));
    }
}
