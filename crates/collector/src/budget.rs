//! Budget evaluation.
//!
//! Each enabled budget is measured against the snapshots of its selector's
//! group over the current calendar period, and classified by how much of its
//! CPU or memory limit has been used.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc};
use tracing::{debug, info};

use crate::store::{AlertSeverity, Budget, BudgetPeriod, GroupType, Store, Usage};
use crate::Result;

/// Start of the calendar period containing `now`, at 00:00 UTC.
///
/// Weeks start on Monday; a Monday instant maps to that same day.
pub fn period_start(period: BudgetPeriod, now: DateTime<Utc>) -> DateTime<Utc> {
    let today = now.date_naive();
    let day = match period {
        BudgetPeriod::Daily => today,
        BudgetPeriod::Weekly => today - Duration::days(i64::from(today.weekday().num_days_from_monday())),
        BudgetPeriod::Monthly => today - Duration::days(i64::from(today.day0())),
    };
    Utc.from_utc_datetime(&day.and_time(NaiveTime::MIN))
}

/// Share of `limit` used, in percent. A limit of zero or less is unlimited.
pub fn percent_of(used: i64, limit: i64) -> f64 {
    if limit <= 0 {
        return 0.0;
    }
    used as f64 * 100.0 / limit as f64
}

pub fn classify(cpu_percent: f64, mem_percent: f64, warn_percent: i32) -> Option<AlertSeverity> {
    let warn = f64::from(warn_percent);
    if cpu_percent >= 100.0 || mem_percent >= 100.0 {
        Some(AlertSeverity::Critical)
    } else if cpu_percent >= warn || mem_percent >= warn {
        Some(AlertSeverity::Warn)
    } else {
        None
    }
}

/// A budget that crossed a threshold in this run.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub budget: Budget,
    pub group_type: GroupType,
    pub severity: AlertSeverity,
    pub usage: Usage,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub cpu_percent: f64,
    pub mem_percent: f64,
}

pub struct BudgetEvaluator {
    store: Arc<dyn Store>,
}

impl BudgetEvaluator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn evaluate(&self, budget: &Budget, now: DateTime<Utc>) -> Result<Option<Verdict>> {
        let Some(group_type) = budget.selector_type.group_type() else {
            debug!(
                "Budget {} has selector type {} which is not evaluated",
                budget.name, budget.selector_type
            );
            return Ok(None);
        };

        let start = period_start(budget.period, now);
        let usage = self
            .store
            .query_usage(group_type, &budget.selector_value, start, now)
            .await?;

        let cpu_percent = percent_of(usage.cpu_mcpu, budget.cpu_mcpu_limit);
        let mem_percent = percent_of(usage.mem_mib, budget.mem_mib_limit);
        debug!(
            "Budget {}: cpu {:.1}% mem {:.1}% since {}",
            budget.name, cpu_percent, mem_percent, start
        );

        Ok(classify(cpu_percent, mem_percent, budget.warn_percent).map(|severity| Verdict {
            budget: budget.clone(),
            group_type,
            severity,
            usage,
            period_start: start,
            period_end: now,
            cpu_percent,
            mem_percent,
        }))
    }

    /// Evaluates every enabled budget. There is no suppression across runs.
    pub async fn evaluate_all(&self, now: DateTime<Utc>) -> Result<Vec<Verdict>> {
        let budgets = self.store.list_enabled_budgets().await?;
        let mut verdicts = Vec::new();
        for budget in &budgets {
            if let Some(verdict) = self.evaluate(budget, now).await? {
                info!("Budget {} is at {} level", budget.name, verdict.severity);
                verdicts.push(verdict);
            }
        }
        Ok(verdicts)
    }
}
