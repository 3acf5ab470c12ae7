use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::workload::{ComplianceStatus, WorkloadKind};
use crate::{Error, Result};

// Aggregation dimension of a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GroupType {
    Team,
    Namespace,
    App,
}

/// Cost of one group over one window. Written once and never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationSnapshot {
    pub id: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub group_type: GroupType,
    pub group_key: String,
    pub cpu_mcpu: i64,
    pub mem_mib: i64,
    pub cpu_cost_units: f64,
    pub mem_cost_units: f64,
    pub total_cost_units: f64,
}

impl AllocationSnapshot {
    /// Deterministic snapshot id, stable across re-runs of the same window.
    pub fn snapshot_id(window_start: DateTime<Utc>, group_type: GroupType, group_key: &str) -> String {
        format!(
            "{}_{}_{}",
            window_start.to_rfc3339_opts(SecondsFormat::Secs, true),
            group_type,
            group_key
        )
    }
}

// Append-only per-workload audit trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadInventory {
    pub id: Option<i64>,
    pub snapshot_id: String,
    pub namespace: String,
    pub kind: WorkloadKind,
    pub name: String,
    pub labels_json: String,
    pub cpu_request_mcpu: i64,
    pub mem_request_mib: i64,
    pub compliance_status: ComplianceStatus,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SelectorType {
    Team,
    Namespace,
    Label,
}

impl SelectorType {
    /// Snapshot dimension a budget with this selector is measured against.
    /// `Label` budgets have no snapshot dimension and are not evaluated.
    pub fn group_type(&self) -> Option<GroupType> {
        match self {
            SelectorType::Team => Some(GroupType::Team),
            SelectorType::Namespace => Some(GroupType::Namespace),
            SelectorType::Label => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BudgetPeriod {
    Daily,
    Weekly,
    Monthly,
}

pub const DEFAULT_WARN_PERCENT: i32 = 80;

// Spending limit, managed outside the collector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Budget {
    pub id: String,
    pub name: String,
    pub selector_type: SelectorType,
    pub selector_key: Option<String>,
    pub selector_value: String,
    pub period: BudgetPeriod,
    pub cpu_mcpu_limit: i64,
    pub mem_mib_limit: i64,
    pub warn_percent: i32,
    pub enabled: bool,
    pub webhook_secret_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Budget {
    pub fn new(
        name: impl Into<String>,
        selector_type: SelectorType,
        selector_value: impl Into<String>,
        period: BudgetPeriod,
        cpu_mcpu_limit: i64,
        mem_mib_limit: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            selector_type,
            selector_key: None,
            selector_value: selector_value.into(),
            period,
            cpu_mcpu_limit,
            mem_mib_limit,
            warn_percent: DEFAULT_WARN_PERCENT,
            enabled: true,
            webhook_secret_name: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertSeverity {
    Warn,
    Critical,
}

// Budget alert audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub severity: AlertSeverity,
    pub budget_name: String,
    pub message: String,
    pub details: JsonValue,
}

/// Summed usage of one group over a period.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub cpu_mcpu: i64,
    pub mem_mib: i64,
    pub total_cost_units: f64,
}

/// An application ranked by cost inside a budget's scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Offender {
    pub app_key: String,
    pub cpu_mcpu: i64,
    pub mem_mib: i64,
    pub total_cost_units: f64,
}

/// Which inventory rows an offender query is restricted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OffenderScope {
    /// Workloads whose `label_key` label equals `value`.
    Team { label_key: String, value: String },
    Namespace(String),
}

impl std::str::FromStr for GroupType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "TEAM" => Ok(GroupType::Team),
            "NAMESPACE" => Ok(GroupType::Namespace),
            "APP" => Ok(GroupType::App),
            _ => Err(Error::Internal(format!("Invalid group type: {}", s))),
        }
    }
}

impl std::fmt::Display for GroupType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GroupType::Team => write!(f, "TEAM"),
            GroupType::Namespace => write!(f, "NAMESPACE"),
            GroupType::App => write!(f, "APP"),
        }
    }
}

impl std::str::FromStr for SelectorType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "TEAM" => Ok(SelectorType::Team),
            "NAMESPACE" => Ok(SelectorType::Namespace),
            "LABEL" => Ok(SelectorType::Label),
            _ => Err(Error::Internal(format!("Invalid selector type: {}", s))),
        }
    }
}

impl std::fmt::Display for SelectorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SelectorType::Team => write!(f, "TEAM"),
            SelectorType::Namespace => write!(f, "NAMESPACE"),
            SelectorType::Label => write!(f, "LABEL"),
        }
    }
}

impl std::str::FromStr for BudgetPeriod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "DAILY" => Ok(BudgetPeriod::Daily),
            "WEEKLY" => Ok(BudgetPeriod::Weekly),
            "MONTHLY" => Ok(BudgetPeriod::Monthly),
            _ => Err(Error::Internal(format!("Invalid budget period: {}", s))),
        }
    }
}

impl std::fmt::Display for BudgetPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BudgetPeriod::Daily => write!(f, "DAILY"),
            BudgetPeriod::Weekly => write!(f, "WEEKLY"),
            BudgetPeriod::Monthly => write!(f, "MONTHLY"),
        }
    }
}

impl std::str::FromStr for AlertSeverity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "WARN" => Ok(AlertSeverity::Warn),
            "CRITICAL" => Ok(AlertSeverity::Critical),
            _ => Err(Error::Internal(format!("Invalid alert severity: {}", s))),
        }
    }
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertSeverity::Warn => write!(f, "WARN"),
            AlertSeverity::Critical => write!(f, "CRITICAL"),
        }
    }
}

impl std::str::FromStr for WorkloadKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Deployment" => Ok(WorkloadKind::Deployment),
            "StatefulSet" => Ok(WorkloadKind::StatefulSet),
            "DaemonSet" => Ok(WorkloadKind::DaemonSet),
            "Job" => Ok(WorkloadKind::Job),
            _ => Err(Error::Internal(format!("Invalid workload kind: {}", s))),
        }
    }
}
