//! Budget alert dispatch.
//!
//! A [`Verdict`] becomes one alert audit row and, when the budget names a
//! secret holding a webhook URL, one detached webhook delivery.

mod webhook;

pub use webhook::WebhookSink;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::budget::Verdict;
use crate::metrics::BUDGET_ALERTS_TOTAL;
use crate::source::WorkloadSource;
use crate::store::{
    Alert, AlertSeverity, BudgetPeriod, GroupType, Offender, OffenderScope, SelectorType, Store,
};
use crate::Result;

pub const TOP_OFFENDERS_LIMIT: i64 = 5;

/// Secret key holding the webhook URL.
pub const WEBHOOK_URL_KEY: &str = "webhook.url";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertPayload {
    pub timestamp: DateTime<Utc>,
    pub severity: AlertSeverity,
    pub budget_id: String,
    pub budget_name: String,
    pub selector_type: SelectorType,
    pub selector_value: String,
    pub period: BudgetPeriod,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub current_cpu_mcpu: i64,
    pub current_mem_mib: i64,
    pub limit_cpu_mcpu: i64,
    pub limit_mem_mib: i64,
    pub cpu_percent: f64,
    pub mem_percent: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dashboard_url: Option<String>,
    pub top_offenders: Vec<Offender>,
}

pub struct AlertDispatcher {
    store: Arc<dyn Store>,
    source: Arc<dyn WorkloadSource>,
    sink: WebhookSink,
    team_label: String,
    dashboard_url: Option<String>,
}

impl AlertDispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        source: Arc<dyn WorkloadSource>,
        sink: WebhookSink,
        team_label: impl Into<String>,
        dashboard_url: Option<String>,
    ) -> Self {
        Self {
            store,
            source,
            sink,
            team_label: team_label.into(),
            dashboard_url,
        }
    }

    fn offender_scope(&self, verdict: &Verdict) -> Option<OffenderScope> {
        match verdict.group_type {
            GroupType::Team => Some(OffenderScope::Team {
                label_key: self.team_label.clone(),
                value: verdict.budget.selector_value.clone(),
            }),
            GroupType::Namespace => Some(OffenderScope::Namespace(verdict.budget.selector_value.clone())),
            GroupType::App => None,
        }
    }

    pub fn payload(&self, verdict: &Verdict, offenders: Vec<Offender>, timestamp: DateTime<Utc>) -> AlertPayload {
        let budget = &verdict.budget;
        AlertPayload {
            timestamp,
            severity: verdict.severity,
            budget_id: budget.id.clone(),
            budget_name: budget.name.clone(),
            selector_type: budget.selector_type,
            selector_value: budget.selector_value.clone(),
            period: budget.period,
            period_start: verdict.period_start,
            period_end: verdict.period_end,
            current_cpu_mcpu: verdict.usage.cpu_mcpu,
            current_mem_mib: verdict.usage.mem_mib,
            limit_cpu_mcpu: budget.cpu_mcpu_limit,
            limit_mem_mib: budget.mem_mib_limit,
            cpu_percent: verdict.cpu_percent,
            mem_percent: verdict.mem_percent,
            dashboard_url: self.dashboard_url.clone(),
            top_offenders: offenders,
        }
    }

    async fn webhook_url(&self, verdict: &Verdict) -> Option<String> {
        let budget = &verdict.budget;
        let Some(secret_name) = budget.webhook_secret_name.as_deref().filter(|s| !s.trim().is_empty()) else {
            warn!("No webhook secret configured for budget {}", budget.name);
            return None;
        };

        match self.source.get_secret(secret_name).await {
            Ok(Some(mut data)) => {
                let url = data.remove(WEBHOOK_URL_KEY);
                if url.is_none() {
                    warn!(
                        "Secret {} for budget {} has no {} key",
                        secret_name, budget.name, WEBHOOK_URL_KEY
                    );
                }
                url
            }
            Ok(None) => {
                warn!("Secret {} for budget {} not found", secret_name, budget.name);
                None
            }
            Err(e) => {
                warn!("Error fetching secret {} for budget {}: {}", secret_name, budget.name, e);
                None
            }
        }
    }

    /// Records the alert, then starts delivery if a webhook URL resolves.
    ///
    /// The returned handle belongs to a detached task; awaiting it is optional.
    pub async fn dispatch(&self, verdict: &Verdict) -> Result<Option<JoinHandle<()>>> {
        let budget = &verdict.budget;
        let now = Utc::now();

        let offenders = match self.offender_scope(verdict) {
            Some(scope) => {
                self.store
                    .query_top_offenders(&scope, verdict.period_start, verdict.period_end, TOP_OFFENDERS_LIMIT)
                    .await?
            }
            None => Vec::new(),
        };
        let payload = self.payload(verdict, offenders, now);

        let alert = Alert {
            id: Uuid::new_v4().to_string(),
            timestamp: now,
            severity: verdict.severity,
            budget_name: budget.name.clone(),
            message: format!(
                "Budget {} reached {} level: cpu {:.1}%, memory {:.1}%",
                budget.name, verdict.severity, verdict.cpu_percent, verdict.mem_percent
            ),
            details: serde_json::to_value(&payload)?,
        };
        self.store.append_alert(&alert).await?;
        let severity = verdict.severity.to_string();
        BUDGET_ALERTS_TOTAL.with_label_values(&[severity.as_str()]).inc();
        info!("{}", alert.message);

        let Some(url) = self.webhook_url(verdict).await else {
            return Ok(None);
        };
        Ok(Some(self.sink.deliver(url, budget.name.clone(), payload)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MockWorkloadSource;
    use crate::store::{Budget, SqliteStore, Usage};
    use chrono::TimeZone;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn verdict(secret: Option<&str>) -> Verdict {
        let mut budget = Budget::new("payments", SelectorType::Namespace, "payments", BudgetPeriod::Daily, 1000, 0);
        budget.webhook_secret_name = secret.map(str::to_string);
        Verdict {
            budget,
            group_type: GroupType::Namespace,
            severity: AlertSeverity::Critical,
            usage: Usage {
                cpu_mcpu: 1200,
                mem_mib: 64,
                total_cost_units: 1.5,
            },
            period_start: Utc.with_ymd_and_hms(2024, 5, 15, 0, 0, 0).unwrap(),
            period_end: Utc.with_ymd_and_hms(2024, 5, 15, 12, 0, 0).unwrap(),
            cpu_percent: 120.0,
            mem_percent: 0.0,
        }
    }

    async fn dispatcher(source: MockWorkloadSource) -> (Arc<dyn Store>, AlertDispatcher) {
        let store = SqliteStore::new(":memory:", 1).await.unwrap();
        store.init().await.unwrap();
        let store: Arc<dyn Store> = Arc::new(store);
        let dispatcher = AlertDispatcher::new(
            store.clone(),
            Arc::new(source),
            WebhookSink::new(Duration::from_millis(200)).unwrap(),
            "team",
            Some("https://dash.local".to_string()),
        );
        (store, dispatcher)
    }

    #[tokio::test]
    async fn test_payload_field_names() {
        let (_store, dispatcher) = dispatcher(MockWorkloadSource::new()).await;

        let offenders = vec![Offender {
            app_key: "checkout".to_string(),
            cpu_mcpu: 800,
            mem_mib: 32,
            total_cost_units: 0.5,
        }];
        let timestamp = Utc.with_ymd_and_hms(2024, 5, 15, 12, 0, 1).unwrap();
        let json = serde_json::to_value(dispatcher.payload(&verdict(None), offenders, timestamp)).unwrap();

        assert_eq!(json["timestamp"], "2024-05-15T12:00:01Z");
        assert_eq!(json["severity"], "CRITICAL");
        assert_eq!(json["selectorType"], "NAMESPACE");
        assert_eq!(json["period"], "DAILY");
        assert_eq!(json["periodStart"], "2024-05-15T00:00:00Z");
        assert_eq!(json["currentCpuMcpu"], 1200);
        assert_eq!(json["limitCpuMcpu"], 1000);
        assert_eq!(json["cpuPercent"], 120.0);
        assert_eq!(json["dashboardUrl"], "https://dash.local");
        assert_eq!(json["topOffenders"][0]["appKey"], "checkout");
        assert_eq!(json["topOffenders"][0]["totalCostUnits"], 0.5);
    }

    #[tokio::test]
    async fn test_alert_written_without_secret() {
        let mut source = MockWorkloadSource::new();
        source.expect_get_secret().never();
        let (store, dispatcher) = dispatcher(source).await;

        let handle = dispatcher.dispatch(&verdict(None)).await.unwrap();
        assert!(handle.is_none());

        let alerts = store.list_alerts(10).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, AlertSeverity::Critical);
        assert_eq!(alerts[0].budget_name, "payments");
        assert_eq!(alerts[0].details["dashboardUrl"], "https://dash.local");
    }

    #[tokio::test]
    async fn test_missing_key_or_failed_lookup_skips_delivery() {
        let mut source = MockWorkloadSource::new();
        source
            .expect_get_secret()
            .withf(|name| name == "no-key")
            .returning(|_| Ok(Some(BTreeMap::from([("token".to_string(), "x".to_string())]))));
        source
            .expect_get_secret()
            .withf(|name| name == "broken")
            .returning(|_| Err(crate::Error::Kubernetes("forbidden".to_string())));
        let (store, dispatcher) = dispatcher(source).await;

        assert!(dispatcher.dispatch(&verdict(Some("no-key"))).await.unwrap().is_none());
        assert!(dispatcher.dispatch(&verdict(Some("broken"))).await.unwrap().is_none());
        assert_eq!(store.list_alerts(10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_resolved_url_spawns_delivery() {
        let mut source = MockWorkloadSource::new();
        source.expect_get_secret().returning(|_| {
            Ok(Some(BTreeMap::from([(
                WEBHOOK_URL_KEY.to_string(),
                "http://127.0.0.1:9/unreachable".to_string(),
            )])))
        });
        let (_store, dispatcher) = dispatcher(source).await;

        let handle = dispatcher.dispatch(&verdict(Some("hook"))).await.unwrap();
        handle.expect("delivery task").await.unwrap();
    }
}
