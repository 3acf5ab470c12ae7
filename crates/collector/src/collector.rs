use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::aggregate::Aggregator;
use crate::budget::BudgetEvaluator;
use crate::config::Config;
use crate::metrics::{INVENTORY_APPENDED_TOTAL, SNAPSHOTS_INSERTED_TOTAL, WORKLOADS_COLLECTED_TOTAL, WORKLOADS_SKIPPED_TOTAL};
use crate::notify::{AlertDispatcher, WebhookSink};
use crate::source::WorkloadSource;
use crate::store::{AllocationSnapshot, GroupType, Store, WorkloadInventory};
use crate::window::Window;
use crate::workload::WorkloadRecord;
use crate::Result;

/// Outcome of one collection run.
#[derive(Debug)]
pub struct RunSummary {
    pub window: Window,
    pub workloads_collected: usize,
    pub workloads_skipped: usize,
    pub snapshots_inserted: usize,
    pub snapshots_existing: usize,
    pub inventory_rows: usize,
    pub alerts: usize,
    /// Detached webhook deliveries started by this run.
    pub deliveries: Vec<JoinHandle<()>>,
}

impl RunSummary {
    /// Waits for every delivery started by the run. Each one is bounded by
    /// the webhook timeout.
    pub async fn wait_for_deliveries(&mut self) {
        for handle in self.deliveries.drain(..) {
            if let Err(e) = handle.await {
                warn!("Webhook delivery task failed: {}", e);
            }
        }
    }
}

pub struct Collector {
    source: Arc<dyn WorkloadSource>,
    store: Arc<dyn Store>,
    aggregator: Aggregator,
    evaluator: BudgetEvaluator,
    dispatcher: AlertDispatcher,
    window_hours: u32,
}

impl Collector {
    pub fn new(config: &Config, source: Arc<dyn WorkloadSource>, store: Arc<dyn Store>) -> Result<Self> {
        let sink = WebhookSink::new(config.webhook_timeout)?;
        Ok(Self {
            aggregator: Aggregator::new(config.rates, config.labels.clone()),
            evaluator: BudgetEvaluator::new(store.clone()),
            dispatcher: AlertDispatcher::new(
                store.clone(),
                source.clone(),
                sink,
                config.labels.team.clone(),
                config.dashboard_url.clone(),
            ),
            source,
            store,
            window_hours: config.window_hours,
        })
    }

    /// Runs one collection for the window ending at the last full hour
    /// before `now`, then evaluates budgets as of `now`.
    pub async fn run(&self, now: DateTime<Utc>) -> Result<RunSummary> {
        let window = Window::ending_before(now, self.window_hours)?;
        info!("Collecting window {} - {}", window.start, window.end);

        let workloads = self.source.list_workloads().await?;
        let mut records = Vec::with_capacity(workloads.len());
        let mut skipped = 0;
        for workload in &workloads {
            match workload.normalize(&window) {
                Ok(record) => {
                    WORKLOADS_COLLECTED_TOTAL.with_label_values(&[record.kind.as_str()]).inc();
                    records.push(record);
                }
                Err(e) => {
                    warn!(
                        "Skipping {} {}/{}: {}",
                        workload.kind(),
                        workload.namespace().unwrap_or("?"),
                        workload.name().unwrap_or("?"),
                        e
                    );
                    WORKLOADS_SKIPPED_TOTAL.inc();
                    skipped += 1;
                }
            }
        }

        let table = self.aggregator.aggregate(&records, &window);

        let mut inserted = 0;
        for snapshot in table.snapshots() {
            if self.store.upsert_snapshot(snapshot).await? {
                SNAPSHOTS_INSERTED_TOTAL.inc();
                inserted += 1;
            } else {
                debug!("Snapshot {} already stored", snapshot.id);
            }
        }

        let recorded_at = Utc::now();
        for record in &records {
            self.store
                .append_inventory(&self.inventory_row(record, &window, recorded_at)?)
                .await?;
            INVENTORY_APPENDED_TOTAL.inc();
        }

        let verdicts = self.evaluator.evaluate_all(now).await?;
        let mut deliveries = Vec::new();
        for verdict in &verdicts {
            if let Some(handle) = self.dispatcher.dispatch(verdict).await? {
                deliveries.push(handle);
            }
        }

        let summary = RunSummary {
            window,
            workloads_collected: records.len(),
            workloads_skipped: skipped,
            snapshots_inserted: inserted,
            snapshots_existing: table.len() - inserted,
            inventory_rows: records.len(),
            alerts: verdicts.len(),
            deliveries,
        };
        info!(
            "Run complete: {} workloads ({} skipped), {} snapshots written ({} already stored), {} alerts",
            summary.workloads_collected,
            summary.workloads_skipped,
            summary.snapshots_inserted,
            summary.snapshots_existing,
            summary.alerts
        );
        Ok(summary)
    }

    // Inventory rows link to the APP snapshot of the workload's window.
    fn inventory_row(
        &self,
        record: &WorkloadRecord,
        window: &Window,
        recorded_at: DateTime<Utc>,
    ) -> Result<WorkloadInventory> {
        Ok(WorkloadInventory {
            id: None,
            snapshot_id: AllocationSnapshot::snapshot_id(window.start, GroupType::App, self.aggregator.app_key(record)),
            namespace: record.namespace.clone(),
            kind: record.kind,
            name: record.name.clone(),
            labels_json: serde_json::to_string(&record.labels)?,
            cpu_request_mcpu: record.cpu_mcpu,
            mem_request_mib: record.mem_mib,
            compliance_status: record.compliance,
            recorded_at,
        })
    }
}
