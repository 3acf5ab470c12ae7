use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Pool, Postgres, Row};
use tracing::{debug, error, info, warn};

use crate::{
    store::{
        Alert, AllocationSnapshot, Budget, GroupType, Offender, OffenderScope, Store, Usage,
        WorkloadInventory,
    },
    Error, Result,
};

pub struct PostgresStore {
    pool: Pool<Postgres>,
}

impl PostgresStore {
    pub async fn new(connection_string: &str, max_connections: u32) -> Result<Self> {
        info!("Connecting to PostgreSQL database");

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(connection_string)
            .await
            .map_err(|e| {
                error!("Failed to connect to PostgreSQL: {}", e);
                Error::Sqlx(e)
            })?;

        Ok(Self { pool })
    }
}

const SNAPSHOT_COLUMNS: &str = "id, window_start, window_end, group_type, group_key, \
     cpu_mcpu, mem_mib, cpu_cost_units, mem_cost_units, total_cost_units";

const BUDGET_COLUMNS: &str = "id, name, selector_type, selector_key, selector_value, period, \
     cpu_mcpu_limit, mem_mib_limit, warn_percent, enabled, webhook_secret_name, created_at, updated_at";

fn snapshot_from_row(r: &PgRow) -> Result<AllocationSnapshot> {
    Ok(AllocationSnapshot {
        id: r.get("id"),
        window_start: r.get("window_start"),
        window_end: r.get("window_end"),
        group_type: r.get::<String, _>("group_type").parse()?,
        group_key: r.get("group_key"),
        cpu_mcpu: r.get("cpu_mcpu"),
        mem_mib: r.get("mem_mib"),
        cpu_cost_units: r.get("cpu_cost_units"),
        mem_cost_units: r.get("mem_cost_units"),
        total_cost_units: r.get("total_cost_units"),
    })
}

fn budget_from_row(r: &PgRow) -> Result<Budget> {
    Ok(Budget {
        id: r.get("id"),
        name: r.get("name"),
        selector_type: r.get::<String, _>("selector_type").parse()?,
        selector_key: r.get("selector_key"),
        selector_value: r.get("selector_value"),
        period: r.get::<String, _>("period").parse()?,
        cpu_mcpu_limit: r.get("cpu_mcpu_limit"),
        mem_mib_limit: r.get("mem_mib_limit"),
        warn_percent: r.get("warn_percent"),
        enabled: r.get("enabled"),
        webhook_secret_name: r.get("webhook_secret_name"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    })
}

#[async_trait]
impl Store for PostgresStore {
    async fn init(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations/postgres")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                Error::Migrate(e)
            })?;

        Ok(())
    }

    async fn upsert_snapshot(&self, snapshot: &AllocationSnapshot) -> Result<bool> {
        debug!("Saving snapshot: {}", snapshot.id);

        let result = sqlx::query(
            r#"
            INSERT INTO allocation_snapshots (
                id, window_start, window_end, group_type, group_key,
                cpu_mcpu, mem_mib, cpu_cost_units, mem_cost_units, total_cost_units
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (window_start, window_end, group_type, group_key) DO NOTHING
            "#,
        )
        .bind(&snapshot.id)
        .bind(snapshot.window_start)
        .bind(snapshot.window_end)
        .bind(snapshot.group_type.to_string())
        .bind(&snapshot.group_key)
        .bind(snapshot.cpu_mcpu)
        .bind(snapshot.mem_mib)
        .bind(snapshot.cpu_cost_units)
        .bind(snapshot.mem_cost_units)
        .bind(snapshot.total_cost_units)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_snapshot(
        &self,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        group_type: GroupType,
        group_key: &str,
    ) -> Result<Option<AllocationSnapshot>> {
        debug!("Getting snapshot: {} {} {}", window_start, group_type, group_key);

        let sql = format!(
            "SELECT {} FROM allocation_snapshots \
             WHERE window_start = $1 AND window_end = $2 AND group_type = $3 AND group_key = $4",
            SNAPSHOT_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(window_start)
            .bind(window_end)
            .bind(group_type.to_string())
            .bind(group_key)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(snapshot_from_row).transpose()
    }

    async fn list_snapshots(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<AllocationSnapshot>> {
        let sql = format!(
            "SELECT {} FROM allocation_snapshots \
             WHERE window_start >= $1 AND window_end <= $2 \
             ORDER BY group_type, group_key, window_start",
            SNAPSHOT_COLUMNS
        );
        let rows = sqlx::query(&sql).bind(start).bind(end).fetch_all(&self.pool).await?;

        rows.iter().map(snapshot_from_row).collect()
    }

    async fn append_inventory(&self, row: &WorkloadInventory) -> Result<()> {
        debug!("Appending inventory: {}/{}/{}", row.namespace, row.kind, row.name);

        sqlx::query(
            r#"
            INSERT INTO workload_inventory (
                snapshot_id, namespace, kind, name, labels_json,
                cpu_request_mcpu, mem_request_mib, compliance_status, recorded_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&row.snapshot_id)
        .bind(&row.namespace)
        .bind(row.kind.to_string())
        .bind(&row.name)
        .bind(&row.labels_json)
        .bind(row.cpu_request_mcpu)
        .bind(row.mem_request_mib)
        .bind(row.compliance_status.to_string())
        .bind(row.recorded_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_inventory(&self, snapshot_id: &str) -> Result<Vec<WorkloadInventory>> {
        let rows = sqlx::query(
            r#"
            SELECT id, snapshot_id, namespace, kind, name, labels_json,
                   cpu_request_mcpu, mem_request_mib, compliance_status, recorded_at
            FROM workload_inventory
            WHERE snapshot_id = $1
            ORDER BY id
            "#,
        )
        .bind(snapshot_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| -> Result<WorkloadInventory> {
                Ok(WorkloadInventory {
                    id: Some(r.get("id")),
                    snapshot_id: r.get("snapshot_id"),
                    namespace: r.get("namespace"),
                    kind: r.get::<String, _>("kind").parse()?,
                    name: r.get("name"),
                    labels_json: r.get("labels_json"),
                    cpu_request_mcpu: r.get("cpu_request_mcpu"),
                    mem_request_mib: r.get("mem_request_mib"),
                    compliance_status: r.get::<String, _>("compliance_status").parse()?,
                    recorded_at: r.get("recorded_at"),
                })
            })
            .collect()
    }

    async fn query_usage(
        &self,
        group_type: GroupType,
        group_key: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Usage> {
        debug!("Querying usage: {} {} [{}, {}]", group_type, group_key, start, end);

        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(cpu_mcpu), 0)::BIGINT AS cpu,
                   COALESCE(SUM(mem_mib), 0)::BIGINT AS mem,
                   COALESCE(SUM(total_cost_units), 0)::DOUBLE PRECISION AS cost
            FROM allocation_snapshots
            WHERE group_type = $1 AND group_key = $2
              AND window_start >= $3 AND window_end <= $4
            "#,
        )
        .bind(group_type.to_string())
        .bind(group_key)
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await?;

        Ok(Usage {
            cpu_mcpu: row.get("cpu"),
            mem_mib: row.get("mem"),
            total_cost_units: row.get("cost"),
        })
    }

    async fn query_top_offenders(
        &self,
        scope: &OffenderScope,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Offender>> {
        debug!("Querying top offenders: {:?} [{}, {}] limit={}", scope, start, end, limit);

        let (inventory_filter, limit_param) = match scope {
            OffenderScope::Team { .. } => ("(labels_json::jsonb ->> $3) = $4", "$5"),
            OffenderScope::Namespace(_) => ("namespace = $3", "$4"),
        };
        let sql = format!(
            r#"
            SELECT s.group_key AS app_key,
                   COALESCE(SUM(s.cpu_mcpu), 0)::BIGINT AS cpu,
                   COALESCE(SUM(s.mem_mib), 0)::BIGINT AS mem,
                   COALESCE(SUM(s.total_cost_units), 0)::DOUBLE PRECISION AS total_cost
            FROM allocation_snapshots s
            WHERE s.group_type = 'APP'
              AND s.window_start >= $1 AND s.window_end <= $2
              AND s.id IN (SELECT snapshot_id FROM workload_inventory WHERE {})
            GROUP BY s.group_key
            ORDER BY total_cost DESC, s.group_key ASC
            LIMIT {}
            "#,
            inventory_filter, limit_param
        );

        let query = sqlx::query(&sql).bind(start).bind(end);
        let query = match scope {
            OffenderScope::Team { label_key, value } => query.bind(label_key.clone()).bind(value.clone()),
            OffenderScope::Namespace(namespace) => query.bind(namespace.clone()),
        };
        let rows = query.bind(limit).fetch_all(&self.pool).await?;

        Ok(rows
            .iter()
            .map(|r| Offender {
                app_key: r.get("app_key"),
                cpu_mcpu: r.get("cpu"),
                mem_mib: r.get("mem"),
                total_cost_units: r.get("total_cost"),
            })
            .collect())
    }

    async fn save_budget(&self, budget: &Budget) -> Result<()> {
        debug!("Saving budget: {}", budget.id);

        sqlx::query(
            r#"
            INSERT INTO budgets (
                id, name, selector_type, selector_key, selector_value, period,
                cpu_mcpu_limit, mem_mib_limit, warn_percent, enabled,
                webhook_secret_name, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                selector_type = EXCLUDED.selector_type,
                selector_key = EXCLUDED.selector_key,
                selector_value = EXCLUDED.selector_value,
                period = EXCLUDED.period,
                cpu_mcpu_limit = EXCLUDED.cpu_mcpu_limit,
                mem_mib_limit = EXCLUDED.mem_mib_limit,
                warn_percent = EXCLUDED.warn_percent,
                enabled = EXCLUDED.enabled,
                webhook_secret_name = EXCLUDED.webhook_secret_name,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&budget.id)
        .bind(&budget.name)
        .bind(budget.selector_type.to_string())
        .bind(&budget.selector_key)
        .bind(&budget.selector_value)
        .bind(budget.period.to_string())
        .bind(budget.cpu_mcpu_limit)
        .bind(budget.mem_mib_limit)
        .bind(budget.warn_percent)
        .bind(budget.enabled)
        .bind(&budget.webhook_secret_name)
        .bind(budget.created_at)
        .bind(budget.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_enabled_budgets(&self) -> Result<Vec<Budget>> {
        let sql = format!(
            "SELECT {} FROM budgets WHERE enabled = TRUE ORDER BY name",
            BUDGET_COLUMNS
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

        let mut budgets = Vec::with_capacity(rows.len());
        for row in &rows {
            match budget_from_row(row) {
                Ok(budget) => budgets.push(budget),
                Err(e) => warn!("Skipping budget {}: {}", row.get::<String, _>("id"), e),
            }
        }
        Ok(budgets)
    }

    async fn append_alert(&self, alert: &Alert) -> Result<()> {
        debug!("Saving alert: {}", alert.id);

        let details_json = serde_json::to_string(&alert.details)?;

        sqlx::query(
            r#"
            INSERT INTO alerts (id, timestamp, severity, budget_name, message, details_json)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&alert.id)
        .bind(alert.timestamp)
        .bind(alert.severity.to_string())
        .bind(&alert.budget_name)
        .bind(&alert.message)
        .bind(details_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_alerts(&self, limit: i64) -> Result<Vec<Alert>> {
        let rows = sqlx::query(
            r#"
            SELECT id, timestamp, severity, budget_name, message, details_json
            FROM alerts
            ORDER BY timestamp DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| -> Result<Alert> {
                Ok(Alert {
                    id: r.get("id"),
                    timestamp: r.get("timestamp"),
                    severity: r.get::<String, _>("severity").parse()?,
                    budget_name: r.get("budget_name"),
                    message: r.get("message"),
                    details: serde_json::from_str(r.get("details_json"))?,
                })
            })
            .collect()
    }
}
