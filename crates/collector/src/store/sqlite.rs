use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, error, info, warn};

use crate::{
    store::{
        Alert, AllocationSnapshot, Budget, GroupType, Offender, OffenderScope, Store, Usage,
        WorkloadInventory,
    },
    Error, Result,
};

const IN_MEMORY: &str = ":memory:";

pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    pub async fn new(path: &str, max_connections: u32) -> Result<Self> {
        info!("Connecting to SQLite database: {}", path);

        // Every connection to `:memory:` opens a separate database, so the
        // pool is pinned to a single connection that is never recycled.
        let (options, max_connections) = if path == IN_MEMORY {
            (SqliteConnectOptions::from_str("sqlite::memory:")?, 1)
        } else {
            if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            (
                SqliteConnectOptions::new().filename(path).create_if_missing(true),
                max_connections,
            )
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| {
                error!("Failed to connect to SQLite: {}", e);
                Error::Sqlx(e)
            })?;

        Ok(Self { pool })
    }
}

/// JSON path selecting one top-level key, quoted so that label keys such as
/// `app.kubernetes.io/name` are taken literally.
fn label_path(key: &str) -> String {
    format!("$.\"{}\"", key.replace('"', "\\\""))
}

/// Timestamps are stored as RFC 3339 text in UTC with a `Z` suffix and whole
/// seconds, so that string comparison in SQL orders them chronologically.
fn timestamp_text(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn timestamp_from_row(r: &SqliteRow, column: &str) -> Result<DateTime<Utc>> {
    let text: String = r.get(column);
    DateTime::parse_from_rfc3339(&text)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("Invalid timestamp in {}: '{}': {}", column, text, e)))
}

fn snapshot_from_row(r: &SqliteRow) -> Result<AllocationSnapshot> {
    Ok(AllocationSnapshot {
        id: r.get("id"),
        window_start: timestamp_from_row(r, "window_start")?,
        window_end: timestamp_from_row(r, "window_end")?,
        group_type: r.get::<String, _>("group_type").parse()?,
        group_key: r.get("group_key"),
        cpu_mcpu: r.get("cpu_mcpu"),
        mem_mib: r.get("mem_mib"),
        cpu_cost_units: r.get("cpu_cost_units"),
        mem_cost_units: r.get("mem_cost_units"),
        total_cost_units: r.get("total_cost_units"),
    })
}

fn inventory_from_row(r: &SqliteRow) -> Result<WorkloadInventory> {
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
        recorded_at: timestamp_from_row(r, "recorded_at")?,
    })
}

fn budget_from_row(r: &SqliteRow) -> Result<Budget> {
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
        created_at: timestamp_from_row(r, "created_at")?,
        updated_at: timestamp_from_row(r, "updated_at")?,
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn init(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations/sqlite")
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
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(window_start, window_end, group_type, group_key) DO NOTHING
            "#,
        )
        .bind(&snapshot.id)
        .bind(timestamp_text(snapshot.window_start))
        .bind(timestamp_text(snapshot.window_end))
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

        let row = sqlx::query(
            r#"
            SELECT id, window_start, window_end, group_type, group_key,
                   cpu_mcpu, mem_mib, cpu_cost_units, mem_cost_units, total_cost_units
            FROM allocation_snapshots
            WHERE window_start = ?1 AND window_end = ?2 AND group_type = ?3 AND group_key = ?4
            "#,
        )
        .bind(timestamp_text(window_start))
        .bind(timestamp_text(window_end))
        .bind(group_type.to_string())
        .bind(group_key)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(snapshot_from_row).transpose()
    }

    async fn list_snapshots(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<AllocationSnapshot>> {
        debug!("Listing snapshots between {} and {}", start, end);

        let rows = sqlx::query(
            r#"
            SELECT id, window_start, window_end, group_type, group_key,
                   cpu_mcpu, mem_mib, cpu_cost_units, mem_cost_units, total_cost_units
            FROM allocation_snapshots
            WHERE window_start >= ?1 AND window_end <= ?2
            ORDER BY group_type, group_key, window_start
            "#,
        )
        .bind(timestamp_text(start))
        .bind(timestamp_text(end))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(snapshot_from_row).collect()
    }

    async fn append_inventory(&self, row: &WorkloadInventory) -> Result<()> {
        debug!("Appending inventory: {}/{}/{}", row.namespace, row.kind, row.name);

        sqlx::query(
            r#"
            INSERT INTO workload_inventory (
                snapshot_id, namespace, kind, name, labels_json,
                cpu_request_mcpu, mem_request_mib, compliance_status, recorded_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
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
        .bind(timestamp_text(row.recorded_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_inventory(&self, snapshot_id: &str) -> Result<Vec<WorkloadInventory>> {
        debug!("Listing inventory for snapshot: {}", snapshot_id);

        let rows = sqlx::query(
            r#"
            SELECT id, snapshot_id, namespace, kind, name, labels_json,
                   cpu_request_mcpu, mem_request_mib, compliance_status, recorded_at
            FROM workload_inventory
            WHERE snapshot_id = ?1
            ORDER BY id
            "#,
        )
        .bind(snapshot_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(inventory_from_row).collect()
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
            SELECT COALESCE(SUM(cpu_mcpu), 0) AS cpu,
                   COALESCE(SUM(mem_mib), 0) AS mem,
                   COALESCE(SUM(total_cost_units), 0.0) AS cost
            FROM allocation_snapshots
            WHERE group_type = ?1 AND group_key = ?2
              AND window_start >= ?3 AND window_end <= ?4
            "#,
        )
        .bind(group_type.to_string())
        .bind(group_key)
        .bind(timestamp_text(start))
        .bind(timestamp_text(end))
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
            OffenderScope::Team { .. } => ("json_extract(labels_json, ?3) = ?4", "?5"),
            OffenderScope::Namespace(_) => ("namespace = ?3", "?4"),
        };
        let sql = format!(
            r#"
            SELECT s.group_key AS app_key,
                   COALESCE(SUM(s.cpu_mcpu), 0) AS cpu,
                   COALESCE(SUM(s.mem_mib), 0) AS mem,
                   COALESCE(SUM(s.total_cost_units), 0.0) AS total_cost
            FROM allocation_snapshots s
            WHERE s.group_type = 'APP'
              AND s.window_start >= ?1 AND s.window_end <= ?2
              AND s.id IN (SELECT snapshot_id FROM workload_inventory WHERE {})
            GROUP BY s.group_key
            ORDER BY total_cost DESC, s.group_key ASC
            LIMIT {}
            "#,
            inventory_filter, limit_param
        );

        let query = sqlx::query(&sql).bind(timestamp_text(start)).bind(timestamp_text(end));
        let query = match scope {
            OffenderScope::Team { label_key, value } => query.bind(label_path(label_key)).bind(value.clone()),
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
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                selector_type = excluded.selector_type,
                selector_key = excluded.selector_key,
                selector_value = excluded.selector_value,
                period = excluded.period,
                cpu_mcpu_limit = excluded.cpu_mcpu_limit,
                mem_mib_limit = excluded.mem_mib_limit,
                warn_percent = excluded.warn_percent,
                enabled = excluded.enabled,
                webhook_secret_name = excluded.webhook_secret_name,
                updated_at = excluded.updated_at
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
        .bind(timestamp_text(budget.created_at))
        .bind(timestamp_text(budget.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_enabled_budgets(&self) -> Result<Vec<Budget>> {
        debug!("Listing enabled budgets");

        let rows = sqlx::query(
            r#"
            SELECT id, name, selector_type, selector_key, selector_value, period,
                   cpu_mcpu_limit, mem_mib_limit, warn_percent, enabled,
                   webhook_secret_name, created_at, updated_at
            FROM budgets
            WHERE enabled = 1
            ORDER BY name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

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
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&alert.id)
        .bind(timestamp_text(alert.timestamp))
        .bind(alert.severity.to_string())
        .bind(&alert.budget_name)
        .bind(&alert.message)
        .bind(details_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_alerts(&self, limit: i64) -> Result<Vec<Alert>> {
        debug!("Listing alerts: limit={}", limit);

        let rows = sqlx::query(
            r#"
            SELECT id, timestamp, severity, budget_name, message, details_json
            FROM alerts
            ORDER BY timestamp DESC
            LIMIT ?1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| -> Result<Alert> {
                Ok(Alert {
                    id: r.get("id"),
                    timestamp: timestamp_from_row(r, "timestamp")?,
                    severity: r.get::<String, _>("severity").parse()?,
                    budget_name: r.get("budget_name"),
                    message: r.get("message"),
                    details: serde_json::from_str(r.get("details_json"))?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_label_path_quotes_key() {
        assert_eq!(label_path("team"), "$.\"team\"");
        assert_eq!(label_path("app.kubernetes.io/name"), "$.\"app.kubernetes.io/name\"");
    }

    fn snapshot(start: DateTime<Utc>, key: &str) -> AllocationSnapshot {
        AllocationSnapshot {
            id: AllocationSnapshot::snapshot_id(start, GroupType::App, key),
            window_start: start,
            window_end: start + chrono::Duration::hours(1),
            group_type: GroupType::App,
            group_key: key.to_string(),
            cpu_mcpu: 1000,
            mem_mib: 1024,
            cpu_cost_units: 1.0,
            mem_cost_units: 0.5,
            total_cost_units: 1.5,
        }
    }

    #[tokio::test]
    async fn test_timestamps_stored_as_utc_text() {
        let store = SqliteStore::new(IN_MEMORY, 1).await.unwrap();
        store.init().await.unwrap();
        let start = Utc.with_ymd_and_hms(2024, 5, 15, 10, 0, 0).unwrap();
        let with_millis = start + chrono::Duration::milliseconds(500);
        store.upsert_snapshot(&snapshot(with_millis, "payments")).await.unwrap();

        let row = sqlx::query("SELECT window_start, window_end FROM allocation_snapshots")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        let window_start: String = row.get("window_start");
        let window_end: String = row.get("window_end");
        assert_eq!(window_start, "2024-05-15T10:00:00Z");
        assert_eq!(window_end, "2024-05-15T11:00:00Z");

        // Text comparison must agree with time order
        let earlier: i64 = sqlx::query("SELECT COUNT(*) AS n FROM allocation_snapshots WHERE window_start < ?1")
            .bind(timestamp_text(start))
            .fetch_one(&store.pool)
            .await
            .unwrap()
            .get("n");
        assert_eq!(earlier, 0);

        let listed = store.list_snapshots(start, start + chrono::Duration::hours(1)).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].window_start, start);
    }

    #[tokio::test]
    async fn test_offenders_scoped_by_namespace_and_team() {
        let store = SqliteStore::new(IN_MEMORY, 1).await.unwrap();
        store.init().await.unwrap();
        let start = Utc.with_ymd_and_hms(2024, 5, 15, 10, 0, 0).unwrap();
        let payments = snapshot(start, "payments");
        store.upsert_snapshot(&payments).await.unwrap();
        store
            .append_inventory(&WorkloadInventory {
                id: None,
                snapshot_id: payments.id.clone(),
                namespace: "shop".to_string(),
                kind: crate::workload::WorkloadKind::Deployment,
                name: "pay".to_string(),
                labels_json: r#"{"team":"team-a"}"#.to_string(),
                cpu_request_mcpu: 1000,
                mem_request_mib: 1024,
                compliance_status: crate::workload::ComplianceStatus::Ok,
                recorded_at: start,
            })
            .await
            .unwrap();
        let end = start + chrono::Duration::hours(2);

        let by_namespace = store
            .query_top_offenders(&OffenderScope::Namespace("shop".to_string()), start, end, 5)
            .await
            .unwrap();
        assert_eq!(by_namespace.len(), 1);
        assert_eq!(by_namespace[0].app_key, "payments");

        let by_team = OffenderScope::Team { label_key: "team".to_string(), value: "team-a".to_string() };
        assert_eq!(store.query_top_offenders(&by_team, start, end, 5).await.unwrap().len(), 1);
        assert!(store
            .query_top_offenders(&by_team, start, end, 0)
            .await
            .unwrap()
            .is_empty());
        let other = OffenderScope::Namespace("other".to_string());
        assert!(store.query_top_offenders(&other, start, end, 5).await.unwrap().is_empty());
    }
}
