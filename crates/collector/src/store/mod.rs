mod config;
mod models;
mod sqlite;
mod postgres;
mod factory;

pub use config::{DatabaseConfig, DatabaseType};
pub use models::*;
pub use sqlite::SqliteStore;
pub use postgres::PostgresStore;
pub use factory::create_store;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Persistence for snapshots, inventory, budgets and alerts.
///
/// Each call is its own unit of work; a run is never wrapped in one
/// transaction.
#[async_trait]
pub trait Store: Send + Sync {
    // Initialize database schema
    async fn init(&self) -> crate::Result<()>;

    // Snapshot operations
    /// Inserts `snapshot` unless its natural key (window start, window end,
    /// group type, group key) is already stored. Returns whether a row was
    /// written; an existing row is never modified.
    async fn upsert_snapshot(&self, snapshot: &AllocationSnapshot) -> crate::Result<bool>;
    async fn find_snapshot(
        &self,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        group_type: GroupType,
        group_key: &str,
    ) -> crate::Result<Option<AllocationSnapshot>>;
    async fn list_snapshots(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> crate::Result<Vec<AllocationSnapshot>>;

    // Inventory operations
    async fn append_inventory(&self, row: &WorkloadInventory) -> crate::Result<()>;
    async fn list_inventory(&self, snapshot_id: &str) -> crate::Result<Vec<WorkloadInventory>>;

    // Usage queries
    /// Sums snapshots of one group whose window lies entirely inside
    /// `[start, end]`.
    async fn query_usage(
        &self,
        group_type: GroupType,
        group_key: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> crate::Result<Usage>;
    /// APP snapshots inside `[start, end]` linked to inventory matching
    /// `scope`, summed per app and ranked by total cost, highest first.
    async fn query_top_offenders(
        &self,
        scope: &OffenderScope,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: i64,
    ) -> crate::Result<Vec<Offender>>;

    // Budget operations
    async fn save_budget(&self, budget: &Budget) -> crate::Result<()>;
    async fn list_enabled_budgets(&self) -> crate::Result<Vec<Budget>>;

    // Alert operations
    async fn append_alert(&self, alert: &Alert) -> crate::Result<()>;
    async fn list_alerts(&self, limit: i64) -> crate::Result<Vec<Alert>>;
}
