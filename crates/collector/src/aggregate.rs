//! Cost aggregation.
//!
//! One run's [`WorkloadRecord`]s are folded into an [`AllocationTable`]: one
//! [`AllocationSnapshot`] per distinct (group type, group key), for the TEAM,
//! NAMESPACE and APP dimensions independently. Nothing here touches storage.

use std::collections::HashMap;

use crate::store::{AllocationSnapshot, GroupType};
use crate::window::Window;
use crate::workload::WorkloadRecord;

/// Group key used when a workload lacks the team or app label.
pub const UNKNOWN_GROUP: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostRates {
    pub cpu_per_mcpu_hour: f64,
    pub mem_per_mib_hour: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupLabels {
    pub team: String,
    pub app: String,
}

impl Default for GroupLabels {
    fn default() -> Self {
        Self {
            team: "team".to_string(),
            app: "app".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Cost {
    pub cpu: f64,
    pub mem: f64,
    pub total: f64,
}

/// Snapshots of one window, indexed by group.
#[derive(Debug, Clone)]
pub struct AllocationTable {
    window: Window,
    snapshots: Vec<AllocationSnapshot>,
    index: HashMap<(GroupType, String), usize>,
}

impl AllocationTable {
    fn empty(window: Window) -> Self {
        Self {
            window,
            snapshots: Vec::new(),
            index: HashMap::new(),
        }
    }

    fn add(mut self, group_type: GroupType, group_key: &str, record: &WorkloadRecord, cost: Cost) -> Self {
        let key = (group_type, group_key.to_string());
        let slot = match self.index.get(&key) {
            Some(&slot) => slot,
            None => {
                self.snapshots.push(AllocationSnapshot {
                    id: AllocationSnapshot::snapshot_id(self.window.start, group_type, group_key),
                    window_start: self.window.start,
                    window_end: self.window.end,
                    group_type,
                    group_key: group_key.to_string(),
                    cpu_mcpu: 0,
                    mem_mib: 0,
                    cpu_cost_units: 0.0,
                    mem_cost_units: 0.0,
                    total_cost_units: 0.0,
                });
                let slot = self.snapshots.len() - 1;
                self.index.insert(key, slot);
                slot
            }
        };

        let snapshot = &mut self.snapshots[slot];
        // Group sums clamp at i64::MAX rather than wrap.
        snapshot.cpu_mcpu = snapshot.cpu_mcpu.saturating_add(record.cpu_mcpu);
        snapshot.mem_mib = snapshot.mem_mib.saturating_add(record.mem_mib);
        snapshot.cpu_cost_units += cost.cpu;
        snapshot.mem_cost_units += cost.mem;
        snapshot.total_cost_units += cost.total;
        self
    }

    pub fn window(&self) -> &Window {
        &self.window
    }

    pub fn get(&self, group_type: GroupType, group_key: &str) -> Option<&AllocationSnapshot> {
        self.index
            .get(&(group_type, group_key.to_string()))
            .map(|&slot| &self.snapshots[slot])
    }

    pub fn snapshots(&self) -> &[AllocationSnapshot] {
        &self.snapshots
    }

    pub fn of_type(&self, group_type: GroupType) -> impl Iterator<Item = &AllocationSnapshot> {
        self.snapshots.iter().filter(move |s| s.group_type == group_type)
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Aggregator {
    rates: CostRates,
    labels: GroupLabels,
}

impl Aggregator {
    pub fn new(rates: CostRates, labels: GroupLabels) -> Self {
        Self { rates, labels }
    }

    pub fn team_key<'a>(&self, record: &'a WorkloadRecord) -> &'a str {
        record.labels.get(&self.labels.team).map_or(UNKNOWN_GROUP, String::as_str)
    }

    pub fn app_key<'a>(&self, record: &'a WorkloadRecord) -> &'a str {
        record.labels.get(&self.labels.app).map_or(UNKNOWN_GROUP, String::as_str)
    }

    /// Cost of `record` over `window`. Jobs are charged for their active
    /// hours only, everything else for the full window.
    pub fn cost(&self, record: &WorkloadRecord, window: &Window) -> Cost {
        let hours = record.active_hours.unwrap_or_else(|| window.hours());
        let cpu = record.cpu_mcpu as f64 * self.rates.cpu_per_mcpu_hour * hours;
        let mem = record.mem_mib as f64 * self.rates.mem_per_mib_hour * hours;
        Cost { cpu, mem, total: cpu + mem }
    }

    pub fn aggregate<'a, I>(&self, records: I, window: &Window) -> AllocationTable
    where
        I: IntoIterator<Item = &'a WorkloadRecord>,
    {
        records
            .into_iter()
            .fold(AllocationTable::empty(*window), |table, record| {
                let cost = self.cost(record, window);
                table
                    .add(GroupType::Team, self.team_key(record), record, cost)
                    .add(GroupType::Namespace, &record.namespace, record, cost)
                    .add(GroupType::App, self.app_key(record), record, cost)
            })
    }
}
