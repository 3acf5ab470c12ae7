//! Workload normalization.
//!
//! Every supported kind is reduced to a [`WorkloadRecord`]: the requested CPU
//! and memory multiplied by the number of pod copies the workload runs, plus a
//! compliance classification of its containers' requests and limits.

mod quantity;

pub use quantity::{parse_cpu_millicores, parse_memory_mib};

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::{Job, JobStatus};
use k8s_openapi::api::core::v1::{Container, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

use crate::{window::Window, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
    DaemonSet,
    Job,
}

impl WorkloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "Deployment",
            WorkloadKind::StatefulSet => "StatefulSet",
            WorkloadKind::DaemonSet => "DaemonSet",
            WorkloadKind::Job => "Job",
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComplianceStatus {
    Ok,
    MissingRequests,
    MissingLimits,
    BothMissing,
}

impl ComplianceStatus {
    fn from_flags(missing_requests: bool, missing_limits: bool) -> Self {
        match (missing_requests, missing_limits) {
            (true, true) => ComplianceStatus::BothMissing,
            (true, false) => ComplianceStatus::MissingRequests,
            (false, true) => ComplianceStatus::MissingLimits,
            (false, false) => ComplianceStatus::Ok,
        }
    }
}

impl fmt::Display for ComplianceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComplianceStatus::Ok => write!(f, "OK"),
            ComplianceStatus::MissingRequests => write!(f, "MISSING_REQUESTS"),
            ComplianceStatus::MissingLimits => write!(f, "MISSING_LIMITS"),
            ComplianceStatus::BothMissing => write!(f, "BOTH_MISSING"),
        }
    }
}

impl std::str::FromStr for ComplianceStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "OK" => Ok(ComplianceStatus::Ok),
            "MISSING_REQUESTS" => Ok(ComplianceStatus::MissingRequests),
            "MISSING_LIMITS" => Ok(ComplianceStatus::MissingLimits),
            "BOTH_MISSING" => Ok(ComplianceStatus::BothMissing),
            _ => Err(Error::Internal(format!("Invalid compliance status: {}", s))),
        }
    }
}

/// Resource demand of one workload within one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadRecord {
    pub namespace: String,
    pub kind: WorkloadKind,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub cpu_mcpu: i64,
    pub mem_mib: i64,
    /// Hours the workload was active inside the window. `None` for
    /// long-running kinds, which are charged for the whole window.
    pub active_hours: Option<f64>,
    pub compliance: ComplianceStatus,
}

/// A raw manifest as listed from the cluster.
#[derive(Debug, Clone)]
pub enum Workload {
    Deployment(Deployment),
    StatefulSet(StatefulSet),
    DaemonSet(DaemonSet),
    Job(Job),
}

impl Workload {
    pub fn kind(&self) -> WorkloadKind {
        match self {
            Workload::Deployment(_) => WorkloadKind::Deployment,
            Workload::StatefulSet(_) => WorkloadKind::StatefulSet,
            Workload::DaemonSet(_) => WorkloadKind::DaemonSet,
            Workload::Job(_) => WorkloadKind::Job,
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Workload::Deployment(d) => &d.metadata,
            Workload::StatefulSet(s) => &s.metadata,
            Workload::DaemonSet(ds) => &ds.metadata,
            Workload::Job(j) => &j.metadata,
        }
    }

    pub fn namespace(&self) -> Option<&str> {
        self.metadata().namespace.as_deref()
    }

    pub fn name(&self) -> Option<&str> {
        self.metadata().name.as_deref()
    }

    /// Reduces the manifest to a [`WorkloadRecord`] for `window`.
    pub fn normalize(&self, window: &Window) -> Result<WorkloadRecord> {
        let kind = self.kind();
        let meta = self.metadata();
        let name = meta
            .name
            .clone()
            .ok_or_else(|| Error::Manifest(format!("{} without metadata.name", kind)))?;
        let namespace = meta
            .namespace
            .clone()
            .ok_or_else(|| Error::Manifest(format!("{} {} without metadata.namespace", kind, name)))?;
        let missing = |field: &str| Error::Manifest(format!("{} {}/{} has no {}", kind, namespace, name, field));

        let (demand, active_hours) = match self {
            Workload::Deployment(d) => {
                let spec = d.spec.as_ref().ok_or_else(|| missing("spec"))?;
                let containers = pod_containers(&spec.template).ok_or_else(|| missing("pod template spec"))?;
                (sum_requests(containers, spec.replicas.unwrap_or(1))?, None)
            }
            Workload::StatefulSet(s) => {
                let spec = s.spec.as_ref().ok_or_else(|| missing("spec"))?;
                let containers = pod_containers(&spec.template).ok_or_else(|| missing("pod template spec"))?;
                (sum_requests(containers, spec.replicas.unwrap_or(1))?, None)
            }
            Workload::DaemonSet(ds) => {
                let spec = ds.spec.as_ref().ok_or_else(|| missing("spec"))?;
                let containers = pod_containers(&spec.template).ok_or_else(|| missing("pod template spec"))?;
                // A DaemonSet runs one pod per scheduled node.
                let nodes = ds.status.as_ref().map(|s| s.desired_number_scheduled).unwrap_or(0);
                (sum_requests(containers, nodes)?, None)
            }
            Workload::Job(j) => {
                let spec = j.spec.as_ref().ok_or_else(|| missing("spec"))?;
                let containers = pod_containers(&spec.template).ok_or_else(|| missing("pod template spec"))?;
                let hours = job_active_hours(j.status.as_ref(), window);
                (sum_requests(containers, spec.parallelism.unwrap_or(1))?, Some(hours))
            }
        };

        Ok(WorkloadRecord {
            namespace,
            kind,
            name,
            labels: meta.labels.clone().unwrap_or_default(),
            cpu_mcpu: demand.cpu_mcpu,
            mem_mib: demand.mem_mib,
            active_hours,
            compliance: demand.compliance,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ResourceDemand {
    cpu_mcpu: i64,
    mem_mib: i64,
    compliance: ComplianceStatus,
}

fn pod_containers(template: &PodTemplateSpec) -> Option<&[Container]> {
    template.spec.as_ref().map(|spec| spec.containers.as_slice())
}

fn declares_cpu_and_memory(resources: Option<&BTreeMap<String, Quantity>>) -> bool {
    resources.map_or(false, |r| r.contains_key("cpu") && r.contains_key("memory"))
}

fn out_of_range(what: &str) -> Error {
    Error::Quantity(format!("{} out of range", what))
}

fn sum_requests(containers: &[Container], copies: i32) -> Result<ResourceDemand> {
    let mut cpu_mcpu = 0i64;
    let mut mem_mib = 0i64;
    let mut missing_requests = false;
    let mut missing_limits = false;

    for container in containers {
        let resources = container.resources.as_ref();
        let requests = resources.and_then(|r| r.requests.as_ref());
        let limits = resources.and_then(|r| r.limits.as_ref());

        missing_requests |= !declares_cpu_and_memory(requests);
        missing_limits |= !declares_cpu_and_memory(limits);

        if let Some(requests) = requests {
            if let Some(cpu) = requests.get("cpu") {
                cpu_mcpu = cpu_mcpu
                    .checked_add(parse_cpu_millicores(&cpu.0)?)
                    .ok_or_else(|| out_of_range("cpu requests"))?;
            }
            if let Some(memory) = requests.get("memory") {
                mem_mib = mem_mib
                    .checked_add(parse_memory_mib(&memory.0)?)
                    .ok_or_else(|| out_of_range("memory requests"))?;
            }
        }
    }

    let copies = i64::from(copies);
    Ok(ResourceDemand {
        cpu_mcpu: cpu_mcpu
            .checked_mul(copies)
            .ok_or_else(|| out_of_range("cpu requests times copies"))?,
        mem_mib: mem_mib
            .checked_mul(copies)
            .ok_or_else(|| out_of_range("memory requests times copies"))?,
        compliance: ComplianceStatus::from_flags(missing_requests, missing_limits),
    })
}

/// Overlap of the job's run time with `window`, in hours.
fn job_active_hours(status: Option<&JobStatus>, window: &Window) -> f64 {
    let Some(started) = status.and_then(|s| s.start_time.as_ref()).map(|t| t.0) else {
        return 0.0;
    };
    let completed = status.and_then(|s| s.completion_time.as_ref()).map(|t| t.0);

    let from = started.max(window.start);
    let until = completed.map_or(window.end, |c| c.min(window.end));
    if until <= from {
        return 0.0;
    }
    (until - from).num_seconds() as f64 / 3600.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use k8s_openapi::api::apps::v1::{DaemonSetSpec, DaemonSetStatus, DeploymentSpec, StatefulSetSpec};
    use k8s_openapi::api::batch::v1::JobSpec;
    use k8s_openapi::api::core::v1::{PodSpec, ResourceRequirements};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn window() -> Window {
        Window {
            start: Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 5, 1, 11, 0, 0).unwrap(),
        }
    }

    fn quantities(pairs: &[(&str, &str)]) -> Option<BTreeMap<String, Quantity>> {
        if pairs.is_empty() {
            return None;
        }
        Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
                .collect(),
        )
    }

    fn container(requests: &[(&str, &str)], limits: &[(&str, &str)]) -> Container {
        Container {
            name: "main".to_string(),
            resources: Some(ResourceRequirements {
                requests: quantities(requests),
                limits: quantities(limits),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn compliant(cpu: &str, mem: &str) -> Container {
        container(&[("cpu", cpu), ("memory", mem)], &[("cpu", "1"), ("memory", "1Gi")])
    }

    fn template(containers: Vec<Container>) -> PodTemplateSpec {
        PodTemplateSpec {
            metadata: None,
            spec: Some(PodSpec {
                containers,
                ..Default::default()
            }),
        }
    }

    fn meta(name: &str, labels: &[(&str, &str)]) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("test-ns".to_string()),
            labels: Some(labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
            ..Default::default()
        }
    }

    fn deployment(replicas: Option<i32>, containers: Vec<Container>) -> Workload {
        Workload::Deployment(Deployment {
            metadata: meta("test-dep", &[("team", "team-a")]),
            spec: Some(DeploymentSpec {
                replicas,
                template: template(containers),
                ..Default::default()
            }),
            status: None,
        })
    }

    fn job(parallelism: Option<i32>, started: Option<i64>, completed: Option<i64>) -> Workload {
        // Offsets are minutes relative to the window start.
        let at = |m: i64| Time(window().start + Duration::minutes(m));
        Workload::Job(Job {
            metadata: meta("test-job", &[]),
            spec: Some(JobSpec {
                parallelism,
                template: template(vec![compliant("100m", "128Mi")]),
                ..Default::default()
            }),
            status: Some(JobStatus {
                start_time: started.map(at),
                completion_time: completed.map(at),
                ..Default::default()
            }),
        })
    }

    #[test]
    fn test_deployment_multiplies_by_replicas() {
        let record = deployment(Some(2), vec![compliant("100m", "128Mi")])
            .normalize(&window())
            .unwrap();
        assert_eq!(record.name, "test-dep");
        assert_eq!(record.namespace, "test-ns");
        assert_eq!(record.kind, WorkloadKind::Deployment);
        assert_eq!(record.cpu_mcpu, 200);
        assert_eq!(record.mem_mib, 256);
        assert_eq!(record.active_hours, None);
        assert_eq!(record.compliance, ComplianceStatus::Ok);
        assert_eq!(record.labels.get("team").map(String::as_str), Some("team-a"));
    }

    #[test]
    fn test_deployment_sums_containers_and_defaults_to_one_replica() {
        let record = deployment(None, vec![compliant("250m", "64Mi"), compliant("0.5", "1Gi")])
            .normalize(&window())
            .unwrap();
        assert_eq!(record.cpu_mcpu, 750);
        assert_eq!(record.mem_mib, 1088);
    }

    #[test]
    fn test_statefulset() {
        let workload = Workload::StatefulSet(StatefulSet {
            metadata: meta("test-sts", &[]),
            spec: Some(StatefulSetSpec {
                replicas: Some(3),
                template: template(vec![compliant("100m", "128Mi")]),
                ..Default::default()
            }),
            status: None,
        });
        let record = workload.normalize(&window()).unwrap();
        assert_eq!(record.kind, WorkloadKind::StatefulSet);
        assert_eq!(record.cpu_mcpu, 300);
        assert_eq!(record.mem_mib, 384);
    }

    #[test]
    fn test_daemonset_uses_desired_scheduled() {
        let daemonset = |status: Option<DaemonSetStatus>| {
            Workload::DaemonSet(DaemonSet {
                metadata: meta("test-ds", &[]),
                spec: Some(DaemonSetSpec {
                    template: template(vec![compliant("50m", "64Mi")]),
                    ..Default::default()
                }),
                status,
            })
        };

        let scheduled = daemonset(Some(DaemonSetStatus {
            desired_number_scheduled: 5,
            ..Default::default()
        }))
        .normalize(&window())
        .unwrap();
        assert_eq!(scheduled.cpu_mcpu, 250);
        assert_eq!(scheduled.mem_mib, 320);

        let unscheduled = daemonset(None).normalize(&window()).unwrap();
        assert_eq!(unscheduled.cpu_mcpu, 0);
        assert_eq!(unscheduled.mem_mib, 0);
    }

    #[test]
    fn test_job_running_inside_window() {
        let record = job(Some(2), Some(30), None).normalize(&window()).unwrap();
        assert_eq!(record.kind, WorkloadKind::Job);
        assert_eq!(record.cpu_mcpu, 200);
        assert_eq!(record.mem_mib, 256);
        assert_eq!(record.active_hours, Some(0.5));
    }

    #[test]
    fn test_job_durations() {
        let hours = |started, completed| job(None, started, completed).normalize(&window()).unwrap().active_hours;
        // Started before the window and still running.
        assert_eq!(hours(Some(-90), None), Some(1.0));
        // Completed before the window started.
        assert_eq!(hours(Some(-90), Some(-10)), Some(0.0));
        // Never started.
        assert_eq!(hours(None, None), Some(0.0));
        // Started and completed inside the window.
        assert_eq!(hours(Some(15), Some(30)), Some(0.25));
        // Completed after the window ended.
        assert_eq!(hours(Some(45), Some(200)), Some(0.25));
    }

    #[test]
    fn test_compliance_classification() {
        let status = |containers| deployment(Some(1), containers).normalize(&window()).unwrap().compliance;

        assert_eq!(
            status(vec![container(&[], &[("cpu", "200m"), ("memory", "256Mi")])]),
            ComplianceStatus::MissingRequests
        );
        assert_eq!(
            status(vec![container(&[("cpu", "200m"), ("memory", "256Mi")], &[])]),
            ComplianceStatus::MissingLimits
        );
        assert_eq!(status(vec![container(&[], &[])]), ComplianceStatus::BothMissing);
        // A single incomplete container flags the whole workload.
        assert_eq!(
            status(vec![compliant("100m", "64Mi"), container(&[("cpu", "100m")], &[("cpu", "1"), ("memory", "1Gi")])]),
            ComplianceStatus::MissingRequests
        );
    }

    #[test]
    fn test_missing_requests_contribute_zero() {
        let record = deployment(Some(2), vec![container(&[], &[("cpu", "200m"), ("memory", "256Mi")])])
            .normalize(&window())
            .unwrap();
        assert_eq!(record.cpu_mcpu, 0);
        assert_eq!(record.mem_mib, 0);
    }

    #[test]
    fn test_extraction_errors() {
        let no_spec = Workload::Deployment(Deployment {
            metadata: meta("broken", &[]),
            spec: None,
            status: None,
        });
        assert!(matches!(no_spec.normalize(&window()), Err(Error::Manifest(_))));

        let bad_quantity = deployment(Some(1), vec![compliant("lots", "64Mi")]);
        assert!(matches!(bad_quantity.normalize(&window()), Err(Error::Quantity(_))));
    }

    #[test]
    fn test_overflowing_demand_is_an_error() {
        let doubled = deployment(Some(2), vec![compliant("5e15", "64Mi")]);
        assert!(matches!(doubled.normalize(&window()), Err(Error::Quantity(_))));

        let summed = deployment(Some(1), vec![compliant("5e15", "64Mi"), compliant("5e15", "64Mi")]);
        assert!(matches!(summed.normalize(&window()), Err(Error::Quantity(_))));

        let single = deployment(Some(1), vec![compliant("5e15", "64Mi")]);
        assert_eq!(single.normalize(&window()).unwrap().cpu_mcpu, 5_000_000_000_000_000_000);
    }
}
