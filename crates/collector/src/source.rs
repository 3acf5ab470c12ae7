use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::{Api, ListParams},
    Client, Resource, ResourceExt,
};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::{workload::Workload, Error, Result};

/// Where workload manifests and webhook secrets come from.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WorkloadSource: Send + Sync {
    /// Deployments, StatefulSets, DaemonSets and Jobs in the allowed namespaces.
    async fn list_workloads(&self) -> Result<Vec<Workload>>;

    /// Decoded data of the named secret, `None` if it does not exist.
    async fn get_secret(&self, name: &str) -> Result<Option<BTreeMap<String, String>>>;
}

/// Namespaces whose workloads are collected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceFilter {
    allowed: BTreeSet<String>,
}

impl NamespaceFilter {
    /// An empty allowlist restricts collection to `current_namespace`.
    pub fn new(allowlist: &[String], current_namespace: &str) -> Self {
        let allowed: BTreeSet<String> = allowlist
            .iter()
            .map(|ns| ns.trim())
            .filter(|ns| !ns.is_empty())
            .map(str::to_string)
            .collect();

        if allowed.is_empty() {
            Self {
                allowed: BTreeSet::from([current_namespace.to_string()]),
            }
        } else {
            Self { allowed }
        }
    }

    pub fn allows(&self, namespace: &str) -> bool {
        self.allowed.contains(namespace)
    }

    pub fn namespaces(&self) -> impl Iterator<Item = &str> {
        self.allowed.iter().map(String::as_str)
    }
}

pub struct KubeWorkloadSource {
    client: Client,
    filter: NamespaceFilter,
}

impl KubeWorkloadSource {
    pub fn new(client: Client, allowlist: &[String]) -> Self {
        let filter = NamespaceFilter::new(allowlist, client.default_namespace());
        info!(
            "Collecting workloads from namespaces: {}",
            filter.namespaces().collect::<Vec<_>>().join(",")
        );
        Self { client, filter }
    }

    pub async fn try_default(allowlist: &[String]) -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| Error::Kubernetes(e.to_string()))?;
        Ok(Self::new(client, allowlist))
    }

    async fn list_allowed<K>(&self) -> Result<Vec<K>>
    where
        K: Resource + Clone + DeserializeOwned + Debug,
        <K as Resource>::DynamicType: Default,
    {
        let api: Api<K> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| Error::Kubernetes(e.to_string()))?;

        Ok(list
            .items
            .into_iter()
            .filter(|item| item.namespace().map_or(false, |ns| self.filter.allows(&ns)))
            .collect())
    }
}

#[async_trait]
impl WorkloadSource for KubeWorkloadSource {
    async fn list_workloads(&self) -> Result<Vec<Workload>> {
        let mut workloads = Vec::new();
        workloads.extend(self.list_allowed::<Deployment>().await?.into_iter().map(Workload::Deployment));
        workloads.extend(self.list_allowed::<StatefulSet>().await?.into_iter().map(Workload::StatefulSet));
        workloads.extend(self.list_allowed::<DaemonSet>().await?.into_iter().map(Workload::DaemonSet));
        workloads.extend(self.list_allowed::<Job>().await?.into_iter().map(Workload::Job));

        debug!("Listed {} workloads", workloads.len());
        Ok(workloads)
    }

    async fn get_secret(&self, name: &str) -> Result<Option<BTreeMap<String, String>>> {
        let secrets: Api<Secret> = Api::default_namespaced(self.client.clone());
        let secret = secrets
            .get_opt(name)
            .await
            .map_err(|e| Error::Kubernetes(e.to_string()))?;

        Ok(secret.map(secret_values))
    }
}

// ByteString values arrive already base64-decoded. Non-UTF-8 entries are dropped.
fn secret_values(secret: Secret) -> BTreeMap<String, String> {
    let name = secret.name_any();
    secret
        .data
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(key, value)| match String::from_utf8(value.0) {
            Ok(text) => Some((key, text)),
            Err(_) => {
                warn!("Secret {} key {} is not valid UTF-8", name, key);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::ByteString;

    #[test]
    fn test_empty_allowlist_means_current_namespace() {
        let filter = NamespaceFilter::new(&[], "chargeback");
        assert!(filter.allows("chargeback"));
        assert!(!filter.allows("default"));

        let blank = NamespaceFilter::new(&[" ".to_string(), String::new()], "chargeback");
        assert_eq!(blank, filter);
    }

    #[test]
    fn test_allowlist_entries_are_trimmed() {
        let filter = NamespaceFilter::new(&[" payments ".to_string(), "auth".to_string()], "chargeback");
        assert!(filter.allows("payments"));
        assert!(filter.allows("auth"));
        assert!(!filter.allows("chargeback"));
        assert_eq!(filter.namespaces().collect::<Vec<_>>(), vec!["auth", "payments"]);
    }

    #[test]
    fn test_secret_values_skip_invalid_utf8() {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some("budget-hook".to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([
                ("webhook.url".to_string(), ByteString(b"http://hooks.local/alert".to_vec())),
                ("binary".to_string(), ByteString(vec![0xff, 0xfe])),
            ])),
            ..Default::default()
        };

        let values = secret_values(secret);
        assert_eq!(values.get("webhook.url").map(String::as_str), Some("http://hooks.local/alert"));
        assert!(!values.contains_key("binary"));
    }

    #[tokio::test]
    async fn test_mock_source() {
        let mut source = MockWorkloadSource::new();
        source.expect_get_secret().returning(|_| Ok(None));
        assert!(source.get_secret("missing").await.unwrap().is_none());
    }
}
