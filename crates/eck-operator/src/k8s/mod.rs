//! Kubernetes access used by the reconcilers
//!
//! Reconcilers talk to the API server through [`K8sClient`] so that the same
//! code runs against the real cluster ([`KubeClient`]) and against an
//! in-memory store in tests.

mod client;
#[cfg(test)]
pub mod fake;

pub use client::KubeClient;

use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::runtime::events::EventType;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Debug;

/// Namespaced object the operator reads or writes
pub trait ObjectKind:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> ObjectKind for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// PodDisruptionBudget API version served by the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PdbApiVersion {
    V1,
    V1Beta1,
}

/// Event published on a reconciled object
#[derive(Debug, Clone)]
pub struct EventRecord {
    pub type_: EventType,
    pub reason: String,
    pub note: String,
    pub action: String,
}

impl EventRecord {
    pub fn warning(reason: &str, note: impl Into<String>) -> Self {
        Self {
            type_: EventType::Warning,
            reason: reason.to_string(),
            note: note.into(),
            action: "Reconcile".to_string(),
        }
    }

    pub fn normal(reason: &str, note: impl Into<String>) -> Self {
        Self {
            type_: EventType::Normal,
            reason: reason.to_string(),
            note: note.into(),
            action: "Reconcile".to_string(),
        }
    }
}

/// Operations the reconcilers need from the API server
#[async_trait]
pub trait K8sClient: Send + Sync {
    /// Fetch an object, `None` if it does not exist
    async fn get<K: ObjectKind>(&self, namespace: &str, name: &str) -> Result<Option<K>>;

    /// List objects of a namespace carrying all the given labels
    async fn list<K: ObjectKind>(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<K>>;

    async fn create<K: ObjectKind>(&self, obj: &K) -> Result<K>;

    /// Replace an object. Fails with a conflict if its resourceVersion is stale.
    async fn update<K: ObjectKind>(&self, obj: &K) -> Result<K>;

    /// Delete an object. Deleting a missing object is not an error.
    async fn delete<K: ObjectKind>(&self, namespace: &str, name: &str) -> Result<()>;

    /// Write the status subresource of an object
    async fn update_status<K: ObjectKind>(&self, obj: &K) -> Result<()>;

    /// Publish an event. Failures are logged, never returned.
    async fn publish_event<K: ObjectKind>(&self, obj: &K, event: EventRecord);

    /// Preferred PodDisruptionBudget API version
    async fn pdb_api_version(&self) -> Result<PdbApiVersion>;
}

/// Label selector string (`a=b,c=d`) for list calls
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}
