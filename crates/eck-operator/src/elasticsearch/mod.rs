//! Elasticsearch cluster handling: the realized topology and its disruption budgets

pub mod controller;
pub mod pdb;

use crate::crd::elasticsearch::NodeRole;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::ResourceExt;
use std::collections::BTreeSet;

/// Name of the default PodDisruptionBudget of a cluster
pub fn default_pdb_name(cluster: &str) -> String {
    format!("{cluster}-es-default")
}

/// Name of the PodDisruptionBudget covering one role group
pub fn role_pdb_name(cluster: &str, role: NodeRole) -> String {
    format!("{}-{}", default_pdb_name(cluster), role.as_str())
}

/// What the planner needs to know about a StatefulSet of the cluster.
///
/// Roles come from the labels of the pod template, not from the declared
/// node sets: a renamed node set still has its old StatefulSet draining.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealizedStatefulSet {
    pub name: String,
    pub replicas: i32,
    /// Empty for coordinating-only nodes
    pub roles: BTreeSet<NodeRole>,
}

impl RealizedStatefulSet {
    pub fn new(name: impl Into<String>, replicas: i32, roles: impl IntoIterator<Item = NodeRole>) -> Self {
        Self {
            name: name.into(),
            replicas,
            roles: roles.into_iter().collect(),
        }
    }

    pub fn from_statefulset(sset: &StatefulSet) -> Self {
        let spec = sset.spec.as_ref();
        let labels = spec
            .and_then(|s| s.template.metadata.as_ref())
            .and_then(|m| m.labels.as_ref());
        let roles = NodeRole::ALL_LABELLED
            .into_iter()
            .filter(|role| {
                role.label_name().is_some_and(|label| {
                    labels
                        .and_then(|l| l.get(&label))
                        .is_some_and(|v| v == "true")
                })
            })
            .collect();
        Self {
            name: sset.name_any(),
            replicas: spec.and_then(|s| s.replicas).unwrap_or(1),
            roles,
        }
    }

    pub fn has_role(&self, role: NodeRole) -> bool {
        self.roles.contains(&role)
    }

    /// Holds data outside of the frozen tier
    pub fn is_data(&self) -> bool {
        self.roles.iter().any(|r| is_non_frozen_data_role(*r))
    }
}

/// `data` or one of the hot, warm, cold and content tiers
pub fn is_non_frozen_data_role(role: NodeRole) -> bool {
    matches!(
        role,
        NodeRole::Data
            | NodeRole::DataHot
            | NodeRole::DataWarm
            | NodeRole::DataCold
            | NodeRole::DataContent
    )
}

/// Node counts derived from the realized StatefulSets
pub trait StatefulSetCounts {
    fn expected_node_count(&self) -> i32;
    fn expected_master_count(&self) -> i32;
    fn expected_data_count(&self) -> i32;
    fn expected_ingest_count(&self) -> i32;
}

impl StatefulSetCounts for [RealizedStatefulSet] {
    fn expected_node_count(&self) -> i32 {
        self.iter().map(|s| s.replicas).sum()
    }

    fn expected_master_count(&self) -> i32 {
        self.iter()
            .filter(|s| s.has_role(NodeRole::Master))
            .map(|s| s.replicas)
            .sum()
    }

    fn expected_data_count(&self) -> i32 {
        self.iter().filter(|s| s.is_data()).map(|s| s.replicas).sum()
    }

    fn expected_ingest_count(&self) -> i32 {
        self.iter()
            .filter(|s| s.has_role(NodeRole::Ingest))
            .map(|s| s.replicas)
            .sum()
    }
}
