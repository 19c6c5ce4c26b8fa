//! Role-specific PodDisruptionBudgets
//!
//! StatefulSets sharing a role end up in the same budget so that Kubernetes
//! can drain one node per independent group instead of one per cluster.

use crate::crd::elasticsearch::{Elasticsearch, ElasticsearchHealth, NodeRole};
use crate::elasticsearch::{is_non_frozen_data_role, role_pdb_name, RealizedStatefulSet, StatefulSetCounts};
use crate::labels::{cluster_labels, CLUSTER_NAME_LABEL, STATEFULSET_NAME_LABEL};
use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    LabelSelector, LabelSelectorRequirement, ObjectMeta,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use std::collections::{BTreeMap, BTreeSet};

/// Order in which roles claim StatefulSets. Earlier roles are more critical.
const PRIORITY: [NodeRole; 7] = [
    NodeRole::Data,
    NodeRole::Master,
    NodeRole::DataFrozen,
    NodeRole::Ingest,
    NodeRole::Ml,
    NodeRole::Transform,
    NodeRole::Coordinating,
];

/// StatefulSets covered by one budget
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleGroup {
    /// Role the budget is named and sized after
    pub role: NodeRole,
    /// Sorted StatefulSet names
    pub statefulsets: Vec<String>,
}

/// Roles considered for grouping, data tiers folded into `data`.
///
/// `data_frozen` stays apart since it tolerates a yellow cluster. Roles that
/// do not drive availability are dropped, leaving coordinating nodes.
fn normalized_roles(sset: &RealizedStatefulSet) -> BTreeSet<NodeRole> {
    let roles: BTreeSet<NodeRole> = sset
        .roles
        .iter()
        .map(|role| {
            if is_non_frozen_data_role(*role) {
                NodeRole::Data
            } else {
                *role
            }
        })
        .filter(|role| PRIORITY.contains(role))
        .collect();
    if roles.is_empty() {
        BTreeSet::from([NodeRole::Coordinating])
    } else {
        roles
    }
}

/// Group StatefulSets by shared roles.
///
/// Each StatefulSet joins the group of its highest priority role. All of its
/// other roles then become aliases of that group, so a later StatefulSet
/// carrying any of them joins the same group. Groups come out in priority
/// order.
pub fn group_by_shared_roles(statefulsets: &[RealizedStatefulSet]) -> Vec<RoleGroup> {
    let mut sorted: Vec<&RealizedStatefulSet> = statefulsets.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));
    let roles: Vec<BTreeSet<NodeRole>> = sorted.iter().map(|s| normalized_roles(s)).collect();

    let mut target_of: BTreeMap<NodeRole, NodeRole> = BTreeMap::new();
    let mut grouped: BTreeMap<NodeRole, Vec<String>> = BTreeMap::new();
    let mut visited = vec![false; sorted.len()];

    for role in PRIORITY {
        for (idx, sset) in sorted.iter().enumerate() {
            if visited[idx] || !roles[idx].contains(&role) {
                continue;
            }
            let target = target_of.get(&role).copied().unwrap_or(role);
            grouped.entry(target).or_default().push(sset.name.clone());
            for alias in &roles[idx] {
                target_of.insert(*alias, target);
            }
            visited[idx] = true;
        }
    }

    PRIORITY
        .into_iter()
        .filter_map(|role| {
            grouped.remove(&role).map(|mut statefulsets| {
                statefulsets.sort();
                RoleGroup { role, statefulsets }
            })
        })
        .collect()
}

/// Pods of a role group that may be disrupted at once
pub fn allowed_disruptions_for_role(
    health: ElasticsearchHealth,
    role: NodeRole,
    statefulsets: &[RealizedStatefulSet],
) -> i32 {
    match health {
        ElasticsearchHealth::Unknown | ElasticsearchHealth::Red => 0,
        _ if statefulsets.expected_node_count() == 1 => 1,
        ElasticsearchHealth::Green => 1,
        // losing a data node may turn a yellow cluster red
        ElasticsearchHealth::Yellow if role == NodeRole::Data => 0,
        ElasticsearchHealth::Yellow => 1,
    }
}

/// One budget per role group, in priority order.
///
/// Owner reference and hash label are added when reconciled.
pub fn expected_role_pdbs(
    es: &Elasticsearch,
    statefulsets: &[RealizedStatefulSet],
) -> Vec<PodDisruptionBudget> {
    group_by_shared_roles(statefulsets)
        .into_iter()
        .map(|group| {
            let allowed = allowed_disruptions_for_role(es.health(), group.role, statefulsets);
            PodDisruptionBudget {
                metadata: ObjectMeta {
                    name: Some(role_pdb_name(&es.name_any(), group.role)),
                    namespace: es.namespace(),
                    labels: Some(cluster_labels(&es.name_any())),
                    ..Default::default()
                },
                spec: Some(PodDisruptionBudgetSpec {
                    max_unavailable: Some(IntOrString::Int(allowed)),
                    selector: Some(selector_for_statefulsets(&es.name_any(), group.statefulsets)),
                    ..Default::default()
                }),
                ..Default::default()
            }
        })
        .collect()
}

/// Pods of the cluster belonging to any of the given StatefulSets.
///
/// The StatefulSet controller owns the pods, which is what lets a single
/// budget with `maxUnavailable` span several StatefulSets.
fn selector_for_statefulsets(cluster: &str, statefulsets: Vec<String>) -> LabelSelector {
    LabelSelector {
        match_expressions: Some(vec![
            LabelSelectorRequirement {
                key: CLUSTER_NAME_LABEL.to_string(),
                operator: "In".to_string(),
                values: Some(vec![cluster.to_string()]),
            },
            LabelSelectorRequirement {
                key: STATEFULSET_NAME_LABEL.to_string(),
                operator: "In".to_string(),
                values: Some(statefulsets),
            },
        ]),
        ..Default::default()
    }
}
