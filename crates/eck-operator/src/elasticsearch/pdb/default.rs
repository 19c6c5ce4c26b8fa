//! The single, cluster-wide PodDisruptionBudget

use crate::crd::elasticsearch::{Elasticsearch, ElasticsearchHealth, PodDisruptionBudgetTemplate};
use crate::elasticsearch::{default_pdb_name, RealizedStatefulSet, StatefulSetCounts};
use crate::labels::{cluster_labels, merge_preserving, CLUSTER_NAME_LABEL};
use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use std::collections::BTreeMap;

/// Build the default budget, from the user template when one is given.
///
/// Owner reference and hash label are added when reconciled.
pub fn expected_default_pdb(
    es: &Elasticsearch,
    statefulsets: &[RealizedStatefulSet],
    template: Option<&PodDisruptionBudgetTemplate>,
) -> PodDisruptionBudget {
    let template_meta = template.and_then(|t| t.metadata.as_ref());
    let labels = merge_preserving(
        cluster_labels(&es.name_any()),
        template_meta.and_then(|m| m.labels.as_ref()),
    );
    let annotations = template_meta
        .and_then(|m| m.annotations.clone())
        .filter(|a| !a.is_empty());

    let spec = match template.and_then(|t| t.spec.clone()) {
        Some(spec) => spec,
        None => build_pdb_spec(es, statefulsets),
    };

    PodDisruptionBudget {
        metadata: ObjectMeta {
            name: Some(default_pdb_name(&es.name_any())),
            namespace: es.namespace(),
            labels: Some(labels),
            annotations,
            ..Default::default()
        },
        spec: Some(spec),
        ..Default::default()
    }
}

/// `minAvailable` over every pod of the cluster.
///
/// `maxUnavailable` cannot be used: it requires a selector matching a single
/// built-in controller, which the cluster-name selector does not.
fn build_pdb_spec(es: &Elasticsearch, statefulsets: &[RealizedStatefulSet]) -> PodDisruptionBudgetSpec {
    let min_available =
        statefulsets.expected_node_count() - allowed_disruptions_for_single_pdb(es.health(), statefulsets);
    PodDisruptionBudgetSpec {
        selector: Some(LabelSelector {
            match_labels: Some(BTreeMap::from([(
                CLUSTER_NAME_LABEL.to_string(),
                es.name_any(),
            )])),
            ..Default::default()
        }),
        min_available: Some(IntOrString::Int(min_available)),
        max_unavailable: None,
        ..Default::default()
    }
}

/// Pods of the whole cluster that may be disrupted at once
pub fn allowed_disruptions_for_single_pdb(
    health: ElasticsearchHealth,
    statefulsets: &[RealizedStatefulSet],
) -> i32 {
    // a single node test cluster must not block node drains
    if statefulsets.expected_node_count() == 1 {
        return 1;
    }
    if health != ElasticsearchHealth::Green {
        return 0;
    }
    if statefulsets.expected_master_count() == 1
        || statefulsets.expected_data_count() == 1
        || statefulsets.expected_ingest_count() == 1
    {
        return 0;
    }
    1
}
