//! Well-known labels put on generated resources

use std::collections::BTreeMap;

/// Name of the Elasticsearch cluster a resource belongs to
pub const CLUSTER_NAME_LABEL: &str = "elasticsearch.k8s.elastic.co/cluster-name";

/// Name of the StatefulSet an Elasticsearch pod belongs to
pub const STATEFULSET_NAME_LABEL: &str = "elasticsearch.k8s.elastic.co/statefulset-name";

/// Kind of application a resource belongs to
pub const TYPE_LABEL: &str = "common.k8s.elastic.co/type";

pub const ELASTICSEARCH_TYPE: &str = "elasticsearch";
pub const ENTERPRISE_SEARCH_TYPE: &str = "enterprise-search";

/// Labels identifying every resource of an Elasticsearch cluster
pub fn cluster_labels(cluster_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (CLUSTER_NAME_LABEL.to_string(), cluster_name.to_string()),
        (TYPE_LABEL.to_string(), ELASTICSEARCH_TYPE.to_string()),
    ])
}

/// Merge two label or annotation maps, `base` winning on conflicts
pub fn merge_preserving(
    base: BTreeMap<String, String>,
    extra: Option<&BTreeMap<String, String>>,
) -> BTreeMap<String, String> {
    let mut merged: BTreeMap<String, String> = extra.cloned().unwrap_or_default();
    merged.extend(base);
    merged
}
