//! The `Elasticsearch` custom resource
//!
//! Only the parts consumed by the disruption budget planner are modelled:
//! the declared node sets, the optional PodDisruptionBudget template and the
//! health reported in the status.

use super::common::{preserve_unknown_fields, TemplateMeta};
use k8s_openapi::api::policy::v1::PodDisruptionBudgetSpec;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use validator::Validate;

/// Desired state of an Elasticsearch cluster
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate, PartialEq)]
#[kube(
    group = "elasticsearch.k8s.elastic.co",
    version = "v1",
    kind = "Elasticsearch",
    plural = "elasticsearches",
    shortname = "es",
    namespaced,
    status = "ElasticsearchStatus",
    printcolumn = r#"{"name":"Health","type":"string","jsonPath":".status.health"}"#,
    printcolumn = r#"{"name":"Nodes","type":"integer","jsonPath":".status.availableNodes"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".status.version"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ElasticsearchSpec {
    /// Elasticsearch version
    #[validate(length(min = 1))]
    pub version: String,

    /// Groups of nodes sharing the same configuration
    #[serde(default)]
    pub node_sets: Vec<NodeSet>,

    /// PodDisruptionBudget template.
    ///
    /// Unset means the operator manages a default budget, an empty object
    /// disables budgets entirely, anything else is used as-is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub pod_disruption_budget: Option<PodDisruptionBudgetTemplate>,
}

/// A group of Elasticsearch nodes realized as one StatefulSet
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeSet {
    pub name: String,

    #[serde(default = "default_count")]
    pub count: i32,

    /// Elasticsearch settings of the nodes, `node.roles` among them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub config: Option<serde_json::Value>,
}

fn default_count() -> i32 {
    1
}

impl NodeSet {
    /// Declared roles. Absence of `node.roles` means every role.
    pub fn roles(&self) -> Vec<NodeRole> {
        let declared = self.config.as_ref().and_then(|cfg| {
            cfg.get("node.roles")
                .or_else(|| cfg.get("node").and_then(|node| node.get("roles")))
        });
        match declared.and_then(|v| v.as_array()) {
            Some(roles) => roles
                .iter()
                .filter_map(|r| r.as_str())
                .filter_map(NodeRole::parse)
                .collect(),
            None => NodeRole::ALL_LABELLED.to_vec(),
        }
    }
}

/// User-provided PodDisruptionBudget
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodDisruptionBudgetTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<TemplateMeta>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<PodDisruptionBudgetSpec>,
}

/// How the cluster wants its disruption budgets handled
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PdbTemplateMode<'a> {
    /// No template: the operator picks the budgets
    Default,
    /// Empty template: no budget at all
    Disabled,
    /// Template used verbatim
    Custom(&'a PodDisruptionBudgetTemplate),
}

impl ElasticsearchSpec {
    pub fn pdb_mode(&self) -> PdbTemplateMode<'_> {
        match &self.pod_disruption_budget {
            None => PdbTemplateMode::Default,
            Some(t) if t.is_disabled() => PdbTemplateMode::Disabled,
            Some(t) => PdbTemplateMode::Custom(t),
        }
    }
}

impl PodDisruptionBudgetTemplate {
    pub fn is_disabled(&self) -> bool {
        self.metadata.as_ref().is_none_or(TemplateMeta::is_empty)
            && self
                .spec
                .as_ref()
                .is_none_or(|spec| *spec == PodDisruptionBudgetSpec::default())
    }
}

/// Capability held by an Elasticsearch node
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NodeRole {
    Master,
    Data,
    Ingest,
    Ml,
    Transform,
    RemoteClusterClient,
    VotingOnly,
    DataHot,
    DataWarm,
    DataCold,
    DataContent,
    DataFrozen,
    /// No role at all
    Coordinating,
}

impl NodeRole {
    /// Roles that are materialized as pod labels
    pub const ALL_LABELLED: [NodeRole; 12] = [
        NodeRole::Master,
        NodeRole::Data,
        NodeRole::Ingest,
        NodeRole::Ml,
        NodeRole::Transform,
        NodeRole::RemoteClusterClient,
        NodeRole::VotingOnly,
        NodeRole::DataHot,
        NodeRole::DataWarm,
        NodeRole::DataCold,
        NodeRole::DataContent,
        NodeRole::DataFrozen,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Master => "master",
            NodeRole::Data => "data",
            NodeRole::Ingest => "ingest",
            NodeRole::Ml => "ml",
            NodeRole::Transform => "transform",
            NodeRole::RemoteClusterClient => "remote_cluster_client",
            NodeRole::VotingOnly => "voting_only",
            NodeRole::DataHot => "data_hot",
            NodeRole::DataWarm => "data_warm",
            NodeRole::DataCold => "data_cold",
            NodeRole::DataContent => "data_content",
            NodeRole::DataFrozen => "data_frozen",
            NodeRole::Coordinating => "coordinating",
        }
    }

    pub fn parse(s: &str) -> Option<NodeRole> {
        NodeRole::ALL_LABELLED
            .into_iter()
            .chain(std::iter::once(NodeRole::Coordinating))
            .find(|r| r.as_str() == s)
    }

    /// Pod label marking a node with this role, `None` for coordinating nodes
    pub fn label_name(&self) -> Option<String> {
        match self {
            NodeRole::Coordinating => None,
            role => Some(format!("elasticsearch.k8s.elastic.co/node-{}", role.as_str())),
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of an Elasticsearch resource
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ElasticsearchStatus {
    #[serde(default)]
    pub health: ElasticsearchHealth,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    #[serde(default)]
    pub available_nodes: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Cluster health as reported by Elasticsearch
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ElasticsearchHealth {
    Red,
    Yellow,
    Green,
    /// Not reported yet. Empty and unrecognized values read as unknown.
    #[default]
    #[serde(other)]
    Unknown,
}

impl Elasticsearch {
    pub fn health(&self) -> ElasticsearchHealth {
        self.status
            .as_ref()
            .map(|s| s.health)
            .unwrap_or_default()
    }
}
