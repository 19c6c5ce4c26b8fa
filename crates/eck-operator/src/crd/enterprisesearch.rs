//! The `EnterpriseSearch` custom resource
//!
//! Two versions are served side by side. `v1` is the storage version and the
//! one the controller works with; `v1beta1` objects are converted with
//! [`From`].

/// Storage version
pub mod v1 {
    use crate::crd::common::{
        preserve_unknown_fields, ConfigSource, DeploymentHealth, HttpConfig, ObjectSelector,
    };
    use k8s_openapi::api::core::v1::PodTemplateSpec;
    use kube::CustomResource;
    use schemars::JsonSchema;
    use serde::{Deserialize, Serialize};
    use validator::Validate;

    /// Desired state of an Enterprise Search deployment
    #[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate, PartialEq)]
    #[kube(
        group = "enterprisesearch.k8s.elastic.co",
        version = "v1",
        kind = "EnterpriseSearch",
        plural = "enterprisesearches",
        shortname = "ent",
        namespaced,
        status = "EnterpriseSearchStatus",
        printcolumn = r#"{"name":"Health","type":"string","jsonPath":".status.health"}"#,
        printcolumn = r#"{"name":"Nodes","type":"integer","jsonPath":".status.availableNodes"}"#,
        printcolumn = r#"{"name":"Version","type":"string","jsonPath":".status.version"}"#,
        printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
    )]
    #[serde(rename_all = "camelCase")]
    pub struct EnterpriseSearchSpec {
        /// Enterprise Search version
        #[validate(length(min = 1))]
        pub version: String,

        /// Container image, defaults to the official image for `version`
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub image: Option<String>,

        /// Number of instances
        #[serde(default = "default_count")]
        #[validate(range(min = 0))]
        pub count: i32,

        /// Inline Enterprise Search configuration
        #[serde(default, skip_serializing_if = "Option::is_none")]
        #[schemars(schema_with = "preserve_unknown_fields")]
        pub config: Option<serde_json::Value>,

        /// Secrets holding configuration, later entries win
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pub config_ref: Vec<ConfigSource>,

        #[serde(default)]
        pub http: HttpConfig,

        /// Elasticsearch cluster to connect to
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub elasticsearch_ref: Option<ObjectSelector>,

        /// Pod template merged over the generated one
        #[serde(default, skip_serializing_if = "Option::is_none")]
        #[schemars(schema_with = "preserve_unknown_fields")]
        pub pod_template: Option<PodTemplateSpec>,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub service_account_name: Option<String>,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub revision_history_limit: Option<i32>,
    }

    fn default_count() -> i32 {
        1
    }

    /// Observed state of an Enterprise Search deployment
    #[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
    #[serde(rename_all = "camelCase")]
    pub struct EnterpriseSearchStatus {
        #[serde(default)]
        pub available_nodes: i32,

        #[serde(default)]
        pub count: i32,

        /// Lowest version among the running pods
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub version: Option<String>,

        #[serde(default)]
        pub health: DeploymentHealth,

        /// Name of the HTTP service
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub service: Option<String>,

        /// Label selector of the pods, for the scale subresource
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub selector: Option<String>,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub association_status: Option<String>,
    }

    impl EnterpriseSearch {
        pub fn es_ref(&self) -> Option<&ObjectSelector> {
            self.spec.elasticsearch_ref.as_ref().filter(|r| r.is_defined())
        }
    }
}

/// Older served version
pub mod v1beta1 {
    use super::v1::EnterpriseSearchStatus;
    use crate::crd::common::{preserve_unknown_fields, ConfigSource, HttpConfig, ObjectSelector};
    use k8s_openapi::api::core::v1::PodTemplateSpec;
    use kube::CustomResource;
    use schemars::JsonSchema;
    use serde::{Deserialize, Serialize};

    #[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
    #[kube(
        group = "enterprisesearch.k8s.elastic.co",
        version = "v1beta1",
        kind = "EnterpriseSearch",
        plural = "enterprisesearches",
        shortname = "ent",
        namespaced,
        status = "EnterpriseSearchStatus"
    )]
    #[serde(rename_all = "camelCase")]
    pub struct EnterpriseSearchSpec {
        pub version: String,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub image: Option<String>,

        #[serde(default)]
        pub count: i32,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        #[schemars(schema_with = "preserve_unknown_fields")]
        pub config: Option<serde_json::Value>,

        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pub config_ref: Vec<ConfigSource>,

        #[serde(default)]
        pub http: HttpConfig,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub elasticsearch_ref: Option<ObjectSelector>,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        #[schemars(schema_with = "preserve_unknown_fields")]
        pub pod_template: Option<PodTemplateSpec>,
    }

    impl From<EnterpriseSearch> for super::v1::EnterpriseSearch {
        fn from(old: EnterpriseSearch) -> Self {
            let spec = super::v1::EnterpriseSearchSpec {
                version: old.spec.version,
                image: old.spec.image,
                count: old.spec.count,
                config: old.spec.config,
                config_ref: old.spec.config_ref,
                http: old.spec.http,
                elasticsearch_ref: old.spec.elasticsearch_ref,
                pod_template: old.spec.pod_template,
                service_account_name: None,
                revision_history_limit: None,
            };
            let mut converted = super::v1::EnterpriseSearch::new("", spec);
            converted.metadata = old.metadata;
            converted.status = old.status;
            converted
        }
    }
}
