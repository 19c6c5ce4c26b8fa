//! Types shared between the custom resources

use k8s_openapi::api::core::v1::ServiceSpec;
use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Annotation that suppresses reconciliation when set to `false`
pub const MANAGED_ANNOTATION: &str = "eck.k8s.elastic.co/managed";

/// Annotation allowing a version decrease on update
pub const DISABLE_DOWNGRADE_VALIDATION_ANNOTATION: &str =
    "eck.k8s.elastic.co/disable-downgrade-validation";

/// Annotation written by `kubectl apply`
pub const LAST_APPLIED_CONFIGURATION_ANNOTATION: &str =
    "kubectl.kubernetes.io/last-applied-configuration";

/// Schema for free-form objects whose fields are kept as-is by the API server
pub fn preserve_unknown_fields(_: &mut SchemaGenerator) -> Schema {
    let mut obj = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    obj.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    Schema::Object(obj)
}

/// True if the object opted out of reconciliation
pub fn is_unmanaged(annotations: Option<&BTreeMap<String, String>>) -> bool {
    annotations
        .and_then(|a| a.get(MANAGED_ANNOTATION))
        .is_some_and(|v| v == "false")
}

/// Labels and annotations a user may set on generated objects
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TemplateMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl TemplateMeta {
    pub fn is_empty(&self) -> bool {
        self.labels.as_ref().is_none_or(BTreeMap::is_empty)
            && self.annotations.as_ref().is_none_or(BTreeMap::is_empty)
    }
}

/// Reference to another resource, either by name or through a secret
/// holding its connection information
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSelector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Service to use instead of the default one of the referenced resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,

    /// Secret holding the connection information of an unmanaged resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
}

fn non_empty(v: &Option<String>) -> bool {
    v.as_deref().is_some_and(|s| !s.is_empty())
}

impl ObjectSelector {
    pub fn is_defined(&self) -> bool {
        non_empty(&self.name) || non_empty(&self.secret_name)
    }

    /// Check that the selector uses either a name or a secret name, never both
    pub fn validate(&self) -> std::result::Result<(), String> {
        let name = non_empty(&self.name);
        let secret_name = non_empty(&self.secret_name);
        if name && secret_name {
            return Err("specify name or secretName, not both".to_string());
        }
        if secret_name && (non_empty(&self.namespace) || non_empty(&self.service_name)) {
            return Err(
                "serviceName or namespace can only be used in combination with name, not with secretName"
                    .to_string(),
            );
        }
        if !name && (non_empty(&self.namespace) || non_empty(&self.service_name)) {
            return Err("name is required when namespace or serviceName is specified".to_string());
        }
        Ok(())
    }

    /// Namespace of the referenced resource, defaulting to `local_ns`
    pub fn namespace_or<'a>(&'a self, local_ns: &'a str) -> &'a str {
        self.namespace
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .unwrap_or(local_ns)
    }
}

/// Secret holding additional configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSource {
    pub secret_name: String,
}

/// User-provided service template
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<TemplateMeta>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<ServiceSpec>,
}

/// HTTP layer settings
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub service: Option<ServiceTemplate>,

    #[serde(default)]
    pub tls: TlsOptions,
}

impl HttpConfig {
    /// Scheme used to reach the HTTP endpoint
    pub fn protocol(&self) -> &'static str {
        if self.tls.enabled() {
            "https"
        } else {
            "http"
        }
    }
}

/// TLS options of the HTTP layer
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TlsOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_signed_certificate: Option<SelfSignedCertificate>,

    /// Secret holding a user-provided certificate (`tls.crt`, `tls.key`, optional `ca.crt`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<SecretRef>,
}

impl TlsOptions {
    /// TLS is on unless self-signed certificates are explicitly disabled
    pub fn enabled(&self) -> bool {
        !self
            .self_signed_certificate
            .as_ref()
            .is_some_and(|s| s.disabled)
    }

    pub fn user_certificate_secret(&self) -> Option<&str> {
        self.certificate
            .as_ref()
            .map(|c| c.secret_name.as_str())
            .filter(|s| !s.is_empty())
    }

    pub fn subject_alt_names(&self) -> &[SubjectAlternativeName] {
        self.self_signed_certificate
            .as_ref()
            .map(|s| s.subject_alt_names.as_slice())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SelfSignedCertificate {
    #[serde(default)]
    pub disabled: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subject_alt_names: Vec<SubjectAlternativeName>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SubjectAlternativeName {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    pub secret_name: String,
}

/// Health derived from a Deployment
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentHealth {
    #[default]
    Red,
    Green,
}
