//! Connection information towards an associated Elasticsearch cluster
//!
//! The association controller publishes the resolved connection settings as
//! a JSON annotation on the associated resource. This module reads it back
//! and dereferences the credentials and CA secrets it points to.

use crate::error::{OperatorError, Result};
use crate::k8s::K8sClient;
use k8s_openapi::api::core::v1::Secret;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Annotation carrying the Elasticsearch association configuration
pub const ES_ASSOCIATION_CONF_ANNOTATION: &str = "association.k8s.elastic.co/es-conf";

/// Key of the CA certificate in the association CA secret
pub const CA_FILE_NAME: &str = "ca.crt";

/// Resolved association settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssociationConf {
    #[serde(default)]
    pub auth_secret_name: String,
    #[serde(default)]
    pub auth_secret_key: String,
    #[serde(default)]
    pub ca_cert_provided: bool,
    #[serde(default)]
    pub ca_secret_name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub version: String,
}

impl AssociationConf {
    /// Read the configuration from the annotations of the associated resource
    pub fn from_annotations(annotations: Option<&BTreeMap<String, String>>) -> Result<Option<Self>> {
        match annotations.and_then(|a| a.get(ES_ASSOCIATION_CONF_ANNOTATION)) {
            Some(raw) if !raw.trim().is_empty() => Ok(Some(serde_json::from_str(raw)?)),
            _ => Ok(None),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.url.is_empty() && self.auth_is_configured()
    }

    pub fn auth_is_configured(&self) -> bool {
        !self.auth_secret_name.is_empty()
    }
}

/// Elasticsearch user credentials
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Dereference the credentials secret of an association.
///
/// The username is the secret key, the password its value.
pub async fn credentials<C: K8sClient>(
    client: &C,
    namespace: &str,
    conf: &AssociationConf,
) -> Result<Option<Credentials>> {
    if !conf.auth_is_configured() {
        return Ok(None);
    }
    let secret: Secret = client
        .get(namespace, &conf.auth_secret_name)
        .await?
        .ok_or_else(|| OperatorError::NotFound {
            kind: "Secret".to_string(),
            name: conf.auth_secret_name.clone(),
            namespace: namespace.to_string(),
        })?;
    let password = secret
        .data
        .as_ref()
        .and_then(|d| d.get(&conf.auth_secret_key))
        .ok_or_else(|| {
            OperatorError::InvalidConfig(format!(
                "auth secret key {} doesn't exist",
                conf.auth_secret_key
            ))
        })?;
    Ok(Some(Credentials {
        username: conf.auth_secret_key.clone(),
        password: String::from_utf8_lossy(&password.0).into_owned(),
    }))
}

/// PEM bytes of the association CA, if one is provided
pub async fn ca_certificate<C: K8sClient>(
    client: &C,
    namespace: &str,
    conf: &AssociationConf,
) -> Result<Option<Vec<u8>>> {
    if !conf.ca_cert_provided {
        return Ok(None);
    }
    let secret: Secret = client
        .get(namespace, &conf.ca_secret_name)
        .await?
        .ok_or_else(|| OperatorError::NotFound {
            kind: "Secret".to_string(),
            name: conf.ca_secret_name.clone(),
            namespace: namespace.to_string(),
        })?;
    Ok(secret
        .data
        .and_then(|mut d| d.remove(CA_FILE_NAME))
        .map(|b| b.0))
}
