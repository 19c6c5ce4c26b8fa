//! Enterprise license lookup
//!
//! Licenses are stored as secrets in the operator namespace. Only the license
//! type and validity window are checked here.

use crate::error::{OperatorError, Result};
use crate::k8s::K8sClient;
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

pub const LICENSE_SCOPE_LABEL: &str = "license.k8s.elastic.co/scope";
pub const LICENSE_SCOPE_OPERATOR: &str = "operator";
/// Secret key holding the license JSON
pub const LICENSE_FILE_NAME: &str = "license";

/// Answers whether licensed features may be used
#[async_trait]
pub trait LicenseChecker: Send + Sync {
    async fn enterprise_features_enabled(&self) -> Result<bool>;
}

#[derive(Debug, Deserialize)]
struct EnterpriseLicense {
    license: LicenseSpec,
}

#[derive(Debug, Deserialize)]
struct LicenseSpec {
    #[serde(rename = "type")]
    type_: String,
    #[serde(default)]
    start_date_in_millis: i64,
    #[serde(default)]
    expiry_date_in_millis: i64,
}

impl LicenseSpec {
    fn is_enterprise(&self) -> bool {
        matches!(
            self.type_.as_str(),
            "enterprise" | "enterprise_trial" | "legacy_trial"
        )
    }

    fn is_valid_at(&self, now_millis: i64) -> bool {
        self.start_date_in_millis <= now_millis && now_millis < self.expiry_date_in_millis
    }
}

/// [`LicenseChecker`] reading license secrets from the operator namespace
pub struct SecretLicenseChecker<C> {
    client: Arc<C>,
    operator_namespace: String,
}

impl<C: K8sClient> SecretLicenseChecker<C> {
    pub fn new(client: Arc<C>, operator_namespace: impl Into<String>) -> Self {
        Self {
            client,
            operator_namespace: operator_namespace.into(),
        }
    }
}

#[async_trait]
impl<C: K8sClient> LicenseChecker for SecretLicenseChecker<C> {
    async fn enterprise_features_enabled(&self) -> Result<bool> {
        let selector = BTreeMap::from([(
            LICENSE_SCOPE_LABEL.to_string(),
            LICENSE_SCOPE_OPERATOR.to_string(),
        )]);
        let secrets: Vec<Secret> = self
            .client
            .list(&self.operator_namespace, &selector)
            .await
            .map_err(|e| OperatorError::License(e.to_string()))?;

        let now = Utc::now().timestamp_millis();
        for secret in &secrets {
            let Some(raw) = secret.data.as_ref().and_then(|d| d.get(LICENSE_FILE_NAME)) else {
                continue;
            };
            match serde_json::from_slice::<EnterpriseLicense>(&raw.0) {
                Ok(parsed) if parsed.license.is_enterprise() && parsed.license.is_valid_at(now) => {
                    debug!(secret = %secret.name_any(), "Found valid enterprise license");
                    return Ok(true);
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(secret = %secret.name_any(), error = %e, "Ignoring unparseable license");
                }
            }
        }
        Ok(false)
    }
}

/// Fixed answer, for tests and for clusters without license management
pub struct StaticLicenseChecker(pub bool);

#[async_trait]
impl LicenseChecker for StaticLicenseChecker {
    async fn enterprise_features_enabled(&self) -> Result<bool> {
        Ok(self.0)
    }
}
