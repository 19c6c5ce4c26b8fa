//! Read-only mode around version upgrades
//!
//! Some Enterprise Search upgrades require the application to be in read-only
//! mode while the new version migrates data. Read-only mode is enabled through
//! a pod still running the prior version before the Deployment is updated,
//! then disabled once every pod runs the new version. The resource carries an
//! annotation while read-only mode is on, so each API call is made once.

use super::read_only::{ReadOnlyModeClient, ReadOnlyModeRequest};
use super::{deployment_name, http_service_name, labels, name_prefix, HTTP_PORT, READ_ONLY_ANNOTATION, VERSION_LABEL};
use crate::association::{self, AssociationConf, Credentials};
use crate::certificates::{internal_certs_secret_name, CA_FILE_NAME, CERT_FILE_NAME};
use crate::crd::enterprisesearch::v1::EnterpriseSearch;
use crate::error::{OperatorError, Result};
use crate::k8s::{EventRecord, K8sClient};
use crate::version;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::ResourceExt;
use semver::Version;
use tracing::{info, warn};

pub const EVENT_REASON_UPGRADED: &str = "Upgraded";
pub const EVENT_REASON_DELAYED: &str = "Delayed";

/// Runs the read-only mode handshake for one reconciliation
pub struct VersionUpgrade<'a, C, R: ?Sized> {
    pub client: &'a C,
    pub read_only: &'a R,
    pub association: Option<&'a AssociationConf>,
}

impl<C, R> VersionUpgrade<'_, C, R>
where
    C: K8sClient,
    R: ReadOnlyModeClient + ?Sized,
{
    /// Enable or disable read-only mode as needed.
    ///
    /// `ent` is replaced by the updated resource when its annotation changes.
    pub async fn handle(&self, ent: &mut EnterpriseSearch) -> Result<()> {
        let expected = version::parse(&ent.spec.version)?;
        let upgrade_requested = self.is_version_upgrade(ent, &expected).await?;

        if upgrade_requested && !self.association.is_some_and(AssociationConf::auth_is_configured) {
            let msg = "Detected version upgrade with no association to Elasticsearch, please toggle \
                       read-only mode manually, otherwise the new version will crash at startup.";
            warn!(target_version = %expected, "{msg}");
            self.client
                .publish_event(ent, EventRecord::warning(EVENT_REASON_UPGRADED, msg))
                .await;
            return Ok(());
        }

        let pods = self.pods(ent).await?;
        let prior_version_pods = count_prior_version_pods(&pods, &expected)?;

        if upgrade_requested {
            if prior_version_pods == 0 {
                let msg = "a version upgrade is scheduled, but no Pod in the prior version is running: \
                           waiting for at least one Pod in the prior version to be running in order to \
                           enable read-only mode";
                info!(target_version = %expected, "{msg}");
                self.client
                    .publish_event(ent, EventRecord::warning(EVENT_REASON_DELAYED, msg))
                    .await;
                return Err(OperatorError::UpgradeBlocked(msg.to_string()));
            }
            return self.enable_read_only_mode(ent).await;
        }

        // pods still rotating, read-only mode stays on until they are done
        if prior_version_pods > 0 {
            return Ok(());
        }
        self.disable_read_only_mode(ent).await
    }

    /// True if the Deployment runs a version prior to the expected one
    async fn is_version_upgrade(&self, ent: &EnterpriseSearch, expected: &Version) -> Result<bool> {
        let namespace = ent.namespace().unwrap_or_default();
        let deployment: Option<Deployment> = self
            .client
            .get(&namespace, &deployment_name(&ent.name_any()))
            .await?;
        let Some(deployment) = deployment else {
            return Ok(false);
        };
        let template_labels = deployment
            .spec
            .as_ref()
            .and_then(|s| s.template.metadata.as_ref())
            .and_then(|m| m.labels.as_ref());
        Ok(version::from_labels(template_labels, VERSION_LABEL)?.is_some_and(|current| *expected > current))
    }

    async fn pods(&self, ent: &EnterpriseSearch) -> Result<Vec<Pod>> {
        self.client
            .list(&ent.namespace().unwrap_or_default(), &labels(&ent.name_any()))
            .await
    }

    async fn enable_read_only_mode(&self, ent: &mut EnterpriseSearch) -> Result<()> {
        if has_read_only_annotation(ent) {
            return Ok(());
        }
        info!(target_version = %ent.spec.version, "Enabling read-only mode for version upgrade");
        self.set_read_only_mode(ent, true).await?;

        ent.annotations_mut()
            .insert(READ_ONLY_ANNOTATION.to_string(), "true".to_string());
        *ent = self.client.update(ent).await?;
        Ok(())
    }

    async fn disable_read_only_mode(&self, ent: &mut EnterpriseSearch) -> Result<()> {
        if !has_read_only_annotation(ent) {
            return Ok(());
        }
        info!("Disabling read-only mode");
        self.set_read_only_mode(ent, false).await?;

        ent.annotations_mut().remove(READ_ONLY_ANNOTATION);
        *ent = self.client.update(ent).await?;
        Ok(())
    }

    async fn set_read_only_mode(&self, ent: &EnterpriseSearch, enabled: bool) -> Result<()> {
        let namespace = ent.namespace().unwrap_or_default();
        let credentials = match self.association {
            Some(conf) => association::credentials(self.client, &namespace, conf)
                .await?
                .unwrap_or_default(),
            None => Credentials::default(),
        };
        let trusted_certs = if ent.spec.http.tls.enabled() {
            Some(self.trusted_certs(ent).await?)
        } else {
            None
        };
        let request = ReadOnlyModeRequest {
            base_url: format!(
                "{}://{}.{namespace}.svc:{HTTP_PORT}",
                ent.spec.http.protocol(),
                http_service_name(&ent.name_any())
            ),
            enabled,
            credentials,
            trusted_certs,
        };
        self.read_only.set_read_only_mode(&request).await
    }

    /// CA of the internal HTTP certificate, the certificate itself if absent
    async fn trusted_certs(&self, ent: &EnterpriseSearch) -> Result<Vec<u8>> {
        let namespace = ent.namespace().unwrap_or_default();
        let name = internal_certs_secret_name(&name_prefix(&ent.name_any()));
        let secret: Secret = self
            .client
            .get(&namespace, &name)
            .await?
            .ok_or_else(|| OperatorError::NotFound {
                kind: "Secret".to_string(),
                name: name.clone(),
                namespace: namespace.clone(),
            })?;
        let mut data = secret.data.unwrap_or_default();
        data.remove(CA_FILE_NAME)
            .or_else(|| data.remove(CERT_FILE_NAME))
            .map(|pem| pem.0)
            .ok_or_else(|| OperatorError::Certificate(format!("no {CERT_FILE_NAME} found in secret {name}")))
    }
}

fn has_read_only_annotation(ent: &EnterpriseSearch) -> bool {
    ent.annotations()
        .get(READ_ONLY_ANNOTATION)
        .is_some_and(|v| v == "true")
}

fn count_prior_version_pods(pods: &[Pod], expected: &Version) -> Result<usize> {
    let mut count = 0;
    for pod in pods {
        if version::from_labels(pod.metadata.labels.as_ref(), VERSION_LABEL)?
            .is_some_and(|v| v < *expected)
        {
            count += 1;
        }
    }
    Ok(count)
}
