//! Status of an Enterprise Search resource

use super::{http_service_name, labels, VERSION_LABEL};
use crate::crd::common::DeploymentHealth;
use crate::crd::enterprisesearch::v1::{EnterpriseSearch, EnterpriseSearchStatus};
use crate::error::Result;
use crate::k8s::{label_selector, EventRecord, K8sClient};
use crate::version::min_pod_version;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::debug;

pub const EVENT_REASON_UNHEALTHY: &str = "Unhealthy";

/// Green once the Deployment reports `Available`
pub fn deployment_health(deployment: &Deployment) -> DeploymentHealth {
    let available = deployment
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Available" && c.status == "True")
        });
    if available {
        DeploymentHealth::Green
    } else {
        DeploymentHealth::Red
    }
}

/// Status derived from the Deployment and its pods.
///
/// The version is the lowest one among the pods, kept from the previous
/// status when no pod reports one.
pub fn build_status(ent: &EnterpriseSearch, deployment: &Deployment, pods: &[Pod]) -> Result<EnterpriseSearchStatus> {
    let previous = ent.status.clone().unwrap_or_default();
    let deployment_status = deployment.status.as_ref();
    let version = match min_pod_version(pods, VERSION_LABEL)? {
        Some(v) => Some(v.to_string()),
        None => previous.version,
    };
    Ok(EnterpriseSearchStatus {
        available_nodes: deployment_status.and_then(|s| s.available_replicas).unwrap_or(0),
        count: deployment_status.and_then(|s| s.replicas).unwrap_or(0),
        version,
        health: deployment_health(deployment),
        service: Some(http_service_name(&ent.name_any())),
        selector: Some(label_selector(&labels(&ent.name_any()))),
        association_status: previous.association_status,
    })
}

/// Write the status if it changed, with an event when health degrades
pub async fn update_status<C: K8sClient>(
    client: &C,
    ent: &EnterpriseSearch,
    deployment: &Deployment,
) -> Result<EnterpriseSearchStatus> {
    let pods: Vec<Pod> = client
        .list(&ent.namespace().unwrap_or_default(), &labels(&ent.name_any()))
        .await?;
    let status = build_status(ent, deployment, &pods)?;
    if ent.status.as_ref() == Some(&status) {
        debug!("Status up to date");
        return Ok(status);
    }

    let was_green = ent
        .status
        .as_ref()
        .is_some_and(|s| s.health == DeploymentHealth::Green);
    if was_green && status.health != DeploymentHealth::Green {
        client
            .publish_event(
                ent,
                EventRecord::warning(EVENT_REASON_UNHEALTHY, "Enterprise Search health degraded"),
            )
            .await;
    }

    let mut updated = ent.clone();
    updated.status = Some(status.clone());
    client.update_status(&updated).await?;
    Ok(status)
}
