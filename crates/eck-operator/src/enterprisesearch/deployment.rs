//! HTTP Service and Deployment of an Enterprise Search resource
//!
//! The user pod template is taken as the base and completed with what the
//! operator needs: user settings win, except for the labels the operator
//! selects and rolls pods with.

use super::{
    config_secret_name, deployment_name, http_service_name, labels, name_prefix, CONFIG_FILE_NAME,
    CONFIG_HASH_LABEL, CONFIG_MOUNT_PATH, CONTAINER_NAME, DEFAULT_IMAGE, ES_CERTS_MOUNT_PATH,
    HTTP_CERTS_MOUNT_PATH, HTTP_PORT, LOG_MOUNT_PATH, READINESS_PROBE_FILE_NAME,
    READINESS_PROBE_MOUNT_PATH, READINESS_PROBE_TIMEOUT_SECONDS, VERSION_LABEL,
};
use crate::association::AssociationConf;
use crate::certificates::internal_certs_secret_name;
use crate::crd::enterprisesearch::v1::EnterpriseSearch;
use crate::error::Result;
use crate::hash;
use crate::k8s::K8sClient;
use crate::labels::merge_preserving;
use crate::reconciler::{reconcile_resource, reconcile_with_hash, replace_preserving_metadata, set_owner};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EmptyDirVolumeSource, EnvVar, ExecAction, KeyToPath, PodSpec,
    PodTemplateSpec, Probe, ResourceRequirements, SecretVolumeSource, Service, ServicePort, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::ResourceExt;
use std::collections::BTreeMap;

const DEFAULT_MEMORY: &str = "4Gi";
const DEFAULT_JAVA_OPTS: &str = "-Xms3500m -Xmx3500m";
const CONFIG_VOLUME: &str = "config";
const READINESS_PROBE_VOLUME: &str = "readiness-probe";
const LOGS_VOLUME: &str = "logs";
const HTTP_CERTS_VOLUME: &str = "elastic-internal-http-certificates";
const ES_CERTS_VOLUME: &str = "elasticsearch-certs";
const READ_ONLY_FILE_MODE: i32 = 0o444;

/// The HTTP service, from the user service template
pub fn expected_service(ent: &EnterpriseSearch) -> Service {
    let name = ent.name_any();
    let template = ent.spec.http.service.as_ref();
    let template_meta = template.and_then(|t| t.metadata.as_ref());

    let mut spec = template.and_then(|t| t.spec.clone()).unwrap_or_default();
    if spec.ports.as_ref().is_none_or(Vec::is_empty) {
        spec.ports = Some(vec![ServicePort {
            name: Some(ent.spec.http.protocol().to_string()),
            protocol: Some("TCP".to_string()),
            port: HTTP_PORT,
            ..Default::default()
        }]);
    }
    spec.selector = Some(labels(&name));

    Service {
        metadata: ObjectMeta {
            name: Some(http_service_name(&name)),
            namespace: ent.namespace(),
            labels: Some(merge_preserving(
                labels(&name),
                template_meta.and_then(|m| m.labels.as_ref()),
            )),
            annotations: template_meta.and_then(|m| m.annotations.clone()),
            ..Default::default()
        },
        spec: Some(spec),
        ..Default::default()
    }
}

/// Reconcile the service, keeping the addresses allocated by the API server
pub async fn reconcile_service<C: K8sClient>(client: &C, ent: &EnterpriseSearch) -> Result<Service> {
    let mut expected = expected_service(ent);
    set_owner(&mut expected, ent)?;
    hash::set_template_hash(&mut expected)?;
    reconcile_resource(client, expected, hash::template_hash_differs, |expected, observed| {
        let allocated = observed
            .spec
            .as_ref()
            .map(|s| (s.cluster_ip.clone(), s.cluster_ips.clone()));
        replace_preserving_metadata(expected, observed);
        if let (Some(spec), Some((cluster_ip, cluster_ips))) = (observed.spec.as_mut(), allocated) {
            if spec.cluster_ip.is_none() {
                spec.cluster_ip = cluster_ip;
                spec.cluster_ips = cluster_ips;
            }
        }
    })
    .await
}

/// Inputs of the Deployment beyond the resource itself
#[derive(Debug, Clone, Copy)]
pub struct DeploymentParams<'a> {
    pub ent: &'a EnterpriseSearch,
    pub config_hash: &'a str,
    pub association: Option<&'a AssociationConf>,
}

pub fn expected_deployment(params: DeploymentParams<'_>) -> Deployment {
    let ent = params.ent;
    let name = ent.name_any();

    Deployment {
        metadata: ObjectMeta {
            name: Some(deployment_name(&name)),
            namespace: ent.namespace(),
            labels: Some(labels(&name)),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(ent.spec.count),
            revision_history_limit: ent.spec.revision_history_limit,
            selector: LabelSelector {
                match_labels: Some(labels(&name)),
                ..Default::default()
            },
            template: pod_template(params),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub async fn reconcile_deployment<C: K8sClient>(
    client: &C,
    params: DeploymentParams<'_>,
) -> Result<Deployment> {
    reconcile_with_hash(client, expected_deployment(params), params.ent).await
}

fn pod_template(params: DeploymentParams<'_>) -> PodTemplateSpec {
    let ent = params.ent;
    let name = ent.name_any();
    let mut template = ent.spec.pod_template.clone().unwrap_or_default();

    let mut pod_labels = labels(&name);
    pod_labels.insert(VERSION_LABEL.to_string(), ent.spec.version.clone());
    pod_labels.insert(CONFIG_HASH_LABEL.to_string(), params.config_hash.to_string());
    let meta = template.metadata.get_or_insert_with(Default::default);
    meta.labels = Some(merge_preserving(pod_labels, meta.labels.as_ref()));

    let (volumes, mounts) = volumes(params);
    let spec = template.spec.get_or_insert_with(PodSpec::default);
    if spec.service_account_name.is_none() {
        spec.service_account_name = ent.spec.service_account_name.clone();
    }
    add_missing(spec.volumes.get_or_insert_with(Vec::new), volumes, |a, b| a.name == b.name);

    let idx = match spec.containers.iter().position(|c| c.name == CONTAINER_NAME) {
        Some(idx) => idx,
        None => {
            spec.containers.insert(
                0,
                Container {
                    name: CONTAINER_NAME.to_string(),
                    ..Default::default()
                },
            );
            0
        }
    };
    complete_container(&mut spec.containers[idx], ent, mounts);
    template
}

fn complete_container(container: &mut Container, ent: &EnterpriseSearch, mounts: Vec<VolumeMount>) {
    if container.image.as_deref().is_none_or(str::is_empty) {
        container.image = Some(
            ent.spec
                .image
                .clone()
                .unwrap_or_else(|| format!("{DEFAULT_IMAGE}:{}", ent.spec.version)),
        );
    }
    if container.ports.as_ref().is_none_or(Vec::is_empty) {
        container.ports = Some(vec![ContainerPort {
            name: Some(ent.spec.http.protocol().to_string()),
            container_port: HTTP_PORT,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]);
    }
    if container.readiness_probe.is_none() {
        container.readiness_probe = Some(readiness_probe());
    }
    if container.resources.is_none() {
        let memory = BTreeMap::from([("memory".to_string(), Quantity(DEFAULT_MEMORY.to_string()))]);
        container.resources = Some(ResourceRequirements {
            requests: Some(memory.clone()),
            limits: Some(memory),
            ..Default::default()
        });
    }
    add_missing(
        container.env.get_or_insert_with(Vec::new),
        vec![env("JAVA_OPTS", DEFAULT_JAVA_OPTS), env("ENT_SEARCH_CONFIG_PATH", CONFIG_MOUNT_PATH)],
        |a, b| a.name == b.name,
    );
    add_missing(container.volume_mounts.get_or_insert_with(Vec::new), mounts, |a, b| {
        a.mount_path == b.mount_path
    });
}

fn readiness_probe() -> Probe {
    Probe {
        exec: Some(ExecAction {
            command: Some(vec![
                "bash".to_string(),
                READINESS_PROBE_MOUNT_PATH.to_string(),
            ]),
        }),
        failure_threshold: Some(3),
        initial_delay_seconds: Some(10),
        period_seconds: Some(10),
        success_threshold: Some(1),
        timeout_seconds: Some(READINESS_PROBE_TIMEOUT_SECONDS),
        ..Default::default()
    }
}

fn env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn secret_volume(volume: &str, secret: String, items: Option<Vec<KeyToPath>>) -> Volume {
    Volume {
        name: volume.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret),
            items,
            default_mode: Some(READ_ONLY_FILE_MODE),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn single_key(key: &str) -> Option<Vec<KeyToPath>> {
    Some(vec![KeyToPath {
        key: key.to_string(),
        path: key.to_string(),
        ..Default::default()
    }])
}

fn mount(volume: &str, path: &str, sub_path: Option<&str>) -> VolumeMount {
    VolumeMount {
        name: volume.to_string(),
        mount_path: path.to_string(),
        sub_path: sub_path.map(str::to_string),
        read_only: Some(volume != LOGS_VOLUME),
        ..Default::default()
    }
}

fn volumes(params: DeploymentParams<'_>) -> (Vec<Volume>, Vec<VolumeMount>) {
    let ent = params.ent;
    let config_secret = config_secret_name(&ent.name_any());
    let mut volumes = vec![
        secret_volume(CONFIG_VOLUME, config_secret.clone(), single_key(CONFIG_FILE_NAME)),
        secret_volume(
            READINESS_PROBE_VOLUME,
            config_secret,
            single_key(READINESS_PROBE_FILE_NAME),
        ),
        Volume {
            name: LOGS_VOLUME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
    ];
    let mut mounts = vec![
        mount(CONFIG_VOLUME, CONFIG_MOUNT_PATH, Some(CONFIG_FILE_NAME)),
        mount(
            READINESS_PROBE_VOLUME,
            READINESS_PROBE_MOUNT_PATH,
            Some(READINESS_PROBE_FILE_NAME),
        ),
        mount(LOGS_VOLUME, LOG_MOUNT_PATH, None),
    ];

    if ent.spec.http.tls.enabled() {
        volumes.push(secret_volume(
            HTTP_CERTS_VOLUME,
            internal_certs_secret_name(&name_prefix(&ent.name_any())),
            None,
        ));
        mounts.push(mount(HTTP_CERTS_VOLUME, HTTP_CERTS_MOUNT_PATH, None));
    }
    if let Some(conf) = params.association.filter(|c| c.ca_cert_provided) {
        volumes.push(secret_volume(ES_CERTS_VOLUME, conf.ca_secret_name.clone(), None));
        mounts.push(mount(ES_CERTS_VOLUME, ES_CERTS_MOUNT_PATH, None));
    }
    (volumes, mounts)
}

/// Append the defaults that have no user counterpart
fn add_missing<T>(target: &mut Vec<T>, defaults: Vec<T>, same: impl Fn(&T, &T) -> bool) {
    for item in defaults {
        if !target.iter().any(|existing| same(existing, &item)) {
            target.push(item);
        }
    }
}
