//! Enterprise Search controller
//!
//! Drives one EnterpriseSearch resource to its desired state: HTTP service,
//! certificates, configuration secret, read-only mode around upgrades,
//! Deployment and status. Secrets the resource references but does not own are
//! tracked in [`DynamicWatches`] so that changing them re-enqueues the resource.

use super::config::{reconcile_config, RenderedConfig};
use super::deployment::{reconcile_deployment, reconcile_service, DeploymentParams};
use super::fingerprint::{fingerprint, FingerprintInputs};
use super::read_only::{HttpReadOnlyModeClient, ReadOnlyModeClient};
use super::status::update_status;
use super::version_upgrade::{VersionUpgrade, EVENT_REASON_DELAYED};
use super::{http_service_name, labels, name_prefix, NAME_LABEL, SUPPORTED_VERSIONS};
use crate::association::{self, AssociationConf};
use crate::certificates::{internal_certs_secret_name, CertificatesReconciler, CERT_FILE_NAME};
use crate::config::OperatorConfig;
use crate::controller::{requeue_after_error, scoped_api, DEFAULT_REQUEUE_SECONDS};
use crate::crd::common::is_unmanaged;
use crate::crd::enterprisesearch::v1::EnterpriseSearch;
use crate::error::{OperatorError, Result};
use crate::k8s::{EventRecord, K8sClient, KubeClient};
use crate::metrics::ControllerMetrics;
use crate::reconciler::garbage_collect_soft_owned_secrets;
use crate::validation::{
    check_name_length, check_no_downgrade, check_no_unknown_fields, check_supported_version,
    from_validator, into_result, FieldError,
};
use crate::version::{self, compatible_with_reference};
use crate::watches::{DynamicWatches, NamespacedName};
use dashmap::DashMap;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, Secret, Service};
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config;
use kube::{Resource, ResourceExt};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};
use validator::Validate;

/// Name used for events and metrics
pub const CONTROLLER_NAME: &str = "enterprisesearch";

/// Finalizer making sure watches and soft-owned secrets are released
pub const FINALIZER_NAME: &str = "enterprisesearch.k8s.elastic.co/finalizer";

/// Context passed to the controller
pub struct ControllerContext<C> {
    pub client: C,
    pub read_only: Arc<dyn ReadOnlyModeClient>,
    /// Secrets referenced by each resource
    pub watches: Arc<DynamicWatches>,
    pub config: OperatorConfig,
    /// Metrics recorder (optional)
    pub metrics: Option<ControllerMetrics>,
    /// Per-resource error retry counts for exponential backoff
    pub error_counts: DashMap<String, u32>,
}

/// Start the Enterprise Search controller
pub async fn run_controller(client: KubeClient, config: OperatorConfig) -> Result<()> {
    let kube_client = client.inner().clone();
    let namespace = config.namespace.clone();
    let resources = scoped_api::<EnterpriseSearch>(&kube_client, namespace.as_deref());

    info!(
        namespace = namespace.as_deref().unwrap_or("all"),
        ip_family = ?config.ip_family,
        "Starting Enterprise Search controller"
    );

    let watches = Arc::new(DynamicWatches::new());
    let ctx = Arc::new(ControllerContext {
        client,
        read_only: Arc::new(HttpReadOnlyModeClient),
        watches: watches.clone(),
        config,
        metrics: Some(ControllerMetrics::new(CONTROLLER_NAME)),
        error_counts: DashMap::new(),
    });

    Controller::new(resources, Config::default())
        .owns(
            scoped_api::<Deployment>(&kube_client, namespace.as_deref()),
            Config::default(),
        )
        .owns(
            scoped_api::<Service>(&kube_client, namespace.as_deref()),
            Config::default(),
        )
        .watches(
            scoped_api::<Pod>(&kube_client, namespace.as_deref()),
            Config::default().labels(NAME_LABEL),
            |pod| {
                let owner = pod.labels().get(NAME_LABEL)?.clone();
                let namespace = pod.namespace()?;
                Some(ObjectRef::<EnterpriseSearch>::new(&owner).within(&namespace))
            },
        )
        .watches(
            scoped_api::<Secret>(&kube_client, namespace.as_deref()),
            Config::default(),
            move |secret| secret_owners(&watches, &secret),
        )
        .run(reconcile, error_policy::<KubeClient>, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    debug!(
                        name = obj.name,
                        namespace = obj.namespace,
                        ?action,
                        "Reconciliation completed"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Reconciliation failed");
                }
            }
        })
        .await;

    Ok(())
}

/// Resources to enqueue when a secret changes: the ones that reference it and
/// the one it was generated for
pub fn secret_owners(watches: &DynamicWatches, secret: &Secret) -> Vec<ObjectRef<EnterpriseSearch>> {
    let namespace = secret.namespace().unwrap_or_default();
    let key = NamespacedName::new(&namespace, secret.name_any());
    let mut owners: Vec<_> = watches
        .owners_of_secret(&key)
        .into_iter()
        .map(|owner| ObjectRef::new(&owner.name).within(&owner.namespace))
        .collect();
    if let Some(name) = secret.labels().get(NAME_LABEL) {
        let generated_for = ObjectRef::new(name).within(&namespace);
        if !owners.contains(&generated_for) {
            owners.push(generated_for);
        }
    }
    owners
}

/// Main reconciliation function
#[instrument(skip(ent, ctx), fields(name = %ent.name_any(), namespace = ent.namespace()))]
async fn reconcile(ent: Arc<EnterpriseSearch>, ctx: Arc<ControllerContext<KubeClient>>) -> Result<Action> {
    let start = Instant::now();

    if let Some(ref metrics) = ctx.metrics {
        metrics.reconciliations.increment(1);
    }

    if !needs_finalizer_pass(&ent) {
        info!("Object is currently not managed by this controller. Skipping reconciliation");
        return Ok(Action::await_change());
    }

    let namespace = ent.namespace().unwrap_or_default();
    let name = ent.name_any();
    let api: Api<EnterpriseSearch> = Api::namespaced(ctx.client.inner().clone(), &namespace);

    let (context, ns, n) = (ctx.as_ref(), namespace.as_str(), name.as_str());
    let result = finalizer(&api, FINALIZER_NAME, ent.clone(), |event| async move {
        match event {
            FinalizerEvent::Apply(_) => reconcile_enterprise_search(context, ns, n).await,
            FinalizerEvent::Cleanup(_) => {
                on_delete(context, ns, n).await?;
                Ok(Action::await_change())
            }
        }
    })
    .await
    .map_err(|e| match e {
        kube::runtime::finalizer::Error::ApplyFailed(e)
        | kube::runtime::finalizer::Error::CleanupFailed(e) => e,
        other => OperatorError::ReconcileFailed(other.to_string()),
    });

    if let Some(ref metrics) = ctx.metrics {
        metrics.duration.record(start.elapsed().as_secs_f64());
    }

    match &result {
        Ok(_) => {
            ctx.error_counts.remove(&error_key(&ent));
        }
        Err(_) => {
            if let Some(ref metrics) = ctx.metrics {
                metrics.errors.increment(1);
            }
        }
    }
    result
}

/// False for unmanaged resources, which must not be written to.
///
/// A deleted unmanaged resource still carrying our finalizer goes through
/// cleanup so that the finalizer gets removed.
fn needs_finalizer_pass(ent: &EnterpriseSearch) -> bool {
    if !is_unmanaged(ent.metadata.annotations.as_ref()) {
        return true;
    }
    ent.metadata.deletion_timestamp.is_some() && ent.finalizers().iter().any(|f| f == FINALIZER_NAME)
}

/// Reconcile the resource named `namespace/name` against the API server
#[instrument(skip(ctx))]
pub async fn reconcile_enterprise_search<C: K8sClient>(
    ctx: &ControllerContext<C>,
    namespace: &str,
    name: &str,
) -> Result<Action> {
    let Some(mut ent) = ctx.client.get::<EnterpriseSearch>(namespace, name).await? else {
        debug!("EnterpriseSearch not found, releasing its resources");
        on_delete(ctx, namespace, name).await?;
        return Ok(Action::await_change());
    };

    if is_unmanaged(ent.metadata.annotations.as_ref()) {
        info!("Object is currently not managed by this controller. Skipping reconciliation");
        return Ok(Action::await_change());
    }

    // a lingering annotation is ignored once the reference is removed
    let association = AssociationConf::from_annotations(ent.metadata.annotations.as_ref())?
        .filter(|_| ent.es_ref().is_some());
    ctx.watches.watch_secrets(
        NamespacedName::new(namespace, name),
        referenced_secrets(&ent, association.as_ref()),
    );

    if ent.es_ref().is_some() && !association.as_ref().is_some_and(AssociationConf::is_configured) {
        info!("Elasticsearch association not established yet, skipping reconciliation");
        return Ok(Action::await_change());
    }

    if let Err(e) = validate(&ent) {
        warn!(error = %e, "Validation failed");
        ctx.client
            .publish_event(&ent, EventRecord::warning(e.event_reason(), e.to_string()))
            .await;
        return Err(e);
    }

    reconcile_service(&ctx.client, &ent).await?;

    let certificates = CertificatesReconciler {
        client: &ctx.client,
        owner: &ent,
        tls: &ent.spec.http.tls,
        name_prefix: name_prefix(name),
        labels: labels(name),
        service_name: http_service_name(name),
        ca_rotation: ctx.config.ca_rotation,
        cert_rotation: ctx.config.cert_rotation,
    }
    .reconcile()
    .await;
    let certificates = match certificates {
        Ok(certificates) => certificates,
        Err(e) => {
            ctx.client
                .publish_event(&ent, EventRecord::warning(e.event_reason(), e.to_string()))
                .await;
            return Err(e);
        }
    };

    if let Some(msg) = association.as_ref().map(|conf| delay_message(&ent, conf)).transpose()?.flatten() {
        info!("{msg}");
        ctx.client
            .publish_event(&ent, EventRecord::warning(EVENT_REASON_DELAYED, msg))
            .await;
        return Ok(Action::await_change());
    }

    let rendered = reconcile_config(&ctx.client, &ent, association.as_ref(), ctx.config.ip_family).await?;

    VersionUpgrade {
        client: &ctx.client,
        read_only: ctx.read_only.as_ref(),
        association: association.as_ref(),
    }
    .handle(&mut ent)
    .await?;

    let config_hash = config_fingerprint(&ctx.client, &ent, &rendered, association.as_ref()).await?;
    let deployment = reconcile_deployment(
        &ctx.client,
        DeploymentParams {
            ent: &ent,
            config_hash: &config_hash,
            association: association.as_ref(),
        },
    )
    .await?;

    let status = update_status(&ctx.client, &ent, &deployment).await?;
    debug!(health = ?status.health, available = status.available_nodes, "Reconciled");

    let default = Duration::from_secs(DEFAULT_REQUEUE_SECONDS);
    Ok(Action::requeue(
        certificates.requeue_after.map_or(default, |hint| hint.min(default)),
    ))
}

/// Release everything tracked for a deleted resource
pub async fn on_delete<C: K8sClient>(ctx: &ControllerContext<C>, namespace: &str, name: &str) -> Result<()> {
    ctx.watches.remove(&NamespacedName::new(namespace, name));
    garbage_collect_soft_owned_secrets(&ctx.client, namespace, name, &EnterpriseSearch::kind(&())).await
}

/// Structural checks, the same ones run at admission
pub fn validate(ent: &EnterpriseSearch) -> Result<()> {
    let mut errors = match ent.spec.validate() {
        Ok(()) => vec![],
        Err(e) => from_validator(&e),
    };
    errors.extend(check_name_length(&ent.name_any()));
    errors.extend(check_supported_version(&ent.spec.version, &SUPPORTED_VERSIONS));
    errors.extend(check_no_downgrade(
        ent.metadata.annotations.as_ref(),
        ent.status.as_ref().and_then(|s| s.version.as_deref()),
        &ent.spec.version,
    ));
    errors.extend(check_no_unknown_fields(ent.metadata.annotations.as_ref(), &ent.spec));
    if let Some(Err(msg)) = ent.spec.elasticsearch_ref.as_ref().map(|r| r.validate()) {
        errors.push(FieldError::new("spec.elasticsearchRef", msg));
    }
    into_result(errors)
}

/// Secrets the resource reads without owning them
fn referenced_secrets(ent: &EnterpriseSearch, association: Option<&AssociationConf>) -> BTreeSet<NamespacedName> {
    let namespace = ent.namespace().unwrap_or_default();
    let mut secrets: BTreeSet<_> = ent
        .spec
        .config_ref
        .iter()
        .map(|source| NamespacedName::new(&namespace, &source.secret_name))
        .collect();
    if let Some(secret) = ent.spec.http.tls.user_certificate_secret() {
        secrets.insert(NamespacedName::new(&namespace, secret));
    }
    if let Some(conf) = association {
        if conf.auth_is_configured() {
            secrets.insert(NamespacedName::new(&namespace, &conf.auth_secret_name));
        }
        if conf.ca_cert_provided && !conf.ca_secret_name.is_empty() {
            secrets.insert(NamespacedName::new(&namespace, &conf.ca_secret_name));
        }
    }
    secrets
}

/// Enterprise Search may not run ahead of the Elasticsearch it connects to
fn delay_message(ent: &EnterpriseSearch, conf: &AssociationConf) -> Result<Option<String>> {
    if conf.version.is_empty() {
        return Ok(None);
    }
    let desired = version::parse(&ent.spec.version)?;
    let referenced = version::parse(&conf.version)?;
    if compatible_with_reference(&desired, &referenced) {
        return Ok(None);
    }
    Ok(Some(format!(
        "Delaying deployment of version {desired} since the referenced Elasticsearch is not upgraded yet (version {referenced})"
    )))
}

async fn config_fingerprint<C: K8sClient>(
    client: &C,
    ent: &EnterpriseSearch,
    rendered: &RenderedConfig,
    association: Option<&AssociationConf>,
) -> Result<String> {
    let namespace = ent.namespace().unwrap_or_default();
    let http_certificate = if ent.spec.http.tls.enabled() {
        let secret: Option<Secret> = client
            .get(&namespace, &internal_certs_secret_name(&name_prefix(&ent.name_any())))
            .await?;
        secret
            .and_then(|s| s.data)
            .and_then(|mut data| data.remove(CERT_FILE_NAME))
            .map(|cert| cert.0)
    } else {
        None
    };
    let association_cas: Vec<Vec<u8>> = match association {
        Some(conf) => association::ca_certificate(client, &namespace, conf)
            .await?
            .into_iter()
            .collect(),
        None => vec![],
    };

    let mut inputs = FingerprintInputs::new(rendered);
    inputs.http_certificate = http_certificate.as_deref();
    inputs.association_cas = &association_cas;
    Ok(fingerprint(&inputs))
}

fn error_key(ent: &EnterpriseSearch) -> String {
    format!("{}/{}", ent.namespace().unwrap_or_default(), ent.name_any())
}

fn error_policy<C: K8sClient>(
    ent: Arc<EnterpriseSearch>,
    error: &OperatorError,
    ctx: Arc<ControllerContext<C>>,
) -> Action {
    requeue_after_error(&ctx.error_counts, error_key(&ent), error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::association::ES_ASSOCIATION_CONF_ANNOTATION;
    use crate::crd::common::{DeploymentHealth, MANAGED_ANNOTATION, ObjectSelector};
    use crate::enterprisesearch::read_only::fake::FakeReadOnlyModeClient;
    use crate::enterprisesearch::test_fixtures::{
        associated, association_conf, auth_secret, enterprise_search,
    };
    use crate::enterprisesearch::{
        config_secret_name, deployment_name, CONFIG_HASH_LABEL, READ_ONLY_ANNOTATION, VERSION_LABEL,
    };
    use crate::k8s::fake::{FakeClient, Verb};
    use crate::reconciler::soft_owner_labels;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn context() -> (ControllerContext<FakeClient>, Arc<FakeReadOnlyModeClient>) {
        let read_only = Arc::new(FakeReadOnlyModeClient::default());
        let ctx = ControllerContext {
            client: FakeClient::new(),
            read_only: read_only.clone(),
            watches: Arc::new(DynamicWatches::new()),
            config: OperatorConfig::default(),
            metrics: None,
            error_counts: DashMap::new(),
        };
        (ctx, read_only)
    }

    fn running_pod(version: &str) -> Pod {
        let mut pod_labels = labels("ent");
        pod_labels.insert(VERSION_LABEL.to_string(), version.to_string());
        Pod {
            metadata: ObjectMeta {
                name: Some(format!("ent-ent-{version}")),
                namespace: Some("ns".to_string()),
                labels: Some(pod_labels),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn template_label(deployment: &Deployment, key: &str) -> Option<String> {
        deployment
            .spec
            .as_ref()?
            .template
            .metadata
            .as_ref()?
            .labels
            .as_ref()?
            .get(key)
            .cloned()
    }

    #[tokio::test]
    async fn test_reconcile_creates_resources() {
        let (ctx, _) = context();
        ctx.client.seed(auth_secret());
        ctx.client.seed(associated("8.15.0"));

        let action = reconcile_enterprise_search(&ctx, "ns", "ent").await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(DEFAULT_REQUEUE_SECONDS)));

        assert!(ctx.client.object::<Service>("ns", "ent-ent-http").is_some());
        assert!(ctx.client.object::<Secret>("ns", &config_secret_name("ent")).is_some());
        assert!(ctx
            .client
            .object::<Secret>("ns", &internal_certs_secret_name("ent-ent"))
            .is_some());

        let deployment = ctx.client.object::<Deployment>("ns", &deployment_name("ent")).unwrap();
        assert_eq!(template_label(&deployment, VERSION_LABEL).as_deref(), Some("8.15.0"));
        let hash = template_label(&deployment, CONFIG_HASH_LABEL).unwrap();
        assert!(hash.parse::<u32>().is_ok());

        let ent = ctx.client.object::<EnterpriseSearch>("ns", "ent").unwrap();
        let status = ent.status.unwrap();
        assert_eq!(status.health, DeploymentHealth::Red);
        assert_eq!(status.service.as_deref(), Some("ent-ent-http"));

        assert_eq!(
            ctx.watches.watched_secrets(&NamespacedName::new("ns", "ent")),
            BTreeSet::from([NamespacedName::new("ns", "ent-es-user")])
        );
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let (ctx, _) = context();
        ctx.client.seed(auth_secret());
        ctx.client.seed(associated("8.15.0"));

        reconcile_enterprise_search(&ctx, "ns", "ent").await.unwrap();
        let hash = template_label(
            &ctx.client.object::<Deployment>("ns", "ent-ent").unwrap(),
            CONFIG_HASH_LABEL,
        );
        ctx.client.clear_writes();

        reconcile_enterprise_search(&ctx, "ns", "ent").await.unwrap();
        assert!(ctx.client.writes().is_empty(), "unexpected writes: {:?}", ctx.client.writes());
        let again = template_label(
            &ctx.client.object::<Deployment>("ns", "ent-ent").unwrap(),
            CONFIG_HASH_LABEL,
        );
        assert_eq!(hash, again);
    }

    #[tokio::test]
    async fn test_unmanaged_is_skipped() {
        let (ctx, _) = context();
        let mut ent = enterprise_search("8.15.0");
        ent.metadata.annotations = Some(BTreeMap::from([(
            MANAGED_ANNOTATION.to_string(),
            "false".to_string(),
        )]));
        ctx.client.seed(ent);
        ctx.client.clear_writes();

        let action = reconcile_enterprise_search(&ctx, "ns", "ent").await.unwrap();
        assert_eq!(action, Action::await_change());
        assert!(ctx.client.writes().is_empty());
    }

    #[test]
    fn test_unmanaged_skips_finalizer() {
        let mut ent = enterprise_search("8.15.0");
        assert!(needs_finalizer_pass(&ent));

        ent.metadata.annotations = Some(BTreeMap::from([(
            MANAGED_ANNOTATION.to_string(),
            "false".to_string(),
        )]));
        assert!(!needs_finalizer_pass(&ent));

        ent.metadata.deletion_timestamp =
            Some(serde_json::from_value(serde_json::json!("2024-01-01T00:00:00Z")).unwrap());
        assert!(!needs_finalizer_pass(&ent));

        ent.metadata.finalizers = Some(vec![FINALIZER_NAME.to_string()]);
        assert!(needs_finalizer_pass(&ent));
    }

    #[tokio::test]
    async fn test_waits_for_association() {
        let (ctx, _) = context();
        let mut ent = enterprise_search("8.15.0");
        ent.spec.elasticsearch_ref = Some(ObjectSelector {
            name: Some("es".to_string()),
            ..Default::default()
        });
        ctx.client.seed(ent);
        ctx.client.clear_writes();

        let action = reconcile_enterprise_search(&ctx, "ns", "ent").await.unwrap();
        assert_eq!(action, Action::await_change());
        assert!(ctx.client.writes().is_empty());
    }

    #[tokio::test]
    async fn test_validation_failure_emits_event() {
        let (ctx, _) = context();
        ctx.client.seed(enterprise_search("6.8.0"));
        ctx.client.clear_writes();

        let err = reconcile_enterprise_search(&ctx, "ns", "ent").await.unwrap_err();
        assert!(matches!(err, OperatorError::ValidationError(_)));
        assert!(!err.is_retryable());
        assert!(ctx.client.writes().is_empty());

        let events = ctx.client.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reason, "Validation");
        assert!(events[0].warning);
    }

    #[test]
    fn test_validate() {
        let mut ent = enterprise_search("8.15.0");
        assert!(validate(&ent).is_ok());

        ent.spec.count = -1;
        assert!(validate(&ent).is_err());

        let mut ent = enterprise_search("8.15.0");
        ent.metadata.name = Some("a".repeat(37));
        assert!(validate(&ent).is_err());

        let mut ent = enterprise_search("8.14.0");
        ent.status = Some(crate::crd::enterprisesearch::v1::EnterpriseSearchStatus {
            version: Some("8.15.0".to_string()),
            ..Default::default()
        });
        assert!(validate(&ent).is_err());

        let mut ent = enterprise_search("8.15.0");
        ent.spec.elasticsearch_ref = Some(ObjectSelector {
            name: Some("es".to_string()),
            secret_name: Some("es-ref".to_string()),
            ..Default::default()
        });
        let err = validate(&ent).unwrap_err().to_string();
        assert!(err.contains("spec.elasticsearchRef"));
    }

    #[tokio::test]
    async fn test_delayed_until_elasticsearch_is_upgraded() {
        let (ctx, _) = context();
        ctx.client.seed(auth_secret());
        let mut ent = associated("8.15.0");
        let conf = AssociationConf {
            version: "8.14.3".to_string(),
            ..association_conf()
        };
        ent.annotations_mut().insert(
            ES_ASSOCIATION_CONF_ANNOTATION.to_string(),
            serde_json::to_string(&conf).unwrap(),
        );
        ctx.client.seed(ent);

        let action = reconcile_enterprise_search(&ctx, "ns", "ent").await.unwrap();
        assert_eq!(action, Action::await_change());
        assert!(ctx.client.object::<Deployment>("ns", "ent-ent").is_none());
        let events = ctx.client.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reason, EVENT_REASON_DELAYED);
    }

    #[tokio::test]
    async fn test_upgrade_enables_read_only_mode() {
        let (ctx, read_only) = context();
        ctx.client.seed(auth_secret());
        ctx.client.seed(associated("8.14.0"));
        reconcile_enterprise_search(&ctx, "ns", "ent").await.unwrap();
        ctx.client.seed(running_pod("8.14.0"));

        let mut ent = ctx.client.object::<EnterpriseSearch>("ns", "ent").unwrap();
        ent.spec.version = "8.15.0".to_string();
        ctx.client.update(&ent).await.unwrap();

        reconcile_enterprise_search(&ctx, "ns", "ent").await.unwrap();

        let requests = read_only.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].enabled);
        let ent = ctx.client.object::<EnterpriseSearch>("ns", "ent").unwrap();
        assert_eq!(ent.annotations().get(READ_ONLY_ANNOTATION).map(String::as_str), Some("true"));
        let deployment = ctx.client.object::<Deployment>("ns", "ent-ent").unwrap();
        assert_eq!(template_label(&deployment, VERSION_LABEL).as_deref(), Some("8.15.0"));
    }

    #[tokio::test]
    async fn test_deleted_resource_is_released() {
        let (ctx, _) = context();
        let ent = enterprise_search("8.15.0");
        let mut soft_owned = Secret {
            metadata: ObjectMeta {
                name: Some("ent-es-user".to_string()),
                namespace: Some("ns".to_string()),
                labels: Some(soft_owner_labels(&ent)),
                ..Default::default()
            },
            ..Default::default()
        };
        ctx.client.seed(soft_owned.clone());
        soft_owned.metadata.name = Some("unrelated".to_string());
        soft_owned.metadata.labels = None;
        ctx.client.seed(soft_owned);
        ctx.watches.watch_secrets(
            NamespacedName::new("ns", "ent"),
            BTreeSet::from([NamespacedName::new("ns", "ent-es-user")]),
        );

        let action = reconcile_enterprise_search(&ctx, "ns", "ent").await.unwrap();
        assert_eq!(action, Action::await_change());
        assert!(ctx.client.object::<Secret>("ns", "ent-es-user").is_none());
        assert!(ctx.client.object::<Secret>("ns", "unrelated").is_some());
        assert!(ctx.watches.watched_secrets(&NamespacedName::new("ns", "ent")).is_empty());
        assert_eq!(
            ctx.client.writes().iter().filter(|w| w.verb == Verb::Delete).count(),
            1
        );
    }

    #[test]
    fn test_secret_owners() {
        let watches = DynamicWatches::new();
        watches.watch_secrets(
            NamespacedName::new("ns", "ent"),
            BTreeSet::from([NamespacedName::new("ns", "shared")]),
        );
        let secret = |name: &str, generated_for: Option<&str>| Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns".to_string()),
                labels: generated_for.map(labels),
                ..Default::default()
            },
            ..Default::default()
        };

        let owners = secret_owners(&watches, &secret("shared", None));
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].name, "ent");
        assert_eq!(owners[0].namespace.as_deref(), Some("ns"));

        let owners = secret_owners(&watches, &secret("other-ent-config", Some("other")));
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].name, "other");

        assert!(secret_owners(&watches, &secret("unrelated", None)).is_empty());
    }

    #[test]
    fn test_error_policy_backs_off() {
        let (ctx, _) = context();
        let ctx = Arc::new(ctx);
        let ent = Arc::new(enterprise_search("8.15.0"));

        let action = error_policy(
            ent.clone(),
            &OperatorError::ValidationError("spec.version: bad".to_string()),
            ctx.clone(),
        );
        assert_eq!(action, Action::await_change());

        let action = error_policy(ent.clone(), &OperatorError::Timeout("read-only".to_string()), ctx.clone());
        assert_ne!(action, Action::await_change());
        assert_eq!(ctx.error_counts.get(&error_key(&ent)).map(|c| *c), Some(1));
    }
}
