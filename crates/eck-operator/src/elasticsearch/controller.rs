//! Elasticsearch controller
//!
//! Keeps the PodDisruptionBudgets of every Elasticsearch cluster in line with
//! its realized StatefulSets and its health.

use super::pdb::{self, PodDisruptionBudgetV1Beta1};
use super::RealizedStatefulSet;
use crate::controller::{requeue_after_error, scoped_api, DEFAULT_REQUEUE_SECONDS};
use crate::crd::common::is_unmanaged;
use crate::crd::elasticsearch::Elasticsearch;
use crate::error::Result;
use crate::k8s::{K8sClient, KubeClient, PdbApiVersion};
use crate::labels::CLUSTER_NAME_LABEL;
use crate::license::LicenseChecker;
use crate::metrics::ControllerMetrics;
use dashmap::DashMap;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument};

/// Name used for events and metrics
pub const CONTROLLER_NAME: &str = "elasticsearch";

/// Context passed to the controller
pub struct ControllerContext<C> {
    pub client: C,
    pub license: Arc<dyn LicenseChecker>,
    /// Metrics recorder (optional)
    pub metrics: Option<ControllerMetrics>,
    /// Per-cluster error retry counts for exponential backoff
    pub error_counts: DashMap<String, u32>,
}

/// Start the Elasticsearch controller
pub async fn run_controller(
    client: KubeClient,
    license: Arc<dyn LicenseChecker>,
    namespace: Option<String>,
) -> Result<()> {
    let kube_client = client.inner().clone();
    let clusters = scoped_api::<Elasticsearch>(&kube_client, namespace.as_deref());
    let statefulsets = scoped_api::<StatefulSet>(&kube_client, namespace.as_deref());
    let pdb_version = client.pdb_api_version().await?;

    info!(
        namespace = namespace.as_deref().unwrap_or("all"),
        pdb_api_version = ?pdb_version,
        "Starting Elasticsearch controller"
    );

    let ctx = Arc::new(ControllerContext {
        client,
        license,
        metrics: Some(ControllerMetrics::new(CONTROLLER_NAME)),
        error_counts: DashMap::new(),
    });

    let controller = Controller::new(clusters, Config::default());
    let controller = match pdb_version {
        PdbApiVersion::V1 => controller.owns(
            scoped_api::<PodDisruptionBudget>(&kube_client, namespace.as_deref()),
            Config::default(),
        ),
        PdbApiVersion::V1Beta1 => controller.owns(
            scoped_api::<PodDisruptionBudgetV1Beta1>(&kube_client, namespace.as_deref()),
            Config::default(),
        ),
    };

    controller
        .watches(
            statefulsets,
            Config::default().labels(CLUSTER_NAME_LABEL),
            |sset| {
                let cluster = sset.labels().get(CLUSTER_NAME_LABEL)?.clone();
                let namespace = sset.namespace()?;
                Some(ObjectRef::<Elasticsearch>::new(&cluster).within(&namespace))
            },
        )
        .run(reconcile::<KubeClient>, error_policy::<KubeClient>, ctx)
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

/// Main reconciliation function
#[instrument(skip(es, ctx), fields(name = %es.name_any(), namespace = es.namespace()))]
pub async fn reconcile<C: K8sClient>(
    es: Arc<Elasticsearch>,
    ctx: Arc<ControllerContext<C>>,
) -> Result<Action> {
    let start = Instant::now();

    if let Some(ref metrics) = ctx.metrics {
        metrics.reconciliations.increment(1);
    }

    let result = reconcile_cluster(&es, &ctx).await;

    if let Some(ref metrics) = ctx.metrics {
        metrics.duration.record(start.elapsed().as_secs_f64());
    }

    match &result {
        Ok(_) => {
            ctx.error_counts.remove(&error_key(&es));
        }
        Err(_) => {
            if let Some(ref metrics) = ctx.metrics {
                metrics.errors.increment(1);
            }
        }
    }
    result
}

async fn reconcile_cluster<C: K8sClient>(
    es: &Elasticsearch,
    ctx: &ControllerContext<C>,
) -> Result<Action> {
    if is_unmanaged(es.metadata.annotations.as_ref()) {
        info!("Object is currently not managed by this controller. Skipping reconciliation");
        return Ok(Action::await_change());
    }

    let namespace = es.namespace().unwrap_or_default();
    let selector = BTreeMap::from([(CLUSTER_NAME_LABEL.to_string(), es.name_any())]);
    let statefulsets: Vec<RealizedStatefulSet> = ctx
        .client
        .list::<StatefulSet>(&namespace, &selector)
        .await?
        .iter()
        .map(RealizedStatefulSet::from_statefulset)
        .collect();

    debug!(statefulsets = statefulsets.len(), health = ?es.health(), "Reconciling PodDisruptionBudgets");
    pdb::reconcile(&ctx.client, ctx.license.as_ref(), es, &statefulsets).await?;

    Ok(Action::requeue(Duration::from_secs(DEFAULT_REQUEUE_SECONDS)))
}

fn error_key(es: &Elasticsearch) -> String {
    format!("{}/{}", es.namespace().unwrap_or_default(), es.name_any())
}

fn error_policy<C: K8sClient>(
    es: Arc<Elasticsearch>,
    error: &crate::error::OperatorError,
    ctx: Arc<ControllerContext<C>>,
) -> Action {
    requeue_after_error(&ctx.error_counts, error_key(&es), error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::common::MANAGED_ANNOTATION;
    use crate::crd::elasticsearch::{ElasticsearchHealth, NodeRole};
    use crate::elasticsearch::test_fixtures::{cluster, statefulset};
    use crate::k8s::fake::FakeClient;
    use crate::license::StaticLicenseChecker;
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

    fn context(licensed: bool) -> Arc<ControllerContext<FakeClient>> {
        Arc::new(ControllerContext {
            client: FakeClient::new(),
            license: Arc::new(StaticLicenseChecker(licensed)),
            metrics: None,
            error_counts: DashMap::new(),
        })
    }

    #[tokio::test]
    async fn test_reconcile_reads_realized_statefulsets() {
        let ctx = context(false);
        let es = ctx.client.seed(cluster(ElasticsearchHealth::Green));
        ctx.client
            .seed(statefulset("master-data", 3, &[NodeRole::Master, NodeRole::Data]));

        let action = reconcile(Arc::new(es), ctx.clone()).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(DEFAULT_REQUEUE_SECONDS)));

        let pdb = ctx
            .client
            .object::<PodDisruptionBudget>("ns", "cluster-es-default")
            .unwrap();
        assert_eq!(pdb.spec.unwrap().min_available, Some(IntOrString::Int(2)));
    }

    #[tokio::test]
    async fn test_unmanaged_cluster_is_skipped() {
        let ctx = context(true);
        let mut es = cluster(ElasticsearchHealth::Green);
        es.metadata.annotations = Some(BTreeMap::from([(
            MANAGED_ANNOTATION.to_string(),
            "false".to_string(),
        )]));
        let es = ctx.client.seed(es);
        ctx.client.clear_writes();

        let action = reconcile(Arc::new(es), ctx.clone()).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert!(ctx.client.writes().is_empty());
    }

    #[tokio::test]
    async fn test_error_resets_after_success() {
        let ctx = context(false);
        let es = Arc::new(ctx.client.seed(cluster(ElasticsearchHealth::Green)));
        ctx.error_counts.insert(error_key(&es), 3);

        reconcile(es.clone(), ctx.clone()).await.unwrap();
        assert!(ctx.error_counts.get(&error_key(&es)).is_none());
    }
}
