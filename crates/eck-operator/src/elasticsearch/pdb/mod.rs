//! PodDisruptionBudget planner
//!
//! Without an enterprise license a single budget covers the whole cluster and
//! its `minAvailable` follows the node count. With one, StatefulSets are
//! grouped by the roles they share and each group gets its own budget whose
//! `maxUnavailable` depends on how critical the group is to cluster health.
//!
//! Budgets are written with the newest `policy` API version the cluster
//! serves, see [`PdbResource`].

mod default;
mod roles;

pub use default::{allowed_disruptions_for_single_pdb, expected_default_pdb};
pub use roles::{allowed_disruptions_for_role, expected_role_pdbs, group_by_shared_roles, RoleGroup};

use super::{default_pdb_name, RealizedStatefulSet};
use crate::crd::elasticsearch::{Elasticsearch, PdbTemplateMode};
use crate::error::{OperatorError, Result};
use crate::k8s::{K8sClient, ObjectKind, PdbApiVersion};
use crate::labels::CLUSTER_NAME_LABEL;
use crate::license::LicenseChecker;
use crate::reconciler::{is_owned_by, reconcile_with_hash};
use k8s_openapi::api::policy::v1::{
    PodDisruptionBudget, PodDisruptionBudgetSpec, PodDisruptionBudgetStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// `policy/v1beta1` PodDisruptionBudget, served by clusters older than 1.21.
///
/// The spec is shared with `policy/v1`: the fields the operator sets did not
/// change between the two versions.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct PodDisruptionBudgetV1Beta1 {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: Option<PodDisruptionBudgetSpec>,
    #[serde(default)]
    pub status: Option<PodDisruptionBudgetStatus>,
}

impl k8s_openapi::Resource for PodDisruptionBudgetV1Beta1 {
    const API_VERSION: &'static str = "policy/v1beta1";
    const GROUP: &'static str = "policy";
    const KIND: &'static str = "PodDisruptionBudget";
    const VERSION: &'static str = "v1beta1";
    const URL_PATH_SEGMENT: &'static str = "poddisruptionbudgets";
    type Scope = k8s_openapi::NamespaceResourceScope;
}

impl k8s_openapi::Metadata for PodDisruptionBudgetV1Beta1 {
    type Ty = ObjectMeta;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl Serialize for PodDisruptionBudgetV1Beta1 {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let fields = 3 + usize::from(self.spec.is_some()) + usize::from(self.status.is_some());
        let mut state = serializer.serialize_struct("PodDisruptionBudget", fields)?;
        state.serialize_field(
            "apiVersion",
            <Self as k8s_openapi::Resource>::API_VERSION,
        )?;
        state.serialize_field("kind", <Self as k8s_openapi::Resource>::KIND)?;
        state.serialize_field("metadata", &self.metadata)?;
        if let Some(spec) = &self.spec {
            state.serialize_field("spec", spec)?;
        }
        if let Some(status) = &self.status {
            state.serialize_field("status", status)?;
        }
        state.end()
    }
}

/// A PodDisruptionBudget type the planner can write
pub trait PdbResource: ObjectKind {
    /// Convert the planned `policy/v1` object
    fn from_v1(pdb: PodDisruptionBudget) -> Self;
}

impl PdbResource for PodDisruptionBudget {
    fn from_v1(pdb: PodDisruptionBudget) -> Self {
        pdb
    }
}

impl PdbResource for PodDisruptionBudgetV1Beta1 {
    fn from_v1(pdb: PodDisruptionBudget) -> Self {
        Self {
            metadata: pdb.metadata,
            spec: pdb.spec,
            status: None,
        }
    }
}

/// Reconcile the PodDisruptionBudgets of `es`
pub async fn reconcile<C, L>(
    client: &C,
    license: &L,
    es: &Elasticsearch,
    statefulsets: &[RealizedStatefulSet],
) -> Result<()>
where
    C: K8sClient,
    L: LicenseChecker + ?Sized,
{
    match client.pdb_api_version().await? {
        PdbApiVersion::V1 => {
            reconcile_as::<C, L, PodDisruptionBudget>(client, license, es, statefulsets).await
        }
        PdbApiVersion::V1Beta1 => {
            reconcile_as::<C, L, PodDisruptionBudgetV1Beta1>(client, license, es, statefulsets)
                .await
        }
    }
}

async fn reconcile_as<C, L, P>(
    client: &C,
    license: &L,
    es: &Elasticsearch,
    statefulsets: &[RealizedStatefulSet],
) -> Result<()>
where
    C: K8sClient,
    L: LicenseChecker + ?Sized,
    P: PdbResource,
{
    match es.spec.pdb_mode() {
        PdbTemplateMode::Disabled => {
            debug!("PodDisruptionBudgets disabled, removing existing ones");
            delete_default_pdb::<C, P>(client, es).await?;
            delete_role_specific_pdbs::<C, P>(client, es).await
        }
        PdbTemplateMode::Custom(template) => {
            delete_role_specific_pdbs::<C, P>(client, es).await?;
            let expected = expected_default_pdb(es, statefulsets, Some(template));
            reconcile_pdb::<C, P>(client, es, expected).await
        }
        PdbTemplateMode::Default => {
            let enterprise = license
                .enterprise_features_enabled()
                .await
                .map_err(|e| {
                    if matches!(e, OperatorError::License(_)) {
                        e
                    } else {
                        OperatorError::License(e.to_string())
                    }
                })?;
            if enterprise {
                reconcile_role_specific_pdbs::<C, P>(client, es, statefulsets).await
            } else {
                delete_role_specific_pdbs::<C, P>(client, es).await?;
                let expected = expected_default_pdb(es, statefulsets, None);
                reconcile_pdb::<C, P>(client, es, expected).await
            }
        }
    }
}

async fn reconcile_role_specific_pdbs<C, P>(
    client: &C,
    es: &Elasticsearch,
    statefulsets: &[RealizedStatefulSet],
) -> Result<()>
where
    C: K8sClient,
    P: PdbResource,
{
    let expected = expected_role_pdbs(es, statefulsets);
    let mut unexpected: BTreeMap<String, P> = list_role_specific_pdbs::<C, P>(client, es)
        .await?
        .into_iter()
        .map(|pdb| (pdb.name_any(), pdb))
        .collect();

    for pdb in expected {
        unexpected.remove(pdb.metadata.name.as_deref().unwrap_or_default());
        reconcile_pdb::<C, P>(client, es, pdb).await?;
    }

    let namespace = es.namespace().unwrap_or_default();
    for name in unexpected.keys() {
        info!(name = %name, namespace = %namespace, "Deleting PodDisruptionBudget no longer needed");
        client.delete::<P>(&namespace, name).await?;
    }

    delete_default_pdb::<C, P>(client, es).await
}

async fn reconcile_pdb<C, P>(client: &C, es: &Elasticsearch, expected: PodDisruptionBudget) -> Result<()>
where
    C: K8sClient,
    P: PdbResource,
{
    reconcile_with_hash(client, P::from_v1(expected), es).await?;
    Ok(())
}

async fn delete_default_pdb<C, P>(client: &C, es: &Elasticsearch) -> Result<()>
where
    C: K8sClient,
    P: PdbResource,
{
    let namespace = es.namespace().unwrap_or_default();
    let name = default_pdb_name(&es.name_any());
    if client.get::<P>(&namespace, &name).await?.is_some() {
        info!(name = %name, namespace = %namespace, "Deleting default PodDisruptionBudget");
        client.delete::<P>(&namespace, &name).await?;
    }
    Ok(())
}

/// Budgets labelled with the cluster and controlled by it, the default one excluded
async fn list_role_specific_pdbs<C, P>(client: &C, es: &Elasticsearch) -> Result<Vec<P>>
where
    C: K8sClient,
    P: PdbResource,
{
    let namespace = es.namespace().unwrap_or_default();
    let default_name = default_pdb_name(&es.name_any());
    let selector = BTreeMap::from([(CLUSTER_NAME_LABEL.to_string(), es.name_any())]);
    Ok(client
        .list::<P>(&namespace, &selector)
        .await?
        .into_iter()
        .filter(|pdb| is_owned_by(pdb, es) && pdb.name_any() != default_name)
        .collect())
}

async fn delete_role_specific_pdbs<C, P>(client: &C, es: &Elasticsearch) -> Result<()>
where
    C: K8sClient,
    P: PdbResource,
{
    let namespace = es.namespace().unwrap_or_default();
    for pdb in list_role_specific_pdbs::<C, P>(client, es).await? {
        let name = pdb.name_any();
        info!(name = %name, namespace = %namespace, "Deleting role-specific PodDisruptionBudget");
        client.delete::<P>(&namespace, &name).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::elasticsearch::{ElasticsearchHealth, NodeRole};
    use crate::elasticsearch::role_pdb_name;
    use crate::elasticsearch::test_fixtures::cluster;
    use crate::hash::TEMPLATE_HASH_LABEL;
    use crate::k8s::fake::{FakeClient, Verb};
    use crate::license::StaticLicenseChecker;
    use async_trait::async_trait;
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
    use serde_json::json;

    fn master_data(replicas: i32) -> Vec<RealizedStatefulSet> {
        vec![RealizedStatefulSet::new(
            "master-data",
            replicas,
            [NodeRole::Master, NodeRole::Data],
        )]
    }

    fn pdb_names(client: &FakeClient) -> Vec<String> {
        client
            .objects::<PodDisruptionBudget>("ns")
            .iter()
            .map(|p| p.name_any())
            .collect()
    }

    struct FailingLicenseChecker;

    #[async_trait]
    impl LicenseChecker for FailingLicenseChecker {
        async fn enterprise_features_enabled(&self) -> Result<bool> {
            Err(OperatorError::License("secrets unreadable".to_string()))
        }
    }

    #[tokio::test]
    async fn test_default_pdb_green() {
        let client = FakeClient::new();
        let es = client.seed(cluster(ElasticsearchHealth::Green));

        reconcile(&client, &StaticLicenseChecker(false), &es, &master_data(3))
            .await
            .unwrap();

        let pdb = client
            .object::<PodDisruptionBudget>("ns", "cluster-es-default")
            .unwrap();
        let spec = pdb.spec.as_ref().unwrap();
        assert_eq!(spec.min_available, Some(IntOrString::Int(2)));
        assert_eq!(spec.max_unavailable, None);
        assert_eq!(
            spec.selector.as_ref().unwrap().match_labels,
            Some(BTreeMap::from([(
                CLUSTER_NAME_LABEL.to_string(),
                "cluster".to_string()
            )]))
        );
        let labels = pdb.labels();
        assert_eq!(labels[CLUSTER_NAME_LABEL], "cluster");
        assert!(labels.contains_key(TEMPLATE_HASH_LABEL));
        assert!(is_owned_by(&pdb, &es));
    }

    #[tokio::test]
    async fn test_default_pdb_yellow() {
        let client = FakeClient::new();
        let es = client.seed(cluster(ElasticsearchHealth::Yellow));

        reconcile(&client, &StaticLicenseChecker(false), &es, &master_data(3))
            .await
            .unwrap();

        let pdb = client
            .object::<PodDisruptionBudget>("ns", "cluster-es-default")
            .unwrap();
        assert_eq!(
            pdb.spec.unwrap().min_available,
            Some(IntOrString::Int(3))
        );
    }

    #[tokio::test]
    async fn test_role_specific_pdbs_with_license() {
        let client = FakeClient::new();
        let es = client.seed(cluster(ElasticsearchHealth::Green));
        let ssets = vec![
            RealizedStatefulSet::new("master-data1", 2, [NodeRole::Master, NodeRole::Data]),
            RealizedStatefulSet::new("data2", 2, [NodeRole::DataHot]),
        ];

        reconcile(&client, &StaticLicenseChecker(true), &es, &ssets)
            .await
            .unwrap();

        assert_eq!(pdb_names(&client), vec!["cluster-es-default-data"]);
        let pdb = client
            .object::<PodDisruptionBudget>("ns", "cluster-es-default-data")
            .unwrap();
        let spec = pdb.spec.unwrap();
        assert_eq!(spec.max_unavailable, Some(IntOrString::Int(1)));
        assert_eq!(spec.min_available, None);
        let expressions = spec.selector.unwrap().match_expressions.unwrap();
        assert_eq!(expressions[1].values, Some(vec!["data2".to_string(), "master-data1".to_string()]));
    }

    #[tokio::test]
    async fn test_switching_modes_removes_obsolete_pdbs() {
        let client = FakeClient::new();
        let es = client.seed(cluster(ElasticsearchHealth::Green));
        let ssets = vec![
            RealizedStatefulSet::new("masters", 3, [NodeRole::Master]),
            RealizedStatefulSet::new("data", 3, [NodeRole::Data]),
        ];

        reconcile(&client, &StaticLicenseChecker(false), &es, &ssets)
            .await
            .unwrap();
        assert_eq!(pdb_names(&client), vec!["cluster-es-default"]);

        reconcile(&client, &StaticLicenseChecker(true), &es, &ssets)
            .await
            .unwrap();
        assert_eq!(
            pdb_names(&client),
            vec![
                role_pdb_name("cluster", NodeRole::Data),
                role_pdb_name("cluster", NodeRole::Master),
            ]
        );

        // a node set goes away
        reconcile(&client, &StaticLicenseChecker(true), &es, &ssets[1..])
            .await
            .unwrap();
        assert_eq!(pdb_names(&client), vec![role_pdb_name("cluster", NodeRole::Data)]);

        reconcile(&client, &StaticLicenseChecker(false), &es, &ssets)
            .await
            .unwrap();
        assert_eq!(pdb_names(&client), vec!["cluster-es-default"]);
    }

    #[tokio::test]
    async fn test_disabled_template_deletes_everything() {
        let client = FakeClient::new();
        let mut es = client.seed(cluster(ElasticsearchHealth::Green));
        let ssets = master_data(3);

        reconcile(&client, &StaticLicenseChecker(true), &es, &ssets)
            .await
            .unwrap();
        assert_eq!(pdb_names(&client).len(), 1);

        es.spec.pod_disruption_budget = Some(serde_json::from_value(json!({})).unwrap());
        reconcile(&client, &StaticLicenseChecker(true), &es, &ssets)
            .await
            .unwrap();
        assert!(pdb_names(&client).is_empty());
    }

    #[tokio::test]
    async fn test_custom_template_used_verbatim() {
        let client = FakeClient::new();
        let mut es = client.seed(cluster(ElasticsearchHealth::Red));
        es.spec.pod_disruption_budget = Some(
            serde_json::from_value(json!({
                "metadata": {"labels": {"team": "search"}},
                "spec": {"maxUnavailable": 2, "selector": {"matchLabels": {"custom": "true"}}}
            }))
            .unwrap(),
        );

        // the license is not consulted for customized templates
        reconcile(&client, &FailingLicenseChecker, &es, &master_data(3))
            .await
            .unwrap();

        let pdb = client
            .object::<PodDisruptionBudget>("ns", "cluster-es-default")
            .unwrap();
        assert_eq!(pdb.labels()["team"], "search");
        assert_eq!(pdb.labels()[CLUSTER_NAME_LABEL], "cluster");
        let spec = pdb.spec.unwrap();
        assert_eq!(spec.max_unavailable, Some(IntOrString::Int(2)));
        assert_eq!(spec.min_available, None);
    }

    #[tokio::test]
    async fn test_license_failure_fails_reconciliation() {
        let client = FakeClient::new();
        let es = client.seed(cluster(ElasticsearchHealth::Green));

        let err = reconcile(&client, &FailingLicenseChecker, &es, &master_data(3))
            .await
            .unwrap_err();
        assert!(matches!(err, OperatorError::License(_)));
        assert!(client.writes().is_empty());
    }

    #[tokio::test]
    async fn test_second_reconciliation_is_a_noop() {
        let client = FakeClient::new();
        let es = client.seed(cluster(ElasticsearchHealth::Green));
        let ssets = vec![
            RealizedStatefulSet::new("masters", 3, [NodeRole::Master]),
            RealizedStatefulSet::new("hot", 3, [NodeRole::DataHot, NodeRole::Ingest]),
            RealizedStatefulSet::new("ml", 1, [NodeRole::Ml]),
        ];

        for licensed in [false, true] {
            let license = StaticLicenseChecker(licensed);
            reconcile(&client, &license, &es, &ssets).await.unwrap();
            client.clear_writes();
            reconcile(&client, &license, &es, &ssets).await.unwrap();
            assert!(client.writes().is_empty(), "licensed={licensed}");
        }
    }

    #[tokio::test]
    async fn test_health_change_updates_pdb() {
        let client = FakeClient::new();
        let mut es = client.seed(cluster(ElasticsearchHealth::Green));
        let ssets = master_data(3);

        reconcile(&client, &StaticLicenseChecker(false), &es, &ssets)
            .await
            .unwrap();
        client.clear_writes();

        es.status.as_mut().unwrap().health = ElasticsearchHealth::Yellow;
        reconcile(&client, &StaticLicenseChecker(false), &es, &ssets)
            .await
            .unwrap();

        let writes = client.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].verb, Verb::Update);
    }

    #[tokio::test]
    async fn test_unowned_pdbs_are_left_alone() {
        let client = FakeClient::new();
        let es = client.seed(cluster(ElasticsearchHealth::Green));
        client.seed(PodDisruptionBudget {
            metadata: ObjectMeta {
                name: Some("user-pdb".to_string()),
                namespace: Some("ns".to_string()),
                labels: Some(BTreeMap::from([(
                    CLUSTER_NAME_LABEL.to_string(),
                    "cluster".to_string(),
                )])),
                ..Default::default()
            },
            ..Default::default()
        });

        reconcile(&client, &StaticLicenseChecker(true), &es, &master_data(3))
            .await
            .unwrap();
        assert_eq!(
            pdb_names(&client),
            vec!["cluster-es-default-data".to_string(), "user-pdb".to_string()]
        );
    }

    #[tokio::test]
    async fn test_v1beta1_api() {
        let client = FakeClient::with_pdb_version(PdbApiVersion::V1Beta1);
        let es = client.seed(cluster(ElasticsearchHealth::Green));

        reconcile(&client, &StaticLicenseChecker(false), &es, &master_data(3))
            .await
            .unwrap();

        let pdb = client
            .object::<PodDisruptionBudgetV1Beta1>("ns", "cluster-es-default")
            .unwrap();
        assert_eq!(
            pdb.spec.unwrap().min_available,
            Some(IntOrString::Int(2))
        );
        let raw = serde_json::to_value(
            client
                .object::<PodDisruptionBudgetV1Beta1>("ns", "cluster-es-default")
                .unwrap(),
        )
        .unwrap();
        assert_eq!(raw["apiVersion"], "policy/v1beta1");
        assert_eq!(raw["kind"], "PodDisruptionBudget");
    }
}
