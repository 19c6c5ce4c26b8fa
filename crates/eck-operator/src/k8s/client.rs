use super::{label_selector, EventRecord, K8sClient, ObjectKind, PdbApiVersion};
use crate::error::{is_not_found, Result};
use async_trait::async_trait;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::events::{Event, Recorder, Reporter};
use kube::Client;
use std::collections::BTreeMap;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

/// [`K8sClient`] backed by the API server
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
    reporter: Reporter,
    pdb_version: std::sync::Arc<OnceCell<PdbApiVersion>>,
}

impl KubeClient {
    pub fn new(client: Client, controller_name: &str) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: controller_name.to_string(),
                instance: std::env::var("POD_NAME").ok(),
            },
            pdb_version: Default::default(),
        }
    }

    pub fn inner(&self) -> &Client {
        &self.client
    }

    fn api<K: ObjectKind>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl K8sClient for KubeClient {
    async fn get<K: ObjectKind>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        Ok(self.api::<K>(namespace).get_opt(name).await?)
    }

    async fn list<K: ObjectKind>(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<K>> {
        let params = ListParams::default().labels(&label_selector(labels));
        Ok(self.api::<K>(namespace).list(&params).await?.items)
    }

    async fn create<K: ObjectKind>(&self, obj: &K) -> Result<K> {
        let namespace = obj.meta().namespace.clone().unwrap_or_default();
        debug!(kind = %K::kind(&()), name = ?obj.meta().name, namespace = %namespace, "Creating resource");
        Ok(self
            .api::<K>(&namespace)
            .create(&PostParams::default(), obj)
            .await?)
    }

    async fn update<K: ObjectKind>(&self, obj: &K) -> Result<K> {
        let namespace = obj.meta().namespace.clone().unwrap_or_default();
        let name = obj.meta().name.clone().unwrap_or_default();
        debug!(kind = %K::kind(&()), name = %name, namespace = %namespace, "Updating resource");
        Ok(self
            .api::<K>(&namespace)
            .replace(&name, &PostParams::default(), obj)
            .await?)
    }

    async fn delete<K: ObjectKind>(&self, namespace: &str, name: &str) -> Result<()> {
        debug!(kind = %K::kind(&()), name = %name, namespace = %namespace, "Deleting resource");
        match self
            .api::<K>(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_status<K: ObjectKind>(&self, obj: &K) -> Result<()> {
        let namespace = obj.meta().namespace.clone().unwrap_or_default();
        let name = obj.meta().name.clone().unwrap_or_default();
        let status = serde_json::to_value(obj)?
            .get("status")
            .cloned()
            .unwrap_or_default();
        self.api::<K>(&namespace)
            .patch_status(
                &name,
                &PatchParams::default(),
                &Patch::Merge(serde_json::json!({ "status": status })),
            )
            .await?;
        Ok(())
    }

    async fn publish_event<K: ObjectKind>(&self, obj: &K, event: EventRecord) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone());
        let result = recorder
            .publish(
                &Event {
                    type_: event.type_,
                    reason: event.reason,
                    note: Some(event.note),
                    action: event.action,
                    secondary: None,
                },
                &obj.object_ref(&()),
            )
            .await;
        if let Err(e) = result {
            warn!(error = %e, "Failed to publish event");
        }
    }

    async fn pdb_api_version(&self) -> Result<PdbApiVersion> {
        let version = self
            .pdb_version
            .get_or_try_init(|| async {
                let group = kube::discovery::group(&self.client, "policy").await?;
                let version = match group.preferred_version_or_latest() {
                    "v1beta1" => PdbApiVersion::V1Beta1,
                    _ => PdbApiVersion::V1,
                };
                debug!(?version, "Resolved PodDisruptionBudget API version");
                Ok::<_, kube::Error>(version)
            })
            .await?;
        Ok(*version)
    }
}
