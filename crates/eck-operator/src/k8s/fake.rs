//! In-memory [`K8sClient`] for tests

use super::{EventRecord, K8sClient, ObjectKind, PdbApiVersion};
use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use kube::core::ErrorResponse;
use kube::runtime::events::EventType;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Mutex;

type Key = (String, String, String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Create,
    Update,
    Delete,
    UpdateStatus,
}

/// A write observed by the fake API server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedWrite {
    pub verb: Verb,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct RecordedEvent {
    pub kind: String,
    pub name: String,
    pub warning: bool,
    pub reason: String,
    pub note: String,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, Value>,
    next_version: u64,
    writes: Vec<RecordedWrite>,
    events: Vec<RecordedEvent>,
}

/// Stores objects as JSON keyed by kind, namespace and name.
///
/// Updates must carry the current resourceVersion, like on a real API server.
pub struct FakeClient {
    state: Mutex<State>,
    pdb_version: PdbApiVersion,
}

impl Default for FakeClient {
    fn default() -> Self {
        Self::new()
    }
}

fn api_error(code: u16, reason: &str, message: String) -> OperatorError {
    OperatorError::KubeError(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    }))
}

fn key<K: ObjectKind>(namespace: &str, name: &str) -> Key {
    (K::kind(&()).to_string(), namespace.to_string(), name.to_string())
}

fn object_key<K: ObjectKind>(obj: &K) -> Key {
    key::<K>(
        obj.meta().namespace.as_deref().unwrap_or_default(),
        obj.meta().name.as_deref().unwrap_or_default(),
    )
}

fn decode<K: ObjectKind>(mut value: Value) -> Result<K> {
    value["apiVersion"] = Value::String(K::api_version(&()).to_string());
    value["kind"] = Value::String(K::kind(&()).to_string());
    Ok(serde_json::from_value(value)?)
}

fn labels_match(value: &Value, selector: &BTreeMap<String, String>) -> bool {
    let labels = &value["metadata"]["labels"];
    selector
        .iter()
        .all(|(k, v)| labels.get(k).and_then(Value::as_str) == Some(v.as_str()))
}

impl FakeClient {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            pdb_version: PdbApiVersion::V1,
        }
    }

    pub fn with_pdb_version(version: PdbApiVersion) -> Self {
        Self {
            state: Mutex::new(State::default()),
            pdb_version: version,
        }
    }

    /// Seed an object without recording a write
    pub fn seed<K: ObjectKind>(&self, obj: K) -> K {
        let mut state = self.state.lock().unwrap();
        let stored = Self::store(&mut state, obj).unwrap();
        decode(stored).unwrap()
    }

    /// Read an object without going through the trait
    pub fn object<K: ObjectKind>(&self, namespace: &str, name: &str) -> Option<K> {
        let state = self.state.lock().unwrap();
        state
            .objects
            .get(&key::<K>(namespace, name))
            .cloned()
            .map(|v| decode(v).unwrap())
    }

    pub fn objects<K: ObjectKind>(&self, namespace: &str) -> Vec<K> {
        let state = self.state.lock().unwrap();
        let kind = K::kind(&()).to_string();
        state
            .objects
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && ns == namespace)
            .map(|(_, v)| decode(v.clone()).unwrap())
            .collect()
    }

    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.state.lock().unwrap().writes.clear();
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.state.lock().unwrap().events.clone()
    }

    fn store<K: ObjectKind>(state: &mut State, obj: K) -> Result<Value> {
        let key = object_key(&obj);
        state.next_version += 1;
        let mut value = serde_json::to_value(&obj)?;
        value["metadata"]["resourceVersion"] = Value::String(state.next_version.to_string());
        if value["metadata"]["uid"].is_null() {
            value["metadata"]["uid"] = Value::String(format!("uid-{}", state.next_version));
        }
        state.objects.insert(key, value.clone());
        Ok(value)
    }

    fn record(state: &mut State, verb: Verb, key: &Key) {
        state.writes.push(RecordedWrite {
            verb,
            kind: key.0.clone(),
            namespace: key.1.clone(),
            name: key.2.clone(),
        });
    }
}

#[async_trait]
impl K8sClient for FakeClient {
    async fn get<K: ObjectKind>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        let value = {
            let state = self.state.lock().unwrap();
            state.objects.get(&key::<K>(namespace, name)).cloned()
        };
        value.map(decode).transpose()
    }

    async fn list<K: ObjectKind>(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<K>> {
        let values: Vec<Value> = {
            let state = self.state.lock().unwrap();
            let kind = K::kind(&()).to_string();
            state
                .objects
                .iter()
                .filter(|((k, ns, _), v)| *k == kind && ns == namespace && labels_match(v, labels))
                .map(|(_, v)| v.clone())
                .collect()
        };
        values.into_iter().map(decode).collect()
    }

    async fn create<K: ObjectKind>(&self, obj: &K) -> Result<K> {
        let value = {
            let mut state = self.state.lock().unwrap();
            let key = object_key(obj);
            if state.objects.contains_key(&key) {
                return Err(api_error(409, "AlreadyExists", format!("{} already exists", key.2)));
            }
            let value = Self::store(&mut state, obj.clone())?;
            Self::record(&mut state, Verb::Create, &key);
            value
        };
        decode(value)
    }

    async fn update<K: ObjectKind>(&self, obj: &K) -> Result<K> {
        let value = {
            let mut state = self.state.lock().unwrap();
            let key = object_key(obj);
            let current = state
                .objects
                .get(&key)
                .ok_or_else(|| api_error(404, "NotFound", format!("{} not found", key.2)))?;
            let current_version = current["metadata"]["resourceVersion"].as_str();
            if obj.meta().resource_version.as_deref() != current_version {
                return Err(api_error(409, "Conflict", format!("{} was modified", key.2)));
            }
            // status is only written through the subresource
            let status = current.get("status").cloned();
            let uid = current["metadata"]["uid"].clone();
            state.next_version += 1;
            let mut value = serde_json::to_value(obj)?;
            value["metadata"]["resourceVersion"] = Value::String(state.next_version.to_string());
            value["metadata"]["uid"] = uid;
            match status {
                Some(status) => value["status"] = status,
                None => {
                    if let Some(map) = value.as_object_mut() {
                        map.remove("status");
                    }
                }
            }
            state.objects.insert(key.clone(), value.clone());
            Self::record(&mut state, Verb::Update, &key);
            value
        };
        decode(value)
    }

    async fn delete<K: ObjectKind>(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let key = key::<K>(namespace, name);
        if state.objects.remove(&key).is_some() {
            Self::record(&mut state, Verb::Delete, &key);
        }
        Ok(())
    }

    async fn update_status<K: ObjectKind>(&self, obj: &K) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let key = object_key(obj);
        let status = serde_json::to_value(obj)?
            .get("status")
            .cloned()
            .unwrap_or_default();
        state.next_version += 1;
        let version = state.next_version.to_string();
        let stored = state
            .objects
            .get_mut(&key)
            .ok_or_else(|| api_error(404, "NotFound", format!("{} not found", key.2)))?;
        stored["status"] = status;
        stored["metadata"]["resourceVersion"] = Value::String(version);
        Self::record(&mut state, Verb::UpdateStatus, &key);
        Ok(())
    }

    async fn publish_event<K: ObjectKind>(&self, obj: &K, event: EventRecord) {
        let mut state = self.state.lock().unwrap();
        state.events.push(RecordedEvent {
            kind: K::kind(&()).to_string(),
            name: obj.meta().name.clone().unwrap_or_default(),
            warning: matches!(event.type_, EventType::Warning),
            reason: event.reason,
            note: event.note,
        });
    }

    async fn pdb_api_version(&self) -> Result<PdbApiVersion> {
        Ok(self.pdb_version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_conflict;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn config_map(name: &str, labels: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns".to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_get_list() {
        let client = FakeClient::new();
        client.create(&config_map("a", &[("app", "x")])).await.unwrap();
        client.create(&config_map("b", &[("app", "y")])).await.unwrap();

        let a: ConfigMap = client.get("ns", "a").await.unwrap().unwrap();
        assert!(a.metadata.resource_version.is_some());
        assert!(a.metadata.uid.is_some());

        let selected: Vec<ConfigMap> = client
            .list("ns", &BTreeMap::from([("app".to_string(), "y".to_string())]))
            .await
            .unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].metadata.name.as_deref(), Some("b"));
        assert_eq!(client.writes().len(), 2);
    }

    #[tokio::test]
    async fn test_stale_update_conflicts() {
        let client = FakeClient::new();
        let created = client.create(&config_map("a", &[])).await.unwrap();
        client.update(&created).await.unwrap();

        let err = client.update(&created).await.unwrap_err();
        match err {
            OperatorError::KubeError(e) => assert!(is_conflict(&e)),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_delete_missing_is_noop() {
        let client = FakeClient::new();
        client.delete::<ConfigMap>("ns", "missing").await.unwrap();
        assert!(client.writes().is_empty());
    }
}
