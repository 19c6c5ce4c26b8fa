//! Per-resource registry of referenced secrets
//!
//! Resources reference secrets they do not own (association credentials,
//! configuration sources, user certificates). The reconciler registers those
//! references here and the secret watch maps secret events back to the
//! resources that declared them.

use dashmap::DashMap;
use std::collections::BTreeSet;

/// Namespace and name of an object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Secrets watched on behalf of each resource
#[derive(Debug, Default)]
pub struct DynamicWatches {
    secrets: DashMap<NamespacedName, BTreeSet<NamespacedName>>,
}

impl DynamicWatches {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the set of secrets watched for `owner`
    pub fn watch_secrets(&self, owner: NamespacedName, secrets: BTreeSet<NamespacedName>) {
        if secrets.is_empty() {
            self.secrets.remove(&owner);
        } else {
            self.secrets.insert(owner, secrets);
        }
    }

    /// Forget everything watched for `owner`
    pub fn remove(&self, owner: &NamespacedName) {
        self.secrets.remove(owner);
    }

    /// Resources that reference the given secret
    pub fn owners_of_secret(&self, secret: &NamespacedName) -> Vec<NamespacedName> {
        let mut owners: Vec<_> = self
            .secrets
            .iter()
            .filter(|entry| entry.value().contains(secret))
            .map(|entry| entry.key().clone())
            .collect();
        owners.sort();
        owners
    }

    pub fn watched_secrets(&self, owner: &NamespacedName) -> BTreeSet<NamespacedName> {
        self.secrets
            .get(owner)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }
}
