//! Pieces shared by the controllers: requeue policy and API scoping

use crate::error::OperatorError;
use dashmap::DashMap;
use k8s_openapi::NamespaceResourceScope;
use kube::runtime::controller::Action;
use kube::{Api, Client, Resource};
use std::time::Duration;
use tracing::warn;

/// Default requeue interval for successful reconciliations
pub const DEFAULT_REQUEUE_SECONDS: u64 = 300; // 5 minutes

/// Requeue interval for error cases (base for exponential backoff)
pub const ERROR_REQUEUE_SECONDS: u64 = 30;

/// Maximum requeue delay for error backoff
pub const MAX_ERROR_REQUEUE_SECONDS: u64 = 600;

/// Api scoped to the watched namespace, or to all namespaces
pub fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Delay before retrying after the `retries`-th consecutive failure
pub fn backoff_delay(error: &OperatorError, retries: u32) -> Duration {
    // 30s → 60s → 120s → 240s → 480s → 600s (capped)
    error.requeue_delay().unwrap_or_else(|| {
        let base = Duration::from_secs(ERROR_REQUEUE_SECONDS);
        let backoff = base * 2u32.saturating_pow(retries.saturating_sub(1).min(5));
        backoff.min(Duration::from_secs(MAX_ERROR_REQUEUE_SECONDS))
    })
}

/// Shared `error_policy` body.
///
/// Non-retryable errors wait for the user to edit the resource.
pub fn requeue_after_error(
    error_counts: &DashMap<String, u32>,
    key: String,
    error: &OperatorError,
) -> Action {
    if !error.is_retryable() {
        warn!(error = %error, "Reconciliation of '{}' failed permanently, waiting for a change", key);
        error_counts.remove(&key);
        return Action::await_change();
    }

    let retries = {
        let mut entry = error_counts.entry(key.clone()).or_insert(0);
        *entry += 1;
        *entry
    };
    let delay = backoff_delay(error, retries);

    warn!(
        error = %error,
        retry = retries,
        delay_secs = delay.as_secs(),
        "Reconciliation error for '{}', will retry",
        key
    );

    Action::requeue(delay)
}
