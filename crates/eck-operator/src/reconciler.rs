//! Create-or-update helpers shared by every generated resource
//!
//! Each generated object is computed in full, then compared with what the API
//! server holds. Missing objects are created, differing ones are replaced
//! wholesale while keeping the server-owned metadata. Conflicts are returned
//! to the caller so that the work queue retries with fresh state.

use crate::error::{OperatorError, Result};
use crate::hash;
use crate::k8s::{K8sClient, ObjectKind};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Soft owner labels, set on secrets that may not carry an owner reference
pub const SOFT_OWNER_NAMESPACE_LABEL: &str = "eck.k8s.elastic.co/owner-namespace";
pub const SOFT_OWNER_NAME_LABEL: &str = "eck.k8s.elastic.co/owner-name";
pub const SOFT_OWNER_KIND_LABEL: &str = "eck.k8s.elastic.co/owner-kind";

/// Controller owner reference pointing to `owner`
pub fn owner_reference<O>(owner: &O) -> Result<OwnerReference>
where
    O: Resource<DynamicType = ()>,
{
    let reference = owner.controller_owner_ref(&()).ok_or_else(|| {
        OperatorError::Internal(format!(
            "{} {} has no uid yet",
            O::kind(&()),
            owner.meta().name.as_deref().unwrap_or_default()
        ))
    })?;
    Ok(OwnerReference {
        block_owner_deletion: Some(true),
        controller: Some(true),
        ..reference
    })
}

/// Make `owner` the single controller owner of `obj`
pub fn set_owner<K, O>(obj: &mut K, owner: &O) -> Result<()>
where
    K: Resource,
    O: Resource<DynamicType = ()>,
{
    obj.meta_mut().owner_references = Some(vec![owner_reference(owner)?]);
    Ok(())
}

/// True if `obj` is controlled by `owner`, matched on api version, kind and name
pub fn is_owned_by<K, O>(obj: &K, owner: &O) -> bool
where
    K: Resource,
    O: Resource<DynamicType = ()>,
{
    let owner_name = owner.meta().name.as_deref().unwrap_or_default();
    obj.owner_references().iter().any(|r| {
        r.controller == Some(true)
            && r.api_version == O::api_version(&())
            && r.kind == O::kind(&())
            && r.name == owner_name
    })
}

/// Replace `observed` with `expected`, keeping the server-side identity of `observed`
pub fn replace_preserving_metadata<K: Resource + Clone>(expected: &K, observed: &mut K) {
    let resource_version = observed.meta().resource_version.clone();
    let uid = observed.meta().uid.clone();
    let creation = observed.meta().creation_timestamp.clone();
    *observed = expected.clone();
    let meta = observed.meta_mut();
    meta.resource_version = resource_version;
    meta.uid = uid;
    meta.creation_timestamp = creation;
}

/// Ensure `expected` exists, updating the observed copy when `needs_update` says so.
///
/// Returns the object as stored by the API server.
pub async fn reconcile_resource<C, K, N, U>(
    client: &C,
    expected: K,
    needs_update: N,
    update_reconciled: U,
) -> Result<K>
where
    C: K8sClient,
    K: ObjectKind,
    N: Fn(&K, &K) -> bool + Send,
    U: Fn(&K, &mut K) + Send,
{
    let namespace = expected.namespace().unwrap_or_default();
    let name = expected.name_any();
    let kind = K::kind(&());

    match client.get::<K>(&namespace, &name).await? {
        None => {
            info!(kind = %kind, name = %name, namespace = %namespace, "Creating resource");
            client.create(&expected).await
        }
        Some(observed) if needs_update(&expected, &observed) => {
            info!(kind = %kind, name = %name, namespace = %namespace, "Updating resource");
            let mut reconciled = observed;
            update_reconciled(&expected, &mut reconciled);
            client.update(&reconciled).await
        }
        Some(observed) => {
            debug!(kind = %kind, name = %name, namespace = %namespace, "Resource up to date");
            Ok(observed)
        }
    }
}

/// Reconcile an object whose updates are driven by the template hash label.
///
/// `expected` gets its owner reference and hash label set here.
pub async fn reconcile_with_hash<C, K, O>(client: &C, mut expected: K, owner: &O) -> Result<K>
where
    C: K8sClient,
    K: ObjectKind,
    O: Resource<DynamicType = ()>,
{
    set_owner(&mut expected, owner)?;
    hash::set_template_hash(&mut expected)?;
    reconcile_resource(
        client,
        expected,
        hash::template_hash_differs,
        replace_preserving_metadata,
    )
    .await
}

/// Reconcile a Secret, comparing data, labels and owner directly.
///
/// Labels and annotations already present on the observed secret are kept.
pub async fn reconcile_secret<C, O>(client: &C, mut expected: Secret, owner: &O) -> Result<Secret>
where
    C: K8sClient,
    O: Resource<DynamicType = ()>,
{
    set_owner(&mut expected, owner)?;
    reconcile_resource(
        client,
        expected,
        |expected, observed| {
            expected.data != observed.data
                || !is_subset(expected.metadata.labels.as_ref(), observed.metadata.labels.as_ref())
                || !is_subset(
                    expected.metadata.annotations.as_ref(),
                    observed.metadata.annotations.as_ref(),
                )
                || expected.metadata.owner_references != observed.metadata.owner_references
        },
        |expected, observed| {
            observed.data = expected.data.clone();
            merge_into(&mut observed.metadata.labels, expected.metadata.labels.as_ref());
            merge_into(
                &mut observed.metadata.annotations,
                expected.metadata.annotations.as_ref(),
            );
            observed.metadata.owner_references = expected.metadata.owner_references.clone();
        },
    )
    .await
}

fn is_subset(
    expected: Option<&BTreeMap<String, String>>,
    observed: Option<&BTreeMap<String, String>>,
) -> bool {
    let Some(expected) = expected else {
        return true;
    };
    expected
        .iter()
        .all(|(k, v)| observed.and_then(|o| o.get(k)) == Some(v))
}

fn merge_into(target: &mut Option<BTreeMap<String, String>>, source: Option<&BTreeMap<String, String>>) {
    if let Some(source) = source {
        let target = target.get_or_insert_with(BTreeMap::new);
        target.extend(source.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
}

/// Labels marking a secret as soft-owned by `owner`
pub fn soft_owner_labels<O>(owner: &O) -> BTreeMap<String, String>
where
    O: Resource<DynamicType = ()>,
{
    BTreeMap::from([
        (
            SOFT_OWNER_NAMESPACE_LABEL.to_string(),
            owner.meta().namespace.clone().unwrap_or_default(),
        ),
        (
            SOFT_OWNER_NAME_LABEL.to_string(),
            owner.meta().name.clone().unwrap_or_default(),
        ),
        (SOFT_OWNER_KIND_LABEL.to_string(), O::kind(&()).to_string()),
    ])
}

/// Delete the secrets soft-owned by a deleted resource
pub async fn garbage_collect_soft_owned_secrets<C: K8sClient>(
    client: &C,
    namespace: &str,
    owner_name: &str,
    owner_kind: &str,
) -> Result<()> {
    let selector = BTreeMap::from([
        (SOFT_OWNER_NAMESPACE_LABEL.to_string(), namespace.to_string()),
        (SOFT_OWNER_NAME_LABEL.to_string(), owner_name.to_string()),
        (SOFT_OWNER_KIND_LABEL.to_string(), owner_kind.to_string()),
    ]);
    for secret in client.list::<Secret>(namespace, &selector).await? {
        let name = secret.name_any();
        info!(name = %name, namespace = %namespace, owner = %owner_name, "Deleting soft-owned secret");
        client.delete::<Secret>(namespace, &name).await?;
    }
    Ok(())
}
