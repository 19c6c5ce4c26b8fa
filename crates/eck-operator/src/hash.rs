//! Stable 32-bit hashing used for template hashes and pod fingerprints

use crate::error::Result;
use kube::Resource;
use serde::Serialize;
use std::collections::BTreeMap;

/// Label carrying the hash of the intended object, compared to decide updates
pub const TEMPLATE_HASH_LABEL: &str = "common.k8s.elastic.co/template-hash";

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// Incremental FNV-1a (32-bit) accumulator.
///
/// Bytes are folded in the order they are written, so callers feed their
/// inputs in a fixed sequence to keep digests stable across runs.
#[derive(Debug, Clone, Copy)]
pub struct Fnv1a32 {
    state: u32,
}

impl Fnv1a32 {
    pub fn new() -> Self {
        Self {
            state: FNV_OFFSET_BASIS,
        }
    }

    pub fn write(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.state ^= u32::from(*byte);
            self.state = self.state.wrapping_mul(FNV_PRIME);
        }
    }

    pub fn sum32(&self) -> u32 {
        self.state
    }
}

impl Default for Fnv1a32 {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash the JSON form of any serializable value
pub fn hash_object<T: Serialize>(obj: &T) -> Result<String> {
    let mut hasher = Fnv1a32::new();
    hasher.write(&serde_json::to_vec(obj)?);
    Ok(hasher.sum32().to_string())
}

/// Compute the template hash of `obj` and store it in its labels.
///
/// Any previous hash label is dropped before hashing so that the result only
/// depends on the intended content.
pub fn set_template_hash<K>(obj: &mut K) -> Result<()>
where
    K: Resource + Serialize,
{
    obj.meta_mut()
        .labels
        .get_or_insert_with(BTreeMap::new)
        .remove(TEMPLATE_HASH_LABEL);
    let hash = hash_object(obj)?;
    obj.meta_mut()
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(TEMPLATE_HASH_LABEL.to_string(), hash);
    Ok(())
}

/// Read the template hash label of an object, if any
pub fn template_hash<K: Resource>(obj: &K) -> Option<&str> {
    obj.meta()
        .labels
        .as_ref()
        .and_then(|labels| labels.get(TEMPLATE_HASH_LABEL))
        .map(String::as_str)
}

/// True when the expected and observed objects carry different template hashes
pub fn template_hash_differs<K: Resource>(expected: &K, observed: &K) -> bool {
    template_hash(expected) != template_hash(observed)
}
