//! Semantic version helpers

use crate::error::{OperatorError, Result};
use k8s_openapi::api::core::v1::Pod;
use semver::Version;
use std::collections::BTreeMap;

/// Parse a version string such as `7.7.0` or `8.0.0-SNAPSHOT`
pub fn parse(version: &str) -> Result<Version> {
    Version::parse(version.trim()).map_err(|source| OperatorError::InvalidVersion {
        version: version.to_string(),
        source,
    })
}

/// Parse the version stored under `key` in a label map
pub fn from_labels(labels: Option<&BTreeMap<String, String>>, key: &str) -> Result<Option<Version>> {
    labels
        .and_then(|labels| labels.get(key))
        .map(|v| parse(v))
        .transpose()
}

/// Lowest version among the pods, read from the `key` label.
///
/// Pods without the label are ignored.
pub fn min_pod_version(pods: &[Pod], key: &str) -> Result<Option<Version>> {
    let mut min: Option<Version> = None;
    for pod in pods {
        if let Some(v) = from_labels(pod.metadata.labels.as_ref(), key)? {
            if min.as_ref().is_none_or(|current| v < *current) {
                min = Some(v);
            }
        }
    }
    Ok(min)
}

/// Inclusive range of supported versions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRange {
    pub min: Version,
    pub max: Version,
}

impl VersionRange {
    pub const fn new(min: Version, max: Version) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, v: &Version) -> bool {
        // pre-releases of a supported version are supported too
        let release = Version::new(v.major, v.minor, v.patch);
        release >= self.min && release <= self.max
    }
}

/// A dependent resource may run `desired` next to a referenced resource at
/// `referenced` if the referenced one is not older, ignoring patch releases.
pub fn compatible_with_reference(desired: &Version, referenced: &Version) -> bool {
    referenced >= desired || (referenced.major == desired.major && referenced.minor == desired.minor)
}
