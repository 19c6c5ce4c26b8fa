//! Configuration fingerprint
//!
//! Stored as a pod template label: whenever anything mounted into the pods
//! changes, the label changes and the Deployment rolls the pods.

use super::config::RenderedConfig;
use crate::hash::Fnv1a32;

/// Inputs of the fingerprint, fed in this order
#[derive(Debug, Clone, Copy, Default)]
pub struct FingerprintInputs<'a> {
    pub config: &'a [u8],
    pub readiness_probe: &'a [u8],
    /// Internal HTTP certificate, when TLS is enabled
    pub http_certificate: Option<&'a [u8]>,
    /// CA of each association that provides one
    pub association_cas: &'a [Vec<u8>],
}

impl<'a> FingerprintInputs<'a> {
    pub fn new(rendered: &'a RenderedConfig) -> Self {
        Self {
            config: &rendered.config,
            readiness_probe: &rendered.readiness_probe,
            http_certificate: None,
            association_cas: &[],
        }
    }
}

/// Decimal FNV-1a sum of the inputs
pub fn fingerprint(inputs: &FingerprintInputs<'_>) -> String {
    let mut hasher = Fnv1a32::new();
    hasher.write(inputs.config);
    hasher.write(inputs.readiness_probe);
    if let Some(cert) = inputs.http_certificate {
        hasher.write(cert);
    }
    for ca in inputs.association_cas {
        hasher.write(ca);
    }
    hasher.sum32().to_string()
}
