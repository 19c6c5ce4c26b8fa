//! Operator-wide settings shared by the controllers

use crate::certificates::RotationParams;
use crate::error::{OperatorError, Result};
use chrono::Duration;

/// IP family of the pod network
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum IpFamily {
    #[default]
    Ipv4,
    Ipv6,
}

impl IpFamily {
    /// Address listening on every interface.
    ///
    /// Enterprise Search cannot parse the contracted `::` form.
    pub fn inaddr_any(&self) -> &'static str {
        match self {
            IpFamily::Ipv4 => "0.0.0.0",
            IpFamily::Ipv6 => "0:0:0:0:0:0:0:0",
        }
    }

    /// Loopback address, bracketed for use in URLs
    pub fn loopback_host(&self) -> &'static str {
        match self {
            IpFamily::Ipv4 => "127.0.0.1",
            IpFamily::Ipv6 => "[::1]",
        }
    }
}

/// Settings built once at startup from the command line
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Namespace to watch, all namespaces if unset
    pub namespace: Option<String>,
    /// Namespace the operator runs in, where license secrets live
    pub operator_namespace: String,
    pub ip_family: IpFamily,
    pub ca_rotation: RotationParams,
    pub cert_rotation: RotationParams,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            operator_namespace: "elastic-system".to_string(),
            ip_family: IpFamily::default(),
            ca_rotation: RotationParams::default(),
            cert_rotation: RotationParams::default(),
        }
    }
}

/// Rotation parameters from a validity and a rotate-before window in hours
pub fn rotation_from_hours(validity: u64, rotate_before: u64) -> Result<RotationParams> {
    if rotate_before >= validity {
        return Err(OperatorError::InvalidConfig(format!(
            "certificate rotate-before ({rotate_before}h) must be lower than validity ({validity}h)"
        )));
    }
    let hours = |h: u64| {
        i64::try_from(h)
            .ok()
            .and_then(Duration::try_hours)
            .ok_or_else(|| OperatorError::InvalidConfig(format!("duration out of range: {h}h")))
    };
    Ok(RotationParams {
        validity: hours(validity)?,
        rotate_before: hours(rotate_before)?,
    })
}
