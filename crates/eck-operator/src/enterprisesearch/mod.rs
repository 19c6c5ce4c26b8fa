//! Enterprise Search orchestration
//!
//! Each `EnterpriseSearch` resource is realized as an HTTP service, a config
//! secret, optional HTTP certificates and a Deployment whose pod template
//! carries a fingerprint of everything mounted into the pods.

pub mod config;
pub mod controller;
pub mod deployment;
pub mod fingerprint;
pub mod read_only;
pub mod status;
pub mod version_upgrade;

use crate::labels::{ENTERPRISE_SEARCH_TYPE, TYPE_LABEL};
use crate::version::VersionRange;
use semver::Version;
use std::collections::BTreeMap;

/// Label carrying the name of the EnterpriseSearch resource
pub const NAME_LABEL: &str = "enterprisesearch.k8s.elastic.co/name";
/// Pod template label carrying the deployed version
pub const VERSION_LABEL: &str = "enterprisesearch.k8s.elastic.co/version";
/// Pod template label carrying the configuration fingerprint
pub const CONFIG_HASH_LABEL: &str = "enterprisesearch.k8s.elastic.co/config-hash";
/// Set to `"true"` on the resource while read-only mode is enabled
pub const READ_ONLY_ANNOTATION: &str = "enterprisesearch.k8s.elastic.co/read-only";

pub const HTTP_PORT: i32 = 3002;
pub const CONTAINER_NAME: &str = "enterprise-search";
pub const DEFAULT_IMAGE: &str = "docker.elastic.co/enterprise-search/enterprise-search";

pub const CONFIG_FILE_NAME: &str = "enterprise-search.yml";
pub const CONFIG_MOUNT_PATH: &str = "/usr/share/enterprise-search/config/enterprise-search.yml";
pub const READINESS_PROBE_FILE_NAME: &str = "readiness-probe.sh";
pub const READINESS_PROBE_MOUNT_PATH: &str = "/mnt/elastic-internal/scripts/readiness-probe.sh";
pub const READINESS_PROBE_TIMEOUT_SECONDS: i32 = 5;
pub const HTTP_CERTS_MOUNT_PATH: &str = "/mnt/elastic-internal/http-certs";
pub const ES_CERTS_MOUNT_PATH: &str = "/mnt/elastic-internal/es-certs";
pub const LOG_MOUNT_PATH: &str = "/var/log/enterprise-search";

/// Versions the operator knows how to run
pub const SUPPORTED_VERSIONS: VersionRange =
    VersionRange::new(Version::new(7, 7, 0), Version::new(8, 99, 99));

pub fn deployment_name(name: &str) -> String {
    format!("{name}-ent")
}

pub fn http_service_name(name: &str) -> String {
    format!("{name}-ent-http")
}

pub fn config_secret_name(name: &str) -> String {
    format!("{name}-ent-config")
}

/// Prefix of the certificate secret names
pub fn name_prefix(name: &str) -> String {
    format!("{name}-ent")
}

/// Labels selecting the objects and pods of one resource
pub fn labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (NAME_LABEL.to_string(), name.to_string()),
        (TYPE_LABEL.to_string(), ENTERPRISE_SEARCH_TYPE.to_string()),
    ])
}
