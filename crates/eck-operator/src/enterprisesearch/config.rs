//! Enterprise Search configuration
//!
//! The configuration file is layered, later layers win:
//!
//! 1. operator defaults
//! 2. generated secrets, reused from the existing config secret
//! 3. TLS settings
//! 4. Elasticsearch connection settings
//! 5. the inline `config` of the resource
//! 6. the `configRef` secrets, in order
//!
//! It is stored in a secret next to the readiness probe script, which reads
//! the Elasticsearch credentials from the merged configuration.

use super::{
    config_secret_name, labels, CONFIG_FILE_NAME, ES_CERTS_MOUNT_PATH, HTTP_CERTS_MOUNT_PATH,
    HTTP_PORT, LOG_MOUNT_PATH, READINESS_PROBE_FILE_NAME, READINESS_PROBE_TIMEOUT_SECONDS,
};
use crate::association::{self, AssociationConf};
use crate::certificates::{CA_FILE_NAME, CERT_FILE_NAME, KEY_FILE_NAME};
use crate::config::IpFamily;
use crate::crd::enterprisesearch::v1::EnterpriseSearch;
use crate::error::{OperatorError, Result};
use crate::k8s::K8sClient;
use crate::reconciler::reconcile_secret;
use crate::settings::CanonicalConfig;
use crate::version;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::ResourceExt;
use rand::distributions::Alphanumeric;
use rand::Rng;
use semver::Version;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::debug;

const SECRET_SESSION_KEY_SETTING: &str = "secret_session_key";
const ENCRYPTION_KEYS_SETTING: &str = "secret_management.encryption_keys";
const AUTH_SETTING: &str = "ent_search.auth";
const GENERATED_SECRET_LENGTH: usize = 32;

const KIBANA_HOST_SINCE: Version = Version::new(7, 15, 0);
const NATIVE_AUTH_BEFORE: Version = Version::new(7, 14, 0);

/// Rendered configuration and probe script
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedConfig {
    pub config: Vec<u8>,
    pub readiness_probe: Vec<u8>,
}

/// Reconcile the config secret, returning what it now holds
pub async fn reconcile_config<C: K8sClient>(
    client: &C,
    ent: &EnterpriseSearch,
    association: Option<&AssociationConf>,
    ip_family: IpFamily,
) -> Result<RenderedConfig> {
    let cfg = new_config(client, ent, association, ip_family).await?;
    let rendered = RenderedConfig {
        config: cfg.render()?,
        readiness_probe: readiness_probe_script(ent, &cfg, ip_family)?,
    };

    let expected = Secret {
        metadata: ObjectMeta {
            name: Some(config_secret_name(&ent.name_any())),
            namespace: ent.namespace(),
            labels: Some(labels(&ent.name_any())),
            ..Default::default()
        },
        data: Some(BTreeMap::from([
            (
                CONFIG_FILE_NAME.to_string(),
                ByteString(rendered.config.clone()),
            ),
            (
                READINESS_PROBE_FILE_NAME.to_string(),
                ByteString(rendered.readiness_probe.clone()),
            ),
        ])),
        ..Default::default()
    };
    reconcile_secret(client, expected, ent).await?;
    Ok(rendered)
}

/// Merge every configuration layer
pub async fn new_config<C: K8sClient>(
    client: &C,
    ent: &EnterpriseSearch,
    association: Option<&AssociationConf>,
    ip_family: IpFamily,
) -> Result<CanonicalConfig> {
    let version = version::parse(&ent.spec.version)?;
    let reusable = reusable_settings(client, ent).await?;
    let user = CanonicalConfig::from_value(ent.spec.config.clone().unwrap_or(Value::Null))?;
    let user_secrets = parse_config_ref(client, ent).await?;
    let user_has_auth = user.has_child(AUTH_SETTING) || user_secrets.has_child(AUTH_SETTING);
    let association = association_config(client, ent, association, &version, user_has_auth).await?;

    let mut cfg = default_config(ent, &version, ip_family);
    for layer in [&reusable, &tls_config(ent), &association, &user, &user_secrets] {
        cfg.merge_with(layer);
    }
    Ok(cfg)
}

fn default_config(ent: &EnterpriseSearch, version: &Version, ip_family: IpFamily) -> CanonicalConfig {
    let protocol = ent.spec.http.protocol();
    let mut cfg = CanonicalConfig::from_pairs([
        (
            "ent_search.external_url",
            json!(format!("{protocol}://localhost:{HTTP_PORT}")),
        ),
        ("ent_search.listen_host", json!(ip_family.inaddr_any())),
        ("filebeat_log_directory", json!(LOG_MOUNT_PATH)),
        ("log_directory", json!(LOG_MOUNT_PATH)),
        ("allow_es_settings_modification", json!(true)),
    ]);
    if *version >= KIBANA_HOST_SINCE {
        cfg.set("kibana.host", json!(format!("{protocol}://localhost:5601")));
    }
    cfg
}

#[derive(Debug, Default, Deserialize)]
struct ReusableSettings {
    #[serde(default)]
    secret_session_key: Option<String>,
    #[serde(default)]
    secret_management: SecretManagement,
}

#[derive(Debug, Default, Deserialize)]
struct SecretManagement {
    #[serde(default)]
    encryption_keys: Vec<String>,
}

/// Session key and first encryption key, generated once then reused.
///
/// Only the first encryption key belongs to the operator. Keys added by the
/// user come back with the user layers, appended after it.
async fn reusable_settings<C: K8sClient>(client: &C, ent: &EnterpriseSearch) -> Result<CanonicalConfig> {
    let existing = existing_config(client, ent).await?;
    let settings: ReusableSettings = match existing {
        Some(cfg) => cfg.unpack()?,
        None => ReusableSettings::default(),
    };

    let session_key = settings
        .secret_session_key
        .filter(|k| !k.is_empty())
        .unwrap_or_else(random_secret);
    let encryption_key = settings
        .secret_management
        .encryption_keys
        .into_iter()
        .next()
        .unwrap_or_else(random_secret);

    let mut cfg = CanonicalConfig::new();
    cfg.set(SECRET_SESSION_KEY_SETTING, json!(session_key));
    cfg.set(ENCRYPTION_KEYS_SETTING, json!([encryption_key]));
    Ok(cfg)
}

async fn existing_config<C: K8sClient>(
    client: &C,
    ent: &EnterpriseSearch,
) -> Result<Option<CanonicalConfig>> {
    let namespace = ent.namespace().unwrap_or_default();
    let secret: Option<Secret> = client
        .get(&namespace, &config_secret_name(&ent.name_any()))
        .await?;
    let Some(raw) = secret.and_then(|s| s.data).and_then(|mut d| d.remove(CONFIG_FILE_NAME)) else {
        debug!("Enterprise Search config secret does not exist yet");
        return Ok(None);
    };
    CanonicalConfig::from_yaml(&raw.0).map(Some)
}

fn random_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_SECRET_LENGTH)
        .map(char::from)
        .collect()
}

fn tls_config(ent: &EnterpriseSearch) -> CanonicalConfig {
    if !ent.spec.http.tls.enabled() {
        return CanonicalConfig::new();
    }
    CanonicalConfig::from_pairs([
        ("ent_search.ssl.enabled", json!(true)),
        (
            "ent_search.ssl.certificate",
            json!(format!("{HTTP_CERTS_MOUNT_PATH}/{CERT_FILE_NAME}")),
        ),
        (
            "ent_search.ssl.key",
            json!(format!("{HTTP_CERTS_MOUNT_PATH}/{KEY_FILE_NAME}")),
        ),
        (
            "ent_search.ssl.certificate_authorities",
            json!([format!("{HTTP_CERTS_MOUNT_PATH}/{CA_FILE_NAME}")]),
        ),
    ])
}

async fn association_config<C: K8sClient>(
    client: &C,
    ent: &EnterpriseSearch,
    association: Option<&AssociationConf>,
    version: &Version,
    user_has_auth: bool,
) -> Result<CanonicalConfig> {
    let mut cfg = CanonicalConfig::new();
    let Some(conf) = association.filter(|c| c.is_configured()) else {
        return Ok(cfg);
    };

    let namespace = ent.namespace().unwrap_or_default();
    if *version < NATIVE_AUTH_BEFORE && !user_has_auth {
        cfg.set("ent_search.auth.source", json!("elasticsearch-native"));
    }
    cfg.set("elasticsearch.host", json!(conf.url));
    if let Some(credentials) = association::credentials(client, &namespace, conf).await? {
        cfg.set("elasticsearch.username", json!(credentials.username));
        cfg.set("elasticsearch.password", json!(credentials.password));
    }
    if conf.ca_cert_provided {
        cfg.set("elasticsearch.ssl.enabled", json!(true));
        cfg.set(
            "elasticsearch.ssl.certificate_authority",
            json!(format!("{ES_CERTS_MOUNT_PATH}/{}", association::CA_FILE_NAME)),
        );
        cfg.set("elasticsearch.ssl.verify", json!(true));
    }
    Ok(cfg)
}

/// Merge the `enterprise-search.yml` entries of the `configRef` secrets
async fn parse_config_ref<C: K8sClient>(client: &C, ent: &EnterpriseSearch) -> Result<CanonicalConfig> {
    let namespace = ent.namespace().unwrap_or_default();
    let mut cfg = CanonicalConfig::new();
    for source in &ent.spec.config_ref {
        let secret: Secret = client
            .get(&namespace, &source.secret_name)
            .await?
            .ok_or_else(|| OperatorError::NotFound {
                kind: "Secret".to_string(),
                name: source.secret_name.clone(),
                namespace: namespace.clone(),
            })?;
        let raw = secret
            .data
            .as_ref()
            .and_then(|d| d.get(CONFIG_FILE_NAME))
            .ok_or_else(|| {
                OperatorError::InvalidConfig(format!(
                    "configRef secret {} has no {CONFIG_FILE_NAME} entry",
                    source.secret_name
                ))
            })?;
        let parsed = CanonicalConfig::from_yaml(&raw.0).map_err(|e| {
            OperatorError::InvalidConfig(format!(
                "unable to parse configRef secret {}: {e}",
                source.secret_name
            ))
        })?;
        cfg.merge_with(&parsed);
    }
    Ok(cfg)
}

#[derive(Debug, Default, Deserialize)]
struct EsAuth {
    #[serde(default)]
    elasticsearch: EsAuthSettings,
}

#[derive(Debug, Default, Deserialize)]
struct EsAuthSettings {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

/// Bash script curling the health endpoint, succeeding on a 200 only.
///
/// Credentials come from the merged configuration since the user may
/// override them.
pub fn readiness_probe_script(
    ent: &EnterpriseSearch,
    cfg: &CanonicalConfig,
    ip_family: IpFamily,
) -> Result<Vec<u8>> {
    let url = format!(
        "{}://{}:{HTTP_PORT}/api/ent/v1/internal/health",
        ent.spec.http.protocol(),
        ip_family.loopback_host()
    );
    let auth: EsAuth = cfg.unpack()?;
    let basic_auth = if auth.elasticsearch.username.is_empty() {
        String::new()
    } else {
        format!(
            "-u {}:{}",
            auth.elasticsearch.username, auth.elasticsearch.password
        )
    };

    Ok(format!(
        r#"#!/usr/bin/env bash

# report to the container logs before failing
function fail {{
  timestamp=$(date --iso-8601=seconds)
  echo "{{\"timestamp\": \"${{timestamp}}\", \"message\": \"readiness probe failed\", "$1"}}" | tee /proc/1/fd/2 2> /dev/null
  exit 1
}}

READINESS_PROBE_TIMEOUT=${{READINESS_PROBE_TIMEOUT:={READINESS_PROBE_TIMEOUT_SECONDS}}}

# -g keeps curl from globbing bracketed IPv6 addresses
status=$(curl -g -o /dev/null -w "%{{http_code}}" {url} {basic_auth} -k -s --max-time ${{READINESS_PROBE_TIMEOUT}})
curl_rc=$?

if [[ ${{curl_rc}} -ne 0 ]]; then
  fail "\"curl_rc\": \"${{curl_rc}}\""
fi

if [[ ${{status}} == "200" ]]; then
  exit 0
else
  fail " \"status\": \"${{status}}\" "
fi
"#
    )
    .into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::common::{ConfigSource, SelfSignedCertificate};
    use crate::enterprisesearch::test_fixtures::{
        association_conf, associated, auth_secret, enterprise_search, ES_PASSWORD, ES_USER,
    };
    use crate::k8s::fake::FakeClient;

    fn disable_tls(ent: &mut EnterpriseSearch) {
        ent.spec.http.tls.self_signed_certificate = Some(SelfSignedCertificate {
            disabled: true,
            subject_alt_names: vec![],
        });
    }

    fn config_ref_secret(name: &str, yaml: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns".to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                CONFIG_FILE_NAME.to_string(),
                ByteString(yaml.as_bytes().to_vec()),
            )])),
            ..Default::default()
        }
    }

    fn stored_config(client: &FakeClient) -> CanonicalConfig {
        let secret = client.object::<Secret>("ns", "ent-ent-config").unwrap();
        CanonicalConfig::from_yaml(&secret.data.unwrap()[CONFIG_FILE_NAME].0).unwrap()
    }

    fn str_at<'a>(cfg: &'a CanonicalConfig, path: &str) -> &'a str {
        cfg.get(path).and_then(Value::as_str).unwrap()
    }

    #[tokio::test]
    async fn test_generated_secrets_are_preserved() {
        let client = FakeClient::new();
        let ent = client.seed(enterprise_search("7.7.0"));

        reconcile_config(&client, &ent, None, IpFamily::Ipv4).await.unwrap();
        let first = stored_config(&client);
        let session_key = str_at(&first, SECRET_SESSION_KEY_SETTING).to_string();
        let keys = first.get(ENCRYPTION_KEYS_SETTING).unwrap().as_array().unwrap().clone();
        assert_eq!(session_key.len(), 32);
        assert!(session_key.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].as_str().unwrap().len(), 32);

        client.clear_writes();
        reconcile_config(&client, &ent, None, IpFamily::Ipv4).await.unwrap();
        let second = stored_config(&client);
        assert_eq!(str_at(&second, SECRET_SESSION_KEY_SETTING), session_key);
        assert_eq!(second.get(ENCRYPTION_KEYS_SETTING).unwrap().as_array().unwrap(), &keys);
        assert!(client.writes().is_empty());
    }

    #[tokio::test]
    async fn test_user_encryption_keys_follow_the_managed_one() {
        let client = FakeClient::new();
        let mut ent = enterprise_search("7.7.0");
        ent.spec.config = Some(json!({"secret_management.encryption_keys": ["user-key"]}));
        let ent = client.seed(ent);

        reconcile_config(&client, &ent, None, IpFamily::Ipv4).await.unwrap();
        let first = stored_config(&client);
        let keys = first.get(ENCRYPTION_KEYS_SETTING).unwrap().as_array().unwrap().clone();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[1], json!("user-key"));

        // the stored user key is not taken for the managed one
        reconcile_config(&client, &ent, None, IpFamily::Ipv4).await.unwrap();
        let second = stored_config(&client);
        assert_eq!(second.get(ENCRYPTION_KEYS_SETTING).unwrap().as_array().unwrap(), &keys);
    }

    #[tokio::test]
    async fn test_defaults() {
        let client = FakeClient::new();
        let ent = enterprise_search("7.16.0");
        let cfg = new_config(&client, &ent, None, IpFamily::Ipv6).await.unwrap();

        assert_eq!(str_at(&cfg, "ent_search.external_url"), "https://localhost:3002");
        assert_eq!(str_at(&cfg, "ent_search.listen_host"), "0:0:0:0:0:0:0:0");
        assert_eq!(str_at(&cfg, "log_directory"), LOG_MOUNT_PATH);
        assert_eq!(str_at(&cfg, "filebeat_log_directory"), LOG_MOUNT_PATH);
        assert_eq!(cfg.get("allow_es_settings_modification"), Some(&json!(true)));
        assert_eq!(str_at(&cfg, "kibana.host"), "https://localhost:5601");
        assert_eq!(cfg.get("ent_search.ssl.enabled"), Some(&json!(true)));
        assert_eq!(
            cfg.get("ent_search.ssl.certificate_authorities"),
            Some(&json!(["/mnt/elastic-internal/http-certs/ca.crt"]))
        );
        assert!(!cfg.has_child("elasticsearch"));
    }

    #[tokio::test]
    async fn test_tls_disabled_before_kibana_host() {
        let client = FakeClient::new();
        let mut ent = enterprise_search("7.10.0");
        disable_tls(&mut ent);
        let cfg = new_config(&client, &ent, None, IpFamily::Ipv4).await.unwrap();

        assert_eq!(str_at(&cfg, "ent_search.external_url"), "http://localhost:3002");
        assert_eq!(str_at(&cfg, "ent_search.listen_host"), "0.0.0.0");
        assert!(cfg.get("kibana.host").is_none());
        assert!(!cfg.has_child("ent_search.ssl"));
    }

    #[tokio::test]
    async fn test_association_settings() {
        let client = FakeClient::new();
        client.seed(auth_secret());
        let ent = associated("7.10.0");
        let mut conf = association_conf();
        conf.ca_cert_provided = true;
        conf.ca_secret_name = "ent-es-ca".to_string();

        let cfg = new_config(&client, &ent, Some(&conf), IpFamily::Ipv4).await.unwrap();
        assert_eq!(str_at(&cfg, "elasticsearch.host"), conf.url);
        assert_eq!(str_at(&cfg, "elasticsearch.username"), ES_USER);
        assert_eq!(str_at(&cfg, "elasticsearch.password"), ES_PASSWORD);
        assert_eq!(str_at(&cfg, "ent_search.auth.source"), "elasticsearch-native");
        assert_eq!(cfg.get("elasticsearch.ssl.enabled"), Some(&json!(true)));
        assert_eq!(cfg.get("elasticsearch.ssl.verify"), Some(&json!(true)));
        assert_eq!(
            str_at(&cfg, "elasticsearch.ssl.certificate_authority"),
            "/mnt/elastic-internal/es-certs/ca.crt"
        );
    }

    #[tokio::test]
    async fn test_native_auth_only_for_old_versions_without_user_auth() {
        let client = FakeClient::new();
        client.seed(auth_secret());
        let conf = association_conf();

        let recent = associated("7.14.0");
        let cfg = new_config(&client, &recent, Some(&conf), IpFamily::Ipv4).await.unwrap();
        assert!(!cfg.has_child("ent_search.auth"));

        let mut with_user_auth = associated("7.10.0");
        with_user_auth.spec.config = Some(json!({"ent_search.auth.native1.source": "standard"}));
        let cfg = new_config(&client, &with_user_auth, Some(&conf), IpFamily::Ipv4)
            .await
            .unwrap();
        assert!(cfg.get("ent_search.auth.source").is_none());
        assert_eq!(str_at(&cfg, "ent_search.auth.native1.source"), "standard");
    }

    #[tokio::test]
    async fn test_user_layers_win() {
        let client = FakeClient::new();
        client.seed(config_ref_secret("first", "log_directory: /first\nkey: a\n"));
        client.seed(config_ref_secret("second", "key: b\n"));
        let mut ent = enterprise_search("7.7.0");
        ent.spec.config = Some(json!({"log_directory": "/inline", "ent_search.external_url": "https://ent.example.com"}));
        ent.spec.config_ref = vec![
            ConfigSource {
                secret_name: "first".to_string(),
            },
            ConfigSource {
                secret_name: "second".to_string(),
            },
        ];

        let cfg = new_config(&client, &ent, None, IpFamily::Ipv4).await.unwrap();
        assert_eq!(str_at(&cfg, "ent_search.external_url"), "https://ent.example.com");
        assert_eq!(str_at(&cfg, "log_directory"), "/first");
        assert_eq!(str_at(&cfg, "key"), "b");
    }

    #[tokio::test]
    async fn test_config_ref_errors() {
        let client = FakeClient::new();
        let mut ent = enterprise_search("7.7.0");
        ent.spec.config_ref = vec![ConfigSource {
            secret_name: "missing".to_string(),
        }];
        let err = new_config(&client, &ent, None, IpFamily::Ipv4).await.unwrap_err();
        assert!(matches!(err, OperatorError::NotFound { .. }));

        client.seed(config_ref_secret("missing", "a: [unclosed"));
        let err = new_config(&client, &ent, None, IpFamily::Ipv4).await.unwrap_err();
        assert!(matches!(err, OperatorError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_readiness_probe_script() {
        let client = FakeClient::new();
        client.seed(auth_secret());
        let ent = associated("7.7.0");
        let cfg = new_config(&client, &ent, Some(&association_conf()), IpFamily::Ipv4)
            .await
            .unwrap();
        let script = String::from_utf8(readiness_probe_script(&ent, &cfg, IpFamily::Ipv4).unwrap()).unwrap();
        assert!(script.starts_with("#!/usr/bin/env bash"));
        assert!(script.contains("READINESS_PROBE_TIMEOUT=${READINESS_PROBE_TIMEOUT:=5}"));
        assert!(script.contains(&format!(
            "https://127.0.0.1:3002/api/ent/v1/internal/health -u {ES_USER}:{ES_PASSWORD} -k -s"
        )));

        let mut plain = enterprise_search("7.7.0");
        disable_tls(&mut plain);
        let cfg = new_config(&client, &plain, None, IpFamily::Ipv6).await.unwrap();
        let script = String::from_utf8(readiness_probe_script(&plain, &cfg, IpFamily::Ipv6).unwrap()).unwrap();
        assert!(script.contains("http://[::1]:3002/api/ent/v1/internal/health  -k -s"));
        assert!(!script.contains(" -u "));
    }
}
