//! Self-signed CA and HTTP certificates
//!
//! Each resource with TLS enabled gets its own CA, stored in a secret, and an
//! HTTP certificate signed by it. The certificate secret also carries the CA
//! so that it can be mounted as a whole. Both are regenerated when they get
//! close to their expiry, the certificate also when its SANs change.

use crate::crd::common::TlsOptions;
use crate::error::{OperatorError, Result};
use crate::k8s::{K8sClient, ObjectKind};
use crate::reconciler::reconcile_secret;
use chrono::{DateTime, Datelike, Duration, Utc};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use rcgen::{
    BasicConstraints, CertificateParams, DnType, DnValue, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose,
};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::net::IpAddr;
use tracing::info;
use x509_parser::extensions::GeneralName;

pub const CERT_FILE_NAME: &str = "tls.crt";
pub const KEY_FILE_NAME: &str = "tls.key";
pub const CA_FILE_NAME: &str = "ca.crt";

/// Validity and rotation window of generated certificates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationParams {
    pub validity: Duration,
    pub rotate_before: Duration,
}

impl Default for RotationParams {
    fn default() -> Self {
        Self {
            validity: Duration::days(365),
            rotate_before: Duration::days(1),
        }
    }
}

pub fn ca_secret_name(prefix: &str) -> String {
    format!("{prefix}-http-ca-internal")
}

pub fn internal_certs_secret_name(prefix: &str) -> String {
    format!("{prefix}-http-certs-internal")
}

/// Outcome of a certificate reconciliation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciledCertificates {
    /// When the soonest certificate needs to be rotated
    pub requeue_after: Option<std::time::Duration>,
}

/// Reconciles the CA and HTTP certificate secrets of one resource
pub struct CertificatesReconciler<'a, C, O> {
    pub client: &'a C,
    pub owner: &'a O,
    pub tls: &'a TlsOptions,
    /// Prefix of the secret names, `<name>-ent` for Enterprise Search
    pub name_prefix: String,
    pub labels: BTreeMap<String, String>,
    /// Name of the service exposing the HTTP endpoint
    pub service_name: String,
    pub ca_rotation: RotationParams,
    pub cert_rotation: RotationParams,
}

struct ParsedCertificate {
    not_after: DateTime<Utc>,
    sans: BTreeSet<String>,
}

fn cert_err(e: impl Display) -> OperatorError {
    OperatorError::Certificate(e.to_string())
}

fn parse_certificate(pem: &[u8]) -> Result<ParsedCertificate> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(pem).map_err(cert_err)?;
    let cert = pem.parse_x509().map_err(cert_err)?;
    let not_after = DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0)
        .ok_or_else(|| cert_err("certificate expiry out of range"))?;

    let mut sans = BTreeSet::new();
    if let Ok(Some(ext)) = cert.subject_alternative_name() {
        for name in &ext.value.general_names {
            match name {
                GeneralName::DNSName(dns) => {
                    sans.insert(dns.to_string());
                }
                GeneralName::IPAddress(bytes) => {
                    let ip = match bytes.len() {
                        4 => <[u8; 4]>::try_from(*bytes).ok().map(IpAddr::from),
                        16 => <[u8; 16]>::try_from(*bytes).ok().map(IpAddr::from),
                        _ => None,
                    };
                    if let Some(ip) = ip {
                        sans.insert(ip.to_string());
                    }
                }
                _ => {}
            }
        }
    }
    Ok(ParsedCertificate { not_after, sans })
}

fn set_validity(params: &mut CertificateParams, validity: Duration) {
    let now = Utc::now();
    let start = now - Duration::days(1);
    let end = now + validity;
    params.not_before = rcgen::date_time_ymd(start.year(), start.month() as u8, start.day() as u8);
    params.not_after = rcgen::date_time_ymd(end.year(), end.month() as u8, end.day() as u8);
}

/// Generate a self-signed CA, returns the certificate and key PEM
fn generate_ca(common_name: &str, validity: Duration) -> Result<(String, String)> {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.distinguished_name.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_string()),
    );
    params.distinguished_name.push(
        DnType::OrganizationalUnitName,
        DnValue::Utf8String("eck-operator".to_string()),
    );
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    set_validity(&mut params, validity);

    let key = KeyPair::generate().map_err(cert_err)?;
    let cert = params.self_signed(&key).map_err(cert_err)?;
    Ok((cert.pem(), key.serialize_pem()))
}

/// Generate a server certificate signed by the given CA
fn generate_http_certificate(
    common_name: &str,
    sans: &BTreeSet<String>,
    ca_pem: &str,
    ca_key_pem: &str,
    validity: Duration,
) -> Result<(String, String)> {
    let ca_key = KeyPair::from_pem(ca_key_pem).map_err(cert_err)?;
    let ca_cert = CertificateParams::from_ca_cert_pem(ca_pem)
        .map_err(cert_err)?
        .self_signed(&ca_key)
        .map_err(cert_err)?;

    let mut params =
        CertificateParams::new(sans.iter().cloned().collect::<Vec<_>>()).map_err(cert_err)?;
    params.distinguished_name.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_string()),
    );
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    set_validity(&mut params, validity);

    let key = KeyPair::generate().map_err(cert_err)?;
    let cert = params.signed_by(&key, &ca_cert, &ca_key).map_err(cert_err)?;
    Ok((cert.pem(), key.serialize_pem()))
}

fn secret_value<'s>(secret: &'s Secret, key: &str) -> Option<&'s [u8]> {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .map(|b| b.0.as_slice())
}

fn until_rotation(not_after: DateTime<Utc>, rotate_before: Duration) -> Duration {
    not_after - rotate_before - Utc::now()
}

impl<C, O> CertificatesReconciler<'_, C, O>
where
    C: K8sClient,
    O: ObjectKind,
{
    fn namespace(&self) -> String {
        self.owner.meta().namespace.clone().unwrap_or_default()
    }

    fn secret(&self, name: String, data: BTreeMap<String, Vec<u8>>) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name),
                namespace: Some(self.namespace()),
                labels: Some(self.labels.clone()),
                ..Default::default()
            },
            data: Some(
                data.into_iter()
                    .map(|(k, v)| (k, ByteString(v)))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    /// SANs of the HTTP certificate: the service DNS names plus user SANs
    pub fn expected_sans(&self) -> BTreeSet<String> {
        let ns = self.namespace();
        let svc = &self.service_name;
        let mut sans = BTreeSet::from([
            svc.clone(),
            format!("{svc}.{ns}"),
            format!("{svc}.{ns}.svc"),
        ]);
        for san in self.tls.subject_alt_names() {
            if let Some(dns) = san.dns.as_ref().filter(|d| !d.is_empty()) {
                sans.insert(dns.clone());
            }
            if let Some(ip) = san.ip.as_ref().and_then(|ip| ip.parse::<IpAddr>().ok()) {
                sans.insert(ip.to_string());
            }
        }
        sans
    }

    pub async fn reconcile(&self) -> Result<ReconciledCertificates> {
        if !self.tls.enabled() {
            return Ok(ReconciledCertificates::default());
        }
        if let Some(user_secret) = self.tls.user_certificate_secret() {
            return self.reconcile_user_certificate(user_secret).await;
        }

        let (ca_pem, ca_key_pem, ca_expiry) = self.reconcile_ca().await?;
        let cert_expiry = self.reconcile_http_certificate(&ca_pem, &ca_key_pem).await?;

        let next = until_rotation(ca_expiry, self.ca_rotation.rotate_before)
            .min(until_rotation(cert_expiry, self.cert_rotation.rotate_before));
        Ok(ReconciledCertificates {
            requeue_after: Some(next.to_std().unwrap_or_default()),
        })
    }

    async fn reconcile_ca(&self) -> Result<(String, String, DateTime<Utc>)> {
        let namespace = self.namespace();
        let name = ca_secret_name(&self.name_prefix);
        let observed: Option<Secret> = self.client.get(&namespace, &name).await?;

        let reusable = observed.as_ref().and_then(|secret| {
            let cert = secret_value(secret, CERT_FILE_NAME)?;
            let key = secret_value(secret, KEY_FILE_NAME)?;
            let parsed = parse_certificate(cert).ok()?;
            KeyPair::from_pem(std::str::from_utf8(key).ok()?).ok()?;
            (until_rotation(parsed.not_after, self.ca_rotation.rotate_before) > Duration::zero())
                .then(|| {
                    (
                        String::from_utf8_lossy(cert).into_owned(),
                        String::from_utf8_lossy(key).into_owned(),
                        parsed.not_after,
                    )
                })
        });

        let (cert, key, not_after) = match reusable {
            Some(ca) => ca,
            None => {
                info!(name = %name, namespace = %namespace, "Generating CA certificate");
                let (cert, key) = generate_ca(
                    &format!("{}-http", self.name_prefix),
                    self.ca_rotation.validity,
                )?;
                let not_after = parse_certificate(cert.as_bytes())?.not_after;
                (cert, key, not_after)
            }
        };

        let expected = self.secret(
            name,
            BTreeMap::from([
                (CERT_FILE_NAME.to_string(), cert.clone().into_bytes()),
                (KEY_FILE_NAME.to_string(), key.clone().into_bytes()),
            ]),
        );
        reconcile_secret(self.client, expected, self.owner).await?;
        Ok((cert, key, not_after))
    }

    async fn reconcile_http_certificate(&self, ca_pem: &str, ca_key_pem: &str) -> Result<DateTime<Utc>> {
        let namespace = self.namespace();
        let name = internal_certs_secret_name(&self.name_prefix);
        let sans = self.expected_sans();
        let observed: Option<Secret> = self.client.get(&namespace, &name).await?;

        let reusable = observed.as_ref().and_then(|secret| {
            let cert = secret_value(secret, CERT_FILE_NAME)?;
            let key = secret_value(secret, KEY_FILE_NAME)?;
            if secret_value(secret, CA_FILE_NAME)? != ca_pem.as_bytes() {
                return None;
            }
            let parsed = parse_certificate(cert).ok()?;
            (parsed.sans == sans
                && until_rotation(parsed.not_after, self.cert_rotation.rotate_before)
                    > Duration::zero())
            .then(|| (cert.to_vec(), key.to_vec(), parsed.not_after))
        });

        let (cert, key, not_after) = match reusable {
            Some(existing) => existing,
            None => {
                info!(name = %name, namespace = %namespace, "Generating HTTP certificate");
                let (cert, key) = generate_http_certificate(
                    &self.service_name,
                    &sans,
                    ca_pem,
                    ca_key_pem,
                    self.cert_rotation.validity,
                )?;
                let not_after = parse_certificate(cert.as_bytes())?.not_after;
                (cert.into_bytes(), key.into_bytes(), not_after)
            }
        };

        let expected = self.secret(
            name,
            BTreeMap::from([
                (CERT_FILE_NAME.to_string(), cert),
                (KEY_FILE_NAME.to_string(), key),
                (CA_FILE_NAME.to_string(), ca_pem.as_bytes().to_vec()),
            ]),
        );
        reconcile_secret(self.client, expected, self.owner).await?;
        Ok(not_after)
    }

    async fn reconcile_user_certificate(&self, user_secret: &str) -> Result<ReconciledCertificates> {
        let namespace = self.namespace();
        let secret: Secret = self
            .client
            .get(&namespace, user_secret)
            .await?
            .ok_or_else(|| OperatorError::NotFound {
                kind: "Secret".to_string(),
                name: user_secret.to_string(),
                namespace: namespace.clone(),
            })?;

        let mut data = BTreeMap::new();
        for key in [CERT_FILE_NAME, KEY_FILE_NAME] {
            let value = secret_value(&secret, key).ok_or_else(|| {
                OperatorError::InvalidConfig(format!("{key} missing in secret {user_secret}"))
            })?;
            data.insert(key.to_string(), value.to_vec());
        }
        if let Some(ca) = secret_value(&secret, CA_FILE_NAME) {
            data.insert(CA_FILE_NAME.to_string(), ca.to_vec());
        }

        let expected = self.secret(internal_certs_secret_name(&self.name_prefix), data);
        reconcile_secret(self.client, expected, self.owner).await?;
        Ok(ReconciledCertificates::default())
    }
}
