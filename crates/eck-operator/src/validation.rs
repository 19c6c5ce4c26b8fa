//! Structural checks shared by the admission path and the reconcilers

use crate::crd::common::{DISABLE_DOWNGRADE_VALIDATION_ANNOTATION, LAST_APPLIED_CONFIGURATION_ANNOTATION};
use crate::error::{OperatorError, Result};
use crate::version::{self, VersionRange};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Longest resource name accepted, leaving room for generated suffixes
pub const MAX_NAME_LENGTH: usize = 36;

/// A single rejected field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Fold field errors into a single validation error
pub fn into_result(errors: Vec<FieldError>) -> Result<()> {
    if errors.is_empty() {
        return Ok(());
    }
    Err(OperatorError::ValidationError(
        errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; "),
    ))
}

/// Flatten `validator` derive errors
pub fn from_validator(errors: &validator::ValidationErrors) -> Vec<FieldError> {
    errors
        .field_errors()
        .iter()
        .flat_map(|(field, errs)| {
            errs.iter().map(move |e| {
                let message = e
                    .message
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| e.code.to_string());
                FieldError::new(format!("spec.{field}"), message)
            })
        })
        .collect()
}

pub fn check_name_length(name: &str) -> Option<FieldError> {
    (name.len() > MAX_NAME_LENGTH).then(|| {
        FieldError::new(
            "metadata.name",
            format!("name exceeds maximum allowed length of {MAX_NAME_LENGTH}"),
        )
    })
}

pub fn check_supported_version(version: &str, supported: &VersionRange) -> Option<FieldError> {
    match version::parse(version) {
        Err(e) => Some(FieldError::new("spec.version", e.to_string())),
        Ok(v) if !supported.contains(&v) => Some(FieldError::new(
            "spec.version",
            format!(
                "Unsupported version: {v} is not between {} and {}",
                supported.min, supported.max
            ),
        )),
        Ok(_) => None,
    }
}

/// Reject version decreases unless explicitly allowed by annotation
pub fn check_no_downgrade(
    annotations: Option<&BTreeMap<String, String>>,
    current: Option<&str>,
    proposed: &str,
) -> Option<FieldError> {
    let allowed = annotations
        .and_then(|a| a.get(DISABLE_DOWNGRADE_VALIDATION_ANNOTATION))
        .is_some_and(|v| v == "true");
    if allowed {
        return None;
    }
    let current = current.filter(|c| !c.is_empty())?;
    match (version::parse(current), version::parse(proposed)) {
        (Ok(current), Ok(proposed)) if proposed < current => Some(FieldError::new(
            "spec.version",
            "Downgrades are not supported",
        )),
        _ => None,
    }
}

/// Detect fields of the last applied configuration that the spec type drops.
///
/// Only runs when the last applied spec is the one currently in effect, so a
/// stale annotation never blocks reconciliation.
pub fn check_no_unknown_fields<S>(
    annotations: Option<&BTreeMap<String, String>>,
    spec: &S,
) -> Vec<FieldError>
where
    S: Serialize + DeserializeOwned + PartialEq,
{
    let Some(raw) = annotations.and_then(|a| a.get(LAST_APPLIED_CONFIGURATION_ANNOTATION)) else {
        return vec![];
    };
    let Ok(applied) = serde_json::from_str::<Value>(raw) else {
        return vec![];
    };
    let Some(applied_spec) = applied.get("spec") else {
        return vec![];
    };
    let Ok(parsed) = serde_json::from_value::<S>(applied_spec.clone()) else {
        return vec![];
    };
    if parsed != *spec {
        return vec![];
    }
    let Ok(known) = serde_json::to_value(&parsed) else {
        return vec![];
    };

    let mut errors = Vec::new();
    collect_unknown("spec", applied_spec, &known, &mut errors);
    errors
}

fn is_empty_value(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

fn collect_unknown(path: &str, applied: &Value, known: &Value, errors: &mut Vec<FieldError>) {
    match (applied, known) {
        (Value::Object(applied), Value::Object(known)) => {
            for (key, value) in applied {
                let child = format!("{path}.{key}");
                match known.get(key) {
                    Some(known_value) => collect_unknown(&child, value, known_value, errors),
                    None if !is_empty_value(value) => {
                        errors.push(FieldError::new(child, "unknown field"));
                    }
                    None => {}
                }
            }
        }
        (Value::Array(applied), Value::Array(known)) => {
            for (i, (a, k)) in applied.iter().zip(known.iter()).enumerate() {
                collect_unknown(&format!("{path}[{i}]"), a, k, errors);
            }
        }
        _ => {}
    }
}
