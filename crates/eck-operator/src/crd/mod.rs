//! Custom Resource Definitions managed by the operator
//!
//! - [`elasticsearch::Elasticsearch`]: the cluster whose disruption budgets are planned here
//! - [`enterprisesearch::v1::EnterpriseSearch`]: storage version of Enterprise Search
//! - [`enterprisesearch::v1beta1::EnterpriseSearch`]: older served version, converted on read

pub mod common;
pub mod elasticsearch;
pub mod enterprisesearch;

use kube::core::crd::merge_crds;
use kube::CustomResourceExt;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;

use crate::error::{OperatorError, Result};

/// Every CRD served by the operator, with multi-version kinds merged
pub fn all_crds() -> Result<Vec<CustomResourceDefinition>> {
    let ent = merge_crds(
        vec![
            enterprisesearch::v1::EnterpriseSearch::crd(),
            enterprisesearch::v1beta1::EnterpriseSearch::crd(),
        ],
        "v1",
    )
    .map_err(|e| OperatorError::Internal(format!("merging EnterpriseSearch CRDs: {e}")))?;

    Ok(vec![elasticsearch::Elasticsearch::crd(), ent])
}
