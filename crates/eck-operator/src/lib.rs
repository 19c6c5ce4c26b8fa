//! # ECK Operator core
//!
//! Control loops of an Elastic Cloud on Kubernetes style operator:
//!
//! - **Elasticsearch disruption budgets**: one default PodDisruptionBudget per
//!   cluster, or one per role group when enterprise features are licensed, sized
//!   from the cluster health and the realized StatefulSets.
//! - **Enterprise Search orchestration**: configuration secret, self-signed
//!   HTTP certificates, Service, Deployment rolled on configuration fingerprint
//!   changes, and the read-only mode handshake around version upgrades.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use eck_operator::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = kube::Client::try_default().await?;
//!     let config = OperatorConfig::default();
//!     run_enterprise_search_controller(KubeClient::new(client, "enterprisesearch"), config).await
//! }
//! ```
//!
//! ## Modules
//!
//! - [`crd`] - Custom resources (`Elasticsearch`, `EnterpriseSearch` v1 and v1beta1)
//! - [`elasticsearch`] - Elasticsearch controller and PodDisruptionBudget planner
//! - [`enterprisesearch`] - Enterprise Search controller and its building blocks
//! - [`k8s`] - API server access behind the [`k8s::K8sClient`] trait
//! - [`reconciler`] - Create-or-update helpers shared by the controllers
//! - [`error`] - Error types for operator operations
//!
//! ## Metrics
//!
//! Each controller records:
//!
//! - `<controller>_reconciliations_total`
//! - `<controller>_reconciliation_errors_total`
//! - `<controller>_reconciliation_duration_seconds`

pub mod association;
pub mod certificates;
pub mod config;
pub mod controller;
pub mod crd;
pub mod elasticsearch;
pub mod enterprisesearch;
pub mod error;
pub mod hash;
pub mod k8s;
pub mod labels;
pub mod license;
pub mod metrics;
pub mod reconciler;
pub mod settings;
pub mod validation;
pub mod version;
pub mod watches;

pub mod prelude {
    //! Re-exports for convenient usage
    pub use crate::config::{IpFamily, OperatorConfig};
    pub use crate::crd::elasticsearch::{Elasticsearch, ElasticsearchSpec, ElasticsearchStatus};
    pub use crate::crd::enterprisesearch::v1::{
        EnterpriseSearch, EnterpriseSearchSpec, EnterpriseSearchStatus,
    };
    pub use crate::elasticsearch::controller::run_controller as run_elasticsearch_controller;
    pub use crate::enterprisesearch::controller::run_controller as run_enterprise_search_controller;
    pub use crate::error::{OperatorError, Result};
    pub use crate::k8s::{K8sClient, KubeClient};
    pub use crate::license::{LicenseChecker, SecretLicenseChecker};
}
