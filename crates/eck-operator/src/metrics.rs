//! Reconciliation metrics, one set per controller

/// Metrics recorded by a controller
#[derive(Clone)]
pub struct ControllerMetrics {
    /// Counter for reconciliation attempts
    pub reconciliations: metrics::Counter,
    /// Counter for reconciliation errors
    pub errors: metrics::Counter,
    /// Histogram for reconciliation duration
    pub duration: metrics::Histogram,
}

impl ControllerMetrics {
    /// Register the metrics of `controller`, e.g. `enterprisesearch`
    pub fn new(controller: &str) -> Self {
        Self {
            reconciliations: metrics::counter!(format!("{controller}_reconciliations_total")),
            errors: metrics::counter!(format!("{controller}_reconciliation_errors_total")),
            duration: metrics::histogram!(format!(
                "{controller}_reconciliation_duration_seconds"
            )),
        }
    }
}
