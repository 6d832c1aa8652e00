use crate::util::errors::Error;
use prometheus::{histogram_opts, opts, HistogramVec, IntCounter, IntCounterVec, Registry};
use tokio::time::Instant;

#[derive(Clone)]
pub struct Metrics {
    pub reconciliations: IntCounter,
    pub failures: IntCounterVec,
    pub reconcile_duration: HistogramVec,
    pub vcl_reloads: IntCounterVec,
}

impl Default for Metrics {
    fn default() -> Self {
        let reconcile_duration = HistogramVec::new(
            histogram_opts!(
                "controller_reconcile_duration_seconds",
                "The duration of reconcile to complete in seconds",
            )
            .buckets(vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.]),
            &["instance"],
        )
        .unwrap_or_else(|e| panic!("invalid histogram definition: {e}"));
        let failures = IntCounterVec::new(
            opts!("controller_reconciliation_errors_total", "reconciliation errors",),
            &["instance", "error"],
        )
        .unwrap_or_else(|e| panic!("invalid counter definition: {e}"));
        let reconciliations = IntCounter::new("reconciliations_total", "reconciliations")
            .unwrap_or_else(|e| panic!("invalid counter definition: {e}"));
        let vcl_reloads = IntCounterVec::new(
            opts!("varnish_vcl_reloads_total", "VCL reloads by outcome"),
            &["result"],
        )
        .unwrap_or_else(|e| panic!("invalid counter definition: {e}"));
        Metrics {
            reconciliations,
            failures,
            reconcile_duration,
            vcl_reloads,
        }
    }
}

impl Metrics {
    /// Register API metrics to start tracking them.
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.reconciliations.clone()))?;
        registry.register(Box::new(self.vcl_reloads.clone()))?;
        Ok(self)
    }

    pub fn reconcile_failure(&self, instance: &str, e: &Error) {
        self.failures
            .with_label_values(&[instance, e.metric_label().as_ref()])
            .inc()
    }

    pub fn vcl_reload(&self, result: &str) {
        self.vcl_reloads.with_label_values(&[result]).inc()
    }

    pub fn count_and_measure(&self, controller: &str) -> ReconcileMeasurer {
        self.reconciliations.inc();
        ReconcileMeasurer {
            start: Instant::now(),
            metric: self.reconcile_duration.clone(),
            instance: controller.to_string(),
        }
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct ReconcileMeasurer {
    start: Instant,
    metric: HistogramVec,
    instance: String,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric
            .with_label_values(&[self.instance.as_str()])
            .observe(duration);
    }
}
