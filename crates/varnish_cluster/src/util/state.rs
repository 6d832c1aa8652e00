use chrono::{DateTime, Utc};
use kube::{
    client::Client,
    runtime::events::{Recorder, Reporter},
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::util::metrics::Metrics;

/// State shared between a controller and the web server
#[derive(Clone)]
pub struct State {
    /// Diagnostics populated by the reconciler
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    registry: prometheus::Registry,
}

impl State {
    pub fn new(reporter: &str) -> Self {
        Self {
            diagnostics: Arc::new(RwLock::new(Diagnostics::new(reporter))),
            registry: prometheus::Registry::default(),
        }
    }

    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    pub fn diagnostics_handle(&self) -> Arc<RwLock<Diagnostics>> {
        self.diagnostics.clone()
    }

    /// Metrics registered against this state's registry
    pub fn register_metrics(&self) -> Result<Metrics, prometheus::Error> {
        Metrics::default().register(&self.registry)
    }
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    /// Name of the last VCL configuration this process activated, sidecar only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_vcl: Option<String>,
    #[serde(skip)]
    pub reporter: Reporter,
}

impl Diagnostics {
    pub fn new(reporter: &str) -> Self {
        Self {
            last_event: Utc::now(),
            active_vcl: None,
            reporter: reporter.into(),
        }
    }

    pub fn recorder(&self, client: Client) -> Recorder {
        Recorder::new(client, self.reporter.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn diagnostics_are_shared_with_the_handle() {
        let state = State::new("varnish-operator");
        state.diagnostics_handle().write().await.active_vcl = Some("v-12-1700000000".into());

        let diagnostics = state.diagnostics().await;
        assert_eq!(diagnostics.active_vcl.as_deref(), Some("v-12-1700000000"));
        assert_eq!(diagnostics.reporter.controller, "varnish-operator");
    }

    #[test]
    fn metrics_register_once_per_registry() {
        let state = State::new("varnish-operator");
        state.register_metrics().unwrap();
        assert!(state.register_metrics().is_err());
    }
}
