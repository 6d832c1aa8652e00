//! Environment configuration for the operator and the per-pod VCL controller.
//!
//! Every field is read explicitly so a bad value names the variable it came from.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use k8s_openapi::api::core::v1::ObjectReference;
use thiserror::Error;

use crate::util::labels::parse_selector;
use crate::util::telemetry::LogFormat;

pub const VCL_CONFIG_DIR: &str = "/etc/varnish";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("required environment variable {0} is not set")]
    Missing(&'static str),

    #[error("environment variable {name} has invalid value '{value}': {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Source of raw configuration values, `std::env::var` in production.
pub trait EnvSource {
    fn get(&self, key: &str) -> Option<String>;
}

pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|v| !v.is_empty())
    }
}

impl EnvSource for BTreeMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        BTreeMap::get(self, key).cloned().filter(|v| !v.is_empty())
    }
}

fn required(env: &impl EnvSource, name: &'static str) -> Result<String, ConfigError> {
    env.get(name).ok_or(ConfigError::Missing(name))
}

fn optional_or(env: &impl EnvSource, name: &'static str, default: &str) -> String {
    env.get(name).unwrap_or_else(|| default.to_string())
}

fn parsed_or<T>(env: &impl EnvSource, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env.get(name) {
        None => Ok(default),
        Some(value) => value.parse::<T>().map_err(|e| ConfigError::Invalid {
            name,
            reason: e.to_string(),
            value,
        }),
    }
}

fn log_format(env: &impl EnvSource) -> Result<LogFormat, ConfigError> {
    parsed_or(env, "LOG_FORMAT", LogFormat::Json)
}

/// Settings of the operator deployment, also the source of `VarnishCluster` defaults.
#[derive(Clone, Debug, PartialEq)]
pub struct OperatorConfig {
    pub log_level: String,
    pub log_format: LogFormat,
    pub http_address: String,
    pub varnish_image: String,
    pub varnish_controller_image: String,
    pub varnish_metrics_exporter_image: String,
    pub image_pull_policy: String,
    pub requeue_interval: Duration,
}

impl OperatorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_source(&ProcessEnv)
    }

    pub fn from_source(env: &impl EnvSource) -> Result<Self, ConfigError> {
        Ok(Self {
            log_level: optional_or(env, "LOG_LEVEL", "info"),
            log_format: log_format(env)?,
            http_address: optional_or(env, "HTTP_ADDRESS", "0.0.0.0:8080"),
            varnish_image: optional_or(env, "VARNISH_IMAGE", "varnish:7.5"),
            varnish_controller_image: optional_or(
                env,
                "VARNISH_CONTROLLER_IMAGE",
                "ghcr.io/varnish-operator/varnish-controller:latest",
            ),
            varnish_metrics_exporter_image: optional_or(
                env,
                "VARNISH_METRICS_EXPORTER_IMAGE",
                "ghcr.io/varnish-operator/varnish-metrics-exporter:latest",
            ),
            image_pull_policy: optional_or(env, "IMAGE_PULL_POLICY", "IfNotPresent"),
            requeue_interval: Duration::from_secs(parsed_or(env, "REQUEUE_INTERVAL_SECONDS", 300u64)?),
        })
    }
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self::from_source(&BTreeMap::new()).unwrap_or_else(|e| panic!("defaults are valid: {e}"))
    }
}

/// Settings of the VCL controller sidecar, injected by the operator through the pod env.
#[derive(Clone, Debug, PartialEq)]
pub struct SidecarConfig {
    pub endpoint_selector: BTreeMap<String, String>,
    pub endpoint_selector_string: String,
    pub config_map_name: String,
    pub namespace: String,
    pub pod_name: String,
    pub varnish_cluster_name: String,
    pub varnish_cluster_uid: String,
    pub varnish_cluster_group: String,
    pub varnish_cluster_version: String,
    pub varnish_cluster_kind: String,
    pub log_level: String,
    pub log_format: LogFormat,
    pub http_address: String,
    pub vcl_dir: PathBuf,
    pub reload_command: String,
    pub list_command: String,
    pub command_timeout: Duration,
}

impl SidecarConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_source(&ProcessEnv)
    }

    pub fn from_source(env: &impl EnvSource) -> Result<Self, ConfigError> {
        let endpoint_selector_string = required(env, "ENDPOINT_SELECTOR_STRING")?;
        let endpoint_selector =
            parse_selector(&endpoint_selector_string).map_err(|reason| ConfigError::Invalid {
                name: "ENDPOINT_SELECTOR_STRING",
                value: endpoint_selector_string.clone(),
                reason,
            })?;

        Ok(Self {
            endpoint_selector,
            endpoint_selector_string,
            config_map_name: required(env, "CONFIGMAP_NAME")?,
            namespace: required(env, "NAMESPACE")?,
            pod_name: required(env, "POD_NAME")?,
            varnish_cluster_name: required(env, "VARNISH_CLUSTER_NAME")?,
            varnish_cluster_uid: required(env, "VARNISH_CLUSTER_UID")?,
            varnish_cluster_group: required(env, "VARNISH_CLUSTER_GROUP")?,
            varnish_cluster_version: required(env, "VARNISH_CLUSTER_VERSION")?,
            varnish_cluster_kind: required(env, "VARNISH_CLUSTER_KIND")?,
            log_level: optional_or(env, "LOG_LEVEL", "info"),
            log_format: log_format(env)?,
            http_address: optional_or(env, "HTTP_ADDRESS", "0.0.0.0:8235"),
            vcl_dir: PathBuf::from(optional_or(env, "VCL_DIR", VCL_CONFIG_DIR)),
            reload_command: optional_or(env, "VCL_RELOAD_COMMAND", "vcl_reload"),
            list_command: optional_or(env, "VCL_LIST_COMMAND", "vcl_list"),
            command_timeout: Duration::from_secs(parsed_or(env, "COMMAND_TIMEOUT_SECONDS", 60u64)?),
        })
    }

    /// The owning cluster as events refer to it
    pub fn cluster_reference(&self) -> ObjectReference {
        ObjectReference {
            api_version: Some(format!("{}/{}", self.varnish_cluster_group, self.varnish_cluster_version)),
            kind: Some(self.varnish_cluster_kind.clone()),
            name: Some(self.varnish_cluster_name.clone()),
            namespace: Some(self.namespace.clone()),
            uid: Some(self.varnish_cluster_uid.clone()),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sidecar_env() -> BTreeMap<String, String> {
        [
            ("ENDPOINT_SELECTOR_STRING", "varnish-component=no-cache-service,varnish-owner=web"),
            ("CONFIGMAP_NAME", "web-vcl-files"),
            ("NAMESPACE", "default"),
            ("POD_NAME", "web-varnish-0"),
            ("VARNISH_CLUSTER_NAME", "web"),
            ("VARNISH_CLUSTER_UID", "1234"),
            ("VARNISH_CLUSTER_GROUP", "caching.varnish-operator.io"),
            ("VARNISH_CLUSTER_VERSION", "v1alpha1"),
            ("VARNISH_CLUSTER_KIND", "VarnishCluster"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn sidecar_config_reads_required_fields_and_defaults() {
        let cfg = SidecarConfig::from_source(&sidecar_env()).unwrap();
        assert_eq!(cfg.endpoint_selector.get("varnish-owner").unwrap(), "web");
        assert_eq!(cfg.vcl_dir, PathBuf::from("/etc/varnish"));
        assert_eq!(cfg.log_format, LogFormat::Json);
        assert_eq!(cfg.command_timeout, Duration::from_secs(60));
    }

    #[test]
    fn cluster_reference_is_built_from_the_owner_env() {
        let reference = SidecarConfig::from_source(&sidecar_env()).unwrap().cluster_reference();
        assert_eq!(reference.api_version.as_deref(), Some("caching.varnish-operator.io/v1alpha1"));
        assert_eq!(reference.kind.as_deref(), Some("VarnishCluster"));
        assert_eq!(reference.name.as_deref(), Some("web"));
        assert_eq!(reference.namespace.as_deref(), Some("default"));
        assert_eq!(reference.uid.as_deref(), Some("1234"));
    }

    #[test]
    fn missing_required_field_is_named() {
        let mut env = sidecar_env();
        env.remove("POD_NAME");
        assert_eq!(
            SidecarConfig::from_source(&env).unwrap_err(),
            ConfigError::Missing("POD_NAME")
        );
    }

    #[test]
    fn invalid_values_are_typed_per_field() {
        let mut env = sidecar_env();
        env.insert("COMMAND_TIMEOUT_SECONDS".into(), "soon".into());
        match SidecarConfig::from_source(&env).unwrap_err() {
            ConfigError::Invalid { name, value, .. } => {
                assert_eq!(name, "COMMAND_TIMEOUT_SECONDS");
                assert_eq!(value, "soon");
            }
            other => panic!("unexpected error {other:?}"),
        }

        let mut env = sidecar_env();
        env.insert("LOG_FORMAT".into(), "xml".into());
        assert!(matches!(
            SidecarConfig::from_source(&env),
            Err(ConfigError::Invalid { name: "LOG_FORMAT", .. })
        ));
    }

    #[test]
    fn operator_config_defaults() {
        let cfg = OperatorConfig::default();
        assert_eq!(cfg.http_address, "0.0.0.0:8080");
        assert_eq!(cfg.requeue_interval, Duration::from_secs(300));
        assert!(cfg.varnish_metrics_exporter_image.contains("varnish-metrics-exporter"));
    }
}
