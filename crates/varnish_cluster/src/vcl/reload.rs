//! Drives the running varnishd through named VCL reloads.
//!
//! The process owns its configurations; this module only lists them and asks for a
//! new one to be loaded. Varnish decides what becomes active.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder};
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

use crate::util::errors::{Error, Result, StdError};

pub const VCL_VERSION_PREFIX: &str = "v";
/// Line varnishadm prints when the new VCL does not compile
pub const COMPILATION_FAILED_MARKER: &str = "VCL compilation failed";

pub const REASON_VCL_COMPILATION_ERROR: &str = "VCLCompilationError";
pub const REASON_RELOAD_ERROR: &str = "ReloadError";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VclStatus {
    Available,
    Active,
    Other(String),
}

impl From<&str> for VclStatus {
    fn from(s: &str) -> Self {
        match s {
            "available" => VclStatus::Available,
            "active" => VclStatus::Active,
            other => VclStatus::Other(other.to_string()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Temperature {
    Cold,
    Warm,
    Other(String),
}

impl From<&str> for Temperature {
    fn from(s: &str) -> Self {
        match s {
            "cold" => Temperature::Cold,
            "warm" => Temperature::Warm,
            other => Temperature::Other(other.to_string()),
        }
    }
}

/// One line of `vcl.list`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VclConfig {
    pub name: String,
    pub status: VclStatus,
    pub temperature: Temperature,
    pub is_label: bool,
    /// The configuration a label points at, labels only
    pub referenced_vcl: Option<String>,
}

/// Parses `vcl.list` output.
///
/// Four columns is a plain configuration; six is either a labelled configuration or a
/// label, told apart by a `label/<temperature>` state column.
pub fn parse_vcl_list(output: &str) -> Vec<VclConfig> {
    let mut configs = Vec::new();
    for line in output.lines() {
        let columns: Vec<&str> = line.split_whitespace().collect();
        let (state, temperature) = match columns.get(1).map(|c| c.split_once('/')) {
            Some(Some(parts)) => parts,
            _ if columns.is_empty() => continue,
            _ => {
                warn!(%line, "unknown VCL config format");
                continue;
            }
        };
        let config = match columns.len() {
            4 => VclConfig {
                name: columns[3].to_string(),
                status: columns[0].into(),
                temperature: temperature.into(),
                is_label: false,
                referenced_vcl: None,
            },
            6 => {
                let is_label = state == "label";
                VclConfig {
                    name: columns[3].to_string(),
                    status: columns[0].into(),
                    temperature: temperature.into(),
                    is_label,
                    referenced_vcl: is_label.then(|| columns[5].to_string()),
                }
            }
            _ => {
                warn!(%line, "unknown VCL config format");
                continue;
            }
        };
        configs.push(config);
    }
    configs
}

/// `v-<revision>-<unix seconds>`; varnish rejects names starting with a digit
pub fn vcl_config_name(source_revision: &str, now: DateTime<Utc>) -> String {
    format!("{VCL_VERSION_PREFIX}-{source_revision}-{}", now.timestamp())
}

/// The revision a generated name was built from, empty when the name was not generated.
pub fn config_name_to_source_revision(name: &str) -> String {
    let Some(rest) = name.strip_prefix(VCL_VERSION_PREFIX).and_then(|r| r.strip_prefix('-')) else {
        return String::new();
    };
    match rest.rsplit_once('-') {
        Some((revision, timestamp))
            if !revision.is_empty() && !timestamp.is_empty() && timestamp.bytes().all(|b| b.is_ascii_digit()) =>
        {
            revision.to_string()
        }
        _ => String::new(),
    }
}

/// Exit status of a finished command, with its stderr appended after its stdout
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub output: String,
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &str, args: &[String]) -> Result<CommandOutput, StdError>;
}

/// Runs commands as child processes, killed after `timeout`
pub struct ProcessRunner {
    pub timeout: Duration,
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, command: &str, args: &[String]) -> Result<CommandOutput, StdError> {
        let mut words = command.split_whitespace();
        let program = words
            .next()
            .ok_or_else(|| StdError::CommandError("empty command".to_string()))?;
        let mut cmd = Command::new(program);
        cmd.args(words).args(args).kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| StdError::CommandError(format!("{command} timed out after {:?}", self.timeout)))?
            .map_err(|e| StdError::CommandError(format!("could not run {command}: {e}")))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(CommandOutput {
            success: output.status.success(),
            output: combined,
        })
    }
}

/// Where warning events about reloads go
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn warning(&self, target: &ObjectReference, reason: &str, note: String);
}

#[async_trait]
impl EventSink for Recorder {
    async fn warning(&self, target: &ObjectReference, reason: &str, note: String) {
        let event = Event {
            type_: EventType::Warning,
            reason: reason.into(),
            note: Some(note),
            action: "Reloading".into(),
            secondary: None,
        };
        if let Err(e) = self.publish(&event, target).await {
            warn!("failed to publish {reason} event: {e}");
        }
    }
}

/// The objects a failed reload is reported on
pub struct ReloadTargets<'a> {
    pub pod: &'a ObjectReference,
    pub cluster: &'a ObjectReference,
}

pub struct VarnishAdmin<R> {
    runner: R,
    list_command: String,
    reload_command: String,
}

impl<R: CommandRunner> VarnishAdmin<R> {
    pub fn new(runner: R, list_command: &str, reload_command: &str) -> Self {
        Self {
            runner,
            list_command: list_command.to_string(),
            reload_command: reload_command.to_string(),
        }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub async fn list_configurations(&self) -> Result<Vec<VclConfig>> {
        let out = self.runner.run(&self.list_command, &[]).await?;
        if !out.success {
            return Err(StdError::CommandError(format!("{} failed: {}", self.list_command, out.output)).into());
        }
        Ok(parse_vcl_list(&out.output))
    }

    /// The configuration serving traffic. None right after varnishd starts, which
    /// callers retry rather than fail on.
    pub async fn current_active_configuration(&self) -> Result<VclConfig> {
        self.list_configurations()
            .await?
            .into_iter()
            .find(|c| c.status == VclStatus::Active)
            .ok_or_else(|| Error::from(StdError::NotFound("No active VCL configuration found".to_string())))
    }

    /// Loads and activates `name`, reporting failures as events on the pod and the cluster.
    pub async fn reload(&self, name: &str, targets: &ReloadTargets<'_>, events: &dyn EventSink) -> Result<()> {
        let pod_name = targets.pod.name.clone().unwrap_or_default();
        let output = match self.runner.run(&self.reload_command, &[name.to_string()]).await {
            Ok(out) if out.success => {
                info!(vcl = %name, "Reloaded VCL");
                return Ok(());
            }
            Ok(out) => out.output,
            Err(e) => e.to_string(),
        };

        if is_compilation_error(&output) {
            events
                .warning(
                    targets.pod,
                    REASON_VCL_COMPILATION_ERROR,
                    "VCL compilation failed. See logs for details".to_string(),
                )
                .await;
            events
                .warning(
                    targets.cluster,
                    REASON_VCL_COMPILATION_ERROR,
                    format!("VCL compilation failed for pod {pod_name}. See pod logs for details"),
                )
                .await;
            Err(StdError::VclCompilationError(output).into())
        } else {
            events
                .warning(
                    targets.pod,
                    REASON_RELOAD_ERROR,
                    "Varnish reload failed. See logs for details".to_string(),
                )
                .await;
            events
                .warning(
                    targets.cluster,
                    REASON_RELOAD_ERROR,
                    format!("Varnish reload failed for pod {pod_name}. See pod logs for details"),
                )
                .await;
            Err(StdError::VclReloadError(output).into())
        }
    }
}

/// varnishadm prints the marker on a line of its own. Output that merely quotes it,
/// such as a reload script echoing an earlier error, is a plain reload failure.
fn is_compilation_error(output: &str) -> bool {
    output.lines().any(|line| line.trim_end() == COMPILATION_FAILED_MARKER)
}
