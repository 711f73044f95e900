//! Instance model and the interfaces of the instance backend.
//!
//! Instances are owned by the node that runs them. The listing engine only
//! reads projections of them:
//! - [`InstanceSummary`] from [`Instance::render`]
//! - [`InstanceFull`] from [`Instance::render_full`]
//!
//! Local instances are obtained through an [`InstanceSource`].

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use fleet_filter::FilterTarget;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Kind of workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceType {
    /// Any kind; used as a query wildcard.
    #[default]
    Any,
    Container,
    VirtualMachine,
}

impl InstanceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceType::Any => "",
            InstanceType::Container => "container",
            InstanceType::VirtualMachine => "virtual-machine",
        }
    }

    /// Returns true if an instance of type `other` satisfies this query type.
    pub fn matches(&self, other: InstanceType) -> bool {
        *self == InstanceType::Any || *self == other
    }
}

impl fmt::Display for InstanceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned for an unrecognized instance type name.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid instance type '{0}'")]
pub struct InvalidInstanceType(pub String);

impl FromStr for InstanceType {
    type Err = InvalidInstanceType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "any" => Ok(InstanceType::Any),
            "container" => Ok(InstanceType::Container),
            "virtual-machine" => Ok(InstanceType::VirtualMachine),
            other => Err(InvalidInstanceType(other.to_string())),
        }
    }
}

/// Numeric lifecycle status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub enum StatusCode {
    Stopped = 102,
    Running = 103,
    Pending = 105,
    Starting = 106,
    Stopping = 107,
    Freezing = 109,
    Frozen = 110,
    Thawed = 111,
    Error = 112,
}

impl StatusCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusCode::Stopped => "Stopped",
            StatusCode::Running => "Running",
            StatusCode::Pending => "Pending",
            StatusCode::Starting => "Starting",
            StatusCode::Stopping => "Stopping",
            StatusCode::Freezing => "Freezing",
            StatusCode::Frozen => "Frozen",
            StatusCode::Thawed => "Thawed",
            StatusCode::Error => "Error",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<StatusCode> for u16 {
    fn from(code: StatusCode) -> Self {
        code as u16
    }
}

impl TryFrom<u16> for StatusCode {
    type Error = String;

    fn try_from(value: u16) -> Result<Self, String> {
        match value {
            102 => Ok(StatusCode::Stopped),
            103 => Ok(StatusCode::Running),
            105 => Ok(StatusCode::Pending),
            106 => Ok(StatusCode::Starting),
            107 => Ok(StatusCode::Stopping),
            109 => Ok(StatusCode::Freezing),
            110 => Ok(StatusCode::Frozen),
            111 => Ok(StatusCode::Thawed),
            112 => Ok(StatusCode::Error),
            other => Err(format!("unknown instance status code {other}")),
        }
    }
}

impl FromStr for StatusCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Stopped" => Ok(StatusCode::Stopped),
            "Running" => Ok(StatusCode::Running),
            "Pending" => Ok(StatusCode::Pending),
            "Starting" => Ok(StatusCode::Starting),
            "Stopping" => Ok(StatusCode::Stopping),
            "Freezing" => Ok(StatusCode::Freezing),
            "Frozen" => Ok(StatusCode::Frozen),
            "Thawed" => Ok(StatusCode::Thawed),
            "Error" => Ok(StatusCode::Error),
            other => Err(format!("unknown instance status '{other}'")),
        }
    }
}

/// Lightweight projection of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSummary {
    /// Instance name, unique within its project.
    pub name: String,

    /// Human-readable status (the status code's name).
    pub status: String,

    /// Numeric status code.
    pub status_code: StatusCode,

    /// Name of the node that owns the instance.
    pub location: String,

    #[serde(rename = "type", default)]
    pub instance_type: InstanceType,

    #[serde(default)]
    pub project: String,

    /// Flattened configuration including inherited profile keys.
    #[serde(default)]
    pub expanded_config: BTreeMap<String, String>,
}

impl InstanceSummary {
    /// Placeholder for an instance whose state could not be obtained.
    pub fn error(name: &str, location: &str) -> Self {
        Self {
            name: name.to_string(),
            status: StatusCode::Error.to_string(),
            status_code: StatusCode::Error,
            location: location.to_string(),
            instance_type: InstanceType::Any,
            project: String::new(),
            expanded_config: BTreeMap::new(),
        }
    }
}

/// Runtime state reported in full records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRuntimeState {
    pub status: String,
    pub status_code: StatusCode,
    pub pid: i64,
    pub processes: i64,
}

/// Summary plus extended state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceFull {
    #[serde(flatten)]
    pub instance: InstanceSummary,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<InstanceRuntimeState>,

    /// Snapshot names (`<instance>/<snapshot>`).
    #[serde(default)]
    pub snapshots: Vec<String>,
}

impl InstanceFull {
    /// Placeholder for an instance whose state could not be obtained.
    pub fn error(name: &str, location: &str) -> Self {
        Self {
            instance: InstanceSummary::error(name, location),
            state: None,
            snapshots: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.instance.name
    }
}

impl FilterTarget for InstanceSummary {
    fn name(&self) -> &str {
        &self.name
    }

    fn config_value(&self, key: &str) -> Option<Cow<'_, str>> {
        self.expanded_config.get(key).map(|v| Cow::Borrowed(v.as_str()))
    }
}

impl FilterTarget for InstanceFull {
    fn name(&self) -> &str {
        &self.instance.name
    }

    fn config_value(&self, key: &str) -> Option<Cow<'_, str>> {
        self.instance.config_value(key)
    }
}

/// Arguments for an in-place configuration update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceArgs {
    pub architecture: u32,
    pub config: BTreeMap<String, String>,
    pub devices: BTreeMap<String, BTreeMap<String, String>>,
    pub ephemeral: bool,
    pub profiles: Vec<String>,
}

/// Failure to render an instance's state.
#[derive(Debug, Clone, Error)]
#[error("failed to render instance {name}: {reason}")]
pub struct RenderError {
    pub name: String,
    pub reason: String,
}

impl RenderError {
    pub fn new(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// Failures of mutating instance operations.
#[derive(Debug, Clone, Error)]
pub enum InstanceError {
    #[error("failed to update instance {name}: {reason}")]
    Update { name: String, reason: String },

    #[error("failed to restore instance {name} from {snapshot}: {reason}")]
    Restore {
        name: String,
        snapshot: String,
        reason: String,
    },
}

/// Failures loading local instances.
#[derive(Debug, Clone, Error)]
pub enum LoadError {
    #[error("instance {project}/{name} not found")]
    NotFound { project: String, name: String },

    #[error("failed to load instances: {0}")]
    Backend(String),
}

/// A workload instance hosted on this node.
#[async_trait]
pub trait Instance: Send + Sync {
    fn name(&self) -> &str;

    fn project(&self) -> &str;

    fn instance_type(&self) -> InstanceType;

    /// Configuration with profile keys flattened in.
    fn expanded_config(&self) -> BTreeMap<String, String>;

    /// Names of the instance's snapshots (`<instance>/<snapshot>`).
    fn snapshots(&self) -> Vec<String>;

    /// Render the summary projection along with its etag.
    async fn render(&self) -> Result<(InstanceSummary, String), RenderError>;

    /// Render the full projection.
    async fn render_full(&self) -> Result<InstanceFull, RenderError>;

    /// Apply a configuration update.
    async fn update(&self, args: InstanceArgs) -> Result<(), InstanceError>;

    /// Roll the instance back to the named snapshot.
    async fn restore(&self, snapshot: &str) -> Result<(), InstanceError>;
}

impl FilterTarget for dyn Instance {
    fn name(&self) -> &str {
        Instance::name(self)
    }

    fn config_value(&self, key: &str) -> Option<Cow<'_, str>> {
        self.expanded_config().remove(key).map(Cow::Owned)
    }
}

/// Access to the instances hosted on this node.
#[async_trait]
pub trait InstanceSource: Send + Sync {
    /// Load every local instance of a project matching the type.
    async fn load_node_project_all(
        &self,
        project: &str,
        instance_type: InstanceType,
    ) -> Result<Vec<Arc<dyn Instance>>, LoadError>;

    /// Load a single local instance.
    async fn load_by_project_and_name(
        &self,
        project: &str,
        name: &str,
    ) -> Result<Arc<dyn Instance>, LoadError>;
}

/// A target that only knows its name, for instances whose state is unknown.
#[derive(Debug, Clone, Copy)]
pub struct NameOnly<'a>(pub &'a str);

impl FilterTarget for NameOnly<'_> {
    fn name(&self) -> &str {
        self.0
    }

    fn config_value(&self, _key: &str) -> Option<Cow<'_, str>> {
        None
    }
}
