//! Record shapes carried over the RecordIO wire protocol.
//!
//! These are a self-contained, `serde`-derived schema, not a port of the
//! real Mesos `ContainerizerLaunch`/`ContainerStatus` protobufs -- the
//! protobuf wire format is explicitly out of scope (see SPEC_FULL.md §1);
//! this is the minimal shape the adapter needs to move the same
//! information across stdin/stdout.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UriSpec {
    pub value: String,
    pub executable: bool,
    pub extract: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortRange {
    pub begin: u32,
    pub end: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Resources {
    pub cpus: Option<f64>,
    pub mem_mb: Option<f64>,
    pub ports: Vec<PortRange>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandInfo {
    pub value: Option<String>,
    pub arguments: Vec<String>,
    pub shell: bool,
    pub container_image: Option<String>,
    pub container_options: Vec<String>,
    pub uris: Vec<UriSpec>,
    pub environment: Vec<EnvVar>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchRecord {
    pub container_id: String,
    pub task_name: Option<String>,
    pub user: Option<String>,
    pub directory: Option<String>,
    pub executor_id: Option<String>,
    pub executor_command: Option<CommandInfo>,
    pub executor_resources: Resources,
    pub task_command: Option<CommandInfo>,
    pub task_resources: Resources,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitRecord {
    pub container_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub container_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestroyRecord {
    pub container_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRecord {
    pub container_id: String,
    pub resources: Resources,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusRecord {
    pub ok: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminationRecord {
    pub killed: bool,
    pub status: i32,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResourceStatisticsRecord {
    pub timestamp: f64,
    pub mem_limit_bytes: Option<u64>,
    pub mem_rss_bytes: Option<u64>,
    pub cpus_limit: Option<f64>,
    pub cpus_user_time_secs: Option<f64>,
    pub cpus_system_time_secs: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContainersRecord {
    pub containers: Vec<String>,
}
