pub mod executor;
pub mod manager;
pub mod task_log;

pub use executor::RsyncExecutor;
pub use manager::RsyncManager;
pub use task_log::TaskLog;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    LocalToRemote,
    RemoteToLocal,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RemoteType {
    #[serde(rename = "ssh")]
    Ssh,
    /// rsync's own daemon protocol (`rsync://host/module/path`)
    #[serde(rename = "rsync", alias = "rsync-daemon")]
    Daemon,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    Password,
    Anonymous,
    PrivateKey,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Stopped,
}

impl fmt::Display for RemoteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteType::Ssh => f.write_str("ssh"),
            RemoteType::Daemon => f.write_str("rsync"),
        }
    }
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMode::Password => f.write_str("password"),
            AuthMode::Anonymous => f.write_str("anonymous"),
            AuthMode::PrivateKey => f.write_str("private_key"),
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// A configured rsync transfer and its persisted lifecycle.
///
/// Any combination of `remote_type` and `auth_mode` is accepted here; the
/// executor rejects invalid pairs when it builds the command line.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct RsyncTask {
    pub id: String,
    pub name: String,
    pub direction: SyncDirection,
    pub local_path: String,
    pub remote_type: RemoteType,
    pub remote_host: String,
    #[serde(default)]
    pub remote_port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    /// Path to the identity file, empty when unused
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ssh_private_key: String,
    pub auth_mode: AuthMode,
    #[serde(default)]
    pub remote_path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub module: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_error: String,
    #[serde(default)]
    pub attempt: u32,
}

impl RsyncTask {
    /// A fresh, unsaved task. Identity and lifecycle fields are assigned by
    /// the manager on creation.
    pub fn new(
        name: impl Into<String>,
        direction: SyncDirection,
        remote_type: RemoteType,
        auth_mode: AuthMode,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            name: name.into(),
            direction,
            local_path: String::new(),
            remote_type,
            remote_host: String::new(),
            remote_port: 0,
            username: String::new(),
            password: String::new(),
            ssh_private_key: String::new(),
            auth_mode,
            remote_path: String::new(),
            module: String::new(),
            created_at: now,
            updated_at: now,
            state: TaskState::Pending,
            last_error: String::new(),
            attempt: 0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == TaskState::Running
    }
}

// Hand-written so credentials never leak through `{:?}` in log lines.
impl fmt::Debug for RsyncTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redacted = |s: &str| if s.is_empty() { "" } else { "******" };
        f.debug_struct("RsyncTask")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("direction", &self.direction)
            .field("local_path", &self.local_path)
            .field("remote_type", &self.remote_type)
            .field("remote_host", &self.remote_host)
            .field("remote_port", &self.remote_port)
            .field("username", &self.username)
            .field("password", &redacted(&self.password))
            .field("ssh_private_key", &self.ssh_private_key)
            .field("auth_mode", &self.auth_mode)
            .field("remote_path", &self.remote_path)
            .field("module", &self.module)
            .field("state", &self.state)
            .field("last_error", &self.last_error)
            .field("attempt", &self.attempt)
            .finish()
    }
}
