use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use once_cell::sync::Lazy;
use regex::Regex;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, error, info, warn};

use super::{AuthMode, RemoteType, RsyncTask, SyncDirection, TaskLog};

const MODERN_ARGS: &[&str] = &["-azv", "--info=progress2", "--partial", "--stats"];
const LEGACY_ARGS: &[&str] = &["-azv", "--progress", "--partial", "--stats"];

static VERSION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"version\s+(\d+)\.(\d+)\.(\d+)").expect("valid rsync version pattern"));

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("unsupported authentication mode for {transport}: {auth_mode}")]
    UnsupportedAuthMode {
        transport: &'static str,
        auth_mode: AuthMode,
    },
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("failed to open task log: {0}")]
    Log(#[source] io::Error),

    #[error("failed to start rsync: {0}")]
    Spawn(#[source] io::Error),

    #[error("failed to wait for rsync: {0}")]
    Wait(#[source] io::Error),

    #[error("rsync exited with {0}")]
    Exit(ExitStatus),

    #[error("failed to signal rsync: {0}")]
    Signal(#[source] io::Error),

    #[error("no process")]
    NoProcess,
}

/// How a task reaches its remote side. One rule per valid
/// (`RemoteType`, `AuthMode`) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transport {
    SshKey,
    SshPassword,
    DaemonUser,
    DaemonAnonymous,
}

impl Transport {
    fn for_task(task: &RsyncTask) -> Result<Self, BuildError> {
        match (task.remote_type, task.auth_mode) {
            (RemoteType::Ssh, AuthMode::PrivateKey) => Ok(Transport::SshKey),
            (RemoteType::Ssh, AuthMode::Password) => Ok(Transport::SshPassword),
            (RemoteType::Daemon, AuthMode::Password) => Ok(Transport::DaemonUser),
            (RemoteType::Daemon, AuthMode::Anonymous) => Ok(Transport::DaemonAnonymous),
            (RemoteType::Ssh, auth_mode) => Err(BuildError::UnsupportedAuthMode {
                transport: "ssh",
                auth_mode,
            }),
            (RemoteType::Daemon, auth_mode) => Err(BuildError::UnsupportedAuthMode {
                transport: "rsync daemon",
                auth_mode,
            }),
        }
    }
}

/// A fully resolved rsync invocation.
#[derive(Clone, PartialEq, Eq)]
pub struct RsyncCommand {
    pub args: Vec<String>,
    /// Value passed to `-e`, already present in `args`
    pub ssh_command: Option<String>,
    /// Set when the command must run under `sshpass`
    pub ssh_password: Option<String>,
    pub env: Vec<(String, String)>,
}

impl std::fmt::Debug for RsyncCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RsyncCommand")
            .field("args", &self.args)
            .field("ssh_command", &self.ssh_command)
            .field("ssh_password", &self.ssh_password.as_ref().map(|_| "******"))
            .field("env", &self.env.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>())
            .finish()
    }
}

impl RsyncCommand {
    /// Shell-style rendering for logs, credentials masked.
    pub fn display(&self, binary: &str) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 4);
        if self.ssh_password.is_some() {
            parts.push("sshpass -p ******".to_string());
        }
        parts.push(sh_quote(binary));
        parts.extend(self.args.iter().map(|a| sh_quote(a)));
        parts.join(" ")
    }

    /// Full shell line for the `sshpass` wrapper.
    fn shell_line(&self, binary: &str, password: &str) -> String {
        let mut parts = vec!["sshpass".to_string(), "-p".to_string(), sh_quote(password), sh_quote(binary)];
        parts.extend(self.args.iter().map(|a| sh_quote(a)));
        parts.join(" ")
    }
}

/// Single-quote `s` for a POSIX shell.
pub fn sh_quote(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn quote_if_needed(s: &str) -> String {
    if s.chars().any(|c| c.is_whitespace() || c == '\'' || c == '"') {
        sh_quote(s)
    } else {
        s.to_string()
    }
}

/// `(major, minor)` from `rsync --version` output.
pub fn parse_rsync_version(output: &str) -> Option<(u32, u32)> {
    let first = output.lines().next()?;
    let caps = VERSION_RE.captures(first)?;
    let major = caps[1].parse().ok()?;
    let minor = caps[2].parse().ok()?;
    Some((major, minor))
}

/// Base flags for a detected rsync version; `--info=progress2` needs 3.1+.
pub fn base_args_for(version: Option<(u32, u32)>) -> Vec<String> {
    let args = match version {
        Some((major, minor)) if major > 3 || (major == 3 && minor >= 1) => MODERN_ARGS,
        _ => LEGACY_ARGS,
    };
    args.iter().map(|s| s.to_string()).collect()
}

fn ssh_command(task: &RsyncTask, transport: Transport) -> String {
    let mut parts = vec!["ssh".to_string()];
    if task.remote_port != 0 {
        parts.push("-p".to_string());
        parts.push(task.remote_port.to_string());
    }
    if transport == Transport::SshKey && !task.ssh_private_key.is_empty() {
        parts.push("-i".to_string());
        parts.push(quote_if_needed(&task.ssh_private_key));
    }
    if !task.username.is_empty() {
        parts.push("-l".to_string());
        parts.push(quote_if_needed(&task.username));
    }
    parts.extend(
        ["-o", "StrictHostKeyChecking=no", "-o", "UserKnownHostsFile=/dev/null"]
            .iter()
            .map(|s| s.to_string()),
    );
    parts.join(" ")
}

fn daemon_uri(task: &RsyncTask, transport: Transport) -> String {
    let user = match transport {
        Transport::DaemonUser if !task.username.is_empty() => format!("{}@", task.username),
        _ => String::new(),
    };
    let port = if task.remote_port != 0 {
        format!(":{}", task.remote_port)
    } else {
        String::new()
    };
    format!(
        "rsync://{}{}{}/{}/{}",
        user,
        task.remote_host,
        port,
        task.module.trim_matches('/'),
        task.remote_path.trim_matches('/')
    )
}

/// Translate a task into an rsync invocation. Nothing is executed.
pub fn build_rsync_command(task: &RsyncTask, base_args: &[String]) -> Result<RsyncCommand, BuildError> {
    let transport = Transport::for_task(task)?;
    let mut args = base_args.to_vec();
    let mut ssh_command_line = None;
    let mut ssh_password = None;
    let mut env = Vec::new();

    let remote = match transport {
        Transport::SshKey | Transport::SshPassword => {
            let ssh = ssh_command(task, transport);
            args.push("-e".to_string());
            args.push(ssh.clone());
            ssh_command_line = Some(ssh);
            if transport == Transport::SshPassword && !task.password.is_empty() {
                ssh_password = Some(task.password.clone());
            }
            if task.username.is_empty() {
                format!("{}:{}", task.remote_host, task.remote_path)
            } else {
                format!("{}@{}:{}", task.username, task.remote_host, task.remote_path)
            }
        }
        Transport::DaemonUser | Transport::DaemonAnonymous => {
            if transport == Transport::DaemonUser && !task.password.is_empty() {
                env.push(("RSYNC_PASSWORD".to_string(), task.password.clone()));
            }
            daemon_uri(task, transport)
        }
    };

    let (src, dst) = match task.direction {
        SyncDirection::LocalToRemote => (task.local_path.clone(), remote),
        SyncDirection::RemoteToLocal => (remote, task.local_path.clone()),
    };
    args.push(src);
    args.push(dst);

    Ok(RsyncCommand {
        args,
        ssh_command: ssh_command_line,
        ssh_password,
        env,
    })
}

/// A running rsync process in its own process group.
///
/// `wait` and `stop` may be called concurrently: `stop` signals the group by
/// pid and never touches the child handle that `wait` holds.
pub struct RsyncProcess {
    pid: Option<u32>,
    child: Mutex<Child>,
    stop_lock: Mutex<()>,
    exited: AtomicBool,
    stopped: AtomicBool,
    grace: Duration,
}

impl RsyncProcess {
    /// Spawn `cmd` as the leader of a new process group.
    pub fn spawn(mut cmd: Command, grace: Duration) -> io::Result<Self> {
        cmd.process_group(0).kill_on_drop(true);
        let child = cmd.spawn()?;
        Ok(Self {
            pid: child.id(),
            child: Mutex::new(child),
            stop_lock: Mutex::new(()),
            exited: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            grace,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn was_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Block until the process exits. A non-zero exit is an error.
    pub async fn wait(&self) -> Result<(), ExecError> {
        let status = {
            let mut child = self.child.lock().await;
            child.wait().await.map_err(ExecError::Wait)?
        };
        self.exited.store(true, Ordering::SeqCst);
        if status.success() {
            Ok(())
        } else {
            Err(ExecError::Exit(status))
        }
    }

    /// Interrupt the process group, give it `grace` to exit, then kill it.
    pub async fn stop(&self) -> Result<(), ExecError> {
        let _guard = self.stop_lock.lock().await;
        let pid = self.pid.ok_or(ExecError::NoProcess)?;
        self.stopped.store(true, Ordering::SeqCst);

        if self.exited.load(Ordering::SeqCst) {
            return Ok(());
        }
        signal_group(pid, Signal::SIGINT)?;
        tokio::time::sleep(self.grace).await;
        if self.exited.load(Ordering::SeqCst) {
            return Ok(());
        }
        signal_group(pid, Signal::SIGKILL)
    }
}

fn signal_group(pid: u32, signal: Signal) -> Result<(), ExecError> {
    let pgid = i32::try_from(pid).map_err(|_| ExecError::NoProcess)?;
    match killpg(Pid::from_raw(pgid), signal) {
        Ok(()) => Ok(()),
        // already gone
        Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(ExecError::Signal(io::Error::from(errno))),
    }
}

/// Starts processes for tasks. The manager only talks to this seam.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Start the transfer with output appended to the task's execution log.
    async fn start(&self, task: &RsyncTask, log: &TaskLog) -> Result<RsyncProcess, ExecError>;

    /// Run a `--dry-run` of the transfer to completion, output to the test log.
    async fn dry_run(&self, task: &RsyncTask, log: &TaskLog) -> Result<(), ExecError>;
}

pub struct RsyncExecutor {
    binary: String,
    stop_grace: Duration,
    base_args: OnceCell<Vec<String>>,
}

impl RsyncExecutor {
    pub fn new(binary: impl Into<String>, stop_grace: Duration) -> Self {
        Self {
            binary: binary.into(),
            stop_grace,
            base_args: OnceCell::new(),
        }
    }

    /// Skip version detection and use fixed base flags.
    #[cfg(test)]
    pub fn with_base_args(binary: impl Into<String>, stop_grace: Duration, base_args: Vec<String>) -> Self {
        Self {
            binary: binary.into(),
            stop_grace,
            base_args: OnceCell::new_with(Some(base_args)),
        }
    }

    /// Base flags for the installed rsync, probed once.
    pub async fn base_args(&self) -> &[String] {
        self.base_args
            .get_or_init(|| async {
                let version = check_rsync(&self.binary).await;
                match &version {
                    Some((major, minor)) => info!("Detected rsync {}.{}", major, minor),
                    None => warn!("Could not detect rsync version, using legacy progress flags"),
                }
                base_args_for(version)
            })
            .await
    }

    async fn prepare(&self, task: &RsyncTask, dry_run: bool) -> Result<(RsyncCommand, Command), ExecError> {
        let mut built = build_rsync_command(task, self.base_args().await).map_err(|e| {
            error!("Failed to build rsync command for task {}: {}", task.id, e);
            e
        })?;
        if dry_run {
            built.args.insert(0, "--dry-run".to_string());
        }

        let mut cmd = match &built.ssh_password {
            Some(password) => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(built.shell_line(&self.binary, password));
                cmd
            }
            None => {
                let mut cmd = Command::new(&self.binary);
                cmd.args(&built.args);
                cmd
            }
        };
        cmd.envs(built.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null());
        Ok((built, cmd))
    }
}

#[async_trait]
impl Launcher for RsyncExecutor {
    async fn start(&self, task: &RsyncTask, log: &TaskLog) -> Result<RsyncProcess, ExecError> {
        let (built, mut cmd) = self.prepare(task, false).await?;
        info!("Starting rsync for task {}: {}", task.id, built.display(&self.binary));

        let out = log.exec_writer().map_err(ExecError::Log)?;
        let err = out.try_clone().map_err(ExecError::Log)?;
        cmd.stdout(Stdio::from(out)).stderr(Stdio::from(err));

        let process = RsyncProcess::spawn(cmd, self.stop_grace).map_err(|e| {
            error!("Failed to start rsync for task {}: {}", task.id, e);
            ExecError::Spawn(e)
        })?;
        info!("rsync started for task {}, pid {:?}", task.id, process.pid());
        Ok(process)
    }

    async fn dry_run(&self, task: &RsyncTask, log: &TaskLog) -> Result<(), ExecError> {
        let (built, mut cmd) = self.prepare(task, true).await?;
        info!("Starting test rsync for task {}: {}", task.id, built.display(&self.binary));

        let out = log.test_writer().map_err(ExecError::Log)?;
        let err = out.try_clone().map_err(ExecError::Log)?;
        cmd.stdout(Stdio::from(out)).stderr(Stdio::from(err)).kill_on_drop(true);

        let status = cmd.status().await.map_err(ExecError::Spawn)?;
        if !status.success() {
            warn!("Test rsync failed for task {}: {}", task.id, status);
            return Err(ExecError::Exit(status));
        }
        debug!("Test rsync completed for task {}", task.id);
        Ok(())
    }
}

/// Parsed version of the rsync binary, if it runs at all.
pub async fn check_rsync(binary: &str) -> Option<(u32, u32)> {
    let output = Command::new(binary).arg("--version").output().await.ok()?;
    if !output.status.success() {
        return None;
    }
    parse_rsync_version(&String::from_utf8_lossy(&output.stdout))
}
