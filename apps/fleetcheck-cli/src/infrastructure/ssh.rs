//! Pooled multi-host SSH execution.
//!
//! One session manager per configured host; sessions are reused for the
//! duration of a run. Commands are blocking at the libssh2 layer, so every
//! call is driven through `spawn_blocking`, and fan-out runs the per-host
//! commands concurrently. Host-key verification is strict unless the
//! configuration explicitly opts out, and the opt-out is warned about on
//! every connection.

use std::collections::BTreeMap;
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ssh2::{CheckResult, KnownHostFileKind, Session};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::engine::topology::UNMAPPED_NODE_ID;

pub const DEFAULT_KEEPALIVE_INTERVAL_SECS: u32 = 60;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SshError {
    #[error("SSH connection to {host} failed: {reason}")]
    Connection { host: String, reason: String },

    #[error("SSH session for {0} is not connected")]
    NotConnected(String),

    #[error("SSH authentication failed for {user}@{host}: {reason}")]
    Auth {
        host: String,
        user: String,
        reason: String,
    },

    #[error("host key verification failed for {host}: {reason}")]
    HostKey { host: String, reason: String },

    #[error("command on {host} timed out after {seconds}s")]
    Timeout { host: String, seconds: u64 },

    #[error("command on {host} failed: {reason}")]
    Command { host: String, reason: String },

    #[error("no SSH host named {0} is configured")]
    UnknownHost(String),
}

#[derive(Debug, Clone)]
pub enum SshAuth {
    KeyFile(PathBuf),
    Password(String),
}

#[derive(Debug, Clone)]
pub struct SshHostConfig {
    pub host: String,
    pub user: String,
    pub auth: SshAuth,
    pub port: u16,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub keepalive_interval_secs: u32,
    pub strict_host_key: bool,
    pub known_hosts_file: Option<PathBuf>,
}

/// Pool-level configuration: per-host settings share everything except the
/// host name.
#[derive(Debug, Clone)]
pub struct SshPoolConfig {
    pub hosts: Vec<String>,
    pub user: String,
    pub auth: SshAuth,
    pub port: u16,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub keepalive_interval_secs: u32,
    pub strict_host_key: bool,
    pub known_hosts_file: Option<PathBuf>,
}

/// One entry per configured host in a fan-out result. A host that failed
/// to connect or execute still appears, with `success = false`.
#[derive(Debug, Clone)]
pub struct FanOutEntry {
    pub host: String,
    pub node_id: String,
    pub success: bool,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
}

struct SshSessionManager {
    config: SshHostConfig,
    session: Mutex<Option<Session>>,
}

impl SshSessionManager {
    fn new(config: SshHostConfig) -> Self {
        Self {
            config,
            session: Mutex::new(None),
        }
    }

    fn is_connected(&self) -> bool {
        self.session.lock().is_ok_and(|guard| guard.is_some())
    }

    fn connect_blocking(&self) -> Result<(), SshError> {
        let host = &self.config.host;
        let addr = format!("{}:{}", host, self.config.port);
        let sockaddr = addr
            .to_socket_addrs()
            .map_err(|e| SshError::Connection {
                host: host.clone(),
                reason: format!("address resolution failed: {e}"),
            })?
            .next()
            .ok_or_else(|| SshError::Connection {
                host: host.clone(),
                reason: "address resolved to nothing".to_string(),
            })?;

        let stream = TcpStream::connect_timeout(&sockaddr, self.config.connect_timeout).map_err(
            |e| SshError::Connection {
                host: host.clone(),
                reason: e.to_string(),
            },
        )?;

        let mut session = Session::new().map_err(|e| SshError::Connection {
            host: host.clone(),
            reason: e.to_string(),
        })?;
        session.set_tcp_stream(stream);
        session.handshake().map_err(|e| SshError::Connection {
            host: host.clone(),
            reason: format!("handshake failed: {e}"),
        })?;

        if self.config.strict_host_key {
            self.verify_host_key(&session)?;
            debug!("host key verified for {}", host);
        } else {
            warn!(
                "host key verification disabled for {}; set ssh_strict_host_key_checking=true for production",
                host
            );
        }

        match &self.config.auth {
            SshAuth::KeyFile(path) => session
                .userauth_pubkey_file(&self.config.user, None, path, None)
                .map_err(|e| SshError::Auth {
                    host: host.clone(),
                    user: self.config.user.clone(),
                    reason: e.to_string(),
                })?,
            SshAuth::Password(password) => session
                .userauth_password(&self.config.user, password)
                .map_err(|e| SshError::Auth {
                    host: host.clone(),
                    user: self.config.user.clone(),
                    reason: e.to_string(),
                })?,
        }
        if !session.authenticated() {
            return Err(SshError::Auth {
                host: host.clone(),
                user: self.config.user.clone(),
                reason: "server rejected credentials".to_string(),
            });
        }

        // Protocol-level keepalive prevents idle-timeout drops during long runs.
        session.set_keepalive(true, self.config.keepalive_interval_secs);
        info!("SSH connection established to {}", host);

        let mut guard = self
            .session
            .lock()
            .map_err(|_| SshError::NotConnected(host.clone()))?;
        *guard = Some(session);
        Ok(())
    }

    fn verify_host_key(&self, session: &Session) -> Result<(), SshError> {
        let host = &self.config.host;
        let mut known_hosts = session.known_hosts().map_err(|e| SshError::HostKey {
            host: host.clone(),
            reason: e.to_string(),
        })?;

        let path = self.config.known_hosts_file.clone().unwrap_or_else(|| {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".ssh").join("known_hosts")
        });
        known_hosts
            .read_file(&path, KnownHostFileKind::OpenSSH)
            .map_err(|e| SshError::HostKey {
                host: host.clone(),
                reason: format!("could not read known_hosts {}: {e}", path.display()),
            })?;

        let (key, _) = session.host_key().ok_or_else(|| SshError::HostKey {
            host: host.clone(),
            reason: "server presented no host key".to_string(),
        })?;

        match known_hosts.check_port(host, self.config.port, key) {
            CheckResult::Match => Ok(()),
            CheckResult::Mismatch => Err(SshError::HostKey {
                host: host.clone(),
                reason: "host key MISMATCH against known_hosts".to_string(),
            }),
            CheckResult::NotFound => Err(SshError::HostKey {
                host: host.clone(),
                reason: format!(
                    "host key not present in {}; add it or disable strict checking",
                    path.display()
                ),
            }),
            CheckResult::Failure => Err(SshError::HostKey {
                host: host.clone(),
                reason: "known_hosts check failed".to_string(),
            }),
        }
    }

    fn execute_blocking(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<(String, String, i32), SshError> {
        let host = &self.config.host;
        let guard = self
            .session
            .lock()
            .map_err(|_| SshError::NotConnected(host.clone()))?;
        let session = guard
            .as_ref()
            .ok_or_else(|| SshError::NotConnected(host.clone()))?;

        session.set_timeout(timeout.as_millis() as u32);
        let started = std::time::Instant::now();

        let map_err = |e: ssh2::Error| {
            if started.elapsed() >= timeout {
                SshError::Timeout {
                    host: host.clone(),
                    seconds: timeout.as_secs(),
                }
            } else {
                SshError::Command {
                    host: host.clone(),
                    reason: e.to_string(),
                }
            }
        };
        let map_io = |e: std::io::Error| {
            if started.elapsed() >= timeout {
                SshError::Timeout {
                    host: host.clone(),
                    seconds: timeout.as_secs(),
                }
            } else {
                SshError::Command {
                    host: host.clone(),
                    reason: e.to_string(),
                }
            }
        };

        let mut channel = session.channel_session().map_err(map_err)?;
        channel.exec(command).map_err(map_err)?;

        let mut stdout = String::new();
        channel.read_to_string(&mut stdout).map_err(map_io)?;
        let mut stderr = String::new();
        channel.stderr().read_to_string(&mut stderr).map_err(map_io)?;

        channel.wait_close().map_err(map_err)?;
        let exit_code = channel.exit_status().map_err(map_err)?;

        let cmd_display = if command.len() > 100 {
            &command[..100]
        } else {
            command
        };
        debug!("ssh {}: '{}' exit={}", host, cmd_display, exit_code);
        Ok((stdout, stderr, exit_code))
    }

    fn close(&self) {
        if let Ok(mut guard) = self.session.lock() {
            if let Some(session) = guard.take() {
                let _ = session.disconnect(None, "health check complete", None);
                info!("SSH connection to {} closed", self.config.host);
            }
        }
    }
}

/// The pool itself: session managers plus the SSH-host-to-node mapping
/// filled in after topology discovery.
pub struct SshPool {
    managers: Vec<Arc<SshSessionManager>>,
    host_to_node: BTreeMap<String, String>,
    command_timeout: Duration,
}

impl SshPool {
    /// Builds managers for every configured host without opening
    /// connections.
    pub fn initialize(config: SshPoolConfig) -> Self {
        let managers = config
            .hosts
            .iter()
            .map(|host| {
                Arc::new(SshSessionManager::new(SshHostConfig {
                    host: host.clone(),
                    user: config.user.clone(),
                    auth: config.auth.clone(),
                    port: config.port,
                    connect_timeout: config.connect_timeout,
                    command_timeout: config.command_timeout,
                    keepalive_interval_secs: config.keepalive_interval_secs,
                    strict_host_key: config.strict_host_key,
                    known_hosts_file: config.known_hosts_file.clone(),
                }))
            })
            .collect();
        Self {
            managers,
            host_to_node: BTreeMap::new(),
            command_timeout: config.command_timeout,
        }
    }

    pub fn hosts(&self) -> Vec<String> {
        self.managers.iter().map(|m| m.config.host.clone()).collect()
    }

    pub fn connected_hosts(&self) -> Vec<String> {
        self.managers
            .iter()
            .filter(|m| m.is_connected())
            .map(|m| m.config.host.clone())
            .collect()
    }

    pub fn set_node_mapping(&mut self, mapping: BTreeMap<String, String>) {
        self.host_to_node = mapping;
    }

    pub fn node_id_for(&self, host: &str) -> String {
        self.host_to_node
            .get(host)
            .cloned()
            .unwrap_or_else(|| UNMAPPED_NODE_ID.to_string())
    }

    /// Attempts every host; returns the set that connected. Failures are
    /// logged and the host stays available for later reporting.
    pub async fn connect_all(&self) -> Vec<String> {
        let mut join_set = JoinSet::new();
        for manager in &self.managers {
            let manager = Arc::clone(manager);
            join_set.spawn_blocking(move || {
                let host = manager.config.host.clone();
                (host, manager.connect_blocking())
            });
        }

        let mut connected = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((host, Ok(()))) => connected.push(host),
                Ok((host, Err(e))) => warn!("SSH connection failed for {}: {}", host, e),
                Err(e) => warn!("SSH connect task failed: {}", e),
            }
        }
        connected.sort();
        connected
    }

    fn manager_for(&self, host: &str) -> Result<&Arc<SshSessionManager>, SshError> {
        self.managers
            .iter()
            .find(|m| m.config.host == host)
            .ok_or_else(|| SshError::UnknownHost(host.to_string()))
    }

    /// Runs a command on one specific host. Errors if that host's session
    /// is not alive.
    pub async fn execute(
        &self,
        host: &str,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<(String, String, i32), SshError> {
        let manager = Arc::clone(self.manager_for(host)?);
        let timeout = timeout.unwrap_or(self.command_timeout);
        let command = command.to_string();
        tokio::task::spawn_blocking(move || manager.execute_blocking(&command, timeout))
            .await
            .map_err(|e| SshError::Command {
                host: host.to_string(),
                reason: format!("executor task failed: {e}"),
            })?
    }

    /// Runs a command on the first configured host (the primary SSH
    /// target for single-host operations).
    pub async fn execute_on_primary(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<(String, String, i32), SshError> {
        let host = self
            .managers
            .first()
            .map(|m| m.config.host.clone())
            .ok_or_else(|| SshError::UnknownHost("<none configured>".to_string()))?;
        self.execute(&host, command, timeout).await
    }

    /// Parallel fan-out. Never fails as a whole: every configured host
    /// yields exactly one entry, and per-host failures become entries
    /// with `success = false`.
    pub async fn execute_all(&self, command: &str) -> Vec<FanOutEntry> {
        let mut join_set = JoinSet::new();
        for manager in &self.managers {
            let manager = Arc::clone(manager);
            let command = command.to_string();
            let node_id = self.node_id_for(&manager.config.host);
            let timeout = self.command_timeout;
            join_set.spawn_blocking(move || {
                let host = manager.config.host.clone();
                match manager.execute_blocking(&command, timeout) {
                    Ok((stdout, stderr, exit_code)) if exit_code == 0 => FanOutEntry {
                        host,
                        node_id,
                        success: true,
                        stdout: Some(stdout),
                        stderr: Some(stderr),
                        error: None,
                        exit_code: Some(exit_code),
                    },
                    Ok((_, stderr, exit_code)) => FanOutEntry {
                        host,
                        node_id,
                        success: false,
                        stdout: None,
                        stderr: None,
                        error: Some(format!("command failed (exit {exit_code}): {stderr}")),
                        exit_code: Some(exit_code),
                    },
                    Err(e) => FanOutEntry {
                        host,
                        node_id,
                        success: false,
                        stdout: None,
                        stderr: None,
                        error: Some(e.to_string()),
                        exit_code: None,
                    },
                }
            });
        }

        let mut entries = Vec::with_capacity(self.managers.len());
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!("SSH fan-out task failed: {}", e),
            }
        }
        entries
    }

    /// Idempotent: closing an already-closed pool is a no-op.
    pub fn close_all(&self) {
        for manager in &self.managers {
            manager.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_config(hosts: &[&str]) -> SshPoolConfig {
        SshPoolConfig {
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            user: "ops".to_string(),
            auth: SshAuth::Password("secret".to_string()),
            port: 22,
            connect_timeout: Duration::from_millis(50),
            command_timeout: Duration::from_secs(1),
            keepalive_interval_secs: DEFAULT_KEEPALIVE_INTERVAL_SECS,
            strict_host_key: true,
            known_hosts_file: None,
        }
    }

    #[tokio::test]
    async fn test_fan_out_yields_entry_per_host_even_when_disconnected() {
        // No host is connected; every entry must still appear, as a failure.
        let pool = SshPool::initialize(pool_config(&["b-1", "b-2", "b-3"]));
        let entries = pool.execute_all("uptime").await;
        assert_eq!(entries.len(), 3, "no host may be silently dropped");
        assert!(entries.iter().all(|e| !e.success));
        assert!(entries.iter().all(|e| e.error.is_some()));

        let mut hosts: Vec<&str> = entries.iter().map(|e| e.host.as_str()).collect();
        hosts.sort();
        assert_eq!(hosts, ["b-1", "b-2", "b-3"]);
    }

    #[tokio::test]
    async fn test_execute_on_unknown_host_errors() {
        let pool = SshPool::initialize(pool_config(&["b-1"]));
        let err = pool.execute("b-9", "uptime", None).await.unwrap_err();
        assert!(matches!(err, SshError::UnknownHost(_)));
    }

    #[tokio::test]
    async fn test_execute_requires_live_session() {
        let pool = SshPool::initialize(pool_config(&["b-1"]));
        assert!(pool.connected_hosts().is_empty());
        let err = pool.execute("b-1", "uptime", None).await.unwrap_err();
        assert!(matches!(err, SshError::NotConnected(_)));
    }

    #[test]
    fn test_node_mapping_defaults_to_unmapped() {
        let mut pool = SshPool::initialize(pool_config(&["b-1", "b-2"]));
        let mut mapping = BTreeMap::new();
        mapping.insert("b-1".to_string(), "broker-1".to_string());
        pool.set_node_mapping(mapping);
        assert_eq!(pool.node_id_for("b-1"), "broker-1");
        assert_eq!(pool.node_id_for("b-2"), UNMAPPED_NODE_ID);
    }

    #[test]
    fn test_close_all_is_idempotent() {
        let pool = SshPool::initialize(pool_config(&["b-1"]));
        pool.close_all();
        pool.close_all();
    }
}
