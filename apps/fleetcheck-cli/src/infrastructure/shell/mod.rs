//! Shell command execution over SSH with sanitization and structured
//! parsing.
//!
//! The executor enforces a safelist of command names and rejects dangerous
//! shell metacharacters outright. A configuration opt-out exists for
//! trusted environments; using it is logged at warning level.

pub mod parsers;

use std::collections::BTreeSet;

use serde_json::json;
use tracing::{info, warn};

use crate::engine::operation::{OperationResult, Row};
use crate::infrastructure::ssh::{FanOutEntry, SshPool};
use crate::report::formatter;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ShellError {
    #[error("command cannot be empty")]
    Empty,

    #[error("command contains dangerous pattern '{pattern}': {command}")]
    DangerousPattern { pattern: String, command: String },

    #[error("command '{0}' is not on the safelist")]
    NotSafelisted(String),
}

/// Command names that are always allowed.
const SAFE_COMMANDS: &[&str] = &[
    "df", "free", "ps", "uptime", "w", "top", "vmstat", "iostat", "netstat", "ss", "lsof",
    "dmesg", "journalctl", "systemctl", "nodetool", "cqlsh", "redis-cli", "valkey-cli", "du",
    "ls", "find", "grep", "awk", "sed", "cat", "tail", "head", "wc", "sort", "uniq", "hostname",
    "uname", "whoami", "id", "curl", "echo", "test", "java",
];

/// Commands for which empty output is normal, not an error.
const EMPTY_OK_COMMANDS: &[&str] = &["find", "grep", "locate", "ls", "awk", "sed", "lsof"];

const DANGEROUS_PATTERNS: &[&str] = &[";", "&&", "||", "`", "$(", "${", "$"];

#[derive(Debug, Clone)]
pub struct ShellExecutor {
    allow_unsafe: bool,
    empty_ok: BTreeSet<&'static str>,
}

impl ShellExecutor {
    pub fn new(allow_unsafe: bool) -> Self {
        if allow_unsafe {
            warn!("command sanitization DISABLED; all commands run without validation");
        }
        Self {
            allow_unsafe,
            empty_ok: EMPTY_OK_COMMANDS.iter().copied().collect(),
        }
    }

    fn command_name(command: &str) -> Option<&str> {
        let name = command.split_whitespace().next()?;
        // Absolute paths to safelisted tools are fine.
        Some(name.rsplit('/').next().unwrap_or(name))
    }

    /// Safelist plus metacharacter screening. Commands that are not
    /// safelisted but carry no injection pattern are allowed with a log
    /// line, matching operator expectations for one-off diagnostics.
    pub fn sanitize(&self, command: &str) -> Result<(), ShellError> {
        if command.trim().is_empty() {
            return Err(ShellError::Empty);
        }
        if self.allow_unsafe {
            return Ok(());
        }

        let name = Self::command_name(command).ok_or(ShellError::Empty)?;
        if SAFE_COMMANDS.contains(&name) {
            return Ok(());
        }

        for pattern in DANGEROUS_PATTERNS {
            if command.contains(pattern) {
                warn!("rejected command with dangerous pattern: {:.50}", command);
                return Err(ShellError::DangerousPattern {
                    pattern: pattern.to_string(),
                    command: command.chars().take(80).collect(),
                });
            }
        }

        info!("allowing non-safelisted but safe-looking command: {}", name);
        Ok(())
    }

    fn empty_output_is_ok(&self, command: &str) -> bool {
        Self::command_name(command).is_some_and(|name| self.empty_ok.contains(name))
    }

    /// Runs a shell command on the primary SSH host and parses stdout into
    /// rows when a dedicated parser exists for the tool.
    pub async fn run_shell(&self, pool: &SshPool, command: &str) -> OperationResult {
        if let Err(e) = self.sanitize(command) {
            return OperationResult::from_error(e.to_string(), Some(command.to_string()));
        }

        match pool.execute_on_primary(command, None).await {
            Ok((stdout, stderr, exit_code)) => {
                if exit_code != 0 && stdout.trim().is_empty() {
                    return OperationResult::from_error(
                        format!("command failed with exit code {exit_code}: {stderr}"),
                        Some(command.to_string()),
                    );
                }
                self.shell_output_to_result(command, &stdout, &stderr, exit_code)
            }
            Err(e) => OperationResult::from_error(e.to_string(), Some(command.to_string())),
        }
    }

    /// Converts already-captured stdout (e.g. one host's slice of a
    /// fan-out) into the same structured result `run_shell` produces.
    pub fn parse_shell_stdout(&self, command: &str, stdout: &str) -> OperationResult {
        self.shell_output_to_result(command, stdout, "", 0)
    }

    fn shell_output_to_result(
        &self,
        command: &str,
        stdout: &str,
        stderr: &str,
        exit_code: i32,
    ) -> OperationResult {
        if stdout.trim().is_empty() {
            let rendered = if self.empty_output_is_ok(command) {
                formatter::render_note(
                    "No results found (this may be normal - e.g. no matching files/processes).",
                )
            } else {
                warn!("empty output from command: {:.50}", command);
                formatter::render_note("No output from command.")
            };
            let mut row = Row::new();
            row.insert("command".into(), json!(command));
            row.insert("output".into(), json!(""));
            row.insert("exit_code".into(), json!(exit_code));
            if !stderr.is_empty() {
                row.insert("stderr".into(), json!(stderr));
            }
            return OperationResult::from_rows_rendered(vec![row], rendered);
        }

        match parsers::parse_shell_output(command, stdout) {
            Some(rows) => OperationResult::from_rows(rows),
            None => {
                let mut row = Row::new();
                row.insert("command".into(), json!(command));
                row.insert("output".into(), json!(stdout));
                row.insert("exit_code".into(), json!(exit_code));
                OperationResult::from_rows_rendered(
                    vec![row],
                    formatter::render_literal(stdout),
                )
            }
        }
    }

    /// Runs `nodetool <command>` on the primary SSH host and hands stdout
    /// to the registered nodetool parser.
    pub async fn run_nodetool(&self, pool: &SshPool, command: &str) -> OperationResult {
        let full = format!("nodetool {command}");
        match pool.execute_on_primary(&full, None).await {
            Ok((stdout, stderr, exit_code)) => {
                if exit_code != 0 {
                    return OperationResult::from_error(
                        format!("nodetool failed (exit {exit_code}): {stderr}"),
                        Some(full),
                    );
                }
                if stdout.trim().is_empty() {
                    return OperationResult::from_rows_rendered(
                        Vec::new(),
                        formatter::render_note("No output from nodetool."),
                    );
                }
                let rows = parsers::parse_nodetool(command, &stdout);
                OperationResult::from_rows(rows)
            }
            Err(e) => OperationResult::from_error(e.to_string(), Some(full)),
        }
    }

    /// Fan-out variant: `nodetool <command>` on every SSH host, one result
    /// row set per host keyed by node id.
    pub async fn run_nodetool_cluster(
        &self,
        pool: &SshPool,
        command: &str,
    ) -> Vec<(String, OperationResult)> {
        let full = format!("nodetool {command}");
        let entries = pool.execute_all(&full).await;
        entries
            .into_iter()
            .map(|entry| {
                let result = Self::entry_to_result(command, &entry);
                (entry.node_id, result)
            })
            .collect()
    }

    fn entry_to_result(command: &str, entry: &FanOutEntry) -> OperationResult {
        if !entry.success {
            return OperationResult::from_error(
                entry
                    .error
                    .clone()
                    .unwrap_or_else(|| "command failed".to_string()),
                Some(entry.host.clone()),
            );
        }
        let stdout = entry.stdout.as_deref().unwrap_or("");
        let rows = parsers::parse_nodetool(command, stdout);
        OperationResult::from_rows(rows)
    }

    /// Runs `redis-cli <command>` (or `valkey-cli`) on the primary host.
    #[allow(dead_code)]
    pub async fn run_redis_cli(&self, pool: &SshPool, command: &str) -> OperationResult {
        let full = format!("redis-cli {command}");
        match pool.execute_on_primary(&full, None).await {
            Ok((stdout, stderr, exit_code)) => {
                if exit_code != 0 {
                    return OperationResult::from_error(
                        format!("redis-cli failed (exit {exit_code}): {stderr}"),
                        Some(full),
                    );
                }
                let mut row = Row::new();
                row.insert("command".into(), json!(command));
                row.insert("output".into(), json!(stdout));
                OperationResult::from_rows_rendered(vec![row], formatter::render_literal(&stdout))
            }
            Err(e) => OperationResult::from_error(e.to_string(), Some(full)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safelisted_commands_pass() {
        let exec = ShellExecutor::new(false);
        assert!(exec.sanitize("df -h").is_ok());
        assert!(exec.sanitize("/usr/bin/free -m").is_ok());
        assert!(exec.sanitize("nodetool status").is_ok());
    }

    #[test]
    fn test_dangerous_patterns_rejected() {
        let exec = ShellExecutor::new(false);
        assert!(matches!(
            exec.sanitize("mytool; rm -rf /"),
            Err(ShellError::DangerousPattern { .. })
        ));
        assert!(exec.sanitize("mytool `whoami`").is_err());
        assert!(exec.sanitize("mytool $(id)").is_err());
        assert!(exec.sanitize("").is_err());
    }

    #[test]
    fn test_unsafe_flag_disables_sanitization() {
        let exec = ShellExecutor::new(true);
        assert!(exec.sanitize("mytool; anything").is_ok());
    }

    #[test]
    fn test_empty_output_policy() {
        let exec = ShellExecutor::new(false);
        assert!(exec.empty_output_is_ok("grep ERROR /var/log/kafka.log"));
        assert!(exec.empty_output_is_ok("find / -name core"));
        assert!(!exec.empty_output_is_ok("free -m"));
    }

    #[test]
    fn test_unlisted_but_clean_command_allowed() {
        let exec = ShellExecutor::new(false);
        assert!(exec.sanitize("nproc").is_ok());
    }
}
