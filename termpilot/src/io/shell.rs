//! Shell adapters: one contract over `cmd.exe`, PowerShell and POSIX shells.
//!
//! Every adapter owns a [`ShellPolicy`] that is applied to each command before
//! anything is spawned, independent of the safety gate upstream.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::{Regex, RegexBuilder};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::core::redact::redact_command;
use crate::core::types::ShellKind;
use crate::io::process::run_command_with_timeout;

pub const TIMEOUT_RETURNCODE: i32 = 124;
pub const NOT_EXECUTED_RETURNCODE: i32 = 126;
pub const NOT_FOUND_RETURNCODE: i32 = 127;

pub const DENYLIST_REASON: &str = "command blocked by denylist policy";
pub const ALLOWLIST_REASON: &str = "command rejected by allowlist policy";
pub const CONFIRMATION_REASON: &str = "destructive command requires explicit confirmation";
pub const DRY_RUN_STDOUT: &str = "dry-run: command not executed";

const POSIX_CONFIRMATION_PATTERNS: &[&str] = &[
    r"\brm\s+(?:[^;&|\n]*\s)?(?:-[a-z]*r[a-z]*|--recursive)\b",
    r"\bmkfs(?:\.\w+)?\b",
    r"\bdd\b[^;&|\n]*\bof=/dev/",
    r"\bdrop\s+(?:table|database)\b",
];

const CMD_CONFIRMATION_PATTERNS: &[&str] = &[
    r"\b(?:del|erase)\s+(?:[^&|\n]*\s)?/[sq]\b",
    r"\b(?:rd|rmdir)\s+(?:[^&|\n]*\s)?/s\b",
    r"\bformat(?:\.com)?\s+[a-z]:",
    r"\bdrop\s+(?:table|database)\b",
];

const POWERSHELL_CONFIRMATION_PATTERNS: &[&str] = &[
    r"\b(?:remove-item|rm|ri|del|erase|rd|rmdir)\b[^;|\n]*\s-(?:recurse|force|r)\b",
    r"\b(?:format-volume|clear-disk|initialize-disk)\b",
    r"\bformat(?:\.com)?\s+[a-z]:",
    r"\bdrop\s+(?:table|database)\b",
];

/// Normalized outcome of one adapter call.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResult {
    pub command: String,
    pub shell: String,
    pub returncode: i32,
    pub stdout: String,
    pub stderr: String,
    /// Wall-clock seconds.
    pub duration: f64,
    pub timed_out: bool,
    /// False for dry runs and when the shell could not be launched.
    pub executed: bool,
}

/// The adapter's policy refused the command; nothing was spawned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{shell}: {reason}")]
pub struct CommandBlocked {
    pub command: String,
    pub shell: String,
    pub reason: String,
}

/// Executes one command string in a specific shell.
pub trait ShellAdapter {
    fn kind(&self) -> ShellKind;

    /// Program that will be launched (after PATH fallback resolution).
    fn executable(&self) -> &str;

    fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    fn execute(
        &self,
        command: &str,
        cwd: &Path,
        confirmed: bool,
    ) -> Result<CommandResult, CommandBlocked>;
}

/// Construction options shared by every adapter.
#[derive(Debug, Clone)]
pub struct ShellOptions {
    /// Overrides the default executable for the shell family.
    pub executable: Option<String>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    pub dry_run: bool,
    /// Consult the confirmation patterns for unconfirmed commands.
    pub confirmation_mode: bool,
    pub denylist: Vec<String>,
    pub allowlist: Vec<String>,
}

impl Default for ShellOptions {
    fn default() -> Self {
        Self {
            executable: None,
            timeout: Duration::from_secs(120),
            output_limit_bytes: 100_000,
            dry_run: false,
            confirmation_mode: true,
            denylist: Vec::new(),
            allowlist: Vec::new(),
        }
    }
}

/// Compiled deny/allow/confirmation rules for one shell family.
#[derive(Debug, Clone)]
pub struct ShellPolicy {
    deny: Vec<Regex>,
    allow: Vec<Regex>,
    confirm: Vec<Regex>,
    confirmation_mode: bool,
}

impl ShellPolicy {
    pub fn new(
        kind: ShellKind,
        denylist: &[String],
        allowlist: &[String],
        confirmation_mode: bool,
    ) -> Result<Self> {
        let confirm = match kind {
            ShellKind::Cmd => CMD_CONFIRMATION_PATTERNS,
            ShellKind::PowerShell => POWERSHELL_CONFIRMATION_PATTERNS,
            ShellKind::Posix => POSIX_CONFIRMATION_PATTERNS,
        };
        Ok(Self {
            deny: compile_patterns(denylist.iter().map(String::as_str), "shell_denylist")?,
            allow: compile_patterns(allowlist.iter().map(String::as_str), "shell_allowlist")?,
            confirm: compile_patterns(confirm.iter().copied(), "confirmation")?,
            confirmation_mode,
        })
    }

    /// Returns the block reason, if any. Deny wins over allow, allow over confirmation.
    pub fn check(&self, command: &str, confirmed: bool) -> Option<&'static str> {
        if self.deny.iter().any(|re| re.is_match(command)) {
            return Some(DENYLIST_REASON);
        }
        if !self.allow.is_empty() && !self.allow.iter().any(|re| re.is_match(command)) {
            return Some(ALLOWLIST_REASON);
        }
        if self.confirmation_mode && !confirmed && self.requires_confirmation(command) {
            return Some(CONFIRMATION_REASON);
        }
        None
    }

    pub fn requires_confirmation(&self, command: &str) -> bool {
        self.confirm.iter().any(|re| re.is_match(command))
    }
}

/// Compile user-supplied or built-in patterns case-insensitively.
pub fn compile_patterns<'a>(
    patterns: impl IntoIterator<Item = &'a str>,
    label: &str,
) -> Result<Vec<Regex>> {
    patterns
        .into_iter()
        .map(|pattern| {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .with_context(|| format!("invalid {label} pattern '{pattern}'"))
        })
        .collect()
}

/// Build the adapter for `kind`.
pub fn create_shell_adapter(kind: ShellKind, options: &ShellOptions) -> Result<Box<dyn ShellAdapter>> {
    let runner = Runner::new(kind, options)?;
    let adapter: Box<dyn ShellAdapter> = match kind {
        ShellKind::Cmd => Box::new(CmdAdapter {
            executable: options.executable.clone().unwrap_or_else(|| "cmd.exe".to_string()),
            runner,
        }),
        ShellKind::PowerShell => Box::new(PowerShellAdapter {
            executable: options.executable.clone().unwrap_or_else(default_powershell),
            runner,
        }),
        ShellKind::Posix => Box::new(PosixAdapter {
            executable: options.executable.clone().unwrap_or_else(default_posix_shell),
            runner,
        }),
    };
    info!(shell = adapter.name(), executable = adapter.executable(), "shell adapter ready");
    Ok(adapter)
}

fn default_powershell() -> String {
    if which::which("pwsh").is_ok() {
        "pwsh".to_string()
    } else {
        "powershell.exe".to_string()
    }
}

fn default_posix_shell() -> String {
    if which::which("bash").is_ok() {
        "bash".to_string()
    } else if which::which("sh").is_ok() {
        "sh".to_string()
    } else {
        "bash".to_string()
    }
}

/// Windows Command Prompt: `cmd.exe /d /s /c <command>`.
pub struct CmdAdapter {
    executable: String,
    runner: Runner,
}

impl ShellAdapter for CmdAdapter {
    fn kind(&self) -> ShellKind {
        ShellKind::Cmd
    }

    fn executable(&self) -> &str {
        &self.executable
    }

    fn execute(
        &self,
        command: &str,
        cwd: &Path,
        confirmed: bool,
    ) -> Result<CommandResult, CommandBlocked> {
        let mut cmd = Command::new(&self.executable);
        cmd.args(["/d", "/s", "/c", command]);
        self.runner.run(self, cmd, command, cwd, confirmed)
    }
}

/// Windows PowerShell or PowerShell 7+.
pub struct PowerShellAdapter {
    executable: String,
    runner: Runner,
}

impl ShellAdapter for PowerShellAdapter {
    fn kind(&self) -> ShellKind {
        ShellKind::PowerShell
    }

    fn executable(&self) -> &str {
        &self.executable
    }

    fn execute(
        &self,
        command: &str,
        cwd: &Path,
        confirmed: bool,
    ) -> Result<CommandResult, CommandBlocked> {
        let mut cmd = Command::new(&self.executable);
        cmd.args(["-NoProfile", "-NonInteractive", "-Command", command]);
        self.runner.run(self, cmd, command, cwd, confirmed)
    }
}

/// `bash -lc <command>`, or `sh` when bash is not on PATH.
pub struct PosixAdapter {
    executable: String,
    runner: Runner,
}

impl ShellAdapter for PosixAdapter {
    fn kind(&self) -> ShellKind {
        ShellKind::Posix
    }

    fn executable(&self) -> &str {
        &self.executable
    }

    fn execute(
        &self,
        command: &str,
        cwd: &Path,
        confirmed: bool,
    ) -> Result<CommandResult, CommandBlocked> {
        let mut cmd = Command::new(&self.executable);
        cmd.args(["-lc", command]);
        self.runner.run(self, cmd, command, cwd, confirmed)
    }
}

/// Policy check, spawn and normalization shared by the three adapters.
struct Runner {
    policy: ShellPolicy,
    timeout: Duration,
    output_limit_bytes: usize,
    dry_run: bool,
}

impl Runner {
    fn new(kind: ShellKind, options: &ShellOptions) -> Result<Self> {
        Ok(Self {
            policy: ShellPolicy::new(
                kind,
                &options.denylist,
                &options.allowlist,
                options.confirmation_mode,
            )?,
            timeout: options.timeout,
            output_limit_bytes: options.output_limit_bytes,
            dry_run: options.dry_run,
        })
    }

    #[instrument(skip_all, fields(shell = adapter.name()))]
    fn run(
        &self,
        adapter: &dyn ShellAdapter,
        mut cmd: Command,
        command: &str,
        cwd: &Path,
        confirmed: bool,
    ) -> Result<CommandResult, CommandBlocked> {
        let shell = adapter.name();
        info!(
            shell,
            command = %redact_command(command),
            cwd = %cwd.display(),
            timeout_secs = self.timeout.as_secs(),
            dry_run = self.dry_run,
            confirmed,
            "command_request"
        );

        if let Some(reason) = self.policy.check(command, confirmed) {
            warn!(shell, reason, "command blocked");
            return Err(CommandBlocked {
                command: command.to_string(),
                shell: shell.to_string(),
                reason: reason.to_string(),
            });
        }

        let result = if self.dry_run {
            CommandResult {
                command: command.to_string(),
                shell: shell.to_string(),
                returncode: 0,
                stdout: DRY_RUN_STDOUT.to_string(),
                stderr: String::new(),
                duration: 0.0,
                timed_out: false,
                executed: false,
            }
        } else {
            cmd.current_dir(cwd);
            self.spawn(adapter, cmd, command)
        };

        info!(
            shell,
            returncode = result.returncode,
            timed_out = result.timed_out,
            duration_secs = result.duration,
            executed = result.executed,
            stdout_len = result.stdout.len(),
            stderr_len = result.stderr.len(),
            "command_result"
        );
        Ok(result)
    }

    fn spawn(&self, adapter: &dyn ShellAdapter, cmd: Command, command: &str) -> CommandResult {
        let shell = adapter.name().to_string();
        match run_command_with_timeout(cmd, self.timeout, self.output_limit_bytes) {
            Ok(output) => {
                let mut stdout = decode_output(&output.stdout);
                stdout.push_str(&output.stdout_truncated_notice());
                let mut stderr = decode_output(&output.stderr);
                stderr.push_str(&output.stderr_truncated_notice());
                let returncode = if output.timed_out {
                    TIMEOUT_RETURNCODE
                } else {
                    output.status.code().unwrap_or(-1)
                };
                CommandResult {
                    command: command.to_string(),
                    shell,
                    returncode,
                    stdout,
                    stderr,
                    duration: output.elapsed.as_secs_f64(),
                    timed_out: output.timed_out,
                    executed: true,
                }
            }
            Err(err) => {
                let not_found = err
                    .downcast_ref::<std::io::Error>()
                    .is_some_and(|io_err| io_err.kind() == std::io::ErrorKind::NotFound);
                let (returncode, stderr) = if not_found {
                    (
                        NOT_FOUND_RETURNCODE,
                        format!("{shell} executable not found: {}", adapter.executable()),
                    )
                } else {
                    (NOT_EXECUTED_RETURNCODE, format!("{shell} failed to run command: {err:#}"))
                };
                CommandResult {
                    command: command.to_string(),
                    shell,
                    returncode,
                    stdout: String::new(),
                    stderr,
                    duration: 0.0,
                    timed_out: false,
                    executed: false,
                }
            }
        }
    }
}

const UTF8_BOM: [u8; 3] = [0xEF, 0xBB, 0xBF];
const UTF16LE_BOM: [u8; 2] = [0xFF, 0xFE];

/// Decode captured shell output leniently.
pub fn decode_output(bytes: &[u8]) -> String {
    if let Some(rest) = bytes.strip_prefix(&UTF8_BOM) {
        return String::from_utf8_lossy(rest).into_owned();
    }
    if let Some(rest) = bytes.strip_prefix(&UTF16LE_BOM) {
        let units: Vec<u16> = rest
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        return String::from_utf16_lossy(&units);
    }
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(kind: ShellKind, options: ShellOptions) -> Box<dyn ShellAdapter> {
        create_shell_adapter(kind, &options).expect("adapter")
    }

    fn tmp() -> tempfile::TempDir {
        tempfile::tempdir().expect("tempdir")
    }

    #[test]
    fn unconfirmed_destructive_command_is_blocked_for_every_family() {
        let dir = tmp();
        for (kind, command) in [
            (ShellKind::Posix, "rm -rf ./build"),
            (ShellKind::Cmd, "rmdir /s /q build"),
            (ShellKind::PowerShell, "Remove-Item -Recurse .\\build"),
        ] {
            let err = adapter(kind, ShellOptions::default())
                .execute(command, dir.path(), false)
                .expect_err("should block");
            assert_eq!(err.reason, CONFIRMATION_REASON, "{kind}: {command}");
        }
    }

    #[test]
    fn denylist_blocks_even_confirmed_commands() {
        let options = ShellOptions {
            denylist: vec![r"\bshutdown\b".to_string()],
            ..ShellOptions::default()
        };
        let err = adapter(ShellKind::Posix, options)
            .execute("sudo shutdown -h now", tmp().path(), true)
            .expect_err("denied");
        assert_eq!(err.reason, DENYLIST_REASON);
    }

    #[test]
    fn allowlist_rejects_unlisted_commands() {
        let options = ShellOptions {
            allowlist: vec![r"^git\b".to_string()],
            dry_run: true,
            ..ShellOptions::default()
        };
        let shell = adapter(ShellKind::Posix, options);
        let err = shell
            .execute("curl example.com", tmp().path(), true)
            .expect_err("rejected");
        assert_eq!(err.reason, ALLOWLIST_REASON);
        assert!(shell.execute("git status", tmp().path(), true).is_ok());
    }

    #[test]
    fn confirmation_mode_off_skips_confirmation_patterns() {
        let options = ShellOptions {
            confirmation_mode: false,
            dry_run: true,
            ..ShellOptions::default()
        };
        let result = adapter(ShellKind::Posix, options)
            .execute("rm -rf ./build", tmp().path(), false)
            .expect("not blocked");
        assert!(!result.executed);
    }

    #[test]
    fn dry_run_reports_without_executing() {
        let options = ShellOptions {
            dry_run: true,
            ..ShellOptions::default()
        };
        let result = adapter(ShellKind::Cmd, options)
            .execute("dir", tmp().path(), true)
            .expect("dry run");
        assert_eq!(result.returncode, 0);
        assert_eq!(result.stdout, DRY_RUN_STDOUT);
        assert!(!result.executed);
        assert_eq!(result.shell, "cmd");
    }

    #[test]
    fn missing_executable_maps_to_127() {
        let options = ShellOptions {
            executable: Some("/definitely/not/a/shell".to_string()),
            ..ShellOptions::default()
        };
        let result = adapter(ShellKind::PowerShell, options)
            .execute("Get-Location", tmp().path(), true)
            .expect("result");
        assert_eq!(result.returncode, NOT_FOUND_RETURNCODE);
        assert!(!result.executed);
        assert_eq!(
            result.stderr,
            "powershell executable not found: /definitely/not/a/shell"
        );
    }

    #[test]
    fn invalid_policy_pattern_is_reported() {
        let options = ShellOptions {
            denylist: vec!["(".to_string()],
            ..ShellOptions::default()
        };
        let err = create_shell_adapter(ShellKind::Posix, &options)
            .err()
            .expect("invalid pattern");
        assert!(format!("{err:#}").contains("invalid shell_denylist pattern"));
    }

    #[test]
    fn decode_output_handles_boms() {
        assert_eq!(decode_output(b"\xEF\xBB\xBFhello"), "hello");
        assert_eq!(decode_output(b"\xFF\xFEh\x00i\x00"), "hi");
        assert_eq!(decode_output(b"ok\xFF"), "ok\u{FFFD}");
    }

    #[cfg(unix)]
    #[test]
    fn posix_adapter_runs_in_cwd_and_captures_streams() {
        let dir = tmp();
        std::fs::write(dir.path().join("marker.txt"), "x").expect("write marker");
        let result = adapter(ShellKind::Posix, ShellOptions::default())
            .execute("ls; echo oops >&2; exit 2", dir.path(), true)
            .expect("run");
        assert!(result.executed);
        assert_eq!(result.returncode, 2);
        assert!(result.stdout.contains("marker.txt"));
        assert!(result.stderr.contains("oops"));
        assert!(result.duration >= 0.0);
    }

    #[cfg(unix)]
    #[test]
    fn posix_adapter_times_out_with_124() {
        let options = ShellOptions {
            timeout: Duration::from_millis(200),
            ..ShellOptions::default()
        };
        let result = adapter(ShellKind::Posix, options)
            .execute("exec sleep 3", tmp().path(), true)
            .expect("run");
        assert!(result.timed_out);
        assert_eq!(result.returncode, TIMEOUT_RETURNCODE);
    }

    #[cfg(unix)]
    #[test]
    fn timeout_bounds_commands_that_fork() {
        let options = ShellOptions {
            timeout: Duration::from_millis(500),
            ..ShellOptions::default()
        };
        let started = std::time::Instant::now();
        let result = adapter(ShellKind::Posix, options)
            .execute("sleep 8; echo done", tmp().path(), true)
            .expect("run");
        assert!(result.timed_out);
        assert_eq!(result.returncode, TIMEOUT_RETURNCODE);
        assert!(!result.stdout.contains("done"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[test]
    fn background_jobs_do_not_hold_the_turn() {
        let options = ShellOptions {
            timeout: Duration::from_secs(5),
            ..ShellOptions::default()
        };
        let started = std::time::Instant::now();
        let result = adapter(ShellKind::Posix, options)
            .execute("sleep 8 & echo started", tmp().path(), true)
            .expect("run");
        assert!(!result.timed_out);
        assert_eq!(result.returncode, 0);
        assert!(result.stdout.contains("started"), "{}", result.stdout);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
