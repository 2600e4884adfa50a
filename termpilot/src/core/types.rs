//! Shared deterministic types for the orchestration core.
//!
//! These types define stable contracts between the safety gate, the session
//! context and the orchestrator. They do not depend on external state or I/O.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How proposed commands are gated before they reach the shell adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyMode {
    /// Destructive commands require interactive confirmation.
    Strict,
    /// Every command is pre-confirmed.
    AllowUnsafe,
    /// The gate never confirms; the shell adapter's own rules decide.
    Off,
}

impl SafetyMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SafetyMode::Strict => "strict",
            SafetyMode::AllowUnsafe => "allow_unsafe",
            SafetyMode::Off => "off",
        }
    }
}

impl fmt::Display for SafetyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SafetyMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(SafetyMode::Strict),
            "allow_unsafe" | "allow-unsafe" | "unsafe" => Ok(SafetyMode::AllowUnsafe),
            "off" | "disabled" | "none" => Ok(SafetyMode::Off),
            other => Err(format!("unknown safety mode '{other}'")),
        }
    }
}

/// Shell family used to run proposed commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShellKind {
    Cmd,
    PowerShell,
    Posix,
}

impl ShellKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ShellKind::Cmd => "cmd",
            ShellKind::PowerShell => "powershell",
            ShellKind::Posix => "bash",
        }
    }
}

impl fmt::Display for ShellKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ShellKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "cmd" | "cmd.exe" => Ok(ShellKind::Cmd),
            "powershell" | "powershell.exe" | "pwsh" => Ok(ShellKind::PowerShell),
            "bash" | "sh" | "shell" | "posix" => Ok(ShellKind::Posix),
            other => Err(format!("unsupported shell adapter '{other}'")),
        }
    }
}

/// Platform capability input for default shell selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    Posix,
}

impl Platform {
    /// Platform of the running binary.
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Posix
        }
    }

    pub fn default_shell(self) -> ShellKind {
        match self {
            Platform::Windows => ShellKind::PowerShell,
            Platform::Posix => ShellKind::Posix,
        }
    }
}

/// Why a command was (or was not) confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    None,
    UserConfirmed,
    UserDeclined,
    ModeAllowUnsafe,
    ModeDeferred,
}

/// Outcome of the safety gate for one proposed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyDecision {
    pub is_destructive: bool,
    /// Value passed to the shell adapter as `confirmed`.
    pub confirmed: bool,
    /// An interactive prompt must resolve this decision before execution.
    pub requires_confirmation: bool,
    pub reason_code: ReasonCode,
}

impl SafetyDecision {
    /// Resolve a pending decision with the operator's answer.
    pub fn with_user_choice(self, approved: bool) -> Self {
        if !self.requires_confirmation {
            return self;
        }
        Self {
            is_destructive: self.is_destructive,
            confirmed: approved,
            requires_confirmation: false,
            reason_code: if approved {
                ReasonCode::UserConfirmed
            } else {
                ReasonCode::UserDeclined
            },
        }
    }

    pub fn is_declined(&self) -> bool {
        self.reason_code == ReasonCode::UserDeclined
    }
}

/// What the model wants to do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Proposal {
    Command {
        command: String,
        hint: Option<String>,
    },
    Question {
        question: String,
        hint: Option<String>,
    },
    Complete {
        hint: Option<String>,
    },
}

impl Proposal {
    pub fn hint(&self) -> Option<&str> {
        match self {
            Proposal::Command { hint, .. }
            | Proposal::Question { hint, .. }
            | Proposal::Complete { hint } => hint.as_deref(),
        }
    }
}

/// One orchestration iteration's outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    /// 1-based, monotonic within a run.
    pub step_index: u32,
    pub command: Option<String>,
    pub returncode: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Elapsed seconds.
    pub duration: f64,
    pub hint: Option<String>,
    pub awaiting_user_feedback: bool,
    pub complete_signal: bool,
    pub continuation_prompt: Option<String>,
}

impl TurnRecord {
    pub fn new(step_index: u32) -> Self {
        Self {
            step_index,
            command: None,
            returncode: None,
            stdout: String::new(),
            stderr: String::new(),
            duration: 0.0,
            hint: None,
            awaiting_user_feedback: false,
            complete_signal: false,
            continuation_prompt: None,
        }
    }
}

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    GoalComplete,
    StepLimitExceeded,
    UserStopped,
}

impl TerminationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            TerminationReason::GoalComplete => "goal_complete",
            TerminationReason::StepLimitExceeded => "step_limit_exceeded",
            TerminationReason::UserStopped => "user_stopped",
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_kind_parses_aliases() {
        assert_eq!("cmd".parse::<ShellKind>(), Ok(ShellKind::Cmd));
        assert_eq!("PWSH".parse::<ShellKind>(), Ok(ShellKind::PowerShell));
        assert_eq!("sh".parse::<ShellKind>(), Ok(ShellKind::Posix));
        assert!("zsh".parse::<ShellKind>().is_err());
    }

    #[test]
    fn safety_mode_accepts_disabled_alias() {
        assert_eq!("disabled".parse::<SafetyMode>(), Ok(SafetyMode::Off));
        assert_eq!(
            "allow-unsafe".parse::<SafetyMode>(),
            Ok(SafetyMode::AllowUnsafe)
        );
    }

    #[test]
    fn default_shell_is_a_function_of_platform() {
        assert_eq!(Platform::Windows.default_shell(), ShellKind::PowerShell);
        assert_eq!(Platform::Posix.default_shell(), ShellKind::Posix);
    }

    #[test]
    fn user_choice_only_applies_to_pending_decisions() {
        let pending = SafetyDecision {
            is_destructive: true,
            confirmed: false,
            requires_confirmation: true,
            reason_code: ReasonCode::None,
        };
        let declined = pending.with_user_choice(false);
        assert!(declined.is_declined());
        assert!(!declined.confirmed);

        let settled = SafetyDecision {
            is_destructive: false,
            confirmed: true,
            requires_confirmation: false,
            reason_code: ReasonCode::None,
        };
        assert_eq!(settled.with_user_choice(false), settled);
    }
}
