//! Safety gate for model-proposed commands.
//!
//! Classification is a pure function of the command text. The gate never runs
//! anything; it only decides what `confirmed` value the shell adapter receives
//! and whether the operator has to be asked first.

use std::sync::LazyLock;

use regex::{Regex, RegexBuilder};

use crate::core::types::{ReasonCode, SafetyDecision, SafetyMode};

/// Recursive or forced deletion idioms across POSIX, cmd and PowerShell.
const DESTRUCTIVE_PATTERNS: &[&str] = &[
    r"\brm\s+(?:[^;&|\n]*\s)?(?:-[a-z]*r[a-z]*|--recursive)\b",
    r"\b(?:del|erase)\s+(?:[^;&|\n]*\s)?/[sq]\b",
    r"\b(?:rd|rmdir)\s+(?:[^;&|\n]*\s)?/s\b",
    r"\bremove-item\b[^;&|\n]*\s-(?:recurse|force)\b",
    r"\bformat(?:\.com)?\s+[a-z]:",
    r"\b(?:format-volume|clear-disk)\b",
    r"\bmkfs(?:\.\w+)?\b",
    r"\bdd\b[^;&|\n]*\bof=/dev/",
    r"\bdrop\s+(?:table|database)\b",
];

static DESTRUCTIVE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    DESTRUCTIVE_PATTERNS
        .iter()
        .map(|pattern| {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .expect("destructive pattern should be valid")
        })
        .collect()
});

/// Returns true when `command` matches a known irreversible-deletion idiom.
pub fn is_destructive(command: &str) -> bool {
    DESTRUCTIVE.iter().any(|re| re.is_match(command))
}

/// Decide how a proposed command is gated under `mode`.
///
/// | mode         | destructive | confirmed     | prompt |
/// |--------------|-------------|---------------|--------|
/// | strict       | no          | true          | no     |
/// | strict       | yes         | user's choice | yes    |
/// | allow_unsafe | any         | true          | no     |
/// | off          | any         | false         | no     |
pub fn evaluate(command: &str, mode: SafetyMode) -> SafetyDecision {
    let is_destructive = is_destructive(command);
    match mode {
        SafetyMode::Strict if !is_destructive => SafetyDecision {
            is_destructive,
            confirmed: true,
            requires_confirmation: false,
            reason_code: ReasonCode::None,
        },
        SafetyMode::Strict => SafetyDecision {
            is_destructive,
            confirmed: false,
            requires_confirmation: true,
            reason_code: ReasonCode::None,
        },
        SafetyMode::AllowUnsafe => SafetyDecision {
            is_destructive,
            confirmed: true,
            requires_confirmation: false,
            reason_code: ReasonCode::ModeAllowUnsafe,
        },
        SafetyMode::Off => SafetyDecision {
            is_destructive,
            confirmed: false,
            requires_confirmation: false,
            reason_code: ReasonCode::ModeDeferred,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_MODES: [SafetyMode; 3] = [SafetyMode::Strict, SafetyMode::AllowUnsafe, SafetyMode::Off];

    #[test]
    fn recognizes_deletion_idioms_across_shells() {
        for command in [
            "rm -rf /tmp/x",
            "rm -fr build",
            "sudo rm -r -f ./target",
            "rm --recursive --force node_modules",
            "cd /tmp && RM -Rf cache",
            "del /s /q C:\\temp",
            "rmdir /s /q build",
            "rd /S out",
            "Remove-Item -Recurse -Force .\\dist",
            "format D: /q",
            "mkfs.ext4 /dev/sdb1",
            "dd if=/dev/zero of=/dev/sda bs=1M",
            "psql -c 'DROP TABLE users'",
        ] {
            assert!(is_destructive(command), "expected destructive: {command}");
        }
    }

    #[test]
    fn leaves_everyday_commands_alone() {
        for command in [
            "ls -la",
            "rm notes.txt",
            "rm --preserve-root file",
            "git status",
            "Get-ChildItem -Force",
            "echo format is fine",
            "cargo fmt --all",
            "delta --help",
            "dd if=image.iso of=./copy.iso",
        ] {
            assert!(!is_destructive(command), "expected safe: {command}");
        }
    }

    #[test]
    fn strict_confirms_non_destructive_without_prompt() {
        let decision = evaluate("ls -la", SafetyMode::Strict);
        assert!(decision.confirmed);
        assert!(!decision.requires_confirmation);
        assert_eq!(decision.reason_code, ReasonCode::None);
    }

    #[test]
    fn strict_always_prompts_for_destructive() {
        let decision = evaluate("rm -rf /tmp/x", SafetyMode::Strict);
        assert!(decision.is_destructive);
        assert!(decision.requires_confirmation);
        assert!(!decision.confirmed);

        let approved = decision.with_user_choice(true);
        assert!(approved.confirmed);
        assert_eq!(approved.reason_code, ReasonCode::UserConfirmed);
    }

    #[test]
    fn allow_unsafe_never_prompts() {
        for command in ["ls", "rm -rf /"] {
            let decision = evaluate(command, SafetyMode::AllowUnsafe);
            assert!(decision.confirmed);
            assert!(!decision.requires_confirmation);
            assert_eq!(decision.reason_code, ReasonCode::ModeAllowUnsafe);
        }
    }

    #[test]
    fn off_never_prompts_and_never_confirms() {
        for command in ["ls", "rm -rf /"] {
            let decision = evaluate(command, SafetyMode::Off);
            assert!(!decision.confirmed);
            assert!(!decision.requires_confirmation);
            assert_eq!(decision.reason_code, ReasonCode::ModeDeferred);
        }
    }

    #[test]
    fn only_strict_with_destructive_prompts() {
        for mode in ALL_MODES {
            for command in ["pwd", "rm -rf ./x"] {
                let decision = evaluate(command, mode);
                let expected = mode == SafetyMode::Strict && is_destructive(command);
                assert_eq!(decision.requires_confirmation, expected, "{mode} {command}");
            }
        }
    }
}
