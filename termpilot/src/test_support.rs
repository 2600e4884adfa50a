//! Scripted collaborators for driving the orchestrator in tests.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};

use crate::core::safety;
use crate::core::types::{Proposal, SafetyMode, ShellKind, TurnRecord};
use crate::io::model::{ModelClient, ModelError, ModelRequest};
use crate::io::operator::{CheckpointAction, CompletionResponse, Operator};
use crate::io::shell::{CONFIRMATION_REASON, CommandBlocked, CommandResult, ShellAdapter};
use crate::io::turn_log::TurnLogger;
use crate::orchestrator::RunConfig;

/// Default run settings rooted at `cwd`: strict, auto-progress, no pauses.
pub fn run_config(cwd: &Path) -> RunConfig {
    RunConfig {
        safety_mode: SafetyMode::Strict,
        shell_kind: ShellKind::Posix,
        max_steps: 20,
        max_context_chars: 24_000,
        max_output_chars: 4_000,
        cwd: cwd.to_path_buf(),
        auto_progress_turns: true,
        allow_user_feedback_pause: false,
        confirm_before_complete: false,
        continuation_prompt_enabled: true,
        continuation_prompt_text: "Task finished. Do you want to keep going with new instructions?"
            .to_string(),
    }
}

/// Model that replays a fixed list of responses and records every request.
pub struct ScriptedModel {
    responses: RefCell<VecDeque<Result<Proposal, ModelError>>>,
    requests: RefCell<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new(responses: Vec<Result<Proposal, ModelError>>) -> Self {
        Self {
            responses: RefCell::new(responses.into()),
            requests: RefCell::new(Vec::new()),
        }
    }

    pub fn command(command: &str) -> Result<Proposal, ModelError> {
        Ok(Proposal::Command {
            command: command.to_string(),
            hint: None,
        })
    }

    pub fn question(question: &str) -> Result<Proposal, ModelError> {
        Ok(Proposal::Question {
            question: question.to_string(),
            hint: None,
        })
    }

    pub fn complete(hint: &str) -> Result<Proposal, ModelError> {
        Ok(Proposal::Complete {
            hint: Some(hint.to_string()),
        })
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.borrow().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.borrow().len()
    }
}

impl ModelClient for ScriptedModel {
    fn propose(&self, request: &ModelRequest) -> Result<Proposal, ModelError> {
        self.requests.borrow_mut().push(request.clone());
        self.responses
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| Err(ModelError::Transport("scripted model exhausted".to_string())))
    }
}

/// One recorded adapter call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCall {
    pub command: String,
    pub cwd: PathBuf,
    pub confirmed: bool,
}

/// Shell adapter that records calls and returns canned results.
///
/// With `blocking_unconfirmed`, destructive commands without confirmation are
/// refused the way a real adapter policy would.
pub struct RecordingShell {
    calls: RefCell<Vec<ShellCall>>,
    results: RefCell<VecDeque<CommandResult>>,
    block_unconfirmed: bool,
}

impl Default for RecordingShell {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingShell {
    pub fn new() -> Self {
        Self {
            calls: RefCell::new(Vec::new()),
            results: RefCell::new(VecDeque::new()),
            block_unconfirmed: false,
        }
    }

    pub fn blocking_unconfirmed(mut self) -> Self {
        self.block_unconfirmed = true;
        self
    }

    pub fn with_results(self, results: Vec<CommandResult>) -> Self {
        *self.results.borrow_mut() = results.into();
        self
    }

    pub fn result(command: &str, returncode: i32, stdout: &str, stderr: &str) -> CommandResult {
        CommandResult {
            command: command.to_string(),
            shell: "bash".to_string(),
            returncode,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            duration: 0.01,
            timed_out: false,
            executed: true,
        }
    }

    pub fn calls(&self) -> Vec<ShellCall> {
        self.calls.borrow().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.calls.borrow().iter().map(|c| c.command.clone()).collect()
    }

    pub fn cwds(&self) -> Vec<PathBuf> {
        self.calls.borrow().iter().map(|c| c.cwd.clone()).collect()
    }
}

impl ShellAdapter for RecordingShell {
    fn kind(&self) -> ShellKind {
        ShellKind::Posix
    }

    fn executable(&self) -> &str {
        "recording"
    }

    fn execute(
        &self,
        command: &str,
        cwd: &Path,
        confirmed: bool,
    ) -> Result<CommandResult, CommandBlocked> {
        self.calls.borrow_mut().push(ShellCall {
            command: command.to_string(),
            cwd: cwd.to_path_buf(),
            confirmed,
        });
        if self.block_unconfirmed && !confirmed && safety::is_destructive(command) {
            return Err(CommandBlocked {
                command: command.to_string(),
                shell: "bash".to_string(),
                reason: CONFIRMATION_REASON.to_string(),
            });
        }
        Ok(self
            .results
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| Self::result(command, 0, "ok\n", "")))
    }
}

/// Operator with queued answers per prompt kind; records what was asked.
#[derive(Default)]
pub struct ScriptedOperator {
    confirmations: RefCell<VecDeque<bool>>,
    answers: RefCell<VecDeque<String>>,
    completions: RefCell<VecDeque<CompletionResponse>>,
    checkpoints: RefCell<VecDeque<CheckpointAction>>,
    continuations: RefCell<VecDeque<Option<String>>>,
    prompts: RefCell<Vec<String>>,
    fail: bool,
}

impl ScriptedOperator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every prompt fails, as if stdin had been closed.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn with_confirmations(self, values: Vec<bool>) -> Self {
        *self.confirmations.borrow_mut() = values.into();
        self
    }

    pub fn with_answers(self, values: Vec<&str>) -> Self {
        *self.answers.borrow_mut() = values.into_iter().map(str::to_string).collect();
        self
    }

    pub fn with_completions(self, values: Vec<CompletionResponse>) -> Self {
        *self.completions.borrow_mut() = values.into();
        self
    }

    pub fn with_checkpoints(self, values: Vec<CheckpointAction>) -> Self {
        *self.checkpoints.borrow_mut() = values.into();
        self
    }

    pub fn with_continuations(self, values: Vec<Option<&str>>) -> Self {
        *self.continuations.borrow_mut() = values
            .into_iter()
            .map(|v| v.map(str::to_string))
            .collect();
        self
    }

    /// Prompts in the order they were shown, as `kind: detail`.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.borrow().clone()
    }

    pub fn prompts_of(&self, kind: &str) -> usize {
        let prefix = format!("{kind}:");
        self.prompts
            .borrow()
            .iter()
            .filter(|p| p.starts_with(&prefix))
            .count()
    }

    fn note(&self, kind: &str, detail: &str) -> Result<()> {
        self.prompts.borrow_mut().push(format!("{kind}: {detail}"));
        if self.fail {
            return Err(anyhow!("operator input closed"));
        }
        Ok(())
    }
}

impl Operator for ScriptedOperator {
    fn confirm_command(&self, command: &str) -> Result<bool> {
        self.note("confirm", command)?;
        Ok(self.confirmations.borrow_mut().pop_front().unwrap_or(false))
    }

    fn answer_question(&self, question: &str) -> Result<String> {
        self.note("question", question)?;
        Ok(self.answers.borrow_mut().pop_front().unwrap_or_default())
    }

    fn confirm_completion(&self, hint: Option<&str>) -> Result<CompletionResponse> {
        self.note("completion", hint.unwrap_or_default())?;
        Ok(self
            .completions
            .borrow_mut()
            .pop_front()
            .unwrap_or(CompletionResponse::Accept))
    }

    fn checkpoint(&self, step_index: u32, command: &str) -> Result<CheckpointAction> {
        self.note("checkpoint", &format!("{step_index} {command}"))?;
        Ok(self
            .checkpoints
            .borrow_mut()
            .pop_front()
            .unwrap_or(CheckpointAction::Advance))
    }

    fn offer_continuation(&self, prompt: &str) -> Result<Option<String>> {
        self.note("continuation", prompt)?;
        Ok(self.continuations.borrow_mut().pop_front().flatten())
    }
}

/// In-memory turn log, optionally failing every write.
#[derive(Default)]
pub struct MemoryTurnLog {
    records: RefCell<Vec<TurnRecord>>,
    fail: bool,
}

impl MemoryTurnLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn records(&self) -> Vec<TurnRecord> {
        self.records.borrow().clone()
    }
}

impl TurnLogger for MemoryTurnLog {
    fn record(&self, turn: &TurnRecord) -> Result<()> {
        if self.fail {
            return Err(anyhow!("turn log unavailable"));
        }
        self.records.borrow_mut().push(turn.clone());
        Ok(())
    }
}
