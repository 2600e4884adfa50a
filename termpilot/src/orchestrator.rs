//! Turn orchestration: the state machine that drives one terminal session.
//!
//! Each turn asks the model for a [`Proposal`], routes commands through the
//! safety gate and the shell adapter, feeds the outcome back into the session
//! context and decides whether to continue, pause for the operator or stop.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::context::{SessionContext, SessionContextEvent, clip_output};
use crate::core::safety;
use crate::core::types::{
    Proposal, SafetyDecision, SafetyMode, ShellKind, TerminationReason, TurnRecord,
};
use crate::io::config::resolve_working_directory;
use crate::io::model::{ModelClient, ModelError, ModelRequest};
use crate::io::operator::{CheckpointAction, CompletionResponse, Operator};
use crate::io::shell::ShellAdapter;
use crate::io::turn_log::TurnLogger;

pub const DEFAULT_COMPLETION_FEEDBACK: &str = "User asked to continue instead of ending.";

/// Resolved settings the orchestrator runs with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    pub safety_mode: SafetyMode,
    pub shell_kind: ShellKind,
    pub max_steps: u32,
    pub max_context_chars: usize,
    pub max_output_chars: usize,
    pub cwd: PathBuf,
    pub auto_progress_turns: bool,
    pub allow_user_feedback_pause: bool,
    pub confirm_before_complete: bool,
    pub continuation_prompt_enabled: bool,
    pub continuation_prompt_text: String,
}

/// Mutable per-run state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunState {
    pub goal: String,
    pub step_count: u32,
    pub max_steps: u32,
    pub working_directory: PathBuf,
    pub shell_kind: ShellKind,
    pub safety_mode: SafetyMode,
    pub terminal: bool,
}

/// Summary of one finished run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub reason: TerminationReason,
    /// `step_count` at termination.
    pub steps: u32,
    pub turns: Vec<TurnRecord>,
    pub continuation_prompt: Option<String>,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    ModelTransport(#[from] ModelError),
    #[error("{0}")]
    ConfigurationInvalid(String),
    #[error("operator prompt failed: {0}")]
    Operator(String),
    #[error("run already terminated; start a follow-up with continue_with")]
    AlreadyTerminated,
}

fn operator_error(err: anyhow::Error) -> RunError {
    RunError::Operator(format!("{err:#}"))
}

enum Phase {
    ProposingCommand,
    AwaitingSafetyDecision {
        turn: TurnRecord,
        command: String,
    },
    Executing {
        turn: TurnRecord,
        command: String,
        decision: SafetyDecision,
    },
    FeedingBack {
        turn: TurnRecord,
        event: SessionContextEvent,
    },
    AwaitingUserInput {
        turn: TurnRecord,
        question: String,
    },
    AwaitingCompletionConfirmation {
        turn: TurnRecord,
    },
    Terminated(TerminationReason),
}

impl Phase {
    fn name(&self) -> &'static str {
        match self {
            Phase::ProposingCommand => "proposing_command",
            Phase::AwaitingSafetyDecision { .. } => "awaiting_safety_decision",
            Phase::Executing { .. } => "executing",
            Phase::FeedingBack { .. } => "feeding_back",
            Phase::AwaitingUserInput { .. } => "awaiting_user_input",
            Phase::AwaitingCompletionConfirmation { .. } => "awaiting_completion_confirmation",
            Phase::Terminated(_) => "terminated",
        }
    }
}

/// Drives runs against borrowed collaborators.
pub struct TurnOrchestrator<'a> {
    config: RunConfig,
    state: RunState,
    context: SessionContext,
    pending_instruction: Option<String>,
    model: &'a dyn ModelClient,
    shell: &'a dyn ShellAdapter,
    operator: &'a dyn Operator,
    logger: &'a dyn TurnLogger,
}

impl<'a> TurnOrchestrator<'a> {
    pub fn new(
        goal: impl Into<String>,
        config: RunConfig,
        model: &'a dyn ModelClient,
        shell: &'a dyn ShellAdapter,
        operator: &'a dyn Operator,
        logger: &'a dyn TurnLogger,
    ) -> Self {
        let state = RunState {
            goal: goal.into(),
            step_count: 0,
            max_steps: config.max_steps,
            working_directory: config.cwd.clone(),
            shell_kind: shell.kind(),
            safety_mode: config.safety_mode,
            terminal: false,
        };
        Self {
            config,
            state,
            context: SessionContext::new(),
            pending_instruction: None,
            model,
            shell,
            operator,
            logger,
        }
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    /// Start a follow-up run: new goal, fresh step budget, same session context.
    pub fn continue_with(&mut self, goal: impl Into<String>) {
        self.state.goal = goal.into();
        self.state.step_count = 0;
        self.state.terminal = false;
        self.pending_instruction = None;
        info!(goal = %self.state.goal, history = self.context.len(), "continuing with new goal");
    }

    /// Validate and switch the working directory used for subsequent commands.
    pub fn reconfigure_working_directory(&mut self, path: &Path) -> Result<(), RunError> {
        let resolved = resolve_working_directory(path)?;
        info!(cwd = %resolved.display(), "working directory changed");
        self.config.cwd = resolved.clone();
        self.state.working_directory = resolved;
        Ok(())
    }

    /// Ask the operator whether to keep going after `outcome`.
    ///
    /// Returns the new goal and prepares the follow-up run when accepted.
    pub fn offer_continuation(&mut self, outcome: &RunOutcome) -> Result<Option<String>, RunError> {
        let Some(prompt) = outcome.continuation_prompt.as_deref() else {
            return Ok(None);
        };
        let next = self
            .operator
            .offer_continuation(prompt)
            .map_err(operator_error)?;
        if let Some(goal) = &next {
            self.continue_with(goal.clone());
        }
        Ok(next)
    }

    /// Run until termination, calling `on_turn` after every completed turn.
    #[instrument(skip_all, fields(shell = %self.state.shell_kind, safety_mode = %self.state.safety_mode))]
    pub fn run<F: FnMut(&TurnRecord)>(&mut self, mut on_turn: F) -> Result<RunOutcome, RunError> {
        if self.state.terminal {
            return Err(RunError::AlreadyTerminated);
        }
        info!(goal = %self.state.goal, max_steps = self.state.max_steps, "run started");

        let mut turns = Vec::new();
        let result = self.drive(&mut turns, &mut on_turn);
        // Fatal errors end the run too; a retry must go through continue_with.
        self.state.terminal = true;
        let reason = result.inspect_err(|err| warn!(err = %err, "run aborted"))?;

        let continuation_prompt = turns.last().and_then(|t| t.continuation_prompt.clone());
        info!(reason = %reason, steps = self.state.step_count, turns = turns.len(), "run finished");
        Ok(RunOutcome {
            reason,
            steps: self.state.step_count,
            turns,
            continuation_prompt,
        })
    }

    fn drive<F: FnMut(&TurnRecord)>(
        &mut self,
        turns: &mut Vec<TurnRecord>,
        on_turn: &mut F,
    ) -> Result<TerminationReason, RunError> {
        let mut phase = Phase::ProposingCommand;
        loop {
            debug!(phase = phase.name(), step = self.state.step_count, "phase");
            phase = match phase {
                Phase::ProposingCommand => self.propose(turns, on_turn)?,
                Phase::AwaitingSafetyDecision { turn, command } => {
                    self.gate(turn, command, turns, on_turn)?
                }
                Phase::Executing {
                    turn,
                    command,
                    decision,
                } => self.execute(turn, command, decision),
                Phase::FeedingBack { turn, event } => {
                    self.context.append(event);
                    self.finish_turn(turn, turns, on_turn);
                    Phase::ProposingCommand
                }
                Phase::AwaitingUserInput { turn, question } => {
                    self.await_user_input(turn, question, turns, on_turn)?
                }
                Phase::AwaitingCompletionConfirmation { turn } => {
                    self.await_completion(turn, turns, on_turn)?
                }
                Phase::Terminated(reason) => return Ok(reason),
            };
        }
    }

    fn propose<F: FnMut(&TurnRecord)>(
        &mut self,
        turns: &mut Vec<TurnRecord>,
        on_turn: &mut F,
    ) -> Result<Phase, RunError> {
        self.state.step_count += 1;
        if self.state.step_count > self.state.max_steps {
            warn!(max_steps = self.state.max_steps, "step limit exceeded");
            return Ok(Phase::Terminated(TerminationReason::StepLimitExceeded));
        }

        let request = ModelRequest {
            goal: self.state.goal.clone(),
            context: self.context.serialize(self.config.max_context_chars),
            instruction: self.pending_instruction.take(),
        };
        let proposal = self.model.propose(&request)?;
        let mut turn = TurnRecord::new(self.state.step_count);
        turn.hint = proposal.hint().map(str::to_string);

        Ok(match proposal {
            Proposal::Command { command, .. } => {
                turn.command = Some(command.clone());
                Phase::AwaitingSafetyDecision { turn, command }
            }
            Proposal::Question { question, .. } if self.config.allow_user_feedback_pause => {
                turn.awaiting_user_feedback = true;
                turn.hint = Some(question.clone());
                Phase::AwaitingUserInput { turn, question }
            }
            Proposal::Question { question, .. } => {
                info!("question received while feedback pause is disabled");
                turn.hint = Some(question.clone());
                Phase::FeedingBack {
                    turn,
                    event: SessionContextEvent::FeedbackUnavailable { question },
                }
            }
            Proposal::Complete { .. } => {
                turn.complete_signal = true;
                if self.config.confirm_before_complete {
                    Phase::AwaitingCompletionConfirmation { turn }
                } else {
                    self.complete(turn, turns, on_turn)
                }
            }
        })
    }

    fn gate<F: FnMut(&TurnRecord)>(
        &mut self,
        mut turn: TurnRecord,
        command: String,
        turns: &mut Vec<TurnRecord>,
        on_turn: &mut F,
    ) -> Result<Phase, RunError> {
        let mut decision = safety::evaluate(&command, self.state.safety_mode);
        if decision.requires_confirmation {
            let approved = self
                .operator
                .confirm_command(&command)
                .map_err(operator_error)?;
            decision = decision.with_user_choice(approved);
        }
        debug!(
            destructive = decision.is_destructive,
            confirmed = decision.confirmed,
            reason_code = ?decision.reason_code,
            "safety decision"
        );

        if decision.is_declined() {
            info!("operator declined destructive command");
            turn.stderr = "command declined by operator".to_string();
            return Ok(Phase::FeedingBack {
                turn,
                event: SessionContextEvent::CommandDeclined {
                    step_index: self.state.step_count,
                    command,
                    safety_mode: self.state.safety_mode,
                    reason_code: decision.reason_code,
                },
            });
        }

        if !self.config.auto_progress_turns {
            match self
                .operator
                .checkpoint(self.state.step_count, &command)
                .map_err(operator_error)?
            {
                CheckpointAction::Advance => {}
                CheckpointAction::Steer(note) => {
                    debug!("steering note queued for next request");
                    self.pending_instruction = Some(note);
                }
                CheckpointAction::Stop => {
                    info!("operator stopped the run at checkpoint");
                    self.finish_turn(turn, turns, on_turn);
                    return Ok(Phase::Terminated(TerminationReason::UserStopped));
                }
            }
        }

        Ok(Phase::Executing {
            turn,
            command,
            decision,
        })
    }

    fn execute(&mut self, mut turn: TurnRecord, command: String, decision: SafetyDecision) -> Phase {
        let step_index = self.state.step_count;
        let safety_mode = self.state.safety_mode;
        let reason_code = decision.reason_code;
        let event = match self
            .shell
            .execute(&command, &self.state.working_directory, decision.confirmed)
        {
            Ok(result) => {
                turn.returncode = result.executed.then_some(result.returncode);
                turn.duration = result.duration.max(0.0);
                let max = self.config.max_output_chars;
                let event = SessionContextEvent::CommandExecuted {
                    step_index,
                    command,
                    safety_mode,
                    reason_code,
                    returncode: result.returncode,
                    stdout: clip_output(&result.stdout, max),
                    stderr: clip_output(&result.stderr, max),
                    duration: turn.duration,
                    timed_out: result.timed_out,
                    hint: turn.hint.clone(),
                };
                turn.stdout = result.stdout;
                turn.stderr = result.stderr;
                event
            }
            Err(blocked) => {
                info!(reason = %blocked.reason, "shell adapter blocked command");
                turn.stderr = blocked.reason.clone();
                SessionContextEvent::CommandBlocked {
                    step_index,
                    command,
                    safety_mode,
                    reason_code,
                    reason: blocked.reason,
                }
            }
        };
        Phase::FeedingBack { turn, event }
    }

    fn await_user_input<F: FnMut(&TurnRecord)>(
        &mut self,
        turn: TurnRecord,
        question: String,
        turns: &mut Vec<TurnRecord>,
        on_turn: &mut F,
    ) -> Result<Phase, RunError> {
        self.finish_turn(turn, turns, on_turn);
        let response = self
            .operator
            .answer_question(&question)
            .map_err(operator_error)?;
        let response = response.trim();
        if response.is_empty() {
            info!("empty answer, stopping");
            return Ok(Phase::Terminated(TerminationReason::UserStopped));
        }
        self.context.append(SessionContextEvent::UserFeedback {
            question,
            response: response.to_string(),
        });
        Ok(Phase::ProposingCommand)
    }

    fn await_completion<F: FnMut(&TurnRecord)>(
        &mut self,
        turn: TurnRecord,
        turns: &mut Vec<TurnRecord>,
        on_turn: &mut F,
    ) -> Result<Phase, RunError> {
        let response = self
            .operator
            .confirm_completion(turn.hint.as_deref())
            .map_err(operator_error)?;
        match response {
            CompletionResponse::Accept => Ok(self.complete(turn, turns, on_turn)),
            CompletionResponse::Decline { feedback } => {
                let feedback = feedback
                    .map(|text| text.trim().to_string())
                    .filter(|text| !text.is_empty())
                    .unwrap_or_else(|| DEFAULT_COMPLETION_FEEDBACK.to_string());
                info!("operator declined completion");
                Ok(Phase::FeedingBack {
                    turn,
                    event: SessionContextEvent::CompletionDeclined { feedback },
                })
            }
        }
    }

    fn complete<F: FnMut(&TurnRecord)>(
        &mut self,
        mut turn: TurnRecord,
        turns: &mut Vec<TurnRecord>,
        on_turn: &mut F,
    ) -> Phase {
        if self.config.continuation_prompt_enabled {
            turn.continuation_prompt = Some(self.config.continuation_prompt_text.clone());
        }
        self.finish_turn(turn, turns, on_turn);
        Phase::Terminated(TerminationReason::GoalComplete)
    }

    fn finish_turn<F: FnMut(&TurnRecord)>(
        &self,
        turn: TurnRecord,
        turns: &mut Vec<TurnRecord>,
        on_turn: &mut F,
    ) {
        if let Err(err) = self.logger.record(&turn) {
            warn!(step = turn.step_index, err = %format!("{err:#}"), "failed to write turn log");
        }
        on_turn(&turn);
        turns.push(turn);
    }
}
