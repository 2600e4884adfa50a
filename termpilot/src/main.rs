//! `termpilot`: let a language model drive the terminal toward a goal.
//!
//! Each turn the model proposes one command; destructive commands are gated
//! by the safety mode, results are fed back, and the run ends when the model
//! declares completion, the operator stops it, or the step budget runs out.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use tracing::debug;

use termpilot::core::types::{ShellKind, TerminationReason, TurnRecord};
use termpilot::exit_codes;
use termpilot::io::config::{default_reasoning_effort, load_config};
use termpilot::io::model::{ClientSettings, PromptContext, ResponsesClient, render_system_prompt};
use termpilot::io::operator::TerminalOperator;
use termpilot::io::shell::create_shell_adapter;
use termpilot::io::turn_log::JsonlTurnLog;
use termpilot::logging;
use termpilot::orchestrator::{RunError, TurnOrchestrator};

#[derive(Parser)]
#[command(
    name = "termpilot",
    version,
    about = "Let a language model drive your terminal, one gated command at a time"
)]
struct Cli {
    /// What you want done. Prompted for when omitted.
    goal: Vec<String>,
    /// Working directory for commands (overrides the configured `cwd`).
    #[arg(long)]
    cwd: Option<PathBuf>,
    /// Shell adapter: cmd, powershell/pwsh, bash/sh.
    #[arg(long)]
    shell: Option<String>,
    /// Model name (overrides `default_model`).
    #[arg(long)]
    model: Option<String>,
    /// Apply guardrails but never execute commands.
    #[arg(long)]
    dry_run: bool,
}

fn main() {
    logging::init();
    let code = match run(Cli::parse()) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_code_for(&err)
        }
    };
    std::process::exit(code);
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<RunError>() {
        Some(RunError::ModelTransport(_) | RunError::Operator(_)) => exit_codes::MODEL_ERROR,
        _ => exit_codes::INVALID,
    }
}

fn run(cli: Cli) -> Result<i32> {
    let base_dir = std::env::current_dir().context("resolve current directory")?;
    let mut cfg = load_config(&base_dir)?;

    if let Some(shell) = &cli.shell {
        cfg.shell = shell
            .parse::<ShellKind>()
            .map_err(|err| anyhow!("invalid --shell: {err}"))?;
    }
    if let Some(model) = cli.model {
        cfg.reasoning_effort = std::env::var("TERMPILOT_REASONING_EFFORT")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| default_reasoning_effort(&model));
        cfg.model = model;
    }
    cfg.dry_run |= cli.dry_run;
    cfg.validate()?;

    let run_config = cfg.run_config(cli.cwd.as_deref(), &base_dir)?;
    let shell = create_shell_adapter(run_config.shell_kind, &cfg.shell_options())?;

    let system_prompt = render_system_prompt(
        cfg.system_prompt.as_deref(),
        &PromptContext::new(
            run_config.shell_kind,
            &run_config.cwd,
            run_config.safety_mode,
            run_config.allow_user_feedback_pause,
        ),
    )?;
    let model = ResponsesClient::new(
        ClientSettings {
            api_url: cfg.api_url.clone(),
            api_key: cfg.api_key.clone(),
            model: cfg.model.clone(),
            reasoning_effort: cfg.reasoning_effort.clone(),
            timeout: std::time::Duration::from_secs(cfg.request_timeout_secs),
        },
        system_prompt,
    )?;
    let turn_log = JsonlTurnLog::new(base_dir.join(&cfg.log_dir));

    let mut input = io::stdin().lock();
    let goal = match cli.goal.join(" ").trim() {
        "" => prompt_goal(&mut input)?,
        goal => goal.to_string(),
    };
    if goal.is_empty() {
        println!("No goal given.");
        return Ok(exit_codes::OK);
    }
    let operator = TerminalOperator::new(input, io::stdout());

    debug!(cwd = %run_config.cwd.display(), shell = %run_config.shell_kind, "starting session");
    let mut orchestrator =
        TurnOrchestrator::new(goal, run_config, &model, shell.as_ref(), &operator, &turn_log);
    loop {
        let outcome = orchestrator.run(print_turn)?;
        match outcome.reason {
            TerminationReason::GoalComplete => {
                if orchestrator.offer_continuation(&outcome)?.is_none() {
                    return Ok(exit_codes::OK);
                }
            }
            TerminationReason::UserStopped => {
                println!("Stopped.");
                return Ok(exit_codes::OK);
            }
            TerminationReason::StepLimitExceeded => {
                println!("Step limit reached after {} steps.", outcome.steps - 1);
                return Ok(exit_codes::STEP_LIMIT);
            }
        }
    }
}

fn prompt_goal(input: &mut impl BufRead) -> Result<String> {
    print!("Goal: ");
    io::stdout().flush().context("flush stdout")?;
    let mut line = String::new();
    input.read_line(&mut line).context("read goal")?;
    Ok(line.trim().to_string())
}

fn print_turn(turn: &TurnRecord) {
    let step = turn.step_index;
    if let Some(command) = &turn.command {
        println!("[{step}] $ {command}");
        if let Some(hint) = &turn.hint {
            println!("    hint: {hint}");
        }
        print_block(&turn.stdout);
        print_block(&turn.stderr);
        if let Some(code) = turn.returncode {
            println!("returncode={code} ({:.2}s)", turn.duration);
        }
    } else if turn.complete_signal {
        match &turn.hint {
            Some(hint) => println!("[{step}] complete: {hint}"),
            None => println!("[{step}] complete"),
        }
    } else if let Some(question) = &turn.hint {
        println!("[{step}] question: {question}");
    }
}

fn print_block(text: &str) {
    let text = text.trim_end();
    if !text.is_empty() {
        println!("{text}");
    }
}
