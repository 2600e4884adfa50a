//! Interactive operator prompts.
//!
//! The [`Operator`] trait is the orchestrator's only channel to the human.
//! [`TerminalOperator`] implements it over any `BufRead`/`Write` pair so the
//! prompts can be exercised with in-memory buffers.

use std::cell::RefCell;
use std::io::{BufRead, Write};

use anyhow::{Context, Result};

/// Operator choice at a manual-advance checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointAction {
    /// Run the pending command.
    Advance,
    /// Run the pending command and pass this note with the next model request.
    Steer(String),
    Stop,
}

/// Operator answer to a declared completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionResponse {
    Accept,
    /// Keep going; `None` means no follow-up text was given.
    Decline { feedback: Option<String> },
}

pub trait Operator {
    /// Approve a destructive command.
    fn confirm_command(&self, command: &str) -> Result<bool>;
    /// Answer a model question. An empty answer stops the run.
    fn answer_question(&self, question: &str) -> Result<String>;
    fn confirm_completion(&self, hint: Option<&str>) -> Result<CompletionResponse>;
    fn checkpoint(&self, step_index: u32, command: &str) -> Result<CheckpointAction>;
    /// Returns new instructions when the operator wants a follow-up run.
    fn offer_continuation(&self, prompt: &str) -> Result<Option<String>>;
}

/// Line-oriented prompts on a reader/writer pair (stdin/stdout in the binary).
pub struct TerminalOperator<R, W> {
    input: RefCell<R>,
    output: RefCell<W>,
}

impl<R: BufRead, W: Write> TerminalOperator<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self {
            input: RefCell::new(input),
            output: RefCell::new(output),
        }
    }

    pub fn into_output(self) -> W {
        self.output.into_inner()
    }

    /// Print `prompt` and read one trimmed line; `None` on EOF.
    fn ask(&self, prompt: &str) -> Result<Option<String>> {
        {
            let mut out = self.output.borrow_mut();
            write!(out, "{prompt}").context("write prompt")?;
            out.flush().context("flush prompt")?;
        }
        let mut line = String::new();
        let read = self
            .input
            .borrow_mut()
            .read_line(&mut line)
            .context("read operator input")?;
        if read == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim().to_string()))
    }

    fn say(&self, text: &str) -> Result<()> {
        writeln!(self.output.borrow_mut(), "{text}").context("write operator output")
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.to_ascii_lowercase().as_str(), "y" | "yes")
}

fn is_no(answer: &str) -> bool {
    matches!(answer.to_ascii_lowercase().as_str(), "n" | "no")
}

impl<R: BufRead, W: Write> Operator for TerminalOperator<R, W> {
    fn confirm_command(&self, command: &str) -> Result<bool> {
        self.say(&format!("Destructive command proposed: {command}"))?;
        let answer = self.ask("Run it? [y/N] ")?;
        Ok(answer.is_some_and(|a| is_yes(&a)))
    }

    fn answer_question(&self, question: &str) -> Result<String> {
        self.say(&format!("Model asks: {question}"))?;
        Ok(self.ask("Your response: ")?.unwrap_or_default())
    }

    fn confirm_completion(&self, hint: Option<&str>) -> Result<CompletionResponse> {
        match hint {
            Some(hint) => self.say(&format!("Model reports the goal is complete: {hint}"))?,
            None => self.say("Model reports the goal is complete.")?,
        }
        let Some(answer) = self.ask("Finish now? [Y/n] ")? else {
            return Ok(CompletionResponse::Accept);
        };
        if !is_no(&answer) {
            return Ok(CompletionResponse::Accept);
        }
        let feedback = self
            .ask("What should happen next? (enter to just continue): ")?
            .filter(|text| !text.is_empty());
        Ok(CompletionResponse::Decline { feedback })
    }

    fn checkpoint(&self, step_index: u32, command: &str) -> Result<CheckpointAction> {
        self.say(&format!("[{step_index}] next: {command}"))?;
        loop {
            let Some(answer) = self.ask("enter = run, s <text> = steer, q = stop: ")? else {
                return Ok(CheckpointAction::Stop);
            };
            match answer.as_str() {
                "" => return Ok(CheckpointAction::Advance),
                "q" | "quit" | "stop" => return Ok(CheckpointAction::Stop),
                _ => {}
            }
            if let Some(rest) = answer.strip_prefix("s ") {
                let note = rest.trim();
                if !note.is_empty() {
                    return Ok(CheckpointAction::Steer(note.to_string()));
                }
            }
            self.say("Unrecognized input.")?;
        }
    }

    fn offer_continuation(&self, prompt: &str) -> Result<Option<String>> {
        let Some(answer) = self.ask(&format!("{prompt} [y/N] "))? else {
            return Ok(None);
        };
        if !is_yes(&answer) {
            return Ok(None);
        }
        Ok(self
            .ask("New instructions: ")?
            .filter(|text| !text.is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn operator(input: &str) -> TerminalOperator<Cursor<Vec<u8>>, Vec<u8>> {
        TerminalOperator::new(Cursor::new(input.as_bytes().to_vec()), Vec::new())
    }

    fn transcript(op: TerminalOperator<Cursor<Vec<u8>>, Vec<u8>>) -> String {
        String::from_utf8(op.into_output()).expect("utf8")
    }

    #[test]
    fn confirm_command_defaults_to_no() {
        assert!(operator("y\n").confirm_command("rm -rf x").expect("answer"));
        assert!(!operator("\n").confirm_command("rm -rf x").expect("answer"));
        assert!(!operator("").confirm_command("rm -rf x").expect("eof"));

        let op = operator("yes\n");
        op.confirm_command("rm -rf x").expect("answer");
        let out = transcript(op);
        assert!(out.contains("rm -rf x"));
        assert!(out.contains("[y/N]"));
    }

    #[test]
    fn question_answer_is_trimmed_and_eof_is_empty() {
        let op = operator("  staging  \n");
        assert_eq!(op.answer_question("Which env?").expect("answer"), "staging");
        assert!(transcript(op).contains("Your response: "));
        assert_eq!(operator("").answer_question("Which env?").expect("eof"), "");
    }

    #[test]
    fn completion_defaults_to_accept_and_captures_follow_up() {
        assert_eq!(
            operator("\n").confirm_completion(None).expect("accept"),
            CompletionResponse::Accept
        );
        assert_eq!(
            operator("n\nalso run tests\n")
                .confirm_completion(Some("done"))
                .expect("decline"),
            CompletionResponse::Decline {
                feedback: Some("also run tests".to_string())
            }
        );
        assert_eq!(
            operator("n\n\n").confirm_completion(None).expect("decline"),
            CompletionResponse::Decline { feedback: None }
        );
    }

    #[test]
    fn checkpoint_parses_advance_steer_and_stop() {
        assert_eq!(operator("\n").checkpoint(1, "ls").expect("advance"), CheckpointAction::Advance);
        assert_eq!(
            operator("s prefer git\n").checkpoint(1, "ls").expect("steer"),
            CheckpointAction::Steer("prefer git".to_string())
        );
        assert_eq!(operator("q\n").checkpoint(1, "ls").expect("stop"), CheckpointAction::Stop);
        assert_eq!(operator("").checkpoint(1, "ls").expect("eof"), CheckpointAction::Stop);
    }

    #[test]
    fn checkpoint_reprompts_on_unknown_input() {
        let op = operator("what\n\n");
        assert_eq!(op.checkpoint(3, "pwd").expect("advance"), CheckpointAction::Advance);
        let out = transcript(op);
        assert!(out.contains("[3] next: pwd"));
        assert!(out.contains("Unrecognized input."));
    }

    #[test]
    fn continuation_requires_yes_and_instructions() {
        let op = operator("y\ndeploy it\n");
        assert_eq!(
            op.offer_continuation("Keep going?").expect("continue"),
            Some("deploy it".to_string())
        );
        assert!(transcript(op).contains("Keep going? [y/N] "));
        assert_eq!(operator("\n").offer_continuation("Keep going?").expect("no"), None);
        assert_eq!(operator("y\n\n").offer_continuation("Keep going?").expect("empty"), None);
        assert_eq!(operator("").offer_continuation("Keep going?").expect("eof"), None);
    }
}
