//! Bounded session history sent to the model on every call.
//!
//! Events are serialized once when appended, so `serialize` only has to pick
//! the longest suffix that fits the character budget.

use std::collections::VecDeque;

use serde::Serialize;

use crate::core::types::{ReasonCode, SafetyMode};

/// One entry of the session history.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionContextEvent {
    CommandExecuted {
        step_index: u32,
        command: String,
        safety_mode: SafetyMode,
        reason_code: ReasonCode,
        returncode: i32,
        stdout: String,
        stderr: String,
        duration: f64,
        timed_out: bool,
        hint: Option<String>,
    },
    CommandBlocked {
        step_index: u32,
        command: String,
        safety_mode: SafetyMode,
        reason_code: ReasonCode,
        reason: String,
    },
    CommandDeclined {
        step_index: u32,
        command: String,
        safety_mode: SafetyMode,
        reason_code: ReasonCode,
    },
    UserFeedback {
        question: String,
        response: String,
    },
    CompletionDeclined {
        feedback: String,
    },
    FeedbackUnavailable {
        question: String,
    },
}

impl SessionContextEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            SessionContextEvent::CommandExecuted { .. } => "command_executed",
            SessionContextEvent::CommandBlocked { .. } => "command_blocked",
            SessionContextEvent::CommandDeclined { .. } => "command_declined",
            SessionContextEvent::UserFeedback { .. } => "user_feedback",
            SessionContextEvent::CompletionDeclined { .. } => "completion_declined",
            SessionContextEvent::FeedbackUnavailable { .. } => "feedback_unavailable",
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    event: SessionContextEvent,
    json: String,
    chars: usize,
}

/// Append-only event history with oldest-first eviction at serialization time.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    entries: VecDeque<Entry>,
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, event: SessionContextEvent) {
        let json = serde_json::to_string(&event)
            .unwrap_or_else(|err| format!("{{\"type\":\"{}\",\"error\":\"{err}\"}}", event.kind()));
        let chars = json.chars().count();
        self.entries.push_back(Entry { event, json, chars });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn events(&self) -> impl Iterator<Item = &SessionContextEvent> {
        self.entries.iter().map(|entry| &entry.event)
    }

    /// Render the newest events that fit in `max_chars` as a JSON array.
    ///
    /// Returns an empty string when not even `[]` fits.
    pub fn serialize(&self, max_chars: usize) -> String {
        if max_chars < 2 {
            return String::new();
        }

        // "[" + "]" plus one comma between each kept pair.
        let mut used = 2usize;
        let mut kept = 0usize;
        for entry in self.entries.iter().rev() {
            let separator = usize::from(kept > 0);
            let next = used + entry.chars + separator;
            if next > max_chars {
                break;
            }
            used = next;
            kept += 1;
        }

        let start = self.entries.len() - kept;
        let mut buf = String::with_capacity(used);
        buf.push('[');
        for (idx, entry) in self.entries.iter().skip(start).enumerate() {
            if idx > 0 {
                buf.push(',');
            }
            buf.push_str(&entry.json);
        }
        buf.push(']');
        buf
    }
}

/// Clip `text` to at most `max_chars` characters, noting how much was dropped.
pub fn clip_output(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let mut clipped: String = text.chars().take(max_chars).collect();
    clipped.push_str(&format!("\n[truncated {} chars]", total - max_chars));
    clipped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn declined(step_index: u32) -> SessionContextEvent {
        SessionContextEvent::CommandDeclined {
            step_index,
            command: format!("rm -rf /tmp/{step_index:03}"),
            safety_mode: SafetyMode::Strict,
            reason_code: ReasonCode::UserDeclined,
        }
    }

    fn step_indexes(serialized: &str) -> Vec<u64> {
        let value: serde_json::Value = serde_json::from_str(serialized).expect("valid json");
        value
            .as_array()
            .expect("array")
            .iter()
            .map(|event| event["step_index"].as_u64().expect("step index"))
            .collect()
    }

    #[test]
    fn serialize_keeps_everything_when_budget_allows() {
        let mut context = SessionContext::new();
        context.append(declined(1));
        context.append(declined(2));
        let serialized = context.serialize(10_000);
        assert_eq!(step_indexes(&serialized), vec![1, 2]);
    }

    #[test]
    fn eviction_drops_oldest_and_keeps_a_suffix() {
        let mut context = SessionContext::new();
        for step in 10..=19 {
            context.append(declined(step));
        }
        // Two-digit steps keep every event the same width.
        let one = serde_json::to_string(&declined(10)).expect("json").chars().count();
        let budget = 2 + one * 4 + 3;

        let serialized = context.serialize(budget);
        assert_eq!(serialized.chars().count(), budget);
        assert_eq!(step_indexes(&serialized), vec![16, 17, 18, 19]);

        let tighter = context.serialize(budget - 1);
        assert_eq!(step_indexes(&tighter), vec![17, 18, 19]);
        assert_eq!(context.len(), 10, "eviction never mutates the history");
    }

    #[test]
    fn serialize_never_exceeds_budget() {
        let mut context = SessionContext::new();
        context.append(SessionContextEvent::UserFeedback {
            question: "Which environment?".to_string(),
            response: "staging ✓".to_string(),
        });
        for step in 1..=5 {
            context.append(declined(step));
        }
        for budget in 0..400 {
            let serialized = context.serialize(budget);
            assert!(serialized.chars().count() <= budget, "budget {budget}");
        }
    }

    #[test]
    fn tiny_budgets_yield_empty_array_or_nothing() {
        let mut context = SessionContext::new();
        context.append(declined(1));
        assert_eq!(context.serialize(1), "");
        assert_eq!(context.serialize(2), "[]");
        assert_eq!(context.serialize(20), "[]");
    }

    #[test]
    fn events_are_tagged_by_kind() {
        let mut context = SessionContext::new();
        context.append(SessionContextEvent::CompletionDeclined {
            feedback: "also clean up".to_string(),
        });
        let serialized = context.serialize(1_000);
        assert!(serialized.contains("\"type\":\"completion_declined\""));
    }

    #[test]
    fn clip_output_marks_truncation() {
        assert_eq!(clip_output("short", 10), "short");
        let clipped = clip_output("abcdefghij", 4);
        assert!(clipped.starts_with("abcd\n"));
        assert!(clipped.ends_with("[truncated 6 chars]"));
    }
}
