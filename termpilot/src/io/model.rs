//! Model client: asks a Responses-style API for the next terminal step.
//!
//! The [`ModelClient`] trait decouples the orchestrator from the HTTP backend.
//! Tests use scripted clients that return predetermined proposals.

use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use jsonschema::{Draft, Validator};
use minijinja::{Environment, context};
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::types::{Proposal, SafetyMode, ShellKind};

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");
const STEP_SCHEMA: &str = include_str!("../../schemas/terminal_step.schema.json");

pub const STEP_FORMAT_NAME: &str = "terminal_step";
pub const NO_OUTPUT_HINT: &str = "No structured output returned";

/// Response bodies quoted in errors are cut to this many characters.
const ERROR_BODY_CHARS: usize = 500;

static STEP_SCHEMA_VALUE: LazyLock<Value> = LazyLock::new(|| {
    serde_json::from_str(STEP_SCHEMA).expect("bundled step schema should be valid JSON")
});

/// Everything the model sees for one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRequest {
    pub goal: String,
    /// Serialized session context (a JSON array, or empty when over budget).
    pub context: String,
    /// One-turn steering note from the operator.
    pub instruction: Option<String>,
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model request failed: {0}")]
    Transport(String),
    #[error("model API returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("could not parse model response: {0}")]
    Parse(String),
}

/// Abstraction over model backends.
pub trait ModelClient {
    fn propose(&self, request: &ModelRequest) -> Result<Proposal, ModelError>;
}

/// Runtime facts rendered into the system prompt.
#[derive(Debug, Clone, Serialize)]
pub struct PromptContext {
    pub shell: String,
    pub cwd: String,
    pub safety_mode: String,
    pub questions_allowed: bool,
}

impl PromptContext {
    pub fn new(shell: ShellKind, cwd: &std::path::Path, safety_mode: SafetyMode, questions_allowed: bool) -> Self {
        Self {
            shell: shell.as_str().to_string(),
            cwd: cwd.display().to_string(),
            safety_mode: safety_mode.as_str().to_string(),
            questions_allowed,
        }
    }
}

/// Render the system prompt from the bundled template, or from `custom` when configured.
pub fn render_system_prompt(custom: Option<&str>, prompt: &PromptContext) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("system", SYSTEM_TEMPLATE)
        .context("load system prompt template")?;
    let ctx = context! {
        shell => &prompt.shell,
        cwd => &prompt.cwd,
        safety_mode => &prompt.safety_mode,
        questions_allowed => prompt.questions_allowed,
    };
    let rendered = match custom {
        Some(source) => env
            .render_str(source, ctx)
            .context("render configured system_prompt")?,
        None => env
            .get_template("system")?
            .render(ctx)
            .context("render system prompt")?,
    };
    Ok(rendered.trim().to_string())
}

/// Compile the bundled step schema (Draft 2020-12).
pub fn step_validator() -> Result<Validator> {
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&STEP_SCHEMA_VALUE)
        .map_err(|err| anyhow!("invalid step schema: {err}"))
}

/// Connection settings for [`ResponsesClient`].
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub api_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub reasoning_effort: Option<String>,
    pub timeout: Duration,
}

/// Blocking client for the Responses API.
pub struct ResponsesClient {
    agent: ureq::Agent,
    settings: ClientSettings,
    system_prompt: String,
    validator: Validator,
}

impl ResponsesClient {
    pub fn new(settings: ClientSettings, system_prompt: String) -> Result<Self> {
        let agent = ureq::Agent::config_builder()
            .timeout_global(Some(settings.timeout))
            .http_status_as_error(false)
            .build()
            .new_agent();
        Ok(Self {
            agent,
            settings,
            system_prompt,
            validator: step_validator()?,
        })
    }
}

impl ModelClient for ResponsesClient {
    #[instrument(skip_all, fields(model = %self.settings.model))]
    fn propose(&self, request: &ModelRequest) -> Result<Proposal, ModelError> {
        let payload = build_payload(&self.settings, &self.system_prompt, request);
        debug!(
            context_chars = request.context.chars().count(),
            steered = request.instruction.is_some(),
            "requesting next step"
        );

        let mut req = self
            .agent
            .post(self.settings.api_url.as_str())
            .header("Content-Type", "application/json");
        if let Some(key) = &self.settings.api_key {
            req = req.header("Authorization", format!("Bearer {key}"));
        }
        let mut response = req
            .send(payload.to_string())
            .map_err(|err| ModelError::Transport(err.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .body_mut()
            .read_to_string()
            .map_err(|err| ModelError::Transport(format!("read response body: {err}")))?;
        if status >= 400 {
            warn!(status, "model API returned an error status");
            return Err(ModelError::Status {
                status,
                body: body.chars().take(ERROR_BODY_CHARS).collect(),
            });
        }

        let raw: Value = serde_json::from_str(&body)
            .map_err(|err| ModelError::Parse(format!("response body is not JSON: {err}")))?;
        let proposal = parse_response(&raw, &self.validator)?;
        info!(kind = proposal_kind(&proposal), "model proposed next step");
        Ok(proposal)
    }
}

fn proposal_kind(proposal: &Proposal) -> &'static str {
    match proposal {
        Proposal::Command { .. } => "command",
        Proposal::Question { .. } => "question",
        Proposal::Complete { .. } => "complete",
    }
}

/// Build the Responses API request body.
pub fn build_payload(settings: &ClientSettings, system_prompt: &str, request: &ModelRequest) -> Value {
    let context: Value = if request.context.trim().is_empty() {
        json!([])
    } else {
        serde_json::from_str(&request.context).unwrap_or_else(|_| json!([]))
    };
    let user = json!({
        "goal": request.goal,
        "context": context,
        "instruction": request.instruction,
    });

    let mut schema = STEP_SCHEMA_VALUE.clone();
    if let Some(obj) = schema.as_object_mut() {
        obj.remove("$schema");
        obj.remove("title");
    }

    let mut payload = json!({
        "model": settings.model,
        "input": [
            {"role": "system", "content": system_prompt},
            {"role": "user", "content": user.to_string()},
        ],
        "text": {
            "format": {
                "type": "json_schema",
                "name": STEP_FORMAT_NAME,
                "strict": true,
                "schema": schema,
            }
        },
    });
    if let Some(effort) = &settings.reasoning_effort {
        payload["reasoning"] = json!({"effort": effort});
    }
    payload
}

/// Map a raw API response to a [`Proposal`].
///
/// The first non-empty `output_text` item is the structured step. A question
/// wins over a command; `complete` or a missing command means completion.
pub fn parse_response(raw: &Value, validator: &Validator) -> Result<Proposal, ModelError> {
    let Some(text) = first_output_text(raw) else {
        return Ok(Proposal::Complete {
            hint: Some(NO_OUTPUT_HINT.to_string()),
        });
    };
    let step: Value = serde_json::from_str(text)
        .map_err(|err| ModelError::Parse(format!("output_text is not JSON: {err}")))?;
    if !validator.is_valid(&step) {
        let messages = validator
            .iter_errors(&step)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(ModelError::Parse(format!(
            "step schema validation failed: {}",
            messages.join("; ")
        )));
    }

    let field = |key: &str| {
        step.get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    let hint = field("notes");
    let complete = step.get("complete").and_then(Value::as_bool).unwrap_or(false);

    if let Some(question) = field("question") {
        return Ok(Proposal::Question { question, hint });
    }
    match field("command") {
        Some(command) if !complete => Ok(Proposal::Command { command, hint }),
        _ => Ok(Proposal::Complete { hint }),
    }
}

fn first_output_text(raw: &Value) -> Option<&str> {
    raw.get("output")?
        .as_array()?
        .iter()
        .filter_map(|item| item.get("content")?.as_array())
        .flatten()
        .filter(|content| content.get("type").and_then(Value::as_str) == Some("output_text"))
        .filter_map(|content| content.get("text")?.as_str())
        .find(|text| !text.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::thread;

    use super::*;

    fn response_with(step: &Value) -> Value {
        json!({
            "output": [
                {"type": "reasoning", "summary": []},
                {"type": "message", "content": [
                    {"type": "output_text", "text": step.to_string()}
                ]}
            ]
        })
    }

    fn parse(step: Value) -> Result<Proposal, ModelError> {
        let validator = step_validator().expect("validator");
        parse_response(&response_with(&step), &validator)
    }

    fn settings(api_url: String) -> ClientSettings {
        ClientSettings {
            api_url,
            api_key: Some("sk-test".to_string()),
            model: "gpt-5.2".to_string(),
            reasoning_effort: Some("medium".to_string()),
            timeout: Duration::from_secs(5),
        }
    }

    fn request() -> ModelRequest {
        ModelRequest {
            goal: "list files".to_string(),
            context: "[]".to_string(),
            instruction: None,
        }
    }

    #[test]
    fn command_step_maps_to_command_proposal() {
        let proposal = parse(json!({
            "command": "ls -la", "question": null, "notes": "look around", "complete": false
        }))
        .expect("parse");
        assert_eq!(
            proposal,
            Proposal::Command {
                command: "ls -la".to_string(),
                hint: Some("look around".to_string())
            }
        );
    }

    #[test]
    fn question_wins_over_command() {
        let proposal = parse(json!({
            "command": "ls", "question": "Which directory?", "notes": null, "complete": false
        }))
        .expect("parse");
        assert!(matches!(proposal, Proposal::Question { ref question, .. } if question == "Which directory?"));
    }

    #[test]
    fn complete_flag_or_missing_command_means_complete() {
        let done = parse(json!({
            "command": "ls", "question": null, "notes": "done", "complete": true
        }))
        .expect("parse");
        assert_eq!(done, Proposal::Complete { hint: Some("done".to_string()) });

        let idle = parse(json!({
            "command": "  ", "question": null, "notes": null, "complete": false
        }))
        .expect("parse");
        assert_eq!(idle, Proposal::Complete { hint: None });
    }

    #[test]
    fn missing_output_text_completes_with_hint() {
        let validator = step_validator().expect("validator");
        let proposal = parse_response(&json!({"output": []}), &validator).expect("parse");
        assert_eq!(
            proposal,
            Proposal::Complete {
                hint: Some(NO_OUTPUT_HINT.to_string())
            }
        );
    }

    #[test]
    fn schema_violations_are_parse_errors() {
        let err = parse(json!({"command": "ls", "complete": "yes"})).expect_err("invalid");
        assert!(matches!(err, ModelError::Parse(ref msg) if msg.contains("schema validation")));

        let validator = step_validator().expect("validator");
        let raw = json!({"output": [{"content": [{"type": "output_text", "text": "not json"}]}]});
        assert!(matches!(
            parse_response(&raw, &validator),
            Err(ModelError::Parse(_))
        ));
    }

    #[test]
    fn payload_carries_strict_schema_and_reasoning() {
        let mut req = request();
        req.context = r#"[{"type":"user_feedback","question":"q","response":"r"}]"#.to_string();
        req.instruction = Some("use git".to_string());
        let payload = build_payload(&settings("http://unused".to_string()), "SYSTEM", &req);

        assert_eq!(payload["model"], "gpt-5.2");
        assert_eq!(payload["reasoning"]["effort"], "medium");
        assert_eq!(payload["text"]["format"]["name"], STEP_FORMAT_NAME);
        assert_eq!(payload["text"]["format"]["strict"], true);
        assert!(payload["text"]["format"]["schema"].get("$schema").is_none());
        assert_eq!(payload["input"][0]["content"], "SYSTEM");

        let user: Value =
            serde_json::from_str(payload["input"][1]["content"].as_str().expect("string"))
                .expect("user json");
        assert_eq!(user["goal"], "list files");
        assert_eq!(user["context"][0]["type"], "user_feedback");
        assert_eq!(user["instruction"], "use git");
    }

    #[test]
    fn system_prompt_reflects_runtime_context() {
        let ctx = PromptContext::new(
            ShellKind::PowerShell,
            std::path::Path::new("/work"),
            SafetyMode::Strict,
            false,
        );
        let prompt = render_system_prompt(None, &ctx).expect("render");
        assert!(prompt.contains("Shell: powershell"));
        assert!(prompt.contains("/work"));
        assert!(prompt.contains("Do not ask the user questions"));

        let custom = render_system_prompt(Some("Use {{ shell }} only."), &ctx).expect("custom");
        assert_eq!(custom, "Use powershell only.");
    }

    /// Serve exactly one HTTP response and hand back the request body.
    fn serve_once(status_line: &'static str, body: String) -> (String, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let url = format!("http://{}/v1/responses", listener.local_addr().expect("addr"));
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept");
            let mut reader = BufReader::new(stream.try_clone().expect("clone"));
            let mut content_length = 0usize;
            let mut auth = String::new();
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).expect("read header");
                let trimmed = line.trim_end();
                if trimmed.is_empty() {
                    break;
                }
                let lower = trimmed.to_ascii_lowercase();
                if let Some(value) = lower.strip_prefix("content-length:") {
                    content_length = value.trim().parse().expect("content length");
                }
                if lower.starts_with("authorization:") {
                    auth = trimmed.to_string();
                }
            }
            let mut request_body = vec![0u8; content_length];
            reader.read_exact(&mut request_body).expect("read body");

            let mut stream = stream;
            write!(
                stream,
                "{status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            )
            .expect("write response");
            stream.flush().expect("flush");
            format!("{auth}\n{}", String::from_utf8_lossy(&request_body))
        });
        (url, handle)
    }

    #[test]
    fn client_posts_payload_and_parses_step() {
        let step = json!({"command": "ls", "question": null, "notes": null, "complete": false});
        let (url, server) = serve_once("HTTP/1.1 200 OK", response_with(&step).to_string());
        let client = ResponsesClient::new(settings(url), "SYSTEM".to_string()).expect("client");

        let proposal = client.propose(&request()).expect("propose");
        assert_eq!(
            proposal,
            Proposal::Command {
                command: "ls".to_string(),
                hint: None
            }
        );
        let seen = server.join().expect("server");
        assert!(seen.starts_with("Authorization: Bearer sk-test") || seen.starts_with("authorization: Bearer sk-test"));
        assert!(seen.contains("\"terminal_step\""));
    }

    #[test]
    fn client_maps_error_status() {
        let (url, server) = serve_once(
            "HTTP/1.1 500 Internal Server Error",
            r#"{"error":"boom"}"#.to_string(),
        );
        let client = ResponsesClient::new(settings(url), "SYSTEM".to_string()).expect("client");
        let err = client.propose(&request()).expect_err("status error");
        assert!(matches!(err, ModelError::Status { status: 500, ref body } if body.contains("boom")));
        server.join().expect("server");
    }

    #[test]
    fn client_maps_connection_failure_to_transport() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let url = format!("http://{}/v1/responses", listener.local_addr().expect("addr"));
        drop(listener);
        let client = ResponsesClient::new(settings(url), "SYSTEM".to_string()).expect("client");
        assert!(matches!(
            client.propose(&request()),
            Err(ModelError::Transport(_))
        ));
    }
}
