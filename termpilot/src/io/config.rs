//! Application configuration resolved from config files and `TERMPILOT_*` variables.
//!
//! Precedence is environment > file > defaults. [`AppConfig::resolve`] is a pure
//! function of the parsed file tree, an environment lookup and the platform so
//! tests never touch the process environment.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::core::types::{Platform, SafetyMode, ShellKind};
use crate::io::shell::{ShellOptions, compile_patterns};
use crate::orchestrator::{RunConfig, RunError};

pub const CONFIG_FILE_ENV: &str = "TERMPILOT_CONFIG_FILE";
pub const SHARED_CONFIG_FILE: &str = "termpilot.config.json";
pub const LOCAL_CONFIG_FILE: &str = "termpilot.config.local.json";

pub const DEFAULT_MODEL: &str = "gpt-5.2";
pub const DEFAULT_API_URL: &str = "https://api.openai.com/v1/responses";
pub const DEFAULT_CONTINUATION_TEXT: &str =
    "Task finished. Do you want to keep going with new instructions?";

/// Fully resolved application settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub api_key: Option<String>,
    pub api_url: String,
    pub model: String,
    pub reasoning_effort: Option<String>,
    pub log_dir: PathBuf,
    /// Replaces the bundled system prompt template when set.
    pub system_prompt: Option<String>,
    pub safety_mode: SafetyMode,
    pub shell: ShellKind,
    pub max_steps: u32,
    pub max_context_chars: usize,
    pub max_output_chars: usize,
    pub cwd: Option<PathBuf>,
    pub auto_progress_turns: bool,
    pub allow_user_feedback_pause: bool,
    pub confirm_before_complete: bool,
    pub continuation_prompt_enabled: bool,
    pub continuation_prompt_text: String,
    pub command_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub output_limit_bytes: usize,
    pub dry_run: bool,
    pub shell_denylist: Vec<String>,
    pub shell_allowlist: Vec<String>,
    /// Whether shell adapters enforce their own confirmation patterns.
    pub shell_confirmation: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::defaults_for(Platform::current())
    }
}

impl AppConfig {
    pub fn defaults_for(platform: Platform) -> Self {
        Self {
            api_key: None,
            api_url: DEFAULT_API_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            reasoning_effort: default_reasoning_effort(DEFAULT_MODEL),
            log_dir: PathBuf::from("logs"),
            system_prompt: None,
            safety_mode: SafetyMode::Strict,
            shell: platform.default_shell(),
            max_steps: 20,
            max_context_chars: 24_000,
            max_output_chars: 4_000,
            cwd: None,
            auto_progress_turns: true,
            allow_user_feedback_pause: false,
            confirm_before_complete: false,
            continuation_prompt_enabled: true,
            continuation_prompt_text: DEFAULT_CONTINUATION_TEXT.to_string(),
            command_timeout_secs: 120,
            request_timeout_secs: 60,
            output_limit_bytes: 100_000,
            dry_run: false,
            shell_denylist: Vec::new(),
            shell_allowlist: Vec::new(),
            shell_confirmation: true,
        }
    }

    /// Resolve settings from a parsed config tree and an environment lookup.
    pub fn resolve<F>(file: &Value, env: F, platform: Platform) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let file = FileConfig::from_value(file);
        let env = EnvLayer { lookup: &env };
        let mut cfg = Self::defaults_for(platform);

        cfg.model = env.string("model").or(file.default_model).unwrap_or(cfg.model);
        cfg.reasoning_effort = env
            .string("reasoning_effort")
            .or_else(|| {
                file.models
                    .get(&cfg.model)
                    .and_then(|section| section.reasoning_effort.clone())
            })
            .or_else(|| default_reasoning_effort(&cfg.model));
        cfg.api_key = env
            .string("openai_api_key")
            .or_else(|| env.string("api_key"))
            .or(file.openai.api_key)
            .or(file.api_key);
        cfg.api_url = env
            .string("api_url")
            .or(file.openai.api_url)
            .unwrap_or(cfg.api_url);
        cfg.log_dir = env
            .string("log_dir")
            .or(file.log_dir)
            .map(PathBuf::from)
            .unwrap_or(cfg.log_dir);
        cfg.system_prompt = env.string("system_prompt").or(file.system_prompt);
        cfg.cwd = env.string("cwd").or(file.cwd).map(PathBuf::from);

        cfg.safety_mode = match env.string("safety_mode").or(file.safety_mode) {
            Some(mode) => mode
                .parse()
                .map_err(|err: String| anyhow!("invalid safety_mode setting: {err}"))?,
            None if env.flag("allow_unsafe").or(file.allow_unsafe).unwrap_or(false) => {
                SafetyMode::AllowUnsafe
            }
            None if !env.flag("safety_enabled").or(file.safety_enabled).unwrap_or(true) => {
                SafetyMode::Off
            }
            None => SafetyMode::Strict,
        };
        if let Some(shell) = env.string("shell").or(file.shell) {
            cfg.shell = shell
                .parse()
                .map_err(|err: String| anyhow!("invalid shell setting: {err}"))?;
        }

        cfg.max_steps = env.positive("max_steps").or(file.max_steps).unwrap_or(cfg.max_steps);
        cfg.max_context_chars = env
            .positive("max_context_chars")
            .or(file.max_context_chars)
            .unwrap_or(cfg.max_context_chars);
        cfg.max_output_chars = env
            .positive("max_output_chars")
            .or(file.max_output_chars)
            .unwrap_or(cfg.max_output_chars);
        cfg.command_timeout_secs = env
            .positive("command_timeout_secs")
            .or(file.command_timeout_secs)
            .unwrap_or(cfg.command_timeout_secs);
        cfg.request_timeout_secs = env
            .positive("request_timeout_secs")
            .or(file.request_timeout_secs)
            .unwrap_or(cfg.request_timeout_secs);
        cfg.output_limit_bytes = env
            .positive("output_limit_bytes")
            .or(file.output_limit_bytes)
            .unwrap_or(cfg.output_limit_bytes);

        cfg.auto_progress_turns = env
            .flag("auto_progress_turns")
            .or(file.auto_progress_turns)
            .unwrap_or(cfg.auto_progress_turns);
        cfg.allow_user_feedback_pause = env
            .flag("allow_user_feedback_pause")
            .or(file.allow_user_feedback_pause)
            .unwrap_or(cfg.allow_user_feedback_pause);
        cfg.confirm_before_complete = env
            .flag("confirm_before_complete")
            .or(file.confirm_before_complete)
            .unwrap_or(cfg.confirm_before_complete);
        cfg.continuation_prompt_enabled = env
            .flag("continuation_prompt_enabled")
            .or_else(|| env.flag("completion_prompt_enabled"))
            .or(file.continuation_prompt_enabled)
            .or(file.completion_prompt_enabled)
            .unwrap_or(cfg.continuation_prompt_enabled);
        cfg.continuation_prompt_text = env
            .string("continuation_prompt_text")
            .or_else(|| env.string("completion_prompt_text"))
            .or(file.continuation_prompt_text)
            .or(file.completion_prompt_text)
            .unwrap_or(cfg.continuation_prompt_text);
        cfg.dry_run = env.flag("dry_run").or(file.dry_run).unwrap_or(cfg.dry_run);
        cfg.shell_confirmation = env
            .flag("shell_confirmation")
            .or(file.shell_confirmation)
            .unwrap_or(cfg.shell_confirmation);

        cfg.shell_denylist = env
            .list("shell_denylist")
            .or(file.shell_denylist)
            .unwrap_or_default();
        cfg.shell_allowlist = env
            .list("shell_allowlist")
            .or(file.shell_allowlist)
            .unwrap_or_default();

        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(anyhow!("model must be non-empty"));
        }
        if self.max_steps == 0 {
            return Err(anyhow!("max_steps must be > 0"));
        }
        if self.max_context_chars < 2 {
            return Err(anyhow!("max_context_chars must be >= 2"));
        }
        if self.max_output_chars == 0 {
            return Err(anyhow!("max_output_chars must be > 0"));
        }
        if self.command_timeout_secs == 0 {
            return Err(anyhow!("command_timeout_secs must be > 0"));
        }
        if self.request_timeout_secs == 0 {
            return Err(anyhow!("request_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        compile_patterns(self.shell_denylist.iter().map(String::as_str), "shell_denylist")?;
        compile_patterns(self.shell_allowlist.iter().map(String::as_str), "shell_allowlist")?;
        Ok(())
    }

    /// Build the orchestrator's view of the configuration.
    ///
    /// Working directory precedence: `cwd_override` > configured `cwd` > `process_cwd`.
    /// Relative paths are resolved against `process_cwd`.
    pub fn run_config(
        &self,
        cwd_override: Option<&Path>,
        process_cwd: &Path,
    ) -> Result<RunConfig, RunError> {
        let requested = cwd_override.or(self.cwd.as_deref()).unwrap_or(process_cwd);
        let cwd = resolve_working_directory(&process_cwd.join(requested))?;
        Ok(RunConfig {
            safety_mode: self.safety_mode,
            shell_kind: self.shell,
            max_steps: self.max_steps,
            max_context_chars: self.max_context_chars,
            max_output_chars: self.max_output_chars,
            cwd,
            auto_progress_turns: self.auto_progress_turns,
            allow_user_feedback_pause: self.allow_user_feedback_pause,
            confirm_before_complete: self.confirm_before_complete,
            continuation_prompt_enabled: self.continuation_prompt_enabled,
            continuation_prompt_text: self.continuation_prompt_text.clone(),
        })
    }

    pub fn shell_options(&self) -> ShellOptions {
        ShellOptions {
            executable: None,
            timeout: Duration::from_secs(self.command_timeout_secs),
            output_limit_bytes: self.output_limit_bytes,
            dry_run: self.dry_run,
            confirmation_mode: self.shell_confirmation,
            denylist: self.shell_denylist.clone(),
            allowlist: self.shell_allowlist.clone(),
        }
    }
}

/// Canonicalize `path`, requiring an existing directory.
pub fn resolve_working_directory(path: &Path) -> Result<PathBuf, RunError> {
    match fs::canonicalize(path) {
        Ok(resolved) if resolved.is_dir() => Ok(resolved),
        _ => Err(RunError::ConfigurationInvalid(format!(
            "Invalid configured cwd directory: {}",
            path.display()
        ))),
    }
}

/// Reasoning effort for model families that support it.
pub fn default_reasoning_effort(model: &str) -> Option<String> {
    let normalized = model.trim().to_ascii_lowercase();
    if normalized.starts_with("gpt-5") || normalized.starts_with('o') {
        Some("medium".to_string())
    } else {
        None
    }
}

/// Load and resolve configuration for the process.
pub fn load_config(base_dir: &Path) -> Result<AppConfig> {
    let explicit = std::env::var(CONFIG_FILE_ENV).ok().filter(|v| !v.trim().is_empty());
    let file = load_file_config(base_dir, explicit.as_deref().map(Path::new));
    let cfg = AppConfig::resolve(&file, |key| std::env::var(key).ok(), Platform::current())?;
    cfg.validate()?;
    debug!(
        model = %cfg.model,
        shell = %cfg.shell,
        safety_mode = %cfg.safety_mode,
        max_steps = cfg.max_steps,
        "configuration resolved"
    );
    Ok(cfg)
}

/// Read the explicit config file, or the shared file merged with its local override.
pub fn load_file_config(base_dir: &Path, explicit: Option<&Path>) -> Value {
    if let Some(path) = explicit {
        return read_config_file(&base_dir.join(path));
    }
    let shared = read_config_file(&base_dir.join(SHARED_CONFIG_FILE));
    let local = read_config_file(&base_dir.join(LOCAL_CONFIG_FILE));
    merge_values(shared, local)
}

/// Parse one JSON or TOML config file. Missing or malformed files yield `{}`.
pub fn read_config_file(path: &Path) -> Value {
    let empty = Value::Object(Map::new());
    if !path.is_file() {
        return empty;
    }
    match parse_config_file(path) {
        Ok(value @ Value::Object(_)) => value,
        Ok(_) => {
            warn!(path = %path.display(), "config file is not an object, ignoring");
            empty
        }
        Err(err) => {
            warn!(path = %path.display(), err = %format!("{err:#}"), "failed to parse config file, ignoring");
            empty
        }
    }
}

fn parse_config_file(path: &Path) -> Result<Value> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    if path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("toml")) {
        let table: toml::Table =
            toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
        serde_json::to_value(table).with_context(|| format!("convert {}", path.display()))
    } else {
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
    }
}

/// Recursively merge `overlay` into `base`; nested objects merge, everything else replaces.
pub fn merge_values(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                let merged = match base.remove(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => value,
                };
                base.insert(key, merged);
            }
            Value::Object(base)
        }
        (_, overlay) => overlay,
    }
}

pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_key(key: &str) -> String {
    format!("TERMPILOT_{}", key.to_ascii_uppercase())
}

/// Positive integer that fits in `T`.
fn to_positive<T: TryFrom<u64>>(value: u64) -> Option<T> {
    if value == 0 {
        return None;
    }
    T::try_from(value).ok()
}

fn parse_positive<T: TryFrom<u64>>(raw: &str) -> Option<T> {
    raw.trim().parse::<u64>().ok().and_then(to_positive)
}

/// File layer of the configuration. Every key is optional so unset keys fall
/// through to the defaults; malformed values are dropped with a warning.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    #[serde(deserialize_with = "lenient_string")]
    api_key: Option<String>,
    openai: OpenAiSection,
    models: HashMap<String, ModelSection>,
    #[serde(deserialize_with = "lenient_string")]
    default_model: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    log_dir: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    system_prompt: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    safety_mode: Option<String>,
    #[serde(deserialize_with = "lenient_flag")]
    allow_unsafe: Option<bool>,
    #[serde(deserialize_with = "lenient_flag")]
    safety_enabled: Option<bool>,
    #[serde(deserialize_with = "lenient_string")]
    shell: Option<String>,
    #[serde(deserialize_with = "lenient_positive")]
    max_steps: Option<u32>,
    #[serde(deserialize_with = "lenient_positive")]
    max_context_chars: Option<usize>,
    #[serde(deserialize_with = "lenient_positive")]
    max_output_chars: Option<usize>,
    #[serde(deserialize_with = "lenient_string")]
    cwd: Option<String>,
    #[serde(deserialize_with = "lenient_flag")]
    auto_progress_turns: Option<bool>,
    #[serde(deserialize_with = "lenient_flag")]
    allow_user_feedback_pause: Option<bool>,
    #[serde(deserialize_with = "lenient_flag")]
    confirm_before_complete: Option<bool>,
    #[serde(deserialize_with = "lenient_flag")]
    continuation_prompt_enabled: Option<bool>,
    #[serde(deserialize_with = "lenient_flag")]
    completion_prompt_enabled: Option<bool>,
    #[serde(deserialize_with = "lenient_string")]
    continuation_prompt_text: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    completion_prompt_text: Option<String>,
    #[serde(deserialize_with = "lenient_positive")]
    command_timeout_secs: Option<u64>,
    #[serde(deserialize_with = "lenient_positive")]
    request_timeout_secs: Option<u64>,
    #[serde(deserialize_with = "lenient_positive")]
    output_limit_bytes: Option<usize>,
    #[serde(deserialize_with = "lenient_flag")]
    dry_run: Option<bool>,
    #[serde(deserialize_with = "lenient_list")]
    shell_denylist: Option<Vec<String>>,
    #[serde(deserialize_with = "lenient_list")]
    shell_allowlist: Option<Vec<String>>,
    #[serde(deserialize_with = "lenient_flag")]
    shell_confirmation: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct OpenAiSection {
    #[serde(deserialize_with = "lenient_string")]
    api_key: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    api_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ModelSection {
    #[serde(deserialize_with = "lenient_string")]
    reasoning_effort: Option<String>,
}

impl FileConfig {
    fn from_value(value: &Value) -> Self {
        match Self::deserialize(value) {
            Ok(cfg) => cfg,
            Err(err) => {
                warn!(err = %err, "config file has an unexpected shape, ignoring it");
                Self::default()
            }
        }
    }
}

fn lenient_string<'de, D: Deserializer<'de>>(de: D) -> Result<Option<String>, D::Error> {
    Ok(match Value::deserialize(de)? {
        Value::String(raw) => Some(raw.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Null => None,
        other => {
            warn!(value = %other, "ignoring non-string config value");
            None
        }
    })
}

fn lenient_flag<'de, D: Deserializer<'de>>(de: D) -> Result<Option<bool>, D::Error> {
    let value = Value::deserialize(de)?;
    let parsed = match &value {
        Value::Bool(flag) => Some(*flag),
        Value::String(raw) => parse_bool(raw),
        Value::Null => return Ok(None),
        _ => None,
    };
    if parsed.is_none() {
        warn!(value = %value, "ignoring invalid boolean");
    }
    Ok(parsed)
}

fn lenient_positive<'de, D, T>(de: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<u64>,
{
    let value = Value::deserialize(de)?;
    let parsed = match &value {
        Value::Number(n) => n.as_u64().and_then(to_positive),
        Value::String(raw) => parse_positive(raw),
        Value::Null => return Ok(None),
        _ => None,
    };
    if parsed.is_none() {
        warn!(value = %value, "ignoring invalid positive integer");
    }
    Ok(parsed)
}

fn lenient_list<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Vec<String>>, D::Error> {
    Ok(match Value::deserialize(de)? {
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
        ),
        Value::String(single) => Some(vec![single]),
        Value::Null => None,
        other => {
            warn!(value = %other, "ignoring invalid pattern list");
            None
        }
    })
}

/// `TERMPILOT_<KEY>` lookups. Invalid values are skipped with a warning.
struct EnvLayer<'a, F> {
    lookup: &'a F,
}

impl<F> EnvLayer<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(&env_key(key))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn flag(&self, key: &str) -> Option<bool> {
        let raw = self.string(key)?;
        let parsed = parse_bool(&raw);
        if parsed.is_none() {
            warn!(key = %env_key(key), value = %raw, "ignoring invalid boolean");
        }
        parsed
    }

    fn positive<T: TryFrom<u64>>(&self, key: &str) -> Option<T> {
        let raw = self.string(key)?;
        let parsed = parse_positive(&raw);
        if parsed.is_none() {
            warn!(key = %env_key(key), value = %raw, "ignoring invalid positive integer");
        }
        parsed
    }

    /// A JSON array of strings or a single pattern.
    fn list(&self, key: &str) -> Option<Vec<String>> {
        let raw = self.string(key)?;
        if !raw.starts_with('[') {
            return Some(vec![raw]);
        }
        match serde_json::from_str::<Vec<String>>(&raw) {
            Ok(values) => Some(values),
            Err(err) => {
                warn!(key = %env_key(key), err = %err, "ignoring invalid list");
                None
            }
        }
    }
}
