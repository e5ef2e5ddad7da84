// Run configuration: defaults < config file < CLI flags. The resulting
// `RunConfig` is handed to each component at construction.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::analyzer::client::Provider;
use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputChannel {
    Stdin,
    Args,
}

/// What happens to the first Result when a non-PASS case is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplacePolicy {
    /// Each retry replaces the previous Result.
    Latest,
    /// The first Result is kept; retries only add to the attempt count.
    First,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlakyPolicy {
    Exclude,
    Sample,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgramConfig {
    pub command: String,
    pub input_channel: InputChannel,
    pub env: BTreeMap<String, String>,
    pub clear_env: bool,
    pub workdir: Option<PathBuf>,
    pub timeout_secs: f64,
}

impl Default for ProgramConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            input_channel: InputChannel::Stdin,
            env: BTreeMap::new(),
            clear_env: false,
            workdir: None,
            timeout_secs: 10.0,
        }
    }
}

impl ProgramConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub workers: usize,
    pub run_timeout_secs: Option<f64>,
    pub retry_attempts: u32,
    pub retry_policy: ReplacePolicy,
    pub max_output_bytes: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            run_timeout_secs: None,
            retry_attempts: 0,
            retry_policy: ReplacePolicy::Latest,
            max_output_bytes: 1 << 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    pub dedup: bool,
    pub max_cases: Option<usize>,
    pub flaky_threshold: f64,
    pub flaky_window: usize,
    pub flaky_min_runs: usize,
    pub flaky_policy: FlakyPolicy,
    pub flaky_samples: u32,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            dedup: true,
            max_cases: None,
            flaky_threshold: 0.3,
            flaky_window: 10,
            flaky_min_runs: 3,
            flaky_policy: FlakyPolicy::Exclude,
            flaky_samples: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub enabled: bool,
    pub provider: Provider,
    pub model: String,
    pub base_url: Option<String>,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub system_prompt: Option<String>,
    pub timeout_secs: f64,
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub workers: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            provider: Provider::OpenAI,
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_key: None,
            system_prompt: None,
            timeout_secs: 60.0,
            max_attempts: 3,
            backoff_ms: 500,
            workers: 2,
        }
    }
}

impl AnalyzerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    /// Fills credentials and overrides from the environment.
    pub fn apply_env(&mut self) {
        let key_var = match self.provider {
            Provider::OpenAI => "OPENAI_API_KEY",
            Provider::Anthropic => "ANTHROPIC_API_KEY",
        };
        if let Ok(key) = env::var(key_var) {
            if !key.trim().is_empty() {
                self.api_key = Some(key);
            }
        }
        if self.provider == Provider::OpenAI {
            if let Ok(url) = env::var("OPENAI_BASE_URL") {
                if !url.trim().is_empty() {
                    self.base_url = Some(url);
                }
            }
        }
        if let Ok(model) = env::var("AGENT_MODEL") {
            if !model.trim().is_empty() {
                self.model = model;
            }
        }
        if let Ok(prompt) = env::var("AGENT_SYS_PROMPT") {
            if !prompt.trim().is_empty() {
                self.system_prompt = Some(prompt);
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub suite_name: String,
    pub junit: Option<PathBuf>,
    pub json: Option<PathBuf>,
    pub history: Option<PathBuf>,
    pub record_history: bool,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            suite_name: "agent-tests".to_string(),
            junit: None,
            json: None,
            history: None,
            record_history: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub program: ProgramConfig,
    pub execution: ExecutionConfig,
    pub selection: SelectionConfig,
    pub analyzer: AnalyzerConfig,
    pub report: ReportConfig,
}

impl RunConfig {
    /// Loads the config file. An explicit path must exist; without one the
    /// per-user file is used when present, else defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match explicit {
            Some(p) => p.to_path_buf(),
            None => {
                let p = config_path();
                if !p.exists() {
                    return Ok(Self::default());
                }
                p
            }
        };

        let raw = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        Self::from_toml(&raw).map_err(|e| match e {
            ConfigError::Parse { detail, .. } => ConfigError::Parse { path, detail },
            other => other,
        })
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|e| ConfigError::Parse {
            path: PathBuf::from("<config>"),
            detail: e.to_string(),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: String| Err(ConfigError::Invalid(msg));

        if self.program.command.trim().is_empty() {
            return fail("program command is empty (use --cmd or [program].command)".into());
        }
        if !is_valid_timeout(self.program.timeout_secs) {
            return fail(format!(
                "program timeout must be positive, got {}",
                self.program.timeout_secs
            ));
        }
        if self.execution.workers == 0 {
            return fail("execution.workers must be at least 1".into());
        }
        if let Some(t) = self.execution.run_timeout_secs {
            if !is_valid_timeout(t) {
                return fail(format!("execution.run_timeout_secs must be positive, got {t}"));
            }
        }
        if !(0.0..=1.0).contains(&self.selection.flaky_threshold) {
            return fail(format!(
                "selection.flaky_threshold must be within 0..=1, got {}",
                self.selection.flaky_threshold
            ));
        }
        if self.selection.flaky_window == 0 {
            return fail("selection.flaky_window must be at least 1".into());
        }
        if self.selection.flaky_policy == FlakyPolicy::Sample && self.selection.flaky_samples == 0 {
            return fail("selection.flaky_samples must be at least 1".into());
        }
        if self.analyzer.enabled {
            if self.analyzer.max_attempts == 0 {
                return fail("analyzer.max_attempts must be at least 1".into());
            }
            if self.analyzer.workers == 0 {
                return fail("analyzer.workers must be at least 1".into());
            }
            if !is_valid_timeout(self.analyzer.timeout_secs) {
                return fail("analyzer.timeout_secs must be positive".into());
            }
        }
        Ok(())
    }
}

/// A usable timeout: positive, representable as a `Duration`, and not so
/// large that a deadline computed from now would overflow.
pub fn is_valid_timeout(secs: f64) -> bool {
    secs > 0.0
        && Duration::try_from_secs_f64(secs)
            .ok()
            .and_then(|d| Instant::now().checked_add(d))
            .is_some()
}

pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("agentest/config.toml")
}
