use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::json;

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 2000;
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_CONCURRENCY: usize = 5;
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Model endpoint and client settings for a bench run.
#[derive(Debug, Clone, PartialEq)]
pub struct BenchConfig {
    pub api_key: String,
    /// OpenAI-compatible API root, without the `/chat/completions` suffix.
    pub base_url: String,
    pub model_name: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Per-request timeout.
    pub timeout_secs: u64,
    /// Concurrent model calls.
    pub concurrency: usize,
    /// Total attempts per call for transient failures.
    pub max_retries: u32,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model_name: String::new(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            concurrency: DEFAULT_CONCURRENCY,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// TOML overlay. Every key is optional; present keys replace the env value.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    api_key: Option<String>,
    base_url: Option<String>,
    model_name: Option<String>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    timeout_secs: Option<u64>,
    concurrency: Option<usize>,
    max_retries: Option<u32>,
}

impl BenchConfig {
    /// Load from the process environment (`OPENAI_API_KEY`, `OPENAI_BASE_URL`,
    /// `MODEL_NAME`, `DEFAULT_TEMPERATURE`, `DEFAULT_MAX_TOKENS`,
    /// `DEFAULT_TIMEOUT`, `DEFAULT_CONCURRENCY`, `DEFAULT_RETRY_TIMES`).
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`BenchConfig::from_env`] with a caller-supplied variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            api_key: lookup("OPENAI_API_KEY").unwrap_or_default(),
            base_url: lookup("OPENAI_BASE_URL")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.base_url),
            model_name: lookup("MODEL_NAME").unwrap_or_default(),
            temperature: parse_var(&lookup, "DEFAULT_TEMPERATURE", defaults.temperature)?,
            max_tokens: parse_var(&lookup, "DEFAULT_MAX_TOKENS", defaults.max_tokens)?,
            timeout_secs: parse_var(&lookup, "DEFAULT_TIMEOUT", defaults.timeout_secs)?,
            concurrency: parse_var(&lookup, "DEFAULT_CONCURRENCY", defaults.concurrency)?,
            max_retries: parse_var(&lookup, "DEFAULT_RETRY_TIMES", defaults.max_retries)?,
        })
    }

    /// Overlay the keys present in a TOML file.
    pub fn merge_file(mut self, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let file: ConfigFile = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        if let Some(v) = file.api_key {
            self.api_key = v;
        }
        if let Some(v) = file.base_url {
            self.base_url = v;
        }
        if let Some(v) = file.model_name {
            self.model_name = v;
        }
        if let Some(v) = file.temperature {
            self.temperature = v;
        }
        if let Some(v) = file.max_tokens {
            self.max_tokens = v;
        }
        if let Some(v) = file.timeout_secs {
            self.timeout_secs = v;
        }
        if let Some(v) = file.concurrency {
            self.concurrency = v;
        }
        if let Some(v) = file.max_retries {
            self.max_retries = v;
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.api_key.trim().is_empty() {
            bail!("Missing required configuration: api_key (set OPENAI_API_KEY)");
        }
        if self.model_name.trim().is_empty() {
            bail!("Missing required configuration: model_name (set MODEL_NAME)");
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            bail!("temperature must be within [0, 2], got {}", self.temperature);
        }
        if self.max_tokens == 0 {
            bail!("max_tokens must be positive");
        }
        if self.timeout_secs == 0 {
            bail!("timeout must be positive");
        }
        if self.concurrency == 0 {
            bail!("concurrency must be positive");
        }
        Ok(())
    }

    /// JSON view for run metadata with the api key masked.
    pub fn redacted(&self) -> serde_json::Value {
        json!({
            "api_key": mask_secret(&self.api_key),
            "base_url": self.base_url,
            "model_name": self.model_name,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "timeout_secs": self.timeout_secs,
            "concurrency": self.concurrency,
            "max_retries": self.max_retries,
        })
    }

    pub fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key).filter(|v| !v.trim().is_empty()) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid value for {key} ('{raw}'): {e}")),
    }
}

/// Keep the last four characters of long secrets; hide short ones entirely.
fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len().min(3));
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("***{tail}")
}
