use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILENAME: &str = "backlog-gfm.toml";
pub const DEFAULT_USER_AGENT: &str = concat!("backlog-gfm/", env!("CARGO_PKG_VERSION"));

/// On-disk settings. Every key is optional; flags and env win over the file.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct FileConfig {
    #[serde(default)]
    pub backlog: BacklogSection,
    #[serde(default)]
    pub http: HttpSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct BacklogSection {
    pub space: Option<String>,
    pub project: Option<String>,
    pub dry_run: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct HttpSection {
    pub timeout_ms: Option<u64>,
    pub page_size: Option<usize>,
    pub read_interval_ms: Option<u64>,
    pub write_interval_ms: Option<u64>,
    pub user_agent: Option<String>,
}

/// Environment lookup used while resolving settings. [`process_env`] reads
/// the real process environment.
pub type EnvLookup = dyn Fn(&str) -> Option<String>;

pub fn process_env(key: &str) -> Option<String> {
    env::var(key).ok()
}

impl FileConfig {
    /// Resolve the Backlog space host: env BACKLOG_SPACE > config > None.
    pub fn space(&self, env: &EnvLookup) -> Option<String> {
        env_override(env, "BACKLOG_SPACE").or_else(|| self.backlog.space.clone())
    }

    /// Resolve the project code: env BACKLOG_PROJECT > config > None.
    pub fn project(&self, env: &EnvLookup) -> Option<String> {
        env_override(env, "BACKLOG_PROJECT").or_else(|| self.backlog.project.clone())
    }

    /// Resolve the API key. Only read from the environment so it never lands in a file.
    pub fn api_key(&self, env: &EnvLookup) -> Option<String> {
        env_override(env, "BACKLOG_API_KEY")
    }

    /// Resolve dry-run: env BACKLOG_DRY_RUN > config > None (caller prompts).
    pub fn dry_run(&self, env: &EnvLookup) -> Result<Option<bool>> {
        if let Some(value) = env_override(env, "BACKLOG_DRY_RUN") {
            return parse_dry_run_answer(&value)
                .map(Some)
                .context("invalid BACKLOG_DRY_RUN");
        }
        Ok(self.backlog.dry_run)
    }

    /// Resolve the post-write pause: env BACKLOG_WRITE_INTERVAL_MS > config > None.
    pub fn write_interval(&self, env: &EnvLookup) -> Option<Duration> {
        env_value_u64(env, "BACKLOG_WRITE_INTERVAL_MS")
            .or(self.http.write_interval_ms)
            .map(Duration::from_millis)
    }

    /// Resolve user agent: env BACKLOG_USER_AGENT > config > DEFAULT_USER_AGENT.
    pub fn user_agent(&self, env: &EnvLookup) -> String {
        env_override(env, "BACKLOG_USER_AGENT")
            .or_else(|| self.http.user_agent.clone())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }
}

/// Load and parse a FileConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<FileConfig> {
    if !config_path.exists() {
        return Ok(FileConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: FileConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

/// Fully resolved run settings. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationConfig {
    pub host: String,
    pub api_key: String,
    pub project_code: String,
    pub dry_run: bool,
}

impl MigrationConfig {
    pub fn new(host: &str, api_key: &str, project_code: &str, dry_run: bool) -> Result<Self> {
        Ok(Self {
            host: validate_space_host(host)?,
            api_key: validate_api_key(api_key)?,
            project_code: normalize_project_code(project_code)?,
            dry_run,
        })
    }

    pub fn base_url(&self) -> String {
        format!("https://{}", self.host)
    }
}

/// Accepts a bare hostname such as `yourspace.backlog.com`.
pub fn validate_space_host(input: &str) -> Result<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        bail!("Backlog space is required");
    }
    let valid_chars = trimmed
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '.' || ch == '-');
    let tld_ok = trimmed
        .rsplit_once('.')
        .map(|(head, tld)| {
            !head.is_empty() && tld.len() >= 2 && tld.chars().all(|ch| ch.is_ascii_alphabetic())
        })
        .unwrap_or(false);
    if !valid_chars || !tld_ok {
        bail!("invalid Backlog space `{trimmed}` (expected e.g. yourspace.backlog.com)");
    }
    Ok(trimmed.to_string())
}

pub fn validate_api_key(input: &str) -> Result<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        bail!("API key is required");
    }
    Ok(trimmed.to_string())
}

/// Upper-cases a project key and restricts it to Backlog's `[A-Z0-9_]` charset,
/// since it is spliced into `projects/{key}`.
pub fn normalize_project_code(input: &str) -> Result<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        bail!("project code is required");
    }
    let code = trimmed.to_ascii_uppercase();
    if !code
        .chars()
        .all(|ch| ch.is_ascii_uppercase() || ch.is_ascii_digit() || ch == '_')
    {
        bail!("invalid project code `{trimmed}` (letters, digits and `_` only)");
    }
    Ok(code)
}

/// Interprets the dry-run prompt answer. An empty answer means dry-run.
pub fn parse_dry_run_answer(input: &str) -> Result<bool> {
    match input.trim().to_lowercase().as_str() {
        "" | "y" | "yes" | "t" | "true" => Ok(true),
        "n" | "no" | "f" | "false" => Ok(false),
        other => bail!(
            "unrecognized answer `{other}`: use y/yes/t/true for dry-run or n/no/f/false to execute"
        ),
    }
}

pub(crate) fn env_override(env: &EnvLookup, key: &str) -> Option<String> {
    let value = env(key)?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub(crate) fn env_value_u64(env: &EnvLookup, key: &str) -> Option<u64> {
    env_override(env, key).and_then(|value| value.parse::<u64>().ok())
}

pub(crate) fn env_value_usize(env: &EnvLookup, key: &str) -> Option<usize> {
    env_override(env, key).and_then(|value| value.parse::<usize>().ok())
}
