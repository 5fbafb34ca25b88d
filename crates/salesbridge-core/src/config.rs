//! Configuration loading and validation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Top-level salesbridge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabaseConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<RunConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

/// Which flavour of the Assistants API to talk to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStyle {
    #[default]
    Azure,
    #[serde(rename = "openai")]
    OpenAi,
}

/// Remote assistant service configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub style: ServiceStyle,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,

    /// Model deployment the assistant runs on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub assistant_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub assistant_name: Option<String>,
}

impl ServiceConfig {
    /// Resolve the API key: check `api_key` first, then `api_key_env`,
    /// then the conventional `AZURE_OPENAI_KEY` / `OPENAI_API_KEY`.
    pub fn resolve_api_key(&self) -> Option<String> {
        let fallback_env = match self.style {
            ServiceStyle::Azure => "AZURE_OPENAI_KEY",
            ServiceStyle::OpenAi => "OPENAI_API_KEY",
        };
        resolve_secret_field(&self.api_key, &self.api_key_env)
            .or_else(|| resolve_secret_field(&None, &Some(fallback_env.to_string())))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Per-run orchestration settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel_tool_calls: Option<bool>,

    /// Tool round-trips allowed per user message. 0 disables the ceiling.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_round_trips: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_attempts: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,

    /// Keep generated images/files on the remote service after download.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retain_remote_files: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub strip_markdown_links: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "salesbridge_agent=debug").
    #[serde(default)]
    pub filters: Vec<String>,
}

fn default_log_format() -> String {
    "plain".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
            level: None,
            filters: Vec::new(),
        }
    }
}

/// Resolve a secret from a direct value or an environment variable name.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

fn substitute_env_vars(input: &str) -> String {
    let Ok(re) = regex::Regex::new(r"\$\{([^}]+)\}") else {
        return input.to_string();
    };
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(crate::error::SalesBridgeError::Io)?;
        Self::parse(&raw)
    }

    /// Parse config text, substituting `${ENV_VAR}` references first.
    pub fn parse(raw: &str) -> crate::error::Result<Self> {
        let substituted = substitute_env_vars(raw);
        json5::from_str(&substituted)
            .map_err(|e| crate::error::SalesBridgeError::Config(e.to_string()))
    }

    /// Default config file path.
    pub fn config_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn service(&self) -> ServiceConfig {
        self.service.clone().unwrap_or_default()
    }

    /// Base URL of the remote service, without a trailing slash.
    pub fn endpoint(&self) -> Option<String> {
        self.service
            .as_ref()
            .and_then(|s| s.endpoint.as_ref())
            .map(|e| e.trim_end_matches('/').to_string())
    }

    pub fn api_version(&self) -> String {
        self.service
            .as_ref()
            .and_then(|s| s.api_version.clone())
            .unwrap_or_else(|| "2024-05-01-preview".to_string())
    }

    pub fn assistant_name(&self) -> String {
        self.service
            .as_ref()
            .and_then(|s| s.assistant_name.clone())
            .unwrap_or_else(|| "Sales Analysis Assistant".to_string())
    }

    /// Path of the SQLite sales database, with `~` expanded.
    pub fn database_path(&self) -> PathBuf {
        self.database
            .as_ref()
            .and_then(|d| d.path.as_ref())
            .map(|p| PathBuf::from(shellexpand::tilde(p).as_ref()))
            .unwrap_or_else(|| PathBuf::from("./database/contoso-sales.db"))
    }

    pub fn temperature(&self) -> f64 {
        self.run.as_ref().and_then(|r| r.temperature).unwrap_or(0.4)
    }

    pub fn parallel_tool_calls(&self) -> bool {
        self.run
            .as_ref()
            .and_then(|r| r.parallel_tool_calls)
            .unwrap_or(false)
    }

    /// Round-trip ceiling per user message; `None` when disabled.
    pub fn max_round_trips(&self) -> Option<u32> {
        match self.run.as_ref().and_then(|r| r.max_round_trips) {
            Some(0) => None,
            Some(n) => Some(n),
            None => Some(5),
        }
    }

    pub fn poll_attempts(&self) -> u32 {
        self.run.as_ref().and_then(|r| r.poll_attempts).unwrap_or(10)
    }

    pub fn poll_interval_ms(&self) -> u64 {
        self.run
            .as_ref()
            .and_then(|r| r.poll_interval_ms)
            .unwrap_or(1000)
    }

    pub fn retain_remote_files(&self) -> bool {
        self.run
            .as_ref()
            .and_then(|r| r.retain_remote_files)
            .unwrap_or(true)
    }

    pub fn strip_markdown_links(&self) -> bool {
        self.run
            .as_ref()
            .and_then(|r| r.strip_markdown_links)
            .unwrap_or(false)
    }

    /// Get a config value by dotted path (e.g. "run.temperature").
    pub fn get_path(&self, path: &str) -> Option<serde_json::Value> {
        let json = serde_json::to_value(self).ok()?;
        let mut current = &json;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }

    /// Validate the config. Returns `(warnings, errors)`.
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        let service = self.service();
        if service.resolve_api_key().is_none() {
            warnings.push("Service has no API key configured".to_string());
        }
        if service.style == ServiceStyle::Azure && self.endpoint().is_none() {
            errors.push("service.endpoint is required for the azure style".to_string());
        }
        if service.assistant_id.is_none() {
            errors.push("service.assistant_id is not set".to_string());
        }

        let db = self.database_path();
        if !db.exists() {
            warnings.push(format!("Database file not found: {}", db.display()));
        }

        if let Some(run) = &self.run {
            if run.poll_attempts == Some(0) {
                errors.push("run.poll_attempts cannot be 0".to_string());
            }
        }

        (warnings, errors)
    }
}

/// Base directory for salesbridge data: `~/.salesbridge/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".salesbridge")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        // SAFETY: test-only, single-threaded test runner
        unsafe { std::env::set_var("TEST_SB_KEY", "sk-test-123") };
        let input = r#"{"key": "${TEST_SB_KEY}", "other": "plain"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains("sk-test-123"));
        assert!(result.contains("plain"));
        unsafe { std::env::remove_var("TEST_SB_KEY") };
    }

    #[test]
    fn test_env_var_missing() {
        let input = r#"{"key": "${NONEXISTENT_VAR_SB_TEST}"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains(r#""""#));
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.temperature(), 0.4);
        assert!(!config.parallel_tool_calls());
        assert_eq!(config.max_round_trips(), Some(5));
        assert_eq!(config.poll_attempts(), 10);
        assert!(config.retain_remote_files());
        assert!(!config.strip_markdown_links());
        assert_eq!(
            config.database_path(),
            PathBuf::from("./database/contoso-sales.db")
        );
    }

    #[test]
    fn test_zero_round_trips_disables_ceiling() {
        let config = Config::parse(r#"{ run: { max_round_trips: 0 } }"#).unwrap();
        assert_eq!(config.max_round_trips(), None);
    }

    #[test]
    fn test_parse_json5_service() {
        let config = Config::parse(
            r#"{
                // trailing commas and comments are fine
                service: {
                    style: "openai",
                    endpoint: "https://example.openai.azure.com/",
                    assistant_id: "asst_123",
                },
            }"#,
        )
        .unwrap();
        let service = config.service();
        assert_eq!(service.style, ServiceStyle::OpenAi);
        assert_eq!(service.assistant_id.as_deref(), Some("asst_123"));
        assert_eq!(
            config.endpoint().as_deref(),
            Some("https://example.openai.azure.com")
        );
    }

    #[test]
    fn test_service_resolve_api_key() {
        // SAFETY: test-only, single-threaded test runner
        unsafe { std::env::set_var("TEST_SB_API_KEY", "from-env") };
        let service = ServiceConfig {
            api_key_env: Some("TEST_SB_API_KEY".into()),
            ..ServiceConfig::default()
        };
        assert_eq!(service.resolve_api_key(), Some("from-env".into()));

        let service2 = ServiceConfig {
            api_key: Some("direct-key".into()),
            api_key_env: Some("TEST_SB_API_KEY".into()),
            ..ServiceConfig::default()
        };
        assert_eq!(service2.resolve_api_key(), Some("direct-key".into()));
        unsafe { std::env::remove_var("TEST_SB_API_KEY") };
    }

    #[test]
    fn test_logging_config_defaults() {
        let config: Config = json5::from_str(r#"{ "logging": {} }"#).unwrap();
        let logging = config.logging.expect("logging should be present");
        assert_eq!(logging.format, "plain");
        assert!(logging.level.is_none());
        assert!(logging.filters.is_empty());
    }

    #[test]
    fn test_get_path() {
        let config = Config::parse(r#"{ run: { temperature: 0.7 } }"#).unwrap();
        assert_eq!(
            config.get_path("run.temperature"),
            Some(serde_json::json!(0.7))
        );
        assert!(config.get_path("run.missing").is_none());
    }

    #[test]
    fn test_validate_missing_assistant_errors() {
        let config = Config::default();
        let (_warnings, errors) = config.validate();
        assert!(errors.iter().any(|e| e.contains("assistant_id")));
        assert!(errors.iter().any(|e| e.contains("endpoint")));
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("nope.json")).unwrap();
        assert!(config.service.is_none());
    }
}
