use std::path::PathBuf;

use itertools::Itertools;
use serde::Deserialize;

pub const CONFIG_ENV: &str = "LESSON_RUNNER_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {}", join_problems(.0))]
    Invalid(Vec<String>),
}

fn join_problems(problems: &[String]) -> String {
    problems.iter().join("; ")
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub limits: LimitsConfig,
    pub typescript: TypeScriptConfig,
    pub python: PythonConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "[::1]:50051".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LimitsConfig {
    /// Used when a request carries `timeout_ms == 0`.
    pub default_timeout_ms: u64,
    pub max_timeout_ms: u64,
    /// Upper bound for interpreter bootstrap, separate from the run timeout.
    pub startup_timeout_ms: u64,
    pub provision_retries: u32,
    pub max_log_lines: usize,
    /// gRPC sessions unused for this long are dropped with their interpreter.
    pub session_idle_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 5_000,
            max_timeout_ms: 30_000,
            startup_timeout_ms: 15_000,
            provision_retries: 1,
            max_log_lines: 1_000,
            session_idle_ms: 1_800_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TypeScriptConfig {
    pub node_path: PathBuf,
    pub memory_limit_mb: Option<u64>,
}

impl Default for TypeScriptConfig {
    fn default() -> Self {
        Self {
            node_path: PathBuf::from("node"),
            memory_limit_mb: Some(128),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PythonConfig {
    pub python_path: PathBuf,
    pub memory_limit_mb: Option<u64>,
}

impl Default for PythonConfig {
    fn default() -> Self {
        Self {
            python_path: PathBuf::from("python3"),
            memory_limit_mb: Some(512),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads the file named by `LESSON_RUNNER_CONFIG`, or returns defaults when unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::load(&path),
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let limits = &self.limits;
        let mut problems = Vec::new();

        if limits.default_timeout_ms == 0 {
            problems.push("limits.default_timeout_ms must be positive".to_string());
        }
        if limits.max_timeout_ms < limits.default_timeout_ms {
            problems.push(format!(
                "limits.max_timeout_ms ({}) is below limits.default_timeout_ms ({})",
                limits.max_timeout_ms, limits.default_timeout_ms
            ));
        }
        if limits.startup_timeout_ms == 0 {
            problems.push("limits.startup_timeout_ms must be positive".to_string());
        }
        if limits.max_log_lines == 0 {
            problems.push("limits.max_log_lines must be positive".to_string());
        }
        if limits.session_idle_ms == 0 {
            problems.push("limits.session_idle_ms must be positive".to_string());
        }
        for (name, limit) in [
            ("typescript.memory_limit_mb", self.typescript.memory_limit_mb),
            ("python.memory_limit_mb", self.python.memory_limit_mb),
        ] {
            if limit == Some(0) {
                problems.push(format!("{} must be positive when set", name));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }
}
