use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    TypeScript,
    Python,
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Language::TypeScript => write!(f, "typescript"),
            Language::Python => write!(f, "python"),
        }
    }
}

/// One submission. Built once by the caller and never mutated by the engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub source_code: String,
    pub language: Language,
    #[serde(default)]
    pub test_cases: Vec<TestSpec>,
    /// Zero selects the configured default.
    #[serde(default)]
    pub timeout_ms: u64,
}

impl ExecutionRequest {
    pub fn new(source_code: &str, language: Language, timeout_ms: u64) -> Self {
        Self {
            source_code: source_code.to_string(),
            language,
            test_cases: Vec::new(),
            timeout_ms,
        }
    }

    pub fn with_tests(self, test_cases: Vec<TestSpec>) -> Self {
        Self { test_cases, ..self }
    }
}

/// An assertion snippet: throws with a message on failure, completes silently on success.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestSpec {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub snippet: String,
    #[serde(default)]
    pub hidden: bool,
}

impl TestSpec {
    pub fn new(id: &str, snippet: &str) -> Self {
        Self {
            id: id.to_string(),
            description: String::new(),
            snippet: snippet.to_string(),
            hidden: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestOutcome {
    pub id: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// False when the learner code faulted before this assertion could run.
    pub ran: bool,
}

impl TestOutcome {
    pub fn passed(id: &str) -> Self {
        Self {
            id: id.to_string(),
            passed: true,
            message: None,
            ran: true,
        }
    }

    pub fn failed(id: &str, message: &str) -> Self {
        Self {
            id: id.to_string(),
            passed: false,
            message: Some(message.to_string()),
            ran: true,
        }
    }

    pub fn not_run(id: &str) -> Self {
        Self {
            id: id.to_string(),
            passed: false,
            message: Some("not run: the submitted code raised an error".to_string()),
            ran: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    CompileError,
    RuntimeError,
    Timeout,
    HostFault,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceLocation {
    pub line: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.column {
            Some(column) => write!(f, "{}:{}", self.line, column),
            None => write!(f, "{}", self.line),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<SourceLocation>,
}

impl ExecutionError {
    pub fn new(kind: ErrorKind, message: &str) -> Self {
        Self {
            kind,
            message: message.to_string(),
            raw: None,
            location: None,
        }
    }

    pub fn with_raw(self, raw: Option<String>) -> Self {
        Self { raw, ..self }
    }

    pub fn with_location(self, location: Option<SourceLocation>) -> Self {
        Self { location, ..self }
    }
}

/// The verdict returned exactly once per `run`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    pub logs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
    pub test_results: Vec<TestOutcome>,
    pub duration_ms: u64,
    pub finished_at: chrono::DateTime<chrono::Utc>,
}

impl ExecutionResult {
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum EngineStatus {
    #[default]
    Idle,
    Provisioning,
    /// The interpreter is being bootstrapped; the slowest part of a cold run.
    WarmingUp,
    Running,
}
