use crate::core::{
    domain::{Language, SourceLocation},
    traits::realm::Realm,
};

/// A static error found while preparing source, before any realm exists.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct CompileError {
    pub message: String,
    pub location: Option<SourceLocation>,
}

impl CompileError {
    pub fn at(message: &str, line: u32, column: u32) -> Self {
        Self {
            message: message.to_string(),
            location: Some(SourceLocation {
                line,
                column: Some(column),
            }),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProvisionError {
    #[error("no runner is registered for {0}")]
    Unsupported(Language),
    #[error("failed to launch {program}: {msg}")]
    Launch { program: String, msg: String },
    #[error("worker did not become ready within {0} ms")]
    StartupTimeout(u64),
    #[error("worker failed during bootstrap: {msg}")]
    Bootstrap { msg: String },
}

/// Language-specific half of the engine: turns source into an executable form
/// and hands out realms to execute it in.
#[mockall::automock]
#[async_trait::async_trait]
pub trait Runner: std::fmt::Debug + Send + Sync {
    fn language(&self) -> Language;

    /// Cheap, in-process preparation. Used for learner code and for every
    /// assertion snippet.
    fn prepare(&self, source: &str) -> Result<String, CompileError>;

    /// Whether `provision` can skip the interpreter bootstrap.
    fn is_warm(&self) -> bool;

    async fn provision(&self) -> Result<Box<dyn Realm>, ProvisionError>;
}
