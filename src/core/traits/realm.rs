use crate::core::harness::{Job, Transcript};

#[derive(Debug, Clone, thiserror::Error)]
pub enum RealmFault {
    #[error("execution context exited unexpectedly{}", detail_suffix(.detail))]
    Exited { detail: String },
    #[error("malformed event from execution context: {0}")]
    Protocol(String),
    #[error("lost contact with execution context: {0}")]
    Io(String),
}

fn detail_suffix(detail: &str) -> String {
    if detail.is_empty() {
        String::new()
    } else {
        format!(": {}", detail)
    }
}

/// An isolated execution context owned by the host for one run.
///
/// `execute` feeds every event into the transcript as soon as it arrives, so
/// whatever was flushed before a forced termination is still there.
#[async_trait::async_trait]
pub trait Realm: Send {
    async fn execute(&mut self, job: &Job, transcript: &mut Transcript) -> Result<(), RealmFault>;

    /// Returns the context to its runner after a clean run.
    async fn recycle(&mut self);

    /// Unconditionally tears the context down.
    async fn terminate(&mut self);
}
