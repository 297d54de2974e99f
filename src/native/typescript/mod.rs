//! TypeScript runner: types are erased in-process, the resulting JavaScript
//! runs in a `vm` context inside a fresh Node.js worker per run.

pub mod lexer;
pub mod strip;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::{
    config::TypeScriptConfig,
    core::{
        domain::Language,
        harness::{Job, Transcript},
        traits::{
            realm::{Realm, RealmFault},
            runner::{CompileError, ProvisionError, Runner},
        },
    },
    native::worker::{WorkerCommand, WorkerProcess, drive},
};

const DRIVER: &str = include_str!("../drivers/node_driver.js");

#[derive(Debug)]
pub struct TypeScriptRunner {
    command: WorkerCommand,
    launched: AtomicBool,
}

impl TypeScriptRunner {
    pub fn new(config: &TypeScriptConfig, startup_timeout: Duration) -> Self {
        let mut args = Vec::new();
        if let Some(limit) = config.memory_limit_mb {
            args.push(format!("--max-old-space-size={}", limit));
        }
        args.push("-e".to_string());
        args.push(DRIVER.to_string());

        Self {
            command: WorkerCommand {
                label: "node",
                program: config.node_path.clone(),
                args,
                env: Vec::new(),
                startup_timeout,
            },
            launched: AtomicBool::new(false),
        }
    }
}

#[async_trait::async_trait]
impl Runner for TypeScriptRunner {
    fn language(&self) -> Language {
        Language::TypeScript
    }

    fn prepare(&self, source: &str) -> Result<String, CompileError> {
        strip::strip_types(source)
    }

    /// Every run gets a new worker, so only the very first launch pays for a
    /// cold Node start (file cache, JIT warm-up of the driver).
    fn is_warm(&self) -> bool {
        self.launched.load(Ordering::SeqCst)
    }

    async fn provision(&self) -> Result<Box<dyn Realm>, ProvisionError> {
        let worker = WorkerProcess::spawn(&self.command).await?;
        self.launched.store(true, Ordering::SeqCst);

        Ok(Box::new(NodeRealm { worker }))
    }
}

/// Owns one Node.js worker for exactly one run.
#[derive(Debug)]
struct NodeRealm {
    worker: WorkerProcess,
}

#[async_trait::async_trait]
impl Realm for NodeRealm {
    async fn execute(&mut self, job: &Job, transcript: &mut Transcript) -> Result<(), RealmFault> {
        drive(&mut self.worker, job, transcript).await
    }

    async fn recycle(&mut self) {
        self.worker.kill().await;
    }

    async fn terminate(&mut self) {
        self.worker.kill().await;
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn runner() -> TypeScriptRunner {
        TypeScriptRunner::new(&TypeScriptConfig::default(), Duration::from_secs(5))
    }

    #[test]
    fn test_prepare_erases_types() {
        let js = runner().prepare("const n: number = 1;").unwrap();

        assert_eq!(js.split_whitespace().collect::<String>(), "constn=1;");
    }

    #[test]
    fn test_prepare_reports_location() {
        let err = runner().prepare("let x: = 1;").unwrap_err();

        assert_eq!(err.message, "Type expected");
        assert_eq!(err.location.map(|l| l.line), Some(1));
    }

    #[test]
    fn test_memory_flag() {
        let runner = runner();

        assert_eq!(runner.command.args[0], "--max-old-space-size=128");
        assert_eq!(runner.command.args[1], "-e");

        let unlimited = TypeScriptRunner::new(
            &TypeScriptConfig {
                node_path: PathBuf::from("/opt/node/bin/node"),
                memory_limit_mb: None,
            },
            Duration::from_secs(1),
        );
        assert_eq!(unlimited.command.args[0], "-e");
        assert_eq!(unlimited.command.program, PathBuf::from("/opt/node/bin/node"));
    }

    #[tokio::test]
    async fn test_failed_launch_stays_cold() {
        let runner = TypeScriptRunner::new(
            &TypeScriptConfig {
                node_path: PathBuf::from("/nonexistent/node"),
                memory_limit_mb: None,
            },
            Duration::from_secs(1),
        );

        assert!(!runner.is_warm());
        let err = runner.provision().await.err().unwrap();

        assert!(matches!(err, ProvisionError::Launch { .. }));
        assert!(!runner.is_warm());
    }
}
