//! Python runner. One interpreter is bootstrapped lazily and parked between
//! runs; the driver gives every run a fresh namespace and soft-resets the
//! interpreter afterwards.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::{
    config::PythonConfig,
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

const DRIVER: &str = include_str!("drivers/python_driver.py");
const MEMORY_LIMIT_ENV: &str = "LESSON_RUNNER_MEMORY_LIMIT_BYTES";

type Slot = Arc<Mutex<Option<WorkerProcess>>>;

#[derive(Debug)]
pub struct PythonRunner {
    command: WorkerCommand,
    parked: Slot,
}

impl PythonRunner {
    pub fn new(config: &PythonConfig, startup_timeout: Duration) -> Self {
        let env = config
            .memory_limit_mb
            .map(|mb| (MEMORY_LIMIT_ENV.to_string(), (mb * 1024 * 1024).to_string()))
            .into_iter()
            .collect();

        Self {
            command: WorkerCommand {
                label: "python",
                program: config.python_path.clone(),
                args: vec![
                    "-I".to_string(),
                    "-u".to_string(),
                    "-c".to_string(),
                    DRIVER.to_string(),
                ],
                env,
                startup_timeout,
            },
            parked: Arc::new(Mutex::new(None)),
        }
    }

    fn take_parked(&self) -> Option<WorkerProcess> {
        let mut slot = self.parked.lock().ok()?;
        let mut worker = slot.take()?;
        if worker.is_alive() {
            Some(worker)
        } else {
            tracing::warn!("Parked interpreter died between runs, bootstrapping a new one");
            None
        }
    }
}

#[async_trait::async_trait]
impl Runner for PythonRunner {
    fn language(&self) -> Language {
        Language::Python
    }

    /// Syntax is checked by the interpreter itself and reported as a fault.
    fn prepare(&self, source: &str) -> Result<String, CompileError> {
        Ok(source.to_string())
    }

    fn is_warm(&self) -> bool {
        self.parked.lock().map(|slot| slot.is_some()).unwrap_or(false)
    }

    async fn provision(&self) -> Result<Box<dyn Realm>, ProvisionError> {
        let worker = match self.take_parked() {
            Some(worker) => worker,
            None => WorkerProcess::spawn(&self.command).await?,
        };

        Ok(Box::new(PythonRealm {
            worker: Some(worker),
            slot: self.parked.clone(),
        }))
    }
}

#[derive(Debug)]
struct PythonRealm {
    worker: Option<WorkerProcess>,
    slot: Slot,
}

#[async_trait::async_trait]
impl Realm for PythonRealm {
    async fn execute(&mut self, job: &Job, transcript: &mut Transcript) -> Result<(), RealmFault> {
        let Some(worker) = self.worker.as_mut() else {
            return Err(RealmFault::Exited {
                detail: "interpreter already released".to_string(),
            });
        };
        drive(worker, job, transcript).await
    }

    async fn recycle(&mut self) {
        let Some(mut worker) = self.worker.take() else {
            return;
        };
        if worker.is_tainted() {
            tracing::warn!("Learner threads outlived the run, discarding interpreter");
            worker.kill().await;
            return;
        }
        match self.slot.lock() {
            Ok(mut slot) => *slot = Some(worker),
            Err(_) => tracing::error!("Interpreter slot poisoned, dropping interpreter"),
        }
    }

    async fn terminate(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.kill().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn test_bootstrap_command() {
        let runner = PythonRunner::new(&PythonConfig::default(), Duration::from_secs(5));

        assert_eq!(runner.command.args[..3], ["-I", "-u", "-c"]);
        assert_eq!(
            runner.command.env,
            vec![(MEMORY_LIMIT_ENV.to_string(), "536870912".to_string())]
        );
    }

    #[test]
    fn test_prepare_is_identity() {
        let runner = PythonRunner::new(&PythonConfig::default(), Duration::from_secs(5));

        assert_eq!(runner.prepare("def f(:\n").unwrap(), "def f(:\n");
    }

    #[tokio::test]
    async fn test_cold_until_first_run() {
        let runner = PythonRunner::new(
            &PythonConfig {
                python_path: PathBuf::from("/nonexistent/python3"),
                memory_limit_mb: None,
            },
            Duration::from_secs(1),
        );

        assert!(!runner.is_warm());
        let err = runner.provision().await.err().unwrap();

        assert!(matches!(err, ProvisionError::Launch { .. }));
        assert!(!runner.is_warm());
        assert!(runner.command.env.is_empty());
    }
}
