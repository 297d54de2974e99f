//! Execution host: one instance per learner session.
//!
//! ```text
//! Idle -> Provisioning | WarmingUp -> Running -> Idle
//! ```
//!
//! The realm is discarded afterwards, or parked for reuse when the runner
//! keeps a warm interpreter. `run` never fails; every failure mode ends up in
//! the returned `ExecutionResult`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, MutexGuard, watch};
use uuid::Uuid;

use crate::{
    config::{Config, LimitsConfig},
    core::{
        aggregate::{aggregate, not_started},
        domain::{EngineStatus, ErrorKind, ExecutionError, ExecutionRequest, ExecutionResult, Language},
        harness::plan,
        pipeline::{
            compiling::compile_submission,
            running::{RunEnd, execute_with_deadline, provision_with_retry},
        },
        traits::runner::{ProvisionError, Runner},
    },
    native::{python::PythonRunner, typescript::TypeScriptRunner},
};

#[derive(Clone, Debug)]
pub struct HostLimits {
    pub default_timeout: Duration,
    pub max_timeout: Duration,
    pub provision_retries: u32,
    pub max_log_lines: usize,
}

impl Default for HostLimits {
    fn default() -> Self {
        (&LimitsConfig::default()).into()
    }
}

impl From<&LimitsConfig> for HostLimits {
    fn from(limits: &LimitsConfig) -> Self {
        Self {
            default_timeout: Duration::from_millis(limits.default_timeout_ms),
            max_timeout: Duration::from_millis(limits.max_timeout_ms),
            provision_retries: limits.provision_retries,
            max_log_lines: limits.max_log_lines,
        }
    }
}

#[derive(Debug)]
pub struct SandboxHost {
    runners: HashMap<Language, Arc<dyn Runner>>,
    limits: HostLimits,
    status: watch::Sender<EngineStatus>,
    in_flight: Mutex<()>,
    provision_attempts: AtomicU64,
}

/// Puts the host back to `Idle` however the run ends, including when the
/// caller drops the future.
struct StatusGuard<'a>(&'a watch::Sender<EngineStatus>);

impl StatusGuard<'_> {
    fn set(&self, status: EngineStatus) {
        tracing::debug!("Engine status: {:?}", status);
        self.0.send_replace(status);
    }
}

impl Drop for StatusGuard<'_> {
    fn drop(&mut self) {
        self.0.send_replace(EngineStatus::Idle);
    }
}

impl SandboxHost {
    pub fn new(limits: HostLimits) -> Self {
        let (status, _) = watch::channel(EngineStatus::Idle);
        Self {
            runners: HashMap::new(),
            limits,
            status,
            in_flight: Mutex::new(()),
            provision_attempts: AtomicU64::new(0),
        }
    }

    /// A host with the TypeScript and Python runners configured from `config`.
    pub fn from_config(config: &Config) -> Self {
        let startup_timeout = Duration::from_millis(config.limits.startup_timeout_ms);
        Self::new((&config.limits).into())
            .with_runner(Arc::new(TypeScriptRunner::new(
                &config.typescript,
                startup_timeout,
            )))
            .with_runner(Arc::new(PythonRunner::new(&config.python, startup_timeout)))
    }

    pub fn with_runner(mut self, runner: Arc<dyn Runner>) -> Self {
        self.runners.insert(runner.language(), runner);
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<EngineStatus> {
        self.status.subscribe()
    }

    /// How many times a realm has been requested from any runner.
    pub fn provision_attempts(&self) -> u64 {
        self.provision_attempts.load(Ordering::SeqCst)
    }

    pub fn effective_timeout(&self, requested_ms: u64) -> Duration {
        if requested_ms == 0 {
            self.limits.default_timeout
        } else {
            Duration::from_millis(requested_ms).min(self.limits.max_timeout)
        }
    }

    /// Runs one submission. A second call waits until the first one finished
    /// or was dropped.
    pub async fn run(&self, request: ExecutionRequest) -> ExecutionResult {
        self.turn().await.run(request).await
    }

    /// Waits until no other run holds the host. Status changes seen by a
    /// receiver subscribed after this returns belong to this turn only.
    pub async fn turn(&self) -> Turn<'_> {
        Turn {
            host: self,
            _guard: self.in_flight.lock().await,
        }
    }

    #[tracing::instrument(skip_all, fields(run_id = %Uuid::new_v4(), language = %request.language))]
    async fn run_locked(&self, request: ExecutionRequest) -> ExecutionResult {
        let started = Instant::now();
        let status = StatusGuard(&self.status);
        tracing::info!(
            tests = request.test_cases.len(),
            timeout_ms = request.timeout_ms,
            "Run started"
        );

        let Some(runner) = self.runners.get(&request.language).cloned() else {
            let error = ProvisionError::Unsupported(request.language);
            tracing::error!("{}", error);
            return not_started(
                &request.test_cases,
                ExecutionError::new(ErrorKind::HostFault, &error.to_string()),
                started.elapsed(),
            );
        };

        let compiled = match compile_submission(runner.as_ref(), &request) {
            Ok(compiled) => compiled,
            Err(e) => {
                tracing::info!("Compile error: {}", e);
                return not_started(
                    &request.test_cases,
                    ExecutionError::new(ErrorKind::CompileError, &e.message)
                        .with_location(e.location),
                    started.elapsed(),
                );
            }
        };

        status.set(if runner.is_warm() {
            EngineStatus::Provisioning
        } else {
            EngineStatus::WarmingUp
        });
        let realm = match provision_with_retry(
            runner.as_ref(),
            self.limits.provision_retries,
            &self.provision_attempts,
        )
        .await
        {
            Ok(realm) => realm,
            Err(e) => {
                return not_started(
                    &request.test_cases,
                    ExecutionError::new(ErrorKind::HostFault, &e.to_string()),
                    started.elapsed(),
                );
            }
        };

        let (job, mut transcript) = plan(
            compiled.code,
            &request.test_cases,
            compiled.snippets,
            self.limits.max_log_lines,
        );
        let deadline = self.effective_timeout(request.timeout_ms);

        status.set(EngineStatus::Running);
        let end = execute_with_deadline(realm, &job, &mut transcript, deadline).await;

        let host_error = match end {
            RunEnd::Completed => None,
            RunEnd::Crashed(_) if transcript.has_fault() => None,
            RunEnd::Crashed(fault) => Some(ExecutionError::new(
                ErrorKind::RuntimeError,
                &fault.to_string(),
            )),
            RunEnd::TimedOut => Some(ExecutionError::new(
                ErrorKind::Timeout,
                &format!("Execution timed out after {} ms", deadline.as_millis()),
            )),
        };

        let result = aggregate(transcript.finish(), host_error, started.elapsed());
        tracing::info!(
            success = result.success,
            error = ?result.error_kind(),
            duration_ms = result.duration_ms,
            "Run finished"
        );
        result
    }
}

/// Exclusive use of a [`SandboxHost`] for one run.
pub struct Turn<'a> {
    host: &'a SandboxHost,
    _guard: MutexGuard<'a, ()>,
}

impl Turn<'_> {
    pub async fn run(self, request: ExecutionRequest) -> ExecutionResult {
        self.host.run_locked(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        domain::{TestOutcome, TestSpec},
        harness::WorkerEvent,
        traits::runner::{CompileError, MockRunner},
    };
    use crate::stubs::runner::RunnerStub;

    fn log(line: &str) -> WorkerEvent {
        WorkerEvent::Log {
            line: line.to_string(),
        }
    }

    fn outcome(id: &str, passed: bool, message: Option<&str>) -> WorkerEvent {
        WorkerEvent::Test {
            id: id.to_string(),
            passed,
            message: message.map(str::to_string),
        }
    }

    fn host_with(runner: RunnerStub) -> SandboxHost {
        SandboxHost::new(HostLimits::default()).with_runner(Arc::new(runner))
    }

    fn request(language: Language, timeout_ms: u64, tests: &[&str]) -> ExecutionRequest {
        ExecutionRequest::new("learner code", language, timeout_ms).with_tests(
            tests
                .iter()
                .map(|id| TestSpec::new(id, &format!("check {}", id)))
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_run_without_tests_collects_logs_in_order() {
        let runner = RunnerStub::new(
            Language::TypeScript,
            vec![log("one"), log("two"), log("three"), WorkerEvent::Done],
            Duration::from_millis(1),
        );
        let host = host_with(runner);

        let result = host.run(request(Language::TypeScript, 1000, &[])).await;

        assert!(result.success);
        assert_eq!(result.logs, vec!["one", "two", "three"]);
        assert!(result.error.is_none());
        assert!(result.test_results.is_empty());
    }

    #[tokio::test]
    async fn test_every_assertion_is_reported() {
        let runner = RunnerStub::new(
            Language::Python,
            vec![
                log("code output"),
                outcome("a", false, Some("x should be 4")),
                log("assertion output"),
                outcome("b", true, None),
                outcome("c", true, None),
                WorkerEvent::Done,
            ],
            Duration::from_millis(1),
        );
        let stats = runner.stats();
        let host = host_with(runner);

        let result = host.run(request(Language::Python, 1000, &["a", "b", "c"])).await;

        assert!(!result.success);
        assert!(result.error.is_none());
        assert_eq!(result.logs, vec!["code output", "assertion output"]);
        assert_eq!(
            result.test_results,
            vec![
                TestOutcome::failed("a", "x should be 4"),
                TestOutcome::passed("b"),
                TestOutcome::passed("c"),
            ]
        );
        assert_eq!(stats.recycled(), 1);

        let jobs = stats.jobs.lock().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].tests.len(), 3);
        assert_eq!(jobs[0].tests[0].snippet, "check a");
    }

    #[tokio::test]
    async fn test_learner_fault_marks_tests_not_run() {
        let runner = RunnerStub::new(
            Language::Python,
            vec![
                log("before"),
                WorkerEvent::Fault {
                    message: "NameError: name 'y' is not defined".to_string(),
                    raw: None,
                    line: Some(2),
                    column: None,
                },
                WorkerEvent::Done,
            ],
            Duration::from_millis(1),
        );
        let host = host_with(runner);

        let result = host.run(request(Language::Python, 1000, &["a", "b"])).await;

        assert!(!result.success);
        assert_eq!(result.error_kind(), Some(ErrorKind::RuntimeError));
        assert_eq!(result.logs, vec!["before"]);
        assert_eq!(
            result.test_results,
            vec![TestOutcome::not_run("a"), TestOutcome::not_run("b")]
        );
    }

    #[tokio::test]
    async fn test_compile_error_never_provisions() {
        let mut runner = MockRunner::new();
        runner.expect_language().return_const(Language::TypeScript);
        runner
            .expect_prepare()
            .returning(|_| Err(CompileError::at("Expected ')' but found '{'", 1, 16)));
        runner.expect_is_warm().never();
        runner.expect_provision().never();
        let host = SandboxHost::new(HostLimits::default()).with_runner(Arc::new(runner));

        let result = host
            .run(request(Language::TypeScript, 1000, &["a"]))
            .await;

        assert!(!result.success);
        assert_eq!(host.provision_attempts(), 0);
        let error = result.error.unwrap();
        assert_eq!(error.kind, ErrorKind::CompileError);
        assert_eq!(error.message, "Expected ')' but found '{'");
        assert_eq!(error.location.map(|l| l.line), Some(1));
        assert_eq!(result.test_results, vec![TestOutcome::not_run("a")]);
    }

    #[tokio::test]
    async fn test_timeout_terminates_realm() {
        let runner = RunnerStub::new(
            Language::Python,
            vec![
                log("started"),
                outcome("a", true, None),
                outcome("b", true, None),
                WorkerEvent::Done,
            ],
            Duration::from_millis(150),
        );
        let stats = runner.stats();
        let host = host_with(runner);

        let started = Instant::now();
        let result = host.run(request(Language::Python, 400, &["a", "b"])).await;
        let elapsed = started.elapsed();

        assert!(!result.success);
        assert_eq!(result.error_kind(), Some(ErrorKind::Timeout));
        // Provisioning ~150ms, then log at ~150ms and first outcome at ~300ms
        // into the 400ms deadline.
        assert_eq!(result.logs, vec!["started"]);
        assert_eq!(result.test_results, vec![TestOutcome::passed("a")]);
        assert_eq!(stats.terminated(), 1);
        assert!(elapsed >= Duration::from_millis(500));
        assert!(elapsed < Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn test_provision_failure_is_retried_then_reported() {
        let runner = RunnerStub::new(Language::Python, vec![WorkerEvent::Done], Duration::ZERO)
            .with_provision_failures(2);
        let host = host_with(runner);

        let result = host.run(request(Language::Python, 1000, &["a"])).await;

        assert!(!result.success);
        assert_eq!(result.error_kind(), Some(ErrorKind::HostFault));
        assert_eq!(host.provision_attempts(), 2);
        assert_eq!(result.test_results, vec![TestOutcome::not_run("a")]);
    }

    #[tokio::test]
    async fn test_single_provision_failure_is_absorbed() {
        let runner = RunnerStub::new(Language::Python, vec![WorkerEvent::Done], Duration::ZERO)
            .with_provision_failures(1);
        let host = host_with(runner);

        let result = host.run(request(Language::Python, 1000, &[])).await;

        assert!(result.success);
        assert_eq!(host.provision_attempts(), 2);
    }

    #[tokio::test]
    async fn test_unregistered_language_is_a_host_fault() {
        let host = SandboxHost::new(HostLimits::default());

        let result = host.run(request(Language::Python, 1000, &[])).await;

        assert_eq!(result.error_kind(), Some(ErrorKind::HostFault));
        assert_eq!(host.provision_attempts(), 0);
    }

    #[tokio::test]
    async fn test_crash_without_fault_is_runtime_error() {
        let runner = RunnerStub::new(
            Language::Python,
            vec![log("partial"), outcome("a", true, None)],
            Duration::from_millis(1),
        );
        let stats = runner.stats();
        let host = host_with(runner);

        let result = host.run(request(Language::Python, 1000, &["a", "b"])).await;

        assert_eq!(result.error_kind(), Some(ErrorKind::RuntimeError));
        assert_eq!(result.logs, vec!["partial"]);
        assert_eq!(result.test_results, vec![TestOutcome::passed("a")]);
        assert_eq!(stats.terminated(), 1);
    }

    #[tokio::test]
    async fn test_status_reports_warm_up_only_when_cold() {
        let runner = RunnerStub::new(
            Language::Python,
            vec![log("x"), WorkerEvent::Done],
            Duration::from_millis(50),
        );
        let host = Arc::new(host_with(runner));

        let mut rx = host.subscribe();
        let collector = tokio::spawn(async move {
            let mut seen = Vec::new();
            while rx.changed().await.is_ok() {
                let status = *rx.borrow_and_update();
                seen.push(status);
                if seen.iter().filter(|s| **s == EngineStatus::Idle).count() == 2 {
                    break;
                }
            }
            seen
        });

        host.run(request(Language::Python, 1000, &[])).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        host.run(request(Language::Python, 1000, &[])).await;

        let seen = tokio::time::timeout(Duration::from_secs(2), collector)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            seen,
            vec![
                EngineStatus::WarmingUp,
                EngineStatus::Running,
                EngineStatus::Idle,
                EngineStatus::Provisioning,
                EngineStatus::Running,
                EngineStatus::Idle,
            ]
        );
    }

    #[tokio::test]
    async fn test_concurrent_runs_are_serialized() {
        let runner = RunnerStub::new(
            Language::Python,
            vec![log("x"), WorkerEvent::Done],
            Duration::from_millis(60),
        );
        let host = host_with(runner);

        let started = Instant::now();
        let (first, second) = futures::future::join(
            host.run(request(Language::Python, 1000, &[])),
            host.run(request(Language::Python, 1000, &[])),
        )
        .await;

        assert!(first.success && second.success);
        // Each run takes three 60ms steps; overlapping runs would finish in ~180ms.
        assert!(started.elapsed() >= Duration::from_millis(340));
    }

    #[tokio::test]
    async fn test_held_turn_blocks_other_runs() {
        let runner = RunnerStub::new(
            Language::Python,
            vec![WorkerEvent::Done],
            Duration::from_millis(10),
        );
        let host = host_with(runner);

        let turn = host.turn().await;
        let blocked = tokio::time::timeout(
            Duration::from_millis(100),
            host.run(request(Language::Python, 1000, &[])),
        )
        .await;
        assert!(blocked.is_err());
        assert_eq!(host.provision_attempts(), 0);

        let rx = host.subscribe();
        assert!(turn.run(request(Language::Python, 1000, &[])).await.success);
        assert_eq!(*rx.borrow(), EngineStatus::Idle);
        assert!(host.run(request(Language::Python, 1000, &[])).await.success);
    }

    #[tokio::test]
    async fn test_abandoned_run_releases_the_host() {
        let runner = RunnerStub::new(
            Language::Python,
            vec![log("slow"), WorkerEvent::Done],
            Duration::from_millis(200),
        );
        let host = host_with(runner);
        let rx = host.subscribe();

        let abandoned = tokio::time::timeout(
            Duration::from_millis(250),
            host.run(request(Language::Python, 5000, &[])),
        )
        .await;

        assert!(abandoned.is_err());
        assert_eq!(*rx.borrow(), EngineStatus::Idle);

        let result = host.run(request(Language::Python, 5000, &[])).await;
        assert!(result.success);
        assert_eq!(result.logs, vec!["slow"]);
    }

    #[test]
    fn test_effective_timeout() {
        let host = SandboxHost::new(HostLimits {
            default_timeout: Duration::from_millis(3000),
            max_timeout: Duration::from_millis(10_000),
            provision_retries: 1,
            max_log_lines: 10,
        });

        assert_eq!(host.effective_timeout(0), Duration::from_millis(3000));
        assert_eq!(host.effective_timeout(2000), Duration::from_millis(2000));
        assert_eq!(host.effective_timeout(60_000), Duration::from_millis(10_000));
    }
}
