use std::time::Duration;

use crate::core::{
    domain::{ExecutionError, ExecutionResult, TestOutcome, TestSpec},
    harness::HarnessReport,
};

/// Merges what the harness recorded with a host-level error into the final verdict.
///
/// A host-level error (compile, timeout, host fault) wins over a runtime fault
/// reported by the realm.
pub fn aggregate(
    report: HarnessReport,
    host_error: Option<ExecutionError>,
    elapsed: Duration,
) -> ExecutionResult {
    let HarnessReport {
        logs,
        outcomes,
        fault,
    } = report;

    let error = host_error.or(fault);
    let success = error.is_none() && outcomes.iter().all(|outcome| outcome.passed);

    ExecutionResult {
        success,
        logs,
        error,
        test_results: outcomes,
        duration_ms: elapsed.as_millis() as u64,
        finished_at: chrono::Utc::now(),
    }
}

/// Verdict for a run whose learner code never executed.
pub fn not_started(
    tests: &[TestSpec],
    error: ExecutionError,
    elapsed: Duration,
) -> ExecutionResult {
    let report = HarnessReport {
        logs: Vec::new(),
        outcomes: tests.iter().map(|t| TestOutcome::not_run(&t.id)).collect(),
        fault: None,
    };
    aggregate(report, Some(error), elapsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::domain::ErrorKind;

    fn report(outcomes: Vec<TestOutcome>) -> HarnessReport {
        HarnessReport {
            logs: vec!["a".to_string(), "b".to_string()],
            outcomes,
            fault: None,
        }
    }

    #[test]
    fn test_success_without_tests() {
        let result = aggregate(report(Vec::new()), None, Duration::from_millis(12));

        assert!(result.success);
        assert_eq!(result.logs, vec!["a", "b"]);
        assert!(result.error.is_none());
        assert!(result.test_results.is_empty());
        assert_eq!(result.duration_ms, 12);
    }

    #[test]
    fn test_success_requires_every_outcome() {
        let all_passed = aggregate(
            report(vec![TestOutcome::passed("a"), TestOutcome::passed("b")]),
            None,
            Duration::ZERO,
        );
        assert!(all_passed.success);

        let one_failed = aggregate(
            report(vec![
                TestOutcome::passed("a"),
                TestOutcome::failed("b", "x should be 4"),
            ]),
            None,
            Duration::ZERO,
        );
        assert!(!one_failed.success);
        assert_eq!(one_failed.test_results.len(), 2);
    }

    #[test]
    fn test_error_fails_even_when_tests_pass() {
        let result = aggregate(
            report(vec![TestOutcome::passed("a")]),
            Some(ExecutionError::new(ErrorKind::Timeout, "timed out")),
            Duration::ZERO,
        );

        assert!(!result.success);
        assert_eq!(result.error_kind(), Some(ErrorKind::Timeout));
    }

    #[test]
    fn test_host_error_takes_precedence_over_fault() {
        let mut faulted = report(Vec::new());
        faulted.fault = Some(ExecutionError::new(ErrorKind::RuntimeError, "boom"));

        let result = aggregate(
            faulted.clone(),
            Some(ExecutionError::new(ErrorKind::Timeout, "timed out")),
            Duration::ZERO,
        );
        assert_eq!(result.error_kind(), Some(ErrorKind::Timeout));

        let result = aggregate(faulted, None, Duration::ZERO);
        assert_eq!(result.error_kind(), Some(ErrorKind::RuntimeError));
        assert!(!result.success);
    }

    #[test]
    fn test_not_started_marks_tests_not_run() {
        let tests = vec![TestSpec::new("a", "1"), TestSpec::new("b", "2")];
        let result = not_started(
            &tests,
            ExecutionError::new(ErrorKind::CompileError, "Unexpected token"),
            Duration::from_millis(1),
        );

        assert!(!result.success);
        assert!(result.logs.is_empty());
        assert_eq!(
            result.test_results,
            vec![TestOutcome::not_run("a"), TestOutcome::not_run("b")]
        );
        assert_eq!(result.error_kind(), Some(ErrorKind::CompileError));
    }
}
