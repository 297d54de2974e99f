//! Test harness: what a realm is asked to do, and how its answers are recorded.
//!
//! The learner code runs once; every snippet then runs against the bindings it
//! left behind. Outcomes are recorded independently and in request order.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::core::{
    domain::{ErrorKind, ExecutionError, SourceLocation, TestOutcome, TestSpec},
    traits::runner::CompileError,
};

/// The unit of work sent to a realm.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Job {
    pub code: String,
    pub tests: Vec<JobTest>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct JobTest {
    pub id: String,
    pub snippet: String,
}

/// Events a realm reports, in emission order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    Ready {
        #[serde(default)]
        runtime: Option<String>,
    },
    Log {
        line: String,
    },
    Fault {
        message: String,
        #[serde(default)]
        raw: Option<String>,
        #[serde(default)]
        line: Option<u32>,
        #[serde(default)]
        column: Option<u32>,
    },
    Test {
        id: String,
        passed: bool,
        #[serde(default)]
        message: Option<String>,
    },
    /// Threads the learner started were still alive when the run ended.
    Lingering {
        #[serde(default)]
        threads: Vec<String>,
    },
    Done,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Progress {
    Continue,
    Done,
}

#[derive(Clone, Debug)]
enum Slot {
    Awaiting(String),
    Resolved(TestOutcome),
}

/// Everything observed during one run. Owned by the host, filled by the realm.
#[derive(Debug)]
pub struct Transcript {
    slots: Vec<Slot>,
    pending: VecDeque<usize>,
    logs: Vec<String>,
    dropped_logs: usize,
    max_log_lines: usize,
    fault: Option<ExecutionError>,
    finished: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HarnessReport {
    pub logs: Vec<String>,
    pub outcomes: Vec<TestOutcome>,
    pub fault: Option<ExecutionError>,
}

/// Builds the job for a realm and the transcript that will record it.
///
/// Snippets that failed to prepare are not sent; their outcome is settled
/// here and keeps its position in the result.
pub fn plan(
    code: String,
    tests: &[TestSpec],
    snippets: Vec<Result<String, CompileError>>,
    max_log_lines: usize,
) -> (Job, Transcript) {
    let mut job_tests = Vec::with_capacity(tests.len());
    let mut slots = Vec::with_capacity(tests.len());
    let mut pending = VecDeque::with_capacity(tests.len());

    for (idx, (spec, snippet)) in tests.iter().zip(snippets).enumerate() {
        match snippet {
            Ok(snippet) => {
                job_tests.push(JobTest {
                    id: spec.id.clone(),
                    snippet,
                });
                slots.push(Slot::Awaiting(spec.id.clone()));
                pending.push_back(idx);
            }
            Err(e) => {
                let message = match e.location {
                    Some(location) => format!("compile error in test at {}: {}", location, e),
                    None => format!("compile error in test: {}", e),
                };
                slots.push(Slot::Resolved(TestOutcome::failed(&spec.id, &message)));
            }
        }
    }

    let job = Job {
        code,
        tests: job_tests,
    };
    let transcript = Transcript {
        slots,
        pending,
        logs: Vec::new(),
        dropped_logs: 0,
        max_log_lines,
        fault: None,
        finished: false,
    };

    (job, transcript)
}

impl Transcript {
    pub fn apply(&mut self, event: WorkerEvent) -> Progress {
        if self.finished {
            tracing::warn!("Event after completion ignored: {:?}", event);
            return Progress::Done;
        }

        match event {
            WorkerEvent::Ready { runtime } => {
                tracing::debug!("Unexpected ready event mid-run: {:?}", runtime);
            }
            WorkerEvent::Lingering { threads } => {
                tracing::debug!("Lingering threads reported to the transcript: {:?}", threads);
            }
            WorkerEvent::Log { line } => self.push_log(line),
            WorkerEvent::Fault {
                message,
                raw,
                line,
                column,
            } => self.short_circuit(
                ExecutionError::new(ErrorKind::RuntimeError, &message)
                    .with_raw(raw)
                    .with_location(line.map(|line| SourceLocation { line, column })),
            ),
            WorkerEvent::Test {
                id,
                passed,
                message,
            } => self.record(id, passed, message),
            WorkerEvent::Done => {
                self.finished = true;
                return Progress::Done;
            }
        }

        Progress::Continue
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn has_fault(&self) -> bool {
        self.fault.is_some()
    }

    pub fn log_count(&self) -> usize {
        self.logs.len() + self.dropped_logs
    }

    fn push_log(&mut self, line: String) {
        if self.logs.len() < self.max_log_lines {
            self.logs.push(line);
        } else {
            self.dropped_logs += 1;
        }
    }

    /// The learner code faulted: none of the assertions ran.
    fn short_circuit(&mut self, fault: ExecutionError) {
        if self.fault.is_some() {
            tracing::warn!("Second fault ignored: {:?}", fault);
            return;
        }

        for slot in self.slots.iter_mut() {
            let id = match slot {
                Slot::Awaiting(id) => id.clone(),
                Slot::Resolved(outcome) => outcome.id.clone(),
            };
            *slot = Slot::Resolved(TestOutcome::not_run(&id));
        }
        self.pending.clear();
        self.fault = Some(fault);
    }

    fn record(&mut self, id: String, passed: bool, message: Option<String>) {
        let Some(&idx) = self.pending.front() else {
            tracing::warn!("Outcome for unexpected test {} ignored", id);
            return;
        };

        let Slot::Awaiting(expected) = &self.slots[idx] else {
            tracing::error!("Pending test {} already resolved", idx);
            return;
        };

        if *expected != id {
            tracing::warn!("Outcome for {} arrived while waiting for {}", id, expected);
            return;
        }

        self.pending.pop_front();
        let outcome = if passed {
            TestOutcome::passed(&id)
        } else {
            TestOutcome {
                id,
                passed: false,
                message,
                ran: true,
            }
        };
        self.slots[idx] = Slot::Resolved(outcome);
    }

    /// Consumes the transcript. Assertions that never reported are dropped,
    /// never fabricated.
    pub fn finish(self) -> HarnessReport {
        let mut logs = self.logs;
        if self.dropped_logs > 0 {
            logs.push(format!(
                "... output truncated ({} more lines)",
                self.dropped_logs
            ));
        }

        let outcomes = self
            .slots
            .into_iter()
            .filter_map(|slot| match slot {
                Slot::Resolved(outcome) => Some(outcome),
                Slot::Awaiting(_) => None,
            })
            .collect();

        HarnessReport {
            logs,
            outcomes,
            fault: self.fault,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use itertools::Itertools;

    fn specs(ids: &[&str]) -> Vec<TestSpec> {
        ids.iter()
            .map(|id| TestSpec::new(id, &format!("check_{}()", id)))
            .collect()
    }

    fn compiled(tests: &[TestSpec]) -> Vec<Result<String, CompileError>> {
        tests.iter().map(|t| Ok(t.snippet.clone())).collect()
    }

    fn log(line: &str) -> WorkerEvent {
        WorkerEvent::Log {
            line: line.to_string(),
        }
    }

    fn test_event(id: &str, passed: bool, message: Option<&str>) -> WorkerEvent {
        WorkerEvent::Test {
            id: id.to_string(),
            passed,
            message: message.map(str::to_string),
        }
    }

    #[test]
    fn test_plan_keeps_order_and_skips_uncompiled_snippets() {
        let tests = specs(&["a", "b", "c"]);
        let snippets = vec![
            Ok("one".to_string()),
            Err(CompileError::at("Unterminated string literal", 1, 5)),
            Ok("three".to_string()),
        ];

        let (job, transcript) = plan("code".to_string(), &tests, snippets, 10);

        assert_eq!(job.code, "code");
        assert_eq!(
            job.tests.iter().map(|t| t.id.as_str()).collect_vec(),
            vec!["a", "c"]
        );

        let report = transcript.finish();
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.outcomes[0].id, "b");
        assert!(!report.outcomes[0].passed);
        assert_eq!(
            report.outcomes[0].message.as_deref(),
            Some("compile error in test at 1:5: Unterminated string literal")
        );
    }

    #[test]
    fn test_outcomes_are_independent() {
        let tests = specs(&["a", "b", "c"]);
        let (_, mut transcript) = plan("x".to_string(), &tests, compiled(&tests), 10);

        let events = vec![
            log("from code"),
            test_event("a", false, Some("x should be 4")),
            log("from b"),
            test_event("b", true, None),
            test_event("c", false, Some("boom")),
            WorkerEvent::Done,
        ];
        let progress = events
            .into_iter()
            .map(|e| transcript.apply(e))
            .collect_vec();

        assert_eq!(progress.last(), Some(&Progress::Done));
        assert!(transcript.is_finished());

        let report = transcript.finish();
        assert_eq!(report.logs, vec!["from code", "from b"]);
        assert_eq!(
            report.outcomes,
            vec![
                TestOutcome::failed("a", "x should be 4"),
                TestOutcome::passed("b"),
                TestOutcome::failed("c", "boom"),
            ]
        );
        assert!(report.fault.is_none());
    }

    #[test]
    fn test_fault_marks_every_test_not_run() {
        let tests = specs(&["a", "b"]);
        let snippets = vec![
            Ok("ok".to_string()),
            Err(CompileError::at("Type expected", 1, 8)),
        ];
        let (_, mut transcript) = plan("x".to_string(), &tests, snippets, 10);

        transcript.apply(log("before"));
        transcript.apply(WorkerEvent::Fault {
            message: "NameError: name 'y' is not defined".to_string(),
            raw: Some("Traceback".to_string()),
            line: Some(3),
            column: None,
        });
        transcript.apply(WorkerEvent::Done);

        let report = transcript.finish();
        assert_eq!(report.logs, vec!["before"]);
        assert_eq!(
            report.outcomes,
            vec![TestOutcome::not_run("a"), TestOutcome::not_run("b")]
        );

        let fault = report.fault.expect("fault must be recorded");
        assert_eq!(fault.kind, ErrorKind::RuntimeError);
        assert_eq!(fault.message, "NameError: name 'y' is not defined");
        assert_eq!(
            fault.location,
            Some(SourceLocation {
                line: 3,
                column: None
            })
        );
    }

    #[test]
    fn test_unflushed_outcomes_are_dropped() {
        let tests = specs(&["a", "b", "c"]);
        let (_, mut transcript) = plan("x".to_string(), &tests, compiled(&tests), 10);

        transcript.apply(test_event("a", true, None));

        assert!(!transcript.is_finished());
        let report = transcript.finish();
        assert_eq!(report.outcomes, vec![TestOutcome::passed("a")]);
    }

    #[test]
    fn test_out_of_order_outcome_is_ignored() {
        let tests = specs(&["a", "b"]);
        let (_, mut transcript) = plan("x".to_string(), &tests, compiled(&tests), 10);

        transcript.apply(test_event("b", true, None));
        transcript.apply(test_event("a", false, Some("nope")));
        transcript.apply(test_event("b", true, None));
        transcript.apply(test_event("zzz", true, None));

        let report = transcript.finish();
        assert_eq!(
            report.outcomes,
            vec![TestOutcome::failed("a", "nope"), TestOutcome::passed("b")]
        );
    }

    #[test]
    fn test_logs_are_truncated_with_marker() {
        let (_, mut transcript) = plan("x".to_string(), &[], Vec::new(), 2);

        for i in 0..5 {
            transcript.apply(log(&format!("line {}", i)));
        }
        assert_eq!(transcript.log_count(), 5);

        let report = transcript.finish();
        assert_eq!(
            report.logs,
            vec!["line 0", "line 1", "... output truncated (3 more lines)"]
        );
    }

    #[test]
    fn test_events_after_done_are_ignored() {
        let (_, mut transcript) = plan("x".to_string(), &[], Vec::new(), 10);

        assert_eq!(transcript.apply(WorkerEvent::Done), Progress::Done);
        assert_eq!(transcript.apply(log("late")), Progress::Done);

        assert!(transcript.finish().logs.is_empty());
    }

    #[test]
    fn test_worker_event_wire_format() {
        let events: Vec<WorkerEvent> = [
            r#"{"type":"ready","runtime":"python 3.12.1"}"#,
            r#"{"type":"log","line":"hi"}"#,
            r#"{"type":"fault","message":"ZeroDivisionError: division by zero","line":2}"#,
            r#"{"type":"test","id":"t1","passed":false,"message":"x should be 4"}"#,
            r#"{"type":"done"}"#,
        ]
        .iter()
        .map(|raw| serde_json::from_str(raw).unwrap())
        .collect();

        assert_eq!(
            events,
            vec![
                WorkerEvent::Ready {
                    runtime: Some("python 3.12.1".to_string())
                },
                log("hi"),
                WorkerEvent::Fault {
                    message: "ZeroDivisionError: division by zero".to_string(),
                    raw: None,
                    line: Some(2),
                    column: None,
                },
                test_event("t1", false, Some("x should be 4")),
                WorkerEvent::Done,
            ]
        );

        let job = Job {
            code: "x = 1".to_string(),
            tests: vec![JobTest {
                id: "t1".to_string(),
                snippet: "assert x == 1".to_string(),
            }],
        };
        assert_eq!(
            serde_json::to_string(&job).unwrap(),
            r#"{"code":"x = 1","tests":[{"id":"t1","snippet":"assert x == 1"}]}"#
        );
    }
}
