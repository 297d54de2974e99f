//! Interpreter child processes speaking newline-delimited JSON.
//!
//! The host writes one [`Job`] per line to stdin; the worker answers with
//! [`WorkerEvent`]s on stdout. Stderr never carries protocol traffic and is only
//! kept for diagnostics.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    process::{Child, ChildStdin, ChildStdout, Command},
    task::JoinHandle,
};

use crate::core::{
    harness::{Job, Progress, Transcript, WorkerEvent},
    traits::{realm::RealmFault, runner::ProvisionError},
};

const STDERR_TAIL_LINES: usize = 20;
/// Drivers clip log lines well below this; anything longer is not a driver event.
pub const MAX_EVENT_BYTES: usize = 1 << 20;
const EXIT_GRACE: Duration = Duration::from_millis(500);

#[derive(Clone, Debug)]
pub struct WorkerCommand {
    pub label: &'static str,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub startup_timeout: Duration,
}

/// Deterministic environment for learner code. Only `PATH` is inherited so the
/// interpreter can still find its own helpers.
fn base_env(sandbox_dir: &Path) -> Vec<(String, String)> {
    let dir = sandbox_dir.display().to_string();
    let mut env = vec![
        ("HOME".to_string(), dir.clone()),
        ("TMPDIR".to_string(), dir),
        ("LANG".to_string(), "C.UTF-8".to_string()),
        ("LC_ALL".to_string(), "C.UTF-8".to_string()),
    ];
    if let Ok(path) = std::env::var("PATH") {
        env.push(("PATH".to_string(), path));
    }
    env
}

#[derive(Debug)]
pub struct WorkerProcess {
    label: &'static str,
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    stderr_task: Option<JoinHandle<()>>,
    runtime: Option<String>,
    tainted: bool,
}

impl WorkerProcess {
    /// Launches the interpreter and waits for its `ready` event.
    #[tracing::instrument(skip(command), fields(worker = command.label))]
    pub async fn spawn(command: &WorkerCommand) -> Result<Self, ProvisionError> {
        let sandbox_dir = std::env::temp_dir();
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .env_clear()
            .envs(base_env(&sandbox_dir))
            .envs(command.env.iter().cloned())
            .current_dir(&sandbox_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProvisionError::Launch {
                program: command.program.display().to_string(),
                msg: e.to_string(),
            })?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(ProvisionError::Bootstrap {
                msg: "worker stdio was not captured".to_string(),
            });
        };

        let stderr_tail = Arc::new(Mutex::new(VecDeque::new()));
        let stderr_task = tokio::spawn(forward_stderr(
            command.label,
            BufReader::new(stderr).lines(),
            stderr_tail.clone(),
        ));

        let mut worker = Self {
            label: command.label,
            child,
            stdin,
            stdout: BufReader::new(stdout),
            stderr_tail,
            stderr_task: Some(stderr_task),
            runtime: None,
            tainted: false,
        };

        match tokio::time::timeout(command.startup_timeout, worker.next_event()).await {
            Ok(Ok(Some(WorkerEvent::Ready { runtime }))) => {
                tracing::info!("Worker ready: {}", runtime.as_deref().unwrap_or("unknown runtime"));
                worker.runtime = runtime;
                Ok(worker)
            }
            Ok(Ok(Some(event))) => {
                worker.kill().await;
                Err(ProvisionError::Bootstrap {
                    msg: format!("expected ready, got {:?}", event),
                })
            }
            Ok(Ok(None)) => {
                let fault = worker.exit_fault().await;
                Err(ProvisionError::Bootstrap {
                    msg: fault.to_string(),
                })
            }
            Ok(Err(fault)) => {
                worker.kill().await;
                Err(ProvisionError::Bootstrap {
                    msg: fault.to_string(),
                })
            }
            Err(_) => {
                worker.kill().await;
                Err(ProvisionError::StartupTimeout(
                    command.startup_timeout.as_millis() as u64,
                ))
            }
        }
    }

    pub fn runtime(&self) -> Option<&str> {
        self.runtime.as_deref()
    }

    /// Set when the last run left learner threads behind; such a worker must
    /// not serve another run.
    pub fn is_tainted(&self) -> bool {
        self.tainted
    }

    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    pub async fn submit(&mut self, job: &Job) -> Result<(), RealmFault> {
        let mut line = serde_json::to_string(job).map_err(|e| RealmFault::Protocol(e.to_string()))?;
        line.push('\n');

        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| RealmFault::Io(e.to_string()))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| RealmFault::Io(e.to_string()))
    }

    /// Next event from stdout, or `None` once the worker closed it.
    pub async fn next_event(&mut self) -> Result<Option<WorkerEvent>, RealmFault> {
        loop {
            let Some(line) = self.next_line().await? else {
                return Ok(None);
            };
            if line.trim().is_empty() {
                continue;
            }

            return serde_json::from_str(&line)
                .map(Some)
                .map_err(|e| RealmFault::Protocol(format!("{}: {}", e, line)));
        }
    }

    /// Reads one line of at most `MAX_EVENT_BYTES`, without the newline.
    async fn next_line(&mut self) -> Result<Option<String>, RealmFault> {
        let mut line = Vec::new();
        loop {
            let chunk = self
                .stdout
                .fill_buf()
                .await
                .map_err(|e| RealmFault::Io(e.to_string()))?;
            if chunk.is_empty() {
                if line.is_empty() {
                    return Ok(None);
                }
                break;
            }

            let newline = chunk.iter().position(|&b| b == b'\n');
            let take = newline.map_or(chunk.len(), |pos| pos + 1);
            if line.len() + take > MAX_EVENT_BYTES + 1 {
                return Err(RealmFault::Protocol(format!(
                    "event line exceeds {} bytes",
                    MAX_EVENT_BYTES
                )));
            }
            line.extend_from_slice(&chunk[..take]);
            self.stdout.consume(take);

            if newline.is_some() {
                line.pop();
                break;
            }
        }

        String::from_utf8(line)
            .map(Some)
            .map_err(|e| RealmFault::Protocol(e.to_string()))
    }

    pub async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::debug!(worker = self.label, "Kill failed: {}", e);
        }
    }

    /// Describes why stdout closed, once the process is gone.
    async fn exit_fault(&mut self) -> RealmFault {
        let status = match tokio::time::timeout(EXIT_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            _ => {
                self.kill().await;
                None
            }
        };
        if let Some(task) = self.stderr_task.take() {
            let _ = tokio::time::timeout(EXIT_GRACE, task).await;
        }

        let tail = self
            .stderr_tail
            .lock()
            .map(|tail| tail.iter().cloned().collect::<Vec<_>>().join("\n"))
            .unwrap_or_default();

        RealmFault::Exited {
            detail: exit_detail(status, &tail),
        }
    }
}

fn exit_detail(status: Option<ExitStatus>, stderr_tail: &str) -> String {
    let status = status.map(|s| s.to_string());
    match (status, stderr_tail.trim()) {
        (Some(status), "") => status,
        (Some(status), tail) => format!("{}\n{}", status, tail),
        (None, "") => String::new(),
        (None, tail) => tail.to_string(),
    }
}

async fn forward_stderr(
    label: &'static str,
    mut lines: Lines<BufReader<tokio::process::ChildStderr>>,
    tail: Arc<Mutex<VecDeque<String>>>,
) {
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(worker = label, "stderr: {}", line);
        if let Ok(mut tail) = tail.lock() {
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    }
}

/// Sends `job` and feeds the worker's events into `transcript` until `done`.
pub async fn drive(
    worker: &mut WorkerProcess,
    job: &Job,
    transcript: &mut Transcript,
) -> Result<(), RealmFault> {
    worker.submit(job).await?;

    loop {
        match worker.next_event().await? {
            Some(WorkerEvent::Lingering { threads }) => {
                tracing::warn!(
                    worker = worker.label,
                    "Learner threads outlived the run: {:?}",
                    threads
                );
                worker.tainted = true;
            }
            Some(event) => {
                if transcript.apply(event) == Progress::Done {
                    return Ok(());
                }
            }
            None => return Err(worker.exit_fault().await),
        }
    }
}
