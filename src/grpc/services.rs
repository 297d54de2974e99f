use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::mpsc::{Sender, channel};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

use crate::{
    constants::STATUS_RX_ERR,
    core::{
        domain::{EngineStatus, ExecutionRequest},
        host::SandboxHost,
    },
    grpc::{
        mappers::ConversionError,
        models::{
            CloseSessionRequest, CloseSessionResponse, RunRequest, RunUpdate,
            execution_service_server::ExecutionService,
        },
    },
};

pub type HostFactory = Arc<dyn Fn() -> SandboxHost + Send + Sync>;

const REAP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
struct Session {
    host: Arc<SandboxHost>,
    last_used: Arc<Mutex<Instant>>,
}

impl Session {
    fn new(host: SandboxHost) -> Self {
        Self {
            host: Arc::new(host),
            last_used: Arc::new(Mutex::new(Instant::now())),
        }
    }

    fn touch(&self) {
        if let Ok(mut last_used) = self.last_used.lock() {
            *last_used = Instant::now();
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_used
            .lock()
            .map(|last_used| last_used.elapsed())
            .unwrap_or_default()
    }

    /// A stream besides the session table holds the host.
    fn in_use(&self) -> bool {
        Arc::strong_count(&self.host) > 1
    }
}

/// One [`SandboxHost`] per learner session, created on first use and dropped
/// after `idle_limit` without runs.
#[derive(Clone)]
pub struct ExecutionServiceImpl {
    sessions: Arc<DashMap<String, Session>>,
    factory: HostFactory,
    idle_limit: Duration,
}

impl fmt::Debug for ExecutionServiceImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionServiceImpl")
            .field("sessions", &self.sessions.len())
            .field("idle_limit", &self.idle_limit)
            .finish_non_exhaustive()
    }
}

#[tonic::async_trait]
impl ExecutionService for ExecutionServiceImpl {
    type RunStream = ReceiverStream<Result<RunUpdate, Status>>;

    #[tracing::instrument(skip_all)]
    async fn run(
        &self,
        request: Request<RunRequest>,
    ) -> Result<Response<Self::RunStream>, Status> {
        let request = request.into_inner();
        let session_id = request.session_id.clone();
        tracing::info!(session_id = %session_id, "Received run request");

        let execution: ExecutionRequest = request
            .try_into()
            .map_err(|e: ConversionError| Status::invalid_argument(e.to_string()))?;

        self.evict_idle();
        let session = self.session(&session_id);
        let (stream_tx, stream_rx) = channel::<Result<RunUpdate, Status>>(128);
        tokio::spawn(stream_run(session, execution, stream_tx));

        Ok(Response::new(ReceiverStream::new(stream_rx)))
    }

    #[tracing::instrument(skip_all)]
    async fn close_session(
        &self,
        request: Request<CloseSessionRequest>,
    ) -> Result<Response<CloseSessionResponse>, Status> {
        let session_id = request.into_inner().session_id;
        let closed = self.sessions.remove(&session_id).is_some();
        tracing::info!(session_id = %session_id, closed, "Session closed");

        Ok(Response::new(CloseSessionResponse { closed }))
    }
}

impl ExecutionServiceImpl {
    pub fn new(factory: HostFactory, idle_limit: Duration) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            factory,
            idle_limit,
        }
    }

    /// An empty id gets a one-shot host that is dropped with its run.
    fn session(&self, session_id: &str) -> Session {
        if session_id.is_empty() {
            return Session::new((self.factory)());
        }

        let session = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                tracing::info!(session_id = %session_id, "New session");
                Session::new((self.factory)())
            })
            .clone();
        session.touch();
        session
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Drops sessions with no run in flight that have been idle longer than
    /// the limit. Returns how many were dropped.
    pub fn evict_idle(&self) -> usize {
        let mut evicted = 0;
        self.sessions.retain(|session_id, session| {
            if session.in_use() || session.idle_for() < self.idle_limit {
                return true;
            }
            tracing::info!(session_id = %session_id, "Idle session evicted");
            evicted += 1;
            false
        });
        evicted
    }

    /// Evicts idle sessions periodically until the returned task is aborted.
    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        let service = self.clone();
        let period = REAP_INTERVAL
            .min(self.idle_limit)
            .max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let evicted = service.evict_idle();
                if evicted > 0 {
                    tracing::debug!(
                        evicted,
                        remaining = service.session_count(),
                        "Reaped idle sessions"
                    );
                }
            }
        })
    }
}

/// Forwards status changes while the run is in flight, then the verdict.
/// A closed stream drops the run, which tears its realm down.
async fn stream_run(
    session: Session,
    request: ExecutionRequest,
    stream_tx: Sender<Result<RunUpdate, Status>>,
) {
    let host = session.host.clone();
    let turn = tokio::select! {
        turn = host.turn() => turn,
        _ = stream_tx.closed() => {
            tracing::info!("Client disconnected while queued");
            return;
        }
    };

    let mut status_rx = host.subscribe();
    let run = turn.run(request);
    tokio::pin!(run);

    let result = loop {
        tokio::select! {
            result = &mut run => break Some(result),
            changed = status_rx.changed() => {
                changed.expect(STATUS_RX_ERR);
                let status = *status_rx.borrow_and_update();
                if status == EngineStatus::Idle {
                    continue;
                }
                if stream_tx.send(Ok(RunUpdate::status(status.into()))).await.is_err() {
                    break None;
                }
            }
            _ = stream_tx.closed() => break None,
        }
    };
    session.touch();

    match result {
        Some(result) => {
            tracing::debug!("Send result: success={}", result.success);
            if stream_tx.send(Ok(RunUpdate::result(result.into()))).await.is_err() {
                tracing::info!("Client went away before the result was delivered");
            }
        }
        None => tracing::info!("Client disconnected, run dropped"),
    }
}
