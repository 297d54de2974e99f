use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};
use std::time::Duration;

use crate::core::{
    domain::Language,
    harness::{Job, Progress, Transcript, WorkerEvent},
    traits::{
        realm::{Realm, RealmFault},
        runner::{CompileError, ProvisionError, Runner},
    },
};

/// Counters shared between a stub runner and the realms it hands out.
#[derive(Debug, Default)]
pub struct StubStats {
    pub provisioned: AtomicUsize,
    pub recycled: AtomicUsize,
    pub terminated: AtomicUsize,
    pub jobs: std::sync::Mutex<Vec<Job>>,
}

impl StubStats {
    pub fn provisioned(&self) -> usize {
        self.provisioned.load(Ordering::SeqCst)
    }

    pub fn recycled(&self) -> usize {
        self.recycled.load(Ordering::SeqCst)
    }

    pub fn terminated(&self) -> usize {
        self.terminated.load(Ordering::SeqCst)
    }
}

/// Replays a fixed list of worker events, sleeping `delay` before each one.
#[derive(Debug, Clone)]
pub struct RunnerStub {
    language: Language,
    events: Vec<WorkerEvent>,
    delay: Duration,
    compile_error: Option<CompileError>,
    provision_failures: Arc<AtomicUsize>,
    warm: Arc<AtomicBool>,
    stats: Arc<StubStats>,
}

impl RunnerStub {
    pub fn new(language: Language, events: Vec<WorkerEvent>, delay: Duration) -> Self {
        Self {
            language,
            events,
            delay,
            compile_error: None,
            provision_failures: Arc::new(AtomicUsize::new(0)),
            warm: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(StubStats::default()),
        }
    }

    pub fn with_compile_error(self, error: CompileError) -> Self {
        Self {
            compile_error: Some(error),
            ..self
        }
    }

    /// The next `count` provisioning attempts fail.
    pub fn with_provision_failures(self, count: usize) -> Self {
        self.provision_failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn stats(&self) -> Arc<StubStats> {
        self.stats.clone()
    }
}

#[async_trait::async_trait]
impl Runner for RunnerStub {
    fn language(&self) -> Language {
        self.language
    }

    fn prepare(&self, source: &str) -> Result<String, CompileError> {
        match &self.compile_error {
            Some(error) => Err(error.clone()),
            None => Ok(source.to_string()),
        }
    }

    fn is_warm(&self) -> bool {
        self.warm.load(Ordering::SeqCst)
    }

    #[tracing::instrument(skip(self))]
    async fn provision(&self) -> Result<Box<dyn Realm>, ProvisionError> {
        tokio::time::sleep(self.delay).await;

        let failures = self.provision_failures.load(Ordering::SeqCst);
        if failures > 0 {
            self.provision_failures.store(failures - 1, Ordering::SeqCst);
            return Err(ProvisionError::Bootstrap {
                msg: "stubbed provisioning failure".to_string(),
            });
        }

        self.stats.provisioned.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(RealmStub {
            events: self.events.clone(),
            delay: self.delay,
            warm: self.warm.clone(),
            stats: self.stats.clone(),
        }))
    }
}

#[derive(Debug)]
struct RealmStub {
    events: Vec<WorkerEvent>,
    delay: Duration,
    warm: Arc<AtomicBool>,
    stats: Arc<StubStats>,
}

#[async_trait::async_trait]
impl Realm for RealmStub {
    async fn execute(&mut self, job: &Job, transcript: &mut Transcript) -> Result<(), RealmFault> {
        if let Ok(mut jobs) = self.stats.jobs.lock() {
            jobs.push(job.clone());
        }

        for event in self.events.iter().cloned() {
            tokio::time::sleep(self.delay).await;
            tracing::debug!("Stub event: {:?}", event);
            if transcript.apply(event) == Progress::Done {
                return Ok(());
            }
        }

        Err(RealmFault::Exited {
            detail: "stub ran out of events".to_string(),
        })
    }

    async fn recycle(&mut self) {
        self.warm.store(true, Ordering::SeqCst);
        self.stats.recycled.fetch_add(1, Ordering::SeqCst);
    }

    async fn terminate(&mut self) {
        self.warm.store(false, Ordering::SeqCst);
        self.stats.terminated.fetch_add(1, Ordering::SeqCst);
    }
}
