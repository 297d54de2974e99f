use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::core::{
    harness::{Job, Transcript},
    traits::{
        realm::{Realm, RealmFault},
        runner::{ProvisionError, Runner},
    },
};

#[derive(Debug, Clone)]
pub enum RunEnd {
    Completed,
    Crashed(RealmFault),
    TimedOut,
}

/// Requests a realm, retrying up to `retries` more times before giving up.
#[tracing::instrument(skip(runner, attempts), fields(language = %runner.language()))]
pub async fn provision_with_retry(
    runner: &dyn Runner,
    retries: u32,
    attempts: &AtomicU64,
) -> Result<Box<dyn Realm>, ProvisionError> {
    let mut attempt = 0;
    loop {
        attempts.fetch_add(1, Ordering::SeqCst);
        match runner.provision().await {
            Ok(realm) => return Ok(realm),
            Err(e) if attempt < retries => {
                attempt += 1;
                tracing::warn!("Provisioning failed, retrying ({}/{}): {}", attempt, retries, e);
            }
            Err(e) => {
                tracing::error!("Provisioning failed: {}", e);
                return Err(e);
            }
        }
    }
}

/// Races the realm against `deadline`. Learner code has no yield points, so
/// expiry terminates the realm instead of asking it to stop.
#[tracing::instrument(skip_all, fields(deadline_ms = deadline.as_millis() as u64))]
pub async fn execute_with_deadline(
    mut realm: Box<dyn Realm>,
    job: &Job,
    transcript: &mut Transcript,
    deadline: Duration,
) -> RunEnd {
    let outcome = tokio::time::timeout(deadline, realm.execute(job, transcript)).await;

    match outcome {
        Ok(Ok(())) => {
            realm.recycle().await;
            RunEnd::Completed
        }
        Ok(Err(fault)) => {
            tracing::warn!("Realm crashed: {}", fault);
            realm.terminate().await;
            RunEnd::Crashed(fault)
        }
        Err(_) => {
            tracing::info!("Deadline exceeded, terminating realm");
            realm.terminate().await;
            RunEnd::TimedOut
        }
    }
}
