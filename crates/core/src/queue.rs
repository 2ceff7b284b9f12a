use crate::error::IngestError;
use crate::models::IngestJob;
use crate::traits::{JobDisposition, JobQueue};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exponent)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub job: IngestJob,
    pub reason: String,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<(IngestJob, Instant)>,
    in_flight: HashMap<Uuid, IngestJob>,
    dead_letters: Vec<DeadLetter>,
}

impl QueueState {
    fn take_available(&mut self, now: Instant) -> Option<IngestJob> {
        let position = self
            .pending
            .iter()
            .position(|(_, available_at)| *available_at <= now)?;
        let (job, _) = self.pending.remove(position)?;
        self.in_flight.insert(job.id, job.clone());
        Some(job)
    }

    fn next_available_at(&self) -> Option<Instant> {
        self.pending.iter().map(|(_, at)| *at).min()
    }
}

/// At-least-once queue living in the worker process. Claimed jobs stay
/// visible as in-flight until acknowledged; retryable failures are
/// redelivered with exponential backoff.
#[derive(Debug, Default)]
pub struct MemoryJobQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    policy: RetryPolicy,
}

impl MemoryJobQueue {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            policy,
        }
    }

    pub async fn in_flight(&self) -> Vec<IngestJob> {
        self.state.lock().await.in_flight.values().cloned().collect()
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().await.dead_letters.clone()
    }

    async fn push(&self, job: IngestJob, available_at: Instant) {
        self.state.lock().await.pending.push_back((job, available_at));
        self.notify.notify_one();
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, document_id: &str) -> Result<IngestJob, IngestError> {
        if document_id.trim().is_empty() {
            return Err(IngestError::InvalidArgument(
                "ingestion job needs a document id".to_string(),
            ));
        }

        let job = IngestJob::new(document_id);
        self.push(job.clone(), Instant::now()).await;
        info!(job_id = %job.id, document_id, "enqueued ingestion job");
        Ok(job)
    }

    async fn claim(&self, wait: Duration) -> Result<Option<IngestJob>, IngestError> {
        let deadline = Instant::now() + wait;

        loop {
            let notified = self.notify.notified();
            let wake_at = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                if let Some(job) = state.take_available(now) {
                    return Ok(Some(job));
                }
                if now >= deadline {
                    return Ok(None);
                }
                state
                    .next_available_at()
                    .map_or(deadline, |at| at.min(deadline))
            };

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn complete(&self, job: &IngestJob) -> Result<(), IngestError> {
        let removed = self.state.lock().await.in_flight.remove(&job.id);
        match removed {
            Some(_) => Ok(()),
            None => Err(IngestError::Queue(format!("job {} is not in flight", job.id))),
        }
    }

    async fn fail(
        &self,
        job: &IngestJob,
        error: &IngestError,
    ) -> Result<JobDisposition, IngestError> {
        let mut state = self.state.lock().await;
        let Some(claimed) = state.in_flight.remove(&job.id) else {
            return Err(IngestError::Queue(format!("job {} is not in flight", job.id)));
        };

        if !error.is_retryable() || claimed.attempt >= self.policy.max_attempts {
            warn!(
                job_id = %claimed.id,
                document_id = %claimed.document_id,
                attempt = claimed.attempt,
                %error,
                "ingestion job dead-lettered"
            );
            state.dead_letters.push(DeadLetter {
                job: claimed,
                reason: error.to_string(),
            });
            return Ok(JobDisposition::DeadLettered);
        }

        let delay = self.policy.delay_for(claimed.attempt);
        let retry = IngestJob {
            attempt: claimed.attempt + 1,
            ..claimed
        };
        let attempt = retry.attempt;
        state.pending.push_back((retry, Instant::now() + delay));
        drop(state);
        self.notify.notify_one();

        Ok(JobDisposition::Retrying { attempt, delay })
    }

    async fn outstanding(&self) -> usize {
        let state = self.state.lock().await;
        state.pending.len() + state.in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackendError;

    fn instant_retries(max_attempts: u32) -> MemoryJobQueue {
        MemoryJobQueue::new(RetryPolicy {
            max_attempts,
            base_delay: Duration::ZERO,
        })
    }

    #[tokio::test]
    async fn claimed_job_is_in_flight_until_completed() {
        let queue = instant_retries(3);
        let job = queue.enqueue("doc-1").await.expect("enqueue");

        let claimed = queue
            .claim(Duration::ZERO)
            .await
            .expect("claim")
            .expect("job available");
        assert_eq!(claimed.id, job.id);
        assert_eq!(queue.in_flight().await.len(), 1);
        assert_eq!(queue.outstanding().await, 1);
        assert!(queue.claim(Duration::ZERO).await.expect("claim").is_none());

        queue.complete(&claimed).await.expect("complete");
        assert_eq!(queue.outstanding().await, 0);
    }

    #[tokio::test]
    async fn jobs_are_claimed_in_fifo_order() {
        let queue = instant_retries(3);
        for id in ["a", "b", "c"] {
            queue.enqueue(id).await.expect("enqueue");
        }

        let mut order = Vec::new();
        while let Some(job) = queue.claim(Duration::ZERO).await.expect("claim") {
            order.push(job.document_id.clone());
            queue.complete(&job).await.expect("complete");
        }
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn transient_failures_are_redelivered_until_attempts_run_out() {
        let queue = instant_retries(2);
        queue.enqueue("doc-1").await.expect("enqueue");
        let transient = IngestError::Embedding(BackendError::Request("timeout".to_string()));

        let first = queue.claim(Duration::ZERO).await.expect("claim").expect("job");
        let disposition = queue.fail(&first, &transient).await.expect("fail");
        assert_eq!(
            disposition,
            JobDisposition::Retrying {
                attempt: 2,
                delay: Duration::ZERO
            }
        );

        let second = queue.claim(Duration::ZERO).await.expect("claim").expect("redelivered");
        assert_eq!(second.document_id, "doc-1");
        assert_eq!(second.attempt, 2);
        assert_eq!(
            queue.fail(&second, &transient).await.expect("fail"),
            JobDisposition::DeadLettered
        );
        assert_eq!(queue.dead_letters().await.len(), 1);
        assert_eq!(queue.outstanding().await, 0);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let queue = instant_retries(5);
        queue.enqueue("doc-1").await.expect("enqueue");
        let job = queue.claim(Duration::ZERO).await.expect("claim").expect("job");

        let disposition = queue
            .fail(&job, &IngestError::NotFound("doc-1".to_string()))
            .await
            .expect("fail");

        assert_eq!(disposition, JobDisposition::DeadLettered);
        assert!(queue.claim(Duration::ZERO).await.expect("claim").is_none());
    }

    #[tokio::test]
    async fn claim_waits_for_a_new_job() {
        let queue = std::sync::Arc::new(instant_retries(1));
        let producer = queue.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.enqueue("late").await.expect("enqueue");
        });

        let job = queue
            .claim(Duration::from_secs(5))
            .await
            .expect("claim")
            .expect("job arrives while waiting");
        assert_eq!(job.document_id, "late");
        handle.await.expect("producer finished");
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
    }
}
