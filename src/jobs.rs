//! Background job correlation

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{timeout, Instant};
use tracing::{debug, trace, warn};

use crate::{
    command::CommandOutcome,
    constants::{MAX_RETIRED_JOB_RESULTS, MAX_TRACKED_JOBS, MAX_UNCLAIMED_JOB_RESULTS},
    error::{EslError, EslResult},
    protocol::EslMessage,
    stream::{DisconnectReason, MessageStream},
};

type JobDelivery = Result<CommandOutcome, DisconnectReason>;

enum JobSlot {
    Pending {
        issued_at: Instant,
        waiters: Vec<oneshot::Sender<JobDelivery>>,
    },
    Completed {
        outcome: CommandOutcome,
        completed_at: Instant,
    },
}

impl JobSlot {
    fn completed(outcome: CommandOutcome) -> Self {
        JobSlot::Completed {
            outcome,
            completed_at: Instant::now(),
        }
    }

    /// Age for eviction, or `None` while someone is still waiting.
    fn evictable_since(&self) -> Option<Instant> {
        match self {
            JobSlot::Completed { completed_at, .. } => Some(*completed_at),
            JobSlot::Pending { issued_at, waiters } => waiters
                .iter()
                .all(|w| w.is_closed())
                .then_some(*issued_at),
        }
    }
}

#[derive(Default)]
struct JobTable {
    jobs: HashMap<String, JobSlot>,
    /// Results for ids nobody tracked, oldest first.
    unclaimed: VecDeque<(String, CommandOutcome)>,
    /// Results already collected, oldest first.
    retired: VecDeque<(String, CommandOutcome)>,
    closed: Option<DisconnectReason>,
}

impl JobTable {
    fn take_unclaimed(&mut self, job_id: &str) -> Option<CommandOutcome> {
        let index = self
            .unclaimed
            .iter()
            .position(|(id, _)| id == job_id)?;
        self.unclaimed
            .remove(index)
            .map(|(_, outcome)| outcome)
    }

    fn retired(&self, job_id: &str) -> Option<&CommandOutcome> {
        self.retired
            .iter()
            .find(|(id, _)| id == job_id)
            .map(|(_, outcome)| outcome)
    }

    fn retire(&mut self, job_id: String, outcome: CommandOutcome) {
        self.retired
            .push_back((job_id, outcome));
        if self
            .retired
            .len()
            > MAX_RETIRED_JOB_RESULTS
        {
            self.retired
                .pop_front();
        }
    }

    /// Drop the oldest collected or abandoned jobs once the table is over
    /// its limit. Completed results move to the retired list.
    fn evict_stale(&mut self) {
        let excess = self
            .jobs
            .len()
            .saturating_sub(MAX_TRACKED_JOBS);
        if excess == 0 {
            return;
        }
        let mut candidates: Vec<(Instant, String)> = self
            .jobs
            .iter()
            .filter_map(|(id, slot)| {
                slot.evictable_since()
                    .map(|since| (since, id.clone()))
            })
            .collect();
        candidates.sort();

        let mut evicted = 0;
        for (_, job_id) in candidates
            .into_iter()
            .take(excess)
        {
            if let Some(JobSlot::Completed { outcome, .. }) = self
                .jobs
                .remove(&job_id)
            {
                self.retire(job_id, outcome);
            }
            evicted += 1;
        }
        if evicted > 0 {
            debug!("Evicted {} stale jobs over the limit of {}", evicted, MAX_TRACKED_JOBS);
        }
    }
}

/// Correlates `bgapi` job ids with their `BACKGROUND_JOB` results.
///
/// Each id completes at most once; later results for the same id are logged
/// and dropped. A result may arrive before anyone waits for it.
#[derive(Default)]
pub struct JobRegistry {
    table: Mutex<JobTable>,
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.lock();
        f.debug_struct("JobRegistry")
            .field(
                "jobs",
                &table
                    .jobs
                    .len(),
            )
            .field(
                "unclaimed",
                &table
                    .unclaimed
                    .len(),
            )
            .finish()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry fed by every `BACKGROUND_JOB` event on `stream`.
    ///
    /// Must be called inside a tokio runtime.
    pub fn attach(stream: &MessageStream) -> Arc<Self> {
        let registry = Arc::new(Self::new());
        let feed = stream.every_matching(EslMessage::is_background_job);
        tokio::spawn(Self::consume(Arc::downgrade(&registry), feed));
        registry
    }

    async fn consume(registry: Weak<Self>, mut feed: crate::stream::MessageFeed) {
        while let Some(item) = feed
            .recv()
            .await
        {
            let Some(registry) = registry.upgrade() else {
                return;
            };
            match item {
                Ok(message) => registry.complete(&message),
                Err(e) => {
                    let reason = match e {
                        EslError::StreamClosed { reason } => reason,
                        other => DisconnectReason::IoError(other.to_string()),
                    };
                    registry.fail_all(reason);
                    return;
                }
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, JobTable> {
        self.table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start tracking `job_id`. A result that already arrived is kept.
    ///
    /// Ids whose result was already collected are not tracked again.
    pub fn track(&self, job_id: &str) {
        let mut table = self.lock();
        if table
            .jobs
            .contains_key(job_id)
            || table
                .retired(job_id)
                .is_some()
        {
            return;
        }
        let slot = match table.take_unclaimed(job_id) {
            Some(outcome) => JobSlot::completed(outcome),
            None => JobSlot::Pending {
                issued_at: Instant::now(),
                waiters: Vec::new(),
            },
        };
        table
            .jobs
            .insert(job_id.to_string(), slot);
        table.evict_stale();
        trace!("Tracking job {}", job_id);
    }

    /// Stop tracking `job_id`. A completed result is retired: later waits on
    /// the same id get it back at once.
    pub fn forget(&self, job_id: &str) {
        let mut table = self.lock();
        if let Some(JobSlot::Completed { outcome, .. }) = table
            .jobs
            .remove(job_id)
        {
            table.retire(job_id.to_string(), outcome);
        }
        if let Some(outcome) = table.take_unclaimed(job_id) {
            table.retire(job_id.to_string(), outcome);
        }
    }

    /// Move tracking from `from` to `to`, keeping waiters and any result.
    pub(crate) fn rekey(&self, from: &str, to: &str) {
        let mut table = self.lock();
        let Some(slot) = table
            .jobs
            .remove(from)
        else {
            return;
        };
        let slot = match (slot, table.take_unclaimed(to)) {
            (JobSlot::Pending { waiters, .. }, Some(outcome)) => {
                for waiter in waiters {
                    let _ = waiter.send(Ok(outcome.clone()));
                }
                JobSlot::completed(outcome)
            }
            (slot, _) => slot,
        };
        table
            .jobs
            .insert(to.to_string(), slot);
    }

    #[cfg(test)]
    fn tracked_count(&self) -> usize {
        self.lock()
            .jobs
            .len()
    }

    /// Number of tracked jobs still waiting for their result.
    pub fn pending_count(&self) -> usize {
        self.lock()
            .jobs
            .values()
            .filter(|slot| matches!(slot, JobSlot::Pending { .. }))
            .count()
    }

    /// Record a `BACKGROUND_JOB` result.
    pub(crate) fn complete(&self, message: &EslMessage) {
        let Some(job_id) = message.job_uuid() else {
            warn!("BACKGROUND_JOB event without Job-UUID, ignoring");
            return;
        };
        let outcome = message.outcome();
        let mut guard = self.lock();
        let table = &mut *guard;

        match table
            .jobs
            .get_mut(job_id)
        {
            Some(JobSlot::Completed { .. }) => {
                warn!("Duplicate result for job {}, ignoring", job_id);
            }
            Some(slot) => {
                let previous = std::mem::replace(slot, JobSlot::completed(outcome.clone()));
                if let JobSlot::Pending { issued_at, waiters } = previous {
                    debug!(
                        "Job {} completed after {}ms: {}",
                        job_id,
                        issued_at
                            .elapsed()
                            .as_millis(),
                        outcome.text()
                    );
                    for waiter in waiters {
                        let _ = waiter.send(Ok(outcome.clone()));
                    }
                }
            }
            None => {
                if table
                    .unclaimed
                    .iter()
                    .any(|(id, _)| id == job_id)
                    || table
                        .retired(job_id)
                        .is_some()
                {
                    warn!("Duplicate result for job {}, ignoring", job_id);
                    return;
                }
                trace!("Holding result for untracked job {}", job_id);
                table
                    .unclaimed
                    .push_back((job_id.to_string(), outcome));
                if table
                    .unclaimed
                    .len()
                    > MAX_UNCLAIMED_JOB_RESULTS
                {
                    table
                        .unclaimed
                        .pop_front();
                }
            }
        }
    }

    /// Fail every pending wait; later waits on unfinished jobs fail at once.
    pub(crate) fn fail_all(&self, reason: DisconnectReason) {
        let mut table = self.lock();
        if table
            .closed
            .is_some()
        {
            return;
        }
        table.closed = Some(reason.clone());
        let mut failed = 0;
        for slot in table
            .jobs
            .values_mut()
        {
            if let JobSlot::Pending { waiters, .. } = slot {
                for waiter in waiters.drain(..) {
                    let _ = waiter.send(Err(reason.clone()));
                    failed += 1;
                }
            }
        }
        if failed > 0 {
            debug!("Failed {} job waits: {}", failed, reason);
        }
    }

    /// Wait for the result of `job_id`, without a deadline.
    ///
    /// Unknown ids are tracked from this point on. An id whose result was
    /// already collected resolves at once with that result.
    pub fn wait(&self, job_id: &str) -> JobWait {
        let (tx, rx) = oneshot::channel();
        let mut table = self.lock();

        if let Some(outcome) = table.take_unclaimed(job_id) {
            let _ = tx.send(Ok(outcome.clone()));
            table
                .jobs
                .insert(job_id.to_string(), JobSlot::completed(outcome));
            table.evict_stale();
            return JobWait { rx };
        }
        if !table
            .jobs
            .contains_key(job_id)
        {
            if let Some(outcome) = table.retired(job_id) {
                trace!("Job {} already collected, answering again", job_id);
                let _ = tx.send(Ok(outcome.clone()));
                return JobWait { rx };
            }
        }

        let closed = table
            .closed
            .clone();
        let slot = table
            .jobs
            .entry(job_id.to_string())
            .or_insert_with(|| JobSlot::Pending {
                issued_at: Instant::now(),
                waiters: Vec::new(),
            });
        match (slot, closed) {
            (JobSlot::Completed { outcome, .. }, _) => {
                let _ = tx.send(Ok(outcome.clone()));
            }
            (JobSlot::Pending { .. }, Some(reason)) => {
                let _ = tx.send(Err(reason));
            }
            (JobSlot::Pending { waiters, .. }, None) => {
                waiters.retain(|w| !w.is_closed());
                waiters.push(tx);
            }
        }
        table.evict_stale();
        JobWait { rx }
    }

    /// Wait up to `limit` for the result of `job_id`.
    ///
    /// The job is forgotten once its result has been returned. On timeout it
    /// stays tracked, so a later call can still collect the result, until the
    /// table outgrows [`MAX_TRACKED_JOBS`]; an evicted job's late result is
    /// then held like any untracked one.
    pub async fn await_job(&self, job_id: &str, limit: Duration) -> EslResult<CommandOutcome> {
        let result = match timeout(limit, self.wait(job_id)).await {
            Ok(result) => result,
            Err(_) => {
                debug!("Job {} still pending after {}ms", job_id, limit.as_millis());
                return Err(EslError::Timeout {
                    timeout_ms: limit.as_millis() as u64,
                });
            }
        };
        if result.is_ok() {
            self.forget(job_id);
        }
        result
    }
}

/// Pending result of one background job, created by [`JobRegistry::wait`].
#[must_use = "a job wait does nothing unless awaited"]
#[derive(Debug)]
pub struct JobWait {
    rx: oneshot::Receiver<JobDelivery>,
}

impl Future for JobWait {
    type Output = EslResult<CommandOutcome>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let delivery = ready!(Pin::new(&mut self.rx).poll(cx));
        Poll::Ready(match delivery {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(reason)) => Err(EslError::StreamClosed { reason }),
            // Slot removed by forget() while waiting
            Err(_) => Err(EslError::StreamClosed {
                reason: DisconnectReason::ClientRequested,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_result(job_id: &str, body: &str) -> EslMessage {
        EslMessage::event(
            [("Event-Name", "BACKGROUND_JOB"), ("Job-UUID", job_id)],
            Some(body.to_string()),
        )
    }

    #[tokio::test]
    async fn test_result_before_wait_is_retained() {
        let registry = JobRegistry::new();
        registry.track("job-1");
        registry.complete(&job_result("job-1", "+OK done\n"));

        let outcome = registry
            .await_job("job-1", Duration::from_secs(1))
            .await
            .unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.text(), "+OK done");
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_interleaved_jobs_resolve_independently() {
        let registry = Arc::new(JobRegistry::new());
        registry.track("a");
        registry.track("b");

        let wait_a = registry.wait("a");
        let wait_b = registry.wait("b");

        registry.complete(&job_result("b", "-ERR USER_BUSY\n"));
        registry.complete(&job_result("a", "+OK a-call\n"));

        let a = wait_a
            .await
            .unwrap();
        let b = wait_b
            .await
            .unwrap();
        assert_eq!(a.text(), "+OK a-call");
        assert_eq!(b.error_message(), Some("USER_BUSY"));
    }

    #[tokio::test]
    async fn test_untracked_result_collected_later() {
        let registry = JobRegistry::new();
        registry.complete(&job_result("foreign", "+OK\n"));

        let outcome = registry
            .await_job("foreign", Duration::from_secs(1))
            .await
            .unwrap();
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn test_duplicate_result_ignored() {
        let registry = JobRegistry::new();
        registry.track("job");
        registry.complete(&job_result("job", "+OK first\n"));
        registry.complete(&job_result("job", "-ERR second\n"));

        let outcome = registry
            .wait("job")
            .await
            .unwrap();
        assert_eq!(outcome.text(), "+OK first");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unclaimed_buffer_is_bounded() {
        let registry = JobRegistry::new();
        for i in 0..=MAX_UNCLAIMED_JOB_RESULTS {
            registry.complete(&job_result(&format!("job-{}", i), "+OK\n"));
        }

        let oldest = registry
            .await_job("job-0", Duration::from_millis(100))
            .await;
        assert!(matches!(oldest, Err(EslError::Timeout { .. })));

        let newest = registry
            .await_job(
                &format!("job-{}", MAX_UNCLAIMED_JOB_RESULTS),
                Duration::from_millis(100),
            )
            .await;
        assert!(newest.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_job_times_out_and_keeps_tracking() {
        let registry = JobRegistry::new();
        registry.track("slow");

        let started = Instant::now();
        let err = registry
            .await_job("slow", Duration::from_millis(1500))
            .await
            .unwrap_err();
        assert!(matches!(err, EslError::Timeout { timeout_ms: 1500 }));
        assert!(started.elapsed() >= Duration::from_millis(1500));
        assert_eq!(registry.pending_count(), 1);

        registry.complete(&job_result("slow", "+OK late\n"));
        let outcome = registry
            .await_job("slow", Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(outcome.text(), "+OK late");
    }

    #[tokio::test]
    async fn test_fail_all_wakes_pending_waits() {
        let registry = JobRegistry::new();
        registry.track("done");
        registry.complete(&job_result("done", "+OK\n"));
        let pending = registry.wait("pending");

        registry.fail_all(DisconnectReason::ConnectionClosed);

        assert!(matches!(
            pending.await,
            Err(EslError::StreamClosed {
                reason: DisconnectReason::ConnectionClosed
            })
        ));
        assert!(registry
            .wait("never")
            .await
            .is_err());
        assert!(registry
            .wait("done")
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_rekey_keeps_waiters() {
        let registry = JobRegistry::new();
        registry.track("ours");
        let wait = registry.wait("ours");
        registry.rekey("ours", "theirs");
        registry.complete(&job_result("theirs", "+OK\n"));
        assert!(wait
            .await
            .unwrap()
            .is_success());
    }

    #[tokio::test]
    async fn test_attached_registry_follows_stream() {
        let stream = MessageStream::new();
        let registry = JobRegistry::attach(&stream);
        registry.track("job-9");

        stream.publish(EslMessage::event(
            [("Event-Name", "CHANNEL_ANSWER"), ("Job-UUID", "job-9")],
            None,
        ));
        stream.publish(job_result("job-9", "-ERR NO_ROUTE_DESTINATION\n"));

        let outcome = registry
            .await_job("job-9", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(outcome.error_message(), Some("NO_ROUTE_DESTINATION"));

        let pending = registry.wait("job-10");
        stream.close(DisconnectReason::ServerNotice);
        assert!(matches!(
            pending.await,
            Err(EslError::StreamClosed {
                reason: DisconnectReason::ServerNotice
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_jobs_do_not_accumulate() {
        let registry = JobRegistry::new();
        for i in 0..MAX_TRACKED_JOBS + 100 {
            let job_id = format!("job-{}", i);
            registry.track(&job_id);
            let err = registry
                .await_job(&job_id, Duration::from_millis(1))
                .await
                .unwrap_err();
            assert!(err.is_timeout());
        }
        assert!(registry.tracked_count() <= MAX_TRACKED_JOBS);

        // An evicted job's late result is still collectable.
        registry.complete(&job_result("job-0", "+OK late\n"));
        let outcome = registry
            .await_job("job-0", Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(outcome.text(), "+OK late");
    }

    #[tokio::test]
    async fn test_uncollected_results_do_not_accumulate() {
        let registry = JobRegistry::new();
        registry.track("awaited");
        let wait = registry.wait("awaited");

        for i in 0..MAX_TRACKED_JOBS + 10 {
            let job_id = format!("fire-and-forget-{}", i);
            registry.track(&job_id);
            registry.complete(&job_result(&job_id, "+OK\n"));
        }
        assert!(registry.tracked_count() <= MAX_TRACKED_JOBS);

        registry.complete(&job_result("awaited", "+OK kept\n"));
        assert_eq!(
            wait.await
                .unwrap()
                .text(),
            "+OK kept"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_collected_job_is_not_tracked_again() {
        let registry = JobRegistry::new();
        registry.track("job");
        registry.complete(&job_result("job", "-ERR NO_ANSWER\n"));
        registry
            .await_job("job", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(registry.tracked_count(), 0);

        let started = Instant::now();
        let again = registry
            .await_job("job", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(again.error_message(), Some("NO_ANSWER"));
        assert_eq!(started.elapsed(), Duration::ZERO);

        registry.track("job");
        registry.complete(&job_result("job", "+OK duplicate\n"));
        assert_eq!(registry.tracked_count(), 0);
        assert_eq!(registry.pending_count(), 0);
    }
}
