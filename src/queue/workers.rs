// Task stream consumer
//
// One delivery in flight per consumer: read one entry, report "processing",
// run the agent, report the outcome, then acknowledge. A crash anywhere before
// the ack leaves the entry pending, and it is delivered again either to this
// consumer on restart (same consumer name) or to another one via reclaim.
// While an entry is being processed its idle time is reset periodically, so
// reclaim only picks up deliveries whose consumer is really gone.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use redis::aio::ConnectionManager;
use redis::streams::{
    StreamAutoClaimOptions, StreamAutoClaimReply, StreamClaimOptions, StreamId, StreamReadOptions, StreamReadReply,
};
use redis::AsyncCommands;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::sink::UpdateSink;
use super::{connect, declare_group, TaskEnvelope};
use crate::agents::AgentRunner;
use crate::config::BrokerConfig;
use crate::tasks::executor::run_agent;
use crate::tasks::TaskUpdate;
use crate::types::{AppError, AppResult};
use crate::utils::backoff_delay;

const READ_BLOCK_MS: usize = 5_000;
const MIN_CLAIM_REFRESH: Duration = Duration::from_secs(1);

/// Deliver one envelope's status sequence: processing, then completed or failed.
///
/// Errors when the sink refuses an update, in which case the delivery must not
/// be acknowledged.
pub async fn process_envelope(
    envelope: &TaskEnvelope,
    runner: &dyn AgentRunner,
    sink: &dyn UpdateSink,
    timeout: Option<Duration>,
) -> AppResult<()> {
    let job = envelope.job();
    info!(task_id = %job.task_id, priority = %job.priority, "Processing research task");

    sink.deliver(TaskUpdate::Processing { task_id: job.task_id }).await?;
    let outcome = run_agent(runner, &job, timeout).await;
    match &outcome {
        TaskUpdate::Failed { error, .. } => warn!(task_id = %job.task_id, error = %error, "Research task failed"),
        _ => info!(task_id = %job.task_id, "Research task completed"),
    }
    sink.deliver(outcome).await
}

/// How often a consumer resets the idle time of the entry it is working on.
/// A third of the reclaim threshold leaves room for two missed refreshes.
pub fn claim_refresh_period(reclaim_idle: Duration) -> Duration {
    (reclaim_idle / 3).max(MIN_CLAIM_REFRESH)
}

/// Drive `work` to completion, calling `refresh` every `period` while it runs
async fn with_claim_refresh<W, R, Fut>(work: W, period: Duration, mut refresh: R) -> W::Output
where
    W: Future,
    R: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    tokio::pin!(work);
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            done = &mut work => return done,
            _ = ticker.tick() => refresh().await,
        }
    }
}

/// Whether a consumer with this retry limit stops after `failures` consecutive errors
fn gives_up(limit: Option<u32>, failures: u32) -> bool {
    limit.is_some_and(|max| failures > max)
}

/// Shared flag that is true while a consumer loop is able to take deliveries
#[derive(Clone, Debug)]
pub struct ConsumerLiveness(Arc<AtomicBool>);

impl Default for ConsumerLiveness {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsumerLiveness {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    /// A consumer that never started
    pub fn dead() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn is_alive(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn mark_dead(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

pub struct TaskConsumer {
    conn: ConnectionManager,
    config: BrokerConfig,
    stream: String,
    runner: Arc<dyn AgentRunner>,
    sink: Arc<dyn UpdateSink>,
    timeout: Option<Duration>,
    retry_limit: Option<u32>,
    liveness: ConsumerLiveness,
}

impl TaskConsumer {
    pub async fn connect(
        config: &BrokerConfig,
        runner: Arc<dyn AgentRunner>,
        sink: Arc<dyn UpdateSink>,
        timeout: Option<Duration>,
    ) -> AppResult<Self> {
        let mut conn = connect(config).await?;
        let stream = config.task_stream();
        declare_group(&mut conn, &stream, &config.research_queue).await?;

        info!(stream = %stream, consumer = %config.consumer_name, "Task consumer connected");
        Ok(Self {
            conn,
            config: config.clone(),
            stream,
            runner,
            sink,
            timeout,
            retry_limit: Some(config.max_retries),
            liveness: ConsumerLiveness::new(),
        })
    }

    /// Consecutive broker errors tolerated before `run` gives up; `None` never gives up
    pub fn with_retry_limit(mut self, limit: Option<u32>) -> Self {
        self.retry_limit = limit;
        self
    }

    /// Flag to flip to false once this consumer stops for any reason
    pub fn with_liveness(mut self, liveness: ConsumerLiveness) -> Self {
        self.liveness = liveness;
        self
    }

    fn group(&self) -> &str {
        &self.config.research_queue
    }

    fn consumer(&self) -> &str {
        &self.config.consumer_name
    }

    /// Consume until `shutdown` flips to true. An in-flight task always runs to
    /// completion and is acknowledged before returning.
    ///
    /// Broker and sink errors put the loop back into recovery, which redelivers
    /// this consumer's pending entries once the broker answers again.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> AppResult<()> {
        info!(consumer = %self.consumer(), "Waiting for research tasks");

        let mut recovering = true;
        let mut failures: u32 = 0;
        let mut last_reclaim: Option<Instant> = None;

        while !*shutdown.borrow() {
            if recovering {
                match self.recover().await {
                    Ok(()) => {
                        recovering = false;
                        failures = 0;
                    }
                    Err(e) => {
                        failures += 1;
                        if !self.wait_before_retry(&e, failures, &mut shutdown).await {
                            break;
                        }
                        continue;
                    }
                }
            }

            if last_reclaim.map_or(true, |at| at.elapsed() >= self.config.reclaim_idle) {
                last_reclaim = Some(Instant::now());
                let handled = match self.reclaim_one().await {
                    Ok(Some(entry)) => Some(self.handle(entry).await),
                    Ok(None) => None,
                    Err(e) => {
                        warn!(error = %e, "Reclaiming stale deliveries failed");
                        None
                    }
                };
                match handled {
                    Some(Ok(())) => continue,
                    Some(Err(e)) => {
                        failures += 1;
                        recovering = true;
                        if !self.wait_before_retry(&e, failures, &mut shutdown).await {
                            break;
                        }
                        continue;
                    }
                    None => {}
                }
            }

            let next = tokio::select! {
                _ = shutdown.changed() => break,
                next = self.read(">") => next,
            };

            let result = match next {
                Ok(Some(entry)) => self.handle(entry).await,
                Ok(None) => Ok(()),
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => failures = 0,
                Err(e) => {
                    failures += 1;
                    recovering = true;
                    if !self.wait_before_retry(&e, failures, &mut shutdown).await {
                        break;
                    }
                }
            }
        }

        info!(consumer = %self.consumer(), "Task consumer stopped");
        Ok(())
    }

    /// Sleep with exponential backoff. Returns false when the retry budget is
    /// spent or shutdown was requested.
    async fn wait_before_retry(&self, e: &AppError, failures: u32, shutdown: &mut watch::Receiver<bool>) -> bool {
        if gives_up(self.retry_limit, failures) {
            error!(error = %e, failures, "Broker unreachable, giving up");
            return false;
        }
        let delay = backoff_delay(failures);
        warn!(error = %e, failures, retry_in_secs = delay.as_secs(), "Consumer error, recovering");
        tokio::select! {
            _ = shutdown.changed() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Re-declare the group and finish deliveries this consumer left pending
    async fn recover(&mut self) -> AppResult<()> {
        let stream = self.stream.clone();
        let group = self.group().to_string();
        declare_group(&mut self.conn, &stream, &group).await?;

        while let Some(entry) = self.read("0").await? {
            info!(entry_id = %entry.id, "Redelivering pending task");
            self.handle(entry).await?;
        }
        Ok(())
    }

    /// Read one entry for this consumer. `">"` means new deliveries, `"0"` this
    /// consumer's own unacknowledged ones.
    async fn read(&mut self, from: &str) -> AppResult<Option<StreamId>> {
        let mut options = StreamReadOptions::default()
            .group(self.group(), self.consumer())
            .count(1);
        if from == ">" {
            options = options.block(READ_BLOCK_MS);
        }

        let reply: Option<StreamReadReply> = self
            .conn
            .xread_options(&[self.stream.as_str()], &[from], &options)
            .await?;

        Ok(reply
            .and_then(|r| r.keys.into_iter().next())
            .and_then(|key| key.ids.into_iter().next()))
    }

    /// Take over one delivery that another consumer left idle for too long
    async fn reclaim_one(&mut self) -> AppResult<Option<StreamId>> {
        let min_idle_ms = self.config.reclaim_idle.as_millis() as usize;
        let reply: StreamAutoClaimReply = self
            .conn
            .xautoclaim_options(
                self.stream.as_str(),
                self.config.research_queue.as_str(),
                self.config.consumer_name.as_str(),
                min_idle_ms,
                "0-0",
                StreamAutoClaimOptions::default().count(1),
            )
            .await?;

        let entry = reply.claimed.into_iter().next();
        if let Some(entry) = &entry {
            info!(entry_id = %entry.id, "Reclaimed stale delivery");
        }
        Ok(entry)
    }

    /// Reset the idle time of an entry this consumer is still working on
    async fn refresh_claim(&self, entry_id: &str) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let claimed: Vec<String> = conn
            .xclaim_options(
                self.stream.as_str(),
                self.group(),
                self.consumer(),
                0,
                &[entry_id],
                StreamClaimOptions::default().with_justid(),
            )
            .await?;
        if claimed.is_empty() {
            warn!(entry_id, "Delivery no longer pending, cannot refresh ownership");
        } else {
            debug!(entry_id, "Refreshed delivery ownership");
        }
        Ok(())
    }

    async fn handle(&self, entry: StreamId) -> AppResult<()> {
        match TaskEnvelope::from_stream_entry(&entry) {
            Ok(envelope) => {
                let work = process_envelope(&envelope, self.runner.as_ref(), self.sink.as_ref(), self.timeout);
                let period = claim_refresh_period(self.config.reclaim_idle);
                let entry_id = entry.id.as_str();
                with_claim_refresh(work, period, move || async move {
                    if let Err(e) = self.refresh_claim(entry_id).await {
                        warn!(entry_id, error = %e, "Refreshing delivery ownership failed");
                    }
                })
                .await?;
            }
            Err(e) => {
                // Unparseable entries would be redelivered forever
                error!(entry_id = %entry.id, error = %e, "Dropping malformed task message");
            }
        }
        self.ack(&entry.id).await
    }

    async fn ack(&self, entry_id: &str) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let acked: usize = conn
            .xack(self.stream.as_str(), self.group(), &[entry_id])
            .await?;
        debug!(entry_id, acked, "Acknowledged delivery");
        Ok(())
    }
}

impl Drop for TaskConsumer {
    fn drop(&mut self) {
        self.liveness.mark_dead();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentOutput;
    use crate::queue::sink::testing::RecordingSink;
    use crate::queue::sink::LocalSink;
    use crate::tasks::{Priority, ResearchJob, TaskManager, TaskStatus, TaskStore};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use uuid::Uuid;

    /// Counts invocations so redelivery can be observed
    struct CountingAgent {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl AgentRunner for CountingAgent {
        async fn run(&self, job: &ResearchJob) -> AppResult<AgentOutput> {
            let n = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(AgentOutput { result: format!("run {} for {}", n, job.query), files_generated: vec![] })
        }
    }

    fn counting_agent() -> CountingAgent {
        CountingAgent { runs: AtomicUsize::new(0) }
    }

    fn envelope(task_id: Uuid) -> TaskEnvelope {
        TaskEnvelope::new(&ResearchJob {
            task_id,
            query: "What is the capital of France?".into(),
            priority: Priority::Normal,
            max_iterations: 10,
            include_sources: true,
            create_report: false,
        })
    }

    #[tokio::test]
    async fn test_update_sequence() {
        let agent = counting_agent();
        let sink = RecordingSink::default();
        let id = Uuid::new_v4();

        process_envelope(&envelope(id), &agent, &sink, None).await.unwrap();

        assert_eq!(sink.statuses().await, vec![TaskStatus::Processing, TaskStatus::Completed]);
        assert_eq!(sink.delivered.lock().await[0], TaskUpdate::Processing { task_id: id });
    }

    #[tokio::test]
    async fn test_refused_update_prevents_ack() {
        let agent = counting_agent();
        let sink = RecordingSink::failing();

        let result = process_envelope(&envelope(Uuid::new_v4()), &agent, &sink, None).await;
        assert!(matches!(result, Err(AppError::Transport(_))));
        assert_eq!(agent.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_redelivery_reaches_terminal_state() {
        let manager = TaskManager::new(TaskStore::new());
        let id = Uuid::new_v4();
        manager.create(id, "What is the capital of France?", Priority::Normal).await.unwrap();

        let agent = counting_agent();
        let sink = LocalSink::new(manager.clone(), None);

        // First delivery: the consumer dies after reporting "processing"
        sink.deliver(TaskUpdate::Processing { task_id: id }).await.unwrap();

        // Redelivery runs the whole sequence again
        process_envelope(&envelope(id), &agent, &sink, None).await.unwrap();

        let task = manager.get(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(agent.runs.load(Ordering::SeqCst), 1);
        assert!(task.result.unwrap().starts_with("run 1"));
    }

    #[test]
    fn test_claim_refresh_period() {
        assert_eq!(claim_refresh_period(Duration::from_secs(300)), Duration::from_secs(100));
        assert_eq!(claim_refresh_period(Duration::from_secs(2)), MIN_CLAIM_REFRESH);
        assert_eq!(claim_refresh_period(Duration::ZERO), MIN_CLAIM_REFRESH);
        assert!(claim_refresh_period(Duration::from_secs(300)) < Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_long_work_refreshes_claim() {
        let counter = AtomicUsize::new(0);
        let refreshes = &counter;
        let work = async {
            tokio::time::sleep(Duration::from_millis(250)).await;
            "done"
        };

        let output = with_claim_refresh(work, Duration::from_millis(40), move || async move {
            refreshes.fetch_add(1, Ordering::SeqCst);
        })
        .await;

        assert_eq!(output, "done");
        let n = refreshes.load(Ordering::SeqCst);
        assert!((3..=7).contains(&n), "expected about 6 refreshes, got {}", n);
    }

    #[tokio::test]
    async fn test_short_work_never_refreshes() {
        let counter = AtomicUsize::new(0);
        let refreshes = &counter;

        let output = with_claim_refresh(async { 7 }, Duration::from_secs(60), move || async move {
            refreshes.fetch_add(1, Ordering::SeqCst);
        })
        .await;

        assert_eq!(output, 7);
        assert_eq!(refreshes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_retry_limit() {
        assert!(!gives_up(Some(3), 3));
        assert!(gives_up(Some(3), 4));
        assert!(!gives_up(None, u32::MAX));
    }

    #[test]
    fn test_liveness_shared_between_clones() {
        let liveness = ConsumerLiveness::new();
        let seen_by_publisher = liveness.clone();
        assert!(seen_by_publisher.is_alive());

        liveness.mark_dead();
        assert!(!seen_by_publisher.is_alive());
        assert!(!ConsumerLiveness::dead().is_alive());
    }
}
