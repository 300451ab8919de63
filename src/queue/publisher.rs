use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{info, warn};

use super::workers::ConsumerLiveness;
use super::{connect, declare_group, TaskEnvelope, TaskQueue};
use crate::config::BrokerConfig;
use crate::types::{AppError, AppResult};

const MIN_HEARTBEAT: Duration = Duration::from_secs(1);

fn heartbeat_period(interval: Duration) -> Duration {
    interval.max(MIN_HEARTBEAT)
}

/// Publishing only helps while the broker answers and, when this process
/// consumes its own tasks, while that consumer is still running.
fn queue_usable(connected: bool, consumer: Option<&ConsumerLiveness>) -> bool {
    connected && consumer.map_or(true, ConsumerLiveness::is_alive)
}

/// Appends task envelopes to the task stream.
///
/// The underlying connection reconnects on its own after a failure; the
/// `connected` flag tracks the outcome of the most recent command or heartbeat.
#[derive(Clone)]
pub struct RedisTaskPublisher {
    conn: ConnectionManager,
    connected: Arc<AtomicBool>,
    consumer: Option<ConsumerLiveness>,
    stream: String,
    command_timeout: Duration,
}

impl RedisTaskPublisher {
    pub async fn connect(config: &BrokerConfig) -> AppResult<Self> {
        let mut conn = connect(config).await?;
        let stream = config.task_stream();
        declare_group(&mut conn, &stream, &config.research_queue).await?;

        info!(stream = %stream, "Task publisher connected");
        Ok(Self {
            conn,
            connected: Arc::new(AtomicBool::new(true)),
            consumer: None,
            stream,
            command_timeout: config.connection_timeout,
        })
    }

    /// Tie queue health to the consumer embedded in this process
    pub fn with_consumer(mut self, liveness: ConsumerLiveness) -> Self {
        self.consumer = Some(liveness);
        self
    }

    fn mark(&self, healthy: bool) {
        let was = self.connected.swap(healthy, Ordering::SeqCst);
        if was && !healthy {
            warn!("Broker connection lost, submissions fall back to inline execution");
        } else if !was && healthy {
            info!("Broker connection restored");
        }
    }

    pub async fn ping(&self) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let pong: AppResult<String> =
            match tokio::time::timeout(self.command_timeout, redis::cmd("PING").query_async(&mut conn)).await {
                Ok(result) => result.map_err(AppError::from),
                Err(_) => Err(AppError::Transport("broker ping timed out".to_string())),
            };
        self.mark(pong.is_ok());
        pong.map(|_| ())
    }

    /// Ping the broker every `interval` so health reflects reality between publishes
    pub fn spawn_heartbeat(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let publisher = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_period(interval));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let _ = publisher.ping().await;
            }
        })
    }
}

#[async_trait]
impl TaskQueue for RedisTaskPublisher {
    fn is_connected(&self) -> bool {
        queue_usable(self.connected.load(Ordering::SeqCst), self.consumer.as_ref())
    }

    async fn publish(&self, envelope: &TaskEnvelope) -> AppResult<()> {
        let fields = envelope.to_fields()?;
        let mut conn = self.conn.clone();

        let added: AppResult<String> =
            match tokio::time::timeout(self.command_timeout, conn.xadd(&self.stream, "*", &fields)).await {
                Ok(result) => result.map_err(AppError::from),
                Err(_) => Err(AppError::Transport("publish timed out".to_string())),
            };
        self.mark(added.is_ok());

        let entry_id = added?;
        info!(task_id = %envelope.task_id, entry_id = %entry_id, priority = %envelope.priority, "Published research task");
        Ok(())
    }
}
