//! Queue Transport
//!
//! Research tasks travel over Redis streams:
//!
//! - **task stream** `{exchange}:{research_queue}`: one entry per submitted task,
//!   read through the consumer group `{research_queue}` with one delivery in
//!   flight per consumer. Entries are acknowledged only after the outcome was
//!   reported, so a crashed consumer's delivery is picked up again.
//! - **results stream** `{exchange}:{results_queue}`: status updates for tasks
//!   the consuming process does not own, relayed back into the task store of
//!   the API process that accepted them. Updates are written there before the
//!   task entry is acknowledged.
//!
//! Stream data persists with the broker's own persistence (AOF/RDB).

pub mod jobs;
pub mod publisher;
pub mod results;
pub mod sink;
pub mod workers;

pub use jobs::TaskEnvelope;
pub use publisher::RedisTaskPublisher;
pub use results::{ResultListener, ResultRelay};
pub use sink::{LocalSink, UpdateSink};
pub use workers::{ConsumerLiveness, TaskConsumer};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, info};

use crate::config::BrokerConfig;
use crate::types::{AppError, AppResult};

/// Publishing side of the task queue, as seen by the dispatcher
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Whether the last known state of the broker connection is healthy
    fn is_connected(&self) -> bool;

    async fn publish(&self, envelope: &TaskEnvelope) -> AppResult<()>;
}

/// Open a self-reconnecting connection, bounded by the configured timeout
pub async fn connect(config: &BrokerConfig) -> AppResult<ConnectionManager> {
    let client = redis::Client::open(config.url.as_str())?;
    info!(timeout_secs = config.connection_timeout.as_secs(), "Connecting to broker");

    let connection = tokio::time::timeout(config.connection_timeout, ConnectionManager::new(client))
        .await
        .map_err(|_| {
            AppError::Transport(format!(
                "broker connection timed out after {}s",
                config.connection_timeout.as_secs()
            ))
        })??;

    Ok(connection)
}

/// Create the consumer group (and the stream) unless it already exists
pub async fn declare_group(conn: &mut ConnectionManager, stream: &str, group: &str) -> AppResult<()> {
    let created: redis::RedisResult<()> = conn.xgroup_create_mkstream(stream, group, "0").await;
    match created {
        Ok(()) => {
            info!(stream, group, "Declared consumer group");
            Ok(())
        }
        Err(e) if e.code() == Some("BUSYGROUP") => {
            debug!(stream, group, "Consumer group already exists");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
