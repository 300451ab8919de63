// Where a consumer's status updates go
//
// A delivery is acknowledged only after `deliver` returned Ok for every
// update in its sequence.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::tasks::{TaskManager, TaskUpdate};
use crate::types::{AppError, AppResult};

#[async_trait]
pub trait UpdateSink: Send + Sync {
    /// Hand over one update. An error keeps the delivery unacknowledged.
    async fn deliver(&self, update: TaskUpdate) -> AppResult<()>;
}

/// Sink of a consumer embedded in the API process: applies updates to the
/// local task store and relays the ones for tasks another process owns.
pub struct LocalSink {
    manager: TaskManager,
    relay: Option<Arc<dyn UpdateSink>>,
}

impl LocalSink {
    pub fn new(manager: TaskManager, relay: Option<Arc<dyn UpdateSink>>) -> Self {
        Self { manager, relay }
    }
}

#[async_trait]
impl UpdateSink for LocalSink {
    async fn deliver(&self, update: TaskUpdate) -> AppResult<()> {
        let task_id = update.task_id();
        let status = update.status();

        match self.manager.apply(update.clone()).await {
            Ok(_) => Ok(()),
            Err(AppError::NotFound(_)) => match &self.relay {
                Some(relay) => {
                    debug!(task_id = %task_id, status = %status, "Relaying update for task owned elsewhere");
                    relay.deliver(update).await
                }
                None => {
                    debug!(task_id = %task_id, "Update for unknown task ignored");
                    Ok(())
                }
            },
            // A rejected transition does not get better on redelivery
            Err(e) => {
                warn!(task_id = %task_id, status = %status, error = %e, "Update rejected");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use tokio::sync::Mutex;

    /// Records every update, or refuses all of them
    #[derive(Default)]
    pub struct RecordingSink {
        pub delivered: Mutex<Vec<TaskUpdate>>,
        pub failing: bool,
    }

    impl RecordingSink {
        pub fn failing() -> Self {
            Self { failing: true, ..Self::default() }
        }

        pub async fn statuses(&self) -> Vec<crate::tasks::TaskStatus> {
            self.delivered.lock().await.iter().map(|u| u.status()).collect()
        }
    }

    #[async_trait]
    impl UpdateSink for RecordingSink {
        async fn deliver(&self, update: TaskUpdate) -> AppResult<()> {
            if self.failing {
                return Err(AppError::Transport("results stream unreachable".into()));
            }
            self.delivered.lock().await.push(update);
            Ok(())
        }
    }
}
