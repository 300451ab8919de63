// Results stream: status updates from consumers that do not own the task's
// record, carried back to the API process that does

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamId, StreamMaxlen, StreamRangeReply, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::connect;
use super::sink::UpdateSink;
use super::jobs::{FIELD_BODY, FIELD_TASK_ID};
use crate::config::BrokerConfig;
use crate::tasks::TaskUpdate;
use crate::types::{AppError, AppResult};
use crate::utils::{backoff_delay, with_retry};

pub const FIELD_STATUS: &str = "status";

const RESULTS_MAXLEN: usize = 10_000;
const READ_BLOCK_MS: usize = 5_000;
const READ_BATCH: usize = 100;
const PUBLISH_ATTEMPTS: u32 = 3;

pub fn update_fields(update: &TaskUpdate) -> AppResult<Vec<(&'static str, String)>> {
    Ok(vec![
        (FIELD_BODY, serde_json::to_string(update)?),
        (FIELD_TASK_ID, update.task_id().to_string()),
        (FIELD_STATUS, update.status().to_string()),
    ])
}

fn update_from_entry(entry: &StreamId) -> AppResult<TaskUpdate> {
    update_from_body(entry.get::<String>(FIELD_BODY).as_deref(), &entry.id)
}

fn update_from_body(body: Option<&str>, entry_id: &str) -> AppResult<TaskUpdate> {
    let body = body.ok_or_else(|| AppError::Transport(format!("result message {} has no body field", entry_id)))?;
    Ok(serde_json::from_str(body)?)
}

/// Publishing side of the results stream
#[derive(Clone)]
pub struct ResultRelay {
    conn: ConnectionManager,
    stream: String,
}

impl ResultRelay {
    pub async fn connect(config: &BrokerConfig) -> AppResult<Self> {
        let conn = connect(config).await?;
        let stream = config.results_stream();
        info!(stream = %stream, "Result relay connected");
        Ok(Self { conn, stream })
    }

    pub async fn publish(&self, update: &TaskUpdate) -> AppResult<()> {
        let fields = update_fields(update)?;
        let mut conn = self.conn.clone();
        let entry_id: String = conn
            .xadd_maxlen(&self.stream, StreamMaxlen::Approx(RESULTS_MAXLEN), "*", &fields)
            .await?;
        debug!(task_id = %update.task_id(), status = %update.status(), entry_id = %entry_id, "Relayed task update");
        Ok(())
    }
}

/// Written to the results stream before the task entry is acknowledged. When
/// every attempt fails the entry stays pending and is delivered again.
#[async_trait]
impl UpdateSink for ResultRelay {
    async fn deliver(&self, update: TaskUpdate) -> AppResult<()> {
        let pending = &update;
        with_retry(move || self.publish(pending), PUBLISH_ATTEMPTS)
            .await
            .map_err(|e| match e {
                AppError::Transport(_) => e,
                other => AppError::Transport(format!("relaying task update failed: {}", other)),
            })
    }
}

/// Reading side, runs inside the API process and feeds the task manager
pub struct ResultListener {
    conn: ConnectionManager,
    stream: String,
}

impl ResultListener {
    pub async fn connect(config: &BrokerConfig) -> AppResult<Self> {
        let conn = connect(config).await?;
        let stream = config.results_stream();
        info!(stream = %stream, "Result listener connected");
        Ok(Self { conn, stream })
    }

    /// Forward updates published after startup until shutdown or until the
    /// receiving side is gone.
    pub async fn run(mut self, updates: mpsc::Sender<TaskUpdate>, mut shutdown: watch::Receiver<bool>) -> AppResult<()> {
        let mut last_id = self.latest_id().await?;
        let mut failures: u32 = 0;

        while !*shutdown.borrow() {
            let read = tokio::select! {
                _ = shutdown.changed() => break,
                read = self.read(&last_id) => read,
            };

            match read {
                Ok(entries) => {
                    failures = 0;
                    for entry in entries {
                        last_id = entry.id.clone();
                        match update_from_entry(&entry) {
                            Ok(update) => {
                                if updates.send(update).await.is_err() {
                                    debug!("Task manager gone, result listener stopping");
                                    return Ok(());
                                }
                            }
                            Err(e) => warn!(entry_id = %entry.id, error = %e, "Skipping malformed result message"),
                        }
                    }
                }
                Err(e) => {
                    failures += 1;
                    let delay = backoff_delay(failures);
                    warn!(error = %e, failures, retry_in_secs = delay.as_secs(), "Reading results failed");
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        info!("Result listener stopped");
        Ok(())
    }

    /// Id of the newest entry, so a restart does not replay old results
    async fn latest_id(&mut self) -> AppResult<String> {
        let reply: StreamRangeReply = self.conn.xrevrange_count(&self.stream, "+", "-", 1).await?;
        Ok(reply
            .ids
            .into_iter()
            .next()
            .map(|entry| entry.id)
            .unwrap_or_else(|| "0-0".to_string()))
    }

    async fn read(&mut self, after: &str) -> AppResult<Vec<StreamId>> {
        let options = StreamReadOptions::default().block(READ_BLOCK_MS).count(READ_BATCH);
        let reply: Option<StreamReadReply> = self
            .conn
            .xread_options(&[self.stream.as_str()], &[after], &options)
            .await?;

        Ok(reply
            .map(|r| r.keys.into_iter().flat_map(|key| key.ids).collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn as_map(fields: Vec<(&'static str, String)>) -> HashMap<String, String> {
        fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[test]
    fn test_update_fields() {
        let update = TaskUpdate::Completed {
            task_id: Uuid::new_v4(),
            result: "Paris".into(),
            files_generated: vec!["reports/capital_report.md".into()],
        };
        let fields = as_map(update_fields(&update).unwrap());

        assert_eq!(fields[FIELD_STATUS], "completed");
        assert_eq!(fields[FIELD_TASK_ID], update.task_id().to_string());
        assert_eq!(update_from_body(Some(&fields[FIELD_BODY]), "1-0").unwrap(), update);
    }

    #[test]
    fn test_body_is_status_tagged() {
        let update = TaskUpdate::Failed { task_id: Uuid::new_v4(), error: "LLM API error (429): Rate limit reached".into() };
        let fields = as_map(update_fields(&update).unwrap());
        let body: serde_json::Value = serde_json::from_str(&fields[FIELD_BODY]).unwrap();

        assert_eq!(body["status"], "failed");
        assert_eq!(body["error"], "LLM API error (429): Rate limit reached");
    }

    #[test]
    fn test_missing_body_rejected() {
        assert!(matches!(update_from_body(None, "1-0"), Err(AppError::Transport(_))));
    }
}
