//! # Ingestion Pipeline
//!
//! Runs one [`StreamingQuery`] per topic as an independent task. Queries
//! share no state and fail alone: stopping or losing one leaves the others
//! running.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use telemetry_broker::SharedSource;
use telemetry_domain::Topic;

use crate::config::StreamingConfig;
use crate::error::{Result, StreamingError};
use crate::query::{QueryProgress, StreamingQuery};

/// Final outcome of every query, by topic
pub type QueryOutcomes = BTreeMap<Topic, Result<QueryProgress>>;

struct QueryHandle {
    cancel: CancellationToken,
    progress: watch::Receiver<QueryProgress>,
    task: JoinHandle<Result<QueryProgress>>,
}

/// The set of running per-topic queries
pub struct IngestionPipeline {
    source: SharedSource,
    shutdown: CancellationToken,
    queries: BTreeMap<Topic, QueryHandle>,
}

impl IngestionPipeline {
    /// Open and spawn a query for every configured topic. A topic whose
    /// query cannot be opened is logged and skipped.
    pub async fn start(config: &StreamingConfig, source: SharedSource) -> Result<Self> {
        config.validate()?;

        let shutdown = CancellationToken::new();
        let mut queries = BTreeMap::new();

        for &topic in &config.topics {
            let query = match StreamingQuery::open(topic, Arc::clone(&source), config).await {
                Ok(query) => query,
                Err(e) => {
                    tracing::error!(%topic, error = %e, "Query could not be started");
                    continue;
                }
            };

            let cancel = shutdown.child_token();
            let progress = query.progress();
            let token = cancel.clone();
            let task = tokio::spawn(async move {
                let result = query.run(token).await;
                if let Err(e) = &result {
                    tracing::error!(%topic, error = %e, "Query failed");
                }
                result
            });

            queries.insert(
                topic,
                QueryHandle {
                    cancel,
                    progress,
                    task,
                },
            );
        }

        if queries.is_empty() {
            return Err(StreamingError::NoQueries);
        }

        tracing::info!(
            queries = queries.len(),
            output_root = %config.output_root.display(),
            checkpoint_root = %config.checkpoint_root.display(),
            "Ingestion pipeline started"
        );

        Ok(Self {
            source,
            shutdown,
            queries,
        })
    }

    /// Topics with a query that has not been stopped
    #[must_use]
    pub fn topics(&self) -> Vec<Topic> {
        self.queries.keys().copied().collect()
    }

    /// Latest progress of one query
    #[must_use]
    pub fn progress(&self, topic: Topic) -> Option<QueryProgress> {
        self.queries
            .get(&topic)
            .map(|q| q.progress.borrow().clone())
    }

    /// Cancel one query and wait for it. Other queries are unaffected.
    pub async fn stop(&mut self, topic: Topic) -> Result<QueryProgress> {
        let handle = self
            .queries
            .remove(&topic)
            .ok_or(StreamingError::UnknownQuery(topic))?;
        handle.cancel.cancel();
        join(topic, handle.task).await
    }

    /// Cancel every query and wait for all of them.
    pub async fn shutdown(self) -> QueryOutcomes {
        tracing::info!(queries = self.queries.len(), "Shutting down ingestion pipeline");
        self.shutdown.cancel();
        self.await_termination().await
    }

    /// Wait for every query to end on its own (failure or external cancel).
    pub async fn await_termination(self) -> QueryOutcomes {
        let mut outcomes = BTreeMap::new();
        for (topic, handle) in self.queries {
            outcomes.insert(topic, join(topic, handle.task).await);
        }
        outcomes
    }

    /// Stop each query once it has read everything the source currently
    /// holds. Meant for a source that is no longer being written to.
    pub async fn run_until_drained(mut self, poll: Duration) -> QueryOutcomes {
        let mut outcomes = BTreeMap::new();

        while !self.queries.is_empty() {
            for topic in self.topics() {
                if self.is_done(topic).await {
                    let outcome = self.stop(topic).await;
                    if let Ok(progress) = &outcome {
                        tracing::info!(
                            %topic,
                            rows = progress.rows_written,
                            batches = progress.batches_committed,
                            "Topic drained"
                        );
                    }
                    outcomes.insert(topic, outcome);
                }
            }
            if !self.queries.is_empty() {
                tokio::time::sleep(poll).await;
            }
        }
        outcomes
    }

    async fn is_done(&self, topic: Topic) -> bool {
        let Some(handle) = self.queries.get(&topic) else {
            return true;
        };
        if handle.task.is_finished() {
            return true;
        }
        match self.source.end_offsets(topic.as_str()).await {
            Ok(ends) => handle.progress.borrow().is_caught_up(&ends),
            Err(e) => {
                tracing::warn!(%topic, error = %e, "Could not read end offsets");
                false
            }
        }
    }
}

async fn join(topic: Topic, task: JoinHandle<Result<QueryProgress>>) -> Result<QueryProgress> {
    match task.await {
        Ok(result) => result,
        Err(e) => Err(StreamingError::QueryPanicked {
            topic,
            reason: e.to_string(),
        }),
    }
}
