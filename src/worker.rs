//! Background application of change events.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::Arc,
};

use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};

use crate::{
    document::ChangeEvent,
    error::{Error, Result},
    indexer::{ChangeOutcome, Indexer},
};

/// Counters for everything a worker applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub received: usize,
    pub indexed: usize,
    pub unchanged: usize,
    pub removed: usize,
    pub ignored: usize,
    pub failed: usize,
}

impl WorkerStats {
    fn record(&mut self, outcome: &Result<ChangeOutcome>) {
        match outcome {
            Ok(ChangeOutcome::Indexed) => self.indexed += 1,
            Ok(ChangeOutcome::Unchanged) => self.unchanged += 1,
            Ok(ChangeOutcome::Removed) => self.removed += 1,
            Ok(ChangeOutcome::Ignored) => self.ignored += 1,
            Err(_) => self.failed += 1,
        }
    }
}

/// A tokio task applying [`ChangeEvent`]s through an [`Indexer`].
///
/// Queued events are drained in bursts; within a burst only the last event
/// per path is applied.
pub struct IndexWorker {
    sender: mpsc::Sender<ChangeEvent>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<WorkerStats>,
}

impl IndexWorker {
    pub fn spawn(indexer: Arc<Indexer>, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run(indexer, receiver, shutdown_rx));
        Self {
            sender,
            shutdown,
            task,
        }
    }

    pub async fn submit(&self, event: ChangeEvent) -> Result<()> {
        self.sender
            .send(event)
            .await
            .map_err(|_| Error::ServiceUnavailable("index worker stopped".into()))
    }

    /// A sender for producers that outlive a borrow of the worker.
    pub fn sender(&self) -> mpsc::Sender<ChangeEvent> {
        self.sender.clone()
    }

    /// Apply everything already queued, then stop.
    pub async fn shutdown(self) -> Result<WorkerStats> {
        let _ = self.shutdown.send(true);
        drop(self.sender);
        self.task
            .await
            .map_err(|e| Error::ServiceUnavailable(format!("index worker panicked: {e}")))
    }
}

impl std::fmt::Debug for IndexWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexWorker")
            .field("finished", &self.task.is_finished())
            .finish_non_exhaustive()
    }
}

async fn run(
    indexer: Arc<Indexer>,
    mut receiver: mpsc::Receiver<ChangeEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> WorkerStats {
    let mut stats = WorkerStats::default();
    loop {
        tokio::select! {
            event = receiver.recv() => {
                let Some(event) = event else {
                    break;
                };
                let mut burst = vec![event];
                while let Ok(next) = receiver.try_recv() {
                    burst.push(next);
                }
                apply(&indexer, burst, &mut stats).await;
            }
            _ = shutdown.changed() => {
                receiver.close();
                let mut rest = Vec::new();
                while let Some(next) = receiver.recv().await {
                    rest.push(next);
                }
                if !rest.is_empty() {
                    apply(&indexer, rest, &mut stats).await;
                }
                break;
            }
        }
    }
    tracing::info!(
        received = stats.received,
        failed = stats.failed,
        "index worker stopped"
    );
    stats
}

async fn apply(indexer: &Arc<Indexer>, burst: Vec<ChangeEvent>, stats: &mut WorkerStats) {
    stats.received += burst.len();
    let events = coalesce(burst);
    let indexer = Arc::clone(indexer);
    let outcomes = tokio::task::spawn_blocking(move || {
        events
            .into_iter()
            .map(|event| {
                let outcome = indexer.apply_change(&event);
                (event, outcome)
            })
            .collect::<Vec<_>>()
    })
    .await;

    match outcomes {
        Ok(outcomes) => {
            for (event, outcome) in outcomes {
                if let Err(e) = &outcome {
                    tracing::warn!(
                        path = %event.path().display(),
                        error = %e,
                        "change event failed"
                    );
                }
                stats.record(&outcome);
            }
        }
        Err(e) => tracing::error!(error = %e, "change batch panicked"),
    }
}

/// Keep the last event per path, ordered by that event's arrival.
pub fn coalesce(events: Vec<ChangeEvent>) -> Vec<ChangeEvent> {
    let mut latest: HashMap<PathBuf, (usize, ChangeEvent)> = HashMap::new();
    for (seq, event) in events.into_iter().enumerate() {
        latest.insert(event.path().to_path_buf(), (seq, event));
    }
    let mut ordered: Vec<_> = latest.into_values().collect();
    ordered.sort_by_key(|(seq, _)| *seq);
    ordered.into_iter().map(|(_, event)| event).collect()
}
