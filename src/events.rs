//! Typed progress and completion events.
//!
//! Each event kind has its own broadcast [`Topic`]. Publishing without
//! subscribers is a no-op; a slow [`Subscription`] skips what it missed
//! rather than blocking publishers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};

use crate::{model::StrategyReport, reencode::ReEncodingJob};

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexingProgress {
    pub processed: usize,
    pub total: usize,
    pub failed: usize,
    pub current_file: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopicTreeUpdated {
    pub generation: u64,
    pub generated_at: DateTime<Utc>,
    pub total_topics: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryCompleted {
    pub query: String,
    pub results: usize,
    pub strategies: Vec<StrategyReport>,
    pub from_cache: bool,
    pub elapsed_ms: u64,
}

/// One broadcast channel for events of type `E`.
#[derive(Debug)]
pub struct Topic<E> {
    sender: broadcast::Sender<E>,
}

impl<E: Clone> Topic<E> {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Deliver to current subscribers. Returns how many received it.
    pub fn publish(&self, event: E) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> Subscription<E> {
        Subscription {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Receiving end of a [`Topic`]. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription<E> {
    receiver: broadcast::Receiver<E>,
}

impl<E: Clone> Subscription<E> {
    /// Next event, or `None` once the topic is gone.
    pub async fn recv(&mut self) -> Option<E> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<E> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }
}

/// All event topics of one orchestrator.
#[derive(Debug)]
pub struct EventBus {
    pub indexing: Topic<IndexingProgress>,
    pub re_encoding: Topic<ReEncodingJob>,
    pub topics: Topic<TopicTreeUpdated>,
    pub queries: Topic<QueryCompleted>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            indexing: Topic::new(capacity),
            re_encoding: Topic::new(capacity),
            topics: Topic::new(capacity),
            queries: Topic::new(capacity),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(processed: usize) -> IndexingProgress {
        IndexingProgress {
            processed,
            total: 10,
            failed: 0,
            current_file: None,
        }
    }

    #[test]
    fn publish_without_subscribers_is_a_noop() {
        let topic = Topic::new(4);
        assert_eq!(topic.publish(progress(1)), 0);
    }

    #[tokio::test]
    async fn subscribers_receive_in_order() {
        let topic = Topic::new(4);
        let mut sub = topic.subscribe();
        topic.publish(progress(1));
        topic.publish(progress(2));
        assert_eq!(sub.recv().await.unwrap().processed, 1);
        assert_eq!(sub.recv().await.unwrap().processed, 2);
    }

    #[tokio::test]
    async fn lagged_subscribers_skip_ahead() {
        let topic = Topic::new(2);
        let mut sub = topic.subscribe();
        for i in 0..5 {
            topic.publish(progress(i));
        }
        assert_eq!(sub.recv().await.unwrap().processed, 3);
        assert_eq!(sub.try_recv().unwrap().processed, 4);
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn dropping_unsubscribes() {
        let topic: Topic<IndexingProgress> = Topic::new(2);
        let sub = topic.subscribe();
        assert_eq!(topic.subscriber_count(), 1);
        drop(sub);
        assert_eq!(topic.subscriber_count(), 0);
    }
}
