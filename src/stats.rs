//! Point-in-time snapshots of pipeline activity.

use crate::pipeline::PipelineState;
use crate::queue::Queue;
use crate::stage::{Stage, StageKind};

/// Snapshot of one queue
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct QueueStats {
    /// Queue name, `{pipeline}/{stage}` or `{pipeline}/input`
    pub name: String,
    /// Maximum number of buffered items
    pub capacity: usize,
    /// Items buffered at snapshot time
    pub len: usize,
    /// Items accepted so far
    pub sent: u64,
    /// Items handed to readers so far
    pub received: u64,
    /// Whether the last writer has exited
    pub closed: bool,
}

impl<T> From<&Queue<T>> for QueueStats {
    fn from(queue: &Queue<T>) -> Self {
        Self {
            name: queue.name().to_string(),
            capacity: queue.capacity(),
            len: queue.len(),
            sent: queue.sent(),
            received: queue.received(),
            closed: queue.is_closed(),
        }
    }
}

/// Snapshot of one stage and the queue it writes into
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct StageStats {
    /// Stage name as registered
    pub name: String,
    /// Input or process
    pub kind: StageKind,
    /// Configured worker count
    pub workers: usize,
    /// Workers still running
    pub active_tasks: usize,
    /// Writers still registered on the output queue
    pub remaining_writers: usize,
    /// The queue this stage writes into
    pub queue: QueueStats,
}

impl<T> From<&Stage<T>> for StageStats {
    fn from(stage: &Stage<T>) -> Self {
        Self {
            name: stage.name().to_string(),
            kind: stage.kind(),
            workers: stage.workers(),
            active_tasks: stage.active_tasks(),
            remaining_writers: stage.remaining_writers(),
            queue: stage.queue().into(),
        }
    }
}

/// Snapshot of a whole pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PipelineStats {
    /// Pipeline name from its configuration
    pub name: String,
    /// Lifecycle state at snapshot time
    pub state: PipelineState,
    /// Running tasks across every stage
    pub active_tasks: usize,
    /// The shared queue every source writes into
    pub input: QueueStats,
    /// Stages in wiring order
    pub stages: Vec<StageStats>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queue_stats() {
        let queue = Queue::new("stats", 4).unwrap();
        queue.sender().send(1u8).await.unwrap();
        queue.sender().send(2u8).await.unwrap();
        queue.receiver().recv().await.unwrap();

        let stats = QueueStats::from(&queue);
        assert_eq!(stats.name, "stats");
        assert_eq!(stats.capacity, 4);
        assert_eq!(stats.len, 1);
        assert_eq!(stats.sent, 2);
        assert_eq!(stats.received, 1);
        assert!(!stats.closed);
    }

    #[cfg(feature = "serde")]
    #[tokio::test]
    async fn test_stats_serialize() {
        let queue = Queue::<u8>::new("json", 2).unwrap();
        let value = serde_json::to_value(QueueStats::from(&queue)).unwrap();
        assert_eq!(value["name"], "json");
        assert_eq!(value["closed"], false);
    }
}
