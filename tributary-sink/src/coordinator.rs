use std::collections::{BTreeMap, HashSet};
use std::fmt::Debug;

use tokio::sync::mpsc::Sender;
use tracing::{debug, info, warn};
use tributary_state::{CheckpointMetadata, CheckpointStore};
use tributary_types::TaskInfo;

use crate::error::{SinkError, SinkResult};
use crate::operator::{ControlMessage, ControlResp};

struct CheckpointProgress<P> {
    remaining: HashSet<usize>,
    pre_commits: Vec<P>,
}

impl<P> CheckpointProgress<P> {
    fn new(parallelism: usize) -> Self {
        Self {
            remaining: (0..parallelism).collect(),
            pre_commits: vec![],
        }
    }
}

/// Tracks checkpoints across all subtasks of a sink. Once every subtask has finished a
/// checkpoint it is recorded as complete and the subtasks are told to commit.
pub struct CommitCoordinator<P> {
    task_info: TaskInfo,
    checkpoints: CheckpointStore,
    control_txs: Vec<Sender<ControlMessage>>,
    checkpointing: BTreeMap<u32, CheckpointProgress<P>>,
    committing: BTreeMap<u32, HashSet<usize>>,
    last_completed: Option<u32>,
    committed: Vec<P>,
    finished: HashSet<usize>,
}

impl<P: Clone + Send + Debug> CommitCoordinator<P> {
    /// `task_info` identifies the job and operator; its subtask index is ignored.
    pub fn new(
        task_info: TaskInfo,
        checkpoints: CheckpointStore,
        control_txs: Vec<Sender<ControlMessage>>,
    ) -> Self {
        Self {
            task_info,
            checkpoints,
            control_txs,
            checkpointing: BTreeMap::new(),
            committing: BTreeMap::new(),
            last_completed: None,
            committed: vec![],
            finished: HashSet::new(),
        }
    }

    pub fn parallelism(&self) -> usize {
        self.control_txs.len()
    }

    pub fn last_completed(&self) -> Option<u32> {
        self.last_completed
    }

    /// Whether `epoch` completed and every subtask has published its files.
    pub fn is_committed(&self, epoch: u32) -> bool {
        self.last_completed.is_some_and(|last| last >= epoch)
            && self.committing.range(..=epoch).next().is_none()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.len() == self.parallelism()
    }

    /// Everything subtasks reported as committed since the last call.
    pub fn take_committed(&mut self) -> Vec<P> {
        std::mem::take(&mut self.committed)
    }

    pub async fn handle_response(&mut self, resp: ControlResp<P>) -> SinkResult<()> {
        match resp {
            ControlResp::CheckpointCompleted {
                subtask_index,
                epoch,
                pre_commits,
            } => {
                debug!(
                    "subtask {} finished checkpoint {} with {} pre-commit(s)",
                    subtask_index,
                    epoch,
                    pre_commits.len()
                );
                let parallelism = self.parallelism();
                let progress = self
                    .checkpointing
                    .entry(epoch)
                    .or_insert_with(|| CheckpointProgress::new(parallelism));
                progress.remaining.remove(&subtask_index);
                progress.pre_commits.extend(pre_commits);

                if progress.remaining.is_empty() {
                    if let Some(progress) = self.checkpointing.remove(&epoch) {
                        self.complete_checkpoint(epoch, progress).await?;
                    }
                }
            }
            ControlResp::Committed {
                subtask_index,
                epoch,
                committed,
            } => {
                self.committed.extend(committed);
                // a commit covers every earlier checkpoint too
                let mut done = vec![];
                for (e, subtasks) in self.committing.range_mut(..=epoch) {
                    subtasks.remove(&subtask_index);
                    if subtasks.is_empty() {
                        done.push(*e);
                    }
                }
                for e in done {
                    self.committing.remove(&e);
                    info!(
                        "checkpoint {} committed by all {} subtask(s)",
                        e,
                        self.parallelism()
                    );
                }
            }
            ControlResp::Finished { subtask_index } => {
                self.finished.insert(subtask_index);
            }
            ControlResp::Failed {
                subtask_index,
                error,
            } => {
                return Err(SinkError::TaskFailed {
                    subtask_index,
                    message: error,
                });
            }
        }
        Ok(())
    }

    async fn complete_checkpoint(
        &mut self,
        epoch: u32,
        progress: CheckpointProgress<P>,
    ) -> SinkResult<()> {
        self.checkpoints
            .write_metadata(&CheckpointMetadata::new(&self.task_info, epoch))
            .await?;
        self.last_completed = Some(epoch);
        // older checkpoints that never completed are superseded
        self.checkpointing.retain(|e, _| *e > epoch);

        info!(
            "checkpoint {} complete, {} file(s) to commit",
            epoch,
            progress.pre_commits.len()
        );

        self.committing.insert(epoch, (0..self.parallelism()).collect());
        for (idx, tx) in self.control_txs.iter().enumerate() {
            if tx.send(ControlMessage::Commit { epoch }).await.is_err() {
                warn!("subtask {} is gone, cannot commit checkpoint {}", idx, epoch);
            }
        }

        self.checkpoints.cleanup(epoch).await?;
        Ok(())
    }

    /// Tells every subtask to stop without taking another checkpoint.
    pub async fn stop_all(&self) {
        for tx in &self.control_txs {
            let _ = tx.send(ControlMessage::Stop).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::mpsc::{channel, Receiver};
    use tributary_storage::StorageProvider;

    fn coordinator(
        parallelism: usize,
    ) -> (
        CommitCoordinator<String>,
        Vec<Receiver<ControlMessage>>,
        CheckpointStore,
    ) {
        let checkpoints = CheckpointStore::new(Arc::new(StorageProvider::in_memory()), "job");
        let (txs, rxs): (Vec<_>, Vec<_>) = (0..parallelism).map(|_| channel(8)).unzip();
        let coordinator = CommitCoordinator::new(
            TaskInfo::new("job", "sink", 0, parallelism),
            checkpoints.clone(),
            txs,
        );
        (coordinator, rxs, checkpoints)
    }

    fn completed(subtask_index: usize, epoch: u32, files: &[&str]) -> ControlResp<String> {
        ControlResp::CheckpointCompleted {
            subtask_index,
            epoch,
            pre_commits: files.iter().map(|f| f.to_string()).collect(),
        }
    }

    fn committed(subtask_index: usize, epoch: u32, files: &[&str]) -> ControlResp<String> {
        ControlResp::Committed {
            subtask_index,
            epoch,
            committed: files.iter().map(|f| f.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_commit_waits_for_all_subtasks() {
        let (mut coordinator, mut rxs, checkpoints) = coordinator(2);

        coordinator
            .handle_response(completed(0, 1, &["a"]))
            .await
            .unwrap();
        assert!(rxs[0].try_recv().is_err());
        assert!(checkpoints.latest_metadata().await.unwrap().is_none());

        coordinator
            .handle_response(completed(1, 1, &["b"]))
            .await
            .unwrap();
        for rx in &mut rxs {
            assert_eq!(rx.try_recv().unwrap(), ControlMessage::Commit { epoch: 1 });
        }
        assert_eq!(checkpoints.latest_metadata().await.unwrap().unwrap().epoch, 1);
        assert_eq!(coordinator.last_completed(), Some(1));
        assert!(!coordinator.is_committed(1));

        coordinator
            .handle_response(committed(0, 1, &["a"]))
            .await
            .unwrap();
        assert!(!coordinator.is_committed(1));
        coordinator
            .handle_response(committed(1, 1, &["b"]))
            .await
            .unwrap();
        assert!(coordinator.is_committed(1));
        assert_eq!(coordinator.take_committed(), vec!["a", "b"]);
        assert!(coordinator.take_committed().is_empty());
    }

    #[tokio::test]
    async fn test_later_commit_covers_earlier_checkpoints() {
        let (mut coordinator, _rxs, _) = coordinator(1);
        coordinator.handle_response(completed(0, 1, &[])).await.unwrap();
        coordinator.handle_response(completed(0, 2, &[])).await.unwrap();
        assert!(!coordinator.is_committed(1));

        coordinator.handle_response(committed(0, 2, &[])).await.unwrap();
        assert!(coordinator.is_committed(1));
        assert!(coordinator.is_committed(2));
        assert!(!coordinator.is_committed(3));
    }

    #[tokio::test]
    async fn test_failure_and_finish() {
        let (mut coordinator, _rxs, _) = coordinator(2);
        coordinator
            .handle_response(ControlResp::Finished { subtask_index: 0 })
            .await
            .unwrap();
        assert!(!coordinator.is_finished());
        coordinator
            .handle_response(ControlResp::Finished { subtask_index: 1 })
            .await
            .unwrap();
        assert!(coordinator.is_finished());

        let err = coordinator
            .handle_response(ControlResp::Failed {
                subtask_index: 1,
                error: "disk full".to_string(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "subtask 1 failed: disk full");
    }
}
