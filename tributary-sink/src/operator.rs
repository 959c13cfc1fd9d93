use std::time::{Duration, SystemTime};

use tokio::sync::mpsc::{Receiver, Sender};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use tributary_state::CheckpointStore;
use tributary_types::{CheckpointBarrier, Record, TaskInfo};

use crate::committer::TwoPhaseCommitter;
use crate::error::SinkResult;

/// Data flowing into a sink subtask.
#[derive(Debug, Clone)]
pub enum SinkMessage {
    Record(Record),
    Barrier(CheckpointBarrier),
    EndOfData,
}

/// Instructions from the coordinator to a subtask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// Every subtask finished checkpoint `epoch`; its output may be published.
    Commit { epoch: u32 },
    Stop,
}

/// Reports from a subtask to the coordinator.
#[derive(Debug, Clone)]
pub enum ControlResp<P> {
    CheckpointCompleted {
        subtask_index: usize,
        epoch: u32,
        pre_commits: Vec<P>,
    },
    Committed {
        subtask_index: usize,
        epoch: u32,
        committed: Vec<P>,
    },
    Finished {
        subtask_index: usize,
    },
    Failed {
        subtask_index: usize,
        error: String,
    },
}

/// Runs one subtask of a two-phase-commit sink: feeds it records, snapshots it at barriers and
/// publishes its output when the coordinator says a checkpoint is complete.
pub struct SinkOperator<TPC: TwoPhaseCommitter> {
    committer: TPC,
    task_info: TaskInfo,
    checkpoints: CheckpointStore,
    check_interval: Duration,
}

impl<TPC: TwoPhaseCommitter> SinkOperator<TPC> {
    pub fn new(
        committer: TPC,
        task_info: TaskInfo,
        checkpoints: CheckpointStore,
        check_interval: Duration,
    ) -> Self {
        Self {
            committer,
            task_info,
            checkpoints,
            check_interval,
        }
    }

    pub async fn run(
        mut self,
        input: Receiver<SinkMessage>,
        control_rx: Receiver<ControlMessage>,
        control_tx: Sender<ControlResp<TPC::PreCommit>>,
    ) -> SinkResult<()> {
        let result = self.run_inner(input, control_rx, &control_tx).await;
        if let Err(e) = &result {
            error!(
                "{} subtask {} failed: {}",
                self.committer.name(),
                self.task_info.task_index,
                e
            );
            let _ = control_tx
                .send(ControlResp::Failed {
                    subtask_index: self.task_info.task_index,
                    error: e.to_string(),
                })
                .await;
        }
        result
    }

    async fn run_inner(
        &mut self,
        mut input: Receiver<SinkMessage>,
        mut control_rx: Receiver<ControlMessage>,
        control_tx: &Sender<ControlResp<TPC::PreCommit>>,
    ) -> SinkResult<()> {
        self.on_start(control_tx).await?;

        let mut ticker = tokio::time::interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                Some(msg) = control_rx.recv() => match msg {
                    ControlMessage::Commit { epoch } => {
                        self.handle_commit(epoch, control_tx).await?;
                    }
                    ControlMessage::Stop => {
                        info!(
                            "{} subtask {} stopping",
                            self.committer.name(),
                            self.task_info.task_index
                        );
                        return self.finish(control_tx).await;
                    }
                },
                msg = input.recv() => match msg {
                    Some(SinkMessage::Record(record)) => {
                        self.committer.insert_record(&record).await?;
                    }
                    Some(SinkMessage::Barrier(barrier)) => {
                        self.handle_checkpoint(&barrier, control_tx).await?;
                        if barrier.then_stop {
                            self.await_final_commit(barrier.epoch, &mut control_rx, control_tx).await?;
                            return self.finish(control_tx).await;
                        }
                    }
                    Some(SinkMessage::EndOfData) | None => {
                        return self.finish(control_tx).await;
                    }
                },
                _ = ticker.tick() => {
                    self.committer.on_processing_time(SystemTime::now()).await?;
                }
            }
        }
    }

    /// Restores from the newest complete checkpoint and publishes what it left pending, which
    /// covers a failure between a checkpoint completing and its commit.
    async fn on_start(
        &mut self,
        control_tx: &Sender<ControlResp<TPC::PreCommit>>,
    ) -> SinkResult<()> {
        let Some(metadata) = self.checkpoints.latest_metadata().await? else {
            self.committer.init(&self.task_info, None).await?;
            return Ok(());
        };

        let state = self
            .checkpoints
            .load_state(&self.task_info, metadata.epoch)
            .await?;
        debug!(
            "{} subtask {} found checkpoint {} (state present: {})",
            self.committer.name(),
            self.task_info.task_index,
            metadata.epoch,
            state.is_some()
        );
        self.committer.init(&self.task_info, state).await?;
        self.handle_commit(metadata.epoch, control_tx).await
    }

    async fn handle_checkpoint(
        &mut self,
        barrier: &CheckpointBarrier,
        control_tx: &Sender<ControlResp<TPC::PreCommit>>,
    ) -> SinkResult<()> {
        let (recovery, pre_commits) = self
            .committer
            .checkpoint(&self.task_info, barrier.epoch, barrier.then_stop)
            .await?;
        self.checkpoints
            .write_state(&self.task_info, barrier.epoch, &recovery)
            .await?;

        self.send(
            control_tx,
            ControlResp::CheckpointCompleted {
                subtask_index: self.task_info.task_index,
                epoch: barrier.epoch,
                pre_commits,
            },
        )
        .await;
        Ok(())
    }

    async fn handle_commit(
        &mut self,
        epoch: u32,
        control_tx: &Sender<ControlResp<TPC::PreCommit>>,
    ) -> SinkResult<()> {
        let committed = self.committer.commit(&self.task_info, epoch).await?;
        self.send(
            control_tx,
            ControlResp::Committed {
                subtask_index: self.task_info.task_index,
                epoch,
                committed,
            },
        )
        .await;
        Ok(())
    }

    async fn await_final_commit(
        &mut self,
        epoch: u32,
        control_rx: &mut Receiver<ControlMessage>,
        control_tx: &Sender<ControlResp<TPC::PreCommit>>,
    ) -> SinkResult<()> {
        while let Some(msg) = control_rx.recv().await {
            match msg {
                ControlMessage::Commit { epoch: committed } => {
                    self.handle_commit(committed, control_tx).await?;
                    if committed >= epoch {
                        return Ok(());
                    }
                }
                ControlMessage::Stop => break,
            }
        }
        warn!(
            "{} subtask {} stopped without a commit for final checkpoint {}",
            self.committer.name(),
            self.task_info.task_index,
            epoch
        );
        Ok(())
    }

    async fn finish(&mut self, control_tx: &Sender<ControlResp<TPC::PreCommit>>) -> SinkResult<()> {
        self.committer.close().await?;
        self.send(
            control_tx,
            ControlResp::Finished {
                subtask_index: self.task_info.task_index,
            },
        )
        .await;
        Ok(())
    }

    async fn send(
        &mut self,
        control_tx: &Sender<ControlResp<TPC::PreCommit>>,
        resp: ControlResp<TPC::PreCommit>,
    ) {
        if control_tx.send(resp).await.is_err() {
            warn!(
                "{} subtask {} has no coordinator to report to",
                self.committer.name(),
                self.task_info.task_index
            );
        }
    }
}
