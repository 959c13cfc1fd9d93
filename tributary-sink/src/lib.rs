//! A partitioned file sink. Records are grouped into hive-style partition buckets, written to
//! rolling part files, and published with a two-phase commit tied to checkpoints, so every
//! record becomes visible exactly once.

pub mod assigner;
pub mod bucket;
pub mod cdc;
pub mod committer;
pub mod config;
pub mod coordinator;
pub mod encoder;
pub mod error;
pub mod factory;
pub mod metadata;
pub mod metrics;
pub mod operator;
pub mod partition;
pub mod pipeline;
pub mod rolling;
pub mod router;
pub mod store;
pub mod writer;

pub use assigner::{AssignerContext, BucketAssigner, PartitionBucketAssigner};
pub use bucket::{Bucket, BucketResources, BucketState, BucketStatus, OutputFileConfig, PendingFile};
pub use cdc::{CdcColumns, CdcPartitionComputer, ComputedRecord};
pub use committer::{BucketSink, TwoPhaseCommitter};
pub use config::SinkConfig;
pub use coordinator::CommitCoordinator;
pub use error::{SinkError, SinkResult};
pub use factory::{BucketFactory, DefaultBucketFactory};
pub use metadata::{CdcSummary, FileMetadata};
pub use operator::{ControlMessage, ControlResp, SinkMessage, SinkOperator};
pub use partition::{BucketId, PartitionGenerator};
pub use pipeline::{LocalPipeline, PipelineOptions};
pub use rolling::{
    CheckpointRollingPolicy, DefaultRollingPolicy, PartFileInfo, RollingCondition, RollingPolicy,
};
pub use router::BucketRouter;
pub use store::{part_store_for, LocalPartStore, ObjectPartStore, PartStore};
pub use writer::{BucketWriter, WriterState};
