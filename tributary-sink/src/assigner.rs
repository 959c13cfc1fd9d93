use std::collections::{HashMap, VecDeque};
use std::time::SystemTime;

use tributary_types::Record;

use crate::cdc::{CdcPartitionComputer, ComputedRecord};
use crate::error::SinkResult;
use crate::partition::{partition_path, BucketId};

const DEFAULT_CACHE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy)]
pub struct AssignerContext {
    pub subtask_index: usize,
    pub current_processing_time: SystemTime,
}

/// Resolves the bucket a record belongs to within one writer instance.
pub trait BucketAssigner: Send {
    fn get_bucket_id(
        &mut self,
        record: &Record,
        context: &AssignerContext,
    ) -> SinkResult<ComputedRecord>;

    /// Directory of a bucket, relative to the table's base path.
    fn bucket_path(&self, bucket_id: &BucketId) -> String;
}

/// Remembers the most recently resolved partition paths, evicting the oldest first.
#[derive(Debug)]
struct PathCache {
    capacity: usize,
    paths: HashMap<Vec<String>, String>,
    order: VecDeque<Vec<String>>,
}

impl PathCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            paths: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    fn get_or_insert_with(&mut self, key: Vec<String>, f: impl FnOnce() -> String) -> String {
        if let Some(path) = self.paths.get(&key) {
            return path.clone();
        }
        let path = f();
        if self.capacity == 0 {
            return path;
        }
        if self.paths.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.paths.remove(&oldest);
            }
        }
        self.order.push_back(key.clone());
        self.paths.insert(key, path.clone());
        path
    }

    fn len(&self) -> usize {
        self.paths.len()
    }
}

/// Assigns records to hive-style partition buckets.
#[derive(Debug)]
pub struct PartitionBucketAssigner {
    computer: CdcPartitionComputer,
    cache: PathCache,
}

impl PartitionBucketAssigner {
    pub fn new(computer: CdcPartitionComputer) -> Self {
        Self::with_cache_capacity(computer, DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_cache_capacity(computer: CdcPartitionComputer, capacity: usize) -> Self {
        Self {
            computer,
            cache: PathCache::new(capacity),
        }
    }

    pub fn computer(&self) -> &CdcPartitionComputer {
        &self.computer
    }

    pub fn cached_paths(&self) -> usize {
        self.cache.len()
    }
}

impl BucketAssigner for PartitionBucketAssigner {
    fn get_bucket_id(
        &mut self,
        record: &Record,
        _context: &AssignerContext,
    ) -> SinkResult<ComputedRecord> {
        let values = self.computer.generator().partition_values(record);
        let key: Vec<String> = values.iter().map(|(_, v)| v.clone()).collect();
        let path = self
            .cache
            .get_or_insert_with(key, || partition_path(&values));
        self.computer.finish(record, path, values)
    }

    fn bucket_path(&self, bucket_id: &BucketId) -> String {
        bucket_id.as_str().to_string()
    }
}
