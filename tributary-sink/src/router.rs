use std::ops::RangeInclusive;

use tributary_types::{hash_key, range_for_server, server_for_hash};

use crate::config_err;
use crate::error::SinkResult;
use crate::partition::BucketId;

/// Sends every record of a bucket to the same writer instance, so each bucket has exactly one
/// owner. Routing is only stable for a fixed number of writers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketRouter {
    num_writers: usize,
}

impl BucketRouter {
    pub fn new(num_writers: usize) -> SinkResult<Self> {
        if num_writers == 0 {
            return Err(config_err!("the number of writers must be at least 1"));
        }
        Ok(Self { num_writers })
    }

    pub fn num_writers(&self) -> usize {
        self.num_writers
    }

    pub fn route(&self, bucket_id: &BucketId) -> usize {
        server_for_hash(hash_key(bucket_id.as_str()), self.num_writers)
    }

    /// The slice of the hash space owned by writer `index`.
    pub fn range_for_writer(&self, index: usize) -> RangeInclusive<u64> {
        range_for_server(index, self.num_writers)
    }
}
