use serde::{Deserialize, Serialize};

use crate::{BlobIoError, BlobIoResult};

const MIB: u64 = 1024 * 1024;

/// Configuration for a single blob handle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobIoConfig {
    /// Bytes fetched per download while `readline` looks for a terminator
    pub readline_prefetch_bytes: u64,

    /// Buffered write bytes that trigger a stage submission
    pub write_buffer_bytes: usize,
}

impl Default for BlobIoConfig {
    fn default() -> Self {
        Self {
            readline_prefetch_bytes: 4 * MIB,
            write_buffer_bytes: 32 * MIB as usize,
        }
    }
}

impl BlobIoConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the readline prefetch size
    pub fn with_readline_prefetch_bytes(mut self, bytes: u64) -> Self {
        self.readline_prefetch_bytes = bytes;
        self
    }

    /// Set the write flush threshold
    pub fn with_write_buffer_bytes(mut self, bytes: usize) -> Self {
        self.write_buffer_bytes = bytes;
        self
    }

    pub fn validate(&self) -> BlobIoResult<()> {
        if self.readline_prefetch_bytes == 0 {
            return Err(BlobIoError::invalid("readline_prefetch_bytes must be greater than 0"));
        }
        if self.write_buffer_bytes == 0 {
            return Err(BlobIoError::invalid("write_buffer_bytes must be greater than 0"));
        }
        Ok(())
    }
}

/// Tunables for transfer clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Largest block a single stage task uploads
    pub block_bytes: usize,

    /// Smallest block a stage split may leave behind. A shorter remainder is
    /// folded into the block before it.
    pub min_block_bytes: usize,

    /// Range size used when a download is split into partitions
    pub partition_bytes: u64,

    /// Downloads at least this long are partitioned
    pub partitioned_download_threshold: u64,

    /// Upper bound on submitted-or-running stage uploads
    pub max_in_flight_stages: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            block_bytes: 32 * MIB as usize,
            min_block_bytes: 5 * MIB as usize,
            partition_bytes: 16 * MIB,
            partitioned_download_threshold: 16 * MIB,
            max_in_flight_stages: 8,
        }
    }
}

impl TransferConfig {
    /// Create new transfer config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set block size
    pub fn with_block_bytes(mut self, bytes: usize) -> Self {
        self.block_bytes = bytes;
        self
    }

    /// Set the smallest block a split may produce
    pub fn with_min_block_bytes(mut self, bytes: usize) -> Self {
        self.min_block_bytes = bytes;
        self
    }

    /// Set download partition size
    pub fn with_partition_bytes(mut self, bytes: u64) -> Self {
        self.partition_bytes = bytes;
        self
    }

    /// Set the length at which downloads get partitioned
    pub fn with_partitioned_download_threshold(mut self, bytes: u64) -> Self {
        self.partitioned_download_threshold = bytes;
        self
    }

    /// Set max in-flight stage uploads
    pub fn with_max_in_flight_stages(mut self, max: usize) -> Self {
        self.max_in_flight_stages = max;
        self
    }

    pub fn validate(&self) -> BlobIoResult<()> {
        if self.block_bytes == 0 || self.partition_bytes == 0 {
            return Err(BlobIoError::invalid("block and partition sizes must be greater than 0"));
        }
        if self.max_in_flight_stages == 0 {
            return Err(BlobIoError::invalid("max_in_flight_stages must be greater than 0"));
        }
        if u32::try_from(self.max_in_flight_stages).is_err() {
            return Err(BlobIoError::invalid("max_in_flight_stages must fit in a u32"));
        }
        Ok(())
    }
}
