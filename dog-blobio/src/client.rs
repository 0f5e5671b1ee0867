use bytes::Bytes;

use crate::{BlobAddress, BlockId, ResolvedCredential, StageTask, TransferResult};

/// Block blob operations a [`crate::BlobIo`] handle drives. One client is
/// bound to one blob and owned by exactly one handle.
///
/// Implementations run uploads on their own workers; the handle only sees
/// the returned [`StageTask`]s.
pub trait BlockBlobClient: Send {
    /// Total blob size. Implementations cache the first answer.
    fn size(&self) -> TransferResult<u64>;

    /// Up to `length` bytes starting at `offset`; `None` reads to the end.
    /// Never returns bytes past the blob size.
    fn download(&self, offset: u64, length: Option<u64>) -> TransferResult<Bytes>;

    /// Submit `data` for upload. The data may be split into several blocks;
    /// the returned tasks are in byte order.
    fn stage(&self, data: Bytes) -> TransferResult<Vec<StageTask>>;

    /// Make the blob the concatenation of `block_ids`, in order
    fn commit(&self, block_ids: &[BlockId]) -> TransferResult<()>;

    /// Throw away everything staged but not committed. Called when a write
    /// handle closes without a successful commit.
    fn discard(&self) -> TransferResult<()>;

    /// Release worker threads and connections
    fn close(&mut self);
}

/// Builds clients for addresses
pub trait BlockBlobClientFactory {
    fn client_for(
        &self,
        address: &BlobAddress,
        credential: ResolvedCredential,
    ) -> TransferResult<Box<dyn BlockBlobClient>>;
}

/// Cut `data` into blocks of `block_bytes`. A trailing remainder shorter
/// than `min_block` is appended to the previous block instead of standing
/// alone, so only a payload that is itself short yields a short block.
pub(crate) fn split_blocks(data: Bytes, block_bytes: usize, min_block: usize) -> Vec<Bytes> {
    let block_bytes = block_bytes.max(1);
    let mut blocks = Vec::with_capacity(data.len() / block_bytes + 1);
    let mut remaining = data;
    while !remaining.is_empty() {
        let take = if remaining.len() < block_bytes.saturating_add(min_block) {
            remaining.len()
        } else {
            block_bytes
        };
        blocks.push(remaining.split_to(take));
    }
    blocks
}

/// Split `[offset, offset + length)` into consecutive ranges of at most
/// `partition` bytes
pub(crate) fn partition_range(offset: u64, length: u64, partition: u64) -> Vec<(u64, u64)> {
    let end = offset + length;
    let mut ranges = Vec::new();
    let mut start = offset;
    while start < end {
        let size = partition.min(end - start);
        ranges.push((start, size));
        start += size;
    }
    ranges
}

/// Clamp a requested download to what exists past `offset`
pub(crate) fn clamp_length(size: u64, offset: u64, length: Option<u64>) -> u64 {
    let available = size.saturating_sub(offset);
    match length {
        Some(length) => length.min(available),
        None => available,
    }
}
