use std::collections::HashSet;
use std::sync::Arc;

use tracing::info;

use crate::{BlobIo, BlobIoError, BlobIoResult, BlockId};

impl BlobIo {
    /// Drain buffered bytes, wait for every stage operation and commit the
    /// produced block ids in submission order.
    pub(crate) fn commit_blob(&mut self) -> BlobIoResult<()> {
        self.drain_stages()?;

        let block_ids = match self.stages.block_ids() {
            Ok(block_ids) => block_ids,
            Err(error) => {
                self.latch(error);
                return self.raise_if_fatal();
            }
        };
        ensure_unique_block_ids(&block_ids)?;

        if let Err(error) = self.client.commit(&block_ids) {
            self.latch(Arc::new(error));
            return self.raise_if_fatal();
        }
        self.committed = true;
        info!(blocks = block_ids.len(), bytes = self.position, "committed blob");
        Ok(())
    }
}

/// Reusing an id would let the service silently drop one of the blocks
fn ensure_unique_block_ids(block_ids: &[BlockId]) -> BlobIoResult<()> {
    let mut seen = HashSet::with_capacity(block_ids.len());
    for block_id in block_ids {
        if !seen.insert(block_id) {
            return Err(BlobIoError::DuplicateBlockId {
                block_id: block_id.clone(),
            });
        }
    }
    Ok(())
}
