use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::client::{clamp_length, split_blocks};
use crate::{
    BlobAddress, BlockBlobClient, BlockBlobClientFactory, BlockId, ResolvedCredential, StageTask,
    TransferConfig, TransferError, TransferResult,
};

#[derive(Debug, Default)]
struct ServiceState {
    blobs: HashMap<String, Bytes>,
    staged: HashMap<(String, BlockId), Bytes>,
}

/// In-process block blob service. Committed blobs and uncommitted blocks
/// live in memory and are shared by every client the service hands out.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlobService {
    state: Arc<Mutex<ServiceState>>,
    config: TransferConfig,
}

impl MemoryBlobService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: TransferConfig) -> Self {
        Self {
            state: Arc::default(),
            config,
        }
    }

    /// Store a committed blob directly
    pub fn insert<B: Into<Bytes>>(&self, address: &str, content: B) {
        self.state.lock().blobs.insert(storage_key(address), content.into());
    }

    /// Committed content of a blob
    pub fn get(&self, address: &str) -> Option<Bytes> {
        self.state.lock().blobs.get(&storage_key(address)).cloned()
    }

    /// Blocks staged for `address` and not yet committed
    pub fn staged_block_count(&self, address: &str) -> usize {
        let key = storage_key(address);
        self.state.lock().staged.keys().filter(|(blob, _)| *blob == key).count()
    }
}

impl BlockBlobClientFactory for MemoryBlobService {
    fn client_for(
        &self,
        address: &BlobAddress,
        _credential: ResolvedCredential,
    ) -> TransferResult<Box<dyn BlockBlobClient>> {
        Ok(Box::new(MemoryBlobClient {
            state: self.state.clone(),
            config: self.config.clone(),
            key: address.without_query(),
            size: OnceCell::new(),
        }))
    }
}

/// Client for one blob of a [`MemoryBlobService`]. Stage tasks complete
/// before `stage` returns.
#[derive(Debug)]
pub struct MemoryBlobClient {
    state: Arc<Mutex<ServiceState>>,
    config: TransferConfig,
    key: String,
    size: OnceCell<u64>,
}

impl BlockBlobClient for MemoryBlobClient {
    fn size(&self) -> TransferResult<u64> {
        self.size
            .get_or_try_init(|| {
                self.state
                    .lock()
                    .blobs
                    .get(&self.key)
                    .map(|content| content.len() as u64)
                    .ok_or_else(|| TransferError::not_found(self.key.clone()))
            })
            .copied()
    }

    fn download(&self, offset: u64, length: Option<u64>) -> TransferResult<Bytes> {
        let length = clamp_length(self.size()?, offset, length);
        if length == 0 {
            return Ok(Bytes::new());
        }
        let state = self.state.lock();
        let content = state
            .blobs
            .get(&self.key)
            .ok_or_else(|| TransferError::not_found(self.key.clone()))?;
        let start = offset as usize;
        let end = (start + length as usize).min(content.len());
        Ok(content.slice(start.min(end)..end))
    }

    fn stage(&self, data: Bytes) -> TransferResult<Vec<StageTask>> {
        if data.is_empty() {
            return Err(TransferError::EmptyStage);
        }
        let mut state = self.state.lock();
        let mut tasks = Vec::new();
        for block in split_blocks(data, self.config.block_bytes, self.config.min_block_bytes) {
            let block_id = BlockId::generate();
            state.staged.insert((self.key.clone(), block_id.clone()), block);
            tasks.push(StageTask::completed(Ok(block_id)));
        }
        Ok(tasks)
    }

    fn commit(&self, block_ids: &[BlockId]) -> TransferResult<()> {
        let mut state = self.state.lock();
        let mut content = BytesMut::new();
        for block_id in block_ids {
            let block = state
                .staged
                .get(&(self.key.clone(), block_id.clone()))
                .ok_or_else(|| TransferError::UnknownBlock {
                    block_id: block_id.clone(),
                })?;
            content.extend_from_slice(block);
        }
        // Uncommitted blocks of this blob are discarded, as block services do
        let key = self.key.clone();
        state.staged.retain(|(blob, _), _| *blob != key);
        state.blobs.insert(key, content.freeze());
        Ok(())
    }

    fn discard(&self) -> TransferResult<()> {
        let key = &self.key;
        self.state.lock().staged.retain(|(blob, _), _| blob != key);
        Ok(())
    }

    fn close(&mut self) {}
}

fn storage_key(address: &str) -> String {
    BlobAddress::parse(address)
        .map(|parsed| parsed.without_query())
        .unwrap_or_else(|_| address.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(service: &MemoryBlobService, address: &str) -> Box<dyn BlockBlobClient> {
        let address = BlobAddress::parse(address).unwrap();
        service.client_for(&address, ResolvedCredential::Anonymous).unwrap()
    }

    #[test]
    fn test_stage_splits_into_blocks() {
        let service = MemoryBlobService::with_config(
            TransferConfig::new().with_block_bytes(4).with_min_block_bytes(1),
        );
        let client = client(&service, "mem://bucket/blob");

        let mut tasks = client.stage(Bytes::from_static(b"0123456789")).unwrap();
        assert_eq!(tasks.len(), 3);
        assert_eq!(service.staged_block_count("mem://bucket/blob"), 3);

        let ids: Vec<BlockId> = tasks.iter_mut().map(|t| t.wait().unwrap().clone()).collect();
        client.commit(&ids).unwrap();
        assert_eq!(service.get("mem://bucket/blob").unwrap(), Bytes::from_static(b"0123456789"));
        assert_eq!(service.staged_block_count("mem://bucket/blob"), 0);
    }

    #[test]
    fn test_discard_drops_only_this_blob() {
        let service = MemoryBlobService::new();
        let first = client(&service, "mem://bucket/first");
        let second = client(&service, "mem://bucket/second");
        first.stage(Bytes::from_static(b"abc")).unwrap();
        second.stage(Bytes::from_static(b"def")).unwrap();

        first.discard().unwrap();
        assert_eq!(service.staged_block_count("mem://bucket/first"), 0);
        assert_eq!(service.staged_block_count("mem://bucket/second"), 1);
        assert!(service.get("mem://bucket/first").is_none());
    }

    #[test]
    fn test_stage_rejects_empty_payload() {
        let service = MemoryBlobService::new();
        let client = client(&service, "mem://bucket/blob");
        assert!(matches!(client.stage(Bytes::new()), Err(TransferError::EmptyStage)));
    }

    #[test]
    fn test_commit_empty_list_creates_empty_blob() {
        let service = MemoryBlobService::new();
        client(&service, "mem://bucket/empty").commit(&[]).unwrap();
        assert_eq!(service.get("mem://bucket/empty").unwrap().len(), 0);
    }

    #[test]
    fn test_commit_unknown_block_fails() {
        let service = MemoryBlobService::new();
        let err = client(&service, "mem://bucket/blob")
            .commit(&[BlockId::from("missing")])
            .unwrap_err();
        assert!(matches!(err, TransferError::UnknownBlock { .. }));
        assert!(service.get("mem://bucket/blob").is_none());
    }

    #[test]
    fn test_download_clamps_to_blob_size() {
        let service = MemoryBlobService::new();
        service.insert("mem://bucket/blob?sig=token", &b"abcdef"[..]);
        let client = client(&service, "mem://bucket/blob");

        assert_eq!(client.size().unwrap(), 6);
        assert_eq!(&client.download(4, Some(100)).unwrap()[..], b"ef");
        assert_eq!(&client.download(1, None).unwrap()[..], b"bcdef");
        assert!(client.download(6, Some(1)).unwrap().is_empty());
    }

    #[test]
    fn test_missing_blob_not_found() {
        let service = MemoryBlobService::new();
        let client = client(&service, "mem://bucket/nothing");
        assert!(matches!(client.size(), Err(TransferError::NotFound { .. })));
    }
}
