#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use dog_blobio::{
    BlobAddress, BlobIo, BlobIoConfig, BlockBlobClient, BlockBlobClientFactory, BlockId, OpenOptions,
    ResolvedCredential, StageCompleter, StageTask, TransferError, TransferResult,
};

pub const ADDRESS: &str = "mem://bucket/blob";

/// How the next `stage` call behaves
#[derive(Debug, Clone)]
pub enum StageScript {
    /// Finish immediately with a fresh id
    Succeed,
    /// Finish immediately with a transfer failure
    Fail(&'static str),
    /// Stay pending until the test completes it
    Defer,
    /// Finish immediately with the given id
    Reuse(&'static str),
    /// Refuse the submission itself
    Reject(&'static str),
}

#[derive(Debug, Default)]
pub struct Recorded {
    pub downloads: Vec<(u64, Option<u64>)>,
    pub size_calls: usize,
    pub stages: Vec<Bytes>,
    pub commits: Vec<Vec<BlockId>>,
    pub discards: usize,
    pub close_calls: usize,
    pub fail_commit: Option<&'static str>,
    script: VecDeque<StageScript>,
    deferred: Vec<Option<(StageCompleter, BlockId)>>,
    next_id: usize,
}

/// Client and factory in one, recording every call the handle makes
#[derive(Debug, Clone, Default)]
pub struct ScriptedClient {
    content: Bytes,
    state: Arc<Mutex<Recorded>>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_content(content: &'static [u8]) -> Self {
        Self {
            content: Bytes::from_static(content),
            state: Arc::default(),
        }
    }

    pub fn script(&self, steps: impl IntoIterator<Item = StageScript>) -> &Self {
        self.state.lock().script.extend(steps);
        self
    }

    pub fn fail_commit(&self, message: &'static str) {
        self.state.lock().fail_commit = Some(message);
    }

    pub fn recorded<T>(&self, read: impl FnOnce(&Recorded) -> T) -> T {
        read(&self.state.lock())
    }

    pub fn downloads(&self) -> Vec<(u64, Option<u64>)> {
        self.recorded(|r| r.downloads.clone())
    }

    pub fn staged(&self) -> Vec<Bytes> {
        self.recorded(|r| r.stages.clone())
    }

    pub fn commits(&self) -> Vec<Vec<BlockId>> {
        self.recorded(|r| r.commits.clone())
    }

    pub fn is_closed(&self) -> bool {
        self.recorded(|r| r.close_calls > 0)
    }

    pub fn discards(&self) -> usize {
        self.recorded(|r| r.discards)
    }

    /// Ids handed out by deferred stages, in submission order
    pub fn deferred_ids(&self) -> Vec<BlockId> {
        self.recorded(|r| r.deferred.iter().flatten().map(|(_, id)| id.clone()).collect())
    }

    /// Resolve the `index`-th deferred stage successfully
    pub fn succeed_deferred(&self, index: usize) {
        let (completer, block_id) = self.take_deferred(index);
        completer.complete(Ok(block_id));
    }

    pub fn fail_deferred(&self, index: usize, message: &'static str) {
        let (completer, _) = self.take_deferred(index);
        completer.complete(Err(TransferError::backend_message(message)));
    }

    /// Drop the completer without resolving it
    pub fn abandon_deferred(&self, index: usize) {
        drop(self.take_deferred(index));
    }

    fn take_deferred(&self, index: usize) -> (StageCompleter, BlockId) {
        self.state.lock().deferred[index]
            .take()
            .expect("deferred stage already resolved")
    }

    pub fn open_read(&self, config: BlobIoConfig) -> BlobIo {
        BlobIo::open_with(ADDRESS, "rb", self, OpenOptions::new().with_config(config)).unwrap()
    }

    pub fn open_write(&self, write_buffer_bytes: usize) -> BlobIo {
        let config = BlobIoConfig::new().with_write_buffer_bytes(write_buffer_bytes);
        BlobIo::open_with(ADDRESS, "wb", self, OpenOptions::new().with_config(config)).unwrap()
    }
}

impl BlockBlobClientFactory for ScriptedClient {
    fn client_for(
        &self,
        _address: &BlobAddress,
        _credential: ResolvedCredential,
    ) -> TransferResult<Box<dyn BlockBlobClient>> {
        Ok(Box::new(self.clone()))
    }
}

impl BlockBlobClient for ScriptedClient {
    fn size(&self) -> TransferResult<u64> {
        self.state.lock().size_calls += 1;
        Ok(self.content.len() as u64)
    }

    fn download(&self, offset: u64, length: Option<u64>) -> TransferResult<Bytes> {
        self.state.lock().downloads.push((offset, length));
        let start = (offset as usize).min(self.content.len());
        let end = match length {
            Some(length) => (start + length as usize).min(self.content.len()),
            None => self.content.len(),
        };
        Ok(self.content.slice(start..end))
    }

    fn stage(&self, data: Bytes) -> TransferResult<Vec<StageTask>> {
        let mut state = self.state.lock();
        let step = state.script.pop_front().unwrap_or(StageScript::Succeed);
        if let StageScript::Reject(message) = step {
            return Err(TransferError::backend_message(message));
        }
        state.stages.push(data);
        let block_id = BlockId(format!("block-{}", state.next_id));
        state.next_id += 1;

        let task = match step {
            StageScript::Succeed => StageTask::completed(Ok(block_id)),
            StageScript::Fail(message) => StageTask::completed(Err(TransferError::backend_message(message))),
            StageScript::Reuse(id) => StageTask::completed(Ok(BlockId::from(id))),
            StageScript::Defer => {
                let (completer, task) = StageTask::pending();
                state.deferred.push(Some((completer, block_id)));
                task
            }
            StageScript::Reject(_) => unreachable!(),
        };
        Ok(vec![task])
    }

    fn commit(&self, block_ids: &[BlockId]) -> TransferResult<()> {
        let mut state = self.state.lock();
        if let Some(message) = state.fail_commit {
            return Err(TransferError::backend_message(message));
        }
        state.commits.push(block_ids.to_vec());
        Ok(())
    }

    fn discard(&self) -> TransferResult<()> {
        self.state.lock().discards += 1;
        Ok(())
    }

    fn close(&mut self) {
        self.state.lock().close_calls += 1;
    }
}
