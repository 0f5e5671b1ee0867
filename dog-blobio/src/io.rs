use std::io::SeekFrom;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tracing::{debug, debug_span, warn, Span};

use crate::buffer::{ReadlineBuffer, WriteBuffer, LINE_TERMINATOR};
use crate::client::clamp_length;
use crate::{
    BlobAddress, BlobIoConfig, BlobIoError, BlobIoResult, BlockBlobClient, BlockBlobClientFactory,
    Credential, OpenMode, S3ClientConfig, S3ClientFactory, StageTasks, TransferError, Whence,
};

/// Options for opening a [`BlobIo`]
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    pub credential: Credential,
    pub config: BlobIoConfig,
    pub span: Option<Span>,
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credential<C: Into<Credential>>(mut self, credential: C) -> Self {
        self.credential = credential.into();
        self
    }

    pub fn with_config(mut self, config: BlobIoConfig) -> Self {
        self.config = config;
        self
    }

    /// Span every operation of the handle runs in
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }
}

/// A file-like handle over one remote block blob.
///
/// A handle is either readable and seekable (`"rb"`) or writable (`"wb"`).
/// Reads turn into ranged downloads. Writes are buffered and submitted as
/// stage operations once the buffer reaches
/// [`BlobIoConfig::write_buffer_bytes`]; the blob only becomes visible when
/// [`BlobIo::close`] commits every staged block in write order.
///
/// Operations run on the caller's thread. The handle blocks on network I/O,
/// so use it from a blocking context rather than inside an async task.
pub struct BlobIo {
    address: BlobAddress,
    mode: OpenMode,
    pub(crate) client: Box<dyn BlockBlobClient>,
    config: BlobIoConfig,
    span: Span,
    pub(crate) position: u64,
    blob_size: Option<u64>,
    closed: bool,
    pub(crate) committed: bool,
    readline_buffer: ReadlineBuffer,
    write_buffer: WriteBuffer,
    pub(crate) stages: StageTasks,
    fatal_error: Option<Arc<TransferError>>,
}

impl BlobIo {
    /// Open an S3 blob, configured from the environment
    pub fn open(address: &str, mode: &str, options: OpenOptions) -> BlobIoResult<Self> {
        let factory = S3ClientFactory::new(S3ClientConfig::from_env())?;
        Self::open_with(address, mode, &factory, options)
    }

    /// Open a blob using clients built by `factory`
    pub fn open_with<F>(address: &str, mode: &str, factory: &F, options: OpenOptions) -> BlobIoResult<Self>
    where
        F: BlockBlobClientFactory + ?Sized,
    {
        let mode: OpenMode = mode.parse()?;
        let address = BlobAddress::parse(address)?;
        options.config.validate()?;

        let credential = options.credential.resolve(&address);
        let client = factory.client_for(&address, credential)?;
        let span = options
            .span
            .unwrap_or_else(|| debug_span!("blob_io", address = %address, mode = %mode));

        Ok(Self {
            address,
            mode,
            client,
            config: options.config,
            span,
            position: 0,
            blob_size: None,
            closed: false,
            committed: false,
            readline_buffer: ReadlineBuffer::new(),
            write_buffer: WriteBuffer::new(),
            stages: StageTasks::new(),
            fatal_error: None,
        })
    }

    pub fn address(&self) -> &BlobAddress {
        &self.address
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn closed(&self) -> bool {
        self.closed
    }

    pub fn readable(&self) -> BlobIoResult<bool> {
        self.ensure_open()?;
        Ok(self.mode.is_read())
    }

    pub fn writable(&self) -> BlobIoResult<bool> {
        self.ensure_open()?;
        Ok(self.mode.is_write())
    }

    pub fn seekable(&self) -> BlobIoResult<bool> {
        self.ensure_open()?;
        Ok(self.mode.is_read())
    }

    pub fn isatty(&self) -> BlobIoResult<bool> {
        self.ensure_open()?;
        Ok(false)
    }

    /// Blobs have no file descriptor
    pub fn fileno(&self) -> BlobIoResult<i32> {
        self.ensure_open()?;
        Err(BlobIoError::unsupported("fileno"))
    }

    pub fn tell(&self) -> BlobIoResult<u64> {
        self.ensure_open()?;
        Ok(self.position)
    }

    /// Total size of the blob, resolved once per handle
    pub fn blob_size(&mut self) -> BlobIoResult<u64> {
        let _span = self.span.clone().entered();
        self.ensure_mode(OpenMode::Read, "size")?;
        self.ensure_open()?;
        self.resolve_blob_size()
    }

    /// Read up to `size` bytes, or to the end of the blob when `size` is
    /// `None`. Returns an empty buffer at end of stream.
    pub fn read(&mut self, size: Option<usize>) -> BlobIoResult<Bytes> {
        let _span = self.span.clone().entered();
        self.ensure_mode(OpenMode::Read, "read")?;
        self.ensure_open()?;
        self.readline_buffer.clear();

        if size == Some(0) {
            return Ok(Bytes::new());
        }
        let blob_size = self.resolve_blob_size()?;
        if self.position >= blob_size {
            return Ok(Bytes::new());
        }

        let length = clamp_length(blob_size, self.position, size.map(|s| s as u64));
        let content = self.client.download(self.position, Some(length))?;
        debug!(offset = self.position, bytes = content.len(), "read range");
        self.position += content.len() as u64;
        Ok(content)
    }

    /// Read through the next `\n` (inclusive), stopping early after `size`
    /// bytes or at end of stream.
    pub fn readline(&mut self, size: Option<usize>) -> BlobIoResult<Bytes> {
        let _span = self.span.clone().entered();
        self.ensure_mode(OpenMode::Read, "readline")?;
        self.ensure_open()?;

        if size == Some(0) {
            return Ok(Bytes::new());
        }
        let blob_size = self.resolve_blob_size()?;
        if self.position >= blob_size {
            return Ok(Bytes::new());
        }

        // The whole blob is the longest line a single call can return
        let limit = size.map_or(blob_size, |s| s as u64);
        let mut line = BytesMut::new();
        self.consume_readline_buffer(&mut line, limit);
        while self.needs_prefetch(&line, limit, blob_size) {
            let chunk = self
                .client
                .download(self.position, Some(self.config.readline_prefetch_bytes))?;
            if chunk.is_empty() {
                break;
            }
            debug!(offset = self.position, bytes = chunk.len(), "readline prefetch");
            self.readline_buffer.refill(chunk);
            self.consume_readline_buffer(&mut line, limit);
        }
        Ok(line.freeze())
    }

    /// All remaining lines
    pub fn readlines(&mut self) -> BlobIoResult<Vec<Bytes>> {
        self.lines().collect()
    }

    /// Iterate over the remaining lines
    pub fn lines(&mut self) -> Lines<'_> {
        Lines { io: self, done: false }
    }

    /// Move the position. Negative results are rejected, not clamped.
    pub fn seek(&mut self, offset: i64, whence: Whence) -> BlobIoResult<u64> {
        let _span = self.span.clone().entered();
        self.ensure_mode(OpenMode::Read, "seek")?;
        self.ensure_open()?;
        self.readline_buffer.clear();

        let base = match whence {
            Whence::Set => 0,
            Whence::Cur => self.position,
            Whence::End => self.resolve_blob_size()?,
        };
        let target = i128::from(base) + i128::from(offset);
        if target < 0 {
            return Err(BlobIoError::invalid("Cannot seek to negative position"));
        }
        self.position = u64::try_from(target)
            .map_err(|_| BlobIoError::invalid(format!("Seek position {} is out of range", target)))?;
        Ok(self.position)
    }

    /// Accept `payload` into the write buffer, staging the buffer once it
    /// reaches the flush threshold. Returns the number of bytes accepted.
    pub fn write(&mut self, payload: &[u8]) -> BlobIoResult<usize> {
        let _span = self.span.clone().entered();
        self.ensure_mode(OpenMode::Write, "write")?;
        self.ensure_open()?;
        self.check_stage_failures(false)?;

        self.write_buffer.append(payload);
        self.position += payload.len() as u64;
        if self.write_buffer.len() >= self.config.write_buffer_bytes {
            self.flush_write_buffer()?;
        }
        Ok(payload.len())
    }

    /// Stage anything still buffered and wait for every in-flight stage
    /// operation. A no-op on read handles.
    pub fn flush(&mut self) -> BlobIoResult<()> {
        let _span = self.span.clone().entered();
        self.ensure_open()?;
        if self.mode.is_read() {
            return Ok(());
        }
        self.drain_stages()
    }

    /// Close the handle. Write handles commit first; when no commit succeeds
    /// the staged blocks are discarded. The handle is closed afterwards even
    /// when the commit fails; closing twice is a no-op.
    pub fn close(&mut self) -> BlobIoResult<()> {
        if self.closed {
            return Ok(());
        }
        let _span = self.span.clone().entered();
        let result = if self.mode.is_write() {
            self.commit_blob()
        } else {
            Ok(())
        };
        self.release();
        debug!(position = self.position, "closed");
        result
    }

    fn release(&mut self) {
        if self.mode.is_write() && !self.committed {
            if let Err(error) = self.client.discard() {
                warn!(error = %error, "failed to discard staged blocks");
            }
        }
        self.client.close();
        self.readline_buffer.clear();
        self.write_buffer.drain();
        self.closed = true;
    }

    fn ensure_open(&self) -> BlobIoResult<()> {
        if self.closed {
            return Err(BlobIoError::Closed);
        }
        Ok(())
    }

    fn ensure_mode(&self, expected: OpenMode, operation: &'static str) -> BlobIoResult<()> {
        if self.mode != expected {
            return Err(BlobIoError::unsupported(operation));
        }
        Ok(())
    }

    fn resolve_blob_size(&mut self) -> BlobIoResult<u64> {
        if let Some(size) = self.blob_size {
            return Ok(size);
        }
        let size = self.client.size()?;
        debug!(size, "resolved blob size");
        self.blob_size = Some(size);
        Ok(size)
    }

    fn consume_readline_buffer(&mut self, line: &mut BytesMut, limit: u64) {
        let remaining = limit.saturating_sub(line.len() as u64);
        let max = usize::try_from(remaining).unwrap_or(usize::MAX);
        let consumed = self.readline_buffer.consume_line(line, max);
        self.position += consumed as u64;
    }

    fn needs_prefetch(&self, line: &[u8], limit: u64, blob_size: u64) -> bool {
        line.last() != Some(&LINE_TERMINATOR)
            && self.position < blob_size
            && (line.len() as u64) < limit
    }

    fn flush_write_buffer(&mut self) -> BlobIoResult<()> {
        if self.write_buffer.is_empty() {
            return Ok(());
        }
        let payload = self.write_buffer.drain();
        let bytes = payload.len();
        match self.client.stage(payload) {
            Ok(tasks) => {
                debug!(bytes, blocks = tasks.len(), "staged write buffer");
                self.stages.track(tasks);
                Ok(())
            }
            Err(error) => {
                self.latch(Arc::new(error));
                self.raise_if_fatal()
            }
        }
    }

    /// Drain the write buffer and wait for all stage operations
    pub(crate) fn drain_stages(&mut self) -> BlobIoResult<()> {
        self.check_stage_failures(false)?;
        self.flush_write_buffer()?;
        self.check_stage_failures(true)
    }

    fn check_stage_failures(&mut self, wait: bool) -> BlobIoResult<()> {
        // Bail before waiting on anything if already failed
        self.raise_if_fatal()?;
        let failure = if wait {
            self.stages.wait_all()
        } else {
            self.stages.poll()
        };
        if let Some(error) = failure {
            self.latch(error);
        }
        self.raise_if_fatal()
    }

    pub(crate) fn latch(&mut self, error: Arc<TransferError>) {
        if self.fatal_error.is_none() {
            warn!(error = %error, "blob write failed, handle can no longer write");
            self.fatal_error = Some(error);
        }
    }

    pub(crate) fn raise_if_fatal(&self) -> BlobIoResult<()> {
        match &self.fatal_error {
            Some(error) => Err(BlobIoError::fatal_write(error.clone())),
            None => Ok(()),
        }
    }
}

impl Drop for BlobIo {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        // Never commit a partially written blob while unwinding
        if std::thread::panicking() {
            self.release();
            return;
        }
        if let Err(error) = self.close() {
            warn!(address = %self.address, error = %error, "failed to close blob on drop");
        }
    }
}

impl std::fmt::Debug for BlobIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobIo")
            .field("address", &self.address.as_str())
            .field("mode", &self.mode)
            .field("position", &self.position)
            .field("blob_size", &self.blob_size)
            .field("closed", &self.closed)
            .field("staged_blocks", &self.stages.len())
            .finish()
    }
}

/// Iterator over the lines of a readable [`BlobIo`]
pub struct Lines<'a> {
    io: &'a mut BlobIo,
    done: bool,
}

impl Iterator for Lines<'_> {
    type Item = BlobIoResult<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.io.readline(None) {
            Ok(line) if line.is_empty() => {
                self.done = true;
                None
            }
            Ok(line) => Some(Ok(line)),
            Err(error) => {
                self.done = true;
                Some(Err(error))
            }
        }
    }
}

impl std::io::Read for BlobIo {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let content = BlobIo::read(self, Some(buf.len()))?;
        buf[..content.len()].copy_from_slice(&content);
        Ok(content.len())
    }
}

impl std::io::Write for BlobIo {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        Ok(BlobIo::write(self, buf)?)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(BlobIo::flush(self)?)
    }
}

impl std::io::Seek for BlobIo {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let (offset, whence) = match pos {
            SeekFrom::Start(offset) => {
                let offset = i64::try_from(offset)
                    .map_err(|_| BlobIoError::invalid(format!("Seek offset {} is out of range", offset)))?;
                (offset, Whence::Set)
            }
            SeekFrom::Current(offset) => (offset, Whence::Cur),
            SeekFrom::End(offset) => (offset, Whence::End),
        };
        Ok(BlobIo::seek(self, offset, whence)?)
    }
}
