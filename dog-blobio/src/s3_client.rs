use std::collections::HashMap;
use std::env;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use bytes::{Bytes, BytesMut};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::runtime::Runtime;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::client::{clamp_length, partition_range, split_blocks};
use crate::{
    BlobAddress, BlobIoResult, BlockBlobClient, BlockBlobClientFactory, BlockId, ResolvedCredential,
    StageTask, TransferConfig, TransferError, TransferResult,
};

/// S3 rejects multipart parts below this size unless they are the last one
const MIN_PART_BYTES: usize = 5 * 1024 * 1024;

/// S3 connection settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct S3ClientConfig {
    pub region: Option<String>,
    /// Overrides the endpoint taken from `http(s)://` addresses
    pub endpoint_url: Option<String>,
    pub force_path_style: bool,
    pub transfer: TransferConfig,
}

impl S3ClientConfig {
    /// Read `DOG_BLOBIO_REGION`, `DOG_BLOBIO_ENDPOINT_URL` and
    /// `DOG_BLOBIO_FORCE_PATH_STYLE`; anything unset keeps its default.
    pub fn from_env() -> Self {
        Self {
            region: env::var("DOG_BLOBIO_REGION").ok(),
            endpoint_url: env::var("DOG_BLOBIO_ENDPOINT_URL").ok(),
            force_path_style: env::var("DOG_BLOBIO_FORCE_PATH_STYLE")
                .map(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
            transfer: TransferConfig::default(),
        }
    }

    pub fn with_region<S: Into<String>>(mut self, region: S) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_endpoint_url<S: Into<String>>(mut self, endpoint_url: S) -> Self {
        self.endpoint_url = Some(endpoint_url.into());
        self
    }

    pub fn with_force_path_style(mut self) -> Self {
        self.force_path_style = true;
        self
    }

    pub fn with_transfer(mut self, transfer: TransferConfig) -> Self {
        self.transfer = transfer;
        self
    }
}

/// Where an address points inside S3
#[derive(Debug, Clone, PartialEq, Eq)]
struct S3Location {
    bucket: String,
    key: String,
    /// Set for `http(s)://host/bucket/key` addresses
    endpoint: Option<String>,
}

impl S3Location {
    fn from_address(address: &BlobAddress) -> TransferResult<Self> {
        // A presigned URL authorizes one request with one method, while a
        // handle issues head, ranged get and multipart calls
        if address.has_presigned_signature() {
            return Err(TransferError::invalid_address(format!(
                "{} is presigned; open S3 objects with credentials instead",
                address.without_query()
            )));
        }
        let url = address.url();
        let path = url.path().trim_start_matches('/');
        let (bucket, key, endpoint) = match url.scheme() {
            "s3" => {
                let bucket = url
                    .host_str()
                    .ok_or_else(|| TransferError::invalid_address(format!("{} has no bucket", address)))?;
                (bucket.to_string(), path.to_string(), None)
            }
            "http" | "https" => {
                let (bucket, key) = path
                    .split_once('/')
                    .ok_or_else(|| TransferError::invalid_address(format!("{} has no object key", address)))?;
                let host = url
                    .host_str()
                    .ok_or_else(|| TransferError::invalid_address(format!("{} has no host", address)))?;
                let endpoint = match url.port() {
                    Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
                    None => format!("{}://{}", url.scheme(), host),
                };
                (bucket.to_string(), key.to_string(), Some(endpoint))
            }
            other => {
                return Err(TransferError::invalid_address(format!(
                    "Unsupported scheme {} (use s3://, http:// or https://)",
                    other
                )))
            }
        };
        if bucket.is_empty() || key.is_empty() {
            return Err(TransferError::invalid_address(format!(
                "{} must name both a bucket and a key",
                address
            )));
        }
        Ok(Self { bucket, key, endpoint })
    }
}

/// Builds [`S3BlockBlobClient`]s
#[derive(Debug, Clone)]
pub struct S3ClientFactory {
    config: S3ClientConfig,
}

impl S3ClientFactory {
    pub fn new(config: S3ClientConfig) -> BlobIoResult<Self> {
        config.transfer.validate()?;
        Ok(Self { config })
    }

    async fn load_sdk_config(&self, endpoint: Option<&str>, credential: ResolvedCredential) -> SdkConfig {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &self.config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(endpoint) = self.config.endpoint_url.as_deref().or(endpoint) {
            loader = loader.endpoint_url(endpoint);
        }
        loader = match credential {
            ResolvedCredential::Ambient => loader,
            ResolvedCredential::Anonymous => loader.no_credentials(),
            ResolvedCredential::Explicit(credentials) => loader.credentials_provider(credentials),
        };
        loader.load().await
    }
}

impl BlockBlobClientFactory for S3ClientFactory {
    fn client_for(
        &self,
        address: &BlobAddress,
        credential: ResolvedCredential,
    ) -> TransferResult<Box<dyn BlockBlobClient>> {
        let location = S3Location::from_address(address)?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("dog-blobio")
            .build()
            .map_err(TransferError::backend)?;

        let sdk_config = runtime.block_on(self.load_sdk_config(location.endpoint.as_deref(), credential));
        let path_style = self.config.force_path_style || location.endpoint.is_some();
        let client = Client::from_conf(
            aws_sdk_s3::config::Builder::from(&sdk_config)
                .force_path_style(path_style)
                .build(),
        );

        let transfer = self.config.transfer.clone();
        Ok(Box::new(S3BlockBlobClient {
            runtime: Some(runtime),
            permits: Arc::new(Semaphore::new(transfer.max_in_flight_stages)),
            transfer,
            properties: OnceCell::new(),
            next_part: AtomicI32::new(1),
            inner: Arc::new(S3Object {
                client,
                bucket: location.bucket,
                key: location.key,
                upload_id: tokio::sync::OnceCell::new(),
                parts: Mutex::new(HashMap::new()),
            }),
        }))
    }
}

#[derive(Debug, Clone)]
struct ObjectProperties {
    size: u64,
    etag: Option<String>,
}

/// Block blob client over one S3 object.
///
/// Stage operations are multipart-upload parts numbered in submission
/// order; commit completes the upload and discard aborts it. A payload is
/// cut into `block_bytes` parts and a short tail joins the part before it,
/// so every part is at least 5 MiB unless its whole payload was smaller.
/// Such a payload only comes from the final flush at close or from an
/// explicit mid-stream `flush`; avoid the latter on S3 handles.
pub struct S3BlockBlobClient {
    runtime: Option<Runtime>,
    inner: Arc<S3Object>,
    transfer: TransferConfig,
    properties: OnceCell<ObjectProperties>,
    permits: Arc<Semaphore>,
    next_part: AtomicI32,
}

struct S3Object {
    client: Client,
    bucket: String,
    key: String,
    upload_id: tokio::sync::OnceCell<String>,
    parts: Mutex<HashMap<BlockId, (i32, Option<String>)>>,
}

impl S3BlockBlobClient {
    fn runtime(&self) -> TransferResult<&Runtime> {
        self.runtime
            .as_ref()
            .ok_or_else(|| TransferError::backend_message("S3 client is closed"))
    }

    fn properties(&self) -> TransferResult<&ObjectProperties> {
        let runtime = self.runtime()?;
        self.properties
            .get_or_try_init(|| runtime.block_on(self.inner.head()))
    }
}

impl BlockBlobClient for S3BlockBlobClient {
    fn size(&self) -> TransferResult<u64> {
        Ok(self.properties()?.size)
    }

    fn download(&self, offset: u64, length: Option<u64>) -> TransferResult<Bytes> {
        let properties = self.properties()?;
        let length = clamp_length(properties.size, offset, length);
        if length == 0 {
            return Ok(Bytes::new());
        }
        let etag = properties.etag.as_deref();
        let runtime = self.runtime()?;

        if length < self.transfer.partitioned_download_threshold {
            return runtime.block_on(self.inner.get_range(offset, length, etag));
        }

        let ranges = partition_range(offset, length, self.transfer.partition_bytes);
        debug!(offset, length, partitions = ranges.len(), "partitioned download");
        runtime.block_on(async {
            let partitions = futures::future::try_join_all(
                ranges
                    .into_iter()
                    .map(|(start, size)| self.inner.get_range(start, size, etag)),
            )
            .await?;
            let mut content = BytesMut::with_capacity(length as usize);
            for partition in partitions {
                content.extend_from_slice(&partition);
            }
            Ok(content.freeze())
        })
    }

    fn stage(&self, data: Bytes) -> TransferResult<Vec<StageTask>> {
        if data.is_empty() {
            return Err(TransferError::EmptyStage);
        }
        let runtime = self.runtime()?;
        let min_part = self.transfer.min_block_bytes.max(MIN_PART_BYTES);

        let mut tasks = Vec::new();
        for block in split_blocks(data, self.transfer.block_bytes, min_part) {
            // Waits here while max_in_flight_stages uploads are outstanding
            let permit = runtime
                .block_on(self.permits.clone().acquire_owned())
                .map_err(TransferError::backend)?;
            let part_number = self.next_part.fetch_add(1, Ordering::SeqCst);
            let block_id = BlockId::generate();
            let (completer, task) = StageTask::pending();
            let inner = self.inner.clone();

            runtime.spawn(async move {
                let result = inner.upload_part(part_number, block_id, block).await;
                drop(permit);
                completer.complete(result);
            });
            tasks.push(task);
        }
        Ok(tasks)
    }

    fn commit(&self, block_ids: &[BlockId]) -> TransferResult<()> {
        self.runtime()?.block_on(self.inner.complete(block_ids))
    }

    fn discard(&self) -> TransferResult<()> {
        let runtime = self.runtime()?;
        // Let running part uploads finish so none lands after the abort
        let all = u32::try_from(self.transfer.max_in_flight_stages).unwrap_or(u32::MAX);
        let _drained = runtime
            .block_on(self.permits.acquire_many(all))
            .map_err(TransferError::backend)?;
        match self.inner.upload_id.get() {
            Some(upload_id) => runtime.block_on(self.inner.abort(upload_id)),
            None => Ok(()),
        }
    }

    fn close(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl S3Object {
    fn address(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.key)
    }

    async fn head(&self) -> TransferResult<ObjectProperties> {
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .send()
            .await
            .map_err(|error| {
                if error.as_service_error().map_or(false, |e| e.is_not_found()) {
                    TransferError::not_found(self.address())
                } else {
                    TransferError::backend(error)
                }
            })?;

        Ok(ObjectProperties {
            size: output.content_length.unwrap_or(0).max(0) as u64,
            etag: output.e_tag,
        })
    }

    async fn get_range(&self, start: u64, length: u64, etag: Option<&str>) -> TransferResult<Bytes> {
        let mut request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .range(format_range(start, length));
        if let Some(etag) = etag {
            request = request.if_match(etag);
        }

        let output = request.send().await.map_err(TransferError::backend)?;
        let body = output.body.collect().await.map_err(TransferError::backend)?;
        Ok(body.into_bytes())
    }

    async fn upload_id(&self) -> TransferResult<&str> {
        let upload_id = self
            .upload_id
            .get_or_try_init(|| async {
                let output = self
                    .client
                    .create_multipart_upload()
                    .bucket(&self.bucket)
                    .key(&self.key)
                    .send()
                    .await
                    .map_err(TransferError::backend)?;
                debug!(address = %self.address(), "started multipart upload");
                output
                    .upload_id
                    .ok_or_else(|| TransferError::backend_message("create_multipart_upload returned no upload id"))
            })
            .await?;
        Ok(upload_id.as_str())
    }

    async fn upload_part(&self, part_number: i32, block_id: BlockId, block: Bytes) -> TransferResult<BlockId> {
        let upload_id = self.upload_id().await?;
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(block))
            .send()
            .await
            .map_err(TransferError::backend)?;

        self.parts
            .lock()
            .insert(block_id.clone(), (part_number, output.e_tag));
        Ok(block_id)
    }

    /// Parts for `block_ids`, which must follow staging order
    fn ordered_parts(&self, block_ids: &[BlockId]) -> TransferResult<Vec<CompletedPart>> {
        let parts = self.parts.lock();
        let mut ordered = Vec::with_capacity(block_ids.len());
        let mut previous = 0;
        for block_id in block_ids {
            let (part_number, etag) = parts.get(block_id).ok_or_else(|| TransferError::UnknownBlock {
                block_id: block_id.clone(),
            })?;
            if *part_number <= previous {
                return Err(TransferError::backend_message(
                    "S3 blocks must be committed in the order they were staged",
                ));
            }
            previous = *part_number;
            ordered.push(
                CompletedPart::builder()
                    .set_e_tag(etag.clone())
                    .part_number(*part_number)
                    .build(),
            );
        }
        Ok(ordered)
    }

    async fn complete(&self, block_ids: &[BlockId]) -> TransferResult<()> {
        if block_ids.is_empty() {
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&self.key)
                .body(ByteStream::from_static(b""))
                .send()
                .await
                .map_err(TransferError::backend)?;
            if let Some(upload_id) = self.upload_id.get() {
                if let Err(error) = self.abort(upload_id).await {
                    warn!(address = %self.address(), error = %error, "failed to abort unused multipart upload");
                }
            }
            return Ok(());
        }

        let parts = self.ordered_parts(block_ids)?;
        let upload_id = self
            .upload_id
            .get()
            .ok_or_else(|| TransferError::backend_message("no multipart upload in progress"))?;

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(upload_id)
            .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(parts)).build())
            .send()
            .await
            .map_err(TransferError::backend)?;
        Ok(())
    }

    async fn abort(&self, upload_id: &str) -> TransferResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(TransferError::backend)?;
        debug!(address = %self.address(), "aborted multipart upload");
        Ok(())
    }
}

fn format_range(start: u64, length: u64) -> String {
    format!("bytes={}-{}", start, start + length - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location(address: &str) -> TransferResult<S3Location> {
        S3Location::from_address(&BlobAddress::parse(address).unwrap())
    }

    #[test]
    fn test_s3_scheme_location() {
        let parsed = location("s3://models/checkpoints/epoch-1.pt").unwrap();
        assert_eq!(parsed.bucket, "models");
        assert_eq!(parsed.key, "checkpoints/epoch-1.pt");
        assert_eq!(parsed.endpoint, None);
    }

    #[test]
    fn test_path_style_location() {
        let parsed = location("http://localhost:9000/models/epoch-1.pt?versionId=3").unwrap();
        assert_eq!(parsed.bucket, "models");
        assert_eq!(parsed.key, "epoch-1.pt");
        assert_eq!(parsed.endpoint.as_deref(), Some("http://localhost:9000"));
    }

    #[test]
    fn test_presigned_address_rejected() {
        let err = location("https://s3.example.com/models/epoch-1.pt?X-Amz-Signature=abc").unwrap_err();
        match err {
            TransferError::InvalidAddress { message } => {
                assert!(message.contains("presigned"));
                assert!(!message.contains("abc"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_location_requires_bucket_and_key() {
        assert!(matches!(location("s3://models/"), Err(TransferError::InvalidAddress { .. })));
        assert!(matches!(location("https://host/models"), Err(TransferError::InvalidAddress { .. })));
        assert!(matches!(location("ftp://host/a/b"), Err(TransferError::InvalidAddress { .. })));
    }

    #[test]
    fn test_format_range_is_inclusive() {
        assert_eq!(format_range(0, 2), "bytes=0-1");
        assert_eq!(format_range(10, 16), "bytes=10-25");
    }

    #[test]
    fn test_config_builders_and_validation() {
        let config = S3ClientConfig::default().with_region("eu-west-1").with_force_path_style();
        assert_eq!(config.region.as_deref(), Some("eu-west-1"));
        assert!(config.force_path_style);
        assert!(S3ClientFactory::new(config).is_ok());
        assert!(S3ClientFactory::new(
            S3ClientConfig::default().with_transfer(TransferConfig::new().with_block_bytes(0))
        )
        .is_err());
    }
}
