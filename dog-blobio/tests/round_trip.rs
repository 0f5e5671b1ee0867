use bytes::{Bytes, BytesMut};
use proptest::prelude::*;

use dog_blobio::{
    BlobIo, BlobIoConfig, BlobIoError, Credential, MemoryBlobService, OpenOptions, TransferConfig, Whence,
};

const ADDRESS: &str = "mem://bucket/round-trip";

fn service(block_bytes: usize, min_block_bytes: usize) -> MemoryBlobService {
    MemoryBlobService::with_config(
        TransferConfig::new()
            .with_block_bytes(block_bytes)
            .with_min_block_bytes(min_block_bytes),
    )
}

fn write_chunks(service: &MemoryBlobService, chunks: &[Vec<u8>], write_buffer_bytes: usize) -> Result<(), BlobIoError> {
    let options = OpenOptions::new().with_config(BlobIoConfig::new().with_write_buffer_bytes(write_buffer_bytes));
    let mut io = BlobIo::open_with(ADDRESS, "wb", service, options)?;
    for chunk in chunks {
        io.write(chunk)?;
    }
    io.close()
}

fn open_read(service: &MemoryBlobService, prefetch: u64) -> BlobIo {
    let options = OpenOptions::new().with_config(BlobIoConfig::new().with_readline_prefetch_bytes(prefetch));
    BlobIo::open_with(ADDRESS, "rb", service, options).unwrap()
}

proptest! {
    #[test]
    fn prop_written_bytes_read_back(
        chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..40), 0..12),
        write_buffer_bytes in 1usize..64,
        block_bytes in 1usize..32,
        min_block_bytes in 0usize..8,
        read_size in 1usize..50,
    ) {
        let service = service(block_bytes, min_block_bytes);
        write_chunks(&service, &chunks, write_buffer_bytes).unwrap();

        let expected: Vec<u8> = chunks.concat();
        prop_assert_eq!(&service.get(ADDRESS).unwrap()[..], &expected[..]);

        let mut io = open_read(&service, 8);
        let mut content = BytesMut::new();
        loop {
            let part = io.read(Some(read_size)).unwrap();
            if part.is_empty() {
                break;
            }
            content.extend_from_slice(&part);
        }
        prop_assert_eq!(&content[..], &expected[..]);
        prop_assert_eq!(io.tell().unwrap(), expected.len() as u64);
    }

    #[test]
    fn prop_lines_concatenate_to_content(
        content in prop::collection::vec(prop::sample::select(vec![b'a', b'b', b'\n']), 0..80),
        prefetch in 1u64..16,
    ) {
        let service = service(7, 3);
        write_chunks(&service, &[content.clone()], 5).unwrap();

        let mut io = open_read(&service, prefetch);
        let lines = io.readlines().unwrap();
        let joined: Vec<u8> = lines.iter().flat_map(|line| line.iter().copied()).collect();
        prop_assert_eq!(&joined[..], &content[..]);
        for line in &lines[..lines.len().saturating_sub(1)] {
            prop_assert_eq!(line.last(), Some(&b'\n'));
            prop_assert_eq!(line.iter().filter(|&&b| b == b'\n').count(), 1);
        }
    }
}

#[test]
fn test_presigned_address_round_trip() {
    let service = service(4, 1);
    let signed = "mem://bucket/signed?sv=2024&sig=token";
    let options = OpenOptions::new()
        .with_credential(Credential::Default)
        .with_config(BlobIoConfig::new().with_write_buffer_bytes(3));

    let mut writer = BlobIo::open_with(signed, "wb", &service, options).unwrap();
    writer.write(b"signed payload").unwrap();
    writer.close().unwrap();

    // Stored under the address without its token
    assert_eq!(service.get("mem://bucket/signed").unwrap(), Bytes::from_static(b"signed payload"));

    let mut reader = BlobIo::open_with(signed, "rb", &service, OpenOptions::new()).unwrap();
    reader.seek(-7, Whence::End).unwrap();
    assert_eq!(&reader.read(None).unwrap()[..], b"payload");
}

#[test]
fn test_missing_blob_reports_not_found() {
    let service = MemoryBlobService::new();
    let mut io = BlobIo::open_with("mem://bucket/missing", "rb", &service, OpenOptions::new()).unwrap();
    let err = io.read(None).unwrap_err();
    assert!(matches!(err, BlobIoError::Transfer { .. }));
    assert_eq!(std::io::Error::from(err).kind(), std::io::ErrorKind::NotFound);
}

#[test]
fn test_uncommitted_writes_stay_invisible() {
    let service = service(4, 1);
    let options = OpenOptions::new().with_config(BlobIoConfig::new().with_write_buffer_bytes(4));
    let mut io = BlobIo::open_with(ADDRESS, "wb", &service, options).unwrap();
    io.write(b"abcdefgh").unwrap();
    io.flush().unwrap();

    assert!(service.get(ADDRESS).is_none());
    assert_eq!(service.staged_block_count(ADDRESS), 2);

    io.close().unwrap();
    assert_eq!(service.get(ADDRESS).unwrap(), Bytes::from_static(b"abcdefgh"));
    assert_eq!(service.staged_block_count(ADDRESS), 0);
}

#[test]
fn test_threshold_flush_leaves_no_short_block() {
    let service = MemoryBlobService::new();
    let mut io = BlobIo::open_with(ADDRESS, "wb", &service, OpenOptions::new()).unwrap();

    // Small header, then a tensor-sized write that crosses the threshold
    io.write(b"x").unwrap();
    io.write(&vec![0u8; 32 * 1024 * 1024]).unwrap();
    io.flush().unwrap();
    assert_eq!(service.staged_block_count(ADDRESS), 1);

    io.close().unwrap();
    assert_eq!(service.get(ADDRESS).unwrap().len(), 32 * 1024 * 1024 + 1);
}
