//! Content hashing shared by every backend (SHA-256, lowercase hex)

use sha2::{Digest, Sha256};
use std::io::SeekFrom;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt};

use super::error::StorageResult;
use super::ContentSource;

const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Calculate SHA256 hash of in-memory content
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Hash a stream to its end. Returns the hex digest and the byte count.
pub async fn hash_reader<R>(reader: &mut R) -> StorageResult<(String, u64)>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let read = reader.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        total += read as u64;
    }

    Ok((format!("{:x}", hasher.finalize()), total))
}

/// Hash the remaining content of a seekable source, then rewind it to where
/// it was so the same source can be transferred afterwards.
pub async fn hash_and_rewind(content: &mut dyn ContentSource) -> StorageResult<(String, u64)> {
    let start = content.stream_position().await?;
    let result = hash_reader(content).await;
    content.seek(SeekFrom::Start(start)).await?;
    result
}
