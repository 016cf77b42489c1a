//! Disk-staged slice ingest.
//!
//! Every request carries one slice of the source object. Slices are
//! persisted under the upload's staging area and individually verified
//! with CRC-32 before the later merge concatenates them.

use std::{io, path::Path};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::{
    fs,
    io::{AsyncReadExt, AsyncWriteExt},
};
use tracing::{debug, instrument};

use crate::{
    driver::Driver,
    errors::Error,
    hash::Algorithm,
    path::UploadId,
    Context,
};

pub(crate) const COPY_BUF: usize = 64 * 1024;

/// Persist one slice under the upload's staging area and verify its
/// CRC-32. Returns the checksum the server computed, lowercase hex.
///
/// Slices are independent and idempotent; re-sending an index
/// overwrites the staged file and re-verifies it.
///
/// # Errors
///
/// [`Error::ChunkCrc`] when `declared_crc32` does not match what was
/// persisted (the slice file is removed again before returning), or
/// [`Error::Io`] on disk failure.
#[instrument(skip(ctx, body))]
pub async fn put_chunk<D, S>(
    ctx: &Context<D>,
    upload_id: &UploadId,
    index: u64,
    body: S,
    declared_crc32: Option<&str>,
) -> crate::Result<String>
where
    D: Driver,
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    let staging = ctx.config().staging_dir(upload_id);
    fs::create_dir_all(&staging).await?;

    let path = staging.join(index.to_string());
    persist(&path, body).await?;

    // The digest must cover what actually hit the disk, not the request
    // body, so the slice is re-read from its file.
    let actual = file_crc32(&path).await?;

    if let Some(declared) = declared_crc32 {
        if declared != actual {
            let _ = fs::remove_file(&path).await;

            return Err(Error::ChunkCrc {
                declared: declared.to_owned(),
                actual,
            });
        }
    }

    debug!(%upload_id, index, crc32 = %actual, "staged chunk");

    Ok(actual)
}

async fn persist<S>(path: &Path, mut body: S) -> crate::Result<()>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    let mut file = fs::File::create(path).await?;

    while let Some(frame) = body.next().await {
        file.write_all(&frame?).await?;
    }

    file.flush().await?;

    Ok(())
}

pub(crate) async fn file_crc32(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path).await?;
    let mut state = Algorithm::Crc32.new_state();
    let mut buf = vec![0_u8; COPY_BUF];

    loop {
        let n = file.read(&mut buf).await?;

        if n == 0 {
            break;
        }

        state.update(&buf[..n]);
    }

    Ok(state.finish())
}

#[cfg(test)]
mod tests {
    use futures_util::stream;

    use crate::{driver::MemoryDriver, Config};

    use super::*;

    fn test_context() -> (tempfile::TempDir, Context<MemoryDriver>) {
        let temp = tempfile::tempdir().unwrap();
        let ctx = Context::new(MemoryDriver::new(), Config::new(temp.path()));

        (temp, ctx)
    }

    fn body(bytes: &'static [u8]) -> impl Stream<Item = io::Result<Bytes>> + Unpin {
        stream::iter([Ok(Bytes::from_static(bytes))])
    }

    fn id(s: &str) -> UploadId {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn stages_and_checksums() {
        let (_temp, ctx) = test_context();
        let upload = id("upload-1");

        let crc = put_chunk(&ctx, &upload, 0, body(b"123456789"), None)
            .await
            .unwrap();

        assert_eq!(crc, "cbf43926");

        let staged = ctx.config().staging_dir(&upload).join("0");
        assert_eq!(std::fs::read(staged).unwrap(), b"123456789");
    }

    #[tokio::test]
    async fn accepts_matching_declared_crc() {
        let (_temp, ctx) = test_context();

        let crc = put_chunk(&ctx, &id("upload-2"), 3, body(b"123456789"), Some("cbf43926"))
            .await
            .unwrap();

        assert_eq!(crc, "cbf43926");
    }

    #[tokio::test]
    async fn crc_mismatch_removes_slice() {
        let (_temp, ctx) = test_context();
        let upload = id("upload-3");

        let err = put_chunk(&ctx, &upload, 1, body(b"123456789"), Some("deadbeef"))
            .await
            .unwrap_err();

        match err {
            Error::ChunkCrc { declared, actual } => {
                assert_eq!(declared, "deadbeef");
                assert_eq!(actual, "cbf43926");
            }
            other => panic!("unexpected error: {other}"),
        }

        let staged = ctx.config().staging_dir(&upload).join("1");
        assert!(!staged.exists(), "mismatched slice must not stay staged");
    }

    #[tokio::test]
    async fn reupload_overwrites() {
        let (_temp, ctx) = test_context();
        let upload = id("upload-4");

        put_chunk(&ctx, &upload, 0, body(b"old old old"), None)
            .await
            .unwrap();
        put_chunk(&ctx, &upload, 0, body(b"123456789"), None)
            .await
            .unwrap();

        let staged = ctx.config().staging_dir(&upload).join("0");
        assert_eq!(std::fs::read(staged).unwrap(), b"123456789");
    }
}
