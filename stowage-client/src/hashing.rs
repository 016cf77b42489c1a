//! Whole-file digests off the upload's critical path.

use std::{io, path::{Path, PathBuf}};

use tokio::{fs, io::AsyncReadExt, task::JoinHandle};
use xxhash_rust::xxh64::Xxh64;

const HASH_BUF: usize = 256 * 1024;

/// Streaming XXH64 (seed 0) of a file, lowercase hex.
///
/// The loop yields between reads so a single-threaded runtime keeps
/// servicing the concurrent upload.
///
/// # Errors
///
/// Local I/O failures.
pub async fn file_xxh64(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path).await?;
    let mut state = Xxh64::new(0);
    let mut buf = vec![0_u8; HASH_BUF];

    loop {
        let n = file.read(&mut buf).await?;

        if n == 0 {
            break;
        }

        state.update(&buf[..n]);
        tokio::task::yield_now().await;
    }

    Ok(format!("{:016x}", state.digest()))
}

/// Kick the digest off beside the upload; await the handle only when
/// the merge needs the result.
#[must_use]
pub fn spawn_file_xxh64(path: PathBuf) -> JoinHandle<io::Result<String>> {
    tokio::spawn(async move { file_xxh64(&path).await })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hashes_a_small_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        std::fs::write(&path, b"hello\n").unwrap();

        assert_eq!(file_xxh64(&path).await.unwrap(), "26c7827d889f6da3");
    }

    #[tokio::test]
    async fn hashes_an_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.bin");
        std::fs::write(&path, b"").unwrap();

        assert_eq!(file_xxh64(&path).await.unwrap(), "ef46db3751d8e999");
    }

    #[tokio::test]
    async fn detached_digest_matches_inline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, vec![0xAB_u8; 700_000]).unwrap();

        let detached = spawn_file_xxh64(path.clone()).await.unwrap().unwrap();

        assert_eq!(detached, file_xxh64(&path).await.unwrap());
    }
}
