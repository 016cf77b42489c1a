//! Deterministic upload ids.
//!
//! The id is derived from the destination path, the total size and a
//! fingerprint of the first mebibyte, so re-running an interrupted
//! upload resumes into the same staging area on the server.

use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::{fs, io::AsyncReadExt};

/// How much of the file's head feeds the fingerprint.
pub const FINGERPRINT_WINDOW: usize = 1 << 20;

/// SHA-256 prefix length kept in the fingerprint. Eight bytes bound
/// the risk of two different files at the same path colliding.
const FINGERPRINT_BYTES: usize = 8;

/// Derive the upload id for a source.
///
/// Same `(path, size, head)` always derives the same id, across runs
/// and machines. The base64 specials `+/=` are replaced with `_` so
/// the id stays query- and filesystem-safe.
///
/// ```
/// use stowage_client::fingerprint::fingerprint;
///
/// let a = fingerprint("docs/report.pdf", 100, b"head");
/// let b = fingerprint("docs/report.pdf", 100, b"head");
/// assert_eq!(a, b);
///
/// assert_ne!(a, fingerprint("docs/report.pdf", 101, b"head"));
/// assert!(!a.contains(['+', '/', '=']));
/// ```
#[must_use]
pub fn fingerprint(path: &str, size: u64, head: &[u8]) -> String {
    let window = &head[..head.len().min(FINGERPRINT_WINDOW)];
    let digest = Sha256::digest(window);
    let prefix = hex::encode(&digest[..FINGERPRINT_BYTES]);

    base64::encode(format!("{path}|{size}|{prefix}")).replace(['+', '/', '='], "_")
}

/// Fingerprint a file on disk, reading at most the first mebibyte.
///
/// # Errors
///
/// Local I/O failures.
pub async fn file_fingerprint(local: &Path, remote_path: &str) -> std::io::Result<String> {
    let mut file = fs::File::open(local).await?;
    let size = file.metadata().await?.len();

    let mut head = vec![0_u8; FINGERPRINT_WINDOW.min(usize::try_from(size).unwrap_or(usize::MAX))];
    file.read_exact(&mut head).await?;

    Ok(fingerprint(remote_path, size, &head))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_changes_the_id() {
        let a = fingerprint("a.bin", 10, b"0123456789");
        let b = fingerprint("a.bin", 10, b"0123456780");

        assert_ne!(a, b);
    }

    #[test]
    fn bytes_past_the_window_are_ignored() {
        let mut head = vec![0xAB_u8; FINGERPRINT_WINDOW + 1];
        let a = fingerprint("a.bin", head.len() as u64, &head);

        head[FINGERPRINT_WINDOW] = 0xCD;
        let b = fingerprint("a.bin", head.len() as u64, &head);

        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn file_fingerprint_matches_in_memory_derivation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("src.bin");
        std::fs::write(&path, b"hello\n").unwrap();

        let from_file = file_fingerprint(&path, "docs/hello.txt").await.unwrap();

        assert_eq!(from_file, fingerprint("docs/hello.txt", 6, b"hello\n"));
    }
}
