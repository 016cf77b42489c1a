//! Error types.

/// Errors produced by the ingest engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Client-supplied input failed validation.
    #[error("{0}")]
    Invalid(String),
    /// The body of a staged slice did not match its declared CRC-32.
    #[error("chunk crc32 mismatch: client sent {declared}, server computed {actual}")]
    ChunkCrc {
        /// Checksum the client declared.
        declared: String,
        /// Checksum the server computed over the persisted slice.
        actual: String,
    },
    /// The concatenated upload did not match the client's whole-file
    /// XXH64.
    #[error("file xxh64 mismatch: client sent {declared}, server computed {actual}")]
    FileHash {
        /// Digest the client declared.
        declared: String,
        /// Digest the server computed over the merged file.
        actual: String,
    },
    /// A slice named by the merge request was never uploaded.
    #[error("chunk {0} not found")]
    ChunkMissing(u64),
    /// The destination exists and overwriting was not requested.
    #[error("object already exists")]
    AlreadyExists,
    /// The destination base name is on the system-file deny list.
    #[error("system files are ignored")]
    SystemFile,
    /// The path escapes the authenticated user's root.
    #[error("path is out of scope")]
    OutOfScope,
    /// No live session for this key; streams must start at offset 0.
    #[error("upload session not found, please start from the first chunk")]
    SessionNotFound,
    /// Disk or backing-store failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
