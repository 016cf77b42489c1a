//! Wire types shared by the HTTP surface and the splitter client.

use serde::{Deserialize, Serialize};

use crate::{
    hash::HashView,
    path::{FilePath, UploadId},
    queue::TaskStatus,
};

/// Common response envelope. `code == 200` is success; everything else
/// carries the failure in `message`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct Reply<T> {
    /// 200 on success, an HTTP-style error code otherwise.
    pub code: u16,
    /// Human-readable status.
    pub message: String,
    /// Payload, present on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> Reply<T> {
    /// Wrap a successful payload.
    pub fn ok(data: T) -> Self {
        Self {
            code: 200,
            message: "success".to_owned(),
            data: Some(data),
        }
    }

    /// Build a failure envelope.
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Did the request succeed?
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.code == 200
    }
}

/// `data` of a successful `PutChunk`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkData {
    /// CRC-32 the server computed over the persisted slice.
    pub crc32: String,
}

/// Body of `POST /fs/put/chunk/merge`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeRequest {
    /// Client-derived upload identifier.
    pub upload_id: UploadId,
    /// Destination path, relative to the user's root.
    pub path: FilePath,
    /// How many slices the staging area must hold.
    pub total_chunks: u64,
    /// Detach the merge and reply immediately with a task id.
    #[serde(default)]
    pub as_task: bool,
    /// Replace an existing object at the destination.
    #[serde(default)]
    pub overwrite: bool,
    /// Source modification time, milliseconds since the epoch.
    #[serde(default)]
    pub last_modified: i64,
    /// Client-computed whole-file XXH64, lowercase hex. Empty when the
    /// client could not hash.
    #[serde(default)]
    pub hash: String,
}

/// `data` of a merge reply; exactly one of the fields is set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergeData {
    /// Whole-file digests (synchronous path).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<HashView>,
    /// Task descriptor (asynchronous path).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<TaskInfo>,
}

/// Descriptor of a detached merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    /// Task identifier, `merge-<upload_id>`.
    pub id: String,
    /// `processing`, `succeeded` or `failed`.
    pub status: String,
    /// Human-readable detail.
    pub message: String,
    /// Whole-file digests, once the task succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<HashView>,
}

impl TaskInfo {
    /// Render a queue status for the wire.
    #[must_use]
    pub fn from_status(id: impl Into<String>, status: &TaskStatus) -> Self {
        let id = id.into();

        match status {
            TaskStatus::Processing => Self {
                id,
                status: "processing".to_owned(),
                message: "merging chunks".to_owned(),
                hash: None,
            },
            TaskStatus::Succeeded(hash) => Self {
                id,
                status: "succeeded".to_owned(),
                message: "merge complete".to_owned(),
                hash: Some(hash.clone()),
            },
            TaskStatus::Failed(message) => Self {
                id,
                status: "failed".to_owned(),
                message: message.clone(),
                hash: None,
            },
        }
    }
}

/// `data` of one ranged stream chunk.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StreamProgress {
    /// Bytes the session has accepted so far.
    pub received: u64,
    /// Declared total size.
    pub total: u64,
    /// `true` once the backing store confirmed the whole object.
    pub complete: bool,
}

/// Slice-size settings exposed to splitter clients, in MiB.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UploadSettings {
    /// Slice size for the disk-staged engine.
    pub chunked_upload_chunk_size: u64,
    /// Slice size for the pipe-streamed engine.
    pub stream_upload_chunk_size: u64,
}
