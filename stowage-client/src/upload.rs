use std::{
    fmt, io,
    path::Path,
    sync::Arc,
    time::Duration,
};

use reqwest::{multipart, Body, Method, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use tokio::{
    fs,
    io::{AsyncReadExt, AsyncSeekExt},
};
use tokio_util::codec::{BytesCodec, FramedRead};
use tracing::{debug, error, instrument, warn};

use stowage::{
    hash::Algorithm,
    path::FilePath,
    protocol::{ChunkData, MergeData, MergeRequest, Reply, StreamProgress, UploadSettings},
    range::ContentRange,
};

use crate::{
    errors::Error,
    fingerprint, hashing,
    slice::{Slice, SlicePlan},
    speed::{Progress, ProgressObserver, SpeedMeter},
};

/// Attempts per slice before the whole upload is aborted.
const SLICE_ATTEMPTS: u32 = 3;

/// Pause between attempts.
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Share of the progress bar owned by slice uploads; the merge claims
/// the rest.
const UPLOAD_SPAN: f64 = 95.0;

const MIB: u64 = 1 << 20;

const READ_BUF: usize = 64 * 1024;

/// Which ingest engine to split large files into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engine {
    /// Disk-staged chunks plus a merge request.
    Chunked,
    /// Pipe-streamed ranged puts.
    Stream,
}

/// Per-upload options.
#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// Engine for files above the slice-size threshold.
    pub engine: Engine,
    /// Replace an existing object at the destination.
    pub overwrite: bool,
    /// Source modification time, milliseconds since the epoch.
    pub last_modified: i64,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            engine: Engine::Chunked,
            overwrite: false,
            last_modified: 0,
        }
    }
}

/// How an upload actually travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Single request; the file was at or below the threshold.
    Direct,
    /// Disk-staged chunks.
    Chunked,
    /// Pipe-streamed ranges.
    Stream,
}

/// What an upload left behind.
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    /// Transport that was used.
    pub mode: Mode,
    /// Upload id, for the modes that derive one.
    pub upload_id: Option<String>,
    /// Locally computed whole-file XXH64, when it was needed and
    /// succeeded.
    pub local_xxh64: Option<String>,
}

/// Splitter client for one ingest server.
pub struct Uploader {
    http: reqwest::Client,
    base: Url,
    password: Option<String>,
    chunked_slice: u64,
    stream_slice: u64,
    observer: Option<Arc<dyn ProgressObserver>>,
}

impl fmt::Debug for Uploader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Uploader")
            .field("base", &self.base.as_str())
            .field("chunked_slice", &self.chunked_slice)
            .field("stream_slice", &self.stream_slice)
            .finish_non_exhaustive()
    }
}

impl Uploader {
    /// Create a client against `base`, with the default 95 MiB slices.
    #[must_use]
    pub fn new(base: Url) -> Self {
        Self {
            http: reqwest::Client::new(),
            base,
            password: None,
            chunked_slice: 95 * MIB,
            stream_slice: 95 * MIB,
            observer: None,
        }
    }

    /// Send this password with every request.
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Report progress and throughput to `observer`.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Adopt the slice sizes the server advertises.
    pub fn apply_settings(&mut self, settings: &UploadSettings) {
        self.chunked_slice = settings.chunked_upload_chunk_size * MIB;
        self.stream_slice = settings.stream_upload_chunk_size * MIB;
    }

    /// Fetch the server's advertised slice sizes.
    ///
    /// # Errors
    ///
    /// Transport failures or a non-success envelope.
    pub async fn fetch_settings(&self) -> crate::Result<UploadSettings> {
        let res = self
            .request(Method::GET, "fs/settings")?
            .send()
            .await?;

        read_reply(res).await
    }

    fn slice_size(&self, engine: Engine) -> u64 {
        match engine {
            Engine::Chunked => self.chunked_slice,
            Engine::Stream => self.stream_slice,
        }
    }

    fn request(&self, method: Method, route: &str) -> crate::Result<RequestBuilder> {
        let url = self.base.join(route)?;
        let mut builder = self.http.request(method, url);

        if let Some(password) = &self.password {
            builder = builder.header("Password", password);
        }

        Ok(builder)
    }

    fn report(&self, meter: &SpeedMeter, total: u64, percent: f64) {
        if let Some(observer) = &self.observer {
            observer.progress(Progress {
                transferred: meter.transferred(),
                total,
                percent,
                instant_bps: meter.instant_bps(),
                average_bps: meter.average_bps(),
            });
        }
    }

    /// Upload `local` to `remote`. Files at or below the engine's
    /// slice size travel as one request; larger files are split.
    ///
    /// # Errors
    ///
    /// Local I/O, transport failures, non-success envelopes, or a
    /// slice exhausting its retry budget.
    #[instrument(skip(self, opts), fields(remote = %remote))]
    pub async fn upload(
        &self,
        local: &Path,
        remote: &FilePath,
        opts: &UploadOptions,
    ) -> crate::Result<UploadOutcome> {
        let size = fs::metadata(local).await?.len();

        if size <= self.slice_size(opts.engine) {
            return self.single_shot(local, remote, size, opts).await;
        }

        match opts.engine {
            Engine::Chunked => self.chunked(local, remote, size, opts).await,
            Engine::Stream => self.streamed(local, remote, size, opts).await,
        }
    }

    async fn single_shot(
        &self,
        local: &Path,
        remote: &FilePath,
        size: u64,
        opts: &UploadOptions,
    ) -> crate::Result<UploadOutcome> {
        let file = fs::File::open(local).await?;
        let body = Body::wrap_stream(FramedRead::new(file, BytesCodec::new()));

        let res = self
            .request(Method::PUT, "fs/put")?
            .header("File-Path", urlencoding::encode(remote.as_str()).into_owned())
            .header("Last-Modified", opts.last_modified)
            .header("Overwrite", if opts.overwrite { "true" } else { "false" })
            .header(reqwest::header::CONTENT_LENGTH, size)
            .body(body)
            .send()
            .await?;

        read_reply_empty(res).await?;

        let mut meter = SpeedMeter::new();
        meter.record(size);
        self.report(&meter, size, 100.0);

        Ok(UploadOutcome {
            mode: Mode::Direct,
            upload_id: None,
            local_xxh64: None,
        })
    }

    async fn chunked(
        &self,
        local: &Path,
        remote: &FilePath,
        size: u64,
        opts: &UploadOptions,
    ) -> crate::Result<UploadOutcome> {
        let upload_id = fingerprint::file_fingerprint(local, remote.as_str()).await?;
        let plan = SlicePlan::new(size, self.chunked_slice);

        // digest the whole file beside the uploads; awaited before the merge
        let hash_task = hashing::spawn_file_xxh64(local.to_path_buf());

        let mut meter = SpeedMeter::new();

        for slice in plan.iter() {
            let crc32 = slice_crc32(local, slice).await?;

            let mut attempt = 1;
            let chunk: ChunkData = loop {
                match self.send_chunk(local, &upload_id, slice, &crc32).await {
                    Ok(chunk) => break chunk,
                    Err(e) if attempt < SLICE_ATTEMPTS => {
                        warn!(index = slice.index, attempt, "chunk upload failed: {e}");
                        attempt += 1;
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                    Err(e) => {
                        return Err(Error::ChunkExhausted {
                            index: slice.index,
                            attempts: SLICE_ATTEMPTS,
                            source: Box::new(e),
                        })
                    }
                }
            };

            debug!(index = slice.index, crc32 = %chunk.crc32, "chunk accepted");

            meter.record(slice.len);
            #[allow(clippy::cast_precision_loss)]
            self.report(
                &meter,
                size,
                meter.transferred() as f64 / size as f64 * UPLOAD_SPAN,
            );
        }

        let local_hash = match hash_task.await {
            Ok(Ok(hash)) => hash,
            Ok(Err(e)) => {
                warn!("whole-file digest failed, merging without it: {e}");
                String::new()
            }
            Err(e) => {
                warn!("whole-file digest task died, merging without it: {e}");
                String::new()
            }
        };

        let merge = self
            .merge(&upload_id, remote, plan.count(), opts, &local_hash)
            .await?;

        self.report(&meter, size, 100.0);

        // The server already enforced the digest; a mismatch here is
        // logged for the record, not re-raised.
        if let Some(remote_hash) = merge.hash.as_ref().and_then(|h| h.get(Algorithm::Xxh64)) {
            if !local_hash.is_empty() && remote_hash != local_hash {
                error!("remote xxh64 {remote_hash} does not match local {local_hash}");
            }
        }

        Ok(UploadOutcome {
            mode: Mode::Chunked,
            upload_id: Some(upload_id),
            local_xxh64: (!local_hash.is_empty()).then_some(local_hash),
        })
    }

    async fn send_chunk(
        &self,
        local: &Path,
        upload_id: &str,
        slice: Slice,
        crc32: &str,
    ) -> Result<ChunkData, Error> {
        let body = slice_body(local, slice).await?;
        let part = multipart::Part::stream_with_length(body, slice.len)
            .file_name(slice.index.to_string())
            .mime_str("application/octet-stream")?;
        let form = multipart::Form::new().part("file", part);

        let res = self
            .request(Method::PUT, "fs/put/chunk")?
            .query(&[
                ("upload_id", upload_id),
                ("index", &slice.index.to_string()),
            ])
            .header("X-Chunk-CRC32", crc32)
            .multipart(form)
            .send()
            .await?;

        read_reply(res).await
    }

    async fn merge(
        &self,
        upload_id: &str,
        remote: &FilePath,
        total_chunks: u64,
        opts: &UploadOptions,
        local_hash: &str,
    ) -> crate::Result<MergeData> {
        let req = MergeRequest {
            upload_id: upload_id
                .parse()
                .map_err(|_| Error::Api {
                    code: 400,
                    message: "derived upload id is invalid".to_owned(),
                })?,
            path: remote.clone(),
            total_chunks,
            as_task: true,
            overwrite: opts.overwrite,
            last_modified: opts.last_modified,
            hash: local_hash.to_owned(),
        };

        let res = self
            .request(Method::POST, "fs/put/chunk/merge")?
            .json(&req)
            .send()
            .await?;

        read_reply(res).await
    }

    async fn streamed(
        &self,
        local: &Path,
        remote: &FilePath,
        size: u64,
        opts: &UploadOptions,
    ) -> crate::Result<UploadOutcome> {
        let plan = SlicePlan::new(size, self.stream_slice);
        let encoded_path = urlencoding::encode(remote.as_str()).into_owned();

        let mut meter = SpeedMeter::new();
        let mut last: Option<StreamProgress> = None;

        for slice in plan.iter() {
            let range = ContentRange::new(slice.offset, slice.last(), size).map_err(|_| {
                Error::Api {
                    code: 400,
                    message: "slice does not form a valid range".to_owned(),
                }
            })?;

            let mut attempt = 1;
            let progress: StreamProgress = loop {
                match self
                    .send_ranged(local, &encoded_path, slice, range, opts)
                    .await
                {
                    Ok(progress) => break progress,
                    Err(e) if attempt < SLICE_ATTEMPTS => {
                        warn!(index = slice.index, attempt, "ranged chunk failed: {e}");
                        attempt += 1;
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                    Err(e) => {
                        return Err(Error::ChunkExhausted {
                            index: slice.index,
                            attempts: SLICE_ATTEMPTS,
                            source: Box::new(e),
                        })
                    }
                }
            };

            meter.record(slice.len);
            #[allow(clippy::cast_precision_loss)]
            self.report(
                &meter,
                size,
                meter.transferred() as f64 / size as f64 * 100.0,
            );

            last = Some(progress);
        }

        if !last.map_or(false, |p| p.complete) {
            return Err(Error::Incomplete);
        }

        Ok(UploadOutcome {
            mode: Mode::Stream,
            upload_id: None,
            local_xxh64: None,
        })
    }

    async fn send_ranged(
        &self,
        local: &Path,
        encoded_path: &str,
        slice: Slice,
        range: ContentRange,
        opts: &UploadOptions,
    ) -> Result<StreamProgress, Error> {
        let body = slice_body(local, slice).await?;

        let res = self
            .request(Method::PUT, "fs/put")?
            .header("File-Path", encoded_path)
            .header(reqwest::header::CONTENT_RANGE, range.to_string())
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .header("Last-Modified", opts.last_modified)
            .header("Overwrite", if opts.overwrite { "true" } else { "false" })
            .header(reqwest::header::CONTENT_LENGTH, slice.len)
            .body(body)
            .send()
            .await?;

        read_reply(res).await
    }
}

/// Stream one slice of a file, opened fresh so retries restart cleanly.
async fn slice_body(local: &Path, slice: Slice) -> io::Result<Body> {
    let mut file = fs::File::open(local).await?;
    file.seek(io::SeekFrom::Start(slice.offset)).await?;

    Ok(Body::wrap_stream(FramedRead::new(
        file.take(slice.len),
        BytesCodec::new(),
    )))
}

async fn slice_crc32(local: &Path, slice: Slice) -> io::Result<String> {
    let mut file = fs::File::open(local).await?;
    file.seek(io::SeekFrom::Start(slice.offset)).await?;

    let mut remaining = slice.len;
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0_u8; READ_BUF];

    while remaining > 0 {
        let want = buf.len().min(usize::try_from(remaining).unwrap_or(buf.len()));
        let n = file.read(&mut buf[..want]).await?;

        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "file shrank while hashing a slice",
            ));
        }

        hasher.update(&buf[..n]);
        remaining -= n as u64;
    }

    Ok(format!("{:08x}", hasher.finalize()))
}

async fn read_reply<T: DeserializeOwned>(res: Response) -> Result<T, Error> {
    let reply: Reply<T> = res.json().await?;

    if !reply.is_success() {
        return Err(Error::Api {
            code: reply.code,
            message: reply.message,
        });
    }

    reply.data.ok_or(Error::Api {
        code: 200,
        message: "success envelope without data".to_owned(),
    })
}

async fn read_reply_empty(res: Response) -> Result<(), Error> {
    let reply: Reply<serde_json::Value> = res.json().await?;

    if reply.is_success() {
        Ok(())
    } else {
        Err(Error::Api {
            code: reply.code,
            message: reply.message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn slice_crc32_covers_exactly_the_slice() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("src.bin");
        std::fs::write(&path, b"xx123456789yy").unwrap();

        let slice = Slice {
            index: 0,
            offset: 2,
            len: 9,
        };

        assert_eq!(slice_crc32(&path, slice).await.unwrap(), "cbf43926");
    }

    #[tokio::test]
    async fn slice_crc32_detects_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.bin");
        std::fs::write(&path, b"abc").unwrap();

        let slice = Slice {
            index: 0,
            offset: 0,
            len: 10,
        };

        let err = slice_crc32(&path, slice).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn settings_override_slice_sizes() {
        let mut uploader = Uploader::new("http://localhost:8000".parse().unwrap());

        uploader.apply_settings(&UploadSettings {
            chunked_upload_chunk_size: 10,
            stream_upload_chunk_size: 20,
        });

        assert_eq!(uploader.slice_size(Engine::Chunked), 10 * MIB);
        assert_eq!(uploader.slice_size(Engine::Stream), 20 * MIB);
    }

    #[test]
    fn default_threshold_is_95_mib() {
        let uploader = Uploader::new("http://localhost:8000".parse().unwrap());

        assert_eq!(uploader.slice_size(Engine::Chunked), 95 * MIB);
    }
}
