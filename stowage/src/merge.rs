//! Whole-file merge: ordered concatenation, hashing and the hand-off
//! to the backing store.

use std::{path::PathBuf, sync::Arc};

use time::OffsetDateTime;
use tokio::{
    fs,
    io::{AsyncReadExt, AsyncWriteExt},
};
use tracing::{debug, error, instrument};

use crate::{
    chunk::COPY_BUF,
    driver::{Driver, UploadStream},
    errors::Error,
    hash::{Algorithm, HashView, MultiHasher},
    path::{self, UserScope},
    protocol::MergeRequest,
    queue::TaskStatus,
    Context,
};

/// Scratch file the concatenation lands in before the hand-off.
pub(crate) const MERGED_FILE: &str = "merged";

/// Everything a merge needs, captured up front so the asynchronous
/// path can outlive the request that asked for it.
#[derive(Debug, Clone)]
pub struct MergePlan {
    upload_id: String,
    staging: PathBuf,
    dest_dir: String,
    name: String,
    total_chunks: u64,
    declared_hash: Option<String>,
    modified: OffsetDateTime,
}

impl MergePlan {
    /// Task id the asynchronous path reports under.
    #[must_use]
    pub fn task_id(&self) -> String {
        format!("merge-{}", self.upload_id)
    }
}

/// Check every merge precondition and capture the values the merge
/// itself needs.
///
/// # Errors
///
/// [`Error::OutOfScope`] when the destination escapes the user root,
/// [`Error::AlreadyExists`] when the destination is taken and
/// `overwrite` is unset, [`Error::ChunkMissing`] when a slice was never
/// staged, and [`Error::SystemFile`] when the ignore-system-files
/// policy rejects the base name (the staging area is removed in that
/// case; the upload is unwanted as a whole).
#[instrument(skip(ctx, user, req), fields(upload_id = %req.upload_id))]
pub async fn plan<D: Driver>(
    ctx: &Context<D>,
    user: &dyn UserScope,
    req: &MergeRequest,
) -> crate::Result<MergePlan> {
    let scoped = user.scoped(&req.path)?;
    let staging = ctx.config().staging_dir(&req.upload_id);
    let name = req.path.name().to_owned();

    if !req.overwrite && ctx.driver().exists(&scoped).await? {
        return Err(Error::AlreadyExists);
    }

    for index in 0..req.total_chunks {
        // cheap stat check before any byte is copied
        if fs::metadata(staging.join(index.to_string())).await.is_err() {
            return Err(Error::ChunkMissing(index));
        }
    }

    if ctx.config().ignore_system_files && path::is_system_file(&name) {
        let _ = fs::remove_dir_all(&staging).await;

        return Err(Error::SystemFile);
    }

    let dest_dir = match scoped.rsplit_once('/') {
        Some((dir, _)) => dir.to_owned(),
        None => String::new(),
    };

    Ok(MergePlan {
        upload_id: req.upload_id.to_string(),
        staging,
        dest_dir,
        name,
        total_chunks: req.total_chunks,
        declared_hash: (!req.hash.is_empty()).then(|| req.hash.clone()),
        modified: crate::time_from_millis(req.last_modified),
    })
}

/// Run the merge synchronously: concatenate in index order, verify the
/// whole-file XXH64, hand the object to the driver and clean up.
///
/// On success the staging area is gone. On hash mismatch the merged
/// scratch file is removed but the slices stay, so the caller may
/// retry the merge after re-uploading. On I/O failure everything stays
/// for a retry.
///
/// # Errors
///
/// [`Error::FileHash`] on digest mismatch, [`Error::Io`] on disk or
/// driver failure.
#[instrument(skip(ctx, plan), fields(upload_id = %plan.upload_id))]
pub async fn run<D: Driver>(ctx: &Context<D>, plan: &MergePlan) -> crate::Result<HashView> {
    let hashes = concat_and_store(ctx, plan).await?;

    let _ = fs::remove_dir_all(&plan.staging).await;

    debug!(dest = %plan.dest_dir, name = %plan.name, "merge complete");

    Ok(hashes)
}

/// Run the merge on a detached task and return its id immediately.
///
/// The task deliberately does not inherit the request scope; the merge
/// must outlive the HTTP round-trip. Failures are observable through
/// the task queue and the log only.
pub fn spawn<D: Driver>(ctx: Arc<Context<D>>, plan: MergePlan) -> String {
    let task_id = plan.task_id();
    ctx.tasks().update(&task_id, TaskStatus::Processing);

    let id = task_id.clone();
    tokio::spawn(async move {
        match run(&ctx, &plan).await {
            Ok(hashes) => ctx.tasks().update(&id, TaskStatus::Succeeded(hashes)),
            Err(e) => {
                if matches!(e, Error::FileHash { .. }) {
                    // retrying would re-pay the whole merge cost, so the
                    // staging area goes too
                    let _ = fs::remove_dir_all(&plan.staging).await;
                }

                error!(upload_id = %plan.upload_id, "detached merge failed: {e}");
                ctx.tasks().update(&id, TaskStatus::Failed(e.to_string()));
            }
        }
    });

    task_id
}

async fn concat_and_store<D: Driver>(
    ctx: &Context<D>,
    plan: &MergePlan,
) -> crate::Result<HashView> {
    let merged_path = plan.staging.join(MERGED_FILE);
    let mut merged = fs::File::create(&merged_path).await?;
    let mut hasher = MultiHasher::new(&[Algorithm::Xxh64, Algorithm::Crc64]);
    let mut total_size = 0_u64;
    let mut buf = vec![0_u8; COPY_BUF];

    for index in 0..plan.total_chunks {
        let mut slice = fs::File::open(plan.staging.join(index.to_string())).await?;

        loop {
            let n = slice.read(&mut buf).await?;

            if n == 0 {
                break;
            }

            // one read feeds the file and every digest in lockstep
            merged.write_all(&buf[..n]).await?;
            hasher.update(&buf[..n]);
            total_size += n as u64;
        }
    }

    merged.flush().await?;
    drop(merged);

    let hashes = hasher.finish();

    if let Some(declared) = &plan.declared_hash {
        let actual = hashes.get(Algorithm::Xxh64).unwrap_or_default();

        if declared != actual {
            let _ = fs::remove_file(&merged_path).await;

            return Err(Error::FileHash {
                declared: declared.clone(),
                actual: actual.to_owned(),
            });
        }
    }

    let reader = fs::File::open(&merged_path).await?;
    let mut stream = UploadStream::new(Box::new(reader), plan.name.clone(), total_size);
    stream.modified = plan.modified;
    stream.content_type = mime_guess::from_path(&plan.name).first_or_octet_stream();

    ctx.driver().put(&plan.dest_dir, stream).await?;

    Ok(hashes)
}

#[cfg(test)]
mod tests {
    use crate::driver::MemoryDriver;
    use crate::Config;

    use super::*;

    struct TestUser;

    impl UserScope for TestUser {
        fn user_id(&self) -> &str {
            "alice"
        }

        fn scoped(&self, path: &crate::path::FilePath) -> crate::Result<String> {
            Ok(format!("alice/{path}"))
        }
    }

    fn test_context() -> (tempfile::TempDir, Context<MemoryDriver>) {
        let temp = tempfile::tempdir().unwrap();
        let ctx = Context::new(MemoryDriver::new(), Config::new(temp.path()));

        (temp, ctx)
    }

    fn merge_request(upload_id: &str, total_chunks: u64, hash: &str) -> MergeRequest {
        MergeRequest {
            upload_id: upload_id.parse().unwrap(),
            path: "docs/report.bin".parse().unwrap(),
            total_chunks,
            as_task: false,
            overwrite: false,
            last_modified: 1_650_000_000_000,
            hash: hash.to_owned(),
        }
    }

    async fn stage(ctx: &Context<MemoryDriver>, upload_id: &str, slices: &[&[u8]]) {
        let staging = ctx.config().staging_dir(&upload_id.parse().unwrap());
        fs::create_dir_all(&staging).await.unwrap();

        for (i, slice) in slices.iter().enumerate() {
            fs::write(staging.join(i.to_string()), slice).await.unwrap();
        }
    }

    #[tokio::test]
    async fn merges_in_index_order() {
        let (_temp, ctx) = test_context();
        stage(&ctx, "up-1", &[b"hel", b"lo", b"\n"]).await;

        let plan = plan(&ctx, &TestUser, &merge_request("up-1", 3, "")).await.unwrap();
        let hashes = run(&ctx, &plan).await.unwrap();

        assert_eq!(hashes.get(Algorithm::Xxh64), Some("26c7827d889f6da3"));
        assert_eq!(
            ctx.driver().object("alice/docs/report.bin").unwrap(),
            b"hello\n"
        );
        assert!(
            !ctx.config().staging_dir(&"up-1".parse().unwrap()).exists(),
            "staging must be removed after success"
        );
    }

    #[tokio::test]
    async fn verifies_declared_hash() {
        let (_temp, ctx) = test_context();
        stage(&ctx, "up-2", &[b"hello\n"]).await;

        let plan = plan(&ctx, &TestUser, &merge_request("up-2", 1, "26c7827d889f6da3"))
            .await
            .unwrap();

        run(&ctx, &plan).await.unwrap();
        assert!(ctx.driver().exists("alice/docs/report.bin").await.unwrap());
    }

    #[tokio::test]
    async fn hash_mismatch_keeps_slices_drops_scratch() {
        let (_temp, ctx) = test_context();
        stage(&ctx, "up-3", &[b"corrupted"]).await;

        let plan = plan(&ctx, &TestUser, &merge_request("up-3", 1, "26c7827d889f6da3"))
            .await
            .unwrap();
        let err = run(&ctx, &plan).await.unwrap_err();

        assert!(matches!(err, Error::FileHash { .. }));
        assert!(ctx.driver().is_empty(), "no object may reach the driver");

        let staging = ctx.config().staging_dir(&"up-3".parse().unwrap());
        assert!(staging.join("0").exists(), "slices stay for a retry");
        assert!(!staging.join(MERGED_FILE).exists(), "scratch file is gone");
    }

    #[tokio::test]
    async fn missing_chunk_fails_plan() {
        let (_temp, ctx) = test_context();
        stage(&ctx, "up-4", &[b"only one"]).await;

        let err = plan(&ctx, &TestUser, &merge_request("up-4", 2, ""))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ChunkMissing(1)));
    }

    #[tokio::test]
    async fn refuses_overwrite_unless_asked() {
        let (_temp, ctx) = test_context();
        ctx.driver().seed("alice/docs/report.bin", b"old".to_vec());
        stage(&ctx, "up-5", &[b"new"]).await;

        let err = plan(&ctx, &TestUser, &merge_request("up-5", 1, ""))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists));

        let mut req = merge_request("up-5", 1, "");
        req.overwrite = true;
        let plan = plan(&ctx, &TestUser, &req).await.unwrap();
        run(&ctx, &plan).await.unwrap();

        assert_eq!(ctx.driver().object("alice/docs/report.bin").unwrap(), b"new");
    }

    #[tokio::test]
    async fn system_files_are_rejected_and_staging_removed() {
        let temp = tempfile::tempdir().unwrap();
        let mut config = Config::new(temp.path());
        config.ignore_system_files = true;
        let ctx = Context::new(MemoryDriver::new(), config);

        stage(&ctx, "up-6", &[b"junk"]).await;

        let mut req = merge_request("up-6", 1, "");
        req.path = "docs/.DS_Store".parse().unwrap();

        let err = plan(&ctx, &TestUser, &req).await.unwrap_err();

        assert!(matches!(err, Error::SystemFile));
        assert!(!ctx.config().staging_dir(&"up-6".parse().unwrap()).exists());
    }

    #[tokio::test]
    async fn detached_merge_reports_to_queue() {
        let (_temp, ctx) = test_context();
        stage(&ctx, "up-7", &[b"hello\n"]).await;

        let plan = plan(&ctx, &TestUser, &merge_request("up-7", 1, "")).await.unwrap();
        let ctx = Arc::new(ctx);
        let task_id = spawn(Arc::clone(&ctx), plan);

        assert_eq!(task_id, "merge-up-7");

        // the task is detached, so poll the queue for its result
        for _ in 0..100 {
            match ctx.tasks().status(&task_id) {
                Some(TaskStatus::Succeeded(hashes)) => {
                    assert_eq!(hashes.get(Algorithm::Xxh64), Some("26c7827d889f6da3"));
                    return;
                }
                Some(TaskStatus::Failed(message)) => panic!("merge failed: {message}"),
                _ => tokio::time::sleep(std::time::Duration::from_millis(10)).await,
            }
        }

        panic!("detached merge never finished");
    }

    #[tokio::test]
    async fn detached_hash_mismatch_drops_staging() {
        let (_temp, ctx) = test_context();
        stage(&ctx, "up-8", &[b"corrupted"]).await;

        let plan = plan(&ctx, &TestUser, &merge_request("up-8", 1, "26c7827d889f6da3"))
            .await
            .unwrap();
        let ctx = Arc::new(ctx);
        let task_id = spawn(Arc::clone(&ctx), plan);

        for _ in 0..100 {
            if let Some(TaskStatus::Failed(_)) = ctx.tasks().status(&task_id) {
                assert!(
                    !ctx.config().staging_dir(&"up-8".parse().unwrap()).exists(),
                    "async mismatch removes the whole staging area"
                );
                return;
            }

            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        panic!("detached merge never failed");
    }
}
