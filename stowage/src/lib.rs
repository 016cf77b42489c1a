#![doc = include_str!("../README.md")]
#![warn(
    unreachable_pub,
    missing_debug_implementations,
    missing_docs,
    clippy::pedantic
)]

use std::{
    path::PathBuf,
    time::Duration,
};

pub mod chunk;
pub mod driver;
pub mod errors;
pub mod hash;
pub mod merge;
pub mod path;
pub mod protocol;
pub mod queue;
pub mod range;
pub mod stream;

pub(crate) type Result<T> = core::result::Result<T, errors::Error>;

use driver::Driver;
use path::UploadId;
use queue::{MemoryTaskQueue, TaskQueue};
use stream::StreamRegistry;

/// Name of the scratch subdirectory holding per-upload staging areas.
pub(crate) const CHUNK_DIR: &str = "chunks";

/// Interpret a client-supplied millisecond epoch, falling back to now
/// for values outside the representable span.
pub(crate) fn time_from_millis(millis: i64) -> time::OffsetDateTime {
    time::OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .unwrap_or_else(|_| time::OffsetDateTime::now_utc())
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of the scratch area; staging directories are created under
    /// `<temp_dir>/chunks/<upload_id>/`.
    pub temp_dir: PathBuf,
    /// Reject Finder/Explorer junk files (`.DS_Store` and friends) at
    /// ingest time.
    pub ignore_system_files: bool,
    /// How long a stream session may go without traffic before the
    /// sweeper evicts it.
    pub stream_idle_timeout: Duration,
    /// How often the sweeper wakes.
    pub stream_sweep_period: Duration,
}

impl Config {
    /// Create a config with default timeouts (10 minute idle cutoff,
    /// one sweep per minute).
    #[must_use]
    pub fn new(temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            temp_dir: temp_dir.into(),
            ignore_system_files: false,
            stream_idle_timeout: Duration::from_secs(600),
            stream_sweep_period: Duration::from_secs(60),
        }
    }

    pub(crate) fn staging_dir(&self, id: &UploadId) -> PathBuf {
        self.temp_dir.join(CHUNK_DIR).join(id.as_str())
    }
}

/// The context is used for all ingest operations. Shared mutable state
/// is achieved by internal `Arc`s, so wrap the context itself in an
/// `Arc` and clone freely.
#[derive(Debug)]
pub struct Context<D: Driver> {
    driver: D,
    config: Config,
    streams: StreamRegistry,
    tasks: Box<dyn TaskQueue>,
}

impl<D: Driver> Context<D> {
    /// Initialize a new context with an in-process task queue.
    #[must_use]
    pub fn new(driver: D, config: Config) -> Self {
        let streams =
            StreamRegistry::with_timeouts(config.stream_idle_timeout, config.stream_sweep_period);

        Self {
            driver,
            config,
            streams,
            tasks: Box::new(MemoryTaskQueue::default()),
        }
    }

    /// Replace the task queue, e.g. with one backed by an external
    /// system.
    #[must_use]
    pub fn with_task_queue(mut self, tasks: Box<dyn TaskQueue>) -> Self {
        self.tasks = tasks;
        self
    }

    /// The backing store.
    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Engine configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Live stream sessions.
    pub fn streams(&self) -> &StreamRegistry {
        &self.streams
    }

    /// Task queue receiving detached merge statuses.
    pub fn tasks(&self) -> &dyn TaskQueue {
        &*self.tasks
    }
}
