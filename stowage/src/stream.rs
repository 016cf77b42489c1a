//! Pipe-streamed ranged ingest.
//!
//! Sequential ranged PUTs for one destination are stitched into a
//! single continuous byte stream and fed to the backing store through a
//! bounded pipe. The pipe's capacity is the back-pressure mechanism:
//! network ingress can never outrun store egress by more than one
//! frame, so resident memory per session stays a small constant
//! regardless of object size.

use std::{
    io,
    pin::Pin,
    sync::{Arc, Mutex as StdMutex},
    task::{Context as TaskContext, Poll},
    time::{Duration, Instant},
};

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::{Stream, StreamExt};
use mime::Mime;
use tokio::{
    io::{AsyncRead, ReadBuf},
    sync::{mpsc, oneshot, Mutex},
};
use tracing::{debug, instrument, warn};

use crate::{
    driver::{Driver, UploadStream},
    errors::Error,
    path::{self, FilePath, UserScope},
    protocol::StreamProgress,
    range::ContentRange,
    Context,
};

/// Upper bound on one pipe frame. Together with the capacity-1 channel
/// this bounds resident bytes per session.
const PIPE_FRAME: usize = 64 * 1024;

/// One ranged PUT, parsed.
#[derive(Debug)]
pub struct RangedRequest {
    /// Destination path, relative to the user's root.
    pub path: FilePath,
    /// Slice bounds and declared total size.
    pub range: ContentRange,
    /// Media type, when the client sent one.
    pub content_type: Option<Mime>,
    /// Source modification time, milliseconds since the epoch.
    pub last_modified: i64,
    /// Replace an existing object at the destination.
    pub overwrite: bool,
}

struct Gate {
    /// Write end of the pipe. `None` once the stream closed.
    sender: Option<mpsc::Sender<io::Result<Bytes>>>,
    received: u64,
    /// Completion channel carrying the driver's terminal result.
    done: Option<oneshot::Receiver<io::Result<()>>>,
}

/// In-memory state of one pipe-streamed upload.
pub struct StreamSession {
    total: u64,
    /// Serializes every write phase for the session; the sole pipe
    /// writer is whoever holds this lock.
    gate: Mutex<Gate>,
    last_active: StdMutex<Instant>,
}

impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("total", &self.total)
            .finish_non_exhaustive()
    }
}

impl StreamSession {
    fn touch(&self) {
        *self.last_active.lock().unwrap() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_active.lock().unwrap().elapsed()
    }
}

/// Live sessions keyed by `stream:<user>:<path>:<total>`.
#[derive(Debug)]
pub struct StreamRegistry {
    sessions: Arc<DashMap<String, Arc<StreamSession>>>,
    idle_timeout: Duration,
    sweep_period: Duration,
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::with_timeouts(Duration::from_secs(600), Duration::from_secs(60))
    }
}

impl StreamRegistry {
    /// Create a registry with explicit timeouts.
    #[must_use]
    pub fn with_timeouts(idle_timeout: Duration, sweep_period: Duration) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            idle_timeout,
            sweep_period,
        }
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Are there no live sessions?
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Spawn the background sweeper. Call once, from a runtime.
    pub fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let sessions = Arc::clone(&self.sessions);
        let idle_timeout = self.idle_timeout;
        let sweep_period = self.sweep_period;

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(sweep_period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tick.tick().await;
                sweep(&sessions, idle_timeout).await;
            }
        })
    }

    /// One sweep pass; expired sessions are evicted and their pipes
    /// closed with a timeout error.
    pub async fn sweep_once(&self) {
        sweep(&self.sessions, self.idle_timeout).await;
    }
}

async fn sweep(sessions: &DashMap<String, Arc<StreamSession>>, idle_timeout: Duration) {
    let expired: Vec<(String, Arc<StreamSession>)> = sessions
        .iter()
        .filter(|entry| entry.value().idle_for() > idle_timeout)
        .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
        .collect();

    for (key, session) in expired {
        // compare-and-delete: a handler may have finished the session
        // between the scan and now
        if sessions
            .remove_if(&key, |_, s| s.idle_for() > idle_timeout)
            .is_none()
        {
            continue;
        }

        warn!(%key, "evicting idle stream session");

        // A contended gate means a write is in flight, which also means
        // the session is not idle; skip it rather than block the sweep.
        if let Ok(mut gate) = session.gate.try_lock() {
            if let Some(sender) = gate.sender.take() {
                let _ = sender
                    .try_send(Err(io::Error::new(io::ErrorKind::TimedOut, "session timeout")));
            }
        }
    }
}

/// Read end of the session pipe, handed to the driver.
///
/// EOF is explicit: the writer sends an empty frame when the declared
/// total has been received. A channel that closes without the marker
/// surfaces as an error, so a truncated stream can never look like a
/// complete object.
struct PipeReader {
    rx: mpsc::Receiver<io::Result<Bytes>>,
    carry: Bytes,
    finished: bool,
}

impl PipeReader {
    fn new(rx: mpsc::Receiver<io::Result<Bytes>>) -> Self {
        Self {
            rx,
            carry: Bytes::new(),
            finished: false,
        }
    }
}

impl AsyncRead for PipeReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if !this.carry.is_empty() {
                let n = this.carry.len().min(buf.remaining());
                buf.put_slice(&this.carry.split_to(n));

                return Poll::Ready(Ok(()));
            }

            if this.finished {
                return Poll::Ready(Ok(()));
            }

            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(Ok(frame))) => {
                    if frame.is_empty() {
                        this.finished = true;

                        return Poll::Ready(Ok(()));
                    }

                    this.carry = frame;
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(e)),
                Poll::Ready(None) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "stream session aborted",
                    )))
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Feed one ranged chunk into its session, creating the session when
/// the range starts at offset 0.
///
/// # Errors
///
/// [`Error::SessionNotFound`] for a non-first range without a live
/// session, [`Error::AlreadyExists`] / [`Error::SystemFile`] /
/// [`Error::OutOfScope`] from the policy checks at session creation,
/// and [`Error::Io`] when the pipe or the driver fails. A failed write
/// closes the pipe and removes the session.
#[instrument(skip(ctx, user, body), fields(range = %req.range))]
pub async fn put_ranged<D, S>(
    ctx: &Arc<Context<D>>,
    user: &dyn UserScope,
    req: &RangedRequest,
    body: S,
) -> crate::Result<StreamProgress>
where
    D: Driver,
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    let key = path::stream_key(user, &req.path, &req.range);
    let registry = ctx.streams();

    let session = if let Some(session) = registry.sessions.get(&key) {
        Arc::clone(&session)
    } else if req.range.is_first() {
        open_session(ctx, user, req, &key).await?
    } else {
        return Err(Error::SessionNotFound);
    };

    // sole-writer discipline: the gate serializes overlapping ranges
    let mut gate = session.gate.lock().await;

    if gate.sender.is_none() {
        // closed by the sweeper or an earlier failure while we waited
        registry.sessions.remove(&key);

        return Err(Error::SessionNotFound);
    }

    if let Err(e) = copy_body(&mut gate, &session, body).await {
        gate.sender = None;
        drop(gate);
        registry.sessions.remove(&key);

        return Err(e);
    }

    let received = gate.received;
    let complete = received >= session.total;

    if !complete {
        return Ok(StreamProgress {
            received,
            total: session.total,
            complete,
        });
    }

    // explicit EOF marker, sent exactly once
    if let Some(sender) = gate.sender.take() {
        let _ = sender.send(Ok(Bytes::new())).await;
    }

    let done = gate.done.take();
    drop(gate);
    registry.sessions.remove(&key);

    match done {
        Some(done) => match done.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                return Err(Error::Io(io::Error::other("backing store task vanished")));
            }
        },
        None => {
            return Err(Error::Io(io::Error::other(
                "stream session completed twice",
            )))
        }
    }

    debug!(%key, received, "stream complete");

    Ok(StreamProgress {
        received,
        total: session.total,
        complete,
    })
}

/// A single-shot put, parsed.
#[derive(Debug)]
pub struct DirectRequest {
    /// Destination path, relative to the user's root.
    pub path: FilePath,
    /// Declared size in bytes; advisory for drivers that care.
    pub size: u64,
    /// Media type, when the client sent one.
    pub content_type: Option<Mime>,
    /// Source modification time, milliseconds since the epoch.
    pub last_modified: i64,
    /// Replace an existing object at the destination.
    pub overwrite: bool,
}

/// Feed a whole object to the driver in one request, through the same
/// bounded pipe the ranged engine uses.
///
/// # Errors
///
/// The policy errors of [`put_ranged`] session creation, plus
/// [`Error::Io`] when the driver rejects the object.
#[instrument(skip(ctx, user, body), fields(path = %req.path))]
pub async fn put_direct<D, S>(
    ctx: &Arc<Context<D>>,
    user: &dyn UserScope,
    req: &DirectRequest,
    mut body: S,
) -> crate::Result<()>
where
    D: Driver,
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    let (dest_dir, name) = admit(ctx, user, &req.path, req.overwrite).await?;

    let (sender, rx) = mpsc::channel(1);
    let (done_tx, done_rx) = oneshot::channel();

    let mut stream = UploadStream::new(Box::new(PipeReader::new(rx)), name, req.size);
    stream.content_type = req
        .content_type
        .clone()
        .unwrap_or_else(|| mime_guess::from_path(req.path.name()).first_or_octet_stream());
    stream.modified = crate::time_from_millis(req.last_modified);

    let driver_ctx = Arc::clone(ctx);
    tokio::spawn(async move {
        let result = driver_ctx.driver().put(&dest_dir, stream).await;
        let _ = done_tx.send(result);
    });

    while let Some(frame) = body.next().await {
        let mut frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                drop(sender);

                return Err(e.into());
            }
        };

        while !frame.is_empty() {
            let piece = frame.split_to(frame.len().min(PIPE_FRAME));

            if sender.send(Ok(piece)).await.is_err() {
                return match done_rx.await {
                    Ok(Err(e)) => Err(e.into()),
                    _ => Err(Error::Io(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "stream pipe closed",
                    ))),
                };
            }
        }
    }

    let _ = sender.send(Ok(Bytes::new())).await;
    drop(sender);

    match done_rx.await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(Error::Io(io::Error::other("backing store task vanished"))),
    }
}

/// Destination checks shared by session creation and direct puts:
/// scoping, the system-file policy and the overwrite rule. Returns the
/// driver-side directory and base name.
async fn admit<D: Driver>(
    ctx: &Context<D>,
    user: &dyn UserScope,
    path: &FilePath,
    overwrite: bool,
) -> crate::Result<(String, String)> {
    let scoped = user.scoped(path)?;
    let name = path.name().to_owned();

    if ctx.config().ignore_system_files && path::is_system_file(&name) {
        return Err(Error::SystemFile);
    }

    if !overwrite && ctx.driver().exists(&scoped).await? {
        return Err(Error::AlreadyExists);
    }

    let dest_dir = match scoped.rsplit_once('/') {
        Some((dir, _)) => dir.to_owned(),
        None => String::new(),
    };

    Ok((dest_dir, name))
}

async fn open_session<D: Driver>(
    ctx: &Arc<Context<D>>,
    user: &dyn UserScope,
    req: &RangedRequest,
    key: &str,
) -> crate::Result<Arc<StreamSession>> {
    let (dest_dir, name) = admit(ctx, user, &req.path, req.overwrite).await?;

    let (sender, rx) = mpsc::channel(1);
    let (done_tx, done_rx) = oneshot::channel();
    let total = req.range.total();

    let mut stream = UploadStream::new(Box::new(PipeReader::new(rx)), name, total);
    stream.content_type = req
        .content_type
        .clone()
        .unwrap_or(mime::APPLICATION_OCTET_STREAM);
    stream.modified = crate::time_from_millis(req.last_modified);

    let session = Arc::new(StreamSession {
        total,
        gate: Mutex::new(Gate {
            sender: Some(sender),
            received: 0,
            done: Some(done_rx),
        }),
        last_active: StdMutex::new(Instant::now()),
    });

    // First writer wins; a concurrent opener for the same key joins the
    // existing session instead.
    let session = match ctx.streams().sessions.entry(key.to_owned()) {
        dashmap::mapref::entry::Entry::Occupied(existing) => return Ok(Arc::clone(existing.get())),
        dashmap::mapref::entry::Entry::Vacant(vacant) => {
            vacant.insert(Arc::clone(&session));
            session
        }
    };

    let driver_ctx = Arc::clone(ctx);
    tokio::spawn(async move {
        // sole reader of the pipe; `put` returns once the object is durable
        let result = driver_ctx.driver().put(&dest_dir, stream).await;

        if let Err(e) = &result {
            warn!("stream driver put failed: {e}");
        }

        let _ = done_tx.send(result);
    });

    debug!(%key, total, "stream session opened");

    Ok(session)
}

async fn copy_body<S>(gate: &mut Gate, session: &StreamSession, mut body: S) -> crate::Result<()>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    while let Some(frame) = body.next().await {
        let mut frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                // propagate the request failure to the driver side
                if let Some(sender) = gate.sender.take() {
                    let _ = sender
                        .try_send(Err(io::Error::new(e.kind(), e.to_string())));
                }

                return Err(e.into());
            }
        };

        while !frame.is_empty() {
            let piece = frame.split_to(frame.len().min(PIPE_FRAME));

            if gate.received + piece.len() as u64 > session.total {
                return Err(Error::Invalid(
                    "body exceeds the declared total size".to_owned(),
                ));
            }

            let Some(sender) = gate.sender.as_ref() else {
                return Err(Error::SessionNotFound);
            };

            let piece_len = piece.len() as u64;

            if sender.send(Ok(piece)).await.is_err() {
                // the read end is gone: timed out or the driver failed
                let cause = match gate.done.take() {
                    Some(done) => match done.await {
                        Ok(Err(e)) => e,
                        _ => io::Error::new(io::ErrorKind::BrokenPipe, "stream pipe closed"),
                    },
                    None => io::Error::new(io::ErrorKind::BrokenPipe, "stream pipe closed"),
                };

                return Err(cause.into());
            }

            gate.received += piece_len;
            session.touch();
        }
    }

    Ok(())
}
