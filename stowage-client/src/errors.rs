//! Error types.

/// Errors produced by the splitter client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Transport failure.
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    /// Local file failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The configured base URL cannot absorb a route.
    #[error(transparent)]
    Url(#[from] url::ParseError),
    /// The server replied with a non-success envelope.
    #[error("server error {code}: {message}")]
    Api {
        /// Envelope code.
        code: u16,
        /// Envelope message.
        message: String,
    },
    /// One slice ran out of attempts; the upload is aborted.
    #[error("chunk {index} failed after {attempts} attempts")]
    ChunkExhausted {
        /// Index of the slice that kept failing.
        index: u64,
        /// Attempts spent on it.
        attempts: u32,
        /// The final failure.
        #[source]
        source: Box<Error>,
    },
    /// The final ranged chunk was accepted but the server did not mark
    /// the stream complete.
    #[error("stream did not complete after the final chunk")]
    Incomplete,
}
