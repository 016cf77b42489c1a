#![doc = include_str!("../README.md")]
#![warn(
    unreachable_pub,
    missing_debug_implementations,
    missing_docs,
    clippy::pedantic
)]

pub mod errors;
pub mod fingerprint;
pub mod hashing;
pub mod slice;
pub mod speed;

mod upload;

pub use upload::{Engine, Mode, UploadOptions, UploadOutcome, Uploader};

pub(crate) type Result<T> = core::result::Result<T, errors::Error>;
