#![doc = include_str!("../README.md")]

pub mod errors;
pub mod routes;
pub mod scope;
pub mod settings;

pub(crate) type AppResult<T> = Result<T, errors::AppError>;

/// The engine context every handler works against.
pub type AppContext = stowage::Context<stowage::driver::LocalDriver>;
