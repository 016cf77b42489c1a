//! Identifier and path newtypes.

use derive_more::{AsRef, Deref};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_with::{DeserializeFromStr, SerializeDisplay};

use std::{fmt::Display, str::FromStr};

use crate::range;

/// Base names rejected when the ignore-system-files policy is active.
const SYSTEM_FILES: &[&str] = &[".DS_Store", "Thumbs.db", "desktop.ini"];

/// Opaque per-upload identifier, derived by the client from the
/// destination path, total size and a content fingerprint.
///
/// The charset is restricted so the id can double as a staging
/// directory name without any escaping.
///
/// ```
/// use stowage::path::UploadId;
/// use std::str::FromStr;
///
/// assert!(UploadId::from_str("dGVzdC50eHR8NnxkZWFkYmVlZg__").is_ok());
/// assert!(UploadId::from_str("").is_err());
/// assert!(UploadId::from_str("../escape").is_err());
/// ```
#[derive(
    Debug,
    SerializeDisplay,
    DeserializeFromStr,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Deref,
    AsRef,
)]
pub struct UploadId(String);

impl UploadId {
    /// The raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for UploadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UploadId {
    type Err = ParseUploadIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        static RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,255}$").unwrap());

        if RE.is_match(s) {
            Ok(Self(s.to_owned()))
        } else {
            Err(ParseUploadIdError)
        }
    }
}

/// Invalid upload id.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid upload id")]
pub struct ParseUploadIdError;

/// Destination path of an upload, relative to the user's root.
///
/// Traversal segments are rejected outright, so joining a [`FilePath`]
/// below a root can never escape it.
///
/// ```
/// use stowage::path::FilePath;
/// use std::str::FromStr;
///
/// let path = FilePath::from_str("/movies/cats.mkv").unwrap();
///
/// assert_eq!(path.name(), "cats.mkv");
/// assert_eq!(path.parent(), "movies");
///
/// assert!(FilePath::from_str("").is_err());
/// assert!(FilePath::from_str("a/../b").is_err());
/// ```
#[derive(
    Debug,
    SerializeDisplay,
    DeserializeFromStr,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Deref,
    AsRef,
)]
pub struct FilePath(String);

impl FilePath {
    /// The normalized path (no leading or trailing slash).
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Base name of the destination.
    #[must_use]
    pub fn name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Directory part, empty for top-level destinations.
    #[must_use]
    pub fn parent(&self) -> &str {
        match self.0.rsplit_once('/') {
            Some((parent, _)) => parent,
            None => "",
        }
    }
}

impl Display for FilePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for FilePath {
    type Err = ParseFilePathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim_matches('/');

        if trimmed.is_empty() {
            return Err(ParseFilePathError::Empty);
        }

        if trimmed.contains('\0') {
            return Err(ParseFilePathError::IllegalCharacter);
        }

        if trimmed.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..") {
            return Err(ParseFilePathError::Traversal);
        }

        Ok(Self(trimmed.to_owned()))
    }
}

/// Invalid destination path.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseFilePathError {
    /// The path has no segments.
    #[error("empty path")]
    Empty,
    /// The path contains a NUL byte.
    #[error("illegal character in path")]
    IllegalCharacter,
    /// The path contains `.`, `..` or an empty segment.
    #[error("path traversal segment")]
    Traversal,
}

/// Is `name` one of the desktop junk files the ingest policy may drop?
///
/// ```
/// use stowage::path::is_system_file;
///
/// assert!(is_system_file(".DS_Store"));
/// assert!(is_system_file("._cats.mkv"));
/// assert!(!is_system_file("cats.mkv"));
/// ```
#[must_use]
pub fn is_system_file(name: &str) -> bool {
    SYSTEM_FILES.contains(&name) || name.starts_with("._")
}

/// Registry key for a pipe-streamed upload.
#[must_use]
pub fn session_key(user: &str, path: &FilePath, total: u64) -> String {
    format!("stream:{user}:{path}:{total}")
}

/// Identity and path-joining policy supplied by the outer
/// authentication layer.
pub trait UserScope: Send + Sync {
    /// Stable identifier of the authenticated user, used to key stream
    /// sessions.
    fn user_id(&self) -> &str;

    /// Join `path` onto the user's root, yielding the driver-side path.
    ///
    /// # Errors
    ///
    /// [`crate::errors::Error::OutOfScope`] if the path may not be
    /// written by this user.
    fn scoped(&self, path: &FilePath) -> crate::Result<String>;
}

/// Key derivation for [`session_key`] from raw request material.
pub(crate) fn stream_key(user: &dyn UserScope, path: &FilePath, range: &range::ContentRange) -> String {
    session_key(user.user_id(), path, range.total())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_keys_are_stable() {
        let path: FilePath = "backups/2022.tar".parse().unwrap();

        assert_eq!(
            session_key("alice", &path, 1024),
            "stream:alice:backups/2022.tar:1024"
        );
    }

    #[test]
    fn file_path_normalizes_slashes() {
        let path: FilePath = "/a/b/c.txt/".parse().unwrap();

        assert_eq!(path.as_str(), "a/b/c.txt");
        assert_eq!(path.parent(), "a/b");
        assert_eq!(path.name(), "c.txt");
    }

    #[test]
    fn top_level_path_has_empty_parent() {
        let path: FilePath = "c.txt".parse().unwrap();

        assert_eq!(path.parent(), "");
        assert_eq!(path.name(), "c.txt");
    }

    #[test]
    fn rejects_traversal() {
        assert_eq!(
            "a//b".parse::<FilePath>(),
            Err(ParseFilePathError::Traversal)
        );
        assert_eq!(
            "./a".parse::<FilePath>(),
            Err(ParseFilePathError::Traversal)
        );
        assert_eq!(
            "a/../../b".parse::<FilePath>(),
            Err(ParseFilePathError::Traversal)
        );
    }
}
