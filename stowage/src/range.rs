//! `Content-Range` parsing.

use std::{fmt::Display, str::FromStr};

use once_cell::sync::Lazy;
use regex::Regex;

/// A fully-specified `Content-Range` value: `bytes <start>-<end>/<total>`.
///
/// Open-ended and wildcard forms are rejected; ranged ingest always
/// knows the exact slice bounds and the total object size.
///
/// ```
/// use stowage::range::ContentRange;
///
/// let range: ContentRange = "bytes 0-99/200".parse().unwrap();
///
/// assert_eq!(range.start(), 0);
/// assert_eq!(range.end(), 99);
/// assert_eq!(range.total(), 200);
/// assert_eq!(range.len(), 100);
/// assert!(range.is_first());
/// assert!(!range.is_final());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    start: u64,
    end: u64,
    total: u64,
}

/// Invalid `Content-Range`.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseContentRangeError {
    /// The value is not shaped like `bytes <start>-<end>/<total>`.
    #[error("malformed content-range")]
    Malformed,
    /// The integers do not satisfy `start <= end < total`.
    #[error("content-range out of order")]
    OutOfOrder,
}

impl ContentRange {
    /// Construct a range from its bounds.
    ///
    /// # Errors
    ///
    /// [`ParseContentRangeError::OutOfOrder`] unless
    /// `start <= end < total`.
    pub fn new(start: u64, end: u64, total: u64) -> Result<Self, ParseContentRangeError> {
        if start <= end && end < total {
            Ok(Self { start, end, total })
        } else {
            Err(ParseContentRangeError::OutOfOrder)
        }
    }

    /// First byte of the slice (inclusive).
    #[must_use]
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Last byte of the slice (inclusive).
    #[must_use]
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Declared size of the whole object.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Bytes in this slice.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Ranges are closed on both ends and can never be empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Does the slice open the stream?
    #[must_use]
    pub fn is_first(&self) -> bool {
        self.start == 0
    }

    /// Does the slice close the stream?
    #[must_use]
    pub fn is_final(&self) -> bool {
        self.end + 1 == self.total
    }
}

impl FromStr for ContentRange {
    type Err = ParseContentRangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        static RE: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"^bytes (\d+)-(\d+)/(\d+)$").unwrap());

        let captures = RE.captures(s).ok_or(ParseContentRangeError::Malformed)?;

        let int = |i: usize| {
            captures[i]
                .parse::<u64>()
                .map_err(|_| ParseContentRangeError::Malformed)
        };

        Self::new(int(1)?, int(2)?, int(3)?)
    }
}

impl Display for ContentRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bytes {}-{}/{}", self.start, self.end, self.total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid() {
        let range: ContentRange = "bytes 100000000-199999999/262144000".parse().unwrap();

        assert_eq!(range.start(), 100_000_000);
        assert_eq!(range.end(), 199_999_999);
        assert_eq!(range.total(), 262_144_000);
        assert_eq!(range.len(), 100_000_000);
        assert!(!range.is_first());
        assert!(!range.is_final());
    }

    #[test]
    fn final_slice() {
        let range: ContentRange = "bytes 200000000-262143999/262144000".parse().unwrap();

        assert!(range.is_final());
    }

    #[test]
    fn rejects_malformed() {
        for s in [
            "",
            "bytes */200",
            "bytes 0-99",
            "bytes 0-/200",
            "bytes=0-99/200",
            "bytes 0 - 99/200",
            "bytes -5-10/200",
            "bytes 0-99/200 ",
        ] {
            assert_eq!(
                s.parse::<ContentRange>(),
                Err(ParseContentRangeError::Malformed),
                "{s:?} should be malformed"
            );
        }
    }

    #[test]
    fn rejects_out_of_order() {
        for s in ["bytes 100-99/200", "bytes 0-200/200", "bytes 0-0/0"] {
            assert_eq!(
                s.parse::<ContentRange>(),
                Err(ParseContentRangeError::OutOfOrder),
                "{s:?} should be out of order"
            );
        }
    }

    #[test]
    fn display_roundtrip() {
        let range = ContentRange::new(0, 99, 200).unwrap();

        assert_eq!(range.to_string().parse::<ContentRange>(), Ok(range));
    }
}
