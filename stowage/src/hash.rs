//! Streaming digests.
//!
//! Every algorithm the engine knows about is listed in [`Algorithm`];
//! [`Algorithm::from_name`] is the registry lookup and
//! [`Algorithm::new_state`] the factory. A [`MultiHasher`] tees writes
//! to several states at once so a merge can produce its whole-file
//! digests in a single pass over the data.

use std::collections::BTreeMap;

use crc::{Crc, CRC_64_XZ};
use serde::{Deserialize, Serialize};
use sha1::Digest as _;
use xxhash_rust::xxh64::Xxh64;

/// CRC-64 with the same table as Go's `hash/crc64` ECMA variant.
static CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_XZ);

/// A digest algorithm known to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Algorithm {
    /// CRC-32 (IEEE), used for per-slice verification.
    Crc32,
    /// CRC-64 (ECMA table), redundant whole-file digest.
    Crc64,
    /// XXH64 with seed 0, the whole-file integrity digest.
    Xxh64,
    /// MD5, kept for the legacy rapid-upload path.
    Md5,
    /// SHA-1, kept for the legacy rapid-upload path.
    Sha1,
    /// SHA-256, kept for the legacy rapid-upload path.
    Sha256,
}

impl Algorithm {
    /// Every registered algorithm.
    pub const ALL: [Algorithm; 6] = [
        Algorithm::Crc32,
        Algorithm::Crc64,
        Algorithm::Xxh64,
        Algorithm::Md5,
        Algorithm::Sha1,
        Algorithm::Sha256,
    ];

    /// Canonical lowercase name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Algorithm::Crc32 => "crc32",
            Algorithm::Crc64 => "crc64",
            Algorithm::Xxh64 => "xxh64",
            Algorithm::Md5 => "md5",
            Algorithm::Sha1 => "sha1",
            Algorithm::Sha256 => "sha256",
        }
    }

    /// Look an algorithm up by name.
    ///
    /// ```
    /// use stowage::hash::Algorithm;
    ///
    /// assert_eq!(Algorithm::from_name("xxh64"), Some(Algorithm::Xxh64));
    /// assert_eq!(Algorithm::from_name("blake3"), None);
    /// ```
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.name() == name)
    }

    /// Create a fresh streaming state.
    #[must_use]
    pub fn new_state(self) -> Box<dyn HashState> {
        match self {
            Algorithm::Crc32 => Box::new(Crc32State(crc32fast::Hasher::new())),
            Algorithm::Crc64 => Box::new(Crc64State(CRC64.digest())),
            Algorithm::Xxh64 => Box::new(Xxh64State(Xxh64::new(0))),
            Algorithm::Md5 => Box::new(Md5State(md5::Context::new())),
            Algorithm::Sha1 => Box::new(Sha1State(sha1::Sha1::new())),
            Algorithm::Sha256 => Box::new(Sha256State(sha2::Sha256::new())),
        }
    }
}

/// A streaming digest state.
pub trait HashState: Send {
    /// Feed bytes into the digest.
    fn update(&mut self, buf: &[u8]);

    /// Consume the state and return the digest as lowercase hex.
    fn finish(self: Box<Self>) -> String;
}

struct Crc32State(crc32fast::Hasher);

impl HashState for Crc32State {
    fn update(&mut self, buf: &[u8]) {
        self.0.update(buf);
    }

    fn finish(self: Box<Self>) -> String {
        format!("{:08x}", self.0.finalize())
    }
}

struct Crc64State(crc::Digest<'static, u64>);

impl HashState for Crc64State {
    fn update(&mut self, buf: &[u8]) {
        self.0.update(buf);
    }

    fn finish(self: Box<Self>) -> String {
        format!("{:016x}", self.0.finalize())
    }
}

struct Xxh64State(Xxh64);

impl HashState for Xxh64State {
    fn update(&mut self, buf: &[u8]) {
        self.0.update(buf);
    }

    fn finish(self: Box<Self>) -> String {
        format!("{:016x}", self.0.digest())
    }
}

struct Md5State(md5::Context);

impl HashState for Md5State {
    fn update(&mut self, buf: &[u8]) {
        self.0.consume(buf);
    }

    fn finish(self: Box<Self>) -> String {
        format!("{:x}", self.0.compute())
    }
}

struct Sha1State(sha1::Sha1);

impl HashState for Sha1State {
    fn update(&mut self, buf: &[u8]) {
        sha1::Digest::update(&mut self.0, buf);
    }

    fn finish(self: Box<Self>) -> String {
        hex::encode(self.0.finalize())
    }
}

struct Sha256State(sha2::Sha256);

impl HashState for Sha256State {
    fn update(&mut self, buf: &[u8]) {
        sha2::Digest::update(&mut self.0, buf);
    }

    fn finish(self: Box<Self>) -> String {
        hex::encode(self.0.finalize())
    }
}

/// Tees every write to a set of digest states.
pub struct MultiHasher {
    states: Vec<(Algorithm, Box<dyn HashState>)>,
}

impl std::fmt::Debug for MultiHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiHasher")
            .field(
                "algorithms",
                &self.states.iter().map(|(a, _)| a.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl MultiHasher {
    /// Create a hasher broadcasting to the given algorithms.
    #[must_use]
    pub fn new(algorithms: &[Algorithm]) -> Self {
        Self {
            states: algorithms.iter().map(|&a| (a, a.new_state())).collect(),
        }
    }

    /// Feed bytes to every state.
    pub fn update(&mut self, buf: &[u8]) {
        for (_, state) in &mut self.states {
            state.update(buf);
        }
    }

    /// Consume the hasher and collect every digest.
    #[must_use]
    pub fn finish(self) -> HashView {
        HashView(
            self.states
                .into_iter()
                .map(|(a, state)| (a.name().to_owned(), state.finish()))
                .collect(),
        )
    }
}

/// Read-only result of a merge: algorithm name mapped to lowercase hex.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HashView(pub BTreeMap<String, String>);

impl HashView {
    /// Digest for one algorithm, if present.
    #[must_use]
    pub fn get(&self, algorithm: Algorithm) -> Option<&str> {
        self.0.get(algorithm.name()).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(algorithm: Algorithm, data: &[u8]) -> String {
        let mut state = algorithm.new_state();
        state.update(data);
        state.finish()
    }

    #[test]
    fn check_vectors() {
        let check = b"123456789";

        assert_eq!(digest(Algorithm::Crc32, check), "cbf43926");
        assert_eq!(digest(Algorithm::Crc64, check), "995dc9bbdf1939fa");
        assert_eq!(digest(Algorithm::Md5, b""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(
            digest(Algorithm::Sha1, b"abc"),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        assert_eq!(
            digest(Algorithm::Sha256, b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn xxh64_vectors() {
        assert_eq!(digest(Algorithm::Xxh64, b""), "ef46db3751d8e999");
        assert_eq!(digest(Algorithm::Xxh64, b"hello\n"), "26c7827d889f6da3");
    }

    #[test]
    fn split_updates_match_one_shot() {
        let mut state = Algorithm::Xxh64.new_state();
        state.update(b"hel");
        state.update(b"lo\n");

        assert_eq!(state.finish(), digest(Algorithm::Xxh64, b"hello\n"));
    }

    #[test]
    fn registry_roundtrip() {
        for algorithm in Algorithm::ALL {
            assert_eq!(Algorithm::from_name(algorithm.name()), Some(algorithm));
        }
    }

    #[test]
    fn multi_hasher_broadcasts() {
        let mut multi = MultiHasher::new(&[Algorithm::Xxh64, Algorithm::Crc64]);
        multi.update(b"hello");
        multi.update(b"\n");
        let view = multi.finish();

        assert_eq!(view.get(Algorithm::Xxh64), Some("26c7827d889f6da3"));
        assert_eq!(
            view.get(Algorithm::Crc64).map(str::len),
            Some(16),
            "crc64 must be 16 hex chars"
        );
        assert_eq!(view.get(Algorithm::Md5), None);
    }
}
