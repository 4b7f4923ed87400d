use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use oci_spec::image::{Digest, DigestAlgorithm};
use sha2::{Digest as _, Sha256, Sha512};
use tokio::io::{AsyncRead, ReadBuf};

use crate::errors::Error;

pub(crate) enum Hasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Hasher {
    pub(crate) fn for_algorithm(algo: &DigestAlgorithm) -> Result<Hasher, Error> {
        match algo {
            DigestAlgorithm::Sha256 => Ok(Hasher::Sha256(Sha256::new())),
            DigestAlgorithm::Sha512 => Ok(Hasher::Sha512(Sha512::new())),
            algo => Err(Error::DigestAlgorithmNotHandled(algo.to_string())),
        }
    }

    pub(crate) fn digest_len(&self) -> usize {
        match self {
            Hasher::Sha256(_) => 32,
            Hasher::Sha512(_) => 64,
        }
    }

    pub(crate) fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    pub(crate) fn finalize(self) -> Vec<u8> {
        match self {
            Hasher::Sha256(h) => h.finalize().to_vec(),
            Hasher::Sha512(h) => h.finalize().to_vec(),
        }
    }

    pub(crate) fn algorithm_name(&self) -> &'static str {
        match self {
            Hasher::Sha256(_) => "sha256",
            Hasher::Sha512(_) => "sha512",
        }
    }

    pub(crate) fn finalize_digest(self) -> Digest {
        let name = self.algorithm_name();
        let hex = hex::encode(self.finalize());
        // both components are well formed by construction
        format!("{name}:{hex}").parse().unwrap()
    }
}

/// sha256 digest of in-memory data, e.g. a serialized manifest.
pub fn digest_of(data: impl AsRef<[u8]>) -> Digest {
    use std::str::FromStr;
    oci_spec::image::Sha256Digest::from_str(&hex::encode(Sha256::digest(data)))
        .unwrap()
        .into()
}

// avoids leaking whether a prefix matched through timing
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Outcome latches shared between the reader (which may be consumed by a
/// destination) and the pipeline that checks the result afterwards.
///
/// Exactly one of the flags becomes true once the stream reaches EOF;
/// abandoning the stream mid-way leaves both false.
#[derive(Default)]
pub struct ValidationFlags {
    succeeded: AtomicBool,
    failed: AtomicBool,
    actual: std::sync::OnceLock<Digest>,
}

impl ValidationFlags {
    pub fn succeeded(&self) -> bool {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }

    /// The digest the stream actually hashed to, when validation failed.
    pub fn mismatched_digest(&self) -> Option<Digest> {
        self.actual.get().cloned()
    }
}

/// Forwards bytes from `inner` while hashing them; at EOF the computed
/// digest is compared against the expected one and the read observing EOF
/// fails on mismatch.
pub struct DigestingReader<R> {
    inner: R,
    hasher: Option<Hasher>,
    expected: Digest,
    expected_bytes: Vec<u8>,
    flags: Arc<ValidationFlags>,
    // kept so repeated reads past EOF fail the same way
    mismatch: Option<Digest>,
}

impl<R> DigestingReader<R> {
    pub fn new(inner: R, expected: &Digest) -> Result<(Self, Arc<ValidationFlags>), Error> {
        let hasher = Hasher::for_algorithm(expected.algorithm())?;
        let expected_bytes = hex::decode(expected.digest())
            .map_err(|_| Error::BadDigest(expected.to_string()))?;
        if expected_bytes.len() != hasher.digest_len() {
            return Err(Error::BadDigest(expected.to_string()));
        }
        let flags = Arc::new(ValidationFlags::default());
        Ok((
            DigestingReader {
                inner,
                hasher: Some(hasher),
                expected: expected.clone(),
                expected_bytes,
                flags: flags.clone(),
                mismatch: None,
            },
            flags,
        ))
    }

    fn mismatch_error(expected: &Digest, actual: &Digest) -> io::Error {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("digest of stream is {actual}, expected {expected}"),
        )
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for DigestingReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        let me = &mut *self;
        let before = buf.filled().len();
        match Pin::new(&mut me.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let filled = &buf.filled()[before..];
                if !filled.is_empty() {
                    if let Some(hasher) = me.hasher.as_mut() {
                        hasher.update(filled);
                    }
                    return Poll::Ready(Ok(()));
                }
                // end of stream
                if let Some(actual) = &me.mismatch {
                    return Poll::Ready(Err(Self::mismatch_error(&me.expected, actual)));
                }
                if let Some(hasher) = me.hasher.take() {
                    let computed = hasher.finalize();
                    if constant_time_eq(&computed, &me.expected_bytes) {
                        me.flags.succeeded.store(true, Ordering::Relaxed);
                    } else {
                        me.flags.failed.store(true, Ordering::Relaxed);
                        let actual: Digest =
                            format!("{}:{}", me.expected.algorithm(), hex::encode(computed))
                                .parse()
                                .unwrap();
                        let err = Self::mismatch_error(&me.expected, &actual);
                        let _ = me.flags.actual.set(actual.clone());
                        me.mismatch = Some(actual);
                        return Poll::Ready(Err(err));
                    }
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}
