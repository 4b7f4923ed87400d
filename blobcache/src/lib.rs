//! A transport wrapper that keeps on-disk copies of the blobs and
//! manifests passing through it, plus notes pairing compressed blobs with
//! their decompressed counterparts.
//!
//! Layout: one flat directory holding `<hex>` blob files,
//! `<hex>.manifest` manifest files, and `<hex>.compressed` /
//! `<hex>.decompressed` sidecars whose single line names the counterpart
//! blob's `algorithm:hex` digest. Files appear atomically via a `_tmp`
//! write and rename; a visible file is always complete.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::error;
use oci_spec::image::Digest;

use imgcopy::Error;
use imgcopy::transport::{ImageDestination, ImageSource};

mod destination;
mod source;

pub use destination::CachingDestination;
pub use source::CachingSource;

pub(crate) const PIPE_BUF_SIZE: usize = 64 * 1024;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Clone)]
pub struct BlobCacheDir {
    dir: Arc<PathBuf>,
}

impl BlobCacheDir {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, Error> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(BlobCacheDir { dir: Arc::new(dir) })
    }

    pub fn wrap_source(&self, inner: Arc<dyn ImageSource>) -> CachingSource {
        CachingSource::new(self.clone(), inner)
    }

    pub fn wrap_destination(&self, inner: Arc<dyn ImageDestination>) -> CachingDestination {
        CachingDestination::new(self.clone(), inner)
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub(crate) fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.dir.join(digest.digest())
    }

    pub(crate) fn manifest_path(&self, digest: &Digest) -> PathBuf {
        self.dir.join(format!("{}.manifest", digest.digest()))
    }

    pub(crate) fn sidecar_path(&self, digest: &Digest, kind: &str) -> PathBuf {
        self.dir.join(format!("{}.{kind}", digest.digest()))
    }

    /// A fresh `_tmp` path; nothing with this suffix is ever visible data.
    pub(crate) fn tmp_path(&self) -> PathBuf {
        let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        self.dir
            .join(format!("{}_{n}_tmp", std::process::id()))
    }

    pub(crate) async fn open_blob(
        &self,
        digest: &Digest,
    ) -> Result<Option<(tokio::fs::File, i64)>, Error> {
        let path = self.blob_path(digest);
        match tokio::fs::File::open(&path).await {
            Ok(file) => {
                let size = file.metadata().await?.len() as i64;
                Ok(Some((file, size)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// The digest recorded in a sidecar note, if the note and the blob it
    /// points to both exist.
    pub(crate) async fn read_counterpart(
        &self,
        digest: &Digest,
        kind: &str,
    ) -> Option<Digest> {
        let note = tokio::fs::read_to_string(self.sidecar_path(digest, kind))
            .await
            .ok()?;
        let counterpart: Digest = note.trim().parse().ok()?;
        tokio::fs::try_exists(self.blob_path(&counterpart))
            .await
            .ok()?
            .then_some(counterpart)
    }

    /// Write a small file atomically.
    pub(crate) async fn write_note(&self, path: &Path, content: &[u8]) -> Result<(), Error> {
        let tmp = self.tmp_path();
        tokio::fs::write(&tmp, content).await?;
        match tokio::fs::rename(&tmp, path).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                Err(e.into())
            }
        }
    }

    /// Record that `compressed` and `decompressed` hold the same bytes in
    /// different forms.
    pub(crate) async fn write_counterpart_notes(
        &self,
        compressed: &Digest,
        decompressed: &Digest,
    ) -> Result<(), Error> {
        self.write_note(
            &self.sidecar_path(compressed, "decompressed"),
            format!("{decompressed}\n").as_bytes(),
        )
        .await?;
        self.write_note(
            &self.sidecar_path(decompressed, "compressed"),
            format!("{compressed}\n").as_bytes(),
        )
        .await
    }
}

/// Deletes the `_tmp` file unless the write was completed with
/// [`TmpFileGuard::success`].
pub(crate) struct TmpFileGuard {
    path: Option<PathBuf>,
}

impl TmpFileGuard {
    pub(crate) fn new(path: PathBuf) -> Self {
        TmpFileGuard { path: Some(path) }
    }

    pub(crate) async fn success(mut self, final_path: &Path) -> Result<(), Error> {
        if let Some(path) = self.path.take() {
            tokio::fs::rename(&path, final_path).await?;
        }
        Ok(())
    }
}

impl Drop for TmpFileGuard {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    error!("could not clean up cache temp file {path:?}: {e}");
                }
            }
        }
    }
}

/// `…tar+gzip` style media types mapped to their uncompressed form, for
/// substitutions from the cache.
pub(crate) fn uncompressed_media_type(media_type: &str) -> Option<&'static str> {
    match media_type {
        "application/vnd.oci.image.layer.v1.tar+gzip" => {
            Some("application/vnd.oci.image.layer.v1.tar")
        }
        "application/vnd.docker.image.rootfs.diff.tar.gzip" => {
            Some("application/vnd.docker.image.rootfs.diff.tar")
        }
        _ => None,
    }
}

pub(crate) fn gzip_media_type(media_type: &str) -> Option<&'static str> {
    match media_type {
        "application/vnd.oci.image.layer.v1.tar" => {
            Some("application/vnd.oci.image.layer.v1.tar+gzip")
        }
        "application/vnd.docker.image.rootfs.diff.tar" => {
            Some("application/vnd.docker.image.rootfs.diff.tar.gzip")
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imgcopy::digest_of;

    #[tokio::test]
    async fn test_notes_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = BlobCacheDir::new(tmp.path()).unwrap();
        let c = digest_of(b"compressed");
        let u = digest_of(b"uncompressed");
        // counterpart only resolves when the blob file itself exists
        cache.write_counterpart_notes(&c, &u).await.unwrap();
        assert!(cache.read_counterpart(&c, "decompressed").await.is_none());
        tokio::fs::write(cache.blob_path(&u), b"uncompressed")
            .await
            .unwrap();
        assert_eq!(
            cache.read_counterpart(&c, "decompressed").await,
            Some(u.clone())
        );
        tokio::fs::write(cache.blob_path(&c), b"compressed")
            .await
            .unwrap();
        assert_eq!(cache.read_counterpart(&u, "compressed").await, Some(c));
    }

    #[tokio::test]
    async fn test_tmp_guard_cleans_up() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = BlobCacheDir::new(tmp.path()).unwrap();
        let path = cache.tmp_path();
        tokio::fs::write(&path, b"partial").await.unwrap();
        drop(TmpFileGuard::new(path.clone()));
        assert!(!path.exists());
    }
}
