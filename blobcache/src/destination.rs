//! The write side of the cache: every blob and manifest that goes through
//! lands on disk, and gzip blobs get a decompressed counterpart.

use std::io::Write as _;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use async_trait::async_trait;
use log::{error, info};
use oci_spec::image::Digest;
use sha2::{Digest as _, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf, ReadHalf, SimplexStream};
use tokio::sync::oneshot;

use imgcopy::stream::{BoxedReader, TeeReader};
use imgcopy::transport::{
    BlobChunkAccessor, ImageDestination, PutBlobOptions, TryReuseBlobOptions,
};
use imgcopy::{BlobInfo, BlobInfoCache, CompressionOp, Error, UploadedBlob, digest_of};

use crate::{BlobCacheDir, PIPE_BUF_SIZE, TmpFileGuard, gzip_media_type, uncompressed_media_type};

pub struct CachingDestination {
    cache: BlobCacheDir,
    inner: Arc<dyn ImageDestination>,
}

impl CachingDestination {
    pub(crate) fn new(cache: BlobCacheDir, inner: Arc<dyn ImageDestination>) -> Self {
        CachingDestination { cache, inner }
    }
}

/// Latches whether the wrapped stream was read through to EOF; only then
/// is the teed file a complete copy worth keeping.
struct EofFlagReader<R> {
    inner: R,
    eof: Arc<AtomicBool>,
}

impl<R: AsyncRead + Unpin> AsyncRead for EofFlagReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        let me = &mut *self;
        let before = buf.filled().len();
        match Pin::new(&mut me.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                if buf.filled().len() == before {
                    me.eof.store(true, Ordering::Relaxed);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

#[async_trait]
impl ImageDestination for CachingDestination {
    fn reference(&self) -> String {
        self.inner.reference()
    }

    fn reference_digest(&self) -> Option<Digest> {
        self.inner.reference_digest()
    }

    fn supported_manifest_mime_types(&self) -> Vec<String> {
        self.inner.supported_manifest_mime_types()
    }

    fn supports_signatures(&self) -> bool {
        self.inner.supports_signatures()
    }

    fn desired_layer_compression(&self) -> CompressionOp {
        self.inner.desired_layer_compression()
    }

    fn desired_compression_format(&self) -> Option<imgcopy::CompressionFormat> {
        self.inner.desired_compression_format()
    }

    fn accepts_foreign_layer_urls(&self) -> bool {
        self.inner.accepts_foreign_layer_urls()
    }

    fn must_match_runtime_os(&self) -> bool {
        self.inner.must_match_runtime_os()
    }

    fn ignores_embedded_docker_reference(&self) -> bool {
        self.inner.ignores_embedded_docker_reference()
    }

    fn has_thread_safe_put_blob(&self) -> bool {
        self.inner.has_thread_safe_put_blob()
    }

    fn supports_put_blob_partial(&self) -> bool {
        self.inner.supports_put_blob_partial()
    }

    async fn put_blob(
        &self,
        stream: &mut (dyn AsyncRead + Send + Unpin),
        info: &BlobInfo,
        options: PutBlobOptions<'_>,
    ) -> Result<UploadedBlob, Error> {
        let is_config = options.is_config;
        let tmp = self.cache.tmp_path();
        let file = tokio::fs::File::create(&tmp).await?;
        let guard = TmpFileGuard::new(tmp);

        // second branch: a background decompressor producing the
        // counterpart blob for gzip layers
        let (pipe_rd, pipe_wr) = tokio::io::simplex(PIPE_BUF_SIZE);
        let (confirm_tx, confirm_rx) = oneshot::channel::<Option<Digest>>();
        let worker = if is_config {
            drop(pipe_rd);
            None
        } else {
            Some(tokio::spawn(decompress_to_cache(
                self.cache.clone(),
                pipe_rd,
                confirm_rx,
            )))
        };

        let eof = Arc::new(AtomicBool::new(false));
        let result = if is_config {
            let mut reader = EofFlagReader {
                inner: TeeReader::new(&mut *stream, file),
                eof: eof.clone(),
            };
            self.inner.put_blob(&mut reader, info, options).await
        } else {
            let mut reader = EofFlagReader {
                inner: TeeReader::new(TeeReader::new(&mut *stream, file), pipe_wr),
                eof: eof.clone(),
            };
            self.inner.put_blob(&mut reader, info, options).await
        };

        match result {
            Ok(uploaded) => {
                if eof.load(Ordering::Relaxed) {
                    let final_path = self.cache.blob_path(&uploaded.digest);
                    guard.success(&final_path).await?;
                    let _ = confirm_tx.send(Some(uploaded.digest.clone()));
                    info!("cached blob {} at {final_path:?}", uploaded.digest);
                } else {
                    // the destination short-circuited; the file is partial
                    let _ = confirm_tx.send(None);
                }
                drop(worker);
                Ok(uploaded)
            }
            Err(e) => {
                let _ = confirm_tx.send(None);
                drop(worker);
                Err(e)
            }
        }
    }

    async fn try_reusing_blob(
        &self,
        info: &BlobInfo,
        options: TryReuseBlobOptions<'_>,
    ) -> Result<Option<BlobInfo>, Error> {
        let can_substitute = options.can_substitute;
        let empty_layer = options.empty_layer;
        let layer_index = options.layer_index;
        let cache = options.cache;
        if let Some(reused) = self.inner.try_reusing_blob(info, options).await? {
            return Ok(Some(reused));
        }
        let Some(digest) = &info.digest else {
            return Ok(None);
        };

        // an exact local copy: replay it into the destination
        if let Some((file, size)) = self.cache.open_blob(digest).await? {
            info!("replaying cached blob {digest} into the destination");
            let uploaded = self
                .replay(file, info, cache, empty_layer, layer_index)
                .await?;
            if uploaded.digest != *digest {
                return Err(Error::Internal(format!(
                    "cache file for {digest} hashed to {}",
                    uploaded.digest
                )));
            }
            let mut out = info.clone();
            out.size = size;
            return Ok(Some(out));
        }

        // a decompressed counterpart will do when substitution is allowed
        if can_substitute {
            if let Some(counterpart) = self.cache.read_counterpart(digest, "decompressed").await {
                if let Some(media_type) = uncompressed_media_type(&info.media_type) {
                    if let Some((file, size)) = self.cache.open_blob(&counterpart).await? {
                        info!(
                            "substituting cached decompressed blob {counterpart} for {digest}"
                        );
                        let substitute = BlobInfo::new(counterpart.clone(), size, media_type);
                        let uploaded = self
                            .replay(file, &substitute, cache, empty_layer, layer_index)
                            .await?;
                        if uploaded.digest != counterpart {
                            return Err(Error::Internal(format!(
                                "cache file for {counterpart} hashed to {}",
                                uploaded.digest
                            )));
                        }
                        return Ok(Some(substitute));
                    }
                }
            }
            // or the compressed form of a blob the manifest lists plain
            if let Some(counterpart) = self.cache.read_counterpart(digest, "compressed").await {
                if let Some(media_type) = gzip_media_type(&info.media_type) {
                    if let Some((file, size)) = self.cache.open_blob(&counterpart).await? {
                        info!("substituting cached compressed blob {counterpart} for {digest}");
                        let substitute = BlobInfo::new(counterpart.clone(), size, media_type);
                        let uploaded = self
                            .replay(file, &substitute, cache, empty_layer, layer_index)
                            .await?;
                        if uploaded.digest != counterpart {
                            return Err(Error::Internal(format!(
                                "cache file for {counterpart} hashed to {}",
                                uploaded.digest
                            )));
                        }
                        return Ok(Some(substitute));
                    }
                }
            }
        }
        Ok(None)
    }

    async fn put_blob_partial(
        &self,
        accessor: &dyn BlobChunkAccessor,
        info: &BlobInfo,
        cache: &dyn BlobInfoCache,
    ) -> Result<BlobInfo, Error> {
        // partial assembly bypasses the byte stream, so there is nothing
        // to tee; pass it through
        self.inner.put_blob_partial(accessor, info, cache).await
    }

    async fn put_manifest(&self, manifest: &[u8], instance: Option<&Digest>) -> Result<(), Error> {
        self.inner.put_manifest(manifest, instance).await?;
        let digest = digest_of(manifest);
        let path = self.cache.manifest_path(&digest);
        if let Err(e) = self.cache.write_note(&path, manifest).await {
            error!("could not cache manifest {digest}: {e}");
        }
        Ok(())
    }

    async fn put_signatures(
        &self,
        signatures: &[Vec<u8>],
        instance: Option<&Digest>,
    ) -> Result<(), Error> {
        self.inner.put_signatures(signatures, instance).await
    }

    async fn existing_manifest(&self) -> Result<Option<(bytes::Bytes, String)>, Error> {
        self.inner.existing_manifest().await
    }

    async fn commit(&self) -> Result<(), Error> {
        self.inner.commit().await
    }
}

impl CachingDestination {
    async fn replay(
        &self,
        file: tokio::fs::File,
        info: &BlobInfo,
        cache: &dyn BlobInfoCache,
        empty_layer: bool,
        layer_index: Option<usize>,
    ) -> Result<UploadedBlob, Error> {
        let mut reader: BoxedReader = Box::new(file);
        self.inner
            .put_blob(
                &mut reader,
                info,
                PutBlobOptions {
                    cache,
                    is_config: false,
                    empty_layer,
                    layer_index,
                },
            )
            .await
    }
}

/// Reads the teed stream; when it turns out to be gzip, writes the
/// decompressed bytes to a counterpart blob plus the two sidecar notes.
/// The pipe is drained on every path so the tee never stalls.
async fn decompress_to_cache(
    cache: BlobCacheDir,
    mut src: ReadHalf<SimplexStream>,
    confirmed: oneshot::Receiver<Option<Digest>>,
) {
    match decompress_to_tmp(&cache, &mut src).await {
        Ok(Some((tmp_guard, decompressed_digest))) => {
            // only pair it up once the compressed blob became visible
            match confirmed.await {
                Ok(Some(compressed_digest)) => {
                    let final_path = cache.blob_path(&decompressed_digest);
                    if let Err(e) = tmp_guard.success(&final_path).await {
                        error!("could not store decompressed counterpart: {e}");
                        return;
                    }
                    if let Err(e) = cache
                        .write_counterpart_notes(&compressed_digest, &decompressed_digest)
                        .await
                    {
                        error!("could not write counterpart notes: {e}");
                    }
                }
                _ => {
                    // upload failed or was cut short; the guard discards
                    // the temp file
                }
            }
        }
        Ok(None) => {
            // not gzip; nothing to record
            let _ = confirmed.await;
        }
        Err(e) => {
            error!("background decompression failed: {e}");
            let _ = tokio::io::copy(&mut src, &mut tokio::io::sink()).await;
            let _ = confirmed.await;
        }
    }
}

async fn decompress_to_tmp(
    cache: &BlobCacheDir,
    src: &mut ReadHalf<SimplexStream>,
) -> Result<Option<(TmpFileGuard, Digest)>, Error> {
    let mut magic = [0u8; 2];
    let mut filled = 0;
    while filled < magic.len() {
        let n = src.read(&mut magic[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    if filled < magic.len() || magic != [0x1f, 0x8b] {
        tokio::io::copy(src, &mut tokio::io::sink()).await?;
        return Ok(None);
    }

    let tmp = cache.tmp_path();
    let mut file = tokio::fs::File::create(&tmp).await?;
    let guard = TmpFileGuard::new(tmp);
    let mut hasher = Sha256::new();
    let mut decoder = flate2::write::GzDecoder::new(Vec::new());
    decoder.write_all(&magic)?;
    let mut buf = vec![0u8; 32 * 1024];
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        decoder.write_all(&buf[..n])?;
        let out = std::mem::take(decoder.get_mut());
        if !out.is_empty() {
            hasher.update(&out);
            file.write_all(&out).await?;
        }
    }
    let out = decoder.finish()?;
    if !out.is_empty() {
        hasher.update(&out);
        file.write_all(&out).await?;
    }
    file.flush().await?;
    let digest: Digest = format!("sha256:{}", hex::encode(hasher.finalize()))
        .parse()
        .map_err(|_| Error::Internal("hash did not parse as a digest".to_string()))?;
    Ok(Some((guard, digest)))
}
