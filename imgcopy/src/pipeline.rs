//! The per-blob streaming pipeline: digest validation, decryption,
//! compression detection and conversion, the DiffID tee, encryption,
//! progress, and the hand-off to the destination.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use log::{info, warn};
use oci_spec::image::{Digest, DigestAlgorithm};
use tokio::io::AsyncReadExt;
use tokio::sync::oneshot;

use crate::cache::BlobInfoCache;
use crate::compression::{
    CompressionFormat, DEFAULT_COMPRESSION_FORMAT, compress_stream, compressor_name_of,
    compressor_names, decompress_stream, detect_compression, expected_format_for_media_type,
};
use crate::digesting::{DigestingReader, Hasher, ValidationFlags};
use crate::encryption::{
    BlobDecrypter, BlobEncrypter, EncryptionFinalizer, decrypted_media_type,
    encrypted_media_type, is_encrypted_media_type, strip_encryption_annotations,
};
use crate::errors::Error;
use crate::progress::{ProgressEventKind, ProgressOutput, ProgressReader};
use crate::stream::{
    BoxedReader, BoxedWriter, CountingReader, PIPE_BUF_SIZE, ReadSideAnnotator, TeeReader,
};
use crate::transport::{ImageDestination, PutBlobOptions};
use crate::types::{BlobInfo, CompressionOp, CryptoOp};

/// Builds the write end of the DiffID branch once the pipeline knows which
/// decompressor the branch needs.
pub(crate) type DiffIdWriterFactory =
    Box<dyn FnOnce(Option<CompressionFormat>) -> Result<BoxedWriter, Error> + Send>;

pub(crate) struct BlobCopyRequest {
    pub stream: BoxedReader,
    pub src_info: BlobInfo,
    pub diff_id_tee: Option<DiffIdWriterFactory>,
    pub can_modify_blob: bool,
    pub is_config: bool,
    pub to_encrypt: bool,
    pub decrypter: Option<Arc<dyn BlobDecrypter>>,
    pub encrypter: Option<Arc<dyn BlobEncrypter>>,
    pub progress: ProgressOutput,
    pub layer_index: Option<usize>,
    pub empty_layer: bool,
}

/// Stream one blob into the destination, transforming it on the way, and
/// return the info describing what the destination now holds.
pub(crate) async fn copy_blob_from_stream(
    dest: &dyn ImageDestination,
    cache: &dyn BlobInfoCache,
    req: BlobCopyRequest,
) -> Result<BlobInfo, Error> {
    let BlobCopyRequest {
        stream,
        src_info,
        diff_id_tee,
        can_modify_blob,
        is_config,
        to_encrypt,
        decrypter,
        encrypter,
        progress,
        layer_index,
        empty_layer,
    } = req;

    // exactly one of encrypt/decrypt may apply to a blob
    let will_decrypt = is_encrypted_media_type(&src_info.media_type) && decrypter.is_some();
    if to_encrypt && will_decrypt {
        return Err(Error::EncryptAndDecrypt);
    }

    let start = Instant::now();
    let mut info = src_info.clone();

    let (mut reader, validation): (BoxedReader, Option<Arc<ValidationFlags>>) =
        match &src_info.digest {
            Some(digest) => {
                let (r, flags) = DigestingReader::new(stream, digest)?;
                (Box::new(r), Some(flags))
            }
            None => (stream, None),
        };
    reader = Box::new(ReadSideAnnotator::new(
        reader,
        format!("reading blob {}", src_info.digest_string()),
    ));
    let counter = Arc::new(AtomicU64::new(0));
    reader = Box::new(CountingReader::new(reader, counter.clone()));

    let mut decrypted = false;
    if will_decrypt {
        if let Some(decrypter) = decrypter.as_deref() {
            reader = decrypter.decrypt_stream(reader, &info.annotations)?;
            info.annotations = strip_encryption_annotations(&info.annotations);
            if let Some(mt) = decrypted_media_type(&info.media_type) {
                info.media_type = mt.to_string();
            }
            info.forget_digest();
            info.crypto_operation = CryptoOp::Decrypt;
            decrypted = true;
        }
    }

    let (detected, rest) = detect_compression(reader).await.map_err(|e| Error::ReadingBlob {
        digest: src_info.digest_string(),
        source: e,
    })?;
    reader = rest;
    if let Some(expected) = expected_format_for_media_type(&info.media_type) {
        if detected != Some(expected) {
            warn!(
                "blob {} with media type {} is compressed as {}, not {expected}",
                src_info.digest_string(),
                info.media_type,
                detected.map(|f| f.name()).unwrap_or("nothing"),
            );
        }
    }

    let teeing = diff_id_tee.is_some();
    if let Some(factory) = diff_id_tee {
        let writer = factory(detected)?;
        reader = Box::new(TeeReader::new(reader, writer));
    }

    let desired = if is_config || !can_modify_blob || is_encrypted_media_type(&info.media_type) {
        CompressionOp::PreserveOriginal
    } else {
        dest.desired_layer_compression()
    };
    let requested = dest
        .desired_compression_format()
        .unwrap_or(DEFAULT_COMPRESSION_FORMAT);
    let src_compressor = compressor_name_of(detected);
    let uploaded_compressor;
    match (desired, detected) {
        (CompressionOp::Compress, None) => {
            reader = compress_stream(reader, requested)?;
            info.forget_digest();
            info.compression_operation = CompressionOp::Compress;
            info.compression_algorithm = Some(requested);
            uploaded_compressor = compressor_name_of(Some(requested));
        }
        (CompressionOp::Compress, Some(format)) if format != requested => {
            // recode into the destination's format; as far as the manifest
            // operation goes this still counts as preserved
            reader = decompress_stream(reader, format)?;
            reader = compress_stream(reader, requested)?;
            info.forget_digest();
            info.compression_operation = CompressionOp::PreserveOriginal;
            info.compression_algorithm = Some(requested);
            uploaded_compressor = compressor_name_of(Some(requested));
        }
        (CompressionOp::Decompress, Some(format)) => {
            reader = decompress_stream(reader, format)?;
            info.forget_digest();
            info.compression_operation = CompressionOp::Decompress;
            info.compression_algorithm = None;
            uploaded_compressor = compressor_names::UNCOMPRESSED;
        }
        _ => {
            info.compression_operation = CompressionOp::PreserveOriginal;
            info.compression_algorithm = detected;
            uploaded_compressor = src_compressor;
        }
    }

    let mut finalizer: Option<Box<dyn EncryptionFinalizer>> = None;
    if to_encrypt && !is_config && !is_encrypted_media_type(&info.media_type) {
        if let Some(encrypter) = encrypter.as_deref() {
            let (r, fin) = encrypter.encrypt_stream(reader, &info)?;
            reader = r;
            info.forget_digest();
            info.crypto_operation = CryptoOp::Encrypt;
            info.media_type = encrypted_media_type(&info.media_type);
            finalizer = Some(fin);
        }
    }

    if let Some(channel) = progress.channel.clone() {
        reader = Box::new(ProgressReader::new(
            reader,
            channel,
            progress.interval,
            src_info.clone(),
        ));
    }
    progress
        .send(ProgressEventKind::NewArtifact, &src_info, 0)
        .await;

    let put_result = dest
        .put_blob(
            &mut reader,
            &info,
            PutBlobOptions {
                cache,
                is_config,
                empty_layer,
                layer_index,
            },
        )
        .await;
    let uploaded = match put_result {
        Ok(uploaded) => {
            if teeing {
                // the DiffID branch must see the whole blob even if the
                // destination stopped reading early
                tokio::io::copy(&mut reader, &mut tokio::io::sink())
                    .await
                    .map_err(|e| match digest_mismatch(&validation, &src_info) {
                        Some(err) => err,
                        None => Error::ReadingBlob {
                            digest: src_info.digest_string(),
                            source: e,
                        },
                    })?;
            }
            uploaded
        }
        Err(e) => {
            return Err(digest_mismatch(&validation, &src_info).unwrap_or(e));
        }
    };

    if let Some(flags) = &validation {
        if flags.failed() {
            return Err(Error::Internal(format!(
                "digest verification failed for blob {} but was ignored",
                src_info.digest_string()
            )));
        }
    }
    if let Some(expected) = &info.digest {
        if *expected != uploaded.digest {
            return Err(Error::Internal(format!(
                "uploaded blob has digest {}, expected {expected}",
                uploaded.digest
            )));
        }
    }
    info.digest = Some(uploaded.digest);
    info.size = uploaded.size;

    if let Some(finalizer) = finalizer {
        let annotations = finalizer.finalize()?;
        info.annotations.extend(annotations);
    }

    let validated = validation.as_ref().is_some_and(|f| f.succeeded());
    let encrypted = info.crypto_operation == CryptoOp::Encrypt;
    if validated && !decrypted && !encrypted {
        if let (Some(src_digest), Some(uploaded_digest)) = (&src_info.digest, &info.digest) {
            match info.compression_operation {
                CompressionOp::Compress => {
                    cache.record_digest_uncompressed_pair(uploaded_digest, src_digest);
                }
                CompressionOp::Decompress => {
                    cache.record_digest_uncompressed_pair(src_digest, uploaded_digest);
                }
                CompressionOp::PreserveOriginal => {}
            }
            if src_compressor != compressor_names::UNKNOWN {
                cache.record_digest_compressor_name(src_digest, src_compressor);
            }
            if uploaded_compressor != compressor_names::UNKNOWN {
                cache.record_digest_compressor_name(uploaded_digest, uploaded_compressor);
            }
        }
    }

    let bytes = counter.load(Ordering::Relaxed);
    progress.send(ProgressEventKind::Done, &info, bytes).await;
    let elapsed = start.elapsed();
    let speed = (bytes as f32) / 1_000_000.0 / elapsed.as_secs_f32().max(f32::EPSILON);
    info!(
        "blob {} copied bytes={bytes} elapsed={elapsed:?} speed={speed:.2} MB/s",
        info.digest_string()
    );
    Ok(info)
}

fn digest_mismatch(validation: &Option<Arc<ValidationFlags>>, src_info: &BlobInfo) -> Option<Error> {
    let flags = validation.as_ref()?;
    if !flags.failed() {
        return None;
    }
    Some(Error::DigestMismatch {
        expected: src_info.digest.clone()?,
        actual: flags.mismatched_digest()?,
    })
}

/// Set up the DiffID branch: a factory the pipeline invokes with the
/// detected decompressor, plus the channel delivering the computed digest.
pub(crate) fn diff_id_computer() -> (
    DiffIdWriterFactory,
    oneshot::Receiver<Result<Digest, Error>>,
) {
    let (tx, rx) = oneshot::channel();
    let factory: DiffIdWriterFactory = Box::new(move |decompressor| {
        let (rd, wr) = tokio::io::simplex(PIPE_BUF_SIZE);
        tokio::spawn(async move {
            let res = compute_diff_id(Box::new(rd), decompressor).await;
            let _ = tx.send(res);
        });
        Ok(Box::new(wr))
    });
    (factory, rx)
}

async fn compute_diff_id(
    reader: BoxedReader,
    format: Option<CompressionFormat>,
) -> Result<Digest, Error> {
    let mut reader = match format {
        Some(format) => decompress_stream(reader, format)?,
        None => reader,
    };
    let mut hasher = Hasher::for_algorithm(&DigestAlgorithm::Sha256)?;
    let mut buf = vec![0u8; 32 * 1024];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize_digest())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write as _;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::cache::MemoryCache;
    use crate::digesting::digest_of;
    use crate::types::UploadedBlob;

    #[derive(Default)]
    struct TestDestination {
        desired: Option<CompressionOp>,
        format: Option<CompressionFormat>,
        blobs: Mutex<HashMap<String, Vec<u8>>>,
    }

    #[async_trait]
    impl ImageDestination for TestDestination {
        fn reference(&self) -> String {
            "test-dest".to_string()
        }

        fn supported_manifest_mime_types(&self) -> Vec<String> {
            Vec::new()
        }

        fn desired_layer_compression(&self) -> CompressionOp {
            self.desired.unwrap_or_default()
        }

        fn desired_compression_format(&self) -> Option<CompressionFormat> {
            self.format
        }

        async fn put_blob(
            &self,
            stream: &mut (dyn tokio::io::AsyncRead + Send + Unpin),
            _info: &BlobInfo,
            _options: PutBlobOptions<'_>,
        ) -> Result<UploadedBlob, Error> {
            let mut data = Vec::new();
            stream.read_to_end(&mut data).await?;
            let digest = digest_of(&data);
            let size = data.len() as i64;
            self.blobs.lock().unwrap().insert(digest.to_string(), data);
            Ok(UploadedBlob { digest, size })
        }

        async fn put_manifest(&self, _: &[u8], _: Option<&Digest>) -> Result<(), Error> {
            Ok(())
        }
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn request(data: &[u8], media_type: &str) -> BlobCopyRequest {
        BlobCopyRequest {
            stream: Box::new(std::io::Cursor::new(data.to_vec())),
            src_info: BlobInfo::new(digest_of(data), data.len() as i64, media_type),
            diff_id_tee: None,
            can_modify_blob: true,
            is_config: false,
            to_encrypt: false,
            decrypter: None,
            encrypter: None,
            progress: ProgressOutput::disabled(),
            layer_index: Some(0),
            empty_layer: false,
        }
    }

    #[tokio::test]
    async fn test_passthrough_preserves_bytes_and_digest() {
        let dest = TestDestination::default();
        let cache = MemoryCache::new();
        let data = b"uncompressed layer data".to_vec();
        let mut req = request(&data, "application/vnd.oci.image.layer.v1.tar");
        req.can_modify_blob = false;
        let out = copy_blob_from_stream(&dest, &cache, req).await.unwrap();
        assert_eq!(out.digest, Some(digest_of(&data)));
        assert_eq!(out.size, data.len() as i64);
        assert_eq!(out.compression_operation, CompressionOp::PreserveOriginal);
        let blobs = dest.blobs.lock().unwrap();
        assert_eq!(blobs.get(&digest_of(&data).to_string()).unwrap(), &data);
        // preserved blobs leave no pair behind
        assert!(cache.uncompressed_digest(&digest_of(&data)).is_none());
    }

    #[tokio::test]
    async fn test_compress_on_the_fly_records_pair() {
        let dest = TestDestination {
            desired: Some(CompressionOp::Compress),
            format: Some(CompressionFormat::Gzip),
            ..Default::default()
        };
        let cache = MemoryCache::new();
        let data = vec![3u8; 50_000];
        let src_digest = digest_of(&data);
        let out = copy_blob_from_stream(
            &dest,
            &cache,
            request(&data, "application/vnd.oci.image.layer.v1.tar"),
        )
        .await
        .unwrap();
        let uploaded = out.digest.clone().unwrap();
        assert_ne!(uploaded, src_digest);
        assert_eq!(out.compression_operation, CompressionOp::Compress);
        assert_eq!(out.compression_algorithm, Some(CompressionFormat::Gzip));
        // the destination got a gzip stream that decompresses back
        let blobs = dest.blobs.lock().unwrap();
        let stored = blobs.get(&uploaded.to_string()).unwrap();
        assert_eq!(&stored[..2], &[0x1f, 0x8b]);
        // pair: uploaded is the compressed form of src
        assert_eq!(cache.uncompressed_digest(&uploaded), Some(src_digest.clone()));
        assert_eq!(cache.uncompressed_digest(&src_digest), Some(src_digest));
    }

    #[tokio::test]
    async fn test_decompress_records_pair_and_diff_id_matches() {
        let dest = TestDestination {
            desired: Some(CompressionOp::Decompress),
            ..Default::default()
        };
        let cache = MemoryCache::new();
        let plain: Vec<u8> = (0..60_000u32).map(|x| (x % 7) as u8).collect();
        let compressed = gzip(&plain);
        let (factory, rx) = diff_id_computer();
        let mut req = request(&compressed, "application/vnd.oci.image.layer.v1.tar+gzip");
        req.diff_id_tee = Some(factory);
        let out = copy_blob_from_stream(&dest, &cache, req).await.unwrap();
        let uploaded = out.digest.clone().unwrap();
        assert_eq!(uploaded, digest_of(&plain));
        assert_eq!(out.size, plain.len() as i64);
        let src_digest = digest_of(&compressed);
        assert_eq!(cache.uncompressed_digest(&src_digest), Some(uploaded.clone()));
        // the DiffID branch decompressed the same bytes
        let diff_id = rx.await.unwrap().unwrap();
        assert_eq!(diff_id, digest_of(&plain));
    }

    #[tokio::test]
    async fn test_digest_mismatch_surfaces_after_full_read() {
        let dest = TestDestination::default();
        let cache = MemoryCache::new();
        let data = b"the real content".to_vec();
        let mut req = request(&data, "application/vnd.oci.image.layer.v1.tar");
        // lie about the digest
        req.src_info.digest = Some(digest_of(b"declared content"));
        let err = copy_blob_from_stream(&dest, &cache, req).await.unwrap_err();
        match err {
            Error::DigestMismatch { expected, actual } => {
                assert_eq!(expected, digest_of(b"declared content"));
                assert_eq!(actual, digest_of(&data));
            }
            other => panic!("expected DigestMismatch, got {other:?}"),
        }
        // the destination saw the bytes anyway, but nothing was recorded
        assert!(cache.uncompressed_digest(&digest_of(&data)).is_none());
    }

    #[tokio::test]
    async fn test_encrypt_plus_decrypt_fails_fast() {
        struct NoDecrypter;
        impl BlobDecrypter for NoDecrypter {
            fn decrypt_stream(
                &self,
                _: BoxedReader,
                _: &crate::types::Annotations,
            ) -> Result<BoxedReader, Error> {
                panic!("must not be reached");
            }
        }
        let dest = TestDestination::default();
        let cache = MemoryCache::new();
        let data = b"ciphertext".to_vec();
        let mut req = request(&data, "application/vnd.oci.image.layer.v1.tar+gzip+encrypted");
        req.to_encrypt = true;
        req.decrypter = Some(Arc::new(NoDecrypter));
        let err = copy_blob_from_stream(&dest, &cache, req).await.unwrap_err();
        assert!(matches!(err, Error::EncryptAndDecrypt));
        assert!(dest.blobs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recode_gzip_to_zstd_is_preserve_with_new_format() {
        let dest = TestDestination {
            desired: Some(CompressionOp::Compress),
            format: Some(CompressionFormat::Zstd),
            ..Default::default()
        };
        let cache = MemoryCache::new();
        let plain = vec![9u8; 40_000];
        let compressed = gzip(&plain);
        let out = copy_blob_from_stream(
            &dest,
            &cache,
            request(&compressed, "application/vnd.oci.image.layer.v1.tar+gzip"),
        )
        .await
        .unwrap();
        assert_eq!(out.compression_operation, CompressionOp::PreserveOriginal);
        assert_eq!(out.compression_algorithm, Some(CompressionFormat::Zstd));
        let blobs = dest.blobs.lock().unwrap();
        let stored = blobs.get(&out.digest.unwrap().to_string()).unwrap();
        assert_eq!(&stored[..4], &[0x28, 0xb5, 0x2f, 0xfd]);
        // recode records no pair
        assert!(cache
            .uncompressed_digest(&digest_of(&compressed))
            .is_none());
    }

    #[tokio::test]
    async fn test_config_is_never_recompressed() {
        let dest = TestDestination {
            desired: Some(CompressionOp::Compress),
            format: Some(CompressionFormat::Gzip),
            ..Default::default()
        };
        let cache = MemoryCache::new();
        let config = br#"{"architecture":"amd64","os":"linux"}"#.to_vec();
        let mut req = request(&config, "application/vnd.oci.image.config.v1+json");
        req.is_config = true;
        req.can_modify_blob = false;
        let out = copy_blob_from_stream(&dest, &cache, req).await.unwrap();
        assert_eq!(out.digest, Some(digest_of(&config)));
        let blobs = dest.blobs.lock().unwrap();
        assert_eq!(blobs.get(&digest_of(&config).to_string()).unwrap(), &config);
    }
}
