//! The seams the copier consumes transports through. Registry, directory,
//! daemon etc. implementations live elsewhere; everything here is an
//! interface plus the option bundles those interfaces take.

use async_trait::async_trait;
use bytes::Bytes;
use oci_spec::image::Digest;

use crate::cache::BlobInfoCache;
use crate::compression::CompressionFormat;
use crate::errors::Error;
use crate::stream::BoxedReader;
use crate::types::{BlobInfo, CompressionOp, UploadedBlob};

pub struct PutBlobOptions<'a> {
    pub cache: &'a dyn BlobInfoCache,
    pub is_config: bool,
    pub empty_layer: bool,
    pub layer_index: Option<usize>,
}

pub struct TryReuseBlobOptions<'a> {
    pub cache: &'a dyn BlobInfoCache,
    /// Whether a different-but-equivalent blob (e.g. the uncompressed
    /// counterpart) is acceptable. Requires the caller to be allowed to
    /// edit the manifest.
    pub can_substitute: bool,
    pub empty_layer: bool,
    pub layer_index: Option<usize>,
    /// The source the blob would otherwise be fetched from, for transports
    /// that can mount across repositories.
    pub src_ref: Option<String>,
}

/// Access to ranges of a blob, for destinations that can assemble blobs
/// from chunks without a full pull.
#[async_trait]
pub trait BlobChunkAccessor: Send + Sync {
    /// `chunks` are (offset, length) pairs; the stream yields them in
    /// order.
    async fn get_blob_at(
        &self,
        info: &BlobInfo,
        chunks: &[(u64, u64)],
    ) -> Result<BoxedReader, Error>;
}

#[async_trait]
pub trait ImageSource: Send + Sync {
    /// Human-readable reference of this source, for messages.
    fn reference(&self) -> String;

    /// The raw manifest bytes and their MIME type. `instance` selects one
    /// manifest out of a list, None means the reference's main one.
    async fn get_manifest(&self, instance: Option<&Digest>) -> Result<(Bytes, String), Error>;

    /// A stream of the blob plus its size (-1 when unknown).
    async fn get_blob(
        &self,
        info: &BlobInfo,
        cache: &dyn BlobInfoCache,
    ) -> Result<(BoxedReader, i64), Error>;

    async fn get_signatures(&self, instance: Option<&Digest>) -> Result<Vec<Vec<u8>>, Error> {
        let _ = instance;
        Ok(Vec::new())
    }

    fn supports_get_blob_at(&self) -> bool {
        false
    }

    fn blob_chunk_accessor(&self) -> Option<&dyn BlobChunkAccessor> {
        None
    }

    /// Replacement layer descriptors to copy instead of the manifest's,
    /// e.g. when the transport prefers a differently-compressed variant.
    async fn layer_infos_for_copy(
        &self,
        instance: Option<&Digest>,
    ) -> Result<Option<Vec<BlobInfo>>, Error> {
        let _ = instance;
        Ok(None)
    }

    fn has_thread_safe_get_blob(&self) -> bool {
        false
    }

    async fn close(&self) -> Result<(), Error> {
        Ok(())
    }
}

#[async_trait]
pub trait ImageDestination: Send + Sync {
    /// Human-readable reference of this destination, for messages.
    fn reference(&self) -> String;

    /// If the destination reference pins a digest, the manifest written
    /// (or the enclosing list) must match it.
    fn reference_digest(&self) -> Option<Digest> {
        None
    }

    /// Manifest MIME types accepted, in no particular order; empty means
    /// anything goes.
    fn supported_manifest_mime_types(&self) -> Vec<String>;

    fn supports_signatures(&self) -> bool {
        false
    }

    fn desired_layer_compression(&self) -> CompressionOp {
        CompressionOp::PreserveOriginal
    }

    /// The specific algorithm wanted when `desired_layer_compression` is
    /// Compress; None picks the default.
    fn desired_compression_format(&self) -> Option<CompressionFormat> {
        None
    }

    fn accepts_foreign_layer_urls(&self) -> bool {
        false
    }

    fn must_match_runtime_os(&self) -> bool {
        false
    }

    fn ignores_embedded_docker_reference(&self) -> bool {
        false
    }

    fn has_thread_safe_put_blob(&self) -> bool {
        false
    }

    /// Store the stream; the destination digests what it actually received
    /// and returns that. `info.digest` may be unset when the pipeline
    /// transformed the bytes.
    async fn put_blob(
        &self,
        stream: &mut (dyn tokio::io::AsyncRead + Send + Unpin),
        info: &BlobInfo,
        options: PutBlobOptions<'_>,
    ) -> Result<UploadedBlob, Error>;

    /// Returns the effective blob info when the destination already holds
    /// the blob (or an acceptable substitute) and the upload can be
    /// skipped.
    async fn try_reusing_blob(
        &self,
        info: &BlobInfo,
        options: TryReuseBlobOptions<'_>,
    ) -> Result<Option<BlobInfo>, Error> {
        let _ = (info, options);
        Ok(None)
    }

    fn supports_put_blob_partial(&self) -> bool {
        false
    }

    async fn put_blob_partial(
        &self,
        accessor: &dyn BlobChunkAccessor,
        info: &BlobInfo,
        cache: &dyn BlobInfoCache,
    ) -> Result<BlobInfo, Error> {
        let _ = (accessor, info, cache);
        Err(Error::Unsupported(
            "destination does not support partial blob uploads".to_string(),
        ))
    }

    async fn put_manifest(&self, manifest: &[u8], instance: Option<&Digest>) -> Result<(), Error>;

    async fn put_signatures(
        &self,
        signatures: &[Vec<u8>],
        instance: Option<&Digest>,
    ) -> Result<(), Error> {
        let _ = instance;
        if signatures.is_empty() {
            Ok(())
        } else {
            Err(Error::Unsupported(
                "destination does not support signatures".to_string(),
            ))
        }
    }

    /// The manifest currently stored under this destination's reference,
    /// for the already-exists short-circuit. None when unknown or absent.
    async fn existing_manifest(&self) -> Result<Option<(Bytes, String)>, Error> {
        Ok(None)
    }

    /// Called once after everything was written successfully.
    async fn commit(&self) -> Result<(), Error> {
        Ok(())
    }
}

/// Gate deciding whether an image may be copied at all. Signature policy
/// enforcement lives behind this seam.
pub trait ImagePolicy: Send + Sync {
    fn is_image_allowed(
        &self,
        image_ref: &str,
        manifest: &[u8],
        mime_type: &str,
    ) -> Result<bool, Error>;
}

/// Accepts everything; the default when no policy engine is wired up.
pub struct AllowAll;

impl ImagePolicy for AllowAll {
    fn is_image_allowed(&self, _: &str, _: &[u8], _: &str) -> Result<bool, Error> {
        Ok(true)
    }
}

/// Produces a detached signature for a manifest.
pub trait ManifestSigner: Send + Sync {
    fn sign(&self, manifest: &[u8]) -> Result<Vec<u8>, Error>;
}
