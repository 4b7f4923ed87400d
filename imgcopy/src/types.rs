use std::collections::HashMap;

use oci_spec::image::Digest;

use crate::compression::CompressionFormat;

pub type Annotations = HashMap<String, String>;

/// What the pipeline did (or should do) to a blob's compression while moving
/// it. Also the form a destination asks for via
/// [`desired_layer_compression`](crate::transport::ImageDestination::desired_layer_compression).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionOp {
    #[default]
    PreserveOriginal,
    Compress,
    Decompress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CryptoOp {
    #[default]
    None,
    Encrypt,
    Decrypt,
}

/// Descriptor of a blob being moved between transports.
///
/// `digest` is None (and `size` -1) whenever the bytes have been transformed
/// and the real values are only known after the destination re-digests them.
#[derive(Debug, Clone)]
pub struct BlobInfo {
    pub digest: Option<Digest>,
    pub size: i64,
    pub media_type: String,
    pub annotations: Annotations,
    pub urls: Vec<String>,
    pub compression_operation: CompressionOp,
    pub compression_algorithm: Option<CompressionFormat>,
    pub crypto_operation: CryptoOp,
}

impl Default for BlobInfo {
    fn default() -> Self {
        BlobInfo {
            digest: None,
            size: -1,
            media_type: String::new(),
            annotations: Annotations::new(),
            urls: Vec::new(),
            compression_operation: CompressionOp::PreserveOriginal,
            compression_algorithm: None,
            crypto_operation: CryptoOp::None,
        }
    }
}

impl BlobInfo {
    pub fn new(digest: Digest, size: i64, media_type: impl Into<String>) -> Self {
        BlobInfo {
            digest: Some(digest),
            size,
            media_type: media_type.into(),
            ..Default::default()
        }
    }

    /// The digest rendered for messages, or "<unknown>" before a fresh
    /// compute.
    pub fn digest_string(&self) -> String {
        self.digest
            .as_ref()
            .map(|d| d.to_string())
            .unwrap_or_else(|| "<unknown>".to_string())
    }

    /// Forget digest and size after the stream has been transformed.
    pub(crate) fn forget_digest(&mut self) {
        self.digest = None;
        self.size = -1;
    }
}

/// A layer as listed by a manifest, with the bookkeeping the manifest knows
/// beyond the raw descriptor.
#[derive(Debug, Clone)]
pub struct LayerInfo {
    pub info: BlobInfo,
    /// Schema1 throwaway entries produce no filesystem diff.
    pub empty_layer: bool,
}

/// Result of a destination `put_blob`.
#[derive(Debug, Clone)]
pub struct UploadedBlob {
    pub digest: Digest,
    pub size: i64,
}
