use oci_spec::image::Digest;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("parsing digest {0:?}")]
    BadDigest(String),
    #[error("digest algorithm {0} not handled")]
    DigestAlgorithmNotHandled(String),
    #[error("invalid option: {0}")]
    InvalidOption(String),
    #[error("policy denied image {0}")]
    PolicyDenied(String),
    #[error("blob {expected}: content digest is {actual}")]
    DigestMismatch { expected: Digest, actual: Digest },
    #[error("destination rejected manifest type {0}")]
    ManifestTypeRejected(String),
    #[error("destination cannot store layers compressed as {0}")]
    LayerCompressionIncompatibility(String),
    #[error("{0}")]
    Unsupported(String),
    #[error("encryption and decryption requested for the same blob")]
    EncryptAndDecrypt,
    #[error("reading blob {digest}: {source}")]
    ReadingBlob {
        digest: String,
        source: std::io::Error,
    },
    #[error("writing blob: {0}")]
    WritingBlob(#[source] Box<Error>),
    #[error("writing manifest {mime_type}: {source}")]
    WritingManifest {
        mime_type: String,
        source: Box<Error>,
    },
    #[error("parsing manifest: {0}")]
    ParsingManifest(#[source] serde_json::Error),
    #[error("manifest type {0} cannot be produced from this image")]
    ManifestNotConvertible(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    OciSpec(#[from] oci_spec::OciSpecError),
    #[error("operation canceled")]
    Canceled,
    #[error("internal error: {0}")]
    Internal(String),
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// A manifest upload failure that may be resolved by re-trying with a
    /// different manifest MIME type.
    pub fn is_manifest_rejection(&self) -> bool {
        match self {
            Error::ManifestTypeRejected(_) | Error::LayerCompressionIncompatibility(_) => true,
            Error::WritingManifest { source, .. } => source.is_manifest_rejection(),
            _ => false,
        }
    }
}
