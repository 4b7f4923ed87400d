//! Transport-to-transport container image copying: per-blob streaming
//! pipelines, manifest conversion planning, and the blob-info cache that
//! lets later copies skip work.

pub mod cache;
pub mod compression;
pub mod conversion;
pub mod copy;
pub mod digesting;
pub mod encryption;
pub mod errors;
pub mod list;
pub mod manifest;
mod multiple;
pub mod options;
mod pipeline;
pub mod progress;
pub mod schema1;
mod single;
pub mod stream;
pub mod transport;
pub mod types;

pub use cache::{BlobCandidate, BlobInfoCache, MemoryCache};
pub use compression::CompressionFormat;
pub use copy::{CopyResult, CopyStats, copy_image};
pub use digesting::{DigestingReader, ValidationFlags, digest_of};
pub use encryption::{BlobDecrypter, BlobEncrypter, EncryptionFinalizer};
pub use errors::Error;
pub use list::PlatformSelector;
pub use options::{CopyOptions, ImageListSelection};
pub use progress::{ProgressEvent, ProgressEventKind};
pub use stream::{BoxedReader, BoxedWriter};
pub use transport::{
    AllowAll, BlobChunkAccessor, ImageDestination, ImagePolicy, ImageSource, ManifestSigner,
    PutBlobOptions, TryReuseBlobOptions,
};
pub use types::{Annotations, BlobInfo, CompressionOp, CryptoOp, LayerInfo, UploadedBlob};
