//! Layer encryption seams. The copier never ships a cipher; callers hand
//! in implementations of these traits and the pipeline splices them into
//! the stream.

use crate::errors::Error;
use crate::stream::BoxedReader;
use crate::types::{Annotations, BlobInfo};

/// Media-type suffix that marks an encrypted blob.
pub const ENCRYPTED_MEDIA_TYPE_SUFFIX: &str = "+encrypted";

/// Annotation namespace holding the encryption metadata.
pub const ENCRYPTION_ANNOTATION_PREFIX: &str = "org.opencontainers.image.enc";

pub fn is_encrypted_media_type(media_type: &str) -> bool {
    media_type.ends_with(ENCRYPTED_MEDIA_TYPE_SUFFIX)
}

/// `…tar+gzip+encrypted` -> `…tar+gzip`
pub fn decrypted_media_type(media_type: &str) -> Option<&str> {
    media_type.strip_suffix(ENCRYPTED_MEDIA_TYPE_SUFFIX)
}

pub fn encrypted_media_type(media_type: &str) -> String {
    format!("{media_type}{ENCRYPTED_MEDIA_TYPE_SUFFIX}")
}

/// Everything except the encryption metadata survives a decrypt.
pub fn strip_encryption_annotations(annotations: &Annotations) -> Annotations {
    annotations
        .iter()
        .filter(|(k, _)| !k.starts_with(ENCRYPTION_ANNOTATION_PREFIX))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Wraps a ciphertext stream with a decryptor.
pub trait BlobDecrypter: Send + Sync {
    /// `annotations` carry the wrapped keys and cipher options of the
    /// incoming blob.
    fn decrypt_stream(
        &self,
        stream: BoxedReader,
        annotations: &Annotations,
    ) -> Result<BoxedReader, Error>;
}

/// Wraps a plaintext stream with an encryptor.
pub trait BlobEncrypter: Send + Sync {
    /// The finalizer may only be invoked after the returned stream has been
    /// fully consumed; it yields the annotations describing the produced
    /// ciphertext.
    fn encrypt_stream(
        &self,
        stream: BoxedReader,
        info: &BlobInfo,
    ) -> Result<(BoxedReader, Box<dyn EncryptionFinalizer>), Error>;
}

pub trait EncryptionFinalizer: Send {
    fn finalize(self: Box<Self>) -> Result<Annotations, Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_type_suffix() {
        assert!(is_encrypted_media_type(
            "application/vnd.oci.image.layer.v1.tar+gzip+encrypted"
        ));
        assert!(!is_encrypted_media_type(
            "application/vnd.oci.image.layer.v1.tar+gzip"
        ));
        assert_eq!(
            decrypted_media_type("application/vnd.oci.image.layer.v1.tar+gzip+encrypted"),
            Some("application/vnd.oci.image.layer.v1.tar+gzip")
        );
    }

    #[test]
    fn test_strip_annotations() {
        let mut a = Annotations::new();
        a.insert(
            "org.opencontainers.image.enc.keys.jwe".to_string(),
            "xxx".to_string(),
        );
        a.insert("org.example.keep".to_string(), "yyy".to_string());
        let stripped = strip_encryption_annotations(&a);
        assert_eq!(stripped.len(), 1);
        assert!(stripped.contains_key("org.example.keep"));
    }
}
