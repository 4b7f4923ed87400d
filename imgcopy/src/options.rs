//! The recognized knobs of a copy. A concrete struct, not an open bag;
//! unknown options do not exist.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use oci_spec::image::Digest;
use tokio::sync::Semaphore;
use tokio::sync::mpsc;

use crate::encryption::{BlobDecrypter, BlobEncrypter};
use crate::list::PlatformSelector;
use crate::progress::ProgressEvent;
use crate::transport::ManifestSigner;

/// Which instances of a manifest list get copied.
#[derive(Debug, Clone, Default)]
pub enum ImageListSelection {
    /// Copy the single instance matching the configured platform, without
    /// writing the list itself.
    #[default]
    System,
    /// Copy every instance and rewrite the list.
    All,
    /// Copy only the named instances; the re-emitted list keeps all
    /// entries, with the copied ones updated.
    Specific(Vec<Digest>),
}

pub const DEFAULT_MAX_PARALLEL_DOWNLOADS: usize = 6;

pub struct CopyOptions {
    /// Drop pre-existing source signatures.
    pub remove_signatures: bool,
    /// Signers producing new signatures for the written manifest.
    pub signers: Vec<Box<dyn ManifestSigner>>,
    /// Forbid any manifest or blob modification.
    pub preserve_digests: bool,
    /// Pin the output manifest format instead of planning one.
    pub force_manifest_mime_type: Option<String>,
    pub image_list_selection: ImageListSelection,
    /// Platform used for `ImageListSelection::System` and the runtime-OS
    /// check; None means linux/amd64.
    pub platform: Option<PlatformSelector>,
    pub encrypt_config: Option<Arc<dyn BlobEncrypter>>,
    /// Which layers to encrypt: None encrypts nothing, an empty list
    /// everything, negative indices count from the end.
    pub encrypt_layers: Option<Vec<i32>>,
    pub decrypt_config: Option<Arc<dyn BlobDecrypter>>,
    /// Shared limit on blobs in flight; takes precedence over
    /// `max_parallel_downloads` when set.
    pub concurrent_blob_copies_semaphore: Option<Arc<Semaphore>>,
    /// 0 means the default of 6.
    pub max_parallel_downloads: usize,
    /// Skip all work when the destination already holds this manifest.
    pub optimize_destination_image_already_exists: bool,
    /// Materialize layers that are only referenced by URL.
    pub download_foreign_layers: bool,
    pub progress_interval: Duration,
    pub progress: Option<mpsc::Sender<ProgressEvent>>,
}

impl Default for CopyOptions {
    fn default() -> Self {
        CopyOptions {
            remove_signatures: false,
            signers: Vec::new(),
            preserve_digests: false,
            force_manifest_mime_type: None,
            image_list_selection: ImageListSelection::default(),
            platform: None,
            encrypt_config: None,
            encrypt_layers: None,
            decrypt_config: None,
            concurrent_blob_copies_semaphore: None,
            max_parallel_downloads: 0,
            optimize_destination_image_already_exists: false,
            download_foreign_layers: false,
            progress_interval: Duration::from_secs(1),
            progress: None,
        }
    }
}

impl CopyOptions {
    /// Whether layer encryption was requested at all.
    pub(crate) fn encryption_requested(&self) -> bool {
        self.encrypt_config.is_some() && self.encrypt_layers.is_some()
    }
}

/// Resolve the `encrypt_layers` option against a concrete layer count.
/// None selects nothing, an empty list everything, negatives wrap.
pub(crate) fn layers_to_encrypt(
    encrypt_layers: Option<&[i32]>,
    layer_count: usize,
) -> HashSet<usize> {
    match encrypt_layers {
        None => HashSet::new(),
        Some([]) => (0..layer_count).collect(),
        Some(indices) => indices
            .iter()
            .filter_map(|&i| {
                if i >= 0 {
                    let i = i as usize;
                    (i < layer_count).then_some(i)
                } else {
                    layer_count.checked_sub(i.unsigned_abs() as usize)
                }
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layers_to_encrypt() {
        assert!(layers_to_encrypt(None, 5).is_empty());
        assert_eq!(layers_to_encrypt(Some(&[]), 3), (0..3).collect());
        assert_eq!(
            layers_to_encrypt(Some(&[0, 2]), 5),
            [0, 2].into_iter().collect()
        );
        // negative indices count from the end
        assert_eq!(
            layers_to_encrypt(Some(&[-1]), 5),
            [4].into_iter().collect()
        );
        assert_eq!(
            layers_to_encrypt(Some(&[-5, 1]), 5),
            [0, 1].into_iter().collect()
        );
        // out of range indices are ignored
        assert!(layers_to_encrypt(Some(&[7, -9]), 5).is_empty());
    }
}
