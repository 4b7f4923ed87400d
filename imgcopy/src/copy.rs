//! The top-level entry: one call that moves an image (or a list of them)
//! from a source to a destination.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::info;
use oci_spec::image::Digest;
use tokio::sync::Semaphore;

use crate::cache::BlobInfoCache;
use crate::conversion::is_manifest_list_type;
use crate::errors::Error;
use crate::list::ManifestList;
use crate::manifest::guess_manifest_mime_type;
use crate::multiple::copy_multiple_images;
use crate::options::{CopyOptions, DEFAULT_MAX_PARALLEL_DOWNLOADS, ImageListSelection};
use crate::single::copy_single_image;
use crate::transport::{ImageDestination, ImagePolicy, ImageSource};

#[derive(Default)]
pub(crate) struct CopyCounters {
    pub blobs_copied: AtomicU64,
    pub blobs_reused: AtomicU64,
    pub bytes_copied: AtomicU64,
    pub manifests_written: AtomicU64,
}

impl CopyCounters {
    pub(crate) fn snapshot(&self) -> CopyStats {
        CopyStats {
            blobs_copied: self.blobs_copied.load(Ordering::Relaxed),
            blobs_reused: self.blobs_reused.load(Ordering::Relaxed),
            bytes_copied: self.bytes_copied.load(Ordering::Relaxed),
            manifests_written: self.manifests_written.load(Ordering::Relaxed),
        }
    }
}

/// What one copy did, for operators and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyStats {
    pub blobs_copied: u64,
    pub blobs_reused: u64,
    pub bytes_copied: u64,
    pub manifests_written: u64,
}

#[derive(Debug)]
pub struct CopyResult {
    /// The manifest as written to the destination (the toplevel list when
    /// one was copied).
    pub manifest: Vec<u8>,
    pub manifest_mime_type: String,
    pub manifest_digest: Digest,
    pub stats: CopyStats,
}

pub(crate) struct CopyContext {
    pub src: Arc<dyn ImageSource>,
    pub dest: Arc<dyn ImageDestination>,
    pub cache: Arc<dyn BlobInfoCache>,
    pub options: Arc<CopyOptions>,
    pub semaphore: Arc<Semaphore>,
    pub counters: Arc<CopyCounters>,
}

/// The MIME type to believe for a manifest, favoring content over labels
/// that are absent or generic.
pub(crate) fn effective_mime_type(data: &[u8], reported: &str) -> String {
    let normalized = crate::conversion::normalize_manifest_type(reported);
    match guess_manifest_mime_type(data) {
        Some(guessed) if reported.is_empty() || reported == "application/json" => {
            guessed.to_string()
        }
        _ => normalized.to_string(),
    }
}

/// Copy the image named by `src` into `dest`, transforming blobs to the
/// destination's requirements and recording equivalences in `cache`.
///
/// Returns the manifest that ended up at the destination.
pub async fn copy_image(
    policy: &dyn ImagePolicy,
    src: Arc<dyn ImageSource>,
    dest: Arc<dyn ImageDestination>,
    cache: Arc<dyn BlobInfoCache>,
    options: CopyOptions,
) -> Result<CopyResult, Error> {
    let parallelism = if options.max_parallel_downloads > 0 {
        options.max_parallel_downloads
    } else {
        DEFAULT_MAX_PARALLEL_DOWNLOADS
    };
    let semaphore = if !dest.has_thread_safe_put_blob() || !src.has_thread_safe_get_blob() {
        // endpoints that are not safe for concurrent blob I/O serialize
        // everything, whatever the caller asked for
        Arc::new(Semaphore::new(1))
    } else {
        options
            .concurrent_blob_copies_semaphore
            .clone()
            .unwrap_or_else(|| Arc::new(Semaphore::new(parallelism)))
    };

    let ctx = CopyContext {
        src,
        dest,
        cache,
        options: Arc::new(options),
        semaphore,
        counters: Arc::new(CopyCounters::default()),
    };

    let (manifest_bytes, reported_mime) = ctx.src.get_manifest(None).await?;
    let mime = effective_mime_type(&manifest_bytes, &reported_mime);
    info!(
        "copying {} ({mime}) to {}",
        ctx.src.reference(),
        ctx.dest.reference()
    );

    let copied = if is_manifest_list_type(&mime) {
        match &ctx.options.image_list_selection {
            ImageListSelection::System => {
                let list = ManifestList::parse(&manifest_bytes, &mime)?;
                let platform = ctx.options.platform.clone().unwrap_or_default();
                let instance = list.choose_instance(&platform)?;
                copy_single_image(&ctx, policy, Some(&instance), Some(&manifest_bytes)).await?
            }
            ImageListSelection::All | ImageListSelection::Specific(_) => {
                copy_multiple_images(&ctx, policy, &manifest_bytes, &mime).await?
            }
        }
    } else {
        copy_single_image(&ctx, policy, None, None).await?
    };

    ctx.dest.commit().await?;
    Ok(CopyResult {
        manifest: copied.manifest,
        manifest_mime_type: copied.mime_type,
        manifest_digest: copied.digest,
        stats: ctx.counters.snapshot(),
    })
}
