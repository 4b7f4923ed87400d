//! Copying one image: ordering the layers, fanning out blob pipelines
//! under the semaphore, rewriting the manifest, and writing it with
//! fallback types when the destination refuses the preferred one.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use log::{info, warn};
use oci_spec::image::Digest;
use tokio::task::JoinSet;

use crate::cache::BlobInfoCache;
use crate::compression::CompressionFormat;
use crate::conversion::{
    ConversionRequest, ManifestConversionPlan, determine_manifest_conversion,
    is_manifest_list_type, normalize_manifest_type,
};
use crate::copy::{CopyContext, CopyCounters, effective_mime_type};
use crate::digesting::digest_of;
use crate::encryption::{BlobDecrypter, BlobEncrypter, is_encrypted_media_type};
use crate::errors::Error;
use crate::manifest::{
    ConversionPayload, Manifest, config_os_arch, schema1_to_config_bytes,
};
use crate::options::layers_to_encrypt;
use crate::pipeline::{BlobCopyRequest, copy_blob_from_stream, diff_id_computer};
use crate::progress::{ProgressEventKind, ProgressOutput};
use crate::schema1::{GZIPPED_EMPTY_LAYER, GZIPPED_EMPTY_LAYER_DIGEST};
use crate::transport::{ImageDestination, ImagePolicy, ImageSource, TryReuseBlobOptions};
use crate::types::{BlobInfo, CompressionOp, CryptoOp, LayerInfo};

pub(crate) struct CopiedImage {
    pub manifest: Vec<u8>,
    pub mime_type: String,
    pub digest: Digest,
}

/// Everything a per-layer task needs to own.
#[derive(Clone)]
struct LayerTaskContext {
    src: Arc<dyn ImageSource>,
    dest: Arc<dyn ImageDestination>,
    cache: Arc<dyn BlobInfoCache>,
    decrypter: Option<Arc<dyn BlobDecrypter>>,
    encrypter: Option<Arc<dyn BlobEncrypter>>,
    progress: ProgressOutput,
    download_foreign_layers: bool,
    semaphore: Arc<tokio::sync::Semaphore>,
    counters: Arc<CopyCounters>,
}

impl LayerTaskContext {
    fn from_copy_context(ctx: &CopyContext) -> Self {
        LayerTaskContext {
            src: ctx.src.clone(),
            dest: ctx.dest.clone(),
            cache: ctx.cache.clone(),
            decrypter: ctx.options.decrypt_config.clone(),
            encrypter: ctx.options.encrypt_config.clone(),
            progress: ProgressOutput {
                channel: ctx.options.progress.clone(),
                interval: ctx.options.progress_interval,
            },
            download_foreign_layers: ctx.options.download_foreign_layers,
            semaphore: ctx.semaphore.clone(),
            counters: ctx.counters.clone(),
        }
    }
}

/// Copy a single (non-list) image. `instance` selects one manifest out of
/// a source list; `toplevel_list` is the enclosing list's raw bytes when
/// there is one, for the digest-pin check.
pub(crate) async fn copy_single_image(
    ctx: &CopyContext,
    policy: &dyn ImagePolicy,
    instance: Option<&Digest>,
    toplevel_list: Option<&[u8]>,
) -> Result<CopiedImage, Error> {
    let (manifest_bytes, reported_mime) = ctx.src.get_manifest(instance).await?;
    let mime = effective_mime_type(&manifest_bytes, &reported_mime);
    if is_manifest_list_type(&mime) {
        return Err(Error::Other(format!(
            "manifest {} is unexpectedly a manifest list",
            instance.map(|d| d.to_string()).unwrap_or_default()
        )));
    }
    if !policy.is_image_allowed(&ctx.src.reference(), &manifest_bytes, &mime)? {
        return Err(Error::PolicyDenied(ctx.src.reference()));
    }
    let manifest = Manifest::parse(&manifest_bytes, &mime)?;
    let src_manifest_digest = digest_of(&manifest_bytes);

    if let Some(pinned) = ctx.dest.reference_digest() {
        let written = match toplevel_list {
            Some(list) => digest_of(list),
            None => src_manifest_digest.clone(),
        };
        if written != pinned {
            return Err(Error::Other(format!(
                "destination requires digest {pinned}, but {written} would be written"
            )));
        }
    }

    let config_info = manifest.config_info();
    let config_bytes = match &config_info {
        Some(info) => Some(fetch_config(ctx, info).await?),
        None => None,
    };

    if ctx.dest.must_match_runtime_os() {
        if let Some(config) = &config_bytes {
            let (os, arch) = config_os_arch(config)?;
            let want = ctx.options.platform.clone().unwrap_or_default();
            if os != want.os || arch != want.architecture {
                return Err(Error::Unsupported(format!(
                    "image is for {os}/{arch}, destination requires {}/{}",
                    want.os, want.architecture
                )));
            }
        }
    }

    let signatures = if ctx.options.remove_signatures {
        Vec::new()
    } else {
        ctx.src.get_signatures(instance).await?
    };
    if (!signatures.is_empty() || !ctx.options.signers.is_empty())
        && !ctx.dest.supports_signatures()
    {
        return Err(Error::Unsupported(
            "destination does not support signatures".to_string(),
        ));
    }

    let cannot_modify_manifest_reason = if !signatures.is_empty() {
        Some("signatures would be invalidated")
    } else if ctx.dest.reference_digest().is_some() {
        Some("destination pins a digest")
    } else if ctx.options.preserve_digests {
        Some("digests are preserved")
    } else {
        None
    };

    let dest_supported = ctx.dest.supported_manifest_mime_types();
    let requested_compression = requested_compression_for(ctx);
    let plan = determine_manifest_conversion(&ConversionRequest {
        src_mime_type: &mime,
        dest_supported: &dest_supported,
        force_mime_type: ctx.options.force_manifest_mime_type.as_deref(),
        requires_oci_encryption: ctx.options.encryption_requested(),
        requested_compression,
        cannot_modify_manifest_reason,
    })?;

    // any candidate we may end up emitting decides whether the tee runs
    let diff_ids_needed = manifest.conversion_needs_diff_ids(&plan.preferred)
        || plan
            .other_candidates
            .iter()
            .any(|c| manifest.conversion_needs_diff_ids(c));

    if nothing_would_change(ctx, &plan, &signatures) {
        if let Some((existing, _)) = ctx.dest.existing_manifest().await? {
            if digest_of(&existing) == src_manifest_digest {
                info!("destination already holds {src_manifest_digest}, skipping copy");
                return Ok(CopiedImage {
                    manifest: manifest_bytes.to_vec(),
                    mime_type: mime,
                    digest: src_manifest_digest,
                });
            }
        }
    }

    let src_layers = source_layers(ctx, &manifest, instance).await?;
    let can_substitute =
        cannot_modify_manifest_reason.is_none() && ctx.options.signers.is_empty();
    let can_modify_blob = cannot_modify_manifest_reason.is_none();
    let (copied_layers, diff_ids) = copy_layers(
        ctx,
        &src_layers,
        diff_ids_needed,
        can_substitute,
        can_modify_blob,
    )
    .await?;

    // the config is written strictly after every layer made it
    let copied_config = match (&config_info, &config_bytes) {
        (Some(info), Some(bytes)) => Some(copy_config(ctx, info, bytes).await?),
        _ => None,
    };

    let changed = layers_changed(&src_layers, &copied_layers);
    let updated = UpdatedImage {
        manifest: &manifest,
        original_bytes: &manifest_bytes,
        source_mime: &mime,
        copied_layers: &copied_layers,
        copied_config,
        config_bytes: config_bytes.as_deref(),
        diff_ids: &diff_ids,
        changed,
    };

    let mut attempts = Vec::with_capacity(1 + plan.other_candidates.len());
    attempts.push(plan.preferred.clone());
    attempts.extend(plan.other_candidates.iter().cloned());
    let mut written: Option<(Vec<u8>, String)> = None;
    for (i, target) in attempts.iter().enumerate() {
        match write_manifest_as(ctx, &updated, target, instance).await {
            Ok(bytes) => {
                written = Some((bytes, target.clone()));
                break;
            }
            Err(e) if e.is_manifest_rejection() && i + 1 < attempts.len() => {
                warn!("destination refused manifest type {target}: {e}; trying a fallback");
            }
            Err(e) => return Err(e),
        }
    }
    let Some((final_bytes, final_mime)) = written else {
        return Err(Error::Internal("manifest upload loop wrote nothing".to_string()));
    };
    ctx.counters.manifests_written.fetch_add(1, Ordering::Relaxed);
    let final_digest = digest_of(&final_bytes);

    let mut all_signatures = signatures;
    for signer in &ctx.options.signers {
        all_signatures.push(signer.sign(&final_bytes)?);
    }
    if !all_signatures.is_empty() {
        let target_instance = instance.map(|_| final_digest.clone());
        ctx.dest
            .put_signatures(&all_signatures, target_instance.as_ref())
            .await?;
    }

    Ok(CopiedImage {
        manifest: final_bytes,
        mime_type: final_mime,
        digest: final_digest,
    })
}

/// The one predicate deciding whether the destination-already-exists
/// optimization may apply.
fn nothing_would_change(
    ctx: &CopyContext,
    plan: &ManifestConversionPlan,
    signatures: &[Vec<u8>],
) -> bool {
    ctx.options.optimize_destination_image_already_exists
        && !plan.preferred_needs_conversion
        && signatures.is_empty()
        && ctx.options.signers.is_empty()
        && !ctx.options.encryption_requested()
        && ctx.options.decrypt_config.is_none()
}

fn requested_compression_for(ctx: &CopyContext) -> Option<CompressionFormat> {
    if ctx.dest.desired_layer_compression() == CompressionOp::Compress {
        ctx.dest.desired_compression_format()
    } else {
        None
    }
}

async fn fetch_config(ctx: &CopyContext, info: &BlobInfo) -> Result<Vec<u8>, Error> {
    use tokio::io::AsyncReadExt;
    let (mut stream, _) = ctx.src.get_blob(info, &*ctx.cache).await?;
    let mut data = Vec::new();
    stream
        .read_to_end(&mut data)
        .await
        .map_err(|e| Error::ReadingBlob {
            digest: info.digest_string(),
            source: e,
        })?;
    if let Some(expected) = &info.digest {
        let actual = digest_of(&data);
        if actual != *expected {
            return Err(Error::DigestMismatch {
                expected: expected.clone(),
                actual,
            });
        }
    }
    Ok(data)
}

/// The layers to copy: the manifest's, unless the source substitutes its
/// own variants.
async fn source_layers(
    ctx: &CopyContext,
    manifest: &Manifest,
    instance: Option<&Digest>,
) -> Result<Vec<LayerInfo>, Error> {
    let mut layers = manifest.layer_infos()?;
    if let Some(substituted) = ctx.src.layer_infos_for_copy(instance).await? {
        if substituted.len() != layers.len() {
            return Err(Error::Other(format!(
                "source substituted {} layers for {}",
                substituted.len(),
                layers.len()
            )));
        }
        for (layer, info) in layers.iter_mut().zip(substituted.into_iter()) {
            layer.info = info;
        }
    }
    Ok(layers)
}

async fn copy_layers(
    ctx: &CopyContext,
    src_layers: &[LayerInfo],
    diff_ids_needed: bool,
    can_substitute: bool,
    can_modify_blob: bool,
) -> Result<(Vec<LayerInfo>, Vec<Digest>), Error> {
    let encrypt_set: HashSet<usize> = if ctx.options.encryption_requested() {
        layers_to_encrypt(ctx.options.encrypt_layers.as_deref(), src_layers.len())
    } else {
        HashSet::new()
    };

    let task_ctx = LayerTaskContext::from_copy_context(ctx);
    let mut set = JoinSet::new();
    for (i, layer) in src_layers.iter().enumerate() {
        let task_ctx = task_ctx.clone();
        let layer = layer.clone();
        let to_encrypt = encrypt_set.contains(&i);
        set.spawn(async move {
            let result = copy_layer(
                &task_ctx,
                layer,
                i,
                to_encrypt,
                diff_ids_needed,
                can_substitute,
                can_modify_blob,
            )
            .await;
            (i, result)
        });
    }

    let mut results: Vec<Option<(LayerInfo, Option<Digest>)>> =
        (0..src_layers.len()).map(|_| None).collect();
    while let Some(next) = set.join_next().await {
        match next {
            Ok((i, Ok(res))) => {
                results[i] = Some(res);
            }
            Ok((_, Err(e))) => {
                // dropping the set aborts the rest
                return Err(e);
            }
            Err(e) if e.is_cancelled() => return Err(Error::Canceled),
            Err(_) => return Err(Error::Internal("layer copy task panicked".to_string())),
        }
    }

    let mut layers = Vec::with_capacity(src_layers.len());
    let mut diff_ids = Vec::new();
    for slot in results {
        let (layer, diff_id) = slot
            .ok_or_else(|| Error::Internal("layer copy finished without a result".to_string()))?;
        if let Some(diff_id) = diff_id {
            diff_ids.push(diff_id);
        }
        layers.push(layer);
    }
    Ok((layers, diff_ids))
}

#[allow(clippy::too_many_arguments)]
async fn copy_layer(
    ctx: &LayerTaskContext,
    layer: LayerInfo,
    index: usize,
    to_encrypt: bool,
    diff_ids_needed: bool,
    can_substitute: bool,
    can_modify_blob: bool,
) -> Result<(LayerInfo, Option<Digest>), Error> {
    let _permit = ctx
        .semaphore
        .acquire()
        .await
        .map_err(|_| Error::Canceled)?;

    // a foreign layer stays a URL reference unless we are told to
    // materialize it
    if !layer.info.urls.is_empty()
        && !ctx.download_foreign_layers
        && ctx.dest.accepts_foreign_layer_urls()
    {
        ctx.progress
            .send(ProgressEventKind::Skipped, &layer.info, 0)
            .await;
        return Ok((layer, None));
    }

    let crypto_changes = to_encrypt
        || (is_encrypted_media_type(&layer.info.media_type) && ctx.decrypter.is_some());
    if !diff_ids_needed && !crypto_changes {
        // substituting across an encryption boundary stays off the table
        if let Some(reused) = ctx
            .dest
            .try_reusing_blob(
                &layer.info,
                TryReuseBlobOptions {
                    cache: &*ctx.cache,
                    can_substitute,
                    empty_layer: layer.empty_layer,
                    layer_index: Some(index),
                    src_ref: Some(ctx.src.reference()),
                },
            )
            .await?
        {
            info!(
                "skipped copying blob {} (destination already has it)",
                layer.info.digest_string()
            );
            ctx.counters.blobs_reused.fetch_add(1, Ordering::Relaxed);
            ctx.progress
                .send(ProgressEventKind::Skipped, &layer.info, 0)
                .await;
            return Ok((
                LayerInfo {
                    info: reused,
                    empty_layer: layer.empty_layer,
                },
                None,
            ));
        }

        if ctx.dest.supports_put_blob_partial() && ctx.src.supports_get_blob_at() {
            if let Some(accessor) = ctx.src.blob_chunk_accessor() {
                match ctx
                    .dest
                    .put_blob_partial(accessor, &layer.info, &*ctx.cache)
                    .await
                {
                    Ok(info) => {
                        ctx.counters.blobs_copied.fetch_add(1, Ordering::Relaxed);
                        return Ok((
                            LayerInfo {
                                info,
                                empty_layer: layer.empty_layer,
                            },
                            None,
                        ));
                    }
                    Err(e) => {
                        info!(
                            "partial pull of blob {} failed, falling back to full copy: {e}",
                            layer.info.digest_string()
                        );
                    }
                }
            }
        }
    }

    let (stream, size) = ctx.src.get_blob(&layer.info, &*ctx.cache).await?;
    let mut src_info = layer.info.clone();
    if size >= 0 {
        src_info.size = size;
    }
    let (tee, diff_id_rx) = if diff_ids_needed && !layer.empty_layer {
        let (factory, rx) = diff_id_computer();
        (Some(factory), Some(rx))
    } else {
        (None, None)
    };
    let info = copy_blob_from_stream(
        &*ctx.dest,
        &*ctx.cache,
        BlobCopyRequest {
            stream,
            src_info,
            diff_id_tee: tee,
            can_modify_blob: can_modify_blob && layer.info.urls.is_empty(),
            is_config: false,
            to_encrypt,
            decrypter: ctx.decrypter.clone(),
            encrypter: ctx.encrypter.clone(),
            progress: ctx.progress.clone(),
            layer_index: Some(index),
            empty_layer: layer.empty_layer,
        },
    )
    .await?;
    ctx.counters.blobs_copied.fetch_add(1, Ordering::Relaxed);
    if info.size > 0 {
        ctx.counters
            .bytes_copied
            .fetch_add(info.size as u64, Ordering::Relaxed);
    }
    let diff_id = match diff_id_rx {
        Some(rx) => Some(
            rx.await
                .map_err(|_| Error::Internal("DiffID worker disappeared".to_string()))??,
        ),
        None => None,
    };
    Ok((
        LayerInfo {
            info,
            empty_layer: layer.empty_layer,
        },
        diff_id,
    ))
}

async fn copy_config(
    ctx: &CopyContext,
    info: &BlobInfo,
    data: &[u8],
) -> Result<BlobInfo, Error> {
    let _permit = ctx
        .semaphore
        .acquire()
        .await
        .map_err(|_| Error::Canceled)?;
    let mut src_info = info.clone();
    src_info.size = data.len() as i64;
    let out = copy_blob_from_stream(
        &*ctx.dest,
        &*ctx.cache,
        BlobCopyRequest {
            stream: Box::new(std::io::Cursor::new(data.to_vec())),
            src_info,
            diff_id_tee: None,
            can_modify_blob: false,
            is_config: true,
            to_encrypt: false,
            decrypter: None,
            encrypter: None,
            progress: ProgressOutput {
                channel: ctx.options.progress.clone(),
                interval: ctx.options.progress_interval,
            },
            layer_index: None,
            empty_layer: false,
        },
    )
    .await?;
    ctx.counters.blobs_copied.fetch_add(1, Ordering::Relaxed);
    Ok(out)
}

fn layers_changed(src: &[LayerInfo], copied: &[LayerInfo]) -> bool {
    src.iter().zip(copied.iter()).any(|(a, b)| {
        a.info.digest != b.info.digest
            || b.info.compression_operation != CompressionOp::PreserveOriginal
            || b.info.crypto_operation != CryptoOp::None
            || a.info.annotations != b.info.annotations
    })
}

struct UpdatedImage<'a> {
    manifest: &'a Manifest,
    original_bytes: &'a [u8],
    source_mime: &'a str,
    copied_layers: &'a [LayerInfo],
    copied_config: Option<BlobInfo>,
    config_bytes: Option<&'a [u8]>,
    diff_ids: &'a [Digest],
    changed: bool,
}

fn same_family(manifest: &Manifest, target: &str) -> bool {
    use crate::conversion::{DOCKER_V2S1, DOCKER_V2S1_SIGNED, DOCKER_V2S2, OCI_MANIFEST_V1};
    match manifest {
        Manifest::Oci(_) => target == OCI_MANIFEST_V1,
        Manifest::DockerV2S2(_) => target == DOCKER_V2S2,
        Manifest::Schema1(_) => target == DOCKER_V2S1 || target == DOCKER_V2S1_SIGNED,
    }
}

/// Render the updated manifest as `target` (uploading a synthesized config
/// when the conversion needs one) and write it to the destination.
async fn write_manifest_as(
    ctx: &CopyContext,
    updated: &UpdatedImage<'_>,
    target: &str,
    instance: Option<&Digest>,
) -> Result<Vec<u8>, Error> {
    let target = normalize_manifest_type(target);
    let bytes = if same_family(updated.manifest, target) {
        if !updated.changed && target == normalize_manifest_type(updated.source_mime) {
            // nothing moved; keep the source bytes (and digest) intact
            updated.original_bytes.to_vec()
        } else {
            let mut m = updated.manifest.clone();
            let infos: Vec<BlobInfo> = updated
                .copied_layers
                .iter()
                .map(|l| l.info.clone())
                .collect();
            m.update_layer_infos(&infos)?;
            m.serialize()?
        }
    } else {
        let mut payload_config_info = updated.copied_config.clone();
        let synthesized;
        let config_data: Option<&[u8]> = if let Manifest::Schema1(s1) = updated.manifest {
            // converting up: build the config this image never had and
            // store it
            synthesized = schema1_to_config_bytes(s1, updated.diff_ids)?;
            let info = BlobInfo::new(
                digest_of(&synthesized),
                synthesized.len() as i64,
                crate::manifest::OCI_CONFIG_MEDIA_TYPE,
            );
            payload_config_info = Some(copy_config(ctx, &info, &synthesized).await?);
            Some(&synthesized)
        } else {
            updated.config_bytes
        };

        let (name, tag) = reference_name_tag(&ctx.dest.reference());
        let out = updated.manifest.convert_to(
            target,
            &ConversionPayload {
                config_data,
                config_info: payload_config_info.as_ref(),
                layers: updated.copied_layers,
                reference_name: &name,
                reference_tag: &tag,
            },
        )?;
        if let Manifest::Schema1(s1) = &out {
            ensure_empty_layer_blob(ctx, s1).await?;
        }
        out.serialize()?
    };

    let target_instance = instance.map(|_| digest_of(&bytes));
    ctx.dest
        .put_manifest(&bytes, target_instance.as_ref())
        .await
        .map_err(|e| match e {
            e if e.is_manifest_rejection() => e,
            e => Error::WritingManifest {
                mime_type: target.to_string(),
                source: Box::new(e),
            },
        })?;
    Ok(bytes)
}

/// A schema1 manifest may reference the well-known empty gzip blob for
/// throwaway entries; make sure the destination holds it.
async fn ensure_empty_layer_blob(
    ctx: &CopyContext,
    manifest: &crate::schema1::Schema1Manifest,
) -> Result<(), Error> {
    if !manifest
        .fs_layers
        .iter()
        .any(|l| l.blob_sum == GZIPPED_EMPTY_LAYER_DIGEST)
    {
        return Ok(());
    }
    let digest: Digest = GZIPPED_EMPTY_LAYER_DIGEST.parse().unwrap();
    let info = BlobInfo::new(
        digest,
        GZIPPED_EMPTY_LAYER.len() as i64,
        crate::schema1::DOCKER_LAYER_GZIP,
    );
    if ctx
        .dest
        .try_reusing_blob(
            &info,
            TryReuseBlobOptions {
                cache: &*ctx.cache,
                can_substitute: false,
                empty_layer: true,
                layer_index: None,
                src_ref: None,
            },
        )
        .await?
        .is_some()
    {
        return Ok(());
    }
    copy_blob_from_stream(
        &*ctx.dest,
        &*ctx.cache,
        BlobCopyRequest {
            stream: Box::new(std::io::Cursor::new(GZIPPED_EMPTY_LAYER.to_vec())),
            src_info: info,
            diff_id_tee: None,
            can_modify_blob: false,
            is_config: false,
            to_encrypt: false,
            decrypter: None,
            encrypter: None,
            progress: ProgressOutput::disabled(),
            layer_index: None,
            empty_layer: true,
        },
    )
    .await?;
    Ok(())
}

/// Best-effort split of a destination reference into (repository, tag) for
/// schema1 output.
fn reference_name_tag(reference: &str) -> (String, String) {
    let reference = reference.split('@').next().unwrap_or(reference);
    match reference.rsplit_once(':') {
        Some((name, tag)) if !tag.contains('/') => (name.to_string(), tag.to_string()),
        _ => (reference.to_string(), "latest".to_string()),
    }
}
