//! Copying a manifest list: per-instance copies plus the rewritten list.

use std::sync::atomic::Ordering;

use log::{info, warn};
use oci_spec::image::Digest;

use crate::conversion::determine_list_conversion;
use crate::copy::{CopyContext, effective_mime_type};
use crate::digesting::digest_of;
use crate::errors::Error;
use crate::list::{InstanceUpdate, ManifestList};
use crate::options::ImageListSelection;
use crate::single::{CopiedImage, copy_single_image};
use crate::transport::ImagePolicy;

pub(crate) async fn copy_multiple_images(
    ctx: &CopyContext,
    policy: &dyn ImagePolicy,
    list_bytes: &[u8],
    list_mime: &str,
) -> Result<CopiedImage, Error> {
    let mut list = ManifestList::parse(list_bytes, list_mime)?;
    let all_instances = list.instance_digests()?;

    let cannot_modify_manifest_list_reason = if ctx.options.preserve_digests {
        Some("digests are preserved")
    } else {
        None
    };

    let signatures = if ctx.options.remove_signatures {
        Vec::new()
    } else {
        ctx.src.get_signatures(None).await?
    };
    if (!signatures.is_empty() || !ctx.options.signers.is_empty())
        && !ctx.dest.supports_signatures()
    {
        return Err(Error::Unsupported(
            "destination does not support signatures".to_string(),
        ));
    }

    let selected: Vec<Digest> = match &ctx.options.image_list_selection {
        ImageListSelection::All => all_instances.clone(),
        ImageListSelection::Specific(wanted) => {
            for digest in wanted {
                if !all_instances.contains(digest) {
                    return Err(Error::InvalidOption(format!(
                        "requested instance {digest} is not in the manifest list"
                    )));
                }
            }
            wanted.clone()
        }
        ImageListSelection::System => {
            // the caller resolves System to a single-image copy; reaching
            // this is a bug
            return Err(Error::Internal(
                "list copy invoked with System selection".to_string(),
            ));
        }
    };
    info!(
        "copying {} of {} instances from the manifest list",
        selected.len(),
        all_instances.len()
    );

    let mut list_changed = false;
    for instance in &selected {
        let copied = copy_single_image(ctx, policy, Some(instance), Some(list_bytes)).await?;
        if copied.digest != *instance {
            list_changed = true;
        }
        list.update_instance(
            instance,
            &InstanceUpdate {
                digest: copied.digest,
                size: copied.manifest.len() as i64,
                media_type: copied.mime_type,
            },
        )?;
    }

    let dest_supported = ctx.dest.supported_manifest_mime_types();
    let effective = effective_mime_type(list_bytes, list_mime);
    let plan = determine_list_conversion(
        &effective,
        &dest_supported,
        ctx.options.force_manifest_mime_type.as_deref(),
    )?;

    if list_changed || plan.preferred_needs_conversion {
        if let Some(reason) = cannot_modify_manifest_list_reason {
            return Err(Error::Other(format!(
                "the manifest list needs to change, but that is forbidden: {reason}"
            )));
        }
    }

    let mut attempts = Vec::with_capacity(1 + plan.other_candidates.len());
    attempts.push(plan.preferred.clone());
    attempts.extend(plan.other_candidates.iter().cloned());
    let mut written: Option<(Vec<u8>, String)> = None;
    for (i, target) in attempts.iter().enumerate() {
        let bytes = if !list_changed && *target == effective {
            list_bytes.to_vec()
        } else {
            list.convert_to(target)?.serialize()?
        };
        match ctx.dest.put_manifest(&bytes, None).await {
            Ok(()) => {
                written = Some((bytes, target.clone()));
                break;
            }
            Err(e) if e.is_manifest_rejection() && i + 1 < attempts.len() => {
                warn!("destination refused list type {target}: {e}; trying a fallback");
            }
            Err(e) => {
                return Err(Error::WritingManifest {
                    mime_type: target.clone(),
                    source: Box::new(e),
                });
            }
        }
    }
    let Some((final_bytes, final_mime)) = written else {
        return Err(Error::Internal("list upload loop wrote nothing".to_string()));
    };
    ctx.counters.manifests_written.fetch_add(1, Ordering::Relaxed);
    let final_digest = digest_of(&final_bytes);

    let mut all_signatures = signatures;
    for signer in &ctx.options.signers {
        all_signatures.push(signer.sign(&final_bytes)?);
    }
    if !all_signatures.is_empty() {
        ctx.dest.put_signatures(&all_signatures, None).await?;
    }

    Ok(CopiedImage {
        manifest: final_bytes,
        mime_type: final_mime,
        digest: final_digest,
    })
}
