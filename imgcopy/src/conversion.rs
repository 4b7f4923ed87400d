//! Choosing the manifest MIME type to emit. Pure decisions only; nothing
//! here touches a transport.

use crate::compression::CompressionFormat;
use crate::errors::Error;

pub const OCI_MANIFEST_V1: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_IMAGE_INDEX_V1: &str = "application/vnd.oci.image.index.v1+json";
pub const DOCKER_V2S2: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_V2_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
pub const DOCKER_V2S1_SIGNED: &str = "application/vnd.docker.distribution.manifest.v1+prettyjws";
pub const DOCKER_V2S1: &str = "application/vnd.docker.distribution.manifest.v1+json";

/// Conversion preference when the source type cannot be kept.
pub const PREFERRED_MANIFEST_TYPES: [&str; 4] =
    [DOCKER_V2S2, DOCKER_V2S1_SIGNED, OCI_MANIFEST_V1, DOCKER_V2S1];

/// The types able to carry OCI-only features (encryption, zstd layers).
pub const OCI_CAPABLE_TYPES: [&str; 1] = [OCI_MANIFEST_V1];

pub const MANIFEST_LIST_TYPES: [&str; 2] = [OCI_IMAGE_INDEX_V1, DOCKER_V2_LIST];

/// Registries answered schema1 requests with these before content types
/// were a thing.
pub fn normalize_manifest_type(mime_type: &str) -> &str {
    match mime_type {
        "" | "text/plain" | "application/json" => DOCKER_V2S1_SIGNED,
        other => other,
    }
}

pub fn is_manifest_list_type(mime_type: &str) -> bool {
    MANIFEST_LIST_TYPES.contains(&mime_type)
}

fn is_oci_capable(mime_type: &str) -> bool {
    OCI_CAPABLE_TYPES.contains(&mime_type)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestConversionPlan {
    pub preferred: String,
    pub preferred_needs_conversion: bool,
    /// Fallbacks to try when the destination rejects `preferred`, in
    /// preference order.
    pub other_candidates: Vec<String>,
}

pub struct ConversionRequest<'a> {
    pub src_mime_type: &'a str,
    pub dest_supported: &'a [String],
    pub force_mime_type: Option<&'a str>,
    pub requires_oci_encryption: bool,
    pub requested_compression: Option<CompressionFormat>,
    pub cannot_modify_manifest_reason: Option<&'a str>,
}

pub fn determine_manifest_conversion(
    req: &ConversionRequest<'_>,
) -> Result<ManifestConversionPlan, Error> {
    let src = normalize_manifest_type(req.src_mime_type);
    let restricted =
        req.requires_oci_encryption || req.requested_compression == Some(CompressionFormat::Zstd);

    if let Some(reason) = req.cannot_modify_manifest_reason {
        // a feature needing conversion on top of this will fail at upload,
        // which is the best we can do
        log::debug!("keeping manifest type {src}: {reason}");
        return Ok(ManifestConversionPlan {
            preferred: src.to_string(),
            preferred_needs_conversion: false,
            other_candidates: Vec::new(),
        });
    }

    if let Some(force) = req.force_mime_type {
        if restricted && !is_oci_capable(force) {
            return Err(Error::Unsupported(format!(
                "forced manifest type {force} cannot carry the requested encryption/compression"
            )));
        }
        return Ok(ManifestConversionPlan {
            preferred: force.to_string(),
            preferred_needs_conversion: force != src,
            other_candidates: Vec::new(),
        });
    }

    // candidate types, source's own type first
    let mut candidates: Vec<&str> = Vec::with_capacity(1 + PREFERRED_MANIFEST_TYPES.len());
    candidates.push(src);
    candidates.extend(PREFERRED_MANIFEST_TYPES.iter().filter(|t| **t != src));
    if restricted {
        candidates.retain(|t| is_oci_capable(t));
    }
    if candidates.is_empty() {
        return Err(Error::Unsupported(format!(
            "no manifest type can carry the requested encryption/compression (source {src})"
        )));
    }

    if req.dest_supported.is_empty() {
        if !restricted {
            // destination accepts anything, keep the source type
            return Ok(ManifestConversionPlan {
                preferred: src.to_string(),
                preferred_needs_conversion: false,
                other_candidates: candidates
                    .iter()
                    .filter(|t| **t != src)
                    .map(|t| t.to_string())
                    .collect(),
            });
        }
        // anything goes, but the features still pin us to the capable set
        let preferred = candidates[0];
        return Ok(ManifestConversionPlan {
            preferred: preferred.to_string(),
            preferred_needs_conversion: preferred != src,
            other_candidates: candidates[1..].iter().map(|t| t.to_string()).collect(),
        });
    }

    let supported = |t: &str| req.dest_supported.iter().any(|s| s == t);

    if supported(src) && (!restricted || is_oci_capable(src)) {
        return Ok(ManifestConversionPlan {
            preferred: src.to_string(),
            preferred_needs_conversion: false,
            other_candidates: candidates
                .iter()
                .filter(|t| **t != src && supported(t))
                .map(|t| t.to_string())
                .collect(),
        });
    }

    let mut usable = candidates.iter().filter(|t| supported(t));
    let Some(preferred) = usable.next() else {
        return Err(Error::Unsupported(if restricted {
            format!(
                "destination supports none of the manifest types able to carry the requested \
                 encryption/compression (source {src})"
            )
        } else {
            format!("destination supports no conversion of manifest type {src}")
        }));
    };
    Ok(ManifestConversionPlan {
        preferred: preferred.to_string(),
        preferred_needs_conversion: true,
        other_candidates: usable.map(|t| t.to_string()).collect(),
    })
}

/// List-type variant of the planner: lists can only be kept or swapped
/// between the OCI index and the Docker list form.
pub fn determine_list_conversion(
    src_mime_type: &str,
    dest_supported: &[String],
    force_mime_type: Option<&str>,
) -> Result<ManifestConversionPlan, Error> {
    let src = normalize_manifest_type(src_mime_type);
    if let Some(force) = force_mime_type {
        if !is_manifest_list_type(force) {
            return Err(Error::Unsupported(format!(
                "cannot convert a manifest list to non-list type {force}"
            )));
        }
        return Ok(ManifestConversionPlan {
            preferred: force.to_string(),
            preferred_needs_conversion: force != src,
            other_candidates: Vec::new(),
        });
    }
    let mut candidates: Vec<&str> = Vec::new();
    candidates.push(src);
    candidates.extend(MANIFEST_LIST_TYPES.iter().filter(|t| **t != src));
    if dest_supported.is_empty() {
        return Ok(ManifestConversionPlan {
            preferred: src.to_string(),
            preferred_needs_conversion: false,
            other_candidates: candidates[1..].iter().map(|t| t.to_string()).collect(),
        });
    }
    let supported = |t: &str| dest_supported.iter().any(|s| s == t);
    let mut usable = candidates.iter().filter(|t| supported(t));
    let Some(preferred) = usable.next() else {
        return Err(Error::Unsupported(format!(
            "destination supports no manifest list type (source {src})"
        )));
    };
    Ok(ManifestConversionPlan {
        preferred: preferred.to_string(),
        preferred_needs_conversion: *preferred != src,
        other_candidates: usable.map(|t| t.to_string()).collect(),
    })
}
