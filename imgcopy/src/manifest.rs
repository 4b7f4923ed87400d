//! Parsing, updating and converting the manifest formats the copier can
//! move between: OCI image manifests, Docker schema2, and Docker schema1.

use oci_spec::image::{
    Descriptor, DescriptorBuilder, Digest, ImageConfiguration, ImageManifest,
    ImageManifestBuilder, MediaType,
};
use serde::{Deserialize, Serialize};

use crate::compression::CompressionFormat;
use crate::conversion::{
    DOCKER_V2S1, DOCKER_V2S1_SIGNED, DOCKER_V2S2, OCI_MANIFEST_V1, normalize_manifest_type,
};
use crate::errors::Error;
use crate::schema1::{Schema1Manifest, Schema1Synthesis, synthesize_schema1};
use crate::types::{Annotations, BlobInfo, CryptoOp, LayerInfo};

pub const OCI_CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";
pub const DOCKER_CONFIG_MEDIA_TYPE: &str = "application/vnd.docker.container.image.v1+json";

const OCI_LAYER_BASE: &str = "application/vnd.oci.image.layer.v1.tar";
const OCI_LAYER_ND_BASE: &str = "application/vnd.oci.image.layer.nondistributable.v1.tar";
const DOCKER_LAYER_BASE: &str = "application/vnd.docker.image.rootfs.diff.tar";
const DOCKER_LAYER_FOREIGN_BASE: &str = "application/vnd.docker.image.rootfs.foreign.diff.tar";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ManifestFlavor {
    Oci,
    Docker,
}

/// A layer media type decomposed into the parts conversions care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LayerType {
    flavor: ManifestFlavor,
    /// Foreign/nondistributable layers keep that marker across flavors.
    nondistributable: bool,
    compression: Option<CompressionFormat>,
    encrypted: bool,
}

impl LayerType {
    fn parse(media_type: &str) -> Option<LayerType> {
        let (flavor, nondistributable, rest) =
            if let Some(rest) = media_type.strip_prefix(OCI_LAYER_ND_BASE) {
                (ManifestFlavor::Oci, true, rest)
            } else if let Some(rest) = media_type.strip_prefix(OCI_LAYER_BASE) {
                (ManifestFlavor::Oci, false, rest)
            } else if let Some(rest) = media_type.strip_prefix(DOCKER_LAYER_FOREIGN_BASE) {
                (ManifestFlavor::Docker, true, rest)
            } else if let Some(rest) = media_type.strip_prefix(DOCKER_LAYER_BASE) {
                (ManifestFlavor::Docker, false, rest)
            } else {
                return None;
            };
        let (rest, encrypted) = match rest.strip_suffix("+encrypted") {
            Some(r) => (r, true),
            None => (rest, false),
        };
        let compression = match (flavor, rest) {
            (_, "") => None,
            (ManifestFlavor::Oci, "+gzip") => Some(CompressionFormat::Gzip),
            (ManifestFlavor::Oci, "+zstd") => Some(CompressionFormat::Zstd),
            (ManifestFlavor::Docker, ".gzip") => Some(CompressionFormat::Gzip),
            _ => return None,
        };
        Some(LayerType {
            flavor,
            nondistributable,
            compression,
            encrypted,
        })
    }

    fn render(&self, flavor: ManifestFlavor) -> Result<String, Error> {
        match flavor {
            ManifestFlavor::Oci => {
                let base = if self.nondistributable {
                    OCI_LAYER_ND_BASE
                } else {
                    OCI_LAYER_BASE
                };
                let compression = match self.compression {
                    None => "",
                    Some(CompressionFormat::Gzip) => "+gzip",
                    Some(CompressionFormat::Zstd) => "+zstd",
                    Some(other) => {
                        return Err(Error::LayerCompressionIncompatibility(other.to_string()));
                    }
                };
                let enc = if self.encrypted { "+encrypted" } else { "" };
                Ok(format!("{base}{compression}{enc}"))
            }
            ManifestFlavor::Docker => {
                if self.encrypted {
                    return Err(Error::Unsupported(
                        "Docker manifests cannot reference encrypted layers".to_string(),
                    ));
                }
                let base = if self.nondistributable {
                    DOCKER_LAYER_FOREIGN_BASE
                } else {
                    DOCKER_LAYER_BASE
                };
                match self.compression {
                    None => Ok(base.to_string()),
                    Some(CompressionFormat::Gzip) => Ok(format!("{base}.gzip")),
                    Some(other) => Err(Error::LayerCompressionIncompatibility(other.to_string())),
                }
            }
        }
    }
}

/// The media type a layer descriptor should advertise after the pipeline
/// processed the blob described by `info`.
pub(crate) fn updated_layer_media_type(
    orig: &str,
    info: &BlobInfo,
    flavor: ManifestFlavor,
) -> Result<String, Error> {
    use crate::types::CompressionOp::*;
    let Some(mut lt) = LayerType::parse(orig) else {
        // not a layer type we know; only a pure passthrough may keep it
        if info.compression_operation == PreserveOriginal
            && info.crypto_operation == CryptoOp::None
        {
            return Ok(orig.to_string());
        }
        return Err(Error::Unsupported(format!(
            "cannot update unrecognized layer media type {orig}"
        )));
    };
    match info.compression_operation {
        Decompress => lt.compression = None,
        Compress => lt.compression = info.compression_algorithm,
        PreserveOriginal => {
            // a preserved blob may still have been recoded to the
            // destination's format; advertise what was actually uploaded
            if let Some(algo) = info.compression_algorithm {
                if lt.compression.is_some() && lt.compression != Some(algo) {
                    lt.compression = Some(algo);
                }
            }
        }
    }
    match info.crypto_operation {
        CryptoOp::Encrypt => lt.encrypted = true,
        CryptoOp::Decrypt => lt.encrypted = false,
        CryptoOp::None => {}
    }
    lt.render(flavor)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema2Descriptor {
    pub media_type: String,
    pub size: i64,
    pub digest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<String>>,
}

impl Schema2Descriptor {
    fn to_blob_info(&self) -> Result<BlobInfo, Error> {
        let digest: Digest = self
            .digest
            .parse()
            .map_err(|_| Error::BadDigest(self.digest.clone()))?;
        let mut info = BlobInfo::new(digest, self.size, self.media_type.clone());
        info.urls = self.urls.clone().unwrap_or_default();
        Ok(info)
    }

    fn from_blob_info(info: &BlobInfo, media_type: String) -> Result<Schema2Descriptor, Error> {
        let digest = info
            .digest
            .as_ref()
            .ok_or_else(|| Error::Internal("blob digest unknown after copy".to_string()))?;
        Ok(Schema2Descriptor {
            media_type,
            size: info.size,
            digest: digest.to_string(),
            urls: (!info.urls.is_empty()).then(|| info.urls.clone()),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema2Manifest {
    pub schema_version: u32,
    pub media_type: String,
    pub config: Schema2Descriptor,
    pub layers: Vec<Schema2Descriptor>,
}

/// One parsed manifest of any supported format. Layer accessors are always
/// bottom-first regardless of the underlying format's ordering.
#[derive(Debug, Clone)]
pub enum Manifest {
    Oci(Box<ImageManifest>),
    DockerV2S2(Schema2Manifest),
    Schema1(Schema1Manifest),
}

/// Everything a cross-format conversion may need beyond the manifest
/// itself.
pub(crate) struct ConversionPayload<'a> {
    /// The (possibly synthesized) config blob bytes for the target image.
    pub config_data: Option<&'a [u8]>,
    /// Descriptor of the config blob as uploaded to the destination.
    pub config_info: Option<&'a BlobInfo>,
    /// Post-copy layer infos, bottom-first, one per source layer entry
    /// (schema1 empty entries included).
    pub layers: &'a [LayerInfo],
    /// Repository name/tag for schema1 output.
    pub reference_name: &'a str,
    pub reference_tag: &'a str,
}

impl Manifest {
    pub fn parse(data: &[u8], mime_type: &str) -> Result<Manifest, Error> {
        match normalize_manifest_type(mime_type) {
            OCI_MANIFEST_V1 => Ok(Manifest::Oci(Box::new(
                serde_json::from_slice(data).map_err(Error::ParsingManifest)?,
            ))),
            DOCKER_V2S2 => Ok(Manifest::DockerV2S2(
                serde_json::from_slice(data).map_err(Error::ParsingManifest)?,
            )),
            DOCKER_V2S1 | DOCKER_V2S1_SIGNED => {
                Ok(Manifest::Schema1(Schema1Manifest::parse(data)?))
            }
            other => Err(Error::Unsupported(format!(
                "unsupported manifest type {other}"
            ))),
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            Manifest::Oci(_) => OCI_MANIFEST_V1,
            Manifest::DockerV2S2(_) => DOCKER_V2S2,
            Manifest::Schema1(_) => DOCKER_V2S1_SIGNED,
        }
    }

    /// Layers bottom-first.
    pub fn layer_infos(&self) -> Result<Vec<LayerInfo>, Error> {
        match self {
            Manifest::Oci(m) => m
                .layers()
                .iter()
                .map(|d| {
                    Ok(LayerInfo {
                        info: descriptor_to_blob_info(d),
                        empty_layer: false,
                    })
                })
                .collect(),
            Manifest::DockerV2S2(m) => m
                .layers
                .iter()
                .map(|d| {
                    Ok(LayerInfo {
                        info: d.to_blob_info()?,
                        empty_layer: false,
                    })
                })
                .collect(),
            Manifest::Schema1(m) => m.layer_infos(),
        }
    }

    /// The config blob descriptor; schema1 has none.
    pub fn config_info(&self) -> Option<BlobInfo> {
        match self {
            Manifest::Oci(m) => Some(descriptor_to_blob_info(m.config())),
            Manifest::DockerV2S2(m) => m.config.to_blob_info().ok(),
            Manifest::Schema1(_) => None,
        }
    }

    /// Whether converting *to* `target` requires the per-layer DiffIDs
    /// (i.e. a config must be synthesized from a schema1 source).
    pub fn conversion_needs_diff_ids(&self, target: &str) -> bool {
        matches!(self, Manifest::Schema1(_))
            && matches!(
                normalize_manifest_type(target),
                OCI_MANIFEST_V1 | DOCKER_V2S2
            )
    }

    /// Replace the layer descriptors with the post-copy blob infos,
    /// recomputing media types from what the pipeline did.
    pub fn update_layer_infos(&mut self, infos: &[BlobInfo]) -> Result<(), Error> {
        match self {
            Manifest::Oci(m) => {
                if infos.len() != m.layers().len() {
                    return Err(Error::Other(format!(
                        "updating manifest: got {} layers, expected {}",
                        infos.len(),
                        m.layers().len()
                    )));
                }
                let layers = m
                    .layers()
                    .iter()
                    .zip(infos.iter())
                    .map(|(orig, info)| {
                        let media_type = updated_layer_media_type(
                            &orig.media_type().to_string(),
                            info,
                            ManifestFlavor::Oci,
                        )?;
                        blob_info_to_descriptor(info, media_type)
                    })
                    .collect::<Result<Vec<_>, Error>>()?;
                m.set_layers(layers);
                Ok(())
            }
            Manifest::DockerV2S2(m) => {
                if infos.len() != m.layers.len() {
                    return Err(Error::Other(format!(
                        "updating manifest: got {} layers, expected {}",
                        infos.len(),
                        m.layers.len()
                    )));
                }
                m.layers = m
                    .layers
                    .iter()
                    .zip(infos.iter())
                    .map(|(orig, info)| {
                        let media_type = updated_layer_media_type(
                            &orig.media_type,
                            info,
                            ManifestFlavor::Docker,
                        )?;
                        Schema2Descriptor::from_blob_info(info, media_type)
                    })
                    .collect::<Result<Vec<_>, Error>>()?;
                Ok(())
            }
            Manifest::Schema1(m) => m.update_layer_infos(infos),
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, Error> {
        match self {
            Manifest::Oci(m) => serde_json::to_vec(m).map_err(Error::ParsingManifest),
            Manifest::DockerV2S2(m) => serde_json::to_vec(m).map_err(Error::ParsingManifest),
            Manifest::Schema1(m) => m.serialize(),
        }
    }

    /// Produce a manifest of `target` type describing the same (already
    /// copied) image.
    pub(crate) fn convert_to(
        &self,
        target: &str,
        payload: &ConversionPayload<'_>,
    ) -> Result<Manifest, Error> {
        let target = normalize_manifest_type(target);
        if target == self.mime_type()
            || (matches!(self, Manifest::Schema1(_))
                && matches!(target, DOCKER_V2S1 | DOCKER_V2S1_SIGNED))
        {
            return Ok(self.clone());
        }
        match target {
            OCI_MANIFEST_V1 | DOCKER_V2S2 => {
                let flavor = if target == OCI_MANIFEST_V1 {
                    ManifestFlavor::Oci
                } else {
                    ManifestFlavor::Docker
                };
                self.convert_to_v2(flavor, payload)
            }
            DOCKER_V2S1 | DOCKER_V2S1_SIGNED => self.convert_to_schema1(payload),
            other => Err(Error::ManifestNotConvertible(other.to_string())),
        }
    }

    fn config_descriptor_for(
        &self,
        payload: &ConversionPayload<'_>,
    ) -> Result<(String, i64, Annotations), Error> {
        let info = match self {
            Manifest::Schema1(_) => payload
                .config_info
                .ok_or_else(|| {
                    Error::Internal("schema1 conversion without a synthesized config".to_string())
                })?
                .clone(),
            _ => self
                .config_info()
                .ok_or_else(|| Error::Internal("manifest without config".to_string()))?,
        };
        Ok((
            info.digest
                .as_ref()
                .ok_or_else(|| Error::Internal("config digest unknown".to_string()))?
                .to_string(),
            info.size,
            info.annotations,
        ))
    }

    fn convert_to_v2(
        &self,
        flavor: ManifestFlavor,
        payload: &ConversionPayload<'_>,
    ) -> Result<Manifest, Error> {
        let config_media_type = match flavor {
            ManifestFlavor::Oci => OCI_CONFIG_MEDIA_TYPE,
            ManifestFlavor::Docker => DOCKER_CONFIG_MEDIA_TYPE,
        };
        let (config_digest, config_size, _) = self.config_descriptor_for(payload)?;

        // schema1 empty entries vanish; everything else maps 1:1
        let layers: Vec<(String, &BlobInfo)> = match self {
            Manifest::Schema1(_) => payload
                .layers
                .iter()
                .filter(|l| !l.empty_layer)
                .map(|l| {
                    updated_layer_media_type(&l.info.media_type, &l.info, flavor)
                        .map(|mt| (mt, &l.info))
                })
                .collect::<Result<_, _>>()?,
            _ => {
                let current = self.layer_infos()?;
                if payload.layers.len() != current.len() {
                    return Err(Error::Internal(
                        "layer count changed during conversion".to_string(),
                    ));
                }
                payload
                    .layers
                    .iter()
                    .map(|l| {
                        updated_layer_media_type(&l.info.media_type, &l.info, flavor)
                            .map(|mt| (mt, &l.info))
                    })
                    .collect::<Result<_, _>>()?
            }
        };

        match flavor {
            ManifestFlavor::Docker => {
                let layers = layers
                    .into_iter()
                    .map(|(mt, info)| Schema2Descriptor::from_blob_info(info, mt))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Manifest::DockerV2S2(Schema2Manifest {
                    schema_version: 2,
                    media_type: DOCKER_V2S2.to_string(),
                    config: Schema2Descriptor {
                        media_type: config_media_type.to_string(),
                        size: config_size,
                        digest: config_digest,
                        urls: None,
                    },
                    layers,
                }))
            }
            ManifestFlavor::Oci => {
                let digest: Digest = config_digest
                    .parse()
                    .map_err(|_| Error::BadDigest(config_digest.clone()))?;
                let config = DescriptorBuilder::default()
                    .media_type(MediaType::ImageConfig)
                    .size(u64::try_from(config_size).unwrap_or(0))
                    .digest(digest)
                    .build()?;
                let layers = layers
                    .into_iter()
                    .map(|(mt, info)| blob_info_to_descriptor(info, mt))
                    .collect::<Result<Vec<_>, Error>>()?;
                let manifest = ImageManifestBuilder::default()
                    .schema_version(2u32)
                    .media_type(MediaType::ImageManifest)
                    .config(config)
                    .layers(layers)
                    .build()?;
                Ok(Manifest::Oci(Box::new(manifest)))
            }
        }
    }

    fn convert_to_schema1(&self, payload: &ConversionPayload<'_>) -> Result<Manifest, Error> {
        let (architecture, history) = match payload.config_data {
            Some(data) => {
                let config: ImageConfiguration =
                    serde_json::from_slice(data).map_err(Error::ParsingManifest)?;
                let history = config
                    .history()
                    .iter()
                    .flatten()
                    .map(|h| {
                        (
                            h.created().clone().unwrap_or_default(),
                            h.created_by().clone().unwrap_or_default(),
                            h.author().clone(),
                            h.comment().clone(),
                            h.empty_layer().unwrap_or(false),
                        )
                    })
                    .collect();
                (config.architecture().to_string(), history)
            }
            None => ("amd64".to_string(), Vec::new()),
        };
        let layer_digests = payload
            .layers
            .iter()
            .filter(|l| !l.empty_layer)
            .map(|l| {
                l.info
                    .digest
                    .as_ref()
                    .map(|d| d.to_string())
                    .ok_or_else(|| Error::Internal("layer digest unknown".to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let manifest = synthesize_schema1(&Schema1Synthesis {
            name: payload.reference_name,
            tag: payload.reference_tag,
            architecture: &architecture,
            history,
            layer_digests,
        })?;
        Ok(Manifest::Schema1(manifest))
    }
}

fn descriptor_to_blob_info(d: &Descriptor) -> BlobInfo {
    let mut info = BlobInfo::new(
        d.digest().clone(),
        i64::try_from(d.size()).unwrap_or(-1),
        d.media_type().to_string(),
    );
    if let Some(annotations) = d.annotations() {
        info.annotations = annotations.clone();
    }
    if let Some(urls) = d.urls() {
        info.urls = urls.clone();
    }
    info
}

fn blob_info_to_descriptor(info: &BlobInfo, media_type: String) -> Result<Descriptor, Error> {
    let digest = info
        .digest
        .clone()
        .ok_or_else(|| Error::Internal("blob digest unknown after copy".to_string()))?;
    if info.size < 0 {
        return Err(Error::Internal("blob size unknown after copy".to_string()));
    }
    let mut builder = DescriptorBuilder::default()
        .media_type(MediaType::from(media_type.as_str()))
        .size(info.size as u64)
        .digest(digest);
    if !info.annotations.is_empty() {
        builder = builder.annotations(info.annotations.clone());
    }
    if !info.urls.is_empty() {
        builder = builder.urls(info.urls.clone());
    }
    Ok(builder.build()?)
}

/// Extract (os, architecture) from a config blob, for the runtime-OS
/// check.
pub fn config_os_arch(config_data: &[u8]) -> Result<(String, String), Error> {
    let config: ImageConfiguration =
        serde_json::from_slice(config_data).map_err(Error::ParsingManifest)?;
    Ok((config.os().to_string(), config.architecture().to_string()))
}

/// Build an image config for a schema1 source, given the DiffIDs computed
/// while copying its layers (bottom-first, non-empty layers only).
pub fn schema1_to_config_bytes(
    manifest: &Schema1Manifest,
    diff_ids: &[Digest],
) -> Result<Vec<u8>, Error> {
    use serde_json::{Map, Value, json};
    let top = manifest.top_compat()?;
    let history = manifest.history_bottom_first()?;

    let mut root = Map::new();
    root.insert(
        "architecture".to_string(),
        json!(if manifest.architecture.is_empty() {
            "amd64"
        } else {
            &manifest.architecture
        }),
    );
    root.insert("os".to_string(), json!("linux"));
    if !top.created.is_empty() {
        root.insert("created".to_string(), json!(top.created));
    }
    if let Some(cc) = &top.container_config {
        root.insert("config".to_string(), json!({ "Cmd": cc.cmd }));
    }
    root.insert(
        "rootfs".to_string(),
        json!({
            "type": "layers",
            "diff_ids": diff_ids.iter().map(|d| d.to_string()).collect::<Vec<_>>(),
        }),
    );
    let history_json: Vec<Value> = history
        .iter()
        .map(|h| {
            let mut e = Map::new();
            if !h.created.is_empty() {
                e.insert("created".to_string(), json!(h.created));
            }
            if let Some(cc) = &h.container_config {
                if let Some(cmd) = &cc.cmd {
                    if !cmd.is_empty() {
                        e.insert("created_by".to_string(), json!(cmd.join(" ")));
                    }
                }
            }
            if let Some(author) = &h.author {
                e.insert("author".to_string(), json!(author));
            }
            if let Some(comment) = &h.comment {
                e.insert("comment".to_string(), json!(comment));
            }
            if h.throwaway {
                e.insert("empty_layer".to_string(), json!(true));
            }
            Value::Object(e)
        })
        .collect();
    root.insert("history".to_string(), Value::Array(history_json));
    serde_json::to_vec(&Value::Object(root)).map_err(Error::ParsingManifest)
}

/// Identify a manifest whose MIME type was lost or lied about.
pub fn guess_manifest_mime_type(data: &[u8]) -> Option<&'static str> {
    let v: serde_json::Value = serde_json::from_slice(data).ok()?;
    if let Some(mt) = v.get("mediaType").and_then(|m| m.as_str()) {
        for known in [
            OCI_MANIFEST_V1,
            DOCKER_V2S2,
            crate::conversion::OCI_IMAGE_INDEX_V1,
            crate::conversion::DOCKER_V2_LIST,
        ] {
            if mt == known {
                return Some(known);
            }
        }
    }
    if v.get("fsLayers").is_some() {
        return Some(DOCKER_V2S1_SIGNED);
    }
    if v.get("manifests").is_some() {
        return Some(crate::conversion::OCI_IMAGE_INDEX_V1);
    }
    if v.get("config").is_some() && v.get("layers").is_some() {
        return Some(OCI_MANIFEST_V1);
    }
    None
}
