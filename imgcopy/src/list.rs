//! Manifest lists: the OCI image index and the Docker v2 manifest list.

use oci_spec::image::{
    Arch, Descriptor, DescriptorBuilder, Digest, ImageIndex, ImageIndexBuilder, MediaType, Os,
    Platform, PlatformBuilder,
};
use serde::{Deserialize, Serialize};

use crate::conversion::{DOCKER_V2_LIST, OCI_IMAGE_INDEX_V1, normalize_manifest_type};
use crate::errors::Error;

/// The platform an instance is selected for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformSelector {
    pub os: String,
    pub architecture: String,
    pub variant: Option<String>,
}

impl Default for PlatformSelector {
    fn default() -> Self {
        // matches what the rest of the stack assumes when nothing is
        // configured
        PlatformSelector {
            os: "linux".to_string(),
            architecture: "amd64".to_string(),
            variant: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerListPlatform {
    pub architecture: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerListEntry {
    pub media_type: String,
    pub size: i64,
    pub digest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<DockerListPlatform>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerManifestList {
    pub schema_version: u32,
    pub media_type: String,
    pub manifests: Vec<DockerListEntry>,
}

/// The updates recorded for one instance after it was copied.
#[derive(Debug, Clone)]
pub struct InstanceUpdate {
    pub digest: Digest,
    pub size: i64,
    pub media_type: String,
}

#[derive(Debug, Clone)]
pub enum ManifestList {
    Oci(Box<ImageIndex>),
    Docker(DockerManifestList),
}

impl ManifestList {
    pub fn parse(data: &[u8], mime_type: &str) -> Result<ManifestList, Error> {
        match normalize_manifest_type(mime_type) {
            OCI_IMAGE_INDEX_V1 => Ok(ManifestList::Oci(Box::new(
                serde_json::from_slice(data).map_err(Error::ParsingManifest)?,
            ))),
            DOCKER_V2_LIST => Ok(ManifestList::Docker(
                serde_json::from_slice(data).map_err(Error::ParsingManifest)?,
            )),
            other => Err(Error::Unsupported(format!(
                "unsupported manifest list type {other}"
            ))),
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            ManifestList::Oci(_) => OCI_IMAGE_INDEX_V1,
            ManifestList::Docker(_) => DOCKER_V2_LIST,
        }
    }

    pub fn instance_digests(&self) -> Result<Vec<Digest>, Error> {
        match self {
            ManifestList::Oci(index) => Ok(index
                .manifests()
                .iter()
                .map(|d| d.digest().clone())
                .collect()),
            ManifestList::Docker(list) => list
                .manifests
                .iter()
                .map(|e| {
                    e.digest
                        .parse()
                        .map_err(|_| Error::BadDigest(e.digest.clone()))
                })
                .collect(),
        }
    }

    /// The instance matching `platform`, like a runtime would pick it.
    pub fn choose_instance(&self, platform: &PlatformSelector) -> Result<Digest, Error> {
        let matches_variant = |want: &Option<String>, got: Option<String>| match want {
            None => true,
            Some(v) => got.as_deref() == Some(v.as_str()),
        };
        match self {
            ManifestList::Oci(index) => index
                .manifests()
                .iter()
                .find(|d| {
                    d.platform().as_ref().is_some_and(|p| {
                        p.os().to_string() == platform.os
                            && p.architecture().to_string() == platform.architecture
                            && matches_variant(&platform.variant, p.variant().clone())
                    })
                })
                .map(|d| d.digest().clone())
                .ok_or_else(|| no_matching_instance(platform)),
            ManifestList::Docker(list) => list
                .manifests
                .iter()
                .find(|e| {
                    e.platform.as_ref().is_some_and(|p| {
                        p.os == platform.os
                            && p.architecture == platform.architecture
                            && matches_variant(&platform.variant, p.variant.clone())
                    })
                })
                .and_then(|e| e.digest.parse().ok())
                .ok_or_else(|| no_matching_instance(platform)),
        }
    }

    /// Replace the entry for `old` with the copied instance's new
    /// identity. Every other field of the entry survives.
    pub fn update_instance(&mut self, old: &Digest, update: &InstanceUpdate) -> Result<(), Error> {
        match self {
            ManifestList::Oci(index) => {
                let mut manifests = index.manifests().clone();
                let entry = manifests
                    .iter_mut()
                    .find(|d| d.digest() == old)
                    .ok_or_else(|| instance_not_in_list(old))?;
                let mut builder = DescriptorBuilder::default()
                    .media_type(MediaType::from(update.media_type.as_str()))
                    .size(u64::try_from(update.size).unwrap_or(0))
                    .digest(update.digest.clone());
                if let Some(platform) = entry.platform() {
                    builder = builder.platform(platform.clone());
                }
                if let Some(annotations) = entry.annotations() {
                    builder = builder.annotations(annotations.clone());
                }
                *entry = builder.build()?;
                index.set_manifests(manifests);
                Ok(())
            }
            ManifestList::Docker(list) => {
                let old = old.to_string();
                let entry = list
                    .manifests
                    .iter_mut()
                    .find(|e| e.digest == old)
                    .ok_or_else(|| {
                        Error::Other(format!("instance {old} is not present in the list"))
                    })?;
                entry.digest = update.digest.to_string();
                entry.size = update.size;
                entry.media_type = update.media_type.clone();
                Ok(())
            }
        }
    }

    pub fn convert_to(&self, target: &str) -> Result<ManifestList, Error> {
        let target = normalize_manifest_type(target);
        if target == self.mime_type() {
            return Ok(self.clone());
        }
        match (self, target) {
            (ManifestList::Oci(index), DOCKER_V2_LIST) => {
                let manifests = index
                    .manifests()
                    .iter()
                    .map(|d| {
                        let media_type = match d.media_type() {
                            MediaType::ImageManifest => {
                                crate::conversion::DOCKER_V2S2.to_string()
                            }
                            other => other.to_string(),
                        };
                        DockerListEntry {
                            media_type,
                            size: i64::try_from(d.size()).unwrap_or(-1),
                            digest: d.digest().to_string(),
                            platform: d.platform().as_ref().map(|p| DockerListPlatform {
                                architecture: p.architecture().to_string(),
                                os: p.os().to_string(),
                                variant: p.variant().clone(),
                                os_version: p.os_version().clone(),
                                features: None,
                            }),
                        }
                    })
                    .collect();
                Ok(ManifestList::Docker(DockerManifestList {
                    schema_version: 2,
                    media_type: DOCKER_V2_LIST.to_string(),
                    manifests,
                }))
            }
            (ManifestList::Docker(list), OCI_IMAGE_INDEX_V1) => {
                let manifests = list
                    .manifests
                    .iter()
                    .map(|e| {
                        let digest: Digest = e
                            .digest
                            .parse()
                            .map_err(|_| Error::BadDigest(e.digest.clone()))?;
                        let media_type = if e.media_type == crate::conversion::DOCKER_V2S2 {
                            MediaType::ImageManifest
                        } else {
                            MediaType::from(e.media_type.as_str())
                        };
                        let mut builder = DescriptorBuilder::default()
                            .media_type(media_type)
                            .size(u64::try_from(e.size).unwrap_or(0))
                            .digest(digest);
                        if let Some(p) = &e.platform {
                            builder = builder.platform(docker_platform_to_oci(p)?);
                        }
                        builder.build().map_err(Error::from)
                    })
                    .collect::<Result<Vec<Descriptor>, Error>>()?;
                let index = ImageIndexBuilder::default()
                    .schema_version(2u32)
                    .media_type(MediaType::ImageIndex)
                    .manifests(manifests)
                    .build()?;
                Ok(ManifestList::Oci(Box::new(index)))
            }
            (_, other) => Err(Error::ManifestNotConvertible(other.to_string())),
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, Error> {
        match self {
            ManifestList::Oci(index) => serde_json::to_vec(index).map_err(Error::ParsingManifest),
            ManifestList::Docker(list) => serde_json::to_vec(list).map_err(Error::ParsingManifest),
        }
    }
}

fn no_matching_instance(platform: &PlatformSelector) -> Error {
    Error::Other(format!(
        "no image found in manifest list for {}/{}{}",
        platform.os,
        platform.architecture,
        platform
            .variant
            .as_deref()
            .map(|v| format!("/{v}"))
            .unwrap_or_default()
    ))
}

fn instance_not_in_list(digest: &Digest) -> Error {
    Error::Other(format!("instance {digest} is not present in the list"))
}

fn docker_platform_to_oci(p: &DockerListPlatform) -> Result<Platform, Error> {
    // Arch and Os cover arbitrary strings through their serde forms
    let architecture: Arch = serde_json::from_value(serde_json::Value::String(
        p.architecture.clone(),
    ))
    .map_err(Error::ParsingManifest)?;
    let os: Os = serde_json::from_value(serde_json::Value::String(p.os.clone()))
        .map_err(Error::ParsingManifest)?;
    let mut builder = PlatformBuilder::default().architecture(architecture).os(os);
    if let Some(variant) = &p.variant {
        builder = builder.variant(variant.clone());
    }
    if let Some(os_version) = &p.os_version {
        builder = builder.os_version(os_version.clone());
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digesting::digest_of;

    fn oci_index_json(digests: &[Digest]) -> Vec<u8> {
        let manifests: Vec<serde_json::Value> = digests
            .iter()
            .enumerate()
            .map(|(i, d)| {
                serde_json::json!({
                    "mediaType": "application/vnd.oci.image.manifest.v1+json",
                    "size": 500 + i,
                    "digest": d.to_string(),
                    "platform": {
                        "architecture": if i == 0 { "amd64" } else { "arm64" },
                        "os": "linux"
                    }
                })
            })
            .collect();
        serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": OCI_IMAGE_INDEX_V1,
            "manifests": manifests,
        }))
        .unwrap()
    }

    #[test]
    fn test_parse_and_choose() {
        let d0 = digest_of(b"m0");
        let d1 = digest_of(b"m1");
        let list =
            ManifestList::parse(&oci_index_json(&[d0.clone(), d1.clone()]), OCI_IMAGE_INDEX_V1)
                .unwrap();
        assert_eq!(list.instance_digests().unwrap(), vec![d0.clone(), d1.clone()]);
        let chosen = list.choose_instance(&PlatformSelector::default()).unwrap();
        assert_eq!(chosen, d0);
        let arm = list
            .choose_instance(&PlatformSelector {
                os: "linux".to_string(),
                architecture: "arm64".to_string(),
                variant: None,
            })
            .unwrap();
        assert_eq!(arm, d1);
    }

    #[test]
    fn test_update_instance_keeps_other_entries() {
        let d0 = digest_of(b"m0");
        let d1 = digest_of(b"m1");
        let mut list =
            ManifestList::parse(&oci_index_json(&[d0.clone(), d1.clone()]), OCI_IMAGE_INDEX_V1)
                .unwrap();
        let new = digest_of(b"m1-rewritten");
        list.update_instance(
            &d1,
            &InstanceUpdate {
                digest: new.clone(),
                size: 777,
                media_type: crate::conversion::DOCKER_V2S2.to_string(),
            },
        )
        .unwrap();
        let digests = list.instance_digests().unwrap();
        assert_eq!(digests, vec![d0, new]);
        // the platform of the updated entry survives
        let ManifestList::Oci(index) = &list else {
            panic!()
        };
        assert!(index.manifests()[1].platform().is_some());
    }

    #[test]
    fn test_convert_round_trip() {
        let d0 = digest_of(b"m0");
        let list = ManifestList::parse(&oci_index_json(&[d0.clone()]), OCI_IMAGE_INDEX_V1).unwrap();
        let docker = list.convert_to(DOCKER_V2_LIST).unwrap();
        assert_eq!(docker.mime_type(), DOCKER_V2_LIST);
        let ManifestList::Docker(inner) = &docker else {
            panic!()
        };
        assert_eq!(inner.manifests[0].media_type, crate::conversion::DOCKER_V2S2);
        let back = docker.convert_to(OCI_IMAGE_INDEX_V1).unwrap();
        assert_eq!(back.instance_digests().unwrap(), vec![d0]);
    }
}
