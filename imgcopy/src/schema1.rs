//! Docker schema1 manifests. Legacy, but still what some registries speak;
//! parsed for layer extraction and synthesized when converting down.

use oci_spec::image::Digest;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::errors::Error;
use crate::types::{BlobInfo, LayerInfo};

/// The well-known digest of the gzipped empty tar, used for history
/// entries that produce no filesystem diff.
pub const GZIPPED_EMPTY_LAYER_DIGEST: &str =
    "sha256:a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4";

/// The gzipped empty tar itself; tiny enough to inline.
pub const GZIPPED_EMPTY_LAYER: [u8; 32] = [
    0x1f, 0x8b, 0x08, 0x00, 0x00, 0x09, 0x6e, 0x88, 0x00, 0xff, 0x62, 0x18, 0x05, 0xa3, 0x60,
    0x14, 0x8c, 0x58, 0x00, 0x08, 0x00, 0x00, 0xff, 0xff, 0x2e, 0xaf, 0xb5, 0xef, 0x00, 0x04,
    0x00, 0x00,
];

pub const DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsLayer {
    #[serde(rename = "blobSum")]
    pub blob_sum: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(rename = "v1Compatibility")]
    pub v1_compatibility: String,
}

/// The JSON embedded in each history entry. Only the fields we read or
/// must round-trip.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct V1Compatibility {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parent: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub created: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_config: Option<V1ContainerConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub throwaway: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct V1ContainerConfig {
    #[serde(rename = "Cmd", default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
}

/// `fsLayers[0]` is the topmost layer; everything else in this crate works
/// bottom-first, so accessors reverse.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema1Manifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tag: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub architecture: String,
    pub fs_layers: Vec<FsLayer>,
    pub history: Vec<HistoryEntry>,
}

impl Schema1Manifest {
    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        let m: Schema1Manifest = serde_json::from_slice(data).map_err(Error::ParsingManifest)?;
        if m.fs_layers.len() != m.history.len() {
            return Err(Error::Other(format!(
                "schema1 manifest has {} layers but {} history entries",
                m.fs_layers.len(),
                m.history.len()
            )));
        }
        Ok(m)
    }

    fn compat(&self, history_index: usize) -> Result<V1Compatibility, Error> {
        serde_json::from_str(&self.history[history_index].v1_compatibility)
            .map_err(Error::ParsingManifest)
    }

    /// Layers bottom-first, with sizes unknown; schema1 does not carry
    /// them.
    pub fn layer_infos(&self) -> Result<Vec<LayerInfo>, Error> {
        let n = self.fs_layers.len();
        let mut out = Vec::with_capacity(n);
        for i in (0..n).rev() {
            let digest: Digest = self.fs_layers[i]
                .blob_sum
                .parse()
                .map_err(|_| Error::BadDigest(self.fs_layers[i].blob_sum.clone()))?;
            let empty_layer = self.compat(i)?.throwaway;
            out.push(LayerInfo {
                info: BlobInfo::new(digest, -1, DOCKER_LAYER_GZIP),
                empty_layer,
            });
        }
        Ok(out)
    }

    /// `infos` is bottom-first and must cover every fsLayer, empty entries
    /// included.
    pub fn update_layer_infos(&mut self, infos: &[BlobInfo]) -> Result<(), Error> {
        if infos.len() != self.fs_layers.len() {
            return Err(Error::Other(format!(
                "updating schema1 manifest: got {} layers, expected {}",
                infos.len(),
                self.fs_layers.len()
            )));
        }
        let n = self.fs_layers.len();
        for (i, info) in infos.iter().enumerate() {
            let digest = info
                .digest
                .as_ref()
                .ok_or_else(|| Error::Internal("layer digest unknown after copy".to_string()))?;
            self.fs_layers[n - 1 - i].blob_sum = digest.to_string();
        }
        Ok(())
    }

    /// The topmost history entry, which carries the image-level config
    /// fields.
    pub fn top_compat(&self) -> Result<V1Compatibility, Error> {
        if self.history.is_empty() {
            return Ok(V1Compatibility::default());
        }
        self.compat(0)
    }

    /// History entries bottom-first, paired with whether they are
    /// throwaway.
    pub fn history_bottom_first(&self) -> Result<Vec<V1Compatibility>, Error> {
        (0..self.history.len()).rev().map(|i| self.compat(i)).collect()
    }

    pub fn serialize(&self) -> Result<Vec<u8>, Error> {
        serde_json::to_vec(self).map_err(Error::ParsingManifest)
    }
}

/// The fake v1 id chain: derived from the blob digest and the parent id,
/// stable across re-conversions of the same image.
pub fn v1_id(blob_digest: &str, parent_id: &str) -> String {
    let input = if parent_id.is_empty() {
        blob_digest.to_string()
    } else {
        format!("{blob_digest} {parent_id}")
    };
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Build a schema1 manifest from layers plus optional config history.
///
/// `layers` and `history` are bottom-first; for history entries marked
/// empty the well-known empty-gzip digest is emitted so the fsLayer and
/// history lists stay aligned.
pub struct Schema1Synthesis<'a> {
    pub name: &'a str,
    pub tag: &'a str,
    pub architecture: &'a str,
    /// (created, created_by, author, comment, empty_layer), bottom-first;
    /// empty when the source config had no history.
    pub history: Vec<(String, String, Option<String>, Option<String>, bool)>,
    /// Non-empty layer digests, bottom-first.
    pub layer_digests: Vec<String>,
}

pub fn synthesize_schema1(s: &Schema1Synthesis<'_>) -> Result<Schema1Manifest, Error> {
    let entries: Vec<(String, String, Option<String>, Option<String>, bool)> =
        if s.history.is_empty() {
            s.layer_digests
                .iter()
                .map(|_| (String::new(), String::new(), None, None, false))
                .collect()
        } else {
            s.history.clone()
        };

    let mut layers = s.layer_digests.iter();
    let mut fs_layers = Vec::with_capacity(entries.len());
    let mut history = Vec::with_capacity(entries.len());
    let mut parent_id = String::new();
    for (created, created_by, author, comment, empty) in &entries {
        let blob_sum = if *empty {
            GZIPPED_EMPTY_LAYER_DIGEST.to_string()
        } else {
            layers
                .next()
                .ok_or_else(|| {
                    Error::Other(
                        "config history names more non-empty layers than the manifest".to_string(),
                    )
                })?
                .clone()
        };
        let id = v1_id(&blob_sum, &parent_id);
        let compat = V1Compatibility {
            id: id.clone(),
            parent: std::mem::take(&mut parent_id),
            created: created.clone(),
            container_config: (!created_by.is_empty()).then(|| V1ContainerConfig {
                cmd: Some(vec![created_by.clone()]),
            }),
            author: author.clone(),
            comment: comment.clone(),
            throwaway: *empty,
        };
        parent_id = id;
        fs_layers.push(FsLayer { blob_sum });
        history.push(HistoryEntry {
            v1_compatibility: serde_json::to_string(&compat).map_err(Error::ParsingManifest)?,
        });
    }
    if layers.next().is_some() {
        return Err(Error::Other(
            "manifest names more non-empty layers than the config history".to_string(),
        ));
    }
    // schema1 lists the topmost layer first
    fs_layers.reverse();
    history.reverse();
    Ok(Schema1Manifest {
        schema_version: 1,
        name: s.name.to_string(),
        tag: s.tag.to_string(),
        architecture: if s.architecture.is_empty() {
            "amd64".to_string()
        } else {
            s.architecture.to_string()
        },
        fs_layers,
        history,
    })
}
