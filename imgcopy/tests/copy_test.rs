//! End-to-end copies between in-memory transports.

use std::collections::{HashMap, HashSet};
use std::io::Write as _;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use oci_spec::image::Digest;
use tokio::io::AsyncReadExt;

use imgcopy::{
    AllowAll, BlobInfo, BlobInfoCache, CompressionFormat, CompressionOp, CopyOptions, Error,
    ImageDestination, ImageListSelection, ImageSource, MemoryCache, PutBlobOptions,
    TryReuseBlobOptions, UploadedBlob, copy_image, digest_of,
};

const V2S2: &str = "application/vnd.docker.distribution.manifest.v2+json";
const V2S1_SIGNED: &str = "application/vnd.docker.distribution.manifest.v1+prettyjws";
const V2S1: &str = "application/vnd.docker.distribution.manifest.v1+json";
const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
const DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
const DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
const OCI_LAYER_TAR: &str = "application/vnd.oci.image.layer.v1.tar";

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

#[derive(Default)]
struct MemSource {
    manifests: HashMap<String, (Vec<u8>, String)>,
    blobs: HashMap<String, Vec<u8>>,
    signatures: Vec<Vec<u8>>,
}

impl MemSource {
    fn add_blob(&mut self, data: Vec<u8>) -> Digest {
        let digest = digest_of(&data);
        self.blobs.insert(digest.to_string(), data);
        digest
    }

    /// Register a blob under a digest it does not hash to.
    fn add_corrupt_blob(&mut self, declared: &Digest, data: Vec<u8>) {
        self.blobs.insert(declared.to_string(), data);
    }
}

#[async_trait]
impl ImageSource for MemSource {
    fn reference(&self) -> String {
        "mem://src/app:latest".to_string()
    }

    async fn get_manifest(&self, instance: Option<&Digest>) -> Result<(Bytes, String), Error> {
        let key = instance.map(|d| d.to_string()).unwrap_or_default();
        let (data, mime) = self
            .manifests
            .get(&key)
            .ok_or_else(|| Error::Other(format!("no manifest for {key:?}")))?;
        Ok((Bytes::from(data.clone()), mime.clone()))
    }

    async fn get_blob(
        &self,
        info: &BlobInfo,
        _cache: &dyn BlobInfoCache,
    ) -> Result<(imgcopy::BoxedReader, i64), Error> {
        let key = info.digest_string();
        let data = self
            .blobs
            .get(&key)
            .ok_or_else(|| Error::Other(format!("no blob {key}")))?;
        Ok((
            Box::new(std::io::Cursor::new(data.clone())),
            data.len() as i64,
        ))
    }

    async fn get_signatures(&self, _instance: Option<&Digest>) -> Result<Vec<Vec<u8>>, Error> {
        Ok(self.signatures.clone())
    }

    fn has_thread_safe_get_blob(&self) -> bool {
        true
    }
}

#[derive(Default)]
struct MemDestination {
    supported: Vec<String>,
    desired: Option<CompressionOp>,
    format: Option<CompressionFormat>,
    supports_sigs: bool,
    reuse_own_blobs: bool,
    existing: Option<Vec<u8>>,
    reject_first_manifests: AtomicU64,
    put_delay_ms: u64,
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    manifests: Mutex<Vec<(Vec<u8>, Option<String>)>>,
    signatures: Mutex<Vec<Vec<u8>>>,
    in_flight: AtomicU64,
    high_water: AtomicU64,
}

impl MemDestination {
    fn blob(&self, digest: &Digest) -> Option<Vec<u8>> {
        self.blobs.lock().unwrap().get(&digest.to_string()).cloned()
    }

    fn last_toplevel_manifest(&self) -> Vec<u8> {
        self.manifests
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(_, instance)| instance.is_none())
            .map(|(data, _)| data.clone())
            .expect("no toplevel manifest written")
    }
}

#[async_trait]
impl ImageDestination for MemDestination {
    fn reference(&self) -> String {
        "mem://dest/app:latest".to_string()
    }

    fn supported_manifest_mime_types(&self) -> Vec<String> {
        self.supported.clone()
    }

    fn supports_signatures(&self) -> bool {
        self.supports_sigs
    }

    fn desired_layer_compression(&self) -> CompressionOp {
        self.desired.unwrap_or_default()
    }

    fn desired_compression_format(&self) -> Option<CompressionFormat> {
        self.format
    }

    fn has_thread_safe_put_blob(&self) -> bool {
        true
    }

    async fn put_blob(
        &self,
        stream: &mut (dyn tokio::io::AsyncRead + Send + Unpin),
        _info: &BlobInfo,
        _options: PutBlobOptions<'_>,
    ) -> Result<UploadedBlob, Error> {
        let n = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.high_water.fetch_max(n, Ordering::SeqCst);
        if self.put_delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.put_delay_ms)).await;
        }
        let result = async {
            let mut data = Vec::new();
            stream.read_to_end(&mut data).await?;
            let digest = digest_of(&data);
            let size = data.len() as i64;
            self.blobs.lock().unwrap().insert(digest.to_string(), data);
            Ok(UploadedBlob { digest, size })
        }
        .await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn try_reusing_blob(
        &self,
        info: &BlobInfo,
        _options: TryReuseBlobOptions<'_>,
    ) -> Result<Option<BlobInfo>, Error> {
        if !self.reuse_own_blobs {
            return Ok(None);
        }
        let Some(digest) = &info.digest else {
            return Ok(None);
        };
        let blobs = self.blobs.lock().unwrap();
        Ok(blobs.get(&digest.to_string()).map(|data| {
            let mut out = info.clone();
            out.size = data.len() as i64;
            out
        }))
    }

    async fn put_manifest(&self, manifest: &[u8], instance: Option<&Digest>) -> Result<(), Error> {
        loop {
            let remaining = self.reject_first_manifests.load(Ordering::SeqCst);
            if remaining == 0 {
                break;
            }
            if self
                .reject_first_manifests
                .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Err(Error::ManifestTypeRejected(
                    "manifest type refused by registry".to_string(),
                ));
            }
        }
        self.manifests
            .lock()
            .unwrap()
            .push((manifest.to_vec(), instance.map(|d| d.to_string())));
        Ok(())
    }

    async fn put_signatures(
        &self,
        signatures: &[Vec<u8>],
        _instance: Option<&Digest>,
    ) -> Result<(), Error> {
        if !signatures.is_empty() && !self.supports_sigs {
            return Err(Error::Unsupported("no signature support".to_string()));
        }
        self.signatures
            .lock()
            .unwrap()
            .extend(signatures.iter().cloned());
        Ok(())
    }

    async fn existing_manifest(&self) -> Result<Option<(Bytes, String)>, Error> {
        Ok(self
            .existing
            .clone()
            .map(|data| (Bytes::from(data), V2S2.to_string())))
    }
}

fn v2s2_manifest(config: (&Digest, usize), layers: &[(&Digest, usize, &str)]) -> Vec<u8> {
    let layers: Vec<serde_json::Value> = layers
        .iter()
        .map(|(digest, size, media_type)| {
            serde_json::json!({
                "mediaType": media_type,
                "size": size,
                "digest": digest.to_string(),
            })
        })
        .collect();
    serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": V2S2,
        "config": {
            "mediaType": DOCKER_CONFIG,
            "size": config.1,
            "digest": config.0.to_string(),
        },
        "layers": layers,
    }))
    .unwrap()
}

fn config_bytes() -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "architecture": "amd64",
        "os": "linux",
        "rootfs": {"type": "layers", "diff_ids": [digest_of(b"placeholder").to_string()]},
        "history": [{"created": "2023-05-09T00:00:00Z", "created_by": "ADD rootfs / in /"}],
    }))
    .unwrap()
}

struct Fixture {
    src: Arc<MemSource>,
    dest: Arc<MemDestination>,
    cache: Arc<MemoryCache>,
}

/// One config plus one layer, the layer already gzip-compressed.
fn single_layer_fixture(dest: MemDestination, layer_plain: &[u8], compressed: bool) -> Fixture {
    let mut src = MemSource::default();
    let config = config_bytes();
    let config_digest = src.add_blob(config.clone());
    let (layer_data, media_type) = if compressed {
        (gzip(layer_plain), DOCKER_LAYER_GZIP)
    } else {
        (layer_plain.to_vec(), OCI_LAYER_TAR)
    };
    let layer_digest = src.add_blob(layer_data.clone());
    let manifest = v2s2_manifest(
        (&config_digest, config.len()),
        &[(&layer_digest, layer_data.len(), media_type)],
    );
    src.manifests
        .insert(String::new(), (manifest, V2S2.to_string()));
    Fixture {
        src: Arc::new(src),
        dest: Arc::new(dest),
        cache: Arc::new(MemoryCache::new()),
    }
}

async fn run(fixture: &Fixture, options: CopyOptions) -> Result<imgcopy::CopyResult, Error> {
    let _ = env_logger::builder().is_test(true).try_init();
    copy_image(
        &AllowAll,
        fixture.src.clone(),
        fixture.dest.clone(),
        fixture.cache.clone(),
        options,
    )
    .await
}

#[tokio::test]
async fn test_identity_copy_of_single_layer_image() {
    let dest = MemDestination {
        supported: vec![V2S2.to_string()],
        ..Default::default()
    };
    let plain = b"layer contents".to_vec();
    let fixture = single_layer_fixture(dest, &plain, true);
    let (src_manifest, _) = fixture.src.manifests.get("").unwrap().clone();

    let result = run(&fixture, CopyOptions::default()).await.unwrap();

    // the destination received the exact manifest bytes
    assert_eq!(result.manifest, src_manifest);
    assert_eq!(result.manifest_mime_type, V2S2);
    assert_eq!(fixture.dest.last_toplevel_manifest(), src_manifest);
    // both blobs arrived unchanged
    let layer_digest = digest_of(&gzip(&plain));
    assert_eq!(fixture.dest.blob(&layer_digest).unwrap(), gzip(&plain));
    assert!(fixture.dest.blob(&digest_of(&config_bytes())).is_some());
    assert_eq!(result.stats.blobs_copied, 2);
    // preserved blobs leave no pairs behind
    assert!(fixture.cache.uncompressed_digest(&layer_digest).is_none());
}

#[tokio::test]
async fn test_compress_on_the_fly() {
    let dest = MemDestination {
        desired: Some(CompressionOp::Compress),
        format: Some(CompressionFormat::Gzip),
        ..Default::default()
    };
    let plain = vec![7u8; 10_000];
    let fixture = single_layer_fixture(dest, &plain, false);
    let src_digest = digest_of(&plain);

    let result = run(&fixture, CopyOptions::default()).await.unwrap();

    // the manifest now names a gzip layer with a fresh digest
    let manifest: serde_json::Value =
        serde_json::from_slice(&fixture.dest.last_toplevel_manifest()).unwrap();
    let layer = &manifest["layers"][0];
    let uploaded: Digest = layer["digest"].as_str().unwrap().parse().unwrap();
    assert_ne!(uploaded, src_digest);
    assert_eq!(layer["mediaType"], DOCKER_LAYER_GZIP);
    let stored = fixture.dest.blob(&uploaded).unwrap();
    assert_eq!(&stored[..2], &[0x1f, 0x8b]);
    // the cache learned the pair and the compressor
    assert_eq!(
        fixture.cache.uncompressed_digest(&uploaded),
        Some(src_digest.clone())
    );
    let candidates = fixture.cache.candidate_locations(&uploaded, true);
    assert!(candidates.iter().any(|c| c.compressor_name == "gzip"));
    assert_ne!(result.manifest_digest, digest_of(&fixture.src.manifests.get("").unwrap().0));
}

#[tokio::test]
async fn test_decompress() {
    let dest = MemDestination {
        desired: Some(CompressionOp::Decompress),
        ..Default::default()
    };
    let plain: Vec<u8> = (0..30_000u32).map(|x| (x % 11) as u8).collect();
    let fixture = single_layer_fixture(dest, &plain, true);
    let src_digest = digest_of(&gzip(&plain));

    run(&fixture, CopyOptions::default()).await.unwrap();

    // the uploaded blob is the DiffID form of the source layer
    let uploaded = digest_of(&plain);
    assert_eq!(fixture.dest.blob(&uploaded).unwrap(), plain);
    assert_eq!(
        fixture.cache.uncompressed_digest(&src_digest),
        Some(uploaded.clone())
    );
    let manifest: serde_json::Value =
        serde_json::from_slice(&fixture.dest.last_toplevel_manifest()).unwrap();
    assert_eq!(
        manifest["layers"][0]["mediaType"],
        "application/vnd.docker.image.rootfs.diff.tar"
    );
}

#[tokio::test]
async fn test_digest_mismatch_fails_the_copy() {
    let dest = MemDestination::default();
    let mut src = MemSource::default();
    let config = config_bytes();
    let config_digest = src.add_blob(config.clone());
    // one byte off from what the manifest declares
    let declared = gzip(b"real layer bytes");
    let declared_digest = digest_of(&declared);
    let mut altered = declared.clone();
    altered[10] ^= 0x01;
    src.add_corrupt_blob(&declared_digest, altered);
    let manifest = v2s2_manifest(
        (&config_digest, config.len()),
        &[(&declared_digest, declared.len(), DOCKER_LAYER_GZIP)],
    );
    src.manifests
        .insert(String::new(), (manifest, V2S2.to_string()));
    let fixture = Fixture {
        src: Arc::new(src),
        dest: Arc::new(dest),
        cache: Arc::new(MemoryCache::new()),
    };

    let err = run(&fixture, CopyOptions::default()).await.unwrap_err();
    assert!(
        matches!(err, Error::DigestMismatch { .. }),
        "expected DigestMismatch, got {err:?}"
    );
    assert!(fixture.cache.uncompressed_digest(&declared_digest).is_none());
}

#[tokio::test]
async fn test_manifest_conversion_fallback() {
    let dest = MemDestination {
        supported: vec![V2S1_SIGNED.to_string(), V2S1.to_string()],
        reject_first_manifests: AtomicU64::new(1),
        ..Default::default()
    };
    let plain = b"schema1 fallback layer".to_vec();
    let fixture = single_layer_fixture(dest, &plain, true);

    let result = run(&fixture, CopyOptions::default()).await.unwrap();

    // the first candidate (v2s1-signed) was rejected, the second accepted
    assert_eq!(result.manifest_mime_type, V2S1);
    let written: serde_json::Value =
        serde_json::from_slice(&fixture.dest.last_toplevel_manifest()).unwrap();
    assert_eq!(written["schemaVersion"], 1);
    assert_eq!(
        written["fsLayers"][0]["blobSum"],
        digest_of(&gzip(&plain)).to_string()
    );
}

#[tokio::test]
async fn test_manifest_conversion_exhausted_fails() {
    let dest = MemDestination {
        supported: vec![V2S1_SIGNED.to_string()],
        reject_first_manifests: AtomicU64::new(10),
        ..Default::default()
    };
    let fixture = single_layer_fixture(dest, b"some layer", true);
    let err = run(&fixture, CopyOptions::default()).await.unwrap_err();
    assert!(err.is_manifest_rejection(), "got {err:?}");
}

#[tokio::test]
async fn test_list_copy_specific_instance() {
    // three single-layer images, the second of which gets copied
    let mut src = MemSource::default();
    let mut instance_digests = Vec::new();
    let mut entries = Vec::new();
    for i in 0..3u8 {
        let config = config_bytes();
        let config_digest = digest_of(&config);
        let layer = gzip(&[i; 100]);
        let layer_digest = digest_of(&layer);
        if i == 1 {
            src.blobs.insert(config_digest.to_string(), config.clone());
            src.blobs.insert(layer_digest.to_string(), layer.clone());
        }
        let manifest = v2s2_manifest(
            (&config_digest, config.len()),
            &[(&layer_digest, layer.len(), DOCKER_LAYER_GZIP)],
        );
        let digest = digest_of(&manifest);
        src.manifests
            .insert(digest.to_string(), (manifest.clone(), V2S2.to_string()));
        entries.push(serde_json::json!({
            "mediaType": V2S2,
            "size": manifest.len(),
            "digest": digest.to_string(),
            "platform": {"architecture": "amd64", "os": "linux"},
        }));
        instance_digests.push(digest);
    }
    let list = serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": OCI_INDEX,
        "manifests": entries,
    }))
    .unwrap();
    src.manifests
        .insert(String::new(), (list.clone(), OCI_INDEX.to_string()));

    // decompression forces the copied instance's manifest to change
    let dest = MemDestination {
        desired: Some(CompressionOp::Decompress),
        ..Default::default()
    };
    let fixture = Fixture {
        src: Arc::new(src),
        dest: Arc::new(dest),
        cache: Arc::new(MemoryCache::new()),
    };
    let options = CopyOptions {
        image_list_selection: ImageListSelection::Specific(vec![instance_digests[1].clone()]),
        ..Default::default()
    };
    let result = run(&fixture, options).await.unwrap();
    assert_eq!(result.manifest_mime_type, OCI_INDEX);

    let written: serde_json::Value =
        serde_json::from_slice(&fixture.dest.last_toplevel_manifest()).unwrap();
    let written_entries = written["manifests"].as_array().unwrap();
    assert_eq!(written_entries.len(), 3);
    // untouched entries survive verbatim
    assert_eq!(
        written_entries[0]["digest"],
        instance_digests[0].to_string()
    );
    assert_eq!(
        written_entries[2]["digest"],
        instance_digests[2].to_string()
    );
    // the copied one was rewritten
    let updated = written_entries[1]["digest"].as_str().unwrap();
    assert_ne!(updated, instance_digests[1].to_string());
    // and its manifest was written under that digest
    let manifests = fixture.dest.manifests.lock().unwrap();
    assert!(
        manifests
            .iter()
            .any(|(_, instance)| instance.as_deref() == Some(updated))
    );
}

#[tokio::test]
async fn test_list_copy_specific_unknown_instance_is_rejected() {
    let mut src = MemSource::default();
    let list = serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": OCI_INDEX,
        "manifests": [],
    }))
    .unwrap();
    src.manifests
        .insert(String::new(), (list, OCI_INDEX.to_string()));
    let fixture = Fixture {
        src: Arc::new(src),
        dest: Arc::new(MemDestination::default()),
        cache: Arc::new(MemoryCache::new()),
    };
    let options = CopyOptions {
        image_list_selection: ImageListSelection::Specific(vec![digest_of(b"nope")]),
        ..Default::default()
    };
    let err = run(&fixture, options).await.unwrap_err();
    assert!(matches!(err, Error::InvalidOption(_)), "got {err:?}");
}

#[tokio::test]
async fn test_concurrency_stays_under_the_limit() {
    let mut src = MemSource::default();
    let config = config_bytes();
    let config_digest = src.add_blob(config.clone());
    let mut layers = Vec::new();
    for i in 0..8u8 {
        let data = gzip(&vec![i; 2000]);
        let digest = src.add_blob(data.clone());
        layers.push((digest, data.len()));
    }
    let layer_refs: Vec<(&Digest, usize, &str)> = layers
        .iter()
        .map(|(d, len)| (d, *len, DOCKER_LAYER_GZIP))
        .collect();
    let manifest = v2s2_manifest((&config_digest, config.len()), &layer_refs);
    src.manifests
        .insert(String::new(), (manifest, V2S2.to_string()));

    let dest = MemDestination {
        put_delay_ms: 20,
        ..Default::default()
    };
    let fixture = Fixture {
        src: Arc::new(src),
        dest: Arc::new(dest),
        cache: Arc::new(MemoryCache::new()),
    };
    let options = CopyOptions {
        max_parallel_downloads: 3,
        ..Default::default()
    };
    run(&fixture, options).await.unwrap();
    assert!(fixture.dest.high_water.load(Ordering::SeqCst) <= 3);
    assert_eq!(fixture.dest.blobs.lock().unwrap().len(), 9);
}

#[tokio::test]
async fn test_already_present_short_circuit() {
    let plain = b"already there".to_vec();
    let probe = single_layer_fixture(MemDestination::default(), &plain, true);
    let (manifest, _) = probe.src.manifests.get("").unwrap().clone();

    let dest = MemDestination {
        existing: Some(manifest.clone()),
        ..Default::default()
    };
    let fixture = single_layer_fixture(dest, &plain, true);
    let options = CopyOptions {
        optimize_destination_image_already_exists: true,
        ..Default::default()
    };
    let result = run(&fixture, options).await.unwrap();
    assert_eq!(result.stats.blobs_copied, 0);
    assert_eq!(result.manifest, manifest);
}

#[tokio::test]
async fn test_reuse_skips_upload() {
    let plain = b"reusable layer".to_vec();
    let layer = gzip(&plain);
    let dest = MemDestination {
        reuse_own_blobs: true,
        ..Default::default()
    };
    // pre-seed the destination with the layer blob
    dest.blobs
        .lock()
        .unwrap()
        .insert(digest_of(&layer).to_string(), layer.clone());
    let fixture = single_layer_fixture(dest, &plain, true);

    let result = run(&fixture, CopyOptions::default()).await.unwrap();
    assert_eq!(result.stats.blobs_reused, 1);
    // only the config was actually copied
    assert_eq!(result.stats.blobs_copied, 1);
}

#[tokio::test]
async fn test_remove_signatures() {
    let plain = b"signed image".to_vec();
    let mut fixture = single_layer_fixture(MemDestination::default(), &plain, true);
    {
        let src = Arc::get_mut(&mut fixture.src).unwrap();
        src.signatures.push(b"sig0".to_vec());
    }
    // with signatures present and no signature support, the copy fails
    let err = run(&fixture, CopyOptions::default()).await.unwrap_err();
    assert!(matches!(err, Error::Unsupported(_)), "got {err:?}");
    // removing them makes it pass
    let options = CopyOptions {
        remove_signatures: true,
        ..Default::default()
    };
    run(&fixture, options).await.unwrap();
    assert!(fixture.dest.signatures.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_progress_events_flow() {
    let (tx, mut rx) = tokio::sync::mpsc::channel(1024);
    let plain = vec![1u8; 50_000];
    let fixture = single_layer_fixture(MemDestination::default(), &plain, false);
    let options = CopyOptions {
        progress: Some(tx),
        progress_interval: std::time::Duration::from_millis(0),
        ..Default::default()
    };
    run(&fixture, options).await.unwrap();
    let mut kinds = HashSet::new();
    while let Ok(ev) = rx.try_recv() {
        kinds.insert(format!("{:?}", ev.kind));
    }
    assert!(kinds.contains("NewArtifact"));
    assert!(kinds.contains("Done"));
}
