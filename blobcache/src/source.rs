//! The read side of the cache: blobs and manifests already on disk are
//! served locally, everything else falls through to the wrapped source.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use log::info;
use oci_spec::image::Digest;

use imgcopy::stream::BoxedReader;
use imgcopy::transport::{BlobChunkAccessor, ImageSource};
use imgcopy::{BlobInfo, BlobInfoCache, Error};

use crate::BlobCacheDir;

pub struct CachingSource {
    cache: BlobCacheDir,
    inner: Arc<dyn ImageSource>,
}

impl CachingSource {
    pub(crate) fn new(cache: BlobCacheDir, inner: Arc<dyn ImageSource>) -> Self {
        CachingSource { cache, inner }
    }
}

#[async_trait]
impl ImageSource for CachingSource {
    fn reference(&self) -> String {
        self.inner.reference()
    }

    async fn get_manifest(&self, instance: Option<&Digest>) -> Result<(Bytes, String), Error> {
        if let Some(digest) = instance {
            let path = self.cache.manifest_path(digest);
            if let Ok(data) = tokio::fs::read(&path).await {
                let mime = imgcopy::manifest::guess_manifest_mime_type(&data)
                    .unwrap_or("")
                    .to_string();
                info!("served manifest {digest} from the cache");
                return Ok((Bytes::from(data), mime));
            }
        }
        self.inner.get_manifest(instance).await
    }

    async fn get_blob(
        &self,
        info: &BlobInfo,
        cache: &dyn BlobInfoCache,
    ) -> Result<(BoxedReader, i64), Error> {
        if let Some(digest) = &info.digest {
            if let Some((file, size)) = self.cache.open_blob(digest).await? {
                info!("served blob {digest} from the cache");
                return Ok((Box::new(file), size));
            }
        }
        self.inner.get_blob(info, cache).await
    }

    async fn get_signatures(&self, instance: Option<&Digest>) -> Result<Vec<Vec<u8>>, Error> {
        self.inner.get_signatures(instance).await
    }

    fn supports_get_blob_at(&self) -> bool {
        self.inner.supports_get_blob_at()
    }

    fn blob_chunk_accessor(&self) -> Option<&dyn BlobChunkAccessor> {
        self.inner.blob_chunk_accessor()
    }

    async fn layer_infos_for_copy(
        &self,
        instance: Option<&Digest>,
    ) -> Result<Option<Vec<BlobInfo>>, Error> {
        self.inner.layer_infos_for_copy(instance).await
    }

    fn has_thread_safe_get_blob(&self) -> bool {
        self.inner.has_thread_safe_get_blob()
    }

    async fn close(&self) -> Result<(), Error> {
        self.inner.close().await
    }
}
