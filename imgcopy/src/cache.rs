//! The blob-info cache records equivalences learned during copies so later
//! copies can skip expensive work.

use std::collections::HashMap;
use std::sync::Mutex;

use log::info;
use oci_spec::image::Digest;

use crate::compression::compressor_names;

/// A known location/identity of a blob equivalent to the one asked about.
#[derive(Debug, Clone)]
pub struct BlobCandidate {
    pub digest: Digest,
    pub compressor_name: String,
}

/// Implementations must be safe for concurrent use; the copier records from
/// several blob pipelines at once.
pub trait BlobInfoCache: Send + Sync {
    /// The uncompressed counterpart of `digest`, if one was ever recorded.
    /// A digest known to be uncompressed maps to itself.
    fn uncompressed_digest(&self, digest: &Digest) -> Option<Digest>;

    fn record_digest_uncompressed_pair(&self, compressed: &Digest, uncompressed: &Digest);

    /// `name` is one of the compressor names in
    /// [`compressor_names`](crate::compression::compressor_names).
    fn record_digest_compressor_name(&self, digest: &Digest, name: &str);

    /// Known equivalents of `digest`, best first. With `can_substitute`
    /// false only the exact digest may be returned.
    fn candidate_locations(&self, digest: &Digest, can_substitute: bool) -> Vec<BlobCandidate>;
}

#[derive(Default)]
struct MemoryCacheInner {
    // compressed digest -> uncompressed digest
    uncompressed: HashMap<String, String>,
    compressors: HashMap<String, String>,
}

/// Process-local cache. Keys are digest strings, like the persistent
/// backends store them.
#[derive(Default)]
pub struct MemoryCache {
    inner: Mutex<MemoryCacheInner>,
}

impl MemoryCache {
    pub fn new() -> Self {
        MemoryCache::default()
    }
}

impl BlobInfoCache for MemoryCache {
    fn uncompressed_digest(&self, digest: &Digest) -> Option<Digest> {
        let inner = self.inner.lock().unwrap();
        let key = digest.to_string();
        if let Some(u) = inner.uncompressed.get(&key) {
            return u.parse().ok();
        }
        if inner.compressors.get(&key).map(String::as_str)
            == Some(compressor_names::UNCOMPRESSED)
        {
            return Some(digest.clone());
        }
        None
    }

    fn record_digest_uncompressed_pair(&self, compressed: &Digest, uncompressed: &Digest) {
        info!("cache pair compressed={compressed} uncompressed={uncompressed}");
        let mut inner = self.inner.lock().unwrap();
        inner
            .uncompressed
            .insert(compressed.to_string(), uncompressed.to_string());
    }

    fn record_digest_compressor_name(&self, digest: &Digest, name: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .compressors
            .insert(digest.to_string(), name.to_string());
    }

    fn candidate_locations(&self, digest: &Digest, can_substitute: bool) -> Vec<BlobCandidate> {
        let inner = self.inner.lock().unwrap();
        let key = digest.to_string();
        let name_of = |d: &str| {
            inner
                .compressors
                .get(d)
                .cloned()
                .unwrap_or_else(|| compressor_names::UNKNOWN.to_string())
        };
        let mut out = vec![BlobCandidate {
            digest: digest.clone(),
            compressor_name: name_of(&key),
        }];
        if !can_substitute {
            return out;
        }
        // the uncompressed form of this digest, then every other compressed
        // variant sharing it
        let uncompressed = inner
            .uncompressed
            .get(&key)
            .cloned()
            .or_else(|| (name_of(&key) == compressor_names::UNCOMPRESSED).then(|| key.clone()));
        if let Some(u) = uncompressed {
            if u != key {
                if let Ok(d) = u.parse() {
                    out.push(BlobCandidate {
                        digest: d,
                        compressor_name: compressor_names::UNCOMPRESSED.to_string(),
                    });
                }
            }
            for (c, cu) in inner.uncompressed.iter() {
                if *cu == u && *c != key {
                    if let Ok(d) = c.parse() {
                        out.push(BlobCandidate {
                            digest: d,
                            compressor_name: name_of(c),
                        });
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digesting::digest_of;

    #[test]
    fn test_pair_and_lookup() {
        let cache = MemoryCache::new();
        let c = digest_of(b"compressed");
        let u = digest_of(b"uncompressed");
        assert_eq!(cache.uncompressed_digest(&c), None);
        cache.record_digest_uncompressed_pair(&c, &u);
        assert_eq!(cache.uncompressed_digest(&c), Some(u.clone()));
    }

    #[test]
    fn test_uncompressed_maps_to_itself() {
        let cache = MemoryCache::new();
        let u = digest_of(b"plain");
        cache.record_digest_compressor_name(&u, compressor_names::UNCOMPRESSED);
        assert_eq!(cache.uncompressed_digest(&u), Some(u.clone()));
    }

    #[test]
    fn test_candidates() {
        let cache = MemoryCache::new();
        let u = digest_of(b"u");
        let gz = digest_of(b"gz");
        let zs = digest_of(b"zs");
        cache.record_digest_uncompressed_pair(&gz, &u);
        cache.record_digest_uncompressed_pair(&zs, &u);
        cache.record_digest_compressor_name(&gz, compressor_names::GZIP);
        cache.record_digest_compressor_name(&zs, compressor_names::ZSTD);

        let exact_only = cache.candidate_locations(&gz, false);
        assert_eq!(exact_only.len(), 1);
        assert_eq!(exact_only[0].digest, gz);

        let all = cache.candidate_locations(&gz, true);
        let digests: Vec<_> = all.iter().map(|c| c.digest.clone()).collect();
        assert_eq!(digests[0], gz);
        assert!(digests.contains(&u));
        assert!(digests.contains(&zs));
    }
}
