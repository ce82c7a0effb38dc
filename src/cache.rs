//! Package install cache.
//!
//! Installing the same package set for a language twice should not pay the
//! download twice: after a successful install the container is committed
//! to an image keyed by the content hash of (language, sorted package
//! list). A later install of the same set finds the tag and returns
//! immediately.
//!
//! The hit path reports `cached: true` without touching the supplied
//! container; callers that need the packages materialized in *that*
//! container must go through the image system instead. See
//! [`PackageCache::ensure_installed`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, AuditLog, EventType};
use crate::engine::Engine;
use crate::error::Result;
use crate::runtime::{InstallResult, Language, RuntimeAdapter};

/// Tag prefix shared by every cache image.
pub const CACHE_TAG_PREFIX: &str = "sandbox-";

/// Cache statistics.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub total_layers: usize,
    pub hits: u64,
    pub misses: u64,
    /// hits / (hits + misses); 0 when the cache is cold
    pub hit_rate: f64,
    pub total_bytes: u64,
}

/// Image cache for package installs.
pub struct PackageCache {
    engine: Engine,
    audit: Arc<AuditLog>,
    hits: AtomicU64,
    misses: AtomicU64,
    keep_per_language: usize,
    max_bytes: u64,
}

impl PackageCache {
    pub fn new(
        engine: Engine,
        audit: Arc<AuditLog>,
        keep_per_language: usize,
        max_bytes: u64,
    ) -> Self {
        Self {
            engine,
            audit,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            keep_per_language: keep_per_language.max(1),
            max_bytes,
        }
    }

    /// Install packages, consulting the cache first.
    ///
    /// On a hit the packages are known to the cache and the result says so;
    /// the supplied container is not modified. On a miss the install runs
    /// in the container and, when successful, the container is committed
    /// under the derived tag.
    ///
    /// # Errors
    ///
    /// Package validation errors and engine failures propagate; a failed
    /// package-manager run is reported inside the returned result.
    pub async fn ensure_installed(
        &self,
        adapter: &RuntimeAdapter,
        container_id: &str,
        packages: &[String],
    ) -> Result<InstallResult> {
        let language = adapter.language();
        let key = cache_key(language, packages);
        let tag = image_tag(language, &key);

        if self.engine.image_exists(&tag).await? {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!("Cache hit for {} ({})", tag, language);
            self.audit.record(
                AuditEvent::new(EventType::CacheHit)
                    .language(language.as_str())
                    .detail("image_tag", tag.clone()),
            );

            let mut installed: Vec<String> = packages.to_vec();
            installed.sort_unstable();
            return Ok(InstallResult {
                success: true,
                cached: true,
                duration_ms: 0,
                installed,
                errors: Vec::new(),
            });
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        self.audit.record(
            AuditEvent::new(EventType::CacheMiss)
                .language(language.as_str())
                .detail("image_tag", tag.clone()),
        );

        let result = adapter
            .install_packages(&self.engine, container_id, packages)
            .await?;

        if result.success {
            match self.engine.commit_image(container_id, &tag).await {
                Ok(image_id) => {
                    info!("Committed cache image {} ({})", tag, image_id);
                }
                Err(e) => {
                    // The install itself succeeded; losing the cache layer
                    // only costs the next caller a re-install.
                    warn!("Cache commit for {} failed: {}", tag, e);
                }
            }
        }

        Ok(result)
    }

    /// Keep the N most recently created cache images per language, destroy
    /// the rest, then enforce the advisory byte ceiling oldest-first.
    ///
    /// # Errors
    ///
    /// Returns error if the image list cannot be read; individual removal
    /// failures are absorbed into the audit log.
    pub async fn prune(&self) -> Result<usize> {
        let images = self.engine.list_images().await?;

        let mut per_language: HashMap<String, Vec<(String, i64, i64)>> = HashMap::new();
        for image in &images {
            for tag in &image.repo_tags {
                if let Some(language) = cache_tag_language(tag) {
                    per_language.entry(language).or_default().push((
                        tag.clone(),
                        image.created,
                        image.size,
                    ));
                }
            }
        }

        let mut to_remove: Vec<String> = Vec::new();
        let mut kept: Vec<(String, i64, i64)> = Vec::new();

        for (_language, mut tagged) in per_language {
            tagged.sort_by_key(|(_, created, _)| std::cmp::Reverse(*created));
            for (index, entry) in tagged.into_iter().enumerate() {
                if index < self.keep_per_language {
                    kept.push(entry);
                } else {
                    to_remove.push(entry.0);
                }
            }
        }

        // Advisory ceiling: drop oldest survivors until under budget
        let mut total: u64 = kept.iter().map(|(_, _, size)| *size as u64).sum();
        kept.sort_by_key(|(_, created, _)| *created);
        let mut kept_iter = kept.into_iter();
        while total > self.max_bytes {
            let Some((tag, _, size)) = kept_iter.next() else {
                break;
            };
            total = total.saturating_sub(size as u64);
            to_remove.push(tag);
        }

        let removed = to_remove.len();
        for tag in to_remove {
            if let Err(e) = self.engine.remove_image(&tag, true).await {
                warn!("Prune: failed to remove {}: {}", tag, e);
                self.audit.record(
                    AuditEvent::new(EventType::CachePrune)
                        .detail("image_tag", tag)
                        .failed(e.to_string()),
                );
            } else {
                self.audit
                    .record(AuditEvent::new(EventType::CachePrune).detail("image_tag", tag));
            }
        }

        Ok(removed)
    }

    /// Remove every cache-tagged image. Atomic per image, not across them.
    ///
    /// # Errors
    ///
    /// Returns error if the image list cannot be read.
    pub async fn clear(&self) -> Result<usize> {
        let images = self.engine.list_images().await?;
        let mut removed = 0;

        for image in images {
            for tag in image.repo_tags {
                if cache_tag_language(&tag).is_some() {
                    match self.engine.remove_image(&tag, true).await {
                        Ok(()) => removed += 1,
                        Err(e) => {
                            warn!("Clear: failed to remove {}: {}", tag, e);
                            self.audit.record(
                                AuditEvent::new(EventType::CachePrune)
                                    .detail("image_tag", tag)
                                    .failed(e.to_string()),
                            );
                        }
                    }
                }
            }
        }

        Ok(removed)
    }

    /// Cache statistics, counting tagged images from the engine.
    ///
    /// # Errors
    ///
    /// Returns error if the image list cannot be read.
    pub async fn stats(&self) -> Result<CacheStats> {
        let images = self.engine.list_images().await?;

        let mut total_layers = 0;
        let mut total_bytes: u64 = 0;
        for image in &images {
            if image
                .repo_tags
                .iter()
                .any(|tag| cache_tag_language(tag).is_some())
            {
                total_layers += 1;
                total_bytes += image.size as u64;
            }
        }

        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        let hit_rate = if lookups == 0 {
            0.0
        } else {
            hits as f64 / lookups as f64
        };

        Ok(CacheStats {
            total_layers,
            hits,
            misses,
            hit_rate,
            total_bytes,
        })
    }
}

/// Content hash over the language and the canonical (sorted) package list.
pub fn cache_key(language: Language, packages: &[String]) -> String {
    let mut sorted: Vec<&str> = packages.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    // A list of plain strings always serializes
    let canonical = serde_json::to_string(&sorted).unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(language.as_str().as_bytes());
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// Image tag for a cache key: `sandbox-<language>:<first 12 hex>`.
pub fn image_tag(language: Language, key: &str) -> String {
    format!(
        "{CACHE_TAG_PREFIX}{}:{}",
        language.as_str(),
        key.get(..12).unwrap_or(key)
    )
}

/// The language a cache tag belongs to, or `None` for foreign tags.
fn cache_tag_language(tag: &str) -> Option<String> {
    let rest = tag.strip_prefix(CACHE_TAG_PREFIX)?;
    let (language, _version) = rest.split_once(':')?;
    language.parse::<Language>().ok()?;
    Some(language.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_is_order_insensitive() {
        let a = cache_key(
            Language::Python,
            &["requests".to_string(), "numpy".to_string()],
        );
        let b = cache_key(
            Language::Python,
            &["numpy".to_string(), "requests".to_string()],
        );
        assert_eq!(a, b);
    }

    #[test]
    fn test_key_differs_by_language_and_contents() {
        let py = cache_key(Language::Python, &["requests".to_string()]);
        let js = cache_key(Language::JavaScript, &["requests".to_string()]);
        assert_ne!(py, js);

        let more = cache_key(
            Language::Python,
            &["requests".to_string(), "numpy".to_string()],
        );
        assert_ne!(py, more);
    }

    #[test]
    fn test_image_tag_shape() {
        let key = cache_key(Language::Python, &["requests".to_string()]);
        let tag = image_tag(Language::Python, &key);
        assert!(tag.starts_with("sandbox-python:"));
        let version = tag.split(':').nth(1).unwrap();
        assert_eq!(version.len(), 12);
        assert!(version.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_cache_tag_language_parsing() {
        assert_eq!(
            cache_tag_language("sandbox-python:abc123def456"),
            Some("python".to_string())
        );
        assert_eq!(cache_tag_language("sandbox-go:0011aabbccdd"), Some("go".to_string()));
        assert_eq!(cache_tag_language("python:3.12-slim"), None);
        assert_eq!(cache_tag_language("sandbox-cobol:abc"), None);
        assert_eq!(cache_tag_language("sandbox-python"), None);
    }

    #[tokio::test]
    #[ignore] // Requires Docker/Podman and network
    async fn test_miss_then_hit() {
        use crate::runtime::RuntimeAdapter;
        use crate::security::{HardeningProfile, SecurityLevel};

        let engine = Engine::connect().await.unwrap();
        let audit = Arc::new(AuditLog::new(std::env::temp_dir().join("execbox-test"), 100));
        let cache = PackageCache::new(engine.clone(), audit, 5, u64::MAX);

        let spec = crate::engine::ContainerSpec::new(
            Language::Python.default_image(),
            HardeningProfile::for_level(SecurityLevel::Permissive),
        )
        .network_mode("bridge");
        let id = engine.create_container(&spec, None).await.unwrap();
        engine.start_container(&id).await.unwrap();

        let adapter = RuntimeAdapter::for_language(Language::Python);
        let packages = vec!["six".to_string()];

        let first = cache.ensure_installed(&adapter, &id, &packages).await.unwrap();
        assert!(first.success);
        assert!(!first.cached);

        // Fresh container, same package set: must hit without installing
        let id2 = engine.create_container(&spec, None).await.unwrap();
        engine.start_container(&id2).await.unwrap();
        let second = cache.ensure_installed(&adapter, &id2, &packages).await.unwrap();
        assert!(second.success);
        assert!(second.cached);
        assert!(second.duration_ms < first.duration_ms);

        let stats = cache.stats().await.unwrap();
        assert!(stats.total_layers >= 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate, 0.5);

        engine.destroy_container(&id).await.unwrap();
        engine.destroy_container(&id2).await.unwrap();
        cache.clear().await.unwrap();
    }
}
