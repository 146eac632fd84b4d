//! Durable, content-addressed memoization of inference results.
//!
//! Entries are JSON files keyed by the request fingerprint, so results
//! survive process restarts. Writes are best-effort: a failed persist is
//! logged and swallowed, and the freshly computed result is still returned.

use crate::core::errors::{CacheError, InferenceError};
use crate::core::fingerprint::{Fingerprint, fingerprint};
use crate::pipeline::engine::{GenerationRequest, GenerationResult};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// File-backed inference cache.
#[derive(Debug, Clone)]
pub struct InferenceCache {
    dir: PathBuf,
}

impl InferenceCache {
    /// Opens a cache over `dir`, creating the directory when possible. A
    /// directory that cannot be created only disables persistence — every
    /// lookup degrades to a miss.
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!(dir = %dir.display(), error = %e, "cannot create cache directory; caching disabled");
        }
        Self { dir }
    }

    fn entry_path(&self, fp: &Fingerprint) -> PathBuf {
        self.dir.join(format!("{}.json", fp.as_hex()))
    }

    fn lookup(&self, fp: &Fingerprint) -> Option<GenerationResult> {
        let path = self.entry_path(fp);
        let raw = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(result) => Some(result),
            Err(e) => {
                warn!(entry = %path.display(), error = %e, "ignoring corrupt cache entry");
                None
            }
        }
    }

    fn store(&self, fp: &Fingerprint, result: &GenerationResult) -> Result<(), CacheError> {
        let path = self.entry_path(fp);
        let raw = serde_json::to_string(result)
            .map_err(|e| CacheError::persist_failed(&path, std::io::Error::other(e)))?;
        std::fs::write(&path, raw).map_err(|e| CacheError::persist_failed(&path, e))
    }

    /// Returns the cached result for this image/request pair, or computes,
    /// persists, and returns a fresh one.
    ///
    /// Concurrent misses on the same fingerprint may both compute; the
    /// duplicate write is harmless since entries are deterministic per key.
    pub fn get_or_compute<F>(
        &self,
        image_bytes: &[u8],
        request: &GenerationRequest,
        compute: F,
    ) -> Result<GenerationResult, InferenceError>
    where
        F: FnOnce() -> Result<GenerationResult, InferenceError>,
    {
        let fp = fingerprint(image_bytes, request);

        if let Some(cached) = self.lookup(&fp) {
            debug!(fingerprint = %fp, "cache hit");
            return Ok(cached);
        }

        debug!(fingerprint = %fp, "cache miss");
        let result = compute()?;

        if let Err(e) = self.store(&fp, &result) {
            // Persistence is best-effort; the computed result still flows
            // back to the caller.
            warn!(error = %e, "cache write failed");
        }

        Ok(result)
    }

    /// Location of this cache on disk.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn request() -> GenerationRequest {
        GenerationRequest {
            max_new_tokens: 256,
            temperature: 0.7,
            min_p: 0.1,
        }
    }

    fn result(latex: &str) -> GenerationResult {
        GenerationResult {
            latex: latex.to_string(),
            tokens: 12,
            time_ms: 500,
        }
    }

    #[test]
    fn second_call_hits_without_computing() {
        let dir = tempfile::tempdir().unwrap();
        let cache = InferenceCache::open(dir.path());
        let calls = Cell::new(0);

        let first = cache
            .get_or_compute(b"euler", &request(), || {
                calls.set(calls.get() + 1);
                Ok(result("e^{i\\pi} + 1 = 0"))
            })
            .unwrap();
        let second = cache
            .get_or_compute(b"euler", &request(), || {
                calls.set(calls.get() + 1);
                Ok(result("should not run"))
            })
            .unwrap();

        assert_eq!(calls.get(), 1);
        assert_eq!(first, second);
        assert_eq!(second.latex, "e^{i\\pi} + 1 = 0");
    }

    #[test]
    fn differing_parameters_do_not_share_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = InferenceCache::open(dir.path());

        cache
            .get_or_compute(b"euler", &request(), || Ok(result("first")))
            .unwrap();
        let other_params = GenerationRequest {
            temperature: 1.5,
            ..request()
        };
        let fresh = cache
            .get_or_compute(b"euler", &other_params, || Ok(result("second")))
            .unwrap();
        assert_eq!(fresh.latex, "second");
    }

    #[test]
    fn entries_survive_reopening() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = InferenceCache::open(dir.path());
            cache
                .get_or_compute(b"euler", &request(), || Ok(result("persisted")))
                .unwrap();
        }
        let reopened = InferenceCache::open(dir.path());
        let cached = reopened
            .get_or_compute(b"euler", &request(), || {
                panic!("must be served from disk")
            })
            .unwrap();
        assert_eq!(cached.latex, "persisted");
    }

    #[test]
    fn corrupt_entries_recompute() {
        let dir = tempfile::tempdir().unwrap();
        let cache = InferenceCache::open(dir.path());
        let fp = crate::core::fingerprint::fingerprint(b"euler", &request());
        std::fs::write(dir.path().join(format!("{}.json", fp.as_hex())), "{broken").unwrap();

        let fresh = cache
            .get_or_compute(b"euler", &request(), || Ok(result("recomputed")))
            .unwrap();
        assert_eq!(fresh.latex, "recomputed");
    }

    #[test]
    fn failed_persistence_still_returns_result() {
        // A file where the directory should be makes every write fail.
        let dir = tempfile::tempdir().unwrap();
        let blocked = dir.path().join("occupied");
        std::fs::write(&blocked, b"").unwrap();
        let cache = InferenceCache::open(&blocked);

        let fresh = cache
            .get_or_compute(b"euler", &request(), || Ok(result("uncached")))
            .unwrap();
        assert_eq!(fresh.latex, "uncached");
    }

    #[test]
    fn compute_errors_propagate_and_nothing_is_cached() {
        let dir = tempfile::tempdir().unwrap();
        let cache = InferenceCache::open(dir.path());

        let err = cache
            .get_or_compute(b"euler", &request(), || {
                Err(InferenceError::generation("device lost"))
            })
            .unwrap_err();
        assert!(matches!(err, InferenceError::GenerationFailed { .. }));

        // The failure must not have produced an entry.
        let fresh = cache
            .get_or_compute(b"euler", &request(), || Ok(result("after failure")))
            .unwrap();
        assert_eq!(fresh.latex, "after failure");
    }
}
