//! EVAL script cache.
//!
//! Content-addressable storage for compiled ad-hoc scripts, keyed by the
//! SHA-1 hex digest of the body. EVAL-admitted entries are tracked in an
//! LRU residency list bounded to [`ScriptCache::max_tracked`] digests;
//! SCRIPT LOAD admits entries outside the list, and such entries are never
//! evicted. Deletion flows in one direction: detach the digest from the
//! residency list, then remove the entry from the map. Releasing the
//! compiled function always goes through the owning engine and is the
//! caller's duty.

use std::collections::{HashMap, VecDeque};

use ember_core::digest::DIGEST_HEX_LEN;
use tracing::debug;

use crate::engine::CompiledFunction;
use crate::flags::ScriptFlags;

/// One cached script.
pub struct CacheEntry {
    body: String,
    engine: String,
    function: CompiledFunction,
    flags: ScriptFlags,
    lru_tracked: bool,
}

impl CacheEntry {
    /// The original script body, shebang included.
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Name of the engine owning the compiled form.
    pub fn engine(&self) -> &str {
        &self.engine
    }

    /// The compiled function.
    pub fn function(&self) -> &CompiledFunction {
        &self.function
    }

    /// Consumes the entry, yielding the compiled function for release
    /// through the owning engine.
    pub fn into_function(self) -> CompiledFunction {
        self.function
    }

    /// Flags parsed from the shebang at admission.
    pub fn flags(&self) -> ScriptFlags {
        self.flags
    }

    /// Whether the entry currently lives in the LRU residency list.
    pub fn lru_tracked(&self) -> bool {
        self.lru_tracked
    }
}

/// The SHA-keyed store of previously compiled ad-hoc scripts.
pub struct ScriptCache {
    entries: HashMap<String, CacheEntry>,
    lru: VecDeque<String>,
    max_tracked: usize,
    memory_used: usize,
    evicted_scripts: u64,
}

impl ScriptCache {
    /// Creates a cache bounding the LRU residency list to `max_tracked`.
    pub fn new(max_tracked: usize) -> Self {
        Self {
            entries: HashMap::new(),
            lru: VecDeque::new(),
            max_tracked,
            memory_used: 0,
            evicted_scripts: 0,
        }
    }

    /// Number of cached scripts (tracked and untracked).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no scripts are cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Length of the LRU residency list.
    pub fn lru_len(&self) -> usize {
        self.lru.len()
    }

    /// Best-effort sum of digest and body allocations, for reporting.
    pub fn memory_used(&self) -> usize {
        self.memory_used
    }

    /// Number of evictions performed since creation.
    pub fn evicted_scripts(&self) -> u64 {
        self.evicted_scripts
    }

    /// Whether `digest` identifies a cached script.
    pub fn contains(&self, digest: &str) -> bool {
        self.entries.contains_key(digest)
    }

    /// Immutable entry lookup, without touching residency.
    pub fn get(&self, digest: &str) -> Option<&CacheEntry> {
        self.entries.get(digest)
    }

    /// Records a cache hit: a tracked entry moves to the most-recently-used
    /// end of the residency list. Returns whether the digest was present.
    pub fn touch(&mut self, digest: &str) -> bool {
        let Some(entry) = self.entries.get(digest) else {
            return false;
        };
        if entry.lru_tracked {
            if let Some(pos) = self.lru.iter().position(|d| d == digest) {
                let node = self.lru.remove(pos).unwrap_or_else(|| digest.to_string());
                self.lru.push_back(node);
            }
        }
        true
    }

    /// Inserts a freshly compiled script.
    ///
    /// When `track` is set the digest joins the residency list tail, after
    /// evicting from the head to stay under the bound. Evicted entries are
    /// returned so their compiled functions can be released through the
    /// owning engines.
    pub fn insert(
        &mut self,
        digest: String,
        body: String,
        engine: String,
        function: CompiledFunction,
        flags: ScriptFlags,
        track: bool,
    ) -> Vec<(String, CacheEntry)> {
        assert!(
            !self.entries.contains_key(&digest),
            "script cache: duplicate admission for digest {digest}"
        );

        let mut evicted = Vec::new();
        if track {
            while self.lru.len() >= self.max_tracked {
                let Some(victim) = self.lru.pop_front() else {
                    break;
                };
                let Some(entry) = self.entries.remove(&victim) else {
                    panic!("script cache: residency list references missing entry {victim}");
                };
                self.memory_used = self
                    .memory_used
                    .saturating_sub(DIGEST_HEX_LEN + entry.body.len());
                self.evicted_scripts += 1;
                debug!(digest = %victim, "evicted script from EVAL cache");
                evicted.push((victim, entry));
            }
            self.lru.push_back(digest.clone());
        }

        self.memory_used += DIGEST_HEX_LEN + body.len();
        self.entries.insert(
            digest,
            CacheEntry {
                body,
                engine,
                function,
                flags,
                lru_tracked: track,
            },
        );
        evicted
    }

    /// Detaches a tracked entry from the residency list so it can no
    /// longer be evicted. Used when SCRIPT LOAD re-admits a digest that
    /// first arrived through EVAL.
    pub fn promote(&mut self, digest: &str) {
        let Some(entry) = self.entries.get_mut(digest) else {
            return;
        };
        if entry.lru_tracked {
            entry.lru_tracked = false;
            if let Some(pos) = self.lru.iter().position(|d| d == digest) {
                self.lru.remove(pos);
            }
            debug!(%digest, "script promoted out of the LRU list");
        }
    }

    /// Removes one entry, returning it for function release.
    pub fn remove(&mut self, digest: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(digest)?;
        if entry.lru_tracked {
            if let Some(pos) = self.lru.iter().position(|d| d == digest) {
                self.lru.remove(pos);
            }
        }
        self.memory_used = self
            .memory_used
            .saturating_sub(DIGEST_HEX_LEN + entry.body.len());
        Some(entry)
    }

    /// Empties the cache, handing back every entry and the residency list
    /// as self-contained values for inline release or lazy-free hand-off.
    pub fn take_all(&mut self) -> (Vec<CacheEntry>, VecDeque<String>) {
        self.memory_used = 0;
        let entries = self.entries.drain().map(|(_, entry)| entry).collect();
        let lru = std::mem::take(&mut self.lru);
        (entries, lru)
    }

    /// Whether any cached script is owned by `engine`.
    pub fn references_engine(&self, engine: &str) -> bool {
        self.entries.values().any(|entry| entry.engine == engine)
    }

    /// Validates the entry ↔ residency-list invariants. Panics on
    /// violation; these are bugs, never client-visible conditions.
    pub fn check_invariants(&self) {
        assert!(
            self.lru.len() <= self.max_tracked,
            "script cache: residency list over bound"
        );
        for digest in &self.lru {
            let entry = self
                .entries
                .get(digest)
                .unwrap_or_else(|| panic!("script cache: stale residency digest {digest}"));
            assert!(entry.lru_tracked, "script cache: untracked entry in LRU");
            assert_eq!(
                self.lru.iter().filter(|d| *d == digest).count(),
                1,
                "script cache: duplicate residency digest {digest}"
            );
        }
        let tracked = self.entries.values().filter(|e| e.lru_tracked).count();
        assert_eq!(tracked, self.lru.len(), "script cache: tracking mismatch");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn function() -> CompiledFunction {
        CompiledFunction {
            name: None,
            description: None,
            payload: Box::new(()),
            flags: ScriptFlags::empty(),
        }
    }

    fn insert(cache: &mut ScriptCache, digest: &str, track: bool) -> Vec<(String, CacheEntry)> {
        cache.insert(
            digest.to_string(),
            format!("return {digest}"),
            "hello".to_string(),
            function(),
            ScriptFlags::empty(),
            track,
        )
    }

    // Digest strings in these tests are stand-ins; the dispatcher owns
    // real hashing.
    #[test]
    fn test_insert_and_touch() {
        let mut cache = ScriptCache::new(3);
        insert(&mut cache, "aaa", true);
        insert(&mut cache, "bbb", true);
        assert_eq!(cache.lru_len(), 2);

        // A hit moves the entry to the most-recently-used end.
        assert!(cache.touch("aaa"));
        insert(&mut cache, "ccc", true);
        let evicted = insert(&mut cache, "ddd", true);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].0, "bbb");
        cache.check_invariants();
    }

    #[test]
    fn test_untracked_entries_never_evicted() {
        let mut cache = ScriptCache::new(2);
        insert(&mut cache, "lib", false);
        insert(&mut cache, "e1", true);
        insert(&mut cache, "e2", true);
        let evicted = insert(&mut cache, "e3", true);

        assert_eq!(evicted[0].0, "e1");
        assert!(cache.contains("lib"));
        assert_eq!(cache.evicted_scripts(), 1);
        cache.check_invariants();
    }

    #[test]
    fn test_promotion_detaches_from_lru() {
        let mut cache = ScriptCache::new(2);
        insert(&mut cache, "aaa", true);
        cache.promote("aaa");
        assert_eq!(cache.lru_len(), 0);
        assert!(!cache.get("aaa").unwrap().lru_tracked());

        // The promoted entry survives later evictions.
        insert(&mut cache, "bbb", true);
        insert(&mut cache, "ccc", true);
        insert(&mut cache, "ddd", true);
        assert!(cache.contains("aaa"));
        cache.check_invariants();
    }

    #[test]
    fn test_memory_accounting() {
        let mut cache = ScriptCache::new(8);
        insert(&mut cache, "aaa", true);
        let used = cache.memory_used();
        assert!(used > 0);
        let entry = cache.remove("aaa").unwrap();
        drop(entry.into_function());
        assert_eq!(cache.memory_used(), 0);
    }

    #[test]
    fn test_take_all_resets_cache() {
        let mut cache = ScriptCache::new(4);
        insert(&mut cache, "aaa", true);
        insert(&mut cache, "bbb", false);
        let (entries, lru) = cache.take_all();
        assert_eq!(entries.len(), 2);
        assert_eq!(lru.len(), 1);
        assert!(cache.is_empty());
        assert_eq!(cache.memory_used(), 0);
    }

    #[test]
    fn test_references_engine() {
        let mut cache = ScriptCache::new(4);
        insert(&mut cache, "aaa", true);
        assert!(cache.references_engine("hello"));
        assert!(!cache.references_engine("rhai"));
    }
}
