//! No-op write deduplication (spec.md §4.5), grounded on the original's
//! `IsEmptyPatch`/`IsDuplicate`/`GetPreviousRequest` trio
//! (`pkg/filter/filter.go`).
//!
//! The cache is confined to the filter task — it is never shared across
//! tasks or wrapped in a lock, since exactly one task ever calls into it.

use std::num::NonZeroUsize;

use lru::LruCache;
use serde_json::Value;

use crate::event::{Event, RawExtension};
use crate::level::Level;
use crate::merge_patch::{create_three_way_merge_patch, is_empty_patch_value};

pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

/// Bounded by-request-path cache of the last observed request body, used to
/// reduce successive updates to a minimal patch for emptiness checking.
pub struct DedupCache {
    cache: LruCache<String, Vec<u8>>,
}

impl DedupCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).unwrap());
        Self {
            cache: LruCache::new(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Inserts `now` under `key`'s cache slot, returning whatever body was
    /// cached there before (if any). Always inserts, mirroring the
    /// original's unconditional `defer Cache.Add(key, now)`.
    fn swap(&mut self, key: &str, now: Vec<u8>) -> Option<Vec<u8>> {
        self.cache.put(key.to_string(), now)
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

fn cache_key(request_uri: &str) -> &str {
    request_uri.split('?').next().unwrap_or("")
}

/// Whether `event`'s request body (after any reduction to a patch) carries
/// no actual change: `RequestResponse`/`Request`-level updates/patches with
/// an empty, `null`, or missing body; `Metadata`-level events are never
/// considered empty (no body to inspect); anything below `Metadata` is
/// trivially empty.
pub fn is_empty_patch(event: &mut Event) -> bool {
    if event.audit.level >= Level::Request && matches!(event.audit.verb.as_str(), "patch" | "update") {
        match event.request_body() {
            None => true,
            Some(bytes) => matches!(bytes.as_slice(), b"{}" | b"null" | b""),
        }
    } else if event.audit.level >= Level::Metadata {
        false
    } else {
        true
    }
}

/// Reduces an `update` to a `patch` against the previously cached body for
/// the same path, returning `true` on success (a previous body existed and
/// both bodies parsed as JSON).
fn reduce_to_patch(event: &mut Event, cache: &mut DedupCache) -> bool {
    let Some(now) = event.request_body() else {
        return false;
    };
    let key = cache_key(&event.audit.request_uri).to_string();
    let Some(then) = cache.swap(&key, now.clone()) else {
        return false;
    };
    let (Ok(then_val), Ok(now_val)) = (
        serde_json::from_slice::<Value>(&then),
        serde_json::from_slice::<Value>(&now),
    ) else {
        return false;
    };
    let patch = create_three_way_merge_patch(&then_val, &now_val, &then_val);
    let Ok(patch_bytes) = serde_json::to_vec(&patch) else {
        return false;
    };
    event.audit.verb = "patch".into();
    event.audit.request_object = Some(RawExtension { raw: Some(patch_bytes) });
    event.parsed_object = Some(patch);
    true
}

/// `true` if `event` is a redundant re-statement of the previous request at
/// the same path: reducible to a patch, and that patch is empty.
pub fn is_duplicate(event: &mut Event, cache: &mut DedupCache) -> bool {
    reduce_to_patch(event, cache) && is_empty_patch(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::AuditEvent;

    fn event(verb: &str, uri: &str, body: Option<&str>, level: Level) -> Event {
        Event {
            audit: AuditEvent {
                verb: verb.into(),
                request_uri: uri.into(),
                level,
                request_object: body.map(|b| RawExtension {
                    raw: Some(b.as_bytes().to_vec()),
                }),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn first_update_is_never_a_duplicate() {
        let mut cache = DedupCache::new(10);
        let mut ev = event("update", "/api/v1/pods/x", Some(r#"{"a":1}"#), Level::Request);
        assert!(!is_duplicate(&mut ev, &mut cache));
    }

    #[test]
    fn second_identical_update_is_a_duplicate() {
        let mut cache = DedupCache::new(10);
        let mut first = event("update", "/api/v1/pods/x", Some(r#"{"a":1}"#), Level::Request);
        assert!(!is_duplicate(&mut first, &mut cache));

        let mut second = event("update", "/api/v1/pods/x", Some(r#"{"a":1}"#), Level::Request);
        assert!(is_duplicate(&mut second, &mut cache));
        assert_eq!(second.audit.verb, "patch");
    }

    #[test]
    fn changed_field_is_not_a_duplicate() {
        let mut cache = DedupCache::new(10);
        let mut first = event("update", "/api/v1/pods/x", Some(r#"{"a":1}"#), Level::Request);
        assert!(!is_duplicate(&mut first, &mut cache));

        let mut second = event("update", "/api/v1/pods/x", Some(r#"{"a":2}"#), Level::Request);
        assert!(!is_duplicate(&mut second, &mut cache));
    }

    #[test]
    fn query_string_is_stripped_from_cache_key() {
        assert_eq!(cache_key("/api/v1/pods/x?timeout=5"), "/api/v1/pods/x");
    }

    #[test]
    fn metadata_level_never_empty() {
        let mut ev = event("update", "/api/v1/pods/x", None, Level::Metadata);
        assert!(!is_empty_patch(&mut ev));
    }

    #[test]
    fn missing_body_is_empty() {
        let mut ev = event("update", "/api/v1/pods/x", None, Level::Request);
        assert!(is_empty_patch(&mut ev));
    }
}
