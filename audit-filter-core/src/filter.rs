//! Filter engine: policy + denoise + dedup decision procedure (spec.md
//! §4.4), grounded on `pkg/filter/filter.go`'s `FilterEvent`.

use crate::dedup::{is_duplicate, is_empty_patch, DedupCache};
use crate::event::Event;
use crate::level::Level;
use crate::metrics::Metrics;
use crate::policy::{matches_policy, Policy};

#[derive(Debug, Clone, Copy)]
pub struct FilterConfig {
    pub dedupe: bool,
    /// Emit only dropped events — used for testing the complement of the
    /// normal output (spec.md §4.4).
    pub invert: bool,
}

/// Applies the full decision procedure to `event`, recording metrics as a
/// side effect and returning whether it should be forwarded (after
/// `invert`, if set).
pub fn apply(event: &mut Event, policy: &Policy, cache: &mut DedupCache, metrics: &Metrics, config: FilterConfig) -> bool {
    let forward = decide(event, policy, cache, config.dedupe, metrics);
    metrics.set_cached_objects(cache.len());
    if config.invert {
        !forward
    } else {
        forward
    }
}

fn decide(event: &mut Event, policy: &Policy, cache: &mut DedupCache, dedupe: bool, metrics: &Metrics) -> bool {
    let mut reason = String::new();
    let mut policy_matched = false;

    if let Some(rule_num) = matches_policy(event, policy) {
        policy_matched = true;
        reason = format!("policy rule #{rule_num}");
        if event.audit.level == Level::None {
            return metrics.record_drop(event, &reason);
        }
    }

    if !policy_matched {
        let username = event.audit.user.username.clone();
        if !username.is_empty() && !username.starts_with("system:") {
            return metrics.record_forward(event, "user event");
        }
        if event.attributes.is_read_only() {
            return metrics.record_drop(event, "system read");
        }
        if event
            .request_annotation("control-plane.alpha.kubernetes.io/leader")
            .is_some()
        {
            return metrics.record_drop(event, "leader lease");
        }
        let is_system_update = event.audit.request_object.is_none()
            && event.audit.verb == "update"
            && event
                .audit
                .object_ref
                .as_ref()
                .and_then(|o| o.namespace.as_deref())
                .is_some_and(|ns| username.contains(ns))
            && event.audit.response_status.as_ref().and_then(|s| s.code) == Some(200);
        if is_system_update {
            return metrics.record_drop(event, "system update");
        }
        if event.audit.verb != "create" && event.audit.level >= Level::RequestResponse {
            event.audit.level = Level::Request;
            event.audit.response_object = None;
        }
    }

    if let Some(code) = event.audit.response_status.as_ref().and_then(|s| s.code) {
        if matches!(code, 404 | 409 | 422) {
            return metrics.record_drop(event, &format!("response code {code}"));
        }
    }

    let response_ok = event.audit.response_status.as_ref().and_then(|s| s.code) == Some(200);
    if dedupe
        && matches!(event.audit.verb.as_str(), "update" | "patch")
        && event.audit.request_object.is_some()
        && response_ok
        && (is_duplicate(event, cache) || is_empty_patch(event))
    {
        return metrics.record_drop(event, "no-op write");
    }

    metrics.record_forward(event, &reason)
}
