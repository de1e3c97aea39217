//! Declarative audit policy: rule schema, YAML loading, and rule matching
//! (spec.md §4.6), grounded on the upstream
//! `k8s.io/apiserver/pkg/apis/audit/v1.Policy` types and
//! `k8s.io/apiserver/pkg/audit/policy.ruleMatches`.

use serde::{Deserialize, Serialize};

use crate::event::{Attributes, Event};
use crate::level::Level;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupResources {
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default, rename = "resourceNames")]
    pub resource_names: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyRule {
    pub level: Level,
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default, rename = "userGroups")]
    pub user_groups: Vec<String>,
    #[serde(default)]
    pub verbs: Vec<String>,
    #[serde(default)]
    pub resources: Vec<GroupResources>,
    #[serde(default)]
    pub namespaces: Vec<String>,
    #[serde(default, rename = "nonResourceURLs")]
    pub non_resource_urls: Vec<String>,
    #[serde(default, rename = "omitStages")]
    pub omit_stages: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Policy {
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

impl Policy {
    pub fn from_yaml(text: &str) -> crate::error::Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn load_from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    /// Built-in fallback used when no policy file is configured or the
    /// configured file fails to parse: drops the high-churn, low-value
    /// control-plane bookkeeping resources outright.
    pub fn default_policy() -> Self {
        Policy {
            rules: vec![PolicyRule {
                level: Level::None,
                resources: vec![
                    GroupResources {
                        group: "authentication.k8s.io".into(),
                        resources: vec!["tokenreviews".into()],
                        resource_names: Vec::new(),
                    },
                    GroupResources {
                        group: "authorization.k8s.io".into(),
                        resources: vec!["subjectaccessreviews".into()],
                        resource_names: Vec::new(),
                    },
                    GroupResources {
                        group: "coordination.k8s.io".into(),
                        resources: vec!["leases".into()],
                        resource_names: Vec::new(),
                    },
                ],
                ..Default::default()
            }],
        }
    }
}

/// Evaluates `event` against `policy`'s rules in order, returning the
/// 1-based index of the first match (mirroring the original's rule-number
/// metric label), or `None` if no rule matched.
///
/// On a match, downgrades `event.audit.level` to the rule's level when the
/// rule's level is stricter, clearing `responseObject`/`requestObject`
/// accordingly — the level can only ever be lowered by policy, never raised.
pub fn matches_policy(event: &mut Event, policy: &Policy) -> Option<usize> {
    for (i, rule) in policy.rules.iter().enumerate() {
        if matches_rule(event, rule) {
            if rule.level < event.audit.level {
                event.audit.level = rule.level;
                if event.audit.level < Level::RequestResponse {
                    event.audit.response_object = None;
                }
                if rule.level < Level::Request {
                    event.audit.request_object = None;
                }
            }
            return Some(i + 1);
        }
    }
    None
}

/// Returns the wildcard-matched haystack entry for `needle`, e.g.
/// `needle = "kube-*"` matches `haystack = "kube-system"`.
fn matches_wildcard<'a>(needle: &str, haystacks: impl IntoIterator<Item = &'a str>) -> Option<&'a str> {
    let prefix = needle.strip_suffix('*')?;
    haystacks.into_iter().find(|h| h.starts_with(prefix))
}

fn matches_rule(event: &Event, rule: &PolicyRule) -> bool {
    let attrs = &event.attributes;

    if !rule.non_resource_urls.is_empty() {
        if attrs.resource_request {
            return false;
        }
        return rule
            .non_resource_urls
            .iter()
            .any(|pat| non_resource_url_matches(pat, &event.audit.request_uri));
    }
    if !attrs.resource_request && !rule.resources.is_empty() {
        return false;
    }

    if !rule.users.is_empty() && !matches_string(&rule.users, &event.audit.user.username) {
        return false;
    }
    if !rule.user_groups.is_empty() {
        let groups: Vec<&str> = event.audit.user.groups.iter().map(String::as_str).collect();
        let direct = rule.user_groups.iter().any(|g| groups.contains(&g.as_str()));
        let wildcard = rule.user_groups.iter().any(|g| matches_wildcard(g, groups.iter().copied()).is_some());
        if !direct && !wildcard {
            return false;
        }
    }
    if !rule.verbs.is_empty() && !matches_string(&rule.verbs, &attrs.verb) {
        return false;
    }
    if !rule.namespaces.is_empty() {
        let ns = event.audit.object_ref.as_ref().and_then(|o| o.namespace.as_deref());
        let Some(ns) = ns else { return false };
        let direct = rule.namespaces.iter().any(|n| n == ns);
        let wildcard = rule.namespaces.iter().any(|n| matches_wildcard(n, std::iter::once(ns)).is_some());
        if !direct && !wildcard {
            return false;
        }
    }
    if !rule.resources.is_empty() && !matches_group_resources(&rule.resources, &event.audit, attrs) {
        return false;
    }
    true
}

fn matches_string(patterns: &[String], value: &str) -> bool {
    patterns.iter().any(|p| p == value)
}

fn non_resource_url_matches(pattern: &str, path: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix('*') {
        path.starts_with(prefix)
    } else {
        pattern == path
    }
}

fn matches_group_resources(groups: &[GroupResources], event: &crate::event::AuditEvent, attrs: &Attributes) -> bool {
    let Some(object_ref) = event.object_ref.as_ref() else {
        return false;
    };
    let group = object_ref.group.as_deref().unwrap_or("");
    groups.iter().any(|g| {
        if g.group != group {
            return false;
        }
        if g.resources.is_empty() {
            return true;
        }
        let resource_matches = g.resources.iter().any(|r| resource_matches(r, attrs.resource.as_deref()));
        if !resource_matches {
            return false;
        }
        g.resource_names.is_empty()
            || object_ref
                .name
                .as_deref()
                .is_some_and(|name| g.resource_names.iter().any(|n| n == name))
    })
}

/// A `resources` entry may name a subresource with `resource/sub`; bare
/// `resource` matches the resource regardless of subresource.
fn resource_matches(pattern: &str, actual: Option<&str>) -> bool {
    let Some(actual) = actual else { return false };
    match pattern.split_once('/') {
        Some((res, _sub)) => res == actual,
        None => pattern == actual,
    }
}
