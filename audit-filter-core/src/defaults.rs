//! Built-in defaults (spec.md §6): input paths and the dedup
//! canonicalization field list.

/// Default kube-apiserver audit log paths, tailed when `--input` is not
/// given.
pub const DEFAULT_INPUT_PATHS: &[&str] = &[
    "/var/log/kube-apiserver/audit.log",
    "/var/log/openshift-apiserver/audit.log",
    "/var/log/oauth-apiserver/audit.log",
];

pub const DEFAULT_POLICY_PATH: &str = "/etc/audit-filter/policy.yaml";

pub const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:9090";

/// Dotted/indexed paths stripped from the request body before dedup
/// comparison, resolved by [`crate::decoder::strip_ignored_fields`].
pub const IGNORE_FIELDS: &[&str] = &[
    "metadata.resourceVersion",
    "metadata.generation",
    r#"metadata.annotations["kubectl.kubernetes.io/last-applied-configuration"]"#,
    "status.relatedObjects",
    "status.conditions",
    "status.lastSyncTimestamp",
    "status.components",
    "spec.icon",
    r#"data["ca.crt"]"#,
    r#"data["ca-bundle.crt"]"#,
    r#"data["service-ca.crt"]"#,
];
