use std::ops::{Deref, DerefMut};

use serde::de::Error as _;
use serde::ser::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::value::RawValue;

use crate::level::Level;

/// The request or response body of an audit event.
///
/// Mirrors `k8s.io/apimachinery/pkg/runtime.RawExtension`: on the wire it
/// serializes as the embedded JSON object itself, not as `{"raw": ...}`.
/// `raw` is `None` once the dedup canonicalization step (see `decoder`) has
/// stripped ignored fields from `parsedObject` and nulled the cached bytes;
/// callers that need the bytes back call `Event::request_body`, which
/// re-serializes from the stripped tree.
#[derive(Debug, Clone, Default)]
pub struct RawExtension {
    pub raw: Option<Vec<u8>>,
}

impl Serialize for RawExtension {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match &self.raw {
            Some(bytes) => {
                let text = std::str::from_utf8(bytes).map_err(S::Error::custom)?;
                let raw = RawValue::from_string(text.to_owned()).map_err(S::Error::custom)?;
                raw.serialize(serializer)
            }
            None => serializer.serialize_none(),
        }
    }
}

impl<'de> Deserialize<'de> for RawExtension {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Box::<RawValue>::deserialize(deserializer).map_err(D::Error::custom)?;
        Ok(RawExtension {
            raw: Some(raw.get().as_bytes().to_vec()),
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserInfo {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    #[serde(default, rename = "apiGroup")]
    pub group: Option<String>,
    #[serde(default)]
    pub api_version: Option<String>,
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default)]
    pub subresource: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseStatus {
    #[serde(default)]
    pub code: Option<u32>,
}

/// The wire-form audit event, a pragmatic subset of the upstream
/// `k8s.io/apiserver/pkg/apis/audit/v1.Event` schema (decode/encode of the
/// full schema is an external collaborator per spec — this crate only needs
/// the fields the filter engine inspects or mutates).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditEvent {
    #[serde(default)]
    pub level: Level,
    #[serde(default)]
    pub verb: String,
    #[serde(default)]
    pub user: UserInfo,
    #[serde(default, rename = "objectRef")]
    pub object_ref: Option<ObjectRef>,
    #[serde(default, rename = "requestURI")]
    pub request_uri: String,
    #[serde(default, rename = "responseStatus")]
    pub response_status: Option<ResponseStatus>,
    #[serde(default, rename = "requestObject")]
    pub request_object: Option<RawExtension>,
    #[serde(default, rename = "responseObject")]
    pub response_object: Option<RawExtension>,
}

/// Authorization-facing view of an event, computed once at decode time.
///
/// A stand-in for `k8s.io/apiserver/pkg/authorization/authorizer.Attributes`:
/// only the facet the filter engine actually consults (`IsReadOnly`) is kept.
#[derive(Debug, Clone, Default)]
pub struct Attributes {
    pub verb: String,
    pub namespace: Option<String>,
    pub resource: Option<String>,
    pub subresource: Option<String>,
    pub resource_request: bool,
}

impl Attributes {
    pub fn from_event(e: &AuditEvent) -> Self {
        Attributes {
            verb: e.verb.clone(),
            namespace: e.object_ref.as_ref().and_then(|o| o.namespace.clone()),
            resource: e.object_ref.as_ref().and_then(|o| o.resource.clone()),
            subresource: e.object_ref.as_ref().and_then(|o| o.subresource.clone()),
            resource_request: e.object_ref.is_some(),
        }
    }

    /// Read-only verbs never mutate state; mirrors the reference
    /// authorizer's `IsReadOnly`.
    pub fn is_read_only(&self) -> bool {
        matches!(self.verb.as_str(), "get" | "list" | "watch")
    }
}

/// An enriched audit record carrying its ingress-assigned sequence index and
/// the attributes/label sets derived once by the decoder pool.
#[derive(Debug, Clone, Default)]
pub struct Event {
    pub index: u64,
    pub audit: AuditEvent,
    pub attributes: Attributes,
    /// Generic attribute tree of the request body; populated for update
    /// verbs when dedupe is enabled (see `decoder::canonicalize`).
    pub parsed_object: Option<serde_json::Value>,
    pub resource_label: (String, String),
    pub subject_label: (String, String),
}

impl Deref for Event {
    type Target = AuditEvent;
    fn deref(&self) -> &Self::Target {
        &self.audit
    }
}

impl DerefMut for Event {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.audit
    }
}

impl Event {
    /// The JSON-serialized request body, re-materializing it from
    /// `parsed_object` if the decoder already nulled the cached bytes.
    pub fn request_body(&mut self) -> Option<Vec<u8>> {
        let parsed = self.parsed_object.clone();
        let request_object = self.audit.request_object.as_mut()?;
        if request_object.raw.is_none() {
            if let Some(obj) = parsed {
                request_object.raw = serde_json::to_vec(&obj).ok();
            }
        }
        request_object.raw.clone()
    }

    /// Annotation lookup on the parsed request body, used by the leader
    /// lease denoise rule.
    pub fn request_annotation(&self, key: &str) -> Option<&str> {
        self.parsed_object
            .as_ref()?
            .get("metadata")?
            .get("annotations")?
            .get(key)?
            .as_str()
    }

    pub fn resource_label_value(&self) -> String {
        let Some(obj) = self.audit.object_ref.as_ref() else {
            return String::new();
        };
        match (&obj.resource, &obj.subresource) {
            (Some(r), Some(sub)) if !sub.is_empty() => format!("{r}/{sub}"),
            (Some(r), _) => r.clone(),
            (None, _) => String::new(),
        }
    }

    pub fn subject_kind(&self) -> &'static str {
        subject_kind(&self.audit.user.username)
    }
}

/// `subject` metric label derived from `user.username`, per spec.md §6.
pub fn subject_kind(username: &str) -> &'static str {
    if let Some(stripped) = username.strip_prefix("system:") {
        if username.starts_with("system:serviceaccount:") {
            "ServiceAccount"
        } else if username.starts_with("system:node:") {
            "Node"
        } else if stripped.starts_with("anonymous") {
            "Anonymous"
        } else {
            "SystemUser"
        }
    } else {
        "User"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_kind_prefixes() {
        assert_eq!(subject_kind("system:serviceaccount:kube-system:default"), "ServiceAccount");
        assert_eq!(subject_kind("system:node:ip-10-0-0-1"), "Node");
        assert_eq!(subject_kind("system:anonymous"), "Anonymous");
        assert_eq!(subject_kind("system:admin"), "SystemUser");
        assert_eq!(subject_kind("alice"), "User");
    }

    #[test]
    fn raw_extension_roundtrip() {
        let json = r#"{"level":"Request","verb":"update","user":{"username":"alice","groups":[]},
            "requestURI":"/api/v1/namespaces/foo","requestObject":{"a":1}}"#;
        let ev: AuditEvent = serde_json::from_str(json).unwrap();
        assert_eq!(ev.verb, "update");
        let raw = ev.request_object.unwrap().raw.unwrap();
        let v: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn resource_label_with_subresource() {
        let mut e = Event::default();
        e.audit.object_ref = Some(ObjectRef {
            group: None,
            api_version: None,
            resource: Some("pods".into()),
            subresource: Some("status".into()),
            namespace: None,
            name: None,
        });
        assert_eq!(e.resource_label_value(), "pods/status");
    }
}
