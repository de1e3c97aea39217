//! Decoder worker pool (spec.md §4.2), grounded on the teacher's
//! `Arc<tokio::sync::Mutex<Receiver>>` worker-pool pattern
//! (`streaming_scanner.rs::file_process_worker`).

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::defaults::IGNORE_FIELDS;
use crate::event::{AuditEvent, Attributes, Event};
use crate::line::Line;
use crate::metrics::Metrics;

#[derive(Debug, Clone, Copy)]
pub struct DecoderConfig {
    pub workers: usize,
    pub dedupe: bool,
}

impl DecoderConfig {
    /// `1 + numCPU` per spec.md §4.2, unless the caller overrides it.
    pub fn default_worker_count() -> usize {
        1 + num_cpus::get()
    }
}

/// Spawns the decoder pool: `config.workers` tasks sharing one input
/// receiver behind a mutex, each tagging its output with the line's
/// original index so the reorderer can restore order downstream.
pub fn spawn_decoder_pool(
    config: DecoderConfig,
    line_rx: mpsc::UnboundedReceiver<Line>,
    event_tx: mpsc::UnboundedSender<Event>,
    metrics: Arc<Metrics>,
) -> Vec<JoinHandle<()>> {
    let line_rx = Arc::new(Mutex::new(line_rx));
    (0..config.workers.max(1))
        .map(|worker_id| {
            let line_rx = line_rx.clone();
            let event_tx = event_tx.clone();
            let metrics = metrics.clone();
            tokio::spawn(async move { decoder_worker(worker_id, config.dedupe, line_rx, event_tx, metrics).await })
        })
        .collect()
}

async fn decoder_worker(
    worker_id: usize,
    dedupe: bool,
    line_rx: Arc<Mutex<mpsc::UnboundedReceiver<Line>>>,
    event_tx: mpsc::UnboundedSender<Event>,
    metrics: Arc<Metrics>,
) {
    debug!(worker_id, "decoder worker started");
    loop {
        let line = {
            let mut rx = line_rx.lock().await;
            rx.recv().await
        };
        let Some(line) = line else { break };
        metrics.record_parsed();
        match decode_line(&line, dedupe) {
            Ok(event) => {
                if event_tx.send(event).is_err() {
                    break;
                }
            }
            Err(e) => {
                metrics.record_error();
                warn!(index = line.index, error = %e, "decode error, dropping event");
            }
        }
    }
    debug!(worker_id, "decoder worker stopped");
}

pub(crate) fn decode_line(line: &Line, dedupe: bool) -> crate::error::Result<Event> {
    let audit: AuditEvent = serde_json::from_slice(&line.data)?;
    let attributes = Attributes::from_event(&audit);

    let parsed_object = if dedupe && audit.verb == "update" {
        audit
            .request_object
            .as_ref()
            .and_then(|r| r.raw.as_deref())
            .and_then(|raw| serde_json::from_slice::<Value>(raw).ok())
            .map(|mut tree| {
                strip_ignored_fields(&mut tree);
                tree
            })
    } else {
        None
    };

    let mut event = Event {
        index: line.index,
        audit,
        attributes,
        parsed_object,
        resource_label: Default::default(),
        subject_label: Default::default(),
    };

    // Nulling the cached raw bytes forces re-serialization from the
    // stripped tree on next access, canonicalizing the body for dedup
    // comparison (spec.md §4.2).
    if event.parsed_object.is_some() {
        if let Some(request_object) = event.audit.request_object.as_mut() {
            request_object.raw = None;
        }
    }

    event.resource_label = (event.audit.verb.clone(), event.resource_label_value());
    event.subject_label = (event.audit.verb.clone(), event.subject_kind().to_string());

    Ok(event)
}

/// Removes every dotted/indexed path in [`IGNORE_FIELDS`] from `tree`.
pub fn strip_ignored_fields(tree: &mut Value) {
    for path in IGNORE_FIELDS {
        let keys = parse_field_path(path);
        remove_path(tree, &keys);
    }
}

/// Parses a path like `metadata.annotations["kubectl.kubernetes.io/last-applied-configuration"]`
/// into its ordered key segments, respecting quoted bracket indices that may
/// themselves contain dots.
fn parse_field_path(path: &str) -> Vec<String> {
    let mut keys = Vec::new();
    let mut current = String::new();
    let mut chars = path.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '.' => {
                if !current.is_empty() {
                    keys.push(std::mem::take(&mut current));
                }
            }
            '[' => {
                if !current.is_empty() {
                    keys.push(std::mem::take(&mut current));
                }
                if chars.peek() == Some(&'"') {
                    chars.next();
                }
                let mut key = String::new();
                for c2 in chars.by_ref() {
                    if c2 == '"' {
                        break;
                    }
                    key.push(c2);
                }
                // consume the closing ']'
                if chars.peek() == Some(&']') {
                    chars.next();
                }
                keys.push(key);
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        keys.push(current);
    }
    keys
}

fn remove_path(value: &mut Value, keys: &[String]) {
    let (Some(last), rest) = keys.split_last() else {
        return;
    };
    let mut target = value;
    for key in rest {
        let Value::Object(map) = target else { return };
        let Some(child) = map.get_mut(key) else { return };
        target = child;
    }
    if let Value::Object(map) = target {
        map.remove(last);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_dotted_and_indexed_paths() {
        assert_eq!(
            parse_field_path("metadata.resourceVersion"),
            vec!["metadata", "resourceVersion"]
        );
        assert_eq!(
            parse_field_path(r#"data["ca.crt"]"#),
            vec!["data", "ca.crt"]
        );
        assert_eq!(
            parse_field_path(r#"metadata.annotations["kubectl.kubernetes.io/last-applied-configuration"]"#),
            vec!["metadata", "annotations", "kubectl.kubernetes.io/last-applied-configuration"]
        );
    }

    #[test]
    fn strips_ignored_fields_from_nested_tree() {
        let mut tree = json!({
            "metadata": {"resourceVersion": "123", "generation": 4, "name": "x"},
            "status": {"conditions": [1, 2], "lastSyncTimestamp": "t"},
            "data": {"ca.crt": "abc", "other": "keep"},
        });
        strip_ignored_fields(&mut tree);
        assert_eq!(
            tree,
            json!({
                "metadata": {"name": "x"},
                "status": {},
                "data": {"other": "keep"},
            })
        );
    }

    #[test]
    fn decodes_event_and_strips_dedup_fields() {
        let line = Line {
            index: 1,
            data: br#"{"verb":"update","user":{"username":"alice"},"requestURI":"/api/v1/pods/x",
                "requestObject":{"metadata":{"resourceVersion":"9","name":"x"}}}"#
                .to_vec(),
        };
        let event = decode_line(&line, true).unwrap();
        let parsed = event.parsed_object.unwrap();
        assert_eq!(parsed["metadata"]["name"], "x");
        assert!(parsed["metadata"].get("resourceVersion").is_none());
        assert!(event.audit.request_object.unwrap().raw.is_none());
    }
}
