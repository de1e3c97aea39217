//! Sequential output encoder (spec.md §4.7), grounded on the original's
//! plain `json.Marshal` + newline-delimited stdout writer.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::warn;

use crate::event::Event;
use crate::metrics::Metrics;

/// Drains `rx`, serializing each surviving event to `out` as one JSON
/// object per line. No buffering beyond what `out` itself provides; an
/// encode or write error is logged and counted but never stops the loop —
/// the pipeline keeps draining rather than stalling on a single bad event.
pub async fn run_encoder<W: AsyncWrite + Unpin>(mut rx: mpsc::UnboundedReceiver<Event>, mut out: W, metrics: &Metrics) {
    while let Some(event) = rx.recv().await {
        match serde_json::to_vec(&event.audit) {
            Ok(mut line) => {
                line.push(b'\n');
                if let Err(e) = out.write_all(&line).await {
                    metrics.record_error();
                    warn!(index = event.index, error = %e, "encoder: write failed");
                }
            }
            Err(e) => {
                metrics.record_error();
                warn!(index = event.index, error = %e, "encoder: serialize failed");
            }
        }
    }
    let _ = out.flush().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::AuditEvent;

    #[tokio::test]
    async fn encodes_events_as_ndjson() {
        let metrics = Metrics::new().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut buf = Vec::new();

        tx.send(Event {
            index: 1,
            audit: AuditEvent {
                verb: "get".into(),
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap();
        tx.send(Event {
            index: 2,
            audit: AuditEvent {
                verb: "update".into(),
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap();
        drop(tx);

        run_encoder(rx, &mut buf, &metrics).await;
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains(r#""verb":"get""#));
        assert!(lines[1].contains(r#""verb":"update""#));
    }
}
