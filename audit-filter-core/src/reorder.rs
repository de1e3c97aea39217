//! Index-restoring reorder buffer (spec.md §4.3).
//!
//! Confined to a single task: the heap is never shared, so no
//! synchronization beyond the channels feeding and draining it is needed.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::event::Event;

/// Gap-handling policy resolving the open question in spec.md §9: the
/// source wedges forever on a missing index. Here, once the input channel
/// has been idle for `watermark_timeout` and the heap's lowest buffered
/// index is more than `gap_threshold` past `nextIndex`, the reorderer
/// advances past the gap rather than stalling indefinitely.
#[derive(Debug, Clone, Copy)]
pub struct ReorderConfig {
    pub gap_threshold: u64,
    pub watermark_timeout: Duration,
}

impl Default for ReorderConfig {
    fn default() -> Self {
        Self {
            gap_threshold: 1024,
            watermark_timeout: Duration::from_secs(1),
        }
    }
}

struct IndexedEvent(Event);

impl PartialEq for IndexedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.0.index == other.0.index
    }
}
impl Eq for IndexedEvent {}
impl PartialOrd for IndexedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for IndexedEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.index.cmp(&other.0.index)
    }
}

/// Runs the reorderer until `rx` closes, forwarding events to `tx` in
/// strictly increasing index order (modulo skipped gaps).
pub async fn run_reorderer(config: ReorderConfig, mut rx: mpsc::UnboundedReceiver<Event>, tx: mpsc::UnboundedSender<Event>) {
    let mut next_index: u64 = 1;
    let mut heap: BinaryHeap<Reverse<IndexedEvent>> = BinaryHeap::new();

    loop {
        match tokio::time::timeout(config.watermark_timeout, rx.recv()).await {
            Ok(Some(event)) => {
                heap.push(Reverse(IndexedEvent(event)));
                if !drain_ready(&mut heap, &mut next_index, &tx) {
                    return;
                }
            }
            Ok(None) => {
                // Upstream closed: flush whatever is left, in order, and stop.
                flush_all(&mut heap, &tx);
                return;
            }
            Err(_) => {
                // Watermark elapsed with no new input; consider skipping a gap.
                if let Some(Reverse(top)) = heap.peek() {
                    if top.0.index > next_index + config.gap_threshold {
                        warn!(
                            from = next_index,
                            to = top.0.index,
                            "reorderer: watermark elapsed, advancing past gap"
                        );
                        next_index = top.0.index;
                        if !drain_ready(&mut heap, &mut next_index, &tx) {
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Pops and forwards every event whose index matches the current
/// `next_index`, advancing it as it goes. Returns `false` if the downstream
/// receiver has gone away.
fn drain_ready(heap: &mut BinaryHeap<Reverse<IndexedEvent>>, next_index: &mut u64, tx: &mpsc::UnboundedSender<Event>) -> bool {
    while let Some(Reverse(top)) = heap.peek() {
        if top.0.index != *next_index {
            break;
        }
        let Reverse(IndexedEvent(event)) = heap.pop().unwrap();
        if tx.send(event).is_err() {
            return false;
        }
        *next_index += 1;
    }
    true
}

fn flush_all(heap: &mut BinaryHeap<Reverse<IndexedEvent>>, tx: &mpsc::UnboundedSender<Event>) {
    debug!(count = heap.len(), "reorderer: flushing remaining buffered events on shutdown");
    // `pop` yields ascending original index order since elements are
    // wrapped in `Reverse`, same as `drain_ready`'s peek/pop loop.
    while let Some(Reverse(IndexedEvent(event))) = heap.pop() {
        if tx.send(event).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::AuditEvent;

    fn event(index: u64) -> Event {
        Event {
            index,
            audit: AuditEvent::default(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn restores_order_across_out_of_order_input() {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_reorderer(ReorderConfig::default(), in_rx, out_tx));

        for i in [3, 1, 2, 5, 4] {
            in_tx.send(event(i)).unwrap();
        }
        drop(in_tx);

        let mut seen = Vec::new();
        while let Some(e) = out_rx.recv().await {
            seen.push(e.index);
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn advances_past_gap_after_watermark_timeout() {
        let config = ReorderConfig {
            gap_threshold: 0,
            watermark_timeout: Duration::from_millis(20),
        };
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_reorderer(config, in_rx, out_tx));

        // Index 1 never arrives (decode error); 2 and 3 should eventually
        // flow after the watermark elapses.
        in_tx.send(event(2)).unwrap();
        in_tx.send(event(3)).unwrap();

        let first = tokio::time::timeout(Duration::from_secs(2), out_rx.recv()).await.unwrap().unwrap();
        let second = tokio::time::timeout(Duration::from_secs(2), out_rx.recv()).await.unwrap().unwrap();
        assert_eq!((first.index, second.index), (2, 3));

        drop(in_tx);
        handle.await.unwrap();
    }
}
