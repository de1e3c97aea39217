//! Wires tailers → multiplexer → decoder pool → reorderer → filter →
//! encoder into a running pipeline (spec.md §2, §5).

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tokio::io::{stdout, AsyncWrite};
use tokio::sync::mpsc;
use tracing::info;

use crate::decoder::{spawn_decoder_pool, DecoderConfig};
use crate::dedup::DedupCache;
use crate::encoder::run_encoder;
use crate::filter::{self, FilterConfig};
use crate::line::LineMultiplexer;
use crate::metrics::Metrics;
use crate::policy_loader::PolicyHandle;
use crate::reorder::{run_reorderer, ReorderConfig};
use crate::tailer::{spawn_tailer, TailerConfig};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub inputs: Vec<PathBuf>,
    pub follow: bool,
    pub dedupe: bool,
    pub invert: bool,
    pub workers: usize,
    pub dedup_cache_capacity: usize,
}

/// Spawns every pipeline stage and returns once the encoder has drained
/// (i.e. every tailer has stopped and every event has been written).
/// `out` is the encoder's sink — `tokio::io::stdout()` in production,
/// an in-memory buffer in tests. `shutdown` lets the caller request
/// cancellation (spec.md §5): flipping it makes every tailer stop at its
/// next poll instead of reopening after rotation, draining the rest of the
/// pipeline naturally.
pub async fn run<W: AsyncWrite + Unpin>(config: PipelineConfig, policy: PolicyHandle, metrics: Arc<Metrics>, out: W, shutdown: Arc<AtomicBool>) {
    let (line_tx, line_rx) = mpsc::unbounded_channel();
    let (decoded_tx, decoded_rx) = mpsc::unbounded_channel();
    let (ordered_tx, mut ordered_rx) = mpsc::unbounded_channel();
    let (forwarded_tx, forwarded_rx) = mpsc::unbounded_channel();

    let mux = LineMultiplexer::new();
    let tailer_handles: Vec<_> = config
        .inputs
        .iter()
        .cloned()
        .map(|path| {
            spawn_tailer(
                path,
                TailerConfig { follow: config.follow },
                mux.clone(),
                line_tx.clone(),
                shutdown.clone(),
            )
        })
        .collect();
    drop(line_tx);

    let decoder_handles = spawn_decoder_pool(
        DecoderConfig {
            workers: config.workers,
            dedupe: config.dedupe,
        },
        line_rx,
        decoded_tx,
        metrics.clone(),
    );

    let reorderer_handle = tokio::spawn(run_reorderer(ReorderConfig::default(), decoded_rx, ordered_tx));

    let filter_metrics = metrics.clone();
    let filter_config = FilterConfig {
        dedupe: config.dedupe,
        invert: config.invert,
    };
    let filter_handle = tokio::spawn(async move {
        let mut cache = DedupCache::new(config.dedup_cache_capacity);
        while let Some(mut event) = ordered_rx.recv().await {
            let current_policy = policy.current().await;
            if filter::apply(&mut event, &current_policy, &mut cache, &filter_metrics, filter_config) {
                if forwarded_tx.send(event).is_err() {
                    break;
                }
            }
        }
    });

    run_encoder(forwarded_rx, out, &metrics).await;

    for handle in tailer_handles {
        let _ = handle.await;
    }
    for handle in decoder_handles {
        let _ = handle.await;
    }
    let _ = reorderer_handle.await;
    let _ = filter_handle.await;
    info!("pipeline drained, exiting");
}

/// Convenience wrapper for production use: writes to stdout.
pub async fn run_to_stdout(config: PipelineConfig, policy: PolicyHandle, metrics: Arc<Metrics>, shutdown: Arc<AtomicBool>) {
    run(config, policy, metrics, stdout(), shutdown).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[tokio::test]
    async fn end_to_end_forwards_user_event_and_drops_system_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        {
            let mut f = std::fs::File::create(&path).unwrap();
            writeln!(
                f,
                r#"{{"level":"Request","verb":"get","user":{{"username":"alice"}},"requestURI":"/api/v1/pods","responseStatus":{{"code":200}}}}"#
            )
            .unwrap();
            writeln!(
                f,
                r#"{{"level":"Request","verb":"get","user":{{"username":"system:serviceaccount:kube-system:controller"}},"requestURI":"/api/v1/pods","responseStatus":{{"code":200}}}}"#
            )
            .unwrap();
        }

        let config = PipelineConfig {
            inputs: vec![path],
            follow: false,
            dedupe: true,
            invert: false,
            workers: 2,
            dedup_cache_capacity: 10,
        };
        let policy = PolicyHandle::new(crate::policy::Policy { rules: vec![] });
        let metrics = Arc::new(Metrics::new().unwrap());
        let mut out = Vec::new();
        let shutdown = Arc::new(std::sync::atomic::AtomicBool::new(false));
        run(config, policy, metrics, &mut out, shutdown).await;

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains(r#""username":"alice""#));
    }
}
