//! Rotation-aware file tailer (spec.md §4.1).
//!
//! Each input file gets one tailer task. The tailer follows growth of the
//! current inode, detects rotation (the path resolving to a new inode) via a
//! filesystem watch on the file and its parent directory, drains the old
//! handle to EOF, then reopens the path. Partial trailing lines at a
//! rotation boundary are discarded — the source is assumed to emit complete
//! records.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::line::{Line, LineMultiplexer};

/// Minimum line buffer: large enough to accommodate sizeable audit records
/// without reallocating on every read (spec.md §4.1).
const READ_CHUNK: usize = 100 * 1024;

const OPEN_RETRY_DELAY: Duration = Duration::from_millis(500);
const POLL_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy)]
pub struct TailerConfig {
    pub follow: bool,
}

impl Default for TailerConfig {
    fn default() -> Self {
        Self { follow: true }
    }
}

/// Spawns a tailer for `path`, tagging every complete line through `mux` and
/// forwarding it on `tx`. Runs on a blocking task since the read loop and the
/// filesystem watch are both synchronous. `shutdown` is polled between reads;
/// flipping it to `true` makes the tailer stop at the next opportunity
/// instead of reopening after rotation (spec.md §5's cancellation contract).
pub fn spawn_tailer(
    path: PathBuf,
    config: TailerConfig,
    mux: LineMultiplexer,
    tx: mpsc::UnboundedSender<Line>,
    shutdown: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || run_tailer(&path, config, &mux, &tx, &shutdown))
}

fn run_tailer(path: &Path, config: TailerConfig, mux: &LineMultiplexer, tx: &mpsc::UnboundedSender<Line>, shutdown: &AtomicBool) {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            info!(path = %path.display(), "tailer: shutdown requested, exiting");
            return;
        }
        let file = match open_with_retry(path, config.follow, shutdown) {
            Some(f) => f,
            None => return, // follow=false and the file never appeared, or shutdown requested
        };
        let mut inode = inode_of(path);
        let watcher = match build_watcher(path) {
            Ok(w) => w,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "tailer: watcher init failed, falling back to polling");
                DirWatch::none()
            }
        };
        let rotated = drain_file(path, file, config.follow, &mut inode, &watcher, mux, tx, shutdown);
        if !rotated {
            // follow=false (or shutdown), EOF reached on a non-rotated file: terminate cleanly.
            info!(path = %path.display(), "tailer: reached EOF, not following, exiting");
            return;
        }
        debug!(path = %path.display(), "tailer: rotation detected, reopening");
    }
}

fn open_with_retry(path: &Path, follow: bool, shutdown: &AtomicBool) -> Option<File> {
    loop {
        match File::open(path) {
            Ok(f) => return Some(f),
            Err(e) => {
                if !follow || shutdown.load(Ordering::Relaxed) {
                    warn!(path = %path.display(), error = %e, "tailer: open failed, giving up");
                    return None;
                }
                debug!(path = %path.display(), error = %e, "tailer: open failed, retrying");
                std::thread::sleep(OPEN_RETRY_DELAY);
            }
        }
    }
}

/// Builds a watcher on `path` and its parent directory. `None` means the
/// tailer degrades to pure polling (still correct, just slower to notice
/// rotation).
struct DirWatch {
    _watcher: Option<RecommendedWatcher>,
    rx: Option<std_mpsc::Receiver<notify::Result<notify::Event>>>,
}

impl DirWatch {
    fn none() -> Self {
        Self {
            _watcher: None,
            rx: None,
        }
    }

    fn wait(&self, timeout: Duration) {
        if let Some(rx) = &self.rx {
            let _ = rx.recv_timeout(timeout);
        } else {
            std::thread::sleep(timeout);
        }
    }
}

fn build_watcher(path: &Path) -> notify::Result<DirWatch> {
    let (std_tx, std_rx) = std_mpsc::channel();
    let mut watcher = notify::recommended_watcher(move |res| {
        let _ = std_tx.send(res);
    })?;
    watcher.watch(path, RecursiveMode::NonRecursive)?;
    if let Some(parent) = path.parent() {
        // Best-effort: rotation is typically a rename/create in the parent
        // directory, which some platforms only report there.
        let _ = watcher.watch(parent, RecursiveMode::NonRecursive);
    }
    Ok(DirWatch {
        _watcher: Some(watcher),
        rx: Some(std_rx),
    })
}

/// Reads complete lines from `file` until EOF, tagging and forwarding each.
/// Returns `true` if the caller should reopen the path (rotation detected or
/// `follow=true`), `false` if the tailer should terminate (`follow=false`).
fn drain_file(
    path: &Path,
    file: File,
    follow: bool,
    inode: &mut Option<u64>,
    watcher: &DirWatch,
    mux: &LineMultiplexer,
    tx: &mpsc::UnboundedSender<Line>,
    shutdown: &AtomicBool,
) -> bool {
    let mut reader = BufReader::with_capacity(READ_CHUNK, file);
    let mut pending: Vec<u8> = Vec::new();
    loop {
        match read_one_line(&mut reader, &mut pending) {
            Ok(Some(line)) => {
                if tx.send(mux.tag(line)).is_err() {
                    return false; // downstream gone, nothing left to do
                }
            }
            Ok(None) => {
                if !follow || shutdown.load(Ordering::Relaxed) {
                    return false;
                }
                watcher.wait(POLL_TIMEOUT);
                if has_rotated(path, inode) {
                    return true;
                }
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "tailer: read error, retrying");
                if !follow || shutdown.load(Ordering::Relaxed) {
                    return false;
                }
                watcher.wait(POLL_TIMEOUT);
            }
        }
    }
}

/// Reads at most one complete `\n`-terminated line, accumulating a partial
/// trailing line across calls in `pending`. Returns `Ok(None)` when no
/// complete line is currently available (EOF reached mid-line or at a line
/// boundary).
fn read_one_line(reader: &mut BufReader<File>, pending: &mut Vec<u8>) -> std::io::Result<Option<Vec<u8>>> {
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        if let Some(pos) = pending.iter().position(|&b| b == b'\n') {
            let mut line = pending.split_off(pos + 1);
            std::mem::swap(&mut line, pending);
            line.pop(); // drop trailing '\n'
            return Ok(Some(line));
        }
        let n = reader.read(&mut chunk)?;
        if n == 0 {
            return Ok(None);
        }
        pending.extend_from_slice(&chunk[..n]);
    }
}

fn has_rotated(path: &Path, inode: &mut Option<u64>) -> bool {
    let current = inode_of(path);
    match (*inode, current) {
        (Some(old), Some(new)) => old != new,
        (None, Some(_)) => true,
        _ => false,
    }
}

#[cfg(unix)]
fn inode_of(path: &Path) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata(path).ok().map(|m| m.ino())
}

#[cfg(not(unix))]
fn inode_of(path: &Path) -> Option<u64> {
    // Best-effort fallback: treat every stat as a distinct generation so
    // rotation is always (over-eagerly) detected rather than missed.
    std::fs::metadata(path).ok().map(|_| 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[tokio::test]
    async fn tails_appended_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        std::fs::write(&path, b"first\nsecond\n").unwrap();

        let mux = LineMultiplexer::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = spawn_tailer(path.clone(), TailerConfig { follow: true }, mux, tx, shutdown);

        let mut lines = Vec::new();
        for _ in 0..2 {
            let line = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("line within timeout")
                .expect("channel open");
            lines.push(String::from_utf8(line.data).unwrap());
        }
        assert_eq!(lines, vec!["first", "second"]);

        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(f, "third").unwrap();
        let line = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("line within timeout")
            .expect("channel open");
        assert_eq!(String::from_utf8(line.data).unwrap(), "third");

        handle.abort();
    }

    #[test]
    fn partial_trailing_line_is_discarded_on_rotation() {
        let mut pending = b"complete\npartial".to_vec();
        let mut buf = BufReader::new(tempfile::tempfile().unwrap());
        // First call drains the already-buffered complete line.
        let first = {
            // Simulate by draining `pending` directly since no file reads are needed.
            let pos = pending.iter().position(|&b| b == b'\n').unwrap();
            let mut line = pending.split_off(pos + 1);
            std::mem::swap(&mut line, &mut pending);
            line.pop();
            line
        };
        assert_eq!(first, b"complete");
        assert_eq!(pending, b"partial");
        // A fresh file (post-rotation) starts with empty `pending`, discarding
        // the old partial tail, matching read_one_line's per-open state.
        let mut fresh_pending = Vec::new();
        let result = read_one_line(&mut buf, &mut fresh_pending).unwrap();
        assert_eq!(result, None);
    }
}
