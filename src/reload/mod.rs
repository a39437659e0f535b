use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

/// Background poller watching a set of files for modification.
///
/// One watcher per watched artifact (rule file, pattern lists, system
/// config). Polls modification times at a fixed interval on a dedicated
/// thread and invokes the callback when any watched file changes. The
/// callback owns load/validate/swap; the watcher itself never touches
/// the artifact contents.
///
/// [`stop`](Self::stop) completes within one poll interval.
pub struct FileWatcher {
    handle: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl FileWatcher {
    /// Spawn a watcher over the given paths.
    ///
    /// The callback runs on the watcher thread whenever the modification
    /// time of any path changes (including a path appearing after a
    /// missing start).
    pub fn spawn<F>(paths: Vec<PathBuf>, interval: Duration, mut on_change: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();

        let handle = std::thread::spawn(move || {
            let mut last_seen: Vec<Option<SystemTime>> =
                paths.iter().map(|p| modified_at(p)).collect();

            debug!(paths = ?paths, interval_ms = interval.as_millis() as u64, "file watcher started");

            loop {
                std::thread::sleep(interval);
                if stop_flag.load(Ordering::Acquire) {
                    break;
                }

                let mut changed = false;
                for (path, seen) in paths.iter().zip(last_seen.iter_mut()) {
                    let current = modified_at(path);
                    if current.is_none() {
                        warn!(path = %path.display(), "watched file unreadable");
                        continue;
                    }
                    if current != *seen {
                        *seen = current;
                        changed = true;
                    }
                }

                if changed {
                    on_change();
                }
            }

            debug!("file watcher stopped");
        });

        FileWatcher {
            handle: Some(handle),
            stop,
        }
    }

    /// Stop the watcher and join its thread.
    pub fn stop(mut self) {
        self.signal_and_join();
    }

    fn signal_and_join(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.signal_and_join();
    }
}

fn modified_at(path: &PathBuf) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
