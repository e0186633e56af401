//! Routes file watcher for hot reload.
//!
//! # Responsibilities
//! - Watch the routes file for changes (inotify/kqueue)
//! - Debounce rapid changes to avoid reload storms
//! - Notify the main thread, which performs the reload
//!
//! # Design Decisions
//! - The watcher never reloads by itself; it only signals. Reload runs on
//!   the main thread where the domain map lives.
//! - Debounce window prevents partial-write reloads
//! - Watch errors log and disable watching; SIGHUP reload still works

use std::path::Path;
use std::time::{Duration, Instant};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};

const DEBOUNCE_WINDOW: Duration = Duration::from_millis(250);

/// Watches the routes file and invokes `on_change` (from the watcher's own
/// thread) when its content may have changed. The callback should do no
/// more than wake the owning thread.
pub struct RoutesWatcher {
    // held for its Drop; dropping stops the watch
    _watcher: RecommendedWatcher,
}

impl RoutesWatcher {
    pub fn start<F>(path: &Path, on_change: F) -> Result<Self, notify::Error>
    where
        F: Fn() + Send + 'static,
    {
        let mut last_fire: Option<Instant> = None;

        let mut watcher = notify::recommended_watcher(
            move |result: Result<notify::Event, notify::Error>| match result {
                Ok(event) => {
                    if !matches!(
                        event.kind,
                        notify::EventKind::Create(_)
                            | notify::EventKind::Modify(_)
                            | notify::EventKind::Remove(_)
                    ) {
                        return;
                    }

                    let now = Instant::now();
                    if let Some(prev) = last_fire {
                        if now.duration_since(prev) < DEBOUNCE_WINDOW {
                            return;
                        }
                    }
                    last_fire = Some(now);

                    on_change();
                }
                Err(e) => {
                    tracing::error!(error = %e, "routes watch error");
                }
            },
        )?;

        // watch the parent directory: editors replace files by rename,
        // which drops a watch on the file itself
        let dir = path.parent().unwrap_or(Path::new("."));
        watcher.watch(dir, RecursiveMode::NonRecursive)?;

        tracing::debug!(path = %path.display(), "watching routes file");

        Ok(Self { _watcher: watcher })
    }
}
