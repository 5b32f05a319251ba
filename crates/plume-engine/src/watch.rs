//! Filesystem watching for cache invalidation.

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;

/// Keeps the underlying watcher alive; dropping it stops the watch.
pub struct WatchGuard {
    _watcher: RecommendedWatcher,
}

/// Watches `root` recursively and calls `on_change` with every touched
/// path. Event classification is left to the callback; deleting, renaming
/// and writing all count as changes.
pub fn watch_invalidate<F>(root: &Path, on_change: F) -> Result<WatchGuard, String>
where
    F: Fn(&Path) + Send + 'static,
{
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        if let Ok(event) = res {
            for path in &event.paths {
                on_change(path);
            }
        }
    })
    .map_err(|e| format!("failed to create watcher: {e}"))?;

    watcher
        .watch(root, RecursiveMode::Recursive)
        .map_err(|e| format!("failed to watch {}: {e}", root.display()))?;

    Ok(WatchGuard { _watcher: watcher })
}
