use std::path::PathBuf;

use crossbeam_channel::Sender;
use notify::event::{AccessKind, AccessMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, info, warn};

/// Start OS-level watches on the cache roots; changed file paths are sent to `tx`.
///
/// The watches stay active for as long as the returned watcher lives.
pub fn build_watcher(
    roots: &[(PathBuf, bool)],
    tx: Sender<PathBuf>,
) -> notify::Result<RecommendedWatcher> {
    let mut watcher = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| match res {
            Ok(event) => {
                if !is_content_event(&event.kind) {
                    return;
                }
                for path in event.paths {
                    if path.is_file() && tx.send(path).is_err() {
                        return;
                    }
                }
            }
            Err(err) => warn!("cache watch error: {err}"),
        },
        Config::default(),
    )?;

    for (root, recursive) in roots {
        if root.as_os_str().is_empty() || !root.exists() {
            debug!("not watching missing cache root {}", root.display());
            continue;
        }
        let mode = if *recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher.watch(root, mode)?;
        info!("watching cache root {} ({:?})", root.display(), mode);
    }

    Ok(watcher)
}

fn is_content_event(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_)
            | EventKind::Modify(_)
            | EventKind::Access(AccessKind::Close(AccessMode::Write))
    )
}
