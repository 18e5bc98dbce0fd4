use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;

use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, error, info};

use crate::error::Result;

/// Pushes the path of every file created in (or renamed into) a directory
/// into a channel. Watching stops when the value is dropped.
pub struct RawDirWatcher {
    watcher: RecommendedWatcher,
    dir: PathBuf,
}

impl RawDirWatcher {
    pub fn start(dir: &Path, events: Sender<PathBuf>) -> Result<Self> {
        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| match res {
                Ok(event) => {
                    for path in created_paths(event) {
                        debug!(path = %path.display(), "File created");
                        if events.send(path).is_err() {
                            debug!("Event queue closed");
                        }
                    }
                }
                Err(e) => error!("Watch error: {e}"),
            },
            Config::default(),
        )?;
        watcher.watch(dir, RecursiveMode::NonRecursive)?;
        info!(dir = %dir.display(), "Watching for new images");
        Ok(Self {
            watcher,
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn stop(mut self) {
        if let Err(e) = self.watcher.unwatch(&self.dir) {
            debug!("Unwatch failed: {e}");
        }
        info!(dir = %self.dir.display(), "Stopped watching");
    }
}

/// Paths that newly appeared. Transfer tools that write a temporary file and
/// rename it into place only produce rename events.
fn created_paths(event: Event) -> Vec<PathBuf> {
    match event.kind {
        EventKind::Create(_) => event.paths,
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => event.paths,
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            event.paths.into_iter().skip(1).take(1).collect()
        }
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::CreateKind;

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        paths
            .iter()
            .fold(Event::new(kind), |e, p| e.add_path(PathBuf::from(p)))
    }

    #[test]
    fn creations_and_renames_into_place_count() {
        let created = event(EventKind::Create(CreateKind::File), &["/raw/a.fits"]);
        assert_eq!(created_paths(created), vec![PathBuf::from("/raw/a.fits")]);

        let renamed = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/raw/.a.fits.tmp", "/raw/a.fits"],
        );
        assert_eq!(created_paths(renamed), vec![PathBuf::from("/raw/a.fits")]);

        let moved_away = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::From)),
            &["/raw/a.fits"],
        );
        assert!(created_paths(moved_away).is_empty());
    }
}
