//! Filesystem watcher producing repository-relative file events.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::FileEvent;
use crate::extractor::SyntaxExtractor;
use crate::pipeline::scan::{relative_path, ScanFilter};
use crate::pipeline::IngestSettings;

/// Errors that can occur in the file watcher.
#[derive(Error, Debug)]
pub enum WatcherError {
    #[error("Failed to create watcher: {0}")]
    CreateError(String),

    #[error("Failed to watch path: {0}")]
    WatchError(String),
}

/// Watches a repository root and reports changes to files a scan would
/// pick up. Events are raw; debouncing happens in the synchronizer.
pub struct FileWatcher {
    settings: Arc<IngestSettings>,
    extractor: Arc<SyntaxExtractor>,
    // The watcher needs to be kept alive
    watcher: Option<RecommendedWatcher>,
    /// Events lost because the receiver was gone
    dropped: Arc<AtomicUsize>,
}

impl FileWatcher {
    pub fn new(settings: Arc<IngestSettings>, extractor: Arc<SyntaxExtractor>) -> Self {
        Self {
            settings,
            extractor,
            watcher: None,
            dropped: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Start watching and return the channel events arrive on.
    pub fn start(&mut self, capacity: usize) -> Result<mpsc::Receiver<FileEvent>, WatcherError> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let filter = ScanFilter::new(&self.settings)
            .map_err(|e| WatcherError::CreateError(e.to_string()))?;
        let extractor = self.extractor.clone();
        let dropped = self.dropped.clone();

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    for file_event in convert_event(&filter, &extractor, event) {
                        if let Err(mpsc::error::SendError(lost)) = tx.blocking_send(file_event) {
                            if dropped.fetch_add(1, Ordering::Relaxed) == 0 {
                                warn!(
                                    "Event receiver closed; dropping {} {} and later events",
                                    lost.kind, lost.path
                                );
                            } else {
                                debug!("Dropping {} {}", lost.kind, lost.path);
                            }
                        }
                    }
                }
                Err(e) => debug!("Watch error: {}", e),
            }
        })
        .map_err(|e| WatcherError::CreateError(e.to_string()))?;

        watcher
            .watch(&self.settings.root, RecursiveMode::Recursive)
            .map_err(|e| WatcherError::WatchError(e.to_string()))?;
        self.watcher = Some(watcher);

        info!("Started watching {:?}", self.settings.root);
        Ok(rx)
    }

    /// Stop watching. The event channel closes once the watcher is dropped.
    pub fn stop(&mut self) {
        if self.watcher.take().is_some() {
            info!("Stopped watching {:?}", self.settings.root);
        }
    }

    pub fn is_running(&self) -> bool {
        self.watcher.is_some()
    }

    /// Events that could not be delivered because the receiver was dropped.
    pub fn dropped_events(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Map a notify event to file events for candidate paths.
fn convert_event(filter: &ScanFilter, extractor: &SyntaxExtractor, event: Event) -> Vec<FileEvent> {
    let root = filter.root();
    let relative = |path: &PathBuf| -> Option<String> {
        let rel = relative_path(root, path)?;
        filter.accepts(extractor, &rel).then_some(rel)
    };

    let events: Vec<FileEvent> = match event.kind {
        EventKind::Create(_) => event
            .paths
            .iter()
            .filter_map(relative)
            .map(FileEvent::created)
            .collect(),
        EventKind::Remove(_) => event
            .paths
            .iter()
            .filter_map(relative)
            .map(FileEvent::deleted)
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => event
            .paths
            .iter()
            .filter_map(relative)
            .map(FileEvent::deleted)
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => event
            .paths
            .iter()
            .filter_map(relative)
            .map(FileEvent::created)
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            // paths are [from, to]
            let mut out = Vec::new();
            if let Some(from) = event.paths.first().and_then(relative) {
                out.push(FileEvent::deleted(from));
            }
            if let Some(to) = event.paths.get(1).and_then(relative) {
                out.push(FileEvent::created(to));
            }
            out
        }
        EventKind::Modify(_) => event
            .paths
            .iter()
            .filter_map(relative)
            .map(|path| {
                // editors that swap files report the old name as modified
                if exists(root, &path) {
                    FileEvent::modified(path)
                } else {
                    FileEvent::deleted(path)
                }
            })
            .collect(),
        _ => Vec::new(),
    };
    events
}

fn exists(root: &Path, relative: &str) -> bool {
    root.join(relative).exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, RemoveKind};
    use tempfile::TempDir;

    fn settings(root: &Path) -> IngestSettings {
        IngestSettings {
            root: root.to_path_buf(),
            extensions: vec!["py".to_string(), "rs".to_string()],
            ignore_dirs: vec!["target".to_string()],
            ignore_patterns: vec!["*_test.py".to_string()],
            respect_gitignore: true,
            worker_limit: 1,
        }
    }

    fn filter(root: &Path) -> ScanFilter {
        ScanFilter::new(&settings(root)).unwrap()
    }

    fn event(kind: EventKind, paths: Vec<PathBuf>) -> Event {
        let mut event = Event::new(kind);
        event.paths = paths;
        event
    }

    #[test]
    fn test_convert_filters_candidates() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(".gitignore"), "scratch.py\n").unwrap();
        let filter = filter(dir.path());
        let extractor = SyntaxExtractor::with_defaults();

        let created = event(
            EventKind::Create(CreateKind::File),
            vec![
                dir.path().join("pkg/a.py"),
                dir.path().join("README.md"),
                dir.path().join("target/gen.rs"),
                dir.path().join("pkg/a_test.py"),
                dir.path().join("scratch.py"),
                PathBuf::from("/elsewhere/b.py"),
            ],
        );
        assert_eq!(
            convert_event(&filter, &extractor, created),
            vec![FileEvent::created("pkg/a.py")]
        );

        let removed = event(
            EventKind::Remove(RemoveKind::File),
            vec![dir.path().join("src/lib.rs")],
        );
        assert_eq!(
            convert_event(&filter, &extractor, removed),
            vec![FileEvent::deleted("src/lib.rs")]
        );
    }

    #[test]
    fn test_convert_rename_and_modify() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("b.py"), "x = 1\n").unwrap();
        let filter = filter(dir.path());
        let extractor = SyntaxExtractor::with_defaults();

        let renamed = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            vec![dir.path().join("a.py"), dir.path().join("b.py")],
        );
        assert_eq!(
            convert_event(&filter, &extractor, renamed),
            vec![FileEvent::deleted("a.py"), FileEvent::created("b.py")]
        );

        let modified = event(
            EventKind::Modify(ModifyKind::Data(DataChange::Content)),
            vec![dir.path().join("b.py"), dir.path().join("gone.py")],
        );
        assert_eq!(
            convert_event(&filter, &extractor, modified),
            vec![FileEvent::modified("b.py"), FileEvent::deleted("gone.py")]
        );
    }

    #[tokio::test]
    async fn test_watcher_start_stop() {
        let dir = TempDir::new().unwrap();
        let mut watcher = FileWatcher::new(
            Arc::new(settings(dir.path())),
            Arc::new(SyntaxExtractor::with_defaults()),
        );
        let rx = watcher.start(16);
        assert!(rx.is_ok());
        assert!(watcher.is_running());
        watcher.stop();
        assert!(!watcher.is_running());
    }

    #[tokio::test]
    async fn test_events_after_receiver_closed_are_counted() {
        let dir = TempDir::new().unwrap();
        let mut watcher = FileWatcher::new(
            Arc::new(settings(dir.path())),
            Arc::new(SyntaxExtractor::with_defaults()),
        );
        let rx = watcher.start(1).unwrap();
        drop(rx);

        std::fs::write(dir.path().join("a.py"), "x = 1\n").unwrap();
        for _ in 0..100 {
            if watcher.dropped_events() > 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        assert!(watcher.dropped_events() > 0);
        watcher.stop();
    }
}
