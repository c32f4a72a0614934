//! Incremental synchronization from filesystem events.
//!
//! Events are debounced per path: everything that arrives for a path within
//! the window collapses into one event carrying the most recent kind. The
//! [`IncrementalSynchronizer`] is the single consumer for a repository, so
//! two partial syncs of the same file never run at once.

mod watcher;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::pipeline::SyncReport;

pub use watcher::{FileWatcher, WatcherError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileEventKind {
    Created,
    Modified,
    Deleted,
}

impl fmt::Display for FileEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Modified => "modified",
            Self::Deleted => "deleted",
        };
        f.write_str(name)
    }
}

/// A change to one repository-relative path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEvent {
    pub path: String,
    pub kind: FileEventKind,
}

impl FileEvent {
    pub fn new(path: impl Into<String>, kind: FileEventKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }

    pub fn created(path: impl Into<String>) -> Self {
        Self::new(path, FileEventKind::Created)
    }

    pub fn modified(path: impl Into<String>) -> Self {
        Self::new(path, FileEventKind::Modified)
    }

    pub fn deleted(path: impl Into<String>) -> Self {
        Self::new(path, FileEventKind::Deleted)
    }
}

#[derive(Debug, Clone)]
struct Pending {
    kind: FileEventKind,
    last_seen: Instant,
    /// Arrival order of the first event for the path
    order: u64,
}

/// Per-path debounce state. Time is passed in, so it never sleeps.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    pending: HashMap<String, Pending>,
    next_order: u64,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
            next_order: 0,
        }
    }

    /// Record an event. A later event for the same path replaces the kind
    /// and restarts the path's quiet period.
    pub fn push(&mut self, event: FileEvent, now: Instant) {
        match self.pending.get_mut(&event.path) {
            Some(pending) => {
                pending.kind = event.kind;
                pending.last_seen = now;
            }
            None => {
                let order = self.next_order;
                self.next_order += 1;
                self.pending.insert(
                    event.path,
                    Pending {
                        kind: event.kind,
                        last_seen: now,
                        order,
                    },
                );
            }
        }
    }

    /// Events whose path has been quiet for the whole window, oldest first.
    pub fn drain_ready(&mut self, now: Instant) -> Vec<FileEvent> {
        let window = self.window;
        let ready: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.last_seen) >= window)
            .map(|(path, _)| path.clone())
            .collect();
        let mut drained: Vec<(u64, FileEvent)> = ready
            .into_iter()
            .filter_map(|path| {
                let pending = self.pending.remove(&path)?;
                Some((pending.order, FileEvent::new(path, pending.kind)))
            })
            .collect();
        drained.sort_by_key(|(order, _)| *order);
        drained.into_iter().map(|(_, event)| event).collect()
    }

    /// Every pending event, oldest first.
    pub fn drain_all(&mut self) -> Vec<FileEvent> {
        let mut drained: Vec<(u64, FileEvent)> = self
            .pending
            .drain()
            .map(|(path, p)| (p.order, FileEvent::new(path, p.kind)))
            .collect();
        drained.sort_by_key(|(order, _)| *order);
        drained.into_iter().map(|(_, event)| event).collect()
    }

    /// When the next pending event becomes ready.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending
            .values()
            .map(|p| p.last_seen + self.window)
            .min()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Whatever applies a debounced event.
#[async_trait]
pub trait SyncTarget: Send + Sync {
    async fn apply_event(&self, event: &FileEvent) -> Result<SyncReport>;
}

/// Counters for one synchronizer run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynchronizerStats {
    pub received: usize,
    pub applied: usize,
    pub failed: usize,
    /// Pending events dropped on cancellation
    pub dropped: usize,
}

/// Single consumer turning a stream of file events into partial syncs.
pub struct IncrementalSynchronizer<T: SyncTarget> {
    target: Arc<T>,
    window: Duration,
}

impl<T: SyncTarget> IncrementalSynchronizer<T> {
    pub fn new(target: Arc<T>, window: Duration) -> Self {
        Self { target, window }
    }

    /// Consume events until the channel closes or `cancel` fires.
    ///
    /// On close, pending events are flushed. On cancel, no new events are
    /// taken; an event already being applied runs to completion.
    pub async fn run(
        &self,
        mut events: mpsc::Receiver<FileEvent>,
        cancel: CancellationToken,
    ) -> SynchronizerStats {
        let mut debouncer = Debouncer::new(self.window);
        let mut stats = SynchronizerStats::default();
        info!("Incremental sync started with {:?} debounce", self.window);

        loop {
            let deadline = debouncer.next_deadline();
            let closed = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    stats.dropped = debouncer.len();
                    info!("Incremental sync cancelled, dropping {} pending events", stats.dropped);
                    break;
                }
                received = events.recv() => match received {
                    Some(event) => {
                        debug!("Received {} {}", event.kind, event.path);
                        stats.received += 1;
                        debouncer.push(event, Instant::now());
                        false
                    }
                    None => true,
                },
                _ = sleep_until(deadline), if deadline.is_some() => false,
            };

            let ready = if closed {
                debouncer.drain_all()
            } else {
                debouncer.drain_ready(Instant::now())
            };
            for event in ready {
                self.apply(&event, &mut stats).await;
            }
            if closed {
                break;
            }
        }

        info!(
            "Incremental sync stopped: {} received, {} applied, {} failed",
            stats.received, stats.applied, stats.failed
        );
        stats
    }

    async fn apply(&self, event: &FileEvent, stats: &mut SynchronizerStats) {
        match self.target.apply_event(event).await {
            Ok(report) if report.has_failures() => {
                warn!(
                    "Synced {} {} with {} failures",
                    event.kind,
                    event.path,
                    report.failures.len()
                );
                stats.failed += 1;
            }
            Ok(_) => {
                debug!("Synced {} {}", event.kind, event.path);
                stats.applied += 1;
            }
            Err(e) => {
                warn!("Failed to sync {} {}: {}", event.kind, event.path, e);
                stats.failed += 1;
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
