//! Knowledge-base file watching with debouncing.
//!
//! [`FileWatcher`] forwards filesystem events for supported, non-hidden
//! files into a channel; the notify callback only converts and sends, so the
//! event-delivery thread never blocks on an update. [`run_debounced`] drains
//! that channel and fires once per burst: each event restarts the quiet
//! window, and the callback runs only after a full window with no events.
//! Events arriving while the callback runs are queued and form the next burst.

use anyhow::{Context, Result};
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::loader::supported_extension;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum WatchEvent {
    Created(PathBuf),
    Modified(PathBuf),
    Deleted(PathBuf),
}

impl WatchEvent {
    pub fn path(&self) -> &Path {
        match self {
            WatchEvent::Created(p) | WatchEvent::Modified(p) | WatchEvent::Deleted(p) => p,
        }
    }
}

/// Recursive watch on the knowledge-base root. Dropping it stops the watch.
pub struct FileWatcher {
    _watcher: RecommendedWatcher,
}

impl FileWatcher {
    pub fn start(root: &Path, tx: mpsc::UnboundedSender<WatchEvent>) -> Result<Self> {
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
            match result {
                Ok(event) => {
                    for converted in convert_event(&event) {
                        if tx.send(converted).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => error!("Watch error: {e}"),
            }
        })
        .context("create file watcher")?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .with_context(|| format!("watch {}", root.display()))?;
        info!(root = %root.display(), "watching knowledge base");

        Ok(Self { _watcher: watcher })
    }
}

fn is_relevant(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .is_some_and(|name| name.to_string_lossy().starts_with('.'));
    !hidden && supported_extension(path).is_some()
}

/// Map a notify event to zero or more watch events. A rename is a delete of
/// the old path plus a create of the new one.
pub(crate) fn convert_event(event: &notify::Event) -> Vec<WatchEvent> {
    let converted = match &event.kind {
        EventKind::Create(_) => event.paths.iter().cloned().map(WatchEvent::Created).collect(),
        EventKind::Remove(_) => event.paths.iter().cloned().map(WatchEvent::Deleted).collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() >= 2 => vec![
            WatchEvent::Deleted(event.paths[0].clone()),
            WatchEvent::Created(event.paths[1].clone()),
        ],
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            event.paths.iter().cloned().map(WatchEvent::Deleted).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            event.paths.iter().cloned().map(WatchEvent::Created).collect()
        }
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Modify(_) => event.paths.iter().cloned().map(WatchEvent::Modified).collect(),
        _ => Vec::new(),
    };

    converted
        .into_iter()
        .filter(|e: &WatchEvent| is_relevant(e.path()))
        .collect()
}

/// Events gathered during one burst.
#[derive(Debug, Default, Clone)]
pub struct PendingBatch {
    events: BTreeSet<WatchEvent>,
}

impl PendingBatch {
    pub fn record(&mut self, event: WatchEvent) {
        debug!(?event, "file change");
        self.events.insert(event);
    }

    /// Number of distinct (kind, path) events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn paths(&self) -> BTreeSet<&Path> {
        self.events.iter().map(|e| e.path()).collect()
    }
}

/// Drain `rx`, invoking `on_batch` once after each burst goes quiet for `window`.
///
/// Returns when the channel closes, flushing any pending burst first.
pub async fn run_debounced<F, Fut>(
    mut rx: mpsc::UnboundedReceiver<WatchEvent>,
    window: Duration,
    mut on_batch: F,
) where
    F: FnMut(PendingBatch) -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        let Some(first) = rx.recv().await else {
            return;
        };
        let mut batch = PendingBatch::default();
        batch.record(first);

        let closed = loop {
            match tokio::time::timeout(window, rx.recv()).await {
                Ok(Some(event)) => batch.record(event),
                Ok(None) => break true,
                Err(_) => break false,
            }
        };

        info!(events = batch.len(), "file changes settled");
        on_batch(batch).await;
        if closed {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, RemoveKind};
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    fn make_event(kind: EventKind, paths: &[&str]) -> notify::Event {
        paths
            .iter()
            .fold(notify::Event::new(kind), |event, p| event.add_path(PathBuf::from(p)))
    }

    #[test]
    fn test_convert_event_create_modify_delete() {
        let created = convert_event(&make_event(EventKind::Create(CreateKind::File), &["/kb/a.md"]));
        assert_eq!(created, vec![WatchEvent::Created("/kb/a.md".into())]);

        let modified = convert_event(&make_event(
            EventKind::Modify(ModifyKind::Data(DataChange::Any)),
            &["/kb/a.md"],
        ));
        assert_eq!(modified, vec![WatchEvent::Modified("/kb/a.md".into())]);

        let deleted = convert_event(&make_event(EventKind::Remove(RemoveKind::File), &["/kb/a.pdf"]));
        assert_eq!(deleted, vec![WatchEvent::Deleted("/kb/a.pdf".into())]);
    }

    #[test]
    fn test_rename_is_delete_plus_create() {
        let events = convert_event(&make_event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/kb/old.md", "/kb/new.md"],
        ));
        assert_eq!(
            events,
            vec![
                WatchEvent::Deleted("/kb/old.md".into()),
                WatchEvent::Created("/kb/new.md".into()),
            ]
        );
    }

    #[test]
    fn test_hidden_and_unsupported_skipped() {
        assert!(convert_event(&make_event(EventKind::Create(CreateKind::File), &["/kb/.draft.md"])).is_empty());
        assert!(convert_event(&make_event(EventKind::Create(CreateKind::File), &["/kb/notes.txt"])).is_empty());
        assert!(convert_event(&make_event(EventKind::Create(CreateKind::Folder), &["/kb/sub"])).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn burst_within_window_fires_once_after_quiet() {
        let window = Duration::from_secs(30);
        let (tx, rx) = mpsc::unbounded_channel();
        let fired: Arc<Mutex<Vec<(Instant, usize)>>> = Arc::default();

        let sink = Arc::clone(&fired);
        let task = tokio::spawn(run_debounced(rx, window, move |batch| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push((Instant::now(), batch.len()));
            }
        }));

        let mut last_event = Instant::now();
        for i in 0..5 {
            tx.send(WatchEvent::Modified(PathBuf::from(format!("/kb/{i}.md"))))
                .unwrap();
            last_event = Instant::now();
            tokio::time::sleep(Duration::from_secs(10)).await;
        }
        tokio::time::sleep(Duration::from_secs(60)).await;

        drop(tx);
        task.await.unwrap();

        let fired = fired.lock().unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].1, 5);
        assert!(fired[0].0 - last_event >= window);
    }

    #[tokio::test(start_paused = true)]
    async fn separate_bursts_fire_separately() {
        let (tx, rx) = mpsc::unbounded_channel();
        let count = Arc::new(Mutex::new(0usize));

        let sink = Arc::clone(&count);
        let task = tokio::spawn(run_debounced(rx, Duration::from_secs(5), move |_batch| {
            let sink = Arc::clone(&sink);
            async move {
                *sink.lock().unwrap() += 1;
            }
        }));

        tx.send(WatchEvent::Created("/kb/a.md".into())).unwrap();
        tx.send(WatchEvent::Created("/kb/a.md".into())).unwrap();
        tokio::time::sleep(Duration::from_secs(20)).await;
        tx.send(WatchEvent::Deleted("/kb/a.md".into())).unwrap();
        tokio::time::sleep(Duration::from_secs(20)).await;

        drop(tx);
        task.await.unwrap();
        assert_eq!(*count.lock().unwrap(), 2);
    }
}
