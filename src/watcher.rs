use std::{
    collections::BTreeSet,
    ffi::OsStr,
    path::{Component, Path, PathBuf},
};

use notify::{
    Event, RecommendedWatcher, RecursiveMode, Watcher,
    event::{CreateKind, EventKind, MetadataKind, ModifyKind, RemoveKind, RenameMode},
    recommended_watcher,
};
use tokio::sync::mpsc;
use walkdir::WalkDir;

use crate::{config::WatchEvent, error::StartupError};

/// Directory names that are never reported, wherever they appear.
const IGNORED_DIRS: &[&str] = &["node_modules", ".git"];

/// A single qualifying change under the serving root.
///
/// A `Change` on the root itself means the watcher lost track of what
/// happened (overflow, rescan, backend error) and everything should reload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: WatchEvent,
    pub path: PathBuf,
}

impl ChangeEvent {
    pub fn is_whole_tree(&self, root: &Path) -> bool {
        self.path == root
    }
}

pub type ChangeStream = mpsc::UnboundedReceiver<ChangeEvent>;

/// Watch `root` recursively, forwarding only the event types in `events`.
///
/// The returned watcher must be kept alive for as long as events are wanted.
pub fn watch(
    root: &Path,
    events: &BTreeSet<WatchEvent>,
) -> Result<(RecommendedWatcher, mpsc::UnboundedSender<ChangeEvent>, ChangeStream), StartupError>
{
    let (tx, rx) = mpsc::unbounded_channel();
    let callback_tx = tx.clone();
    let callback_root = root.to_path_buf();
    let accepted = events.clone();

    let mut watcher = recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            for change in translate(&callback_root, event) {
                if accepted.contains(&change.kind) || change.is_whole_tree(&callback_root) {
                    let _ = callback_tx.send(change);
                }
            }
        }
        Err(error) => {
            tracing::warn!(%error, "file watcher error, forcing reload");
            let _ = callback_tx.send(ChangeEvent {
                kind: WatchEvent::Change,
                path: callback_root.clone(),
            });
        }
    })
    .map_err(|source| StartupError::Watch {
        path: root.to_path_buf(),
        source,
    })?;

    watcher
        .watch(root, RecursiveMode::Recursive)
        .map_err(|source| StartupError::Watch {
            path: root.to_path_buf(),
            source,
        })?;

    Ok((watcher, tx, rx))
}

/// Report every file already under `root` as an addition.
///
/// Only used when initial files are not ignored, and silent unless `add`
/// is among the watched `events`. Returns how many were sent.
pub fn initial_scan(
    root: &Path,
    events: &BTreeSet<WatchEvent>,
    tx: &mpsc::UnboundedSender<ChangeEvent>,
) -> usize {
    if !events.contains(&WatchEvent::Add) {
        return 0;
    }

    let mut sent = 0;
    let entries = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !is_ignored_name(entry.file_name()));

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(error) => {
                tracing::debug!(%error, "skipping unreadable entry during initial scan");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let change = ChangeEvent {
            kind: WatchEvent::Add,
            path: entry.into_path(),
        };
        if tx.send(change).is_err() {
            break;
        }
        sent += 1;
    }

    sent
}

fn translate(root: &Path, event: Event) -> Vec<ChangeEvent> {
    if event.need_rescan() {
        return vec![ChangeEvent {
            kind: WatchEvent::Change,
            path: root.to_path_buf(),
        }];
    }

    if let EventKind::Modify(ModifyKind::Name(RenameMode::Both)) = event.kind {
        if let [from, to] = event.paths.as_slice() {
            return [(WatchEvent::Unlink, from), (WatchEvent::Add, to)]
                .into_iter()
                .filter(|(_, path)| is_reportable(root, path))
                .map(|(kind, path)| ChangeEvent {
                    kind,
                    path: path.clone(),
                })
                .collect();
        }
    }

    let Some(kind) = classify(&event.kind) else {
        return Vec::new();
    };

    event
        .paths
        .into_iter()
        .filter(|path| is_reportable(root, path))
        .filter(|path| kind == WatchEvent::Unlink || !path.is_dir())
        .map(|path| ChangeEvent { kind, path })
        .collect()
}

fn classify(kind: &EventKind) -> Option<WatchEvent> {
    match kind {
        EventKind::Create(CreateKind::Folder) => None,
        EventKind::Create(_) => Some(WatchEvent::Add),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => Some(WatchEvent::Unlink),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Some(WatchEvent::Add),
        EventKind::Modify(ModifyKind::Metadata(MetadataKind::Any | MetadataKind::WriteTime)) => {
            Some(WatchEvent::Change)
        }
        EventKind::Modify(ModifyKind::Metadata(_)) => None,
        EventKind::Modify(_) => Some(WatchEvent::Change),
        EventKind::Remove(RemoveKind::Folder) => None,
        EventKind::Remove(_) => Some(WatchEvent::Unlink),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => None,
    }
}

fn is_reportable(root: &Path, path: &Path) -> bool {
    let relative = path.strip_prefix(root).unwrap_or(path);
    !relative.components().any(|component| match component {
        Component::Normal(name) => is_ignored_name(name),
        _ => false,
    })
}

fn is_ignored_name(name: &OsStr) -> bool {
    name.to_str()
        .map(|name| IGNORED_DIRS.contains(&name))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, DataChange, Flag};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        let mut event = Event::new(kind);
        for path in paths {
            event = event.add_path(PathBuf::from(path));
        }
        event
    }

    #[test]
    fn creates_are_additions() {
        assert_eq!(
            classify(&EventKind::Create(CreateKind::File)),
            Some(WatchEvent::Add)
        );
        assert_eq!(classify(&EventKind::Create(CreateKind::Folder)), None);
    }

    #[test]
    fn data_writes_are_changes() {
        let kind = EventKind::Modify(ModifyKind::Data(DataChange::Content));
        assert_eq!(classify(&kind), Some(WatchEvent::Change));
    }

    #[test]
    fn permission_changes_are_ignored() {
        let kind = EventKind::Modify(ModifyKind::Metadata(MetadataKind::Permissions));
        assert_eq!(classify(&kind), None);
    }

    #[test]
    fn access_events_are_ignored() {
        assert_eq!(classify(&EventKind::Access(AccessKind::Read)), None);
    }

    #[test]
    fn removals_are_unlinks() {
        assert_eq!(
            classify(&EventKind::Remove(RemoveKind::File)),
            Some(WatchEvent::Unlink)
        );
    }

    #[test]
    fn rename_both_splits_into_unlink_and_add() {
        let root = Path::new("/site");
        let changes = translate(
            root,
            event(
                EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
                &["/site/.index.html.swp", "/site/index.html"],
            ),
        );

        assert_eq!(
            changes,
            vec![
                ChangeEvent {
                    kind: WatchEvent::Unlink,
                    path: PathBuf::from("/site/.index.html.swp"),
                },
                ChangeEvent {
                    kind: WatchEvent::Add,
                    path: PathBuf::from("/site/index.html"),
                },
            ]
        );
    }

    #[test]
    fn node_modules_and_git_are_not_reported() {
        let root = Path::new("/site");
        let kind = EventKind::Modify(ModifyKind::Data(DataChange::Any));
        let changes = translate(
            root,
            event(
                kind,
                &[
                    "/site/node_modules/pkg/index.js",
                    "/site/.git/HEAD",
                    "/site/app.js",
                ],
            ),
        );

        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path, PathBuf::from("/site/app.js"));
    }

    #[test]
    fn rescan_flag_means_whole_tree() {
        let root = Path::new("/site");
        let rescan = Event::new(EventKind::Other).set_flag(Flag::Rescan);
        let changes = translate(root, rescan);

        assert_eq!(changes.len(), 1);
        assert!(changes[0].is_whole_tree(root));
    }

    #[test]
    fn initial_scan_reports_files_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("css")).unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules/pkg")).unwrap();
        std::fs::write(dir.path().join("index.html"), "<p>hi</p>").unwrap();
        std::fs::write(dir.path().join("css/site.css"), "body{}").unwrap();
        std::fs::write(dir.path().join("node_modules/pkg/a.js"), "").unwrap();

        let events = BTreeSet::from([WatchEvent::Add, WatchEvent::Change]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert_eq!(initial_scan(dir.path(), &events, &tx), 2);

        let mut seen = Vec::new();
        while let Ok(change) = rx.try_recv() {
            assert_eq!(change.kind, WatchEvent::Add);
            seen.push(change.path);
        }
        seen.sort();
        assert_eq!(
            seen,
            vec![dir.path().join("css/site.css"), dir.path().join("index.html")]
        );
    }

    #[test]
    fn initial_scan_is_silent_without_add_events() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<p>hi</p>").unwrap();

        let events = BTreeSet::from([WatchEvent::Change]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert_eq!(initial_scan(dir.path(), &events, &tx), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn existing_files_are_silent_until_changed() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let page = root.join("index.html");
        std::fs::write(&page, "<p>before</p>").unwrap();

        let events = BTreeSet::from([WatchEvent::Add, WatchEvent::Change]);
        let (_watcher, _tx, mut rx) = watch(&root, &events).unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err(), "startup produced an event");

        std::fs::write(&page, "<p>after</p>").unwrap();
        let change = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no change reported")
            .expect("watcher channel closed");
        assert_eq!(change.path, page);
    }
}
