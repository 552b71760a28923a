//! Turning bursts of file changes into reload notifications.
//!
//! Changes flow from the watcher into a [`ReloadGate`], which waits for the
//! burst to settle (debounce), keeps a minimum spacing between notifications
//! (throttle), optionally waits a little longer (delay) and then publishes a
//! single [`LiveMessage`] through the [`Broadcaster`] to every connected
//! browser.

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use serde::Serialize;
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
    time::{Instant, sleep, timeout_at},
};

use crate::{
    config::{ServerConfiguration, WatchEvent},
    watcher::{ChangeEvent, ChangeStream},
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum LiveMessage {
    Reload,
    /// Swap the listed stylesheets in place without reloading the page.
    Inject { paths: Vec<String> },
}

/// Fan-out of [`LiveMessage`]s to every connected client.
#[derive(Clone)]
pub struct Broadcaster {
    sender: broadcast::Sender<LiveMessage>,
    clients: Arc<AtomicUsize>,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            clients: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        self.clients.fetch_add(1, Ordering::SeqCst);
        Subscription {
            receiver: self.sender.subscribe(),
            clients: Arc::clone(&self.clients),
        }
    }

    /// Returns how many clients the message was queued for.
    pub fn send(&self, message: LiveMessage) -> usize {
        self.sender.send(message).unwrap_or(0)
    }

    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::SeqCst)
    }
}

/// One client's view of the broadcast. Dropping it unregisters the client.
pub struct Subscription {
    receiver: broadcast::Receiver<LiveMessage>,
    clients: Arc<AtomicUsize>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<LiveMessage> {
        loop {
            match self.receiver.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "client fell behind, skipping stale messages");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.clients.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReloadTiming {
    pub delay: Duration,
    pub debounce: Duration,
    pub throttle: Duration,
}

/// Collapses change bursts into at most one notification per settled window.
///
/// Debounce is trailing edge and global: the window closes once no change has
/// arrived for `debounce`, regardless of which client or file it concerns.
pub struct ReloadGate {
    root: PathBuf,
    timing: ReloadTiming,
    inject_css: bool,
    log_file_changes: bool,
    broadcaster: Broadcaster,
}

impl ReloadGate {
    pub fn new(root: PathBuf, config: &ServerConfiguration, broadcaster: Broadcaster) -> Self {
        let browser = config.browser();
        Self {
            root,
            timing: ReloadTiming {
                delay: browser.reload_delay(),
                debounce: browser.reload_debounce(),
                throttle: browser.reload_throttle(),
            },
            inject_css: browser.inject_changes,
            log_file_changes: config.logging().log_file_changes,
            broadcaster,
        }
    }

    pub fn with_timing(mut self, timing: ReloadTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn spawn(self, changes: ChangeStream) -> JoinHandle<()> {
        tokio::spawn(self.run(changes))
    }

    pub async fn run(self, mut changes: ChangeStream) {
        let mut last_sent: Option<Instant> = None;

        while let Some(first) = changes.recv().await {
            let mut batch = Batch::default();
            self.record(&mut batch, first);

            let mut open = self.settle(&mut changes, &mut batch).await;

            if let Some(last) = last_sent {
                let ready_at = last + self.timing.throttle;
                if open && Instant::now() < ready_at {
                    open = self.collect_until(&mut changes, &mut batch, ready_at).await;
                }
            }

            if !self.timing.delay.is_zero() {
                sleep(self.timing.delay).await;
            }

            let message = batch.into_message(self.inject_css);
            let clients = self.broadcaster.send(message.clone());
            tracing::debug!(?message, clients, "sent live message");
            last_sent = Some(Instant::now());

            if !open {
                break;
            }
        }
    }

    /// Wait until no change has arrived for one debounce period.
    /// Returns `false` once the change stream has closed.
    async fn settle(&self, changes: &mut ChangeStream, batch: &mut Batch) -> bool {
        if self.timing.debounce.is_zero() {
            return self.drain_ready(changes, batch);
        }

        loop {
            let quiet_at = Instant::now() + self.timing.debounce;
            match timeout_at(quiet_at, changes.recv()).await {
                Ok(Some(change)) => self.record(batch, change),
                Ok(None) => return false,
                Err(_) => return true,
            }
        }
    }

    async fn collect_until(
        &self,
        changes: &mut ChangeStream,
        batch: &mut Batch,
        deadline: Instant,
    ) -> bool {
        loop {
            match timeout_at(deadline, changes.recv()).await {
                Ok(Some(change)) => self.record(batch, change),
                Ok(None) => return false,
                Err(_) => return true,
            }
        }
    }

    fn drain_ready(&self, changes: &mut ChangeStream, batch: &mut Batch) -> bool {
        loop {
            match changes.try_recv() {
                Ok(change) => self.record(batch, change),
                Err(mpsc::error::TryRecvError::Empty) => return true,
                Err(mpsc::error::TryRecvError::Disconnected) => return false,
            }
        }
    }

    fn record(&self, batch: &mut Batch, change: ChangeEvent) {
        if change.is_whole_tree(&self.root) {
            batch.force_reload = true;
            return;
        }

        if self.log_file_changes {
            tracing::info!(event = ?change.kind, path = %change.path.display(), "file changed");
        } else {
            tracing::debug!(event = ?change.kind, path = %change.path.display(), "file changed");
        }

        match to_web_path(&self.root, &change.path) {
            Some(web_path) => {
                batch.all_css &= change.kind != WatchEvent::Unlink && is_css(&change.path);
                batch.paths.insert(web_path);
            }
            None => batch.force_reload = true,
        }
    }
}

struct Batch {
    paths: BTreeSet<String>,
    all_css: bool,
    force_reload: bool,
}

impl Default for Batch {
    fn default() -> Self {
        Self {
            paths: BTreeSet::new(),
            all_css: true,
            force_reload: false,
        }
    }
}

impl Batch {
    fn into_message(self, inject_css: bool) -> LiveMessage {
        if inject_css && self.all_css && !self.force_reload && !self.paths.is_empty() {
            LiveMessage::Inject {
                paths: self.paths.into_iter().collect(),
            }
        } else {
            LiveMessage::Reload
        }
    }
}

fn is_css(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("css"))
        .unwrap_or(false)
}

/// URL path of `path` as served from `root`, e.g. `/css/site.css`.
pub fn to_web_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let rel_str = relative.to_string_lossy().replace('\\', "/");
    Some(format!("/{}", rel_str.trim_start_matches('/')))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const ROOT: &str = "/site";

    fn change(kind: WatchEvent, rel: &str) -> ChangeEvent {
        ChangeEvent {
            kind,
            path: Path::new(ROOT).join(rel),
        }
    }

    fn gate(broadcaster: &Broadcaster, debounce_ms: u64, throttle_ms: u64) -> ReloadGate {
        let config = ServerConfiguration::builder(ROOT).build();
        ReloadGate::new(PathBuf::from(ROOT), &config, broadcaster.clone()).with_timing(
            ReloadTiming {
                delay: Duration::ZERO,
                debounce: Duration::from_millis(debounce_ms),
                throttle: Duration::from_millis(throttle_ms),
            },
        )
    }

    #[test]
    fn inject_message_serializes_with_type_tag() {
        let message = LiveMessage::Inject {
            paths: vec!["/css/site.css".into()],
        };
        let json = serde_json::to_string(&message).unwrap();
        assert_eq!(json, r#"{"type":"inject","paths":["/css/site.css"]}"#);
        assert_eq!(
            serde_json::to_string(&LiveMessage::Reload).unwrap(),
            r#"{"type":"reload"}"#
        );
    }

    #[test]
    fn web_paths_are_rooted() {
        let root = Path::new(ROOT);
        assert_eq!(
            to_web_path(root, &root.join("css/site.css")).as_deref(),
            Some("/css/site.css")
        );
        assert_eq!(to_web_path(root, Path::new("/elsewhere/a.css")), None);
    }

    #[test]
    fn subscriptions_are_counted_until_dropped() {
        let broadcaster = Broadcaster::new(4);
        let first = broadcaster.subscribe();
        let second = broadcaster.subscribe();
        assert_eq!(broadcaster.client_count(), 2);

        drop(first);
        assert_eq!(broadcaster.client_count(), 1);
        drop(second);
        assert_eq!(broadcaster.client_count(), 0);
        assert_eq!(broadcaster.send(LiveMessage::Reload), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_inside_window_sends_one_reload() {
        let broadcaster = Broadcaster::new(16);
        let mut client = broadcaster.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = gate(&broadcaster, 500, 0).spawn(rx);

        for _ in 0..10 {
            tx.send(change(WatchEvent::Change, "index.html")).unwrap();
            sleep(Duration::from_millis(40)).await;
        }
        sleep(Duration::from_millis(600)).await;
        drop(tx);
        handle.await.unwrap();
        drop(broadcaster);

        assert_eq!(client.recv().await, Some(LiveMessage::Reload));
        assert_eq!(client.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_is_sent_before_the_burst_settles() {
        let broadcaster = Broadcaster::new(16);
        let mut client = broadcaster.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        let _handle = gate(&broadcaster, 500, 0).spawn(rx);

        tx.send(change(WatchEvent::Change, "app.js")).unwrap();
        sleep(Duration::from_millis(300)).await;
        tx.send(change(WatchEvent::Change, "app.js")).unwrap();
        sleep(Duration::from_millis(300)).await;

        let early = tokio::time::timeout(Duration::from_millis(1), client.recv()).await;
        assert!(early.is_err(), "sent before the window settled");

        sleep(Duration::from_millis(300)).await;
        assert_eq!(client.recv().await, Some(LiveMessage::Reload));
    }

    #[tokio::test(start_paused = true)]
    async fn stylesheet_only_windows_inject() {
        let broadcaster = Broadcaster::new(16);
        let mut client = broadcaster.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = gate(&broadcaster, 500, 0).spawn(rx);

        tx.send(change(WatchEvent::Change, "css/b.css")).unwrap();
        tx.send(change(WatchEvent::Change, "css/a.css")).unwrap();
        tx.send(change(WatchEvent::Change, "css/a.css")).unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(
            client.recv().await,
            Some(LiveMessage::Inject {
                paths: vec!["/css/a.css".into(), "/css/b.css".into()],
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn mixed_windows_reload() {
        let broadcaster = Broadcaster::new(16);
        let mut client = broadcaster.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = gate(&broadcaster, 500, 0).spawn(rx);

        tx.send(change(WatchEvent::Change, "css/a.css")).unwrap();
        tx.send(change(WatchEvent::Add, "index.html")).unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(client.recv().await, Some(LiveMessage::Reload));
    }

    #[tokio::test(start_paused = true)]
    async fn whole_tree_change_forces_reload() {
        let broadcaster = Broadcaster::new(16);
        let mut client = broadcaster.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = gate(&broadcaster, 0, 0).spawn(rx);

        tx.send(ChangeEvent {
            kind: WatchEvent::Change,
            path: PathBuf::from(ROOT),
        })
        .unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(client.recv().await, Some(LiveMessage::Reload));
    }

    #[tokio::test(start_paused = true)]
    async fn delay_postpones_the_settled_message() {
        let broadcaster = Broadcaster::new(16);
        let mut client = broadcaster.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        let config = ServerConfiguration::builder(ROOT).build();
        let _handle = ReloadGate::new(PathBuf::from(ROOT), &config, broadcaster.clone())
            .with_timing(ReloadTiming {
                delay: Duration::from_millis(200),
                debounce: Duration::ZERO,
                throttle: Duration::ZERO,
            })
            .spawn(rx);

        let sent_at = Instant::now();
        tx.send(change(WatchEvent::Change, "index.html")).unwrap();

        let early = tokio::time::timeout(Duration::from_millis(199), client.recv()).await;
        assert!(early.is_err(), "sent before the delay elapsed");

        assert_eq!(client.recv().await, Some(LiveMessage::Reload));
        assert!(Instant::now() - sent_at >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_spaces_out_notifications() {
        let broadcaster = Broadcaster::new(16);
        let mut client = broadcaster.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        let _handle = gate(&broadcaster, 0, 1_000).spawn(rx);

        tx.send(change(WatchEvent::Change, "index.html")).unwrap();
        assert_eq!(client.recv().await, Some(LiveMessage::Reload));
        let first_at = Instant::now();

        tx.send(change(WatchEvent::Change, "index.html")).unwrap();
        tx.send(change(WatchEvent::Change, "about.html")).unwrap();
        assert_eq!(client.recv().await, Some(LiveMessage::Reload));
        assert!(Instant::now() - first_at >= Duration::from_millis(1_000));

        let extra = tokio::time::timeout(Duration::from_millis(10), client.recv()).await;
        assert!(extra.is_err(), "throttled changes were not merged");
    }
}
