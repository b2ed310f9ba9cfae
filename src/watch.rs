// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Debounced mirror group watcher.
//!
//! Every enabled group gets a [`GroupWatcher`] made of three stages:
//!
//! 1. One native watch per member folder forwards raw changes into an
//!    unbounded channel, so the notification thread never waits on us.
//! 2. A debounce task coalesces raw changes per path and releases a path once
//!    it has been quiet for the debounce window.
//! 3. A single consumer task classifies each settled path by whether it still
//!    exists and hands the resulting [`WatchEvent`] to the [`SyncEngine`] on
//!    the blocking pool, one event at a time.
//!
//! The consumer keeps a name index of every member folder, so that a removed
//! name can still be mapped back to the identity it carried.

use crate::{
    identity::{FileIdentity, IdentityError},
    native::{LocalFs, NativeFs, RawChange},
    registry::{GroupId, MirrorGroup, RegistryError},
    sync::SyncEngine,
};

use std::{
    collections::HashMap,
    ffi::OsString,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

/// Default quiet period before a changed name is acted upon.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

const MAX_TICK: Duration = Duration::from_millis(100);

/// Debounced change of a single name inside a member folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// Name exists as a regular file once the window closed.
    Added {
        group_id: GroupId,
        folder: PathBuf,
        name: OsString,
    },

    /// Name no longer exists once the window closed.
    Removed {
        group_id: GroupId,
        folder: PathBuf,
        name: OsString,

        /// Identity the name carried when last seen, if it was ever seen.
        identity: Option<FileIdentity>,
    },
}

impl WatchEvent {
    pub fn group_id(&self) -> &GroupId {
        match self {
            Self::Added { group_id, .. } | Self::Removed { group_id, .. } => group_id,
        }
    }
}

/// Coalesce raw changes per path until each has been quiet for `window`.
///
/// Settled paths are sent to `settled` in the order their windows closed.
/// Returns when cancelled, or when either channel closes.
pub(crate) async fn debounce(
    mut raw: UnboundedReceiver<RawChange>,
    settled: UnboundedSender<PathBuf>,
    window: Duration,
    cancel: CancellationToken,
) {
    let tick = window.min(MAX_TICK).max(Duration::from_millis(1));
    let mut ticker = interval_at(Instant::now() + tick, tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_seen: HashMap<PathBuf, Instant> = HashMap::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            change = raw.recv() => match change {
                Some(RawChange { path }) => {
                    trace!("raw change {:?}", path.display());
                    last_seen.insert(path, Instant::now());
                }
                None => break,
            },
            _ = ticker.tick() => {
                let now = Instant::now();
                let mut quiet = last_seen
                    .iter()
                    .filter(|(_, seen)| now.duration_since(**seen) >= window)
                    .map(|(path, seen)| (*seen, path.clone()))
                    .collect::<Vec<_>>();
                quiet.sort();

                for (_, path) in quiet {
                    last_seen.remove(&path);
                    if settled.send(path).is_err() {
                        return;
                    }
                }
            }
        }
    }
}

/// Last known identity of every name in a group's member folders.
#[derive(Debug, Default)]
struct NameIndex {
    names: HashMap<PathBuf, FileIdentity>,
}

impl NameIndex {
    fn scan<F: NativeFs>(engine: &SyncEngine<F>, group: &MirrorGroup) -> Self {
        let mut index = Self::default();
        for folder in &group.folders {
            let entries = match engine.links().enumerate_links(folder) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!("cannot index {:?}: {err}", folder.display());
                    continue;
                }
            };

            for entry in entries.flatten() {
                index.names.insert(entry.path, entry.identity);
            }
        }

        index
    }

    /// Classify settled path by what is there now.
    fn classify<F: NativeFs>(
        &mut self,
        engine: &SyncEngine<F>,
        group_id: GroupId,
        path: PathBuf,
    ) -> Option<WatchEvent> {
        let folder = path.parent()?.to_path_buf();
        let name = path.file_name()?.to_os_string();

        match engine.links().native().stat(&path) {
            Ok(stat) => {
                self.names.insert(path, stat.identity);
                Some(WatchEvent::Added {
                    group_id,
                    folder,
                    name,
                })
            }
            Err(IdentityError::NotFound { .. }) => {
                let identity = self.names.remove(&path);
                Some(WatchEvent::Removed {
                    group_id,
                    folder,
                    name,
                    identity,
                })
            }
            Err(IdentityError::NotAFile { .. }) => {
                trace!("ignore non-file {:?}", path.display());
                None
            }
            Err(err) => {
                warn!("cannot classify {:?}: {err}", path.display());
                None
            }
        }
    }
}

/// Running watcher of one mirror group.
///
/// Stops when dropped.
pub struct GroupWatcher<F = LocalFs>
where
    F: NativeFs,
{
    group_id: GroupId,
    folders: Vec<PathBuf>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    _watches: Vec<F::Watch>,
}

impl<F> GroupWatcher<F>
where
    F: NativeFs,
{
    /// Start watching every member folder of group.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// - Return [`WatchError::Watch`] if any member folder cannot be watched.
    #[instrument(skip(engine, group), level = "debug")]
    pub fn spawn(
        engine: Arc<SyncEngine<F>>,
        group: &MirrorGroup,
        window: Duration,
    ) -> Result<Self> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (settled_tx, settled_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let mut watches = Vec::with_capacity(group.folders.len());
        for folder in &group.folders {
            let watch = engine
                .links()
                .native()
                .watch_directory(folder, raw_tx.clone())
                .map_err(|source| WatchError::Watch {
                    source,
                    path: folder.clone(),
                })?;
            watches.push(watch);
        }

        // INVARIANT: Index before any event is consumed, so deletions of files
        // that predate the watcher still know their identity.
        let index = NameIndex::scan(&engine, group);

        let debouncer = tokio::spawn(debounce(raw_rx, settled_tx, window, cancel.clone()));
        let consumer = tokio::spawn(consume(
            engine,
            group.id,
            index,
            settled_rx,
            cancel.clone(),
        ));
        info!("watching group {} ({} folders)", group.id, group.folders.len());

        Ok(Self {
            group_id: group.id,
            folders: group.folders.clone(),
            cancel,
            tasks: vec![debouncer, consumer],
            _watches: watches,
        })
    }

    pub fn group_id(&self) -> &GroupId {
        &self.group_id
    }

    pub fn folders(&self) -> &[PathBuf] {
        &self.folders
    }

    /// Stop watcher and wait for its tasks to finish.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        for task in std::mem::take(&mut self.tasks) {
            if let Err(err) = task.await {
                error!("watcher task of group {} failed: {err}", self.group_id);
            }
        }
        debug!("stopped watching group {}", self.group_id);
    }
}

impl<F> Drop for GroupWatcher<F>
where
    F: NativeFs,
{
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn consume<F: NativeFs>(
    engine: Arc<SyncEngine<F>>,
    group_id: GroupId,
    mut index: NameIndex,
    mut settled: UnboundedReceiver<PathBuf>,
    cancel: CancellationToken,
) {
    loop {
        let path = tokio::select! {
            _ = cancel.cancelled() => break,
            path = settled.recv() => match path {
                Some(path) => path,
                None => break,
            },
        };

        let Some(event) = index.classify(&engine, group_id, path) else {
            continue;
        };
        debug!("settled {event:?}");

        let worker = Arc::clone(&engine);
        let token = cancel.clone();
        match tokio::task::spawn_blocking(move || worker.handle(event, &token)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("group {group_id}: {err}"),
            Err(err) => error!("engine task of group {group_id} failed: {err}"),
        }
    }
}

/// Keeps one [`GroupWatcher`] per enabled group of the registry.
pub struct Watchers<F = LocalFs>
where
    F: NativeFs,
{
    engine: Arc<SyncEngine<F>>,
    window: Duration,
    active: HashMap<GroupId, GroupWatcher<F>>,
}

impl<F> Watchers<F>
where
    F: NativeFs,
{
    pub fn new(engine: Arc<SyncEngine<F>>, window: Duration) -> Self {
        Self {
            engine,
            window,
            active: HashMap::new(),
        }
    }

    /// Start, restart, or stop watchers to match the persisted registry.
    ///
    /// The registry is reloaded first, so groups created, edited, or toggled
    /// by other processes are picked up. A group whose watcher cannot be started is logged and skipped, so one
    /// unreachable folder does not keep other groups unwatched.
    ///
    /// # Errors
    ///
    /// - Return [`WatchError::Registry`] if the persisted registry is
    ///   corrupt.
    pub async fn sync_with_registry(&mut self) -> Result<()> {
        if self.engine.registry().reload()? {
            debug!("registry changed on disk");
        }
        let groups = self
            .engine
            .registry()
            .groups()
            .into_iter()
            .filter(|group| group.watch_enabled)
            .map(|group| (group.id, group))
            .collect::<HashMap<_, _>>();

        let stale = self
            .active
            .iter()
            .filter(|(id, watcher)| {
                groups
                    .get(*id)
                    .map_or(true, |group| group.folders != watcher.folders)
            })
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        for id in stale {
            if let Some(watcher) = self.active.remove(&id) {
                watcher.stop().await;
            }
        }

        for (id, group) in groups {
            if self.active.contains_key(&id) {
                continue;
            }

            match GroupWatcher::spawn(Arc::clone(&self.engine), &group, self.window) {
                Ok(watcher) => {
                    self.active.insert(id, watcher);
                }
                Err(err) => error!("cannot watch group {id}: {err}"),
            }
        }

        Ok(())
    }

    /// Identifiers of groups currently watched.
    pub fn active(&self) -> impl Iterator<Item = &GroupId> {
        self.active.keys()
    }

    /// Stop every watcher.
    pub async fn shutdown(mut self) {
        for (_, watcher) in self.active.drain() {
            watcher.stop().await;
        }
    }
}

/// Watcher error types.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// Folder cannot be watched.
    #[error("failed to watch {:?}", path.display())]
    Watch {
        #[source]
        source: notify::Error,
        path: PathBuf,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Friendly result alias :3
pub type Result<T, E = WatchError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tokio::time::sleep;

    fn change(path: &str) -> RawChange {
        RawChange {
            path: PathBuf::from(path),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_coalesces_bursts_per_path() {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (settled_tx, mut settled_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(debounce(
            raw_rx,
            settled_tx,
            Duration::from_millis(500),
            cancel.clone(),
        ));

        // A slow copy keeps touching the same name.
        for _ in 0..5 {
            raw_tx.send(change("/A/big.iso")).unwrap();
            sleep(Duration::from_millis(200)).await;
        }
        raw_tx.send(change("/A/small.txt")).unwrap();

        sleep(Duration::from_millis(450)).await;
        assert_eq!(settled_rx.try_recv().ok(), Some(PathBuf::from("/A/big.iso")));
        assert!(settled_rx.try_recv().is_err());

        sleep(Duration::from_millis(200)).await;
        assert_eq!(settled_rx.try_recv().ok(), Some(PathBuf::from("/A/small.txt")));
        assert!(settled_rx.try_recv().is_err());

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_stops_when_source_closes() {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel::<RawChange>();
        let (settled_tx, _settled_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(debounce(
            raw_rx,
            settled_tx,
            Duration::from_millis(50),
            CancellationToken::new(),
        ));

        drop(raw_tx);
        task.await.unwrap();
    }

    #[test]
    fn classify_uses_last_known_identity_for_removals() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let a = root.path().join("A");
        let b = root.path().join("B");
        fs::create_dir_all(&a)?;
        fs::create_dir_all(&b)?;
        let a = a.canonicalize()?;
        let b = b.canonicalize()?;
        fs::write(a.join("x.pdf"), b"pdf")?;
        let identity = FileIdentity::resolve(a.join("x.pdf"))?;

        let registry = Arc::new(Registry::open(root.path().join("mirror_groups.toml"))?);
        let group = registry.create_group([&a, &b], None, true)?;
        let engine = SyncEngine::local(registry);
        let mut index = NameIndex::scan(&engine, &group);

        fs::remove_file(a.join("x.pdf"))?;
        let event = index.classify(&engine, group.id, a.join("x.pdf"));
        assert_eq!(
            event,
            Some(WatchEvent::Removed {
                group_id: group.id,
                folder: a.clone(),
                name: "x.pdf".into(),
                identity: Some(identity),
            })
        );

        fs::create_dir(a.join("nested"))?;
        assert_eq!(index.classify(&engine, group.id, a.join("nested")), None);

        fs::write(b.join("y.pdf"), b"y")?;
        let event = index.classify(&engine, group.id, b.join("y.pdf"));
        assert!(matches!(event, Some(WatchEvent::Added { ref name, .. }) if name == "y.pdf"));

        Ok(())
    }
}
