// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Native filesystem capabilities.
//!
//! The synchronization core never talks to the operating system directly.
//! Everything it needs from the filesystem goes through [`NativeFs`]: stat a
//! file for its identity, create a hardlink, remove a link, list a directory,
//! read a file, and watch a directory for changes. [`LocalFs`] implements the
//! contract with the standard library and [`notify`].

use crate::identity::{FileStat, IdentityError};

use notify::{
    event::{AccessKind, AccessMode},
    Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use std::{
    ffi::OsString,
    fs, io,
    path::{Path, PathBuf},
};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{error, trace, warn};

/// Raw change notification for a path inside a watched directory.
///
/// Carries no classification. Whether the path was added or removed is
/// decided later by looking at the filesystem once the path settles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChange {
    pub path: PathBuf,
}

/// Kind of a directory entry, as reported without following symlinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
    Other,
}

/// Single entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryInfo {
    pub name: OsString,
    pub path: PathBuf,
    pub kind: EntryKind,
}

/// Lazy directory listing.
pub type DirListing = Box<dyn Iterator<Item = io::Result<DirEntryInfo>> + Send>;

/// Reader over the data of a regular file.
pub type FileReader = Box<dyn io::Read + Send>;

/// Filesystem capabilities consumed by the synchronization core.
pub trait NativeFs: Send + Sync + 'static {
    /// Handle that keeps a directory watch alive until dropped.
    type Watch: Send + 'static;

    /// Stat regular file without following symlinks.
    fn stat(&self, path: &Path) -> Result<FileStat, IdentityError>;

    /// Determine volume identifier of path, or of its parent if missing.
    fn volume_of(&self, path: &Path) -> Result<u64, IdentityError>;

    /// Determine kind of entry at path, following symlinks.
    fn kind_of(&self, path: &Path) -> io::Result<EntryKind>;

    /// Create new name `dest` for file data at `source`.
    fn create_hardlink(&self, source: &Path, dest: &Path) -> io::Result<()>;

    /// Remove one name of a file.
    fn remove_link(&self, path: &Path) -> io::Result<()>;

    /// List entries of a directory lazily.
    fn list_directory(&self, path: &Path) -> io::Result<DirListing>;

    /// Open regular file for reading its data.
    fn open_file(&self, path: &Path) -> io::Result<FileReader>;

    /// Watch top-level entries of a directory, forwarding changes to `sink`.
    ///
    /// The forwarding side must never block.
    fn watch_directory(
        &self,
        path: &Path,
        sink: UnboundedSender<RawChange>,
    ) -> Result<Self::Watch, notify::Error>;
}

/// Native capabilities backed by the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFs;

impl LocalFs {
    pub fn new() -> Self {
        Self
    }
}

impl NativeFs for LocalFs {
    type Watch = RecommendedWatcher;

    fn stat(&self, path: &Path) -> Result<FileStat, IdentityError> {
        FileStat::of(path)
    }

    fn volume_of(&self, path: &Path) -> Result<u64, IdentityError> {
        crate::identity::volume_of(path)
    }

    fn kind_of(&self, path: &Path) -> io::Result<EntryKind> {
        Ok(entry_kind(fs::metadata(path)?.file_type()))
    }

    fn create_hardlink(&self, source: &Path, dest: &Path) -> io::Result<()> {
        fs::hard_link(source, dest)
    }

    fn remove_link(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn list_directory(&self, path: &Path) -> io::Result<DirListing> {
        let entries = fs::read_dir(path)?.map(|entry| {
            let entry = entry?;
            Ok(DirEntryInfo {
                name: entry.file_name(),
                path: entry.path(),
                kind: entry_kind(entry.file_type()?),
            })
        });

        Ok(Box::new(entries))
    }

    fn open_file(&self, path: &Path) -> io::Result<FileReader> {
        Ok(Box::new(fs::File::open(path)?))
    }

    fn watch_directory(
        &self,
        path: &Path,
        sink: UnboundedSender<RawChange>,
    ) -> Result<Self::Watch, notify::Error> {
        let folder = path.to_path_buf();
        let mut watcher = RecommendedWatcher::new(
            move |result: notify::Result<Event>| match result {
                Ok(event) => {
                    if !is_relevant(&event.kind) {
                        trace!("ignore event {:?}", event.kind);
                        return;
                    }

                    // INVARIANT: Only forward direct children of the watched folder.
                    for path in event.paths {
                        if path.parent() != Some(folder.as_path()) {
                            continue;
                        }

                        // Unbounded, so this never blocks the notification thread.
                        if sink.send(RawChange { path }).is_err() {
                            error!("watch channel for {:?} closed", folder.display());
                            return;
                        }
                    }
                }
                Err(err) => warn!("watch error on {:?}: {err}", folder.display()),
            },
            Config::default(),
        )?;
        watcher.watch(path, RecursiveMode::NonRecursive)?;

        Ok(watcher)
    }
}

fn entry_kind(file_type: fs::FileType) -> EntryKind {
    if file_type.is_symlink() {
        EntryKind::Symlink
    } else if file_type.is_dir() {
        EntryKind::Dir
    } else if file_type.is_file() {
        EntryKind::File
    } else {
        EntryKind::Other
    }
}

fn is_relevant(kind: &EventKind) -> bool {
    match kind {
        EventKind::Create(_) | EventKind::Remove(_) | EventKind::Modify(_) | EventKind::Any => {
            true
        }
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, RemoveKind};
    use pretty_assertions::assert_eq;

    #[test]
    fn local_listing_reports_entry_kinds() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("file.txt"), b"x")?;
        fs::create_dir(dir.path().join("nested"))?;

        let mut entries = LocalFs
            .list_directory(dir.path())?
            .collect::<io::Result<Vec<_>>>()?;
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        let kinds = entries.iter().map(|e| e.kind).collect::<Vec<_>>();
        assert_eq!(kinds, vec![EntryKind::File, EntryKind::Dir]);

        Ok(())
    }

    #[test]
    fn access_events_are_ignored_except_close_write() {
        assert!(is_relevant(&EventKind::Create(CreateKind::File)));
        assert!(is_relevant(&EventKind::Remove(RemoveKind::File)));
        assert!(is_relevant(&EventKind::Access(AccessKind::Close(
            AccessMode::Write
        ))));
        assert!(!is_relevant(&EventKind::Access(AccessKind::Read)));
    }
}
