// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Hardlink primitives.
//!
//! Create, remove, and enumerate hardlinks in an identity-aware manner. The
//! [`LinkOperator`] never decides sameness by name: a destination folder
//! "already has" a file if any of its entries resolves to the same
//! [`FileIdentity`], whatever that entry is called.

use crate::{
    identity::{FileIdentity, IdentityError},
    native::{DirListing, EntryKind, LocalFs, NativeFs},
};

use std::{
    collections::HashSet,
    ffi::{OsStr, OsString},
    io,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, instrument};

/// Named link to some file data inside a folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEntry {
    pub name: OsString,
    pub path: PathBuf,
    pub identity: FileIdentity,
}

/// Every link to an identity found across a set of folders.
///
/// Derived on demand, never cached beyond the operation that computed it,
/// since any outside change to the filesystem can invalidate it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedFileSet {
    pub identity: FileIdentity,
    pub entries: Vec<LinkedEntry>,
}

impl LinkedFileSet {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Paths of every link in the set.
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.entries.iter().map(|entry| entry.path.as_path())
    }
}

/// Folder and filename pair of a linked file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedEntry {
    pub folder: PathBuf,
    pub name: OsString,
    pub path: PathBuf,
}

/// Report of every link to a file across searched folders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkReport {
    pub identity: FileIdentity,

    /// Link count reported by the filesystem, which includes links outside
    /// of the searched folders.
    pub link_count: u64,

    pub paths: Vec<PathBuf>,
}

/// Identity and volume aware hardlink operations.
#[derive(Debug)]
pub struct LinkOperator<F = LocalFs>
where
    F: NativeFs,
{
    fs: Arc<F>,
}

impl<F> Clone for LinkOperator<F>
where
    F: NativeFs,
{
    fn clone(&self) -> Self {
        Self {
            fs: Arc::clone(&self.fs),
        }
    }
}

impl<F> LinkOperator<F>
where
    F: NativeFs,
{
    /// Construct new link operator over native filesystem capabilities.
    pub fn new(fs: Arc<F>) -> Self {
        Self { fs }
    }

    /// Native filesystem capabilities in use.
    pub fn native(&self) -> &Arc<F> {
        &self.fs
    }

    /// Resolve identity of file at path.
    ///
    /// # Errors
    ///
    /// - Return [`LinkError::Identity`] if path has no linkable identity.
    pub fn identity_of(&self, path: impl AsRef<Path>) -> Result<FileIdentity> {
        Ok(self.fs.stat(path.as_ref())?.identity)
    }

    /// Create hardlink to `source` named `name` inside `dest_folder`.
    ///
    /// Creating a link that already exists under the same name is a no-op that
    /// returns the existing path.
    ///
    /// # Errors
    ///
    /// - Return [`LinkError::CrossVolume`] if source and destination live on
    ///   different volumes.
    /// - Return [`LinkError::AlreadyLinked`] if destination folder already
    ///   links the source identity under a different name.
    /// - Return [`LinkError::NameConflict`] if a different file occupies the
    ///   target name.
    /// - Return [`LinkError::DestinationMissing`] if destination folder does
    ///   not exist.
    /// - Return [`LinkError::PermissionDenied`] if the filesystem refuses.
    #[instrument(skip(self, source, dest_folder, name), level = "debug")]
    pub fn create_hardlink(
        &self,
        source: impl AsRef<Path>,
        dest_folder: impl AsRef<Path>,
        name: impl AsRef<OsStr>,
    ) -> Result<PathBuf> {
        let source = source.as_ref();
        let dest_folder = dest_folder.as_ref();
        let name = name.as_ref();
        let identity = self.identity_of(source)?;
        self.check_destination(dest_folder)?;

        // INVARIANT: Same name carrying same identity means nothing to do.
        let dest = dest_folder.join(name);
        if let Ok(existing) = self.fs.stat(&dest) {
            if existing.identity == identity {
                debug!("{:?} already links {identity}", dest.display());
                return Ok(dest);
            }
        }

        for entry in self.enumerate_links(dest_folder)?.flatten() {
            if entry.identity == identity && entry.name.as_os_str() != name {
                return Err(LinkError::AlreadyLinked {
                    existing: entry.path,
                });
            }
        }

        self.link_into(source, identity, dest_folder, name)
    }

    /// Create hardlink without scanning destination for the identity.
    ///
    /// Callers must have established that `dest_folder` does not link
    /// `identity` yet.
    pub(crate) fn link_into(
        &self,
        source: &Path,
        identity: FileIdentity,
        dest_folder: &Path,
        name: &OsStr,
    ) -> Result<PathBuf> {
        let dest = dest_folder.join(name);

        // INVARIANT: Reject cross-volume links before asking the filesystem.
        let source_volume = self.fs.volume_of(source)?;
        let dest_volume = self.fs.volume_of(dest_folder)?;
        if source_volume != dest_volume {
            return Err(LinkError::CrossVolume {
                source_path: source.to_path_buf(),
                dest: dest_folder.to_path_buf(),
            });
        }

        match self.fs.stat(&dest) {
            Ok(existing) if existing.identity == identity => return Ok(dest),
            Ok(_) | Err(IdentityError::NotAFile { .. }) => {
                return Err(LinkError::NameConflict { path: dest });
            }
            Err(_) => {}
        }

        self.fs
            .create_hardlink(source, &dest)
            .map_err(|err| match err.kind() {
                io::ErrorKind::AlreadyExists => LinkError::NameConflict { path: dest.clone() },
                io::ErrorKind::PermissionDenied => LinkError::PermissionDenied {
                    path: dest.clone(),
                },
                io::ErrorKind::NotFound => LinkError::DestinationMissing {
                    path: dest_folder.to_path_buf(),
                },
                _ => LinkError::Io {
                    source: err,
                    path: dest.clone(),
                },
            })?;
        debug!("linked {:?} -> {:?}", source.display(), dest.display());

        Ok(dest)
    }

    /// Remove one name of a file.
    ///
    /// Data persists while any other link to it remains.
    ///
    /// # Errors
    ///
    /// - Return [`LinkError::Identity`] with [`IdentityError::NotFound`] if
    ///   path does not exist.
    /// - Return [`LinkError::PermissionDenied`] if the filesystem refuses.
    #[instrument(skip(self, path), level = "debug")]
    pub fn remove_hardlink(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.fs.stat(path)?;
        self.fs.remove_link(path).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => LinkError::Identity(IdentityError::NotFound {
                path: path.to_path_buf(),
            }),
            io::ErrorKind::PermissionDenied => LinkError::PermissionDenied {
                path: path.to_path_buf(),
            },
            _ => LinkError::Io {
                source: err,
                path: path.to_path_buf(),
            },
        })?;
        debug!("removed link {:?}", path.display());

        Ok(())
    }

    /// Enumerate regular files of a folder with their identities.
    ///
    /// Lazy. Calling again restarts the scan from the top. Per-entry failures
    /// are yielded as errors without ending the scan. Directories and symlinks
    /// are skipped.
    ///
    /// # Errors
    ///
    /// - Return [`LinkError::DestinationMissing`] if folder does not exist.
    /// - Return [`LinkError::PermissionDenied`] if folder cannot be listed.
    pub fn enumerate_links(&self, folder: impl AsRef<Path>) -> Result<LinkEntries<F>> {
        let folder = folder.as_ref();
        let listing = self.fs.list_directory(folder).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => LinkError::DestinationMissing {
                path: folder.to_path_buf(),
            },
            io::ErrorKind::PermissionDenied => LinkError::PermissionDenied {
                path: folder.to_path_buf(),
            },
            _ => LinkError::Io {
                source: err,
                path: folder.to_path_buf(),
            },
        })?;

        Ok(LinkEntries {
            fs: Arc::clone(&self.fs),
            folder: folder.to_path_buf(),
            listing,
        })
    }

    /// Enumerate regular files of a folder tree with their identities.
    ///
    /// Same as [`LinkOperator::enumerate_links`], but descends into every
    /// subdirectory. Symlinked directories are not followed. A subdirectory
    /// that cannot be listed is yielded as an error and skipped.
    ///
    /// # Errors
    ///
    /// - Return [`LinkError::DestinationMissing`] if folder does not exist.
    /// - Return [`LinkError::PermissionDenied`] if folder cannot be listed.
    pub fn walk_links(&self, folder: impl AsRef<Path>) -> Result<LinkWalk<F>> {
        let root = self.enumerate_links(folder)?;
        Ok(LinkWalk {
            fs: root.fs,
            pending: vec![(root.folder, root.listing)],
        })
    }

    /// Compute every link to `identity` across `folders`.
    ///
    /// Folders that cannot be listed contribute nothing.
    pub fn linked_file_set(
        &self,
        identity: FileIdentity,
        folders: impl IntoIterator<Item = impl AsRef<Path>>,
    ) -> LinkedFileSet {
        let mut set = LinkedFileSet {
            identity,
            entries: Vec::new(),
        };

        for folder in folders {
            let folder = folder.as_ref();
            let entries = match self.enumerate_links(folder) {
                Ok(entries) => entries,
                Err(err) => {
                    debug!("skip {:?}: {err}", folder.display());
                    continue;
                }
            };

            for entry in entries.flatten() {
                if entry.identity == identity {
                    set.entries.push(LinkedEntry {
                        folder: folder.to_path_buf(),
                        name: entry.name,
                        path: entry.path,
                    });
                }
            }
        }

        set
    }

    /// Find every link to the file at `path` inside `folders`.
    ///
    /// # Errors
    ///
    /// - Return [`LinkError::Identity`] if path has no linkable identity.
    pub fn find_links(
        &self,
        path: impl AsRef<Path>,
        folders: impl IntoIterator<Item = impl AsRef<Path>>,
    ) -> Result<LinkReport> {
        let stat = self.fs.stat(path.as_ref())?;

        // INVARIANT: Overlapping folders must not report the same path twice.
        let mut seen = HashSet::new();
        let mut paths = self
            .linked_file_set(stat.identity, folders)
            .entries
            .into_iter()
            .map(|entry| entry.path)
            .filter(|path| seen.insert(path.clone()))
            .collect::<Vec<_>>();
        paths.sort();

        Ok(LinkReport {
            identity: stat.identity,
            link_count: stat.link_count,
            paths,
        })
    }

    fn check_destination(&self, folder: &Path) -> Result<()> {
        match self.fs.kind_of(folder) {
            Ok(EntryKind::Dir) => Ok(()),
            Ok(_) => Err(LinkError::NotADirectory {
                path: folder.to_path_buf(),
            }),
            Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                Err(LinkError::PermissionDenied {
                    path: folder.to_path_buf(),
                })
            }
            Err(_) => Err(LinkError::DestinationMissing {
                path: folder.to_path_buf(),
            }),
        }
    }
}

/// Lazy iterator over linkable entries of a folder.
pub struct LinkEntries<F = LocalFs>
where
    F: NativeFs,
{
    fs: Arc<F>,
    folder: PathBuf,
    listing: DirListing,
}

impl<F> LinkEntries<F>
where
    F: NativeFs,
{
    pub fn folder(&self) -> &Path {
        &self.folder
    }
}

impl<F> Iterator for LinkEntries<F>
where
    F: NativeFs,
{
    type Item = Result<LinkEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.listing.next()? {
                Ok(entry) => entry,
                Err(err) => {
                    return Some(Err(LinkError::from_io(err, &self.folder)));
                }
            };

            if entry.kind != EntryKind::File {
                continue;
            }

            return match self.fs.stat(&entry.path) {
                Ok(stat) => Some(Ok(LinkEntry {
                    name: entry.name,
                    path: entry.path,
                    identity: stat.identity,
                })),
                // INVARIANT: Entry vanished or changed kind between listing and stat.
                Err(IdentityError::NotFound { .. }) | Err(IdentityError::NotAFile { .. }) => {
                    continue;
                }
                Err(err) => Some(Err(err.into())),
            };
        }
    }
}

/// Lazy depth-first iterator over linkable entries of a folder tree.
pub struct LinkWalk<F = LocalFs>
where
    F: NativeFs,
{
    fs: Arc<F>,
    pending: Vec<(PathBuf, DirListing)>,
}

impl<F> Iterator for LinkWalk<F>
where
    F: NativeFs,
{
    type Item = Result<LinkEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (dir, listing) = self.pending.last_mut()?;
            let entry = match listing.next() {
                Some(Ok(entry)) => entry,
                Some(Err(err)) => return Some(Err(LinkError::from_io(err, dir))),
                None => {
                    self.pending.pop();
                    continue;
                }
            };

            match entry.kind {
                EntryKind::Dir => match self.fs.list_directory(&entry.path) {
                    Ok(listing) => self.pending.push((entry.path, listing)),
                    Err(err) => return Some(Err(LinkError::from_io(err, &entry.path))),
                },
                EntryKind::File => match self.fs.stat(&entry.path) {
                    Ok(stat) => {
                        return Some(Ok(LinkEntry {
                            name: entry.name,
                            path: entry.path,
                            identity: stat.identity,
                        }))
                    }
                    Err(IdentityError::NotFound { .. }) | Err(IdentityError::NotAFile { .. }) => {}
                    Err(err) => return Some(Err(err.into())),
                },
                EntryKind::Symlink | EntryKind::Other => {}
            }
        }
    }
}

/// Hardlink operation error types.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// Source cannot be resolved to a linkable identity.
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// Source and destination live on different volumes.
    #[error("cannot link {:?} into {:?} across volumes", source_path.display(), dest.display())]
    CrossVolume { source_path: PathBuf, dest: PathBuf },

    /// Destination folder already links the identity under another name.
    #[error("file is already linked at {:?}", existing.display())]
    AlreadyLinked { existing: PathBuf },

    /// A different file occupies the destination name.
    #[error("name {:?} is taken by a different file", path.display())]
    NameConflict { path: PathBuf },

    /// Destination folder does not exist.
    #[error("destination folder {:?} does not exist", path.display())]
    DestinationMissing { path: PathBuf },

    /// Destination is not a folder.
    #[error("destination {:?} is not a directory", path.display())]
    NotADirectory { path: PathBuf },

    /// Filesystem refused the operation.
    #[error("permission denied for {:?}", path.display())]
    PermissionDenied { path: PathBuf },

    /// Any other I/O failure.
    #[error("filesystem operation failed on {:?}", path.display())]
    Io {
        #[source]
        source: io::Error,
        path: PathBuf,
    },
}

impl LinkError {
    fn from_io(err: io::Error, path: &Path) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => Self::PermissionDenied {
                path: path.to_path_buf(),
            },
            _ => Self::Io {
                source: err,
                path: path.to_path_buf(),
            },
        }
    }
}

/// Friendly result alias :3
pub type Result<T, E = LinkError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;

    fn operator() -> LinkOperator {
        LinkOperator::new(Arc::new(LocalFs))
    }

    #[test]
    fn create_hardlink_links_same_data() -> anyhow::Result<()> {
        let a = tempfile::tempdir()?;
        let b = tempfile::tempdir()?;
        let source = a.path().join("x.pdf");
        fs::write(&source, b"pdf")?;

        let links = operator();
        let dest = links.create_hardlink(&source, b.path(), "x.pdf")?;

        assert_eq!(dest, b.path().join("x.pdf"));
        assert_eq!(links.identity_of(&dest)?, links.identity_of(&source)?);

        Ok(())
    }

    #[test]
    fn create_hardlink_is_idempotent_for_same_name() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let source = dir.path().join("x.pdf");
        fs::write(&source, b"pdf")?;

        let links = operator();
        let dest = links.create_hardlink(&source, dir.path(), "x.pdf")?;
        assert_eq!(dest, source);

        Ok(())
    }

    #[test]
    fn create_hardlink_detects_existing_link_under_other_name() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let source = dir.path().join("x.pdf");
        fs::write(&source, b"pdf")?;

        let result = operator().create_hardlink(&source, dir.path(), "y.pdf");
        assert!(matches!(result, Err(LinkError::AlreadyLinked { existing }) if existing == source));

        Ok(())
    }

    #[test]
    fn create_hardlink_rejects_name_taken_by_other_file() -> anyhow::Result<()> {
        let a = tempfile::tempdir()?;
        let b = tempfile::tempdir()?;
        let source = a.path().join("cover.jpg");
        fs::write(&source, b"one")?;
        fs::write(b.path().join("cover.jpg"), b"two")?;

        let result = operator().create_hardlink(&source, b.path(), "cover.jpg");
        assert!(matches!(result, Err(LinkError::NameConflict { .. })));

        Ok(())
    }

    #[test]
    fn create_hardlink_requires_destination() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let source = dir.path().join("x.pdf");
        fs::write(&source, b"pdf")?;

        let result = operator().create_hardlink(&source, dir.path().join("gone"), "x.pdf");
        assert!(matches!(result, Err(LinkError::DestinationMissing { .. })));

        Ok(())
    }

    #[test]
    fn remove_hardlink_keeps_other_links() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let source = dir.path().join("a.txt");
        let alias = dir.path().join("b.txt");
        fs::write(&source, b"data")?;
        fs::hard_link(&source, &alias)?;

        let links = operator();
        links.remove_hardlink(&source)?;
        assert!(!source.exists());
        assert_eq!(fs::read(&alias)?, b"data");

        let result = links.remove_hardlink(&source);
        assert!(matches!(
            result,
            Err(LinkError::Identity(IdentityError::NotFound { .. }))
        ));

        Ok(())
    }

    #[test]
    fn enumerate_links_skips_directories() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("a.txt"), b"a")?;
        fs::write(dir.path().join("b.txt"), b"b")?;
        fs::create_dir(dir.path().join("nested"))?;

        let links = operator();
        let mut names = links
            .enumerate_links(dir.path())?
            .map(|entry| entry.map(|entry| entry.name))
            .collect::<Result<Vec<_>>>()?;
        names.sort();
        assert_eq!(names, vec![OsString::from("a.txt"), OsString::from("b.txt")]);

        // Restartable by enumerating again.
        assert_eq!(links.enumerate_links(dir.path())?.count(), 2);

        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn walk_links_descends_without_following_symlinks() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path().canonicalize()?;
        fs::create_dir_all(root.join("tree/deeper"))?;
        fs::write(root.join("tree/top.txt"), b"t")?;
        fs::write(root.join("tree/deeper/bottom.txt"), b"b")?;
        fs::write(root.join("outside.txt"), b"o")?;
        std::os::unix::fs::symlink(&root, root.join("tree/loop"))?;

        let mut paths = operator()
            .walk_links(root.join("tree"))?
            .map(|entry| entry.map(|entry| entry.path))
            .collect::<Result<Vec<_>>>()?;
        paths.sort();
        assert_eq!(
            paths,
            vec![root.join("tree/deeper/bottom.txt"), root.join("tree/top.txt")]
        );

        Ok(())
    }

    #[test]
    fn find_links_reports_all_names() -> anyhow::Result<()> {
        let a = tempfile::tempdir()?;
        let b = tempfile::tempdir()?;
        let source = a.path().join("x.pdf");
        fs::write(&source, b"pdf")?;
        fs::hard_link(&source, b.path().join("x-copy.pdf"))?;
        fs::write(b.path().join("other.pdf"), b"other")?;

        let report = operator().find_links(&source, [a.path(), b.path(), a.path()])?;
        let mut expect = vec![source.clone(), b.path().join("x-copy.pdf")];
        expect.sort();

        assert_eq!(report.paths, expect);
        assert_eq!(report.link_count, 2);

        Ok(())
    }
}
