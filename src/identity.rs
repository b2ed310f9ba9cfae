// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! File identity resolution.
//!
//! Two directory entries name the same file data if and only if they share a
//! __file identity__: the pair of volume identifier and file index (inode on
//! Unix, file index on Windows). Names are never used to decide sameness,
//! because mirrored folders may legitimately carry different names for the
//! same linked data.
//!
//! A file identity is only meaningful on the volume it was computed on.
//! Hardlinks cannot cross volumes, so [`same_volume`] must be consulted before
//! any link is attempted.

use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    fs,
    io,
    path::{Path, PathBuf},
};

/// Durable identity of file data within one volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileIdentity {
    volume_id: u64,
    file_index: u64,
}

impl FileIdentity {
    /// Construct new file identity from raw parts.
    pub fn new(volume_id: u64, file_index: u64) -> Self {
        Self {
            volume_id,
            file_index,
        }
    }

    /// Resolve identity of file at target path.
    ///
    /// Symbolic links are not followed. A symlink or directory has no linkable
    /// identity.
    ///
    /// # Errors
    ///
    /// - Return [`IdentityError::NotFound`] if path does not exist.
    /// - Return [`IdentityError::PermissionDenied`] if path cannot be read.
    /// - Return [`IdentityError::NotAFile`] if path is not a regular file.
    pub fn resolve(path: impl AsRef<Path>) -> Result<Self> {
        Ok(FileStat::of(path)?.identity)
    }

    pub fn volume_id(&self) -> u64 {
        self.volume_id
    }

    pub fn file_index(&self) -> u64 {
        self.file_index
    }
}

impl Display for FileIdentity {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        write!(fmt, "{:x}:{}", self.volume_id, self.file_index)
    }
}

/// Identity of a regular file along with the metadata callers usually need
/// next to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub identity: FileIdentity,
    pub len: u64,
    pub link_count: u64,
}

impl FileStat {
    /// Stat regular file at target path without following symlinks.
    ///
    /// # Errors
    ///
    /// - Return [`IdentityError::NotFound`] if path does not exist.
    /// - Return [`IdentityError::PermissionDenied`] if path cannot be read.
    /// - Return [`IdentityError::NotAFile`] if path is not a regular file.
    pub fn of(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let metadata = fs::symlink_metadata(path).map_err(|err| IdentityError::from_io(err, path))?;
        if !metadata.file_type().is_file() {
            return Err(IdentityError::NotAFile {
                path: path.to_path_buf(),
            });
        }

        platform::stat(path, &metadata).map_err(|err| IdentityError::from_io(err, path))
    }
}

/// Check if two paths live on the same volume.
///
/// A path that does not exist yet is judged by its parent directory, so a
/// would-be link destination can be checked before it is created.
///
/// # Errors
///
/// - Return [`IdentityError::NotFound`] if neither path nor its parent exist.
/// - Return [`IdentityError::PermissionDenied`] if volume cannot be queried.
pub fn same_volume(a: impl AsRef<Path>, b: impl AsRef<Path>) -> Result<bool> {
    Ok(volume_of(a.as_ref())? == volume_of(b.as_ref())?)
}

/// Determine volume identifier of path, or of its parent if it is missing.
///
/// # Errors
///
/// - Return [`IdentityError::NotFound`] if neither path nor its parent exist.
/// - Return [`IdentityError::PermissionDenied`] if volume cannot be queried.
pub fn volume_of(path: &Path) -> Result<u64> {
    let target = if path.exists() {
        path
    } else {
        path.parent().ok_or_else(|| IdentityError::NotFound {
            path: path.to_path_buf(),
        })?
    };

    platform::volume(target).map_err(|err| IdentityError::from_io(err, target))
}

#[cfg(unix)]
mod platform {
    use super::{FileIdentity, FileStat};

    use std::{fs::Metadata, io, os::unix::fs::MetadataExt, path::Path};

    pub(super) fn stat(_: &Path, metadata: &Metadata) -> io::Result<FileStat> {
        Ok(FileStat {
            identity: FileIdentity::new(metadata.dev(), metadata.ino()),
            len: metadata.len(),
            link_count: metadata.nlink(),
        })
    }

    pub(super) fn volume(path: &Path) -> io::Result<u64> {
        Ok(std::fs::metadata(path)?.dev())
    }
}

#[cfg(windows)]
mod platform {
    use super::{FileIdentity, FileStat};

    use std::{fs::Metadata, io, path::Path};
    use winapi_util::{file::information, Handle};

    // INVARIANT: Query through an open handle, because directory entry
    // metadata does not carry the file index on Windows.
    pub(super) fn stat(path: &Path, metadata: &Metadata) -> io::Result<FileStat> {
        let info = information(Handle::from_path_any(path)?)?;
        Ok(FileStat {
            identity: FileIdentity::new(info.volume_serial_number(), info.file_index()),
            len: metadata.len(),
            link_count: info.number_of_links(),
        })
    }

    pub(super) fn volume(path: &Path) -> io::Result<u64> {
        Ok(information(Handle::from_path_any(path)?)?.volume_serial_number())
    }
}

/// File identity error types.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    /// Path does not exist.
    #[error("path {:?} does not exist", path.display())]
    NotFound { path: PathBuf },

    /// Path exists but cannot be read.
    #[error("permission denied for {:?}", path.display())]
    PermissionDenied { path: PathBuf },

    /// Path is a directory or symlink, which has no linkable identity.
    #[error("path {:?} is not a regular file", path.display())]
    NotAFile { path: PathBuf },

    /// Any other I/O failure.
    #[error("failed to query {:?}", path.display())]
    Io {
        #[source]
        source: io::Error,
        path: PathBuf,
    },
}

impl IdentityError {
    pub(crate) fn from_io(err: io::Error, path: &Path) -> Self {
        let path = path.to_path_buf();
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound { path },
            io::ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            _ => Self::Io { source: err, path },
        }
    }
}

/// Friendly result alias :3
pub type Result<T, E = IdentityError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn hardlinks_share_identity() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let original = dir.path().join("x.pdf");
        let alias = dir.path().join("x-transliterated.pdf");
        fs::write(&original, b"data")?;
        fs::hard_link(&original, &alias)?;

        assert_eq!(FileIdentity::resolve(&original)?, FileIdentity::resolve(&alias)?);
        assert_eq!(FileStat::of(&alias)?.link_count, 2);

        Ok(())
    }

    #[test]
    fn copies_have_distinct_identity() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        fs::write(&a, b"same")?;
        fs::copy(&a, &b)?;

        assert_ne!(FileIdentity::resolve(&a)?, FileIdentity::resolve(&b)?);

        Ok(())
    }

    #[test]
    fn resolve_rejects_missing_and_directories() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;

        let result = FileIdentity::resolve(dir.path().join("nope"));
        assert!(matches!(result, Err(IdentityError::NotFound { .. })));

        let result = FileIdentity::resolve(dir.path());
        assert!(matches!(result, Err(IdentityError::NotAFile { .. })));

        Ok(())
    }

    #[test]
    fn same_volume_accepts_missing_destination() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("a.txt");
        fs::write(&file, b"a")?;

        assert!(same_volume(&file, dir.path().join("not-yet-created"))?);

        Ok(())
    }
}
