// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Content fingerprints of folder trees.
//!
//! A folder's fingerprint covers the bytes of every file below it and the
//! shape of its subfolders, but none of the names. Folders that share a
//! fingerprint carry the same data even though they are not hardlinked yet,
//! which makes them candidates for a mirror group. Candidates are only
//! reported. Whether they become a group is for the user to decide.

use crate::{
    identity::FileIdentity,
    native::{EntryKind, LocalFs, NativeFs},
    registry::normalize_lossy,
};

use blake3::{Hash, Hasher};
use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Folders whose trees carry identical content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentCandidate {
    pub fingerprint: Hash,

    /// Sorted. No folder lies inside another.
    pub folders: Vec<PathBuf>,
}

/// Result of a content scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentScan {
    pub candidates: Vec<ContentCandidate>,

    /// Number of distinct files whose data was hashed.
    pub files_hashed: usize,

    /// Scan was cancelled before every tree was fingerprinted. Carries no
    /// candidates, since partial fingerprints compare meaningless.
    pub cancelled: bool,
}

/// Fingerprints folder trees by content.
pub struct ContentScanner<F = LocalFs>
where
    F: NativeFs,
{
    fs: Arc<F>,
    fingerprints: HashMap<PathBuf, Option<Hash>>,

    // Hardlinks share data, so each identity is read once.
    file_hashes: HashMap<FileIdentity, Hash>,
}

impl<F> ContentScanner<F>
where
    F: NativeFs,
{
    pub fn new(fs: Arc<F>) -> Self {
        Self {
            fs,
            fingerprints: HashMap::new(),
            file_hashes: HashMap::new(),
        }
    }

    /// Fingerprint every folder below `roots` and group equal ones.
    ///
    /// Empty folders and folders that cannot be listed have no fingerprint.
    /// Unreadable files are left out of their folder's fingerprint with a
    /// diagnostic. When every folder of one candidate sits directly inside
    /// the folders of another candidate, only the outer candidate is kept.
    #[instrument(skip(self, roots, cancel), level = "debug")]
    pub fn scan(
        mut self,
        roots: impl IntoIterator<Item = impl AsRef<Path>>,
        cancel: &CancellationToken,
    ) -> ContentScan {
        for root in roots {
            let root = normalize_lossy(root.as_ref());
            self.fingerprint(&root, cancel);
        }

        if cancel.is_cancelled() {
            debug!("content scan cancelled");
            return ContentScan {
                candidates: Vec::new(),
                files_hashed: self.file_hashes.len(),
                cancelled: true,
            };
        }

        let mut by_print: HashMap<Hash, Vec<PathBuf>> = HashMap::new();
        for (folder, print) in &self.fingerprints {
            if let Some(print) = print {
                by_print.entry(*print).or_default().push(folder.clone());
            }
        }

        let mut candidates = Vec::new();
        for (fingerprint, folders) in by_print {
            // INVARIANT: Drop folders that hold another folder of the set.
            let mut folders = folders
                .iter()
                .filter(|folder| {
                    !folders
                        .iter()
                        .any(|other| other != *folder && other.starts_with(folder))
                })
                .cloned()
                .collect::<Vec<_>>();
            if folders.len() < 2 {
                continue;
            }

            folders.sort();
            candidates.push(ContentCandidate {
                fingerprint,
                folders,
            });
        }

        let candidates = outermost(candidates);
        debug!("found {} content candidate(s)", candidates.len());

        ContentScan {
            candidates,
            files_hashed: self.file_hashes.len(),
            cancelled: false,
        }
    }

    fn fingerprint(&mut self, folder: &Path, cancel: &CancellationToken) -> Option<Hash> {
        if let Some(print) = self.fingerprints.get(folder) {
            return *print;
        }

        let listing = match self.fs.list_directory(folder) {
            Ok(listing) => listing,
            Err(err) => {
                warn!("cannot list {:?}: {err}", folder.display());
                self.fingerprints.insert(folder.to_path_buf(), None);
                return None;
            }
        };

        let mut files = Vec::new();
        let mut children = Vec::new();
        for entry in listing {
            // INVARIANT: Never cache a fingerprint cut short by cancellation.
            if cancel.is_cancelled() {
                return None;
            }

            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("cannot read entry of {:?}: {err}", folder.display());
                    continue;
                }
            };

            match entry.kind {
                EntryKind::File => match self.hash_file(&entry.path) {
                    Ok(hash) => files.push(hash),
                    Err(err) => warn!("cannot hash {:?}: {err}", entry.path.display()),
                },
                EntryKind::Dir => {
                    if let Some(print) = self.fingerprint(&entry.path, cancel) {
                        children.push(print);
                    }
                }
                EntryKind::Symlink | EntryKind::Other => {}
            }
        }

        if cancel.is_cancelled() {
            return None;
        }

        let print = (!files.is_empty() || !children.is_empty()).then(|| combine(files, children));
        self.fingerprints.insert(folder.to_path_buf(), print);
        print
    }

    fn hash_file(&mut self, path: &Path) -> io::Result<Hash> {
        let identity = self.fs.stat(path).map_err(io::Error::other)?.identity;
        if let Some(hash) = self.file_hashes.get(&identity) {
            return Ok(*hash);
        }

        let mut reader = self.fs.open_file(path)?;
        let mut hasher = Hasher::new();
        io::copy(&mut reader, &mut hasher)?;
        let hash = hasher.finalize();
        self.file_hashes.insert(identity, hash);

        Ok(hash)
    }
}

// INVARIANT: Sort both halves so that entry order and names never matter.
fn combine(mut files: Vec<Hash>, mut children: Vec<Hash>) -> Hash {
    files.sort_by(|a, b| a.as_bytes().cmp(b.as_bytes()));
    children.sort_by(|a, b| a.as_bytes().cmp(b.as_bytes()));

    let mut hasher = Hasher::new();
    hasher.update(&(files.len() as u64).to_le_bytes());
    for hash in &files {
        hasher.update(hash.as_bytes());
    }
    hasher.update(&(children.len() as u64).to_le_bytes());
    for hash in &children {
        hasher.update(hash.as_bytes());
    }

    hasher.finalize()
}

/// Drop candidates that only repeat the subfolders of another candidate.
fn outermost(candidates: Vec<ContentCandidate>) -> Vec<ContentCandidate> {
    let mut owner: HashMap<&Path, usize> = HashMap::new();
    for (index, candidate) in candidates.iter().enumerate() {
        for folder in &candidate.folders {
            owner.insert(folder.as_path(), index);
        }
    }

    let nested = candidates
        .iter()
        .enumerate()
        .map(|(index, candidate)| {
            let mut parents = candidate
                .folders
                .iter()
                .map(|folder| folder.parent().and_then(|parent| owner.get(parent)));
            match parents.next().flatten() {
                Some(first) => *first != index && parents.all(|parent| parent == Some(first)),
                None => false,
            }
        })
        .collect::<Vec<_>>();

    let mut candidates = candidates
        .into_iter()
        .zip(nested)
        .filter(|(_, nested)| !nested)
        .map(|(candidate, _)| candidate)
        .collect::<Vec<_>>();
    candidates.sort_by(|a, b| a.folders.cmp(&b.folders));
    candidates
}
