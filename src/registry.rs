// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Mirror group registry.
//!
//! A __mirror group__ is a named set of folders whose file membership is kept
//! equivalent through hardlinks. The registry is the single source of truth
//! for which folders are mirrored together. The filesystem itself carries no
//! group metadata.
//!
//! # Registry Layout
//!
//! The registry is a TOML document that lists each group as an entry of a
//! `[[group]]` array of tables:
//!
//! ```toml
//! version = 1
//!
//! [[group]]
//! id = "5b0a5e4c-3f09-4a8e-9d43-8a7f1e2b6c11"
//! name = "Photos + Backup"
//! folders = ["/data/Photos", "/data/Backup"]
//! watch_enabled = true
//! created_at = "2025-03-01T10:00:00Z"
//! modified_at = "2025-03-01T10:00:00Z"
//! ```
//!
//! Unknown keys are ignored, so newer registries stay readable by older
//! builds.
//!
//! # Invariants
//!
//! - A folder belongs to at most one group.
//! - A group has at least two folders. Dropping below two dissolves it.
//! - The persisted document is always a complete snapshot. Writes go to a
//!   temporary file in the same directory that then atomically replaces the
//!   registry.
//! - A registry that fails to parse is never overwritten or reset. Every
//!   mutation first verifies the persisted document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fmt::{Display, Formatter, Result as FmtResult},
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    str::FromStr,
    sync::{Arc, Mutex, PoisonError, RwLock},
};
use tempfile::NamedTempFile;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

const REGISTRY_VERSION: u32 = 1;

/// Unique and stable identifier of a mirror group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(transparent)]
pub struct GroupId(Uuid);

impl GroupId {
    /// Generate new random group identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for GroupId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for GroupId {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        Display::fmt(&self.0, fmt)
    }
}

impl FromStr for GroupId {
    type Err = uuid::Error;

    fn from_str(data: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(data)?))
    }
}

/// Set of folders kept in sync through hardlinks.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct MirrorGroup {
    /// Stable identifier of group.
    pub id: GroupId,

    /// Display name of group.
    #[serde(default)]
    pub name: String,

    /// Absolute paths of member folders in insertion order.
    #[serde(default)]
    pub folders: Vec<PathBuf>,

    /// Whether watcher events of this group are acted upon.
    #[serde(default = "enabled")]
    pub watch_enabled: bool,

    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl MirrorGroup {
    /// Check if folder is a member of this group.
    pub fn contains(&self, folder: impl AsRef<Path>) -> bool {
        self.folders.iter().any(|member| member == folder.as_ref())
    }

    /// Generate display name from folder basenames, e.g. "Photos + Backup".
    pub fn auto_name(&self) -> String {
        if self.folders.is_empty() {
            return "(empty)".into();
        }

        self.folders
            .iter()
            .map(|folder| {
                folder
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| folder.display().to_string())
            })
            .collect::<Vec<_>>()
            .join(" + ")
    }

    fn touch(&mut self) {
        self.modified_at = Utc::now();
    }
}

fn enabled() -> bool {
    true
}

fn current_version() -> u32 {
    REGISTRY_VERSION
}

/// Persisted registry layout.
#[derive(Debug, Default, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct RegistryDocument {
    #[serde(default = "current_version")]
    pub version: u32,

    #[serde(default, rename = "group")]
    pub groups: Vec<MirrorGroup>,
}

impl FromStr for RegistryDocument {
    type Err = toml::de::Error;

    fn from_str(data: &str) -> std::result::Result<Self, Self::Err> {
        toml::de::from_str(data)
    }
}

impl Display for RegistryDocument {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(|_| std::fmt::Error)?
                .as_str(),
        )
    }
}

#[derive(Debug, Default, Clone)]
struct RegistryState {
    groups: Vec<MirrorGroup>,

    // Reverse index of folder to owning group, rebuilt on every load.
    owners: HashMap<PathBuf, GroupId>,
}

impl RegistryState {
    fn from_document(document: RegistryDocument, path: &Path) -> Result<Self> {
        let mut state = Self::default();
        for group in document.groups {
            if state.groups.iter().any(|other| other.id == group.id) {
                return Err(RegistryError::CorruptRegistry {
                    path: path.to_path_buf(),
                    reason: format!("duplicate group id {}", group.id),
                });
            }

            for folder in &group.folders {
                if let Some(owner) = state.owners.insert(folder.clone(), group.id) {
                    return Err(RegistryError::CorruptRegistry {
                        path: path.to_path_buf(),
                        reason: format!(
                            "folder {:?} belongs to both {owner} and {}",
                            folder.display(),
                            group.id
                        ),
                    });
                }

                if !folder.is_dir() {
                    warn!("group {} lists missing folder {:?}", group.id, folder.display());
                }
            }

            state.groups.push(group);
        }

        Ok(state)
    }

    fn to_document(&self) -> RegistryDocument {
        RegistryDocument {
            version: REGISTRY_VERSION,
            groups: self.groups.clone(),
        }
    }

    fn group(&self, id: &GroupId) -> Result<&MirrorGroup> {
        self.groups
            .iter()
            .find(|group| group.id == *id)
            .ok_or(RegistryError::UnknownGroup { id: *id })
    }

    fn group_mut(&mut self, id: &GroupId) -> Result<&mut MirrorGroup> {
        self.groups
            .iter_mut()
            .find(|group| group.id == *id)
            .ok_or(RegistryError::UnknownGroup { id: *id })
    }

    fn claim(&mut self, folder: &Path, id: GroupId) -> Result<()> {
        match self.owners.get(folder) {
            Some(owner) if *owner != id => Err(RegistryError::FolderAlreadyGrouped {
                folder: folder.to_path_buf(),
                group: *owner,
            }),
            _ => {
                self.owners.insert(folder.to_path_buf(), id);
                Ok(())
            }
        }
    }

    fn dissolve(&mut self, id: &GroupId) -> Option<MirrorGroup> {
        let index = self.groups.iter().position(|group| group.id == *id)?;
        let group = self.groups.remove(index);
        for folder in &group.folders {
            self.owners.remove(folder);
        }

        Some(group)
    }
}

/// Per-group exclusive locks.
///
/// Serializes every operation that touches the same group, whether it comes
/// from the watcher, the user, or a registry mutation. Different groups never
/// contend.
#[derive(Debug, Default)]
pub struct GroupLocks {
    locks: Mutex<HashMap<GroupId, Arc<Mutex<()>>>>,
}

impl GroupLocks {
    /// Run `action` while holding exclusive lock of group.
    pub fn with<T>(&self, id: &GroupId, action: impl FnOnce() -> T) -> T {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(*id).or_default())
        };
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        action()
    }

    /// Drop lock of group once nobody holds or waits on it.
    fn forget(&self, id: &GroupId) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);

        // INVARIANT: Handles are only cloned under the table lock, so a count
        // of one means no holder or waiter. Dropping a shared entry would
        // hand later callers a second mutex for the same group.
        if locks.get(id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(id);
        }
    }
}

/// Result of removing a folder from a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FolderRemoval {
    /// Group lives on with remaining folders.
    Remaining(MirrorGroup),

    /// Group fell below two folders and was dissolved.
    Dissolved(MirrorGroup),
}

/// Persistent registry of mirror groups.
#[derive(Debug)]
pub struct Registry {
    path: PathBuf,
    state: RwLock<RegistryState>,
    locks: GroupLocks,
}

impl Registry {
    /// Open registry persisted at target path.
    ///
    /// A missing registry file yields an empty registry. Nothing is written
    /// until the first mutation.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError::CorruptRegistry`] if registry cannot be
    ///   parsed or violates group invariants.
    /// - Return [`RegistryError::ReadRegistry`] if registry cannot be read.
    #[instrument(skip(path), level = "debug")]
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        debug!("open registry {:?}", path.display());
        let state = Self::load(&path)?;

        Ok(Self {
            path,
            state: RwLock::new(state),
            locks: GroupLocks::default(),
        })
    }

    fn load(path: &Path) -> Result<RegistryState> {
        let document = match Self::read_document(path)? {
            Some(document) => document,
            None => return Ok(RegistryState::default()),
        };

        RegistryState::from_document(document, path)
    }

    fn read_document(path: &Path) -> Result<Option<RegistryDocument>> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(RegistryError::ReadRegistry {
                    source: err,
                    path: path.to_path_buf(),
                })
            }
        };

        content
            .parse::<RegistryDocument>()
            .map(Some)
            .map_err(|err| RegistryError::CorruptRegistry {
                path: path.to_path_buf(),
                reason: err.to_string(),
            })
    }

    /// Path to persisted registry.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Confirm persisted registry is valid.
    ///
    /// Destructive operations must call this first, so that they refuse to run
    /// while the registry on disk is corrupt.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError::CorruptRegistry`] if persisted registry
    ///   cannot be parsed or violates group invariants.
    pub fn verify(&self) -> Result<()> {
        Self::load(&self.path).map(|_| ())
    }

    /// Replace in-memory view with what is persisted.
    ///
    /// Picks up groups edited by other processes. Returns whether anything
    /// changed. On error the current view is kept.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError::CorruptRegistry`] if persisted registry
    ///   cannot be parsed or violates group invariants.
    #[instrument(skip(self), level = "debug")]
    pub fn reload(&self) -> Result<bool> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let fresh = Self::load(&self.path)?;
        if fresh.groups == state.groups {
            return Ok(false);
        }

        let gone = state
            .groups
            .iter()
            .filter(|group| fresh.group(&group.id).is_err())
            .map(|group| group.id)
            .collect::<Vec<_>>();
        *state = fresh;
        drop(state);

        for id in gone {
            self.locks.forget(&id);
        }
        info!("reloaded registry {:?}", self.path.display());

        Ok(true)
    }

    /// Run `action` while holding exclusive lock of group.
    pub fn with_group_lock<T>(&self, id: &GroupId, action: impl FnOnce() -> T) -> T {
        self.locks.with(id, action)
    }

    /// List all groups in creation order.
    pub fn groups(&self) -> Vec<MirrorGroup> {
        self.read_state().groups.clone()
    }

    /// Get group by identifier.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError::UnknownGroup`] if no group has that id.
    pub fn group(&self, id: &GroupId) -> Result<MirrorGroup> {
        self.read_state().group(id).cloned()
    }

    /// Find group that owns target folder.
    pub fn group_for_folder(&self, folder: impl AsRef<Path>) -> Option<MirrorGroup> {
        let folder = normalize_lossy(folder.as_ref());
        let state = self.read_state();
        let id = state.owners.get(&folder)?;
        state.group(id).ok().cloned()
    }

    /// Resolve user supplied group reference.
    ///
    /// Accepts a full group id, a unique id prefix, or an exact group name.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError::UnknownGroupRef`] if nothing or more than one
    ///   group matches.
    pub fn resolve_ref(&self, reference: impl AsRef<str>) -> Result<GroupId> {
        let reference = reference.as_ref();
        let state = self.read_state();
        let matches = state
            .groups
            .iter()
            .filter(|group| {
                group.id.to_string().starts_with(reference) || group.name == reference
            })
            .map(|group| group.id)
            .collect::<Vec<_>>();

        match matches.as_slice() {
            [id] => Ok(*id),
            _ => Err(RegistryError::UnknownGroupRef {
                reference: reference.into(),
                matches: matches.len(),
            }),
        }
    }

    /// Create new mirror group.
    ///
    /// Only records the grouping. Bringing folder contents into agreement is
    /// the job of the sync engine.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError::InsufficientFolders`] if fewer than two
    ///   distinct folders are given.
    /// - Return [`RegistryError::NotADirectory`] if any path is not a folder.
    /// - Return [`RegistryError::FolderAlreadyGrouped`] if any folder already
    ///   belongs to a group.
    /// - Return [`RegistryError::CorruptRegistry`] if persisted registry is
    ///   corrupt.
    #[instrument(skip(self, folders, name), level = "debug")]
    pub fn create_group(
        &self,
        folders: impl IntoIterator<Item = impl AsRef<Path>>,
        name: Option<String>,
        watch_enabled: bool,
    ) -> Result<MirrorGroup> {
        let mut members = Vec::new();
        for folder in folders {
            let folder = normalize_dir(folder.as_ref())?;
            if !members.contains(&folder) {
                members.push(folder);
            }
        }

        if members.len() < 2 {
            return Err(RegistryError::InsufficientFolders {
                count: members.len(),
            });
        }

        let now = Utc::now();
        let mut group = MirrorGroup {
            id: GroupId::new(),
            name: String::new(),
            folders: members,
            watch_enabled,
            created_at: now,
            modified_at: now,
        };
        group.name = match name {
            Some(name) if !name.trim().is_empty() => name,
            _ => group.auto_name(),
        };

        let created = group.clone();
        self.mutate(|state| {
            for folder in &group.folders {
                state.claim(folder, group.id)?;
            }
            state.groups.push(group);
            Ok(())
        })?;
        info!("created group {} ({})", created.id, created.name);

        Ok(created)
    }

    /// Add folder to existing group.
    ///
    /// Adding a folder the group already has is a no-op.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError::UnknownGroup`] if group does not exist.
    /// - Return [`RegistryError::NotADirectory`] if path is not a folder.
    /// - Return [`RegistryError::FolderAlreadyGrouped`] if folder belongs to
    ///   another group.
    #[instrument(skip(self, folder), level = "debug")]
    pub fn add_folder(&self, id: &GroupId, folder: impl AsRef<Path>) -> Result<MirrorGroup> {
        let folder = normalize_dir(folder.as_ref())?;
        self.locks.with(id, || {
            self.mutate(|state| {
                if state.group(id)?.contains(&folder) {
                    return Ok(());
                }

                state.claim(&folder, *id)?;
                let group = state.group_mut(id)?;
                let renamed = group.name == group.auto_name();
                group.folders.push(folder.clone());
                if renamed {
                    group.name = group.auto_name();
                }
                group.touch();
                Ok(())
            })?;
            info!("added {:?} to group {id}", folder.display());
            self.group(id)
        })
    }

    /// Remove folder from group.
    ///
    /// A group left with fewer than two folders is dissolved. Files and
    /// existing hardlinks are never touched.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError::UnknownGroup`] if group does not exist.
    /// - Return [`RegistryError::NotAMember`] if folder is not in group.
    #[instrument(skip(self, folder), level = "debug")]
    pub fn remove_folder(&self, id: &GroupId, folder: impl AsRef<Path>) -> Result<FolderRemoval> {
        let folder = normalize_lossy(folder.as_ref());
        let removal = self.locks.with(id, || {
            let mut removal = None;
            self.mutate(|state| {
                let group = state.group_mut(id)?;
                if !group.contains(&folder) {
                    return Err(RegistryError::NotAMember {
                        folder: folder.clone(),
                        group: *id,
                    });
                }

                let renamed = group.name == group.auto_name();
                group.folders.retain(|member| *member != folder);
                if renamed {
                    group.name = group.auto_name();
                }
                group.touch();
                let snapshot = group.clone();
                state.owners.remove(&folder);

                removal = Some(if snapshot.folders.len() < 2 {
                    state.dissolve(id);
                    FolderRemoval::Dissolved(snapshot)
                } else {
                    FolderRemoval::Remaining(snapshot)
                });
                Ok(())
            })?;

            removal.ok_or(RegistryError::UnknownGroup { id: *id })
        })?;

        if let FolderRemoval::Dissolved(_) = removal {
            info!("group {id} dissolved after removing {:?}", folder.display());
            self.locks.forget(id);
        }

        Ok(removal)
    }

    /// Delete group.
    ///
    /// Removes the grouping only. Files and hardlinks stay where they are.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError::UnknownGroup`] if group does not exist.
    #[instrument(skip(self), level = "debug")]
    pub fn delete_group(&self, id: &GroupId) -> Result<MirrorGroup> {
        let deleted = self.locks.with(id, || {
            let mut deleted = None;
            self.mutate(|state| {
                deleted = state.dissolve(id);
                deleted
                    .as_ref()
                    .map(|_| ())
                    .ok_or(RegistryError::UnknownGroup { id: *id })
            })?;

            deleted.ok_or(RegistryError::UnknownGroup { id: *id })
        })?;
        self.locks.forget(id);
        info!("deleted group {id}");

        Ok(deleted)
    }

    /// Rename group.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError::UnknownGroup`] if group does not exist.
    pub fn rename_group(&self, id: &GroupId, name: impl Into<String>) -> Result<MirrorGroup> {
        let name = name.into();
        self.update(id, |group| group.name = name)
    }

    /// Enable or disable watching of group.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError::UnknownGroup`] if group does not exist.
    pub fn set_watch_enabled(&self, id: &GroupId, watch_enabled: bool) -> Result<MirrorGroup> {
        self.update(id, |group| group.watch_enabled = watch_enabled)
    }

    fn update(&self, id: &GroupId, edit: impl FnOnce(&mut MirrorGroup)) -> Result<MirrorGroup> {
        self.locks.with(id, || {
            self.mutate(|state| {
                let group = state.group_mut(id)?;
                edit(group);
                group.touch();
                Ok(())
            })?;
            self.group(id)
        })
    }

    // INVARIANT: Mutate a copy, persist it, and only then publish it, so the
    // in-memory view never runs ahead of what is on disk.
    fn mutate(&self, edit: impl FnOnce(&mut RegistryState) -> Result<()>) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        self.verify()?;

        let mut draft = state.clone();
        edit(&mut draft)?;
        self.persist(&draft)?;
        *state = draft;

        Ok(())
    }

    fn persist(&self, state: &RegistryState) -> Result<()> {
        let write_err = |source: io::Error| RegistryError::WriteRegistry {
            source,
            path: self.path.clone(),
        };
        let content = toml::ser::to_string_pretty(&state.to_document())?;
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent).map_err(write_err)?;

        let mut file = NamedTempFile::new_in(parent).map_err(write_err)?;
        file.write_all(content.as_bytes()).map_err(write_err)?;
        file.as_file().sync_all().map_err(write_err)?;
        file.persist(&self.path).map_err(|err| write_err(err.error))?;
        debug!("persisted registry {:?}", self.path.display());

        Ok(())
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Canonicalize path that must be an existing folder.
fn normalize_dir(path: &Path) -> Result<PathBuf> {
    let canonical = path
        .canonicalize()
        .map_err(|_| RegistryError::NotADirectory {
            path: path.to_path_buf(),
        })?;
    if !canonical.is_dir() {
        return Err(RegistryError::NotADirectory {
            path: path.to_path_buf(),
        });
    }

    Ok(canonical)
}

/// Canonicalize path if possible, falling back to an absolute form for
/// folders that no longer exist.
pub(crate) fn normalize_lossy(path: &Path) -> PathBuf {
    path.canonicalize()
        .or_else(|_| std::path::absolute(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

/// Registry error types.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Persisted registry is malformed.
    #[error("registry {:?} is corrupt: {reason}", path.display())]
    CorruptRegistry { path: PathBuf, reason: String },

    /// Persisted registry cannot be read.
    #[error("failed to read registry {:?}", path.display())]
    ReadRegistry {
        #[source]
        source: io::Error,
        path: PathBuf,
    },

    /// Registry cannot be written.
    #[error("failed to write registry {:?}", path.display())]
    WriteRegistry {
        #[source]
        source: io::Error,
        path: PathBuf,
    },

    /// Registry cannot be serialized.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Folder already belongs to a group.
    #[error("folder {:?} already belongs to group {group}", folder.display())]
    FolderAlreadyGrouped { folder: PathBuf, group: GroupId },

    /// Group needs at least two folders.
    #[error("a mirror group needs at least 2 folders, got {count}")]
    InsufficientFolders { count: usize },

    /// Path is not an existing folder.
    #[error("path {:?} is not a directory", path.display())]
    NotADirectory { path: PathBuf },

    /// Folder is not a member of group.
    #[error("folder {:?} is not a member of group {group}", folder.display())]
    NotAMember { folder: PathBuf, group: GroupId },

    /// No group has the given id.
    #[error("no mirror group with id {id}")]
    UnknownGroup { id: GroupId },

    /// Group reference does not match exactly one group.
    #[error("group reference {reference:?} matches {matches} groups")]
    UnknownGroupRef { reference: String, matches: usize },
}

/// Friendly result alias :3
pub type Result<T, E = RegistryError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    struct Fixture {
        root: tempfile::TempDir,
        registry: Registry,
    }

    impl Fixture {
        fn new() -> anyhow::Result<Self> {
            let root = tempfile::tempdir()?;
            let registry = Registry::open(root.path().join("state").join("mirror_groups.toml"))?;
            Ok(Self { root, registry })
        }

        fn folder(&self, name: &str) -> anyhow::Result<PathBuf> {
            let path = self.root.path().join(name);
            fs::create_dir_all(&path)?;
            Ok(path.canonicalize()?)
        }
    }

    #[test]
    fn create_group_auto_names_and_persists() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let photos = fixture.folder("Photos")?;
        let backup = fixture.folder("Backup")?;

        let group = fixture.registry.create_group([&photos, &backup], None, true)?;
        assert_eq!(group.name, "Photos + Backup");
        assert_eq!(group.folders, vec![photos.clone(), backup.clone()]);
        assert_eq!(fixture.registry.group_for_folder(&backup), Some(group.clone()));

        let reopened = Registry::open(fixture.registry.path())?;
        assert_eq!(reopened.groups(), vec![group]);

        Ok(())
    }

    #[test]
    fn create_group_rejects_bad_folder_sets() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let a = fixture.folder("a")?;
        let file = fixture.root.path().join("file.txt");
        fs::write(&file, b"x")?;

        let result = fixture.registry.create_group([&a, &a], None, true);
        assert!(matches!(result, Err(RegistryError::InsufficientFolders { count: 1 })));

        let result = fixture.registry.create_group([a.as_path(), file.as_path()], None, true);
        assert!(matches!(result, Err(RegistryError::NotADirectory { .. })));

        Ok(())
    }

    #[test]
    fn folder_belongs_to_at_most_one_group() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let a = fixture.folder("a")?;
        let b = fixture.folder("b")?;
        let c = fixture.folder("c")?;
        let d = fixture.folder("d")?;

        let first = fixture.registry.create_group([&a, &b], None, true)?;
        let result = fixture.registry.create_group([&b, &c], None, true);
        assert!(matches!(result, Err(RegistryError::FolderAlreadyGrouped { group, .. }) if group == first.id));

        let second = fixture.registry.create_group([&c, &d], None, true)?;
        let result = fixture.registry.add_folder(&second.id, &a);
        assert!(matches!(result, Err(RegistryError::FolderAlreadyGrouped { .. })));

        // Failed mutation leaves both memory and disk untouched.
        let reopened = Registry::open(fixture.registry.path())?;
        assert_eq!(reopened.groups(), fixture.registry.groups());
        assert_eq!(fixture.registry.group(&second.id)?.folders, vec![c, d]);

        Ok(())
    }

    #[test]
    fn removing_below_two_folders_dissolves_group() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let a = fixture.folder("a")?;
        let b = fixture.folder("b")?;
        let c = fixture.folder("c")?;
        let group = fixture.registry.create_group([&a, &b, &c], Some("shelf".into()), true)?;

        let removal = fixture.registry.remove_folder(&group.id, &c)?;
        assert!(matches!(removal, FolderRemoval::Remaining(ref g) if g.folders == vec![a.clone(), b.clone()]));
        assert_eq!(fixture.registry.group_for_folder(&c), None);

        let removal = fixture.registry.remove_folder(&group.id, &b)?;
        assert!(matches!(removal, FolderRemoval::Dissolved(_)));
        assert!(fixture.registry.groups().is_empty());
        assert_eq!(fixture.registry.group_for_folder(&a), None);

        Ok(())
    }

    #[test]
    fn delete_group_leaves_files_alone() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let a = fixture.folder("a")?;
        let b = fixture.folder("b")?;
        fs::write(a.join("x.pdf"), b"pdf")?;
        fs::hard_link(a.join("x.pdf"), b.join("x.pdf"))?;
        let group = fixture.registry.create_group([&a, &b], None, true)?;

        fixture.registry.delete_group(&group.id)?;
        assert!(fixture.registry.groups().is_empty());
        assert!(a.join("x.pdf").exists());
        assert!(b.join("x.pdf").exists());

        let result = fixture.registry.delete_group(&group.id);
        assert!(matches!(result, Err(RegistryError::UnknownGroup { .. })));

        Ok(())
    }

    #[test]
    fn modified_at_moves_forward_on_mutation() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let a = fixture.folder("a")?;
        let b = fixture.folder("b")?;
        let group = fixture.registry.create_group([&a, &b], None, true)?;

        let updated = fixture.registry.set_watch_enabled(&group.id, false)?;
        assert!(!updated.watch_enabled);
        assert!(updated.modified_at >= group.modified_at);
        assert_eq!(updated.created_at, group.created_at);

        let renamed = fixture.registry.rename_group(&group.id, "archive")?;
        assert_eq!(renamed.name, "archive");
        assert_eq!(fixture.registry.resolve_ref("archive")?, group.id);

        Ok(())
    }

    #[test]
    fn corrupt_registry_fails_closed() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let a = fixture.folder("a")?;
        let b = fixture.folder("b")?;
        let c = fixture.folder("c")?;
        let group = fixture.registry.create_group([&a, &b], None, true)?;

        fs::write(fixture.registry.path(), "[[group]\nthis is not toml")?;
        let result = Registry::open(fixture.registry.path());
        assert!(matches!(result, Err(RegistryError::CorruptRegistry { .. })));

        // Open handle refuses to overwrite the corrupt document.
        let result = fixture.registry.add_folder(&group.id, &c);
        assert!(matches!(result, Err(RegistryError::CorruptRegistry { .. })));
        let content = fs::read_to_string(fixture.registry.path())?;
        assert_eq!(content, "[[group]\nthis is not toml");

        Ok(())
    }

    #[test]
    fn overlapping_groups_on_disk_are_corrupt() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        fs::create_dir_all(fixture.registry.path().parent().unwrap())?;
        fs::write(
            fixture.registry.path(),
            indoc! {r#"
                [[group]]
                id = "0b6f3c5e-3d1c-4f0a-9b56-2c1f5a8e7d01"
                folders = ["/srv/a", "/srv/b"]
                created_at = "2025-01-01T00:00:00Z"
                modified_at = "2025-01-01T00:00:00Z"

                [[group]]
                id = "0b6f3c5e-3d1c-4f0a-9b56-2c1f5a8e7d02"
                folders = ["/srv/b", "/srv/c"]
                created_at = "2025-01-01T00:00:00Z"
                modified_at = "2025-01-01T00:00:00Z"
            "#},
        )?;

        let result = Registry::open(fixture.registry.path());
        assert!(matches!(result, Err(RegistryError::CorruptRegistry { .. })));

        Ok(())
    }

    #[test]
    fn unknown_fields_are_ignored() -> anyhow::Result<()> {
        let document: RegistryDocument = indoc! {r#"
            version = 2
            theme = "dark"

            [[group]]
            id = "0b6f3c5e-3d1c-4f0a-9b56-2c1f5a8e7d01"
            name = "Scans"
            folders = ["/srv/a", "/srv/b"]
            created_at = "2025-01-01T00:00:00Z"
            modified_at = "2025-01-02T00:00:00Z"
            color = "teal"
        "#}
        .parse()?;

        assert_eq!(document.version, 2);
        assert_eq!(document.groups.len(), 1);
        assert_eq!(document.groups[0].name, "Scans");
        assert!(document.groups[0].watch_enabled);

        Ok(())
    }

    #[test]
    fn document_round_trips_losslessly() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let a = fixture.folder("a")?;
        let b = fixture.folder("b")?;
        let c = fixture.folder("c")?;
        let d = fixture.folder("d")?;
        fixture.registry.create_group([&a, &b], Some("first".into()), true)?;
        let second = fixture.registry.create_group([&c, &d], None, false)?;
        fixture.registry.rename_group(&second.id, "second")?;

        let before = fixture.registry.groups();
        let after = Registry::open(fixture.registry.path())?.groups();
        assert_eq!(before, after);

        let document = RegistryDocument {
            version: REGISTRY_VERSION,
            groups: before,
        };
        assert_eq!(document.to_string().parse::<RegistryDocument>()?, document);

        Ok(())
    }

    #[test]
    fn reload_picks_up_groups_of_other_processes() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let a = fixture.folder("a")?;
        let b = fixture.folder("b")?;
        let other = Registry::open(fixture.registry.path())?;

        let group = other.create_group([&a, &b], None, true)?;
        assert!(fixture.registry.groups().is_empty());
        assert!(fixture.registry.reload()?);
        assert_eq!(fixture.registry.group(&group.id)?, group);
        assert_eq!(fixture.registry.group_for_folder(&a), Some(group.clone()));
        assert!(!fixture.registry.reload()?);

        other.delete_group(&group.id)?;
        assert!(fixture.registry.reload()?);
        assert!(fixture.registry.groups().is_empty());

        Ok(())
    }

    #[test]
    fn forget_keeps_lock_while_it_is_held() {
        let locks = GroupLocks::default();
        let id = GroupId::new();
        let count = |locks: &GroupLocks| locks.locks.lock().unwrap().len();

        locks.with(&id, || locks.forget(&id));
        assert_eq!(count(&locks), 1);

        locks.forget(&id);
        assert_eq!(count(&locks), 0);
    }
}
