// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Mirror group synchronization.
//!
//! The [`SyncEngine`] turns changes in one member folder of a mirror group
//! into hardlink operations on every other member. It never trusts cached
//! state: every operation re-derives folder contents by enumeration while
//! holding the group's exclusive lock, and compares files by
//! [`FileIdentity`] only.
//!
//! # Propagation
//!
//! When a file appears in member folder F, every other member that does not
//! already link the file's identity gains a hardlink under the same name. If
//! that name is taken by different data, the link is created under the first
//! free name of the form `stem (n).ext` and a [`Notice`] is reported. Each
//! member is attempted independently. Failures are collected into the
//! [`PropagationReport`] and flag the group as needing a re-sync. Nothing is
//! rolled back.
//!
//! # Removal
//!
//! Removal always goes through a [`RemovalPlan`] listing every link of the
//! file across the group, so the user can decide its scope. Deletions that
//! the watcher merely observes are queued as [`PendingDeletion`]s for the UI
//! to surface later.

use crate::{
    content::{ContentScan, ContentScanner},
    identity::{FileIdentity, IdentityError},
    link::{LinkError, LinkOperator, LinkReport, LinkedEntry, LinkedFileSet},
    native::{LocalFs, NativeFs},
    registry::{normalize_lossy, FolderRemoval, GroupId, MirrorGroup, Registry, RegistryError},
    watch::WatchEvent,
};

use chrono::{DateTime, Utc};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    ffi::{OsStr, OsString},
    fmt::{Display, Formatter, Result as FmtResult},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

// Upper bound of `stem (n).ext` candidates tried before giving up.
const MAX_DISAMBIGUATION: u32 = 9999;

const EVENT_CAPACITY: usize = 256;

/// Runtime state of a mirror group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    Idle,
    Propagating,
    Disabled,
}

impl Display for GroupState {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Idle => fmt.write_str("idle"),
            Self::Propagating => fmt.write_str("propagating"),
            Self::Disabled => fmt.write_str("disabled"),
        }
    }
}

/// Non-fatal observation made during propagation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// Requested name was taken by different data, so another name was used.
    NameCollisionResolved {
        folder: PathBuf,
        requested: OsString,
        used: OsString,
    },
}

impl Display for Notice {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::NameCollisionResolved {
                folder,
                requested,
                used,
            } => write!(
                fmt,
                "{:?} is taken in {:?}, linked as {:?} instead",
                requested,
                folder.display(),
                used
            ),
        }
    }
}

/// Failure to act on one folder of a group.
#[derive(Debug, Clone)]
pub struct FolderFailure {
    pub folder: PathBuf,
    pub name: OsString,
    pub error: Arc<LinkError>,
}

impl FolderFailure {
    fn new(folder: impl Into<PathBuf>, name: impl Into<OsString>, error: LinkError) -> Self {
        Self {
            folder: folder.into(),
            name: name.into(),
            error: Arc::new(error),
        }
    }
}

impl Display for FolderFailure {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        write!(
            fmt,
            "{:?}: {:?}: {}",
            self.folder.display(),
            self.name,
            self.error
        )
    }
}

/// Aggregate of per-folder failures of a group-wide operation.
#[derive(Debug, thiserror::Error)]
#[error("{} folder operation(s) failed{}", failures.len(), render_failures(failures))]
pub struct PartialPropagationFailure {
    pub group_id: Option<GroupId>,
    pub failures: Vec<FolderFailure>,
}

fn render_failures(failures: &[FolderFailure]) -> String {
    failures
        .iter()
        .map(|failure| format!("\n  {failure}"))
        .collect()
}

/// Outcome of propagating files across a group.
#[derive(Debug, Clone)]
pub struct PropagationReport {
    pub group_id: GroupId,

    /// Links created by this pass.
    pub created: Vec<PathBuf>,

    pub notices: Vec<Notice>,
    pub failures: Vec<FolderFailure>,

    /// Pass stopped between folders because it was cancelled.
    pub cancelled: bool,
}

impl PropagationReport {
    fn new(group_id: GroupId) -> Self {
        Self {
            group_id,
            created: Vec::new(),
            notices: Vec::new(),
            failures: Vec::new(),
            cancelled: false,
        }
    }

    /// Every member was attempted and none failed.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && !self.cancelled
    }

    /// Nothing was created, reported, or failed.
    pub fn is_noop(&self) -> bool {
        self.created.is_empty() && self.notices.is_empty() && self.failures.is_empty()
    }

    /// Convert into error if any folder failed.
    ///
    /// # Errors
    ///
    /// - Return [`PartialPropagationFailure`] listing each failed folder.
    pub fn into_result(self) -> std::result::Result<Self, PartialPropagationFailure> {
        if self.failures.is_empty() {
            Ok(self)
        } else {
            Err(PartialPropagationFailure {
                group_id: Some(self.group_id),
                failures: self.failures,
            })
        }
    }
}

/// Every link that a removal would delete.
///
/// This is the deletion scope shown to the user before anything is removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovalPlan {
    /// Owning group, or `None` for a plain file outside any group.
    pub group_id: Option<GroupId>,

    /// Path the user asked to remove.
    pub requested: PathBuf,

    pub linked: LinkedFileSet,
}

impl RemovalPlan {
    pub fn identity(&self) -> FileIdentity {
        self.linked.identity
    }

    /// Removal affects more than the requested path.
    pub fn needs_confirmation(&self) -> bool {
        self.linked.len() > 1
    }
}

/// User decision on a [`RemovalPlan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalScope {
    /// Remove every link in the plan.
    All,

    /// Leave the filesystem untouched.
    Cancel,
}

/// Why a planned link was left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Name no longer exists.
    Missing,

    /// Name now carries different data.
    IdentityChanged(FileIdentity),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedEntry {
    pub path: PathBuf,
    pub reason: SkipReason,
}

/// Outcome of executing a [`RemovalPlan`].
#[derive(Debug, Clone)]
pub struct RemovalReport {
    pub group_id: Option<GroupId>,
    pub identity: FileIdentity,
    pub removed: Vec<PathBuf>,
    pub skipped: Vec<SkippedEntry>,
    pub failures: Vec<FolderFailure>,
    pub cancelled: bool,
}

impl RemovalReport {
    fn new(plan: &RemovalPlan) -> Self {
        Self {
            group_id: plan.group_id,
            identity: plan.identity(),
            removed: Vec::new(),
            skipped: Vec::new(),
            failures: Vec::new(),
            cancelled: false,
        }
    }

    /// Convert into error if any folder failed.
    ///
    /// # Errors
    ///
    /// - Return [`PartialPropagationFailure`] listing each failed folder.
    pub fn into_result(self) -> std::result::Result<Self, PartialPropagationFailure> {
        if self.failures.is_empty() {
            Ok(self)
        } else {
            Err(PartialPropagationFailure {
                group_id: self.group_id,
                failures: self.failures,
            })
        }
    }
}

/// Deletion observed by the watcher, awaiting a decision from the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDeletion {
    pub group_id: GroupId,
    pub folder: PathBuf,
    pub name: OsString,
    pub identity: FileIdentity,

    /// Links of the identity still present in other members.
    pub remaining: Vec<PathBuf>,

    pub detected_at: DateTime<Utc>,
}

/// Result of a manual single file link.
#[derive(Debug)]
pub struct LinkOutcome {
    pub path: PathBuf,

    /// Propagation into the rest of the destination's group, if it has one.
    pub propagation: Option<PropagationReport>,
}

/// Notification broadcast to UI subscribers.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Propagated(PropagationReport),
    Removed(RemovalReport),
    PendingDeletion(PendingDeletion),
}

#[derive(Debug, Default)]
struct EngineStatus {
    propagating: HashSet<GroupId>,
    needs_resync: HashSet<GroupId>,
    pending: VecDeque<PendingDeletion>,
}

/// Files of one folder keyed by identity.
///
/// Built fresh for every operation.
#[derive(Debug)]
struct FolderIndex {
    folder: PathBuf,
    files: HashMap<FileIdentity, OsString>,
    order: Vec<FileIdentity>,
}

impl FolderIndex {
    fn scan<F: NativeFs>(links: &LinkOperator<F>, folder: &Path) -> Result<Self, LinkError> {
        let mut index = Self {
            folder: folder.to_path_buf(),
            files: HashMap::new(),
            order: Vec::new(),
        };

        let mut entries = Vec::new();
        for entry in links.enumerate_links(folder)? {
            match entry {
                Ok(entry) => entries.push(entry),
                Err(err) => warn!("skip entry in {:?}: {err}", folder.display()),
            }
        }

        // INVARIANT: Deterministic order so reconciliation picks the same
        // source name for an identity on every run.
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        for entry in entries {
            index.insert(entry.identity, entry.name);
        }

        Ok(index)
    }

    fn contains(&self, identity: &FileIdentity) -> bool {
        self.files.contains_key(identity)
    }

    fn insert(&mut self, identity: FileIdentity, name: OsString) {
        if !self.files.contains_key(&identity) {
            self.order.push(identity);
            self.files.insert(identity, name);
        }
    }
}

/// Clears the propagating flag of a group when dropped.
struct PropagatingGuard<'a> {
    status: &'a Mutex<EngineStatus>,
    id: GroupId,
}

impl Drop for PropagatingGuard<'_> {
    fn drop(&mut self) {
        lock_status(self.status).propagating.remove(&self.id);
    }
}

fn lock_status(status: &Mutex<EngineStatus>) -> MutexGuard<'_, EngineStatus> {
    status.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Synchronization engine over a registry of mirror groups.
#[derive(Debug)]
pub struct SyncEngine<F = LocalFs>
where
    F: NativeFs,
{
    registry: Arc<Registry>,
    links: LinkOperator<F>,
    status: Mutex<EngineStatus>,
    events: broadcast::Sender<EngineEvent>,
}

impl SyncEngine<LocalFs> {
    /// Construct engine over the local filesystem.
    pub fn local(registry: Arc<Registry>) -> Self {
        Self::new(registry, Arc::new(LocalFs::new()))
    }
}

impl<F> SyncEngine<F>
where
    F: NativeFs,
{
    /// Construct new engine over registry and native filesystem capabilities.
    pub fn new(registry: Arc<Registry>, fs: Arc<F>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            registry,
            links: LinkOperator::new(fs),
            status: Mutex::new(EngineStatus::default()),
            events,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn links(&self) -> &LinkOperator<F> {
        &self.links
    }

    /// Subscribe to engine notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Current runtime state of group.
    ///
    /// # Errors
    ///
    /// - Return [`SyncError::Registry`] if group does not exist.
    pub fn state(&self, id: &GroupId) -> Result<GroupState> {
        let group = self.registry.group(id)?;
        if !group.watch_enabled {
            return Ok(GroupState::Disabled);
        }

        if lock_status(&self.status).propagating.contains(id) {
            Ok(GroupState::Propagating)
        } else {
            Ok(GroupState::Idle)
        }
    }

    /// Check if last propagation or reconciliation of group was incomplete.
    pub fn needs_resync(&self, id: &GroupId) -> bool {
        lock_status(&self.status).needs_resync.contains(id)
    }

    /// Create group and reconcile its members.
    ///
    /// # Errors
    ///
    /// - Return [`SyncError::Registry`] if group cannot be registered.
    #[instrument(skip(self, folders, name, cancel), level = "debug")]
    pub fn create_group(
        &self,
        folders: impl IntoIterator<Item = impl AsRef<Path>>,
        name: Option<String>,
        watch_enabled: bool,
        cancel: &CancellationToken,
    ) -> Result<(MirrorGroup, PropagationReport)> {
        let group = self.registry.create_group(folders, name, watch_enabled)?;
        let report = self.reconcile(&group.id, cancel)?;
        Ok((group, report))
    }

    /// Add folder to group and reconcile it with the other members.
    ///
    /// # Errors
    ///
    /// - Return [`SyncError::Registry`] if folder cannot be added.
    pub fn add_folder(
        &self,
        id: &GroupId,
        folder: impl AsRef<Path>,
        cancel: &CancellationToken,
    ) -> Result<(MirrorGroup, PropagationReport)> {
        self.registry.add_folder(id, folder)?;
        let report = self.reconcile(id, cancel)?;
        Ok((self.registry.group(id)?, report))
    }

    /// Remove folder from group, leaving files alone.
    ///
    /// # Errors
    ///
    /// - Return [`SyncError::Registry`] if folder cannot be removed.
    pub fn remove_folder(&self, id: &GroupId, folder: impl AsRef<Path>) -> Result<FolderRemoval> {
        let removal = self.registry.remove_folder(id, folder)?;
        if let FolderRemoval::Dissolved(_) = removal {
            self.forget(id);
        }

        Ok(removal)
    }

    /// Delete group, leaving files alone.
    ///
    /// # Errors
    ///
    /// - Return [`SyncError::Registry`] if group does not exist.
    pub fn delete_group(&self, id: &GroupId) -> Result<MirrorGroup> {
        let group = self.registry.delete_group(id)?;
        self.forget(id);
        Ok(group)
    }

    fn forget(&self, id: &GroupId) {
        let mut status = lock_status(&self.status);
        status.needs_resync.remove(id);
        status.pending.retain(|pending| pending.group_id != *id);
    }

    /// Act on a debounced watcher event.
    ///
    /// Events of disabled or unknown groups are dropped. Additions propagate
    /// immediately. Removals are queued as pending deletions when other
    /// members still link the file.
    ///
    /// # Errors
    ///
    /// - Return [`SyncError::PartialPropagation`] if some members could not
    ///   be updated.
    #[instrument(skip(self, cancel), level = "debug")]
    pub fn handle(&self, event: WatchEvent, cancel: &CancellationToken) -> Result<()> {
        let group = match self.registry.group(event.group_id()) {
            Ok(group) => group,
            Err(RegistryError::UnknownGroup { .. }) => {
                debug!("drop event of unknown group {}", event.group_id());
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        if !group.watch_enabled {
            debug!("drop event of disabled group {}", group.id);
            return Ok(());
        }

        match event {
            WatchEvent::Added {
                group_id,
                folder,
                name,
            } => match self.propagate_add(&group_id, &folder, &name, cancel) {
                Ok(report) => {
                    report.into_result()?;
                    Ok(())
                }
                // INVARIANT: File settled as added but was gone or replaced by
                // a non-file by the time the group lock was acquired.
                Err(SyncError::Link(LinkError::Identity(
                    IdentityError::NotFound { .. } | IdentityError::NotAFile { .. },
                ))) => {
                    debug!("{:?} is no longer a file", folder.join(&name).display());
                    Ok(())
                }
                Err(err) => Err(err),
            },
            WatchEvent::Removed {
                group_id,
                folder,
                name,
                identity,
            } => {
                let Some(identity) = identity else {
                    debug!("no identity known for removed {:?}", folder.join(&name).display());
                    return Ok(());
                };
                self.queue_deletion(&group_id, folder, name, identity)?;
                Ok(())
            }
        }
    }

    /// Propagate file `name` of member `folder` to every other member.
    ///
    /// # Errors
    ///
    /// - Return [`SyncError::Registry`] if group does not exist or folder is
    ///   not one of its members.
    /// - Return [`SyncError::Link`] if the source has no linkable identity.
    #[instrument(skip(self, folder, name, cancel), level = "debug")]
    pub fn propagate_add(
        &self,
        id: &GroupId,
        folder: impl AsRef<Path>,
        name: impl AsRef<OsStr>,
        cancel: &CancellationToken,
    ) -> Result<PropagationReport> {
        let folder = normalize_lossy(folder.as_ref());
        let name = name.as_ref();
        self.registry.with_group_lock(id, || -> Result<PropagationReport> {
            let group = self.registry.group(id)?;
            if !group.contains(&folder) {
                return Err(SyncError::Registry(RegistryError::NotAMember {
                    folder: folder.clone(),
                    group: *id,
                }));
            }

            self.propagate_locked(&group, &folder, name, cancel)
        })
    }

    // INVARIANT: Caller holds the group lock.
    fn propagate_locked(
        &self,
        group: &MirrorGroup,
        folder: &Path,
        name: &OsStr,
        cancel: &CancellationToken,
    ) -> Result<PropagationReport> {
        let source = folder.join(name);
        let identity = self.links.identity_of(&source)?;
        let _busy = self.begin(group.id);
        let mut report = PropagationReport::new(group.id);

        for member in group.folders.iter().filter(|member| member.as_path() != folder) {
            if cancel.is_cancelled() {
                info!("propagation of {:?} cancelled", source.display());
                report.cancelled = true;
                break;
            }

            let index = match FolderIndex::scan(&self.links, member) {
                Ok(index) => index,
                Err(error) => {
                    report.failures.push(FolderFailure::new(member, name, error));
                    continue;
                }
            };

            if index.contains(&identity) {
                continue;
            }

            self.place(&source, identity, member, name, &mut report);
        }

        self.finish(report)
    }

    /// Bring every member of group to the union of all members' files.
    ///
    /// # Errors
    ///
    /// - Return [`SyncError::Registry`] if group does not exist.
    #[instrument(skip(self, cancel), level = "debug")]
    pub fn reconcile(&self, id: &GroupId, cancel: &CancellationToken) -> Result<PropagationReport> {
        self.registry.with_group_lock(id, || -> Result<PropagationReport> {
            let group = self.registry.group(id)?;
            let _busy = self.begin(group.id);
            let mut report = PropagationReport::new(group.id);

            let mut indices = Vec::new();
            for folder in &group.folders {
                match FolderIndex::scan(&self.links, folder) {
                    Ok(index) => indices.push(index),
                    Err(error) => report
                        .failures
                        .push(FolderFailure::new(folder, OsString::new(), error)),
                }
            }

            // Union of identities with the first member and name seen for each.
            let mut union = Vec::new();
            let mut seen = HashSet::new();
            for index in &indices {
                for identity in &index.order {
                    if seen.insert(*identity) {
                        union.push((*identity, index.folder.clone(), index.files[identity].clone()));
                    }
                }
            }

            'members: for target in indices.iter_mut() {
                for (identity, folder, name) in &union {
                    if target.contains(identity) {
                        continue;
                    }

                    if cancel.is_cancelled() {
                        info!("reconciliation of group {} cancelled", group.id);
                        report.cancelled = true;
                        break 'members;
                    }

                    let source = folder.join(name);
                    if let Some(used) = self.place(&source, *identity, &target.folder, name, &mut report) {
                        target.insert(*identity, used);
                    }
                }
            }

            self.finish(report)
        })
    }

    /// Re-run reconciliation of group after an incomplete propagation.
    ///
    /// # Errors
    ///
    /// - Return [`SyncError::Registry`] if group does not exist.
    pub fn resync(&self, id: &GroupId) -> Result<PropagationReport> {
        info!("re-sync group {id}");
        self.reconcile(id, &CancellationToken::new())
    }

    /// Link `source` into `folder` under the requested name, or the first free
    /// disambiguated name. Returns name used on success.
    fn place(
        &self,
        source: &Path,
        identity: FileIdentity,
        folder: &Path,
        name: &OsStr,
        report: &mut PropagationReport,
    ) -> Option<OsString> {
        let mut candidate = name.to_os_string();
        let mut attempt = 0;
        loop {
            match self.links.link_into(source, identity, folder, &candidate) {
                Ok(path) => {
                    if attempt > 0 {
                        let notice = Notice::NameCollisionResolved {
                            folder: folder.to_path_buf(),
                            requested: name.to_os_string(),
                            used: candidate.clone(),
                        };
                        info!("{notice}");
                        report.notices.push(notice);
                    }
                    report.created.push(path);
                    return Some(candidate);
                }
                Err(LinkError::NameConflict { .. }) if attempt < MAX_DISAMBIGUATION => {
                    attempt += 1;
                    candidate = disambiguate(name, attempt);
                }
                Err(error) => {
                    warn!("failed to link {:?} into {:?}: {error}", source.display(), folder.display());
                    report.failures.push(FolderFailure::new(folder, name, error));
                    return None;
                }
            }
        }
    }

    fn begin(&self, id: GroupId) -> PropagatingGuard<'_> {
        lock_status(&self.status).propagating.insert(id);
        PropagatingGuard {
            status: &self.status,
            id,
        }
    }

    fn finish(&self, report: PropagationReport) -> Result<PropagationReport> {
        {
            let mut status = lock_status(&self.status);
            if report.is_complete() {
                status.needs_resync.remove(&report.group_id);
            } else if !report.failures.is_empty() {
                warn!("group {} needs re-sync", report.group_id);
                status.needs_resync.insert(report.group_id);
            }
        }

        if report.is_noop() {
            return Ok(report);
        }

        info!(
            "group {}: {} link(s) created, {} failure(s)",
            report.group_id,
            report.created.len(),
            report.failures.len()
        );

        let _ = self.events.send(EngineEvent::Propagated(report.clone()));

        Ok(report)
    }

    /// Compute deletion scope of removing file at path.
    ///
    /// Inside a group the plan lists every link of the file's identity
    /// across the members. Outside any group it lists the path alone.
    ///
    /// # Errors
    ///
    /// - Return [`SyncError::InvalidPath`] if path has no file name.
    /// - Return [`SyncError::Link`] if path has no linkable identity.
    #[instrument(skip(self, path), level = "debug")]
    pub fn plan_removal(&self, path: impl AsRef<Path>) -> Result<RemovalPlan> {
        let (folder, name) = split_path(path.as_ref())?;
        let requested = folder.join(&name);
        let identity = self.links.identity_of(&requested)?;

        let Some(group) = self.registry.group_for_folder(&folder) else {
            return Ok(RemovalPlan {
                group_id: None,
                requested: requested.clone(),
                linked: LinkedFileSet {
                    identity,
                    entries: vec![LinkedEntry {
                        folder,
                        name,
                        path: requested,
                    }],
                },
            });
        };

        let linked = self.registry.with_group_lock(&group.id, || {
            self.links.linked_file_set(identity, &group.folders)
        });

        Ok(RemovalPlan {
            group_id: Some(group.id),
            requested,
            linked,
        })
    }

    /// Execute removal plan with the scope the user chose.
    ///
    /// Every entry is re-resolved first. An entry whose name now carries
    /// different data is left alone and reported as skipped. Links of the
    /// identity that appeared in the group after planning are removed too.
    ///
    /// # Errors
    ///
    /// - Return [`SyncError::Registry`] if the persisted registry is corrupt.
    #[instrument(skip(self, plan), level = "debug")]
    pub fn execute_removal(&self, plan: &RemovalPlan, scope: RemovalScope) -> Result<RemovalReport> {
        let mut report = RemovalReport::new(plan);
        if scope == RemovalScope::Cancel {
            debug!("removal of {:?} cancelled", plan.requested.display());
            report.cancelled = true;
            return Ok(report);
        }

        self.registry.verify()?;
        let report = match plan.group_id {
            Some(id) => self.registry.with_group_lock(&id, || {
                let mut entries = plan.linked.entries.clone();
                if let Ok(group) = self.registry.group(&id) {
                    for fresh in self.links.linked_file_set(plan.identity(), &group.folders).entries {
                        if !entries.iter().any(|entry| entry.path == fresh.path) {
                            entries.push(fresh);
                        }
                    }
                }

                self.remove_entries(&entries, report)
            }),
            None => self.remove_entries(&plan.linked.entries, report),
        };

        if let (Some(id), false) = (report.group_id, report.failures.is_empty()) {
            warn!("group {id} needs re-sync");
            lock_status(&self.status).needs_resync.insert(id);
        }

        let _ = self.events.send(EngineEvent::Removed(report.clone()));

        Ok(report)
    }

    fn remove_entries(&self, entries: &[LinkedEntry], mut report: RemovalReport) -> RemovalReport {
        for entry in entries {
            match self.links.identity_of(&entry.path) {
                Ok(identity) if identity == report.identity => {}
                Ok(identity) => {
                    warn!("{:?} now holds different data, leaving it", entry.path.display());
                    report.skipped.push(SkippedEntry {
                        path: entry.path.clone(),
                        reason: SkipReason::IdentityChanged(identity),
                    });
                    continue;
                }
                Err(LinkError::Identity(IdentityError::NotFound { .. })) => {
                    report.skipped.push(SkippedEntry {
                        path: entry.path.clone(),
                        reason: SkipReason::Missing,
                    });
                    continue;
                }
                Err(error) => {
                    report
                        .failures
                        .push(FolderFailure::new(&entry.folder, &entry.name, error));
                    continue;
                }
            }

            match self.links.remove_hardlink(&entry.path) {
                Ok(()) => report.removed.push(entry.path.clone()),
                Err(LinkError::Identity(IdentityError::NotFound { .. })) => {
                    report.skipped.push(SkippedEntry {
                        path: entry.path.clone(),
                        reason: SkipReason::Missing,
                    });
                }
                Err(error) => report
                    .failures
                    .push(FolderFailure::new(&entry.folder, &entry.name, error)),
            }
        }

        info!("removed {} link(s) of {}", report.removed.len(), report.identity);
        report
    }

    /// Queue deletion observed by the watcher.
    ///
    /// Nothing is queued when no other member links the identity anymore, or
    /// when the same folder still links it under another name, as after a
    /// rename inside the folder.
    ///
    /// # Errors
    ///
    /// - Return [`SyncError::Registry`] if group does not exist.
    pub fn queue_deletion(
        &self,
        id: &GroupId,
        folder: PathBuf,
        name: OsString,
        identity: FileIdentity,
    ) -> Result<Option<PendingDeletion>> {
        let removed = folder.join(&name);
        let linked = self.registry.with_group_lock(id, || -> Result<LinkedFileSet> {
            let group = self.registry.group(id)?;
            Ok(self.links.linked_file_set(identity, &group.folders))
        })?;

        // INVARIANT: Data still linked in the folder it vanished from was
        // renamed or moved within that folder, not deleted from it.
        if let Some(kept) = linked
            .entries
            .iter()
            .find(|entry| entry.folder == folder && entry.path != removed)
        {
            debug!(
                "{:?} lives on as {:?}, nothing deleted",
                removed.display(),
                kept.path.display()
            );
            return Ok(None);
        }

        let remaining = linked
            .paths()
            .filter(|path| *path != removed)
            .map(Path::to_path_buf)
            .collect::<Vec<_>>();
        if remaining.is_empty() {
            debug!("no links of {identity} remain after {:?}", removed.display());
            return Ok(None);
        }

        let pending = PendingDeletion {
            group_id: *id,
            folder,
            name,
            identity,
            remaining,
            detected_at: Utc::now(),
        };
        info!(
            "{:?} was deleted, {} mirrored link(s) remain",
            removed.display(),
            pending.remaining.len()
        );
        lock_status(&self.status).pending.push_back(pending.clone());
        let _ = self.events.send(EngineEvent::PendingDeletion(pending.clone()));

        Ok(Some(pending))
    }

    /// Drain every queued pending deletion.
    pub fn take_pending_deletions(&self) -> Vec<PendingDeletion> {
        lock_status(&self.status).pending.drain(..).collect()
    }

    /// Apply user decision to a pending deletion.
    ///
    /// # Errors
    ///
    /// - Return [`SyncError::Registry`] if the persisted registry is corrupt.
    pub fn resolve_pending(&self, pending: &PendingDeletion, scope: RemovalScope) -> Result<RemovalReport> {
        let plan = RemovalPlan {
            group_id: Some(pending.group_id),
            requested: pending.folder.join(&pending.name),
            linked: LinkedFileSet {
                identity: pending.identity,
                entries: pending
                    .remaining
                    .iter()
                    .filter_map(|path| {
                        let (folder, name) = split_path(path).ok()?;
                        Some(LinkedEntry {
                            folder,
                            name,
                            path: path.clone(),
                        })
                    })
                    .collect(),
            },
        };

        self.execute_removal(&plan, scope)
    }

    /// Manually link a single file into a folder.
    ///
    /// If the destination belongs to an enabled group, the new link is
    /// propagated to the other members.
    ///
    /// # Errors
    ///
    /// - Return [`SyncError::NameCollisionUnresolvable`] if a different file
    ///   occupies the name.
    /// - Return [`SyncError::Link`] for any other link failure.
    #[instrument(skip(self, source, dest_folder, name, cancel), level = "debug")]
    pub fn link_file(
        &self,
        source: impl AsRef<Path>,
        dest_folder: impl AsRef<Path>,
        name: Option<OsString>,
        cancel: &CancellationToken,
    ) -> Result<LinkOutcome> {
        let source = source.as_ref();
        let dest_folder = normalize_lossy(dest_folder.as_ref());
        let name = match name {
            Some(name) => name,
            None => split_path(source)?.1,
        };

        let link = || -> Result<PathBuf> {
            self.links
                .create_hardlink(source, &dest_folder, &name)
                .map_err(|err| match err {
                    LinkError::NameConflict { path } => SyncError::NameCollisionUnresolvable { path },
                    err => err.into(),
                })
        };

        let Some(group) = self.registry.group_for_folder(&dest_folder) else {
            return Ok(LinkOutcome {
                path: link()?,
                propagation: None,
            });
        };

        self.registry.with_group_lock(&group.id, || -> Result<LinkOutcome> {
            let path = link()?;
            let propagation = if group.watch_enabled {
                Some(self.propagate_locked(&group, &dest_folder, &name, cancel)?)
            } else {
                None
            };

            Ok(LinkOutcome { path, propagation })
        })
    }

    /// Find every link of file in `folders`, or in the members of its group
    /// when no folders are given.
    ///
    /// # Errors
    ///
    /// - Return [`SyncError::Link`] if path has no linkable identity.
    pub fn find_links(&self, path: impl AsRef<Path>, folders: &[PathBuf]) -> Result<LinkReport> {
        let path = path.as_ref();
        if !folders.is_empty() {
            return Ok(self.links.find_links(path, folders)?);
        }

        let (folder, _) = split_path(path)?;
        let scope = match self.registry.group_for_folder(&folder) {
            Some(group) => group.folders,
            None => vec![folder],
        };

        Ok(self.links.find_links(path, scope)?)
    }

    /// Register groups for folders that already share hardlinked files.
    ///
    /// Each folder is walked with all of its subfolders. Folders sharing at
    /// least one identity anywhere in their trees are connected. Every
    /// connected set of two or more folders becomes a new group. Folders that
    /// already belong to a group are left out.
    ///
    /// # Errors
    ///
    /// - Return [`SyncError::Registry`] if a group cannot be registered.
    #[instrument(skip(self, folders), level = "debug")]
    pub fn discover_groups(
        &self,
        folders: impl IntoIterator<Item = impl AsRef<Path>>,
    ) -> Result<Vec<MirrorGroup>> {
        let mut candidates: Vec<PathBuf> = Vec::new();
        for folder in folders {
            let folder = normalize_lossy(folder.as_ref());
            if candidates.contains(&folder) {
                continue;
            }

            if let Some(group) = self.registry.group_for_folder(&folder) {
                debug!("skip {:?}, already in group {}", folder.display(), group.id);
                continue;
            }
            candidates.push(folder);
        }

        let mut sets = DisjointSet::new(candidates.len());
        let mut owners: HashMap<FileIdentity, usize> = HashMap::new();
        for (index, folder) in candidates.iter().enumerate() {
            let entries = match self.links.walk_links(folder) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!("skip {:?}: {err}", folder.display());
                    continue;
                }
            };

            for entry in entries.flatten() {
                match owners.get(&entry.identity) {
                    Some(owner) => sets.union(*owner, index),
                    None => {
                        owners.insert(entry.identity, index);
                    }
                }
            }
        }

        let mut created = Vec::new();
        for component in sets.components() {
            if component.len() < 2 {
                continue;
            }

            let members = component.iter().map(|index| &candidates[*index]);
            created.push(self.registry.create_group(members, None, true)?);
        }
        info!("discovered {} group(s)", created.len());

        Ok(created)
    }

    /// Report folders below `roots` whose trees hold identical content.
    ///
    /// Unlike [`discover_groups`](Self::discover_groups) nothing needs to be
    /// hardlinked yet, and nothing is registered. Candidates whose folder set
    /// is already a registered group are left out.
    #[instrument(skip(self, roots, cancel), level = "debug")]
    pub fn scan_content_mirrors(
        &self,
        roots: impl IntoIterator<Item = impl AsRef<Path>>,
        cancel: &CancellationToken,
    ) -> ContentScan {
        let registered = self
            .registry
            .groups()
            .into_iter()
            .map(|group| {
                let mut folders = group.folders;
                folders.sort();
                folders
            })
            .collect::<HashSet<_>>();

        let mut scan = ContentScanner::new(Arc::clone(self.links.native())).scan(roots, cancel);
        scan.candidates
            .retain(|candidate| !registered.contains(&candidate.folders));
        info!("found {} content mirror candidate(s)", scan.candidates.len());

        scan
    }
}

/// Union-find over folder indices.
#[derive(Debug)]
struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
        }
    }

    fn find(&mut self, mut node: usize) -> usize {
        while self.parent[node] != node {
            self.parent[node] = self.parent[self.parent[node]];
            node = self.parent[node];
        }
        node
    }

    fn union(&mut self, a: usize, b: usize) {
        let (a, b) = (self.find(a), self.find(b));
        if a != b {
            self.parent[a] = b;
        }
    }

    /// Connected components, each in ascending index order.
    fn components(&mut self) -> Vec<Vec<usize>> {
        let mut components: Vec<Vec<usize>> = Vec::new();
        let mut roots: HashMap<usize, usize> = HashMap::new();
        for node in 0..self.parent.len() {
            let root = self.find(node);
            let slot = *roots.entry(root).or_insert_with(|| {
                components.push(Vec::new());
                components.len() - 1
            });
            components[slot].push(node);
        }
        components
    }
}

/// Build `stem (n).ext` variant of a file name.
pub(crate) fn disambiguate(name: &OsStr, attempt: u32) -> OsString {
    let path = Path::new(name);
    let stem = path.file_stem().unwrap_or(name);
    let mut candidate = stem.to_os_string();
    candidate.push(format!(" ({attempt})"));
    if let Some(ext) = path.extension() {
        candidate.push(".");
        candidate.push(ext);
    }
    candidate
}

fn split_path(path: &Path) -> Result<(PathBuf, OsString)> {
    let name = path.file_name().ok_or_else(|| SyncError::InvalidPath {
        path: path.to_path_buf(),
    })?;
    let folder = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    Ok((normalize_lossy(folder), name.to_os_string()))
}

/// Synchronization error types.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Link(#[from] LinkError),

    /// Manual link target name is taken by a different file.
    #[error("name {:?} is taken by a different file, choose another name", path.display())]
    NameCollisionUnresolvable { path: PathBuf },

    #[error(transparent)]
    PartialPropagation(#[from] PartialPropagationFailure),

    /// Path does not name a file.
    #[error("path {:?} does not name a file", path.display())]
    InvalidPath { path: PathBuf },
}

/// Friendly result alias :3
pub type Result<T, E = SyncError> = std::result::Result<T, E>;
