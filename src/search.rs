// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Intersection search over arbitrary folder sets.
//!
//! Finds files present in __every__ given folder, where "present" means some
//! entry of the folder resolves to the file's identity. Names do not need to
//! agree across folders. Works on any folders, grouped or not.

use crate::{
    identity::FileIdentity,
    link::{LinkError, LinkOperator},
    native::{LocalFs, NativeFs},
    registry::normalize_lossy,
};

use glob::{MatchOptions, Pattern, PatternError};
use std::{
    collections::{HashMap, HashSet},
    ffi::{OsStr, OsString},
    path::{Path, PathBuf},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// Identity found in every searched folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchMatch {
    pub identity: FileIdentity,

    /// Representative name, taken from the first folder.
    pub name: OsString,

    /// Every path carrying the identity, one or more per folder, sorted.
    pub paths: Vec<PathBuf>,

    /// Size of the file data in bytes.
    pub size: u64,
}

/// Path left out of a search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedPath {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchStatus {
    Complete,

    /// Search was cancelled. Matches only cover folders scanned in full.
    Cancelled,
}

/// Result of an intersection search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchOutcome {
    pub matches: Vec<SearchMatch>,
    pub skipped: Vec<SkippedPath>,
    pub status: SearchStatus,
}

/// Optional name filter of a search.
///
/// A pattern without glob metacharacters matches names containing it.
/// Matching ignores case.
#[derive(Debug, Clone)]
pub struct NameFilter {
    pattern: Pattern,
}

impl NameFilter {
    /// Compile name filter.
    ///
    /// # Errors
    ///
    /// - Return [`SearchError::InvalidPattern`] if pattern is not a valid glob.
    pub fn new(pattern: &str) -> Result<Self> {
        let glob = if pattern.contains(['*', '?', '[']) {
            pattern.to_string()
        } else {
            format!("*{}*", Pattern::escape(pattern))
        };

        let pattern = Pattern::new(&glob).map_err(|source| SearchError::InvalidPattern {
            source,
            pattern: pattern.into(),
        })?;

        Ok(Self { pattern })
    }

    pub fn matches(&self, name: &OsStr) -> bool {
        self.pattern
            .matches_with(&name.to_string_lossy(), MATCH_OPTIONS)
    }
}

#[derive(Debug, Default)]
struct Hit {
    folders: usize,
    name: OsString,
    paths: Vec<PathBuf>,
    size: u64,
}

/// Identity based intersection search.
#[derive(Debug, Clone)]
pub struct SearchEngine<F = LocalFs>
where
    F: NativeFs,
{
    links: LinkOperator<F>,
}

impl<F> SearchEngine<F>
where
    F: NativeFs,
{
    pub fn new(links: LinkOperator<F>) -> Self {
        Self { links }
    }

    /// Find identities present in every folder.
    ///
    /// Unreadable entries are skipped with a diagnostic. A folder that cannot
    /// be listed is reported as skipped and counts as empty, so nothing is in
    /// every folder. On cancellation the matches gathered over fully scanned folders are
    /// returned with [`SearchStatus::Cancelled`].
    ///
    /// # Errors
    ///
    /// - Return [`SearchError::InsufficientFolders`] if fewer than two
    ///   distinct folders are given.
    /// - Return [`SearchError::InvalidPattern`] if pattern is not a valid
    ///   glob.
    #[instrument(skip(self, folders, cancel), level = "debug")]
    pub fn intersect(
        &self,
        folders: impl IntoIterator<Item = impl AsRef<Path>>,
        pattern: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<SearchOutcome> {
        let mut distinct: Vec<PathBuf> = Vec::new();
        for folder in folders {
            let folder = normalize_lossy(folder.as_ref());
            if !distinct.contains(&folder) {
                distinct.push(folder);
            }
        }

        if distinct.len() < 2 {
            return Err(SearchError::InsufficientFolders {
                count: distinct.len(),
            });
        }

        let filter = pattern.map(NameFilter::new).transpose()?;
        let mut hits: HashMap<FileIdentity, Hit> = HashMap::new();
        let mut skipped = Vec::new();
        let mut status = SearchStatus::Complete;

        // Number of folders scanned in full.
        let mut scanned = 0;

        // INVARIANT: A folder that cannot be listed holds nothing, which
        // empties the intersection.
        let mut unlisted = false;
        'folders: for folder in &distinct {
            let entries = match self.links.enumerate_links(folder) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!("cannot list folder {:?}: {err}", folder.display());
                    skipped.push(SkippedPath {
                        path: folder.clone(),
                        reason: err.to_string(),
                    });
                    unlisted = true;
                    continue;
                }
            };

            let mut seen_here = HashSet::new();
            for entry in entries {
                if cancel.is_cancelled() {
                    status = SearchStatus::Cancelled;
                    break 'folders;
                }

                let entry = match entry {
                    Ok(entry) => entry,
                    Err(err) => {
                        skipped.push(skipped_entry(folder, err));
                        continue;
                    }
                };

                // INVARIANT: Only identities seen in every earlier folder can
                // still be part of the intersection.
                let identity = entry.identity;
                let candidate = match hits.get(&identity) {
                    Some(hit) => {
                        hit.folders == scanned
                            || (hit.folders == scanned + 1 && seen_here.contains(&identity))
                    }
                    None => scanned == 0,
                };
                if !candidate {
                    continue;
                }

                let hit = hits.entry(identity).or_default();
                if seen_here.insert(identity) {
                    hit.folders += 1;
                }
                if hit.paths.is_empty() {
                    hit.size = self
                        .links
                        .native()
                        .stat(&entry.path)
                        .map(|stat| stat.len)
                        .unwrap_or_default();
                    hit.name = entry.name;
                }
                hit.paths.push(entry.path);
            }

            scanned += 1;
        }

        let mut matches = Vec::new();
        for (identity, mut hit) in hits {
            if unlisted || scanned < 2 || hit.folders != scanned {
                continue;
            }

            hit.paths.sort();
            if let Some(filter) = &filter {
                let named = hit
                    .paths
                    .iter()
                    .filter_map(|path| path.file_name())
                    .any(|name| filter.matches(name));
                if !named {
                    continue;
                }
            }

            matches.push(SearchMatch {
                identity,
                name: hit.name,
                paths: hit.paths,
                size: hit.size,
            });
        }

        matches.sort_by_cached_key(|found| found.name.to_string_lossy().to_lowercase());
        debug!("intersection has {} match(es)", matches.len());

        Ok(SearchOutcome {
            matches,
            skipped,
            status,
        })
    }
}

fn skipped_entry(folder: &Path, err: LinkError) -> SkippedPath {
    warn!("skip entry in {:?}: {err}", folder.display());
    SkippedPath {
        path: folder.to_path_buf(),
        reason: err.to_string(),
    }
}

/// Search error types.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    /// Intersection needs at least two folders.
    #[error("intersection search needs at least 2 folders, got {count}")]
    InsufficientFolders { count: usize },

    /// Name filter is not a valid glob.
    #[error("invalid name pattern {pattern:?}")]
    InvalidPattern {
        #[source]
        source: PatternError,
        pattern: String,
    },
}

/// Friendly result alias :3
pub type Result<T, E = SearchError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;
    use std::{fs, sync::Arc};

    fn engine() -> SearchEngine {
        SearchEngine::new(LinkOperator::new(Arc::new(LocalFs::new())))
    }

    struct Shelves {
        _root: tempfile::TempDir,
        a: PathBuf,
        b: PathBuf,
        ids: Vec<FileIdentity>,
    }

    // A holds files 1, 2, 3 and B holds 2, 3, 4, with B naming shared files
    // differently.
    fn shelves() -> anyhow::Result<Shelves> {
        let root = tempfile::tempdir()?;
        let a = root.path().join("A");
        let b = root.path().join("B");
        fs::create_dir_all(&a)?;
        fs::create_dir_all(&b)?;
        let (a, b) = (a.canonicalize()?, b.canonicalize()?);

        fs::write(a.join("one.txt"), b"1")?;
        fs::write(a.join("two.txt"), b"22")?;
        fs::write(a.join("three.pdf"), b"333")?;
        fs::hard_link(a.join("two.txt"), b.join("deux.txt"))?;
        fs::hard_link(a.join("three.pdf"), b.join("trois.pdf"))?;
        fs::write(b.join("four.txt"), b"4444")?;
        fs::write(b.join("one.txt"), b"same name, other data")?;

        let ids = ["one.txt", "two.txt", "three.pdf"]
            .iter()
            .map(|name| FileIdentity::resolve(a.join(name)))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Shelves {
            _root: root,
            a,
            b,
            ids,
        })
    }

    #[test]
    fn intersect_matches_by_identity_not_name() -> anyhow::Result<()> {
        let shelves = shelves()?;
        let outcome = engine().intersect([&shelves.a, &shelves.b], None, &CancellationToken::new())?;

        assert_eq!(outcome.status, SearchStatus::Complete);
        let found = outcome.matches.iter().map(|m| m.identity).collect::<HashSet<_>>();
        assert_eq!(found, HashSet::from([shelves.ids[1], shelves.ids[2]]));

        let three = outcome
            .matches
            .iter()
            .find(|m| m.identity == shelves.ids[2])
            .expect("three.pdf is shared");
        assert_eq!(three.name, OsString::from("three.pdf"));
        assert_eq!(three.size, 3);
        assert_eq!(three.paths, vec![shelves.a.join("three.pdf"), shelves.b.join("trois.pdf")]);

        Ok(())
    }

    #[test_case("deux", 1; "substring of other folder's name")]
    #[test_case("*.PDF", 1; "case insensitive glob")]
    #[test_case("*.txt", 1; "glob")]
    #[test_case("four", 0; "name outside intersection")]
    #[test]
    fn intersect_filters_by_any_name(pattern: &str, expect: usize) -> anyhow::Result<()> {
        use pretty_assertions::assert_eq;

        let shelves = shelves()?;
        let outcome = engine().intersect(
            [&shelves.a, &shelves.b],
            Some(pattern),
            &CancellationToken::new(),
        )?;
        assert_eq!(outcome.matches.len(), expect);

        Ok(())
    }

    #[test]
    fn intersect_requires_two_distinct_folders() -> anyhow::Result<()> {
        let shelves = shelves()?;
        let result = engine().intersect([&shelves.a, &shelves.a], None, &CancellationToken::new());
        assert!(matches!(result, Err(SearchError::InsufficientFolders { count: 1 })));

        Ok(())
    }

    #[test]
    fn intersect_with_missing_folder_is_empty() -> anyhow::Result<()> {
        let shelves = shelves()?;
        let missing = shelves.a.join("gone");
        let outcome = engine().intersect(
            [&shelves.a, &shelves.b, &missing],
            None,
            &CancellationToken::new(),
        )?;

        assert_eq!(outcome.status, SearchStatus::Complete);
        assert!(outcome.matches.is_empty());
        assert_eq!(outcome.skipped.len(), 1);
        assert_eq!(outcome.skipped[0].path, missing);

        // Order of folders does not matter.
        let outcome = engine().intersect(
            [&missing, &shelves.a, &shelves.b],
            None,
            &CancellationToken::new(),
        )?;
        assert!(outcome.matches.is_empty());

        Ok(())
    }

    #[test]
    fn cancelled_search_reports_status() -> anyhow::Result<()> {
        let shelves = shelves()?;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = engine().intersect([&shelves.a, &shelves.b], None, &cancel)?;
        assert_eq!(outcome.status, SearchStatus::Cancelled);
        assert!(outcome.matches.is_empty());

        Ok(())
    }
}
