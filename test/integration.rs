// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use crate::{identity, MirrorFixture};

use anyhow::Result;
use linkmirror::{
    sync::{RemovalScope, SyncError},
    watch::{WatchEvent, Watchers},
    LinkOperator, LocalFs, SearchEngine,
};
use pretty_assertions::assert_eq;
use std::{
    fs,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;

#[test]
fn mirror_file_then_remove_everywhere() -> Result<()> {
    let fixture = MirrorFixture::new()?;
    let a = fixture.folder("A")?;
    let b = fixture.folder("B")?;
    let engine = fixture.engine()?;
    let cancel = CancellationToken::new();
    let (group, report) = engine.create_group([&a, &b], None, true, &cancel)?;
    assert!(report.is_noop());
    assert_eq!(group.name, "A + B");

    fixture.write(&a, "x.pdf", "ten bytes!")?;
    engine.handle(
        WatchEvent::Added {
            group_id: group.id,
            folder: a.clone(),
            name: "x.pdf".into(),
        },
        &cancel,
    )?;
    assert_eq!(identity(b.join("x.pdf"))?, identity(a.join("x.pdf"))?);

    let plan = engine.plan_removal(a.join("x.pdf"))?;
    assert!(plan.needs_confirmation());
    assert_eq!(
        plan.linked.paths().map(|path| path.to_path_buf()).collect::<Vec<_>>(),
        vec![a.join("x.pdf"), b.join("x.pdf")]
    );

    let report = engine.execute_removal(&plan, RemovalScope::All)?.into_result()?;
    assert_eq!(report.removed.len(), 2);
    assert!(!a.join("x.pdf").exists());
    assert!(!b.join("x.pdf").exists());

    Ok(())
}

#[test]
fn create_group_reconciles_existing_files() -> Result<()> {
    let fixture = MirrorFixture::new()?;
    let a = fixture.folder("Books")?;
    let b = fixture.folder("Reading")?;
    fixture.write(&a, "moby.epub", "call me ishmael")?;
    fixture.write(&b, "dune.epub", "fear is the mind-killer")?;
    fs::create_dir(b.join("nested"))?;
    fixture.write(b.join("nested"), "deep.epub", "not mirrored")?;

    let engine = fixture.engine()?;
    let (_, report) = engine.create_group([&a, &b], None, true, &CancellationToken::new())?;
    assert!(report.is_complete());
    assert_eq!(report.created.len(), 2);

    assert_eq!(identity(a.join("dune.epub"))?, identity(b.join("dune.epub"))?);
    assert_eq!(identity(b.join("moby.epub"))?, identity(a.join("moby.epub"))?);
    assert!(!a.join("nested").exists());

    Ok(())
}

#[test]
fn registry_survives_restart() -> Result<()> {
    let fixture = MirrorFixture::new()?;
    let a = fixture.folder("A")?;
    let b = fixture.folder("B")?;
    let c = fixture.folder("C")?;

    let id = {
        let engine = fixture.engine()?;
        let (group, _) =
            engine.create_group([&a, &b], Some("papers".into()), false, &CancellationToken::new())?;
        group.id
    };

    let engine = fixture.engine()?;
    let registry = engine.registry();
    assert_eq!(registry.resolve_ref("papers")?, id);
    assert_eq!(registry.resolve_ref(&id.to_string()[..8])?, id);

    let group = registry.group(&id)?;
    assert_eq!(group.folders, vec![a.clone(), b.clone()]);
    assert!(!group.watch_enabled);

    engine.add_folder(&id, &c, &CancellationToken::new())?;
    registry.rename_group(&id, "archive")?;

    let engine = fixture.engine()?;
    let group = engine.registry().group(&id)?;
    assert_eq!(group.name, "archive");
    assert_eq!(group.folders, vec![a, b, c]);
    assert!(group.modified_at >= group.created_at);

    Ok(())
}

#[test]
fn manual_link_into_group_propagates() -> Result<()> {
    let fixture = MirrorFixture::new()?;
    let inbox = fixture.folder("inbox")?;
    let a = fixture.folder("A")?;
    let b = fixture.folder("B")?;
    let c = fixture.folder("C")?;
    let engine = fixture.engine()?;
    let cancel = CancellationToken::new();
    engine.create_group([&a, &b, &c], None, true, &cancel)?;

    let source = fixture.write(&inbox, "scan.png", "pixels")?;
    let outcome = engine.link_file(&source, &b, Some("receipt.png".into()), &cancel)?;
    assert_eq!(outcome.path, b.join("receipt.png"));

    let report = outcome.propagation.expect("b is grouped");
    assert_eq!(report.created, vec![a.join("receipt.png"), c.join("receipt.png")]);

    let links = engine.find_links(&source, &[inbox.clone(), a.clone(), b.clone(), c.clone()])?;
    assert_eq!(links.link_count, 4);
    assert_eq!(links.paths.len(), 4);

    // Same name with different data cannot be disambiguated for manual links.
    let other = fixture.write(&inbox, "other.png", "more pixels")?;
    let result = engine.link_file(&other, &b, Some("receipt.png".into()), &cancel);
    assert!(matches!(result, Err(SyncError::NameCollisionUnresolvable { .. })));

    Ok(())
}

#[test]
fn concurrent_propagation_and_removal_agree() -> Result<()> {
    let fixture = MirrorFixture::new()?;
    let a = fixture.folder("A")?;
    let b = fixture.folder("B")?;
    let engine = fixture.engine()?;
    let (group, _) = engine.create_group([&a, &b], None, true, &CancellationToken::new())?;

    let names = (0..24).map(|n| format!("file-{n:02}.txt")).collect::<Vec<_>>();
    for name in &names {
        fixture.write(&a, name, name)?;
    }

    let propagator = {
        let engine = Arc::clone(&engine);
        let names = names.clone();
        let a = a.clone();
        thread::spawn(move || {
            for name in &names {
                // Removal may win the race for even files, leaving nothing to link.
                let _ = engine.propagate_add(&group.id, &a, name, &CancellationToken::new());
            }
        })
    };
    let remover = {
        let engine = Arc::clone(&engine);
        let names = names.clone();
        let a = a.clone();
        thread::spawn(move || -> Result<()> {
            for name in names.iter().step_by(2) {
                let plan = engine.plan_removal(a.join(name))?;
                engine.execute_removal(&plan, RemovalScope::All)?.into_result()?;
            }
            Ok(())
        })
    };

    propagator.join().expect("propagator panicked");
    remover.join().expect("remover panicked")?;

    for (n, name) in names.iter().enumerate() {
        if n % 2 == 0 {
            assert!(!a.join(name).exists(), "{name} left in A");
            assert!(!b.join(name).exists(), "{name} left in B");
        } else {
            assert_eq!(identity(a.join(name))?, identity(b.join(name))?);
        }
    }

    Ok(())
}

#[test]
fn search_and_discover_find_shared_files() -> Result<()> {
    let fixture = MirrorFixture::new()?;
    let a = fixture.folder("A")?;
    let b = fixture.folder("B")?;
    let c = fixture.folder("C")?;
    let shared = fixture.write(&a, "Shared.mkv", "frames")?;
    fs::hard_link(&shared, b.join("shared-copy.mkv"))?;
    fixture.write(&c, "Shared.mkv", "same name, other data")?;

    let search = SearchEngine::new(LinkOperator::new(Arc::new(LocalFs::new())));
    let outcome = search.intersect([&a, &b, &c], None, &CancellationToken::new())?;
    assert!(outcome.matches.is_empty());

    let outcome = search.intersect([&a, &b], Some("shared"), &CancellationToken::new())?;
    assert_eq!(outcome.matches.len(), 1);
    assert_eq!(outcome.matches[0].paths, vec![a.join("Shared.mkv"), b.join("shared-copy.mkv")]);
    assert_eq!(outcome.matches[0].size, 6);

    let engine = fixture.engine()?;
    let groups = engine.discover_groups([&a, &b, &c])?;
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].folders, vec![a.clone(), b.clone()]);

    // Already grouped folders are not offered again.
    let engine = fixture.engine()?;
    assert!(engine.discover_groups([&a, &b, &c])?.is_empty());

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watcher_propagates_and_queues_deletions() -> Result<()> {
    let fixture = MirrorFixture::new()?;
    let a = fixture.folder("A")?;
    let b = fixture.folder("B")?;
    let engine = fixture.engine()?;
    engine.create_group([&a, &b], None, true, &CancellationToken::new())?;

    let mut watchers = Watchers::new(Arc::clone(&engine), Duration::from_millis(100));
    watchers.sync_with_registry().await?;
    assert_eq!(watchers.active().count(), 1);

    fixture.write(&a, "x.pdf", "ten bytes!")?;
    assert!(eventually(|| b.join("x.pdf").exists()).await);
    assert_eq!(identity(b.join("x.pdf"))?, identity(a.join("x.pdf"))?);

    fs::remove_file(a.join("x.pdf"))?;
    let mut pending = Vec::new();
    assert!(
        eventually(|| {
            pending.extend(engine.take_pending_deletions());
            !pending.is_empty()
        })
        .await
    );
    assert_eq!(pending[0].folder, a);
    assert_eq!(pending[0].remaining, vec![b.join("x.pdf")]);

    let report = engine.resolve_pending(&pending[0], RemovalScope::Cancel)?;
    assert!(report.cancelled);
    assert!(b.join("x.pdf").exists());

    watchers.shutdown().await;

    Ok(())
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    false
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watchers_follow_registry_edits_of_other_processes() -> Result<()> {
    let fixture = MirrorFixture::new()?;
    let a = fixture.folder("A")?;
    let b = fixture.folder("B")?;
    let engine = fixture.engine()?;
    let mut watchers = Watchers::new(Arc::clone(&engine), Duration::from_millis(100));
    watchers.sync_with_registry().await?;
    assert_eq!(watchers.active().count(), 0);

    let other = fixture.engine()?;
    let (group, _) = other.create_group([&a, &b], None, true, &CancellationToken::new())?;
    watchers.sync_with_registry().await?;
    assert_eq!(watchers.active().collect::<Vec<_>>(), vec![&group.id]);

    other.registry().set_watch_enabled(&group.id, false)?;
    watchers.sync_with_registry().await?;
    assert_eq!(watchers.active().count(), 0);

    watchers.shutdown().await;

    Ok(())
}
