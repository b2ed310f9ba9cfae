// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use linkmirror::{
    config::Settings,
    path::default_config_path,
    registry::{FolderRemoval, MirrorGroup},
    search::{SearchOutcome, SearchStatus},
    sync::{EngineEvent, PendingDeletion, PropagationReport, RemovalPlan, RemovalScope},
    watch::Watchers,
    LinkOperator, LocalFs, Registry, SearchEngine, SyncEngine,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use inquire::Confirm;
use std::{ffi::OsString, path::PathBuf, process::exit, sync::Arc, time::Duration};
use tokio::{
    sync::broadcast::error::RecvError,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// How often `watch` checks the registry for groups edited elsewhere.
const REGISTRY_REFRESH: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "linkmirror [options] <command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    /// Path to settings file.
    #[arg(long, global = true, value_name = "path")]
    pub config: Option<PathBuf>,

    /// Path to mirror group registry, overriding settings.
    #[arg(long, global = true, value_name = "path")]
    pub registry: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    fn settings(&self) -> Result<Settings> {
        let path = match &self.config {
            Some(path) => path.clone(),
            None => default_config_path()?,
        };
        let mut settings = Settings::load(path)?;
        if let Some(registry) = &self.registry {
            settings.registry_path = Some(registry.clone());
        }

        Ok(settings)
    }

    async fn run(self, settings: Settings) -> Result<()> {
        let registry = Registry::open(settings.registry_path()?)?;
        let engine = Arc::new(SyncEngine::local(Arc::new(registry)));

        match self.command {
            Command::Group(command) => run_group(command, engine),
            Command::Link(opts) => run_link(opts, engine),
            Command::Unlink(opts) => run_unlink(opts, engine),
            Command::Links(opts) => run_links(opts, engine),
            Command::Search(opts) => run_search(opts).await,
            Command::Watch => run_watch(engine, settings.debounce()).await,
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Manage mirror groups.
    #[command(subcommand)]
    Group(GroupCommand),

    /// Hardlink file into folder, propagating it if the folder is mirrored.
    #[command(override_usage = "linkmirror link [options] <file> <dest_dir>")]
    Link(LinkOptions),

    /// Remove file, choosing whether its mirrored links go too.
    #[command(override_usage = "linkmirror unlink [options] <path>")]
    Unlink(UnlinkOptions),

    /// Show every link to a file.
    #[command(override_usage = "linkmirror links [options] <file> [<dirs>]...")]
    Links(LinksOptions),

    /// Find files present in every given folder.
    #[command(override_usage = "linkmirror search [options] <folders>...")]
    Search(SearchOptions),

    /// Watch enabled mirror groups and propagate changes.
    Watch,
}

#[derive(Debug, Clone, Subcommand)]
enum GroupCommand {
    /// Create mirror group and reconcile its folders.
    #[command(override_usage = "linkmirror group create [options] <folders>...")]
    Create(CreateOptions),

    /// List mirror groups.
    List,

    /// Show details of mirror group.
    Show(GroupRef),

    /// Add folder to mirror group.
    Add(FolderOptions),

    /// Remove folder from mirror group. Files stay where they are.
    Remove(FolderOptions),

    /// Delete mirror group. Files stay where they are.
    Delete(GroupRef),

    /// Rename mirror group.
    Rename(RenameOptions),

    /// Enable watching of mirror group.
    Enable(GroupRef),

    /// Disable watching of mirror group.
    Disable(GroupRef),

    /// Re-sync mirror group after incomplete propagation.
    Sync(GroupRef),

    /// Register groups for folders that already share hardlinks.
    #[command(override_usage = "linkmirror group discover [--content] <folders>...")]
    Discover(DiscoverOptions),
}

#[derive(Parser, Clone, Debug)]
struct GroupRef {
    /// Group id, unique id prefix, or name.
    #[arg(required = true, value_name = "group")]
    pub group: String,
}

#[derive(Parser, Clone, Debug)]
struct CreateOptions {
    /// Folders to mirror.
    #[arg(required = true, num_args = 2.., value_name = "folder")]
    pub folders: Vec<PathBuf>,

    /// Name of group. Defaults to folder names joined by " + ".
    #[arg(short, long, value_name = "name")]
    pub name: Option<String>,

    /// Do not watch group for changes.
    #[arg(long)]
    pub no_watch: bool,
}

#[derive(Parser, Clone, Debug)]
struct FolderOptions {
    /// Group id, unique id prefix, or name.
    #[arg(required = true, value_name = "group")]
    pub group: String,

    #[arg(required = true, value_name = "folder")]
    pub folder: PathBuf,
}

#[derive(Parser, Clone, Debug)]
struct RenameOptions {
    /// Group id, unique id prefix, or name.
    #[arg(required = true, value_name = "group")]
    pub group: String,

    #[arg(required = true, value_name = "name")]
    pub name: String,
}

#[derive(Parser, Clone, Debug)]
struct DiscoverOptions {
    /// Folders to scan for shared hardlinks.
    #[arg(required = true, num_args = 1.., value_name = "folder")]
    pub folders: Vec<PathBuf>,

    /// Only report subfolders holding identical content, linked or not.
    #[arg(long)]
    pub content: bool,
}

#[derive(Parser, Clone, Debug)]
struct LinkOptions {
    #[arg(required = true, value_name = "file")]
    pub file: PathBuf,

    #[arg(required = true, value_name = "dest_dir")]
    pub dest_dir: PathBuf,

    /// Name of new link. Defaults to name of file.
    #[arg(short, long, value_name = "name")]
    pub name: Option<OsString>,
}

#[derive(Parser, Clone, Debug)]
struct UnlinkOptions {
    #[arg(required = true, value_name = "path")]
    pub path: PathBuf,

    /// Remove every mirrored link without asking.
    #[arg(short, long)]
    pub yes: bool,
}

#[derive(Parser, Clone, Debug)]
struct LinksOptions {
    #[arg(required = true, value_name = "file")]
    pub file: PathBuf,

    /// Folders to look in. Defaults to members of the file's group.
    #[arg(value_name = "dir")]
    pub dirs: Vec<PathBuf>,
}

#[derive(Parser, Clone, Debug)]
struct SearchOptions {
    /// Folders to intersect.
    #[arg(required = true, num_args = 2.., value_name = "folder")]
    pub folders: Vec<PathBuf>,

    /// Keep matches with any name matching glob or substring.
    #[arg(short, long, value_name = "pattern")]
    pub pattern: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let settings = cli.settings();

    let fallback = settings
        .as_ref()
        .map(|settings| settings.log_filter.clone())
        .unwrap_or_else(|_| "info".into());
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_timer(false)
        .without_time();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = run(cli, settings).await {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

async fn run(cli: Cli, settings: Result<Settings>) -> Result<()> {
    cli.run(settings?).await
}

fn run_group(command: GroupCommand, engine: Arc<SyncEngine>) -> Result<()> {
    let registry = Arc::clone(engine.registry());
    let cancel = CancellationToken::new();

    match command {
        GroupCommand::Create(opts) => {
            let (group, report) =
                engine.create_group(opts.folders, opts.name, !opts.no_watch, &cancel)?;
            info!("created group {} ({})", group.id, group.name);
            print_report(report)?;
        }
        GroupCommand::List => {
            for group in registry.groups() {
                println!(
                    "{}  {}  [{}]  {} folders",
                    short_id(&group),
                    group.name,
                    engine.state(&group.id)?,
                    group.folders.len()
                );
            }
        }
        GroupCommand::Show(opts) => {
            let group = registry.group(&registry.resolve_ref(opts.group)?)?;
            println!("id:        {}", group.id);
            println!("name:      {}", group.name);
            println!("state:     {}", engine.state(&group.id)?);
            println!("created:   {}", group.created_at);
            println!("modified:  {}", group.modified_at);
            println!("folders:");
            for folder in &group.folders {
                println!("  {}", folder.display());
            }
        }
        GroupCommand::Add(opts) => {
            let id = registry.resolve_ref(opts.group)?;
            let (group, report) = engine.add_folder(&id, opts.folder, &cancel)?;
            info!("group {} now has {} folders", group.name, group.folders.len());
            print_report(report)?;
        }
        GroupCommand::Remove(opts) => {
            let id = registry.resolve_ref(opts.group)?;
            match engine.remove_folder(&id, opts.folder)? {
                FolderRemoval::Remaining(group) => {
                    info!("group {} now has {} folders", group.name, group.folders.len())
                }
                FolderRemoval::Dissolved(group) => {
                    info!("group {} dissolved, fewer than 2 folders left", group.name)
                }
            }
        }
        GroupCommand::Delete(opts) => {
            let group = engine.delete_group(&registry.resolve_ref(opts.group)?)?;
            info!("deleted group {}", group.name);
        }
        GroupCommand::Rename(opts) => {
            let group = registry.rename_group(&registry.resolve_ref(opts.group)?, opts.name)?;
            info!("renamed group {} to {}", group.id, group.name);
        }
        GroupCommand::Enable(opts) => {
            let group = registry.set_watch_enabled(&registry.resolve_ref(opts.group)?, true)?;
            info!("enabled watching of group {}", group.name);
        }
        GroupCommand::Disable(opts) => {
            let group = registry.set_watch_enabled(&registry.resolve_ref(opts.group)?, false)?;
            info!("disabled watching of group {}", group.name);
        }
        GroupCommand::Sync(opts) => {
            let report = engine.resync(&registry.resolve_ref(opts.group)?)?;
            print_report(report)?;
        }
        GroupCommand::Discover(opts) if opts.content => {
            let scan = engine.scan_content_mirrors(opts.folders, &CancellationToken::new());
            if scan.candidates.is_empty() {
                info!("no identical folder trees found");
            }
            for candidate in scan.candidates {
                let folders = candidate
                    .folders
                    .iter()
                    .map(|folder| folder.display().to_string())
                    .collect::<Vec<_>>();
                println!("{}  {}", &candidate.fingerprint.to_hex()[..8], folders.join("  "));
            }
        }
        GroupCommand::Discover(opts) => {
            let groups = engine.discover_groups(opts.folders)?;
            if groups.is_empty() {
                info!("no new mirror groups found");
            }
            for group in groups {
                println!("{}  {}", short_id(&group), group.name);
            }
        }
    }

    Ok(())
}

fn run_link(opts: LinkOptions, engine: Arc<SyncEngine>) -> Result<()> {
    let outcome = engine.link_file(opts.file, opts.dest_dir, opts.name, &CancellationToken::new())?;
    println!("{}", outcome.path.display());
    if let Some(report) = outcome.propagation {
        print_report(report)?;
    }

    Ok(())
}

fn run_unlink(opts: UnlinkOptions, engine: Arc<SyncEngine>) -> Result<()> {
    let plan = engine.plan_removal(&opts.path)?;
    let scope = if opts.yes || !plan.needs_confirmation() {
        RemovalScope::All
    } else {
        confirm_removal(&plan)?
    };

    let report = engine.execute_removal(&plan, scope)?;
    if report.cancelled {
        info!("nothing removed");
        return Ok(());
    }

    for path in &report.removed {
        println!("removed {}", path.display());
    }
    for skipped in &report.skipped {
        warn!("left {} alone: {:?}", skipped.path.display(), skipped.reason);
    }
    report.into_result()?;

    Ok(())
}

fn confirm_removal(plan: &RemovalPlan) -> Result<RemovalScope> {
    println!("{} is linked {} times:", plan.requested.display(), plan.linked.len());
    for path in plan.linked.paths() {
        println!("  {}", path.display());
    }

    let all = Confirm::new("Remove every link?")
        .with_default(false)
        .with_help_message("no leaves every file untouched")
        .prompt()?;

    Ok(if all {
        RemovalScope::All
    } else {
        RemovalScope::Cancel
    })
}

fn run_links(opts: LinksOptions, engine: Arc<SyncEngine>) -> Result<()> {
    let report = engine.find_links(&opts.file, &opts.dirs)?;
    println!("identity:    {}", report.identity);
    println!("link count:  {}", report.link_count);
    for path in &report.paths {
        println!("  {}", path.display());
    }

    let outside = report.link_count.saturating_sub(report.paths.len() as u64);
    if outside > 0 {
        info!("{outside} link(s) live outside the searched folders");
    }

    Ok(())
}

async fn run_search(opts: SearchOptions) -> Result<()> {
    let bar = ProgressBar::new_spinner();
    bar.set_style(ProgressStyle::with_template("{spinner:.green} {elapsed_precise:.green}  {msg}")?);
    bar.set_message(format!("intersecting {} folders", opts.folders.len()));
    bar.enable_steady_tick(Duration::from_millis(100));

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let search = SearchEngine::new(LinkOperator::new(Arc::new(LocalFs::new())));
    let task = tokio::task::spawn_blocking(move || {
        search.intersect(opts.folders, opts.pattern.as_deref(), &token)
    });
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let outcome = task.await;
    interrupt.abort();
    bar.finish_and_clear();

    print_search(outcome.context("search task failed")??);
    Ok(())
}

fn print_search(outcome: SearchOutcome) {
    for found in &outcome.matches {
        println!("{}  ({} bytes)", found.name.to_string_lossy(), found.size);
        for path in &found.paths {
            println!("  {}", path.display());
        }
    }

    for skipped in &outcome.skipped {
        warn!("skipped {}: {}", skipped.path.display(), skipped.reason);
    }

    match outcome.status {
        SearchStatus::Complete => info!("{} match(es)", outcome.matches.len()),
        SearchStatus::Cancelled => warn!("search cancelled, showing partial result"),
    }
}

async fn run_watch(engine: Arc<SyncEngine>, window: Duration) -> Result<()> {
    let mut events = engine.subscribe();
    let mut watchers = Watchers::new(Arc::clone(&engine), window);
    watchers.sync_with_registry().await?;
    if watchers.active().next().is_none() {
        warn!("no enabled mirror groups to watch");
    }

    let mut refresh = interval_at(Instant::now() + REGISTRY_REFRESH, REGISTRY_REFRESH);
    refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = refresh.tick() => {
                if let Err(err) = watchers.sync_with_registry().await {
                    warn!("cannot refresh watchers: {err}");
                }
            }
            event = events.recv() => match event {
                Ok(EngineEvent::Propagated(report)) => log_report(&report),
                Ok(EngineEvent::Removed(report)) => {
                    info!("removed {} link(s) of {}", report.removed.len(), report.identity);
                }
                Ok(EngineEvent::PendingDeletion(_)) => {
                    let worker = Arc::clone(&engine);
                    tokio::task::spawn_blocking(move || prompt_pending(&worker)).await??;
                }
                Err(RecvError::Lagged(missed)) => warn!("missed {missed} engine event(s)"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    info!("stopping watchers");
    watchers.shutdown().await;

    Ok(())
}

fn prompt_pending(engine: &SyncEngine) -> Result<()> {
    for pending in engine.take_pending_deletions() {
        let scope = confirm_pending(&pending)?;
        let report = engine.resolve_pending(&pending, scope)?;
        for path in &report.removed {
            println!("removed {}", path.display());
        }
        if let Err(err) = report.into_result() {
            warn!("{err}");
        }
    }

    Ok(())
}

fn confirm_pending(pending: &PendingDeletion) -> Result<RemovalScope> {
    println!(
        "{} was deleted, but it is still linked in:",
        pending.folder.join(&pending.name).display()
    );
    for path in &pending.remaining {
        println!("  {}", path.display());
    }

    let all = Confirm::new("Remove these links too?")
        .with_default(false)
        .prompt()?;

    Ok(if all {
        RemovalScope::All
    } else {
        RemovalScope::Cancel
    })
}

fn print_report(report: PropagationReport) -> Result<()> {
    for path in &report.created {
        println!("linked {}", path.display());
    }
    log_report(&report);
    report.into_result()?;

    Ok(())
}

fn log_report(report: &PropagationReport) {
    for notice in &report.notices {
        info!("{notice}");
    }
    for failure in &report.failures {
        warn!("{failure}");
    }
    if !report.failures.is_empty() {
        warn!("run `linkmirror group sync {}` once the problem is fixed", report.group_id);
    }
    if report.cancelled {
        warn!("propagation cancelled before every folder was updated");
    }
}

fn short_id(group: &MirrorGroup) -> String {
    group.id.to_string().chars().take(8).collect()
}
