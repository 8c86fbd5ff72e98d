use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use superdots::cfg::{self, Layout, Settings};
use superdots::deploy::{DeployAction, Deployer, UpdateOutcome};
use superdots::registry::{AddOptions, DeployMode, EntryStatus, ListFilter, Sources};
use superdots::sync::{self, ConflictStrategy, SyncOptions, SyncState};
use superdots::template::TemplateContext;
use superdots::vcs::GitCli;
use superdots::{platform, ui, Error, Platform, PlatformMap, Registry};

/// SuperDots - one dotfiles registry for Linux, macOS and Windows, synced through Git
#[derive(Parser)]
#[command(name = "superdots")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the dotfiles repository (defaults to ~/.superdots)
    #[arg(long, global = true, env = "SUPERDOTS_REPO")]
    repo_path: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the repository layout and initialize Git
    Init {
        /// Remote to sync with
        #[arg(long)]
        remote_url: Option<String>,

        /// Overwrite an existing settings file
        #[arg(short, long)]
        force: bool,
    },

    /// Start managing a file or directory
    Add {
        /// Source path on this machine
        path: PathBuf,

        /// Entry name (defaults to the file name without a leading dot)
        #[arg(long)]
        name: Option<String>,

        #[arg(short, long)]
        description: Option<String>,

        /// Tag to attach; repeatable
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Source path for another operating system; repeatable
        #[arg(long = "extra-path", num_args = 2, value_names = ["OS", "PATH"])]
        extra_paths: Vec<String>,

        /// Deploy by copying instead of symlinking
        #[arg(long)]
        copy: bool,

        /// Treat the file as a template
        #[arg(long, conflicts_with = "no_template")]
        template: bool,

        /// Never treat the file as a template
        #[arg(long)]
        no_template: bool,

        /// Register paths that do not exist yet
        #[arg(long)]
        allow_missing: bool,
    },

    /// Stop managing an entry
    Remove {
        name: String,

        /// Keep the repository copy
        #[arg(long)]
        keep_files: bool,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// List managed entries
    List {
        /// Only entries with a path for this OS
        #[arg(long)]
        platform: Option<Platform>,

        /// Only entries with this status
        #[arg(long)]
        status: Option<EntryStatus>,

        /// Only entries with this tag
        #[arg(long)]
        tag: Option<String>,

        #[arg(long, value_enum, default_value_t = Format::Table)]
        format: Format,
    },

    /// Capture live files back into the repository
    Update {
        #[arg(required_unless_present = "all")]
        name: Option<String>,

        #[arg(long, conflicts_with = "name")]
        all: bool,
    },

    /// Write repository copies to their targets
    Deploy {
        #[arg(required_unless_present = "all")]
        name: Option<String>,

        #[arg(long, conflicts_with = "name")]
        all: bool,

        /// Deploy the paths registered for another OS
        #[arg(long)]
        platform: Option<Platform>,

        /// Replace targets that differ from the managed copy (after a backup)
        #[arg(short, long)]
        force: bool,
    },

    /// Commit, pull and push the repository
    Sync {
        #[arg(long, conflicts_with = "push_only")]
        pull_only: bool,

        #[arg(long)]
        push_only: bool,

        /// Commit message for local changes
        #[arg(short, long)]
        message: Option<String>,

        /// Resolve merge conflicts with a strategy instead of aborting
        #[arg(long)]
        auto_resolve: bool,

        #[arg(long)]
        strategy: Option<ConflictStrategy>,

        /// Do not redeploy entries changed by the pull
        #[arg(long)]
        no_deploy: bool,
    },

    /// Show repository and deployment status
    Status {
        /// Fetch from the remote first
        #[arg(long)]
        fetch: bool,
    },

    /// Clone an existing dotfiles repository
    Clone {
        url: String,

        /// Destination (defaults to the repository path)
        #[arg(long)]
        path: Option<PathBuf>,
    },

    /// Manage Git remotes
    #[command(subcommand)]
    Remote(RemoteCommands),

    /// Manage per-OS source paths of an entry
    #[command(subcommand)]
    Platform(PlatformCommands),

    /// List backups of an entry
    Backups { name: String },

    /// Restore a backup of an entry on this machine
    Restore {
        name: String,

        /// Backup id (defaults to the newest from this OS)
        #[arg(long)]
        backup: Option<String>,
    },
}

#[derive(Subcommand)]
enum RemoteCommands {
    /// Add a remote
    Add { name: String, url: String },

    /// Remove a remote
    Remove { name: String },

    /// List remotes
    List,
}

#[derive(Subcommand)]
enum PlatformCommands {
    /// Register a source path for another OS
    Add {
        name: String,
        platform: Platform,
        path: PathBuf,

        #[arg(long)]
        allow_missing: bool,
    },

    /// Forget the source path for an OS
    Remove { name: String, platform: Platform },

    /// Show the source paths of an entry
    List { name: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Table,
    Json,
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.verbose, cli.log_file.as_deref()) {
        eprintln!("Failed to set up logging: {e:#}");
    }

    // Initialize UI module
    ui::init();

    let result = repo_root(cli.repo_path).and_then(|root| run(cli.command, root));

    if let Err(e) = result {
        ui::error(&format!("Error: {:#}", e));
        if let Some(err) = e.chain().find_map(|c| c.downcast_ref::<Error>()) {
            conflict_hint(err);
        }
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool, log_file: Option<&Path>) -> Result<()> {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(filter());

    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .with_filter(filter()),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init()?;
    Ok(())
}

fn repo_root(flag: Option<PathBuf>) -> Result<PathBuf> {
    match flag {
        Some(path) => Ok(cfg::expand_path(&path)),
        None => cfg::default_repo_path().context("Could not find home directory"),
    }
}

fn run(command: Commands, root: PathBuf) -> Result<()> {
    match command {
        Commands::Init { remote_url, force } => cmd_init(root, remote_url, force),
        Commands::Add {
            path,
            name,
            description,
            tags,
            extra_paths,
            copy,
            template,
            no_template,
            allow_missing,
        } => {
            let template = match (template, no_template) {
                (true, _) => Some(true),
                (_, true) => Some(false),
                _ => None,
            };
            cmd_add(
                root,
                path,
                name,
                description,
                tags,
                extra_paths,
                copy,
                template,
                allow_missing,
            )
        }
        Commands::Remove {
            name,
            keep_files,
            yes,
        } => cmd_remove(root, &name, keep_files, yes),
        Commands::List {
            platform,
            status,
            tag,
            format,
        } => cmd_list(
            root,
            ListFilter {
                platform,
                status,
                tag,
            },
            format,
        ),
        Commands::Update { name, all } => cmd_update(root, name, all),
        Commands::Deploy {
            name,
            all,
            platform,
            force,
        } => cmd_deploy(root, name, all, platform, force),
        Commands::Sync {
            pull_only,
            push_only,
            message,
            auto_resolve,
            strategy,
            no_deploy,
        } => cmd_sync(
            root,
            SyncOptions {
                pull_only,
                push_only,
                message,
                auto_resolve,
                strategy,
            },
            no_deploy,
        ),
        Commands::Status { fetch } => cmd_status(root, fetch),
        Commands::Clone { url, path } => cmd_clone(path.map(|p| cfg::expand_path(&p)).unwrap_or(root), &url),
        Commands::Remote(subcmd) => cmd_remote(root, subcmd),
        Commands::Platform(subcmd) => cmd_platform(root, subcmd),
        Commands::Backups { name } => cmd_backups(root, &name),
        Commands::Restore { name, backup } => cmd_restore(root, &name, backup.as_deref()),
    }
}

/// Everything a command needs from an initialized repository.
struct Workspace {
    layout: Layout,
    settings: Settings,
    platform: Platform,
}

impl Workspace {
    fn open(root: PathBuf) -> Result<Self> {
        let layout = Layout::new(root);
        let settings = cfg::load(&layout)?;
        Ok(Workspace {
            layout,
            settings,
            platform: Platform::current(),
        })
    }

    fn registry(&self) -> Result<Registry> {
        let registry = Registry::open(self.layout.clone(), self.platform).with_context(|| {
            format!(
                "Failed to open the registry at {} (run 'superdots init' first)",
                self.layout.root.display()
            )
        })?;
        Ok(registry)
    }

    fn deployer(&self) -> Deployer {
        Deployer::new(
            self.layout.clone(),
            self.platform,
            TemplateContext::resolve(self.platform, &self.settings.template.variables),
        )
    }

    fn sync_engine(&self) -> sync::SyncEngine<GitCli> {
        let git = sync::git_backend(&self.layout, &self.settings.sync, self.platform);
        sync::SyncEngine::new(git, self.settings.sync.clone(), self.platform)
    }
}

fn require_git() -> Result<()> {
    if !GitCli::available() {
        bail!("git is not installed or not on PATH");
    }
    Ok(())
}

fn cmd_init(root: PathBuf, remote_url: Option<String>, force: bool) -> Result<()> {
    ui::info(&format!("Initializing superdots at {}...", root.display()));
    require_git()?;

    let ws = Workspace::open(root)?;
    let git = sync::git_backend(&ws.layout, &ws.settings.sync, ws.platform);
    sync::init_repository(&ws.layout, &git, &ws.settings.sync, remote_url.as_deref(), force)
        .context("Failed to initialize the repository")?;

    ui::success("Repository initialized");
    if remote_url.is_none() {
        ui::hint("Run 'superdots remote add origin <url>' to sync with a remote");
    }
    ui::hint("Run 'superdots add <path>' to start managing a file");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn cmd_add(
    root: PathBuf,
    path: PathBuf,
    name: Option<String>,
    description: Option<String>,
    tags: Vec<String>,
    extra_paths: Vec<String>,
    copy: bool,
    template: Option<bool>,
    allow_missing: bool,
) -> Result<()> {
    let ws = Workspace::open(root)?;
    let mut registry = ws.registry()?;

    let path = cfg::expand_path(&path);
    let name = match name {
        Some(name) => name,
        None => default_name(&path)?,
    };

    let sources = if extra_paths.is_empty() {
        Sources::Single(path)
    } else {
        let mut map = PlatformMap::single(ws.platform, path);
        for pair in extra_paths.chunks(2) {
            let [os, extra] = pair else {
                bail!("--extra-path takes an OS and a path");
            };
            let os: Platform = os.parse().map_err(anyhow::Error::msg)?;
            if map.insert(os, PathBuf::from(extra)).is_some() {
                bail!("more than one path given for {os}");
            }
        }
        Sources::PerPlatform(map)
    };

    let options = AddOptions {
        allow_missing,
        mode: if copy {
            DeployMode::Copy
        } else {
            ws.settings.deploy.default_mode
        },
        template,
        tags,
        ..AddOptions::default()
    };

    let entry = registry
        .add(&name, sources, description, options)
        .with_context(|| format!("Failed to add '{name}'"))?;

    ui::success(&format!(
        "Added '{}' as {}",
        entry.name,
        entry.target_repo_path.display()
    ));
    if entry.is_template {
        ui::info("Detected {{VARIABLES}}; the entry will be rendered on deploy");
    }
    if entry.status == EntryStatus::Untracked {
        ui::warn("No source exists yet; nothing was copied into the repository");
    }
    ui::hint("Run 'superdots sync' to share it with your other machines");
    Ok(())
}

/// `~/.bashrc` -> `bashrc`
fn default_name(path: &Path) -> Result<String> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("Cannot derive a name from {}; pass --name", path.display()))?;
    let trimmed = file_name.trim_start_matches('.');
    Ok(if trimmed.is_empty() {
        file_name.to_string()
    } else {
        trimmed.to_string()
    })
}

fn cmd_remove(root: PathBuf, name: &str, keep_files: bool, yes: bool) -> Result<()> {
    let ws = Workspace::open(root)?;
    let mut registry = ws.registry()?;
    registry.get(name)?;

    if !yes && !ui::prompt_confirm(&format!("Stop managing '{name}'?"), false) {
        ui::info("Cancelled");
        return Ok(());
    }

    let removed = registry.remove(name, keep_files)?;
    ui::success(&format!("Removed '{}'", removed.name));
    if keep_files {
        ui::info(&format!(
            "Repository copy kept at {}",
            ws.layout.resolve(&removed.target_repo_path).display()
        ));
    }
    Ok(())
}

fn cmd_list(root: PathBuf, filter: ListFilter, format: Format) -> Result<()> {
    let ws = Workspace::open(root)?;
    let registry = ws.registry()?;
    let entries = registry.list(filter);

    if let Format::Json = format {
        let entries = entries.collect::<Vec<_>>();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.clone().next().is_none() {
        ui::info("No configurations match");
        return Ok(());
    }

    let rows = entries
        .map(|entry| {
            let platforms = entry
                .platforms()
                .map(Platform::as_str)
                .collect::<Vec<_>>()
                .join(",");
            let mut mode = entry.deploy_mode.to_string();
            if entry.is_template {
                mode.push_str(" (template)");
            }
            vec![
                entry.name.bold().to_string(),
                platforms,
                mode,
                entry.status.to_string(),
                entry.description.clone().unwrap_or_default(),
            ]
        })
        .collect();
    ui::print_table(&["Name", "Platforms", "Mode", "Status", "Description"], rows);
    Ok(())
}

fn cmd_update(root: PathBuf, name: Option<String>, all: bool) -> Result<()> {
    let ws = Workspace::open(root)?;
    let mut registry = ws.registry()?;
    let deployer = ws.deployer();

    let names: Vec<String> = match name {
        Some(name) if !all => vec![name],
        _ => registry
            .list(ListFilter {
                platform: Some(ws.platform),
                ..ListFilter::default()
            })
            .map(|e| e.name.clone())
            .collect(),
    };

    let mut failed = 0;
    for name in &names {
        match deployer.update(&mut registry, name) {
            Ok(UpdateOutcome::Updated { .. }) => ui::success(&format!("Updated '{name}'")),
            Ok(UpdateOutcome::UpToDate) => ui::info(&format!("'{name}' is up to date")),
            Ok(UpdateOutcome::SkippedTemplate) => {
                ui::info(&format!("'{name}' is a template; edit it in the repository"))
            }
            Err(e) if !all => return Err(e).with_context(|| format!("Failed to update '{name}'")),
            Err(e) => {
                failed += 1;
                ui::error(&format!("{name}: {e}"));
            }
        }
    }

    if failed > 0 {
        bail!("{failed} of {} entries failed to update", names.len());
    }
    Ok(())
}

fn cmd_deploy(
    root: PathBuf,
    name: Option<String>,
    all: bool,
    platform: Option<Platform>,
    force: bool,
) -> Result<()> {
    let ws = Workspace::open(root)?;
    let mut registry = ws.registry()?;
    let deployer = ws.deployer();
    let platform = platform.unwrap_or(ws.platform);

    if let (Some(name), false) = (name, all) {
        let result = deployer
            .deploy(&mut registry, &name, platform, force)
            .with_context(|| format!("Failed to deploy '{name}'"))?;
        report_deploy(&result);
        return Ok(());
    }

    let total = registry.list(ListFilter {
        platform: Some(platform),
        ..ListFilter::default()
    });
    let pb = ui::progress_bar(total.count() as u64, "Deploying");
    let report = deployer.deploy_all(&mut registry, platform, force, |name| {
        pb.set_message(name.to_string());
        pb.inc(1);
    });
    pb.finish_and_clear();

    for result in &report.results {
        report_deploy(result);
    }
    for name in &report.skipped {
        ui::info(&format!("Skipped '{name}': no {platform} path"));
    }
    for (name, e) in &report.failures {
        ui::error(&format!("{name}: {e}"));
    }
    if !report.is_success() {
        bail!("{} entries failed to deploy", report.failures.len());
    }
    ui::success(&format!("Deployed {} entries", report.results.len()));
    Ok(())
}

fn report_deploy(result: &superdots::deploy::DeployResult) {
    let target = result.target.display();
    match result.action {
        DeployAction::Unchanged => ui::info(&format!("'{}' already deployed at {target}", result.name)),
        DeployAction::Symlinked => ui::success(&format!("Linked '{}' -> {target}", result.name)),
        DeployAction::Copied => ui::success(&format!("Copied '{}' -> {target}", result.name)),
    }
    if result.fallback {
        ui::warn("Symlinks are not permitted here; a copy was written instead");
    }
    if let Some(backup) = &result.backup {
        ui::info(&format!("Previous file backed up to {}", backup.display()));
    }
    for warning in &result.warnings {
        ui::warn(warning);
    }
}

fn cmd_sync(root: PathBuf, options: SyncOptions, no_deploy: bool) -> Result<()> {
    require_git()?;
    let ws = Workspace::open(root)?;
    let mut registry = ws.registry()?;
    let deployer = ws.deployer();
    let engine = ws.sync_engine();

    let pb = ui::spinner("Syncing...");
    let result = engine.sync(&mut registry, &deployer, &options);
    pb.finish_and_clear();
    let result = result.context("Sync failed")?;

    for (path, strategy) in &result.resolved {
        ui::warn(&format!("Resolved {} with {strategy}", path.display()));
    }
    if result.committed {
        ui::info("Committed local changes");
    }
    if result.merged {
        ui::info("Merged remote changes");
    }
    if result.pushed {
        ui::info(&format!("Pushed to {}", ws.settings.sync.remote));
    }

    if !no_deploy && !result.changed.is_empty() {
        ui::section("Redeploying changed entries");
        let changed: BTreeSet<&String> = result.changed.iter().collect();
        for name in changed {
            let has_path = registry
                .get(name)
                .map(|e| e.source_paths.contains(ws.platform))
                .unwrap_or(false);
            if !has_path {
                continue;
            }
            match deployer.deploy(&mut registry, name, ws.platform, false) {
                Ok(result) => report_deploy(&result),
                Err(e) => {
                    ui::error(&format!("{name}: {e}"));
                    conflict_hint(&e);
                }
            }
        }
    }

    ui::success(&format!("Sync complete ({})", ui::sync_state(result.state)));
    Ok(())
}

fn cmd_status(root: PathBuf, fetch: bool) -> Result<()> {
    let ws = Workspace::open(root)?;
    let mut registry = ws.registry()?;
    let deployer = ws.deployer();
    let engine = ws.sync_engine();

    if fetch {
        require_git()?;
        let pb = ui::spinner("Fetching...");
        let fetched = engine.fetch();
        pb.finish_and_clear();
        if let Err(e) = fetched {
            ui::warn(&format!("Fetch failed: {e}"));
        }
    }

    // Inspect before refreshing so the report shows the repository as the user left it.
    let report = engine.inspect()?;
    deployer.refresh_status(&mut registry)?;

    ui::section("Repository");
    println!("  Path:     {}", ws.layout.root.display());
    println!("  System:   {}", platform::describe_system());
    if let Some(branch) = &report.branch {
        println!("  Branch:   {branch}");
    }
    println!("  State:    {}", ui::sync_state(report.state));
    if report.state != SyncState::NotInitialized {
        match &report.upstream {
            Some(upstream) => println!(
                "  Remote:   {} ahead, {} behind {upstream}",
                report.ahead, report.behind
            ),
            None => println!("  Remote:   {} commit(s) not pushed anywhere", report.ahead),
        }
    }

    let stats = registry.stats();
    ui::section("Configurations");
    println!(
        "  {} total: {} files, {} directories, {} templates",
        stats.total, stats.files, stats.directories, stats.templates
    );
    for (platform, count) in &stats.by_platform {
        println!("  {platform}: {count}");
    }

    if registry.is_empty() {
        return Ok(());
    }

    let mut rows = Vec::with_capacity(registry.len());
    for entry in registry.iter() {
        let statuses = deployer.check_status(entry)?;
        let mut row = vec![entry.name.clone()];
        for platform in Platform::ALL {
            row.push(
                statuses
                    .get(platform)
                    .map(|s| ui::deploy_status(*s))
                    .unwrap_or_else(|| "-".dimmed().to_string()),
            );
        }
        rows.push(row);
    }
    println!();
    ui::print_table(&["Name", "Linux", "macOS", "Windows"], rows);

    if report.state == SyncState::Dirty || report.ahead > 0 {
        ui::hint("Run 'superdots sync' to share local changes");
    } else if report.behind > 0 {
        ui::hint("Run 'superdots sync --pull-only' to get remote changes");
    }
    Ok(())
}

fn cmd_clone(dest: PathBuf, url: &str) -> Result<()> {
    require_git()?;
    if dest.exists() && dest.read_dir().map(|mut d| d.next().is_some()).unwrap_or(true) {
        bail!("{} already exists and is not empty", dest.display());
    }

    let pb = ui::spinner(&format!("Cloning {url}..."));
    let cloned = sync::clone_repository(url, &dest, Platform::current());
    pb.finish_and_clear();
    cloned.with_context(|| format!("Failed to clone {url}"))?;

    ui::success(&format!("Cloned into {}", dest.display()));
    ui::hint("Run 'superdots deploy --all' to put the configurations in place");
    Ok(())
}

fn cmd_remote(root: PathBuf, subcmd: RemoteCommands) -> Result<()> {
    require_git()?;
    let ws = Workspace::open(root)?;
    let engine = ws.sync_engine();

    match subcmd {
        RemoteCommands::Add { name, url } => {
            engine.add_remote(&name, &url)?;
            ui::success(&format!("Added remote '{name}'"));
        }
        RemoteCommands::Remove { name } => {
            engine.remove_remote(&name)?;
            ui::success(&format!("Removed remote '{name}'"));
        }
        RemoteCommands::List => {
            let remotes = engine.remotes()?;
            if remotes.is_empty() {
                ui::info("No remotes configured");
            }
            for remote in remotes {
                println!("  {} {}", remote.name.bold(), remote.url.dimmed());
            }
        }
    }
    Ok(())
}

fn cmd_platform(root: PathBuf, subcmd: PlatformCommands) -> Result<()> {
    let ws = Workspace::open(root)?;
    let mut registry = ws.registry()?;

    match subcmd {
        PlatformCommands::Add {
            name,
            platform,
            path,
            allow_missing,
        } => {
            if registry.add_platform_path(&name, platform, &path, allow_missing)? {
                ui::success(&format!("Added {platform} path for '{name}'"));
            } else {
                ui::info(&format!("'{name}' already uses that {platform} path"));
            }
        }
        PlatformCommands::Remove { name, platform } => {
            let path = registry.remove_platform_path(&name, platform)?;
            ui::success(&format!(
                "Removed {platform} path {} from '{name}'",
                path.display()
            ));
        }
        PlatformCommands::List { name } => {
            let entry = registry.get(&name)?;
            for platform in Platform::ALL {
                let path = entry
                    .source_for(platform)
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "-".dimmed().to_string());
                let marker = if platform == ws.platform { "*" } else { " " };
                println!("{marker} {:8} {path}", platform.as_str());
            }
        }
    }
    Ok(())
}

fn cmd_backups(root: PathBuf, name: &str) -> Result<()> {
    let ws = Workspace::open(root)?;
    let registry = ws.registry()?;
    registry.get(name)?;

    let backups = ws.deployer().list_backups(name)?;
    if backups.is_empty() {
        ui::info(&format!("No backups of '{name}'"));
        return Ok(());
    }

    let rows = backups
        .iter()
        .map(|b| {
            vec![
                b.id.clone(),
                b.label.clone(),
                b.created
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_default(),
                ui::format_bytes(b.size),
            ]
        })
        .collect();
    ui::print_table(&["Id", "From", "Created", "Size"], rows);
    Ok(())
}

fn cmd_restore(root: PathBuf, name: &str, backup: Option<&str>) -> Result<()> {
    let ws = Workspace::open(root)?;
    let mut registry = ws.registry()?;

    let restored = ws
        .deployer()
        .restore(&mut registry, name, backup)
        .with_context(|| format!("Failed to restore '{name}'"))?;
    ui::success(&format!(
        "Restored {} from {}",
        restored.target.display(),
        restored.restored_from.display()
    ));
    if let Some(previous) = restored.previous {
        ui::info(&format!("Replaced file backed up to {}", previous.display()));
    }
    Ok(())
}

fn conflict_hint(err: &Error) {
    match err {
        Error::TargetConflict { name, .. } => {
            ui::hint(&format!(
                "Run 'superdots deploy {name} --force' to replace it; the current file is backed up first"
            ));
        }
        Error::MergeConflict { entries, .. } => {
            if !entries.is_empty() {
                ui::warn(&format!("Affected entries: {}", entries.join(", ")));
            }
            ui::hint("The merge was aborted and nothing was changed");
            ui::hint("Run 'superdots sync --auto-resolve --strategy keep-local|keep-remote' to settle it");
        }
        Error::PathConflict { name, platform, .. } => {
            ui::hint(&format!(
                "Run 'superdots platform remove {name} {platform}' first to replace the path"
            ));
        }
        Error::Rejected { .. } => {
            ui::hint("Run 'superdots sync' to merge the remote changes before pushing");
        }
        Error::NoRemote { remote } => {
            ui::hint(&format!("Run 'superdots remote add {remote} <url>'"));
        }
        Error::Uninitialized { .. } => ui::hint("Run 'superdots init' or 'superdots clone <url>'"),
        _ => {}
    }
}
