//! Reconciles the local repository with its remote.
//!
//! Sync state is derived on demand from the version-control backend and
//! never cached. A sync commits local work first, so no step of it can lose
//! uncommitted edits; a conflicting merge is either aborted (leaving the
//! pre-merge commit checked out) or resolved per file by a strategy.
//!
//! The shared index is never merged line by line. When both machines touched
//! it, the three versions are merged entry by entry and the strategy only
//! applies to entries both sides changed differently.

use chrono::Local;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::cfg::{self, Layout, SyncSettings};
use crate::deploy::Deployer;
use crate::error::{Error, Result};
use crate::platform::Platform;
use crate::registry::{index, ConfigEntry, Registry};
use crate::template::current_hostname;
use crate::vcs::{GitCli, Identity, MergeOutcome, Remote, Side, Stage, Vcs};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    NotInitialized,
    Clean,
    Dirty,
    Ahead,
    Behind,
    Diverged,
}

impl SyncState {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncState::NotInitialized => "not initialized",
            SyncState::Clean => "clean",
            SyncState::Dirty => "dirty",
            SyncState::Ahead => "ahead",
            SyncState::Behind => "behind",
            SyncState::Diverged => "diverged",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How `--auto-resolve` settles a conflicted file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    KeepLocal,
    KeepRemote,
}

impl ConflictStrategy {
    fn side(self) -> Side {
        match self {
            ConflictStrategy::KeepLocal => Side::Ours,
            ConflictStrategy::KeepRemote => Side::Theirs,
        }
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictStrategy::KeepLocal => f.write_str("keep-local"),
            ConflictStrategy::KeepRemote => f.write_str("keep-remote"),
        }
    }
}

impl FromStr for ConflictStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "keep-local" | "local" | "ours" => Ok(ConflictStrategy::KeepLocal),
            "keep-remote" | "remote" | "theirs" => Ok(ConflictStrategy::KeepRemote),
            other => Err(format!(
                "unknown strategy '{other}' (expected keep-local or keep-remote)"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub state: SyncState,
    pub ahead: usize,
    pub behind: usize,
    pub dirty: bool,
    pub branch: Option<String>,
    /// Remote-tracking ref the counts were taken against, when it exists.
    pub upstream: Option<String>,
}

impl SyncReport {
    fn not_initialized() -> Self {
        SyncReport {
            state: SyncState::NotInitialized,
            ahead: 0,
            behind: 0,
            dirty: false,
            branch: None,
            upstream: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    pub pull_only: bool,
    pub push_only: bool,
    pub message: Option<String>,
    pub auto_resolve: bool,
    pub strategy: Option<ConflictStrategy>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncResult {
    pub committed: bool,
    pub fetched: bool,
    pub merged: bool,
    pub pushed: bool,
    pub resolved: Vec<(PathBuf, ConflictStrategy)>,
    /// Entries whose repository copy changed while syncing; these need a
    /// redeploy to reach the live files.
    pub changed: Vec<String>,
    /// Entries whose `last_synced_hash` was refreshed.
    pub refreshed: Vec<String>,
    pub state: SyncState,
}

pub struct SyncEngine<V: Vcs> {
    vcs: V,
    settings: SyncSettings,
    platform: Platform,
}

impl<V: Vcs> SyncEngine<V> {
    pub fn new(vcs: V, settings: SyncSettings, platform: Platform) -> Self {
        SyncEngine {
            vcs,
            settings,
            platform,
        }
    }

    pub fn vcs(&self) -> &V {
        &self.vcs
    }

    pub fn status(&self) -> Result<SyncState> {
        Ok(self.inspect()?.state)
    }

    /// Local view of the repository against the last fetched remote state.
    /// Never touches the network.
    pub fn inspect(&self) -> Result<SyncReport> {
        if !self.vcs.is_repository() {
            return Ok(SyncReport::not_initialized());
        }

        let dirty = self.vcs.is_dirty()?;
        let branch = self.vcs.current_branch()?;
        let tracking = self.tracking_ref();
        let upstream = self.vcs.has_ref(&tracking)?.then_some(tracking);
        let (ahead, behind) = self.vcs.ahead_behind(upstream.as_deref())?;

        let state = if dirty {
            SyncState::Dirty
        } else {
            match (ahead > 0, behind > 0) {
                (true, true) => SyncState::Diverged,
                (true, false) => SyncState::Ahead,
                (false, true) => SyncState::Behind,
                (false, false) => SyncState::Clean,
            }
        };

        Ok(SyncReport {
            state,
            ahead,
            behind,
            dirty,
            branch,
            upstream,
        })
    }

    /// Update remote-tracking refs, for `status --fetch`.
    pub fn fetch(&self) -> Result<()> {
        self.require_remote()?;
        self.vcs.fetch(&self.settings.remote)
    }

    pub fn sync(
        &self,
        registry: &mut Registry,
        deployer: &Deployer,
        options: &SyncOptions,
    ) -> Result<SyncResult> {
        if !self.vcs.is_repository() {
            return Err(Error::Uninitialized {
                path: registry.layout().root.clone(),
            });
        }
        self.require_remote()?;

        // Both flags together mean neither.
        let pull = !options.push_only || options.pull_only;
        let push = !options.pull_only || options.push_only;

        let before = self.vcs.head()?;
        let mut result = SyncResult {
            committed: self.commit_local(options.message.as_deref())?,
            fetched: false,
            merged: false,
            pushed: false,
            resolved: Vec::new(),
            changed: Vec::new(),
            refreshed: Vec::new(),
            state: SyncState::Clean,
        };
        let committed = self.vcs.head()?;

        if pull {
            self.vcs.fetch(&self.settings.remote)?;
            result.fetched = true;

            let tracking = self.tracking_ref();
            if self.vcs.has_ref(&tracking)? {
                match self.vcs.merge(&tracking)? {
                    MergeOutcome::UpToDate => {}
                    MergeOutcome::Merged => result.merged = true,
                    MergeOutcome::Conflicts(paths) => {
                        result.resolved = self.settle(registry, paths, options)?;
                        result.merged = true;
                    }
                }
            } else {
                tracing::debug!("{tracking} does not exist yet, nothing to merge");
            }
        }

        let after = self.vcs.head()?;
        if let Some(after) = after.filter(|h| before.as_ref() != Some(h)) {
            let paths = self.vcs.changed_paths(before.as_deref(), &after)?;
            self.reload_if_index_changed(registry, &paths)?;
            let touched = entries_touching(registry.iter(), &paths);
            result.refreshed = self.refresh(registry, deployer, &touched)?;

            // Only what the merge brought in needs deploying.
            if committed.as_ref() != Some(&after) {
                let incoming = self.vcs.changed_paths(committed.as_deref(), &after)?;
                result.changed = entries_touching(registry.iter(), &incoming);
            }
        }

        if push && self.vcs.head()?.is_some() {
            self.vcs.push(&self.settings.remote, &self.settings.branch)?;
            result.pushed = true;
        }

        result.state = self.status()?;
        tracing::info!(
            "Sync finished: committed={} merged={} pushed={} changed={}",
            result.committed,
            result.merged,
            result.pushed,
            result.changed.len()
        );
        Ok(result)
    }

    pub fn remotes(&self) -> Result<Vec<Remote>> {
        self.vcs.remotes()
    }

    pub fn add_remote(&self, name: &str, url: &str) -> Result<()> {
        self.vcs.add_remote(name, url)
    }

    pub fn remove_remote(&self, name: &str) -> Result<()> {
        self.vcs.remove_remote(name)
    }

    fn tracking_ref(&self) -> String {
        format!(
            "refs/remotes/{}/{}",
            self.settings.remote, self.settings.branch
        )
    }

    fn require_remote(&self) -> Result<()> {
        if self
            .vcs
            .remotes()?
            .iter()
            .any(|r| r.name == self.settings.remote)
        {
            Ok(())
        } else {
            Err(Error::NoRemote {
                remote: self.settings.remote.clone(),
            })
        }
    }

    fn commit_local(&self, message: Option<&str>) -> Result<bool> {
        if !self.vcs.is_dirty()? {
            return Ok(false);
        }
        self.vcs.stage_all()?;
        let message = match message {
            Some(m) => m.to_string(),
            None => format!(
                "Sync from {}@{} ({})",
                self.platform,
                current_hostname(),
                Local::now().format("%Y-%m-%d %H:%M:%S")
            ),
        };
        self.vcs.commit(&message)
    }

    /// Abort, or resolve every conflicted path and conclude the merge.
    ///
    /// A conflicted index is merged entry by entry first. Without a strategy
    /// the merge only goes ahead when that left nothing unresolved.
    fn settle(
        &self,
        registry: &Registry,
        paths: Vec<PathBuf>,
        options: &SyncOptions,
    ) -> Result<Vec<(PathBuf, ConflictStrategy)>> {
        let strategy = if options.auto_resolve {
            options.strategy.or(self.settings.default_strategy)
        } else {
            None
        };

        let index_rel = index_relative(registry.layout());
        let (index_paths, files): (Vec<PathBuf>, Vec<PathBuf>) =
            paths.into_iter().partition(|p| *p == index_rel);

        let merged = if index_paths.is_empty() {
            None
        } else {
            match self.merge_index(&index_rel, strategy) {
                Ok(merged) => Some(merged),
                Err(e) => {
                    self.vcs.abort_merge()?;
                    return Err(e);
                }
            }
        };
        let unresolved: Vec<String> = merged
            .as_ref()
            .map(|m| m.conflicts.clone())
            .unwrap_or_default();

        let Some(strategy) = strategy else {
            if !files.is_empty() || !unresolved.is_empty() {
                self.vcs.abort_merge()?;
                let mut entries = entries_touching(registry.iter(), &files);
                for name in &unresolved {
                    if !entries.contains(name) {
                        entries.push(name.clone());
                    }
                }
                let mut paths = files;
                if !unresolved.is_empty() {
                    paths.push(index_rel);
                }
                tracing::warn!("Merge aborted, {} conflicting file(s)", paths.len());
                return Err(Error::MergeConflict { entries, paths });
            }
            if let Some(merged) = merged {
                self.vcs
                    .resolve_with(&index_rel, &index::encode(&merged.entries, &index_rel)?)?;
            }
            self.vcs.conclude_merge()?;
            return Ok(Vec::new());
        };

        let mut resolved = Vec::with_capacity(files.len() + 1);
        if let Some(merged) = merged {
            self.vcs
                .resolve_with(&index_rel, &index::encode(&merged.entries, &index_rel)?)?;
            if !merged.settled.is_empty() {
                tracing::info!(
                    "Resolved index entries {} with {strategy}",
                    merged.settled.join(", ")
                );
                resolved.push((index_rel, strategy));
            }
        }
        for path in files {
            tracing::info!("Resolving {} with {strategy}", path.display());
            self.vcs.resolve_conflict(&path, strategy.side())?;
            resolved.push((path, strategy));
        }
        self.vcs.conclude_merge()?;
        Ok(resolved)
    }

    fn merge_index(
        &self,
        path: &Path,
        strategy: Option<ConflictStrategy>,
    ) -> Result<index::MergedIndex> {
        let base = self.vcs.conflict_version(path, Stage::Base)?;
        let ours = self.vcs.conflict_version(path, Stage::Ours)?;
        let theirs = self.vcs.conflict_version(path, Stage::Theirs)?;
        let merged = index::merge_definitions(
            base.as_deref(),
            ours.as_deref(),
            theirs.as_deref(),
            strategy,
            path,
        )?;
        tracing::debug!(
            "Merged index: {} entries, {} conflicting",
            merged.entries.len(),
            merged.conflicts.len()
        );
        Ok(merged)
    }

    /// Reload the registry when a merge rewrote the index.
    fn reload_if_index_changed(&self, registry: &mut Registry, changed: &[PathBuf]) -> Result<()> {
        let layout = registry.layout().clone();
        let index_rel = index_relative(&layout);
        if changed.iter().any(|p| *p == index_rel) {
            let platform = registry.platform();
            *registry = Registry::open(layout, platform)?;
        }
        Ok(())
    }

    /// Refresh the fingerprint of each named entry from its repository copy.
    fn refresh(
        &self,
        registry: &mut Registry,
        deployer: &Deployer,
        names: &[String],
    ) -> Result<Vec<String>> {
        let mut updates = Vec::with_capacity(names.len());
        for name in names {
            let entry = registry.get(name)?;
            updates.push((name.clone(), deployer.fingerprint(entry)?));
        }
        registry.refresh_hashes(updates)
    }
}

fn index_relative(layout: &Layout) -> PathBuf {
    layout
        .index_path()
        .strip_prefix(&layout.root)
        .map(Path::to_path_buf)
        .unwrap_or_default()
}

/// Names of entries whose repository copy is, or contains, one of `paths`.
fn entries_touching<'a>(
    entries: impl Iterator<Item = &'a ConfigEntry>,
    paths: &[PathBuf],
) -> Vec<String> {
    entries
        .filter(|e| paths.iter().any(|p| p.starts_with(&e.target_repo_path)))
        .map(|e| e.name.clone())
        .collect()
}

/// Commit identity from settings, defaulting to this machine.
pub fn identity(settings: &SyncSettings, platform: Platform) -> Identity {
    Identity {
        name: settings
            .author_name
            .clone()
            .unwrap_or_else(|| format!("superdots-{platform}@{}", current_hostname())),
        email: settings
            .author_email
            .clone()
            .unwrap_or_else(|| "superdots@localhost".to_string()),
    }
}

/// Git backend for `layout` configured from `settings`.
pub fn git_backend(layout: &Layout, settings: &SyncSettings, platform: Platform) -> GitCli {
    GitCli::new(&layout.root, identity(settings, platform)).with_network(
        Duration::from_secs(settings.network_timeout_secs),
        settings.max_network_retries,
    )
}

/// Create the repository layout, initialize version control and record the
/// initial commit. An optional remote is added under the configured name.
pub fn init_repository<V: Vcs>(
    layout: &Layout,
    vcs: &V,
    settings: &SyncSettings,
    remote_url: Option<&str>,
    force: bool,
) -> Result<()> {
    cfg::init(layout, force)?;
    vcs.init(&settings.branch)?;

    if let Some(url) = remote_url {
        if vcs.remotes()?.iter().any(|r| r.name == settings.remote) {
            vcs.remove_remote(&settings.remote)?;
        }
        vcs.add_remote(&settings.remote, url)?;
    }

    vcs.stage_all()?;
    vcs.commit("Initialize superdots repository")?;
    tracing::info!("Initialized repository at {}", layout.root.display());
    Ok(())
}

/// Clone a remote repository and fill in any layout directories git does not
/// carry (empty directories).
pub fn clone_repository(url: &str, dest: &Path, platform: Platform) -> Result<GitCli> {
    let defaults = SyncSettings::default();
    GitCli::clone_from(
        url,
        dest,
        identity(&defaults, platform),
        Duration::from_secs(defaults.network_timeout_secs),
        defaults.max_network_retries,
    )?;

    let layout = Layout::new(dest);
    cfg::init(&layout, false)?;
    let settings = cfg::load(&layout)?;
    Ok(git_backend(&layout, &settings.sync, platform))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{AddOptions, Sources};
    use crate::template::TemplateContext;
    use std::cell::RefCell;
    use std::fs;
    use tempfile::TempDir;

    /// Scripted in-memory backend. Records every call.
    #[derive(Default)]
    struct FakeVcs {
        repository: bool,
        dirty: RefCell<bool>,
        heads: RefCell<Vec<Option<String>>>,
        tracking_exists: bool,
        counts: (usize, usize),
        merge: RefCell<Option<MergeOutcome>>,
        changed: Vec<PathBuf>,
        remotes: Vec<Remote>,
        stages: Vec<(Stage, Vec<u8>)>,
        resolved_content: RefCell<Option<Vec<u8>>>,
        calls: RefCell<Vec<String>>,
    }

    impl FakeVcs {
        fn log(&self, call: impl Into<String>) {
            self.calls.borrow_mut().push(call.into());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.borrow().clone()
        }

        fn with_origin(mut self) -> Self {
            self.remotes.push(Remote {
                name: "origin".into(),
                url: "/srv/dots.git".into(),
            });
            self
        }
    }

    impl Vcs for FakeVcs {
        fn is_repository(&self) -> bool {
            self.repository
        }
        fn init(&self, branch: &str) -> Result<()> {
            self.log(format!("init {branch}"));
            Ok(())
        }
        fn is_dirty(&self) -> Result<bool> {
            Ok(*self.dirty.borrow())
        }
        fn current_branch(&self) -> Result<Option<String>> {
            Ok(Some("main".into()))
        }
        fn head(&self) -> Result<Option<String>> {
            // Each call consumes the next scripted head; the last one sticks.
            let mut heads = self.heads.borrow_mut();
            if heads.len() > 1 {
                Ok(heads.remove(0))
            } else {
                Ok(heads.first().cloned().flatten())
            }
        }
        fn has_ref(&self, _refname: &str) -> Result<bool> {
            Ok(self.tracking_exists)
        }
        fn ahead_behind(&self, upstream: Option<&str>) -> Result<(usize, usize)> {
            Ok(match upstream {
                Some(_) => self.counts,
                None => (self.counts.0, 0),
            })
        }
        fn stage_all(&self) -> Result<()> {
            self.log("stage");
            Ok(())
        }
        fn commit(&self, message: &str) -> Result<bool> {
            self.log(format!("commit {message}"));
            *self.dirty.borrow_mut() = false;
            Ok(true)
        }
        fn fetch(&self, remote: &str) -> Result<()> {
            self.log(format!("fetch {remote}"));
            Ok(())
        }
        fn merge(&self, upstream: &str) -> Result<MergeOutcome> {
            self.log(format!("merge {upstream}"));
            Ok(self.merge.borrow_mut().take().unwrap_or(MergeOutcome::UpToDate))
        }
        fn resolve_conflict(&self, path: &Path, side: Side) -> Result<()> {
            self.log(format!("resolve {} {side:?}", path.display()));
            Ok(())
        }
        fn conflict_version(&self, _path: &Path, stage: Stage) -> Result<Option<Vec<u8>>> {
            Ok(self
                .stages
                .iter()
                .find(|(s, _)| *s == stage)
                .map(|(_, bytes)| bytes.clone()))
        }
        fn resolve_with(&self, path: &Path, content: &[u8]) -> Result<()> {
            self.log(format!("resolve-with {}", path.display()));
            *self.resolved_content.borrow_mut() = Some(content.to_vec());
            Ok(())
        }
        fn abort_merge(&self) -> Result<()> {
            self.log("abort");
            Ok(())
        }
        fn conclude_merge(&self) -> Result<()> {
            self.log("conclude");
            Ok(())
        }
        fn push(&self, remote: &str, branch: &str) -> Result<()> {
            self.log(format!("push {remote} {branch}"));
            Ok(())
        }
        fn changed_paths(&self, _from: Option<&str>, _to: &str) -> Result<Vec<PathBuf>> {
            Ok(self.changed.clone())
        }
        fn remotes(&self) -> Result<Vec<Remote>> {
            Ok(self.remotes.clone())
        }
        fn add_remote(&self, name: &str, _url: &str) -> Result<()> {
            self.log(format!("remote add {name}"));
            Ok(())
        }
        fn remove_remote(&self, name: &str) -> Result<()> {
            self.log(format!("remote remove {name}"));
            Ok(())
        }
    }

    struct Fixture {
        _temp: TempDir,
        registry: Registry,
        deployer: Deployer,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let layout = Layout::new(temp.path().join("repo"));
        cfg::init(&layout, false).unwrap();
        let mut registry = Registry::open(layout.clone(), Platform::Linux).unwrap();
        let live = temp.path().join("bashrc");
        fs::write(&live, "export A=1\n").unwrap();
        registry
            .add("bashrc", Sources::Single(live), None, AddOptions::default())
            .unwrap();
        let deployer = Deployer::new(layout, Platform::Linux, TemplateContext::default());
        Fixture {
            _temp: temp,
            registry,
            deployer,
        }
    }

    fn engine(vcs: FakeVcs) -> SyncEngine<FakeVcs> {
        SyncEngine::new(vcs, SyncSettings::default(), Platform::Linux)
    }

    #[test]
    fn test_state_precedence() {
        let vcs = FakeVcs {
            repository: true,
            dirty: RefCell::new(true),
            tracking_exists: true,
            counts: (2, 3),
            ..FakeVcs::default()
        };
        assert_eq!(engine(vcs).status().unwrap(), SyncState::Dirty);

        let vcs = FakeVcs {
            repository: true,
            tracking_exists: true,
            counts: (2, 3),
            ..FakeVcs::default()
        };
        assert_eq!(engine(vcs).status().unwrap(), SyncState::Diverged);

        let vcs = FakeVcs {
            repository: true,
            tracking_exists: false,
            counts: (0, 4),
            ..FakeVcs::default()
        };
        let report = engine(vcs).inspect().unwrap();
        assert_eq!(report.state, SyncState::Clean);
        assert_eq!(report.upstream, None);

        assert_eq!(
            engine(FakeVcs::default()).status().unwrap(),
            SyncState::NotInitialized
        );
    }

    #[test]
    fn test_default_sync_order() {
        let mut f = fixture();
        let vcs = FakeVcs {
            repository: true,
            dirty: RefCell::new(true),
            heads: RefCell::new(vec![Some("a".into())]),
            tracking_exists: true,
            ..FakeVcs::default()
        }
        .with_origin();
        let engine = engine(vcs);

        let options = SyncOptions {
            message: Some("tweak".into()),
            ..SyncOptions::default()
        };
        let result = engine.sync(&mut f.registry, &f.deployer, &options).unwrap();
        assert!(result.committed && result.fetched && result.pushed);
        assert!(!result.merged);
        assert_eq!(
            engine.vcs().calls(),
            vec![
                "stage",
                "commit tweak",
                "fetch origin",
                "merge refs/remotes/origin/main",
                "push origin main"
            ]
        );
    }

    #[test]
    fn test_pull_only_and_push_only() {
        let mut f = fixture();
        let vcs = FakeVcs {
            repository: true,
            heads: RefCell::new(vec![Some("a".into())]),
            tracking_exists: true,
            ..FakeVcs::default()
        }
        .with_origin();
        let engine = engine(vcs);
        let pull = SyncOptions {
            pull_only: true,
            ..SyncOptions::default()
        };
        let result = engine.sync(&mut f.registry, &f.deployer, &pull).unwrap();
        assert!(!result.pushed);
        assert!(!engine.vcs().calls().iter().any(|c| c.starts_with("push")));

        let vcs = FakeVcs {
            repository: true,
            heads: RefCell::new(vec![Some("a".into())]),
            tracking_exists: true,
            ..FakeVcs::default()
        }
        .with_origin();
        let engine = self::engine(vcs);
        let push = SyncOptions {
            push_only: true,
            ..SyncOptions::default()
        };
        let result = engine.sync(&mut f.registry, &f.deployer, &push).unwrap();
        assert!(result.pushed && !result.fetched);
        assert_eq!(engine.vcs().calls(), vec!["push origin main"]);
    }

    #[test]
    fn test_conflict_without_auto_resolve_aborts() {
        let mut f = fixture();
        let before = f.registry.get("bashrc").unwrap().last_synced_hash.clone();
        let vcs = FakeVcs {
            repository: true,
            heads: RefCell::new(vec![Some("a".into())]),
            tracking_exists: true,
            merge: RefCell::new(Some(MergeOutcome::Conflicts(vec![PathBuf::from(
                "linux/bashrc",
            )]))),
            ..FakeVcs::default()
        }
        .with_origin();
        let engine = engine(vcs);

        let err = engine
            .sync(&mut f.registry, &f.deployer, &SyncOptions::default())
            .unwrap_err();
        match err {
            Error::MergeConflict { entries, paths } => {
                assert_eq!(entries, vec!["bashrc".to_string()]);
                assert_eq!(paths, vec![PathBuf::from("linux/bashrc")]);
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(engine.vcs().calls().contains(&"abort".to_string()));
        assert!(!engine.vcs().calls().iter().any(|c| c.starts_with("push")));
        assert_eq!(f.registry.get("bashrc").unwrap().last_synced_hash, before);
    }

    #[test]
    fn test_auto_resolve_uses_strategy_and_refreshes() {
        let mut f = fixture();
        let repo_copy = f.registry.repo_path(f.registry.get("bashrc").unwrap());
        fs::write(&repo_copy, "export A=2\n").unwrap();

        let vcs = FakeVcs {
            repository: true,
            heads: RefCell::new(vec![Some("a".into()), Some("a".into()), Some("b".into())]),
            tracking_exists: true,
            merge: RefCell::new(Some(MergeOutcome::Conflicts(vec![PathBuf::from(
                "linux/bashrc",
            )]))),
            changed: vec![PathBuf::from("linux/bashrc")],
            ..FakeVcs::default()
        }
        .with_origin();
        let engine = engine(vcs);
        let options = SyncOptions {
            auto_resolve: true,
            strategy: Some(ConflictStrategy::KeepRemote),
            ..SyncOptions::default()
        };

        let result = engine.sync(&mut f.registry, &f.deployer, &options).unwrap();
        assert_eq!(
            result.resolved,
            vec![(PathBuf::from("linux/bashrc"), ConflictStrategy::KeepRemote)]
        );
        assert_eq!(result.changed, vec!["bashrc".to_string()]);
        assert_eq!(result.refreshed, vec!["bashrc".to_string()]);
        assert!(engine
            .vcs()
            .calls()
            .contains(&"resolve linux/bashrc Theirs".to_string()));
        assert_eq!(
            f.registry.get("bashrc").unwrap().last_synced_hash,
            Some(crate::hash::hash_bytes(b"export A=2\n"))
        );
    }

    /// Index stages where each side edited the shared `bashrc` definition with
    /// `ours`/`theirs` and added one entry of its own.
    fn index_stages(
        f: &Fixture,
        ours: impl Fn(&mut index::StoredEntry),
        theirs: impl Fn(&mut index::StoredEntry),
    ) -> Vec<(Stage, Vec<u8>)> {
        let base = index::StoredEntry::from_entry(f.registry.get("bashrc").unwrap());
        let side = |extra: &str, edit: &dyn Fn(&mut index::StoredEntry)| {
            let mut shared = base.clone();
            edit(&mut shared);
            let mut added = base.clone();
            added.name = extra.to_string();
            added.target_repo_path = PathBuf::from("linux").join(extra);
            index::encode(&[shared, added], Path::new("index.json")).unwrap()
        };
        vec![
            (Stage::Base, index::encode(&[base.clone()], Path::new("index.json")).unwrap()),
            (Stage::Ours, side("vimrc", &ours)),
            (Stage::Theirs, side("tmux", &theirs)),
        ]
    }

    fn index_conflict(stages: Vec<(Stage, Vec<u8>)>) -> FakeVcs {
        FakeVcs {
            repository: true,
            heads: RefCell::new(vec![Some("a".into())]),
            tracking_exists: true,
            merge: RefCell::new(Some(MergeOutcome::Conflicts(vec![PathBuf::from(
                ".superdots/index.json",
            )]))),
            stages,
            ..FakeVcs::default()
        }
        .with_origin()
    }

    #[test]
    fn test_index_with_distinct_additions_merges_without_strategy() {
        let mut f = fixture();
        let stages = index_stages(&f, |_| {}, |_| {});
        let engine = engine(index_conflict(stages));

        let result = engine
            .sync(&mut f.registry, &f.deployer, &SyncOptions::default())
            .unwrap();
        assert!(result.merged && result.resolved.is_empty());
        let calls = engine.vcs().calls();
        assert!(calls.contains(&"resolve-with .superdots/index.json".to_string()));
        assert!(calls.contains(&"conclude".to_string()));
        assert!(!calls.contains(&"abort".to_string()));

        let content = engine.vcs().resolved_content.borrow().clone().unwrap();
        let merged = index::definitions(&content, Path::new("index.json")).unwrap();
        let names: Vec<&str> = merged.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["bashrc", "vimrc", "tmux"]);
    }

    #[test]
    fn test_index_entry_changed_on_both_sides_needs_strategy() {
        let mut f = fixture();
        let stages = index_stages(
            &f,
            |e| e.description = Some("mine".into()),
            |e| e.description = Some("theirs".into()),
        );
        let engine = engine(index_conflict(stages.clone()));

        let err = engine
            .sync(&mut f.registry, &f.deployer, &SyncOptions::default())
            .unwrap_err();
        match err {
            Error::MergeConflict { entries, paths } => {
                assert_eq!(entries, vec!["bashrc".to_string()]);
                assert_eq!(paths, vec![PathBuf::from(".superdots/index.json")]);
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(engine.vcs().calls().contains(&"abort".to_string()));

        let engine = SyncEngine::new(
            index_conflict(stages),
            SyncSettings::default(),
            Platform::Linux,
        );
        let options = SyncOptions {
            auto_resolve: true,
            strategy: Some(ConflictStrategy::KeepRemote),
            ..SyncOptions::default()
        };
        let result = engine.sync(&mut f.registry, &f.deployer, &options).unwrap();
        assert_eq!(
            result.resolved,
            vec![(PathBuf::from(".superdots/index.json"), ConflictStrategy::KeepRemote)]
        );
        let content = engine.vcs().resolved_content.borrow().clone().unwrap();
        let merged = index::definitions(&content, Path::new("index.json")).unwrap();
        assert_eq!(merged[0].description.as_deref(), Some("theirs"));
        assert_eq!(merged.len(), 3);
    }

    #[test]
    fn test_auto_resolve_without_strategy_is_conflict() {
        let mut f = fixture();
        let vcs = FakeVcs {
            repository: true,
            heads: RefCell::new(vec![Some("a".into())]),
            tracking_exists: true,
            merge: RefCell::new(Some(MergeOutcome::Conflicts(vec![PathBuf::from("x")]))),
            ..FakeVcs::default()
        }
        .with_origin();
        let options = SyncOptions {
            auto_resolve: true,
            ..SyncOptions::default()
        };
        let err = engine(vcs)
            .sync(&mut f.registry, &f.deployer, &options)
            .unwrap_err();
        assert!(matches!(err, Error::MergeConflict { .. }));
    }

    #[test]
    fn test_sync_requires_repository_and_remote() {
        let mut f = fixture();
        let err = engine(FakeVcs::default())
            .sync(&mut f.registry, &f.deployer, &SyncOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::Uninitialized { .. }));

        let vcs = FakeVcs {
            repository: true,
            ..FakeVcs::default()
        };
        let err = engine(vcs)
            .sync(&mut f.registry, &f.deployer, &SyncOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::NoRemote { .. }));
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!(
            "keep-remote".parse::<ConflictStrategy>().unwrap(),
            ConflictStrategy::KeepRemote
        );
        assert_eq!(
            "KEEP_LOCAL".parse::<ConflictStrategy>().unwrap(),
            ConflictStrategy::KeepLocal
        );
        assert!("merge".parse::<ConflictStrategy>().is_err());
        assert_eq!(ConflictStrategy::KeepLocal.to_string(), "keep-local");
    }
}
