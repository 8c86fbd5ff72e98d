//! Writes registry entries onto the filesystem and classifies drift.
//!
//! A deploy never destroys data: whatever occupies a target is backed up
//! before it is replaced, and a target that differs from the managed copy is
//! only replaced when the caller forces it.

pub mod backup;

use chrono::Utc;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::cfg::Layout;
use crate::error::{Error, IoResultExt, Result};
use crate::files;
use crate::hash;
use crate::platform::{self, Platform, PlatformMap};
use crate::registry::{ConfigEntry, DeployMode, DeployRecord, EntryKind, EntryStatus, Registry};
use crate::template::{self, TemplateContext};

pub use backup::BackupInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployAction {
    Symlinked,
    Copied,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployResult {
    pub name: String,
    pub platform: Platform,
    pub target: PathBuf,
    pub action: DeployAction,
    /// A symlink was wanted but the OS refused it; a copy was written.
    pub fallback: bool,
    pub backup: Option<PathBuf>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeployStatus {
    /// No repository copy to deploy.
    Missing,
    DeployedClean,
    DeployedModified,
    NotDeployed,
}

impl DeployStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeployStatus::Missing => "missing",
            DeployStatus::DeployedClean => "clean",
            DeployStatus::DeployedModified => "modified",
            DeployStatus::NotDeployed => "not deployed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated {
        hash: String,
        backup: Option<PathBuf>,
    },
    UpToDate,
    /// Templates are edited in the repository; the rendered file must not
    /// overwrite them.
    SkippedTemplate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreResult {
    pub target: PathBuf,
    pub restored_from: PathBuf,
    /// Backup taken of the target before it was replaced.
    pub previous: Option<PathBuf>,
}

/// Outcome of [`Deployer::deploy_all`]; one failure does not stop the rest.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub results: Vec<DeployResult>,
    pub failures: Vec<(String, Error)>,
    /// Entries without a path for the platform.
    pub skipped: Vec<String>,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// What the target should contain.
struct Expected {
    repo_copy: PathBuf,
    fingerprint: String,
    /// Rendered bytes for template entries.
    rendered: Option<Vec<u8>>,
    warnings: Vec<String>,
}

pub struct Deployer {
    layout: Layout,
    platform: Platform,
    ctx: TemplateContext,
    symlinks: bool,
}

impl Deployer {
    pub fn new(layout: Layout, platform: Platform, ctx: TemplateContext) -> Self {
        Deployer {
            layout,
            platform,
            ctx,
            symlinks: platform::can_symlink(),
        }
    }

    /// Never attempt symlinks; every link-mode deploy falls back to a copy.
    pub fn without_symlinks(mut self) -> Self {
        self.symlinks = false;
        self
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn deploy(
        &self,
        registry: &mut Registry,
        name: &str,
        platform: Platform,
        force: bool,
    ) -> Result<DeployResult> {
        let entry = registry.get(name)?.clone();
        let target = entry
            .source_for(platform)
            .map(Path::to_path_buf)
            .ok_or_else(|| Error::NoSourceForPlatform {
                name: name.to_string(),
                platform,
            })?;

        let expected = self.expected(&entry, platform)?;
        let wants_link = entry.deploy_mode == DeployMode::Symlink && !entry.is_template;

        let mut result = DeployResult {
            name: name.to_string(),
            platform,
            target: target.clone(),
            action: DeployAction::Unchanged,
            fallback: false,
            backup: None,
            warnings: expected.warnings.clone(),
        };

        let occupied = files::exists_no_follow(&target);
        let is_link = fs::symlink_metadata(&target)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false);

        if occupied {
            if is_link && wants_link && points_to(&target, &expected.repo_copy) {
                tracing::debug!("{} already links to the repository", target.display());
                self.note_unchanged(registry, &entry, platform, &expected, DeployMode::Symlink, false)?;
                return Ok(result);
            }

            // Following the link: a dangling one has no content.
            let current = hash::hash_if_exists(&target)?;
            if !is_link
                && entry.deploys_as_copy(platform)
                && current.as_deref() == Some(expected.fingerprint.as_str())
            {
                tracing::debug!("{} already matches the repository", target.display());
                self.note_unchanged(registry, &entry, platform, &expected, DeployMode::Copy, wants_link)?;
                return Ok(result);
            }

            match current {
                None => {
                    tracing::debug!("Removing dangling symlink {}", target.display());
                    files::remove_path(&target)?;
                }
                Some(current) => {
                    let same_content = current == expected.fingerprint;
                    // Content this machine deployed last is ours to replace.
                    let ours = entry
                        .deployments
                        .get(platform)
                        .is_some_and(|record| record.hash == current);
                    if !same_content && !ours && !force {
                        return Err(Error::TargetConflict {
                            name: name.to_string(),
                            target,
                        });
                    }
                    result.backup = Some(backup::create(
                        &self.layout,
                        name,
                        platform.as_str(),
                        &target,
                    )?);
                    files::remove_path(&target)?;
                }
            }
        }

        let (method, fallback) = self.write(&entry, &expected, &target, wants_link)?;
        result.action = match method {
            DeployMode::Symlink => DeployAction::Symlinked,
            DeployMode::Copy => DeployAction::Copied,
        };
        result.fallback = fallback;

        registry.record_deploy(
            name,
            platform,
            DeployRecord {
                hash: expected.fingerprint,
                deployed_at: Utc::now(),
                method,
                fallback,
            },
        )?;

        tracing::info!(
            "Deployed '{name}' to {} ({})",
            result.target.display(),
            method
        );
        Ok(result)
    }

    /// Record a target that already holds the expected content, unless the
    /// record says so already.
    fn note_unchanged(
        &self,
        registry: &mut Registry,
        entry: &ConfigEntry,
        platform: Platform,
        expected: &Expected,
        method: DeployMode,
        fallback: bool,
    ) -> Result<()> {
        let recorded = entry
            .deployments
            .get(platform)
            .is_some_and(|r| r.hash == expected.fingerprint && r.method == method);
        if recorded {
            return Ok(());
        }
        registry.record_deploy(
            &entry.name,
            platform,
            DeployRecord {
                hash: expected.fingerprint.clone(),
                deployed_at: Utc::now(),
                method,
                fallback,
            },
        )
    }

    /// Deploy every entry with a path for `platform`. `on_entry` is called
    /// after each attempt, e.g. to advance a progress bar.
    pub fn deploy_all(
        &self,
        registry: &mut Registry,
        platform: Platform,
        force: bool,
        mut on_entry: impl FnMut(&str),
    ) -> BatchReport {
        let names: Vec<(String, bool)> = registry
            .iter()
            .map(|e| (e.name.clone(), e.source_paths.contains(platform)))
            .collect();

        let mut report = BatchReport::default();
        for (name, has_path) in names {
            if !has_path {
                report.skipped.push(name);
                continue;
            }
            match self.deploy(registry, &name, platform, force) {
                Ok(result) => report.results.push(result),
                Err(e) => {
                    tracing::warn!("Failed to deploy '{name}': {e}");
                    report.failures.push((name.clone(), e));
                }
            }
            on_entry(&name);
        }
        report
    }

    /// Classify every platform of `entry`.
    pub fn check_status(&self, entry: &ConfigEntry) -> Result<PlatformMap<DeployStatus>> {
        let repo_copy = self.layout.resolve(&entry.target_repo_path);
        let mut statuses = PlatformMap::new();

        if !files::exists_no_follow(&repo_copy) {
            for platform in entry.platforms() {
                statuses.insert(platform, DeployStatus::Missing);
            }
            return Ok(statuses);
        }

        for (platform, target) in entry.source_paths.iter() {
            let status = if platform == self.platform {
                match hash::hash_if_exists(target)? {
                    None => DeployStatus::NotDeployed,
                    Some(live) if entry.last_synced_hash.as_deref() == Some(live.as_str()) => {
                        DeployStatus::DeployedClean
                    }
                    Some(_) => DeployStatus::DeployedModified,
                }
            } else {
                match entry.deployments.get(platform) {
                    None => DeployStatus::NotDeployed,
                    Some(record) => {
                        let expected = self.expected(entry, platform)?;
                        if expected.fingerprint == record.hash {
                            DeployStatus::DeployedClean
                        } else {
                            DeployStatus::DeployedModified
                        }
                    }
                }
            };
            statuses.insert(platform, status);
        }

        Ok(statuses)
    }

    /// Capture the running platform's live file back into the repository.
    pub fn update(&self, registry: &mut Registry, name: &str) -> Result<UpdateOutcome> {
        let entry = registry.get(name)?.clone();
        if entry.is_template {
            return Ok(UpdateOutcome::SkippedTemplate);
        }

        let source = entry
            .source_for(self.platform)
            .map(Path::to_path_buf)
            .ok_or_else(|| Error::NoSourceForPlatform {
                name: name.to_string(),
                platform: self.platform,
            })?;

        let Some(live) = hash::hash_if_exists(&source)? else {
            registry.set_status(name, EntryStatus::Missing)?;
            return Err(Error::InvalidPath {
                path: source,
                reason: "does not exist".to_string(),
            });
        };

        let repo_copy = registry.repo_path(&entry);
        if hash::hash_if_exists(&repo_copy)?.as_deref() == Some(live.as_str()) {
            if entry.last_synced_hash.as_deref() != Some(live.as_str()) {
                registry.refresh_hashes([(name.to_string(), Some(live))])?;
            }
            return Ok(UpdateOutcome::UpToDate);
        }

        let previous = if files::exists_no_follow(&repo_copy) {
            Some(backup::create(&self.layout, name, "repo", &repo_copy)?)
        } else {
            None
        };

        let kind = if source.is_dir() {
            EntryKind::Directory
        } else {
            EntryKind::File
        };
        files::copy_path(&source, &repo_copy)?;
        registry.record_capture(name, live.clone(), kind)?;

        tracing::info!("Captured {} into {}", source.display(), repo_copy.display());
        Ok(UpdateOutcome::Updated {
            hash: live,
            backup: previous,
        })
    }

    /// Recompute the persisted status flag of every entry from the running
    /// platform. Returns the entries whose flag changed.
    pub fn refresh_status(&self, registry: &mut Registry) -> Result<Vec<(String, EntryStatus)>> {
        let mut updates = Vec::new();
        for entry in registry.iter() {
            let statuses = self.check_status(entry)?;
            let status = match statuses.get(self.platform) {
                Some(DeployStatus::Missing) => EntryStatus::Untracked,
                Some(DeployStatus::NotDeployed) => EntryStatus::Missing,
                Some(DeployStatus::DeployedModified) => EntryStatus::Modified,
                Some(DeployStatus::DeployedClean) => EntryStatus::Tracked,
                // Not bound here: only the repository copy can be judged.
                None if statuses.iter().any(|(_, s)| *s == DeployStatus::Missing) => {
                    EntryStatus::Untracked
                }
                None => EntryStatus::Tracked,
            };
            if status != entry.status {
                updates.push((entry.name.clone(), status));
            }
        }

        registry.set_statuses(updates.clone())?;
        Ok(updates)
    }

    pub fn list_backups(&self, name: &str) -> Result<Vec<BackupInfo>> {
        backup::list(&self.layout, name)
    }

    /// Put a backup back in place on the running platform: the named one, or
    /// the newest taken from this platform. The current target is backed up
    /// first.
    pub fn restore(
        &self,
        registry: &mut Registry,
        name: &str,
        backup_id: Option<&str>,
    ) -> Result<RestoreResult> {
        let entry = registry.get(name)?.clone();
        let target = entry
            .source_for(self.platform)
            .map(Path::to_path_buf)
            .ok_or_else(|| Error::NoSourceForPlatform {
                name: name.to_string(),
                platform: self.platform,
            })?;

        let backups = self.list_backups(name)?;
        let chosen = match backup_id {
            Some(id) => backups.into_iter().find(|b| b.id == id),
            None => backups
                .into_iter()
                .rev()
                .find(|b| b.label == self.platform.as_str()),
        }
        .ok_or_else(|| Error::InvalidPath {
            path: self.layout.backups_dir().join(name),
            reason: match backup_id {
                Some(id) => format!("no backup named '{id}'"),
                None => format!("no {} backup to restore", self.platform),
            },
        })?;

        let previous = match hash::hash_if_exists(&target)? {
            Some(_) => Some(backup::create(&self.layout, name, self.platform.as_str(), &target)?),
            None => None,
        };
        files::remove_path(&target)?;
        files::copy_path(&chosen.path, &target)?;

        let restored = hash::hash_path(&target)?;
        let status = if entry.last_synced_hash.as_deref() == Some(restored.as_str()) {
            EntryStatus::Tracked
        } else {
            EntryStatus::Modified
        };
        registry.set_status(name, status)?;

        tracing::info!("Restored {} from {}", target.display(), chosen.path.display());
        Ok(RestoreResult {
            target,
            restored_from: chosen.path,
            previous,
        })
    }

    /// Fingerprint of what a deploy to the running platform would write, or
    /// `None` when there is no repository copy.
    pub fn fingerprint(&self, entry: &ConfigEntry) -> Result<Option<String>> {
        match self.expected(entry, self.platform) {
            Ok(expected) => Ok(Some(expected.fingerprint)),
            Err(Error::MissingRepoCopy { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn expected(&self, entry: &ConfigEntry, platform: Platform) -> Result<Expected> {
        let repo_copy = self.layout.resolve(&entry.target_repo_path);
        if !files::exists_no_follow(&repo_copy) {
            return Err(Error::MissingRepoCopy {
                name: entry.name.clone(),
                path: repo_copy,
            });
        }

        if entry.is_template && repo_copy.is_file() {
            let raw = fs::read(&repo_copy).at(&repo_copy)?;
            let rendered = template::render(&raw, &self.variables_for(entry, platform));
            return Ok(Expected {
                repo_copy,
                fingerprint: hash::hash_bytes(&rendered.content),
                rendered: Some(rendered.content),
                warnings: rendered.warnings,
            });
        }

        Ok(Expected {
            fingerprint: hash::hash_path(&repo_copy)?,
            repo_copy,
            rendered: None,
            warnings: Vec::new(),
        })
    }

    fn variables_for(&self, entry: &ConfigEntry, platform: Platform) -> BTreeMap<String, String> {
        let mut variables = self.ctx.with_overrides(&entry.template_vars);
        if platform != self.platform && !entry.template_vars.contains_key("PLATFORM") {
            variables.insert("PLATFORM".to_string(), platform.to_string());
        }
        variables
    }

    /// Write the expected content to an empty `target`. Returns how it landed
    /// and whether a symlink was refused.
    fn write(
        &self,
        entry: &ConfigEntry,
        expected: &Expected,
        target: &Path,
        wants_link: bool,
    ) -> Result<(DeployMode, bool)> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).at(parent)?;
        }

        if wants_link {
            if self.symlinks {
                match make_symlink(&expected.repo_copy, target) {
                    Ok(()) => return Ok((DeployMode::Symlink, false)),
                    Err(e) if symlink_refused(&e) => {
                        tracing::warn!(
                            "Symlink refused at {} ({e}), copying instead",
                            target.display()
                        );
                    }
                    Err(e) => return Err(Error::io(target, e)),
                }
            }
            self.write_copy(entry, expected, target)?;
            return Ok((DeployMode::Copy, true));
        }

        self.write_copy(entry, expected, target)?;
        Ok((DeployMode::Copy, false))
    }

    fn write_copy(&self, entry: &ConfigEntry, expected: &Expected, target: &Path) -> Result<()> {
        match &expected.rendered {
            Some(bytes) => files::write_atomic(target, bytes)?,
            None if expected.repo_copy.is_dir() => files::copy_path(&expected.repo_copy, target)?,
            None => files::copy_atomic(&expected.repo_copy, target)?,
        }
        if entry.executable && entry.kind == EntryKind::File {
            files::set_executable(target)?;
        }
        Ok(())
    }
}

/// True if `link` resolves to the same file as `repo_copy`.
fn points_to(link: &Path, repo_copy: &Path) -> bool {
    match (fs::canonicalize(link), fs::canonicalize(repo_copy)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[cfg(unix)]
fn make_symlink(original: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(original, link)
}

#[cfg(windows)]
fn make_symlink(original: &Path, link: &Path) -> io::Result<()> {
    if original.is_dir() {
        std::os::windows::fs::symlink_dir(original, link)
    } else {
        std::os::windows::fs::symlink_file(original, link)
    }
}

/// Refusals that warrant a copy instead of an error.
fn symlink_refused(e: &io::Error) -> bool {
    // 1314: ERROR_PRIVILEGE_NOT_HELD on Windows without developer mode.
    matches!(
        e.kind(),
        io::ErrorKind::PermissionDenied | io::ErrorKind::Unsupported
    ) || (cfg!(windows) && e.raw_os_error() == Some(1314))
}
