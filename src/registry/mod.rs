//! The configuration registry: every managed entry, its per-platform source
//! paths and its canonical copy inside the repository.
//!
//! All mutations go through [`Registry::commit`], which applies the change to
//! a copy of the entry list, persists that copy and only then swaps it in, so
//! a failed write leaves both memory and disk untouched.

pub mod index;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::cfg::{self, Layout};
use crate::error::{Error, Result};
use crate::files;
use crate::hash;
use crate::platform::{Platform, PlatformMap};
use crate::template;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployMode {
    #[default]
    Symlink,
    Copy,
}

impl fmt::Display for DeployMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeployMode::Symlink => f.write_str("symlink"),
            DeployMode::Copy => f.write_str("copy"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    #[default]
    File,
    Directory,
}

/// Persisted status flag, refreshed by deploy, update and status runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    #[default]
    Tracked,
    Modified,
    Missing,
    Untracked,
}

impl EntryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryStatus::Tracked => "tracked",
            EntryStatus::Modified => "modified",
            EntryStatus::Missing => "missing",
            EntryStatus::Untracked => "untracked",
        }
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tracked" => Ok(EntryStatus::Tracked),
            "modified" => Ok(EntryStatus::Modified),
            "missing" => Ok(EntryStatus::Missing),
            "untracked" => Ok(EntryStatus::Untracked),
            other => Err(format!(
                "unknown status '{other}' (expected tracked, modified, missing or untracked)"
            )),
        }
    }
}

/// What was last written to one platform's target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployRecord {
    /// Fingerprint of the deployed content.
    pub hash: String,
    pub deployed_at: DateTime<Utc>,
    pub method: DeployMode,
    /// Set when a symlink was refused and a copy was written instead.
    #[serde(default)]
    pub fallback: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    pub source_paths: PlatformMap<PathBuf>,

    /// Location of the canonical copy, relative to the repository root.
    pub target_repo_path: PathBuf,

    #[serde(default)]
    pub deploy_mode: DeployMode,

    #[serde(default)]
    pub is_template: bool,

    #[serde(default)]
    pub last_synced_hash: Option<String>,

    #[serde(default)]
    pub kind: EntryKind,

    #[serde(default)]
    pub status: EntryStatus,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    #[serde(default)]
    pub executable: bool,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub template_vars: BTreeMap<String, String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "PlatformMap::is_empty")]
    pub deployments: PlatformMap<DeployRecord>,
}

impl ConfigEntry {
    pub fn source_for(&self, platform: Platform) -> Option<&Path> {
        self.source_paths.get(platform).map(PathBuf::as_path)
    }

    pub fn platforms(&self) -> impl Iterator<Item = Platform> + '_ {
        self.source_paths.platforms()
    }

    /// Whether deploying to `platform` produces a copy rather than a link:
    /// copy mode, templates, and platforms whose last deploy fell back.
    pub fn deploys_as_copy(&self, platform: Platform) -> bool {
        self.deploy_mode == DeployMode::Copy
            || self.is_template
            || self
                .deployments
                .get(platform)
                .map(|r| r.fallback)
                .unwrap_or(false)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// Source paths given to [`Registry::add`].
#[derive(Debug, Clone)]
pub enum Sources {
    /// One path, bound to the registry's running platform.
    Single(PathBuf),
    PerPlatform(PlatformMap<PathBuf>),
}

#[derive(Debug, Clone, Default)]
pub struct AddOptions {
    /// Register paths that do not exist yet.
    pub allow_missing: bool,
    pub mode: DeployMode,
    /// `None` detects `{{NAME}}` tokens in the source.
    pub template: Option<bool>,
    pub tags: Vec<String>,
    pub template_vars: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub platform: Option<Platform>,
    pub status: Option<EntryStatus>,
    pub tag: Option<String>,
}

impl ListFilter {
    pub fn matches(&self, entry: &ConfigEntry) -> bool {
        self.platform
            .map_or(true, |p| entry.source_paths.contains(p))
            && self.status.map_or(true, |s| entry.status == s)
            && self.tag.as_deref().map_or(true, |t| entry.has_tag(t))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub total: usize,
    pub files: usize,
    pub directories: usize,
    pub templates: usize,
    pub by_platform: BTreeMap<Platform, usize>,
    pub by_status: BTreeMap<EntryStatus, usize>,
}

#[derive(Debug)]
pub struct Registry {
    layout: Layout,
    platform: Platform,
    entries: Vec<ConfigEntry>,
}

impl Registry {
    /// Load the registry of an initialized repository. Legacy index documents
    /// are upgraded and written back in the current schema straight away.
    pub fn open(layout: Layout, platform: Platform) -> Result<Self> {
        if !layout.meta_dir().is_dir() {
            return Err(Error::Uninitialized { path: layout.root });
        }

        let loaded = index::load(&layout, platform)?;
        let registry = Registry {
            layout,
            platform,
            entries: loaded.entries,
        };

        if let Some(from) = loaded.upgraded_from {
            for note in &loaded.notes {
                tracing::warn!("{note}");
            }
            index::save(&registry.layout, &registry.entries)?;
            tracing::info!(
                "Upgraded registry index from schema {from} to {} ({} entries)",
                index::SCHEMA_VERSION,
                registry.entries.len()
            );
        }

        Ok(registry)
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ConfigEntry> {
        self.entries.iter()
    }

    pub fn get(&self, name: &str) -> Result<&ConfigEntry> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| Error::NotFound {
                name: name.to_string(),
            })
    }

    /// Entries matching `filter`, in insertion order.
    pub fn list(&self, filter: ListFilter) -> impl Iterator<Item = &ConfigEntry> + Clone + '_ {
        self.entries.iter().filter(move |e| filter.matches(e))
    }

    /// Absolute location of an entry's canonical copy.
    pub fn repo_path(&self, entry: &ConfigEntry) -> PathBuf {
        self.layout.resolve(&entry.target_repo_path)
    }

    /// Register a new entry and copy its first existing source (the running
    /// platform's preferred) into the repository.
    pub fn add(
        &mut self,
        name: &str,
        sources: Sources,
        description: Option<String>,
        options: AddOptions,
    ) -> Result<&ConfigEntry> {
        validate_name(name)?;
        if self.entries.iter().any(|e| e.name == name) {
            return Err(Error::DuplicateName {
                name: name.to_string(),
            });
        }

        let requested = match sources {
            Sources::Single(path) => PlatformMap::single(self.platform, path),
            Sources::PerPlatform(map) => map,
        };
        if requested.is_empty() {
            return Err(Error::InvalidPath {
                path: PathBuf::new(),
                reason: "at least one source path is required".to_string(),
            });
        }

        let mut source_paths = PlatformMap::new();
        for (platform, path) in requested.iter() {
            let path = self.validate_source(platform, path, options.allow_missing)?;
            source_paths.insert(platform, path);
        }

        let capture = self.capture_source(&source_paths);
        let kind = match capture.as_deref() {
            Some(path) if path.is_dir() => EntryKind::Directory,
            _ => EntryKind::File,
        };

        let is_template = match options.template {
            Some(explicit) => explicit,
            None => match (capture.as_deref(), kind) {
                (Some(path), EntryKind::File) => std::fs::read(path)
                    .map(|bytes| template::contains_tokens(&bytes))
                    .unwrap_or(false),
                _ => false,
            },
        };
        if is_template && kind == EntryKind::Directory {
            return Err(Error::InvalidPath {
                path: capture.unwrap_or_default(),
                reason: "directories cannot be templates".to_string(),
            });
        }

        let target_repo_path = derive_repo_path(name, &source_paths, is_template);
        let repo_abs = self.layout.resolve(&target_repo_path);

        let (last_synced_hash, status, executable) = match capture.as_deref() {
            Some(source) => {
                tracing::debug!(
                    "Copying {} into {}",
                    source.display(),
                    repo_abs.display()
                );
                files::copy_path(source, &repo_abs)?;
                let fingerprint = hash::hash_path(source)?;
                (
                    Some(fingerprint),
                    EntryStatus::Tracked,
                    files::is_executable(source),
                )
            }
            None => (None, EntryStatus::Untracked, false),
        };

        let now = Utc::now();
        let entry = ConfigEntry {
            name: name.to_string(),
            description,
            source_paths,
            target_repo_path,
            deploy_mode: options.mode,
            is_template,
            last_synced_hash,
            kind,
            status,
            tags: options.tags,
            executable,
            template_vars: options.template_vars,
            created_at: now,
            updated_at: now,
            deployments: PlatformMap::new(),
        };

        let committed = self.commit(|entries| {
            entries.push(entry);
            Ok(())
        });
        if let Err(e) = committed {
            if capture.is_some() {
                let _ = files::remove_path(&repo_abs);
            }
            return Err(e);
        }

        tracing::info!("Added configuration '{name}'");
        self.get(name)
    }

    /// Unregister an entry. The repository copy is deleted afterwards unless
    /// `keep_files` is set; backups are never touched.
    pub fn remove(&mut self, name: &str, keep_files: bool) -> Result<ConfigEntry> {
        let idx = self.position(name)?;
        let removed = self.commit(|entries| Ok(entries.remove(idx)))?;

        if !keep_files {
            let repo_abs = self.layout.resolve(&removed.target_repo_path);
            files::remove_path(&repo_abs)?;
        }

        tracing::info!("Removed configuration '{name}'");
        Ok(removed)
    }

    /// Bind a source path for one more platform.
    ///
    /// Returns `false` when the identical path is already registered. A
    /// different path for an already bound platform is a [`Error::PathConflict`].
    pub fn add_platform_path(
        &mut self,
        name: &str,
        platform: Platform,
        path: &Path,
        allow_missing: bool,
    ) -> Result<bool> {
        let idx = self.position(name)?;
        let path = self.validate_source(platform, path, allow_missing)?;

        if let Some(existing) = self.entries[idx].source_paths.get(platform) {
            if *existing == path {
                return Ok(false);
            }
            return Err(Error::PathConflict {
                name: name.to_string(),
                platform,
                existing: existing.clone(),
                requested: path,
            });
        }

        self.commit(|entries| {
            let entry = &mut entries[idx];
            entry.source_paths.insert(platform, path);
            entry.updated_at = Utc::now();
            Ok(())
        })?;
        Ok(true)
    }

    pub fn remove_platform_path(&mut self, name: &str, platform: Platform) -> Result<PathBuf> {
        let idx = self.position(name)?;
        let entry = &self.entries[idx];

        if !entry.source_paths.contains(platform) {
            return Err(Error::PlatformNotFound {
                name: name.to_string(),
                platform,
            });
        }
        if entry.source_paths.len() == 1 {
            return Err(Error::LastPlatformRemoval {
                name: name.to_string(),
                platform,
            });
        }

        self.commit(|entries| {
            let entry = &mut entries[idx];
            entry.deployments.remove(platform);
            entry.updated_at = Utc::now();
            entry.source_paths.remove(platform).ok_or_else(|| Error::PlatformNotFound {
                name: name.to_string(),
                platform,
            })
        })
    }

    /// Record a completed deploy. Machine-local: the shared index is untouched.
    pub fn record_deploy(&mut self, name: &str, platform: Platform, record: DeployRecord) -> Result<()> {
        let idx = self.position(name)?;
        self.commit(|entries| {
            let entry = &mut entries[idx];
            entry.last_synced_hash = Some(record.hash.clone());
            entry.deployments.insert(platform, record);
            entry.status = EntryStatus::Tracked;
            Ok(())
        })
    }

    /// Record that the live file was captured back into the repository.
    pub fn record_capture(&mut self, name: &str, hash: String, kind: EntryKind) -> Result<()> {
        let idx = self.position(name)?;
        self.commit(|entries| {
            let entry = &mut entries[idx];
            entry.last_synced_hash = Some(hash);
            entry.kind = kind;
            entry.status = EntryStatus::Tracked;
            entry.updated_at = Utc::now();
            Ok(())
        })
    }

    pub fn set_status(&mut self, name: &str, status: EntryStatus) -> Result<()> {
        self.position(name)?;
        self.set_statuses([(name.to_string(), status)])?;
        Ok(())
    }

    /// Apply several status changes in one write. Returns how many changed;
    /// nothing is written when none did.
    pub fn set_statuses(
        &mut self,
        updates: impl IntoIterator<Item = (String, EntryStatus)>,
    ) -> Result<usize> {
        let changes: Vec<(usize, EntryStatus)> = updates
            .into_iter()
            .filter_map(|(name, status)| {
                let idx = self.entries.iter().position(|e| e.name == name)?;
                (self.entries[idx].status != status).then_some((idx, status))
            })
            .collect();

        if changes.is_empty() {
            return Ok(0);
        }

        self.commit(|entries| {
            for (idx, status) in &changes {
                entries[*idx].status = *status;
            }
            Ok(changes.len())
        })
    }

    /// Replace `last_synced_hash` for the named entries in one write.
    pub fn refresh_hashes(
        &mut self,
        updates: impl IntoIterator<Item = (String, Option<String>)>,
    ) -> Result<Vec<String>> {
        let changes: Vec<(usize, Option<String>)> = updates
            .into_iter()
            .filter_map(|(name, hash)| {
                let idx = self.entries.iter().position(|e| e.name == name)?;
                (self.entries[idx].last_synced_hash != hash).then_some((idx, hash))
            })
            .collect();

        if changes.is_empty() {
            return Ok(Vec::new());
        }

        self.commit(|entries| {
            let mut names = Vec::with_capacity(changes.len());
            for (idx, hash) in changes {
                let entry = &mut entries[idx];
                entry.last_synced_hash = hash;
                names.push(entry.name.clone());
            }
            Ok(names)
        })
    }

    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            total: self.entries.len(),
            ..RegistryStats::default()
        };

        for entry in &self.entries {
            match entry.kind {
                EntryKind::File => stats.files += 1,
                EntryKind::Directory => stats.directories += 1,
            }
            if entry.is_template {
                stats.templates += 1;
            }
            for platform in entry.platforms() {
                *stats.by_platform.entry(platform).or_default() += 1;
            }
            *stats.by_status.entry(entry.status).or_default() += 1;
        }

        stats
    }

    fn position(&self, name: &str) -> Result<usize> {
        self.entries
            .iter()
            .position(|e| e.name == name)
            .ok_or_else(|| Error::NotFound {
                name: name.to_string(),
            })
    }

    /// Apply `change` to a copy of the entries, persist it, then swap it in.
    ///
    /// The shared index is only rewritten when a definition changed, so
    /// deploys and status refreshes leave the repository clean.
    fn commit<R>(&mut self, change: impl FnOnce(&mut Vec<ConfigEntry>) -> Result<R>) -> Result<R> {
        let mut staged = self.entries.clone();
        let out = change(&mut staged)?;
        if index::definitions_differ(&self.entries, &staged) {
            index::save_definitions(&self.layout.index_path(), &staged)?;
        }
        index::save_local(&self.layout.local_state_path(), &staged)?;
        self.entries = staged;
        Ok(out)
    }

    fn validate_source(&self, platform: Platform, raw: &Path, allow_missing: bool) -> Result<PathBuf> {
        let path = cfg::expand_path(raw);

        let absolute = if platform == self.platform {
            path.is_absolute()
        } else {
            is_absolute_for(platform, &path)
        };
        if !absolute {
            return Err(Error::InvalidPath {
                path,
                reason: format!("{platform} source paths must be absolute"),
            });
        }

        // Only the running platform's paths can be checked on disk.
        if platform == self.platform && !allow_missing {
            match std::fs::metadata(&path) {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(Error::InvalidPath {
                        path,
                        reason: "does not exist".to_string(),
                    });
                }
                Err(e) => return Err(Error::io(&path, e)),
            }
        }

        Ok(path)
    }

    /// The source to copy into the repository: the running platform's path
    /// when it exists, else the first other path that does.
    fn capture_source(&self, sources: &PlatformMap<PathBuf>) -> Option<PathBuf> {
        let preferred = sources.get(self.platform).filter(|p| p.exists());
        preferred
            .or_else(|| sources.iter().map(|(_, p)| p).find(|p| p.exists()))
            .cloned()
    }
}

fn validate_name(name: &str) -> Result<()> {
    let reason = if name.trim().is_empty() {
        Some("must not be empty")
    } else if name == "." || name == ".." {
        Some("is reserved")
    } else if name.contains('/') || name.contains('\\') {
        Some("must not contain path separators")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(Error::InvalidName {
            name: name.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

/// Absolute-path check for a platform other than the running one, where
/// `Path::is_absolute` applies the wrong rules.
fn is_absolute_for(platform: Platform, path: &Path) -> bool {
    let raw = path.to_string_lossy();
    match platform {
        Platform::Windows => {
            let bytes = raw.as_bytes();
            raw.starts_with(r"\\")
                || (bytes.len() >= 3
                    && bytes[0].is_ascii_alphabetic()
                    && bytes[1] == b':'
                    && (bytes[2] == b'\\' || bytes[2] == b'/'))
        }
        Platform::Linux | Platform::Macos => raw.starts_with('/'),
    }
}

/// `<linux|macos|windows|common>/<name>`, under `templates/` for templates.
pub fn derive_repo_path(name: &str, sources: &PlatformMap<PathBuf>, is_template: bool) -> PathBuf {
    let sub = match sources.platforms().collect::<Vec<_>>().as_slice() {
        [only] => only.as_str(),
        _ => "common",
    };

    let base = PathBuf::from(sub).join(name);
    if is_template {
        PathBuf::from("templates").join(base)
    } else {
        base
    }
}
