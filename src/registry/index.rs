//! On-disk registry index.
//!
//! Entry definitions live in `index.json`, which travels with the repository:
//! `{"version": 2, "entries": [...]}`. What one machine did with them
//! (fingerprints, deploy records, status flags) lives in the git-ignored
//! `local.json`, keyed by entry name, so two machines only touch the same
//! bytes when they edit the same definition. Older tools wrote `{"version":
//! "1.0", "configs": {...}}` to `config_index.json`; those documents are
//! converted by the pure [`upgrade_v1`] and rewritten by the caller.

use chrono::{DateTime, Utc};
use serde::de::{Deserializer, MapAccess, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};

use super::{
    derive_repo_path, is_absolute_for, validate_name, ConfigEntry, DeployMode, DeployRecord,
    EntryKind, EntryStatus,
};
use crate::cfg::{Layout, META_DIR};
use crate::error::{Error, IoResultExt, Result};
use crate::files;
use crate::platform::{Platform, PlatformMap};
use crate::sync::ConflictStrategy;

pub const SCHEMA_VERSION: u32 = 2;

/// File name used by the version 1 tool.
pub const LEGACY_INDEX_FILE: &str = "config_index.json";

/// The shared definition of an entry, as stored in `index.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntry {
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    pub source_paths: PlatformMap<PathBuf>,

    pub target_repo_path: PathBuf,

    #[serde(default)]
    pub deploy_mode: DeployMode,

    #[serde(default)]
    pub is_template: bool,

    #[serde(default)]
    pub kind: EntryKind,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    #[serde(default)]
    pub executable: bool,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub template_vars: BTreeMap<String, String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Machine-local state of one entry, as stored in `local.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced_hash: Option<String>,

    #[serde(default)]
    pub status: EntryStatus,

    #[serde(default, skip_serializing_if = "PlatformMap::is_empty")]
    pub deployments: PlatformMap<DeployRecord>,
}

impl StoredEntry {
    pub fn from_entry(entry: &ConfigEntry) -> Self {
        StoredEntry {
            name: entry.name.clone(),
            description: entry.description.clone(),
            source_paths: entry.source_paths.clone(),
            target_repo_path: entry.target_repo_path.clone(),
            deploy_mode: entry.deploy_mode,
            is_template: entry.is_template,
            kind: entry.kind,
            tags: entry.tags.clone(),
            executable: entry.executable,
            template_vars: entry.template_vars.clone(),
            created_at: entry.created_at,
            updated_at: entry.updated_at,
        }
    }

    pub fn into_entry(self, local: LocalState) -> ConfigEntry {
        ConfigEntry {
            name: self.name,
            description: self.description,
            source_paths: self.source_paths,
            target_repo_path: self.target_repo_path,
            deploy_mode: self.deploy_mode,
            is_template: self.is_template,
            last_synced_hash: local.last_synced_hash,
            kind: self.kind,
            status: local.status,
            tags: self.tags,
            executable: self.executable,
            template_vars: self.template_vars,
            created_at: self.created_at,
            updated_at: self.updated_at,
            deployments: local.deployments,
        }
    }
}

impl LocalState {
    pub fn from_entry(entry: &ConfigEntry) -> Self {
        LocalState {
            last_synced_hash: entry.last_synced_hash.clone(),
            status: entry.status,
            deployments: entry.deployments.clone(),
        }
    }
}

#[derive(Serialize)]
struct IndexDocumentRef<'a> {
    version: u32,
    entries: &'a [StoredEntry],
}

#[derive(Deserialize)]
struct IndexDocument {
    entries: Vec<StoredEntry>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LocalDocument {
    #[serde(default)]
    entries: BTreeMap<String, LocalState>,
}

/// Result of reading the index.
#[derive(Debug, Default)]
pub struct Loaded {
    pub entries: Vec<ConfigEntry>,
    /// Schema the document was upgraded from, if it was not current.
    pub upgraded_from: Option<String>,
    /// Fields the upgrade could not carry over.
    pub notes: Vec<String>,
}

/// Read the index of `layout`, falling back to a legacy document. A
/// repository without either is empty.
///
/// Every entry is validated: a document naming a repository path outside the
/// repository, or a relative source path, is refused as a whole.
pub fn load(layout: &Layout, platform: Platform) -> Result<Loaded> {
    let current = layout.index_path();
    let legacy = layout.meta_dir().join(LEGACY_INDEX_FILE);

    let path = if current.exists() {
        current
    } else if legacy.exists() {
        legacy
    } else {
        return Ok(Loaded::default());
    };

    let contents = fs::read(&path).at(&path)?;
    let value: Value = serde_json::from_slice(&contents).map_err(|e| index_error(&path, e))?;

    match detect_version(&value) {
        Some(2) => {
            let definitions = definitions_from_value(value, &path)?;
            let mut local = load_local(&layout.local_state_path())?;
            let entries: Vec<ConfigEntry> = definitions
                .into_iter()
                .map(|stored| {
                    let state = local.remove(&stored.name).unwrap_or_default();
                    stored.into_entry(state)
                })
                .collect();
            tracing::debug!("Loaded {} entries from {}", entries.len(), path.display());
            Ok(Loaded {
                entries,
                upgraded_from: None,
                notes: Vec::new(),
            })
        }
        Some(1) => {
            // Parsed from the raw text: `Value` would not keep the key order.
            let doc: LegacyDocument =
                serde_json::from_slice(&contents).map_err(|e| index_error(&path, e))?;
            let (entries, notes) = upgrade_v1(doc, &layout.root, platform);
            for entry in &entries {
                check_entry(&entry.name, &entry.target_repo_path, &entry.source_paths)
                    .map_err(|message| Error::Index {
                        path: path.clone(),
                        message,
                    })?;
            }
            Ok(Loaded {
                entries,
                upgraded_from: Some("1.0".to_string()),
                notes,
            })
        }
        _ => Err(Error::Index {
            path,
            message: format!("unsupported schema version {}", value["version"]),
        }),
    }
}

/// Write both the shared definitions and the local state.
pub fn save(layout: &Layout, entries: &[ConfigEntry]) -> Result<()> {
    save_definitions(&layout.index_path(), entries)?;
    save_local(&layout.local_state_path(), entries)
}

/// Write the shared definitions atomically.
pub fn save_definitions(path: &Path, entries: &[ConfigEntry]) -> Result<()> {
    let stored: Vec<StoredEntry> = entries.iter().map(StoredEntry::from_entry).collect();
    files::write_atomic(path, &encode(&stored, path)?)?;
    tracing::debug!("Saved {} entries to {}", entries.len(), path.display());
    Ok(())
}

/// Write the machine-local state atomically.
pub fn save_local(path: &Path, entries: &[ConfigEntry]) -> Result<()> {
    let doc = LocalDocument {
        entries: entries
            .iter()
            .map(|e| (e.name.clone(), LocalState::from_entry(e)))
            .collect(),
    };
    let json = serde_json::to_string_pretty(&doc).map_err(|e| index_error(path, e))?;
    files::write_atomic(path, json.as_bytes())
}

/// Whether the shared definitions of two entry lists differ.
pub fn definitions_differ(a: &[ConfigEntry], b: &[ConfigEntry]) -> bool {
    a.len() != b.len()
        || a
            .iter()
            .zip(b)
            .any(|(x, y)| StoredEntry::from_entry(x) != StoredEntry::from_entry(y))
}

/// Serialize definitions as an index document.
pub fn encode(entries: &[StoredEntry], path: &Path) -> Result<Vec<u8>> {
    let doc = IndexDocumentRef {
        version: SCHEMA_VERSION,
        entries,
    };
    let mut json = serde_json::to_string_pretty(&doc).map_err(|e| index_error(path, e))?;
    json.push('\n');
    Ok(json.into_bytes())
}

/// Parse and validate a current-schema index document.
pub fn definitions(contents: &[u8], path: &Path) -> Result<Vec<StoredEntry>> {
    let value: Value = serde_json::from_slice(contents).map_err(|e| index_error(path, e))?;
    match detect_version(&value) {
        Some(2) => definitions_from_value(value, path),
        _ => Err(Error::Index {
            path: path.to_path_buf(),
            message: format!("expected schema version {SCHEMA_VERSION}, found {}", value["version"]),
        }),
    }
}

fn definitions_from_value(value: Value, path: &Path) -> Result<Vec<StoredEntry>> {
    let doc: IndexDocument = serde_json::from_value(value).map_err(|e| index_error(path, e))?;

    for (i, entry) in doc.entries.iter().enumerate() {
        let invalid = check_entry(&entry.name, &entry.target_repo_path, &entry.source_paths).err();
        let duplicate = doc.entries[..i]
            .iter()
            .any(|e| e.name == entry.name)
            .then(|| format!("duplicate entry '{}'", entry.name));
        if let Some(message) = invalid.or(duplicate) {
            return Err(Error::Index {
                path: path.to_path_buf(),
                message,
            });
        }
    }
    Ok(doc.entries)
}

fn load_local(path: &Path) -> Result<BTreeMap<String, LocalState>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let contents = fs::read(path).at(path)?;
    match serde_json::from_slice::<LocalDocument>(&contents) {
        Ok(doc) => Ok(doc.entries),
        Err(e) => {
            // Only fingerprints and deploy records are lost; they are rebuilt
            // by the next deploy or sync.
            tracing::warn!("Ignoring unreadable {}: {e}", path.display());
            Ok(BTreeMap::new())
        }
    }
}

/// Rules every loaded entry must satisfy, whatever wrote it.
fn check_entry(
    name: &str,
    target_repo_path: &Path,
    source_paths: &PlatformMap<PathBuf>,
) -> std::result::Result<(), String> {
    validate_name(name).map_err(|e| e.to_string())?;

    if !is_contained(target_repo_path) {
        return Err(format!(
            "'{name}': repository path {} must be relative and stay inside the repository",
            target_repo_path.display()
        ));
    }
    if source_paths.is_empty() {
        return Err(format!("'{name}': no source path"));
    }
    for (platform, path) in source_paths.iter() {
        if !is_absolute_for(platform, path) {
            return Err(format!(
                "'{name}': {platform} source path {} is not absolute",
                path.display()
            ));
        }
    }
    Ok(())
}

/// Relative, made of plain components only, and not inside `.git` or the
/// metadata directory.
pub fn is_contained(path: &Path) -> bool {
    let mut first = None;
    for component in path.components() {
        match component {
            Component::Normal(part) => {
                first.get_or_insert(part);
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    match first {
        Some(part) => part != ".git" && part != META_DIR,
        None => false,
    }
}

/// Outcome of [`merge_definitions`].
#[derive(Debug, Default, PartialEq)]
pub struct MergedIndex {
    pub entries: Vec<StoredEntry>,
    /// Entries both sides changed differently, left unresolved (our version
    /// is kept in `entries`).
    pub conflicts: Vec<String>,
    /// Entries both sides changed differently, settled by the strategy.
    pub settled: Vec<String>,
}

/// Three-way merge of index documents, entry by entry.
///
/// An entry changed on one side only takes that side's version (including a
/// removal). Only entries both sides changed differently need `strategy`;
/// without one they are reported in `conflicts`. Entries keep our order, with
/// their new entries appended in their order.
pub fn merge_definitions(
    base: Option<&[u8]>,
    ours: Option<&[u8]>,
    theirs: Option<&[u8]>,
    strategy: Option<ConflictStrategy>,
    path: &Path,
) -> Result<MergedIndex> {
    let parse = |side: Option<&[u8]>| match side {
        Some(bytes) => definitions(bytes, path),
        None => Ok(Vec::new()),
    };
    let base = parse(base)?;
    let ours = parse(ours)?;
    let theirs = parse(theirs)?;

    let find = |side: &[StoredEntry], name: &str| side.iter().find(|e| e.name == name).cloned();

    let mut names: Vec<&str> = ours.iter().map(|e| e.name.as_str()).collect();
    for entry in &theirs {
        if !names.contains(&entry.name.as_str()) {
            names.push(&entry.name);
        }
    }

    let mut merged = MergedIndex::default();
    for name in names {
        let (b, o, t) = (find(&base, name), find(&ours, name), find(&theirs, name));
        let pick = if o == t || t == b {
            o
        } else if o == b {
            t
        } else {
            match strategy {
                Some(ConflictStrategy::KeepLocal) => {
                    merged.settled.push(name.to_string());
                    o
                }
                Some(ConflictStrategy::KeepRemote) => {
                    merged.settled.push(name.to_string());
                    t
                }
                None => {
                    merged.conflicts.push(name.to_string());
                    o
                }
            }
        };
        merged.entries.extend(pick);
    }

    Ok(merged)
}

fn index_error(path: &Path, e: serde_json::Error) -> Error {
    Error::Index {
        path: path.to_path_buf(),
        message: e.to_string(),
    }
}

/// `version` is an integer from schema 2 on; version 1 wrote the string
/// "1.0". A document without a version but with `configs` is version 1.
fn detect_version(value: &Value) -> Option<u32> {
    match value.get("version") {
        Some(Value::Number(n)) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        Some(Value::String(s)) => s
            .split('.')
            .next()
            .and_then(|major| major.parse().ok()),
        None if value.get("configs").is_some() => Some(1),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
pub struct LegacyDocument {
    #[serde(default)]
    pub platform: Option<String>,

    #[serde(default, deserialize_with = "ordered_configs")]
    pub configs: Vec<(String, LegacyConfig)>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LegacyConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub source_path: Option<PathBuf>,
    #[serde(default)]
    pub source_paths: Option<BTreeMap<String, PathBuf>>,
    #[serde(default)]
    pub repo_path: Option<PathBuf>,
    #[serde(default)]
    pub config_type: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub current_platform: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub use_symlink: Option<bool>,
    #[serde(default)]
    pub executable: Option<bool>,
    #[serde(default)]
    pub template_vars: Option<BTreeMap<String, Value>>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

/// Deserialize the `configs` object keeping the document's key order.
fn ordered_configs<'de, D>(deserializer: D) -> std::result::Result<Vec<(String, LegacyConfig)>, D::Error>
where
    D: Deserializer<'de>,
{
    struct OrderedVisitor;

    impl<'de> Visitor<'de> for OrderedVisitor {
        type Value = Vec<(String, LegacyConfig)>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a map of configuration names to configurations")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Self::Value, A::Error> {
            let mut out = Vec::with_capacity(map.size_hint().unwrap_or(0));
            while let Some((name, config)) = map.next_entry::<String, LegacyConfig>()? {
                out.push((name, config));
            }
            Ok(out)
        }
    }

    deserializer.deserialize_map(OrderedVisitor)
}

/// Convert a version 1 document. Pure: reads nothing but its arguments.
///
/// A single `source_path` binds to the config's `current_platform`, else the
/// document's `platform`, else `loading`. Absolute `repo_path`s are made
/// relative to `root` when they live under it (or under any `configs/`
/// directory of a moved repository) and re-derived otherwise. MD5 checksums
/// are not comparable with blake3 fingerprints and are dropped.
pub fn upgrade_v1(doc: LegacyDocument, root: &Path, loading: Platform) -> (Vec<ConfigEntry>, Vec<String>) {
    let doc_platform = doc.platform.as_deref().and_then(|p| p.parse::<Platform>().ok());
    let mut entries: Vec<ConfigEntry> = Vec::with_capacity(doc.configs.len());
    let mut notes = Vec::new();

    for (key, config) in doc.configs {
        let name = config.name.clone().unwrap_or(key);
        if entries.iter().any(|e| e.name == name) {
            notes.push(format!("dropped duplicate legacy entry '{name}'"));
            continue;
        }

        let bound = config
            .current_platform
            .as_deref()
            .and_then(|p| p.parse::<Platform>().ok())
            .or(doc_platform)
            .unwrap_or(loading);

        let mut source_paths = PlatformMap::new();
        if let Some(map) = &config.source_paths {
            for (os, path) in map {
                match os.parse::<Platform>() {
                    Ok(platform) => {
                        source_paths.insert(platform, path.clone());
                    }
                    Err(_) => notes.push(format!("'{name}': dropped path for unknown platform '{os}'")),
                }
            }
        }
        if let Some(path) = &config.source_path {
            if !source_paths.contains(bound) {
                source_paths.insert(bound, path.clone());
            }
        }
        if source_paths.is_empty() {
            notes.push(format!("'{name}': no source path, entry dropped"));
            continue;
        }

        let config_type = config.config_type.as_deref().unwrap_or("dotfile");
        let is_template = config_type == "template";
        let kind = if config_type == "config_dir" {
            EntryKind::Directory
        } else {
            EntryKind::File
        };

        let target_repo_path = config
            .repo_path
            .as_deref()
            .and_then(|p| relative_repo_path(p, root))
            .unwrap_or_else(|| derive_repo_path(&name, &source_paths, is_template));

        if config.checksum.is_some() {
            notes.push(format!("'{name}': legacy checksum dropped, fingerprint recomputed on next deploy"));
        }

        let status = match config.status.as_deref() {
            Some("modified") | Some("conflicted") => EntryStatus::Modified,
            Some("missing") => EntryStatus::Missing,
            Some("untracked") => EntryStatus::Untracked,
            _ => EntryStatus::Tracked,
        };

        let template_vars = config
            .template_vars
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| match v {
                Value::String(s) => (k, s),
                other => (k, other.to_string()),
            })
            .collect();

        let now = Utc::now();
        entries.push(ConfigEntry {
            name,
            description: config.description,
            source_paths,
            target_repo_path,
            deploy_mode: if config.use_symlink.unwrap_or(true) {
                DeployMode::Symlink
            } else {
                DeployMode::Copy
            },
            is_template,
            last_synced_hash: None,
            kind,
            status,
            tags: config.tags.unwrap_or_default(),
            executable: config.executable.unwrap_or(false),
            template_vars,
            created_at: parse_legacy_time(config.created_at.as_deref()).unwrap_or(now),
            updated_at: parse_legacy_time(config.updated_at.as_deref()).unwrap_or(now),
            deployments: PlatformMap::new(),
        });
    }

    (entries, notes)
}

fn relative_repo_path(repo_path: &Path, root: &Path) -> Option<PathBuf> {
    if repo_path.is_relative() {
        return Some(repo_path.to_path_buf());
    }
    if let Ok(rel) = repo_path.strip_prefix(root) {
        return Some(rel.to_path_buf());
    }

    // A repository that moved since the index was written.
    let components: Vec<Component<'_>> = repo_path.components().collect();
    let at = components
        .iter()
        .rposition(|c| c.as_os_str() == "configs")?;
    Some(components[at..].iter().collect())
}

/// Version 1 wrote naive local ISO-8601 timestamps.
fn parse_legacy_time(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?;
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Some(t.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn legacy(json: &str) -> LegacyDocument {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_single_path_binds_to_recorded_platform() {
        let doc = legacy(
            r#"{
                "version": "1.0",
                "platform": "linux",
                "configs": {
                    "zshrc": {
                        "source_path": "/Users/u/.zshrc",
                        "repo_path": "/Users/u/.superdots/configs/darwin/dotfiles/zshrc",
                        "config_type": "dotfile",
                        "current_platform": "darwin",
                        "checksum": "d41d8cd98f00b204e9800998ecf8427e",
                        "use_symlink": false
                    }
                }
            }"#,
        );

        let (entries, notes) = upgrade_v1(doc, Path::new("/home/u/.superdots"), Platform::Linux);
        let entry = &entries[0];
        assert_eq!(entry.source_for(Platform::Macos), Some(Path::new("/Users/u/.zshrc")));
        assert_eq!(entry.source_paths.len(), 1);
        assert_eq!(entry.deploy_mode, DeployMode::Copy);
        assert_eq!(entry.last_synced_hash, None);
        assert_eq!(
            entry.target_repo_path,
            PathBuf::from("configs/darwin/dotfiles/zshrc")
        );
        assert!(notes.iter().any(|n| n.contains("checksum")));
    }

    #[test]
    fn test_single_path_falls_back_to_loading_platform() {
        let doc = legacy(r#"{"version": "1.0", "configs": {"vimrc": {"source_path": "C:\\Users\\u\\_vimrc"}}}"#);
        let (entries, _) = upgrade_v1(doc, Path::new("/r"), Platform::Windows);
        assert!(entries[0].source_paths.contains(Platform::Windows));
        assert_eq!(entries[0].target_repo_path, PathBuf::from("windows/vimrc"));
    }

    #[test]
    fn test_multi_path_template_keeps_order() {
        let doc = legacy(
            r#"{
                "version": "1.0",
                "configs": {
                    "zz-git": {
                        "source_paths": {"linux": "/home/u/.gitconfig", "darwin": "/Users/u/.gitconfig", "beos": "/x"},
                        "repo_path": "/home/u/.superdots/configs/common/templates/zz-git",
                        "config_type": "template",
                        "template_vars": {"EMAIL": "me@example.com", "PORT": 22},
                        "tags": ["git"]
                    },
                    "aa-nvim": {
                        "source_paths": {"linux": "/home/u/.config/nvim"},
                        "config_type": "config_dir",
                        "status": "conflicted"
                    }
                }
            }"#,
        );

        let (entries, notes) = upgrade_v1(doc, Path::new("/home/u/.superdots"), Platform::Linux);
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["zz-git", "aa-nvim"]);

        let git = &entries[0];
        assert!(git.is_template);
        assert_eq!(git.source_paths.len(), 2);
        assert_eq!(git.template_vars["PORT"], "22");
        assert_eq!(git.target_repo_path, PathBuf::from("configs/common/templates/zz-git"));
        assert!(notes.iter().any(|n| n.contains("beos")));

        let nvim = &entries[1];
        assert_eq!(nvim.kind, EntryKind::Directory);
        assert_eq!(nvim.status, EntryStatus::Modified);
        assert_eq!(nvim.target_repo_path, PathBuf::from("linux/aa-nvim"));
    }

    #[test]
    fn test_detect_version() {
        assert_eq!(detect_version(&serde_json::json!({"version": 2})), Some(2));
        assert_eq!(detect_version(&serde_json::json!({"version": "1.0"})), Some(1));
        assert_eq!(detect_version(&serde_json::json!({"configs": {}})), Some(1));
        assert_eq!(detect_version(&serde_json::json!({})), None);
    }

    #[test]
    fn test_is_contained() {
        assert!(is_contained(Path::new("linux/bashrc")));
        assert!(is_contained(Path::new("./common/templates/gitconfig")));
        assert!(!is_contained(Path::new("../outside")));
        assert!(!is_contained(Path::new("linux/../../outside")));
        assert!(!is_contained(Path::new("/etc/passwd")));
        assert!(!is_contained(Path::new(".git/hooks/post-merge")));
        assert!(!is_contained(Path::new(".superdots/index.json")));
        assert!(!is_contained(Path::new(".")));
    }

    fn stored(name: &str, description: &str) -> StoredEntry {
        let mut source_paths = PlatformMap::new();
        source_paths.insert(Platform::Linux, PathBuf::from(format!("/home/u/.{name}")));
        let at = parse_legacy_time(Some("2024-01-01T00:00:00")).unwrap();
        StoredEntry {
            name: name.to_string(),
            description: Some(description.to_string()),
            source_paths,
            target_repo_path: PathBuf::from("linux").join(name),
            deploy_mode: DeployMode::Symlink,
            is_template: false,
            kind: EntryKind::File,
            tags: Vec::new(),
            executable: false,
            template_vars: BTreeMap::new(),
            created_at: at,
            updated_at: at,
        }
    }

    fn doc(entries: &[StoredEntry]) -> Vec<u8> {
        encode(entries, Path::new("index.json")).unwrap()
    }

    fn merge(
        base: &[StoredEntry],
        ours: &[StoredEntry],
        theirs: &[StoredEntry],
        strategy: Option<ConflictStrategy>,
    ) -> MergedIndex {
        let (base, ours, theirs) = (doc(base), doc(ours), doc(theirs));
        merge_definitions(Some(&base), Some(&ours), Some(&theirs), strategy, Path::new("index.json"))
            .unwrap()
    }

    fn names(merged: &MergedIndex) -> Vec<&str> {
        merged.entries.iter().map(|e| e.name.as_str()).collect()
    }

    #[test]
    fn test_merge_takes_one_sided_changes() {
        let base = [stored("bashrc", "b"), stored("vimrc", "v")];
        let ours = [stored("bashrc", "mine"), stored("vimrc", "v"), stored("tmux", "t")];
        let theirs = [stored("bashrc", "b"), stored("zshrc", "z")];

        let merged = merge(&base, &ours, &theirs, None);
        assert_eq!(names(&merged), vec!["bashrc", "tmux", "zshrc"]);
        assert_eq!(merged.entries[0].description.as_deref(), Some("mine"));
        assert!(merged.conflicts.is_empty() && merged.settled.is_empty());
    }

    #[test]
    fn test_merge_applies_strategy_only_to_true_conflicts() {
        let base = [stored("bashrc", "b")];
        let ours = [stored("bashrc", "mine"), stored("tmux", "t")];
        let theirs = [stored("bashrc", "theirs"), stored("zshrc", "z")];

        let merged = merge(&base, &ours, &theirs, None);
        assert_eq!(merged.conflicts, vec!["bashrc".to_string()]);
        assert_eq!(names(&merged), vec!["bashrc", "tmux", "zshrc"]);

        let merged = merge(&base, &ours, &theirs, Some(ConflictStrategy::KeepRemote));
        assert_eq!(merged.settled, vec!["bashrc".to_string()]);
        assert_eq!(merged.entries[0].description.as_deref(), Some("theirs"));
        assert_eq!(names(&merged), vec!["bashrc", "tmux", "zshrc"]);
    }

    #[test]
    fn test_merge_both_added_same_entry() {
        let merged = merge(&[], &[stored("bashrc", "a")], &[stored("bashrc", "a")], None);
        assert_eq!(names(&merged), vec!["bashrc"]);
        assert!(merged.conflicts.is_empty());

        let merged = merge(&[], &[stored("bashrc", "a")], &[stored("bashrc", "b")], None);
        assert_eq!(merged.conflicts, vec!["bashrc".to_string()]);
    }

    #[test]
    fn test_definitions_refuse_escaping_entries() {
        let mut escaping = stored("bashrc", "b");
        escaping.target_repo_path = PathBuf::from("../../.ssh");
        let bytes = serde_json::to_vec(&serde_json::json!({
            "version": 2,
            "entries": [escaping],
        }))
        .unwrap();
        let err = definitions(&bytes, Path::new("index.json")).unwrap_err();
        assert!(matches!(err, Error::Index { .. }));

        let mut relative = stored("vimrc", "v");
        relative.source_paths.insert(Platform::Linux, PathBuf::from(".vimrc"));
        let bytes = doc(&[relative]);
        assert!(definitions(&bytes, Path::new("index.json")).is_err());
    }

    #[test]
    fn test_legacy_timestamps() {
        assert!(parse_legacy_time(Some("2023-05-01T10:20:30.123456")).is_some());
        assert!(parse_legacy_time(Some("2023-05-01T10:20:30+02:00")).is_some());
        assert!(parse_legacy_time(Some("yesterday")).is_none());
    }
}
