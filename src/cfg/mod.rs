use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, IoResultExt, Result};
use crate::platform::Platform;
use crate::registry::DeployMode;
use crate::sync::ConflictStrategy;

/// Name of the metadata directory inside the repository.
pub const META_DIR: &str = ".superdots";

/// Every path of the managed repository, derived from its root.
#[derive(Debug, Clone)]
pub struct Layout {
    pub root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Layout { root: root.into() }
    }

    pub fn meta_dir(&self) -> PathBuf {
        self.root.join(META_DIR)
    }

    pub fn index_path(&self) -> PathBuf {
        self.meta_dir().join("index.json")
    }

    /// Git-ignored per-machine state: fingerprints, deploy records, status.
    pub fn local_state_path(&self) -> PathBuf {
        self.meta_dir().join("local.json")
    }

    pub fn settings_path(&self) -> PathBuf {
        self.meta_dir().join("config.toml")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.root.join("backups")
    }

    pub fn templates_dir(&self) -> PathBuf {
        self.root.join("templates")
    }

    pub fn platform_dir(&self, platform: Platform) -> PathBuf {
        self.root.join(platform.as_str())
    }

    pub fn common_dir(&self) -> PathBuf {
        self.root.join("common")
    }

    /// Absolute location of a repository-relative path.
    pub fn resolve(&self, rel: &Path) -> PathBuf {
        self.root.join(rel)
    }

    fn directories(&self) -> Vec<PathBuf> {
        let mut dirs = vec![
            self.meta_dir(),
            self.backups_dir(),
            self.templates_dir(),
            self.common_dir(),
        ];
        dirs.extend(Platform::ALL.iter().map(|p| self.platform_dir(*p)));
        dirs
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub deploy: DeploySettings,

    #[serde(default)]
    pub template: TemplateSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SyncSettings {
    #[serde(default = "default_remote")]
    pub remote: String,

    #[serde(default = "default_branch")]
    pub branch: String,

    /// Upper bound for a single fetch, push or clone.
    #[serde(default = "default_network_timeout_secs")]
    pub network_timeout_secs: u64,

    /// Extra attempts after a failed network operation. Zero disables retries.
    #[serde(default = "default_max_network_retries")]
    pub max_network_retries: u32,

    /// Strategy applied by `--auto-resolve` when none is given explicitly.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_strategy: Option<ConflictStrategy>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub author_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub author_email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DeploySettings {
    #[serde(default = "default_mode")]
    pub default_mode: DeployMode,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TemplateSettings {
    /// Extra variables available to every template.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            remote: default_remote(),
            branch: default_branch(),
            network_timeout_secs: default_network_timeout_secs(),
            max_network_retries: default_max_network_retries(),
            default_strategy: None,
            author_name: None,
            author_email: None,
        }
    }
}

impl Default for DeploySettings {
    fn default() -> Self {
        DeploySettings {
            default_mode: default_mode(),
        }
    }
}

fn default_remote() -> String {
    "origin".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_network_timeout_secs() -> u64 {
    120
}

fn default_max_network_retries() -> u32 {
    1
}

fn default_mode() -> DeployMode {
    DeployMode::Symlink
}

const GITIGNORE: &str = r#"# Machine-local backups and deploy state never leave this machine
backups/
.superdots/local.json

# Temporary files
*.tmp
*.swp
*.swo
*~

# OS files
.DS_Store
Thumbs.db
"#;

/// The index is merged entry by entry during sync, never line by line.
const GITATTRIBUTES: &str = r#"# Merged by superdots
.superdots/index.json -merge
"#;

/// Create the repository layout and a default settings file.
///
/// An existing settings file is kept unless `force` is set. Existing
/// `.gitignore` and `.gitattributes` files get the lines they lack.
pub fn init(layout: &Layout, force: bool) -> Result<()> {
    for dir in layout.directories() {
        fs::create_dir_all(&dir).at(&dir)?;
    }

    let settings_path = layout.settings_path();
    if force || !settings_path.exists() {
        save(layout, &Settings::default())?;
    }

    ensure_lines(&layout.root.join(".gitignore"), GITIGNORE)?;
    ensure_lines(&layout.root.join(".gitattributes"), GITATTRIBUTES)?;
    Ok(())
}

/// Write `template` to `path`, or append the rules an existing file lacks.
fn ensure_lines(path: &Path, template: &str) -> Result<()> {
    let existing = match fs::read_to_string(path) {
        Ok(existing) => existing,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return fs::write(path, template).at(path);
        }
        Err(e) => return Err(Error::io(path, e)),
    };

    let missing: Vec<&str> = template
        .lines()
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter(|line| !existing.lines().any(|have| have.trim() == *line))
        .collect();
    if missing.is_empty() {
        return Ok(());
    }

    let mut updated = existing;
    if !updated.is_empty() && !updated.ends_with('\n') {
        updated.push('\n');
    }
    for line in missing {
        updated.push_str(line);
        updated.push('\n');
    }
    fs::write(path, updated).at(path)
}

/// Load settings; a missing file yields the defaults.
pub fn load(layout: &Layout) -> Result<Settings> {
    let path = layout.settings_path();
    if !path.exists() {
        return Ok(Settings::default());
    }

    let contents = fs::read_to_string(&path).at(&path)?;
    toml::from_str(&contents).map_err(|e| Error::Settings {
        path,
        message: e.to_string(),
    })
}

pub fn save(layout: &Layout, settings: &Settings) -> Result<()> {
    let path = layout.settings_path();
    let toml_string = toml::to_string_pretty(settings).map_err(|e| Error::Settings {
        path: path.clone(),
        message: e.to_string(),
    })?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).at(parent)?;
    }
    fs::write(&path, toml_string).at(&path)?;
    Ok(())
}

/// Expand `~` and environment variables in a user-supplied path.
pub fn expand_path(raw: &Path) -> PathBuf {
    let raw = raw.to_string_lossy();
    match shellexpand::full(&raw) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => PathBuf::from(shellexpand::tilde(&raw).as_ref()),
    }
}

/// Default repository location: `~/.superdots`.
pub fn default_repo_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".superdots"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_init_creates_layout() {
        let temp = TempDir::new().unwrap();
        let layout = Layout::new(temp.path().join("repo"));
        init(&layout, false).unwrap();

        assert!(layout.settings_path().exists());
        assert!(layout.backups_dir().is_dir());
        assert!(layout.templates_dir().is_dir());
        assert!(layout.platform_dir(Platform::Windows).is_dir());
        let gitignore = fs::read_to_string(layout.root.join(".gitignore")).unwrap();
        assert!(gitignore.contains("backups/"));
        assert!(gitignore.contains(".superdots/local.json"));
        let attributes = fs::read_to_string(layout.root.join(".gitattributes")).unwrap();
        assert!(attributes.contains(".superdots/index.json -merge"));
    }

    #[test]
    fn test_init_completes_existing_ignore_file() {
        let temp = TempDir::new().unwrap();
        let layout = Layout::new(temp.path().join("repo"));
        fs::create_dir_all(&layout.root).unwrap();
        fs::write(layout.root.join(".gitignore"), "backups/\n*.bak").unwrap();

        init(&layout, false).unwrap();
        init(&layout, false).unwrap();

        let gitignore = fs::read_to_string(layout.root.join(".gitignore")).unwrap();
        assert!(gitignore.starts_with("backups/\n*.bak\n"));
        assert_eq!(gitignore.matches("backups/").count(), 1);
        assert_eq!(gitignore.matches(".superdots/local.json").count(), 1);
    }

    #[test]
    fn test_load_missing_returns_defaults() {
        let temp = TempDir::new().unwrap();
        let settings = load(&Layout::new(temp.path())).unwrap();
        assert_eq!(settings.sync.remote, "origin");
        assert_eq!(settings.sync.branch, "main");
        assert_eq!(settings.deploy.default_mode, DeployMode::Symlink);
    }

    #[test]
    fn test_load_parses_custom_sections() {
        let temp = TempDir::new().unwrap();
        let layout = Layout::new(temp.path());
        fs::create_dir_all(layout.meta_dir()).unwrap();
        fs::write(
            layout.settings_path(),
            r#"
[sync]
remote = "upstream"
max_network_retries = 0
default_strategy = "keep-remote"

[deploy]
default_mode = "copy"

[template.variables]
EMAIL = "me@example.com"
"#,
        )
        .unwrap();

        let settings = load(&layout).unwrap();
        assert_eq!(settings.sync.remote, "upstream");
        assert_eq!(settings.sync.max_network_retries, 0);
        assert_eq!(settings.sync.default_strategy, Some(ConflictStrategy::KeepRemote));
        assert_eq!(settings.deploy.default_mode, DeployMode::Copy);
        assert_eq!(settings.template.variables["EMAIL"], "me@example.com");
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let temp = TempDir::new().unwrap();
        let layout = Layout::new(temp.path());
        fs::create_dir_all(layout.meta_dir()).unwrap();
        fs::write(layout.settings_path(), "[sync]\nremtoe = \"x\"\n").unwrap();

        assert!(matches!(load(&layout), Err(Error::Settings { .. })));
    }

    #[test]
    fn test_settings_roundtrip() {
        let temp = TempDir::new().unwrap();
        let layout = Layout::new(temp.path());
        let mut settings = Settings::default();
        settings.sync.default_strategy = Some(ConflictStrategy::KeepLocal);
        settings
            .template
            .variables
            .insert("EDITOR".into(), "nvim".into());
        save(&layout, &settings).unwrap();

        assert_eq!(load(&layout).unwrap(), settings);
    }
}
