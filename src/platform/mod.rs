//! Platform detection and the per-platform lookup table.

use serde::de::Deserializer;
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Operating systems a configuration can carry a source path for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    #[serde(alias = "darwin")]
    Macos,
    Windows,
}

impl Platform {
    pub const ALL: [Platform; 3] = [Platform::Linux, Platform::Macos, Platform::Windows];

    /// The platform this process is running on. Other Unix-likes are treated
    /// as Linux.
    pub fn current() -> Self {
        if cfg!(target_os = "macos") {
            Platform::Macos
        } else if cfg!(target_os = "windows") {
            Platform::Windows
        } else {
            Platform::Linux
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Linux => "linux",
            Platform::Macos => "macos",
            Platform::Windows => "windows",
        }
    }

    fn index(self) -> usize {
        match self {
            Platform::Linux => 0,
            Platform::Macos => 1,
            Platform::Windows => 2,
        }
    }

    /// Directory for user configuration on this platform, as exposed to
    /// templates through `CONFIG_DIR`. macOS follows the XDG layout most
    /// command-line tools use there.
    pub fn config_dir(self) -> Option<PathBuf> {
        match self {
            Platform::Linux | Platform::Macos => dirs::home_dir().map(|h| h.join(".config")),
            Platform::Windows => dirs::config_dir(),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "linux" => Ok(Platform::Linux),
            "macos" | "darwin" | "osx" => Ok(Platform::Macos),
            "windows" | "win" => Ok(Platform::Windows),
            other => Err(format!("unknown platform '{other}' (expected linux, macos or windows)")),
        }
    }
}

/// Human-readable description of the running system, e.g. `Ubuntu 22.04 (64-bit)`.
pub fn describe_system() -> String {
    let info = os_info::get();
    format!("{} {} ({})", info.os_type(), info.version(), info.bitness())
}

/// Whether the current user can create symlinks. Always true on Unix; on
/// Windows it depends on privileges or developer mode, so a test link is
/// created in the temp directory.
pub fn can_symlink() -> bool {
    #[cfg(unix)]
    {
        true
    }
    #[cfg(windows)]
    {
        let Ok(dir) = tempfile::tempdir() else {
            return false;
        };
        let source = dir.path().join("link-source");
        if std::fs::write(&source, b"").is_err() {
            return false;
        }
        std::os::windows::fs::symlink_file(&source, dir.path().join("link-target")).is_ok()
    }
}

/// Fixed table holding at most one value per [`Platform`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformMap<T> {
    slots: [Option<T>; 3],
}

impl<T> Default for PlatformMap<T> {
    fn default() -> Self {
        PlatformMap {
            slots: [None, None, None],
        }
    }
}

impl<T> PlatformMap<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(platform: Platform, value: T) -> Self {
        let mut map = Self::new();
        map.insert(platform, value);
        map
    }

    pub fn get(&self, platform: Platform) -> Option<&T> {
        self.slots[platform.index()].as_ref()
    }

    pub fn get_mut(&mut self, platform: Platform) -> Option<&mut T> {
        self.slots[platform.index()].as_mut()
    }

    /// Returns the previous value, if any.
    pub fn insert(&mut self, platform: Platform, value: T) -> Option<T> {
        self.slots[platform.index()].replace(value)
    }

    pub fn remove(&mut self, platform: Platform) -> Option<T> {
        self.slots[platform.index()].take()
    }

    pub fn contains(&self, platform: Platform) -> bool {
        self.get(platform).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Platform, &T)> + Clone + '_ {
        Platform::ALL
            .into_iter()
            .filter_map(move |p| self.get(p).map(|v| (p, v)))
    }

    pub fn platforms(&self) -> impl Iterator<Item = Platform> + '_ {
        self.iter().map(|(p, _)| p)
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn map<U>(&self, mut f: impl FnMut(Platform, &T) -> U) -> PlatformMap<U> {
        let mut out = PlatformMap::new();
        for (platform, value) in self.iter() {
            out.insert(platform, f(platform, value));
        }
        out
    }
}

impl<T> FromIterator<(Platform, T)> for PlatformMap<T> {
    fn from_iter<I: IntoIterator<Item = (Platform, T)>>(iter: I) -> Self {
        let mut map = PlatformMap::new();
        for (platform, value) in iter {
            map.insert(platform, value);
        }
        map
    }
}

impl<T: Serialize> Serialize for PlatformMap<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.len()))?;
        for (platform, value) in self.iter() {
            map.serialize_entry(platform.as_str(), value)?;
        }
        map.end()
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for PlatformMap<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = BTreeMap::<Platform, T>::deserialize(deserializer)?;
        Ok(raw.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_aliases() {
        assert_eq!("darwin".parse::<Platform>().unwrap(), Platform::Macos);
        assert_eq!("MacOS".parse::<Platform>().unwrap(), Platform::Macos);
        assert_eq!("linux".parse::<Platform>().unwrap(), Platform::Linux);
        assert!("beos".parse::<Platform>().is_err());
    }

    #[test]
    fn test_current_is_stable() {
        assert_eq!(Platform::current(), Platform::current());
        assert!(Platform::ALL.contains(&Platform::current()));
    }

    #[test]
    fn test_map_insert_remove() {
        let mut map = PlatformMap::new();
        assert!(map.is_empty());
        assert_eq!(map.insert(Platform::Windows, 1), None);
        assert_eq!(map.insert(Platform::Linux, 2), None);
        assert_eq!(map.insert(Platform::Linux, 3), Some(2));
        assert_eq!(map.len(), 2);

        let order: Vec<_> = map.platforms().collect();
        assert_eq!(order, vec![Platform::Linux, Platform::Windows]);

        assert_eq!(map.remove(Platform::Windows), Some(1));
        assert!(!map.contains(Platform::Windows));
    }

    #[test]
    fn test_map_serde_uses_platform_keys() {
        let map = PlatformMap::single(Platform::Macos, "/Users/u/.zshrc".to_string());
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, r#"{"macos":"/Users/u/.zshrc"}"#);

        let legacy: PlatformMap<String> =
            serde_json::from_str(r#"{"darwin":"/Users/u/.zshrc","linux":"/home/u/.zshrc"}"#).unwrap();
        assert_eq!(legacy.len(), 2);
        assert_eq!(legacy.get(Platform::Macos).unwrap(), "/Users/u/.zshrc");
    }
}
