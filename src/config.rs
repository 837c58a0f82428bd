use anyhow::{Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

pub const CURRENT_VERSION: u32 = 2;

/// One named provider configuration: a user-chosen label, a provider type
/// tag, and the opaque settings bag that type needs (credentials, URLs,
/// serialized tokens).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderEntry {
    pub label: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
}

/// The persisted configuration file (v2 schema). Bound to the path it was
/// loaded from; `write()` rewrites that file whole.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub version: u32,
    #[serde(default)]
    pub active: String,
    #[serde(default)]
    pub providers: Vec<ProviderEntry>,
    #[serde(rename = "copyToClipboard", default, skip_serializing_if = "Option::is_none")]
    pub copy_to_clipboard: Option<bool>,
    #[serde(rename = "showQRCode", default, skip_serializing_if = "Option::is_none")]
    pub show_qr_code: Option<bool>,
    #[serde(rename = "urlShortenerProvider", default, skip_serializing_if = "Option::is_none")]
    pub url_shortener_provider: Option<String>,
    #[serde(rename = "urlShortenerSettings", default, skip_serializing_if = "Option::is_none")]
    pub url_shortener_settings: Option<BTreeMap<String, String>>,
    #[serde(skip)]
    pub path: PathBuf,
}

/// The single-provider schema used before the config was versioned. Any
/// document without `version >= 2` is parsed as this and migrated.
#[derive(Debug, Default, Deserialize)]
struct LegacyConfig {
    #[serde(default)]
    provider: String,
    #[serde(default)]
    providersettings: Option<BTreeMap<String, String>>,
}

impl Config {
    /// Default location: `<home>/.config/sharecmd/config.json`.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("sharecmd")
            .join("config.json")
    }

    pub fn empty(path: &Path) -> Self {
        Config {
            version: CURRENT_VERSION,
            path: path.to_path_buf(),
            ..Default::default()
        }
    }

    /// Loads the config at `path`. A missing file yields a fresh empty
    /// config, not an error; a pre-v2 document is migrated in memory (the
    /// file on disk is untouched until `write()`).
    pub fn load(path: &Path) -> Result<Self> {
        let content = match fs::read(path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("no config at {:?}, starting empty", path);
                return Ok(Self::empty(path));
            }
            Err(err) => {
                return Err(err).with_context(|| format!("can't read config {}", path.display()));
            }
        };

        let value: serde_json::Value = serde_json::from_slice(&content)
            .with_context(|| format!("malformed config {}", path.display()))?;
        let version = value.get("version").and_then(|v| v.as_u64()).unwrap_or(0);

        let mut config = if version >= 2 {
            serde_json::from_value(value)
                .with_context(|| format!("malformed config {}", path.display()))?
        } else {
            debug!("migrating v1 config {:?}", path);
            Self::migrate_v1(&content)?
        };
        config.path = path.to_path_buf();
        Ok(config)
    }

    /// v1 -> v2: a non-empty legacy `provider` becomes the single entry
    /// (label and type both set to the provider name) and the active
    /// selection; an empty one means setup never completed and migrates to
    /// an empty config.
    fn migrate_v1(content: &[u8]) -> Result<Self> {
        let legacy: LegacyConfig =
            serde_json::from_slice(content).context("malformed legacy (v1) config")?;

        let mut config = Config {
            version: CURRENT_VERSION,
            ..Default::default()
        };
        if !legacy.provider.is_empty() {
            config.providers.push(ProviderEntry {
                label: legacy.provider.clone(),
                kind: legacy.provider.clone(),
                settings: legacy.providersettings.unwrap_or_default(),
            });
            config.active = legacy.provider;
        }
        Ok(config)
    }

    /// Writes the whole config as indented JSON, creating the parent
    /// directory (0700 on unix) if needed.
    pub fn write(&self) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("can't create config directory {}", dir.display()))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
            }
        }
        let contents = serde_json::to_string_pretty(self)?;
        fs::write(&self.path, contents)
            .with_context(|| format!("can't write config {}", self.path.display()))?;
        debug!("saved config to {:?}", self.path);
        Ok(())
    }

    /// Appends a provider entry. The first provider ever added becomes the
    /// active one.
    pub fn add_provider(&mut self, entry: ProviderEntry) {
        if self.providers.is_empty() {
            self.active = entry.label.clone();
        }
        self.providers.push(entry);
    }

    /// Removes the entry with `label` if present, clearing the active
    /// selection only when it pointed at the removed entry.
    pub fn remove_provider(&mut self, label: &str) {
        self.providers.retain(|p| p.label != label);
        if self.active == label {
            self.active.clear();
        }
    }

    /// Marks `label` as the active provider. Fails without touching the
    /// current selection if no such entry exists.
    pub fn set_active(&mut self, label: &str) -> Result<(), ConfigError> {
        if self.find_by_label(label).is_none() {
            return Err(ConfigError::ProviderNotFound(label.to_string()));
        }
        self.active = label.to_string();
        Ok(())
    }

    pub fn find_by_label(&self, label: &str) -> Option<&ProviderEntry> {
        self.providers.iter().find(|p| p.label == label)
    }

    pub fn find_by_label_mut(&mut self, label: &str) -> Option<&mut ProviderEntry> {
        self.providers.iter_mut().find(|p| p.label == label)
    }

    /// The entry the active label points at. A stale label (entry since
    /// removed by hand) is treated as "no active provider".
    pub fn active_provider(&self) -> Option<&ProviderEntry> {
        if self.active.is_empty() {
            return None;
        }
        self.find_by_label(&self.active)
    }

    pub fn provider_labels(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.label.clone()).collect()
    }

    pub fn copy_to_clipboard_enabled(&self) -> bool {
        self.copy_to_clipboard.unwrap_or(true)
    }

    pub fn show_qr_code_enabled(&self) -> bool {
        self.show_qr_code.unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(label: &str, kind: &str, settings: &[(&str, &str)]) -> ProviderEntry {
        ProviderEntry {
            label: label.to_string(),
            kind: kind.to_string(),
            settings: settings
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_migrate_v1() -> Result<()> {
        let v1 = r#"{
            "provider": "nextcloud",
            "providersettings": {
                "url": "https://example.com",
                "username": "user",
                "password": "pass",
                "linkShareWithPassword": "true",
                "randomPasswordChars": "32"
            }
        }"#;

        let cfg = Config::migrate_v1(v1.as_bytes())?;
        assert_eq!(cfg.version, 2);
        assert_eq!(cfg.active, "nextcloud");
        assert_eq!(cfg.providers.len(), 1);

        let p = &cfg.providers[0];
        assert_eq!(p.label, "nextcloud");
        assert_eq!(p.kind, "nextcloud");
        assert_eq!(p.settings["url"], "https://example.com");
        Ok(())
    }

    #[test]
    fn test_migrate_v1_empty() -> Result<()> {
        let cfg = Config::migrate_v1(b"{}")?;
        assert_eq!(cfg.version, 2);
        assert_eq!(cfg.active, "");
        assert!(cfg.providers.is_empty());
        Ok(())
    }

    #[test]
    fn test_migrate_v1_null_settings() -> Result<()> {
        let cfg = Config::migrate_v1(br#"{"provider": "dropbox", "providersettings": null}"#)?;
        assert_eq!(cfg.providers.len(), 1);
        assert!(cfg.providers[0].settings.is_empty());
        assert_eq!(cfg.active, "dropbox");
        Ok(())
    }

    #[test]
    fn test_migrate_v1_is_idempotent_on_replay() -> Result<()> {
        let v1 = br#"{"provider": "dropbox", "providersettings": {"token": "xyz"}}"#;
        let first = Config::migrate_v1(v1)?;
        let second = Config::migrate_v1(v1)?;
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn test_load_not_exist_is_empty_config() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("config.json");

        let cfg = Config::load(&path)?;
        assert_eq!(cfg.version, 2);
        assert!(cfg.providers.is_empty());
        assert_eq!(cfg.path, path);
        Ok(())
    }

    #[test]
    fn test_load_malformed_is_an_error() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("config.json");
        fs::write(&path, "{not json")?;

        assert!(Config::load(&path).is_err());
        Ok(())
    }

    #[test]
    fn test_load_auto_migrates_v1_file() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"provider": "dropbox", "providersettings": {"token": "xyz"}}"#,
        )?;

        let cfg = Config::load(&path)?;
        assert_eq!(cfg.version, 2);
        assert_eq!(cfg.active, "dropbox");
        assert_eq!(cfg.providers[0].settings["token"], "xyz");

        // Migration is in-memory only until an explicit write.
        let on_disk = fs::read_to_string(&path)?;
        assert!(!on_disk.contains("\"version\""));
        Ok(())
    }

    #[test]
    fn test_write_then_load_round_trips() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("nested").join("config.json");

        let mut cfg = Config::empty(&path);
        cfg.add_provider(entry("my-dropbox", "dropbox", &[("token", "abc")]));
        cfg.add_provider(entry("home", "nextcloud", &[("url", "https://nc.example")]));
        cfg.copy_to_clipboard = Some(false);
        cfg.write()?;

        let loaded = Config::load(&path)?;
        assert_eq!(loaded, cfg);
        assert_eq!(loaded.active, "my-dropbox");
        assert!(!loaded.copy_to_clipboard_enabled());
        assert!(loaded.show_qr_code_enabled());
        Ok(())
    }

    #[test]
    fn test_first_provider_becomes_active() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("config.json");
        fs::write(&path, "{}")?;

        let mut cfg = Config::load(&path)?;
        cfg.add_provider(entry("work", "dropbox", &[("token", "abc")]));
        assert_eq!(cfg.active, "work");
        cfg.write()?;

        let reloaded = Config::load(&path)?;
        let active = reloaded.active_provider().expect("active provider");
        assert_eq!(active.label, "work");
        assert_eq!(active.settings["token"], "abc");
        Ok(())
    }

    #[test]
    fn test_remove_provider_clears_active_only_for_active_label() {
        let mut cfg = Config::empty(Path::new("/tmp/test.json"));
        cfg.add_provider(entry("work", "dropbox", &[]));
        cfg.add_provider(entry("home", "nextcloud", &[]));
        assert_eq!(cfg.active, "work");

        cfg.remove_provider("home");
        assert_eq!(cfg.active, "work");
        assert_eq!(cfg.providers.len(), 1);

        cfg.remove_provider("work");
        assert_eq!(cfg.active, "");
        assert!(cfg.providers.is_empty());
    }

    #[test]
    fn test_set_active_unknown_label_fails_unchanged() {
        let mut cfg = Config::empty(Path::new("/tmp/test.json"));
        cfg.add_provider(entry("work", "dropbox", &[]));

        assert!(cfg.set_active("nonexistent").is_err());
        assert_eq!(cfg.active, "work");

        assert!(cfg.set_active("work").is_ok());
        assert_eq!(cfg.active, "work");
    }

    #[test]
    fn test_stale_active_label_is_no_active_provider() {
        let mut cfg = Config::empty(Path::new("/tmp/test.json"));
        cfg.add_provider(entry("work", "dropbox", &[]));
        cfg.active = "gone".to_string();
        assert!(cfg.active_provider().is_none());
    }

    #[test]
    fn test_provider_labels() {
        let mut cfg = Config::empty(Path::new("/tmp/test.json"));
        cfg.add_provider(entry("work-nc", "nextcloud", &[]));
        cfg.add_provider(entry("personal-db", "dropbox", &[]));
        assert_eq!(cfg.provider_labels(), vec!["work-nc", "personal-db"]);
    }

    #[test]
    fn test_explicit_label_does_not_alter_persisted_active() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("config.json");

        let mut cfg = Config::empty(&path);
        cfg.add_provider(entry("work", "dropbox", &[]));
        cfg.add_provider(entry("home", "nextcloud", &[]));
        cfg.write()?;

        // Selecting "home" for a single run is a read-only lookup.
        let run_cfg = Config::load(&path)?;
        let chosen = run_cfg.find_by_label("home").expect("home entry");
        assert_eq!(chosen.kind, "nextcloud");

        let reloaded = Config::load(&path)?;
        assert_eq!(reloaded.active, "work");
        Ok(())
    }
}
