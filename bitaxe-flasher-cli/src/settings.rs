//! Settings persisted between runs.

use std::path::{Path, PathBuf};

use anyhow::Context;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::cli::{SettingKey, Sources};

pub const PACKAGE_QUALIFIER: (&str, &str, &str) = ("org", "bitaxe", "bitaxe-flasher");

const FILE_NAME: &str = "settings.json";

pub fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from(PACKAGE_QUALIFIER.0, PACKAGE_QUALIFIER.1, PACKAGE_QUALIFIER.2)
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub catalog: Option<String>,
    pub firmware_base: Option<String>,
    pub cache_dir: Option<PathBuf>,
    pub transcript_dir: Option<PathBuf>,
}

impl Settings {
    pub fn path() -> Option<PathBuf> {
        project_dirs().map(|x| x.config_dir().join(FILE_NAME))
    }

    /// Missing file means defaults.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let data = std::fs::read(path)
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;
        serde_json::from_slice(&data)
            .with_context(|| format!("Invalid settings file {}", path.display()))
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let data = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, data)
            .with_context(|| format!("Failed to write settings to {}", path.display()))
    }

    pub fn set(&mut self, key: SettingKey, value: Option<String>) {
        let value = value.filter(|x| !x.is_empty());

        match key {
            SettingKey::Catalog => self.catalog = value,
            SettingKey::FirmwareBase => self.firmware_base = value,
            SettingKey::CacheDir => self.cache_dir = value.map(PathBuf::from),
            SettingKey::TranscriptDir => self.transcript_dir = value.map(PathBuf::from),
        }
    }

    /// Command line flags take precedence over stored values.
    pub fn merge(&self, sources: Sources) -> Sources {
        Sources {
            catalog: sources.catalog.or_else(|| self.catalog.clone()),
            firmware_base: sources.firmware_base.or_else(|| self.firmware_base.clone()),
            cache_dir: sources.cache_dir.or_else(|| self.cache_dir.clone()),
        }
    }

    /// Bare file names land in the transcript directory, if one is set.
    pub fn transcript_path(&self, file: PathBuf) -> PathBuf {
        match &self.transcript_dir {
            Some(dir) if file.parent().is_none_or(|p| p.as_os_str().is_empty()) => dir.join(file),
            _ => file,
        }
    }
}

impl std::fmt::Display for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn show(x: Option<String>) -> String {
            x.unwrap_or_else(|| "(default)".to_string())
        }

        writeln!(f, "catalog:        {}", show(self.catalog.clone()))?;
        writeln!(f, "firmware-base:  {}", show(self.firmware_base.clone()))?;
        writeln!(
            f,
            "cache-dir:      {}",
            show(self.cache_dir.as_ref().map(|x| x.display().to_string()))
        )?;
        write!(
            f,
            "transcript-dir: {}",
            show(self.transcript_dir.as_ref().map(|x| x.display().to_string()))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let s = Settings::load_from(&dir.path().join(FILE_NAME)).unwrap();
        assert_eq!(s, Settings::default());
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("nested").join(FILE_NAME);

        let mut s = Settings::default();
        s.set(SettingKey::FirmwareBase, Some("https://example.com/fw/".into()));
        s.set(SettingKey::TranscriptDir, Some("/tmp/logs".into()));
        s.save_to(&p).unwrap();

        assert_eq!(Settings::load_from(&p).unwrap(), s);

        s.set(SettingKey::FirmwareBase, Some(String::new()));
        assert!(s.firmware_base.is_none());
    }

    #[test]
    fn partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join(FILE_NAME);
        std::fs::write(&p, br#"{ "catalog": "catalog.json" }"#).unwrap();

        let s = Settings::load_from(&p).unwrap();
        assert_eq!(s.catalog.as_deref(), Some("catalog.json"));
        assert!(s.cache_dir.is_none());
    }

    #[test]
    fn flags_win() {
        let s = Settings {
            catalog: Some("stored.json".into()),
            firmware_base: Some("/srv/firmware".into()),
            ..Default::default()
        };

        let merged = s.merge(Sources {
            catalog: Some("flag.json".into()),
            ..Default::default()
        });

        assert_eq!(merged.catalog.as_deref(), Some("flag.json"));
        assert_eq!(merged.firmware_base.as_deref(), Some("/srv/firmware"));
        assert!(merged.cache_dir.is_none());
    }

    #[test]
    fn transcript_dir() {
        let s = Settings {
            transcript_dir: Some("/var/log/bitaxe".into()),
            ..Default::default()
        };

        assert_eq!(
            s.transcript_path("log.txt".into()),
            PathBuf::from("/var/log/bitaxe/log.txt")
        );
        assert_eq!(
            s.transcript_path("./log.txt".into()),
            PathBuf::from("./log.txt")
        );
    }
}
