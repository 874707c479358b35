//! Firmware catalog: device model -> board version -> firmware version -> image path.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Error, Result};

const BUILTIN: &[u8] = include_bytes!("../catalog.json");

#[derive(Deserialize, Serialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct Catalog {
    pub devices: Vec<Device>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Device {
    /// Lookup key, e.g. `ultra`
    pub model: String,
    /// Human readable name, e.g. `Ultra`
    pub name: String,
    #[serde(default)]
    pub boards: Vec<Board>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Board {
    pub version: String,
    #[serde(default)]
    pub firmwares: Vec<Firmware>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Firmware {
    pub version: String,
    /// Absolute URL, or a path relative to the catalog base.
    pub path: String,
    /// Flash offset the image is written to. Factory images start at 0.
    #[serde(default)]
    pub address: u32,
    #[serde(default, with = "opt_sha256", skip_serializing_if = "Option::is_none")]
    pub sha256: Option<[u8; 32]>,
}

/// Where relative firmware paths are resolved from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogBase {
    Dir(PathBuf),
    Url(Url),
}

/// Resolved location of a firmware image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirmwareLocation {
    Local(PathBuf),
    Remote(Url),
}

impl Catalog {
    /// Parse and validate a catalog.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let catalog: Self = serde_json::from_slice(data)?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Read a catalog file from disk.
    pub fn from_path(path: &Path) -> Result<Self> {
        tracing::debug!("Loading catalog from {}", path.display());
        let data = std::fs::read(path)?;
        Self::from_json(&data)
    }

    /// The catalog shipped with this crate.
    pub fn builtin() -> Self {
        Self::from_json(BUILTIN).expect("built-in catalog is valid")
    }

    /// Check uniqueness of every key and that each firmware points somewhere.
    pub fn validate(&self) -> Result<()> {
        let mut models = HashSet::new();

        for d in &self.devices {
            if !models.insert(d.model.as_str()) {
                return Err(Error::DuplicateDevice(d.model.clone()));
            }

            let mut boards = HashSet::new();
            for b in &d.boards {
                if !boards.insert(b.version.as_str()) {
                    return Err(Error::DuplicateBoard {
                        device: d.model.clone(),
                        board: b.version.clone(),
                    });
                }

                let mut firmwares = HashSet::new();
                for f in &b.firmwares {
                    if !firmwares.insert(f.version.as_str()) {
                        return Err(Error::DuplicateFirmware {
                            board: b.version.clone(),
                            firmware: f.version.clone(),
                        });
                    }
                    if f.path.trim().is_empty() {
                        return Err(Error::EmptyPath(f.version.clone()));
                    }
                }
            }
        }

        Ok(())
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn device(&self, model: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.model == model)
    }

    /// Board versions valid for a device. Empty for unknown models.
    pub fn boards(&self, model: &str) -> &[Board] {
        self.device(model).map(|d| d.boards.as_slice()).unwrap_or_default()
    }

    pub fn board(&self, model: &str, version: &str) -> Option<&Board> {
        self.boards(model).iter().find(|b| b.version == version)
    }

    /// Firmware versions valid for a board of a device. Empty for unknown pairs.
    pub fn firmwares(&self, model: &str, board: &str) -> &[Firmware] {
        self.board(model, board)
            .map(|b| b.firmwares.as_slice())
            .unwrap_or_default()
    }

    pub fn firmware(&self, model: &str, board: &str, version: &str) -> Option<&Firmware> {
        self.firmwares(model, board)
            .iter()
            .find(|f| f.version == version)
    }
}

impl Board {
    /// Firmwares are listed oldest first.
    pub fn latest(&self) -> Option<&Firmware> {
        self.firmwares.last()
    }
}

impl Firmware {
    /// Resolve [`Firmware::path`] against a base.
    pub fn locate(&self, base: &CatalogBase) -> Result<FirmwareLocation> {
        let invalid = |source| Error::InvalidPath {
            path: self.path.clone(),
            source,
        };

        match Url::parse(&self.path) {
            Ok(url) if url.scheme() == "file" => url
                .to_file_path()
                .map(FirmwareLocation::Local)
                .map_err(|_| Error::NotLocal(self.path.clone())),
            Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {
                Ok(FirmwareLocation::Remote(url))
            }
            // Anything else (including Windows drive letters) is a plain path
            Ok(_) | Err(url::ParseError::RelativeUrlWithoutBase) => match base {
                CatalogBase::Dir(dir) => Ok(FirmwareLocation::Local(dir.join(&self.path))),
                CatalogBase::Url(url) => directory_url(url)
                    .join(&self.path)
                    .map(FirmwareLocation::Remote)
                    .map_err(invalid),
            },
            Err(e) => Err(invalid(e)),
        }
    }
}

impl CatalogBase {
    /// Interpret a user supplied string as either a URL or a directory.
    pub fn parse(s: &str) -> Self {
        match Url::parse(s) {
            Ok(url) if url.scheme() == "http" || url.scheme() == "https" => Self::Url(url),
            _ => Self::Dir(Path::new(s).to_path_buf()),
        }
    }
}

impl std::fmt::Display for CatalogBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dir(p) => p.display().fmt(f),
            Self::Url(u) => u.fmt(f),
        }
    }
}

impl std::fmt::Display for FirmwareLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local(p) => p.display().fmt(f),
            Self::Remote(u) => u.fmt(f),
        }
    }
}

// `Url::join` drops the last segment unless the base ends with a slash.
fn directory_url(url: &Url) -> Url {
    let mut url = url.clone();
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

mod opt_sha256 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S>(val: &Option<[u8; 32]>, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match val {
            Some(x) => s.serialize_str(&const_hex::encode(x)),
            None => s.serialize_none(),
        }
    }

    pub(super) fn deserialize<'de, D>(d: D) -> Result<Option<[u8; 32]>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(d)?
            .map(|x| const_hex::decode_to_array(x).map_err(serde::de::Error::custom))
            .transpose()
    }
}
