use std::{io, path::Path};

use bitaxe_config::FirmwareLocation;
use bitaxe_downloader::Downloader;
use futures::{StreamExt, channel::mpsc};

use crate::FlashingStatus;

/// A trait to signify firmware images. [`Session::flash`](crate::Session::flash) can take any
/// input implementing this trait.
pub trait Resolvable {
    /// Load the image into memory. Network calls can be done here, reporting
    /// [`FlashingStatus::DownloadingProgress`] on `chan`.
    fn resolve(
        &self,
        chan: Option<&mut mpsc::Sender<FlashingStatus>>,
    ) -> impl Future<Output = io::Result<Vec<u8>>>;
}

/// A firmware image present in the local filesystem
#[derive(Debug, Clone)]
pub struct LocalFirmware(Box<Path>);

impl LocalFirmware {
    pub const fn new(path: Box<Path>) -> Self {
        Self(path)
    }
}

impl Resolvable for LocalFirmware {
    async fn resolve(
        &self,
        _: Option<&mut mpsc::Sender<FlashingStatus>>,
    ) -> io::Result<Vec<u8>> {
        tokio::fs::read(&self.0).await
    }
}

impl std::fmt::Display for LocalFirmware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.display().fmt(f)
    }
}

/// A firmware image fetched over HTTP, through the download cache.
#[derive(Debug, Clone)]
pub struct RemoteFirmware {
    downloader: Downloader,
    url: url::Url,
    sha256: Option<[u8; 32]>,
}

impl RemoteFirmware {
    pub const fn new(downloader: Downloader, url: url::Url, sha256: Option<[u8; 32]>) -> Self {
        Self {
            downloader,
            url,
            sha256,
        }
    }
}

impl Resolvable for RemoteFirmware {
    async fn resolve(
        &self,
        chan: Option<&mut mpsc::Sender<FlashingStatus>>,
    ) -> io::Result<Vec<u8>> {
        let (tx, rx) = mpsc::channel(20);

        let download = async {
            match self.sha256 {
                Some(sha) => {
                    self.downloader
                        .download_with_sha(self.url.clone(), sha, Some(tx))
                        .await
                }
                None => self.downloader.download(self.url.clone(), Some(tx)).await,
            }
        };
        // Runs until tx is dropped, i.e. the download is done
        let forward = async move {
            if let Some(chan) = chan {
                let _ = rx
                    .map(FlashingStatus::DownloadingProgress)
                    .map(Ok)
                    .forward(chan)
                    .await;
            }
        };

        let (path, ()) = futures::join!(download, forward);
        let path = path.map_err(io::Error::other)?;

        tokio::fs::read(path).await
    }
}

impl std::fmt::Display for RemoteFirmware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.url.fmt(f)
    }
}

/// Firmware from a catalog entry, wherever it lives.
#[derive(Debug, Clone)]
pub enum FirmwareSource {
    Local(LocalFirmware),
    Remote(RemoteFirmware),
}

impl FirmwareSource {
    pub fn new(
        location: FirmwareLocation,
        downloader: &Downloader,
        sha256: Option<[u8; 32]>,
    ) -> Self {
        match location {
            FirmwareLocation::Local(p) => Self::Local(LocalFirmware::new(p.into())),
            FirmwareLocation::Remote(u) => {
                Self::Remote(RemoteFirmware::new(downloader.clone(), u, sha256))
            }
        }
    }
}

impl Resolvable for FirmwareSource {
    async fn resolve(
        &self,
        chan: Option<&mut mpsc::Sender<FlashingStatus>>,
    ) -> io::Result<Vec<u8>> {
        match self {
            Self::Local(x) => x.resolve(chan).await,
            Self::Remote(x) => x.resolve(chan).await,
        }
    }
}

impl std::fmt::Display for FirmwareSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local(x) => x.fmt(f),
            Self::Remote(x) => x.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("esp-miner.bin");
        std::fs::write(&p, [0xe9, 0x03, 0x02, 0x20]).unwrap();

        let img = LocalFirmware::new(p.clone().into());
        assert_eq!(img.resolve(None).await.unwrap(), [0xe9, 0x03, 0x02, 0x20]);
        assert_eq!(img.to_string(), p.display().to_string());
    }

    #[tokio::test]
    async fn source_from_location() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = Downloader::new(dir.path().join("cache")).unwrap();

        let src = FirmwareSource::new(
            FirmwareLocation::Local(dir.path().join("missing.bin")),
            &downloader,
            None,
        );
        assert!(matches!(src, FirmwareSource::Local(_)));
        assert!(src.resolve(None).await.is_err());

        let url = url::Url::parse("https://example.com/max.bin").unwrap();
        let src = FirmwareSource::new(FirmwareLocation::Remote(url), &downloader, None);
        assert_eq!(src.to_string(), "https://example.com/max.bin");
    }
}
