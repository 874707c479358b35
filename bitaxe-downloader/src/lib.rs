//! Downloader for firmware images and catalogs, with support to cache downloaded assets.
//!
//! # Features
//!
//! - Async
//! - Cache downloaded files in a directory in the filesystem.
//! - Check if a file is available in cache.
//! - Uses SHA256 for verifying cached files.
//! - Optional support to fetch JSON documents without caching (`json` feature).

use futures::{Stream, StreamExt, channel::mpsc};
#[cfg(feature = "json")]
use serde::de::DeserializeOwned;
use sha2::{Digest as _, Sha256};
use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
/// Errors for this crate
pub enum Error {
    /// Incorrect Sha256. File might be corrupted
    #[error("Incorrect Sha256. File might be corrupted")]
    Sha256Error,
    #[error("Server responded with {0}")]
    HttpStatus(reqwest::StatusCode),
    #[error("Reqwest Error: {0}")]
    ReqwestError(#[from] reqwest::Error),
    #[error("IO Error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Downloader that caches files in the provided directory. Uses SHA256 to determine if the file
/// is already downloaded.
///
/// Cloning is cheap, the underlying client is reference counted.
#[derive(Debug, Clone)]
pub struct Downloader {
    client: reqwest::Client,
    cache_dir: PathBuf,
}

impl Downloader {
    /// Create a new downloader that uses a directory for storing cached files. The directory is
    /// created if missing.
    pub fn new(cache_dir: PathBuf) -> io::Result<Self> {
        std::fs::create_dir_all(&cache_dir)?;

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(io::Error::other)?;

        Ok(Self { client, cache_dir })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Check if a downloaded file with a particular SHA256 is already in cache.
    pub fn check_cache_from_sha(&self, sha256: [u8; 32]) -> Option<PathBuf> {
        let file_path = self.path_from_sha(sha256);

        if file_path.exists() {
            Some(file_path)
        } else {
            None
        }
    }

    /// Check if a downloaded file is already in cache.
    ///
    /// [`check_cache_from_sha`](Self::check_cache_from_sha) should be prefered in cases when SHA256
    /// of the file to download is already known.
    pub fn check_cache_from_url(&self, url: &url::Url) -> Option<PathBuf> {
        let file_path = self.path_from_url(url);
        if file_path.exists() {
            Some(file_path)
        } else {
            None
        }
    }

    /// Download a JSON file without caching the contents. Used for the firmware catalog, which
    /// changes whenever a release is published.
    #[cfg(feature = "json")]
    pub async fn download_json_no_cache<T, U>(&self, url: U) -> Result<T>
    where
        T: DeserializeOwned,
        U: reqwest::IntoUrl,
    {
        let response = self.client.get(url).send().await?;
        check_status(&response)?;
        response.json().await.map_err(Error::from)
    }

    /// Checks if the file is present in cache. If the file is present, returns path to it. Else
    /// downloads the file.
    ///
    /// [`download_with_sha`](Self::download_with_sha) should be prefered when the SHA256 of the
    /// file is known in advance.
    ///
    /// # Progress
    ///
    /// Download progress can be optionally tracked using a [`futures::channel::mpsc`].
    pub async fn download(
        &self,
        url: url::Url,
        mut chan: Option<mpsc::Sender<f32>>,
    ) -> Result<PathBuf> {
        // Use hash of url for file name
        let file_path = self.path_from_url(&url);

        if file_path.exists() {
            tracing::debug!("Cache hit for {url}");
            return Ok(file_path);
        }
        chan_send(chan.as_mut(), 0.0);

        let mut tmp_file = AsyncTempFile::new()?;
        {
            let mut tmp_file = tokio::io::BufWriter::new(tmp_file.as_mut());
            self.fetch(url, &mut tmp_file, None, chan.as_mut()).await?;
            tmp_file.flush().await?;
        }

        tmp_file.persist(&file_path).await?;
        Ok(file_path)
    }

    /// Checks if the file is present in cache. If the file is present, returns path to it. Else
    /// downloads the file.
    ///
    /// Uses SHA256 to verify that the file in cache is valid.
    ///
    /// # Progress
    ///
    /// Download progress can be optionally tracked using a [`futures::channel::mpsc`].
    pub async fn download_with_sha(
        &self,
        url: url::Url,
        sha256: [u8; 32],
        mut chan: Option<mpsc::Sender<f32>>,
    ) -> Result<PathBuf> {
        let file_path = self.path_from_sha(sha256);

        if file_path.exists() {
            let hash = sha256_from_path(&file_path).await?;
            if hash == sha256 {
                tracing::debug!("Cache hit for {url}");
                return Ok(file_path);
            }

            tracing::warn!("Removing corrupted cache entry {}", file_path.display());
            let _ = tokio::fs::remove_file(&file_path).await;
        }
        chan_send(chan.as_mut(), 0.0);

        let mut tmp_file = AsyncTempFile::new()?;
        {
            let mut tmp_file = tokio::io::BufWriter::new(tmp_file.as_mut());
            let mut hasher = Sha256::new();

            self.fetch(url, &mut tmp_file, Some(&mut hasher), chan.as_mut())
                .await?;
            tmp_file.flush().await?;

            let hash: [u8; 32] = hasher.finalize().into();
            if hash != sha256 {
                tracing::warn!(
                    "{} != {}",
                    const_hex::encode(hash),
                    const_hex::encode(sha256)
                );
                return Err(Error::Sha256Error);
            }
        }

        tmp_file.persist(&file_path).await?;

        Ok(file_path)
    }

    async fn fetch<W>(
        &self,
        url: url::Url,
        writer: &mut W,
        mut hasher: Option<&mut Sha256>,
        mut chan: Option<&mut mpsc::Sender<f32>>,
    ) -> Result<()>
    where
        W: tokio::io::AsyncWrite + Unpin,
    {
        tracing::info!("Downloading {url}");

        let response = self.client.get(url).send().await?;
        check_status(&response)?;

        let response_size = response.content_length();
        let mut response_stream = response.bytes_stream();

        let response_size = match response_size {
            Some(x) => x as usize,
            None => response_stream.size_hint().0,
        };

        let mut cur_pos = 0;
        while let Some(x) = response_stream.next().await {
            let mut data = x?;
            cur_pos += data.len();
            if let Some(h) = hasher.as_mut() {
                h.update(&data);
            }
            writer.write_all_buf(&mut data).await?;

            if response_size > 0 {
                chan_send(
                    chan.as_deref_mut(),
                    (cur_pos as f32) / (response_size as f32),
                );
            }
        }

        Ok(())
    }

    fn path_from_url(&self, url: &url::Url) -> PathBuf {
        let file_name: [u8; 32] = Sha256::new().chain_update(url.as_str()).finalize().into();
        self.path_from_sha(file_name)
    }

    fn path_from_sha(&self, sha256: [u8; 32]) -> PathBuf {
        let file_name = const_hex::encode(sha256);
        self.cache_dir.join(file_name)
    }
}

fn check_status(response: &reqwest::Response) -> Result<()> {
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(Error::HttpStatus(status))
    }
}

struct AsyncTempFile(tokio::fs::File);

impl AsyncTempFile {
    fn new() -> std::io::Result<Self> {
        let f = tempfile::tempfile()?;
        Ok(Self(tokio::fs::File::from_std(f)))
    }

    async fn persist(&mut self, path: &Path) -> std::io::Result<()> {
        let mut f = tokio::fs::File::create_new(path).await?;
        self.0.seek(io::SeekFrom::Start(0)).await?;
        tokio::io::copy(&mut self.0, &mut f).await?;
        f.flush().await?;
        Ok(())
    }
}

impl AsMut<tokio::fs::File> for AsyncTempFile {
    fn as_mut(&mut self) -> &mut tokio::fs::File {
        &mut self.0
    }
}

/// SHA256 of a file on disk.
pub async fn sha256_from_path(p: &Path) -> std::io::Result<[u8; 32]> {
    let file = tokio::fs::File::open(p).await?;
    let mut reader = tokio::io::BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0; 4096];

    loop {
        let count = reader.read(&mut buffer).await?;
        if count == 0 {
            break;
        }

        hasher.update(&buffer[..count]);
    }

    Ok(hasher.finalize().into())
}

fn chan_send(chan: Option<&mut mpsc::Sender<f32>>, msg: f32) {
    if let Some(c) = chan {
        let _ = c.try_send(msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn sha(data: &[u8]) -> [u8; 32] {
        Sha256::digest(data).into()
    }

    /// Answer a single request on a local port with a canned HTTP/1.1 response.
    async fn serve_once(status: &'static str, body: Vec<u8>) -> url::Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();

            let mut req = Vec::new();
            let mut buf = [0u8; 1024];
            while !req.windows(4).any(|x| x == b"\r\n\r\n") {
                let n = sock.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                req.extend_from_slice(&buf[..n]);
            }

            let head = format!(
                "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            sock.write_all(head.as_bytes()).await.unwrap();
            sock.write_all(&body).await.unwrap();
            sock.shutdown().await.unwrap();
        });

        url::Url::parse(&format!("http://{addr}/firmware/esp-miner.bin")).unwrap()
    }

    fn cache_entries(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[test]
    fn creates_cache_dir() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("nested").join("cache");

        let downloader = Downloader::new(cache.clone()).unwrap();
        assert!(cache.is_dir());
        assert_eq!(downloader.cache_dir(), cache);
    }

    #[test]
    fn cache_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = Downloader::new(dir.path().to_path_buf()).unwrap();
        let url = url::Url::parse("https://example.com/firmware/max.bin").unwrap();

        assert!(downloader.check_cache_from_url(&url).is_none());
        std::fs::write(downloader.path_from_url(&url), b"abc").unwrap();
        assert!(downloader.check_cache_from_url(&url).is_some());

        let hash = sha(b"abc");
        assert!(downloader.check_cache_from_sha(hash).is_none());
        std::fs::write(downloader.path_from_sha(hash), b"abc").unwrap();
        assert_eq!(
            downloader.check_cache_from_sha(hash),
            Some(dir.path().join(const_hex::encode(hash)))
        );
    }

    #[tokio::test]
    async fn cached_file_skips_network() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = Downloader::new(dir.path().to_path_buf()).unwrap();
        let data = b"esp-miner factory image";
        let hash = sha(data);
        std::fs::write(downloader.path_from_sha(hash), data).unwrap();

        // Unroutable URL: a network access would fail the test
        let url = url::Url::parse("http://127.0.0.1:9/never.bin").unwrap();
        let p = downloader.download_with_sha(url, hash, None).await.unwrap();
        assert_eq!(std::fs::read(p).unwrap(), data);
    }

    #[tokio::test]
    async fn hash_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("fw.bin");
        let data = vec![0xa5u8; 10_000];
        std::fs::write(&p, &data).unwrap();

        assert_eq!(sha256_from_path(&p).await.unwrap(), sha(&data));
    }

    #[tokio::test]
    async fn download_reports_progress() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = Downloader::new(dir.path().to_path_buf()).unwrap();
        let data = vec![0xe9u8; 64 * 1024];
        let url = serve_once("200 OK", data.clone()).await;

        let (tx, rx) = mpsc::channel(1024);
        let p = downloader.download(url.clone(), Some(tx)).await.unwrap();
        let progress: Vec<f32> = rx.collect().await;

        assert_eq!(std::fs::read(&p).unwrap(), data);
        assert_eq!(downloader.check_cache_from_url(&url), Some(p));
        assert_eq!(progress.first(), Some(&0.0));
        assert_eq!(progress.last(), Some(&1.0));
    }

    #[tokio::test]
    async fn hash_mismatch_is_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = Downloader::new(dir.path().to_path_buf()).unwrap();
        let url = serve_once("200 OK", b"truncated image".to_vec()).await;
        let expected = sha(b"full factory image");

        let err = downloader
            .download_with_sha(url, expected, None)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Sha256Error));
        assert!(downloader.check_cache_from_sha(expected).is_none());
        assert_eq!(cache_entries(dir.path()), 0);
    }

    #[tokio::test]
    async fn http_error_status() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = Downloader::new(dir.path().to_path_buf()).unwrap();
        let url = serve_once("404 Not Found", b"no such firmware".to_vec()).await;

        let err = downloader.download(url.clone(), None).await.unwrap_err();

        assert!(matches!(err, Error::HttpStatus(s) if s == reqwest::StatusCode::NOT_FOUND));
        assert!(downloader.check_cache_from_url(&url).is_none());
        assert_eq!(cache_entries(dir.path()), 0);
    }
}
