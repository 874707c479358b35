//! Serial connection and logging lifecycle.
//!
//! A session is connected to at most one port. The port itself is held by at most one consumer:
//! the [`LogStream`] while logging, or the [`FirmwareWriter`] for the duration of a single
//! operation. Switching from logging to flashing stops the stream (closing the port) before the
//! writer opens it, and logging is resumed afterwards.

use std::{path::Path, sync::Arc};

use bitaxe_config::{Catalog, Selection};
use futures::channel::mpsc;
use tracing::{info, warn};

use crate::{
    CONNECTED, CONNECTING, Error, FlashingStatus, Resolvable, Result, chan_send,
    connection_failed,
    esp::{DeviceInfo, FirmwareWriter, check_image},
    flashing_failed,
    monitor::LogStream,
    serial::{PortInfo, PortOpener, SerialSettings},
    transcript::TranscriptHandle,
};

#[derive(Debug, Clone)]
struct Connection {
    port: PortInfo,
    info: DeviceInfo,
}

pub struct Session<O, W> {
    opener: Arc<O>,
    writer: Arc<W>,
    settings: SerialSettings,
    connection: Option<Connection>,
    log: Option<LogStream>,
    lines: Option<mpsc::Sender<String>>,
    transcript: TranscriptHandle,
}

impl<O, W> Session<O, W>
where
    O: PortOpener,
    W: FirmwareWriter,
{
    pub fn new(opener: Arc<O>, writer: Arc<W>) -> Self {
        Self::with_settings(opener, writer, SerialSettings::default())
    }

    pub fn with_settings(opener: Arc<O>, writer: Arc<W>, settings: SerialSettings) -> Self {
        Self {
            opener,
            writer,
            settings,
            connection: None,
            log: None,
            lines: None,
            transcript: TranscriptHandle::default(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub fn is_logging(&self) -> bool {
        self.log.is_some()
    }

    /// The log reader gave up after a read error. [`stop_logging`](Self::stop_logging) returns
    /// that error.
    pub fn log_ended(&self) -> bool {
        self.log.as_ref().is_some_and(LogStream::is_finished)
    }

    pub fn port(&self) -> Option<&PortInfo> {
        self.connection.as_ref().map(|c| &c.port)
    }

    pub fn device_info(&self) -> Option<&DeviceInfo> {
        self.connection.as_ref().map(|c| &c.info)
    }

    pub fn transcript(&self) -> &TranscriptHandle {
        &self.transcript
    }

    pub fn save_transcript(&self, path: &Path) -> Result<()> {
        self.transcript.save(path)?;
        info!("Saved serial log to {}", path.display());
        Ok(())
    }

    /// Flashing needs a connected device and a complete selection.
    pub fn can_flash(&self, catalog: &Catalog, selection: &Selection) -> bool {
        self.is_connected() && selection.is_complete(catalog)
    }

    /// Handshake with the bootloader on `port` and remember it.
    pub async fn connect(&mut self, port: PortInfo) -> Result<DeviceInfo> {
        if let Some(c) = &self.connection {
            return Err(Error::AlreadyConnected(c.port.name.clone()));
        }

        self.transcript.push_status(CONNECTING);
        info!("Connecting to {port}");

        let writer = self.writer.clone();
        let probe_port = port.clone();
        let res = tokio::task::spawn_blocking(move || writer.probe(&probe_port))
            .await
            .map_err(Error::from)
            .and_then(|x| x);

        match res {
            Ok(info) => {
                self.transcript
                    .push_status(&format!("{CONNECTED} Detected {info} on {port}"));
                self.connection = Some(Connection {
                    port,
                    info: info.clone(),
                });
                Ok(info)
            }
            Err(e) => {
                self.transcript.push_status(&connection_failed(&e));
                Err(e)
            }
        }
    }

    /// Start the serial log. The port must be connected and not already being read.
    pub async fn start_logging(&mut self, lines: Option<mpsc::Sender<String>>) -> Result<()> {
        let port = self
            .connection
            .as_ref()
            .ok_or(Error::NotConnected)?
            .port
            .name
            .clone();

        // A reader that died on an I/O error still counts as running until stopped
        if self.log.is_some() {
            return Err(Error::AlreadyLogging);
        }

        let stream = LogStream::start(
            self.opener.clone(),
            &port,
            self.settings,
            self.transcript.clone(),
            lines.clone(),
        )
        .await?;

        self.log = Some(stream);
        self.lines = lines;

        Ok(())
    }

    /// Stop the serial log and release the port. Does nothing when not logging.
    pub async fn stop_logging(&mut self) -> Result<()> {
        self.lines = None;
        self.release_port().await
    }

    async fn release_port(&mut self) -> Result<()> {
        match self.log.take() {
            Some(s) => s.stop().await,
            None => Ok(()),
        }
    }

    /// Write `img` at `address` and reset the device.
    ///
    /// The image is loaded first, so a running log keeps going while firmware downloads. The
    /// flash itself cannot be cancelled.
    pub async fn flash<I>(
        &mut self,
        img: &I,
        address: u32,
        mut chan: Option<mpsc::Sender<FlashingStatus>>,
    ) -> Result<()>
    where
        I: Resolvable,
    {
        let port = self
            .connection
            .as_ref()
            .ok_or(Error::NotConnected)?
            .port
            .clone();

        chan_send(chan.as_mut(), FlashingStatus::Preparing);
        self.transcript
            .push_status(&FlashingStatus::Preparing.message());

        let loaded = img.resolve(chan.as_mut()).await;
        let res = match loaded {
            Ok(image) => self.flash_image(port, image, address, chan.as_mut()).await,
            Err(e) => Err(Error::FirmwareLoad(e)),
        };

        match &res {
            Ok(()) => {
                chan_send(chan.as_mut(), FlashingStatus::Finished);
                self.transcript
                    .push_status(&FlashingStatus::Finished.message());
            }
            Err(e) => {
                warn!("Flashing failed: {e}");
                self.transcript.push_status(&flashing_failed(e));
            }
        }

        res
    }

    async fn flash_image(
        &mut self,
        port: PortInfo,
        image: Vec<u8>,
        address: u32,
        mut chan: Option<&mut mpsc::Sender<FlashingStatus>>,
    ) -> Result<()> {
        check_image(&image)?;

        let resume = self.log.is_some();
        if let Err(e) = self.release_port().await {
            warn!("Serial log ended with error: {e}");
        }

        let res = self
            .write_and_reset(port, image, address, chan.as_deref_mut())
            .await;

        if resume {
            let lines = self.lines.take();
            if let Err(e) = self.start_logging(lines).await {
                warn!("Failed to resume serial log: {e}");
            }
        }

        res
    }

    async fn write_and_reset(
        &self,
        port: PortInfo,
        image: Vec<u8>,
        address: u32,
        mut chan: Option<&mut mpsc::Sender<FlashingStatus>>,
    ) -> Result<()> {
        let writer = self.writer.clone();
        let write_port = port.clone();
        let mut progress_chan = chan.as_deref().cloned();
        tokio::task::spawn_blocking(move || {
            let mut progress = |done: usize, total: usize| {
                let p = if total == 0 {
                    0.0
                } else {
                    done as f32 / total as f32
                };
                chan_send(progress_chan.as_mut(), FlashingStatus::FlashingProgress(p));
            };
            writer.write(&write_port, &image, address, &mut progress)
        })
        .await??;
        info!("Firmware written to {port}");

        chan_send(chan.as_deref_mut(), FlashingStatus::Resetting);
        self.transcript
            .push_status(&FlashingStatus::Resetting.message());

        let writer = self.writer.clone();
        tokio::task::spawn_blocking(move || writer.reset(&port)).await??;

        Ok(())
    }

    /// Stop logging, then forget the port.
    pub async fn disconnect(&mut self) -> Result<()> {
        let res = self.stop_logging().await;

        if let Some(c) = self.connection.take() {
            info!("Disconnected from {}", c.port);
            self.transcript.push_status("Disconnected");
        }

        res
    }
}
