//! Stuff common to the whole crate

use std::io;

use futures::channel::mpsc;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
/// Errors for this crate
pub enum Error {
    #[error("Please connect to a device first")]
    NotConnected,
    #[error("Already connected to {0}")]
    AlreadyConnected(String),
    #[error("Serial log is already running")]
    AlreadyLogging,
    #[error("Firmware image is empty")]
    EmptyImage,
    #[error("Failed to load firmware file: {0}")]
    FirmwareLoad(#[source] io::Error),
    #[error("Failed to open serial port {port}: {source}")]
    OpenPort {
        port: String,
        #[source]
        source: io::Error,
    },
    #[error("Failed to list serial ports: {0}")]
    Enumerate(#[from] serialport::Error),
    #[error("Serial read failed: {0}")]
    Serial(#[source] io::Error),
    /// Anything reported by the flashing library
    #[error("{0}")]
    Flasher(String),
    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("IO Error: {0}")]
    IoError(#[from] io::Error),
}

/// Flashing progress, reported over an optional channel.
///
/// Progress is denoted by [f32] between 0 and 1.
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum FlashingStatus {
    Preparing,
    DownloadingProgress(f32),
    FlashingProgress(f32),
    Resetting,
    Finished,
}

pub const CONNECTING: &str = "Connecting to device...";
pub const CONNECTED: &str = "Connected successfully!";

impl FlashingStatus {
    /// Status line shown to the user.
    pub fn message(&self) -> String {
        match self {
            Self::Preparing => "Preparing to flash...".to_string(),
            Self::DownloadingProgress(p) => format!("Downloading: {}% complete", percent(*p)),
            Self::FlashingProgress(p) => format!("Flashing: {}% complete", percent(*p)),
            Self::Resetting => "Resetting device...".to_string(),
            Self::Finished => "Flashing completed successfully!".to_string(),
        }
    }
}

impl std::fmt::Display for FlashingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message())
    }
}

pub fn connection_failed(err: &Error) -> String {
    format!("Connection failed: {err}")
}

pub fn flashing_failed(err: &Error) -> String {
    format!("Flashing failed: {err}. Please try again.")
}

fn percent(p: f32) -> u32 {
    (p.clamp(0.0, 1.0) * 100.0).round() as u32
}

pub(crate) fn chan_send(chan: Option<&mut mpsc::Sender<FlashingStatus>>, msg: FlashingStatus) {
    if let Some(c) = chan {
        let _ = c.try_send(msg);
    }
}
