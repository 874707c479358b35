//! # Introduction
//!
//! This crate drives a Bitaxe over its USB serial port: it lists candidate ports, keeps a live
//! serial log with a downloadable transcript, and writes firmware images through [`espflash`].
//! The bootloader protocol itself (SLIP framing, stub upload, erase/write, MD5 verification) is
//! entirely owned by `espflash`.
//!
//! A serial port is held by one consumer at a time: either the log reader or the flasher. The
//! [`Session`] type owns that hand over.
//!
//! # Usage
//!
//! ```no_run
//! use std::{path::PathBuf, sync::Arc};
//! use bitaxe_flasher::{EspFlasher, LocalFirmware, Session, SystemPorts};
//!
//! #[tokio::main]
//! async fn main() {
//!     let port = bitaxe_flasher::serial::ports().unwrap().remove(0);
//!     let mut session = Session::new(Arc::new(SystemPorts), Arc::new(EspFlasher::default()));
//!
//!     session.connect(port).await.unwrap();
//!     session.start_logging(None).await.unwrap();
//!
//!     let img = LocalFirmware::new(PathBuf::from("/tmp/esp-miner-factory.bin").into());
//!     session.flash(&img, 0, None).await.unwrap();
//!
//!     session.disconnect().await.unwrap();
//! }
//! ```

mod common;
pub mod esp;
mod firmware;
pub mod monitor;
pub mod serial;
pub mod session;
pub mod transcript;

pub use common::*;
pub use esp::{DeviceInfo, EspFlasher, FirmwareWriter};
pub use firmware::{FirmwareSource, LocalFirmware, RemoteFirmware, Resolvable};
pub use monitor::LogStream;
pub use serial::{PortInfo, PortOpener, SerialSettings, SystemPorts};
pub use session::Session;
pub use transcript::{Transcript, TranscriptHandle};
