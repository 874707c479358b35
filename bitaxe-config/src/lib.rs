//! # Introduction
//!
//! Bitaxe firmware is published per device model and board revision. This crate provides the
//! catalog describing which firmware images exist for which board, along with the selection
//! state an application keeps while the user picks a device, a board and a firmware version.
//!
//! # Usage
//!
//! ```
//! use bitaxe_config::{Catalog, Selection};
//!
//! let catalog = Catalog::builtin();
//! let mut selection = Selection::default();
//!
//! selection.select_device(&catalog, "ultra").unwrap();
//! selection.select_board(&catalog, "204").unwrap();
//!
//! let (device, board, firmware) = selection.resolved(&catalog).unwrap();
//! assert_eq!(device.name, "Ultra");
//! assert_eq!(board.version, "204");
//! assert_eq!(firmware.address, 0);
//! ```

pub mod catalog;
pub mod selection;

pub use catalog::{Board, Catalog, CatalogBase, Device, Firmware, FirmwareLocation};
pub use selection::Selection;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
/// Errors for this crate
pub enum Error {
    #[error("IO Error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse catalog: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Duplicate device model {0}")]
    DuplicateDevice(String),
    #[error("Duplicate board version {board} for {device}")]
    DuplicateBoard { device: String, board: String },
    #[error("Duplicate firmware version {firmware} for board {board}")]
    DuplicateFirmware { board: String, firmware: String },
    #[error("Firmware {0} has an empty path")]
    EmptyPath(String),
    #[error("Unknown device model {0}")]
    UnknownDevice(String),
    #[error("Board version {board} is not available for {device}")]
    UnknownBoard { device: String, board: String },
    #[error("Firmware {firmware} is not available for board {board}")]
    UnknownFirmware { board: String, firmware: String },
    #[error("Please select a device model first")]
    NoDevice,
    #[error("Please select a board version first")]
    NoBoard,
    #[error("{0} is not a local file path")]
    NotLocal(String),
    #[error("Invalid firmware path {path}: {source}")]
    InvalidPath {
        path: String,
        #[source]
        source: url::ParseError,
    },
}
