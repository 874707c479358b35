use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use url::Url;

#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Opt {
    #[command(flatten)]
    pub sources: Sources,

    #[command(subcommand)]
    /// Specifies the subcommand to execute.
    pub command: Commands,
}

#[derive(Args, Debug, Default)]
pub struct Sources {
    #[arg(long, global = true)]
    /// Firmware catalog to use instead of the built-in one. Path or URL.
    pub catalog: Option<String>,

    #[arg(long, global = true)]
    /// Directory or URL relative firmware paths are resolved against.
    pub firmware_base: Option<String>,

    #[arg(long, global = true)]
    /// Directory to cache downloaded firmware in.
    pub cache_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List serial ports. Likely Bitaxe ports come first.
    ListPorts {
        #[arg(long)]
        /// Only print port names separated by newline
        no_frills: bool,
    },

    /// Browse the firmware catalog.
    Catalog {
        #[command(subcommand)]
        query: CatalogCommands,
    },

    /// Flash firmware to a Bitaxe and reset it.
    Flash {
        #[arg(long)]
        /// Serial port of the device (e.g. `/dev/ttyACM0` or `COM3`).
        port: String,

        #[command(flatten)]
        img: SelectedFirmware,

        #[arg(long)]
        /// Flash offset. Defaults to the catalog entry, or 0 for a custom image.
        address: Option<u32>,

        #[arg(long)]
        /// Suppress standard output messages for a quieter experience.
        quiet: bool,

        #[arg(long)]
        /// Keep showing the serial log once flashing is done, until Ctrl-C.
        monitor: bool,

        #[arg(long, value_name = "FILE")]
        /// Save the transcript when done. Without a file name, a timestamped one is used.
        save: Option<Option<PathBuf>>,
    },

    /// Show the serial log of a device until Ctrl-C.
    Monitor {
        #[arg(long)]
        /// Serial port of the device (e.g. `/dev/ttyACM0` or `COM3`).
        port: String,

        #[arg(long, value_name = "FILE")]
        /// Save the transcript when done. Without a file name, a timestamped one is used.
        save: Option<Option<PathBuf>>,
    },

    /// Show or change persistent settings.
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },

    /// Command to generate shell completion
    GenerateCompletion {
        /// Specifies the target shell type for completion
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand, Debug)]
pub enum CatalogCommands {
    /// Device models
    Devices,
    /// Board versions of a device model
    Boards {
        /// Device model (e.g. `ultra`)
        device: String,
    },
    /// Firmware versions of a board
    Firmwares {
        /// Device model (e.g. `ultra`)
        device: String,
        /// Board version (e.g. `204`)
        board: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Print current settings and where they are stored
    Show,
    /// Update a setting. Leave out the value to unset it.
    Set {
        key: SettingKey,
        value: Option<String>,
    },
    /// Restore defaults
    Reset,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SettingKey {
    /// Default for `--catalog`
    Catalog,
    /// Default for `--firmware-base`
    FirmwareBase,
    /// Default for `--cache-dir`
    CacheDir,
    /// Where transcripts are saved. Setting it saves every session's transcript.
    TranscriptDir,
}

#[derive(Args, Debug)]
pub struct SelectedFirmware {
    #[command(flatten)]
    pub img: FirmwareImage,

    #[arg(long, requires = "device")]
    /// Board version (e.g. `204`).
    pub board: Option<String>,

    #[arg(long, requires = "board")]
    /// Firmware version. Defaults to the latest one for the board.
    pub firmware: Option<String>,

    #[arg(long, requires = "remote")]
    /// Checksum for remote image.
    pub sha256: Option<String>,
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
pub struct FirmwareImage {
    #[arg(long, requires = "board")]
    /// Device model from the catalog (e.g. `ultra`).
    pub device: Option<String>,

    #[arg(long)]
    /// Path to a firmware image to flash instead of a catalog entry.
    pub local: Option<PathBuf>,

    #[arg(long)]
    /// URL of a firmware image to flash instead of a catalog entry.
    pub remote: Option<Url>,
}
