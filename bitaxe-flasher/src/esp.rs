//! Flashing through [`espflash`].
//!
//! Every operation opens its own connection and drops it before returning, so the port is free
//! for the log reader between operations. Resetting only pulses the control lines, no bootloader
//! handshake is involved.

use std::time::Duration;

use espflash::{
    connection::reset::{ResetAfterOperation, ResetBeforeOperation},
    flasher::{Flasher, ProgressCallbacks},
    interface::Interface,
};
use serialport::{SerialPortInfo, SerialPortType, UsbPortInfo};
use tracing::info;

use crate::{
    Error, Result,
    serial::{PortInfo, PortKind, SerialSettings},
};

/// How long EN is held low.
const RESET_PULSE: Duration = Duration::from_millis(100);

/// What the handshake learned about the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub chip: String,
}

impl std::fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.chip.fmt(f)
    }
}

/// The flashing library, as seen by the session.
///
/// Calls block; the session runs them on blocking threads.
pub trait FirmwareWriter: Send + Sync + 'static {
    /// Enter the bootloader, identify the chip and reset back into the application.
    fn probe(&self, port: &PortInfo) -> Result<DeviceInfo>;

    /// Write `image` at `address`. `progress` receives `(done, total)` in arbitrary units.
    fn write(
        &self,
        port: &PortInfo,
        image: &[u8],
        address: u32,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<()>;

    /// Hard reset into the application.
    fn reset(&self, port: &PortInfo) -> Result<()>;
}

/// [`FirmwareWriter`] backed by `espflash`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EspFlasher {
    /// Baud rate to switch to after the handshake. `None` stays at 115200.
    pub baud: Option<u32>,
    pub use_stub: bool,
    pub verify: bool,
}

impl Default for EspFlasher {
    fn default() -> Self {
        Self {
            baud: None,
            use_stub: true,
            verify: true,
        }
    }
}

impl EspFlasher {
    fn connect(&self, port: &PortInfo, use_stub: bool) -> Result<Flasher> {
        let info = SerialPortInfo {
            port_name: port.name.clone(),
            port_type: port_type(port),
        };
        let usb = usb_port_info(port);

        let interface = Interface::new(&info, None, None).map_err(flasher_error)?;

        Flasher::connect(
            interface,
            usb,
            self.baud,
            use_stub,
            self.verify,
            false,
            None,
            ResetAfterOperation::HardReset,
            ResetBeforeOperation::DefaultReset,
        )
        .map_err(flasher_error)
    }
}

impl FirmwareWriter for EspFlasher {
    fn probe(&self, port: &PortInfo) -> Result<DeviceInfo> {
        let mut flasher = self.connect(port, false)?;
        let chip = flasher.chip().to_string();
        info!("Found {chip} on {port}");

        // Back to the application, so the log has something to show
        flasher.connection().reset().map_err(flasher_error)?;

        Ok(DeviceInfo { chip })
    }

    fn write(
        &self,
        port: &PortInfo,
        image: &[u8],
        address: u32,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<()> {
        check_image(image)?;

        let mut flasher = self.connect(port, self.use_stub)?;
        info!("Writing {} bytes at {address:#x}", image.len());

        let mut cb = Progress::new(progress);
        flasher
            .write_bin_to_flash(address, image, Some(&mut cb))
            .map_err(flasher_error)
    }

    fn reset(&self, port: &PortInfo) -> Result<()> {
        info!("Resetting {port}");

        let mut serial = SerialSettings::default()
            .builder(&port.name)
            .open()
            .map_err(|e| Error::OpenPort {
                port: port.name.clone(),
                source: e.into(),
            })?;
        hard_reset(&mut serial).map_err(|e| Error::Serial(e.into()))
    }
}

/// Modem control lines. On ESP boards DTR drives IO0 and RTS drives EN.
trait ControlLines {
    fn set_dtr(&mut self, level: bool) -> serialport::Result<()>;
    fn set_rts(&mut self, level: bool) -> serialport::Result<()>;
}

impl ControlLines for Box<dyn serialport::SerialPort> {
    fn set_dtr(&mut self, level: bool) -> serialport::Result<()> {
        self.write_data_terminal_ready(level)
    }

    fn set_rts(&mut self, level: bool) -> serialport::Result<()> {
        self.write_request_to_send(level)
    }
}

/// Pulse EN with IO0 released, so the chip boots from flash.
fn hard_reset(lines: &mut impl ControlLines) -> serialport::Result<()> {
    lines.set_dtr(false)?;
    lines.set_rts(true)?;
    std::thread::sleep(RESET_PULSE);
    lines.set_rts(false)
}

pub(crate) fn check_image(image: &[u8]) -> Result<()> {
    if image.is_empty() {
        Err(Error::EmptyImage)
    } else {
        Ok(())
    }
}

fn flasher_error(e: espflash::Error) -> Error {
    Error::Flasher(e.to_string())
}

fn port_type(port: &PortInfo) -> SerialPortType {
    match &port.kind {
        PortKind::Usb(_) => SerialPortType::UsbPort(usb_port_info(port)),
        PortKind::Pci => SerialPortType::PciPort,
        PortKind::Bluetooth => SerialPortType::BluetoothPort,
        PortKind::Unknown => SerialPortType::Unknown,
    }
}

// espflash picks the reset strategy from the USB ids; non USB ports get the classic one.
fn usb_port_info(port: &PortInfo) -> UsbPortInfo {
    match port.usb() {
        Some(x) => UsbPortInfo {
            vid: x.vid,
            pid: x.pid,
            serial_number: x.serial_number.clone(),
            manufacturer: x.manufacturer.clone(),
            product: x.product.clone(),
        },
        None => UsbPortInfo {
            vid: 0,
            pid: 0,
            serial_number: None,
            manufacturer: None,
            product: None,
        },
    }
}

/// Adapts a `(done, total)` closure to espflash progress callbacks.
struct Progress<'a> {
    total: usize,
    cb: &'a mut dyn FnMut(usize, usize),
}

impl<'a> Progress<'a> {
    fn new(cb: &'a mut dyn FnMut(usize, usize)) -> Self {
        Self { total: 0, cb }
    }
}

impl ProgressCallbacks for Progress<'_> {
    fn init(&mut self, _addr: u32, total: usize) {
        self.total = total;
        (self.cb)(0, total);
    }

    fn update(&mut self, current: usize) {
        (self.cb)(current, self.total);
    }

    fn finish(&mut self) {
        (self.cb)(self.total, self.total);
    }
}
