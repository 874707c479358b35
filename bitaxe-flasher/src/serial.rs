//! Serial port discovery and the fixed framing Bitaxe firmware talks at.

use std::{
    io::{self, Read, Write},
    time::Duration,
};

use serialport::{DataBits, FlowControl, Parity, SerialPortType, StopBits};

use crate::Result;

pub const BAUD_RATE: u32 = 115200;

/// USB vendor ids of the bridges found on ESP32 boards.
const ESP_VIDS: &[u16] = &[
    0x303a, // Espressif native USB / USB-JTAG-Serial
    0x10c4, // Silicon Labs CP210x
    0x1a86, // WCH CH340 / CH343
    0x0403, // FTDI
];

/// 8-N-1 at [`BAUD_RATE`], no flow control.
///
/// `read_timeout` bounds how long a blocking read waits, which is how often a log reader gets to
/// check for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialSettings {
    pub baud_rate: u32,
    pub read_timeout: Duration,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: BAUD_RATE,
            read_timeout: Duration::from_millis(100),
        }
    }
}

impl SerialSettings {
    pub fn builder(&self, port: &str) -> serialport::SerialPortBuilder {
        serialport::new(port, self.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(self.read_timeout)
    }
}

/// An open byte stream to a device.
pub trait SerialLink: Read + Write + Send {}

impl<T> SerialLink for T where T: Read + Write + Send + ?Sized {}

/// Opens serial links. Abstracted so the session lifecycle can run without hardware.
pub trait PortOpener: Send + Sync + 'static {
    fn open(&self, port: &str, settings: &SerialSettings) -> io::Result<Box<dyn SerialLink>>;
}

/// Ports of the host, opened through [`serialport`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPorts;

impl PortOpener for SystemPorts {
    fn open(&self, port: &str, settings: &SerialSettings) -> io::Result<Box<dyn SerialLink>> {
        let p = settings.builder(port).open()?;
        Ok(Box::new(p))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UsbInfo {
    pub vid: u16,
    pub pid: u16,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

impl UsbInfo {
    pub fn is_esp_bridge(&self) -> bool {
        ESP_VIDS.contains(&self.vid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PortKind {
    Usb(UsbInfo),
    Pci,
    Bluetooth,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortInfo {
    pub name: String,
    pub kind: PortKind,
}

impl PortInfo {
    /// A port known only by name, e.g. passed on the command line.
    pub fn from_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: PortKind::Unknown,
        }
    }

    pub fn usb(&self) -> Option<&UsbInfo> {
        match &self.kind {
            PortKind::Usb(x) => Some(x),
            _ => None,
        }
    }

    pub fn is_esp_bridge(&self) -> bool {
        self.usb().is_some_and(UsbInfo::is_esp_bridge)
    }
}

impl std::fmt::Display for PortInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.name.fmt(f)
    }
}

impl From<serialport::SerialPortInfo> for PortInfo {
    fn from(value: serialport::SerialPortInfo) -> Self {
        let kind = match value.port_type {
            SerialPortType::UsbPort(x) => PortKind::Usb(UsbInfo {
                vid: x.vid,
                pid: x.pid,
                serial_number: x.serial_number,
                manufacturer: x.manufacturer,
                product: x.product,
            }),
            SerialPortType::PciPort => PortKind::Pci,
            SerialPortType::BluetoothPort => PortKind::Bluetooth,
            SerialPortType::Unknown => PortKind::Unknown,
        };

        Self {
            name: value.port_name,
            kind,
        }
    }
}

/// All serial ports of the host. Likely ESP32 bridges come first.
pub fn ports() -> Result<Vec<PortInfo>> {
    let ports = serialport::available_ports()?
        .into_iter()
        .map(PortInfo::from)
        .collect();

    Ok(sort_ports(ports))
}

/// Look up a port by name, falling back to a bare name when enumeration does not list it (for
/// example symlinks under `/dev/serial/by-id`).
pub fn find_port(name: &str) -> PortInfo {
    ports()
        .ok()
        .and_then(|p| p.into_iter().find(|x| x.name == name))
        .unwrap_or_else(|| PortInfo::from_name(name))
}

fn sort_ports(mut ports: Vec<PortInfo>) -> Vec<PortInfo> {
    ports.sort_by(|a, b| {
        b.is_esp_bridge()
            .cmp(&a.is_esp_bridge())
            .then_with(|| a.name.cmp(&b.name))
    });
    ports
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usb(name: &str, vid: u16) -> PortInfo {
        PortInfo {
            name: name.to_string(),
            kind: PortKind::Usb(UsbInfo {
                vid,
                pid: 0x1001,
                serial_number: None,
                manufacturer: None,
                product: None,
            }),
        }
    }

    #[test]
    fn esp_ports_first() {
        let ports = vec![
            PortInfo::from_name("/dev/ttyS0"),
            usb("/dev/ttyUSB1", 0x2341),
            usb("/dev/ttyACM0", 0x303a),
            usb("/dev/ttyUSB0", 0x1a86),
        ];

        let names: Vec<_> = sort_ports(ports).into_iter().map(|p| p.name).collect();
        assert_eq!(
            names,
            ["/dev/ttyACM0", "/dev/ttyUSB0", "/dev/ttyS0", "/dev/ttyUSB1"]
        );
    }

    #[test]
    fn default_framing() {
        let s = SerialSettings::default();
        assert_eq!(s.baud_rate, 115200);
        assert!(s.read_timeout < Duration::from_secs(1));
    }

    #[test]
    fn conversion() {
        let info = serialport::SerialPortInfo {
            port_name: "COM3".to_string(),
            port_type: SerialPortType::PciPort,
        };
        let p = PortInfo::from(info);
        assert_eq!(p.kind, PortKind::Pci);
        assert!(!p.is_esp_bridge());
        assert_eq!(p.to_string(), "COM3");
    }
}
